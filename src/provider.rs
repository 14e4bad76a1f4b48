//! Service class provider (SCP) dispatch.
//!
//! A [`ServiceProvider`] accepts associations on incoming TCP streams
//! and maps DIMSE requests onto the configured service handlers.
//! Every request runs on its own worker thread,
//! so long-running handler code (matching, filesystem I/O)
//! never stalls protocol I/O;
//! responses travel back to the association task
//! through its bounded event queue, in the order the handler
//! produced them.

use std::collections::HashMap;
use std::net::{TcpListener, TcpStream};
use std::sync::mpsc::SyncSender;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use dicom_encoding::transfer_syntax::TransferSyntaxIndex;
use dicom_object::InMemDicomObject;
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
use tracing::{debug, info, warn};

use crate::association::{
    self, AssociationConfig, AssociationHandle, Upcall, APPLICATION_CONTEXT_NAME,
};
use crate::context::{ContextManager, EXPLICIT_VR_LE, IMPLICIT_VR_LE};
use crate::dimse::{
    CEchoRsp, CFindRsp, CGetRsp, CMoveRsp, CStoreRsp, Command, Status,
    COMMAND_DATA_SET_TYPE_NON_NULL, COMMAND_DATA_SET_TYPE_NULL,
};
use crate::machine::{Event, Role};
use crate::pdu::{AssociationRJServiceUserReason, DEFAULT_MAX_PDU};

/// Common interface for application entity access control policies.
pub trait AccessControl: Send + Sync + 'static {
    /// Decide whether to accept an incoming association request.
    ///
    /// Returns `Ok(())` to give the requester clearance,
    /// or the association rejection reason otherwise.
    fn check_access(
        &self,
        this_ae_title: &str,
        calling_ae_title: &str,
        called_ae_title: &str,
    ) -> Result<(), AssociationRJServiceUserReason>;
}

/// An access control rule that accepts any incoming association request.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct AcceptAny;

impl AccessControl for AcceptAny {
    fn check_access(
        &self,
        _this_ae_title: &str,
        _calling_ae_title: &str,
        _called_ae_title: &str,
    ) -> Result<(), AssociationRJServiceUserReason> {
        Ok(())
    }
}

/// An access control rule that only accepts association requests
/// whose called AE title matches this node's AE title.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct AcceptCalledAeTitle;

impl AccessControl for AcceptCalledAeTitle {
    fn check_access(
        &self,
        this_ae_title: &str,
        _calling_ae_title: &str,
        called_ae_title: &str,
    ) -> Result<(), AssociationRJServiceUserReason> {
        if this_ae_title == called_ae_title {
            Ok(())
        } else {
            Err(AssociationRJServiceUserReason::CalledAETitleNotRecognized)
        }
    }
}

/// One result of a C-MOVE or C-GET handler:
/// how many sub-operations remain after this one,
/// and the matched data set.
pub struct RetrieveItem {
    pub remaining: u16,
    pub dataset: InMemDicomObject,
}

type CEchoHandler = Box<dyn Fn() -> Status + Send + Sync>;
type CStoreHandler = Box<dyn Fn(&str, &str, &str, &[u8]) -> Status + Send + Sync>;

/// The lazy sequence of matches produced by a C-FIND handler.
pub type FindStream = Box<dyn Iterator<Item = Result<InMemDicomObject, Status>> + Send>;
type CFindHandler = Box<dyn Fn(&str, &str, &InMemDicomObject) -> FindStream + Send + Sync>;

/// The lazy sequence of sub-operations produced by a
/// C-MOVE or C-GET handler.
pub type RetrieveStream = Box<dyn Iterator<Item = Result<RetrieveItem, Status>> + Send>;
type CRetrieveHandler = Box<dyn Fn(&str, &str, &InMemDicomObject) -> RetrieveStream + Send + Sync>;

struct Handlers {
    c_echo: Option<CEchoHandler>,
    c_store: Option<CStoreHandler>,
    c_find: Option<CFindHandler>,
    c_move: Option<CRetrieveHandler>,
    c_get: Option<CRetrieveHandler>,
}

/// Options for building a [`ServiceProvider`].
///
/// # Example
///
/// ```no_run
/// # use dicom_net::provider::ServiceProviderOptions;
/// # use dicom_net::dimse::Status;
/// let provider = ServiceProviderOptions::new()
///     .ae_title("STORE-SCP")
///     .accept_called_ae_title()
///     .with_abstract_syntax("1.2.840.10008.1.1")
///     .with_abstract_syntax("1.2.840.10008.5.1.4.1.1.7")
///     .on_c_store(|_ts, _sop_class, sop_instance, _data| {
///         println!("received {}", sop_instance);
///         Status::success()
///     })
///     .build();
/// ```
pub struct ServiceProviderOptions {
    ae_title: String,
    remote_aes: HashMap<String, String>,
    abstract_syntaxes: Vec<String>,
    transfer_syntaxes: Vec<String>,
    max_pdu_length: u32,
    association_timeout: Duration,
    access_control: Arc<dyn AccessControl>,
    handlers: Handlers,
}

impl Default for ServiceProviderOptions {
    fn default() -> Self {
        ServiceProviderOptions {
            ae_title: "THIS-SCP".to_string(),
            remote_aes: HashMap::new(),
            abstract_syntaxes: Vec::new(),
            transfer_syntaxes: Vec::new(),
            max_pdu_length: DEFAULT_MAX_PDU,
            association_timeout: Duration::from_secs(30),
            access_control: Arc::new(AcceptAny),
            handlers: Handlers {
                c_echo: None,
                c_store: None,
                c_find: None,
                c_move: None,
                c_get: None,
            },
        }
    }
}

impl ServiceProviderOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Define the application entity title of this node.
    ///
    /// The default is `THIS-SCP`.
    pub fn ae_title(mut self, ae_title: impl Into<String>) -> Self {
        self.ae_title = ae_title.into();
        self
    }

    /// Register a known remote application entity,
    /// the possible target of C-MOVE sub-operations.
    pub fn with_remote_ae(
        mut self,
        ae_title: impl Into<String>,
        host_port: impl Into<String>,
    ) -> Self {
        self.remote_aes.insert(ae_title.into(), host_port.into());
        self
    }

    /// Include this abstract syntax in the set of accepted SOP classes.
    pub fn with_abstract_syntax(mut self, abstract_syntax_uid: impl Into<String>) -> Self {
        self.abstract_syntaxes.push(abstract_syntax_uid.into());
        self
    }

    /// Include this transfer syntax in the set accepted during
    /// presentation context negotiation.
    ///
    /// When none is given, Implicit VR Little Endian and
    /// Explicit VR Little Endian are accepted.
    pub fn with_transfer_syntax(mut self, transfer_syntax_uid: impl Into<String>) -> Self {
        self.transfer_syntaxes.push(transfer_syntax_uid.into());
        self
    }

    /// Override the maximum PDU length advertised to peers.
    pub fn max_pdu_length(mut self, value: u32) -> Self {
        self.max_pdu_length = value;
        self
    }

    /// Override how long to wait for the A-ASSOCIATE-RQ
    /// after accepting a connection. The default is 30 seconds.
    pub fn association_timeout(mut self, timeout: Duration) -> Self {
        self.association_timeout = timeout;
        self
    }

    /// Accept associations regardless of AE titles (the default).
    pub fn accept_any(self) -> Self {
        self.ae_access_control(AcceptAny)
    }

    /// Only accept associations whose called AE title
    /// matches this node's AE title.
    pub fn accept_called_ae_title(self) -> Self {
        self.ae_access_control(AcceptCalledAeTitle)
    }

    /// Change the access control policy.
    pub fn ae_access_control(mut self, access_control: impl AccessControl) -> Self {
        self.access_control = Arc::new(access_control);
        self
    }

    /// Set the C-ECHO handler.
    pub fn on_c_echo(mut self, handler: impl Fn() -> Status + Send + Sync + 'static) -> Self {
        self.handlers.c_echo = Some(Box::new(handler));
        self
    }

    /// Set the C-STORE handler.
    ///
    /// Arguments are the negotiated transfer syntax UID,
    /// the SOP class UID, the SOP instance UID,
    /// and the data set bytes exactly as received
    /// (without file meta information).
    pub fn on_c_store(
        mut self,
        handler: impl Fn(&str, &str, &str, &[u8]) -> Status + Send + Sync + 'static,
    ) -> Self {
        self.handlers.c_store = Some(Box::new(handler));
        self
    }

    /// Set the C-FIND handler.
    ///
    /// Arguments are the negotiated transfer syntax UID,
    /// the SOP class UID and the decoded query identifier.
    /// The handler returns a lazy sequence of matches;
    /// ending the sequence without items means "no matches, Success",
    /// and an `Err` item terminates the stream with that status.
    pub fn on_c_find(
        mut self,
        handler: impl Fn(&str, &str, &InMemDicomObject) -> FindStream + Send + Sync + 'static,
    ) -> Self {
        self.handlers.c_find = Some(Box::new(handler));
        self
    }

    /// Set the C-MOVE handler.
    ///
    /// Each item carries the number of remaining sub-operations,
    /// decreasing to zero on the last one.
    pub fn on_c_move(
        mut self,
        handler: impl Fn(&str, &str, &InMemDicomObject) -> RetrieveStream + Send + Sync + 'static,
    ) -> Self {
        self.handlers.c_move = Some(Box::new(handler));
        self
    }

    /// Set the C-GET handler. Same shape as the C-MOVE handler.
    pub fn on_c_get(
        mut self,
        handler: impl Fn(&str, &str, &InMemDicomObject) -> RetrieveStream + Send + Sync + 'static,
    ) -> Self {
        self.handlers.c_get = Some(Box::new(handler));
        self
    }

    /// Finish building the service provider.
    pub fn build(mut self) -> ServiceProvider {
        if self.transfer_syntaxes.is_empty() {
            self.transfer_syntaxes = vec![IMPLICIT_VR_LE.to_string(), EXPLICIT_VR_LE.to_string()];
        }
        ServiceProvider {
            inner: Arc::new(self),
        }
    }
}

/// A DICOM service class provider over the configured services.
///
/// The value is cheap to clone and safe to share across
/// listener threads.
#[derive(Clone)]
pub struct ServiceProvider {
    inner: Arc<ServiceProviderOptions>,
}

impl ServiceProvider {
    /// Accept associations on the listener until it fails,
    /// handling each connection on its own thread.
    pub fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        info!("{}: listening on {:?}", self.inner.ae_title, listener.local_addr());
        for stream in listener.incoming() {
            let stream = stream?;
            let provider = self.clone();
            thread::spawn(move || provider.run(stream));
        }
        Ok(())
    }

    /// Drive one association on an accepted TCP stream to completion.
    ///
    /// Returns when the association ends,
    /// by release, abort, or transport failure.
    pub fn run(&self, stream: TcpStream) {
        let peer = stream.peer_addr().ok();
        let config = AssociationConfig {
            role: Role::Acceptor,
            ae_title: self.inner.ae_title.clone(),
            peer_ae_title: String::new(),
            application_context_name: APPLICATION_CONTEXT_NAME.to_string(),
            abstract_syntaxes: self.inner.abstract_syntaxes.clone(),
            transfer_syntaxes: self.inner.transfer_syntaxes.clone(),
            max_pdu_length: self.inner.max_pdu_length,
            peer_address: None,
            establish_timeout: Some(self.inner.association_timeout),
            access_control: {
                let ae_title = self.inner.ae_title.clone();
                let policy = Arc::clone(&self.inner.access_control);
                Arc::new(move |called, calling| policy.check_access(&ae_title, calling, called))
            },
        };
        let AssociationHandle { events, upcalls } = association::spawn(config, Some(stream));

        let mut contexts: Option<Arc<ContextManager>> = None;
        loop {
            match upcalls.recv() {
                Ok(Upcall::Established {
                    contexts: negotiated,
                    ..
                }) => {
                    info!("new association from {:?}", peer);
                    contexts = Some(negotiated);
                }
                Ok(Upcall::Data {
                    context_id,
                    command,
                    data,
                }) => {
                    let Some(contexts) = contexts.clone() else {
                        let _ = events.send(Event::AbortRequest);
                        continue;
                    };
                    if !command.is_request() {
                        warn!(
                            "peer sent a response command {:#06x} to a provider",
                            command.command_field()
                        );
                        let _ = events.send(Event::AbortRequest);
                        continue;
                    }
                    let inner = Arc::clone(&self.inner);
                    let events = events.clone();
                    thread::spawn(move || {
                        dispatch_request(inner, contexts, events, context_id, command, data)
                    });
                }
                Ok(Upcall::Released) => {
                    debug!("association with {:?} released", peer);
                }
                Ok(Upcall::Aborted(cause)) => {
                    debug!("association with {:?} aborted: {:?}", peer, cause);
                }
                Ok(Upcall::Rejected(_)) => {
                    debug!("association from {:?} rejected", peer);
                }
                Err(_) => break,
            }
        }
        debug!("dropping connection with {:?}", peer);
    }
}

/// Run one request on a worker thread,
/// sending each response back through the association's event queue.
fn dispatch_request(
    options: Arc<ServiceProviderOptions>,
    contexts: Arc<ContextManager>,
    events: SyncSender<Event>,
    context_id: u8,
    command: Command,
    data: Vec<u8>,
) {
    let Ok(context) = contexts.get(context_id) else {
        warn!("request on unknown presentation context {}", context_id);
        let _ = events.send(Event::AbortRequest);
        return;
    };
    let transfer_syntax = context.transfer_syntax.clone();

    match command {
        Command::CEchoRq(rq) => {
            let status = match &options.handlers.c_echo {
                Some(handler) => handler(),
                None => Status::new(Status::UNRECOGNIZED_OPERATION),
            };
            let response = Command::CEchoRsp(
                CEchoRsp::builder()
                    .affected_sop_class_uid(rq.affected_sop_class_uid)
                    .message_id_being_responded_to(rq.message_id)
                    .status(status)
                    .build(),
            );
            send_response(&events, context_id, &response, None);
        }
        Command::CStoreRq(rq) => {
            let status = match &options.handlers.c_store {
                Some(handler) => handler(
                    &transfer_syntax,
                    &rq.affected_sop_class_uid,
                    &rq.affected_sop_instance_uid,
                    &data,
                ),
                None => Status::new(Status::UNRECOGNIZED_OPERATION),
            };
            let response = Command::CStoreRsp(
                CStoreRsp::builder()
                    .affected_sop_class_uid(rq.affected_sop_class_uid)
                    .message_id_being_responded_to(rq.message_id)
                    .affected_sop_instance_uid(rq.affected_sop_instance_uid)
                    .status(status)
                    .build(),
            );
            send_response(&events, context_id, &response, None);
        }
        Command::CFindRq(rq) => {
            let sop_class_uid = rq.affected_sop_class_uid.clone();
            let respond = |status: Status, dataset: Option<Vec<u8>>| {
                let response = Command::CFindRsp(
                    CFindRsp::builder()
                        .affected_sop_class_uid(sop_class_uid.as_str())
                        .message_id_being_responded_to(rq.message_id)
                        .command_data_set_type(if dataset.is_some() {
                            COMMAND_DATA_SET_TYPE_NON_NULL
                        } else {
                            COMMAND_DATA_SET_TYPE_NULL
                        })
                        .status(status)
                        .build(),
                );
                send_response(&events, context_id, &response, dataset)
            };

            let Some(handler) = &options.handlers.c_find else {
                respond(Status::new(Status::UNRECOGNIZED_OPERATION), None);
                return;
            };
            let query = match decode_dataset(&data, &transfer_syntax) {
                Ok(query) => query,
                Err(status) => {
                    respond(status, None);
                    return;
                }
            };
            for item in handler(&transfer_syntax, &rq.affected_sop_class_uid, &query) {
                match item.and_then(|dataset| encode_dataset(&dataset, &transfer_syntax)) {
                    Ok(bytes) => {
                        if !respond(Status::pending(), Some(bytes)) {
                            return;
                        }
                    }
                    Err(status) => {
                        respond(status, None);
                        return;
                    }
                }
            }
            respond(Status::success(), None);
        }
        Command::CMoveRq(rq) => {
            if !options.remote_aes.contains_key(&rq.move_destination) {
                let response = Command::CMoveRsp(
                    CMoveRsp::builder()
                        .affected_sop_class_uid(rq.affected_sop_class_uid)
                        .message_id_being_responded_to(rq.message_id)
                        .status(Status::with_comment(
                            Status::REFUSED_MOVE_DESTINATION_UNKNOWN,
                            rq.move_destination,
                        ))
                        .build(),
                );
                send_response(&events, context_id, &response, None);
                return;
            }
            run_retrieve(
                options.handlers.c_move.as_ref(),
                &events,
                context_id,
                &transfer_syntax,
                &rq.affected_sop_class_uid,
                rq.message_id,
                &data,
                |sop_class_uid, message_id, status, counters| {
                    Command::CMoveRsp(
                        CMoveRsp::builder()
                            .affected_sop_class_uid(sop_class_uid)
                            .message_id_being_responded_to(message_id)
                            .status(status)
                            .maybe_number_of_remaining_suboperations(counters.map(|c| c.remaining))
                            .maybe_number_of_completed_suboperations(counters.map(|c| c.completed))
                            .maybe_number_of_failed_suboperations(counters.map(|c| c.failed))
                            .maybe_number_of_warning_suboperations(counters.map(|c| c.warning))
                            .build(),
                    )
                },
            );
        }
        Command::CGetRq(rq) => {
            run_retrieve(
                options.handlers.c_get.as_ref(),
                &events,
                context_id,
                &transfer_syntax,
                &rq.affected_sop_class_uid,
                rq.message_id,
                &data,
                |sop_class_uid, message_id, status, counters| {
                    Command::CGetRsp(
                        CGetRsp::builder()
                            .affected_sop_class_uid(sop_class_uid)
                            .message_id_being_responded_to(message_id)
                            .status(status)
                            .maybe_number_of_remaining_suboperations(counters.map(|c| c.remaining))
                            .maybe_number_of_completed_suboperations(counters.map(|c| c.completed))
                            .maybe_number_of_failed_suboperations(counters.map(|c| c.failed))
                            .maybe_number_of_warning_suboperations(counters.map(|c| c.warning))
                            .build(),
                    )
                },
            );
        }
        // responses are rejected before dispatch
        _ => {}
    }
}

#[derive(Debug, Copy, Clone)]
struct SubOperationCounters {
    remaining: u16,
    completed: u16,
    failed: u16,
    warning: u16,
}

/// Shared response loop of C-MOVE and C-GET:
/// one pending response with sub-operation counters per item,
/// then a terminal response.
#[allow(clippy::too_many_arguments)]
fn run_retrieve(
    handler: Option<&CRetrieveHandler>,
    events: &SyncSender<Event>,
    context_id: u8,
    transfer_syntax: &str,
    sop_class_uid: &str,
    message_id: u16,
    data: &[u8],
    make_response: impl Fn(&str, u16, Status, Option<SubOperationCounters>) -> Command,
) {
    let respond = |status: Status, counters: Option<SubOperationCounters>| {
        let response = make_response(sop_class_uid, message_id, status, counters);
        send_response(events, context_id, &response, None)
    };

    let Some(handler) = handler else {
        respond(Status::new(Status::UNRECOGNIZED_OPERATION), None);
        return;
    };
    let query = match decode_dataset(data, transfer_syntax) {
        Ok(query) => query,
        Err(status) => {
            respond(status, None);
            return;
        }
    };

    let mut completed = 0u16;
    for item in handler(transfer_syntax, sop_class_uid, &query) {
        match item {
            Ok(RetrieveItem { remaining, .. }) => {
                completed = completed.saturating_add(1);
                let counters = SubOperationCounters {
                    remaining,
                    completed,
                    failed: 0,
                    warning: 0,
                };
                if !respond(Status::pending(), Some(counters)) {
                    return;
                }
            }
            Err(status) => {
                let counters = SubOperationCounters {
                    remaining: 0,
                    completed,
                    failed: 1,
                    warning: 0,
                };
                respond(status, Some(counters));
                return;
            }
        }
    }
    let counters = SubOperationCounters {
        remaining: 0,
        completed,
        failed: 0,
        warning: 0,
    };
    respond(Status::success(), Some(counters));
}

/// Encode and submit one response message.
/// Returns false when the association is gone.
fn send_response(
    events: &SyncSender<Event>,
    context_id: u8,
    command: &Command,
    data: Option<Vec<u8>>,
) -> bool {
    let bytes = match command.encode() {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("could not encode response command: {}", e);
            let _ = events.send(Event::AbortRequest);
            return false;
        }
    };
    events
        .send(Event::PDataRequest {
            context_id,
            command: bytes,
            data,
        })
        .is_ok()
}

fn decode_dataset(data: &[u8], transfer_syntax: &str) -> Result<InMemDicomObject, Status> {
    let ts = TransferSyntaxRegistry.get(transfer_syntax).ok_or_else(|| {
        Status::with_comment(Status::CANNOT_UNDERSTAND, "unsupported transfer syntax")
    })?;
    InMemDicomObject::read_dataset_with_ts(data, ts)
        .map_err(|e| Status::with_comment(Status::CANNOT_UNDERSTAND, e.to_string()))
}

fn encode_dataset(dataset: &InMemDicomObject, transfer_syntax: &str) -> Result<Vec<u8>, Status> {
    let ts = TransferSyntaxRegistry.get(transfer_syntax).ok_or_else(|| {
        Status::with_comment(Status::CANNOT_UNDERSTAND, "unsupported transfer syntax")
    })?;
    let mut bytes = Vec::new();
    dataset
        .write_dataset_with_ts(&mut bytes, ts)
        .map_err(|e| Status::with_comment(Status::CANNOT_UNDERSTAND, e.to_string()))?;
    Ok(bytes)
}
