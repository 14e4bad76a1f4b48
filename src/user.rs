//! Service class user (SCU) operations.
//!
//! A [`ServiceUser`] owns one association from the requestor side
//! and exposes the composite DIMSE operations over it:
//! [`c_echo`](ServiceUser::c_echo), [`c_store`](ServiceUser::c_store),
//! [`c_find`](ServiceUser::c_find), [`c_move`](ServiceUser::c_move)
//! and [`c_get`](ServiceUser::c_get).
//! Each operation blocks until its terminal response arrives,
//! collecting the pending responses of the streaming services
//! on the way.

use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::time::Duration;

use dicom_dictionary_std::tags;
use dicom_encoding::transfer_syntax::TransferSyntaxIndex;
use dicom_object::InMemDicomObject;
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
use snafu::{ensure, OptionExt, ResultExt, Snafu};
use tracing::{debug, warn};

use crate::association::{
    self, AbortCause, AssociationConfig, AssociationHandle, Upcall, APPLICATION_CONTEXT_NAME,
};
use crate::context::{ContextManager, EXPLICIT_VR_LE, IMPLICIT_VR_LE, VERIFICATION_SOP_CLASS};
use crate::dimse::{
    CEchoRq, CFindRq, CGetRq, CMoveRq, CStoreRq, Command, Status,
};
use crate::machine::{Event, Role};
use crate::pdu::{AssociationRJ, DEFAULT_MAX_PDU};

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// missing at least one abstract syntax to propose
    MissingAbstractSyntax,

    /// the association request was rejected by the peer
    #[snafu(display("association rejected: {:?}", association_rj))]
    Rejected { association_rj: AssociationRJ },

    /// the association was aborted
    #[snafu(display("association aborted: {:?}", cause))]
    Aborted { cause: AbortCause },

    /// the peer accepted none of the proposed presentation contexts
    NoAcceptedPresentationContexts,

    /// the association is closed
    ConnectionClosed,

    /// the request timed out; the association was aborted
    RequestTimedOut,

    #[snafu(display("no presentation context for the request: {}", source))]
    NoMatchingContext { source: crate::context::Error },

    #[snafu(display("could not encode DIMSE command: {}", source))]
    EncodeCommand { source: crate::dimse::EncodeError },

    #[snafu(display("data set lacks element {}", name))]
    MissingElement { name: &'static str },

    #[snafu(display("invalid value in element {}: {}", name, source))]
    InvalidElement {
        name: &'static str,
        source: dicom_core::value::ConvertValueError,
    },

    #[snafu(display("transfer syntax {} is not supported", uid))]
    UnsupportedTransferSyntax { uid: String },

    #[snafu(display("could not encode data set: {}", source))]
    EncodeDataSet {
        #[snafu(source(from(dicom_object::WriteError, Box::new)))]
        source: Box<dicom_object::WriteError>,
    },

    #[snafu(display("could not decode response data set: {}", source))]
    DecodeDataSet {
        #[snafu(source(from(dicom_object::ReadError, Box::new)))]
        source: Box<dicom_object::ReadError>,
    },

    #[snafu(display("unexpected response command {:#06x}", command_field))]
    UnexpectedResponse { command_field: u16 },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The collected outcome of a C-FIND operation.
#[derive(Debug)]
pub struct FindOutcome {
    /// the identifiers of the pending responses, in arrival order
    pub matches: Vec<InMemDicomObject>,
    /// the terminal status
    pub status: Status,
}

/// The collected outcome of a C-MOVE or C-GET operation.
#[derive(Debug)]
pub struct RetrieveOutcome {
    pub completed: u16,
    pub failed: u16,
    pub warnings: u16,
    /// the terminal status
    pub status: Status,
}

/// Options for establishing an association as a service class user.
///
/// # Example
///
/// ```no_run
/// # use dicom_net::user::ServiceUserOptions;
/// # fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let mut scu = ServiceUserOptions::new()
///     .calling_ae_title("ECHO-SCU")
///     .called_ae_title("MAIN-STORAGE")
///     .with_abstract_syntax("1.2.840.10008.1.1")
///     .establish("192.168.0.5:104")?;
///
/// let status = scu.c_echo()?;
/// assert!(status.is_success());
/// scu.release()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ServiceUserOptions {
    calling_ae_title: String,
    called_ae_title: String,
    abstract_syntaxes: Vec<String>,
    transfer_syntaxes: Vec<String>,
    max_pdu_length: u32,
    establish_timeout: Option<Duration>,
    request_timeout: Option<Duration>,
}

impl Default for ServiceUserOptions {
    fn default() -> Self {
        ServiceUserOptions {
            calling_ae_title: "THIS-SCU".to_string(),
            called_ae_title: "ANY-SCP".to_string(),
            abstract_syntaxes: Vec::new(),
            transfer_syntaxes: Vec::new(),
            max_pdu_length: DEFAULT_MAX_PDU,
            establish_timeout: Some(Duration::from_secs(30)),
            request_timeout: None,
        }
    }
}

impl ServiceUserOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Define the calling AE title, referring to this node.
    ///
    /// The default is `THIS-SCU`.
    pub fn calling_ae_title(mut self, ae_title: impl Into<String>) -> Self {
        self.calling_ae_title = ae_title.into();
        self
    }

    /// Define the called AE title, referring to the target node.
    ///
    /// The default is `ANY-SCP`.
    pub fn called_ae_title(mut self, ae_title: impl Into<String>) -> Self {
        self.called_ae_title = ae_title.into();
        self
    }

    /// Include this abstract syntax
    /// in the proposed presentation contexts.
    pub fn with_abstract_syntax(mut self, abstract_syntax_uid: impl Into<String>) -> Self {
        self.abstract_syntaxes.push(abstract_syntax_uid.into());
        self
    }

    /// Include this transfer syntax in each proposed context.
    ///
    /// When none is given, Explicit VR Little Endian and
    /// Implicit VR Little Endian are proposed.
    pub fn with_transfer_syntax(mut self, transfer_syntax_uid: impl Into<String>) -> Self {
        self.transfer_syntaxes.push(transfer_syntax_uid.into());
        self
    }

    /// Override the maximum PDU length advertised to the peer.
    pub fn max_pdu_length(mut self, value: u32) -> Self {
        self.max_pdu_length = value;
        self
    }

    /// Set a deadline for each request;
    /// on expiry the association is aborted.
    /// The default is to wait indefinitely.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Open the transport connection and negotiate the association.
    pub fn establish(mut self, address: impl Into<String>) -> Result<ServiceUser> {
        ensure!(!self.abstract_syntaxes.is_empty(), MissingAbstractSyntaxSnafu);
        if self.transfer_syntaxes.is_empty() {
            self.transfer_syntaxes =
                vec![EXPLICIT_VR_LE.to_string(), IMPLICIT_VR_LE.to_string()];
        }

        let request_timeout = self.request_timeout;
        let config = AssociationConfig {
            role: Role::Requestor,
            ae_title: self.calling_ae_title,
            peer_ae_title: self.called_ae_title,
            application_context_name: APPLICATION_CONTEXT_NAME.to_string(),
            abstract_syntaxes: self.abstract_syntaxes,
            transfer_syntaxes: self.transfer_syntaxes,
            max_pdu_length: self.max_pdu_length,
            peer_address: Some(address.into()),
            establish_timeout: self.establish_timeout,
            access_control: Arc::new(|_: &str, _: &str| Ok(())),
        };
        let AssociationHandle { events, upcalls } = association::spawn(config, None);
        events
            .send(Event::ARequest)
            .ok()
            .context(ConnectionClosedSnafu)?;

        match upcalls.recv() {
            Ok(Upcall::Established {
                contexts,
                peer_max_pdu_length,
            }) => {
                if contexts.is_empty() {
                    let _ = events.send(Event::AbortRequest);
                    return NoAcceptedPresentationContextsSnafu.fail();
                }
                debug!(
                    "association established: {} presentation contexts, peer max PDU {}",
                    contexts.len(),
                    peer_max_pdu_length
                );
                Ok(ServiceUser {
                    events,
                    upcalls,
                    contexts,
                    peer_max_pdu_length,
                    message_id: 0,
                    request_timeout,
                    closed: false,
                })
            }
            Ok(Upcall::Rejected(association_rj)) => RejectedSnafu { association_rj }.fail(),
            Ok(Upcall::Aborted(cause)) => AbortedSnafu { cause }.fail(),
            Ok(_) | Err(_) => ConnectionClosedSnafu.fail(),
        }
    }
}

/// An established association from the requestor side.
///
/// Dropping the value without calling
/// [`release`](Self::release) aborts the association.
pub struct ServiceUser {
    events: SyncSender<Event>,
    upcalls: Receiver<Upcall>,
    contexts: Arc<ContextManager>,
    peer_max_pdu_length: u32,
    message_id: u16,
    request_timeout: Option<Duration>,
    closed: bool,
}

impl ServiceUser {
    /// The negotiated presentation contexts of this association.
    pub fn presentation_contexts(&self) -> &ContextManager {
        &self.contexts
    }

    /// The maximum PDU length accepted by the peer.
    pub fn peer_max_pdu_length(&self) -> u32 {
        self.peer_max_pdu_length
    }

    /// Verify the association with a C-ECHO exchange.
    pub fn c_echo(&mut self) -> Result<Status> {
        let context_id = self
            .contexts
            .find_by_abstract_syntax(VERIFICATION_SOP_CLASS)
            .context(NoMatchingContextSnafu)?
            .id;
        let message_id = self.next_message_id();
        let command = Command::CEchoRq(CEchoRq::builder().message_id(message_id).build());
        self.send_request(context_id, &command, None)?;

        let (response, _) = self.receive_response(message_id)?;
        match response {
            Command::CEchoRsp(rsp) => Ok(rsp.status),
            other => UnexpectedResponseSnafu {
                command_field: other.command_field(),
            }
            .fail(),
        }
    }

    /// Store one composite object on the peer.
    ///
    /// The SOP class and instance UIDs are taken from the data set,
    /// which is encoded under the transfer syntax negotiated
    /// for its SOP class.
    pub fn c_store(&mut self, object: &InMemDicomObject) -> Result<Status> {
        let sop_class_uid = element_str(object, tags::SOP_CLASS_UID, "SOPClassUID")?;
        let sop_instance_uid = element_str(object, tags::SOP_INSTANCE_UID, "SOPInstanceUID")?;

        let context = self
            .contexts
            .find_by_abstract_syntax(&sop_class_uid)
            .context(NoMatchingContextSnafu)?
            .clone();
        let data = encode_dataset(object, &context.transfer_syntax)?;

        let message_id = self.next_message_id();
        let command = Command::CStoreRq(
            CStoreRq::builder()
                .affected_sop_class_uid(sop_class_uid)
                .message_id(message_id)
                .affected_sop_instance_uid(sop_instance_uid)
                .build(),
        );
        self.send_request(context.id, &command, Some(data))?;

        let (response, _) = self.receive_response(message_id)?;
        match response {
            Command::CStoreRsp(rsp) => Ok(rsp.status),
            other => UnexpectedResponseSnafu {
                command_field: other.command_field(),
            }
            .fail(),
        }
    }

    /// Query the peer, collecting every pending match
    /// until the terminal response.
    pub fn c_find(
        &mut self,
        abstract_syntax_uid: &str,
        query: &InMemDicomObject,
    ) -> Result<FindOutcome> {
        let context = self
            .contexts
            .find_by_abstract_syntax(abstract_syntax_uid)
            .context(NoMatchingContextSnafu)?
            .clone();
        let data = encode_dataset(query, &context.transfer_syntax)?;

        let message_id = self.next_message_id();
        let command = Command::CFindRq(
            CFindRq::builder()
                .affected_sop_class_uid(abstract_syntax_uid)
                .message_id(message_id)
                .build(),
        );
        self.send_request(context.id, &command, Some(data))?;

        let mut matches = Vec::new();
        loop {
            let (response, data) = self.receive_response(message_id)?;
            let rsp = match response {
                Command::CFindRsp(rsp) => rsp,
                other => {
                    return UnexpectedResponseSnafu {
                        command_field: other.command_field(),
                    }
                    .fail()
                }
            };
            if rsp.status.is_pending() {
                if !data.is_empty() {
                    matches.push(decode_dataset(&data, &context.transfer_syntax)?);
                }
                continue;
            }
            return Ok(FindOutcome {
                matches,
                status: rsp.status,
            });
        }
    }

    /// Ask the peer to move matching objects to another
    /// application entity, following the sub-operation progress
    /// until the terminal response.
    pub fn c_move(
        &mut self,
        destination_ae_title: &str,
        abstract_syntax_uid: &str,
        query: &InMemDicomObject,
    ) -> Result<RetrieveOutcome> {
        let context = self
            .contexts
            .find_by_abstract_syntax(abstract_syntax_uid)
            .context(NoMatchingContextSnafu)?
            .clone();
        let data = encode_dataset(query, &context.transfer_syntax)?;

        let message_id = self.next_message_id();
        let command = Command::CMoveRq(
            CMoveRq::builder()
                .affected_sop_class_uid(abstract_syntax_uid)
                .message_id(message_id)
                .move_destination(destination_ae_title)
                .build(),
        );
        self.send_request(context.id, &command, Some(data))?;
        self.collect_retrieve(message_id)
    }

    /// Retrieve matching objects over this association,
    /// following the sub-operation progress
    /// until the terminal response.
    pub fn c_get(
        &mut self,
        abstract_syntax_uid: &str,
        query: &InMemDicomObject,
    ) -> Result<RetrieveOutcome> {
        let context = self
            .contexts
            .find_by_abstract_syntax(abstract_syntax_uid)
            .context(NoMatchingContextSnafu)?
            .clone();
        let data = encode_dataset(query, &context.transfer_syntax)?;

        let message_id = self.next_message_id();
        let command = Command::CGetRq(
            CGetRq::builder()
                .affected_sop_class_uid(abstract_syntax_uid)
                .message_id(message_id)
                .build(),
        );
        self.send_request(context.id, &command, Some(data))?;
        self.collect_retrieve(message_id)
    }

    /// Release the association in an orderly fashion
    /// and wait for the exchange to complete.
    ///
    /// Releasing an already closed association is a no-op.
    pub fn release(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if self.events.send(Event::ReleaseRequest).is_err() {
            return Ok(());
        }
        // drain until the association task closes the upcall queue
        loop {
            if self.upcalls.recv().is_err() {
                return Ok(());
            }
        }
    }

    /// Abort the association immediately.
    ///
    /// Aborting an already closed association is a no-op.
    pub fn abort(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let _ = self.events.send(Event::AbortRequest);
        loop {
            if self.upcalls.recv().is_err() {
                return Ok(());
            }
        }
    }

    fn next_message_id(&mut self) -> u16 {
        self.message_id = self.message_id.wrapping_add(1);
        self.message_id
    }

    fn send_request(
        &mut self,
        context_id: u8,
        command: &Command,
        data: Option<Vec<u8>>,
    ) -> Result<()> {
        let bytes = command.encode().context(EncodeCommandSnafu)?;
        self.events
            .send(Event::PDataRequest {
                context_id,
                command: bytes,
                data,
            })
            .ok()
            .context(ConnectionClosedSnafu)
    }

    /// Wait for the next DIMSE response to the given message ID.
    fn receive_response(&mut self, message_id: u16) -> Result<(Command, Vec<u8>)> {
        loop {
            let upcall = match self.request_timeout {
                Some(timeout) => match self.upcalls.recv_timeout(timeout) {
                    Ok(upcall) => upcall,
                    Err(RecvTimeoutError::Timeout) => {
                        let _ = self.events.send(Event::AbortRequest);
                        self.closed = true;
                        return RequestTimedOutSnafu.fail();
                    }
                    Err(RecvTimeoutError::Disconnected) => {
                        self.closed = true;
                        return ConnectionClosedSnafu.fail();
                    }
                },
                None => match self.upcalls.recv() {
                    Ok(upcall) => upcall,
                    Err(_) => {
                        self.closed = true;
                        return ConnectionClosedSnafu.fail();
                    }
                },
            };
            match upcall {
                Upcall::Data { command, data, .. } => {
                    if command.message_id_being_responded_to() == Some(message_id) {
                        return Ok((command, data));
                    }
                    warn!(
                        "dropping response for unexpected message {:?}",
                        command.message_id_being_responded_to()
                    );
                }
                Upcall::Aborted(cause) => {
                    self.closed = true;
                    return AbortedSnafu { cause }.fail();
                }
                Upcall::Released => {
                    self.closed = true;
                    return ConnectionClosedSnafu.fail();
                }
                _ => {}
            }
        }
    }

    fn collect_retrieve(&mut self, message_id: u16) -> Result<RetrieveOutcome> {
        loop {
            let (response, _) = self.receive_response(message_id)?;
            let (status, completed, failed, warnings) = match response {
                Command::CMoveRsp(rsp) => (
                    rsp.status,
                    rsp.number_of_completed_suboperations,
                    rsp.number_of_failed_suboperations,
                    rsp.number_of_warning_suboperations,
                ),
                Command::CGetRsp(rsp) => (
                    rsp.status,
                    rsp.number_of_completed_suboperations,
                    rsp.number_of_failed_suboperations,
                    rsp.number_of_warning_suboperations,
                ),
                other => {
                    return UnexpectedResponseSnafu {
                        command_field: other.command_field(),
                    }
                    .fail()
                }
            };
            if status.is_pending() {
                continue;
            }
            return Ok(RetrieveOutcome {
                completed: completed.unwrap_or(0),
                failed: failed.unwrap_or(0),
                warnings: warnings.unwrap_or(0),
                status,
            });
        }
    }
}

impl Drop for ServiceUser {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.events.send(Event::AbortRequest);
        }
    }
}

fn element_str(
    object: &InMemDicomObject,
    tag: dicom_core::Tag,
    name: &'static str,
) -> Result<String> {
    Ok(object
        .get(tag)
        .context(MissingElementSnafu { name })?
        .to_str()
        .context(InvalidElementSnafu { name })?
        .trim_end_matches(['\0', ' '])
        .to_string())
}

fn encode_dataset(object: &InMemDicomObject, transfer_syntax: &str) -> Result<Vec<u8>> {
    let ts = TransferSyntaxRegistry
        .get(transfer_syntax)
        .with_context(|| UnsupportedTransferSyntaxSnafu {
            uid: transfer_syntax.to_string(),
        })?;
    let mut bytes = Vec::new();
    object
        .write_dataset_with_ts(&mut bytes, ts)
        .context(EncodeDataSetSnafu)?;
    Ok(bytes)
}

fn decode_dataset(data: &[u8], transfer_syntax: &str) -> Result<InMemDicomObject> {
    let ts = TransferSyntaxRegistry
        .get(transfer_syntax)
        .with_context(|| UnsupportedTransferSyntaxSnafu {
            uid: transfer_syntax.to_string(),
        })?;
    InMemDicomObject::read_dataset_with_ts(data, ts).context(DecodeDataSetSnafu)
}
