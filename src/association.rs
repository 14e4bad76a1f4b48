//! The per-association protocol task.
//!
//! Every association runs exactly one state machine task which owns
//! the TCP socket, the negotiated context map and the command assembler.
//! A companion reader thread decodes incoming PDUs and feeds them,
//! together with the downcalls of the local service layer,
//! into one bounded event queue;
//! the task is the sole consumer of that queue
//! and the sole writer to the socket,
//! so outbound PDUs are never interleaved within a message.
//!
//! The layers above observe the association through [`Upcall`]s
//! on a second bounded queue.
//! Reaching [`State::Sta1`] closes the upcall queue and
//! releases the socket; teardown is idempotent.

use std::collections::VecDeque;
use std::io::Write;
use std::net::{Shutdown, TcpStream};
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::context::{self, ContextManager};
use crate::dimse::assembler::CommandAssembler;
use crate::dimse::Command;
use crate::fault::{self, FaultAction, FaultInjector};
use crate::machine::{transition, Action, Event, Role, State};
use crate::pdu::reader::{read_pdu, ReadError, MAXIMUM_PDU_SIZE};
use crate::pdu::writer::write_pdu;
use crate::pdu::{
    AbortRQServiceProviderReason, AbortRQSource, AssociationAC, AssociationRJ,
    AssociationRJResult, AssociationRJServiceUserReason, AssociationRJServiceProviderAcseReason,
    AssociationRJSource, AssociationRQ, PDataValue, PDataValueType, Pdu,
    PresentationContextProposed, PresentationContextResult, UserVariableItem, DEFAULT_MAX_PDU,
};
use crate::{IMPLEMENTATION_CLASS_UID, IMPLEMENTATION_VERSION_NAME};

/// Capacity of the merged event queue (PDU events and downcalls).
/// Worker threads block on a full queue, which backpressures
/// streaming callbacks.
const EVENT_QUEUE_CAPACITY: usize = 128;

/// Capacity of the upcall queue.
const UPCALL_QUEUE_CAPACITY: usize = 64;

/// Stand-in for the ARTIM timer: how long to wait in Sta13
/// for the peer to close the transport before closing it ourselves.
const LINGER_TIMEOUT: Duration = Duration::from_secs(1);

/// The default application context name of DICOM.
pub const APPLICATION_CONTEXT_NAME: &str = "1.2.840.10008.3.1.1.1";

/// Why an association ended abnormally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortCause {
    /// the peer sent an A-ABORT
    Peer(AbortRQSource),
    /// a protocol violation was detected locally
    /// and an A-ABORT was sent to the peer
    ProtocolError(AbortRQServiceProviderReason),
    /// the local user requested an abort
    LocalRequest,
    /// the transport connection failed or closed unexpectedly
    TransportFailure,
}

/// An event delivered from the association task to the service layer.
#[derive(Debug)]
pub enum Upcall {
    /// the association is established;
    /// the context map is immutable from here on
    Established {
        contexts: Arc<ContextManager>,
        peer_max_pdu_length: u32,
    },
    /// a complete DIMSE message arrived
    Data {
        context_id: u8,
        command: Command,
        data: Vec<u8>,
    },
    /// the association request was rejected
    Rejected(AssociationRJ),
    /// the association was released in an orderly fashion
    Released,
    /// the association was aborted
    Aborted(AbortCause),
}

/// Access decision over an incoming association request,
/// based on the called and calling AE titles.
pub(crate) type AccessDecision =
    dyn Fn(&str, &str) -> Result<(), AssociationRJServiceUserReason> + Send + Sync;

/// Configuration of one association task.
pub(crate) struct AssociationConfig {
    pub role: Role,
    /// our AE title: the calling AE title on the requestor side,
    /// the receiving AE title on the acceptor side
    pub ae_title: String,
    /// the called AE title (requestor side only)
    pub peer_ae_title: String,
    pub application_context_name: String,
    pub abstract_syntaxes: Vec<String>,
    pub transfer_syntaxes: Vec<String>,
    /// the maximum PDU length advertised to the peer
    /// and enforced on incoming PDUs
    pub max_pdu_length: u32,
    /// target address (requestor side only)
    pub peer_address: Option<String>,
    /// timeout for association establishment
    pub establish_timeout: Option<Duration>,
    /// acceptor-side access control
    pub access_control: Arc<AccessDecision>,
}

impl AssociationConfig {
    fn injector(&self) -> Option<Arc<FaultInjector>> {
        match self.role {
            Role::Acceptor => fault::provider_injector(),
            Role::Requestor => fault::user_injector(),
        }
    }
}

/// The channel pair connecting a service layer to its association task.
pub(crate) struct AssociationHandle {
    pub events: SyncSender<Event>,
    pub upcalls: Receiver<Upcall>,
}

/// Start an association task.
///
/// On the acceptor side, `socket` carries the freshly accepted stream
/// and the task starts awaiting the A-ASSOCIATE-RQ.
/// On the requestor side, `socket` is `None` and the caller submits
/// [`Event::ARequest`] to open the transport.
pub(crate) fn spawn(config: AssociationConfig, socket: Option<TcpStream>) -> AssociationHandle {
    let (events_tx, events_rx) = sync_channel(EVENT_QUEUE_CAPACITY);
    let (upcalls_tx, upcalls_rx) = sync_channel(UPCALL_QUEUE_CAPACITY);

    let state = match config.role {
        Role::Acceptor => State::Sta2,
        Role::Requestor => State::Sta1,
    };
    let injector = config.injector();
    let mut task = AssociationTask {
        config,
        state,
        socket: None,
        contexts: Arc::new(ContextManager::default()),
        assembler: CommandAssembler::new(),
        peer_max_pdu_length: DEFAULT_MAX_PDU,
        negotiated: Vec::new(),
        proposed: Vec::new(),
        received_rq: None,
        events_tx: Some(events_tx.clone()),
        upcalls: upcalls_tx,
        pending: VecDeque::new(),
        injector,
    };
    thread::spawn(move || {
        if let Some(stream) = socket {
            task.attach_socket(stream);
        }
        task.run(events_rx);
    });

    AssociationHandle {
        events: events_tx,
        upcalls: upcalls_rx,
    }
}

struct AssociationTask {
    config: AssociationConfig,
    state: State,
    socket: Option<TcpStream>,
    contexts: Arc<ContextManager>,
    assembler: CommandAssembler,
    peer_max_pdu_length: u32,
    /// presentation context results computed during negotiation
    /// (acceptor side)
    negotiated: Vec<PresentationContextResult>,
    /// presentation contexts proposed in our A-ASSOCIATE-RQ
    /// (requestor side)
    proposed: Vec<PresentationContextProposed>,
    /// the association request being answered (acceptor side)
    received_rq: Option<AssociationRQ>,
    /// sender handed to the reader thread on socket attachment;
    /// dropped afterwards so that the event queue can disconnect
    events_tx: Option<SyncSender<Event>>,
    upcalls: SyncSender<Upcall>,
    /// internally generated events, consumed before the queue
    pending: VecDeque<Event>,
    injector: Option<Arc<FaultInjector>>,
}

impl AssociationTask {
    fn run(mut self, events: Receiver<Event>) {
        let mut started = self.state != State::Sta1;
        loop {
            let event = match self.pending.pop_front() {
                Some(event) => event,
                None if self.state == State::Sta13 => {
                    match events.recv_timeout(LINGER_TIMEOUT) {
                        Ok(event) => event,
                        Err(RecvTimeoutError::Timeout) => Event::TimerExpired,
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                None => match events.recv() {
                    Ok(event) => event,
                    Err(_) => break,
                },
            };

            let outcome = transition(self.config.role, self.state, &event);
            trace!(
                "association event {:?}: {:?} -> {:?}",
                event,
                self.state,
                outcome.next
            );
            self.state = outcome.next;
            self.perform(outcome.actions, event);

            if self.state != State::Sta1 {
                started = true;
            } else if started {
                break;
            }
        }
        self.close_transport();
    }

    fn perform(&mut self, actions: Vec<Action>, event: Event) {
        let cause = abort_cause(&event);
        let mut event = Some(event);

        for action in actions {
            match action {
                Action::ConnectTransport => self.connect_transport(),
                Action::SendAssociateRq => self.send_associate_rq(),
                Action::AssociateIndication => {
                    if let Some(Event::AAssociateRq(rq)) = event.take() {
                        let response = self.negotiate_request(rq);
                        self.pending.push_back(response);
                    }
                }
                Action::SendAssociateAc => self.send_associate_ac(),
                Action::SendAssociateRj => {
                    if let Some(Event::LocalReject(rj)) = event.take() {
                        self.send_pdu(&Pdu::AssociationRJ(rj.clone()));
                        event = Some(Event::LocalReject(rj));
                        self.linger();
                    }
                }
                Action::SendPData => {
                    if let Some(Event::PDataRequest {
                        context_id,
                        command,
                        data,
                    }) = event.take()
                    {
                        for pdu in fragment_pdata(context_id, command, data, self.peer_max_pdu_length)
                        {
                            self.send_pdu(&pdu);
                        }
                    }
                }
                Action::CollectPData => {
                    if let Some(Event::PDataTf(values)) = event.take() {
                        self.collect_pdata(values);
                    }
                }
                Action::SendReleaseRq => self.send_pdu(&Pdu::ReleaseRQ),
                Action::ReleaseIndication => {
                    // the service layer always honors a release request
                    self.pending.push_back(Event::LocalReleaseResponse);
                }
                Action::SendReleaseRp => self.send_pdu(&Pdu::ReleaseRP),
                Action::SendAbort(source) => {
                    self.send_pdu(&Pdu::AbortRQ { source });
                    self.linger();
                }
                Action::CloseTransport => self.close_transport(),
                Action::NotifyEstablished => self.notify_established(&mut event),
                Action::NotifyRejected => {
                    let rj = match event.take() {
                        Some(Event::AAssociateRj(rj)) | Some(Event::LocalReject(rj)) => rj,
                        _ => AssociationRJ {
                            result: AssociationRJResult::Permanent,
                            source: AssociationRJSource::ServiceUser(
                                AssociationRJServiceUserReason::NoReasonGiven,
                            ),
                        },
                    };
                    self.push_upcall(Upcall::Rejected(rj));
                }
                Action::NotifyReleased => self.push_upcall(Upcall::Released),
                Action::NotifyAborted => self.push_upcall(Upcall::Aborted(cause.clone())),
            }
        }
    }

    fn connect_transport(&mut self) {
        let Some(address) = self.config.peer_address.clone() else {
            self.pending.push_back(Event::TransportClosed);
            return;
        };
        match TcpStream::connect(&address) {
            Ok(stream) => {
                self.attach_socket(stream);
                self.pending.push_back(Event::TransportConnected);
            }
            Err(e) => {
                warn!("could not connect to {}: {}", address, e);
                self.pending.push_back(Event::TransportClosed);
            }
        }
    }

    fn attach_socket(&mut self, stream: TcpStream) {
        if stream
            .set_read_timeout(self.config.establish_timeout)
            .is_err()
        {
            self.pending.push_back(Event::TransportClosed);
            return;
        }
        let Some(events) = self.events_tx.take() else {
            self.pending.push_back(Event::TransportClosed);
            return;
        };
        match stream.try_clone() {
            Ok(reader) => {
                let max_pdu_length = self.config.max_pdu_length;
                thread::spawn(move || read_loop(reader, events, max_pdu_length));
                self.socket = Some(stream);
            }
            Err(e) => {
                warn!("could not clone socket: {}", e);
                self.pending.push_back(Event::TransportClosed);
            }
        }
    }

    fn send_associate_rq(&mut self) {
        self.proposed = context::propose(
            &self.config.abstract_syntaxes,
            &self.config.transfer_syntaxes,
        );
        let pdu = Pdu::AssociationRQ(AssociationRQ {
            protocol_version: 1,
            called_ae_title: self.config.peer_ae_title.clone(),
            calling_ae_title: self.config.ae_title.clone(),
            application_context_name: self.config.application_context_name.clone(),
            presentation_contexts: self.proposed.clone(),
            user_variables: vec![
                UserVariableItem::MaxLength(self.config.max_pdu_length),
                UserVariableItem::ImplementationClassUID(IMPLEMENTATION_CLASS_UID.to_string()),
                UserVariableItem::ImplementationVersionName(
                    IMPLEMENTATION_VERSION_NAME.to_string(),
                ),
            ],
        });
        self.send_pdu(&pdu);
    }

    /// Answer an incoming association request (acceptor side):
    /// check protocol version, application context and access control,
    /// then negotiate the presentation contexts.
    fn negotiate_request(&mut self, rq: AssociationRQ) -> Event {
        // only bit 0 of the protocol version is tested
        if rq.protocol_version & 0x0001 == 0 {
            return Event::LocalReject(AssociationRJ {
                result: AssociationRJResult::Permanent,
                source: AssociationRJSource::ServiceProviderAcse(
                    AssociationRJServiceProviderAcseReason::ProtocolVersionNotSupported,
                ),
            });
        }
        if rq.application_context_name != self.config.application_context_name {
            return Event::LocalReject(AssociationRJ {
                result: AssociationRJResult::Permanent,
                source: AssociationRJSource::ServiceUser(
                    AssociationRJServiceUserReason::ApplicationContextNameNotSupported,
                ),
            });
        }
        if let Err(reason) = (self.config.access_control)(&rq.called_ae_title, &rq.calling_ae_title)
        {
            return Event::LocalReject(AssociationRJ {
                result: AssociationRJResult::Permanent,
                source: AssociationRJSource::ServiceUser(reason),
            });
        }

        let (results, contexts) = context::negotiate(
            &rq.presentation_contexts,
            &self.config.abstract_syntaxes,
            &self.config.transfer_syntaxes,
        );
        debug!(
            "association from {}: accepted {} of {} presentation contexts",
            rq.calling_ae_title,
            contexts.len(),
            rq.presentation_contexts.len()
        );
        self.peer_max_pdu_length = max_length_of(&rq.user_variables);
        self.contexts = Arc::new(contexts);
        self.negotiated = results.clone();
        self.received_rq = Some(rq);
        Event::LocalAccept(results)
    }

    fn send_associate_ac(&mut self) {
        let Some(rq) = self.received_rq.as_ref() else {
            return;
        };
        let pdu = Pdu::AssociationAC(AssociationAC {
            protocol_version: 1,
            called_ae_title: rq.called_ae_title.clone(),
            calling_ae_title: rq.calling_ae_title.clone(),
            application_context_name: rq.application_context_name.clone(),
            presentation_contexts: self.negotiated.clone(),
            user_variables: vec![
                UserVariableItem::MaxLength(self.config.max_pdu_length),
                UserVariableItem::ImplementationClassUID(IMPLEMENTATION_CLASS_UID.to_string()),
                UserVariableItem::ImplementationVersionName(
                    IMPLEMENTATION_VERSION_NAME.to_string(),
                ),
            ],
        });
        self.send_pdu(&pdu);
    }

    fn notify_established(&mut self, event: &mut Option<Event>) {
        if self.config.role == Role::Requestor {
            let Some(Event::AAssociateAc(ac)) = event.take() else {
                return;
            };
            if ac.protocol_version & 0x0001 == 0 {
                warn!("peer answered with unsupported protocol version");
                self.pending.push_back(Event::AbortRequest);
                return;
            }
            self.contexts = Arc::new(ContextManager::from_negotiation(
                &self.proposed,
                &ac.presentation_contexts,
            ));
            self.peer_max_pdu_length = max_length_of(&ac.user_variables);
        }

        // established: further reads have no deadline
        if let Some(socket) = &self.socket {
            let _ = socket.set_read_timeout(None);
        }
        self.push_upcall(Upcall::Established {
            contexts: Arc::clone(&self.contexts),
            peer_max_pdu_length: self.peer_max_pdu_length,
        });
    }

    fn collect_pdata(&mut self, values: Vec<PDataValue>) {
        match self.assembler.add_pdata(values) {
            Ok(messages) => {
                for message in messages {
                    self.push_upcall(Upcall::Data {
                        context_id: message.context_id,
                        command: message.command,
                        data: message.data,
                    });
                }
            }
            Err(e) => {
                warn!("protocol error in P-DATA stream: {}", e);
                self.pending.push_back(Event::InvalidPdu(
                    AbortRQServiceProviderReason::UnexpectedPdu,
                ));
            }
        }
    }

    fn send_pdu(&mut self, pdu: &Pdu) {
        if let Some(injector) = &self.injector {
            match injector.next_action() {
                FaultAction::PassThrough => {}
                FaultAction::DropPdu => {
                    debug!("fault injector dropped {}", pdu.short_description());
                    return;
                }
                FaultAction::Delay(delay) => thread::sleep(delay),
                FaultAction::Abort => {
                    debug!("fault injector aborts in state {:?}", self.state);
                    self.pending.push_back(Event::AbortRequest);
                    return;
                }
            }
        }

        let Some(socket) = self.socket.as_mut() else {
            return;
        };
        let mut buffer = Vec::new();
        if let Err(e) = write_pdu(&mut buffer, pdu) {
            warn!("could not encode {}: {}", pdu.short_description(), e);
            self.pending.push_back(Event::AbortRequest);
            return;
        }
        trace!("sending {}", pdu.short_description());
        if let Err(e) = socket.write_all(&buffer) {
            debug!("transport write failed: {}", e);
            self.pending.push_back(Event::TransportClosed);
        }
    }

    /// Give the peer a short deadline to read the final PDU
    /// and close its end, so that teardown cannot hang.
    fn linger(&mut self) {
        if let Some(socket) = &self.socket {
            let _ = socket.set_read_timeout(Some(LINGER_TIMEOUT));
        }
    }

    fn close_transport(&mut self) {
        if let Some(socket) = self.socket.take() {
            let _ = socket.shutdown(Shutdown::Both);
        }
    }

    fn push_upcall(&mut self, upcall: Upcall) {
        // an error means the service layer lost interest;
        // the association still winds down through the state machine
        let _ = self.upcalls.send(upcall);
    }
}

/// The maximum length advertised in the given user variables;
/// 0 means "no limit" per the standard.
fn max_length_of(user_variables: &[UserVariableItem]) -> u32 {
    let advertised = user_variables
        .iter()
        .find_map(|item| match item {
            UserVariableItem::MaxLength(length) => Some(*length),
            _ => None,
        })
        .unwrap_or(DEFAULT_MAX_PDU);
    if advertised == 0 {
        MAXIMUM_PDU_SIZE
    } else {
        advertised
    }
}

fn abort_cause(event: &Event) -> AbortCause {
    match event {
        Event::AAbort(source) => AbortCause::Peer(*source),
        Event::TransportClosed => AbortCause::TransportFailure,
        Event::AbortRequest => AbortCause::LocalRequest,
        Event::InvalidPdu(reason) => AbortCause::ProtocolError(*reason),
        _ => AbortCause::ProtocolError(AbortRQServiceProviderReason::UnexpectedPdu),
    }
}

/// Fragment one DIMSE message into P-DATA-TF PDUs.
///
/// Command fragments come first, the last one flagged `Last`;
/// data fragments follow if a data set is present.
/// No PDV payload exceeds `max_pdu_length - 6`,
/// so no emitted PDU exceeds the peer's maximum length.
pub(crate) fn fragment_pdata(
    context_id: u8,
    command: Vec<u8>,
    data: Option<Vec<u8>>,
    max_pdu_length: u32,
) -> Vec<Pdu> {
    let max_data_length = (max_pdu_length.saturating_sub(6)).max(1) as usize;
    let mut pdus = Vec::new();

    push_fragments(
        &mut pdus,
        context_id,
        PDataValueType::Command,
        &command,
        max_data_length,
    );
    if let Some(data) = data {
        push_fragments(
            &mut pdus,
            context_id,
            PDataValueType::Data,
            &data,
            max_data_length,
        );
    }
    pdus
}

fn push_fragments(
    pdus: &mut Vec<Pdu>,
    context_id: u8,
    value_type: PDataValueType,
    payload: &[u8],
    max_data_length: usize,
) {
    let chunks: Vec<&[u8]> = if payload.is_empty() {
        vec![&[]]
    } else {
        payload.chunks(max_data_length).collect()
    };
    let count = chunks.len();
    for (i, chunk) in chunks.into_iter().enumerate() {
        pdus.push(Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id: context_id,
                value_type,
                is_last: i + 1 == count,
                data: chunk.to_vec(),
            }],
        });
    }
}

/// The association reader thread:
/// decode PDUs from the socket and turn them into machine events
/// until the stream ends or turns undecodable.
fn read_loop(mut stream: TcpStream, events: SyncSender<Event>, max_pdu_length: u32) {
    loop {
        match read_pdu(&mut stream, max_pdu_length) {
            Ok(pdu) => {
                let event = match pdu {
                    Pdu::AssociationRQ(rq) => Event::AAssociateRq(rq),
                    Pdu::AssociationAC(ac) => Event::AAssociateAc(ac),
                    Pdu::AssociationRJ(rj) => Event::AAssociateRj(rj),
                    Pdu::PData { data } => Event::PDataTf(data),
                    Pdu::ReleaseRQ => Event::AReleaseRq,
                    Pdu::ReleaseRP => Event::AReleaseRp,
                    Pdu::AbortRQ { source } => Event::AAbort(source),
                    Pdu::Unknown { pdu_type, .. } => {
                        debug!("peer sent unrecognized PDU type {:#04x}", pdu_type);
                        Event::InvalidPdu(
                            AbortRQServiceProviderReason::ReasonNotSpecifiedUnrecognizedPdu,
                        )
                    }
                };
                let terminal = matches!(event, Event::AAbort(_) | Event::InvalidPdu(_));
                if events.send(event).is_err() || terminal {
                    break;
                }
            }
            Err(ReadError::NoPduAvailable { .. }) => {
                let _ = events.send(Event::TransportClosed);
                break;
            }
            Err(ReadError::PduTooLarge { .. }) => {
                let _ = events.send(Event::InvalidPdu(
                    AbortRQServiceProviderReason::InvalidPduParameter,
                ));
                break;
            }
            Err(ref e) if is_timeout(e) => {
                let _ = events.send(Event::TimerExpired);
                break;
            }
            Err(e) => {
                debug!("could not decode incoming PDU: {}", e);
                let _ = events.send(Event::InvalidPdu(
                    AbortRQServiceProviderReason::ReasonNotSpecifiedUnrecognizedPdu,
                ));
                break;
            }
        }
    }
}

fn is_timeout(e: &ReadError) -> bool {
    let source = match e {
        ReadError::ReadPdu { source, .. }
        | ReadError::ReadPduItem { source, .. }
        | ReadError::ReadPduField { source, .. }
        | ReadError::ReadReserved { source, .. } => source,
        _ => return false,
    };
    matches!(
        source.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragments_obey_the_peer_maximum() {
        let command = vec![1u8; 100];
        let data = vec![2u8; 4096];
        let max_pdu_length = 256;

        let pdus = fragment_pdata(1, command.clone(), Some(data.clone()), max_pdu_length);

        // every PDU fits in the negotiated maximum
        for pdu in &pdus {
            let mut bytes = Vec::new();
            write_pdu(&mut bytes, pdu).unwrap();
            let declared = u32::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]);
            assert!(declared <= max_pdu_length);
        }

        // command fragments come first and concatenate to the original
        let mut command_bytes = Vec::new();
        let mut data_bytes = Vec::new();
        let mut command_lasts = 0;
        let mut data_lasts = 0;
        let mut seen_data = false;
        for pdu in &pdus {
            let Pdu::PData { data: pdvs } = pdu else {
                panic!("unexpected PDU variant");
            };
            for pdv in pdvs {
                assert_eq!(pdv.presentation_context_id, 1);
                match pdv.value_type {
                    PDataValueType::Command => {
                        assert!(!seen_data, "command fragment after data");
                        command_bytes.extend_from_slice(&pdv.data);
                        if pdv.is_last {
                            command_lasts += 1;
                        }
                    }
                    PDataValueType::Data => {
                        seen_data = true;
                        data_bytes.extend_from_slice(&pdv.data);
                        if pdv.is_last {
                            data_lasts += 1;
                        }
                    }
                }
            }
        }
        assert_eq!(command_bytes, command);
        assert_eq!(data_bytes, data);
        assert_eq!(command_lasts, 1);
        assert_eq!(data_lasts, 1);

        // a 4 KiB data set at max length 256 takes at least 17 data PDUs
        assert!(pdus.len() >= 18);
    }

    #[test]
    fn small_message_is_a_single_pdu_per_part() {
        let pdus = fragment_pdata(5, vec![0u8; 64], None, 16_384);
        assert_eq!(pdus.len(), 1);
        let Pdu::PData { data } = &pdus[0] else {
            panic!("unexpected PDU variant");
        };
        assert!(data[0].is_last);
        assert_eq!(data[0].value_type, PDataValueType::Command);
    }

    #[test]
    fn advertised_zero_max_length_means_unlimited() {
        assert_eq!(max_length_of(&[UserVariableItem::MaxLength(0)]), MAXIMUM_PDU_SIZE);
        assert_eq!(max_length_of(&[]), DEFAULT_MAX_PDU);
        assert_eq!(
            max_length_of(&[UserVariableItem::MaxLength(4096)]),
            4096
        );
    }
}
