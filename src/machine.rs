//! The upper layer protocol state machine (PS3.8 §9.2).
//!
//! The machine is expressed as pure data:
//! [`State`] and [`Event`] are sum types
//! and [`transition`] is a function from a (state, event) pair
//! to the next state and a list of [`Action`]s.
//! Carrying out the actions
//! (writing PDUs, feeding the command assembler, emitting upcalls)
//! is the job of the association task in [`crate::association`],
//! which keeps this table free of I/O and trivially testable.
//!
//! Any (state, event) pair without an entry in the table
//! resolves to the protocol-error reaction:
//! an A-ABORT from the service provider
//! followed by transport teardown back to [`State::Sta1`].

use crate::pdu::{
    AbortRQServiceProviderReason, AbortRQSource, AssociationAC, AssociationRJ, AssociationRQ,
    PDataValue, PresentationContextResult,
};

/// The role of the local application entity in the association.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Role {
    /// the node which requested the association (usually the SCU)
    Requestor,
    /// the node which accepted the TCP connection (usually the SCP)
    Acceptor,
}

/// The thirteen states of PS3.8 Table 9-10.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum State {
    /// idle, no transport connection
    Sta1,
    /// transport open, awaiting A-ASSOCIATE-RQ (acceptor)
    Sta2,
    /// awaiting local A-ASSOCIATE response (acceptor)
    Sta3,
    /// awaiting transport connection confirmation (requestor)
    Sta4,
    /// awaiting A-ASSOCIATE-AC or -RJ (requestor)
    Sta5,
    /// association established, data transfer permitted
    Sta6,
    /// awaiting A-RELEASE-RP (release requested locally)
    Sta7,
    /// awaiting local A-RELEASE response (release requested by peer)
    Sta8,
    /// release collision, requestor side; awaiting local release response
    Sta9,
    /// release collision, acceptor side; awaiting A-RELEASE-RP
    Sta10,
    /// release collision, requestor side; awaiting A-RELEASE-RP
    Sta11,
    /// release collision, acceptor side; awaiting local release response
    Sta12,
    /// awaiting transport close after an abort or final release
    Sta13,
}

/// An event fed to the state machine,
/// either a decoded PDU from the peer,
/// a transport notification,
/// or a downcall from the local service layer.
#[derive(Debug)]
pub enum Event {
    /// evt01: A-ASSOCIATE request from the local user
    ARequest,
    /// evt02: transport connection confirmed
    TransportConnected,
    /// evt03: A-ASSOCIATE-AC PDU received
    AAssociateAc(AssociationAC),
    /// evt04: A-ASSOCIATE-RJ PDU received
    AAssociateRj(AssociationRJ),
    /// evt06: A-ASSOCIATE-RQ PDU received
    AAssociateRq(AssociationRQ),
    /// evt07: association accepted by the local user,
    /// with the negotiated presentation context results
    LocalAccept(Vec<PresentationContextResult>),
    /// evt08: association rejected by the local user
    LocalReject(AssociationRJ),
    /// evt09: P-DATA request from the local user,
    /// one whole DIMSE message to be fragmented and sent
    PDataRequest {
        context_id: u8,
        command: Vec<u8>,
        data: Option<Vec<u8>>,
    },
    /// evt10: P-DATA-TF PDU received
    PDataTf(Vec<PDataValue>),
    /// evt11: A-RELEASE request from the local user
    ReleaseRequest,
    /// evt12: A-RELEASE-RQ PDU received
    AReleaseRq,
    /// evt13: A-RELEASE-RP PDU received
    AReleaseRp,
    /// evt14: A-RELEASE response from the local user
    LocalReleaseResponse,
    /// evt15: A-ABORT request from the local user
    AbortRequest,
    /// evt16: A-ABORT PDU received
    AAbort(AbortRQSource),
    /// evt17: transport connection closed by the peer
    TransportClosed,
    /// evt18: association or release timer expired
    TimerExpired,
    /// evt19: unrecognized or invalid PDU received,
    /// with the abort reason to report
    InvalidPdu(AbortRQServiceProviderReason),
}

/// A side effect requested by a transition,
/// interpreted by the association task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// open the transport connection to the peer (AE-1)
    ConnectTransport,
    /// send the A-ASSOCIATE-RQ built from the association options (AE-2)
    SendAssociateRq,
    /// run negotiation over the A-ASSOCIATE-RQ in the event
    /// and respond with a local accept/reject event (AE-6)
    AssociateIndication,
    /// send an A-ASSOCIATE-AC carrying the results in the event (AE-7)
    SendAssociateAc,
    /// send the A-ASSOCIATE-RJ carried in the event (AE-8)
    SendAssociateRj,
    /// fragment the P-DATA request in the event and send it (DT-1)
    SendPData,
    /// feed the received PDVs to the command assembler (DT-2)
    CollectPData,
    /// send an A-RELEASE-RQ (AR-1)
    SendReleaseRq,
    /// report the peer's release request to the local service,
    /// which answers with a local release response (AR-2/AR-8)
    ReleaseIndication,
    /// send an A-RELEASE-RP (AR-4/AR-9)
    SendReleaseRp,
    /// send an A-ABORT with the given source (AA-1/AA-8)
    SendAbort(AbortRQSource),
    /// close the transport connection
    CloseTransport,
    /// emit the `Established` upcall (AE-3/AE-7)
    NotifyEstablished,
    /// emit the `Rejected` upcall (AE-4/AE-8)
    NotifyRejected,
    /// emit the `Released` upcall (AR-3/AR-4)
    NotifyReleased,
    /// emit the `Aborted` upcall (AA-2/AA-3/AA-4)
    NotifyAborted,
}

/// The outcome of one transition.
#[derive(Debug)]
pub struct Transition {
    pub next: State,
    pub actions: Vec<Action>,
}

fn to(next: State, actions: Vec<Action>) -> Transition {
    Transition { next, actions }
}

/// The reaction to an event with no entry in the table:
/// abort the association (AA-8),
/// except where there is no peer to notify.
fn unexpected(state: State, event: &Event) -> Transition {
    let reason = match event {
        Event::InvalidPdu(reason) => *reason,
        _ => AbortRQServiceProviderReason::UnexpectedPdu,
    };
    match state {
        State::Sta1 => to(State::Sta1, vec![]),
        State::Sta4 => to(
            State::Sta1,
            vec![Action::CloseTransport, Action::NotifyAborted],
        ),
        State::Sta13 => to(State::Sta13, vec![]),
        _ => to(
            State::Sta13,
            vec![
                Action::SendAbort(AbortRQSource::ServiceProvider(reason)),
                Action::NotifyAborted,
            ],
        ),
    }
}

/// Compute the transition for one event.
///
/// The function is total: every event in every state produces
/// a well-defined next state, falling back to the abort reaction.
pub fn transition(role: Role, state: State, event: &Event) -> Transition {
    use Action::*;
    use State::*;

    match (state, event) {
        // association establishment, requestor side
        (Sta1, Event::ARequest) => to(Sta4, vec![ConnectTransport]),
        (Sta1, Event::TransportClosed) => to(Sta1, vec![]),
        (Sta4, Event::TransportConnected) => to(Sta5, vec![SendAssociateRq]),
        (Sta4, Event::TransportClosed) => to(Sta1, vec![NotifyAborted]),
        (Sta4, Event::AbortRequest) => to(Sta1, vec![CloseTransport, NotifyAborted]),
        (Sta5, Event::AAssociateAc(_)) => to(Sta6, vec![NotifyEstablished]),
        (Sta5, Event::AAssociateRj(_)) => to(Sta1, vec![NotifyRejected, CloseTransport]),

        // association establishment, acceptor side
        (Sta2, Event::AAssociateRq(_)) => to(Sta3, vec![AssociateIndication]),
        (Sta2, Event::AAbort(_)) => to(Sta1, vec![CloseTransport]),
        (Sta2, Event::TransportClosed) => to(Sta1, vec![]),
        (Sta2, Event::TimerExpired) => to(Sta1, vec![CloseTransport]),
        (Sta3, Event::LocalAccept(_)) => to(Sta6, vec![SendAssociateAc, NotifyEstablished]),
        (Sta3, Event::LocalReject(_)) => to(Sta13, vec![SendAssociateRj, NotifyRejected]),

        // data transfer
        (Sta6, Event::PDataRequest { .. }) => to(Sta6, vec![SendPData]),
        (Sta6, Event::PDataTf(_)) => to(Sta6, vec![CollectPData]),

        // orderly release
        (Sta6, Event::ReleaseRequest) => to(Sta7, vec![SendReleaseRq]),
        (Sta6, Event::AReleaseRq) => to(Sta8, vec![ReleaseIndication]),
        (Sta7, Event::PDataTf(_)) => to(Sta7, vec![CollectPData]),
        (Sta7, Event::AReleaseRp) => to(Sta1, vec![NotifyReleased, CloseTransport]),
        (Sta7, Event::AReleaseRq) => match role {
            // release collision (AR-8)
            Role::Requestor => to(Sta9, vec![ReleaseIndication]),
            Role::Acceptor => to(Sta10, vec![ReleaseIndication]),
        },
        (Sta8, Event::PDataRequest { .. }) => to(Sta8, vec![SendPData]),
        (Sta8, Event::LocalReleaseResponse) => to(Sta13, vec![SendReleaseRp, NotifyReleased]),
        (Sta9, Event::LocalReleaseResponse) => to(Sta11, vec![SendReleaseRp]),
        (Sta10, Event::AReleaseRp) => to(Sta12, vec![]),
        (Sta11, Event::AReleaseRp) => to(Sta1, vec![NotifyReleased, CloseTransport]),
        (Sta12, Event::LocalReleaseResponse) => to(Sta13, vec![SendReleaseRp, NotifyReleased]),

        // abort and teardown, any established-ish state
        (
            Sta2 | Sta3 | Sta5 | Sta6 | Sta7 | Sta8 | Sta9 | Sta10 | Sta11 | Sta12,
            Event::AbortRequest,
        ) => to(Sta13, vec![SendAbort(AbortRQSource::ServiceUser)]),
        (
            Sta3 | Sta5 | Sta6 | Sta7 | Sta8 | Sta9 | Sta10 | Sta11 | Sta12,
            Event::AAbort(_),
        ) => to(Sta1, vec![NotifyAborted, CloseTransport]),
        (
            Sta3 | Sta5 | Sta6 | Sta7 | Sta8 | Sta9 | Sta10 | Sta11 | Sta12,
            Event::TransportClosed,
        ) => to(Sta1, vec![NotifyAborted]),
        (
            Sta3 | Sta5 | Sta6 | Sta7 | Sta8 | Sta9 | Sta10 | Sta11 | Sta12,
            Event::TimerExpired,
        ) => to(Sta13, vec![SendAbort(AbortRQSource::ServiceUser)]),

        // lingering close
        (Sta13, Event::TransportClosed) => to(Sta1, vec![]),
        (Sta13, Event::TimerExpired) => to(Sta1, vec![CloseTransport]),
        (Sta13, _) => to(Sta13, vec![]),

        _ => unexpected(state, event),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::{AssociationRJResult, AssociationRJServiceUserReason, AssociationRJSource};

    fn sample_rj() -> AssociationRJ {
        AssociationRJ {
            result: AssociationRJResult::Permanent,
            source: AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::CalledAETitleNotRecognized,
            ),
        }
    }

    #[test]
    fn requestor_establishment_path() {
        let t = transition(Role::Requestor, State::Sta1, &Event::ARequest);
        assert_eq!(t.next, State::Sta4);
        assert_eq!(t.actions, vec![Action::ConnectTransport]);

        let t = transition(Role::Requestor, State::Sta4, &Event::TransportConnected);
        assert_eq!(t.next, State::Sta5);
        assert_eq!(t.actions, vec![Action::SendAssociateRq]);

        let ac = AssociationAC {
            protocol_version: 1,
            called_ae_title: String::new(),
            calling_ae_title: String::new(),
            application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
            presentation_contexts: vec![],
            user_variables: vec![],
        };
        let t = transition(Role::Requestor, State::Sta5, &Event::AAssociateAc(ac));
        assert_eq!(t.next, State::Sta6);
        assert_eq!(t.actions, vec![Action::NotifyEstablished]);
    }

    #[test]
    fn requestor_rejection_closes() {
        let t = transition(
            Role::Requestor,
            State::Sta5,
            &Event::AAssociateRj(sample_rj()),
        );
        assert_eq!(t.next, State::Sta1);
        assert_eq!(
            t.actions,
            vec![Action::NotifyRejected, Action::CloseTransport]
        );
    }

    #[test]
    fn release_exchange() {
        let t = transition(Role::Requestor, State::Sta6, &Event::ReleaseRequest);
        assert_eq!(t.next, State::Sta7);
        assert_eq!(t.actions, vec![Action::SendReleaseRq]);

        let t = transition(Role::Requestor, State::Sta7, &Event::AReleaseRp);
        assert_eq!(t.next, State::Sta1);
        assert_eq!(
            t.actions,
            vec![Action::NotifyReleased, Action::CloseTransport]
        );

        let t = transition(Role::Acceptor, State::Sta6, &Event::AReleaseRq);
        assert_eq!(t.next, State::Sta8);
        let t = transition(Role::Acceptor, State::Sta8, &Event::LocalReleaseResponse);
        assert_eq!(t.next, State::Sta13);
        assert_eq!(
            t.actions,
            vec![Action::SendReleaseRp, Action::NotifyReleased]
        );
        let t = transition(Role::Acceptor, State::Sta13, &Event::TransportClosed);
        assert_eq!(t.next, State::Sta1);
        assert!(t.actions.is_empty());
    }

    #[test]
    fn release_collision_drains_to_sta1() {
        // requestor side
        let t = transition(Role::Requestor, State::Sta7, &Event::AReleaseRq);
        assert_eq!(t.next, State::Sta9);
        let t = transition(Role::Requestor, State::Sta9, &Event::LocalReleaseResponse);
        assert_eq!(t.next, State::Sta11);
        assert_eq!(t.actions, vec![Action::SendReleaseRp]);
        let t = transition(Role::Requestor, State::Sta11, &Event::AReleaseRp);
        assert_eq!(t.next, State::Sta1);

        // acceptor side
        let t = transition(Role::Acceptor, State::Sta7, &Event::AReleaseRq);
        assert_eq!(t.next, State::Sta10);
        let t = transition(Role::Acceptor, State::Sta10, &Event::AReleaseRp);
        assert_eq!(t.next, State::Sta12);
        let t = transition(Role::Acceptor, State::Sta12, &Event::LocalReleaseResponse);
        assert_eq!(t.next, State::Sta13);
    }

    #[test]
    fn data_transfer_stays_in_sta6() {
        let t = transition(
            Role::Acceptor,
            State::Sta6,
            &Event::PDataRequest {
                context_id: 1,
                command: vec![0; 8],
                data: None,
            },
        );
        assert_eq!(t.next, State::Sta6);
        assert_eq!(t.actions, vec![Action::SendPData]);

        let t = transition(Role::Acceptor, State::Sta6, &Event::PDataTf(vec![]));
        assert_eq!(t.next, State::Sta6);
        assert_eq!(t.actions, vec![Action::CollectPData]);
    }

    #[test]
    fn unexpected_pdu_aborts() {
        // an A-RELEASE-RP out of nowhere
        let t = transition(Role::Acceptor, State::Sta6, &Event::AReleaseRp);
        assert_eq!(t.next, State::Sta13);
        assert_eq!(
            t.actions,
            vec![
                Action::SendAbort(AbortRQSource::ServiceProvider(
                    AbortRQServiceProviderReason::UnexpectedPdu
                )),
                Action::NotifyAborted,
            ]
        );

        // and the close completes the teardown
        let t = transition(Role::Acceptor, State::Sta13, &Event::TransportClosed);
        assert_eq!(t.next, State::Sta1);
    }

    #[test]
    fn invalid_pdu_reports_given_reason() {
        let t = transition(
            Role::Acceptor,
            State::Sta6,
            &Event::InvalidPdu(AbortRQServiceProviderReason::InvalidPduParameter),
        );
        assert_eq!(t.next, State::Sta13);
        assert_eq!(
            t.actions[0],
            Action::SendAbort(AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::InvalidPduParameter
            ))
        );
    }

    #[test]
    fn abort_is_terminal_from_every_state() {
        for state in [
            State::Sta2,
            State::Sta3,
            State::Sta5,
            State::Sta6,
            State::Sta7,
            State::Sta8,
            State::Sta9,
            State::Sta10,
            State::Sta11,
            State::Sta12,
        ] {
            let t = transition(Role::Acceptor, state, &Event::AbortRequest);
            assert_eq!(t.next, State::Sta13, "from {:?}", state);
            let t = transition(
                Role::Acceptor,
                state,
                &Event::AAbort(AbortRQSource::ServiceUser),
            );
            assert_eq!(t.next, State::Sta1, "peer abort from {:?}", state);
        }
    }

    #[test]
    fn no_transition_leaves_the_state_space() {
        // sweep a representative set of events through every state;
        // each must produce a valid transition (totality)
        let states = [
            State::Sta1,
            State::Sta2,
            State::Sta3,
            State::Sta4,
            State::Sta5,
            State::Sta6,
            State::Sta7,
            State::Sta8,
            State::Sta9,
            State::Sta10,
            State::Sta11,
            State::Sta12,
            State::Sta13,
        ];
        for state in states {
            for event in [
                Event::ARequest,
                Event::TransportConnected,
                Event::ReleaseRequest,
                Event::AReleaseRq,
                Event::AReleaseRp,
                Event::LocalReleaseResponse,
                Event::AbortRequest,
                Event::TransportClosed,
                Event::TimerExpired,
                Event::InvalidPdu(AbortRQServiceProviderReason::UnexpectedPdu),
            ] {
                let t = transition(Role::Requestor, state, &event);
                assert!(states.contains(&t.next));
            }
        }
    }
}
