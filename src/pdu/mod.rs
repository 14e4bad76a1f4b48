//! Protocol data unit types of the DICOM upper layer (PS3.8 §9.3).
//!
//! The variants of [`Pdu`] map one to one to the PDU types of the standard.
//! Reading and writing are provided by the [`reader`] and [`writer`]
//! submodules.

pub mod reader;
pub mod writer;

#[cfg(test)]
mod test;

pub use reader::{read_pdu, ReadError};
pub use writer::{write_pdu, WriteError};

/// The default maximum PDU size accepted by this implementation,
/// in bytes (4 MiB).
pub const DEFAULT_MAX_PDU: u32 = 4 << 20;

/// The minimum PDU size required by this implementation, in bytes.
pub const MINIMUM_PDU_SIZE: u32 = 4_096;

/// The number of bytes of a P-DATA-TF PDU
/// which do not contribute to the PDV payload:
/// PDU type, reserved byte, PDU length (4),
/// PDV item length (4), context ID, message control header.
pub const PDU_HEADER_SIZE: u32 = 12;

/// A presentation context as proposed in an A-ASSOCIATE-RQ:
/// one abstract syntax with one or more candidate transfer syntaxes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentationContextProposed {
    /// the presentation context identifier, an odd integer in 1..=255
    pub id: u8,
    /// the abstract syntax (SOP class) UID
    pub abstract_syntax: String,
    /// the transfer syntax UIDs proposed for this context,
    /// in order of preference
    pub transfer_syntaxes: Vec<String>,
}

/// The outcome of one presentation context negotiation
/// as carried in an A-ASSOCIATE-AC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentationContextResult {
    /// the presentation context identifier
    pub id: u8,
    /// whether the context was accepted, and if not, why
    pub reason: PresentationContextResultReason,
    /// the transfer syntax selected by the acceptor
    /// (not significant unless accepted)
    pub transfer_syntax: String,
}

/// The reason field of a presentation context result (PS3.8 §9.3.3.2).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PresentationContextResultReason {
    Acceptance = 0,
    UserRejection = 1,
    NoReason = 2,
    AbstractSyntaxNotSupported = 3,
    TransferSyntaxesNotSupported = 4,
}

impl PresentationContextResultReason {
    fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(PresentationContextResultReason::Acceptance),
            1 => Some(PresentationContextResultReason::UserRejection),
            2 => Some(PresentationContextResultReason::NoReason),
            3 => Some(PresentationContextResultReason::AbstractSyntaxNotSupported),
            4 => Some(PresentationContextResultReason::TransferSyntaxesNotSupported),
            _ => None,
        }
    }
}

/// The result field of an A-ASSOCIATE-RJ.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AssociationRJResult {
    Permanent = 1,
    Transient = 2,
}

impl AssociationRJResult {
    fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(AssociationRJResult::Permanent),
            2 => Some(AssociationRJResult::Transient),
            _ => None,
        }
    }
}

/// The source and reason of an A-ASSOCIATE-RJ (PS3.8 §9.3.4).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AssociationRJSource {
    ServiceUser(AssociationRJServiceUserReason),
    ServiceProviderAcse(AssociationRJServiceProviderAcseReason),
    ServiceProviderPresentation(AssociationRJServiceProviderPresentationReason),
}

impl AssociationRJSource {
    fn from_codes(source: u8, reason: u8) -> Option<Self> {
        match (source, reason) {
            (1, 1) => Some(AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::NoReasonGiven,
            )),
            (1, 2) => Some(AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::ApplicationContextNameNotSupported,
            )),
            (1, 3) => Some(AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::CallingAETitleNotRecognized,
            )),
            (1, 7) => Some(AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::CalledAETitleNotRecognized,
            )),
            (1, reason) if reason < 11 => Some(AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::Reserved(reason),
            )),
            (2, 1) => Some(AssociationRJSource::ServiceProviderAcse(
                AssociationRJServiceProviderAcseReason::NoReasonGiven,
            )),
            (2, 2) => Some(AssociationRJSource::ServiceProviderAcse(
                AssociationRJServiceProviderAcseReason::ProtocolVersionNotSupported,
            )),
            (3, 1) => Some(AssociationRJSource::ServiceProviderPresentation(
                AssociationRJServiceProviderPresentationReason::TemporaryCongestion,
            )),
            (3, 2) => Some(AssociationRJSource::ServiceProviderPresentation(
                AssociationRJServiceProviderPresentationReason::LocalLimitExceeded,
            )),
            (3, reason) if reason < 8 => Some(AssociationRJSource::ServiceProviderPresentation(
                AssociationRJServiceProviderPresentationReason::Reserved(reason),
            )),
            _ => None,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AssociationRJServiceUserReason {
    NoReasonGiven,
    ApplicationContextNameNotSupported,
    CallingAETitleNotRecognized,
    CalledAETitleNotRecognized,
    Reserved(u8),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AssociationRJServiceProviderAcseReason {
    NoReasonGiven,
    ProtocolVersionNotSupported,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AssociationRJServiceProviderPresentationReason {
    TemporaryCongestion,
    LocalLimitExceeded,
    Reserved(u8),
}

/// A presentation data value item within a P-DATA-TF PDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PDataValue {
    /// the context under which the fragment travels
    pub presentation_context_id: u8,
    /// whether the fragment is command or data set bytes
    pub value_type: PDataValueType,
    /// whether this is the last fragment of its kind for the message
    pub is_last: bool,
    /// the fragment payload
    pub data: Vec<u8>,
}

/// The kind of payload carried by a [`PDataValue`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PDataValueType {
    Command,
    Data,
}

/// The source field of an A-ABORT (PS3.8 §9.3.8).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AbortRQSource {
    ServiceUser,
    ServiceProvider(AbortRQServiceProviderReason),
    Reserved,
}

impl AbortRQSource {
    fn from_codes(source: u8, reason: u8) -> Option<Self> {
        match (source, reason) {
            (0, _) => Some(AbortRQSource::ServiceUser),
            (1, _) => Some(AbortRQSource::Reserved),
            (2, 0) | (2, 1) => Some(AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::ReasonNotSpecifiedUnrecognizedPdu,
            )),
            (2, 2) => Some(AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::UnexpectedPdu,
            )),
            (2, 3) => Some(AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::Reserved,
            )),
            (2, 4) => Some(AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::UnrecognizedPduParameter,
            )),
            (2, 5) => Some(AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::UnexpectedPduParameter,
            )),
            (2, 6) => Some(AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::InvalidPduParameter,
            )),
            _ => None,
        }
    }
}

/// The reason field of a service-provider initiated A-ABORT
/// (PS3.8 Table 9-26).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AbortRQServiceProviderReason {
    ReasonNotSpecifiedUnrecognizedPdu,
    UnexpectedPdu,
    Reserved,
    UnrecognizedPduParameter,
    UnexpectedPduParameter,
    InvalidPduParameter,
}

/// A sub-item of the user information item (PS3.8 §D.3.3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserVariableItem {
    /// maximum length receivable by the sender of this item (0x51)
    MaxLength(u32),
    /// implementation class UID (0x52)
    ImplementationClassUID(String),
    /// implementation version name (0x55)
    ImplementationVersionName(String),
    /// asynchronous operations window:
    /// maximum number invoked, maximum number performed (0x53)
    AsyncOperations(u16, u16),
    /// SCP/SCU role selection for one SOP class (0x54)
    RoleSelection {
        sop_class_uid: String,
        scu_role: u8,
        scp_role: u8,
    },
    /// an unrecognized sub-item, kept verbatim
    Unknown(u8, Vec<u8>),
}

/// An A-ASSOCIATE-RQ PDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociationRQ {
    pub protocol_version: u16,
    pub called_ae_title: String,
    pub calling_ae_title: String,
    pub application_context_name: String,
    pub presentation_contexts: Vec<PresentationContextProposed>,
    pub user_variables: Vec<UserVariableItem>,
}

/// An A-ASSOCIATE-AC PDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociationAC {
    pub protocol_version: u16,
    /// mirrored from the request; not significant on receipt
    pub called_ae_title: String,
    /// mirrored from the request; not significant on receipt
    pub calling_ae_title: String,
    pub application_context_name: String,
    pub presentation_contexts: Vec<PresentationContextResult>,
    pub user_variables: Vec<UserVariableItem>,
}

/// An A-ASSOCIATE-RJ PDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociationRJ {
    pub result: AssociationRJResult,
    pub source: AssociationRJSource,
}

/// A DICOM upper layer protocol data unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pdu {
    AssociationRQ(AssociationRQ),
    AssociationAC(AssociationAC),
    AssociationRJ(AssociationRJ),
    PData { data: Vec<PDataValue> },
    ReleaseRQ,
    ReleaseRP,
    AbortRQ { source: AbortRQSource },
    Unknown { pdu_type: u8, data: Vec<u8> },
}

impl Pdu {
    /// A short description of the PDU, suitable for one-line logging.
    pub fn short_description(&self) -> std::borrow::Cow<'static, str> {
        match self {
            Pdu::AssociationRQ(AssociationRQ {
                calling_ae_title, ..
            }) => format!("A-ASSOCIATE-RQ from {}", calling_ae_title).into(),
            Pdu::AssociationAC { .. } => "A-ASSOCIATE-AC".into(),
            Pdu::AssociationRJ { .. } => "A-ASSOCIATE-RJ".into(),
            Pdu::PData { data } => format!(
                "P-DATA-TF ({} PDV, {} bytes)",
                data.len(),
                data.iter().map(|pdv| pdv.data.len()).sum::<usize>()
            )
            .into(),
            Pdu::ReleaseRQ => "A-RELEASE-RQ".into(),
            Pdu::ReleaseRP => "A-RELEASE-RP".into(),
            Pdu::AbortRQ { .. } => "A-ABORT".into(),
            Pdu::Unknown { pdu_type, .. } => format!("Unknown PDU type {:#04x}", pdu_type).into(),
        }
    }
}
