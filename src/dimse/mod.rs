//! DIMSE-C message types and their codec (PS3.7 §9).
//!
//! Commands travel as data sets of group 0000 elements,
//! always in Implicit VR Little Endian,
//! led by a *CommandGroupLength* element
//! carrying the exact byte length of the rest of the command.
//! The [`Command`] enum covers the composite services
//! (C-ECHO, C-STORE, C-FIND, C-MOVE, C-GET),
//! with encoding and decoding delegated to the dataset codec
//! of `dicom-object`.

pub mod assembler;

use bon::Builder;
use dicom_core::{dicom_value, DataElement, PrimitiveValue, VR};
use dicom_dictionary_std::tags;
use dicom_object::{InMemDicomObject, StandardDataDictionary};
use dicom_transfer_syntax_registry::entries;
use snafu::{OptionExt, ResultExt, Snafu};

use crate::context::VERIFICATION_SOP_CLASS;

/// Value of *CommandDataSetType* (0000,0800) stating that
/// no data set follows the command.
pub const COMMAND_DATA_SET_TYPE_NULL: u16 = 0x0101;

/// Value of *CommandDataSetType* (0000,0800) stating that
/// a data set follows the command.
pub const COMMAND_DATA_SET_TYPE_NON_NULL: u16 = 0x0001;

/// The *CommandField* (0000,0100) values of the composite services.
pub mod command_field {
    pub const C_STORE_RQ: u16 = 0x0001;
    pub const C_STORE_RSP: u16 = 0x8001;
    pub const C_GET_RQ: u16 = 0x0010;
    pub const C_GET_RSP: u16 = 0x8010;
    pub const C_FIND_RQ: u16 = 0x0020;
    pub const C_FIND_RSP: u16 = 0x8020;
    pub const C_MOVE_RQ: u16 = 0x0021;
    pub const C_MOVE_RSP: u16 = 0x8021;
    pub const C_ECHO_RQ: u16 = 0x0030;
    pub const C_ECHO_RSP: u16 = 0x8030;
}

/// The priority field of request messages.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Priority {
    Low = 0x0002,
    #[default]
    Medium = 0x0000,
    High = 0x0001,
}

impl Priority {
    fn from_code(code: u16) -> Option<Self> {
        match code {
            0x0000 => Some(Priority::Medium),
            0x0001 => Some(Priority::High),
            0x0002 => Some(Priority::Low),
            _ => None,
        }
    }
}

/// A DIMSE status value, with the optional error comment
/// that may accompany any non-Success status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub code: u16,
    pub error_comment: Option<String>,
}

impl Status {
    pub const SUCCESS: u16 = 0x0000;
    pub const CANCEL: u16 = 0xFE00;
    /// pending, with a data set in the response
    pub const PENDING: u16 = 0xFF00;
    /// pending, without a data set
    pub const PENDING_NO_DATA_SET: u16 = 0xFF01;
    pub const UNRECOGNIZED_OPERATION: u16 = 0x0211;
    pub const REFUSED_OUT_OF_RESOURCES: u16 = 0xA700;
    pub const REFUSED_UNABLE_TO_CALCULATE_MATCHES: u16 = 0xA701;
    pub const REFUSED_UNABLE_TO_PERFORM_SUBOPERATIONS: u16 = 0xA702;
    pub const REFUSED_MOVE_DESTINATION_UNKNOWN: u16 = 0xA801;
    pub const DATA_SET_DOES_NOT_MATCH_SOP_CLASS: u16 = 0xA900;
    pub const CANNOT_UNDERSTAND: u16 = 0xC000;

    pub fn new(code: u16) -> Self {
        Status {
            code,
            error_comment: None,
        }
    }

    pub fn success() -> Self {
        Status::new(Status::SUCCESS)
    }

    pub fn pending() -> Self {
        Status::new(Status::PENDING)
    }

    /// A non-Success status with an error comment,
    /// clipped to the 64 characters admitted by the LO value representation.
    pub fn with_comment(code: u16, comment: impl Into<String>) -> Self {
        let mut comment = comment.into();
        comment.truncate(64);
        Status {
            code,
            error_comment: Some(comment),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == Status::SUCCESS
    }

    pub fn is_pending(&self) -> bool {
        self.code == Status::PENDING || self.code == Status::PENDING_NO_DATA_SET
    }
}

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum EncodeError {
    #[snafu(display("could not encode DIMSE command data set: {}", source))]
    WriteDataSet {
        #[snafu(source(from(dicom_object::WriteError, Box::new)))]
        source: Box<dicom_object::WriteError>,
    },
}

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum DecodeError {
    #[snafu(display("could not read DIMSE command data set: {}", source))]
    ReadDataSet {
        #[snafu(source(from(dicom_object::ReadError, Box::new)))]
        source: Box<dicom_object::ReadError>,
    },

    #[snafu(display("missing required command element {}", name))]
    MissingField { name: &'static str },

    #[snafu(display("invalid value in command element {}: {}", name, source))]
    ConvertValue {
        name: &'static str,
        source: dicom_core::value::ConvertValueError,
    },

    #[snafu(display("unknown DIMSE command field {:#06x}", value))]
    UnknownCommandField { value: u16 },

    #[snafu(display("unknown priority value {:#06x}", value))]
    UnknownPriority { value: u16 },
}

/// C-ECHO-RQ (PS3.7 §9.3.5.1).
#[derive(Debug, Clone, PartialEq, Builder)]
#[builder(on(String, into))]
pub struct CEchoRq {
    #[builder(default = VERIFICATION_SOP_CLASS.to_string())]
    pub affected_sop_class_uid: String,
    pub message_id: u16,
}

/// C-ECHO-RSP (PS3.7 §9.3.5.2).
#[derive(Debug, Clone, PartialEq, Builder)]
#[builder(on(String, into))]
pub struct CEchoRsp {
    #[builder(default = VERIFICATION_SOP_CLASS.to_string())]
    pub affected_sop_class_uid: String,
    pub message_id_being_responded_to: u16,
    #[builder(default = Status::success())]
    pub status: Status,
}

/// C-STORE-RQ (PS3.7 §9.3.1.1).
#[derive(Debug, Clone, PartialEq, Builder)]
#[builder(on(String, into))]
pub struct CStoreRq {
    pub affected_sop_class_uid: String,
    pub message_id: u16,
    #[builder(default)]
    pub priority: Priority,
    #[builder(default = COMMAND_DATA_SET_TYPE_NON_NULL)]
    pub command_data_set_type: u16,
    pub affected_sop_instance_uid: String,
    /// AE title of the C-MOVE originator, for sub-operations (0000,1030)
    pub move_originator_ae_title: Option<String>,
    /// message ID of the originating C-MOVE-RQ (0000,1031)
    pub move_originator_message_id: Option<u16>,
}

/// C-STORE-RSP (PS3.7 §9.3.1.2).
#[derive(Debug, Clone, PartialEq, Builder)]
#[builder(on(String, into))]
pub struct CStoreRsp {
    pub affected_sop_class_uid: String,
    pub message_id_being_responded_to: u16,
    pub affected_sop_instance_uid: String,
    pub status: Status,
}

/// C-FIND-RQ (PS3.7 §9.3.2.1).
#[derive(Debug, Clone, PartialEq, Builder)]
#[builder(on(String, into))]
pub struct CFindRq {
    pub affected_sop_class_uid: String,
    pub message_id: u16,
    #[builder(default)]
    pub priority: Priority,
    #[builder(default = COMMAND_DATA_SET_TYPE_NON_NULL)]
    pub command_data_set_type: u16,
}

/// C-FIND-RSP (PS3.7 §9.3.2.2).
#[derive(Debug, Clone, PartialEq, Builder)]
#[builder(on(String, into))]
pub struct CFindRsp {
    pub affected_sop_class_uid: String,
    pub message_id_being_responded_to: u16,
    #[builder(default = COMMAND_DATA_SET_TYPE_NULL)]
    pub command_data_set_type: u16,
    pub status: Status,
}

/// C-MOVE-RQ (PS3.7 §9.3.4.1).
#[derive(Debug, Clone, PartialEq, Builder)]
#[builder(on(String, into))]
pub struct CMoveRq {
    pub affected_sop_class_uid: String,
    pub message_id: u16,
    #[builder(default)]
    pub priority: Priority,
    #[builder(default = COMMAND_DATA_SET_TYPE_NON_NULL)]
    pub command_data_set_type: u16,
    pub move_destination: String,
}

/// C-MOVE-RSP (PS3.7 §9.3.4.2).
#[derive(Debug, Clone, PartialEq, Builder)]
#[builder(on(String, into))]
pub struct CMoveRsp {
    pub affected_sop_class_uid: String,
    pub message_id_being_responded_to: u16,
    #[builder(default = COMMAND_DATA_SET_TYPE_NULL)]
    pub command_data_set_type: u16,
    pub status: Status,
    pub number_of_remaining_suboperations: Option<u16>,
    pub number_of_completed_suboperations: Option<u16>,
    pub number_of_failed_suboperations: Option<u16>,
    pub number_of_warning_suboperations: Option<u16>,
}

/// C-GET-RQ (PS3.7 §9.3.3.1).
#[derive(Debug, Clone, PartialEq, Builder)]
#[builder(on(String, into))]
pub struct CGetRq {
    pub affected_sop_class_uid: String,
    pub message_id: u16,
    #[builder(default)]
    pub priority: Priority,
    #[builder(default = COMMAND_DATA_SET_TYPE_NON_NULL)]
    pub command_data_set_type: u16,
}

/// C-GET-RSP (PS3.7 §9.3.3.2).
#[derive(Debug, Clone, PartialEq, Builder)]
#[builder(on(String, into))]
pub struct CGetRsp {
    pub affected_sop_class_uid: String,
    pub message_id_being_responded_to: u16,
    #[builder(default = COMMAND_DATA_SET_TYPE_NULL)]
    pub command_data_set_type: u16,
    pub status: Status,
    pub number_of_remaining_suboperations: Option<u16>,
    pub number_of_completed_suboperations: Option<u16>,
    pub number_of_failed_suboperations: Option<u16>,
    pub number_of_warning_suboperations: Option<u16>,
}

/// A decoded DIMSE-C message.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    CEchoRq(CEchoRq),
    CEchoRsp(CEchoRsp),
    CStoreRq(CStoreRq),
    CStoreRsp(CStoreRsp),
    CFindRq(CFindRq),
    CFindRsp(CFindRsp),
    CMoveRq(CMoveRq),
    CMoveRsp(CMoveRsp),
    CGetRq(CGetRq),
    CGetRsp(CGetRsp),
}

impl Command {
    /// The *CommandField* value of this message.
    pub fn command_field(&self) -> u16 {
        match self {
            Command::CEchoRq(_) => command_field::C_ECHO_RQ,
            Command::CEchoRsp(_) => command_field::C_ECHO_RSP,
            Command::CStoreRq(_) => command_field::C_STORE_RQ,
            Command::CStoreRsp(_) => command_field::C_STORE_RSP,
            Command::CFindRq(_) => command_field::C_FIND_RQ,
            Command::CFindRsp(_) => command_field::C_FIND_RSP,
            Command::CMoveRq(_) => command_field::C_MOVE_RQ,
            Command::CMoveRsp(_) => command_field::C_MOVE_RSP,
            Command::CGetRq(_) => command_field::C_GET_RQ,
            Command::CGetRsp(_) => command_field::C_GET_RSP,
        }
    }

    /// Whether this is a request message.
    pub fn is_request(&self) -> bool {
        self.command_field() & 0x8000 == 0
    }

    /// Whether a data set follows the command.
    pub fn has_data(&self) -> bool {
        self.command_data_set_type() != COMMAND_DATA_SET_TYPE_NULL
    }

    /// The *CommandDataSetType* value of this message.
    pub fn command_data_set_type(&self) -> u16 {
        match self {
            Command::CEchoRq(_) | Command::CEchoRsp(_) | Command::CStoreRsp(_) => {
                COMMAND_DATA_SET_TYPE_NULL
            }
            Command::CStoreRq(v) => v.command_data_set_type,
            Command::CFindRq(v) => v.command_data_set_type,
            Command::CFindRsp(v) => v.command_data_set_type,
            Command::CMoveRq(v) => v.command_data_set_type,
            Command::CMoveRsp(v) => v.command_data_set_type,
            Command::CGetRq(v) => v.command_data_set_type,
            Command::CGetRsp(v) => v.command_data_set_type,
        }
    }

    /// The message ID, on request messages.
    pub fn message_id(&self) -> Option<u16> {
        match self {
            Command::CEchoRq(v) => Some(v.message_id),
            Command::CStoreRq(v) => Some(v.message_id),
            Command::CFindRq(v) => Some(v.message_id),
            Command::CMoveRq(v) => Some(v.message_id),
            Command::CGetRq(v) => Some(v.message_id),
            _ => None,
        }
    }

    /// The message ID being responded to, on response messages.
    pub fn message_id_being_responded_to(&self) -> Option<u16> {
        match self {
            Command::CEchoRsp(v) => Some(v.message_id_being_responded_to),
            Command::CStoreRsp(v) => Some(v.message_id_being_responded_to),
            Command::CFindRsp(v) => Some(v.message_id_being_responded_to),
            Command::CMoveRsp(v) => Some(v.message_id_being_responded_to),
            Command::CGetRsp(v) => Some(v.message_id_being_responded_to),
            _ => None,
        }
    }

    /// The affected SOP class UID of the message.
    pub fn affected_sop_class_uid(&self) -> &str {
        match self {
            Command::CEchoRq(v) => &v.affected_sop_class_uid,
            Command::CEchoRsp(v) => &v.affected_sop_class_uid,
            Command::CStoreRq(v) => &v.affected_sop_class_uid,
            Command::CStoreRsp(v) => &v.affected_sop_class_uid,
            Command::CFindRq(v) => &v.affected_sop_class_uid,
            Command::CFindRsp(v) => &v.affected_sop_class_uid,
            Command::CMoveRq(v) => &v.affected_sop_class_uid,
            Command::CMoveRsp(v) => &v.affected_sop_class_uid,
            Command::CGetRq(v) => &v.affected_sop_class_uid,
            Command::CGetRsp(v) => &v.affected_sop_class_uid,
        }
    }

    /// The status of a response message.
    pub fn status(&self) -> Option<&Status> {
        match self {
            Command::CEchoRsp(v) => Some(&v.status),
            Command::CStoreRsp(v) => Some(&v.status),
            Command::CFindRsp(v) => Some(&v.status),
            Command::CMoveRsp(v) => Some(&v.status),
            Command::CGetRsp(v) => Some(&v.status),
            _ => None,
        }
    }

    /// Encode this message as a group 0000 data set in
    /// Implicit VR Little Endian,
    /// with the *CommandGroupLength* element in front.
    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        let mut obj = InMemDicomObject::new_empty();
        obj.put(DataElement::new(
            tags::COMMAND_FIELD,
            VR::US,
            dicom_value!(U16, [self.command_field()]),
        ));
        obj.put(DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [self.command_data_set_type()]),
        ));

        match self {
            Command::CEchoRq(v) => {
                put_uid(&mut obj, tags::AFFECTED_SOP_CLASS_UID, &v.affected_sop_class_uid);
                put_u16(&mut obj, tags::MESSAGE_ID, v.message_id);
            }
            Command::CEchoRsp(v) => {
                put_uid(&mut obj, tags::AFFECTED_SOP_CLASS_UID, &v.affected_sop_class_uid);
                put_u16(
                    &mut obj,
                    tags::MESSAGE_ID_BEING_RESPONDED_TO,
                    v.message_id_being_responded_to,
                );
                put_status(&mut obj, &v.status);
            }
            Command::CStoreRq(v) => {
                put_uid(&mut obj, tags::AFFECTED_SOP_CLASS_UID, &v.affected_sop_class_uid);
                put_u16(&mut obj, tags::MESSAGE_ID, v.message_id);
                put_u16(&mut obj, tags::PRIORITY, v.priority as u16);
                put_uid(
                    &mut obj,
                    tags::AFFECTED_SOP_INSTANCE_UID,
                    &v.affected_sop_instance_uid,
                );
                if let Some(ae_title) = &v.move_originator_ae_title {
                    obj.put(DataElement::new(
                        tags::MOVE_ORIGINATOR_APPLICATION_ENTITY_TITLE,
                        VR::AE,
                        dicom_value!(Str, ae_title.as_str()),
                    ));
                }
                if let Some(id) = v.move_originator_message_id {
                    put_u16(&mut obj, tags::MOVE_ORIGINATOR_MESSAGE_ID, id);
                }
            }
            Command::CStoreRsp(v) => {
                put_uid(&mut obj, tags::AFFECTED_SOP_CLASS_UID, &v.affected_sop_class_uid);
                put_u16(
                    &mut obj,
                    tags::MESSAGE_ID_BEING_RESPONDED_TO,
                    v.message_id_being_responded_to,
                );
                put_uid(
                    &mut obj,
                    tags::AFFECTED_SOP_INSTANCE_UID,
                    &v.affected_sop_instance_uid,
                );
                put_status(&mut obj, &v.status);
            }
            Command::CFindRq(v) => {
                put_uid(&mut obj, tags::AFFECTED_SOP_CLASS_UID, &v.affected_sop_class_uid);
                put_u16(&mut obj, tags::MESSAGE_ID, v.message_id);
                put_u16(&mut obj, tags::PRIORITY, v.priority as u16);
            }
            Command::CFindRsp(v) => {
                put_uid(&mut obj, tags::AFFECTED_SOP_CLASS_UID, &v.affected_sop_class_uid);
                put_u16(
                    &mut obj,
                    tags::MESSAGE_ID_BEING_RESPONDED_TO,
                    v.message_id_being_responded_to,
                );
                put_status(&mut obj, &v.status);
            }
            Command::CMoveRq(v) => {
                put_uid(&mut obj, tags::AFFECTED_SOP_CLASS_UID, &v.affected_sop_class_uid);
                put_u16(&mut obj, tags::MESSAGE_ID, v.message_id);
                put_u16(&mut obj, tags::PRIORITY, v.priority as u16);
                obj.put(DataElement::new(
                    tags::MOVE_DESTINATION,
                    VR::AE,
                    dicom_value!(Str, v.move_destination.as_str()),
                ));
            }
            Command::CMoveRsp(v) => {
                put_uid(&mut obj, tags::AFFECTED_SOP_CLASS_UID, &v.affected_sop_class_uid);
                put_u16(
                    &mut obj,
                    tags::MESSAGE_ID_BEING_RESPONDED_TO,
                    v.message_id_being_responded_to,
                );
                put_status(&mut obj, &v.status);
                put_suboperation_counters(
                    &mut obj,
                    v.number_of_remaining_suboperations,
                    v.number_of_completed_suboperations,
                    v.number_of_failed_suboperations,
                    v.number_of_warning_suboperations,
                );
            }
            Command::CGetRq(v) => {
                put_uid(&mut obj, tags::AFFECTED_SOP_CLASS_UID, &v.affected_sop_class_uid);
                put_u16(&mut obj, tags::MESSAGE_ID, v.message_id);
                put_u16(&mut obj, tags::PRIORITY, v.priority as u16);
            }
            Command::CGetRsp(v) => {
                put_uid(&mut obj, tags::AFFECTED_SOP_CLASS_UID, &v.affected_sop_class_uid);
                put_u16(
                    &mut obj,
                    tags::MESSAGE_ID_BEING_RESPONDED_TO,
                    v.message_id_being_responded_to,
                );
                put_status(&mut obj, &v.status);
                put_suboperation_counters(
                    &mut obj,
                    v.number_of_remaining_suboperations,
                    v.number_of_completed_suboperations,
                    v.number_of_failed_suboperations,
                    v.number_of_warning_suboperations,
                );
            }
        }

        // commands are always in Implicit VR Little Endian
        let ts = entries::IMPLICIT_VR_LITTLE_ENDIAN.erased();
        let mut body = Vec::new();
        obj.write_dataset_with_ts(&mut body, &ts)
            .context(WriteDataSetSnafu)?;

        // the group length element leads,
        // declaring the exact byte length of the remainder
        let mut group_length = InMemDicomObject::new_empty();
        group_length.put(DataElement::new(
            tags::COMMAND_GROUP_LENGTH,
            VR::UL,
            PrimitiveValue::from(body.len() as u32),
        ));
        let mut bytes = Vec::with_capacity(body.len() + 12);
        group_length
            .write_dataset_with_ts(&mut bytes, &ts)
            .context(WriteDataSetSnafu)?;
        bytes.extend_from_slice(&body);
        Ok(bytes)
    }

    /// Decode a command from its group 0000 data set bytes.
    pub fn decode(data: &[u8]) -> Result<Command, DecodeError> {
        let ts = entries::IMPLICIT_VR_LITTLE_ENDIAN.erased();
        let obj = InMemDicomObject::read_dataset_with_ts(data, &ts).context(ReadDataSetSnafu)?;

        let command_field = require_u16(&obj, tags::COMMAND_FIELD, "CommandField")?;
        let command_data_set_type =
            require_u16(&obj, tags::COMMAND_DATA_SET_TYPE, "CommandDataSetType")?;

        match command_field {
            command_field::C_ECHO_RQ => Ok(Command::CEchoRq(CEchoRq {
                affected_sop_class_uid: require_str(
                    &obj,
                    tags::AFFECTED_SOP_CLASS_UID,
                    "AffectedSOPClassUID",
                )?,
                message_id: require_u16(&obj, tags::MESSAGE_ID, "MessageID")?,
            })),
            command_field::C_ECHO_RSP => Ok(Command::CEchoRsp(CEchoRsp {
                affected_sop_class_uid: require_str(
                    &obj,
                    tags::AFFECTED_SOP_CLASS_UID,
                    "AffectedSOPClassUID",
                )?,
                message_id_being_responded_to: require_u16(
                    &obj,
                    tags::MESSAGE_ID_BEING_RESPONDED_TO,
                    "MessageIDBeingRespondedTo",
                )?,
                status: decode_status(&obj)?,
            })),
            command_field::C_STORE_RQ => Ok(Command::CStoreRq(CStoreRq {
                affected_sop_class_uid: require_str(
                    &obj,
                    tags::AFFECTED_SOP_CLASS_UID,
                    "AffectedSOPClassUID",
                )?,
                message_id: require_u16(&obj, tags::MESSAGE_ID, "MessageID")?,
                priority: decode_priority(&obj)?,
                command_data_set_type,
                affected_sop_instance_uid: require_str(
                    &obj,
                    tags::AFFECTED_SOP_INSTANCE_UID,
                    "AffectedSOPInstanceUID",
                )?,
                move_originator_ae_title: optional_str(
                    &obj,
                    tags::MOVE_ORIGINATOR_APPLICATION_ENTITY_TITLE,
                    "MoveOriginatorApplicationEntityTitle",
                )?,
                move_originator_message_id: optional_u16(
                    &obj,
                    tags::MOVE_ORIGINATOR_MESSAGE_ID,
                    "MoveOriginatorMessageID",
                )?,
            })),
            command_field::C_STORE_RSP => Ok(Command::CStoreRsp(CStoreRsp {
                affected_sop_class_uid: require_str(
                    &obj,
                    tags::AFFECTED_SOP_CLASS_UID,
                    "AffectedSOPClassUID",
                )?,
                message_id_being_responded_to: require_u16(
                    &obj,
                    tags::MESSAGE_ID_BEING_RESPONDED_TO,
                    "MessageIDBeingRespondedTo",
                )?,
                affected_sop_instance_uid: require_str(
                    &obj,
                    tags::AFFECTED_SOP_INSTANCE_UID,
                    "AffectedSOPInstanceUID",
                )?,
                status: decode_status(&obj)?,
            })),
            command_field::C_FIND_RQ => Ok(Command::CFindRq(CFindRq {
                affected_sop_class_uid: require_str(
                    &obj,
                    tags::AFFECTED_SOP_CLASS_UID,
                    "AffectedSOPClassUID",
                )?,
                message_id: require_u16(&obj, tags::MESSAGE_ID, "MessageID")?,
                priority: decode_priority(&obj)?,
                command_data_set_type,
            })),
            command_field::C_FIND_RSP => Ok(Command::CFindRsp(CFindRsp {
                affected_sop_class_uid: require_str(
                    &obj,
                    tags::AFFECTED_SOP_CLASS_UID,
                    "AffectedSOPClassUID",
                )?,
                message_id_being_responded_to: require_u16(
                    &obj,
                    tags::MESSAGE_ID_BEING_RESPONDED_TO,
                    "MessageIDBeingRespondedTo",
                )?,
                command_data_set_type,
                status: decode_status(&obj)?,
            })),
            command_field::C_MOVE_RQ => Ok(Command::CMoveRq(CMoveRq {
                affected_sop_class_uid: require_str(
                    &obj,
                    tags::AFFECTED_SOP_CLASS_UID,
                    "AffectedSOPClassUID",
                )?,
                message_id: require_u16(&obj, tags::MESSAGE_ID, "MessageID")?,
                priority: decode_priority(&obj)?,
                command_data_set_type,
                move_destination: require_str(&obj, tags::MOVE_DESTINATION, "MoveDestination")?,
            })),
            command_field::C_MOVE_RSP => Ok(Command::CMoveRsp(CMoveRsp {
                affected_sop_class_uid: require_str(
                    &obj,
                    tags::AFFECTED_SOP_CLASS_UID,
                    "AffectedSOPClassUID",
                )?,
                message_id_being_responded_to: require_u16(
                    &obj,
                    tags::MESSAGE_ID_BEING_RESPONDED_TO,
                    "MessageIDBeingRespondedTo",
                )?,
                command_data_set_type,
                status: decode_status(&obj)?,
                number_of_remaining_suboperations: optional_u16(
                    &obj,
                    tags::NUMBER_OF_REMAINING_SUBOPERATIONS,
                    "NumberOfRemainingSuboperations",
                )?,
                number_of_completed_suboperations: optional_u16(
                    &obj,
                    tags::NUMBER_OF_COMPLETED_SUBOPERATIONS,
                    "NumberOfCompletedSuboperations",
                )?,
                number_of_failed_suboperations: optional_u16(
                    &obj,
                    tags::NUMBER_OF_FAILED_SUBOPERATIONS,
                    "NumberOfFailedSuboperations",
                )?,
                number_of_warning_suboperations: optional_u16(
                    &obj,
                    tags::NUMBER_OF_WARNING_SUBOPERATIONS,
                    "NumberOfWarningSuboperations",
                )?,
            })),
            command_field::C_GET_RQ => Ok(Command::CGetRq(CGetRq {
                affected_sop_class_uid: require_str(
                    &obj,
                    tags::AFFECTED_SOP_CLASS_UID,
                    "AffectedSOPClassUID",
                )?,
                message_id: require_u16(&obj, tags::MESSAGE_ID, "MessageID")?,
                priority: decode_priority(&obj)?,
                command_data_set_type,
            })),
            command_field::C_GET_RSP => Ok(Command::CGetRsp(CGetRsp {
                affected_sop_class_uid: require_str(
                    &obj,
                    tags::AFFECTED_SOP_CLASS_UID,
                    "AffectedSOPClassUID",
                )?,
                message_id_being_responded_to: require_u16(
                    &obj,
                    tags::MESSAGE_ID_BEING_RESPONDED_TO,
                    "MessageIDBeingRespondedTo",
                )?,
                command_data_set_type,
                status: decode_status(&obj)?,
                number_of_remaining_suboperations: optional_u16(
                    &obj,
                    tags::NUMBER_OF_REMAINING_SUBOPERATIONS,
                    "NumberOfRemainingSuboperations",
                )?,
                number_of_completed_suboperations: optional_u16(
                    &obj,
                    tags::NUMBER_OF_COMPLETED_SUBOPERATIONS,
                    "NumberOfCompletedSuboperations",
                )?,
                number_of_failed_suboperations: optional_u16(
                    &obj,
                    tags::NUMBER_OF_FAILED_SUBOPERATIONS,
                    "NumberOfFailedSuboperations",
                )?,
                number_of_warning_suboperations: optional_u16(
                    &obj,
                    tags::NUMBER_OF_WARNING_SUBOPERATIONS,
                    "NumberOfWarningSuboperations",
                )?,
            })),
            value => UnknownCommandFieldSnafu { value }.fail(),
        }
    }
}

fn put_u16(obj: &mut InMemDicomObject<StandardDataDictionary>, tag: dicom_core::Tag, value: u16) {
    obj.put(DataElement::new(tag, VR::US, dicom_value!(U16, [value])));
}

fn put_uid(obj: &mut InMemDicomObject<StandardDataDictionary>, tag: dicom_core::Tag, value: &str) {
    obj.put(DataElement::new(tag, VR::UI, dicom_value!(Str, value)));
}

fn put_status(obj: &mut InMemDicomObject<StandardDataDictionary>, status: &Status) {
    put_u16(obj, tags::STATUS, status.code);
    if let Some(comment) = &status.error_comment {
        obj.put(DataElement::new(
            tags::ERROR_COMMENT,
            VR::LO,
            dicom_value!(Str, comment.as_str()),
        ));
    }
}

fn put_suboperation_counters(
    obj: &mut InMemDicomObject<StandardDataDictionary>,
    remaining: Option<u16>,
    completed: Option<u16>,
    failed: Option<u16>,
    warning: Option<u16>,
) {
    if let Some(value) = remaining {
        put_u16(obj, tags::NUMBER_OF_REMAINING_SUBOPERATIONS, value);
    }
    if let Some(value) = completed {
        put_u16(obj, tags::NUMBER_OF_COMPLETED_SUBOPERATIONS, value);
    }
    if let Some(value) = failed {
        put_u16(obj, tags::NUMBER_OF_FAILED_SUBOPERATIONS, value);
    }
    if let Some(value) = warning {
        put_u16(obj, tags::NUMBER_OF_WARNING_SUBOPERATIONS, value);
    }
}

fn require_u16(
    obj: &InMemDicomObject<StandardDataDictionary>,
    tag: dicom_core::Tag,
    name: &'static str,
) -> Result<u16, DecodeError> {
    obj.get(tag)
        .context(MissingFieldSnafu { name })?
        .to_int::<u16>()
        .context(ConvertValueSnafu { name })
}

fn optional_u16(
    obj: &InMemDicomObject<StandardDataDictionary>,
    tag: dicom_core::Tag,
    name: &'static str,
) -> Result<Option<u16>, DecodeError> {
    obj.get(tag)
        .map(|element| element.to_int::<u16>().context(ConvertValueSnafu { name }))
        .transpose()
}

fn require_str(
    obj: &InMemDicomObject<StandardDataDictionary>,
    tag: dicom_core::Tag,
    name: &'static str,
) -> Result<String, DecodeError> {
    Ok(obj
        .get(tag)
        .context(MissingFieldSnafu { name })?
        .to_str()
        .context(ConvertValueSnafu { name })?
        .trim_end_matches(['\0', ' '])
        .to_string())
}

fn optional_str(
    obj: &InMemDicomObject<StandardDataDictionary>,
    tag: dicom_core::Tag,
    name: &'static str,
) -> Result<Option<String>, DecodeError> {
    obj.get(tag)
        .map(|element| {
            element
                .to_str()
                .context(ConvertValueSnafu { name })
                .map(|text| text.trim_end_matches(['\0', ' ']).to_string())
        })
        .transpose()
}

fn decode_status(obj: &InMemDicomObject<StandardDataDictionary>) -> Result<Status, DecodeError> {
    Ok(Status {
        code: require_u16(obj, tags::STATUS, "Status")?,
        error_comment: optional_str(obj, tags::ERROR_COMMENT, "ErrorComment")?,
    })
}

fn decode_priority(obj: &InMemDicomObject<StandardDataDictionary>) -> Result<Priority, DecodeError> {
    let value = require_u16(obj, tags::PRIORITY, "Priority")?;
    Priority::from_code(value).context(UnknownPrioritySnafu { value })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(command: Command) {
        let bytes = command.encode().unwrap();
        let decoded = Command::decode(&bytes).unwrap();
        assert_eq!(decoded, command);
    }

    #[test]
    fn roundtrip_echo() {
        roundtrip(Command::CEchoRq(CEchoRq::builder().message_id(1).build()));
        roundtrip(Command::CEchoRsp(
            CEchoRsp::builder()
                .message_id_being_responded_to(1)
                .build(),
        ));
    }

    #[test]
    fn roundtrip_store() {
        roundtrip(Command::CStoreRq(
            CStoreRq::builder()
                .affected_sop_class_uid("1.2.840.10008.5.1.4.1.1.7")
                .message_id(7)
                .affected_sop_instance_uid("1.2.3.4.5.6")
                .move_originator_ae_title("MOVE-SCU")
                .move_originator_message_id(3)
                .build(),
        ));
        roundtrip(Command::CStoreRsp(
            CStoreRsp::builder()
                .affected_sop_class_uid("1.2.840.10008.5.1.4.1.1.7")
                .message_id_being_responded_to(7)
                .affected_sop_instance_uid("1.2.3.4.5.6")
                .status(Status::success())
                .build(),
        ));
    }

    #[test]
    fn roundtrip_find_move_get() {
        roundtrip(Command::CFindRq(
            CFindRq::builder()
                .affected_sop_class_uid("1.2.840.10008.5.1.4.1.2.2.1")
                .message_id(2)
                .build(),
        ));
        roundtrip(Command::CFindRsp(
            CFindRsp::builder()
                .affected_sop_class_uid("1.2.840.10008.5.1.4.1.2.2.1")
                .message_id_being_responded_to(2)
                .status(Status::pending())
                .build(),
        ));
        roundtrip(Command::CMoveRq(
            CMoveRq::builder()
                .affected_sop_class_uid("1.2.840.10008.5.1.4.1.2.2.2")
                .message_id(5)
                .move_destination("STORE-SCP")
                .build(),
        ));
        roundtrip(Command::CMoveRsp(
            CMoveRsp::builder()
                .affected_sop_class_uid("1.2.840.10008.5.1.4.1.2.2.2")
                .message_id_being_responded_to(5)
                .status(Status::pending())
                .number_of_remaining_suboperations(1)
                .number_of_completed_suboperations(1)
                .number_of_failed_suboperations(0)
                .number_of_warning_suboperations(0)
                .build(),
        ));
        roundtrip(Command::CGetRq(
            CGetRq::builder()
                .affected_sop_class_uid("1.2.840.10008.5.1.4.1.2.2.3")
                .message_id(6)
                .build(),
        ));
    }

    #[test]
    fn status_with_comment_roundtrips() {
        let status = Status::with_comment(Status::CANNOT_UNDERSTAND, "bad pixel data");
        roundtrip(Command::CStoreRsp(
            CStoreRsp::builder()
                .affected_sop_class_uid("1.2.840.10008.5.1.4.1.1.7")
                .message_id_being_responded_to(9)
                .affected_sop_instance_uid("1.2.3")
                .status(status)
                .build(),
        ));
    }

    #[test]
    fn group_length_matches_remainder() {
        let bytes = Command::CEchoRq(CEchoRq::builder().message_id(1).build())
            .encode()
            .unwrap();
        // implicit VR LE: tag (4 bytes), length (4 bytes), UL value (4 bytes)
        assert_eq!(&bytes[0..4], &[0x00, 0x00, 0x00, 0x00]);
        let declared = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
        assert_eq!(declared as usize, bytes.len() - 12);
    }

    #[test]
    fn missing_required_element_fails_decode() {
        // a command object without MessageID
        let mut obj = InMemDicomObject::new_empty();
        put_u16(&mut obj, tags::COMMAND_FIELD, command_field::C_ECHO_RQ);
        put_u16(&mut obj, tags::COMMAND_DATA_SET_TYPE, COMMAND_DATA_SET_TYPE_NULL);
        put_uid(&mut obj, tags::AFFECTED_SOP_CLASS_UID, VERIFICATION_SOP_CLASS);

        let ts = entries::IMPLICIT_VR_LITTLE_ENDIAN.erased();
        let mut bytes = Vec::new();
        obj.write_dataset_with_ts(&mut bytes, &ts).unwrap();

        let err = Command::decode(&bytes).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::MissingField { name: "MessageID" }
        ));
    }

    #[test]
    fn unknown_command_field_fails_decode() {
        let mut obj = InMemDicomObject::new_empty();
        put_u16(&mut obj, tags::COMMAND_FIELD, 0x0150);
        put_u16(&mut obj, tags::COMMAND_DATA_SET_TYPE, COMMAND_DATA_SET_TYPE_NULL);

        let ts = entries::IMPLICIT_VR_LITTLE_ENDIAN.erased();
        let mut bytes = Vec::new();
        obj.write_dataset_with_ts(&mut bytes, &ts).unwrap();

        let err = Command::decode(&bytes).unwrap_err();
        assert!(matches!(err, DecodeError::UnknownCommandField { value: 0x0150 }));
    }
}
