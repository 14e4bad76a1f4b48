//! PDU decoding from a byte stream.

use crate::pdu::*;
use byteordered::byteorder::{BigEndian, ReadBytesExt};
use dicom_encoding::text::{DefaultCharacterSetCodec, TextCodec};
use snafu::{ensure, Backtrace, OptionExt, ResultExt, Snafu};
use std::io::{Cursor, ErrorKind, Read, Seek, SeekFrom};

/// An absolute sanity cap on the PDU length field,
/// regardless of the configured limit.
pub const MAXIMUM_PDU_SIZE: u32 = 128 << 20;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum ReadError {
    #[snafu(display("invalid maximum PDU length {}", max_pdu_length))]
    InvalidMaxPdu {
        max_pdu_length: u32,
        backtrace: Backtrace,
    },

    /// no PDU was available in the stream
    NoPduAvailable { backtrace: Backtrace },

    #[snafu(display("could not read PDU: {}", source))]
    ReadPdu {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("could not read PDU item: {}", source))]
    ReadPduItem {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("could not read PDU field `{}`: {}", field, source))]
    ReadPduField {
        field: &'static str,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("could not read {} reserved bytes: {}", bytes, source))]
    ReadReserved {
        bytes: u32,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display(
        "incoming PDU was too large: length {}, maximum is {}",
        pdu_length,
        max_pdu_length
    ))]
    PduTooLarge {
        pdu_length: u32,
        max_pdu_length: u32,
        backtrace: Backtrace,
    },

    #[snafu(display("item `{}` declares more bytes than its container", field))]
    InconsistentItemLength {
        field: &'static str,
        backtrace: Backtrace,
    },

    #[snafu(display("field `{}` is not a valid DICOM UID", field))]
    InvalidUid {
        field: &'static str,
        backtrace: Backtrace,
    },

    /// invalid reject source or reason
    InvalidRejectSourceOrReason { backtrace: Backtrace },

    /// invalid abort source or reason
    InvalidAbortSourceOrReason { backtrace: Backtrace },

    /// invalid presentation context result reason
    InvalidPresentationContextResultReason { backtrace: Backtrace },

    /// multiple transfer syntaxes were accepted in one presentation context
    MultipleTransferSyntaxesAccepted { backtrace: Backtrace },

    /// unknown presentation context sub-item
    UnknownPresentationContextSubItem { backtrace: Backtrace },

    /// invalid transfer syntax sub-item
    InvalidTransferSyntaxSubItem { backtrace: Backtrace },

    #[snafu(display("could not decode text field `{}`: {}", field, source))]
    DecodeText {
        field: &'static str,
        source: dicom_encoding::text::DecodeTextError,
    },

    /// missing application context name
    MissingApplicationContextName { backtrace: Backtrace },

    /// missing abstract syntax
    MissingAbstractSyntax { backtrace: Backtrace },

    /// missing transfer syntax
    MissingTransferSyntax { backtrace: Backtrace },

    #[snafu(display("unexpected item type {:#04x} in {}", item_type, container))]
    UnexpectedItemType {
        container: &'static str,
        item_type: u8,
        backtrace: Backtrace,
    },
}

pub type Result<T, E = ReadError> = std::result::Result<T, E>;

/// Read one PDU from `reader`.
///
/// `max_pdu_length` caps the length field of the incoming PDU;
/// values under the protocol minimum are clamped up to it,
/// so that a small max-length advertised to the peer
/// does not reject well-formed negotiation PDUs.
///
/// A clean end of stream before the first byte
/// yields [`ReadError::NoPduAvailable`],
/// which callers map to a transport-closed event.
pub fn read_pdu<R>(reader: &mut R, max_pdu_length: u32) -> Result<Pdu>
where
    R: Read,
{
    ensure!(
        max_pdu_length <= MAXIMUM_PDU_SIZE,
        InvalidMaxPduSnafu { max_pdu_length }
    );
    let max_pdu_length = max_pdu_length.max(MINIMUM_PDU_SIZE);

    // If we can't read the first 2 bytes, no PDU ever started:
    // report NoPduAvailable so that an orderly socket shutdown
    // is distinguishable from a truncated PDU.
    let mut bytes = [0; 2];
    if let Err(e) = reader.read_exact(&mut bytes) {
        ensure!(e.kind() != ErrorKind::UnexpectedEof, NoPduAvailableSnafu);
        return Err(e).context(ReadPduFieldSnafu { field: "type" });
    }

    let pdu_type = bytes[0];
    let pdu_length = reader
        .read_u32::<BigEndian>()
        .context(ReadPduFieldSnafu { field: "length" })?;

    ensure!(
        pdu_length <= max_pdu_length,
        PduTooLargeSnafu {
            pdu_length,
            max_pdu_length
        }
    );

    let bytes = read_n(reader, pdu_length as usize).context(ReadPduSnafu)?;
    ensure!(
        bytes.len() == pdu_length as usize,
        InconsistentItemLengthSnafu { field: "PDU" }
    );
    let mut cursor = Cursor::new(bytes);
    let codec = DefaultCharacterSetCodec;

    match pdu_type {
        0x01 => {
            // A-ASSOCIATE-RQ

            let mut application_context_name: Option<String> = None;
            let mut presentation_contexts = vec![];
            let mut user_variables = vec![];

            let protocol_version = cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                field: "Protocol-version",
            })?;

            cursor
                .read_u16::<BigEndian>()
                .context(ReadReservedSnafu { bytes: 2_u32 })?;

            let called_ae_title = read_ae_title(&mut cursor, "Called-AE-title", &codec)?;
            let calling_ae_title = read_ae_title(&mut cursor, "Calling-AE-title", &codec)?;

            cursor
                .seek(SeekFrom::Current(32))
                .context(ReadReservedSnafu { bytes: 32_u32 })?;

            while cursor.position() < cursor.get_ref().len() as u64 {
                match read_pdu_variable(&mut cursor, &codec)? {
                    PduVariableItem::ApplicationContext(val) => {
                        application_context_name = Some(val);
                    }
                    PduVariableItem::PresentationContextProposed(val) => {
                        presentation_contexts.push(val);
                    }
                    PduVariableItem::UserVariables(val) => {
                        user_variables = val;
                    }
                    PduVariableItem::PresentationContextResult(_) => {
                        return UnexpectedItemTypeSnafu {
                            container: "A-ASSOCIATE-RQ",
                            item_type: 0x21_u8,
                        }
                        .fail();
                    }
                    PduVariableItem::Unknown(_) => {
                        // tolerated and skipped, per the "not tested" rule
                    }
                }
            }

            Ok(Pdu::AssociationRQ(AssociationRQ {
                protocol_version,
                called_ae_title,
                calling_ae_title,
                application_context_name: application_context_name
                    .context(MissingApplicationContextNameSnafu)?,
                presentation_contexts,
                user_variables,
            }))
        }
        0x02 => {
            // A-ASSOCIATE-AC

            let mut application_context_name: Option<String> = None;
            let mut presentation_contexts = vec![];
            let mut user_variables = vec![];

            let protocol_version = cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                field: "Protocol-version",
            })?;

            cursor
                .read_u16::<BigEndian>()
                .context(ReadReservedSnafu { bytes: 2_u32 })?;

            // bytes 11-42 mirror the AE titles of the request;
            // they are read back but their value is not tested
            let called_ae_title = read_ae_title(&mut cursor, "Called-AE-title", &codec)?;
            let calling_ae_title = read_ae_title(&mut cursor, "Calling-AE-title", &codec)?;

            cursor
                .seek(SeekFrom::Current(32))
                .context(ReadReservedSnafu { bytes: 32_u32 })?;

            while cursor.position() < cursor.get_ref().len() as u64 {
                match read_pdu_variable(&mut cursor, &codec)? {
                    PduVariableItem::ApplicationContext(val) => {
                        application_context_name = Some(val);
                    }
                    PduVariableItem::PresentationContextResult(val) => {
                        presentation_contexts.push(val);
                    }
                    PduVariableItem::UserVariables(val) => {
                        user_variables = val;
                    }
                    PduVariableItem::PresentationContextProposed(_) => {
                        return UnexpectedItemTypeSnafu {
                            container: "A-ASSOCIATE-AC",
                            item_type: 0x20_u8,
                        }
                        .fail();
                    }
                    PduVariableItem::Unknown(_) => {}
                }
            }

            Ok(Pdu::AssociationAC(AssociationAC {
                protocol_version,
                called_ae_title,
                calling_ae_title,
                application_context_name: application_context_name
                    .context(MissingApplicationContextNameSnafu)?,
                presentation_contexts,
                user_variables,
            }))
        }
        0x03 => {
            // A-ASSOCIATE-RJ

            cursor
                .read_u8()
                .context(ReadReservedSnafu { bytes: 1_u32 })?;

            let result = AssociationRJResult::from_code(
                cursor
                    .read_u8()
                    .context(ReadPduFieldSnafu { field: "Result" })?,
            )
            .context(InvalidRejectSourceOrReasonSnafu)?;

            let source = AssociationRJSource::from_codes(
                cursor
                    .read_u8()
                    .context(ReadPduFieldSnafu { field: "Source" })?,
                cursor.read_u8().context(ReadPduFieldSnafu {
                    field: "Reason/Diag.",
                })?,
            )
            .context(InvalidRejectSourceOrReasonSnafu)?;

            Ok(Pdu::AssociationRJ(AssociationRJ { result, source }))
        }
        0x04 => {
            // P-DATA-TF

            let mut values = vec![];
            while cursor.position() < cursor.get_ref().len() as u64 {
                let item_length = cursor.read_u32::<BigEndian>().context(ReadPduFieldSnafu {
                    field: "Item-length",
                })?;
                ensure!(
                    item_length >= 2
                        && u64::from(item_length)
                            <= cursor.get_ref().len() as u64 - cursor.position(),
                    InconsistentItemLengthSnafu {
                        field: "Presentation-data-value",
                    }
                );

                let presentation_context_id = cursor.read_u8().context(ReadPduFieldSnafu {
                    field: "Presentation-context-ID",
                })?;

                // Message control header: bit 0 selects command vs data,
                // bit 1 flags the last fragment of its kind.
                let header = cursor.read_u8().context(ReadPduFieldSnafu {
                    field: "Message Control Header",
                })?;
                let value_type = if header & 0x01 != 0 {
                    PDataValueType::Command
                } else {
                    PDataValueType::Data
                };
                let is_last = header & 0x02 != 0;

                let data =
                    read_n(&mut cursor, (item_length - 2) as usize).context(ReadPduFieldSnafu {
                        field: "Presentation-data-value",
                    })?;

                values.push(PDataValue {
                    presentation_context_id,
                    value_type,
                    is_last,
                    data,
                });
            }

            Ok(Pdu::PData { data: values })
        }
        0x05 => {
            // A-RELEASE-RQ

            cursor
                .seek(SeekFrom::Current(4))
                .context(ReadReservedSnafu { bytes: 4_u32 })?;
            Ok(Pdu::ReleaseRQ)
        }
        0x06 => {
            // A-RELEASE-RP

            cursor
                .seek(SeekFrom::Current(4))
                .context(ReadReservedSnafu { bytes: 4_u32 })?;
            Ok(Pdu::ReleaseRP)
        }
        0x07 => {
            // A-ABORT

            cursor
                .read_u8()
                .context(ReadReservedSnafu { bytes: 1_u32 })?;
            cursor
                .read_u8()
                .context(ReadReservedSnafu { bytes: 1_u32 })?;

            let source = AbortRQSource::from_codes(
                cursor
                    .read_u8()
                    .context(ReadPduFieldSnafu { field: "Source" })?,
                cursor.read_u8().context(ReadPduFieldSnafu {
                    field: "Reason/Diag",
                })?,
            )
            .context(InvalidAbortSourceOrReasonSnafu)?;

            Ok(Pdu::AbortRQ { source })
        }
        _ => Ok(Pdu::Unknown {
            pdu_type,
            data: cursor.into_inner(),
        }),
    }
}

fn read_n<R>(reader: &mut R, bytes_to_read: usize) -> std::io::Result<Vec<u8>>
where
    R: Read,
{
    let mut result = Vec::new();
    reader.take(bytes_to_read as u64).read_to_end(&mut result)?;
    Ok(result)
}

fn read_ae_title<R>(reader: &mut R, field: &'static str, codec: &dyn TextCodec) -> Result<String>
where
    R: Read,
{
    let mut ae_bytes = [0; 16];
    reader
        .read_exact(&mut ae_bytes)
        .context(ReadPduFieldSnafu { field })?;
    Ok(codec
        .decode(&ae_bytes)
        .context(DecodeTextSnafu { field })?
        .trim_end_matches(['\0', ' '])
        .trim_start_matches(' ')
        .to_string())
}

/// Decode a UID string payload,
/// trimming the trailing NUL/space padding
/// and validating the DICOM UID character repertoire.
fn read_uid<R>(reader: &mut R, len: usize, field: &'static str, codec: &dyn TextCodec) -> Result<String>
where
    R: Read,
{
    let bytes = read_n(reader, len).context(ReadPduFieldSnafu { field })?;
    ensure!(bytes.len() == len, InconsistentItemLengthSnafu { field });
    let uid = codec
        .decode(&bytes)
        .context(DecodeTextSnafu { field })?
        .trim_end_matches(['\0', ' '])
        .to_string();
    ensure!(
        !uid.is_empty() && uid.bytes().all(|b| b.is_ascii_digit() || b == b'.'),
        InvalidUidSnafu { field }
    );
    Ok(uid)
}

#[derive(Debug)]
enum PduVariableItem {
    Unknown(u8),
    ApplicationContext(String),
    PresentationContextProposed(PresentationContextProposed),
    PresentationContextResult(PresentationContextResult),
    UserVariables(Vec<UserVariableItem>),
}

fn read_pdu_variable<R>(reader: &mut R, codec: &dyn TextCodec) -> Result<PduVariableItem>
where
    R: Read,
{
    let item_type = reader
        .read_u8()
        .context(ReadPduFieldSnafu { field: "Item-type" })?;
    reader
        .read_u8()
        .context(ReadReservedSnafu { bytes: 1_u32 })?;
    let item_length = reader.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
        field: "Item-length",
    })?;

    let bytes = read_n(reader, item_length as usize).context(ReadPduItemSnafu)?;
    ensure!(
        bytes.len() == item_length as usize,
        InconsistentItemLengthSnafu { field: "Item" }
    );
    let mut cursor = Cursor::new(bytes);

    match item_type {
        0x10 => {
            // Application Context item
            let len = cursor.get_ref().len();
            let val = read_uid(&mut cursor, len, "Application-context-name", codec)?;
            Ok(PduVariableItem::ApplicationContext(val))
        }
        0x20 => {
            // Presentation Context item (proposed)

            let mut abstract_syntax: Option<String> = None;
            let mut transfer_syntaxes = vec![];

            let presentation_context_id = cursor.read_u8().context(ReadPduFieldSnafu {
                field: "Presentation-context-ID",
            })?;
            cursor
                .seek(SeekFrom::Current(3))
                .context(ReadReservedSnafu { bytes: 3_u32 })?;

            while cursor.position() < cursor.get_ref().len() as u64 {
                let item_type = cursor
                    .read_u8()
                    .context(ReadPduFieldSnafu { field: "Item-type" })?;
                cursor
                    .read_u8()
                    .context(ReadReservedSnafu { bytes: 1_u32 })?;
                let item_length = cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                    field: "Item-length",
                })?;

                match item_type {
                    0x30 => {
                        abstract_syntax = Some(read_uid(
                            &mut cursor,
                            item_length as usize,
                            "Abstract-syntax-name",
                            codec,
                        )?);
                    }
                    0x40 => {
                        transfer_syntaxes.push(read_uid(
                            &mut cursor,
                            item_length as usize,
                            "Transfer-syntax-name",
                            codec,
                        )?);
                    }
                    _ => {
                        return UnknownPresentationContextSubItemSnafu.fail();
                    }
                }
            }

            Ok(PduVariableItem::PresentationContextProposed(
                PresentationContextProposed {
                    id: presentation_context_id,
                    abstract_syntax: abstract_syntax.context(MissingAbstractSyntaxSnafu)?,
                    transfer_syntaxes,
                },
            ))
        }
        0x21 => {
            // Presentation Context item (result)

            let mut transfer_syntax: Option<String> = None;

            let presentation_context_id = cursor.read_u8().context(ReadPduFieldSnafu {
                field: "Presentation-context-ID",
            })?;
            cursor
                .read_u8()
                .context(ReadReservedSnafu { bytes: 1_u32 })?;
            let reason = PresentationContextResultReason::from_code(
                cursor.read_u8().context(ReadPduFieldSnafu {
                    field: "Result/Reason",
                })?,
            )
            .context(InvalidPresentationContextResultReasonSnafu)?;
            cursor
                .read_u8()
                .context(ReadReservedSnafu { bytes: 1_u32 })?;

            while cursor.position() < cursor.get_ref().len() as u64 {
                let item_type = cursor
                    .read_u8()
                    .context(ReadPduFieldSnafu { field: "Item-type" })?;
                cursor
                    .read_u8()
                    .context(ReadReservedSnafu { bytes: 1_u32 })?;
                let item_length = cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                    field: "Item-length",
                })?;

                match item_type {
                    0x40 => {
                        ensure!(
                            transfer_syntax.is_none(),
                            MultipleTransferSyntaxesAcceptedSnafu
                        );
                        transfer_syntax = Some(read_uid(
                            &mut cursor,
                            item_length as usize,
                            "Transfer-syntax-name",
                            codec,
                        )?);
                    }
                    _ => {
                        return InvalidTransferSyntaxSubItemSnafu.fail();
                    }
                }
            }

            Ok(PduVariableItem::PresentationContextResult(
                PresentationContextResult {
                    id: presentation_context_id,
                    reason,
                    transfer_syntax: transfer_syntax.context(MissingTransferSyntaxSnafu)?,
                },
            ))
        }
        0x50 => {
            // User Information item

            let mut user_variables = vec![];

            while cursor.position() < cursor.get_ref().len() as u64 {
                let item_type = cursor
                    .read_u8()
                    .context(ReadPduFieldSnafu { field: "Item-type" })?;
                cursor
                    .read_u8()
                    .context(ReadReservedSnafu { bytes: 1_u32 })?;
                let item_length = cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                    field: "Item-length",
                })?;

                match item_type {
                    0x51 => {
                        user_variables.push(UserVariableItem::MaxLength(
                            cursor.read_u32::<BigEndian>().context(ReadPduFieldSnafu {
                                field: "Maximum-length-received",
                            })?,
                        ));
                    }
                    0x52 => {
                        user_variables.push(UserVariableItem::ImplementationClassUID(read_uid(
                            &mut cursor,
                            item_length as usize,
                            "Implementation-class-uid",
                            codec,
                        )?));
                    }
                    0x53 => {
                        let invoked = cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                            field: "Maximum-number-operations-invoked",
                        })?;
                        let performed =
                            cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                                field: "Maximum-number-operations-performed",
                            })?;
                        user_variables.push(UserVariableItem::AsyncOperations(invoked, performed));
                    }
                    0x54 => {
                        ensure!(
                            item_length >= 4,
                            InconsistentItemLengthSnafu {
                                field: "SCU/SCP-role-selection",
                            }
                        );
                        let uid_length =
                            cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                                field: "UID-length",
                            })?;
                        ensure!(
                            u32::from(uid_length) + 4 == u32::from(item_length),
                            InconsistentItemLengthSnafu {
                                field: "SCU/SCP-role-selection",
                            }
                        );
                        let sop_class_uid = read_uid(
                            &mut cursor,
                            uid_length as usize,
                            "SOP-class-uid",
                            codec,
                        )?;
                        let scu_role = cursor
                            .read_u8()
                            .context(ReadPduFieldSnafu { field: "SCU-role" })?;
                        let scp_role = cursor
                            .read_u8()
                            .context(ReadPduFieldSnafu { field: "SCP-role" })?;
                        user_variables.push(UserVariableItem::RoleSelection {
                            sop_class_uid,
                            scu_role,
                            scp_role,
                        });
                    }
                    0x55 => {
                        let name = codec
                            .decode(
                                &read_n(&mut cursor, item_length as usize).context(
                                    ReadPduFieldSnafu {
                                        field: "Implementation-version-name",
                                    },
                                )?,
                            )
                            .context(DecodeTextSnafu {
                                field: "Implementation-version-name",
                            })?
                            .trim()
                            .to_string();
                        user_variables.push(UserVariableItem::ImplementationVersionName(name));
                    }
                    _ => {
                        user_variables.push(UserVariableItem::Unknown(
                            item_type,
                            read_n(&mut cursor, item_length as usize)
                                .context(ReadPduFieldSnafu { field: "Unknown" })?,
                        ));
                    }
                }
            }

            Ok(PduVariableItem::UserVariables(user_variables))
        }
        _ => Ok(PduVariableItem::Unknown(item_type)),
    }
}
