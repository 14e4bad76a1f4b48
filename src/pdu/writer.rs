//! PDU encoding onto a byte stream.

use crate::pdu::*;
use byteordered::byteorder::{BigEndian, WriteBytesExt};
use dicom_encoding::text::{DefaultCharacterSetCodec, TextCodec};
use snafu::{Backtrace, ResultExt, Snafu};
use std::io::Write;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum WriteError {
    #[snafu(display("could not write PDU field `{}`: {}", field, source))]
    WriteField {
        field: &'static str,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("could not encode text field `{}`: {}", field, source))]
    EncodeText {
        field: &'static str,
        source: dicom_encoding::text::EncodeTextError,
    },
}

pub type Result<T, E = WriteError> = std::result::Result<T, E>;

/// Write a length-prefixed chunk where the length is a 32-bit big endian
/// integer. The chunk is buffered first, so that the declared length
/// always matches the written payload exactly.
pub(crate) fn write_chunk_u32<F>(writer: &mut dyn Write, func: F) -> Result<()>
where
    F: FnOnce(&mut Vec<u8>) -> Result<()>,
{
    let mut data = vec![];
    func(&mut data)?;

    writer
        .write_u32::<BigEndian>(data.len() as u32)
        .context(WriteFieldSnafu { field: "length" })?;
    writer
        .write_all(&data)
        .context(WriteFieldSnafu { field: "chunk" })?;
    Ok(())
}

/// Same as [`write_chunk_u32`], with a 16-bit length prefix.
pub(crate) fn write_chunk_u16<F>(writer: &mut dyn Write, func: F) -> Result<()>
where
    F: FnOnce(&mut Vec<u8>) -> Result<()>,
{
    let mut data = vec![];
    func(&mut data)?;

    writer
        .write_u16::<BigEndian>(data.len() as u16)
        .context(WriteFieldSnafu { field: "length" })?;
    writer
        .write_all(&data)
        .context(WriteFieldSnafu { field: "chunk" })?;
    Ok(())
}

fn write_ae_title(
    writer: &mut dyn Write,
    ae_title: &str,
    field: &'static str,
    codec: &dyn TextCodec,
) -> Result<()> {
    let mut ae_title_bytes = codec.encode(ae_title).context(EncodeTextSnafu { field })?;
    // AE titles are space padded to 16 bytes
    ae_title_bytes.resize(16, b' ');
    ae_title_bytes.truncate(16);
    writer
        .write_all(&ae_title_bytes)
        .context(WriteFieldSnafu { field })
}

/// UIDs of odd length gain a trailing NUL, as PS3.5 requires
/// even-length values.
fn write_uid(
    writer: &mut dyn Write,
    uid: &str,
    field: &'static str,
    codec: &dyn TextCodec,
) -> Result<()> {
    let mut uid_bytes = codec.encode(uid).context(EncodeTextSnafu { field })?;
    if uid_bytes.len() % 2 != 0 {
        uid_bytes.push(0);
    }
    writer
        .write_all(&uid_bytes)
        .context(WriteFieldSnafu { field })
}

/// Write one PDU to the given writer.
///
/// The total written length is always exactly the length declared
/// in the PDU header.
pub fn write_pdu<W>(writer: &mut W, pdu: &Pdu) -> Result<()>
where
    W: Write,
{
    let codec = DefaultCharacterSetCodec;
    match pdu {
        Pdu::AssociationRQ(AssociationRQ {
            protocol_version,
            called_ae_title,
            calling_ae_title,
            application_context_name,
            presentation_contexts,
            user_variables,
        }) => {
            // 1 - PDU-type - 01H, then one reserved byte
            writer
                .write_all(&[0x01, 0x00])
                .context(WriteFieldSnafu { field: "type" })?;

            write_chunk_u32(writer, |writer| {
                writer
                    .write_u16::<BigEndian>(*protocol_version)
                    .context(WriteFieldSnafu {
                        field: "Protocol-version",
                    })?;
                writer
                    .write_u16::<BigEndian>(0)
                    .context(WriteFieldSnafu { field: "Reserved" })?;

                write_ae_title(writer, called_ae_title, "Called-AE-title", &codec)?;
                write_ae_title(writer, calling_ae_title, "Calling-AE-title", &codec)?;

                writer
                    .write_all(&[0u8; 32])
                    .context(WriteFieldSnafu { field: "Reserved" })?;

                write_pdu_variable_application_context_name(
                    writer,
                    application_context_name,
                    &codec,
                )?;
                for presentation_context in presentation_contexts {
                    write_pdu_variable_presentation_context_proposed(
                        writer,
                        presentation_context,
                        &codec,
                    )?;
                }
                write_pdu_variable_user_variables(writer, user_variables, &codec)?;
                Ok(())
            })
        }
        Pdu::AssociationAC(AssociationAC {
            protocol_version,
            called_ae_title,
            calling_ae_title,
            application_context_name,
            presentation_contexts,
            user_variables,
        }) => {
            // 1 - PDU-type - 02H, then one reserved byte
            writer
                .write_all(&[0x02, 0x00])
                .context(WriteFieldSnafu { field: "type" })?;

            write_chunk_u32(writer, |writer| {
                writer
                    .write_u16::<BigEndian>(*protocol_version)
                    .context(WriteFieldSnafu {
                        field: "Protocol-version",
                    })?;
                writer
                    .write_u16::<BigEndian>(0)
                    .context(WriteFieldSnafu { field: "Reserved" })?;

                // bytes 11-42 echo the AE titles of the request;
                // receivers must not test their values
                write_ae_title(writer, called_ae_title, "Called-AE-title", &codec)?;
                write_ae_title(writer, calling_ae_title, "Calling-AE-title", &codec)?;

                writer
                    .write_all(&[0u8; 32])
                    .context(WriteFieldSnafu { field: "Reserved" })?;

                write_pdu_variable_application_context_name(
                    writer,
                    application_context_name,
                    &codec,
                )?;
                for presentation_context in presentation_contexts {
                    write_pdu_variable_presentation_context_result(
                        writer,
                        presentation_context,
                        &codec,
                    )?;
                }
                write_pdu_variable_user_variables(writer, user_variables, &codec)?;
                Ok(())
            })
        }
        Pdu::AssociationRJ(AssociationRJ { result, source }) => {
            writer
                .write_all(&[0x03, 0x00])
                .context(WriteFieldSnafu { field: "type" })?;

            write_chunk_u32(writer, |writer| {
                writer
                    .write_u8(0)
                    .context(WriteFieldSnafu { field: "Reserved" })?;

                let result_code = match result {
                    AssociationRJResult::Permanent => 1,
                    AssociationRJResult::Transient => 2,
                };
                let (source_code, reason_code) = match source {
                    AssociationRJSource::ServiceUser(reason) => (
                        1,
                        match reason {
                            AssociationRJServiceUserReason::NoReasonGiven => 1,
                            AssociationRJServiceUserReason::ApplicationContextNameNotSupported => 2,
                            AssociationRJServiceUserReason::CallingAETitleNotRecognized => 3,
                            AssociationRJServiceUserReason::CalledAETitleNotRecognized => 7,
                            AssociationRJServiceUserReason::Reserved(code) => *code,
                        },
                    ),
                    AssociationRJSource::ServiceProviderAcse(reason) => (
                        2,
                        match reason {
                            AssociationRJServiceProviderAcseReason::NoReasonGiven => 1,
                            AssociationRJServiceProviderAcseReason::ProtocolVersionNotSupported => {
                                2
                            }
                        },
                    ),
                    AssociationRJSource::ServiceProviderPresentation(reason) => (
                        3,
                        match reason {
                            AssociationRJServiceProviderPresentationReason::TemporaryCongestion => {
                                1
                            }
                            AssociationRJServiceProviderPresentationReason::LocalLimitExceeded => 2,
                            AssociationRJServiceProviderPresentationReason::Reserved(code) => *code,
                        },
                    ),
                };
                writer
                    .write_all(&[result_code, source_code, reason_code])
                    .context(WriteFieldSnafu {
                        field: "Result/Source/Reason",
                    })?;
                Ok(())
            })
        }
        Pdu::PData { data } => {
            writer
                .write_all(&[0x04, 0x00])
                .context(WriteFieldSnafu { field: "type" })?;

            write_chunk_u32(writer, |writer| {
                for pdv in data {
                    write_chunk_u32(writer, |writer| {
                        writer
                            .write_u8(pdv.presentation_context_id)
                            .context(WriteFieldSnafu {
                                field: "Presentation-context-ID",
                            })?;

                        let mut message_header = 0x00;
                        if let PDataValueType::Command = pdv.value_type {
                            message_header |= 0x01;
                        }
                        if pdv.is_last {
                            message_header |= 0x02;
                        }
                        writer.write_u8(message_header).context(WriteFieldSnafu {
                            field: "Message Control Header",
                        })?;
                        writer.write_all(&pdv.data).context(WriteFieldSnafu {
                            field: "Presentation-data-value",
                        })?;
                        Ok(())
                    })?;
                }
                Ok(())
            })
        }
        Pdu::ReleaseRQ => {
            writer
                .write_all(&[0x05, 0x00])
                .context(WriteFieldSnafu { field: "type" })?;
            write_chunk_u32(writer, |writer| {
                writer
                    .write_all(&[0u8; 4])
                    .context(WriteFieldSnafu { field: "Reserved" })
            })
        }
        Pdu::ReleaseRP => {
            writer
                .write_all(&[0x06, 0x00])
                .context(WriteFieldSnafu { field: "type" })?;
            write_chunk_u32(writer, |writer| {
                writer
                    .write_all(&[0u8; 4])
                    .context(WriteFieldSnafu { field: "Reserved" })
            })
        }
        Pdu::AbortRQ { source } => {
            writer
                .write_all(&[0x07, 0x00])
                .context(WriteFieldSnafu { field: "type" })?;
            write_chunk_u32(writer, |writer| {
                let (source_code, reason_code) = match source {
                    AbortRQSource::ServiceUser => (0, 0),
                    AbortRQSource::Reserved => (1, 0),
                    AbortRQSource::ServiceProvider(reason) => (
                        2,
                        match reason {
                            AbortRQServiceProviderReason::ReasonNotSpecifiedUnrecognizedPdu => 0,
                            AbortRQServiceProviderReason::UnexpectedPdu => 2,
                            AbortRQServiceProviderReason::Reserved => 3,
                            AbortRQServiceProviderReason::UnrecognizedPduParameter => 4,
                            AbortRQServiceProviderReason::UnexpectedPduParameter => 5,
                            AbortRQServiceProviderReason::InvalidPduParameter => 6,
                        },
                    ),
                };
                writer
                    .write_all(&[0, 0, source_code, reason_code])
                    .context(WriteFieldSnafu {
                        field: "Source/Reason",
                    })?;
                Ok(())
            })
        }
        Pdu::Unknown { pdu_type, data } => {
            writer
                .write_all(&[*pdu_type, 0x00])
                .context(WriteFieldSnafu { field: "type" })?;
            write_chunk_u32(writer, |writer| {
                writer
                    .write_all(data)
                    .context(WriteFieldSnafu { field: "data" })
            })
        }
    }
}

fn write_pdu_variable_application_context_name(
    writer: &mut dyn Write,
    application_context_name: &str,
    codec: &dyn TextCodec,
) -> Result<()> {
    // 1 - Item-type - 10H, then one reserved byte
    writer
        .write_all(&[0x10, 0x00])
        .context(WriteFieldSnafu { field: "Item-type" })?;
    write_chunk_u16(writer, |writer| {
        write_uid(writer, application_context_name, "Application-context-name", codec)
    })
}

fn write_pdu_variable_presentation_context_proposed(
    writer: &mut dyn Write,
    presentation_context: &PresentationContextProposed,
    codec: &dyn TextCodec,
) -> Result<()> {
    // 1 - Item-type - 20H, then one reserved byte
    writer
        .write_all(&[0x20, 0x00])
        .context(WriteFieldSnafu { field: "Item-type" })?;
    write_chunk_u16(writer, |writer| {
        writer
            .write_all(&[presentation_context.id, 0, 0, 0])
            .context(WriteFieldSnafu {
                field: "Presentation-context-ID",
            })?;

        // Abstract Syntax sub-item (30H)
        writer
            .write_all(&[0x30, 0x00])
            .context(WriteFieldSnafu { field: "Item-type" })?;
        write_chunk_u16(writer, |writer| {
            write_uid(
                writer,
                &presentation_context.abstract_syntax,
                "Abstract-syntax-name",
                codec,
            )
        })?;

        // one Transfer Syntax sub-item (40H) per proposed syntax
        for transfer_syntax in &presentation_context.transfer_syntaxes {
            writer
                .write_all(&[0x40, 0x00])
                .context(WriteFieldSnafu { field: "Item-type" })?;
            write_chunk_u16(writer, |writer| {
                write_uid(writer, transfer_syntax, "Transfer-syntax-name", codec)
            })?;
        }
        Ok(())
    })
}

fn write_pdu_variable_presentation_context_result(
    writer: &mut dyn Write,
    presentation_context: &PresentationContextResult,
    codec: &dyn TextCodec,
) -> Result<()> {
    // 1 - Item-type - 21H, then one reserved byte
    writer
        .write_all(&[0x21, 0x00])
        .context(WriteFieldSnafu { field: "Item-type" })?;
    write_chunk_u16(writer, |writer| {
        let reason_code = match presentation_context.reason {
            PresentationContextResultReason::Acceptance => 0,
            PresentationContextResultReason::UserRejection => 1,
            PresentationContextResultReason::NoReason => 2,
            PresentationContextResultReason::AbstractSyntaxNotSupported => 3,
            PresentationContextResultReason::TransferSyntaxesNotSupported => 4,
        };
        writer
            .write_all(&[presentation_context.id, 0, reason_code, 0])
            .context(WriteFieldSnafu {
                field: "Presentation-context-ID",
            })?;

        // the single selected Transfer Syntax sub-item (40H)
        writer
            .write_all(&[0x40, 0x00])
            .context(WriteFieldSnafu { field: "Item-type" })?;
        write_chunk_u16(writer, |writer| {
            write_uid(
                writer,
                &presentation_context.transfer_syntax,
                "Transfer-syntax-name",
                codec,
            )
        })
    })
}

fn write_pdu_variable_user_variables(
    writer: &mut dyn Write,
    user_variables: &[UserVariableItem],
    codec: &dyn TextCodec,
) -> Result<()> {
    if user_variables.is_empty() {
        return Ok(());
    }

    // 1 - Item-type - 50H, then one reserved byte
    writer
        .write_all(&[0x50, 0x00])
        .context(WriteFieldSnafu { field: "Item-type" })?;
    write_chunk_u16(writer, |writer| {
        for user_variable in user_variables {
            match user_variable {
                UserVariableItem::MaxLength(max_length) => {
                    writer
                        .write_all(&[0x51, 0x00])
                        .context(WriteFieldSnafu { field: "Item-type" })?;
                    write_chunk_u16(writer, |writer| {
                        writer
                            .write_u32::<BigEndian>(*max_length)
                            .context(WriteFieldSnafu {
                                field: "Maximum-length-received",
                            })
                    })?;
                }
                UserVariableItem::ImplementationClassUID(uid) => {
                    writer
                        .write_all(&[0x52, 0x00])
                        .context(WriteFieldSnafu { field: "Item-type" })?;
                    write_chunk_u16(writer, |writer| {
                        write_uid(writer, uid, "Implementation-class-uid", codec)
                    })?;
                }
                UserVariableItem::AsyncOperations(invoked, performed) => {
                    writer
                        .write_all(&[0x53, 0x00])
                        .context(WriteFieldSnafu { field: "Item-type" })?;
                    write_chunk_u16(writer, |writer| {
                        writer
                            .write_u16::<BigEndian>(*invoked)
                            .context(WriteFieldSnafu {
                                field: "Maximum-number-operations-invoked",
                            })?;
                        writer
                            .write_u16::<BigEndian>(*performed)
                            .context(WriteFieldSnafu {
                                field: "Maximum-number-operations-performed",
                            })
                    })?;
                }
                UserVariableItem::RoleSelection {
                    sop_class_uid,
                    scu_role,
                    scp_role,
                } => {
                    writer
                        .write_all(&[0x54, 0x00])
                        .context(WriteFieldSnafu { field: "Item-type" })?;
                    write_chunk_u16(writer, |writer| {
                        let mut uid = vec![];
                        write_uid(&mut uid, sop_class_uid, "SOP-class-uid", codec)?;
                        writer
                            .write_u16::<BigEndian>(uid.len() as u16)
                            .context(WriteFieldSnafu { field: "UID-length" })?;
                        writer
                            .write_all(&uid)
                            .context(WriteFieldSnafu { field: "SOP-class-uid" })?;
                        writer
                            .write_all(&[*scu_role, *scp_role])
                            .context(WriteFieldSnafu {
                                field: "SCU/SCP-role",
                            })
                    })?;
                }
                UserVariableItem::ImplementationVersionName(name) => {
                    writer
                        .write_all(&[0x55, 0x00])
                        .context(WriteFieldSnafu { field: "Item-type" })?;
                    write_chunk_u16(writer, |writer| {
                        let bytes = codec.encode(name).context(EncodeTextSnafu {
                            field: "Implementation-version-name",
                        })?;
                        writer.write_all(&bytes).context(WriteFieldSnafu {
                            field: "Implementation-version-name",
                        })
                    })?;
                }
                UserVariableItem::Unknown(item_type, data) => {
                    writer
                        .write_all(&[*item_type, 0x00])
                        .context(WriteFieldSnafu { field: "Item-type" })?;
                    write_chunk_u16(writer, |writer| {
                        writer
                            .write_all(data)
                            .context(WriteFieldSnafu { field: "Unknown" })
                    })?;
                }
            }
        }
        Ok(())
    })
}
