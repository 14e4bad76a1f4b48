//! Reassembly of DIMSE messages from P-DATA-TF fragments.
//!
//! Each association owns exactly one [`CommandAssembler`].
//! All PDVs of one logical message share a presentation context ID,
//! command fragments precede data fragments,
//! and the `Last` flag appears at most once on each side.
//! Any violation of these rules is a protocol error
//! which the association task answers with an A-ABORT.

use snafu::{ensure, Backtrace, ResultExt, Snafu};

use crate::dimse::{Command, DecodeError};
use crate::pdu::{PDataValue, PDataValueType};

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display(
        "PDV of presentation context {} inside a message of context {}",
        got,
        current
    ))]
    MixedPresentationContexts {
        current: u8,
        got: u8,
        backtrace: Backtrace,
    },

    #[snafu(display("multiple last fragments for {} bytes", kind))]
    DuplicateLastFragment {
        kind: &'static str,
        backtrace: Backtrace,
    },

    #[snafu(display("command fragment received after the command was complete"))]
    CommandAfterLast { backtrace: Backtrace },

    #[snafu(display("could not decode DIMSE command: {}", source))]
    Decode { source: DecodeError },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A fully reassembled DIMSE message:
/// the decoded command and the raw data set bytes that followed it,
/// under one presentation context.
#[derive(Debug)]
pub struct DimseMessage {
    pub context_id: u8,
    pub command: Command,
    pub data: Vec<u8>,
}

/// The per-association accumulator of P-DATA-TF fragments.
#[derive(Debug, Default)]
pub struct CommandAssembler {
    context_id: Option<u8>,
    command_bytes: Vec<u8>,
    data_bytes: Vec<u8>,
    command_complete: bool,
    data_complete: bool,
    command: Option<Command>,
}

impl CommandAssembler {
    pub fn new() -> Self {
        CommandAssembler::default()
    }

    /// Whether a message is currently being assembled.
    pub fn in_flight(&self) -> bool {
        self.context_id.is_some()
    }

    /// Feed the PDVs of one P-DATA-TF PDU into the assembler,
    /// returning every message completed by them.
    pub fn add_pdata(&mut self, values: Vec<PDataValue>) -> Result<Vec<DimseMessage>> {
        let mut completed = Vec::new();
        for value in values {
            if let Some(message) = self.add_pdv(value)? {
                completed.push(message);
            }
        }
        Ok(completed)
    }

    fn add_pdv(&mut self, value: PDataValue) -> Result<Option<DimseMessage>> {
        match self.context_id {
            None => self.context_id = Some(value.presentation_context_id),
            Some(current) => {
                ensure!(
                    current == value.presentation_context_id,
                    MixedPresentationContextsSnafu {
                        current,
                        got: value.presentation_context_id,
                    }
                );
            }
        }

        match value.value_type {
            PDataValueType::Command => {
                ensure!(!self.command_complete, CommandAfterLastSnafu);
                self.command_bytes.extend_from_slice(&value.data);
                if value.is_last {
                    self.command_complete = true;
                }
            }
            PDataValueType::Data => {
                ensure!(
                    !self.data_complete,
                    DuplicateLastFragmentSnafu { kind: "data" }
                );
                self.data_bytes.extend_from_slice(&value.data);
                if value.is_last {
                    self.data_complete = true;
                }
            }
        }

        if !self.command_complete {
            return Ok(None);
        }

        if self.command.is_none() {
            let command = Command::decode(&self.command_bytes).context(DecodeSnafu)?;
            // a null command data set means no data fragments will follow
            if !command.has_data() {
                self.data_complete = true;
            }
            self.command = Some(command);
        }

        if !self.data_complete {
            return Ok(None);
        }

        let state = std::mem::take(self);
        match (state.context_id, state.command) {
            (Some(context_id), Some(command)) => Ok(Some(DimseMessage {
                context_id,
                command,
                data: state.data_bytes,
            })),
            // the context is adopted with the first PDV and the command
            // was decoded above; nothing to emit otherwise
            _ => Ok(None),
        }
    }
}
