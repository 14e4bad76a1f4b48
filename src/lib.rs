//! This crate implements the DICOM upper layer protocol (PS3.8)
//! and the DIMSE message service layer (PS3.7)
//! on top of plain TCP,
//! providing the building blocks for
//! service class providers (SCPs) and service class users (SCUs).
//!
//! - The [`pdu`] module
//!   provides the data structures representing _protocol data units_
//!   and the means to read and write them on a byte stream.
//! - The [`machine`] module
//!   holds the association state machine of PS3.8 §9.2
//!   as a pure transition table over sum types.
//! - The [`context`] module
//!   negotiates and indexes presentation contexts.
//! - The [`dimse`] module
//!   encodes and decodes DIMSE commands
//!   and reassembles them from P-DATA-TF fragments.
//! - The [`association`] module
//!   runs one state machine task per association,
//!   bridging the TCP socket and the layers above
//!   through bounded upcall/downcall queues.
//! - The [`provider`] and [`user`] modules
//!   expose the SCP and SCU service interfaces.
//!
//! ## Example
//!
//! Responding to C-ECHO on incoming associations:
//!
//! ```no_run
//! # use std::net::TcpListener;
//! use dicom_net::provider::{ServiceProvider, ServiceProviderOptions};
//! use dicom_net::dimse::Status;
//!
//! # fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let provider = ServiceProviderOptions::new()
//!     .ae_title("MAIN-STORAGE")
//!     .with_abstract_syntax("1.2.840.10008.1.1")
//!     .on_c_echo(|| Status::success())
//!     .build();
//!
//! let listener = TcpListener::bind("0.0.0.0:11112")?;
//! for stream in listener.incoming() {
//!     let stream = stream?;
//!     provider.run(stream);
//! }
//! # Ok(())
//! # }
//! ```

pub mod association;
pub mod context;
pub mod dimse;
pub mod fault;
pub mod machine;
pub mod pdu;
pub mod provider;
pub mod user;

/// The implementation class UID reported in association negotiation.
///
/// Automatically generated as per the standard, part 5, section B.2.
pub const IMPLEMENTATION_CLASS_UID: &str = "2.25.305828538964297276047826452160246002925";

/// The implementation version name reported in association negotiation.
pub const IMPLEMENTATION_VERSION_NAME: &str = "DICOM-NET 0.1";

// re-exports

pub use association::Upcall;
pub use context::ContextManager;
pub use dimse::{Command, Status};
pub use pdu::read_pdu;
pub use pdu::write_pdu;
pub use pdu::Pdu;
pub use provider::{ServiceProvider, ServiceProviderOptions};
pub use user::{ServiceUser, ServiceUserOptions};
