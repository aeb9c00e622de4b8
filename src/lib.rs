//! # iec104-apci
//!
//! The APCI connection layer of IEC 60870-5-104: reliable, ordered,
//! flow-controlled delivery of application payloads over a raw byte stream.
//!
//! This crate implements the framing/control layer only. It owns the
//! sequence-number bookkeeping, the send and receive windows, the three
//! protocol timers (t1/t2/t3) and the start/stop data-transfer handshake.
//! Payload contents (ASDUs) are opaque bytes to this layer, and there is no
//! retransmission: loss or reordering is detected and terminates the
//! connection.
//!
//! ## Features
//!
//! - Full U/S/I frame state machine with the standard t1/t2/t3, k and w
//!   parameters
//! - Asynchronous API using Tokio
//! - Works over TCP ([`connect`] / [`Server`]) or any byte stream
//!   ([`Connection::initiate`] / [`Connection::respond`])
//! - Send-window backpressure and forced acknowledgments
//! - Comprehensive error handling
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use iec104_apci::{connect, LinkConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = LinkConfig::new()
//!         .send_window(12)
//!         .recv_window(8)
//!         .build()?;
//!
//!     // Connect and enable data transfer
//!     let connection = connect("192.168.1.100:2404", config).await?;
//!
//!     // Send an application payload and wait for the peer's acknowledgment
//!     connection.send(b"\x64\x01\x06\x00\x01\x00\x00\x00\x00\x14", true).await?;
//!
//!     // Receive payloads in arrival order
//!     let payload = connection.receive().await?;
//!     println!("received {} bytes", payload.len());
//!
//!     connection.close().await;
//!     Ok(())
//! }
//! ```

pub mod connection;
pub mod error;
pub mod frame;
mod seq;
mod timers;

// Re-export common types for convenience
pub use crate::connection::{connect, Connection, LinkConfig, LinkState, Server};
pub use crate::error::{ApciError, ApciResult};
pub use crate::frame::{ControlFunction, Frame, DEFAULT_PORT, MAX_PAYLOAD_LEN};
