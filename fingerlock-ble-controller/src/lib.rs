//! Fingerlock BLE Controller
//!
//! btleplug-backed radio for the fingerlock session, plus a one-shot
//! scanner for listing nearby peripherals.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use fingerlock_ble_controller::{ble, BtleplugTransport};
//! use fingerlock_session::{inbox, ConnectionSession, LogSink, NoModel, SessionConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let adapter = ble::get_adapter().await?;
//!     let (events, inbox) = inbox();
//!     let transport = BtleplugTransport::new(adapter, events).await?;
//!
//!     let (session, handle) = ConnectionSession::new(
//!         inbox, transport, NoModel, Arc::new(LogSink), SessionConfig::default(),
//!     );
//!     tokio::spawn(session.run());
//!
//!     handle.start_scan(std::time::Duration::from_secs(5)).await?;
//!     handle.connect()?;
//!     Ok(())
//! }
//! ```

pub mod ble;
mod transport;

pub use ble::{BleError, FingerlockDevice};
pub use transport::BtleplugTransport;
