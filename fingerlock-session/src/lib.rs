//! Fingerlock Session - BLE central state machine for the fingerprint door lock
//!
//! Scans for the sensor/lock peripheral, connects, binds its GATT
//! characteristics, and on each fingerprint event reads the three data
//! chunks, classifies the assembled print and writes the lock command.
//! The radio is behind the [`Transport`] trait; the classifier behind
//! [`Classifier`].

mod assembler;
mod classifier;
mod config;
mod error;
mod lock;
#[cfg(any(test, feature = "demo"))]
pub mod mock;
mod session;
mod sink;
mod transport;

pub use assembler::FingerprintAssembler;
pub use classifier::{
    ClassLabel, ClassificationPipeline, Classifier, FEATURE_LEN, LinearModel, NoModel, features,
};
pub use config::{DEFAULT_NAME_MARKER, SessionConfig, fingerlock_home};
pub use error::{ClassificationError, ConfigError, LockError, SessionError, TransportError};
pub use lock::{GateTicket, LockController, REJECT_LABEL};
pub use session::{
    ConnectionSession, Inbox, ScanOutcome, SessionHandle, SessionSnapshot, SessionState, inbox,
};
pub use sink::{ChannelSink, DecisionRecord, EventSink, LogSink, SessionEvent, Verdict};
pub use transport::{CharacteristicRef, EventSender, PeripheralHandle, Transport, TransportEvent};

pub use fingerlock_proto::{CharacteristicRole, LockCommand, ServiceRole};
