//! Radio transport seam
//!
//! A [`Transport`] only *issues* requests. Completions, failures and value
//! notifications come back later as [`TransportEvent`]s pushed through an
//! [`EventSender`] into the session's single input queue, so every piece
//! of session state is mutated from one serialized worker.

use std::fmt;

use fingerlock_proto::CharacteristicRole;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::TransportError;
use crate::session::Input;

/// Opaque identifier of a peripheral (platform address or UUID string)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeripheralHandle(String);

impl PeripheralHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn id(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeripheralHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A discovered characteristic, identified by its owning service and its own UUID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CharacteristicRef {
    pub service: Uuid,
    pub uuid: Uuid,
}

impl CharacteristicRef {
    pub const fn new(service: Uuid, uuid: Uuid) -> Self {
        Self { service, uuid }
    }

    /// The well-known location of a role on a fingerlock peripheral
    pub const fn for_role(role: CharacteristicRole) -> Self {
        Self::new(role.service().uuid(), role.uuid())
    }
}

/// Asynchronous results delivered by the transport
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// An advertisement was seen while scanning
    Discovered {
        peripheral: PeripheralHandle,
        name: Option<String>,
        rssi: Option<i16>,
    },
    ScanFailed {
        error: TransportError,
    },
    Connected {
        peripheral: PeripheralHandle,
    },
    ConnectFailed {
        peripheral: PeripheralHandle,
        error: TransportError,
    },
    Disconnected {
        peripheral: PeripheralHandle,
    },
    ServicesDiscovered {
        peripheral: PeripheralHandle,
        result: Result<Vec<Uuid>, TransportError>,
    },
    CharacteristicsDiscovered {
        peripheral: PeripheralHandle,
        service: Uuid,
        result: Result<Vec<CharacteristicRef>, TransportError>,
    },
    NotifySet {
        characteristic: CharacteristicRef,
        result: Result<(), TransportError>,
    },
    WriteCompleted {
        characteristic: CharacteristicRef,
        result: Result<(), TransportError>,
    },
    /// Result of a read, or an unsolicited notification
    ValueUpdated {
        characteristic: CharacteristicRef,
        result: Result<Vec<u8>, TransportError>,
    },
}

/// Scan/connect/discover/read/write/notify primitives.
///
/// Methods must not block: they start the operation and return. An `Err`
/// means the request could not even be issued; anything that fails later
/// is reported through the matching [`TransportEvent`].
pub trait Transport: Send + 'static {
    fn start_scan(&self) -> Result<(), TransportError>;

    fn stop_scan(&self) -> Result<(), TransportError>;

    fn connect(&self, peripheral: &PeripheralHandle) -> Result<(), TransportError>;

    fn disconnect(&self, peripheral: &PeripheralHandle) -> Result<(), TransportError>;

    /// Discover only the services listed in `filter`
    fn discover_services(
        &self,
        peripheral: &PeripheralHandle,
        filter: &[Uuid],
    ) -> Result<(), TransportError>;

    fn discover_characteristics(
        &self,
        peripheral: &PeripheralHandle,
        service: Uuid,
    ) -> Result<(), TransportError>;

    fn set_notify(
        &self,
        peripheral: &PeripheralHandle,
        characteristic: CharacteristicRef,
        enabled: bool,
    ) -> Result<(), TransportError>;

    fn read_value(
        &self,
        peripheral: &PeripheralHandle,
        characteristic: CharacteristicRef,
    ) -> Result<(), TransportError>;

    fn write_value(
        &self,
        peripheral: &PeripheralHandle,
        characteristic: CharacteristicRef,
        value: Vec<u8>,
        with_response: bool,
    ) -> Result<(), TransportError>;
}

/// Transport-side end of the session input queue
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<Input>,
}

impl EventSender {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Input>) -> Self {
        Self { tx }
    }

    /// Queue an event for the session. Returns `false` once the session has stopped.
    pub fn send(&self, event: TransportEvent) -> bool {
        self.tx.send(Input::Transport(event)).is_ok()
    }
}
