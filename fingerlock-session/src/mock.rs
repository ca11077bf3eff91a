//! In-memory transport
//!
//! Records every request it is asked to issue and, depending on its
//! [`Behavior`], plays a fingerlock peripheral: advertises when a scan
//! starts, accepts connections, answers discovery, serves reads and
//! acknowledges writes. Used by the tests and by `fingerlock-ble --demo`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use fingerlock_proto::{CharacteristicRegistry, CharacteristicRole, ServiceRole};
use uuid::Uuid;

use crate::error::TransportError;
use crate::transport::{CharacteristicRef, EventSender, PeripheralHandle, Transport, TransportEvent};

/// Address the simulated peripheral advertises under
pub const MOCK_PERIPHERAL: &str = "A0:E6:F8:00:13:37";

/// Advertised name of the simulated peripheral
pub const MOCK_NAME: &str = "Project Zero R2 (sim)";

/// Battery service; offered by the peripheral but not used by the session
const BATTERY_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000180F_0000_1000_8000_00805F9B34FB);

/// Sizes of the three data chunks a 256-byte fingerprint is split into
pub const CHUNK_SIZES: [usize; 3] = [100, 100, 56];

/// A request the session issued
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    StartScan,
    StopScan,
    Connect(PeripheralHandle),
    Disconnect(PeripheralHandle),
    DiscoverServices(Vec<Uuid>),
    DiscoverCharacteristics(Uuid),
    SetNotify(CharacteristicRef, bool),
    Read(CharacteristicRef),
    Write(CharacteristicRef, Vec<u8>),
}

/// How the simulated peripheral answers
#[derive(Debug, Clone)]
pub struct Behavior {
    /// Advertisements seen as soon as a scan starts
    pub advertisements: Vec<(PeripheralHandle, Option<String>)>,
    pub accept_connect: bool,
    pub confirm_disconnect: bool,
    pub services: Vec<Uuid>,
    /// Reported by service discovery instead of `services`
    pub discovery_error: Option<TransportError>,
    pub characteristics: Vec<CharacteristicRef>,
    /// Served on read; a characteristic without a value never answers
    pub values: HashMap<Uuid, Vec<u8>>,
    /// Write acknowledgment; `None` never acknowledges
    pub write_result: Option<Result<(), TransportError>>,
}

impl Behavior {
    /// Records requests, answers nothing
    pub fn silent() -> Self {
        Self {
            advertisements: Vec::new(),
            accept_connect: false,
            confirm_disconnect: false,
            services: Vec::new(),
            discovery_error: None,
            characteristics: Vec::new(),
            values: HashMap::new(),
            write_result: None,
        }
    }

    /// A healthy sensor/lock peripheral, plus one unrelated device nearby
    pub fn fingerlock() -> Self {
        let mut characteristics: Vec<_> = CharacteristicRole::ALL
            .into_iter()
            .map(CharacteristicRef::for_role)
            .collect();
        // Firmware exposes a characteristic the central does not know about
        characteristics.push(CharacteristicRef::new(
            ServiceRole::Fingerprint.uuid(),
            Uuid::from_u128(0xF0001139_0451_4000_B000_000000000000),
        ));
        characteristics.push(CharacteristicRef::new(
            BATTERY_SERVICE_UUID,
            Uuid::from_u128(0x00002A19_0000_1000_8000_00805F9B34FB),
        ));

        Self {
            advertisements: vec![
                (PeripheralHandle::new("11:22:33:44:55:66"), Some("Kitchen Speaker".to_string())),
                (PeripheralHandle::new("22:33:44:55:66:77"), None),
                (PeripheralHandle::new(MOCK_PERIPHERAL), Some(MOCK_NAME.to_string())),
            ],
            accept_connect: true,
            confirm_disconnect: true,
            services: vec![
                ServiceRole::Fingerprint.uuid(),
                BATTERY_SERVICE_UUID,
                ServiceRole::DoorLock.uuid(),
            ],
            discovery_error: None,
            characteristics,
            values: HashMap::new(),
            write_result: Some(Ok(())),
        }
    }

    /// Serve `fingerprint` from the three data characteristics
    pub fn with_fingerprint(mut self, fingerprint: &[u8]) -> Self {
        self.set_fingerprint(fingerprint);
        self
    }

    pub fn set_fingerprint(&mut self, fingerprint: &[u8]) {
        let mut rest = fingerprint;
        for (role, size) in CharacteristicRole::DATA.into_iter().zip(CHUNK_SIZES) {
            let (chunk, tail) = rest.split_at(size.min(rest.len()));
            self.values.insert(role.uuid(), chunk.to_vec());
            rest = tail;
        }
    }
}

#[derive(Debug)]
struct MockState {
    behavior: Behavior,
    requests: Vec<Request>,
}

#[derive(Debug, Clone)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
    events: EventSender,
}

impl MockTransport {
    pub fn new(events: EventSender, behavior: Behavior) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                behavior,
                requests: Vec::new(),
            })),
            events,
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, request: Request) -> Behavior {
        let mut state = self.state();
        state.requests.push(request);
        state.behavior.clone()
    }

    pub fn configure(&self, f: impl FnOnce(&mut Behavior)) {
        f(&mut self.state().behavior);
    }

    /// Inject an event as if the radio had produced it
    pub fn emit(&self, event: TransportEvent) {
        if !self.events.send(event) {
            log::debug!("Session gone, dropping mock event");
        }
    }

    /// Value update on `role`, as a read reply or notification would deliver it
    pub fn notify(&self, role: CharacteristicRole, value: &[u8]) {
        self.emit(TransportEvent::ValueUpdated {
            characteristic: CharacteristicRef::for_role(role),
            result: Ok(value.to_vec()),
        });
    }

    /// A finger touched the sensor
    pub fn touch(&self) {
        self.notify(CharacteristicRole::FingerEventDetect, &[0x01]);
    }

    /// The lock answers a write that `write_result: None` held back
    pub fn acknowledge_write(&self, result: Result<(), TransportError>) {
        self.emit(TransportEvent::WriteCompleted {
            characteristic: CharacteristicRef::for_role(CharacteristicRole::LockState),
            result,
        });
    }

    /// The link dropped from the peripheral side
    pub fn drop_link(&self) {
        self.emit(TransportEvent::Disconnected {
            peripheral: PeripheralHandle::new(MOCK_PERIPHERAL),
        });
    }

    pub fn requests(&self) -> Vec<Request> {
        self.state().requests.clone()
    }

    pub fn clear_requests(&self) {
        self.state().requests.clear();
    }

    /// Every value written to the lock, in order
    pub fn lock_writes(&self) -> Vec<Vec<u8>> {
        self.requests()
            .into_iter()
            .filter_map(|request| match request {
                Request::Write(c, value) if c.uuid == CharacteristicRole::LockState.uuid() => {
                    Some(value)
                }
                _ => None,
            })
            .collect()
    }

    /// Roles of every read request, in order
    pub fn reads(&self) -> Vec<CharacteristicRole> {
        self.requests()
            .into_iter()
            .filter_map(|request| match request {
                Request::Read(c) => CharacteristicRegistry::lookup(c.service, c.uuid),
                _ => None,
            })
            .collect()
    }
}

impl Transport for MockTransport {
    fn start_scan(&self) -> Result<(), TransportError> {
        let behavior = self.record(Request::StartScan);
        for (peripheral, name) in behavior.advertisements {
            self.emit(TransportEvent::Discovered {
                peripheral,
                name,
                rssi: Some(-60),
            });
        }
        Ok(())
    }

    fn stop_scan(&self) -> Result<(), TransportError> {
        self.record(Request::StopScan);
        Ok(())
    }

    fn connect(&self, peripheral: &PeripheralHandle) -> Result<(), TransportError> {
        let behavior = self.record(Request::Connect(peripheral.clone()));
        if behavior.accept_connect {
            self.emit(TransportEvent::Connected {
                peripheral: peripheral.clone(),
            });
        }
        Ok(())
    }

    fn disconnect(&self, peripheral: &PeripheralHandle) -> Result<(), TransportError> {
        let behavior = self.record(Request::Disconnect(peripheral.clone()));
        if behavior.confirm_disconnect {
            self.emit(TransportEvent::Disconnected {
                peripheral: peripheral.clone(),
            });
        }
        Ok(())
    }

    fn discover_services(
        &self,
        peripheral: &PeripheralHandle,
        filter: &[Uuid],
    ) -> Result<(), TransportError> {
        let behavior = self.record(Request::DiscoverServices(filter.to_vec()));
        if behavior.accept_connect {
            let result = match behavior.discovery_error {
                Some(error) => Err(error),
                None => Ok(behavior
                    .services
                    .into_iter()
                    .filter(|s| filter.contains(s))
                    .collect()),
            };
            self.emit(TransportEvent::ServicesDiscovered {
                peripheral: peripheral.clone(),
                result,
            });
        }
        Ok(())
    }

    fn discover_characteristics(
        &self,
        peripheral: &PeripheralHandle,
        service: Uuid,
    ) -> Result<(), TransportError> {
        let behavior = self.record(Request::DiscoverCharacteristics(service));
        if behavior.accept_connect {
            let characteristics = behavior
                .characteristics
                .into_iter()
                .filter(|c| c.service == service)
                .collect();
            self.emit(TransportEvent::CharacteristicsDiscovered {
                peripheral: peripheral.clone(),
                service,
                result: Ok(characteristics),
            });
        }
        Ok(())
    }

    fn set_notify(
        &self,
        _peripheral: &PeripheralHandle,
        characteristic: CharacteristicRef,
        enabled: bool,
    ) -> Result<(), TransportError> {
        self.record(Request::SetNotify(characteristic, enabled));
        self.emit(TransportEvent::NotifySet {
            characteristic,
            result: Ok(()),
        });
        Ok(())
    }

    fn read_value(
        &self,
        _peripheral: &PeripheralHandle,
        characteristic: CharacteristicRef,
    ) -> Result<(), TransportError> {
        let behavior = self.record(Request::Read(characteristic));
        if let Some(value) = behavior.values.get(&characteristic.uuid) {
            self.emit(TransportEvent::ValueUpdated {
                characteristic,
                result: Ok(value.clone()),
            });
        }
        Ok(())
    }

    fn write_value(
        &self,
        _peripheral: &PeripheralHandle,
        characteristic: CharacteristicRef,
        value: Vec<u8>,
        _with_response: bool,
    ) -> Result<(), TransportError> {
        let behavior = self.record(Request::Write(characteristic, value));
        if let Some(result) = behavior.write_result {
            self.emit(TransportEvent::WriteCompleted {
                characteristic,
                result,
            });
        }
        Ok(())
    }
}
