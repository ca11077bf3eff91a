//! btleplug implementation of the session [`Transport`]
//!
//! Every request is spawned onto the runtime and reports back through the
//! session's [`EventSender`]. A background task turns adapter events into
//! discovery and disconnect events; one task per connected peripheral
//! forwards GATT notifications. Advertisers are remembered only until the
//! next scan starts, unless they are still linked.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use btleplug::api::{Central, CentralEvent, Characteristic, Peripheral as _, ScanFilter, ValueNotification, WriteType};
use btleplug::platform::{Adapter, Peripheral, PeripheralId};
use fingerlock_proto::CharacteristicRole;
use fingerlock_session::{
    CharacteristicRef, EventSender, PeripheralHandle, Transport, TransportError, TransportEvent,
};
use futures::{Stream, StreamExt};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::ble::{BleError, peripheral_handle};

type Notifications = Pin<Box<dyn Stream<Item = ValueNotification> + Send>>;

#[derive(Clone)]
pub struct BtleplugTransport {
    adapter: Adapter,
    events: EventSender,
    peripherals: Arc<Mutex<HashMap<PeripheralHandle, Peripheral>>>,
    notifiers: Arc<Mutex<HashMap<PeripheralHandle, JoinHandle<()>>>>,
}

impl BtleplugTransport {
    /// Subscribe to adapter events and start forwarding them to the session
    pub async fn new(adapter: Adapter, events: EventSender) -> Result<Self, BleError> {
        let stream = adapter.events().await?;

        let transport = Self {
            adapter,
            events,
            peripherals: Arc::new(Mutex::new(HashMap::new())),
            notifiers: Arc::new(Mutex::new(HashMap::new())),
        };

        tokio::spawn(transport.clone().pump_central(stream));
        Ok(transport)
    }

    async fn pump_central(self, mut stream: Pin<Box<dyn Stream<Item = CentralEvent> + Send>>) {
        while let Some(event) = stream.next().await {
            let delivered = match event {
                CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                    self.on_advertisement(&id).await
                }
                CentralEvent::DeviceDisconnected(id) => match self.handle_for(&id) {
                    Some(peripheral) => {
                        self.stop_notifications(&peripheral);
                        self.events.send(TransportEvent::Disconnected { peripheral })
                    }
                    None => true,
                },
                _ => true,
            };
            if !delivered {
                break;
            }
        }
        log::debug!("Adapter event stream closed");
    }

    async fn on_advertisement(&self, id: &PeripheralId) -> bool {
        let peripheral = match self.adapter.peripheral(id).await {
            Ok(peripheral) => peripheral,
            Err(e) => {
                log::debug!("Advertisement from vanished peripheral {id:?}: {e}");
                return true;
            }
        };
        let props = peripheral.properties().await.ok().flatten();
        let handle = peripheral_handle(&peripheral);
        self.peripherals().insert(handle.clone(), peripheral);

        self.events.send(TransportEvent::Discovered {
            peripheral: handle,
            name: props.as_ref().and_then(|p| p.local_name.clone()),
            rssi: props.and_then(|p| p.rssi),
        })
    }

    fn peripherals(&self) -> MutexGuard<'_, HashMap<PeripheralHandle, Peripheral>> {
        self.peripherals.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notifiers(&self) -> MutexGuard<'_, HashMap<PeripheralHandle, JoinHandle<()>>> {
        self.notifiers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stop_notifications(&self, handle: &PeripheralHandle) {
        if let Some(task) = self.notifiers().remove(handle) {
            task.abort();
        }
    }

    /// Forget advertisers from earlier scans; linked peripherals stay
    fn prune_peripherals(&self) {
        let notifiers = self.notifiers();
        let dropped = retain_linked(&mut self.peripherals(), &notifiers);
        if dropped > 0 {
            log::debug!("Forgot {dropped} peripherals from earlier scans");
        }
    }

    fn handle_for(&self, id: &PeripheralId) -> Option<PeripheralHandle> {
        self.peripherals()
            .iter()
            .find(|(_, peripheral)| peripheral.id() == *id)
            .map(|(handle, _)| handle.clone())
    }

    fn peripheral(&self, handle: &PeripheralHandle) -> Result<Peripheral, TransportError> {
        self.peripherals()
            .get(handle)
            .cloned()
            .ok_or_else(|| TransportError::UnknownPeripheral(handle.to_string()))
    }

    /// Forward notifications from `peripheral`, replacing any earlier forwarder
    fn forward_notifications(&self, handle: PeripheralHandle, stream: Notifications) {
        let events = self.events.clone();
        let task = tokio::spawn(async move {
            let mut stream = stream;
            while let Some(notification) = stream.next().await {
                let Some(characteristic) = notification_ref(notification.uuid) else {
                    log::debug!("Notification from unknown characteristic {}", notification.uuid);
                    continue;
                };
                let delivered = events.send(TransportEvent::ValueUpdated {
                    characteristic,
                    result: Ok(notification.value),
                });
                if !delivered {
                    break;
                }
            }
        });

        if let Some(previous) = self.notifiers().insert(handle, task) {
            previous.abort();
        }
    }
}

/// Keep only the entries of `seen` that are in `linked`; returns how many went
fn retain_linked<P, L>(
    seen: &mut HashMap<PeripheralHandle, P>,
    linked: &HashMap<PeripheralHandle, L>,
) -> usize {
    let before = seen.len();
    seen.retain(|handle, _| linked.contains_key(handle));
    before - seen.len()
}

/// Notifications carry only the characteristic UUID; the registry knows its service
fn notification_ref(uuid: Uuid) -> Option<CharacteristicRef> {
    CharacteristicRole::ALL
        .into_iter()
        .find(|role| role.uuid() == uuid)
        .map(CharacteristicRef::for_role)
}

fn find_characteristic(
    peripheral: &Peripheral,
    characteristic: CharacteristicRef,
) -> Result<Characteristic, TransportError> {
    peripheral
        .characteristics()
        .into_iter()
        .find(|c| c.uuid == characteristic.uuid && c.service_uuid == characteristic.service)
        .ok_or(TransportError::CharacteristicNotFound(characteristic.uuid))
}

impl Transport for BtleplugTransport {
    fn start_scan(&self) -> Result<(), TransportError> {
        self.prune_peripherals();

        let adapter = self.adapter.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            if let Err(e) = adapter.start_scan(ScanFilter::default()).await {
                events.send(TransportEvent::ScanFailed {
                    error: TransportError::Scan(e.to_string()),
                });
            }
        });
        Ok(())
    }

    fn stop_scan(&self) -> Result<(), TransportError> {
        let adapter = self.adapter.clone();
        tokio::spawn(async move {
            if let Err(e) = adapter.stop_scan().await {
                log::warn!("Failed to stop scan: {e}");
            }
        });
        Ok(())
    }

    fn connect(&self, handle: &PeripheralHandle) -> Result<(), TransportError> {
        let peripheral = self.peripheral(handle)?;
        let transport = self.clone();
        let handle = handle.clone();

        tokio::spawn(async move {
            if let Err(e) = peripheral.connect().await {
                transport.events.send(TransportEvent::ConnectFailed {
                    peripheral: handle,
                    error: TransportError::Connect(e.to_string()),
                });
                return;
            }

            match peripheral.notifications().await {
                Ok(stream) => transport.forward_notifications(handle.clone(), stream),
                Err(e) => log::warn!("No notification stream for {handle}: {e}"),
            }
            transport.events.send(TransportEvent::Connected { peripheral: handle });
        });
        Ok(())
    }

    fn disconnect(&self, handle: &PeripheralHandle) -> Result<(), TransportError> {
        let peripheral = self.peripheral(handle)?;
        let events = self.events.clone();
        let handle = handle.clone();

        let transport = self.clone();

        tokio::spawn(async move {
            match peripheral.disconnect().await {
                Ok(()) => {
                    transport.stop_notifications(&handle);
                    events.send(TransportEvent::Disconnected { peripheral: handle });
                }
                Err(e) => log::warn!("Disconnect from {handle} failed: {e}"),
            }
        });
        Ok(())
    }

    fn discover_services(
        &self,
        handle: &PeripheralHandle,
        filter: &[Uuid],
    ) -> Result<(), TransportError> {
        let peripheral = self.peripheral(handle)?;
        let events = self.events.clone();
        let handle = handle.clone();
        let filter = filter.to_vec();

        tokio::spawn(async move {
            // btleplug always discovers everything; narrow it down here
            let result = match peripheral.discover_services().await {
                Ok(()) => Ok(peripheral
                    .services()
                    .into_iter()
                    .map(|s| s.uuid)
                    .filter(|uuid| filter.contains(uuid))
                    .collect()),
                Err(e) => Err(TransportError::Discovery(e.to_string())),
            };
            events.send(TransportEvent::ServicesDiscovered {
                peripheral: handle,
                result,
            });
        });
        Ok(())
    }

    fn discover_characteristics(
        &self,
        handle: &PeripheralHandle,
        service: Uuid,
    ) -> Result<(), TransportError> {
        let peripheral = self.peripheral(handle)?;

        // Characteristics come with the service discovery; just report them
        let result = peripheral
            .services()
            .into_iter()
            .find(|s| s.uuid == service)
            .map(|s| {
                s.characteristics
                    .into_iter()
                    .map(|c| CharacteristicRef::new(c.service_uuid, c.uuid))
                    .collect()
            })
            .ok_or_else(|| TransportError::Discovery(format!("service {service} not found")));

        self.events.send(TransportEvent::CharacteristicsDiscovered {
            peripheral: handle.clone(),
            service,
            result,
        });
        Ok(())
    }

    fn set_notify(
        &self,
        handle: &PeripheralHandle,
        characteristic: CharacteristicRef,
        enabled: bool,
    ) -> Result<(), TransportError> {
        let peripheral = self.peripheral(handle)?;
        let target = find_characteristic(&peripheral, characteristic)?;
        let events = self.events.clone();

        tokio::spawn(async move {
            let outcome = if enabled {
                peripheral.subscribe(&target).await
            } else {
                peripheral.unsubscribe(&target).await
            };
            events.send(TransportEvent::NotifySet {
                characteristic,
                result: outcome.map_err(|e| TransportError::Notify(e.to_string())),
            });
        });
        Ok(())
    }

    fn read_value(
        &self,
        handle: &PeripheralHandle,
        characteristic: CharacteristicRef,
    ) -> Result<(), TransportError> {
        let peripheral = self.peripheral(handle)?;
        let target = find_characteristic(&peripheral, characteristic)?;
        let events = self.events.clone();

        tokio::spawn(async move {
            let result = peripheral
                .read(&target)
                .await
                .map_err(|e| TransportError::Read(e.to_string()));
            events.send(TransportEvent::ValueUpdated {
                characteristic,
                result,
            });
        });
        Ok(())
    }

    fn write_value(
        &self,
        handle: &PeripheralHandle,
        characteristic: CharacteristicRef,
        value: Vec<u8>,
        with_response: bool,
    ) -> Result<(), TransportError> {
        let peripheral = self.peripheral(handle)?;
        let target = find_characteristic(&peripheral, characteristic)?;
        let events = self.events.clone();
        let write_type = if with_response {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };

        tokio::spawn(async move {
            let result = peripheral
                .write(&target, &value, write_type)
                .await
                .map_err(|e| TransportError::Write(e.to_string()));
            events.send(TransportEvent::WriteCompleted {
                characteristic,
                result,
            });
        });
        Ok(())
    }
}
