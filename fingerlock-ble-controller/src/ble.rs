//! Adapter access and a blocking-style scan for listing devices

use std::time::Duration;

use btleplug::api::{BDAddr, Central, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral};
use fingerlock_session::PeripheralHandle;

#[derive(Debug, thiserror::Error)]
pub enum BleError {
    #[error("no Bluetooth adapter found")]
    NoAdapter,
    #[error(transparent)]
    Btleplug(#[from] btleplug::Error),
}

/// A peripheral seen during [`scan`]
#[derive(Debug, Clone)]
pub struct FingerlockDevice {
    pub name: String,
    pub handle: PeripheralHandle,
    pub rssi: Option<i16>,
    pub is_fingerlock: bool,
}

/// Get the default Bluetooth adapter
pub async fn get_adapter() -> Result<Adapter, BleError> {
    let manager = Manager::new().await?;
    let adapters = manager.adapters().await?;
    adapters.into_iter().next().ok_or(BleError::NoAdapter)
}

/// Session-facing identifier: the Bluetooth address where the platform
/// exposes one, the platform peripheral id otherwise (macOS)
pub fn peripheral_handle(peripheral: &Peripheral) -> PeripheralHandle {
    let address = peripheral.address();
    if address == BDAddr::from([0u8; 6]) {
        PeripheralHandle::new(format!("{:?}", peripheral.id()))
    } else {
        PeripheralHandle::new(address.to_string())
    }
}

/// A device matches when its advertised name contains `marker`
pub fn is_fingerlock(name: &str, marker: &str) -> bool {
    !marker.is_empty() && name.contains(marker)
}

/// Scan for `duration` and list everything seen, flagging names that contain `marker`
pub async fn scan(duration: Duration, marker: &str) -> Result<Vec<FingerlockDevice>, BleError> {
    let adapter = get_adapter().await?;

    adapter.start_scan(ScanFilter::default()).await?;
    tokio::time::sleep(duration).await;

    let peripherals = adapter.peripherals().await?;
    let mut devices = Vec::new();

    for peripheral in peripherals {
        if let Some(props) = peripheral.properties().await? {
            let name = props.local_name.unwrap_or_else(|| "Unknown".to_string());
            let is_fingerlock = is_fingerlock(&name, marker);

            devices.push(FingerlockDevice {
                handle: peripheral_handle(&peripheral),
                rssi: props.rssi,
                name,
                is_fingerlock,
            });
        }
    }

    adapter.stop_scan().await?;
    Ok(devices)
}
