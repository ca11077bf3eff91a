//! BLE GATT identifiers for the fingerprint sensor and door lock
//!
//! Every UUID follows the peripheral firmware's scheme:
//! `F000` + four-digit role code + `-0451-4000-B000-000000000000`.

use uuid::Uuid;

/// Fixed leading four hex digits of every fingerlock UUID
pub const UUID_PREFIX: &str = "F000";

/// Fixed trailing part of every fingerlock UUID
pub const UUID_SUFFIX: &str = "-0451-4000-B000-000000000000";

/// Fingerprint Service UUID: F0001130-0451-4000-B000-000000000000
pub const FINGERPRINT_SERVICE_UUID: Uuid = Uuid::from_u128(0xF0001130_0451_4000_B000_000000000000);

/// Fingerprint data chunk 1 (read)
pub const FINGER_DATA1_UUID: Uuid = Uuid::from_u128(0xF0001131_0451_4000_B000_000000000000);

/// Fingerprint data chunk 2 (read)
pub const FINGER_DATA2_UUID: Uuid = Uuid::from_u128(0xF0001132_0451_4000_B000_000000000000);

/// Fingerprint data chunk 3 (read)
pub const FINGER_DATA3_UUID: Uuid = Uuid::from_u128(0xF0001133_0451_4000_B000_000000000000);

/// Fingerprint detection event (notify)
pub const FINGER_EVENT_UUID: Uuid = Uuid::from_u128(0xF0001134_0451_4000_B000_000000000000);

/// Door Lock Service UUID: F0001140-0451-4000-B000-000000000000
pub const DOORLOCK_SERVICE_UUID: Uuid = Uuid::from_u128(0xF0001140_0451_4000_B000_000000000000);

/// Lock state (write with response)
pub const LOCK_STATE_UUID: Uuid = Uuid::from_u128(0xF0001141_0451_4000_B000_000000000000);

/// Builds the canonical upper-case string form for a role code, e.g. `"1130"`
pub fn uuid_string(code: &str) -> String {
    format!("{UUID_PREFIX}{code}{UUID_SUFFIX}")
}

/// The two services the central cares about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceRole {
    Fingerprint,
    DoorLock,
}

impl ServiceRole {
    pub const ALL: [ServiceRole; 2] = [ServiceRole::Fingerprint, ServiceRole::DoorLock];

    pub const fn uuid(self) -> Uuid {
        match self {
            ServiceRole::Fingerprint => FINGERPRINT_SERVICE_UUID,
            ServiceRole::DoorLock => DOORLOCK_SERVICE_UUID,
        }
    }

    pub const fn code(self) -> &'static str {
        match self {
            ServiceRole::Fingerprint => "1130",
            ServiceRole::DoorLock => "1140",
        }
    }

    pub fn from_uuid(uuid: Uuid) -> Option<Self> {
        Self::ALL.into_iter().find(|role| role.uuid() == uuid)
    }
}

/// Logical role of a characteristic on the peripheral
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CharacteristicRole {
    FingerData1,
    FingerData2,
    FingerData3,
    FingerEventDetect,
    LockState,
}

impl CharacteristicRole {
    pub const ALL: [CharacteristicRole; 5] = [
        CharacteristicRole::FingerData1,
        CharacteristicRole::FingerData2,
        CharacteristicRole::FingerData3,
        CharacteristicRole::FingerEventDetect,
        CharacteristicRole::LockState,
    ];

    /// Data chunks in assembly order
    pub const DATA: [CharacteristicRole; 3] = [
        CharacteristicRole::FingerData1,
        CharacteristicRole::FingerData2,
        CharacteristicRole::FingerData3,
    ];

    pub const fn uuid(self) -> Uuid {
        match self {
            CharacteristicRole::FingerData1 => FINGER_DATA1_UUID,
            CharacteristicRole::FingerData2 => FINGER_DATA2_UUID,
            CharacteristicRole::FingerData3 => FINGER_DATA3_UUID,
            CharacteristicRole::FingerEventDetect => FINGER_EVENT_UUID,
            CharacteristicRole::LockState => LOCK_STATE_UUID,
        }
    }

    pub const fn code(self) -> &'static str {
        match self {
            CharacteristicRole::FingerData1 => "1131",
            CharacteristicRole::FingerData2 => "1132",
            CharacteristicRole::FingerData3 => "1133",
            CharacteristicRole::FingerEventDetect => "1134",
            CharacteristicRole::LockState => "1141",
        }
    }

    /// Service that owns this characteristic
    pub const fn service(self) -> ServiceRole {
        match self {
            CharacteristicRole::LockState => ServiceRole::DoorLock,
            _ => ServiceRole::Fingerprint,
        }
    }

    /// Slot index (0..3) for the three fingerprint data chunks
    pub const fn data_index(self) -> Option<usize> {
        match self {
            CharacteristicRole::FingerData1 => Some(0),
            CharacteristicRole::FingerData2 => Some(1),
            CharacteristicRole::FingerData3 => Some(2),
            _ => None,
        }
    }

    pub const fn is_fingerprint_data(self) -> bool {
        self.data_index().is_some()
    }

    /// Any role whose notifications belong to the fingerprint pipeline
    pub const fn is_fingerprint(self) -> bool {
        matches!(self.service(), ServiceRole::Fingerprint)
    }
}

/// Static (service, characteristic) -> role table
pub struct CharacteristicRegistry;

impl CharacteristicRegistry {
    const TABLE: [(Uuid, Uuid, CharacteristicRole); 5] = [
        (FINGERPRINT_SERVICE_UUID, FINGER_DATA1_UUID, CharacteristicRole::FingerData1),
        (FINGERPRINT_SERVICE_UUID, FINGER_DATA2_UUID, CharacteristicRole::FingerData2),
        (FINGERPRINT_SERVICE_UUID, FINGER_DATA3_UUID, CharacteristicRole::FingerData3),
        (FINGERPRINT_SERVICE_UUID, FINGER_EVENT_UUID, CharacteristicRole::FingerEventDetect),
        (DOORLOCK_SERVICE_UUID, LOCK_STATE_UUID, CharacteristicRole::LockState),
    ];

    /// Role for a characteristic discovered under `service`, or `None` if unknown
    pub fn lookup(service: Uuid, characteristic: Uuid) -> Option<CharacteristicRole> {
        Self::TABLE
            .iter()
            .find(|(s, c, _)| *s == service && *c == characteristic)
            .map(|(_, _, role)| *role)
    }

    /// Service UUIDs to pass as the discovery filter
    pub fn service_filter() -> Vec<Uuid> {
        ServiceRole::ALL.iter().map(|s| s.uuid()).collect()
    }
}
