//! Fingerlock wire protocol - GATT identifiers, lock commands and payload hex codec

pub mod ble;

pub use ble::{CharacteristicRegistry, CharacteristicRole, ServiceRole};

/// Lock command bytes written to the lock state characteristic
pub mod commands {
    /// Lock the door (fingerprint rejected)
    pub const CLOSE: u8 = 0x01;

    /// Unlock the door (fingerprint accepted)
    pub const OPEN: u8 = 0x02;
}

/// Command the central writes to the door lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockCommand {
    Open,
    Close,
}

impl LockCommand {
    pub const fn to_byte(self) -> u8 {
        match self {
            LockCommand::Open => commands::OPEN,
            LockCommand::Close => commands::CLOSE,
        }
    }

    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            commands::OPEN => Some(LockCommand::Open),
            commands::CLOSE => Some(LockCommand::Close),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HexError {
    #[error("invalid hex payload: {0}")]
    Decode(#[from] data_encoding::DecodeError),
}

/// Lower-case hex text for a characteristic payload
pub fn hex_encode(bytes: &[u8]) -> String {
    data_encoding::HEXLOWER.encode(bytes)
}

/// Parse hex text back into bytes.
///
/// Either case is accepted and ASCII whitespace between digits is skipped,
/// so `"AA bb\n01"` decodes to `[0xaa, 0xbb, 0x01]`.
pub fn hex_decode(text: &str) -> Result<Vec<u8>, HexError> {
    let compact: Vec<u8> = text.bytes().filter(|b| !b.is_ascii_whitespace()).collect();
    Ok(data_encoding::HEXLOWER_PERMISSIVE.decode(&compact)?)
}
