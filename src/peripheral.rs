//! Handle identifying one discovered Bluetooth LE peripheral.
//!
//! The handle wraps the 6-byte device address and is decoupled from any
//! specific Bluetooth library.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Identifies a discovered or connected peripheral by its device address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PeripheralHandle([u8; 6]);

impl PeripheralHandle {
    pub const fn new(address: [u8; 6]) -> Self {
        Self(address)
    }

    pub fn address(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for PeripheralHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

/// Errors returned when parsing a device address.
#[derive(Error, Debug, PartialEq)]
pub enum ParseAddressError {
    #[error("invalid device address: expected 6 octets, got {0}")]
    OctetCount(usize),
    #[error("invalid device address: '{0}' is not a hex octet")]
    Octet(String),
}

impl FromStr for PeripheralHandle {
    type Err = ParseAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let octets: Vec<&str> = s.trim().split(':').collect();
        if octets.len() != 6 {
            return Err(ParseAddressError::OctetCount(octets.len()));
        }

        let mut address = [0u8; 6];
        for (slot, octet) in address.iter_mut().zip(&octets) {
            if octet.len() != 2 || !octet.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(ParseAddressError::Octet(octet.to_string()));
            }
            *slot = u8::from_str_radix(octet, 16)
                .map_err(|_| ParseAddressError::Octet(octet.to_string()))?;
        }

        Ok(Self(address))
    }
}

#[cfg(feature = "bluer")]
impl From<bluer::Address> for PeripheralHandle {
    fn from(addr: bluer::Address) -> Self {
        Self(addr.0)
    }
}

#[cfg(feature = "bluer")]
impl From<PeripheralHandle> for bluer::Address {
    fn from(handle: PeripheralHandle) -> Self {
        bluer::Address(handle.0)
    }
}
