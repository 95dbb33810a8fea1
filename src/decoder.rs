//! Decoder for QardioARM Blood Pressure Measurement indications.
//!
//! The cuff does not send the multi-byte SFLOAT layout of the Bluetooth Blood
//! Pressure profile. Each value sits in a single byte:
//!
//! ```text
//! [0] : flags, bit 4 (0x10) set = final reading, clear = intermediate
//! [1] : systolic (mmHg)
//! [3] : diastolic (mmHg)
//! [7] : pulse (bpm)
//! ```
//!
//! Truncated packets are tolerated: a missing byte reads as `0`.

use thiserror::Error;

/// Flag bit marking a final (stabilised) reading.
const FINAL_FLAG: u8 = 0b1_0000;

const SYSTOLIC_OFFSET: usize = 1;
const DIASTOLIC_OFFSET: usize = 3;
const PULSE_OFFSET: usize = 7;

/// Systolic value at or above which a zero pulse means the measurement failed.
const FAILED_SYSTOLIC_THRESHOLD: u16 = 250;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("empty measurement notification")]
    Empty,
}

/// Values carried by one measurement notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    pub systolic_mmhg: u16,
    pub diastolic_mmhg: u16,
    pub pulse_bpm: u16,
    pub is_intermediate: bool,
    pub is_failed: bool,
}

fn byte_at(bytes: &[u8], offset: usize) -> u16 {
    bytes.get(offset).copied().map(u16::from).unwrap_or(0)
}

/// Decode one measurement notification.
///
/// Never fails on short input; only an empty buffer is rejected.
pub fn decode(bytes: &[u8]) -> Result<Sample, DecodeError> {
    let flags = *bytes.first().ok_or(DecodeError::Empty)?;

    let systolic_mmhg = byte_at(bytes, SYSTOLIC_OFFSET);
    let diastolic_mmhg = byte_at(bytes, DIASTOLIC_OFFSET);
    let pulse_bpm = byte_at(bytes, PULSE_OFFSET);

    Ok(Sample {
        systolic_mmhg,
        diastolic_mmhg,
        pulse_bpm,
        is_intermediate: flags & FINAL_FLAG == 0,
        is_failed: pulse_bpm == 0 && systolic_mmhg >= FAILED_SYSTOLIC_THRESHOLD,
    })
}
