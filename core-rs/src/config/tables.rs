//! Radio parameter lookup tables
//!
//! Small closed-domain functions implemented as ordered boundary tables with a
//! total-order scan. Inputs above the documented range fail with a Config
//! error, never silently clamp.

use crate::errors::{HarnessError, Result};

/// (upper PRB bound inclusive, FFT symbol size)
const PRB_SYMBOL_SIZE: &[(u16, u32)] = &[
    (6, 128),
    (15, 256),
    (50, 768),
    (75, 1024),
    (110, 1536),
];

/// (upper PRB bound inclusive, channel bandwidth in MHz)
const PRB_BANDWIDTH_MHZ: &[(u16, f64)] = &[
    (6, 1.4),
    (15, 3.0),
    (25, 5.0),
    (50, 10.0),
    (75, 15.0),
    (110, 20.0),
];

/// FFT symbol size for a cell of `num_prb` physical resource blocks.
pub fn num_prb_to_symbol_size(num_prb: u16) -> Result<u32> {
    for &(bound, size) in PRB_SYMBOL_SIZE {
        if num_prb <= bound {
            return Ok(size);
        }
    }
    Err(HarnessError::Config(format!(
        "unsupported num_prb {}",
        num_prb
    )))
}

/// Base sample rate in Hz: symbol size x 15 kHz subcarrier spacing.
pub fn num_prb_to_base_srate(num_prb: u16) -> Result<u32> {
    Ok(num_prb_to_symbol_size(num_prb)? * 15 * 1000)
}

/// Channel bandwidth in MHz for a cell of `num_prb` resource blocks.
pub fn num_prb_to_bandwidth_mhz(num_prb: u16) -> Result<f64> {
    for &(bound, bw) in PRB_BANDWIDTH_MHZ {
        if num_prb <= bound {
            return Ok(bw);
        }
    }
    Err(HarnessError::Config(format!(
        "unsupported num_prb {}",
        num_prb
    )))
}

/// QoS class identifier for an RLC DRB mode ("UM" or "AM", case-insensitive).
pub fn rlc_drb_mode_to_qci(rlc_drb_mode: &str) -> Result<u8> {
    match rlc_drb_mode.to_ascii_uppercase().as_str() {
        "UM" => Ok(7),
        "AM" => Ok(9),
        other => Err(HarnessError::Config(format!(
            "unexpected rlc_drb_mode {}",
            other
        ))),
    }
}
