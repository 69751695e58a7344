//! Setup descriptors and tunable protocol intervals.

use crate::channel::Channel;
use crate::types::{Capability, PdId};
use serde_derive::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Largest valid device address; 0x7F is reserved for broadcast.
pub const MAX_PD_ADDRESS: u8 = 0x7E;

/// Baud rates a COMSET command may select.
pub const SUPPORTED_BAUD_RATES: [u32; 3] = [9600, 38_400, 115_200];

/// Describes one peripheral device at setup time: its identity and
/// capabilities, the channel it is reached over and, on the peripheral
/// side, the provisioned secure-channel base key (`None` puts the device
/// in install mode).
pub struct PdInfo {
    pub address: u8,
    pub baud_rate: u32,
    pub id: PdId,
    pub capabilities: Vec<Capability>,
    pub scbk: Option<[u8; 16]>,
    pub channel: Box<dyn Channel>,
}

/// Control-panel protocol intervals and the optional secure-channel master
/// key. The defaults match the documented protocol constants.
#[derive(Serialize, Deserialize, Clone)]
pub struct CpConfig {
    /// POLL cadence in polls per second.
    pub poll_rate: u64,
    /// Response timeout for one command, milliseconds.
    pub resp_timeout_ms: u64,
    /// Backoff before re-sending a command the device answered BUSY to.
    pub retry_wait_ms: u64,
    /// Interval before an offline device is contacted again, seconds.
    pub offline_wait_sec: u64,
    /// Interval between secure-channel attempts from a non-secure online
    /// state, seconds.
    pub sc_retry_sec: u64,
    pub master_key: Option<[u8; 16]>,
}

impl Default for CpConfig {
    fn default() -> CpConfig {
        CpConfig {
            poll_rate: 20,
            resp_timeout_ms: 200,
            retry_wait_ms: 300,
            offline_wait_sec: 5,
            sc_retry_sec: 600,
            master_key: None,
        }
    }
}

impl CpConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> CpConfig {
        serdeconv::from_toml_file(path).expect("Error loading control panel configuration file")
    }

    /// Milliseconds between POLL commands to one device.
    #[inline]
    pub fn poll_interval_ms(&self) -> u64 {
        1000 / self.poll_rate
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ConfigError {
    BadToken(String),
    AddressRange(u8),
    CountMismatch { got: usize, expected: usize },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::BadToken(tok) => write!(f, "address list token `{}` is not a number", tok),
            ConfigError::AddressRange(addr) => write!(f, "address {} out of range", addr),
            ConfigError::CountMismatch { got, expected } => {
                write!(f, "address list has {} entries, expected {}", got, expected)
            }
        }
    }
}

/// Parses a comma/space-separated list of decimal device addresses. The
/// entry count must match the number of configured devices.
pub fn parse_address_list(list: &str, expected: usize) -> Result<Vec<u8>, ConfigError> {
    let mut addresses = Vec::with_capacity(expected);

    for token in list.split(|c| c == ',' || c == ' ').filter(|t| !t.is_empty()) {
        let addr: u8 = token
            .parse()
            .map_err(|_| ConfigError::BadToken(token.to_string()))?;
        if addr > MAX_PD_ADDRESS {
            return Err(ConfigError::AddressRange(addr));
        }
        addresses.push(addr);
    }

    if addresses.len() != expected {
        return Err(ConfigError::CountMismatch {
            got: addresses.len(),
            expected,
        });
    }
    Ok(addresses)
}
