//! Bidirectional implementation of an access-control serial protocol: a
//! control panel polls peripheral devices (card readers, keypads, output
//! boards) over a half-duplex byte channel and each command is answered by
//! exactly one reply, optionally under an AES-128 secure channel.

#![allow(clippy::new_without_default)]

pub mod channel;
pub mod config;
pub mod cp;
pub mod pd;
pub mod types;

mod cmd;
mod codec;
mod phy;
mod sc;
mod session;

pub use crate::channel::{Channel, MemoryChannel};
pub use crate::cmd::QueueFull;
pub use crate::config::{parse_address_list, ConfigError, CpConfig, PdInfo};
pub use crate::cp::{ControlPanel, SendError};
pub use crate::pd::{CommandCallback, PeripheralDevice};
pub use crate::types::*;
