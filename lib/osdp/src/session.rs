//! Per-device session context shared by both sides of the protocol. A
//! control panel owns one of these per connected peripheral; a peripheral
//! owns exactly one describing itself.

use crate::channel::Channel;
use crate::cmd::{Fifo, QueuedCmd, QUEUE_CAPACITY};
use crate::config::PdInfo;
use crate::sc::ScSession;
use crate::types::{Capability, Command, Event, NakCode, PdId, CAP_SENTINEL};
use keel::logging::{self, Logger};
use std::time::Instant;

/// Fixed receive buffer size per device.
pub(crate) const RX_BUF_SIZE: usize = 256;

pub(crate) struct PdSession {
    /// Index of this device within the control panel context.
    pub offset: usize,
    pub address: u8,
    pub baud_rate: u32,
    pub id: PdId,
    pub caps: [Capability; CAP_SENTINEL],

    // Session flags.
    pub pd_mode: bool,
    pub sc_capable: bool,
    pub sc_active: bool,
    pub sc_use_scbkd: bool,
    pub sc_scbkd_done: bool,
    pub install_mode: bool,
    pub await_resp: bool,
    pub tamper: bool,
    pub power_fault: bool,
    pub reader_tamper: bool,

    // Current exchange.
    pub cmd_id: u8,
    pub reply_id: u8,
    pub nak_code: NakCode,
    /// Command staged for (re)transmission on the CP, or decoded for reply
    /// framing on the PD.
    pub staged_cmd: Option<Command>,
    /// Event picked off the queue for the POLL reply being built.
    pub staged_event: Option<Event>,

    /// Packet sequence number; -1 until the first exchange establishes it.
    pub seq_number: i32,

    pub rx_buf: [u8; RX_BUF_SIZE],
    pub rx_len: usize,

    pub tstamp: Instant,
    pub phy_tstamp: Instant,
    pub sc_tstamp: Instant,

    pub sc: ScSession,
    pub queue: Fifo<QueuedCmd>,
    pub channel: Box<dyn Channel>,
    pub log: Logger,
}

impl PdSession {
    pub fn new(offset: usize, info: PdInfo, log: &Logger) -> PdSession {
        let now = Instant::now();
        let mut caps = [Capability::default(); CAP_SENTINEL];

        for cap in &info.capabilities {
            let fc = cap.function_code as usize;
            if fc > 0 && fc < CAP_SENTINEL {
                caps[fc] = *cap;
            }
        }

        let mut sc = ScSession::new();
        if let Some(scbk) = info.scbk {
            sc.scbk = scbk;
        }

        PdSession {
            offset,
            address: info.address,
            baud_rate: info.baud_rate,
            id: info.id,
            caps,
            pd_mode: false,
            sc_capable: false,
            sc_active: false,
            sc_use_scbkd: false,
            sc_scbkd_done: false,
            install_mode: false,
            await_resp: false,
            tamper: false,
            power_fault: false,
            reader_tamper: false,
            cmd_id: 0,
            reply_id: 0,
            nak_code: NakCode::None,
            staged_cmd: None,
            staged_event: None,
            seq_number: -1,
            rx_buf: [0; RX_BUF_SIZE],
            rx_len: 0,
            tstamp: now,
            phy_tstamp: now,
            sc_tstamp: now,
            sc,
            queue: Fifo::new(QUEUE_CAPACITY),
            channel: info.channel,
            log: log.new(logging::o!("address" => info.address)),
        }
    }

    #[inline]
    pub fn cap(&self, fc: usize) -> &Capability {
        &self.caps[fc]
    }

    /// Clears the receive buffer and flushes stale bytes off the channel.
    pub fn reset_channel(&mut self) {
        self.rx_len = 0;
        self.channel.flush();
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::channel::MemoryChannel;
    use crate::types::CapFunction;
    use keel::logging::{o, Discard};

    /// A session wired to one end of a memory channel; the other end is
    /// returned for the test to drive.
    pub fn session(pd_mode: bool) -> (PdSession, MemoryChannel) {
        let (near, far) = MemoryChannel::pair();

        let info = PdInfo {
            address: 5,
            baud_rate: 9600,
            id: PdId {
                vendor_code: 0x00a1_b2c3,
                model: 4,
                version: 5,
                serial_number: 0x1122_3344,
                firmware_version: 0x0001_0203,
            },
            capabilities: vec![
                Capability::new(CapFunction::OutputControl, 1, 4),
                Capability::new(CapFunction::ReaderLedControl, 1, 2),
                Capability::new(CapFunction::ReaderAudibleOutput, 1, 1),
                Capability::new(CapFunction::ReaderTextOutput, 1, 1),
                Capability::new(CapFunction::CommunicationSecurity, 1, 1),
            ],
            scbk: None,
            channel: Box::new(near),
        };

        let log = Logger::root(Discard, o!());
        let mut session = PdSession::new(0, info, &log);
        session.pd_mode = pd_mode;

        (session, far)
    }
}
