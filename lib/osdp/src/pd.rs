//! Peripheral-device engine: receives one command at a time, dispatches it
//! to the application and produces exactly one reply, including the device
//! half of the secure-channel handshake.

use crate::channel::Channel;
use crate::cmd::{Fifo, QUEUE_CAPACITY};
use crate::codec;
use crate::config::PdInfo;
use crate::phy::{self, FrameError};
use crate::session::{PdSession, RX_BUF_SIZE};
use crate::types::{CapFunction, Capability, Command, Event, NakCode};
use keel::crypto::CryptoSuite;
use keel::logging::{self, Logger};
use keel::time::millis_since;
use std::time::Instant;

/// Application hook invoked for every actionable command; returning false
/// rejects the command and NAKs it.
pub type CommandCallback = Box<dyn FnMut(&Command) -> bool>;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum PdState {
    Idle,
    SendReply,
    Err,
}

enum RecvPoll {
    /// A complete frame; payload bounds within the receive buffer.
    Frame(usize, usize),
    NoData,
    /// The frame was rejected with a staged NAK reply.
    NakStaged,
    Fatal,
}

/// The peripheral-device context.
pub struct PeripheralDevice {
    session: PdSession,
    state: PdState,
    events: Fifo<Event>,
    callback: Option<CommandCallback>,
    crypto: Box<dyn CryptoSuite>,
    resp_timeout_ms: u64,
}

impl PeripheralDevice {
    pub fn setup<'a, L: Into<Option<&'a Logger>>>(
        info: PdInfo,
        crypto: Box<dyn CryptoSuite>,
        log: L,
    ) -> PeripheralDevice {
        let log = match log.into() {
            Some(log) => log.new(logging::o!("role" => "pd")),
            None => Logger::root(logging::Discard, logging::o!()),
        };

        let provisioned = info.scbk.is_some();
        let mut session = PdSession::new(0, info, &log);
        session.pd_mode = true;
        session.sc_capable = crypto.is_available();

        // Driver-implicit capabilities; these reflect the build, not the
        // setup descriptor.
        session.caps[CapFunction::CheckCharacterSupport as usize] =
            Capability::new(CapFunction::CheckCharacterSupport, 1, 0);
        session.caps[CapFunction::CommunicationSecurity as usize] = if crypto.is_available() {
            Capability::new(CapFunction::CommunicationSecurity, 1, 1)
        } else {
            Capability::new(CapFunction::CommunicationSecurity, 0, 0)
        };

        if crypto.is_available() && !provisioned {
            logging::warn!(log, "no SCBK provisioned; device in install mode";
                           "context" => "setup");
            session.install_mode = true;
        }

        PeripheralDevice {
            session,
            state: PdState::Idle,
            events: Fifo::new(QUEUE_CAPACITY),
            callback: None,
            crypto,
            resp_timeout_ms: 200,
        }
    }

    pub fn set_command_callback<F: FnMut(&Command) -> bool + 'static>(&mut self, cb: F) {
        self.callback = Some(Box::new(cb));
    }

    /// Queues an event to be surfaced in the next POLL reply.
    pub fn notify_event(&mut self, event: Event) -> Result<(), crate::cmd::QueueFull> {
        self.events.enqueue(event)
    }

    /// Drains one handled command (currently COMSET parameter changes) for
    /// application-side persistence.
    pub fn fetch_command(&mut self) -> Option<Command> {
        self.session.queue.dequeue().and_then(|cmd| cmd.body)
    }

    #[inline]
    pub fn is_sc_active(&self) -> bool {
        self.session.sc_active
    }

    #[inline]
    pub fn address(&self) -> u8 {
        self.session.address
    }

    #[inline]
    pub fn baud_rate(&self) -> u32 {
        self.session.baud_rate
    }

    /// Advances the device state machine by one step; never blocks beyond
    /// one channel send.
    pub fn update(&mut self) {
        let PeripheralDevice {
            session,
            state,
            events,
            callback,
            crypto,
            resp_timeout_ms,
        } = self;

        loop {
            match state {
                PdState::Idle => {
                    let ret = receive_packet(session, crypto.as_ref());

                    let timed_out = (session.rx_len > 0 || session.sc_active)
                        && millis_since(session.tstamp) > *resp_timeout_ms;
                    if matches!(ret, RecvPoll::Fatal) || timed_out {
                        // A stalled exchange invalidates any established
                        // secure channel.
                        logging::error!(session.log, "receive errors/timeout";
                                        "context" => "update");
                        *state = PdState::Err;
                        break;
                    }

                    match ret {
                        RecvPoll::NoData => break,
                        RecvPoll::Frame(start, end) => {
                            let mut payload = [0u8; RX_BUF_SIZE];
                            let len = end - start;
                            payload[..len].copy_from_slice(&session.rx_buf[start..end]);
                            codec::decode_command(session, events, callback, &payload[..len]);
                        }
                        RecvPoll::NakStaged => {}
                        RecvPoll::Fatal => unreachable!("handled above"),
                    }

                    *state = PdState::SendReply;
                    continue;
                }
                PdState::SendReply => {
                    if send_reply(session, crypto.as_mut()).is_err() {
                        *state = PdState::Err;
                        break;
                    }
                    session.rx_len = 0;
                    *state = PdState::Idle;
                    break;
                }
                PdState::Err => {
                    // Momentary: drop secure-channel state and resynchronize.
                    session.sc_active = false;
                    session.reset_channel();
                    *state = PdState::Idle;
                    break;
                }
            }
        }
    }
}

fn receive_packet(pd: &mut PdSession, crypto: &dyn CryptoSuite) -> RecvPoll {
    let was_empty = pd.rx_len == 0;
    let rx_len = pd.rx_len;

    match pd.channel.recv(&mut pd.rx_buf[rx_len..]) {
        Ok(0) | Err(_) => return RecvPoll::NoData,
        Ok(count) => {
            if was_empty {
                // Start of a new message.
                pd.tstamp = Instant::now();
            }
            pd.rx_len += count;
        }
    }

    // Reset the previous exchange so the packet layer can stage a NAK.
    pd.reply_id = 0;
    pd.nak_code = NakCode::None;

    match phy::packet_decode(pd, crypto) {
        Ok((start, end)) => RecvPoll::Frame(start, end),
        Err(FrameError::Wait) => RecvPoll::NoData,
        Err(FrameError::Skip) => {
            pd.reset_channel();
            RecvPoll::NoData
        }
        Err(FrameError::Fmt) => {
            if pd.reply_id != 0 {
                RecvPoll::NakStaged
            } else {
                RecvPoll::Fatal
            }
        }
    }
}

/// Frames and transmits the staged reply; blocking for at most one packet.
fn send_reply(pd: &mut PdSession, crypto: &mut dyn CryptoSuite) -> Result<(), ()> {
    let mut buf = [0u8; RX_BUF_SIZE];

    let data_off = phy::packet_init(pd, &mut buf).map_err(|_| ())?;
    let len = codec::build_reply(pd, crypto, &mut buf).map_err(|err| {
        logging::error!(pd.log, "failed to build reply";
                        "context" => "send_reply",
                        "reply" => pd.reply_id,
                        "error" => ?err);
    })?;
    let total = phy::packet_finalize(pd, &mut buf, data_off + len, crypto).map_err(|_| ())?;

    match pd.channel.send(&buf[..total]) {
        Ok(sent) if sent == total => Ok(()),
        other => {
            logging::error!(pd.log, "channel send failed";
                            "context" => "send_reply",
                            "expected" => total,
                            "result" => ?other.map_err(|e| e.kind()));
            Err(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Channel, MemoryChannel};
    use crate::codec::{
        CMD_COMSET, CMD_POLL, REPLY_ACK, REPLY_COM, REPLY_KEYPPAD, REPLY_NAK,
    };
    use crate::session::test_support;
    use crate::types::*;
    use keel::crypto::{Aes128Suite, NullSuite};

    /// Builds a device under test and a CP-mode session for framing
    /// commands at it.
    fn device_pair(scbk: Option<[u8; 16]>) -> (PeripheralDevice, PdSession) {
        let (near, far) = MemoryChannel::pair();

        let (mut driver, _unused) = test_support::session(false);
        driver.channel = Box::new(far);

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
            ],
            scbk,
            channel: Box::new(near),
        };

        let pd = PeripheralDevice::setup(info, Box::new(Aes128Suite), None);
        (pd, driver)
    }

    /// Frames a command at the device and returns the decoded reply
    /// payload.
    fn exchange(pd: &mut PeripheralDevice, driver: &mut PdSession, id: u8, body: Option<Command>) -> Vec<u8> {
        let mut crypto = Aes128Suite;

        driver.cmd_id = id;
        driver.staged_cmd = body;
        let mut buf = [0u8; RX_BUF_SIZE];
        let off = phy::packet_init(driver, &mut buf).unwrap();
        let len = codec::build_command(driver, None, &mut crypto, &mut buf).unwrap();
        let total = phy::packet_finalize(driver, &mut buf, off + len, &crypto).unwrap();
        driver.channel.send(&buf[..total]).unwrap();

        pd.update();

        let rx_len = driver.rx_len;
        let count = driver.channel.recv(&mut driver.rx_buf[rx_len..]).unwrap();
        assert!(count > 0, "device did not reply");
        driver.rx_len += count;

        let (start, end) = phy::packet_decode(driver, &crypto).expect("valid reply frame");
        let payload = driver.rx_buf[start..end].to_vec();
        driver.rx_len = 0;
        payload
    }

    #[test]
    fn test_poll_acks_when_quiet() {
        let (mut pd, mut driver) = device_pair(Some([1; 16]));

        let reply = exchange(&mut pd, &mut driver, CMD_POLL, None);
        assert_eq!(reply, vec![REPLY_ACK]);
    }

    #[test]
    fn test_poll_surfaces_queued_keypress() {
        let (mut pd, mut driver) = device_pair(Some([1; 16]));

        let mut keys = [0u8; KEYPRESS_MAX_LEN];
        keys[..3].copy_from_slice(&[4, 5, 6]);
        pd.notify_event(Event::KeyPress(KeyPressEvent {
            reader: 0,
            length: 3,
            data: keys,
        }))
        .unwrap();

        let reply = exchange(&mut pd, &mut driver, CMD_POLL, None);
        assert_eq!(reply, vec![REPLY_KEYPPAD, 0, 3, 4, 5, 6]);

        // The queue drained; the next poll is a plain ACK.
        let reply = exchange(&mut pd, &mut driver, CMD_POLL, None);
        assert_eq!(reply, vec![REPLY_ACK]);
    }

    #[test]
    fn test_callback_rejection_naks_with_record() {
        let (mut pd, mut driver) = device_pair(Some([1; 16]));
        pd.set_command_callback(|_| false);

        let cmd = Command::Buzzer(BuzzerCommand {
            reader: 0,
            control_code: 1,
            on_count: 1,
            off_count: 1,
            rep_count: 1,
        });
        let reply = exchange(&mut pd, &mut driver, codec::CMD_BUZ, Some(cmd));
        assert_eq!(reply, vec![REPLY_NAK, NakCode::Record as u8]);
    }

    #[test]
    fn test_comset_echoes_new_params_then_adopts() {
        let (mut pd, mut driver) = device_pair(Some([1; 16]));

        let cmd = Command::ComSet(ComSetCommand {
            address: 6,
            baud_rate: 38_400,
        });
        let reply = exchange(&mut pd, &mut driver, CMD_COMSET, Some(cmd.clone()));

        assert_eq!(reply, vec![REPLY_COM, 6, 0x00, 0x96, 0x00, 0x00]);
        assert_eq!(pd.address(), 6);
        assert_eq!(pd.baud_rate(), 38_400);
        assert_eq!(pd.fetch_command(), Some(cmd));

        // The device now answers on the new address.
        driver.address = 6;
        let reply = exchange(&mut pd, &mut driver, CMD_POLL, None);
        assert_eq!(reply, vec![REPLY_ACK]);
    }

    #[test]
    fn test_comset_invalid_params_keep_current() {
        let (mut pd, mut driver) = device_pair(Some([1; 16]));

        let cmd = Command::ComSet(ComSetCommand {
            address: 6,
            baud_rate: 1200, // unsupported
        });
        let reply = exchange(&mut pd, &mut driver, CMD_COMSET, Some(cmd));

        // Echoes the unchanged parameters.
        assert_eq!(reply, vec![REPLY_COM, 5, 0x80, 0x25, 0x00, 0x00]);
        assert_eq!(pd.address(), 5);
        assert_eq!(pd.baud_rate(), 9600);
    }

    #[test]
    fn test_receive_timeout_clears_secure_channel() {
        let (mut pd, _driver) = device_pair(Some([1; 16]));

        pd.session.sc_active = true;
        pd.session.tstamp = Instant::now() - std::time::Duration::from_millis(500);

        pd.update(); // trips the timeout, enters the error state
        pd.update(); // error state recovers to idle

        assert!(!pd.is_sc_active());
        assert_eq!(pd.state, PdState::Idle);
    }

    #[test]
    fn test_null_crypto_disables_sc_capability() {
        let (near, _far) = MemoryChannel::pair();
        let info = PdInfo {
            address: 1,
            baud_rate: 9600,
            id: Default::default(),
            capabilities: Vec::new(),
            scbk: None,
            channel: Box::new(near),
        };
        let pd = PeripheralDevice::setup(info, Box::new(NullSuite), None);

        let cap = pd.session.cap(CapFunction::CommunicationSecurity as usize);
        assert_eq!(cap.compliance_level, 0);
        assert!(!pd.session.sc_capable);
        assert!(!pd.session.install_mode);
    }

    #[test]
    fn test_install_mode_without_key() {
        let (pd, _driver) = device_pair(None);
        assert!(pd.session.install_mode);

        let (pd, _driver) = device_pair(Some([1; 16]));
        assert!(!pd.session.install_mode);
    }
}
