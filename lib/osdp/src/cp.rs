//! Control-panel engine: the per-device phy state machine that moves one
//! command at a time across the wire, and the session state machine that
//! walks each device through identification, capability discovery, the
//! secure-channel handshake and steady-state polling.

use crate::channel::Channel;
use crate::cmd::QueuedCmd;
use crate::codec::{
    self, ReplyOutcome, CMD_CAP, CMD_CHLNG, CMD_ID, CMD_KEYSET, CMD_POLL, CMD_SCRYPT, REPLY_CCRYPT,
    REPLY_NAK, REPLY_PDCAP, REPLY_PDID, REPLY_RMAC_I,
};
use crate::config::{CpConfig, PdInfo};
use crate::phy::{self, FrameError};
use crate::session::{PdSession, RX_BUF_SIZE};
use crate::types::{CardFormat, Command, KeySetCommand};
use keel::crypto::CryptoSuite;
use keel::logging::{self, Logger};
use keel::time::millis_since;
use std::time::Instant;

/// Application notification callbacks for decoded device events.
pub(crate) struct Notifier {
    pub keypress: Option<Box<dyn FnMut(usize, u8)>>,
    pub cardread: Option<Box<dyn FnMut(usize, CardFormat, u16, &[u8])>>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum CpState {
    Init,
    IdReq,
    CapDet,
    ScInit,
    ScChlng,
    ScScrypt,
    SetScbk,
    Online,
    Offline,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum PhyState {
    Idle,
    SendCmd,
    ReplyWait,
    RetryWait,
    Err,
    ErrWait,
    Cleanup,
}

/// Outcome of one phy-layer step.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum PhyPoll {
    /// Queue empty; the session machine may dispatch.
    Idle,
    /// An exchange is in flight.
    InProgress,
    /// The device answered BUSY; the staged command will be re-sent.
    RetryCmd,
    /// An exchange just completed; the tick driver may move on.
    CanYield,
    /// The exchange failed.
    Err,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Dispatch {
    /// The previously dispatched command has been answered.
    Ready,
    /// The command was enqueued; the reply is outstanding.
    Pending,
    Failed,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SendError {
    InvalidPd,
    NotOnline,
    QueueFull,
    /// KEYSET broadcast requires every device online with an active secure
    /// channel.
    ScRequired,
}

struct CpPd {
    session: PdSession,
    state: CpState,
    phy_state: PhyState,
}

/// The control panel context: one session per connected peripheral, the
/// crypto capability and the application notifiers.
pub struct ControlPanel {
    pds: Vec<CpPd>,
    notifier: Notifier,
    config: CpConfig,
    crypto: Box<dyn CryptoSuite>,
    log: Logger,
}

impl ControlPanel {
    pub fn setup<'a, L: Into<Option<&'a Logger>>>(
        infos: Vec<PdInfo>,
        config: CpConfig,
        crypto: Box<dyn CryptoSuite>,
        log: L,
    ) -> ControlPanel {
        let log = match log.into() {
            Some(log) => log.new(logging::o!("role" => "cp")),
            None => Logger::root(logging::Discard, logging::o!()),
        };

        if crypto.is_available() && config.master_key.is_none() {
            logging::warn!(log, "no master key configured; secure channel disabled";
                           "context" => "setup");
        }

        let pds = infos
            .into_iter()
            .enumerate()
            .map(|(offset, info)| CpPd {
                session: PdSession::new(offset, info, &log),
                state: CpState::Init,
                phy_state: PhyState::Idle,
            })
            .collect();

        ControlPanel {
            pds,
            notifier: Notifier {
                keypress: None,
                cardread: None,
            },
            config,
            crypto,
            log,
        }
    }

    pub fn set_callback_key_press<F: FnMut(usize, u8) + 'static>(&mut self, cb: F) {
        self.notifier.keypress = Some(Box::new(cb));
    }

    pub fn set_callback_card_read<F: FnMut(usize, CardFormat, u16, &[u8]) + 'static>(
        &mut self,
        cb: F,
    ) {
        self.notifier.cardread = Some(Box::new(cb));
    }

    /// Advances every device by one state-machine step. Call at least as
    /// often as the poll rate; never blocks beyond one channel send.
    pub fn update(&mut self) {
        let ControlPanel {
            pds,
            notifier,
            config,
            crypto,
            ..
        } = self;

        for pd in pds.iter_mut() {
            let sc_possible = crypto.is_available() && config.master_key.is_some();
            state_update(pd, notifier, config, crypto.as_mut(), sc_possible);
        }
    }

    /// Queues an application command for one device. KEYSET is a broadcast
    /// and requires every device to be online with an active secure
    /// channel.
    pub fn send_command(&mut self, pd: usize, cmd: Command) -> Result<(), SendError> {
        if pd >= self.pds.len() {
            logging::error!(self.log, "invalid device number"; "context" => "send_command", "pd" => pd);
            return Err(SendError::InvalidPd);
        }

        if let Command::KeySet(keyset) = &cmd {
            return self.broadcast_keyset(*keyset);
        }

        if self.pds[pd].state != CpState::Online {
            logging::warn!(self.log, "device not online"; "context" => "send_command", "pd" => pd);
            return Err(SendError::NotOnline);
        }

        let id = match cmd {
            Command::Output(_) => codec::CMD_OUT,
            Command::Led(_) => codec::CMD_LED,
            Command::Buzzer(_) => codec::CMD_BUZ,
            Command::Text(_) => codec::CMD_TEXT,
            Command::ComSet(_) => codec::CMD_COMSET,
            Command::KeySet(_) => unreachable!("handled above"),
        };

        self.pds[pd]
            .session
            .queue
            .enqueue(QueuedCmd {
                id,
                body: Some(cmd),
            })
            .map_err(|_| SendError::QueueFull)
    }

    /// Queues KEYSET to every device; each queue entry owns its copy of
    /// the key value.
    fn broadcast_keyset(&mut self, keyset: KeySetCommand) -> Result<(), SendError> {
        let all = self.full_mask();
        if self.online_mask() != all || self.sc_active_mask() != all {
            logging::warn!(self.log,
                           "KEYSET requires all devices online with active secure channels";
                           "context" => "send_command");
            return Err(SendError::ScRequired);
        }

        for pd in self.pds.iter_mut() {
            pd.session
                .queue
                .enqueue(QueuedCmd {
                    id: CMD_KEYSET,
                    body: Some(Command::KeySet(keyset)),
                })
                .map_err(|_| SendError::QueueFull)?;
        }
        Ok(())
    }

    #[inline]
    pub fn num_pd(&self) -> usize {
        self.pds.len()
    }

    #[inline]
    pub fn is_online(&self, pd: usize) -> bool {
        self.pds.get(pd).map_or(false, |p| p.state == CpState::Online)
    }

    #[inline]
    pub fn is_sc_active(&self, pd: usize) -> bool {
        self.pds.get(pd).map_or(false, |p| p.session.sc_active)
    }

    /// Bitmask of online devices, one bit per device index.
    pub fn online_mask(&self) -> u32 {
        self.pds
            .iter()
            .enumerate()
            .filter(|(_, p)| p.state == CpState::Online)
            .fold(0, |mask, (i, _)| mask | 1 << i)
    }

    /// Bitmask of devices with an active secure channel.
    pub fn sc_active_mask(&self) -> u32 {
        self.pds
            .iter()
            .enumerate()
            .filter(|(_, p)| p.session.sc_active)
            .fold(0, |mask, (i, _)| mask | 1 << i)
    }

    fn full_mask(&self) -> u32 {
        (1u32 << self.pds.len()) - 1
    }
}

#[inline]
fn set_state(pd: &mut CpPd, state: CpState) {
    pd.state = state;
    pd.session.await_resp = false;
}

fn set_offline(pd: &mut CpPd) {
    logging::warn!(pd.session.log, "device offline"; "context" => "state_update");
    pd.session.sc_active = false;
    pd.state = CpState::Offline;
    pd.session.tstamp = Instant::now();
}

fn reset_state(pd: &mut CpPd) {
    pd.state = CpState::Init;
    pd.phy_state = PhyState::Idle;
    phy::state_reset(&mut pd.session);
}

/// Enqueues a session-generated command, or reports that the previously
/// dispatched one has completed.
fn dispatch(pd: &mut CpPd, cmd_id: u8) -> Dispatch {
    if pd.session.await_resp {
        pd.session.await_resp = false;
        return Dispatch::Ready;
    }

    match pd.session.queue.enqueue(QueuedCmd {
        id: cmd_id,
        body: None,
    }) {
        Ok(()) => {
            pd.session.await_resp = true;
            Dispatch::Pending
        }
        Err(_) => {
            logging::error!(pd.session.log, "command queue exhausted";
                            "context" => "dispatch",
                            "command" => cmd_id);
            Dispatch::Failed
        }
    }
}

/// Frames and transmits the staged command.
fn send_staged_command(
    pd: &mut PdSession,
    master_key: Option<&[u8; 16]>,
    crypto: &mut dyn CryptoSuite,
) -> Result<(), ()> {
    let mut buf = [0u8; RX_BUF_SIZE];

    let data_off = phy::packet_init(pd, &mut buf).map_err(|_| ())?;
    let len = codec::build_command(pd, master_key, crypto, &mut buf).map_err(|err| {
        logging::error!(pd.log, "failed to build command";
                        "context" => "send_command",
                        "command" => pd.cmd_id,
                        "error" => ?err);
    })?;
    let total = phy::packet_finalize(pd, &mut buf, data_off + len, crypto).map_err(|_| ())?;

    // Drop any stale bytes before the exchange starts.
    pd.channel.flush();

    match pd.channel.send(&buf[..total]) {
        Ok(sent) if sent == total => Ok(()),
        other => {
            logging::error!(pd.log, "channel send failed";
                            "context" => "send_command",
                            "expected" => total,
                            "result" => ?other.map_err(|e| e.kind()));
            Err(())
        }
    }
}

enum ReplyPoll {
    NoData,
    Done,
    Retry,
    Error,
}

/// Accumulates reply bytes and decodes a completed frame.
fn process_reply(
    pd: &mut PdSession,
    notifier: &mut Notifier,
    master_key: Option<&[u8; 16]>,
    crypto: &mut dyn CryptoSuite,
) -> ReplyPoll {
    let rx_len = pd.rx_len;
    match pd.channel.recv(&mut pd.rx_buf[rx_len..]) {
        Ok(0) => return ReplyPoll::NoData,
        Ok(count) => pd.rx_len += count,
        Err(err) => {
            logging::error!(pd.log, "channel receive failed";
                            "context" => "process_reply",
                            "error" => ?err.kind());
            return ReplyPoll::Error;
        }
    }

    let (start, end) = match phy::packet_decode(pd, crypto) {
        Ok(bounds) => bounds,
        Err(FrameError::Wait) => return ReplyPoll::NoData,
        Err(FrameError::Skip) => {
            pd.reset_channel();
            return ReplyPoll::NoData;
        }
        Err(FrameError::Fmt) => return ReplyPoll::Error,
    };

    let mut payload = [0u8; RX_BUF_SIZE];
    let len = end - start;
    payload[..len].copy_from_slice(&pd.rx_buf[start..end]);

    match codec::decode_reply(pd, notifier, master_key, crypto, &payload[..len]) {
        Ok(ReplyOutcome::Handled) => ReplyPoll::Done,
        Ok(ReplyOutcome::Busy) => ReplyPoll::Retry,
        Err(err) => {
            logging::error!(pd.log, "reply decode failed";
                            "context" => "process_reply",
                            "command" => pd.cmd_id,
                            "error" => ?err);
            ReplyPoll::Error
        }
    }
}

/// One step of the per-device phy state machine. Never dequeues a command
/// it cannot finish: the staged command survives BUSY backoff for an exact
/// re-send.
fn phy_state_update(
    pd: &mut CpPd,
    notifier: &mut Notifier,
    config: &CpConfig,
    crypto: &mut dyn CryptoSuite,
) -> PhyPoll {
    let master_key = config.master_key;

    match pd.phy_state {
        PhyState::ErrWait => PhyPoll::Err,
        PhyState::Idle | PhyState::SendCmd => {
            if pd.phy_state == PhyState::Idle {
                match pd.session.queue.dequeue() {
                    None => return PhyPoll::Idle,
                    Some(cmd) => {
                        pd.session.cmd_id = cmd.id;
                        pd.session.staged_cmd = cmd.body;
                        pd.session.reset_channel();
                    }
                }
            }

            if send_staged_command(&mut pd.session, master_key.as_ref(), crypto).is_err() {
                pd.phy_state = PhyState::Err;
                return PhyPoll::Err;
            }
            pd.phy_state = PhyState::ReplyWait;
            pd.session.rx_len = 0;
            pd.session.phy_tstamp = Instant::now();
            PhyPoll::InProgress
        }
        PhyState::ReplyWait => {
            match process_reply(&mut pd.session, notifier, master_key.as_ref(), crypto) {
                ReplyPoll::Done => {
                    pd.phy_state = PhyState::Cleanup;
                    PhyPoll::InProgress
                }
                ReplyPoll::Retry => {
                    logging::info!(pd.session.log, "device busy; retrying last command";
                                   "context" => "phy_state_update");
                    pd.session.phy_tstamp = Instant::now();
                    pd.phy_state = PhyState::RetryWait;
                    PhyPoll::RetryCmd
                }
                ReplyPoll::Error => {
                    pd.phy_state = PhyState::Err;
                    PhyPoll::InProgress
                }
                ReplyPoll::NoData => {
                    if millis_since(pd.session.phy_tstamp) > config.resp_timeout_ms {
                        logging::error!(pd.session.log, "response timeout";
                                        "context" => "phy_state_update",
                                        "command" => pd.session.cmd_id);
                        pd.phy_state = PhyState::Err;
                    }
                    PhyPoll::InProgress
                }
            }
        }
        PhyState::RetryWait => {
            if millis_since(pd.session.phy_tstamp) >= config.retry_wait_ms {
                // Re-send the latched command without touching the queue.
                pd.phy_state = PhyState::SendCmd;
                return phy_state_update(pd, notifier, config, crypto);
            }
            PhyPoll::InProgress
        }
        PhyState::Err => {
            pd.session.reset_channel();
            pd.session.queue.clear();
            pd.phy_state = PhyState::ErrWait;
            PhyPoll::Err
        }
        PhyState::Cleanup => {
            pd.phy_state = PhyState::Idle;
            PhyPoll::CanYield
        }
    }
}

/// One step of the per-device session state machine.
fn state_update(
    pd: &mut CpPd,
    notifier: &mut Notifier,
    config: &CpConfig,
    crypto: &mut dyn CryptoSuite,
    sc_possible: bool,
) {
    let phy = phy_state_update(pd, notifier, config, crypto);

    match phy {
        PhyPoll::InProgress | PhyPoll::CanYield | PhyPoll::RetryCmd => return,
        PhyPoll::Idle | PhyPoll::Err => {}
    }

    // A failure during CHLNG falls back to SCBK-D instead of taking the
    // device offline.
    let soft_fail = pd.state == CpState::ScChlng;
    if pd.state != CpState::Offline && phy == PhyPoll::Err && !soft_fail {
        set_offline(pd);
    }

    loop {
        match pd.state {
            CpState::Init => {
                set_state(pd, CpState::IdReq);
                continue;
            }
            CpState::IdReq => {
                if dispatch(pd, CMD_ID) != Dispatch::Ready {
                    break;
                }
                if pd.session.reply_id != REPLY_PDID {
                    logging::error!(pd.session.log, "unexpected reply to identification";
                                    "context" => "state_update",
                                    "reply" => pd.session.reply_id);
                    set_offline(pd);
                    break;
                }
                set_state(pd, CpState::CapDet);
                continue;
            }
            CpState::CapDet => {
                if dispatch(pd, CMD_CAP) != Dispatch::Ready {
                    break;
                }
                if pd.session.reply_id != REPLY_PDCAP {
                    logging::error!(pd.session.log, "unexpected reply to capability discovery";
                                    "context" => "state_update",
                                    "reply" => pd.session.reply_id);
                    set_offline(pd);
                    break;
                }
                if sc_possible && pd.session.sc_capable {
                    pd.session.sc_scbkd_done = false;
                    pd.session.sc_use_scbkd = false;
                    set_state(pd, CpState::ScInit);
                    continue;
                }
                logging::info!(pd.session.log, "device online"; "context" => "state_update");
                set_state(pd, CpState::Online);
                break;
            }
            CpState::ScInit => {
                pd.session.sc.clear();
                set_state(pd, CpState::ScChlng);
                continue;
            }
            CpState::ScChlng => {
                if dispatch(pd, CMD_CHLNG) != Dispatch::Ready {
                    break;
                }
                if phy == PhyPoll::Err {
                    if pd.session.sc_scbkd_done {
                        logging::info!(pd.session.log, "secure channel failed; online without it";
                                       "context" => "state_update");
                        pd.session.sc_tstamp = Instant::now();
                        set_state(pd, CpState::Online);
                        break;
                    }
                    logging::warn!(pd.session.log, "secure channel failed; retrying with SCBK-D";
                                   "context" => "state_update");
                    pd.session.sc_use_scbkd = true;
                    pd.session.sc_scbkd_done = true;
                    set_state(pd, CpState::ScInit);
                    pd.phy_state = PhyState::Idle; // soft reset
                    break;
                }
                if pd.session.reply_id != REPLY_CCRYPT {
                    logging::error!(pd.session.log, "challenge refused; online without secure channel";
                                    "context" => "state_update",
                                    "reply" => pd.session.reply_id);
                    pd.session.sc_tstamp = Instant::now();
                    set_state(pd, CpState::Online);
                    break;
                }
                set_state(pd, CpState::ScScrypt);
                continue;
            }
            CpState::ScScrypt => {
                if dispatch(pd, CMD_SCRYPT) != Dispatch::Ready {
                    break;
                }
                if pd.session.reply_id != REPLY_RMAC_I {
                    logging::error!(pd.session.log, "SCRYPT refused; online without secure channel";
                                    "context" => "state_update",
                                    "reply" => pd.session.reply_id);
                    pd.session.sc_tstamp = Instant::now();
                    set_state(pd, CpState::Online);
                    break;
                }
                if pd.session.sc_use_scbkd {
                    logging::warn!(pd.session.log, "secure channel on SCBK-D; provisioning SCBK";
                                   "context" => "state_update");
                    set_state(pd, CpState::SetScbk);
                    continue;
                }
                logging::info!(pd.session.log, "secure channel active"; "context" => "state_update");
                pd.session.sc_tstamp = Instant::now();
                set_state(pd, CpState::Online);
                break;
            }
            CpState::SetScbk => {
                if dispatch(pd, CMD_KEYSET) != Dispatch::Ready {
                    break;
                }
                if pd.session.reply_id == REPLY_NAK {
                    logging::warn!(pd.session.log, "SCBK refused; continuing with SCBK-D";
                                   "context" => "state_update");
                    set_state(pd, CpState::Online);
                    break;
                }
                logging::info!(pd.session.log, "SCBK set; restarting handshake under the new key";
                               "context" => "state_update");
                pd.session.sc_use_scbkd = false;
                pd.session.sc_active = false;
                pd.session.seq_number = -1;
                set_state(pd, CpState::ScInit);
                continue;
            }
            CpState::Online => {
                if sc_possible
                    && pd.session.sc_capable
                    && !pd.session.sc_active
                    && millis_since(pd.session.sc_tstamp) > config.sc_retry_sec * 1000
                {
                    logging::info!(pd.session.log, "retrying secure channel";
                                   "context" => "state_update");
                    set_state(pd, CpState::ScInit);
                    break;
                }
                if millis_since(pd.session.tstamp) < config.poll_interval_ms() {
                    break;
                }
                if dispatch(pd, CMD_POLL) == Dispatch::Ready {
                    pd.session.tstamp = Instant::now();
                }
                break;
            }
            CpState::Offline => {
                if millis_since(pd.session.tstamp) > config.offline_wait_sec * 1000 {
                    reset_state(pd);
                }
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MemoryChannel;
    use crate::codec::{REPLY_ACK, REPLY_BUSY};
    use crate::session::test_support;
    use keel::crypto::Aes128Suite;
    use std::thread::sleep;
    use std::time::Duration;

    fn test_config() -> CpConfig {
        CpConfig {
            poll_rate: 50,
            resp_timeout_ms: 50,
            retry_wait_ms: 30,
            offline_wait_sec: 1,
            sc_retry_sec: 600,
            master_key: None,
        }
    }

    fn panel_with_responder() -> (ControlPanel, PdSession) {
        let (near, far) = MemoryChannel::pair();

        let (mut responder, _unused) = test_support::session(true);
        responder.channel = Box::new(far);

        let info = PdInfo {
            address: 5,
            baud_rate: 9600,
            id: Default::default(),
            capabilities: Vec::new(),
            scbk: None,
            channel: Box::new(near),
        };

        let cp = ControlPanel::setup(vec![info], test_config(), Box::new(Aes128Suite), None);
        (cp, responder)
    }

    /// Reads one command frame off the responder's channel and answers it
    /// with the given reply id.
    fn respond(responder: &mut PdSession, reply_id: u8) -> Vec<u8> {
        let crypto = Aes128Suite;

        let rx_len = responder.rx_len;
        let count = responder
            .channel
            .recv(&mut responder.rx_buf[rx_len..])
            .unwrap();
        assert!(count > 0, "no command frame on the wire");
        responder.rx_len += count;

        let (start, end) = phy::packet_decode(responder, &crypto).expect("valid command frame");
        let payload = responder.rx_buf[start..end].to_vec();
        responder.rx_len = 0;

        responder.reply_id = reply_id;
        let mut buf = [0u8; RX_BUF_SIZE];
        let off = phy::packet_init(responder, &mut buf).unwrap();
        let mut crypto_dyn = Aes128Suite;
        let len = codec::build_reply(responder, &mut crypto_dyn, &mut buf).unwrap();
        let total = phy::packet_finalize(responder, &mut buf, off + len, &crypto).unwrap();
        responder.channel.send(&buf[..total]).unwrap();

        payload
    }

    #[test]
    fn test_busy_retry_resends_identical_command() {
        let (mut cp, mut responder) = panel_with_responder();

        // Force an online session wanting to poll immediately.
        cp.pds[0].state = CpState::Online;
        cp.pds[0].session.tstamp = Instant::now() - Duration::from_millis(100);

        cp.update(); // dispatch POLL
        cp.update(); // send POLL
        let first = respond(&mut responder, REPLY_BUSY);
        cp.update(); // decode BUSY -> RetryWait

        assert_eq!(cp.pds[0].phy_state, PhyState::RetryWait);
        assert!(cp.pds[0].session.queue.is_empty());

        // Before the backoff elapses nothing is sent.
        cp.update();
        assert_eq!(cp.pds[0].phy_state, PhyState::RetryWait);

        sleep(Duration::from_millis(35));
        cp.update(); // re-send the latched command

        let second = respond(&mut responder, REPLY_ACK);
        assert_eq!(first, second);
        assert!(cp.pds[0].session.queue.is_empty());

        cp.update(); // decode ACK -> cleanup
        assert_eq!(cp.pds[0].phy_state, PhyState::Cleanup);
    }

    #[test]
    fn test_response_timeout_goes_offline_and_recovers() {
        let (near, _far) = MemoryChannel::pair();
        let info = PdInfo {
            address: 1,
            baud_rate: 9600,
            id: Default::default(),
            capabilities: Vec::new(),
            scbk: None,
            channel: Box::new(near),
        };
        let mut config = test_config();
        config.resp_timeout_ms = 20;
        let mut cp = ControlPanel::setup(vec![info], config, Box::new(Aes128Suite), None);

        cp.update(); // INIT -> IDREQ, dispatch CMD_ID
        cp.update(); // send
        assert_eq!(cp.pds[0].phy_state, PhyState::ReplyWait);

        sleep(Duration::from_millis(25));
        cp.update(); // timeout -> phy Err
        cp.update(); // Err -> ErrWait, session offline

        assert_eq!(cp.pds[0].state, CpState::Offline);
        assert!(!cp.is_online(0));

        sleep(Duration::from_millis(1100));
        cp.update(); // offline wait elapsed -> reset to INIT
        cp.update(); // INIT -> IDREQ, re-dispatch CMD_ID
        cp.update(); // send

        assert_eq!(cp.pds[0].session.seq_number, 0);
        assert!(cp.pds[0].session.await_resp);
        assert_eq!(cp.pds[0].state, CpState::IdReq);
    }

    #[test]
    fn test_send_command_requires_online() {
        let (mut cp, _responder) = panel_with_responder();

        let cmd = Command::Buzzer(crate::types::BuzzerCommand {
            reader: 0,
            control_code: 1,
            on_count: 1,
            off_count: 1,
            rep_count: 1,
        });

        assert_eq!(cp.send_command(0, cmd.clone()), Err(SendError::NotOnline));
        assert_eq!(cp.send_command(9, cmd.clone()), Err(SendError::InvalidPd));

        cp.pds[0].state = CpState::Online;
        assert_eq!(cp.send_command(0, cmd), Ok(()));
        assert_eq!(cp.pds[0].session.queue.len(), 1);
    }

    #[test]
    fn test_keyset_broadcast_gated_on_secure_channel() {
        let (mut cp, _responder) = panel_with_responder();
        let keyset = Command::KeySet(KeySetCommand { key: [9; 16] });

        assert_eq!(cp.send_command(0, keyset.clone()), Err(SendError::ScRequired));

        cp.pds[0].state = CpState::Online;
        assert_eq!(cp.send_command(0, keyset.clone()), Err(SendError::ScRequired));

        cp.pds[0].session.sc_active = true;
        assert_eq!(cp.send_command(0, keyset), Ok(()));

        // The queued entry carries its own copy of the key value.
        match cp.pds[0].session.queue.peek_tail() {
            Some(QueuedCmd {
                id: CMD_KEYSET,
                body: Some(Command::KeySet(k)),
            }) => assert_eq!(k.key, [9; 16]),
            other => panic!("unexpected queue tail {:?}", other.is_some()),
        }
    }

    #[test]
    fn test_phy_error_drains_queue() {
        let (mut cp, _responder) = panel_with_responder();
        cp.pds[0].state = CpState::Online;

        for _ in 0..3 {
            cp.pds[0]
                .session
                .queue
                .enqueue(QueuedCmd {
                    id: CMD_POLL,
                    body: None,
                })
                .unwrap();
        }
        cp.pds[0].phy_state = PhyState::Err;

        cp.update();

        assert!(cp.pds[0].session.queue.is_empty());
        assert_eq!(cp.pds[0].phy_state, PhyState::ErrWait);
    }
}
