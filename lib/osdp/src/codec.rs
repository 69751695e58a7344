//! Bit-exact encoding and decoding of command and reply payloads.
//!
//! Encoders write message data at the offset reserved by the packet layer
//! and return the data length; decoders are handed the payload slice after
//! the packet layer has stripped (and, on a secure channel, decrypted) the
//! framing. All multi-byte integers are little-endian on the wire, with
//! the single exception of the PDID firmware version.

use crate::cmd::QueuedCmd;
use crate::cp::Notifier;
use crate::pd::CommandCallback;
use crate::phy;
use crate::sc::{compute_scbk, SCBK_DEFAULT, SCS_11, SCS_13, SCS_14, SCS_15, SCS_17};
use crate::session::PdSession;
use crate::types::*;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use keel::crypto::CryptoSuite;
use keel::logging;
use std::io::{Cursor, Read, Write};

// Command identifiers.
pub(crate) const CMD_POLL: u8 = 0x60;
pub(crate) const CMD_ID: u8 = 0x61;
pub(crate) const CMD_CAP: u8 = 0x62;
pub(crate) const CMD_DIAG: u8 = 0x63;
pub(crate) const CMD_LSTAT: u8 = 0x64;
pub(crate) const CMD_ISTAT: u8 = 0x65;
pub(crate) const CMD_OSTAT: u8 = 0x66;
pub(crate) const CMD_RSTAT: u8 = 0x67;
pub(crate) const CMD_OUT: u8 = 0x68;
pub(crate) const CMD_LED: u8 = 0x69;
pub(crate) const CMD_BUZ: u8 = 0x6a;
pub(crate) const CMD_TEXT: u8 = 0x6b;
pub(crate) const CMD_COMSET: u8 = 0x6e;
pub(crate) const CMD_KEYSET: u8 = 0x75;
pub(crate) const CMD_CHLNG: u8 = 0x76;
pub(crate) const CMD_SCRYPT: u8 = 0x77;

// Reply identifiers.
pub(crate) const REPLY_ACK: u8 = 0x40;
pub(crate) const REPLY_NAK: u8 = 0x41;
pub(crate) const REPLY_PDID: u8 = 0x45;
pub(crate) const REPLY_PDCAP: u8 = 0x46;
pub(crate) const REPLY_LSTATR: u8 = 0x48;
pub(crate) const REPLY_RSTATR: u8 = 0x4b;
pub(crate) const REPLY_RAW: u8 = 0x50;
pub(crate) const REPLY_FMT: u8 = 0x51;
pub(crate) const REPLY_KEYPPAD: u8 = 0x53;
pub(crate) const REPLY_COM: u8 = 0x54;
pub(crate) const REPLY_CCRYPT: u8 = 0x76;
pub(crate) const REPLY_RMAC_I: u8 = 0x78;
pub(crate) const REPLY_BUSY: u8 = 0x79;

const CAP_ENTRY_LEN: usize = 3;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum CodecError {
    OutOfBuffer { have: usize, need: usize },
    LengthMismatch { got: usize, expected: usize },
    UnknownId(u8),
    Format,
}

impl From<std::io::Error> for CodecError {
    fn from(_: std::io::Error) -> CodecError {
        CodecError::Format
    }
}

/// Outcome of a successfully parsed reply.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum ReplyOutcome {
    Handled,
    /// The device answered BUSY; re-send the same command after a backoff.
    Busy,
}

#[inline]
fn ensure(have: usize, need: usize) -> Result<(), CodecError> {
    if have < need {
        return Err(CodecError::OutOfBuffer { have, need });
    }
    Ok(())
}

#[inline]
fn expect_len(got: usize, expected: usize) -> Result<(), CodecError> {
    if got != expected {
        return Err(CodecError::LengthMismatch { got, expected });
    }
    Ok(())
}

/// Splits an initialized packet buffer into the secure control block (when
/// the packet layer attached one) and the data region.
fn split_smb(buf: &mut [u8]) -> (Option<&mut [u8]>, &mut [u8]) {
    let data_off = phy::packet_get_data_offset(buf);
    let (head, data) = buf.split_at_mut(data_off);
    let smb = if head.len() > phy::HEADER_LEN {
        Some(&mut head[phy::HEADER_LEN..])
    } else {
        None
    };
    (smb, data)
}

// --- Control panel side ---------------------------------------------------

/// Encodes the staged command into the packet buffer; returns the data
/// length.
pub(crate) fn build_command(
    pd: &mut PdSession,
    master_key: Option<&[u8; 16]>,
    crypto: &mut dyn CryptoSuite,
    buf: &mut [u8],
) -> Result<usize, CodecError> {
    let staged = pd.staged_cmd.clone();
    let (mut smb, data) = split_smb(buf);
    let have = data.len();
    let mut cursor = Cursor::new(&mut data[..]);

    match pd.cmd_id {
        CMD_POLL | CMD_LSTAT | CMD_ISTAT | CMD_OSTAT | CMD_RSTAT => {
            ensure(have, 1)?;
            cursor.write_u8(pd.cmd_id)?;
        }
        CMD_ID | CMD_CAP | CMD_DIAG => {
            ensure(have, 2)?;
            cursor.write_u8(pd.cmd_id)?;
            cursor.write_u8(0x00)?;
        }
        CMD_OUT => {
            let cmd = match staged {
                Some(Command::Output(cmd)) => cmd,
                _ => return Err(CodecError::Format),
            };
            ensure(have, 5)?;
            cursor.write_u8(pd.cmd_id)?;
            cursor.write_u8(cmd.output_no)?;
            cursor.write_u8(cmd.control_code)?;
            cursor.write_u16::<LittleEndian>(cmd.timer_count)?;
        }
        CMD_LED => {
            let cmd = match staged {
                Some(Command::Led(cmd)) => cmd,
                _ => return Err(CodecError::Format),
            };
            ensure(have, 15)?;
            cursor.write_u8(pd.cmd_id)?;
            cursor.write_u8(cmd.reader)?;
            cursor.write_u8(cmd.led_number)?;

            cursor.write_u8(cmd.temporary.control_code)?;
            cursor.write_u8(cmd.temporary.on_count)?;
            cursor.write_u8(cmd.temporary.off_count)?;
            cursor.write_u8(cmd.temporary.on_color)?;
            cursor.write_u8(cmd.temporary.off_color)?;
            cursor.write_u16::<LittleEndian>(cmd.temporary.timer_count)?;

            cursor.write_u8(cmd.permanent.control_code)?;
            cursor.write_u8(cmd.permanent.on_count)?;
            cursor.write_u8(cmd.permanent.off_count)?;
            cursor.write_u8(cmd.permanent.on_color)?;
            cursor.write_u8(cmd.permanent.off_color)?;
        }
        CMD_BUZ => {
            let cmd = match staged {
                Some(Command::Buzzer(cmd)) => cmd,
                _ => return Err(CodecError::Format),
            };
            ensure(have, 6)?;
            cursor.write_u8(pd.cmd_id)?;
            cursor.write_u8(cmd.reader)?;
            cursor.write_u8(cmd.control_code)?;
            cursor.write_u8(cmd.on_count)?;
            cursor.write_u8(cmd.off_count)?;
            cursor.write_u8(cmd.rep_count)?;
        }
        CMD_TEXT => {
            let cmd = match staged {
                Some(Command::Text(cmd)) => cmd,
                _ => return Err(CodecError::Format),
            };
            ensure(have, 7 + cmd.length as usize)?;
            cursor.write_u8(pd.cmd_id)?;
            cursor.write_u8(cmd.reader)?;
            cursor.write_u8(cmd.control_code)?;
            cursor.write_u8(cmd.temp_time)?;
            cursor.write_u8(cmd.offset_row)?;
            cursor.write_u8(cmd.offset_col)?;
            cursor.write_u8(cmd.length)?;
            cursor.write_all(cmd.text())?;
        }
        CMD_COMSET => {
            let cmd = match staged {
                Some(Command::ComSet(cmd)) => cmd,
                _ => return Err(CodecError::Format),
            };
            ensure(have, 6)?;
            cursor.write_u8(pd.cmd_id)?;
            cursor.write_u8(cmd.address)?;
            cursor.write_u32::<LittleEndian>(cmd.baud_rate)?;
        }
        CMD_KEYSET => {
            if !pd.sc_active {
                logging::error!(pd.log, "KEYSET requires an active secure channel";
                                "context" => "build_command");
                return Err(CodecError::Format);
            }
            ensure(have, 19)?;
            let key = match staged {
                Some(Command::KeySet(cmd)) => cmd.key,
                _ => match master_key {
                    Some(master) => compute_scbk(master, &pd.sc.pd_client_uid, crypto),
                    None => return Err(CodecError::Format),
                },
            };
            cursor.write_u8(pd.cmd_id)?;
            cursor.write_u8(1)?; // key type: SCBK
            cursor.write_u8(16)?; // key length
            cursor.write_all(&key)?;
        }
        CMD_CHLNG => {
            let smb = smb.as_mut().ok_or(CodecError::Format)?;
            ensure(have, 9)?;
            crypto.fill_random(&mut pd.sc.cp_random);
            smb[0] = 3;
            smb[1] = SCS_11;
            smb[2] = if pd.sc_use_scbkd { 0 } else { 1 };
            cursor.write_u8(pd.cmd_id)?;
            cursor.write_all(&pd.sc.cp_random)?;
        }
        CMD_SCRYPT => {
            let smb = smb.as_mut().ok_or(CodecError::Format)?;
            ensure(have, 17)?;
            pd.sc.compute_cp_cryptogram(crypto);
            smb[0] = 3;
            smb[1] = SCS_13;
            smb[2] = if pd.sc_use_scbkd { 0 } else { 1 };
            cursor.write_u8(pd.cmd_id)?;
            cursor.write_all(&pd.sc.cp_cryptogram)?;
        }
        other => return Err(CodecError::UnknownId(other)),
    }

    let len = cursor.position() as usize;

    if let Some(smb) = smb {
        // Once the channel is secure, non-handshake messages are re-tagged
        // by payload shape.
        if pd.sc_active && smb[1] > SCS_14 {
            smb[0] = 2;
            smb[1] = if len > 1 { SCS_17 } else { SCS_15 };
        }
    }

    Ok(len)
}

/// Parses a reply payload and applies its effects to the session.
pub(crate) fn decode_reply(
    pd: &mut PdSession,
    notifier: &mut Notifier,
    master_key: Option<&[u8; 16]>,
    crypto: &mut dyn CryptoSuite,
    payload: &[u8],
) -> Result<ReplyOutcome, CodecError> {
    let mut cursor = Cursor::new(payload);
    pd.reply_id = cursor.read_u8()?;
    let len = payload.len() - 1;

    match pd.reply_id {
        REPLY_ACK => {
            expect_len(len, 0)?;
        }
        REPLY_NAK => {
            expect_len(len, 1)?;
            pd.nak_code = NakCode::from_u8(cursor.read_u8()?);
            logging::warn!(pd.log, "device NAKed command";
                           "context" => "decode_reply",
                           "command" => pd.cmd_id,
                           "reason" => ?pd.nak_code);
        }
        REPLY_PDID => {
            expect_len(len, 12)?;
            pd.id.vendor_code = cursor.read_u24::<LittleEndian>()?;
            pd.id.model = cursor.read_u8()?;
            pd.id.version = cursor.read_u8()?;
            pd.id.serial_number = cursor.read_u32::<LittleEndian>()?;
            // Firmware version is the one big-endian field of the protocol.
            let mut firmware = [0u8; 3];
            cursor.read_exact(&mut firmware)?;
            pd.id.firmware_version =
                (firmware[0] as u32) << 16 | (firmware[1] as u32) << 8 | firmware[2] as u32;
        }
        REPLY_PDCAP => {
            if len % CAP_ENTRY_LEN != 0 {
                return Err(CodecError::LengthMismatch {
                    got: len,
                    expected: (len / CAP_ENTRY_LEN) * CAP_ENTRY_LEN,
                });
            }
            while (cursor.position() as usize) < payload.len() {
                let fc = cursor.read_u8()?;
                if fc == 0 || fc as usize >= CAP_SENTINEL {
                    break;
                }
                pd.caps[fc as usize] = Capability {
                    function_code: fc,
                    compliance_level: cursor.read_u8()?,
                    num_items: cursor.read_u8()?,
                };
            }
            let level = pd.cap(CapFunction::CommunicationSecurity as usize).compliance_level;
            pd.sc_capable = level & 0x01 != 0;
        }
        REPLY_LSTATR => {
            expect_len(len, 2)?;
            pd.tamper = cursor.read_u8()? != 0;
            pd.power_fault = cursor.read_u8()? != 0;
        }
        REPLY_RSTATR => {
            expect_len(len, 1)?;
            pd.reader_tamper = cursor.read_u8()? != 0;
        }
        REPLY_COM => {
            expect_len(len, 5)?;
            let address = cursor.read_u8()?;
            let baud_rate = cursor.read_u32::<LittleEndian>()?;
            logging::warn!(pd.log, "COMSET applied";
                           "context" => "decode_reply",
                           "new_address" => address,
                           "new_baud_rate" => baud_rate);
            pd.address = address;
            pd.baud_rate = baud_rate;
        }
        REPLY_KEYPPAD => {
            if len < 2 {
                return Err(CodecError::Format);
            }
            let _reader = cursor.read_u8()?;
            let count = cursor.read_u8()? as usize;
            if len - 2 != count {
                return Err(CodecError::Format);
            }
            if let Some(cb) = notifier.keypress.as_mut() {
                for _ in 0..count {
                    cb(pd.offset, cursor.read_u8()?);
                }
            }
        }
        REPLY_RAW => {
            if len < 4 {
                return Err(CodecError::Format);
            }
            let _reader = cursor.read_u8()?;
            let format = CardFormat::from_u8(cursor.read_u8()?).ok_or(CodecError::Format)?;
            let bits = cursor.read_u16::<LittleEndian>()?;
            let byte_len = (bits as usize + 7) / 8;
            if len - 4 != byte_len {
                return Err(CodecError::Format);
            }
            let data = &payload[cursor.position() as usize..];
            if let Some(cb) = notifier.cardread.as_mut() {
                cb(pd.offset, format, bits, data);
            }
        }
        REPLY_FMT => {
            if len < 3 {
                return Err(CodecError::Format);
            }
            let _reader = cursor.read_u8()?;
            let _direction = cursor.read_u8()?;
            let count = cursor.read_u8()? as usize;
            if len - 3 != count {
                return Err(CodecError::Format);
            }
            let data = &payload[cursor.position() as usize..];
            if let Some(cb) = notifier.cardread.as_mut() {
                cb(pd.offset, CardFormat::Ascii, count as u16, data);
            }
        }
        REPLY_BUSY => {
            expect_len(len, 0)?;
            return Ok(ReplyOutcome::Busy);
        }
        REPLY_CCRYPT => {
            expect_len(len, 32)?;
            cursor.read_exact(&mut pd.sc.pd_client_uid)?;
            cursor.read_exact(&mut pd.sc.pd_random)?;
            cursor.read_exact(&mut pd.sc.pd_cryptogram)?;

            let scbk = if pd.sc_use_scbkd {
                SCBK_DEFAULT
            } else {
                let master = master_key.ok_or(CodecError::Format)?;
                compute_scbk(master, &pd.sc.pd_client_uid, crypto)
            };
            pd.sc.scbk = scbk;
            pd.sc.derive_session_keys(&scbk, crypto);

            if !pd.sc.verify_pd_cryptogram(crypto) {
                logging::error!(pd.log, "failed to verify device cryptogram";
                                "context" => "decode_reply");
                return Err(CodecError::Format);
            }
        }
        REPLY_RMAC_I => {
            expect_len(len, 16)?;
            cursor.read_exact(&mut pd.sc.r_mac)?;
            pd.sc_active = true;
        }
        other => {
            logging::debug!(pd.log, "unexpected reply";
                            "context" => "decode_reply",
                            "reply" => other);
            return Err(CodecError::UnknownId(other));
        }
    }

    if pd.cmd_id != CMD_POLL {
        logging::debug!(pd.log, "command answered";
                        "context" => "decode_reply",
                        "command" => pd.cmd_id,
                        "reply" => pd.reply_id);
    }

    Ok(ReplyOutcome::Handled)
}

// --- Peripheral device side -----------------------------------------------

#[inline]
fn nak(pd: &mut PdSession, code: NakCode) {
    pd.reply_id = REPLY_NAK;
    pd.nak_code = code;
}

/// Capability gate for a decoded command. Returns false after staging the
/// appropriate NAK.
fn cap_ok(pd: &mut PdSession, cmd: Option<&Command>) -> bool {
    match pd.cmd_id {
        CMD_OUT => {
            let cap = pd.cap(CapFunction::OutputControl as usize);
            if let Some(Command::Output(out)) = cmd {
                if out.output_no as usize + 1 <= cap.num_items as usize && cap.compliance_level != 0
                {
                    return true;
                }
            }
        }
        CMD_LED => {
            let cap = pd.cap(CapFunction::ReaderLedControl as usize);
            if let Some(Command::Led(led)) = cmd {
                if led.led_number as usize + 1 <= cap.num_items as usize && cap.compliance_level != 0
                {
                    return true;
                }
            }
        }
        CMD_BUZ => {
            let cap = pd.cap(CapFunction::ReaderAudibleOutput as usize);
            if cap.num_items != 0 && cap.compliance_level != 0 {
                return true;
            }
        }
        CMD_TEXT => {
            let cap = pd.cap(CapFunction::ReaderTextOutput as usize);
            if cap.num_items != 0 && cap.compliance_level != 0 {
                return true;
            }
        }
        CMD_CHLNG | CMD_SCRYPT | CMD_KEYSET => {
            let cap = pd.cap(CapFunction::CommunicationSecurity as usize);
            if cap.compliance_level == 0 {
                nak(pd, NakCode::ScUnsupported);
                return false;
            }
            return true;
        }
        // ISTAT/OSTAT have no reply implemented here regardless of the
        // advertised capability.
        _ => {}
    }

    nak(pd, NakCode::CmdUnknown);
    false
}

fn run_callback(callback: &mut Option<CommandCallback>, cmd: &Command) -> bool {
    match callback.as_mut() {
        Some(cb) => cb(cmd),
        None => true,
    }
}

/// Parses a command payload, dispatches it and stages exactly one reply.
pub(crate) fn decode_command(
    pd: &mut PdSession,
    events: &mut crate::cmd::Fifo<Event>,
    callback: &mut Option<CommandCallback>,
    payload: &[u8],
) {
    pd.reply_id = 0;
    pd.nak_code = NakCode::None;
    pd.staged_event = None;

    let mut cursor = Cursor::new(payload);
    pd.cmd_id = match cursor.read_u8() {
        Ok(id) => id,
        Err(_) => {
            nak(pd, NakCode::CmdLen);
            return;
        }
    };
    let len = payload.len() - 1;
    let body = &payload[1..];

    match pd.cmd_id {
        CMD_POLL => {
            if len != 0 {
                nak(pd, NakCode::CmdLen);
                return;
            }
            match events.dequeue() {
                Some(event) => {
                    pd.reply_id = match event {
                        Event::CardRead(card) => match card.format {
                            CardFormat::Ascii => REPLY_FMT,
                            _ => REPLY_RAW,
                        },
                        Event::KeyPress(_) => REPLY_KEYPPAD,
                    };
                    pd.staged_event = Some(event);
                }
                None => pd.reply_id = REPLY_ACK,
            }
        }
        CMD_LSTAT => {
            if len != 0 {
                nak(pd, NakCode::CmdLen);
                return;
            }
            pd.reply_id = REPLY_LSTATR;
        }
        CMD_RSTAT => {
            if len != 0 {
                nak(pd, NakCode::CmdLen);
                return;
            }
            pd.reply_id = REPLY_RSTATR;
        }
        CMD_ISTAT | CMD_OSTAT => {
            if len != 0 {
                nak(pd, NakCode::CmdLen);
                return;
            }
            cap_ok(pd, None);
        }
        CMD_ID => {
            if len != 1 {
                nak(pd, NakCode::CmdLen);
                return;
            }
            pd.reply_id = REPLY_PDID;
        }
        CMD_CAP => {
            if len != 1 {
                nak(pd, NakCode::CmdLen);
                return;
            }
            pd.reply_id = REPLY_PDCAP;
        }
        CMD_OUT => {
            if len != 4 {
                nak(pd, NakCode::CmdLen);
                return;
            }
            let cmd = Command::Output(OutputCommand {
                output_no: body[0],
                control_code: body[1],
                timer_count: body[2] as u16 | (body[3] as u16) << 8,
            });
            if !cap_ok(pd, Some(&cmd)) {
                return;
            }
            if !run_callback(callback, &cmd) {
                nak(pd, NakCode::Record);
                return;
            }
            pd.reply_id = REPLY_ACK;
        }
        CMD_LED => {
            if len != 14 {
                nak(pd, NakCode::CmdLen);
                return;
            }
            let cmd = Command::Led(LedCommand {
                reader: body[0],
                led_number: body[1],
                temporary: LedParams {
                    control_code: body[2],
                    on_count: body[3],
                    off_count: body[4],
                    on_color: body[5],
                    off_color: body[6],
                    timer_count: body[7] as u16 | (body[8] as u16) << 8,
                },
                permanent: LedParams {
                    control_code: body[9],
                    on_count: body[10],
                    off_count: body[11],
                    on_color: body[12],
                    off_color: body[13],
                    timer_count: 0,
                },
            });
            if !cap_ok(pd, Some(&cmd)) {
                return;
            }
            if !run_callback(callback, &cmd) {
                nak(pd, NakCode::Record);
                return;
            }
            pd.reply_id = REPLY_ACK;
        }
        CMD_BUZ => {
            if len != 5 {
                nak(pd, NakCode::CmdLen);
                return;
            }
            let cmd = Command::Buzzer(BuzzerCommand {
                reader: body[0],
                control_code: body[1],
                on_count: body[2],
                off_count: body[3],
                rep_count: body[4],
            });
            if !cap_ok(pd, Some(&cmd)) {
                return;
            }
            if !run_callback(callback, &cmd) {
                nak(pd, NakCode::Record);
                return;
            }
            pd.reply_id = REPLY_ACK;
        }
        CMD_TEXT => {
            if len < 6 {
                nak(pd, NakCode::CmdLen);
                return;
            }
            let length = body[5] as usize;
            if length > TEXT_MAX_LEN || len - 6 < length {
                nak(pd, NakCode::CmdLen);
                return;
            }
            // Payload characters are consumed exactly once.
            let mut data = [0u8; TEXT_MAX_LEN];
            data[..length].copy_from_slice(&body[6..6 + length]);
            let cmd = Command::Text(TextCommand {
                reader: body[0],
                control_code: body[1],
                temp_time: body[2],
                offset_row: body[3],
                offset_col: body[4],
                length: length as u8,
                data,
            });
            if !cap_ok(pd, Some(&cmd)) {
                return;
            }
            if !run_callback(callback, &cmd) {
                nak(pd, NakCode::Record);
                return;
            }
            pd.reply_id = REPLY_ACK;
        }
        CMD_COMSET => {
            if len != 5 {
                nak(pd, NakCode::CmdLen);
                return;
            }
            let mut address = body[0];
            let mut baud_rate = body[1] as u32
                | (body[2] as u32) << 8
                | (body[3] as u32) << 16
                | (body[4] as u32) << 24;
            if address >= 0x7f || !crate::config::SUPPORTED_BAUD_RATES.contains(&baud_rate) {
                logging::error!(pd.log, "COMSET rejected; keeping current parameters";
                                "context" => "decode_command",
                                "address" => address,
                                "baud_rate" => baud_rate);
                address = pd.address;
                baud_rate = pd.baud_rate;
            }
            let cmd = Command::ComSet(ComSetCommand { address, baud_rate });
            if !run_callback(callback, &cmd) {
                nak(pd, NakCode::Record);
                return;
            }
            // Queued so the COM reply can echo the new parameters before
            // they take effect.
            if pd
                .queue
                .enqueue(QueuedCmd {
                    id: CMD_COMSET,
                    body: Some(cmd),
                })
                .is_err()
            {
                nak(pd, NakCode::Record);
                return;
            }
            pd.reply_id = REPLY_COM;
        }
        CMD_KEYSET => {
            if !cap_ok(pd, None) {
                return;
            }
            if len != 18 {
                nak(pd, NakCode::CmdLen);
                return;
            }
            if !pd.sc_active {
                logging::error!(pd.log, "KEYSET with secure channel inactive";
                                "context" => "decode_command");
                nak(pd, NakCode::ScConditions);
                return;
            }
            if body[0] != 1 || body[1] != 16 {
                logging::error!(pd.log, "KEYSET with unsupported key type or length";
                                "context" => "decode_command",
                                "key_type" => body[0],
                                "key_len" => body[1]);
                nak(pd, NakCode::CmdLen);
                return;
            }
            let mut key = [0u8; 16];
            key.copy_from_slice(&body[2..18]);
            let cmd = Command::KeySet(KeySetCommand { key });
            if !run_callback(callback, &cmd) {
                nak(pd, NakCode::Record);
                return;
            }
            // The base key is replaced only once the application has
            // accepted it.
            pd.sc.scbk = key;
            pd.sc_use_scbkd = false;
            pd.install_mode = false;
            pd.reply_id = REPLY_ACK;
        }
        CMD_CHLNG => {
            if !cap_ok(pd, None) {
                return;
            }
            if len != 8 {
                nak(pd, NakCode::CmdLen);
                return;
            }
            pd.sc.clear();
            pd.sc.set_client_uid(&pd.id);
            pd.sc_active = false;
            pd.sc.cp_random.copy_from_slice(&body[..8]);
            pd.reply_id = REPLY_CCRYPT;
        }
        CMD_SCRYPT => {
            if !cap_ok(pd, None) {
                return;
            }
            if len != 16 {
                nak(pd, NakCode::CmdLen);
                return;
            }
            pd.sc.cp_cryptogram.copy_from_slice(&body[..16]);
            pd.reply_id = REPLY_RMAC_I;
        }
        other => {
            logging::error!(pd.log, "unknown command";
                            "context" => "decode_command",
                            "command" => other);
            nak(pd, NakCode::CmdUnknown);
        }
    }

    if pd.cmd_id != CMD_POLL {
        logging::debug!(pd.log, "command dispatched";
                        "context" => "decode_command",
                        "command" => pd.cmd_id,
                        "reply" => pd.reply_id);
    }
}

/// Encodes the staged reply into the packet buffer; returns the data
/// length. Build failures degrade to NAK(RECORD), matching the protocol's
/// catch-all reporting.
pub(crate) fn build_reply(
    pd: &mut PdSession,
    crypto: &mut dyn CryptoSuite,
    buf: &mut [u8],
) -> Result<usize, CodecError> {
    let (mut smb, data) = split_smb(buf);

    let len = match reply_body(pd, crypto, &mut smb, data) {
        Ok(len) => len,
        Err(err @ CodecError::OutOfBuffer { .. }) => return Err(err),
        Err(_) => {
            logging::error!(pd.log, "failed to build reply; sending NAK";
                            "context" => "build_reply",
                            "reply" => pd.reply_id);
            ensure(data.len(), 2)?;
            data[0] = REPLY_NAK;
            data[1] = NakCode::Record as u8;
            2
        }
    };

    if let Some(smb) = smb {
        if pd.sc_active && smb[1] > SCS_14 {
            smb[0] = 2;
            smb[1] = if len > 1 {
                crate::sc::SCS_18
            } else {
                crate::sc::SCS_16
            };
        }
    }

    Ok(len)
}

fn reply_body(
    pd: &mut PdSession,
    crypto: &mut dyn CryptoSuite,
    smb: &mut Option<&mut [u8]>,
    data: &mut [u8],
) -> Result<usize, CodecError> {
    let have = data.len();
    let mut cursor = Cursor::new(&mut data[..]);

    match pd.reply_id {
        REPLY_ACK => {
            ensure(have, 1)?;
            cursor.write_u8(pd.reply_id)?;
        }
        REPLY_NAK => {
            ensure(have, 2)?;
            cursor.write_u8(pd.reply_id)?;
            cursor.write_u8(pd.nak_code as u8)?;
        }
        REPLY_PDID => {
            ensure(have, 13)?;
            cursor.write_u8(pd.reply_id)?;
            cursor.write_u24::<LittleEndian>(pd.id.vendor_code)?;
            cursor.write_u8(pd.id.model)?;
            cursor.write_u8(pd.id.version)?;
            cursor.write_u32::<LittleEndian>(pd.id.serial_number)?;
            cursor.write_u8((pd.id.firmware_version >> 16) as u8)?;
            cursor.write_u8((pd.id.firmware_version >> 8) as u8)?;
            cursor.write_u8(pd.id.firmware_version as u8)?;
        }
        REPLY_PDCAP => {
            ensure(have, 1)?;
            cursor.write_u8(pd.reply_id)?;
            for i in 1..CAP_SENTINEL {
                let cap = pd.caps[i];
                if cap.function_code as usize != i {
                    continue;
                }
                ensure(have, cursor.position() as usize + CAP_ENTRY_LEN)?;
                cursor.write_u8(cap.function_code)?;
                cursor.write_u8(cap.compliance_level)?;
                cursor.write_u8(cap.num_items)?;
            }
        }
        REPLY_LSTATR => {
            ensure(have, 3)?;
            cursor.write_u8(pd.reply_id)?;
            cursor.write_u8(pd.tamper as u8)?;
            cursor.write_u8(pd.power_fault as u8)?;
        }
        REPLY_RSTATR => {
            ensure(have, 2)?;
            cursor.write_u8(pd.reply_id)?;
            cursor.write_u8(pd.reader_tamper as u8)?;
        }
        REPLY_COM => {
            ensure(have, 6)?;
            let comset = match pd.queue.peek_tail() {
                Some(QueuedCmd {
                    body: Some(Command::ComSet(comset)),
                    ..
                }) => *comset,
                _ => {
                    logging::error!(pd.log, "no COMSET staged for COM reply";
                                    "context" => "build_reply");
                    return Err(CodecError::Format);
                }
            };
            cursor.write_u8(pd.reply_id)?;
            cursor.write_u8(comset.address)?;
            cursor.write_u32::<LittleEndian>(comset.baud_rate)?;

            // The reply frames the new parameters; they take effect for
            // the next packet.
            pd.address = comset.address;
            pd.baud_rate = comset.baud_rate;
            logging::info!(pd.log, "COMSET applied";
                           "context" => "build_reply",
                           "address" => comset.address,
                           "baud_rate" => comset.baud_rate);
        }
        REPLY_KEYPPAD => {
            let event = match pd.staged_event {
                Some(Event::KeyPress(event)) => event,
                _ => return Err(CodecError::Format),
            };
            ensure(have, 3 + event.length as usize)?;
            cursor.write_u8(pd.reply_id)?;
            cursor.write_u8(event.reader)?;
            cursor.write_u8(event.length)?;
            cursor.write_all(&event.data[..event.length as usize])?;
        }
        REPLY_RAW => {
            let event = match pd.staged_event {
                Some(Event::CardRead(event)) => event,
                _ => return Err(CodecError::Format),
            };
            ensure(have, 5 + event.byte_len())?;
            cursor.write_u8(pd.reply_id)?;
            cursor.write_u8(event.reader)?;
            cursor.write_u8(event.format as u8)?;
            cursor.write_u16::<LittleEndian>(event.length)?;
            cursor.write_all(&event.data[..event.byte_len()])?;
        }
        REPLY_FMT => {
            let event = match pd.staged_event {
                Some(Event::CardRead(event)) => event,
                _ => return Err(CodecError::Format),
            };
            ensure(have, 4 + event.byte_len())?;
            cursor.write_u8(pd.reply_id)?;
            cursor.write_u8(event.reader)?;
            cursor.write_u8(event.direction)?;
            cursor.write_u8(event.byte_len() as u8)?;
            cursor.write_all(&event.data[..event.byte_len()])?;
        }
        REPLY_BUSY => {
            ensure(have, 1)?;
            cursor.write_u8(pd.reply_id)?;
        }
        REPLY_CCRYPT => {
            let smb = smb.as_mut().ok_or(CodecError::Format)?;
            ensure(have, 33)?;
            crypto.fill_random(&mut pd.sc.pd_random);
            let scbk = if pd.sc_use_scbkd {
                SCBK_DEFAULT
            } else {
                pd.sc.scbk
            };
            pd.sc.derive_session_keys(&scbk, crypto);
            pd.sc.compute_pd_cryptogram(crypto);

            cursor.write_u8(pd.reply_id)?;
            cursor.write_all(&pd.sc.pd_client_uid)?;
            cursor.write_all(&pd.sc.pd_random)?;
            cursor.write_all(&pd.sc.pd_cryptogram)?;

            smb[0] = 3;
            smb[1] = crate::sc::SCS_12;
            smb[2] = if pd.sc_use_scbkd { 0 } else { 1 };
        }
        REPLY_RMAC_I => {
            let smb = smb.as_mut().ok_or(CodecError::Format)?;
            ensure(have, 17)?;
            pd.sc.compute_rmac_i(crypto);
            cursor.write_u8(pd.reply_id)?;
            cursor.write_all(&pd.sc.r_mac)?;

            smb[0] = 3;
            smb[1] = SCS_14;
            if pd.sc.verify_cp_cryptogram(crypto) {
                smb[2] = 1;
                pd.sc_active = true;
                if pd.sc_use_scbkd {
                    logging::warn!(pd.log, "secure channel active with default key";
                                   "context" => "build_reply");
                } else {
                    logging::info!(pd.log, "secure channel active";
                                   "context" => "build_reply");
                }
            } else {
                smb[2] = 0;
                logging::warn!(pd.log, "failed to verify panel cryptogram";
                               "context" => "build_reply");
            }
        }
        other => return Err(CodecError::UnknownId(other)),
    }

    Ok(cursor.position() as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd::Fifo;
    use crate::session::test_support::session;
    use keel::crypto::Aes128Suite;
    use rand::Rng;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn null_notifier() -> Notifier {
        Notifier {
            keypress: None,
            cardread: None,
        }
    }

    /// Encodes a command on a CP-mode session and returns its payload.
    fn encode_command(id: u8, body: Option<Command>) -> Vec<u8> {
        let mut crypto = Aes128Suite;
        let (mut cp, _far) = session(false);
        cp.cmd_id = id;
        cp.staged_cmd = body;

        let mut buf = [0u8; 256];
        let off = phy::packet_init(&mut cp, &mut buf).unwrap();
        let len = build_command(&mut cp, None, &mut crypto, &mut buf).unwrap();
        buf[off..off + len].to_vec()
    }

    /// Runs a command payload through a PD-mode session; returns the
    /// captured callback argument.
    fn dispatch_command(payload: &[u8]) -> (crate::session::PdSession, Option<Command>) {
        let (mut pd, _far) = session(true);
        let mut events = Fifo::new(4);
        let seen = Rc::new(RefCell::new(None));
        let sink = seen.clone();
        let mut callback: Option<CommandCallback> = Some(Box::new(move |cmd: &Command| {
            *sink.borrow_mut() = Some(cmd.clone());
            true
        }));

        decode_command(&mut pd, &mut events, &mut callback, payload);
        let captured = seen.borrow().clone();
        (pd, captured)
    }

    fn command_roundtrip(id: u8, cmd: Command) {
        let payload = encode_command(id, Some(cmd.clone()));
        let (pd, captured) = dispatch_command(&payload);
        assert_eq!(pd.reply_id, REPLY_ACK, "command {:#x} not acknowledged", id);
        assert_eq!(captured, Some(cmd));
    }

    #[test]
    fn test_poll_wire_bytes_and_ack() {
        let payload = encode_command(CMD_POLL, None);
        assert_eq!(payload, vec![0x60]);

        let (mut pd, _) = dispatch_command(&payload);
        assert_eq!(pd.reply_id, REPLY_ACK);

        let mut crypto = Aes128Suite;
        let mut buf = [0u8; 256];
        let off = phy::packet_init(&mut pd, &mut buf).unwrap();
        let len = build_reply(&mut pd, &mut crypto, &mut buf).unwrap();
        assert_eq!(&buf[off..off + len], &[0x40]);
    }

    #[test]
    fn test_id_command_layout() {
        assert_eq!(encode_command(CMD_ID, None), vec![0x61, 0x00]);
        assert_eq!(encode_command(CMD_CAP, None), vec![0x62, 0x00]);
    }

    #[test]
    fn test_pdid_reply_endianness() {
        // vendor=0xA1B2C3 model=0x04 version=0x05 serial=0x11223344
        // firmware=0x010203: everything LSB-first except the firmware.
        let (mut pd, _) = dispatch_command(&[CMD_ID, 0x00]);
        assert_eq!(pd.reply_id, REPLY_PDID);

        let mut crypto = Aes128Suite;
        let mut buf = [0u8; 256];
        let off = phy::packet_init(&mut pd, &mut buf).unwrap();
        let len = build_reply(&mut pd, &mut crypto, &mut buf).unwrap();

        assert_eq!(
            &buf[off..off + len],
            &[0x45, 0xc3, 0xb2, 0xa1, 0x04, 0x05, 0x44, 0x33, 0x22, 0x11, 0x01, 0x02, 0x03]
        );

        // Decoding the same bytes on a CP session restores the identity.
        let (mut cp, _far) = session(false);
        cp.cmd_id = CMD_ID;
        let mut notifier = null_notifier();
        decode_reply(&mut cp, &mut notifier, None, &mut crypto, &buf[off..off + len]).unwrap();
        assert_eq!(cp.id.vendor_code, 0x00a1_b2c3);
        assert_eq!(cp.id.serial_number, 0x1122_3344);
        assert_eq!(cp.id.firmware_version, 0x0001_0203);
    }

    #[test]
    fn test_pdcap_roundtrip_sets_sc_capable() {
        let (mut pd, _) = dispatch_command(&[CMD_CAP, 0x00]);
        assert_eq!(pd.reply_id, REPLY_PDCAP);
        pd.caps[CapFunction::CommunicationSecurity as usize] =
            Capability::new(CapFunction::CommunicationSecurity, 1, 1);

        let mut crypto = Aes128Suite;
        let mut buf = [0u8; 256];
        let off = phy::packet_init(&mut pd, &mut buf).unwrap();
        let len = build_reply(&mut pd, &mut crypto, &mut buf).unwrap();
        assert_eq!((len - 1) % 3, 0);

        let (mut cp, _far) = session(false);
        cp.cmd_id = CMD_CAP;
        let mut notifier = null_notifier();
        decode_reply(&mut cp, &mut notifier, None, &mut crypto, &buf[off..off + len]).unwrap();

        assert!(cp.sc_capable);
        assert_eq!(cp.cap(CapFunction::OutputControl as usize).num_items, 4);
    }

    #[test]
    fn test_output_command_roundtrip() {
        command_roundtrip(
            CMD_OUT,
            Command::Output(OutputCommand {
                output_no: 2,
                control_code: 1,
                timer_count: 0xbeef,
            }),
        );
    }

    #[test]
    fn test_led_command_roundtrip() {
        command_roundtrip(
            CMD_LED,
            Command::Led(LedCommand {
                reader: 0,
                led_number: 1,
                temporary: LedParams {
                    control_code: 2,
                    on_count: 5,
                    off_count: 5,
                    on_color: 1,
                    off_color: 0,
                    timer_count: 500,
                },
                permanent: LedParams {
                    control_code: 1,
                    on_count: 10,
                    off_count: 0,
                    on_color: 2,
                    off_color: 0,
                    timer_count: 0,
                },
            }),
        );
    }

    #[test]
    fn test_buzzer_command_roundtrip() {
        command_roundtrip(
            CMD_BUZ,
            Command::Buzzer(BuzzerCommand {
                reader: 0,
                control_code: 2,
                on_count: 1,
                off_count: 1,
                rep_count: 3,
            }),
        );
    }

    #[test]
    fn test_text_command_roundtrip_reads_payload_once() {
        let cmd = TextCommand::new(0, 1, 0, 2, 3, b"OPEN");
        let payload = encode_command(CMD_TEXT, Some(Command::Text(cmd)));
        assert_eq!(payload.len(), 7 + 4);
        assert_eq!(&payload[7..], b"OPEN");

        let (pd, captured) = dispatch_command(&payload);
        assert_eq!(pd.reply_id, REPLY_ACK);
        match captured {
            Some(Command::Text(text)) => assert_eq!(text.text(), b"OPEN"),
            other => panic!("unexpected capture {:?}", other),
        }
    }

    #[test]
    fn test_comset_command_layout() {
        let payload = encode_command(
            CMD_COMSET,
            Some(Command::ComSet(ComSetCommand {
                address: 5,
                baud_rate: 38_400,
            })),
        );
        assert_eq!(payload, vec![0x6e, 0x05, 0x00, 0x96, 0x00, 0x00]);
    }

    #[test]
    fn test_randomized_command_roundtrips() {
        let mut rng = rand::thread_rng();

        for _ in 0..32 {
            command_roundtrip(
                CMD_OUT,
                Command::Output(OutputCommand {
                    output_no: rng.gen_range(0..4),
                    control_code: rng.gen(),
                    timer_count: rng.gen(),
                }),
            );
            command_roundtrip(
                CMD_BUZ,
                Command::Buzzer(BuzzerCommand {
                    reader: rng.gen(),
                    control_code: rng.gen(),
                    on_count: rng.gen(),
                    off_count: rng.gen(),
                    rep_count: rng.gen(),
                }),
            );

            let len = rng.gen_range(0..=TEXT_MAX_LEN);
            let text: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
            command_roundtrip(
                CMD_TEXT,
                Command::Text(TextCommand::new(0, rng.gen(), rng.gen(), 0, 0, &text)),
            );
        }
    }

    #[test]
    fn test_output_beyond_capability_naks() {
        // The device advertises 4 outputs; output 7 is out of range.
        let payload = encode_command(
            CMD_OUT,
            Some(Command::Output(OutputCommand {
                output_no: 7,
                control_code: 1,
                timer_count: 0,
            })),
        );
        let (pd, captured) = dispatch_command(&payload);

        assert_eq!(pd.reply_id, REPLY_NAK);
        assert_eq!(pd.nak_code, NakCode::CmdUnknown);
        assert_eq!(captured, None, "rejected command must not reach the application");
    }

    #[test]
    fn test_led_beyond_capability_naks() {
        let payload = encode_command(
            CMD_LED,
            Some(Command::Led(LedCommand {
                reader: 0,
                led_number: 9,
                temporary: LedParams::default(),
                permanent: LedParams::default(),
            })),
        );
        let (pd, _) = dispatch_command(&payload);
        assert_eq!(pd.reply_id, REPLY_NAK);
        assert_eq!(pd.nak_code, NakCode::CmdUnknown);
    }

    #[test]
    fn test_unknown_command_naks() {
        let (pd, _) = dispatch_command(&[0x5a]);
        assert_eq!(pd.reply_id, REPLY_NAK);
        assert_eq!(pd.nak_code, NakCode::CmdUnknown);
    }

    #[test]
    fn test_length_error_naks_cmd_len() {
        let (pd, _) = dispatch_command(&[CMD_OUT, 0x01]);
        assert_eq!(pd.reply_id, REPLY_NAK);
        assert_eq!(pd.nak_code, NakCode::CmdLen);
    }

    #[test]
    fn test_keyset_without_active_sc_naks() {
        let mut payload = vec![CMD_KEYSET, 1, 16];
        payload.extend_from_slice(&[7; 16]);

        let (pd, _) = dispatch_command(&payload);
        assert_eq!(pd.reply_id, REPLY_NAK);
        assert_eq!(pd.nak_code, NakCode::ScConditions);
    }

    #[test]
    fn test_keyset_applies_key_only_after_callback_accepts() {
        let mut payload = vec![CMD_KEYSET, 1, 16];
        payload.extend_from_slice(&[7; 16]);

        // Rejecting callback leaves the provisioned key untouched.
        let (mut pd, _far) = session(true);
        pd.sc_active = true;
        pd.sc.scbk = [1; 16];
        pd.install_mode = true;
        let mut events = Fifo::new(4);
        let mut callback: Option<CommandCallback> = Some(Box::new(|_| false));
        decode_command(&mut pd, &mut events, &mut callback, &payload);

        assert_eq!(pd.reply_id, REPLY_NAK);
        assert_eq!(pd.nak_code, NakCode::Record);
        assert_eq!(pd.sc.scbk, [1; 16]);
        assert!(pd.install_mode);

        // Accepting callback installs it and leaves install mode.
        let mut callback: Option<CommandCallback> = Some(Box::new(|_| true));
        decode_command(&mut pd, &mut events, &mut callback, &payload);

        assert_eq!(pd.reply_id, REPLY_ACK);
        assert_eq!(pd.sc.scbk, [7; 16]);
        assert!(!pd.install_mode);
        assert!(!pd.sc_use_scbkd);
    }

    #[test]
    fn test_busy_reply_signals_retry() {
        let mut crypto = Aes128Suite;
        let (mut cp, _far) = session(false);
        cp.cmd_id = CMD_POLL;
        let mut notifier = null_notifier();

        let outcome =
            decode_reply(&mut cp, &mut notifier, None, &mut crypto, &[REPLY_BUSY]).unwrap();
        assert_eq!(outcome, ReplyOutcome::Busy);
    }

    #[test]
    fn test_nak_reply_records_reason() {
        let mut crypto = Aes128Suite;
        let (mut cp, _far) = session(false);
        cp.cmd_id = CMD_OUT;
        let mut notifier = null_notifier();

        let outcome = decode_reply(
            &mut cp,
            &mut notifier,
            None,
            &mut crypto,
            &[REPLY_NAK, NakCode::Record as u8],
        )
        .unwrap();
        assert_eq!(outcome, ReplyOutcome::Handled);
        assert_eq!(cp.nak_code, NakCode::Record);
    }

    #[test]
    fn test_lstatr_reply_sets_flags() {
        let mut crypto = Aes128Suite;
        let (mut cp, _far) = session(false);
        cp.cmd_id = CMD_LSTAT;
        let mut notifier = null_notifier();

        decode_reply(&mut cp, &mut notifier, None, &mut crypto, &[REPLY_LSTATR, 1, 0]).unwrap();
        assert!(cp.tamper);
        assert!(!cp.power_fault);
    }

    #[test]
    fn test_keypad_reply_notifies_per_key() {
        let mut crypto = Aes128Suite;
        let (mut cp, _far) = session(false);
        cp.cmd_id = CMD_POLL;

        let keys = Rc::new(RefCell::new(Vec::new()));
        let sink = keys.clone();
        let mut notifier = null_notifier();
        notifier.keypress = Some(Box::new(move |_, key| sink.borrow_mut().push(key)));

        decode_reply(
            &mut cp,
            &mut notifier,
            None,
            &mut crypto,
            &[REPLY_KEYPPAD, 0, 3, 1, 2, 3],
        )
        .unwrap();
        assert_eq!(*keys.borrow(), vec![1, 2, 3]);
    }

    #[test]
    fn test_raw_cardread_reply_notifies() {
        let mut crypto = Aes128Suite;
        let (mut cp, _far) = session(false);
        cp.cmd_id = CMD_POLL;

        let seen = Rc::new(RefCell::new(None));
        let sink = seen.clone();
        let mut notifier = null_notifier();
        notifier.cardread = Some(Box::new(move |_, format, bits, data: &[u8]| {
            *sink.borrow_mut() = Some((format, bits, data.to_vec()));
        }));

        // 26 bits -> 4 data bytes.
        decode_reply(
            &mut cp,
            &mut notifier,
            None,
            &mut crypto,
            &[REPLY_RAW, 0, 1, 26, 0, 0xaa, 0xbb, 0xcc, 0x80],
        )
        .unwrap();

        let (format, bits, data) = seen.borrow().clone().unwrap();
        assert_eq!(format, CardFormat::RawWiegand);
        assert_eq!(bits, 26);
        assert_eq!(data, vec![0xaa, 0xbb, 0xcc, 0x80]);
    }

    #[test]
    fn test_raw_reply_length_mismatch_is_error() {
        let mut crypto = Aes128Suite;
        let (mut cp, _far) = session(false);
        cp.cmd_id = CMD_POLL;
        let mut notifier = null_notifier();

        // 26 bits require 4 bytes; only 3 present.
        let result = decode_reply(
            &mut cp,
            &mut notifier,
            None,
            &mut crypto,
            &[REPLY_RAW, 0, 1, 26, 0, 0xaa, 0xbb, 0xcc],
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_chlng_encode_tags_key_in_use() {
        let mut crypto = Aes128Suite;

        for (use_scbkd, expected) in [(false, 1u8), (true, 0u8)].iter() {
            let (mut cp, _far) = session(false);
            cp.cmd_id = CMD_CHLNG;
            cp.sc_use_scbkd = *use_scbkd;

            let mut buf = [0u8; 256];
            let off = phy::packet_init(&mut cp, &mut buf).unwrap();
            let len = build_command(&mut cp, None, &mut crypto, &mut buf).unwrap();

            assert_eq!(len, 9);
            assert_eq!(buf[phy::HEADER_LEN + 1], SCS_11);
            assert_eq!(buf[phy::HEADER_LEN + 2], *expected);
            assert_eq!(&buf[off + 1..off + 9], &cp.sc.cp_random);
        }
    }

    #[test]
    fn test_reply_length_mismatch_is_error() {
        let mut crypto = Aes128Suite;
        let (mut cp, _far) = session(false);
        cp.cmd_id = CMD_POLL;
        let mut notifier = null_notifier();

        let result = decode_reply(&mut cp, &mut notifier, None, &mut crypto, &[REPLY_ACK, 0xff]);
        assert_eq!(
            result,
            Err(CodecError::LengthMismatch {
                got: 1,
                expected: 0
            })
        );
    }
}
