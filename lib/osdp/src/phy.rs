//! Packet framing: header, sequence numbers, secure control block
//! placement, frame check and, on a live secure channel, the per-message
//! MAC and payload encryption.
//!
//! Frame layout: `SOM, address, length u16 LE, control, [SCB], data,
//! [MAC(4)], CRC-16`. The length field covers the whole frame. Replies set
//! bit 7 of the address byte.

use crate::codec::{CodecError, CMD_CHLNG, CMD_SCRYPT, REPLY_CCRYPT, REPLY_NAK, REPLY_RMAC_I};
use crate::sc::{SCS_11, SCS_12, SCS_13, SCS_14, SCS_15, SCS_16, SCS_17, SCS_18};
use crate::session::{PdSession, RX_BUF_SIZE};
use crate::types::NakCode;
use keel::crypto::CryptoSuite;
use keel::logging;

pub(crate) const SOM: u8 = 0x53;
pub(crate) const BROADCAST_ADDRESS: u8 = 0x7F;

const CTRL_SQN_MASK: u8 = 0x03;
const CTRL_CRC: u8 = 0x04;
const CTRL_SCB: u8 = 0x08;
const REPLY_ADDRESS_BIT: u8 = 0x80;

pub(crate) const HEADER_LEN: usize = 5;
const MAC_SUFFIX_LEN: usize = 4;
const CRC_LEN: usize = 2;

/// Outcome of a failed or incomplete frame decode.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum FrameError {
    /// Not enough bytes yet; keep accumulating.
    Wait,
    /// Not a frame for this peer; discard the buffer.
    Skip,
    /// Malformed frame; fatal for this message.
    Fmt,
}

/// CRC-16 over the frame, most-significant bit first, polynomial 0x1021,
/// initial value 0x1D0F.
pub(crate) fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0x1d0f;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
        }
    }
    crc
}

fn attaches_scb(pd: &PdSession) -> bool {
    if pd.sc_active {
        return true;
    }
    if pd.pd_mode {
        pd.reply_id == REPLY_CCRYPT || pd.reply_id == REPLY_RMAC_I
    } else {
        pd.cmd_id == CMD_CHLNG || pd.cmd_id == CMD_SCRYPT
    }
}

/// Writes the frame header (and secure control block skeleton) into `buf`
/// and returns the offset at which message data starts.
pub(crate) fn packet_init(pd: &mut PdSession, buf: &mut [u8]) -> Result<usize, CodecError> {
    let scb = attaches_scb(pd);
    let scb_len = match (scb, pd.sc_active) {
        (false, _) => 0,
        (true, true) => 2,
        (true, false) => 3,
    };
    let data_off = HEADER_LEN + scb_len;

    if buf.len() < data_off {
        return Err(CodecError::OutOfBuffer {
            have: buf.len(),
            need: data_off,
        });
    }

    let seq = if pd.pd_mode {
        // Replies reuse the sequence number of the command they answer.
        (pd.seq_number.max(0) & 3) as u8
    } else {
        pd.seq_number += 1;
        if pd.seq_number > 3 {
            pd.seq_number = 1;
        }
        (pd.seq_number & 3) as u8
    };

    buf[0] = SOM;
    buf[1] = pd.address | if pd.pd_mode { REPLY_ADDRESS_BIT } else { 0 };
    buf[2] = 0;
    buf[3] = 0;
    buf[4] = seq | CTRL_CRC | if scb { CTRL_SCB } else { 0 };

    if scb {
        buf[HEADER_LEN] = scb_len as u8;
        buf[HEADER_LEN + 1] = match (pd.sc_active, pd.pd_mode) {
            (true, false) => SCS_15,
            (true, true) => SCS_16,
            // Handshake messages; the codec fills in the stage tag.
            (false, _) => 0,
        };
        if scb_len == 3 {
            buf[HEADER_LEN + 2] = 0;
        }
    }

    Ok(data_off)
}

/// Offset of message data within an initialized or received frame.
#[inline]
pub(crate) fn packet_get_data_offset(buf: &[u8]) -> usize {
    if buf[4] & CTRL_SCB != 0 {
        HEADER_LEN + buf[HEADER_LEN] as usize
    } else {
        HEADER_LEN
    }
}

#[inline]
fn write_packet_len(buf: &mut [u8], total: usize) {
    buf[2] = total as u8;
    buf[3] = (total >> 8) as u8;
}

/// Seals a frame: encrypts the payload and appends the MAC when the secure
/// channel is live, then writes the length field and the CRC. Returns the
/// total frame length.
pub(crate) fn packet_finalize(
    pd: &mut PdSession,
    buf: &mut [u8],
    len: usize,
    crypto: &dyn CryptoSuite,
) -> Result<usize, CodecError> {
    let mut len = len;
    let is_cmd = !pd.pd_mode;
    let scb = buf[4] & CTRL_SCB != 0;
    let secure = scb && buf[HEADER_LEN + 1] >= SCS_15 && pd.sc_active;
    let mac_len = if secure { MAC_SUFFIX_LEN } else { 0 };

    let scs = if scb { buf[HEADER_LEN + 1] } else { 0 };
    if secure && (scs == SCS_17 || scs == SCS_18) {
        let data_off = packet_get_data_offset(buf);
        let data_len = len - data_off;
        let padded = (data_len / 16 + 1) * 16;

        if data_off + padded + mac_len + CRC_LEN > buf.len() {
            return Err(CodecError::OutOfBuffer {
                have: buf.len(),
                need: data_off + padded + mac_len + CRC_LEN,
            });
        }

        write_packet_len(buf, data_off + padded + mac_len + CRC_LEN);
        pd.sc.encrypt_data(is_cmd, &mut buf[data_off..], data_len, crypto);
        len = data_off + padded;
    } else {
        if len + mac_len + CRC_LEN > buf.len() {
            return Err(CodecError::OutOfBuffer {
                have: buf.len(),
                need: len + mac_len + CRC_LEN,
            });
        }
        write_packet_len(buf, len + mac_len + CRC_LEN);
    }

    if secure {
        let mac = pd.sc.compute_mac(is_cmd, &buf[..len], crypto);
        buf[len..len + MAC_SUFFIX_LEN].copy_from_slice(&mac[..MAC_SUFFIX_LEN]);
        len += MAC_SUFFIX_LEN;
    }

    let crc = crc16(&buf[..len]);
    buf[len] = crc as u8;
    buf[len + 1] = (crc >> 8) as u8;

    Ok(len + CRC_LEN)
}

#[inline]
fn set_nak(pd: &mut PdSession, code: NakCode) {
    if pd.pd_mode {
        pd.reply_id = REPLY_NAK;
        pd.nak_code = code;
    }
}

/// Validates the frame accumulated in the session receive buffer. On
/// success returns the bounds of the message data within `rx_buf`; secure
/// payloads have been decrypted in place.
pub(crate) fn packet_decode(
    pd: &mut PdSession,
    crypto: &dyn CryptoSuite,
) -> Result<(usize, usize), FrameError> {
    let have = pd.rx_len;

    if have == 0 {
        return Err(FrameError::Wait);
    }
    if pd.rx_buf[0] != SOM {
        return Err(FrameError::Skip);
    }
    if have < HEADER_LEN + CRC_LEN {
        return Err(FrameError::Wait);
    }

    let address = pd.rx_buf[1] & !REPLY_ADDRESS_BIT;
    if pd.pd_mode {
        if pd.rx_buf[1] & REPLY_ADDRESS_BIT != 0 {
            return Err(FrameError::Skip);
        }
        if address != pd.address && address != BROADCAST_ADDRESS {
            return Err(FrameError::Skip);
        }
    } else {
        if pd.rx_buf[1] & REPLY_ADDRESS_BIT == 0 || address != pd.address {
            return Err(FrameError::Skip);
        }
    }

    let pkt_len = pd.rx_buf[2] as usize | (pd.rx_buf[3] as usize) << 8;
    if pkt_len < HEADER_LEN + 1 + CRC_LEN || pkt_len > RX_BUF_SIZE {
        return Err(FrameError::Fmt);
    }
    if have < pkt_len {
        if have == RX_BUF_SIZE {
            return Err(FrameError::Fmt);
        }
        return Err(FrameError::Wait);
    }

    let control = pd.rx_buf[4];
    if control & CTRL_CRC == 0 {
        set_nak(pd, NakCode::MsgCheck);
        return Err(FrameError::Fmt);
    }

    let crc = crc16(&pd.rx_buf[..pkt_len - CRC_LEN]);
    let wire_crc = pd.rx_buf[pkt_len - 2] as u16 | (pd.rx_buf[pkt_len - 1] as u16) << 8;
    if crc != wire_crc {
        logging::debug!(pd.log, "frame check failed";
                        "context" => "packet_decode",
                        "computed" => crc,
                        "received" => wire_crc);
        set_nak(pd, NakCode::MsgCheck);
        return Err(FrameError::Fmt);
    }

    let seq = (control & CTRL_SQN_MASK) as i32;
    if pd.pd_mode {
        pd.seq_number = seq;
    } else if seq != pd.seq_number {
        logging::debug!(pd.log, "reply sequence mismatch";
                        "context" => "packet_decode",
                        "expected" => pd.seq_number,
                        "received" => seq);
        return Err(FrameError::Fmt);
    }

    let mut data_start = HEADER_LEN;
    let mut data_end = pkt_len - CRC_LEN;

    if control & CTRL_SCB != 0 {
        let scb_len = pd.rx_buf[HEADER_LEN] as usize;
        if scb_len < 2 || HEADER_LEN + scb_len > data_end {
            return Err(FrameError::Fmt);
        }
        let scs = pd.rx_buf[HEADER_LEN + 1];
        data_start += scb_len;

        match scs {
            SCS_11 => {
                if pd.pd_mode {
                    if scb_len < 3 {
                        return Err(FrameError::Fmt);
                    }
                    if pd.rx_buf[HEADER_LEN + 2] == 0 {
                        // SCBK-D is only acceptable before a key has been
                        // provisioned.
                        if !pd.install_mode {
                            set_nak(pd, NakCode::ScConditions);
                            return Err(FrameError::Fmt);
                        }
                        pd.sc_use_scbkd = true;
                    } else {
                        pd.sc_use_scbkd = false;
                    }
                }
            }
            SCS_12 | SCS_13 | SCS_14 => {}
            SCS_15 | SCS_16 | SCS_17 | SCS_18 => {
                if !pd.sc_active {
                    set_nak(pd, NakCode::ScConditions);
                    return Err(FrameError::Fmt);
                }
                if data_start + MAC_SUFFIX_LEN > data_end {
                    return Err(FrameError::Fmt);
                }
                data_end -= MAC_SUFFIX_LEN;

                let is_cmd = pd.pd_mode;
                let mac = pd.sc.compute_mac(is_cmd, &pd.rx_buf[..data_end], crypto);
                if mac[..MAC_SUFFIX_LEN] != pd.rx_buf[data_end..data_end + MAC_SUFFIX_LEN] {
                    set_nak(pd, NakCode::MsgCheck);
                    return Err(FrameError::Fmt);
                }

                if scs == SCS_17 || scs == SCS_18 {
                    let plain = pd
                        .sc
                        .decrypt_data(is_cmd, &mut pd.rx_buf[data_start..data_end], crypto);
                    match plain {
                        Some(n) => data_end = data_start + n,
                        None => return Err(FrameError::Fmt),
                    }
                }
            }
            _ => return Err(FrameError::Fmt),
        }
    } else if pd.sc_active {
        // A live secure channel does not accept plaintext frames.
        set_nak(pd, NakCode::ScConditions);
        return Err(FrameError::Fmt);
    }

    if data_start >= data_end {
        return Err(FrameError::Fmt);
    }
    Ok((data_start, data_end))
}

/// Returns the phy layer to its power-on state.
pub(crate) fn state_reset(pd: &mut PdSession) {
    pd.seq_number = -1;
    pd.rx_len = 0;
}
