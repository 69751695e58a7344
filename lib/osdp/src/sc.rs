//! Secure-channel session state and key schedule.
//!
//! The session machines drive these operations during the CHLNG/CCRYPT/
//! SCRYPT/RMAC_I handshake; the packet layer uses the MAC and payload
//! encryption helpers once the channel is live. All block operations go
//! through the [`CryptoSuite`] capability object.

use crate::types::PdId;
use keel::crypto::{CryptoSuite, BLOCK_SIZE};

// Secure-block tags: handshake stages.
pub(crate) const SCS_11: u8 = 0x11; // CHLNG
pub(crate) const SCS_12: u8 = 0x12; // CCRYPT
pub(crate) const SCS_13: u8 = 0x13; // SCRYPT
pub(crate) const SCS_14: u8 = 0x14; // RMAC_I

// Secure-block tags: steady state.
pub(crate) const SCS_15: u8 = 0x15; // CP, bare command id
pub(crate) const SCS_16: u8 = 0x16; // PD, bare reply id
pub(crate) const SCS_17: u8 = 0x17; // CP, data bytes present
pub(crate) const SCS_18: u8 = 0x18; // PD, data bytes present

/// Default secure-channel base key used before a real key is provisioned.
pub(crate) const SCBK_DEFAULT: [u8; 16] = [
    0x30, 0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0x37, 0x38, 0x39, 0x3a, 0x3b, 0x3c, 0x3d, 0x3e,
    0x3f,
];

/// Per-device secure-channel substate.
#[derive(Clone)]
pub(crate) struct ScSession {
    pub scbk: [u8; 16],
    pub s_enc: [u8; 16],
    pub s_mac1: [u8; 16],
    pub s_mac2: [u8; 16],
    pub cp_random: [u8; 8],
    pub pd_random: [u8; 8],
    pub pd_client_uid: [u8; 8],
    pub cp_cryptogram: [u8; 16],
    pub pd_cryptogram: [u8; 16],
    pub c_mac: [u8; 16],
    pub r_mac: [u8; 16],
}

impl ScSession {
    pub fn new() -> ScSession {
        ScSession {
            scbk: [0; 16],
            s_enc: [0; 16],
            s_mac1: [0; 16],
            s_mac2: [0; 16],
            cp_random: [0; 8],
            pd_random: [0; 8],
            pd_client_uid: [0; 8],
            cp_cryptogram: [0; 16],
            pd_cryptogram: [0; 16],
            c_mac: [0; 16],
            r_mac: [0; 16],
        }
    }

    /// Resets everything derived during a handshake. The provisioned SCBK
    /// survives; it is only replaced by a KEYSET command.
    pub fn clear(&mut self) {
        self.s_enc = [0; 16];
        self.s_mac1 = [0; 16];
        self.s_mac2 = [0; 16];
        self.cp_random = [0; 8];
        self.pd_random = [0; 8];
        self.cp_cryptogram = [0; 16];
        self.pd_cryptogram = [0; 16];
        self.c_mac = [0; 16];
        self.r_mac = [0; 16];
    }

    /// Fills the client UID a peripheral reports in its CCRYPT reply.
    pub fn set_client_uid(&mut self, id: &PdId) {
        self.pd_client_uid[0] = id.vendor_code as u8;
        self.pd_client_uid[1] = (id.vendor_code >> 8) as u8;
        self.pd_client_uid[2] = id.model;
        self.pd_client_uid[3] = id.version;
        self.pd_client_uid[4] = id.serial_number as u8;
        self.pd_client_uid[5] = (id.serial_number >> 8) as u8;
        self.pd_client_uid[6] = (id.serial_number >> 16) as u8;
        self.pd_client_uid[7] = (id.serial_number >> 24) as u8;
    }

    /// Derives `s_enc`/`s_mac1`/`s_mac2` from the working base key and the
    /// CP random exchanged in CHLNG.
    pub fn derive_session_keys(&mut self, scbk: &[u8; 16], crypto: &dyn CryptoSuite) {
        let mut seed = [0u8; 16];
        seed[0] = 0x01;
        seed[2..8].copy_from_slice(&self.cp_random[..6]);

        seed[1] = 0x82;
        self.s_enc = seed;
        crypto.encrypt(scbk, None, &mut self.s_enc);

        seed[1] = 0x01;
        self.s_mac1 = seed;
        crypto.encrypt(scbk, None, &mut self.s_mac1);

        seed[1] = 0x02;
        self.s_mac2 = seed;
        crypto.encrypt(scbk, None, &mut self.s_mac2);
    }

    fn cryptogram(&self, first: &[u8; 8], second: &[u8; 8], crypto: &dyn CryptoSuite) -> [u8; 16] {
        let mut gram = [0u8; 16];
        gram[..8].copy_from_slice(first);
        gram[8..].copy_from_slice(second);
        crypto.encrypt(&self.s_enc, None, &mut gram);
        gram
    }

    pub fn compute_cp_cryptogram(&mut self, crypto: &dyn CryptoSuite) {
        self.cp_cryptogram = self.cryptogram(&self.pd_random, &self.cp_random, crypto);
    }

    pub fn verify_cp_cryptogram(&self, crypto: &dyn CryptoSuite) -> bool {
        self.cp_cryptogram == self.cryptogram(&self.pd_random, &self.cp_random, crypto)
    }

    pub fn compute_pd_cryptogram(&mut self, crypto: &dyn CryptoSuite) {
        self.pd_cryptogram = self.cryptogram(&self.cp_random, &self.pd_random, crypto);
    }

    pub fn verify_pd_cryptogram(&self, crypto: &dyn CryptoSuite) -> bool {
        self.pd_cryptogram == self.cryptogram(&self.cp_random, &self.pd_random, crypto)
    }

    /// The initial reply MAC: the CP cryptogram encrypted under `s_mac1`
    /// then `s_mac2`. Seeds the MAC chain for the secure session.
    pub fn compute_rmac_i(&mut self, crypto: &dyn CryptoSuite) {
        let mut mac = self.cp_cryptogram;
        crypto.encrypt(&self.s_mac1, None, &mut mac);
        crypto.encrypt(&self.s_mac2, None, &mut mac);
        self.r_mac = mac;
    }

    /// Computes the MAC over a whole frame and advances the MAC chain:
    /// command MACs are chained off the previous reply MAC and stored as
    /// `c_mac`, reply MACs the other way around.
    pub fn compute_mac(&mut self, is_cmd: bool, frame: &[u8], crypto: &dyn CryptoSuite) -> [u8; 16] {
        let mut padded = [0u8; 256 + BLOCK_SIZE];
        let mut len = frame.len();
        padded[..len].copy_from_slice(frame);
        if len % BLOCK_SIZE != 0 {
            padded[len] = 0x80;
            len += BLOCK_SIZE - (len % BLOCK_SIZE);
        }

        let mut iv: [u8; 16] = if is_cmd { self.r_mac } else { self.c_mac };

        if len > BLOCK_SIZE {
            crypto.encrypt(&self.s_mac1, Some(&iv), &mut padded[..len - BLOCK_SIZE]);
            iv.copy_from_slice(&padded[len - 2 * BLOCK_SIZE..len - BLOCK_SIZE]);
        }

        let mut mac = [0u8; 16];
        mac.copy_from_slice(&padded[len - BLOCK_SIZE..len]);
        crypto.encrypt(&self.s_mac2, Some(&iv), &mut mac);

        if is_cmd {
            self.c_mac = mac;
        } else {
            self.r_mac = mac;
        }
        mac
    }

    /// Pads (0x80 then zeros) and encrypts a payload in place; `buf` must
    /// have room for the padded length, which is returned.
    pub fn encrypt_data(
        &self,
        is_cmd: bool,
        buf: &mut [u8],
        len: usize,
        crypto: &dyn CryptoSuite,
    ) -> usize {
        let padded = (len / BLOCK_SIZE + 1) * BLOCK_SIZE;
        buf[len] = 0x80;
        for b in buf[len + 1..padded].iter_mut() {
            *b = 0;
        }

        let iv = self.data_iv(is_cmd);
        crypto.encrypt(&self.s_enc, Some(&iv), &mut buf[..padded]);
        padded
    }

    /// Decrypts a payload in place and strips the padding; returns the
    /// plaintext length, or `None` when the padding is malformed.
    pub fn decrypt_data(&self, is_cmd: bool, data: &mut [u8], crypto: &dyn CryptoSuite) -> Option<usize> {
        if data.is_empty() || data.len() % BLOCK_SIZE != 0 {
            return None;
        }

        let iv = self.data_iv(is_cmd);
        crypto.decrypt(&self.s_enc, Some(&iv), data);

        let mut end = data.len();
        while end > 0 && data[end - 1] == 0 {
            end -= 1;
        }
        if end == 0 || data[end - 1] != 0x80 {
            return None;
        }
        Some(end - 1)
    }

    /// Payload IV: the bitwise complement of the MAC preceding this message
    /// in the chain.
    fn data_iv(&self, is_cmd: bool) -> [u8; 16] {
        let mut iv: [u8; 16] = if is_cmd { self.r_mac } else { self.c_mac };
        for b in iv.iter_mut() {
            *b = !*b;
        }
        iv
    }
}

/// Derives the per-device base key from the master key and the device
/// client UID: AES-ECB over `uid || ~uid`.
pub(crate) fn compute_scbk(
    master_key: &[u8; 16],
    uid: &[u8; 8],
    crypto: &dyn CryptoSuite,
) -> [u8; 16] {
    let mut scbk = [0u8; 16];
    scbk[..8].copy_from_slice(uid);
    for i in 8..16 {
        scbk[i] = !scbk[i - 8];
    }
    crypto.encrypt(master_key, None, &mut scbk);
    scbk
}
