//! The byte channel a control panel and a peripheral device talk over.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};

/// Half-duplex byte channel. `recv` must never block: it returns `Ok(0)`
/// when no bytes are available. `send` may block for at most one protocol
/// message. `flush` discards any bytes buffered in the receive direction.
pub trait Channel {
    fn send(&mut self, buf: &[u8]) -> io::Result<usize>;

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn flush(&mut self) {}
}

type SharedPipe = Arc<Mutex<VecDeque<u8>>>;

/// In-memory duplex channel; `pair` returns the two connected endpoints.
/// Used by the exerciser binaries and the loopback tests.
pub struct MemoryChannel {
    tx: SharedPipe,
    rx: SharedPipe,
}

impl MemoryChannel {
    pub fn pair() -> (MemoryChannel, MemoryChannel) {
        let a = Arc::new(Mutex::new(VecDeque::new()));
        let b = Arc::new(Mutex::new(VecDeque::new()));

        (
            MemoryChannel {
                tx: a.clone(),
                rx: b.clone(),
            },
            MemoryChannel { tx: b, rx: a },
        )
    }
}

impl Channel for MemoryChannel {
    fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut pipe = self.tx.lock().expect("Channel pipe poisoned");
        pipe.extend(buf.iter().copied());
        Ok(buf.len())
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut pipe = self.rx.lock().expect("Channel pipe poisoned");
        let count = buf.len().min(pipe.len());

        for slot in buf.iter_mut().take(count) {
            *slot = pipe.pop_front().expect("Length checked");
        }

        Ok(count)
    }

    fn flush(&mut self) {
        self.rx.lock().expect("Channel pipe poisoned").clear();
    }
}
