use std::time::Instant;

/// Returns the number of whole milliseconds elapsed since the supplied instant.
#[inline]
pub fn millis_since(earlier: Instant) -> u64 {
    Instant::now().duration_since(earlier).as_millis() as u64
}
