use rand::{Rng, thread_rng};
use std::fmt;

const ALPHABET: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";

/// Opaque connection identity. Display names may collide, ids don't.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(u64);

impl ConnId {
    pub fn generate() -> Self {
        Self(thread_rng().r#gen())
    }

    #[cfg(test)]
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let base = ALPHABET.len() as u64;
        let mut n = self.0;
        let mut buf = Vec::with_capacity(13);

        loop {
            buf.push(ALPHABET[(n % base) as usize]);
            n /= base;
            if n == 0 {
                break;
            }
        }
        buf.reverse();

        // ALPHABET is ascii
        f.write_str(std::str::from_utf8(&buf).map_err(|_| fmt::Error)?)
    }
}
