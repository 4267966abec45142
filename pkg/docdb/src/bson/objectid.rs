use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use common::errors::*;

/// 12-byte identifier: 4-byte seconds-since-epoch, 3-byte machine id,
/// 2-byte process id, 3-byte counter.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId([u8; 12]);

static COUNTER: AtomicU32 = AtomicU32::new(0);

impl ObjectId {
    pub const LEN: usize = 12;

    pub fn from_bytes(bytes: [u8; 12]) -> Self {
        Self(bytes)
    }

    pub fn bytes(&self) -> &[u8; 12] {
        &self.0
    }

    /// Generates a fresh id the way the reference codebase's connection
    /// layer stamps identifiers onto outgoing requests: a counter plus a
    /// coarse per-process fingerprint, no external randomness source.
    pub fn generate() -> Self {
        let time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as u32;

        let pid = std::process::id() as u16;
        let machine = machine_fingerprint();

        let counter = COUNTER.fetch_add(1, Ordering::Relaxed) & 0x00ff_ffff;

        let mut out = [0u8; 12];
        out[0..4].copy_from_slice(&time.to_be_bytes());
        out[4..7].copy_from_slice(&machine);
        out[7..9].copy_from_slice(&pid.to_be_bytes());
        out[9] = ((counter >> 16) & 0xff) as u8;
        out[10] = ((counter >> 8) & 0xff) as u8;
        out[11] = (counter & 0xff) as u8;

        Self(out)
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() != 12 {
            return Err(format_err!("object-id must be exactly 12 bytes"));
        }
        let mut out = [0u8; 12];
        out.copy_from_slice(data);
        Ok(Self(out))
    }
}

fn machine_fingerprint() -> [u8; 3] {
    let name = hostname_or_default();
    let mut hash: u32 = 0;
    for b in name.as_bytes() {
        hash = hash.wrapping_mul(31).wrapping_add(*b as u32);
    }
    let b = hash.to_be_bytes();
    [b[1], b[2], b[3]]
}

fn hostname_or_default() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0.iter() {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_bytes() {
        let id = ObjectId::generate();
        let parsed = ObjectId::parse(id.bytes()).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(ObjectId::parse(&[0u8; 11]).is_err());
    }
}
