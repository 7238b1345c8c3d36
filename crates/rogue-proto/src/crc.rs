//! Running CRC32 (IEEE 802.3) used by the packetizer v2 tail.

use crc32fast::Hasher;

/// CRC32 accumulated over a sequence of slices.
///
/// The value after feeding segments `a`, `b`, `c` equals the CRC of their
/// concatenation, which lets the packetizer carry one CRC across every
/// segment of a frame.
#[derive(Clone, Default)]
pub struct RunningCrc {
    hasher: Hasher,
}

impl RunningCrc {
    /// Start a fresh CRC.
    pub fn new() -> Self {
        Self { hasher: Hasher::new() }
    }

    /// Feed more bytes.
    pub fn update(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    /// Current CRC value; the accumulator keeps running.
    pub fn value(&self) -> u32 {
        self.hasher.clone().finalize()
    }

    /// Forget everything fed so far.
    pub fn reset(&mut self) {
        self.hasher.reset();
    }
}

impl std::fmt::Debug for RunningCrc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RunningCrc({:#010x})", self.value())
    }
}

/// One-shot CRC32 of a slice.
pub fn crc32(bytes: &[u8]) -> u32 {
    crc32fast::hash(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_answer() {
        // Standard check value for CRC-32/ISO-HDLC
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn running_equals_concatenation() {
        let mut crc = RunningCrc::new();
        crc.update(b"1234");
        let partial = crc.value();
        crc.update(b"56789");
        assert_eq!(crc.value(), crc32(b"123456789"));
        assert_eq!(partial, crc32(b"1234"));

        crc.reset();
        assert_eq!(crc.value(), crc32(b""));
    }
}
