//! Digest of a combined simulation state, using Blake3.

use std::fmt;

/// A 32-byte digest of a simulated global state.
///
/// Equal states always produce equal digests. The duplicate-state detector
/// keys its visited set on the 32-bit [`StateHash::fingerprint`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateHash([u8; 32]);

impl StateHash {
    /// Digest several byte slices as if concatenated.
    pub fn from_parts(parts: &[&[u8]]) -> Self {
        let mut hasher = blake3::Hasher::new();
        for part in parts {
            hasher.update(part);
        }
        Self(*hasher.finalize().as_bytes())
    }

    /// Hex encoding of the full digest.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First four bytes as a little-endian `u32`.
    pub fn fingerprint(&self) -> u32 {
        u32::from_le_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
    }
}

impl fmt::Debug for StateHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        write!(f, "StateHash({}..{})", &hex[..8], &hex[56..])
    }
}

impl fmt::Display for StateHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_hash_deterministic() {
        let a = StateHash::from_parts(&[b"node 0 ".as_slice(), b"[init]".as_slice()]);
        let b = StateHash::from_parts(&[b"node 0 ".as_slice(), b"[init]".as_slice()]);
        assert_eq!(a, b);
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_parts_hash_as_concatenation() {
        let joined = StateHash::from_parts(&[b"abcdef".as_slice()]);
        let split = StateHash::from_parts(&[b"abc".as_slice(), b"def".as_slice()]);
        assert_eq!(joined, split);
        assert_ne!(joined, StateHash::from_parts(&[b"abcdeg".as_slice()]));
    }

    #[test]
    fn test_display_is_full_hex() {
        let h = StateHash::from_parts(&[b"x".as_slice()]);
        assert_eq!(h.to_string().len(), 64);
        assert_eq!(h.to_string(), h.to_hex());
        assert!(format!("{h:?}").starts_with("StateHash("));
    }
}
