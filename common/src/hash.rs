use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::{fmt, ops::Deref, str::FromStr};

/// Data that is a cryptographic hash of `BYTES` long.
///
/// The core never computes hashes itself; it only compares, orders and
/// displays them. Producing a hash is the job of the proof verifier.
///
/// # Examples
///
/// ```ignore
/// use meridian_common::Hash;
///
/// let hash: Hash<32> = "00000000000000000000000000000000000000000000000000000000000000ff"
///     .parse()
///     .unwrap();
/// assert_eq!(hash.leading_zero_bits(), 248);
/// ```
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Hash<const BYTES: usize>([u8; BYTES]);

impl<const BYTES: usize> Default for Hash<BYTES> {
    fn default() -> Self {
        Self::new([0u8; BYTES])
    }
}

// Hex strings on the wire and in config, like block explorers show them
impl<const BYTES: usize> Serialize for Hash<BYTES> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de, const BYTES: usize> Deserialize<'de> for Hash<BYTES> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: String = Deserialize::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl<const BYTES: usize> Hash<BYTES> {
    #[inline]
    pub const fn new(bytes: [u8; BYTES]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    #[inline]
    pub fn into_inner(self) -> [u8; BYTES] {
        self.0
    }

    /// Number of leading zero bits, the measure a proof-of-work target is
    /// expressed in.
    pub fn leading_zero_bits(&self) -> u32 {
        let mut bits = 0;
        for byte in self.0 {
            if byte == 0 {
                bits += 8;
            } else {
                bits += byte.leading_zeros();
                break;
            }
        }
        bits
    }

    /// Short form for log lines.
    pub fn short(&self) -> String {
        let len = BYTES.min(4);
        hex::encode(&self.0[..len])
    }
}

impl<const BYTES: usize> From<[u8; BYTES]> for Hash<BYTES> {
    #[inline]
    fn from(bytes: [u8; BYTES]) -> Self {
        Self::new(bytes)
    }
}

impl<const BYTES: usize> TryFrom<&[u8]> for Hash<BYTES> {
    type Error = std::array::TryFromSliceError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let hash: [u8; BYTES] = value.try_into()?;
        Ok(Self::new(hash))
    }
}

impl<const BYTES: usize> AsRef<[u8]> for Hash<BYTES> {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl<const BYTES: usize> Deref for Hash<BYTES> {
    type Target = [u8; BYTES];

    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<const BYTES: usize> fmt::Debug for Hash<BYTES> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple(&format!("Hash<{BYTES}>")).field(&hex::encode(self)).finish()
    }
}

impl<const BYTES: usize> fmt::Display for Hash<BYTES> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self))
    }
}

impl<const BYTES: usize> FromStr for Hash<BYTES> {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0; BYTES];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(Self::new(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leading_zero_bits_counts_across_bytes() {
        let mut bytes = [0xffu8; 32];
        bytes[0] = 0;
        bytes[1] = 0b0001_0000;
        assert_eq!(Hash::new(bytes).leading_zero_bits(), 11);
        assert_eq!(Hash::<32>::default().leading_zero_bits(), 256);
    }

    #[test]
    fn parses_and_displays_hex() {
        let text = "0102030400000000000000000000000000000000000000000000000000000000";
        let hash: Hash<32> = text.parse().unwrap();
        assert_eq!(hash.to_string(), text);
        assert_eq!(hash.short(), "01020304");
    }

    #[test]
    fn rejects_wrong_length() {
        assert!("0102".parse::<Hash<32>>().is_err());
    }

    #[test]
    fn serde_uses_hex_strings() {
        let hash = Hash::<4>::new([0xde, 0xad, 0xbe, 0xef]);
        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(json, "\"deadbeef\"");
        let back: Hash<4> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, hash);
    }
}
