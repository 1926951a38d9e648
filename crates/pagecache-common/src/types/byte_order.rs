//! Byte order of multi-byte values stored in pages.

use serde::{Deserialize, Serialize};

/// Byte order used to encode integers inside a storage's pages.
///
/// # Example
///
/// ```rust
/// use pagecache_common::types::ByteOrder;
///
/// let mut bytes = [0u8; 4];
/// ByteOrder::BigEndian.put_i32(&mut bytes, 0x0102_0304);
/// assert_eq!(bytes, [1, 2, 3, 4]);
/// assert_eq!(ByteOrder::BigEndian.get_i32(&bytes), 0x0102_0304);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ByteOrder {
    /// The byte order of the running machine.
    #[default]
    Native,
    /// Most significant byte first.
    BigEndian,
    /// Least significant byte first.
    LittleEndian,
}

impl ByteOrder {
    /// Returns true if values are stored in the machine's own byte order.
    #[must_use]
    pub const fn is_native(self) -> bool {
        match self {
            Self::Native => true,
            Self::BigEndian => cfg!(target_endian = "big"),
            Self::LittleEndian => cfg!(target_endian = "little"),
        }
    }

    /// Decodes an `i32` from the first 4 bytes of `bytes`.
    ///
    /// # Panics
    ///
    /// Panics if `bytes` is shorter than 4 bytes.
    #[must_use]
    pub fn get_i32(self, bytes: &[u8]) -> i32 {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&bytes[..4]);
        match self {
            Self::Native => i32::from_ne_bytes(raw),
            Self::BigEndian => i32::from_be_bytes(raw),
            Self::LittleEndian => i32::from_le_bytes(raw),
        }
    }

    /// Encodes an `i32` into the first 4 bytes of `bytes`.
    ///
    /// # Panics
    ///
    /// Panics if `bytes` is shorter than 4 bytes.
    pub fn put_i32(self, bytes: &mut [u8], value: i32) {
        let raw = match self {
            Self::Native => value.to_ne_bytes(),
            Self::BigEndian => value.to_be_bytes(),
            Self::LittleEndian => value.to_le_bytes(),
        };
        bytes[..4].copy_from_slice(&raw);
    }

    /// Decodes an `i64` from the first 8 bytes of `bytes`.
    ///
    /// # Panics
    ///
    /// Panics if `bytes` is shorter than 8 bytes.
    #[must_use]
    pub fn get_i64(self, bytes: &[u8]) -> i64 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&bytes[..8]);
        match self {
            Self::Native => i64::from_ne_bytes(raw),
            Self::BigEndian => i64::from_be_bytes(raw),
            Self::LittleEndian => i64::from_le_bytes(raw),
        }
    }

    /// Encodes an `i64` into the first 8 bytes of `bytes`.
    ///
    /// # Panics
    ///
    /// Panics if `bytes` is shorter than 8 bytes.
    pub fn put_i64(self, bytes: &mut [u8], value: i64) {
        let raw = match self {
            Self::Native => value.to_ne_bytes(),
            Self::BigEndian => value.to_be_bytes(),
            Self::LittleEndian => value.to_le_bytes(),
        };
        bytes[..8].copy_from_slice(&raw);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_big_endian_layout() {
        let mut bytes = [0u8; 8];
        ByteOrder::BigEndian.put_i64(&mut bytes, 0x0102_0304_0506_0708);
        assert_eq!(bytes, [1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_little_endian_layout() {
        let mut bytes = [0u8; 4];
        ByteOrder::LittleEndian.put_i32(&mut bytes, 0x0102_0304);
        assert_eq!(bytes, [4, 3, 2, 1]);
        assert_eq!(ByteOrder::LittleEndian.get_i32(&bytes), 0x0102_0304);
    }

    #[test]
    fn test_native_matches_target() {
        assert!(ByteOrder::Native.is_native());
        assert_ne!(
            ByteOrder::BigEndian.is_native(),
            ByteOrder::LittleEndian.is_native()
        );

        let mut bytes = [0u8; 8];
        ByteOrder::Native.put_i64(&mut bytes, -42);
        assert_eq!(i64::from_ne_bytes(bytes), -42);
    }
}
