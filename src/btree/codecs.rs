//! Codec traits injected by the storage builder: an order-preserving key
//! codec and an opaque value codec.

use std::cmp::Ordering;

use crate::error::{Result, VesperError};

/// Trait implemented by key types stored in the tree.
///
/// The encoded representation must be order-preserving: comparing encoded
/// byte strings with [`KeyCodec::compare_encoded`] yields the same total
/// order as the logical keys.
pub trait KeyCodec: Sized {
    /// Encode `key` into `out` using the order-preserving representation.
    fn encode_key(key: &Self, out: &mut Vec<u8>);

    /// Compare two encoded keys.
    fn compare_encoded(a: &[u8], b: &[u8]) -> Ordering;

    /// Decode a key from its encoded representation.
    fn decode_key(bytes: &[u8]) -> Result<Self>;
}

/// Trait implemented by value types stored in the tree. Values are opaque
/// to the engine and replaced wholesale on update.
pub trait ValCodec: Sized {
    /// Encode `value` into `out`.
    fn encode_val(value: &Self, out: &mut Vec<u8>);

    /// Decode a value from `src`.
    fn decode_val(src: &[u8]) -> Result<Self>;
}

fn fixed_width<const N: usize>(bytes: &[u8], what: &'static str) -> Result<[u8; N]> {
    bytes
        .try_into()
        .map_err(|_| VesperError::Corruption(what))
}

impl KeyCodec for u64 {
    fn encode_key(key: &Self, out: &mut Vec<u8>) {
        out.extend_from_slice(&key.to_be_bytes());
    }

    fn compare_encoded(a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }

    fn decode_key(bytes: &[u8]) -> Result<Self> {
        Ok(u64::from_be_bytes(fixed_width(bytes, "u64 key length")?))
    }
}

impl KeyCodec for i64 {
    fn encode_key(key: &Self, out: &mut Vec<u8>) {
        // Flip the sign bit so negative keys sort before positive ones.
        out.extend_from_slice(&(*key as u64 ^ (1 << 63)).to_be_bytes());
    }

    fn compare_encoded(a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }

    fn decode_key(bytes: &[u8]) -> Result<Self> {
        let raw = u64::from_be_bytes(fixed_width(bytes, "i64 key length")?);
        Ok((raw ^ (1 << 63)) as i64)
    }
}

impl KeyCodec for i32 {
    fn encode_key(key: &Self, out: &mut Vec<u8>) {
        out.extend_from_slice(&(*key as u32 ^ (1 << 31)).to_be_bytes());
    }

    fn compare_encoded(a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }

    fn decode_key(bytes: &[u8]) -> Result<Self> {
        let raw = u32::from_be_bytes(fixed_width(bytes, "i32 key length")?);
        Ok((raw ^ (1 << 31)) as i32)
    }
}

impl KeyCodec for String {
    fn encode_key(key: &Self, out: &mut Vec<u8>) {
        out.extend_from_slice(key.as_bytes());
    }

    fn compare_encoded(a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }

    fn decode_key(bytes: &[u8]) -> Result<Self> {
        String::from_utf8(bytes.to_vec())
            .map_err(|_| VesperError::Corruption("string key is not valid UTF-8"))
    }
}

impl KeyCodec for Vec<u8> {
    fn encode_key(key: &Self, out: &mut Vec<u8>) {
        out.extend_from_slice(key);
    }

    fn compare_encoded(a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }

    fn decode_key(bytes: &[u8]) -> Result<Self> {
        Ok(bytes.to_vec())
    }
}

impl ValCodec for String {
    fn encode_val(value: &Self, out: &mut Vec<u8>) {
        out.extend_from_slice(value.as_bytes());
    }

    fn decode_val(src: &[u8]) -> Result<Self> {
        String::from_utf8(src.to_vec())
            .map_err(|_| VesperError::Corruption("string value is not valid UTF-8"))
    }
}

impl ValCodec for Vec<u8> {
    fn encode_val(value: &Self, out: &mut Vec<u8>) {
        out.extend_from_slice(value);
    }

    fn decode_val(src: &[u8]) -> Result<Self> {
        Ok(src.to_vec())
    }
}

impl ValCodec for u64 {
    fn encode_val(value: &Self, out: &mut Vec<u8>) {
        out.extend_from_slice(&value.to_be_bytes());
    }

    fn decode_val(src: &[u8]) -> Result<Self> {
        Ok(u64::from_be_bytes(fixed_width(src, "u64 value length")?))
    }
}

impl ValCodec for i32 {
    fn encode_val(value: &Self, out: &mut Vec<u8>) {
        out.extend_from_slice(&value.to_be_bytes());
    }

    fn decode_val(src: &[u8]) -> Result<Self> {
        Ok(i32::from_be_bytes(fixed_width(src, "i32 value length")?))
    }
}
