//! # Key and Number Types
//!
//! Small value types shared by the codec and the client: validated keys,
//! ttl rendering, and the allocation-free ASCII number helpers the codec
//! uses on both directions of the wire.
//!
//! ## Design Principles
//!
//! 1. **Validate At The Edge**: A key that could split a request line is
//!    rejected before it reaches a shared connection.
//! 2. **Stack Formatting**: Integers are rendered through a small stack
//!    buffer instead of `to_string()`.
//! 3. **Strict Parsing**: Numeric tokens are plain ASCII digits, nothing else.

use std::fmt;
use std::time::Duration;

use bytes::{BufMut, BytesMut};

use crate::error::{ClientError, ClientResult};

/// Maximum key size accepted by the meta protocol.
pub const MAX_KEY_SIZE: usize = 250;

/// A key that is safe to place on a meta request line.
///
/// Keys are 1..=250 bytes and contain no ASCII whitespace or control bytes;
/// either would let a single request bleed into the next one.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Key(String);

impl Key {
    /// Validates and wraps a key.
    ///
    /// # Errors
    /// Returns `ClientError::InvalidKey` for empty, oversized, or
    /// whitespace/control-bearing keys.
    ///
    /// # Examples
    /// ```rust
    /// use memmeta_common::Key;
    ///
    /// let key = Key::new("alpha").expect("valid key");
    /// assert_eq!(key.as_str(), "alpha");
    /// assert!(Key::new("two words").is_err());
    /// ```
    pub fn new(key: impl Into<String>) -> ClientResult<Self> {
        let key = key.into();
        if key.is_empty() {
            return Err(ClientError::InvalidKey("key is empty".into()));
        }
        if key.len() > MAX_KEY_SIZE {
            return Err(ClientError::InvalidKey(format!(
                "key is {} bytes, limit is {}",
                key.len(),
                MAX_KEY_SIZE
            )));
        }
        if key.bytes().any(|b| b <= b' ' || b == 0x7f) {
            return Err(ClientError::InvalidKey(format!("{:?} contains whitespace or control bytes", key)));
        }
        Ok(Key(key))
    }

    /// Returns the key text.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the key bytes.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    /// Returns the key length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Always false; empty keys are rejected by `Key::new`.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({:?})", self.0)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<&str> for Key {
    type Error = ClientError;

    fn try_from(value: &str) -> ClientResult<Self> {
        Key::new(value)
    }
}

impl TryFrom<String> for Key {
    type Error = ClientError;

    fn try_from(value: String) -> ClientResult<Self> {
        Key::new(value)
    }
}

/// Appends a ttl as a non-negative number of seconds.
///
/// Whole seconds render as integers (`5`); sub-second parts render as a
/// shortest decimal (`1.5`).
pub fn push_ttl(out: &mut BytesMut, ttl: Duration) {
    if ttl.subsec_nanos() == 0 {
        push_u64(out, ttl.as_secs());
        return;
    }
    // f64 Display never uses exponent notation.
    out.extend_from_slice(ttl.as_secs_f64().to_string().as_bytes());
}

/// Appends an unsigned integer in ASCII decimal.
pub fn push_u64(out: &mut BytesMut, mut value: u64) {
    // Write digits into a small stack buffer to avoid heap allocations.
    let mut buf = [0u8; 20];
    let mut len = 0;
    if value == 0 {
        buf[0] = b'0';
        len = 1;
    } else {
        while value > 0 {
            buf[len] = b'0' + (value % 10) as u8;
            value /= 10;
            len += 1;
        }
    }
    for idx in (0..len).rev() {
        out.put_u8(buf[idx]);
    }
}

/// Parses an ASCII decimal integer, rejecting signs and empty input.
pub fn parse_u64(data: &[u8]) -> Option<u64> {
    if data.is_empty() {
        return None;
    }
    let mut value: u64 = 0;
    for &b in data {
        if !b.is_ascii_digit() {
            return None;
        }
        value = value.checked_mul(10)?.checked_add((b - b'0') as u64)?;
    }
    Some(value)
}

/// Parses the counter text written into a sink by increment/decrement.
///
/// An empty sink reads as zero.
///
/// # Errors
/// Returns `ClientError::Protocol` when the text is not a decimal number.
pub fn parse_counter(data: &[u8]) -> ClientResult<u64> {
    if data.is_empty() {
        return Ok(0);
    }
    parse_u64(data).ok_or_else(|| {
        ClientError::Protocol(format!("counter value {:?} is not a number", String::from_utf8_lossy(data)))
    })
}
