//! Minimal bencode reader/writer for the storage-node and notifier wire
//! formats.
//!
//! Dicts are written with caller-supplied keys which must already be in
//! ascending (ASCII) order; the writer debug-asserts that.  The reader
//! mirrors the consume-in-order style of the peers: `skip_until`
//! advances past any smaller keys and reports whether the requested key
//! is present.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BtError {
    #[error("truncated bencode data")]
    Truncated,
    #[error("expected {0}")]
    Expected(&'static str),
    #[error("invalid integer")]
    BadInt,
    #[error("integer out of range")]
    IntRange,
}

// ---------------------------------------------------------------------------
// Writing

/// Appends a bencoded byte string (`3:abc`) to `buf`.
pub fn write_string(buf: &mut Vec<u8>, val: &[u8]) {
    buf.extend_from_slice(val.len().to_string().as_bytes());
    buf.push(b':');
    buf.extend_from_slice(val);
}

/// Appends a bencoded integer (`i-42e`) to `buf`.
pub fn write_int(buf: &mut Vec<u8>, val: i64) {
    buf.push(b'i');
    buf.extend_from_slice(val.to_string().as_bytes());
    buf.push(b'e');
}

/// Writes a bencoded dict into a caller-owned buffer.  Keys must be
/// appended in strictly ascending ASCII order.
pub struct BtDictWriter<'b> {
    buf: &'b mut Vec<u8>,
    last_key: Vec<u8>,
}

impl<'b> BtDictWriter<'b> {
    pub fn new(buf: &'b mut Vec<u8>) -> Self {
        buf.push(b'd');
        Self {
            buf,
            last_key: Vec::new(),
        }
    }

    fn key(&mut self, key: &str) {
        debug_assert!(
            self.last_key.is_empty() || self.last_key.as_slice() < key.as_bytes(),
            "bt dict keys must be appended in ascending order"
        );
        self.last_key = key.as_bytes().to_vec();
        write_string(self.buf, key.as_bytes());
    }

    pub fn append_str(&mut self, key: &str, val: &[u8]) {
        self.key(key);
        write_string(self.buf, val);
    }

    pub fn append_int(&mut self, key: &str, val: i64) {
        self.key(key);
        write_int(self.buf, val);
    }

    pub fn append_int_list(&mut self, key: &str, vals: impl IntoIterator<Item = i64>) {
        self.key(key);
        self.buf.push(b'l');
        for v in vals {
            write_int(self.buf, v);
        }
        self.buf.push(b'e');
    }

    pub fn finish(self) {
        self.buf.push(b'e');
    }
}

// ---------------------------------------------------------------------------
// Reading

fn split_digits(data: &[u8]) -> Result<(&[u8], &[u8]), BtError> {
    let end = data
        .iter()
        .position(|b| !b.is_ascii_digit())
        .ok_or(BtError::Truncated)?;
    if end == 0 {
        return Err(BtError::Expected("digits"));
    }
    Ok(data.split_at(end))
}

fn split_string(data: &[u8]) -> Result<(&[u8], &[u8]), BtError> {
    let (digits, rest) = split_digits(data)?;
    let len: usize = std::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(BtError::BadInt)?;
    let rest = rest.strip_prefix(b":").ok_or(BtError::Expected("':'"))?;
    if rest.len() < len {
        return Err(BtError::Truncated);
    }
    Ok(rest.split_at(len))
}

fn split_int(data: &[u8]) -> Result<(i64, &[u8]), BtError> {
    let rest = data.strip_prefix(b"i").ok_or(BtError::Expected("'i'"))?;
    let end = rest.iter().position(|&b| b == b'e').ok_or(BtError::Truncated)?;
    let val = std::str::from_utf8(&rest[..end])
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(BtError::BadInt)?;
    Ok((val, &rest[end + 1..]))
}

/// Skips one bencoded value, returning what follows it.
fn skip_value(data: &[u8]) -> Result<&[u8], BtError> {
    match data.first().ok_or(BtError::Truncated)? {
        b'i' => split_int(data).map(|(_, rest)| rest),
        b'0'..=b'9' => split_string(data).map(|(_, rest)| rest),
        b'l' | b'd' => {
            let mut rest = &data[1..];
            while *rest.first().ok_or(BtError::Truncated)? != b'e' {
                rest = skip_value(rest)?;
            }
            Ok(&rest[1..])
        }
        _ => Err(BtError::Expected("value")),
    }
}

/// Reads a bencoded dict, consuming keys in order.
pub struct BtDictReader<'a> {
    rest: &'a [u8],
    pending_key: Option<&'a [u8]>,
    done: bool,
}

impl<'a> BtDictReader<'a> {
    pub fn new(data: &'a [u8]) -> Result<Self, BtError> {
        let rest = data.strip_prefix(b"d").ok_or(BtError::Expected("dict"))?;
        Ok(Self {
            rest,
            pending_key: None,
            done: false,
        })
    }

    /// Advances to the next key, leaving its value pending.  Returns
    /// `None` once the dict is exhausted.
    pub fn next_key(&mut self) -> Result<Option<&'a [u8]>, BtError> {
        if self.pending_key.take().is_some() {
            // A previously peeked key whose value was never read.
            self.rest = skip_value(self.rest)?;
        }
        if self.done {
            return Ok(None);
        }
        if *self.rest.first().ok_or(BtError::Truncated)? == b'e' {
            self.done = true;
            self.rest = &self.rest[1..];
            return Ok(None);
        }
        let (key, rest) = split_string(self.rest)?;
        self.rest = rest;
        self.pending_key = Some(key);
        Ok(Some(key))
    }

    /// Consumes keys smaller than `key`; returns true (with the value
    /// pending) if `key` itself is present.
    pub fn skip_until(&mut self, key: &[u8]) -> Result<bool, BtError> {
        loop {
            if self.pending_key.is_none() && self.next_key()?.is_none() {
                return Ok(false);
            }
            let current = self.pending_key.unwrap();
            if current == key {
                return Ok(true);
            }
            if current > key {
                return Ok(false);
            }
            // Smaller: drop this entry and move on.
            self.pending_key = None;
            self.rest = skip_value(self.rest)?;
        }
    }

    /// True if the pending value is an integer.
    pub fn is_integer(&self) -> bool {
        self.pending_key.is_some() && self.rest.first() == Some(&b'i')
    }

    /// Consumes the pending value as a byte string.
    pub fn string(&mut self) -> Result<&'a [u8], BtError> {
        if self.pending_key.take().is_none() {
            return Err(BtError::Expected("pending value"));
        }
        let (val, rest) = split_string(self.rest)?;
        self.rest = rest;
        Ok(val)
    }

    /// Consumes the pending value as an integer.
    pub fn integer<T: TryFrom<i64>>(&mut self) -> Result<T, BtError> {
        if self.pending_key.take().is_none() {
            return Err(BtError::Expected("pending value"));
        }
        let (val, rest) = split_int(self.rest)?;
        self.rest = rest;
        T::try_from(val).map_err(|_| BtError::IntRange)
    }
}

/// Reads the elements of a bencoded list as raw value slices.
pub struct BtListReader<'a> {
    rest: &'a [u8],
    done: bool,
}

impl<'a> BtListReader<'a> {
    pub fn new(data: &'a [u8]) -> Result<Self, BtError> {
        let rest = data.strip_prefix(b"l").ok_or(BtError::Expected("list"))?;
        Ok(Self { rest, done: false })
    }

    /// The raw bytes of the next element, or `None` at the end.
    pub fn next_raw(&mut self) -> Result<Option<&'a [u8]>, BtError> {
        if self.done {
            return Ok(None);
        }
        if *self.rest.first().ok_or(BtError::Truncated)? == b'e' {
            self.done = true;
            return Ok(None);
        }
        let after = skip_value(self.rest)?;
        let val = &self.rest[..self.rest.len() - after.len()];
        self.rest = after;
        Ok(Some(val))
    }
}
