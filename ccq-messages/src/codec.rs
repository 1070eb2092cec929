//! Bounds-checked primitives shared by every message layout.
//!
//! Integers are big-endian. Lists carry a one byte count, blobs and strings a
//! four byte length.
use bytes::Buf;
use bytes::BufMut;
use thiserror::Error;

#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum DecodeError {
    #[error("truncated input reading {field}: needed {needed} bytes, {remaining} remaining")]
    Truncated {
        field: &'static str,
        needed: usize,
        remaining: usize,
    },

    #[error("{field} declares {declared} bytes but only {remaining} remain")]
    Overrun {
        field: &'static str,
        declared: usize,
        remaining: usize,
    },

    #[error("{remaining} trailing bytes after {field}")]
    TrailingBytes {
        field: &'static str,
        remaining: usize,
    },

    #[error("unsupported message version {0}")]
    UnsupportedVersion(u8),

    #[error("unsupported query type {0}")]
    UnknownQueryType(u8),

    #[error("{field} is not valid UTF-8")]
    InvalidUtf8 { field: &'static str },

    #[error("{field} must not be empty")]
    Empty { field: &'static str },

    #[error("{field} is not valid hex: {reason}")]
    InvalidHex {
        field: &'static str,
        reason: String,
    },

    #[error("response does not match its request: {0}")]
    ResponseMismatch(String),
}

#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum EncodeError {
    #[error("{field} must not be empty")]
    Empty { field: &'static str },

    #[error("{field} has {len} entries, at most 255 are allowed")]
    TooMany { field: &'static str, len: usize },

    #[error("{field} is {len} bytes, too long for a u32 length prefix")]
    TooLong { field: &'static str, len: usize },

    #[error("unsupported message version {0}")]
    UnsupportedVersion(u8),

    #[error("response does not match its request: {0}")]
    ResponseMismatch(String),
}

/// Cursor over an input buffer. Every read checks the remaining length first.
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn ensure(
        &self,
        needed: usize,
        field: &'static str,
    ) -> Result<(), DecodeError> {
        if self.buf.remaining() < needed {
            return Err(DecodeError::Truncated {
                field,
                needed,
                remaining: self.buf.remaining(),
            });
        }
        Ok(())
    }

    pub(crate) fn u8(
        &mut self,
        field: &'static str,
    ) -> Result<u8, DecodeError> {
        self.ensure(1, field)?;
        Ok(self.buf.get_u8())
    }

    pub(crate) fn u16(
        &mut self,
        field: &'static str,
    ) -> Result<u16, DecodeError> {
        self.ensure(2, field)?;
        Ok(self.buf.get_u16())
    }

    pub(crate) fn u32(
        &mut self,
        field: &'static str,
    ) -> Result<u32, DecodeError> {
        self.ensure(4, field)?;
        Ok(self.buf.get_u32())
    }

    pub(crate) fn u64(
        &mut self,
        field: &'static str,
    ) -> Result<u64, DecodeError> {
        self.ensure(8, field)?;
        Ok(self.buf.get_u64())
    }

    pub(crate) fn array<const N: usize>(
        &mut self,
        field: &'static str,
    ) -> Result<[u8; N], DecodeError> {
        self.ensure(N, field)?;
        let mut out = [0u8; N];
        self.buf.copy_to_slice(&mut out);
        Ok(out)
    }

    /// Reads a `u32` length followed by that many bytes.
    pub(crate) fn blob(
        &mut self,
        field: &'static str,
    ) -> Result<&'a [u8], DecodeError> {
        let declared = self.u32(field)? as usize;
        if declared > self.buf.len() {
            return Err(DecodeError::Overrun {
                field,
                declared,
                remaining: self.buf.len(),
            });
        }
        let (head, tail) = self.buf.split_at(declared);
        self.buf = tail;
        Ok(head)
    }

    /// Reads a one byte list count, rejecting empty lists.
    pub(crate) fn count(
        &mut self,
        field: &'static str,
    ) -> Result<usize, DecodeError> {
        match self.u8(field)? {
            0 => Err(DecodeError::Empty { field }),
            n => Ok(n as usize),
        }
    }

    /// Fails unless the whole buffer has been consumed.
    pub(crate) fn finish(
        self,
        field: &'static str,
    ) -> Result<(), DecodeError> {
        if !self.buf.is_empty() {
            return Err(DecodeError::TrailingBytes {
                field,
                remaining: self.buf.len(),
            });
        }
        Ok(())
    }
}

/// Writes a `u32` length followed by `data`.
pub(crate) fn put_blob(
    out: &mut Vec<u8>,
    field: &'static str,
    data: &[u8],
) -> Result<(), EncodeError> {
    let len = u32::try_from(data.len()).map_err(|_| {
        EncodeError::TooLong {
            field,
            len: data.len(),
        }
    })?;
    out.put_u32(len);
    out.put_slice(data);
    Ok(())
}

/// Converts a list length into its one byte count.
pub(crate) fn put_count(
    out: &mut Vec<u8>,
    field: &'static str,
    len: usize,
) -> Result<(), EncodeError> {
    if len == 0 {
        return Err(EncodeError::Empty { field });
    }
    let count = u8::try_from(len).map_err(|_| EncodeError::TooMany { field, len })?;
    out.put_u8(count);
    Ok(())
}

/// Decodes a hex string, with or without a `0x` prefix.
pub fn decode_hex(
    field: &'static str,
    s: &str,
) -> Result<Vec<u8>, DecodeError> {
    let s = s.trim();
    let s = s.strip_prefix("0x").unwrap_or(s);
    hex::decode(s).map_err(|err| {
        DecodeError::InvalidHex {
            field,
            reason: err.to_string(),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reader_reports_truncation() {
        let mut reader = Reader::new(&[0x00, 0x01]);
        assert_eq!(reader.u16("chain id"), Ok(1));
        assert_eq!(
            reader.u32("nonce"),
            Err(DecodeError::Truncated {
                field: "nonce",
                needed: 4,
                remaining: 0,
            })
        );
    }

    #[test]
    fn blob_overrun_is_distinct_from_truncation() {
        let mut reader = Reader::new(&[0x00, 0x00, 0x00, 0x05, 0xaa, 0xbb]);
        assert_eq!(
            reader.blob("call data"),
            Err(DecodeError::Overrun {
                field: "call data",
                declared: 5,
                remaining: 2,
            })
        );
    }

    #[test]
    fn finish_rejects_leftovers() {
        let mut reader = Reader::new(&[0x01, 0x02]);
        reader.u8("version").unwrap();
        assert_eq!(
            reader.finish("query request"),
            Err(DecodeError::TrailingBytes {
                field: "query request",
                remaining: 1,
            })
        );
    }

    #[test]
    fn counts_must_fit_one_byte() {
        let mut out = Vec::new();
        assert_eq!(
            put_count(&mut out, "calls", 256),
            Err(EncodeError::TooMany {
                field: "calls",
                len: 256
            })
        );
        assert_eq!(
            put_count(&mut out, "calls", 0),
            Err(EncodeError::Empty { field: "calls" })
        );
        put_count(&mut out, "calls", 255).unwrap();
        assert_eq!(out, vec![0xff]);
    }

    #[test]
    fn hex_accepts_optional_prefix() {
        assert_eq!(decode_hex("bytes", "0x0a0b").unwrap(), vec![0x0a, 0x0b]);
        assert_eq!(decode_hex("bytes", "0A0B").unwrap(), vec![0x0a, 0x0b]);
        assert!(matches!(
            decode_hex("bytes", "zz"),
            Err(DecodeError::InvalidHex { field: "bytes", .. })
        ));
    }
}
