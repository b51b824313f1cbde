//! Compressed chunks.
//!
//! A chunk is one row range of a vector, stored under its own key. The byte
//! layout starts with `[scheme: u8][len: u32 LE]`, so a chunk decodes without
//! its parent vector. Whatever the scheme, readers see the same accessors and
//! the same missing-value predicate.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{ClusterError, Result};
use crate::storage::codec::{type_tags, Storable};

const HEADER_LEN: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Scheme {
    Constant = 0,
    Integer = 1,
    Unique = 2,
    Sparse = 3,
    Double = 4,
}

impl Scheme {
    fn from_u8(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(Scheme::Constant),
            1 => Ok(Scheme::Integer),
            2 => Ok(Scheme::Unique),
            3 => Ok(Scheme::Sparse),
            4 => Ok(Scheme::Double),
            other => Err(ClusterError::Codec(format!("unknown chunk scheme {}", other))),
        }
    }
}

/// Result of an in-place write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    /// The value does not fit the current scheme; rebuild with `ChunkBuilder::from_chunk`.
    Rejected,
}

/// Per-scheme storage. Missing values are NaN except in `Integer`, which
/// reserves the minimum of its width as the sentinel.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Encoding {
    Constant(f64),
    Integer { width: u8, bias: i64, data: Vec<u8> },
    Unique { values: Vec<f64>, index: Vec<u8> },
    /// Rows not listed hold `+0.0`. `rows` is sorted.
    Sparse { rows: Vec<u32>, values: Vec<f64> },
    Double(Vec<f64>),
}

/// Smallest and largest storable offset for an integer width; the width's
/// minimum is the missing-value sentinel.
pub(crate) fn integer_range(width: u8) -> (i64, i64) {
    match width {
        1 => (i8::MIN as i64 + 1, i8::MAX as i64),
        2 => (i16::MIN as i64 + 1, i16::MAX as i64),
        4 => (i32::MIN as i64 + 1, i32::MAX as i64),
        _ => (i64::MIN + 1, i64::MAX),
    }
}

fn sentinel(width: u8) -> i64 {
    integer_range(width).0 - 1
}

/// True for values the integer scheme reproduces exactly.
pub(crate) fn as_exact_integer(v: f64) -> Option<i64> {
    const LIMIT: f64 = 9_007_199_254_740_992.0; // 2^53
    if v.is_finite() && v.fract() == 0.0 && v.abs() <= LIMIT && !(v == 0.0 && v.is_sign_negative()) {
        Some(v as i64)
    } else {
        None
    }
}

fn same(a: f64, b: f64) -> bool {
    a.to_bits() == b.to_bits() || (a.is_nan() && b.is_nan())
}

fn is_default(v: f64) -> bool {
    v.to_bits() == 0
}

#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    len: u32,
    enc: Encoding,
}

impl Chunk {
    pub(crate) fn from_parts(len: u32, enc: Encoding) -> Self {
        Self { len, enc }
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn scheme(&self) -> Scheme {
        match self.enc {
            Encoding::Constant(_) => Scheme::Constant,
            Encoding::Integer { .. } => Scheme::Integer,
            Encoding::Unique { .. } => Scheme::Unique,
            Encoding::Sparse { .. } => Scheme::Sparse,
            Encoding::Double(_) => Scheme::Double,
        }
    }

    fn check_row(&self, row: usize) {
        assert!(
            row < self.len(),
            "row {} out of bounds for chunk of {} rows",
            row,
            self.len
        );
    }

    fn raw_integer(width: u8, data: &[u8], row: usize) -> i64 {
        let at = row * width as usize;
        match width {
            1 => data[at] as i8 as i64,
            2 => i16::from_le_bytes([data[at], data[at + 1]]) as i64,
            4 => {
                let mut b = [0u8; 4];
                b.copy_from_slice(&data[at..at + 4]);
                i32::from_le_bytes(b) as i64
            }
            _ => {
                let mut b = [0u8; 8];
                b.copy_from_slice(&data[at..at + 8]);
                i64::from_le_bytes(b)
            }
        }
    }

    fn write_integer(width: u8, data: &mut [u8], row: usize, stored: i64) {
        let at = row * width as usize;
        match width {
            1 => data[at] = stored as i8 as u8,
            2 => data[at..at + 2].copy_from_slice(&(stored as i16).to_le_bytes()),
            4 => data[at..at + 4].copy_from_slice(&(stored as i32).to_le_bytes()),
            _ => data[at..at + 8].copy_from_slice(&stored.to_le_bytes()),
        }
    }

    /// Value at `row`; NaN when missing.
    pub fn at_f64(&self, row: usize) -> f64 {
        self.check_row(row);
        match &self.enc {
            Encoding::Constant(v) => *v,
            Encoding::Integer { width, bias, data } => {
                let raw = Self::raw_integer(*width, data, row);
                if raw == sentinel(*width) {
                    f64::NAN
                } else {
                    (raw + bias) as f64
                }
            }
            Encoding::Unique { values, index } => values[index[row] as usize],
            Encoding::Sparse { rows, values } => match rows.binary_search(&(row as u32)) {
                Ok(i) => values[i],
                Err(_) => 0.0,
            },
            Encoding::Double(data) => data[row],
        }
    }

    /// Value at `row` truncated to an integer; `None` when missing.
    pub fn at_i64(&self, row: usize) -> Option<i64> {
        if let Encoding::Integer { width, bias, data } = &self.enc {
            self.check_row(row);
            let raw = Self::raw_integer(*width, data, row);
            return (raw != sentinel(*width)).then_some(raw + bias);
        }
        let v = self.at_f64(row);
        (!v.is_nan()).then_some(v as i64)
    }

    pub fn is_na(&self, row: usize) -> bool {
        match &self.enc {
            Encoding::Integer { width, data, .. } => {
                self.check_row(row);
                Self::raw_integer(*width, data, row) == sentinel(*width)
            }
            _ => self.at_f64(row).is_nan(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = f64> + '_ {
        (0..self.len()).map(move |row| self.at_f64(row))
    }

    /// Overwrites `row` if the current scheme can hold `v` (NaN writes a
    /// missing value).
    pub fn set(&mut self, row: usize, v: f64) -> WriteOutcome {
        self.check_row(row);
        match &mut self.enc {
            Encoding::Constant(c) => {
                if same(*c, v) {
                    WriteOutcome::Written
                } else {
                    WriteOutcome::Rejected
                }
            }
            Encoding::Integer { width, bias, data } => {
                let stored = if v.is_nan() {
                    Some(sentinel(*width))
                } else {
                    let (lo, hi) = integer_range(*width);
                    as_exact_integer(v)
                        .and_then(|i| i.checked_sub(*bias))
                        .filter(|s| (lo..=hi).contains(s))
                };
                match stored {
                    Some(stored) => {
                        Self::write_integer(*width, data, row, stored);
                        WriteOutcome::Written
                    }
                    None => WriteOutcome::Rejected,
                }
            }
            Encoding::Unique { values, index } => {
                match values.iter().position(|u| same(*u, v)) {
                    Some(i) => {
                        index[row] = i as u8;
                        WriteOutcome::Written
                    }
                    None if values.len() < 256 => {
                        values.push(v);
                        index[row] = (values.len() - 1) as u8;
                        WriteOutcome::Written
                    }
                    None => WriteOutcome::Rejected,
                }
            }
            Encoding::Sparse { rows, values } => {
                let row = row as u32;
                match (rows.binary_search(&row), is_default(v)) {
                    (Ok(i), true) => {
                        rows.remove(i);
                        values.remove(i);
                    }
                    (Ok(i), false) => values[i] = v,
                    (Err(_), true) => {}
                    (Err(i), false) => {
                        rows.insert(i, row);
                        values.insert(i, v);
                    }
                }
                WriteOutcome::Written
            }
            Encoding::Double(data) => {
                data[row] = v;
                WriteOutcome::Written
            }
        }
    }

    pub fn set_na(&mut self, row: usize) -> WriteOutcome {
        self.set(row, f64::NAN)
    }

    /// Encoded size in bytes, header included.
    pub fn byte_size(&self) -> usize {
        HEADER_LEN + Self::body_size(&self.enc)
    }

    pub(crate) fn body_size(enc: &Encoding) -> usize {
        match enc {
            Encoding::Constant(_) => 8,
            Encoding::Integer { data, .. } => 1 + 8 + data.len(),
            Encoding::Unique { values, index } => 2 + values.len() * 8 + index.len(),
            Encoding::Sparse { rows, .. } => 4 + rows.len() * 12,
            Encoding::Double(data) => data.len() * 8,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.byte_size());
        buf.put_u8(self.scheme() as u8);
        buf.put_u32_le(self.len);
        match &self.enc {
            Encoding::Constant(v) => buf.put_f64_le(*v),
            Encoding::Integer { width, bias, data } => {
                buf.put_u8(*width);
                buf.put_i64_le(*bias);
                buf.put_slice(data);
            }
            Encoding::Unique { values, index } => {
                buf.put_u16_le(values.len() as u16);
                for v in values {
                    buf.put_f64_le(*v);
                }
                buf.put_slice(index);
            }
            Encoding::Sparse { rows, values } => {
                buf.put_u32_le(rows.len() as u32);
                for row in rows {
                    buf.put_u32_le(*row);
                }
                for v in values {
                    buf.put_f64_le(*v);
                }
            }
            Encoding::Double(data) => {
                for v in data {
                    buf.put_f64_le(*v);
                }
            }
        }
        buf.freeze()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader { buf: bytes, at: 0 };
        let scheme = Scheme::from_u8(r.u8()?)?;
        let len = r.u32()?;
        let n = len as usize;

        let enc = match scheme {
            Scheme::Constant => Encoding::Constant(r.f64()?),
            Scheme::Integer => {
                let width = r.u8()?;
                if !matches!(width, 1 | 2 | 4 | 8) {
                    return Err(ClusterError::Codec(format!("bad integer width {}", width)));
                }
                let bias = r.u64()? as i64;
                let data = r.take(n * width as usize)?.to_vec();
                let overflows = (0..n)
                    .map(|row| Self::raw_integer(width, &data, row))
                    .any(|raw| raw != sentinel(width) && raw.checked_add(bias).is_none());
                if overflows {
                    return Err(ClusterError::Codec(format!(
                        "integer bias {} overflows a stored value",
                        bias
                    )));
                }
                Encoding::Integer { width, bias, data }
            }
            Scheme::Unique => {
                let count = r.u16()? as usize;
                let values = (0..count).map(|_| r.f64()).collect::<Result<Vec<_>>>()?;
                let index = r.take(n)?.to_vec();
                if index.iter().any(|&i| i as usize >= count) {
                    return Err(ClusterError::Codec("unique index out of range".into()));
                }
                Encoding::Unique { values, index }
            }
            Scheme::Sparse => {
                let count = r.u32()? as usize;
                let rows = (0..count).map(|_| r.u32()).collect::<Result<Vec<_>>>()?;
                let values = (0..count).map(|_| r.f64()).collect::<Result<Vec<_>>>()?;
                if rows.windows(2).any(|w| w[0] >= w[1]) || rows.last().map_or(false, |&last| last >= len) {
                    return Err(ClusterError::Codec("sparse rows out of order".into()));
                }
                Encoding::Sparse { rows, values }
            }
            Scheme::Double => {
                let data = (0..n).map(|_| r.f64()).collect::<Result<Vec<_>>>()?;
                Encoding::Double(data)
            }
        };

        if r.at != bytes.len() {
            return Err(ClusterError::Codec(format!(
                "{} trailing bytes after chunk",
                bytes.len() - r.at
            )));
        }
        Ok(Self { len, enc })
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    at: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.at.checked_add(n).filter(|&end| end <= self.buf.len());
        match end {
            Some(end) => {
                let out = &self.buf[self.at..end];
                self.at = end;
                Ok(out)
            }
            None => Err(ClusterError::Codec("truncated chunk".into())),
        }
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.array::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    fn f64(&mut self) -> Result<f64> {
        Ok(f64::from_le_bytes(self.array()?))
    }
}

impl Storable for Chunk {
    const TYPE_TAG: u16 = type_tags::CHUNK;
    const TYPE_NAME: &'static str = "chunk";

    fn to_bytes(&self) -> Result<Bytes> {
        Ok(self.encode())
    }

    fn from_bytes(bytes: &Bytes) -> Result<Self> {
        Self::decode(bytes)
    }
}
