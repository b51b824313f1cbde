use std::collections::HashMap;

use super::chunk::{as_exact_integer, integer_range, Chunk, Encoding};

/// Accumulates row values, then compresses them with the smallest scheme
/// that reproduces every value exactly.
#[derive(Debug, Clone, Default)]
pub struct ChunkBuilder {
    values: Vec<f64>,
}

impl ChunkBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(rows: usize) -> Self {
        Self {
            values: Vec::with_capacity(rows),
        }
    }

    /// Starts from the decoded contents of an existing chunk, for rewriting a
    /// chunk whose scheme rejected a write.
    pub fn from_chunk(chunk: &Chunk) -> Self {
        Self {
            values: chunk.iter().collect(),
        }
    }

    pub fn push(&mut self, v: f64) {
        self.values.push(v);
    }

    pub fn push_na(&mut self) {
        self.values.push(f64::NAN);
    }

    pub fn set(&mut self, row: usize, v: f64) {
        self.values[row] = v;
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn build(self) -> Chunk {
        let len = self.values.len() as u32;
        let candidates = [
            self.constant(),
            self.integer(),
            self.unique(),
            self.sparse(),
            Some(Encoding::Double(self.values.clone())),
        ];

        let mut best: Option<Encoding> = None;
        for enc in candidates.into_iter().flatten() {
            let smaller = match &best {
                Some(b) => Chunk::body_size(&enc) < Chunk::body_size(b),
                None => true,
            };
            if smaller {
                best = Some(enc);
            }
        }
        Chunk::from_parts(len, best.unwrap_or(Encoding::Double(Vec::new())))
    }

    fn constant(&self) -> Option<Encoding> {
        let first = *self.values.first()?;
        let all_same = self.values.iter().all(|v| {
            v.to_bits() == first.to_bits() || (v.is_nan() && first.is_nan())
        });
        all_same.then_some(Encoding::Constant(first))
    }

    fn integer(&self) -> Option<Encoding> {
        let mut ints = Vec::with_capacity(self.values.len());
        for v in &self.values {
            if v.is_nan() {
                ints.push(None);
            } else {
                ints.push(Some(as_exact_integer(*v)?));
            }
        }
        let lo = ints.iter().flatten().min().copied()?;
        let hi = ints.iter().flatten().max().copied()?;

        let (width, bias) = [1u8, 2, 4, 8].into_iter().find_map(|width| {
            let (rlo, rhi) = integer_range(width);
            if width == 8 {
                return Some((8, 0));
            }
            ((hi as i128 - lo as i128) <= (rhi as i128 - rlo as i128)).then(|| (width, lo - rlo))
        })?;

        let (rlo, _) = integer_range(width);
        let mut data = Vec::with_capacity(ints.len() * width as usize);
        for i in ints {
            let stored = match i {
                Some(i) => i - bias,
                None => rlo - 1,
            };
            match width {
                1 => data.push(stored as i8 as u8),
                2 => data.extend_from_slice(&(stored as i16).to_le_bytes()),
                4 => data.extend_from_slice(&(stored as i32).to_le_bytes()),
                _ => data.extend_from_slice(&stored.to_le_bytes()),
            }
        }
        Some(Encoding::Integer { width, bias, data })
    }

    fn unique(&self) -> Option<Encoding> {
        let mut values: Vec<f64> = Vec::new();
        let mut slots: HashMap<u64, u8> = HashMap::new();
        let mut index = Vec::with_capacity(self.values.len());

        for v in &self.values {
            let bits = if v.is_nan() { f64::NAN.to_bits() } else { v.to_bits() };
            let slot = match slots.get(&bits) {
                Some(slot) => *slot,
                None => {
                    if values.len() == 256 {
                        return None;
                    }
                    let slot = values.len() as u8;
                    values.push(f64::from_bits(bits));
                    slots.insert(bits, slot);
                    slot
                }
            };
            index.push(slot);
        }
        Some(Encoding::Unique { values, index })
    }

    fn sparse(&self) -> Option<Encoding> {
        let mut rows = Vec::new();
        let mut values = Vec::new();
        for (row, v) in self.values.iter().enumerate() {
            if v.to_bits() != 0 {
                rows.push(row as u32);
                values.push(*v);
            }
        }
        Some(Encoding::Sparse { rows, values })
    }
}

impl FromIterator<f64> for ChunkBuilder {
    fn from_iter<I: IntoIterator<Item = f64>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}
