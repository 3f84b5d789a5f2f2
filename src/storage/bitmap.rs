//! Piece bitmap
//!
//! Fixed-length, MSB-first bitfield used for local availability,
//! peer advertisements and resume checkpoints.

use serde::{Deserialize, Serialize};

use crate::error::NodeError;

/// Fixed-length piece bitmap, bit `i` set means piece `i` is held
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "RawBitmap")]
pub struct PieceBitmap {
    /// Number of pieces tracked
    len: u32,
    /// Packed bits, most significant bit first
    bits: Vec<u8>,
}

/// Serialized form, checked before it becomes a [`PieceBitmap`]
#[derive(Deserialize)]
struct RawBitmap {
    len: u32,
    bits: Vec<u8>,
}

impl TryFrom<RawBitmap> for PieceBitmap {
    type Error = NodeError;

    fn try_from(raw: RawBitmap) -> Result<Self, Self::Error> {
        let expected = byte_len(raw.len);
        if raw.bits.len() != expected {
            return Err(NodeError::validation_error_with_field(
                format!("Bitmap of {} pieces needs {} bytes, got {}", raw.len, expected, raw.bits.len()),
                "bits",
            ));
        }
        let spare = (expected * 8) as u64 - raw.len as u64;
        if let Some(last) = raw.bits.last() {
            if spare > 0 && last & ((1u8 << spare) - 1) != 0 {
                return Err(NodeError::validation_error_with_field(
                    format!("Bitmap of {} pieces has bits set past the end", raw.len),
                    "bits",
                ));
            }
        }
        Ok(Self { len: raw.len, bits: raw.bits })
    }
}

fn byte_len(len: u32) -> usize {
    (len as usize).div_ceil(8)
}

impl PieceBitmap {
    /// Create a new bitmap with every bit cleared
    pub fn new(len: u32) -> Self {
        Self {
            len,
            bits: vec![0u8; byte_len(len)],
        }
    }

    /// Create a bitmap with every bit set
    pub fn full(len: u32) -> Self {
        let mut bitmap = Self::new(len);
        for index in 0..len {
            bitmap.set(index);
        }
        bitmap
    }

    /// Create a bitmap with the given indices set; out-of-range indices are ignored
    pub fn from_indices(len: u32, indices: impl IntoIterator<Item = u32>) -> Self {
        let mut bitmap = Self::new(len);
        for index in indices {
            bitmap.set(index);
        }
        bitmap
    }

    /// Number of pieces tracked
    pub fn len(&self) -> u32 {
        self.len
    }

    /// Whether the bitmap tracks zero pieces
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Set a bit; returns false when the index is out of range
    pub fn set(&mut self, index: u32) -> bool {
        if index >= self.len {
            return false;
        }
        let byte_index = index as usize / 8;
        let bit_index = 7 - (index % 8);
        self.bits[byte_index] |= 1 << bit_index;
        true
    }

    /// Check a bit
    pub fn get(&self, index: u32) -> bool {
        if index >= self.len {
            return false;
        }
        let byte_index = index as usize / 8;
        let bit_index = 7 - (index % 8);
        (self.bits[byte_index] & (1 << bit_index)) != 0
    }

    /// Number of set bits
    pub fn count(&self) -> u32 {
        self.iter_set().count() as u32
    }

    /// Whether every bit is set
    pub fn is_complete(&self) -> bool {
        self.count() == self.len
    }

    /// Iterate set indices in ascending order
    pub fn iter_set(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.len).filter(move |&i| self.get(i))
    }

    /// Iterate cleared indices in ascending order
    pub fn iter_missing(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.len).filter(move |&i| !self.get(i))
    }

    /// Raw packed bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }
}
