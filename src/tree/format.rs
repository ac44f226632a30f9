//! Compact key formats.
//!
//! A node packs its key headers relative to per-field bases with the minimum
//! bit widths that cover every key it holds. Keys outside a format's range
//! are stored unpacked.

use super::{Key, Node};
use crate::types::Pos;

/// Header size of an unpacked key, in u64 words.
pub const KEY_U64S_UNPACKED: usize = 5;

const FIELDS: usize = 4;

/// Field bases and widths of a packed key header.
///
/// Fields are, in order: inode, offset, size, version.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeyFormat {
    base: [u64; FIELDS],
    bits: [u8; FIELDS],
}

impl Default for KeyFormat {
    /// The format that packs nothing smaller than an unpacked header.
    fn default() -> Self {
        Self {
            base: [0; FIELDS],
            bits: [64; FIELDS],
        }
    }
}

fn fields(key: &Key) -> [u64; FIELDS] {
    [
        key.pos.inode,
        key.pos.offset,
        u64::from(key.size),
        key.version,
    ]
}

fn bits_needed(range: u64) -> u8 {
    (u64::BITS - range.leading_zeros()) as u8
}

impl KeyFormat {
    /// Total header bits.
    pub fn total_bits(&self) -> u32 {
        self.bits.iter().map(|b| u32::from(*b)).sum()
    }

    /// Header size of a key that packs, in u64 words.
    pub fn packed_header_u64s(&self) -> usize {
        let words = 1 + (self.total_bits() as usize).div_ceil(64);
        words.min(KEY_U64S_UNPACKED)
    }

    /// Whether every header field of `key` is representable.
    pub fn fits(&self, key: &Key) -> bool {
        fields(key)
            .iter()
            .zip(self.base.iter().zip(self.bits.iter()))
            .all(|(value, (base, bits))| {
                let Some(delta) = value.checked_sub(*base) else {
                    return false;
                };
                *bits >= 64 || delta >> bits == 0
            })
    }

    /// Stored size of `key` under this format.
    pub fn key_u64s(&self, key: &Key) -> usize {
        let header = if self.fits(key) {
            self.packed_header_u64s()
        } else {
            KEY_U64S_UNPACKED
        };
        header + key.value_u64s()
    }

    /// Format computed over `keys` and the bounds `[min, max]`.
    pub fn for_keys<'a>(keys: impl IntoIterator<Item = &'a Key>, min: Pos, max: Pos) -> Self {
        let mut state = FormatState::new();
        state.add_pos(min);
        state.add_pos(max);
        for key in keys {
            state.add_key(key);
        }
        state.done()
    }
}

/// Accumulates field ranges to compute a [`KeyFormat`].
#[derive(Clone, Debug)]
pub struct FormatState {
    min: [u64; FIELDS],
    max: [u64; FIELDS],
    seen: bool,
}

impl Default for FormatState {
    fn default() -> Self {
        Self::new()
    }
}

impl FormatState {
    /// Empty state.
    pub fn new() -> Self {
        Self {
            min: [u64::MAX; FIELDS],
            max: [0; FIELDS],
            seen: false,
        }
    }

    fn add_fields(&mut self, values: [u64; FIELDS], mask: [bool; FIELDS]) {
        for i in 0..FIELDS {
            if mask[i] {
                self.min[i] = self.min[i].min(values[i]);
                self.max[i] = self.max[i].max(values[i]);
            }
        }
        self.seen = true;
    }

    /// Includes a key.
    pub fn add_key(&mut self, key: &Key) {
        self.add_fields(fields(key), [true; FIELDS]);
    }

    /// Includes a position, such as a node bound.
    pub fn add_pos(&mut self, pos: Pos) {
        self.add_fields([pos.inode, pos.offset, 0, 0], [true, true, false, false]);
    }

    /// Includes every key and both bounds of `node`.
    pub fn add_node(&mut self, node: &Node) {
        self.add_pos(node.min_key);
        self.add_pos(node.max_key);
        for key in &node.keys {
            self.add_key(key);
        }
    }

    /// Narrowest format covering everything added.
    pub fn done(&self) -> KeyFormat {
        if !self.seen {
            return KeyFormat::default();
        }
        let mut format = KeyFormat::default();
        for i in 0..FIELDS {
            let (lo, hi) = if self.min[i] > self.max[i] {
                (0, 0)
            } else {
                (self.min[i], self.max[i])
            };
            format.base[i] = lo;
            format.bits[i] = bits_needed(hi - lo);
        }
        format
    }
}
