//! Value descriptors and the per-type packing rules.

use crate::arena::WORD_SIZE;

const BITS_PER_WORD: usize = WORD_SIZE * 8;
const MEDIUM_MASK: u32 = 0x00FF_FFFF;
const MEDIUM_SIGN: u32 = 1 << 23;

pub const MEDIUM_INT_MAX: i32 = (1 << 23) - 1;
pub const MEDIUM_INT_MIN: i32 = -(1 << 23);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    Int,
    Char,
    MediumInt,
    Bool,
}

impl ValueType {
    /// Bytes an element occupies in its own right.
    pub const fn size(self) -> usize {
        match self {
            ValueType::Int => 4,
            ValueType::Char => 1,
            ValueType::MediumInt => 3,
            ValueType::Bool => 1,
        }
    }

    /// How many elements share one word in an array.
    pub const fn per_word(self) -> usize {
        match self {
            ValueType::Bool => BITS_PER_WORD,
            // a medium int does not fit twice, so it gets a word of its own
            ty => WORD_SIZE / ty.size(),
        }
    }

    /// Payload bytes for an array of `width` elements, or `None` if that
    /// does not fit in a `usize`.
    pub const fn array_bytes(self, width: usize) -> Option<usize> {
        width.div_ceil(self.per_word()).checked_mul(WORD_SIZE)
    }

    /// `(word, offset)` of element `idx`. The offset is in bits for `Bool`
    /// and in bytes for everything else.
    #[inline]
    pub const fn locate(self, idx: usize) -> (usize, usize) {
        let per_word = self.per_word();
        let word = idx / per_word;
        let slot = idx - word * per_word;
        match self {
            ValueType::Bool => (word, slot),
            ty => (word, slot * ty.size()),
        }
    }
}

/// A value read from or written to the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scalar {
    Int(i32),
    Char(u8),
    MediumInt(i32),
    Bool(bool),
}

impl Scalar {
    pub const fn ty(self) -> ValueType {
        match self {
            Scalar::Int(_) => ValueType::Int,
            Scalar::Char(_) => ValueType::Char,
            Scalar::MediumInt(_) => ValueType::MediumInt,
            Scalar::Bool(_) => ValueType::Bool,
        }
    }

    pub fn as_int(self) -> Option<i32> {
        match self {
            Scalar::Int(v) | Scalar::MediumInt(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_char(self) -> Option<u8> {
        match self {
            Scalar::Char(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_bool(self) -> Option<bool> {
        match self {
            Scalar::Bool(b) => Some(b),
            _ => None,
        }
    }

    /// Encodes a scalar variable, which always owns a whole word.
    pub(crate) fn to_word(self) -> u32 {
        match self {
            Scalar::Int(v) => v as u32,
            Scalar::Char(c) => c as u32,
            Scalar::MediumInt(v) => v as u32 & MEDIUM_MASK,
            Scalar::Bool(b) => b as u32,
        }
    }

    /// Decodes a scalar variable.
    pub(crate) fn from_word(ty: ValueType, word: u32) -> Self {
        match ty {
            ValueType::Int => Scalar::Int(word as i32),
            ValueType::Char => Scalar::Char(word as u8),
            ValueType::MediumInt => Scalar::MediumInt(sign_extend_24(word)),
            ValueType::Bool => Scalar::Bool(word & 1 != 0),
        }
    }

    /// Writes this value into `word` at a packed `offset` (see
    /// [`ValueType::locate`]), preserving the neighbouring elements.
    pub(crate) fn pack_into(self, word: u32, offset: usize) -> u32 {
        match self {
            Scalar::Bool(b) => {
                let bit = 1u32 << offset;
                if b { word | bit } else { word & !bit }
            }
            Scalar::Char(c) => {
                let shift = offset * 8;
                (word & !(0xFF << shift)) | ((c as u32) << shift)
            }
            other => other.to_word(),
        }
    }

    /// Reads the element of type `ty` at a packed `offset` out of `word`.
    pub(crate) fn unpack_from(ty: ValueType, word: u32, offset: usize) -> Self {
        match ty {
            ValueType::Bool => Scalar::Bool(word & (1 << offset) != 0),
            ValueType::Char => Scalar::Char((word >> (offset * 8)) as u8),
            ty => Scalar::from_word(ty, word),
        }
    }
}

#[inline]
fn sign_extend_24(word: u32) -> i32 {
    let word = word & MEDIUM_MASK;
    if word & MEDIUM_SIGN != 0 {
        (word | !MEDIUM_MASK) as i32
    } else {
        word as i32
    }
}

/// What a handle refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    Scalar(ValueType),
    Array { ty: ValueType, width: usize },
}

impl Shape {
    pub const fn ty(self) -> ValueType {
        match self {
            Shape::Scalar(ty) | Shape::Array { ty, .. } => ty,
        }
    }

    /// Payload bytes the arena has to provide. `None` for arrays too wide
    /// to address.
    pub const fn bytes(self) -> Option<usize> {
        match self {
            Shape::Scalar(_) => Some(WORD_SIZE),
            Shape::Array { ty, width } => ty.array_bytes(width),
        }
    }
}
