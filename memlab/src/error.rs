use std::fmt;

/// Everything a memlab operation can fail with.
///
/// Errors are reported synchronously to the immediate caller. The only
/// automatic retry is the single sweep + compact pass performed when an
/// allocation first runs out of arena space or handle slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemError {
    /// No free block fits the request, even after a sweep and compaction.
    OutOfMemory,
    /// Every handle slot is bound to a live value.
    HandleTableFull,
    /// The handle was freed, reclaimed, or its scope has ended.
    InvalidHandle,
    /// The requested type disagrees with the handle's stored shape.
    TypeMismatch,
    /// Array access outside `[0, width)`.
    IndexOutOfBounds,
    /// `end_scope` without a matching `init_scope`.
    NoOpenScope,
    /// The settings passed to `Memory::new` were rejected.
    InvalidSettings(&'static str),
}

impl fmt::Display for MemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemError::OutOfMemory => write!(f, "out of memory"),
            MemError::HandleTableFull => write!(f, "handle table is full"),
            MemError::InvalidHandle => {
                write!(f, "invalid handle (freed or out of scope)")
            }
            MemError::TypeMismatch => write!(f, "type mismatch"),
            MemError::IndexOutOfBounds => write!(f, "index out of bounds"),
            MemError::NoOpenScope => write!(f, "no open scope to end"),
            MemError::InvalidSettings(reason) => {
                write!(f, "invalid settings: {reason}")
            }
        }
    }
}

impl std::error::Error for MemError {}

pub type Result<T> = std::result::Result<T, MemError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_human_readable() {
        assert_eq!(MemError::OutOfMemory.to_string(), "out of memory");
        assert_eq!(
            MemError::InvalidSettings("arena_size must be > 0").to_string(),
            "invalid settings: arena_size must be > 0"
        );
    }

    #[test]
    fn boxes_as_std_error() {
        let err: Box<dyn std::error::Error> = Box::new(MemError::TypeMismatch);
        assert_eq!(err.to_string(), "type mismatch");
    }
}
