pub mod arena;
mod collector;
mod compactor;
mod error;
mod memory;
mod scope;
pub mod table;
mod value;

pub use arena::{Arena, BlockInfo, FreeStats};
pub use collector::{Collector, GcStats, SweepReport, collect, reclaim, sweep};
pub use compactor::compact;
pub use error::{MemError, Result};
pub use memory::{Memory, MemorySettings, MemoryStats, ScopeGuard};
pub use scope::ScopeStack;
pub use table::{Handle, HandleTable, Mark};
pub use value::{MEDIUM_INT_MAX, MEDIUM_INT_MIN, Scalar, Shape, ValueType};
