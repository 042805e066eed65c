#[cfg(not(target_pointer_width = "64"))]
compile_error!("metarena supports only 64-bit targets.");

pub(crate) mod sync;

pub mod arena;
pub mod chunk;
pub mod chunk_pool;
pub mod chunklevel;
pub mod commit_limiter;
pub mod error;
pub mod growth_policy;
pub mod settings;
pub mod stats;

pub(crate) mod freeblocks;
pub(crate) mod vm;


// allocators
pub use arena::{Arena, UsageNumbers};
pub use chunk::Chunk;
pub use chunk_pool::ChunkPool;
pub use commit_limiter::CommitLimiter;
pub use growth_policy::{ArenaKind, GrowthPolicy};
pub use settings::Settings;

// errors
pub use error::AllocError;
pub use vm::VmError;

/// Unit of allocation. All sizes in this crate are word counts unless a
/// name says otherwise.
pub type Word = u64;

pub const BYTES_PER_WORD: usize = std::mem::size_of::<Word>();
