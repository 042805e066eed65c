//! Per-tenant chunk growth ladders.
//!
//! A growth ladder names the chunk level an arena should ask for at each
//! growth step. Small tenants start with small chunks and work their way up;
//! the boot tenant starts big. All ladders are monotone (chunk sizes never
//! shrink) and never more than double from one step to the next, so a single
//! allocation can at most double an arena's capacity.

use crate::chunklevel::{
    ChunkLevel, LEVEL_16K, LEVEL_1K, LEVEL_1M, LEVEL_2K, LEVEL_2M, LEVEL_32K, LEVEL_4K, LEVEL_4M,
    LEVEL_64K, LEVEL_8K,
};

/// Expected metadata footprint category of a tenant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArenaKind {
    /// Tiny, often short-lived tenants (reflection support machinery).
    Reflection,
    /// Holders of a single hidden/anonymous class definition.
    Anonymous,
    /// Regular application tenants.
    Standard,
    /// The boot tenant. Large, loaded once, never unloaded.
    Boot,
}

const REFLECTION_COMPACT: &[ChunkLevel] = &[LEVEL_1K, LEVEL_2K, LEVEL_4K];
const REFLECTION: &[ChunkLevel] = &[LEVEL_2K, LEVEL_4K, LEVEL_8K];
const ANONYMOUS_COMPACT: &[ChunkLevel] = &[LEVEL_1K, LEVEL_2K, LEVEL_4K];
const ANONYMOUS: &[ChunkLevel] = &[LEVEL_1K, LEVEL_2K, LEVEL_4K, LEVEL_8K];
const STANDARD_COMPACT: &[ChunkLevel] = &[LEVEL_2K, LEVEL_4K, LEVEL_8K, LEVEL_16K, LEVEL_32K];
const STANDARD: &[ChunkLevel] = &[LEVEL_4K, LEVEL_8K, LEVEL_16K, LEVEL_32K, LEVEL_64K];
const BOOT_COMPACT: &[ChunkLevel] = &[LEVEL_1M, LEVEL_2M, LEVEL_4M];
const BOOT: &[ChunkLevel] = &[LEVEL_4M];

#[derive(Clone, Copy, Debug)]
pub struct GrowthPolicy {
    ladder: &'static [ChunkLevel],
}

impl GrowthPolicy {
    /// The ladder for a tenant category. `is_compact` selects the smaller
    /// variant used for the type-compact part of a tenant's storage.
    pub fn for_kind(kind: ArenaKind, is_compact: bool) -> Self {
        let ladder = match (kind, is_compact) {
            (ArenaKind::Reflection, true) => REFLECTION_COMPACT,
            (ArenaKind::Reflection, false) => REFLECTION,
            (ArenaKind::Anonymous, true) => ANONYMOUS_COMPACT,
            (ArenaKind::Anonymous, false) => ANONYMOUS,
            (ArenaKind::Standard, true) => STANDARD_COMPACT,
            (ArenaKind::Standard, false) => STANDARD,
            (ArenaKind::Boot, true) => BOOT_COMPACT,
            (ArenaKind::Boot, false) => BOOT,
        };
        Self { ladder }
    }

    /// Chunk level to request at growth step `step` (the number of chunks
    /// acquired plus in-place enlargements so far). Steps past the end of
    /// the ladder stay at the final level.
    pub fn level_at_step(&self, step: usize) -> ChunkLevel {
        self.ladder[step.min(self.ladder.len() - 1)]
    }

    pub fn start_level(&self) -> ChunkLevel {
        self.ladder[0]
    }
}
