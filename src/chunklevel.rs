//! Chunk size classes.
//!
//! Chunks come in power-of-two word sizes between [`MIN_CHUNK_WORD_SIZE`] and
//! [`MAX_CHUNK_WORD_SIZE`]. A *level* indexes that ladder from the top: level
//! 0 is the largest ("root") chunk, each following level halves the size.
//! Lower level number, larger chunk.

/// Index into the chunk size ladder. Level 0 = largest chunk.
pub type ChunkLevel = usize;

/// Word size of a root chunk: 4 Mi words (32 MiB).
pub const MAX_CHUNK_WORD_SIZE: usize = 4 * 1024 * 1024;

/// Word size of the smallest chunk: 1 Ki words (8 KiB).
pub const MIN_CHUNK_WORD_SIZE: usize = 1024;

pub const ROOT_CHUNK_LEVEL: ChunkLevel = 0;

/// Level of the smallest chunk (currently 12).
pub const HIGHEST_CHUNK_LEVEL: ChunkLevel =
    (MAX_CHUNK_WORD_SIZE / MIN_CHUNK_WORD_SIZE).trailing_zeros() as usize;

pub const NUM_CHUNK_LEVELS: usize = HIGHEST_CHUNK_LEVEL + 1;

// Named levels, for growth ladder tables and tests.
pub const LEVEL_4M: ChunkLevel = 0;
pub const LEVEL_2M: ChunkLevel = 1;
pub const LEVEL_1M: ChunkLevel = 2;
pub const LEVEL_512K: ChunkLevel = 3;
pub const LEVEL_256K: ChunkLevel = 4;
pub const LEVEL_128K: ChunkLevel = 5;
pub const LEVEL_64K: ChunkLevel = 6;
pub const LEVEL_32K: ChunkLevel = 7;
pub const LEVEL_16K: ChunkLevel = 8;
pub const LEVEL_8K: ChunkLevel = 9;
pub const LEVEL_4K: ChunkLevel = 10;
pub const LEVEL_2K: ChunkLevel = 11;
pub const LEVEL_1K: ChunkLevel = 12;

#[inline]
pub const fn is_valid_level(level: ChunkLevel) -> bool {
    level <= HIGHEST_CHUNK_LEVEL
}

/// Word size of a chunk at `level`.
#[inline]
pub const fn word_size_for_level(level: ChunkLevel) -> usize {
    assert!(level <= HIGHEST_CHUNK_LEVEL);
    MAX_CHUNK_WORD_SIZE >> level
}

/// The numerically highest (smallest-chunk) level whose word size still
/// covers `word_size`. `word_size` must be 1..=[`MAX_CHUNK_WORD_SIZE`].
#[inline]
pub fn level_fitting_word_size(word_size: usize) -> ChunkLevel {
    debug_assert!(
        word_size >= 1 && word_size <= MAX_CHUNK_WORD_SIZE,
        "no chunk level fits {word_size} words"
    );
    let needed = word_size.max(MIN_CHUNK_WORD_SIZE).next_power_of_two();
    (MAX_CHUNK_WORD_SIZE / needed).trailing_zeros() as usize
}
