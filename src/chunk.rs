use std::ptr::NonNull;

use crate::chunklevel::{self, ChunkLevel};
use crate::Word;

/// A contiguous power-of-two run of words inside a pool's reservation.
///
/// A chunk is a plain value with exactly one owner at any time: the pool
/// while it sits in a free list, an arena while it is handed out. Structural
/// changes (level, committed prefix) go through the pool, which holds the
/// directory these fields must stay consistent with.
///
/// `committed_words` is always a *prefix* of the chunk, and `used_words`
/// never exceeds it. Words in `[used, committed)` are committed but free;
/// words past `committed` need a commit before first use.
#[derive(Debug)]
pub struct Chunk {
    base: NonNull<Word>,
    level: ChunkLevel,
    committed_words: usize,
    used_words: usize,
}

// Safety: a Chunk exclusively owns its address range; it carries no shared
// references.
unsafe impl Send for Chunk {}

impl Chunk {
    pub(crate) fn new(base: NonNull<Word>, level: ChunkLevel) -> Self {
        debug_assert!(chunklevel::is_valid_level(level));
        Self {
            base,
            level,
            committed_words: 0,
            used_words: 0,
        }
    }

    pub fn base(&self) -> NonNull<Word> {
        self.base
    }

    pub fn level(&self) -> ChunkLevel {
        self.level
    }

    pub fn word_size(&self) -> usize {
        chunklevel::word_size_for_level(self.level)
    }

    pub fn committed_words(&self) -> usize {
        self.committed_words
    }

    pub fn used_words(&self) -> usize {
        self.used_words
    }

    /// Free words regardless of commit state.
    pub fn free_words(&self) -> usize {
        self.word_size() - self.used_words
    }

    /// Free words that are usable without further commit.
    pub fn free_below_committed_words(&self) -> usize {
        self.committed_words - self.used_words
    }

    pub fn is_fully_committed(&self) -> bool {
        self.committed_words == self.word_size()
    }

    /// Bump-allocate `word_size` words. The range must fit below the
    /// committed mark; callers ensure that via the pool's commit paths.
    pub(crate) fn allocate(&mut self, word_size: usize) -> NonNull<Word> {
        debug_assert!(word_size > 0);
        debug_assert!(
            word_size <= self.free_below_committed_words(),
            "allocation of {word_size} words exceeds committed prefix \
             (used {}, committed {})",
            self.used_words,
            self.committed_words
        );
        // Safety: base..base+committed is owned, committed memory, and
        // used + word_size <= committed.
        let p = unsafe { NonNull::new_unchecked(self.base.as_ptr().add(self.used_words)) };
        self.used_words += word_size;
        // Recycled chunks hand out dirty memory; zero it for deterministic
        // failures in debug builds only.
        #[cfg(debug_assertions)]
        // Safety: same range as above.
        unsafe {
            std::ptr::write_bytes(p.as_ptr(), 0, word_size);
        }
        p
    }

    pub(crate) fn note_committed(&mut self, additional_words: usize) {
        self.committed_words += additional_words;
        debug_assert!(self.committed_words <= self.word_size());
    }

    pub(crate) fn set_committed_words(&mut self, words: usize) {
        debug_assert!(words <= self.word_size());
        debug_assert!(words >= self.used_words);
        self.committed_words = words;
    }

    pub(crate) fn set_level(&mut self, level: ChunkLevel) {
        debug_assert!(chunklevel::is_valid_level(level));
        self.level = level;
    }

    pub(crate) fn reset_used(&mut self) {
        self.used_words = 0;
    }

    #[cfg(debug_assertions)]
    pub(crate) fn verify(&self) {
        assert!(chunklevel::is_valid_level(self.level));
        assert!(self.used_words <= self.committed_words);
        assert!(self.committed_words <= self.word_size());
    }
}
