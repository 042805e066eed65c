//! Arena-local list of released word ranges.
//!
//! Deallocated blocks and the salvaged tails of retired chunks land here and
//! get first pick on later allocations. The list is intentionally simple:
//! first fit over a flat `Vec`, remainders re-listed, no coalescing. Arena
//! churn is low enough that anything smarter has not paid for itself.

use std::ptr::NonNull;

use crate::Word;

/// Fragments below this are abandoned rather than listed. They stay counted
/// as used; the chunk reclaims them wholesale when it is returned.
pub(crate) const MIN_BLOCK_WORD_SIZE: usize = 4;

struct FreeBlock {
    ptr: NonNull<Word>,
    word_size: usize,
}

pub(crate) struct FreeBlocks {
    blocks: Vec<FreeBlock>,
    total_words: usize,
}

impl FreeBlocks {
    pub(crate) fn new() -> Self {
        Self {
            blocks: Vec::new(),
            total_words: 0,
        }
    }

    pub(crate) fn add_block(&mut self, ptr: NonNull<Word>, word_size: usize) {
        if word_size < MIN_BLOCK_WORD_SIZE {
            return;
        }
        self.blocks.push(FreeBlock { ptr, word_size });
        self.total_words += word_size;
    }

    /// First block with at least `word_size` words. The remainder, if still
    /// above the listing floor, goes back on the list.
    pub(crate) fn remove_block(&mut self, word_size: usize) -> Option<NonNull<Word>> {
        debug_assert!(word_size > 0);
        let idx = self.blocks.iter().position(|b| b.word_size >= word_size)?;
        let block = self.blocks.swap_remove(idx);
        self.total_words -= block.word_size;

        let remainder = block.word_size - word_size;
        if remainder >= MIN_BLOCK_WORD_SIZE {
            // Safety: the remainder range lies within the original block.
            let rest = unsafe { NonNull::new_unchecked(block.ptr.as_ptr().add(word_size)) };
            self.add_block(rest, remainder);
        }
        Some(block.ptr)
    }

    pub(crate) fn total_words(&self) -> usize {
        self.total_words
    }

    pub(crate) fn clear(&mut self) {
        self.blocks.clear();
        self.total_words = 0;
    }
}
