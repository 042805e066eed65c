//! Process-wide ceiling on committed memory.
//!
//! Every commit and uncommit of chunk memory is charged here. The limiter
//! never blocks and never retries on behalf of the caller: a denied
//! [`try_commit`](CommitLimiter::try_commit) simply returns `false`, and the
//! caller surfaces a recoverable error. Retrying only makes sense after some
//! other tenant has released memory, which this layer cannot know about.

use crate::sync::atomic::{AtomicUsize, Ordering};

pub struct CommitLimiter {
    limit_words: usize,
    committed_words: AtomicUsize,
}

impl CommitLimiter {
    pub fn new(limit_words: usize) -> Self {
        Self {
            limit_words,
            committed_words: AtomicUsize::new(0),
        }
    }

    /// A limiter that never denies.
    pub fn unlimited() -> Self {
        Self::new(usize::MAX)
    }

    pub fn limit_words(&self) -> usize {
        self.limit_words
    }

    pub fn committed_words(&self) -> usize {
        self.committed_words.load(Ordering::Relaxed)
    }

    /// Words that could still be committed. A snapshot only: by the time the
    /// caller acts on it, concurrent commits may have consumed it. Never use
    /// this to pre-approve a commit; call [`try_commit`](Self::try_commit).
    pub fn possible_expansion_words(&self) -> usize {
        self.limit_words
            .saturating_sub(self.committed_words.load(Ordering::Relaxed))
    }

    /// Charge `words` against the budget. All or nothing: on denial the
    /// committed count is unchanged and the caller must not commit.
    #[must_use]
    pub fn try_commit(&self, words: usize) -> bool {
        let mut current = self.committed_words.load(Ordering::Relaxed);
        loop {
            if self.limit_words.saturating_sub(current) < words {
                return false;
            }
            match self.committed_words.compare_exchange_weak(
                current,
                current + words,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Return `words` to the budget. Saturating: a stray over-return clamps
    /// at zero instead of wrapping.
    pub fn uncommit(&self, words: usize) {
        let mut current = self.committed_words.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_sub(words);
            match self.committed_words.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }
}

impl Default for CommitLimiter {
    fn default() -> Self {
        Self::unlimited()
    }
}
