use crate::chunklevel::MAX_CHUNK_WORD_SIZE;
use crate::vm::VmError;

/// Tunables for one chunk pool instance.
#[derive(Clone, Debug)]
pub struct Settings {
    /// Quantum of physical commit and uncommit, in words. Power of two, at
    /// most [`MAX_CHUNK_WORD_SIZE`]. Chunks smaller than one granule commit
    /// all at once. Default: 64 Ki words (512 KiB).
    pub commit_granule_words: usize,

    /// How many words a freshly handed-out chunk gets committed eagerly,
    /// beyond what the triggering request needs. Rounded up to the commit
    /// granule. Default: one granule.
    pub committed_words_on_fresh_chunks: usize,

    /// Whether returning a chunk to the pool decommits its memory right
    /// away. Off by default: committed free chunks make the cheapest reuse,
    /// and the commit limiter already bounds the total.
    pub uncommit_on_return: bool,
}

pub const DEFAULT_COMMIT_GRANULE_WORDS: usize = 64 * 1024;

impl Default for Settings {
    fn default() -> Self {
        Self {
            commit_granule_words: DEFAULT_COMMIT_GRANULE_WORDS,
            committed_words_on_fresh_chunks: DEFAULT_COMMIT_GRANULE_WORDS,
            uncommit_on_return: false,
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<(), VmError> {
        if !self.commit_granule_words.is_power_of_two() {
            return Err(VmError::InitializationFailed(format!(
                "commit granule must be a power of two, got {}",
                self.commit_granule_words
            )));
        }
        if self.commit_granule_words > MAX_CHUNK_WORD_SIZE {
            return Err(VmError::InitializationFailed(format!(
                "commit granule ({} words) exceeds the largest chunk ({} words)",
                self.commit_granule_words, MAX_CHUNK_WORD_SIZE
            )));
        }
        Ok(())
    }
}
