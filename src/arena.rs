//! Per-tenant arena over the shared chunk pool.
//!
//! An arena owns a small set of chunks: one *current* chunk that new
//! allocations bump into, and the retired ones before it, which stay owned
//! until the arena dies (their content is live). Allocation never blocks and
//! never retries past a denied commit; a failed call leaves the arena's usage
//! numbers exactly as they were, so the caller can release memory elsewhere
//! and try again.
//!
//! Arenas are not internally synchronized. Each belongs to one tenant, and
//! the tenant's own lock covers it. The pool and limiter underneath are
//! thread-safe, so any number of arenas can grow concurrently.

use std::ptr::NonNull;

use crate::chunk::Chunk;
use crate::chunklevel::{self, MAX_CHUNK_WORD_SIZE, ROOT_CHUNK_LEVEL};
use crate::chunk_pool::ChunkPool;
use crate::commit_limiter::CommitLimiter;
use crate::error::AllocError;
use crate::freeblocks::{FreeBlocks, MIN_BLOCK_WORD_SIZE};
use crate::growth_policy::{ArenaKind, GrowthPolicy};
use crate::sync::Arc;
use crate::Word;

/// Usage snapshot of one arena, by walking its owned chunks.
///
/// `used <= committed <= capacity` always holds. "Used" counts every word
/// handed out plus salvage overhead; deallocated words stay used until their
/// chunk dies.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UsageNumbers {
    pub used_words: usize,
    pub committed_words: usize,
    pub capacity_words: usize,
}

pub struct Arena {
    name: String,
    policy: GrowthPolicy,
    pool: Arc<ChunkPool>,
    limiter: Arc<CommitLimiter>,
    current: Option<Chunk>,
    retired: Vec<Chunk>,
    freeblocks: FreeBlocks,
    /// Words allocated, including salvaged tails. Mirrors the sum over the
    /// owned chunks; kept separately as a cross-check.
    used_words: usize,
    /// Chunks acquired plus in-place enlargements. Indexes the growth
    /// ladder.
    growth_step: usize,
}

// Safety: the arena exclusively owns its chunks and free blocks; nothing in
// it is aliased.
unsafe impl Send for Arena {}

impl Arena {
    pub fn new(
        kind: ArenaKind,
        is_compact: bool,
        pool: Arc<ChunkPool>,
        limiter: Arc<CommitLimiter>,
        name: impl Into<String>,
    ) -> Self {
        debug_assert!(Arc::ptr_eq(&limiter, pool.limiter()));
        Self {
            name: name.into(),
            policy: GrowthPolicy::for_kind(kind, is_compact),
            pool,
            limiter,
            current: None,
            retired: Vec::new(),
            freeblocks: FreeBlocks::new(),
            used_words: 0,
            growth_step: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn limiter(&self) -> &Arc<CommitLimiter> {
        &self.limiter
    }

    /// Words currently sitting in this arena's free-block list.
    pub fn free_block_words(&self) -> usize {
        self.freeblocks.total_words()
    }

    /// Allocate `word_size` words. The result is word-aligned, owned by this
    /// arena, and valid until the arena is dropped.
    ///
    /// Tried in order: the free-block list, the current chunk (committing
    /// more of it on demand), enlarging the current chunk in place, a new
    /// chunk from the pool.
    ///
    /// # Errors
    ///
    /// `InvalidWordSize` for zero or over-root-chunk requests,
    /// `CommitLimitReached` when the budget denies every path (recoverable),
    /// `OutOfReservedSpace` when the pool's reservation is exhausted. On any
    /// error the arena's usage numbers are unchanged.
    pub fn allocate(&mut self, word_size: usize) -> Result<NonNull<Word>, AllocError> {
        if word_size == 0 || word_size > MAX_CHUNK_WORD_SIZE {
            return Err(AllocError::InvalidWordSize(word_size));
        }

        if let Some(p) = self.freeblocks.remove_block(word_size) {
            return Ok(p);
        }

        if let Some(p) = self.allocate_from_current(word_size)? {
            return Ok(p);
        }

        self.allocate_from_new_chunk(word_size)
    }

    /// Release a block back to this arena's free-block list. The words stay
    /// counted as used; later allocations may reuse them.
    pub fn deallocate(&mut self, ptr: NonNull<Word>, word_size: usize) {
        debug_assert!(word_size > 0);
        self.freeblocks.add_block(ptr, word_size);
    }

    pub fn usage_numbers(&self) -> UsageNumbers {
        let mut numbers = UsageNumbers {
            used_words: 0,
            committed_words: 0,
            capacity_words: 0,
        };
        for chunk in self.retired.iter().chain(self.current.iter()) {
            numbers.used_words += chunk.used_words();
            numbers.committed_words += chunk.committed_words();
            numbers.capacity_words += chunk.word_size();
        }
        debug_assert_eq!(numbers.used_words, self.used_words);
        debug_assert!(numbers.used_words <= numbers.committed_words);
        debug_assert!(numbers.committed_words <= numbers.capacity_words);
        numbers
    }

    // ------------------------------------------------------------------

    /// Steps 2 and 3: extend into the current chunk, enlarging it in place
    /// if the growth ladder was about to double it anyway. `Ok(None)` means
    /// "try a new chunk"; the arena is unchanged in that case.
    fn allocate_from_current(
        &mut self,
        word_size: usize,
    ) -> Result<Option<NonNull<Word>>, AllocError> {
        let policy_next = self.policy.level_at_step(self.growth_step);
        let current = match &mut self.current {
            Some(chunk) => chunk,
            None => return Ok(None),
        };

        if current.free_words() >= word_size {
            return match Self::ensure_committed(&self.pool, current, word_size)? {
                true => {
                    let p = current.allocate(word_size);
                    self.used_words += word_size;
                    Ok(Some(p))
                }
                // Commit denied. Enlarging cannot help (it would need the
                // same commit), but a committed chunk from the pool might.
                false => Ok(None),
            };
        }

        // Enlarge in place: only when the chunk is not a root, the ladder's
        // next rung is exactly the doubled size, and the doubled chunk would
        // actually fit the request.
        if current.level() == ROOT_CHUNK_LEVEL
            || policy_next != current.level() - 1
            || 2 * current.word_size() - current.used_words() < word_size
        {
            return Ok(None);
        }
        if !self.pool.attempt_enlarge(current) {
            return Ok(None);
        }
        self.growth_step += 1;

        match Self::ensure_committed(&self.pool, current, word_size) {
            Ok(true) => {
                let p = current.allocate(word_size);
                self.used_words += word_size;
                Ok(Some(p))
            }
            Ok(false) => {
                // The commit for the grown half was denied; undo so the
                // failure stays invisible.
                self.pool.shrink_back(current);
                self.growth_step -= 1;
                Ok(None)
            }
            Err(e) => {
                self.pool.shrink_back(current);
                self.growth_step -= 1;
                Err(e)
            }
        }
    }

    /// Step 4: a fresh chunk. Sized by the growth ladder, or bigger if the
    /// request itself needs more.
    fn allocate_from_new_chunk(&mut self, word_size: usize) -> Result<NonNull<Word>, AllocError> {
        let max_level = chunklevel::level_fitting_word_size(word_size);
        let preferred_level = self.policy.level_at_step(self.growth_step).min(max_level);

        let mut chunk = self.pool.get_chunk(preferred_level, max_level, word_size)?;
        debug_assert!(chunk.free_below_committed_words() >= word_size);

        // Only now that the new chunk is in hand does the old one retire; a
        // failure above leaves the arena untouched.
        self.retire_current();
        let p = chunk.allocate(word_size);
        self.used_words += word_size;
        self.current = Some(chunk);
        self.growth_step += 1;
        Ok(p)
    }

    /// Commit enough of `chunk` that `word_size` more words fit under the
    /// committed mark. `Ok(false)` on budget denial, with nothing changed.
    fn ensure_committed(
        pool: &ChunkPool,
        chunk: &mut Chunk,
        word_size: usize,
    ) -> Result<bool, AllocError> {
        if chunk.free_below_committed_words() >= word_size {
            return Ok(true);
        }
        let missing = word_size - chunk.free_below_committed_words();
        pool.commit_up_to(chunk, missing)?;
        Ok(chunk.free_below_committed_words() >= word_size)
    }

    fn retire_current(&mut self) {
        let Some(mut old) = self.current.take() else {
            return;
        };
        // A chunk only becomes current with its first allocation already in
        // it, so there is always content to keep.
        debug_assert!(old.used_words() > 0);
        // Salvage the committed-free tail into the free-block list. The tail
        // counts as used from here on; the chunk stays owned.
        let tail = old.free_below_committed_words();
        if tail >= MIN_BLOCK_WORD_SIZE {
            let p = old.allocate(tail);
            self.used_words += tail;
            self.freeblocks.add_block(p, tail);
        }
        self.retired.push(old);
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        // All content dies with the arena. Free blocks point into the chunks
        // being returned, so they go first.
        self.freeblocks.clear();
        self.used_words = 0;
        if let Some(chunk) = self.current.take() {
            self.pool.return_chunk(chunk);
        }
        for chunk in self.retired.drain(..) {
            self.pool.return_chunk(chunk);
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::chunklevel::{word_size_for_level, MIN_CHUNK_WORD_SIZE};
    use crate::settings::Settings;
    use crate::BYTES_PER_WORD;

    /// 32 KiB commit granule keeps the growth tests quick.
    const TEST_GRANULE: usize = 4 * 1024;

    const ALL_KINDS: &[ArenaKind] = &[
        ArenaKind::Reflection,
        ArenaKind::Anonymous,
        ArenaKind::Standard,
        ArenaKind::Boot,
    ];

    fn test_pool(
        limit_words: usize,
        reserve_roots: usize,
    ) -> (Arc<ChunkPool>, Arc<CommitLimiter>) {
        let limiter = Arc::new(CommitLimiter::new(limit_words));
        let settings = Settings {
            commit_granule_words: TEST_GRANULE,
            committed_words_on_fresh_chunks: TEST_GRANULE,
            uncommit_on_return: false,
        };
        let pool = ChunkPool::new(
            settings,
            Arc::clone(&limiter),
            reserve_roots * MAX_CHUNK_WORD_SIZE,
        )
        .unwrap();
        (pool, limiter)
    }

    fn arena_on(pool: &Arc<ChunkPool>, kind: ArenaKind, is_compact: bool) -> Arena {
        Arena::new(
            kind,
            is_compact,
            Arc::clone(pool),
            Arc::clone(pool.limiter()),
            format!("{kind:?}-{is_compact}"),
        )
    }

    /// Allocate with the full invariant check: success moves the usage
    /// numbers monotonically, failure leaves them bit-identical.
    fn alloc_checked(arena: &mut Arena, word_size: usize) -> Option<NonNull<Word>> {
        let before = arena.usage_numbers();
        match arena.allocate(word_size) {
            Ok(p) => {
                assert_eq!(p.as_ptr() as usize % BYTES_PER_WORD, 0);
                let after = arena.usage_numbers();
                assert!(after.used_words >= before.used_words);
                assert!(after.committed_words >= before.committed_words);
                assert!(after.capacity_words >= before.capacity_words);
                Some(p)
            }
            Err(_) => {
                assert_eq!(arena.usage_numbers(), before);
                None
            }
        }
    }

    fn run_basics(kind: ArenaKind, is_compact: bool, limit_words: usize) {
        let (pool, _limiter) = test_pool(limit_words, 16);
        let mut arena = arena_on(&pool, kind, is_compact);
        for _ in 0..2 {
            // tiny, small, large; failures are allowed under a tight limit,
            // alloc_checked holds the invariants either way
            alloc_checked(&mut arena, 1);
            alloc_checked(&mut arena, 128);
            alloc_checked(&mut arena, 128 * 1024);
        }
    }

    #[test]
    fn test_basics_unlimited() {
        for &kind in ALL_KINDS {
            for is_compact in [false, true] {
                run_basics(kind, is_compact, usize::MAX);
            }
        }
    }

    #[test]
    fn test_basics_with_limit() {
        for &kind in ALL_KINDS {
            for is_compact in [false, true] {
                run_basics(kind, is_compact, 256 * 1024);
            }
        }
    }

    #[test]
    fn test_zero_allocation_rejected() {
        let (pool, _limiter) = test_pool(usize::MAX, 16);
        let mut arena = arena_on(&pool, ArenaKind::Standard, false);
        let before = arena.usage_numbers();
        assert!(matches!(
            arena.allocate(0),
            Err(AllocError::InvalidWordSize(0))
        ));
        assert_eq!(arena.usage_numbers(), before);
    }

    #[test]
    fn test_oversized_allocation_rejected() {
        let (pool, _limiter) = test_pool(usize::MAX, 16);
        let mut arena = arena_on(&pool, ArenaKind::Standard, false);
        assert!(matches!(
            arena.allocate(MAX_CHUNK_WORD_SIZE + 1),
            Err(AllocError::InvalidWordSize(_))
        ));
        assert_eq!(arena.usage_numbers().capacity_words, 0);
    }

    #[test]
    fn test_first_chunk_follows_ladder_start() {
        for &kind in ALL_KINDS {
            for is_compact in [false, true] {
                let (pool, _limiter) = test_pool(usize::MAX, 16);
                let mut arena = arena_on(&pool, kind, is_compact);
                assert!(alloc_checked(&mut arena, 16).is_some());
                let numbers = arena.usage_numbers();
                let start =
                    word_size_for_level(GrowthPolicy::for_kind(kind, is_compact).start_level());
                assert_eq!(numbers.capacity_words, start);
                // the first commit is bounded by the eager-commit cap
                assert!(numbers.committed_words <= TEST_GRANULE.max(16));
            }
        }
    }

    #[test]
    fn test_enlarge_in_place() {
        let (pool, _limiter) = test_pool(usize::MAX, 16);
        let mut arena = arena_on(&pool, ArenaKind::Standard, false);

        // first chunk: 4K words per the ladder
        assert!(alloc_checked(&mut arena, 1).is_some());
        assert_eq!(arena.usage_numbers().capacity_words, 4 * 1024);

        // does not fit; the ladder doubles next, the buddy is free, so the
        // chunk grows in place instead of being replaced
        assert!(alloc_checked(&mut arena, 4 * 1024).is_some());
        let numbers = arena.usage_numbers();
        assert_eq!(numbers.capacity_words, 8 * 1024);
        assert_eq!(pool.stats().chunks_enlarged(), 1);
        // still a single chunk: nothing was retired
        assert_eq!(pool.stats().chunks_handed_out(), 1);
    }

    #[test]
    fn test_chunk_doubling_ladder() {
        // Growth in lockstep with the ladder: every step up to the ladder
        // cap should enlarge in place, later steps take fresh chunks.
        let (pool, _limiter) = test_pool(usize::MAX, 16);
        let mut arena = arena_on(&pool, ArenaKind::Standard, false);

        let mut word_size = 1024;
        while word_size <= MAX_CHUNK_WORD_SIZE {
            assert!(alloc_checked(&mut arena, word_size).is_some());
            word_size *= 2;
        }
        assert!(alloc_checked(&mut arena, MAX_CHUNK_WORD_SIZE).is_some());
        assert!(pool.stats().chunks_enlarged() >= 2);
    }

    #[test]
    fn test_chunk_quadrupling_ladder() {
        // Requests outpace the ladder: at most one step can double in
        // place, everything else needs replacement chunks.
        let (pool, _limiter) = test_pool(usize::MAX, 16);
        let mut arena = arena_on(&pool, ArenaKind::Standard, false);

        let mut word_size = 1024;
        while word_size <= MAX_CHUNK_WORD_SIZE {
            assert!(alloc_checked(&mut arena, word_size).is_some());
            word_size *= 4;
        }
        assert!(alloc_checked(&mut arena, MAX_CHUNK_WORD_SIZE).is_some());
        assert!(pool.stats().chunks_enlarged() <= 1);
    }

    #[test]
    fn test_failed_allocation_changes_nothing() {
        let (pool, _limiter) = test_pool(TEST_GRANULE, 16);
        let mut arena = arena_on(&pool, ArenaKind::Standard, false);
        assert!(alloc_checked(&mut arena, 16).is_some());

        let before = arena.usage_numbers();
        // the budget is exhausted; a large request must fail cleanly
        assert!(matches!(
            arena.allocate(64 * 1024),
            Err(AllocError::CommitLimitReached { .. })
        ));
        assert_eq!(arena.usage_numbers(), before);

        // small requests inside the already-committed chunk still work
        assert!(alloc_checked(&mut arena, 16).is_some());
    }

    #[test]
    fn test_recover_from_commit_limit_hit() {
        let limit_words = 10 * TEST_GRANULE;
        let (pool, limiter) = test_pool(limit_words, 16);
        let mut arena1 = arena_on(&pool, ArenaKind::Reflection, true);
        let mut arena2 = arena_on(&pool, ArenaKind::Reflection, true);

        // two tenants nibble away at the budget until it is nearly gone
        while limiter.possible_expansion_words() >= 2 * TEST_GRANULE {
            assert!(alloc_checked(&mut arena1, 1).is_some());
            assert!(alloc_checked(&mut arena2, 1).is_some());
        }

        // a third tenant hits the wall quickly
        let mut boot = arena_on(&pool, ArenaKind::Boot, false);
        let mut allocated = 0usize;
        while alloc_checked(&mut boot, 1).is_some() {
            allocated += 1;
            assert!(allocated < 2 * TEST_GRANULE, "boot arena never hit the limit");
        }

        // nothing reusable is free in the pool at this point
        assert_eq!(pool.total_committed_free_words(), 0);

        // one tenant dying frees committed chunks without uncommitting them
        let committed_before = limiter.committed_words();
        drop(arena2);
        assert!(pool.total_committed_free_words() > 0);
        assert_eq!(limiter.committed_words(), committed_before);

        // the blocked tenant recovers by reusing that committed memory
        assert!(alloc_checked(&mut boot, 1).is_some());
    }

    fn run_controlled_growth(kind: ArenaKind, is_compact: bool, expect_enlargement: bool, disturbed: bool) {
        let (pool, _limiter) = test_pool(usize::MAX, 24);
        let mut grower = arena_on(&pool, kind, is_compact);
        let mut harasser = arena_on(&pool, ArenaKind::Reflection, true);

        let enlarged_before = pool.stats().chunks_enlarged();
        assert!(alloc_checked(&mut grower, 16).is_some());
        let mut last = grower.usage_numbers();

        let mut allocated_words = 16usize;
        let mut highest_jump = last.capacity_words;
        let mut capacity_jumps = 0usize;

        while capacity_jumps < 8 && allocated_words < 6 * 1024 * 1024 {
            assert!(alloc_checked(&mut grower, 16).is_some());
            allocated_words += 16;
            if disturbed {
                assert!(alloc_checked(&mut harasser, 16).is_some());
            }

            let now = grower.usage_numbers();
            // commit follows demand: never more than one granule at a time
            assert!(
                now.committed_words <= last.committed_words + TEST_GRANULE,
                "{kind:?}: committed jumped {} -> {}",
                last.committed_words,
                now.committed_words
            );
            if now.capacity_words > last.capacity_words {
                let jump = now.capacity_words - last.capacity_words;
                assert!(jump >= MIN_CHUNK_WORD_SIZE);
                assert!(
                    jump <= 2 * highest_jump,
                    "{kind:?}: capacity burst {jump} after highest {highest_jump}"
                );
                highest_jump = highest_jump.max(jump);
                capacity_jumps += 1;
            }
            last = now;
        }

        if expect_enlargement {
            assert!(pool.stats().chunks_enlarged() > enlarged_before);
        }
    }

    #[test]
    fn test_controlled_growth_undisturbed() {
        for &kind in ALL_KINDS {
            for is_compact in [false, true] {
                // the boot non-compact ladder starts at root chunks, which
                // cannot enlarge
                let expect_enlargement =
                    !(kind == ArenaKind::Boot && !is_compact);
                run_controlled_growth(kind, is_compact, expect_enlargement, false);
            }
        }
    }

    #[test]
    fn test_controlled_growth_disturbed() {
        // a second arena steals buddies; growth must stay bounded anyway
        run_controlled_growth(ArenaKind::Standard, false, false, true);
        run_controlled_growth(ArenaKind::Reflection, true, false, true);
    }

    #[test]
    fn test_deallocate_feeds_free_blocks() {
        let (pool, _limiter) = test_pool(usize::MAX, 16);
        let mut arena = arena_on(&pool, ArenaKind::Standard, false);

        let p = arena.allocate(64).unwrap();
        let used = arena.usage_numbers().used_words;
        arena.deallocate(p, 64);
        // deallocation does not shrink usage...
        assert_eq!(arena.usage_numbers().used_words, used);
        // ...but the words come back on the next fitting request
        let q = arena.allocate(64).unwrap();
        assert_eq!(p, q);
        assert_eq!(arena.usage_numbers().used_words, used);
    }

    #[test]
    fn test_retired_chunk_tail_is_salvaged() {
        let (pool, _limiter) = test_pool(usize::MAX, 16);
        let mut arena = arena_on(&pool, ArenaKind::Standard, false);

        // 16 words into a 4K chunk, then a request that forces a new chunk
        assert!(alloc_checked(&mut arena, 16).is_some());
        assert!(alloc_checked(&mut arena, 8 * 1024).is_some());
        assert_eq!(pool.stats().chunks_handed_out(), 2);
        // the 4K chunk had 16 words used; the rest went to the block list
        assert_eq!(arena.free_block_words(), 4 * 1024 - 16);

        // the old chunk's committed tail now serves from the free-block
        // list: no usage movement at all
        let before = arena.usage_numbers();
        assert!(arena.allocate(4000).is_ok());
        assert_eq!(arena.usage_numbers(), before);
    }

    #[test]
    fn test_destruction_returns_chunks_without_uncommit() {
        let (pool, limiter) = test_pool(usize::MAX, 16);
        let mut arena = arena_on(&pool, ArenaKind::Standard, false);
        for word_size in [1, 128, 1024, 32 * 1024] {
            assert!(alloc_checked(&mut arena, word_size).is_some());
        }
        let committed_before = limiter.committed_words();
        let handed_out = pool.stats().chunks_handed_out();

        drop(arena);

        assert_eq!(pool.stats().chunks_returned(), handed_out);
        // committed memory stays paid for, ready for reuse
        assert_eq!(limiter.committed_words(), committed_before);
        assert_eq!(pool.total_committed_free_words(), committed_before);
    }

    #[test]
    fn test_destruction_with_uncommit_on_return() {
        let limiter = Arc::new(CommitLimiter::unlimited());
        let settings = Settings {
            commit_granule_words: TEST_GRANULE,
            committed_words_on_fresh_chunks: TEST_GRANULE,
            uncommit_on_return: true,
        };
        let pool = ChunkPool::new(settings, Arc::clone(&limiter), 16 * MAX_CHUNK_WORD_SIZE)
            .unwrap();
        let mut arena = arena_on(&pool, ArenaKind::Standard, false);
        for word_size in [1, 128, 1024, 32 * 1024] {
            assert!(alloc_checked(&mut arena, word_size).is_some());
        }
        assert!(limiter.committed_words() > 0);

        drop(arena);

        assert_eq!(limiter.committed_words(), 0);
        assert_eq!(pool.total_committed_free_words(), 0);
    }

    #[test]
    fn test_two_arenas_do_not_interfere() {
        let (pool, _limiter) = test_pool(usize::MAX, 16);
        let mut a = arena_on(&pool, ArenaKind::Standard, false);
        let mut b = arena_on(&pool, ArenaKind::Anonymous, true);

        let pa = a.allocate(100).unwrap();
        let pb = b.allocate(100).unwrap();
        assert_ne!(pa, pb);

        // write through both; ranges are disjoint chunks
        // Safety: both pointers own 100 committed words.
        unsafe {
            std::ptr::write_bytes(pa.as_ptr(), 0xA5, 100);
            std::ptr::write_bytes(pb.as_ptr(), 0x5A, 100);
            assert_eq!(pa.as_ptr().read(), Word::from_ne_bytes([0xA5; 8]));
            assert_eq!(pb.as_ptr().read(), Word::from_ne_bytes([0x5A; 8]));
        }

        drop(a);
        // b's memory is untouched by a's destruction
        // Safety: pb still owned by the live arena b.
        unsafe {
            assert_eq!(pb.as_ptr().read(), Word::from_ne_bytes([0x5A; 8]));
        }
    }
}
