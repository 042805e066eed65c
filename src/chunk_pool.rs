//! The shared chunk pool.
//!
//! One pool serves many arenas. It reserves a single large address range up
//! front (PROT_NONE) and carves it into power-of-two chunks on demand. Virgin
//! space is only ever carved in root-chunk units; smaller chunks come from
//! splitting, so a chunk's word offset from the pool base is always a
//! multiple of its own word size. That makes the buddy of a chunk at offset
//! `off` sit at `off ^ word_size`, and split/merge pure offset arithmetic.
//!
//! Physical memory is committed lazily, in granule units, charged against the
//! pool's [`CommitLimiter`]. Commit state travels with each chunk as a
//! committed *prefix*; all structural operations here preserve that shape.
//!
//! The pool is internally synchronized. Arenas are not; they each belong to
//! one tenant.

use std::collections::HashMap;
use std::ptr::NonNull;

use fixedbitset::FixedBitSet;

use crate::chunk::Chunk;
use crate::chunklevel::{
    self, ChunkLevel, MAX_CHUNK_WORD_SIZE, MIN_CHUNK_WORD_SIZE, NUM_CHUNK_LEVELS,
    ROOT_CHUNK_LEVEL,
};
use crate::commit_limiter::CommitLimiter;
use crate::error::AllocError;
use crate::settings::Settings;
use crate::stats::InternalStats;
use crate::sync::{Arc, Mutex};
use crate::vm::{PlatformVmOps, VmError, VmOps};
use crate::{Word, BYTES_PER_WORD};

#[derive(Clone, Copy, Debug)]
struct DirEntry {
    level: ChunkLevel,
    free: bool,
}

/// State behind the pool mutex.
struct PoolInner {
    /// Free chunks by level. Order within a level is irrelevant.
    free_lists: [Vec<Chunk>; NUM_CHUNK_LEVELS],
    /// Word offset → entry, for every chunk ever carved, live or free.
    /// Merging and enlargement look buddies up here.
    directory: HashMap<usize, DirEntry>,
    /// One bit per MIN-chunk slot; set while the slot is part of a
    /// handed-out chunk. Catches double returns.
    handed_out: FixedBitSet,
    /// High-water mark of carved virgin space, in words. Always a multiple
    /// of the root chunk size.
    virgin_top_words: usize,
}

pub struct ChunkPool {
    inner: Mutex<PoolInner>,
    limiter: Arc<CommitLimiter>,
    settings: Settings,
    stats: InternalStats,
    /// Eager commit cap for fresh hand-outs, granule-rounded once at init.
    fresh_commit_cap_words: usize,
    base: NonNull<Word>,
    reserved_words: usize,
}

// Safety: ChunkPool owns its reservation outright. All mutable state sits
// behind the inner Mutex or in atomics.
unsafe impl Send for ChunkPool {}
unsafe impl Sync for ChunkPool {}

impl ChunkPool {
    /// Reserve `reserve_words` (rounded up to whole root chunks) of address
    /// space and set up an empty pool on top of it.
    ///
    /// # Errors
    ///
    /// Returns `VmError` if the settings are invalid or the reservation
    /// fails.
    pub fn new(
        settings: Settings,
        limiter: Arc<CommitLimiter>,
        reserve_words: usize,
    ) -> Result<Arc<Self>, VmError> {
        settings.validate()?;

        let page_size = PlatformVmOps::page_size();
        if (MIN_CHUNK_WORD_SIZE * BYTES_PER_WORD) % page_size != 0 {
            return Err(VmError::InitializationFailed(format!(
                "page size {page_size} does not divide the smallest chunk ({} bytes)",
                MIN_CHUNK_WORD_SIZE * BYTES_PER_WORD
            )));
        }
        // Sub-chunk commits land on granule boundaries; those must be page
        // boundaries too or mprotect rejects them.
        if (settings.commit_granule_words * BYTES_PER_WORD) % page_size != 0 {
            return Err(VmError::InitializationFailed(format!(
                "page size {page_size} does not divide the commit granule ({} bytes)",
                settings.commit_granule_words * BYTES_PER_WORD
            )));
        }

        let reserved_words = reserve_words
            .max(MAX_CHUNK_WORD_SIZE)
            .next_multiple_of(MAX_CHUNK_WORD_SIZE);
        let reserved_bytes = reserved_words.checked_mul(BYTES_PER_WORD).ok_or_else(|| {
            VmError::InitializationFailed("reservation size overflow".to_string())
        })?;

        // Safety: plain anonymous reservation; released again in Drop.
        let base = unsafe { PlatformVmOps::reserve(reserved_bytes)? }.cast::<Word>();

        let fresh_commit_cap_words = settings
            .committed_words_on_fresh_chunks
            .next_multiple_of(settings.commit_granule_words);

        Ok(Arc::new(Self {
            inner: Mutex::new(PoolInner {
                free_lists: std::array::from_fn(|_| Vec::new()),
                directory: HashMap::new(),
                handed_out: FixedBitSet::with_capacity(reserved_words / MIN_CHUNK_WORD_SIZE),
                virgin_top_words: 0,
            }),
            limiter,
            settings,
            stats: InternalStats::new(),
            fresh_commit_cap_words,
            base,
            reserved_words,
        }))
    }

    pub fn limiter(&self) -> &Arc<CommitLimiter> {
        &self.limiter
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn stats(&self) -> &InternalStats {
        &self.stats
    }

    pub fn reserved_words(&self) -> usize {
        self.reserved_words
    }

    /// Hand out a chunk of level `preferred_level` if possible, accepting
    /// anything down to `max_level` (smaller chunks, numerically higher
    /// levels), committed to at least `min_committed_words`.
    ///
    /// Search order:
    /// 1. a free chunk anywhere in `preferred..=max` that is *already*
    ///    committed far enough — reusing paid-for commit beats exact sizing,
    ///    and is what lets allocation recover after a commit-limit hit;
    /// 2. a free chunk of exactly `preferred_level`, any commit state;
    /// 3. splitting the smallest sufficient larger free chunk;
    /// 4. carving a fresh root chunk from virgin space;
    /// 5. any remaining smaller free chunk that still fits the request.
    ///
    /// A denied top-up gets one more chance: a free chunk *larger* than the
    /// preferred level whose committed prefix already covers the request is
    /// split down and handed out instead. The prefix survives splitting, so
    /// this costs no budget.
    ///
    /// # Errors
    ///
    /// `CommitLimitReached` if the limiter denies the top-up and no committed
    /// larger chunk can stand in (the candidate chunk goes back to the free
    /// lists untouched), `OutOfReservedSpace` if nothing fits and virgin
    /// space is gone.
    pub fn get_chunk(
        &self,
        preferred_level: ChunkLevel,
        max_level: ChunkLevel,
        min_committed_words: usize,
    ) -> Result<Chunk, AllocError> {
        debug_assert!(chunklevel::is_valid_level(preferred_level));
        debug_assert!(chunklevel::is_valid_level(max_level));
        debug_assert!(preferred_level <= max_level);
        debug_assert!(min_committed_words > 0);
        debug_assert!(min_committed_words <= chunklevel::word_size_for_level(max_level));

        let mut inner = self.inner.lock().unwrap();

        let mut chunk =
            self.find_or_make_chunk(&mut inner, preferred_level, max_level, min_committed_words)?;

        let target = self.fresh_commit_target(&chunk, min_committed_words);
        match self.commit_chunk_to(&mut chunk, target) {
            Ok(_) if chunk.committed_words() >= min_committed_words => {}
            Ok(_) => {
                // Budget denial. The candidate keeps whatever it had; put it
                // back and fall back to splitting a larger free chunk whose
                // committed prefix already covers the request.
                self.park_free_chunk(&mut inner, chunk);
                match self.take_committed_larger(&mut inner, preferred_level, min_committed_words)
                {
                    Some(split) => chunk = split,
                    None => {
                        return Err(AllocError::CommitLimitReached {
                            requested_words: min_committed_words,
                        })
                    }
                }
            }
            Err(e) => {
                self.park_free_chunk(&mut inner, chunk);
                return Err(e);
            }
        }

        self.mark_handed_out(&mut inner, &chunk);
        self.stats.chunks_handed_out.add(1);
        Ok(chunk)
    }

    /// Give a chunk back. Its content is dead; the used mark resets, buddies
    /// are merged as far as the committed-prefix rules allow, and the result
    /// joins the free lists. With `uncommit_on_return` set, the chunk's
    /// memory is decommitted first.
    pub fn return_chunk(&self, mut chunk: Chunk) {
        debug_assert!(self.owns(&chunk));
        #[cfg(debug_assertions)]
        chunk.verify();
        chunk.reset_used();

        if self.settings.uncommit_on_return && chunk.committed_words() > 0 {
            let words = chunk.committed_words();
            // Safety: the chunk's range is owned and within our reservation.
            let decommitted = unsafe {
                PlatformVmOps::decommit(self.byte_ptr(&chunk, 0), words * BYTES_PER_WORD)
            };
            match decommitted {
                Ok(()) => {
                    self.limiter.uncommit(words);
                    chunk.set_committed_words(0);
                }
                Err(_e) => {
                    // Keep the chunk committed; the budget stays charged.
                    #[cfg(debug_assertions)]
                    panic!("decommit failed while returning chunk at {:p}: {_e}", chunk.base());
                }
            }
        }

        let mut inner = self.inner.lock().unwrap();
        self.clear_handed_out(&mut inner, &chunk);
        self.stats.chunks_returned.add(1);

        while chunk.level() > ROOT_CHUNK_LEVEL {
            let offset = self.word_offset(&chunk);
            let size = chunk.word_size();
            let buddy_offset = offset ^ size;

            let Some(entry) = inner.directory.get(&buddy_offset).copied() else {
                debug_assert!(false, "buddy at word offset {buddy_offset} never carved");
                break;
            };
            if !entry.free || entry.level != chunk.level() {
                break;
            }
            let Some(buddy) = take_free_chunk(&mut inner, buddy_offset, entry.level, self.base)
            else {
                debug_assert!(false, "directory/free-list mismatch at {buddy_offset}");
                break;
            };

            let (mut low, high) = if offset < buddy_offset {
                (chunk, buddy)
            } else {
                (buddy, chunk)
            };

            // The merged chunk needs a single committed prefix: either the
            // low half is fully committed (the regions concatenate) or the
            // high half has nothing committed. Anything else would force a
            // decommit of paid-for memory just to merge; keep the pair
            // split instead, the committed half stays cheap to reuse.
            if !low.is_fully_committed() && high.committed_words() > 0 {
                let (ret, other) = if self.word_offset(&low) == offset {
                    (low, high)
                } else {
                    (high, low)
                };
                inner.free_lists[other.level()].push(other);
                chunk = ret;
                break;
            }

            let low_offset = offset.min(buddy_offset);
            let merged_level = low.level() - 1;
            let merged_committed = low.committed_words() + high.committed_words();

            inner.directory.remove(&(low_offset + size));
            inner.directory.insert(
                low_offset,
                DirEntry {
                    level: merged_level,
                    free: true,
                },
            );
            low.set_level(merged_level);
            low.set_committed_words(merged_committed);
            chunk = low;
            self.stats.chunks_merged.add(1);
        }

        self.park_free_chunk(&mut inner, chunk);
    }

    /// Grow the committed prefix of an arena-owned chunk by at least
    /// `additional_words`, rounded up to the commit granule and capped at
    /// the chunk size. All or nothing: returns the words actually gained,
    /// which is 0 if the limiter denied the request. Never blocks on the
    /// pool lock — the chunk is exclusively owned and the limiter is atomic.
    ///
    /// # Errors
    ///
    /// Returns `AllocError::Vm` if the VM commit itself fails (the budget
    /// charge is rolled back).
    pub fn commit_up_to(
        &self,
        chunk: &mut Chunk,
        additional_words: usize,
    ) -> Result<usize, AllocError> {
        debug_assert!(self.owns(chunk));
        debug_assert!(additional_words > 0);
        let target = round_up(
            chunk.committed_words() + additional_words,
            self.settings.commit_granule_words,
        );
        self.commit_chunk_to(chunk, target)
    }

    /// Try to double an arena-owned chunk in place by absorbing its buddy.
    ///
    /// Succeeds only when the chunk is the *leader* of its buddy pair (its
    /// offset is aligned to the doubled size) and the buddy is free with
    /// nothing committed. The committed-prefix invariant then carries over
    /// unchanged, and the caller's commit bill does not move.
    pub fn attempt_enlarge(&self, chunk: &mut Chunk) -> bool {
        debug_assert!(self.owns(chunk));
        if chunk.level() == ROOT_CHUNK_LEVEL {
            return false;
        }
        let offset = self.word_offset(chunk);
        let size = chunk.word_size();
        if offset & size != 0 {
            // not the leader of its pair; only the low half can absorb the
            // high one
            return false;
        }

        let mut inner = self.inner.lock().unwrap();
        let buddy_offset = offset + size;
        let Some(entry) = inner.directory.get(&buddy_offset).copied() else {
            return false;
        };
        if !entry.free || entry.level != chunk.level() {
            return false;
        }
        let list = &inner.free_lists[entry.level];
        let Some(idx) = list
            .iter()
            .position(|c| self.word_offset(c) == buddy_offset)
        else {
            debug_assert!(false, "directory/free-list mismatch at {buddy_offset}");
            return false;
        };
        if list[idx].committed_words() > 0 {
            return false;
        }
        inner.free_lists[entry.level].swap_remove(idx);
        inner.directory.remove(&buddy_offset);

        let enlarged_level = chunk.level() - 1;
        inner.directory.insert(
            offset,
            DirEntry {
                level: enlarged_level,
                free: false,
            },
        );
        chunk.set_level(enlarged_level);
        set_slot_bits(&mut inner.handed_out, buddy_offset, size, true);
        self.stats.chunks_enlarged.add(1);
        true
    }

    /// Undo of [`attempt_enlarge`](Self::attempt_enlarge), for the case
    /// where the follow-up commit was denied. Legal only while the upper
    /// half is still untouched (nothing used, nothing committed there).
    pub fn shrink_back(&self, chunk: &mut Chunk) {
        debug_assert!(self.owns(chunk));
        let half = chunk.word_size() / 2;
        debug_assert!(chunk.used_words() <= half);
        debug_assert!(chunk.committed_words() <= half);

        let offset = self.word_offset(chunk);
        let split_level = chunk.level() + 1;
        debug_assert!(chunklevel::is_valid_level(split_level));

        let mut inner = self.inner.lock().unwrap();
        chunk.set_level(split_level);
        inner.directory.insert(
            offset,
            DirEntry {
                level: split_level,
                free: false,
            },
        );

        let high_offset = offset + half;
        let high = Chunk::new(self.ptr_at(high_offset), split_level);
        inner.directory.insert(
            high_offset,
            DirEntry {
                level: split_level,
                free: true,
            },
        );
        set_slot_bits(&mut inner.handed_out, high_offset, half, false);
        inner.free_lists[split_level].push(high);
        self.stats.chunks_enlarged.sub(1);
    }

    /// Committed words currently sitting in free chunks. Memory that new
    /// hand-outs can reuse without touching the commit budget.
    pub fn total_committed_free_words(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner
            .free_lists
            .iter()
            .flatten()
            .map(Chunk::committed_words)
            .sum()
    }

    /// Free chunks at `level`, for tests and diagnostics.
    pub fn num_free_chunks_at_level(&self, level: ChunkLevel) -> usize {
        self.inner.lock().unwrap().free_lists[level].len()
    }

    // ------------------------------------------------------------------
    // internals
    // ------------------------------------------------------------------

    fn find_or_make_chunk(
        &self,
        inner: &mut PoolInner,
        preferred_level: ChunkLevel,
        max_level: ChunkLevel,
        min_committed_words: usize,
    ) -> Result<Chunk, AllocError> {
        // 1. committed chunk anywhere in the acceptable size range
        for level in preferred_level..=max_level {
            if let Some(idx) = inner.free_lists[level]
                .iter()
                .position(|c| c.committed_words() >= min_committed_words)
            {
                return Ok(inner.free_lists[level].swap_remove(idx));
            }
        }

        // 2. exactly the preferred level, any commit state
        if let Some(chunk) = inner.free_lists[preferred_level].pop() {
            return Ok(chunk);
        }

        // 3. split the closest larger free chunk
        for level in (ROOT_CHUNK_LEVEL..preferred_level).rev() {
            if let Some(chunk) = inner.free_lists[level].pop() {
                return Ok(self.split_to(inner, chunk, preferred_level));
            }
        }

        // 4. carve a fresh root chunk
        if inner.virgin_top_words + MAX_CHUNK_WORD_SIZE <= self.reserved_words {
            let offset = inner.virgin_top_words;
            inner.virgin_top_words += MAX_CHUNK_WORD_SIZE;
            inner.directory.insert(
                offset,
                DirEntry {
                    level: ROOT_CHUNK_LEVEL,
                    free: true,
                },
            );
            let chunk = Chunk::new(self.ptr_at(offset), ROOT_CHUNK_LEVEL);
            return Ok(if preferred_level > ROOT_CHUNK_LEVEL {
                self.split_to(inner, chunk, preferred_level)
            } else {
                chunk
            });
        }

        // 5. smaller chunks that still fit the request
        for level in preferred_level + 1..=max_level {
            if let Some(chunk) = inner.free_lists[level].pop() {
                return Ok(chunk);
            }
        }

        Err(AllocError::OutOfReservedSpace)
    }

    /// Closest larger free chunk with at least `min_committed_words` already
    /// committed, split down to `preferred_level`. The split keeps the
    /// committed prefix with the low half, so the result still covers the
    /// request without touching the limiter.
    fn take_committed_larger(
        &self,
        inner: &mut PoolInner,
        preferred_level: ChunkLevel,
        min_committed_words: usize,
    ) -> Option<Chunk> {
        for level in (ROOT_CHUNK_LEVEL..preferred_level).rev() {
            if let Some(idx) = inner.free_lists[level]
                .iter()
                .position(|c| c.committed_words() >= min_committed_words)
            {
                let chunk = inner.free_lists[level].swap_remove(idx);
                let chunk = self.split_to(inner, chunk, preferred_level);
                debug_assert!(chunk.committed_words() >= min_committed_words);
                return Some(chunk);
            }
        }
        None
    }

    /// Split `chunk` down to `target_level`, parking every splinter in the
    /// free lists. The committed prefix stays with the low half; any excess
    /// spills into the splinter.
    fn split_to(&self, inner: &mut PoolInner, mut chunk: Chunk, target_level: ChunkLevel) -> Chunk {
        debug_assert!(chunk.level() < target_level);
        debug_assert!(chunk.used_words() == 0);

        while chunk.level() < target_level {
            let half = chunk.word_size() / 2;
            let split_level = chunk.level() + 1;
            let offset = self.word_offset(&chunk);
            let high_offset = offset + half;

            let mut high = Chunk::new(self.ptr_at(high_offset), split_level);
            let committed = chunk.committed_words();
            if committed > half {
                high.set_committed_words(committed - half);
                chunk.set_committed_words(half);
            }
            chunk.set_level(split_level);

            inner.directory.insert(
                offset,
                DirEntry {
                    level: split_level,
                    free: true,
                },
            );
            inner.directory.insert(
                high_offset,
                DirEntry {
                    level: split_level,
                    free: true,
                },
            );
            inner.free_lists[split_level].push(high);
            self.stats.chunks_split.add(1);
        }
        chunk
    }

    /// Eager commit target for a fresh hand-out: what the request needs,
    /// granule-rounded, lifted to the configured eager cap, clamped to the
    /// chunk.
    fn fresh_commit_target(&self, chunk: &Chunk, min_committed_words: usize) -> usize {
        let needed = round_up(min_committed_words, self.settings.commit_granule_words);
        needed.max(self.fresh_commit_cap_words).min(chunk.word_size())
    }

    /// Commit the chunk's prefix up to `target_words` (clamped to the chunk
    /// size). Ok(0) on budget denial, with nothing changed.
    fn commit_chunk_to(&self, chunk: &mut Chunk, target_words: usize) -> Result<usize, AllocError> {
        let target = target_words.min(chunk.word_size());
        let committed = chunk.committed_words();
        if target <= committed {
            return Ok(0);
        }
        let delta = target - committed;
        if !self.limiter.try_commit(delta) {
            self.stats.commit_denials.add(1);
            return Ok(0);
        }
        // Safety: [committed, target) lies within this owned chunk's part of
        // the reservation, and the budget charge above covers it.
        let committed_result = unsafe {
            PlatformVmOps::commit(self.byte_ptr(chunk, committed), delta * BYTES_PER_WORD)
        };
        match committed_result {
            Ok(()) => {
                chunk.note_committed(delta);
                Ok(delta)
            }
            Err(e) => {
                self.limiter.uncommit(delta);
                Err(AllocError::Vm(e))
            }
        }
    }

    fn park_free_chunk(&self, inner: &mut PoolInner, chunk: Chunk) {
        let offset = self.word_offset(&chunk);
        inner.directory.insert(
            offset,
            DirEntry {
                level: chunk.level(),
                free: true,
            },
        );
        inner.free_lists[chunk.level()].push(chunk);
    }

    fn mark_handed_out(&self, inner: &mut PoolInner, chunk: &Chunk) {
        let offset = self.word_offset(chunk);
        inner.directory.insert(
            offset,
            DirEntry {
                level: chunk.level(),
                free: false,
            },
        );
        set_slot_bits(&mut inner.handed_out, offset, chunk.word_size(), true);
    }

    fn clear_handed_out(&self, inner: &mut PoolInner, chunk: &Chunk) {
        let offset = self.word_offset(chunk);
        let first_slot = offset / MIN_CHUNK_WORD_SIZE;
        let slots = chunk.word_size() / MIN_CHUNK_WORD_SIZE;
        for slot in first_slot..first_slot + slots {
            debug_assert!(
                inner.handed_out.contains(slot),
                "chunk at {:p} returned twice",
                chunk.base()
            );
        }
        set_slot_bits(&mut inner.handed_out, offset, chunk.word_size(), false);
    }

    fn owns(&self, chunk: &Chunk) -> bool {
        let addr = chunk.base().as_ptr() as usize;
        let base = self.base.as_ptr() as usize;
        addr >= base
            && addr < base + self.reserved_words * BYTES_PER_WORD
            && (addr - base) % (chunk.word_size() * BYTES_PER_WORD) == 0
    }

    fn word_offset(&self, chunk: &Chunk) -> usize {
        (chunk.base().as_ptr() as usize - self.base.as_ptr() as usize) / BYTES_PER_WORD
    }

    fn ptr_at(&self, word_offset: usize) -> NonNull<Word> {
        debug_assert!(word_offset < self.reserved_words);
        // Safety: in-bounds offset from a non-null reservation base.
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(word_offset)) }
    }

    fn byte_ptr(&self, chunk: &Chunk, word_offset_in_chunk: usize) -> NonNull<u8> {
        // Safety: in-bounds offset within the chunk.
        unsafe {
            NonNull::new_unchecked(chunk.base().as_ptr().add(word_offset_in_chunk)).cast::<u8>()
        }
    }
}

impl Drop for ChunkPool {
    fn drop(&mut self) {
        // All arenas hold an Arc to the pool, so by now every chunk is back
        // in the free lists. Give their commit charge back to the limiter
        // (it may outlive this pool), then drop the reservation wholesale.
        let committed_free: usize = {
            let inner = self.inner.lock().unwrap();
            inner
                .free_lists
                .iter()
                .flatten()
                .map(Chunk::committed_words)
                .sum()
        };
        self.limiter.uncommit(committed_free);
        // Safety: the reservation is wholly ours and no longer referenced.
        unsafe {
            drop(PlatformVmOps::release(
                self.base.cast::<u8>(),
                self.reserved_words * BYTES_PER_WORD,
            ));
        }
    }
}

fn round_up(value: usize, granule: usize) -> usize {
    debug_assert!(granule.is_power_of_two());
    value.next_multiple_of(granule)
}

fn set_slot_bits(mask: &mut FixedBitSet, word_offset: usize, word_size: usize, value: bool) {
    let first_slot = word_offset / MIN_CHUNK_WORD_SIZE;
    let slots = word_size / MIN_CHUNK_WORD_SIZE;
    mask.set_range(first_slot..first_slot + slots, value);
}

fn take_free_chunk(
    inner: &mut PoolInner,
    word_offset: usize,
    level: ChunkLevel,
    base: NonNull<Word>,
) -> Option<Chunk> {
    let idx = inner.free_lists[level].iter().position(|c| {
        (c.base().as_ptr() as usize - base.as_ptr() as usize) / BYTES_PER_WORD == word_offset
    })?;
    Some(inner.free_lists[level].swap_remove(idx))
}
