//! Boundary-tagged word arena.
//!
//! The arena is one fixed-length run of 32-bit words. Every block starts
//! with a header word and ends with a footer word, both encoding
//! `(size_in_words << 1) | free_bit`. Keeping the two identical lets
//! `release` find the previous block by reading the word just before a
//! header, so coalescing only ever looks at two neighbours.
//!
//! ```text
//! [ prologue | hdr payload.. ftr | hdr payload.. ftr | ... | epilogue ]
//!   word 0     FIRST_BLOCK                                  end()
//! ```
//!
//! Blocks are identified by the word index of their header. Nothing outside
//! this module sees a pointer into the arena, which is what lets the
//! compactor move blocks around while the handle table only stores indices.

use log::trace;

use crate::{MemError, Result};

/// Bytes per arena word.
pub const WORD_SIZE: usize = 4;
/// Header + footer.
pub const TAG_WORDS: usize = 2;
/// Smallest block worth splitting off: both tags and one payload word.
pub const MIN_BLOCK_WORDS: usize = TAG_WORDS + 1;
/// Word index of the first real block, right after the prologue sentinel.
pub const FIRST_BLOCK: usize = 1;
/// Largest block size a tag can encode.
pub const MAX_BLOCK_WORDS: usize = (u32::MAX >> 1) as usize;

const FREE_BIT: u32 = 1;

#[inline(always)]
fn pack(words: usize, free: bool) -> u32 {
    debug_assert!(words <= MAX_BLOCK_WORDS);
    ((words as u32) << 1) | free as u32
}

#[inline(always)]
fn tag_words(tag: u32) -> usize {
    (tag >> 1) as usize
}

#[inline(always)]
fn tag_free(tag: u32) -> bool {
    tag & FREE_BIT != 0
}

/// Number of words the usable region needs for a request of `bytes`.
#[inline]
pub fn usable_words_for(bytes: usize) -> usize {
    bytes.div_ceil(WORD_SIZE) + TAG_WORDS
}

/// Payload words for a request of `bytes`; never zero.
#[inline]
pub fn payload_words_for(bytes: usize) -> usize {
    bytes.div_ceil(WORD_SIZE).max(1)
}

/// One block as seen by a layout walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    /// Word index of the header.
    pub word: usize,
    /// Size including both tags.
    pub words: usize,
    pub free: bool,
}

impl BlockInfo {
    pub fn payload_words(&self) -> usize {
        self.words - TAG_WORDS
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FreeStats {
    pub total_words: usize,
    pub blocks: usize,
    pub biggest_words: usize,
}

impl FreeStats {
    /// `1 - biggest / total`, zero when free space is one run (or empty).
    pub fn fragmentation(&self) -> f64 {
        if self.total_words == 0 || self.biggest_words >= self.total_words {
            return 0.0;
        }
        1.0 - self.biggest_words as f64 / self.total_words as f64
    }
}

#[derive(Debug)]
pub struct Arena {
    words: Box<[u32]>,
    free_words: usize,
    free_blocks: usize,
}

impl Arena {
    /// Creates an arena whose single free block can hold `bytes` of payload.
    pub fn new(bytes: usize) -> Self {
        let usable = usable_words_for(bytes).max(MIN_BLOCK_WORDS);
        let total = usable + 2;

        let mut words = vec![0u32; total].into_boxed_slice();
        words[0] = pack(1, false);
        words[total - 1] = pack(0, false);

        let mut arena = Self {
            words,
            free_words: usable,
            free_blocks: 1,
        };
        arena.write_tags(FIRST_BLOCK, usable, true);
        arena
    }

    /// Word index of the epilogue sentinel.
    #[inline]
    pub fn end(&self) -> usize {
        self.words.len() - 1
    }

    /// Words between the two sentinels.
    #[inline]
    pub fn usable_words(&self) -> usize {
        self.end() - FIRST_BLOCK
    }

    #[inline]
    pub fn free_words(&self) -> usize {
        self.free_words
    }

    #[inline]
    pub fn free_blocks(&self) -> usize {
        self.free_blocks
    }

    #[inline]
    fn write_tags(&mut self, word: usize, words: usize, free: bool) {
        let tag = pack(words, free);
        self.words[word] = tag;
        self.words[word + words - 1] = tag;
    }

    /// Size in words of the block whose header is at `word`.
    #[inline]
    pub fn block_words(&self, word: usize) -> usize {
        tag_words(self.words[word])
    }

    #[inline]
    pub fn is_free(&self, word: usize) -> bool {
        tag_free(self.words[word])
    }

    /// First-fit reservation of `bytes` of payload.
    ///
    /// Returns the header index of the reserved block. The payload is zeroed.
    pub fn reserve(&mut self, bytes: usize) -> Result<usize> {
        let needed = payload_words_for(bytes) + TAG_WORDS;
        if needed > MAX_BLOCK_WORDS {
            return Err(MemError::OutOfMemory);
        }

        let end = self.end();
        let mut word = FIRST_BLOCK;
        while word < end {
            let tag = self.words[word];
            let size = tag_words(tag);
            debug_assert!(size >= TAG_WORDS, "corrupt block at {word}");

            if tag_free(tag) && size >= needed {
                let taken = self.carve(word, size, needed);
                self.words[word + 1..word + taken - 1].fill(0);
                trace!(
                    "arena: reserved {} words at word {} ({} free)",
                    taken, word, self.free_words
                );
                return Ok(word);
            }
            word += size;
        }

        trace!("arena: no block of {needed} words");
        Err(MemError::OutOfMemory)
    }

    /// Marks the free block at `word` as used, splitting off the tail when it
    /// is big enough to stand alone. Returns the words handed out.
    fn carve(&mut self, word: usize, size: usize, needed: usize) -> usize {
        let rest = size - needed;
        if rest >= MIN_BLOCK_WORDS {
            self.write_tags(word, needed, false);
            self.write_tags(word + needed, rest, true);
            self.free_words -= needed;
            needed
        } else {
            self.write_tags(word, size, false);
            self.free_words -= size;
            self.free_blocks -= 1;
            size
        }
    }

    /// Returns the block at `word` to the free space, merging it with free
    /// neighbours. Returns the size of the released block itself.
    pub fn release(&mut self, word: usize) -> usize {
        debug_assert!(word >= FIRST_BLOCK && word < self.end());
        debug_assert!(!self.is_free(word), "double release of {word}");

        let size = self.block_words(word);
        self.free_words += size;
        self.free_blocks += 1;

        let mut start = word;
        let mut words = size;

        // the epilogue is tagged used, so this never runs past the end
        let next = self.words[word + size];
        if tag_free(next) {
            words += tag_words(next);
            self.free_blocks -= 1;
        }

        // the word before a header is the previous footer (or the prologue)
        let prev = self.words[word - 1];
        if tag_free(prev) {
            let prev_words = tag_words(prev);
            start -= prev_words;
            words += prev_words;
            self.free_blocks -= 1;
        }

        self.write_tags(start, words, true);
        trace!(
            "arena: released {} words at word {} (merged run {}..{})",
            size,
            word,
            start,
            start + words
        );
        size
    }

    pub fn payload(&self, word: usize) -> &[u32] {
        let size = self.block_words(word);
        &self.words[word + 1..word + size - 1]
    }

    pub fn payload_mut(&mut self, word: usize) -> &mut [u32] {
        let size = self.block_words(word);
        &mut self.words[word + 1..word + size - 1]
    }

    /// Walks every block between the sentinels.
    pub fn blocks(&self) -> Blocks<'_> {
        Blocks {
            arena: self,
            word: FIRST_BLOCK,
        }
    }

    pub fn free_stats(&self) -> FreeStats {
        let mut stats = FreeStats::default();
        for block in self.blocks().filter(|b| b.free) {
            stats.total_words += block.words;
            stats.blocks += 1;
            stats.biggest_words = stats.biggest_words.max(block.words);
        }
        debug_assert_eq!(stats.total_words, self.free_words);
        debug_assert_eq!(stats.blocks, self.free_blocks);
        stats
    }

    /// Checks every boundary-tag invariant.
    pub fn verify(&self) -> std::result::Result<(), &'static str> {
        if self.words[0] != pack(1, false) {
            return Err("prologue sentinel overwritten");
        }
        if self.words[self.end()] != pack(0, false) {
            return Err("epilogue sentinel overwritten");
        }

        let end = self.end();
        let mut word = FIRST_BLOCK;
        let mut prev_free = false;
        let mut free_words = 0;
        let mut free_blocks = 0;
        while word < end {
            let header = self.words[word];
            let size = tag_words(header);
            if size < TAG_WORDS {
                return Err("block smaller than its tags");
            }
            if word + size > end {
                return Err("block runs into the epilogue");
            }
            if self.words[word + size - 1] != header {
                return Err("header and footer disagree");
            }
            let free = tag_free(header);
            if free && prev_free {
                return Err("adjacent free blocks were not coalesced");
            }
            if free {
                free_words += size;
                free_blocks += 1;
            }
            prev_free = free;
            word += size;
        }

        if word != end {
            return Err("block walk overshot the epilogue");
        }
        if free_words != self.free_words || free_blocks != self.free_blocks {
            return Err("free counters out of sync");
        }
        Ok(())
    }

    // ── Compaction support ───────────────────────────────────────────

    /// Offset pass: writes each live block's destination into its footer.
    ///
    /// Until [`Arena::slide`] runs, footers of live blocks hold relocation
    /// records instead of tags. Headers stay valid so walks still work.
    pub fn stage_relocations(&mut self) {
        let end = self.end();
        let mut word = FIRST_BLOCK;
        let mut shift = 0;
        while word < end {
            let tag = self.words[word];
            let size = tag_words(tag);
            if tag_free(tag) {
                shift += size;
            } else {
                self.words[word + size - 1] = ((word - shift) as u32) << 1;
            }
            word += size;
        }
    }

    /// Destination recorded by [`Arena::stage_relocations`] for a live block.
    #[inline]
    pub fn relocation(&self, word: usize) -> usize {
        debug_assert!(!self.is_free(word));
        let size = self.block_words(word);
        tag_words(self.words[word + size - 1])
    }

    /// Slide pass: moves live blocks down to their staged destinations and
    /// leaves a single free block at the end.
    ///
    /// Blocks are moved in ascending order, so a copy never clobbers data
    /// that has not been moved yet.
    pub fn slide(&mut self) {
        let end = self.end();
        let mut word = FIRST_BLOCK;
        let mut dest = FIRST_BLOCK;
        while word < end {
            let tag = self.words[word];
            let size = tag_words(tag);
            if !tag_free(tag) {
                let target = self.relocation(word);
                debug_assert_eq!(target, dest);
                if target != word {
                    self.words.copy_within(word..word + size, target);
                }
                self.write_tags(target, size, false);
                dest = target + size;
            }
            word += size;
        }

        let free = end - dest;
        debug_assert_eq!(free, self.free_words);
        if free > 0 {
            self.write_tags(dest, free, true);
            self.free_blocks = 1;
        } else {
            self.free_blocks = 0;
        }
        self.free_words = free;
    }
}

pub struct Blocks<'a> {
    arena: &'a Arena,
    word: usize,
}

impl Iterator for Blocks<'_> {
    type Item = BlockInfo;

    fn next(&mut self) -> Option<BlockInfo> {
        if self.word >= self.arena.end() {
            return None;
        }
        let tag = self.arena.words[self.word];
        let info = BlockInfo {
            word: self.word,
            words: tag_words(tag),
            free: tag_free(tag),
        };
        // a zero-sized block would loop forever; stop the walk instead
        if info.words == 0 {
            self.word = self.arena.end();
        } else {
            self.word += info.words;
        }
        Some(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Small deterministic generator so the sequences are reproducible.
    struct XorShift(u64);

    impl XorShift {
        fn next(&mut self) -> u64 {
            let mut x = self.0;
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            self.0 = x;
            x
        }
    }

    #[test]
    fn fresh_arena_is_one_free_block() {
        let arena = Arena::new(1024);
        let blocks: Vec<_> = arena.blocks().collect();
        assert_eq!(blocks.len(), 1);
        assert!(blocks[0].free);
        assert_eq!(blocks[0].word, FIRST_BLOCK);
        assert_eq!(blocks[0].words, 256 + TAG_WORDS);
        assert_eq!(arena.usable_words(), 258);
        arena.verify().unwrap();
    }

    #[test]
    fn reserve_rounds_up_and_splits() {
        let mut arena = Arena::new(1024);
        let a = arena.reserve(1).unwrap();
        let b = arena.reserve(5).unwrap();
        assert_eq!(a, FIRST_BLOCK);
        assert_eq!(arena.block_words(a), 3);
        assert_eq!(b, FIRST_BLOCK + 3);
        assert_eq!(arena.block_words(b), 4);
        assert_eq!(arena.payload(b).len(), 2);
        assert_eq!(arena.free_blocks(), 1);
        arena.verify().unwrap();
    }

    #[test]
    fn small_remainder_is_not_split() {
        // 3 payload words + 2 tags = 5 usable words
        let mut arena = Arena::new(12);
        let a = arena.reserve(4).unwrap();
        // 2 words left over: too small for a block, handed out whole
        assert_eq!(arena.block_words(a), 5);
        assert_eq!(arena.free_words(), 0);
        assert_eq!(arena.free_blocks(), 0);
        assert_eq!(arena.payload(a).len(), 3);
        assert_eq!(arena.reserve(4), Err(MemError::OutOfMemory));
        arena.verify().unwrap();
    }

    #[test]
    fn reserve_fails_fast_when_nothing_fits() {
        let mut arena = Arena::new(16);
        assert_eq!(arena.reserve(17), Err(MemError::OutOfMemory));
        assert!(arena.reserve(16).is_ok());
        assert_eq!(arena.reserve(1), Err(MemError::OutOfMemory));
    }

    #[test]
    fn first_fit_reuses_earliest_hole() {
        let mut arena = Arena::new(256);
        let a = arena.reserve(8).unwrap();
        let _b = arena.reserve(8).unwrap();
        let c = arena.reserve(8).unwrap();
        let _d = arena.reserve(8).unwrap();
        arena.release(c);
        arena.release(a);

        assert_eq!(arena.reserve(4).unwrap(), a);
        assert_eq!(arena.reserve(8).unwrap(), c);
        arena.verify().unwrap();
    }

    #[test]
    fn release_coalesces_forward_and_backward() {
        let mut arena = Arena::new(256);
        let a = arena.reserve(8).unwrap();
        let b = arena.reserve(8).unwrap();
        let c = arena.reserve(8).unwrap();
        let _d = arena.reserve(8).unwrap();

        arena.release(a);
        arena.release(c);
        assert_eq!(arena.free_blocks(), 3);

        // b sits between two free blocks: all three merge
        arena.release(b);
        assert_eq!(arena.free_blocks(), 2);
        let first = arena.blocks().next().unwrap();
        assert!(first.free);
        assert_eq!(first.words, 3 * 4);
        arena.verify().unwrap();
    }

    #[test]
    fn payload_is_zeroed_on_reserve() {
        let mut arena = Arena::new(64);
        let a = arena.reserve(8).unwrap();
        arena.payload_mut(a).fill(0xdead_beef);
        arena.release(a);
        let b = arena.reserve(8).unwrap();
        assert_eq!(a, b);
        assert!(arena.payload(b).iter().all(|&w| w == 0));
    }

    #[test]
    fn releasing_everything_restores_one_block() {
        let mut rng = XorShift(0x9e37_79b9_7f4a_7c15);
        for _round in 0..20 {
            let mut arena = Arena::new(4096);
            let usable = arena.usable_words();
            let mut live = Vec::new();

            for _ in 0..200 {
                let roll = rng.next();
                if roll % 3 != 0 || live.is_empty() {
                    let bytes = (rng.next() % 64) as usize + 1;
                    if let Ok(word) = arena.reserve(bytes) {
                        live.push(word);
                    }
                } else {
                    let idx = (rng.next() as usize) % live.len();
                    arena.release(live.swap_remove(idx));
                }
                arena.verify().unwrap();
            }

            while let Some(word) = live.pop() {
                arena.release(word);
            }

            let blocks: Vec<_> = arena.blocks().collect();
            assert_eq!(
                blocks,
                vec![BlockInfo {
                    word: FIRST_BLOCK,
                    words: usable,
                    free: true
                }]
            );
            arena.verify().unwrap();
        }
    }

    #[test]
    fn fragmentation_is_zero_for_contiguous_free_space() {
        let mut arena = Arena::new(256);
        let stats = arena.free_stats();
        assert_eq!(stats.fragmentation(), 0.0);

        let a = arena.reserve(8).unwrap();
        let _b = arena.reserve(8).unwrap();
        arena.release(a);
        let stats = arena.free_stats();
        assert_eq!(stats.blocks, 2);
        assert!(stats.biggest_words < stats.total_words);
        assert!(stats.fragmentation() > 0.0 && stats.fragmentation() < 1.0);
    }

    #[test]
    fn slide_packs_live_blocks_and_keeps_contents() {
        let mut arena = Arena::new(256);
        let a = arena.reserve(8).unwrap();
        let b = arena.reserve(8).unwrap();
        let c = arena.reserve(4).unwrap();
        let d = arena.reserve(12).unwrap();
        arena.payload_mut(b).copy_from_slice(&[11, 22]);
        arena.payload_mut(d).copy_from_slice(&[7, 8, 9]);
        arena.release(a);
        arena.release(c);
        let free_before = arena.free_words();

        arena.stage_relocations();
        let new_b = arena.relocation(b);
        let new_d = arena.relocation(d);
        assert_eq!(new_b, FIRST_BLOCK);
        assert_eq!(new_d, FIRST_BLOCK + 4);
        arena.slide();

        assert_eq!(arena.payload(new_b), &[11, 22]);
        assert_eq!(arena.payload(new_d), &[7, 8, 9]);
        assert_eq!(arena.free_blocks(), 1);
        assert_eq!(arena.free_words(), free_before);
        let last = arena.blocks().last().unwrap();
        assert!(last.free);
        assert_eq!(last.words, free_before);
        arena.verify().unwrap();
    }

    #[test]
    fn slide_on_full_arena_leaves_no_free_block() {
        let mut arena = Arena::new(8);
        let a = arena.reserve(8).unwrap();
        assert_eq!(arena.free_words(), 0);
        arena.stage_relocations();
        assert_eq!(arena.relocation(a), a);
        arena.slide();
        assert_eq!(arena.free_blocks(), 0);
        arena.verify().unwrap();
    }
}
