//! Fixed-capacity block arena
//!
//! The arena owns one contiguous byte region and carves it into
//! paragraph-aligned blocks. Every block starts with a 16-byte header whose
//! first word packs the payload size in paragraphs with a free bit and a
//! terminal bit. There is no stored next pointer: the next block always
//! starts right after the current block's payload. The last paragraph of the
//! region holds a terminal sentinel that is never allocated or merged.
//!
//! Freeing only flips the free bit. Adjacent free blocks are merged lazily by
//! the next scan that walks over them (`allocate`, `resize`, `largest_free`).
//!
//! Pointers handed out are byte offsets of the payload within the region, so
//! the arena never hands out raw addresses and blocks stay valid for the
//! arena's whole lifetime.

use std::fmt;

use serde::Serialize;
use thiserror::Error;
use tracing::trace;

/// Alignment unit for blocks and sizes
pub const PARAGRAPH: usize = 16;

/// Size of a block header
pub const BLOCK_HEADER_SIZE: usize = PARAGRAPH;

/// Smallest capacity that still fits one block and the sentinel
pub const MIN_CAPACITY: usize = 4 * PARAGRAPH;

/// Largest capacity; block sizes must fit the 30-bit size field
pub const MAX_CAPACITY: usize = 1 << 30;

/// Default number of paragraphs a leftover must exceed to be split off
pub const DEFAULT_SPLIT_THRESHOLD: u32 = 1;

const FREE_BIT: u32 = 1 << 31;
const TERMINAL_BIT: u32 = 1 << 30;
const SIZE_MASK: u32 = TERMINAL_BIT - 1;

/// Errors reported by the arena
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArenaError {
    /// No free run is large enough, even after merging
    #[error("Arena exhausted: cannot allocate {requested} bytes")]
    Exhausted {
        /// Requested size in bytes
        requested: usize,
    },

    /// The pointer does not name a live block
    #[error("Invalid arena pointer: {0}")]
    InvalidPointer(ArenaPtr),

    /// Capacity is not a paragraph multiple or is out of range
    #[error("Invalid arena capacity: {0} bytes")]
    InvalidCapacity(usize),

    /// The backing region could not be reserved
    #[error("Cannot reserve {capacity} bytes for the arena")]
    Reserve {
        /// Requested capacity in bytes
        capacity: usize,
    },
}

/// Result alias for arena operations
pub type ArenaResult<T> = Result<T, ArenaError>;

/// Offset of a block payload within its arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ArenaPtr(u32);

impl ArenaPtr {
    /// Wrap a raw payload offset
    pub const fn from_raw(offset: u32) -> Self {
        Self(offset)
    }

    /// Raw payload offset
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Payload offset as an index
    pub const fn offset(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ArenaPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Aggregate arena statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ArenaInfo {
    /// Number of live blocks
    pub blocks_in_use: usize,
    /// Sum of the payload bytes of all free blocks
    pub free_bytes: usize,
}

/// One block as seen by [`Arena::blocks`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BlockInfo {
    /// Payload pointer
    pub ptr: ArenaPtr,
    /// Payload size in bytes
    pub size: usize,
    /// Whether the block is free
    pub free: bool,
}

/// Round a byte count up to whole paragraphs (at least one)
fn paragraphs_for(size: usize) -> usize {
    size.div_ceil(PARAGRAPH).max(1)
}

/// A fixed-capacity paragraph allocator
pub struct Arena {
    bytes: Box<[u8]>,
    info: ArenaInfo,
    split_threshold: u32,
}

impl Arena {
    /// Create an arena of `capacity` bytes with the default split threshold
    pub fn new(capacity: usize) -> ArenaResult<Self> {
        Self::with_split_threshold(capacity, DEFAULT_SPLIT_THRESHOLD)
    }

    /// Create an arena of `capacity` bytes
    ///
    /// A free leftover is split off into its own block only when it is larger
    /// than `split_threshold` paragraphs; smaller leftovers stay with the
    /// allocation.
    pub fn with_split_threshold(capacity: usize, split_threshold: u32) -> ArenaResult<Self> {
        if capacity % PARAGRAPH != 0 || !(MIN_CAPACITY..=MAX_CAPACITY).contains(&capacity) {
            return Err(ArenaError::InvalidCapacity(capacity));
        }

        let mut storage = Vec::new();
        storage
            .try_reserve_exact(capacity)
            .map_err(|_| ArenaError::Reserve { capacity })?;
        storage.resize(capacity, 0);

        let mut arena = Self {
            bytes: storage.into_boxed_slice(),
            info: ArenaInfo::default(),
            split_threshold,
        };

        let first_paras = (capacity - 2 * BLOCK_HEADER_SIZE) / PARAGRAPH;
        arena.write_header(0, FREE_BIT | first_paras as u32);
        arena.write_header(capacity - BLOCK_HEADER_SIZE, TERMINAL_BIT);
        arena.info.free_bytes = first_paras * PARAGRAPH;
        Ok(arena)
    }

    /// Total size of the region in bytes
    pub fn capacity(&self) -> usize {
        self.bytes.len()
    }

    /// Current statistics
    pub fn info(&self) -> ArenaInfo {
        self.info
    }

    /// Split threshold in paragraphs
    pub fn split_threshold(&self) -> u32 {
        self.split_threshold
    }

    // ===== Header access =====

    fn header(&self, at: usize) -> u32 {
        u32::from_le_bytes([
            self.bytes[at],
            self.bytes[at + 1],
            self.bytes[at + 2],
            self.bytes[at + 3],
        ])
    }

    fn write_header(&mut self, at: usize, word: u32) {
        self.bytes[at..at + 4].copy_from_slice(&word.to_le_bytes());
    }

    fn clear_header(&mut self, at: usize) {
        self.bytes[at..at + BLOCK_HEADER_SIZE].fill(0);
    }

    fn paras_at(&self, at: usize) -> usize {
        (self.header(at) & SIZE_MASK) as usize
    }

    fn is_free(&self, at: usize) -> bool {
        self.header(at) & FREE_BIT != 0
    }

    fn is_terminal(&self, at: usize) -> bool {
        self.header(at) & TERMINAL_BIT != 0
    }

    fn next_block(&self, at: usize) -> usize {
        at + BLOCK_HEADER_SIZE + self.paras_at(at) * PARAGRAPH
    }

    /// Merge every free block that directly follows the free block at `at`
    fn coalesce(&mut self, at: usize) {
        let mut paras = self.paras_at(at);
        loop {
            let next = at + BLOCK_HEADER_SIZE + paras * PARAGRAPH;
            if self.is_terminal(next) || !self.is_free(next) {
                break;
            }
            paras += self.paras_at(next) + 1;
            self.clear_header(next);
            self.info.free_bytes += BLOCK_HEADER_SIZE;
        }
        self.write_header(at, FREE_BIT | paras as u32);
    }

    /// Claim `need` paragraphs of the free block at `at`
    ///
    /// The caller has checked that the block is large enough.
    fn claim(&mut self, at: usize, need: usize) {
        let have = self.paras_at(at);
        let leftover = have - need;
        if leftover > self.split_threshold as usize {
            self.write_header(at, need as u32);
            let rest = at + BLOCK_HEADER_SIZE + need * PARAGRAPH;
            self.write_header(rest, FREE_BIT | (leftover - 1) as u32);
            self.info.free_bytes -= (need + 1) * PARAGRAPH;
        } else {
            self.write_header(at, have as u32);
            self.info.free_bytes -= have * PARAGRAPH;
        }
        self.info.blocks_in_use += 1;
    }

    /// Walk the chain to the live block whose payload is `ptr`
    fn find_live(&self, ptr: ArenaPtr) -> ArenaResult<usize> {
        let offset = ptr.offset();
        if offset < BLOCK_HEADER_SIZE
            || offset % PARAGRAPH != 0
            || offset >= self.capacity() - BLOCK_HEADER_SIZE
        {
            return Err(ArenaError::InvalidPointer(ptr));
        }
        let target = offset - BLOCK_HEADER_SIZE;
        let mut at = 0;
        while at < target && !self.is_terminal(at) {
            at = self.next_block(at);
        }
        if at != target || self.is_terminal(at) || self.is_free(at) {
            return Err(ArenaError::InvalidPointer(ptr));
        }
        Ok(at)
    }

    /// Header position of a live block, checked without walking the chain
    fn live_header(&self, ptr: ArenaPtr) -> ArenaResult<usize> {
        let offset = ptr.offset();
        if offset < BLOCK_HEADER_SIZE
            || offset % PARAGRAPH != 0
            || offset >= self.capacity() - BLOCK_HEADER_SIZE
        {
            return Err(ArenaError::InvalidPointer(ptr));
        }
        let at = offset - BLOCK_HEADER_SIZE;
        let word = self.header(at);
        // Live blocks always hold at least one paragraph; a zero word is a merged-away header
        if word & (FREE_BIT | TERMINAL_BIT) != 0
            || word & SIZE_MASK == 0
            || self.next_block(at) > self.capacity() - BLOCK_HEADER_SIZE
        {
            return Err(ArenaError::InvalidPointer(ptr));
        }
        Ok(at)
    }

    // ===== Allocation =====

    /// Allocate at least `size` bytes of zeroed payload
    ///
    /// First fit from the start of the region. Free runs are merged as the
    /// scan passes over them.
    pub fn allocate(&mut self, size: usize) -> ArenaResult<ArenaPtr> {
        if size > self.capacity() {
            return Err(ArenaError::Exhausted { requested: size });
        }
        let need = paragraphs_for(size);
        let mut at = 0;
        while !self.is_terminal(at) {
            if self.is_free(at) {
                self.coalesce(at);
                if self.paras_at(at) >= need {
                    self.claim(at, need);
                    let payload = at + BLOCK_HEADER_SIZE;
                    let end = payload + self.paras_at(at) * PARAGRAPH;
                    self.bytes[payload..end].fill(0);
                    trace!(ptr = payload, paragraphs = need, "arena allocate");
                    return Ok(ArenaPtr(payload as u32));
                }
            }
            at = self.next_block(at);
        }
        trace!(requested = size, "arena exhausted");
        Err(ArenaError::Exhausted { requested: size })
    }

    /// Release a live block
    ///
    /// The block is only marked free; merging happens on a later scan.
    pub fn free(&mut self, ptr: ArenaPtr) -> ArenaResult<()> {
        let at = self.find_live(ptr)?;
        let paras = self.paras_at(at);
        self.write_header(at, FREE_BIT | paras as u32);
        self.info.blocks_in_use -= 1;
        self.info.free_bytes += paras * PARAGRAPH;
        trace!(ptr = ptr.raw(), paragraphs = paras, "arena free");
        Ok(())
    }

    /// Change the size of a live block
    ///
    /// The block stays where it is when its current size plus any free run
    /// directly after it covers `new_size`. Otherwise a new block is
    /// allocated, the payload copied, and only then is the old block freed.
    pub fn resize(&mut self, ptr: ArenaPtr, new_size: usize) -> ArenaResult<ArenaPtr> {
        let at = self.find_live(ptr)?;
        let need = paragraphs_for(new_size);
        let mut have = self.paras_at(at);
        let old_len = have * PARAGRAPH;

        if have < need {
            let next = self.next_block(at);
            if !self.is_terminal(next) && self.is_free(next) {
                self.coalesce(next);
                let run = have + 1 + self.paras_at(next);
                if run >= need {
                    self.info.free_bytes -= self.paras_at(next) * PARAGRAPH;
                    self.clear_header(next);
                    self.write_header(at, run as u32);
                    have = run;
                }
            }
        }

        if have >= need {
            let leftover = have - need;
            if leftover > self.split_threshold as usize {
                self.write_header(at, need as u32);
                let rest = at + BLOCK_HEADER_SIZE + need * PARAGRAPH;
                self.write_header(rest, FREE_BIT | (leftover - 1) as u32);
                self.info.free_bytes += (leftover - 1) * PARAGRAPH;
            }
            // Bytes gained from the merged run held a header and stale data
            let start = at + BLOCK_HEADER_SIZE;
            let new_len = need * PARAGRAPH;
            if new_len > old_len {
                self.bytes[start + old_len..start + new_len].fill(0);
            }
            trace!(ptr = ptr.raw(), paragraphs = need, "arena resize in place");
            return Ok(ptr);
        }

        let moved = self.allocate(new_size)?;
        self.bytes
            .copy_within(ptr.offset()..ptr.offset() + old_len, moved.offset());
        self.free(ptr)?;
        trace!(from = ptr.raw(), to = moved.raw(), "arena resize moved");
        Ok(moved)
    }

    /// Size in bytes of the largest free run, merging as it scans
    pub fn largest_free(&mut self) -> usize {
        let mut largest = 0;
        let mut at = 0;
        while !self.is_terminal(at) {
            if self.is_free(at) {
                self.coalesce(at);
                largest = largest.max(self.paras_at(at) * PARAGRAPH);
            }
            at = self.next_block(at);
        }
        largest
    }

    // ===== Payload access =====

    /// Payload size of a live block in bytes
    pub fn block_size(&self, ptr: ArenaPtr) -> ArenaResult<usize> {
        let at = self.live_header(ptr)?;
        Ok(self.paras_at(at) * PARAGRAPH)
    }

    /// Borrow the whole payload of a live block
    pub fn payload(&self, ptr: ArenaPtr) -> ArenaResult<&[u8]> {
        let at = self.live_header(ptr)?;
        let start = at + BLOCK_HEADER_SIZE;
        Ok(&self.bytes[start..start + self.paras_at(at) * PARAGRAPH])
    }

    /// Mutably borrow the whole payload of a live block
    pub fn payload_mut(&mut self, ptr: ArenaPtr) -> ArenaResult<&mut [u8]> {
        let at = self.live_header(ptr)?;
        let start = at + BLOCK_HEADER_SIZE;
        let end = start + self.paras_at(at) * PARAGRAPH;
        Ok(&mut self.bytes[start..end])
    }

    /// Snapshot of every block in address order, excluding the sentinel
    pub fn blocks(&self) -> Vec<BlockInfo> {
        let mut out = Vec::new();
        let mut at = 0;
        while !self.is_terminal(at) {
            out.push(BlockInfo {
                ptr: ArenaPtr((at + BLOCK_HEADER_SIZE) as u32),
                size: self.paras_at(at) * PARAGRAPH,
                free: self.is_free(at),
            });
            at = self.next_block(at);
        }
        out
    }
}

impl fmt::Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena")
            .field("capacity", &self.capacity())
            .field("info", &self.info)
            .field("split_threshold", &self.split_threshold)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: usize = 1 << 20;

    #[test]
    fn test_new_arena() {
        let arena = Arena::new(MIB).unwrap();
        assert_eq!(arena.info().blocks_in_use, 0);
        assert_eq!(arena.info().free_bytes, MIB - 32);
        assert_eq!(arena.blocks().len(), 1);
    }

    #[test]
    fn test_invalid_capacity() {
        assert_eq!(Arena::new(100).unwrap_err(), ArenaError::InvalidCapacity(100));
        assert_eq!(Arena::new(32).unwrap_err(), ArenaError::InvalidCapacity(32));
        assert!(Arena::new(MIN_CAPACITY).is_ok());
    }

    #[test]
    fn test_allocate_rounds_to_paragraphs() {
        let mut arena = Arena::new(MIB).unwrap();
        let a = arena.allocate(100).unwrap();
        let b = arena.allocate(1).unwrap();
        let c = arena.allocate(0).unwrap();
        assert_eq!(a.offset(), 16);
        assert_eq!(arena.block_size(a).unwrap(), 112);
        assert_eq!(b.offset(), 16 + 112 + 16);
        assert_eq!(arena.block_size(c).unwrap(), 16);
        assert_eq!(arena.info().blocks_in_use, 3);
        assert_eq!(arena.info().free_bytes, MIB - 32 - (112 + 16 + 16 + 3 * 16));
    }

    #[test]
    fn test_free_is_lazy_and_allocate_coalesces() {
        let mut arena = Arena::new(MIB).unwrap();
        let a = arena.allocate(100).unwrap();
        let b = arena.allocate(50).unwrap();
        arena.free(a).unwrap();
        arena.free(b).unwrap();
        // Three free blocks until a scan passes over them
        assert_eq!(arena.blocks().iter().filter(|b| b.free).count(), 3);

        let c = arena.allocate(140).unwrap();
        assert_eq!(c, a);
        assert_eq!(arena.info().blocks_in_use, 1);
    }

    #[test]
    fn test_allocation_skips_undersized_hole() {
        let mut arena = Arena::new(MIB).unwrap();
        let a = arena.allocate(100).unwrap();
        let b = arena.allocate(50).unwrap();
        arena.free(a).unwrap();
        let c = arena.allocate(140).unwrap();
        let b_range = b.offset()..b.offset() + arena.block_size(b).unwrap();
        assert!(!b_range.contains(&c.offset()));
        assert!(c.offset() > b.offset());
    }

    #[test]
    fn test_small_leftover_is_not_split() {
        let mut arena = Arena::new(MIB).unwrap();
        let a = arena.allocate(64).unwrap();
        let _guard = arena.allocate(16).unwrap();
        arena.free(a).unwrap();
        // 4 paragraphs free; 3 requested leaves 1, which does not exceed the threshold
        let b = arena.allocate(48).unwrap();
        assert_eq!(b, a);
        assert_eq!(arena.block_size(b).unwrap(), 64);
    }

    #[test]
    fn test_zero_split_threshold_splits_every_leftover() {
        let mut arena = Arena::with_split_threshold(MIB, 0).unwrap();
        let a = arena.allocate(64).unwrap();
        let _guard = arena.allocate(16).unwrap();
        arena.free(a).unwrap();
        let b = arena.allocate(48).unwrap();
        assert_eq!(arena.block_size(b).unwrap(), 48);
    }

    #[test]
    fn test_invalid_free() {
        let mut arena = Arena::new(MIB).unwrap();
        let a = arena.allocate(32).unwrap();
        assert!(matches!(
            arena.free(ArenaPtr::from_raw(a.raw() + 16)),
            Err(ArenaError::InvalidPointer(_))
        ));
        assert!(arena.free(ArenaPtr::from_raw(7)).is_err());
        arena.free(a).unwrap();
        assert_eq!(arena.free(a), Err(ArenaError::InvalidPointer(a)));
    }

    #[test]
    fn test_exhaustion() {
        let mut arena = Arena::new(256).unwrap();
        assert!(arena.allocate(224).is_ok());
        assert_eq!(
            arena.allocate(1),
            Err(ArenaError::Exhausted { requested: 1 })
        );
        assert_eq!(
            arena.allocate(1 << 21),
            Err(ArenaError::Exhausted { requested: 1 << 21 })
        );
    }

    #[test]
    fn test_resize_in_place_and_moved() {
        let mut arena = Arena::new(MIB).unwrap();
        let a = arena.allocate(32).unwrap();
        arena.payload_mut(a).unwrap()[..4].copy_from_slice(&[1, 2, 3, 4]);

        // Grows into the free tail
        let grown = arena.resize(a, 200).unwrap();
        assert_eq!(grown, a);
        assert_eq!(arena.block_size(a).unwrap(), 208);

        // Shrinks in place
        let shrunk = arena.resize(a, 16).unwrap();
        assert_eq!(shrunk, a);
        assert_eq!(arena.block_size(a).unwrap(), 16);

        // Blocked by a live neighbour: moves and keeps the payload
        let _blocker = arena.allocate(16).unwrap();
        let moved = arena.resize(a, 64).unwrap();
        assert_ne!(moved, a);
        assert_eq!(&arena.payload(moved).unwrap()[..4], &[1, 2, 3, 4]);
        assert!(arena.payload(a).is_err());
    }

    #[test]
    fn test_resize_growth_is_zeroed() {
        let mut arena = Arena::new(MIB).unwrap();
        let a = arena.allocate(32).unwrap();
        let b = arena.allocate(64).unwrap();
        arena.payload_mut(a).unwrap()[..4].copy_from_slice(&[9, 8, 7, 6]);
        arena.payload_mut(b).unwrap().fill(0xFF);
        arena.free(b).unwrap();

        let grown = arena.resize(a, 112).unwrap();
        assert_eq!(grown, a);
        let payload = arena.payload(a).unwrap();
        assert_eq!(&payload[..4], &[9, 8, 7, 6]);
        assert!(payload[32..112].iter().all(|&byte| byte == 0));
    }

    #[test]
    fn test_largest_free_merges() {
        let mut arena = Arena::new(1024).unwrap();
        let a = arena.allocate(100).unwrap();
        let b = arena.allocate(100).unwrap();
        let before = arena.largest_free();
        arena.free(a).unwrap();
        arena.free(b).unwrap();
        assert_eq!(arena.largest_free(), 1024 - 32);
        assert!(arena.largest_free() > before);
        assert_eq!(arena.info().free_bytes, 1024 - 32);
    }
}
