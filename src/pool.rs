//! Per-connection bump arena.
//!
//! One contiguous region serves every allocation tied to a connection's
//! lifetime. Layout, low to high:
//!
//! ```text
//! [ head allocations | received bytes | free | end allocations ]
//! 0                 head            fill   back           capacity
//! ```
//!
//! The socket reads into the free region (`reserve_tail`); the parser
//! then turns a received prefix into a head allocation in place
//! (`commit_tail`), so request strings never move. On a keep-alive
//! reset, bytes of the next pipelined request that were already received
//! are copy-compacted down to offset zero (`reclaim_keeping_tail_bytes`)
//! and everything else is discarded.
//!
//! Allocation failure is an ordinary `Err`; the caller decides whether
//! that means 413, 500 or a plain close.

use std::str;

/// Default arena size per connection.
pub const DEFAULT_POOL_SIZE: usize = 32 * 1024;

/// The pool cannot satisfy an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exhausted;

/// Rewind point for `reset_to`.
#[derive(Debug, Clone, Copy)]
pub struct Marker {
    head: usize,
}

/// A string interned in the pool, stored as an offset so that the
/// connection's request objects never borrow from themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStr {
    off: u32,
    len: u32,
}

impl PoolStr {
    pub const EMPTY: PoolStr = PoolStr { off: 0, len: 0 };

    pub(crate) fn new(off: usize, len: usize) -> PoolStr {
        PoolStr {
            off: off as u32,
            len: len as u32,
        }
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub(crate) fn offset(&self) -> usize {
        self.off as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Sub-range of this string (used for cookie pairs and query
    /// arguments, which are slices of an already interned value).
    pub(crate) fn slice(&self, start: usize, len: usize) -> PoolStr {
        debug_assert!(start + len <= self.len as usize);
        PoolStr {
            off: self.off + start as u32,
            len: len as u32,
        }
    }

    pub fn get<'p>(&self, pool: &'p Pool) -> &'p str {
        // Interned strings are utf-8 checked on creation.
        str::from_utf8(&pool.buf[self.off as usize..(self.off + self.len) as usize]).unwrap_or("")
    }

    pub fn bytes<'p>(&self, pool: &'p Pool) -> &'p [u8] {
        &pool.buf[self.off as usize..(self.off + self.len) as usize]
    }
}

pub struct Pool {
    buf: Box<[u8]>,
    /// End of head allocations; received bytes start here.
    head: usize,
    /// End of received bytes.
    fill: usize,
    /// Start of end allocations.
    back: usize,
    /// Most recent head allocation, for `realloc_last`.
    last: Option<(usize, usize)>,
}

impl Pool {
    pub fn with_capacity(size: usize) -> Pool {
        Pool {
            buf: vec![0u8; size].into_boxed_slice(),
            head: 0,
            fill: 0,
            back: size,
            last: None,
        }
    }

    /// Free bytes between the received data and the end allocations.
    pub fn free(&self) -> usize {
        self.back - self.fill
    }

    pub fn marker(&self) -> Marker {
        Marker { head: self.head }
    }

    /// Bump allocation from the low end. Fails while received bytes sit
    /// directly after the head region (they would be overwritten) or
    /// when the free region is too small.
    pub fn alloc_from_head(&mut self, n: usize) -> Result<usize, Exhausted> {
        if self.fill != self.head || self.head + n > self.back {
            return Err(Exhausted);
        }
        let off = self.head;
        self.head += n;
        self.fill = self.head;
        self.last = Some((off, n));
        Ok(off)
    }

    /// Grows (or shrinks) an allocation in place when it is the most
    /// recent head allocation; otherwise allocates fresh and copies.
    pub fn realloc_last(
        &mut self,
        off: usize,
        old_n: usize,
        new_n: usize,
    ) -> Result<usize, Exhausted> {
        if self.last == Some((off, old_n)) && self.fill == self.head {
            if off + new_n > self.back {
                return Err(Exhausted);
            }
            self.head = off + new_n;
            self.fill = self.head;
            self.last = Some((off, new_n));
            return Ok(off);
        }
        let dst = self.alloc_from_head(new_n)?;
        let n = old_n.min(new_n);
        self.buf.copy_within(off..off + n, dst);
        Ok(dst)
    }

    /// Allocation from the high end; never conflicts with received bytes.
    pub fn alloc_from_end(&mut self, n: usize) -> Result<usize, Exhausted> {
        if self.back - self.fill < n {
            return Err(Exhausted);
        }
        self.back -= n;
        Ok(self.back)
    }

    /// Writable view of the free region, for incremental socket reads.
    pub fn reserve_tail(&mut self) -> &mut [u8] {
        &mut self.buf[self.fill..self.back]
    }

    /// Marks `n` bytes of `reserve_tail` as received.
    pub fn fill_tail(&mut self, n: usize) {
        debug_assert!(self.fill + n <= self.back);
        self.fill += n;
    }

    /// Received bytes not yet committed or discarded.
    pub fn tail(&self) -> &[u8] {
        &self.buf[self.head..self.fill]
    }

    pub fn tail_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.head..self.fill]
    }

    pub fn tail_len(&self) -> usize {
        self.fill - self.head
    }

    /// Converts the first `n` received bytes into a head allocation,
    /// returning its offset. The bytes do not move.
    pub fn commit_tail(&mut self, n: usize) -> usize {
        debug_assert!(n <= self.tail_len());
        let off = self.head;
        self.head += n;
        self.last = Some((off, n));
        off
    }

    /// Drops the first `n` received bytes (consumed upload data).
    pub fn discard_tail(&mut self, n: usize) {
        debug_assert!(n <= self.tail_len());
        self.buf.copy_within(self.head + n..self.fill, self.head);
        self.fill -= n;
    }

    /// Rewinds head allocations to a marker. Only valid when no
    /// received bytes are pending (they live right after `head`).
    pub fn reset_to(&mut self, m: Marker) {
        debug_assert!(self.fill == self.head);
        self.head = m.head;
        self.fill = m.head;
        self.last = None;
    }

    /// Keep-alive reset: preserves the last `k` received bytes (the
    /// pipelined next request) by copying them to offset zero, then
    /// discards every allocation.
    pub fn reclaim_keeping_tail_bytes(&mut self, k: usize) {
        let k = k.min(self.tail_len());
        let start = self.fill - k;
        self.buf.copy_within(start..self.fill, 0);
        self.head = 0;
        self.fill = k;
        self.back = self.buf.len();
        self.last = None;
    }

    pub fn bytes(&self, off: usize, len: usize) -> &[u8] {
        &self.buf[off..off + len]
    }

    pub fn bytes_mut(&mut self, off: usize, len: usize) -> &mut [u8] {
        &mut self.buf[off..off + len]
    }

    #[cfg(test)]
    fn check_invariant(&self) {
        assert!(self.head <= self.fill);
        assert!(self.fill <= self.back);
        assert!(self.back <= self.buf.len());
    }
}
