//! Ordered multimap for request headers, cookies, query arguments and
//! trailer footers. Entries point into the connection pool and are
//! invalidated with it when the request retires.

use crate::headers::eq_ignore_case;
use crate::pool::{Pool, PoolStr};

/// Classifies a key/value pair held by a [`Table`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ValueKind {
    /// Request header.
    Header = 1,
    /// Pair from the `Cookie` header.
    Cookie = 2,
    /// `GET` argument from the request target's query string.
    QueryArg = 4,
    /// Argument decoded from the request body by a post-processor.
    PostArg = 8,
    /// Trailer header after a chunked body.
    Footer = 16,
    /// Header attached to a response.
    ResponseHeader = 32,
    /// Trailer attached to a chunked response.
    ResponseFooter = 64,
}

impl ValueKind {
    /// Header and footer names are compared case-insensitively
    /// (RFC 7230 section 3.2); everything else is exact.
    pub fn case_insensitive(self) -> bool {
        matches!(self, ValueKind::Header | ValueKind::Footer)
    }

    pub fn mask(self) -> KindMask {
        KindMask(self as u8)
    }
}

/// Bitmask over [`ValueKind`] used to filter lookups and iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KindMask(u8);

impl KindMask {
    pub const ANY: KindMask = KindMask(0xff);

    pub fn contains(self, kind: ValueKind) -> bool {
        self.0 & kind as u8 != 0
    }
}

impl std::ops::BitOr for KindMask {
    type Output = KindMask;
    fn bitor(self, rhs: KindMask) -> KindMask {
        KindMask(self.0 | rhs.0)
    }
}

impl From<ValueKind> for KindMask {
    fn from(kind: ValueKind) -> KindMask {
        kind.mask()
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Entry {
    pub kind: ValueKind,
    pub name: PoolStr,
    pub value: PoolStr,
}

/// Insertion-ordered sequence of `(kind, name, value)` entries.
/// Duplicates are permitted and preserved; HTTP allows repeated
/// headers.
#[derive(Default)]
pub(crate) struct Table {
    entries: Vec<Entry>,
}

impl Table {
    pub fn new() -> Table {
        Table::default()
    }

    pub fn push(&mut self, kind: ValueKind, name: PoolStr, value: PoolStr) {
        self.entries.push(Entry { kind, name, value });
    }

    fn matches(entry: &Entry, pool: &Pool, mask: KindMask, name: &str) -> bool {
        if !mask.contains(entry.kind) {
            return false;
        }
        let entry_name = entry.name.bytes(pool);
        if entry.kind.case_insensitive() {
            eq_ignore_case(entry_name, name.as_bytes())
        } else {
            entry_name == name.as_bytes()
        }
    }

    /// First matching value under the kind mask, in insertion order.
    pub fn lookup<'p>(
        &self,
        pool: &'p Pool,
        mask: KindMask,
        name: &str,
    ) -> Option<&'p str> {
        self.entries
            .iter()
            .find(|e| Table::matches(e, pool, mask, name))
            .map(|e| e.value.get(pool))
    }

    /// All values for one name, in insertion order.
    pub fn lookup_all<'p>(
        &'p self,
        pool: &'p Pool,
        mask: KindMask,
        name: &'p str,
    ) -> impl Iterator<Item = &'p str> + 'p {
        self.entries
            .iter()
            .filter(move |e| Table::matches(e, pool, mask, name))
            .map(move |e| e.value.get(pool))
    }

    /// Calls the visitor for every entry under the mask; stops early
    /// when the visitor returns `false`. Returns the number of entries
    /// visited.
    pub fn visit<F>(&self, pool: &Pool, mask: KindMask, mut f: F) -> usize
    where
        F: FnMut(ValueKind, &str, &str) -> bool,
    {
        let mut seen = 0;
        for e in &self.entries {
            if !mask.contains(e.kind) {
                continue;
            }
            seen += 1;
            if !f(e.kind, e.name.get(pool), e.value.get(pool)) {
                break;
            }
        }
        seen
    }

    pub fn count(&self, mask: KindMask) -> usize {
        self.entries.iter().filter(|e| mask.contains(e.kind)).count()
    }
}
