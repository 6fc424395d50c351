//! Incremental parsers over the connection pool's tail buffer.
//!
//! Every step is an explicit result; there is no longjmp-style escape.
//! `Ok(None)` uniformly means "need more data from the socket".

use std::str;

use crate::error::ProtocolError;
use crate::pool::{Pool, PoolStr};
use crate::table::{Table, ValueKind};
use crate::version::Version;

/// Parsed request line.
pub(crate) struct RequestLine {
    pub method: PoolStr,
    pub url: PoolStr,
    pub query_raw: Option<PoolStr>,
    pub version: Version,
}

/// Extracts the next line from the tail, committing its bytes into the
/// pool head so the returned handle stays valid for the request's
/// lifetime. Accepts both `\r\n` and bare `\n` terminators.
///
/// With `unfold`, a non-empty line whose terminator is followed by SP
/// or HTAB is a folded continuation (RFC 7230 obs-fold): the terminator
/// bytes are rewritten to spaces and scanning continues, so the caller
/// sees one joined line. Deciding whether a terminator folds requires
/// one byte of lookahead; `eof` tells the scanner no more bytes will
/// come. An empty line can never fold, so the blank line ending the
/// header block parses without waiting for anything after it.
pub(crate) fn next_line(
    pool: &mut Pool,
    unfold: bool,
    eof: bool,
) -> Result<Option<PoolStr>, ProtocolError> {
    let mut search_from = 0;
    loop {
        let tail = pool.tail();
        let nl = match tail[search_from..].iter().position(|&b| b == b'\n') {
            Some(i) => search_from + i,
            None => {
                if pool.free() == 0 {
                    return Err(ProtocolError::HeadersTooLarge);
                }
                return Ok(None);
            }
        };
        let mut content = nl;
        if content > 0 && tail[content - 1] == b'\r' {
            content -= 1;
        }
        if unfold && content > 0 {
            if nl + 1 >= tail.len() {
                if !eof {
                    if pool.free() == 0 {
                        // no room for the lookahead byte, ever
                        return Err(ProtocolError::HeadersTooLarge);
                    }
                    // can't yet tell whether the next byte folds
                    return Ok(None);
                }
            } else if matches!(tail[nl + 1], b' ' | b'\t') {
                // rewrite the terminator so the joined value reads as
                // whitespace-separated
                let tail = pool.tail_mut();
                tail[nl] = b' ';
                if nl > 0 && tail[nl - 1] == b'\r' {
                    tail[nl - 1] = b' ';
                }
                search_from = nl + 1;
                continue;
            }
        }
        let off = pool.commit_tail(nl + 1);
        return Ok(Some(PoolStr::new(off, content)));
    }
}

/// Like `next_line` but without committing: returns `(content, total)`
/// lengths of the next line in the tail. Used for chunk-size lines and
/// other body framing that must not accumulate in the pool.
pub(crate) fn peek_line(pool: &Pool) -> Result<Option<(usize, usize)>, ProtocolError> {
    let tail = pool.tail();
    let nl = match tail.iter().position(|&b| b == b'\n') {
        Some(i) => i,
        None => {
            if pool.free() == 0 {
                return Err(ProtocolError::BadChunkSize);
            }
            return Ok(None);
        }
    };
    let mut content = nl;
    if content > 0 && tail[content - 1] == b'\r' {
        content -= 1;
    }
    Ok(Some((content, nl + 1)))
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Percent-decodes `len` bytes at `off` in place, returning the new
/// length. Invalid escapes are kept literally. With `plus_to_space`,
/// `+` decodes to a space (query arguments only, never the path).
pub(crate) fn unescape_in_place(
    pool: &mut Pool,
    off: usize,
    len: usize,
    plus_to_space: bool,
) -> usize {
    let buf = pool.bytes_mut(off, len);
    let mut rd = 0;
    let mut wr = 0;
    while rd < len {
        let b = buf[rd];
        if b == b'%' && rd + 2 < len {
            if let (Some(hi), Some(lo)) = (hex_val(buf[rd + 1]), hex_val(buf[rd + 2])) {
                buf[wr] = hi << 4 | lo;
                wr += 1;
                rd += 3;
                continue;
            }
        }
        buf[wr] = if plus_to_space && b == b'+' { b' ' } else { b };
        wr += 1;
        rd += 1;
    }
    wr
}

fn check_utf8(pool: &Pool, s: PoolStr) -> Result<(), ProtocolError> {
    str::from_utf8(s.bytes(pool))?;
    Ok(())
}

/// Parses `METHOD SP request-target SP HTTP-version`, splitting the
/// target into a percent-decoded path and a raw query string.
pub(crate) fn parse_request_line(
    pool: &mut Pool,
    line: PoolStr,
) -> Result<RequestLine, ProtocolError> {
    let bytes = line.bytes(pool);
    let sp1 = bytes
        .iter()
        .position(|&b| b == b' ')
        .ok_or(ProtocolError::BadRequestLine)?;
    let sp2 = bytes
        .iter()
        .rposition(|&b| b == b' ')
        .ok_or(ProtocolError::BadRequestLine)?;
    if sp1 == 0 || sp2 <= sp1 + 1 {
        return Err(ProtocolError::BadRequestLine);
    }
    let method = line.slice(0, sp1);
    let target = line.slice(sp1 + 1, sp2 - sp1 - 1);
    let version_tok = line.slice(sp2 + 1, line.len() - sp2 - 1);

    check_utf8(pool, version_tok)?;
    let version =
        Version::parse(version_tok.get(pool)).ok_or(ProtocolError::BadVersion)?;

    let (path_raw, query_raw) = match target.bytes(pool).iter().position(|&b| b == b'?') {
        Some(q) => (
            target.slice(0, q),
            Some(target.slice(q + 1, target.len() - q - 1)),
        ),
        None => (target, None),
    };

    // decode the path in place; `%2F` becomes a literal slash in the
    // decoded string the application sees, there is no routing layer
    // that could mis-split on it
    let decoded_len = unescape_in_place(pool, path_raw.offset(), path_raw.len(), false);
    let url = path_raw.slice(0, decoded_len);

    check_utf8(pool, method)?;
    check_utf8(pool, url)?;
    if method.is_empty() || url.is_empty() {
        return Err(ProtocolError::BadRequestLine);
    }
    Ok(RequestLine {
        method,
        url,
        query_raw,
        version,
    })
}

/// Splits a raw query into `(key, value)` arguments, decoding both
/// sides in place (`+` becomes space). Bare keys get empty values.
/// Pairs that do not decode to utf-8 are skipped.
pub(crate) fn parse_query(pool: &mut Pool, raw: PoolStr, table: &mut Table) {
    let mut pos = 0;
    while pos < raw.len() {
        let rest = &raw.bytes(pool)[pos..];
        let pair_len = rest
            .iter()
            .position(|&b| b == b'&')
            .unwrap_or(rest.len());
        let pair = raw.slice(pos, pair_len);
        pos += pair_len + 1;
        if pair.is_empty() {
            continue;
        }
        let eq = pair.bytes(pool).iter().position(|&b| b == b'=');
        let (key, value) = match eq {
            Some(e) => (pair.slice(0, e), pair.slice(e + 1, pair.len() - e - 1)),
            None => (pair, PoolStr::EMPTY),
        };
        let key = {
            let n = unescape_in_place(pool, key.offset(), key.len(), true);
            key.slice(0, n)
        };
        let value = if !value.is_empty() {
            let n = unescape_in_place(pool, value.offset(), value.len(), true);
            value.slice(0, n)
        } else {
            value
        };
        if check_utf8(pool, key).is_err() || check_utf8(pool, value).is_err() {
            log::debug!("skipping non-utf8 query argument");
            continue;
        }
        table.push(ValueKind::QueryArg, key, value);
    }
}

/// Parses one `Name: value` header (or trailer) line. The value is
/// trimmed of surrounding whitespace; the name must be a token with no
/// embedded whitespace.
pub(crate) fn parse_header_line(
    pool: &Pool,
    line: PoolStr,
) -> Result<(PoolStr, PoolStr), ProtocolError> {
    let bytes = line.bytes(pool);
    let colon = bytes
        .iter()
        .position(|&b| b == b':')
        .ok_or(ProtocolError::BadHeader)?;
    if colon == 0 {
        return Err(ProtocolError::BadHeader);
    }
    let name = line.slice(0, colon);
    if name.bytes(pool).iter().any(|&b| matches!(b, b' ' | b'\t')) {
        return Err(ProtocolError::BadHeader);
    }
    let raw_value = line.slice(colon + 1, line.len() - colon - 1);
    let vb = raw_value.bytes(pool);
    let trimmed = crate::headers::trim(vb);
    let start = trimmed.as_ptr() as usize - vb.as_ptr() as usize;
    let value = raw_value.slice(start, trimmed.len());
    check_utf8(pool, name)?;
    check_utf8(pool, value)?;
    Ok((name, value))
}

/// Splits a `Cookie` header value into individual pairs. Cookies keep
/// case-sensitive names and are not percent-decoded.
pub(crate) fn parse_cookies(pool: &Pool, value: PoolStr, table: &mut Table) {
    let mut pos = 0;
    while pos < value.len() {
        let rest = &value.bytes(pool)[pos..];
        let len = rest.iter().position(|&b| b == b';').unwrap_or(rest.len());
        let item = value.slice(pos, len);
        pos += len + 1;
        let ib = item.bytes(pool);
        let trimmed = crate::headers::trim(ib);
        if trimmed.is_empty() {
            continue;
        }
        let start = trimmed.as_ptr() as usize - ib.as_ptr() as usize;
        let item = item.slice(start, trimmed.len());
        let (name, val) = match item.bytes(pool).iter().position(|&b| b == b'=') {
            Some(e) => (item.slice(0, e), item.slice(e + 1, item.len() - e - 1)),
            None => (item, PoolStr::EMPTY),
        };
        table.push(ValueKind::Cookie, name, val);
    }
}

/// Parses a chunk-size line: hex digits, optionally followed by a
/// `;chunk-ext` which is accepted and ignored. Sizes that overflow the
/// host size type are rejected.
pub(crate) fn parse_chunk_size(line: &[u8]) -> Result<u64, ProtocolError> {
    let digits_end = line
        .iter()
        .position(|&b| b == b';')
        .unwrap_or(line.len());
    let digits = crate::headers::trim(&line[..digits_end]);
    if digits.is_empty() {
        return Err(ProtocolError::BadChunkSize);
    }
    let mut value: u64 = 0;
    for &b in digits {
        let d = hex_val(b).ok_or(ProtocolError::BadChunkSize)? as u64;
        value = value
            .checked_mul(16)
            .and_then(|v| v.checked_add(d))
            .ok_or(ProtocolError::ChunkTooLarge)?;
    }
    if value > usize::MAX as u64 {
        return Err(ProtocolError::ChunkTooLarge);
    }
    Ok(value)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::table::{KindMask, Table, ValueKind};
    use matches::assert_matches;

    fn pool_with(bytes: &[u8]) -> Pool {
        let mut pool = Pool::with_capacity(1024);
        pool.reserve_tail()[..bytes.len()].copy_from_slice(bytes);
        pool.fill_tail(bytes.len());
        pool
    }

    #[test]
    fn line_scanning() {
        let mut pool = pool_with(b"GET / HTTP/1.1\r\nHost: x\npartial");
        let l1 = next_line(&mut pool, false, false).unwrap().unwrap();
        assert_eq!(l1.get(&pool), "GET / HTTP/1.1");
        let l2 = next_line(&mut pool, false, false).unwrap().unwrap();
        assert_eq!(l2.get(&pool), "Host: x");
        assert!(next_line(&mut pool, false, false).unwrap().is_none());
    }

    #[test]
    fn folded_header_joins() {
        let mut pool = pool_with(b"X-Long: one\r\n two\r\nNext: y\r\n");
        let line = next_line(&mut pool, true, false).unwrap().unwrap();
        assert_eq!(line.get(&pool), "X-Long: one   two");
        let (name, value) = parse_header_line(&pool, line).unwrap();
        assert_eq!(name.get(&pool), "X-Long");
        assert_eq!(value.get(&pool), "one   two");
        // the last line's terminator is the final received byte, so it
        // still needs its fold lookahead until eof
        assert!(next_line(&mut pool, true, false).unwrap().is_none());
        let next = next_line(&mut pool, true, true).unwrap().unwrap();
        assert_eq!(next.get(&pool), "Next: y");
    }

    #[test]
    fn fold_needs_lookahead() {
        let mut pool = pool_with(b"X: a\r\n");
        // the byte after the terminator is not here yet
        assert!(next_line(&mut pool, true, false).unwrap().is_none());
        // at eof the line is complete as-is
        let line = next_line(&mut pool, true, true).unwrap().unwrap();
        assert_eq!(line.get(&pool), "X: a");
    }

    #[test]
    fn blank_line_ends_head_without_lookahead() {
        // a complete head with nothing after it: the empty line must
        // parse immediately, it cannot be a folded continuation
        let mut pool = pool_with(b"GET / HTTP/1.1\r\n\r\n");
        let line = next_line(&mut pool, true, false).unwrap().unwrap();
        assert_eq!(line.get(&pool), "GET / HTTP/1.1");
        let blank = next_line(&mut pool, true, false).unwrap().unwrap();
        assert!(blank.is_empty());
        assert_eq!(pool.tail_len(), 0);
    }

    #[test]
    fn full_pool_fold_lookahead_faults() {
        // terminator is the last byte of a full pool: the lookahead
        // byte can never arrive, so waiting would hang forever
        let mut pool = Pool::with_capacity(8);
        pool.reserve_tail().copy_from_slice(b"X: aaa\r\n");
        pool.fill_tail(8);
        assert_matches!(
            next_line(&mut pool, true, false),
            Err(ProtocolError::HeadersTooLarge)
        );
    }

    #[test]
    fn oversize_head_faults() {
        let mut pool = Pool::with_capacity(16);
        let n = pool.reserve_tail().len();
        for b in pool.reserve_tail().iter_mut() {
            *b = b'a';
        }
        pool.fill_tail(n);
        assert_matches!(
            next_line(&mut pool, false, false),
            Err(ProtocolError::HeadersTooLarge)
        );
    }

    #[test]
    fn request_line_with_query() {
        let mut pool = pool_with(b"GET /a%20b?x=1+2&flag&y=%2F HTTP/1.1\r\n");
        let line = next_line(&mut pool, false, false).unwrap().unwrap();
        let rl = parse_request_line(&mut pool, line).unwrap();
        assert_eq!(rl.method.get(&pool), "GET");
        assert_eq!(rl.url.get(&pool), "/a b");
        assert_eq!(rl.version, Version::Http11);

        let mut table = Table::new();
        let raw = rl.query_raw.unwrap();
        parse_query(&mut pool, raw, &mut table);
        let mask: KindMask = ValueKind::QueryArg.into();
        assert_eq!(table.lookup(&pool, mask, "x"), Some("1 2"));
        assert_eq!(table.lookup(&pool, mask, "flag"), Some(""));
        assert_eq!(table.lookup(&pool, mask, "y"), Some("/"));
    }

    #[test]
    fn request_line_faults() {
        for raw in [
            &b"GET\r\n"[..],
            b"GET /\r\n",
            b"GET / HTTP/2.0\r\n",
            b" / HTTP/1.1\r\n",
        ] {
            let mut pool = pool_with(raw);
            let line = next_line(&mut pool, false, false).unwrap().unwrap();
            assert!(parse_request_line(&mut pool, line).is_err());
        }
    }

    #[test]
    fn percent_decoding_keeps_bad_escapes() {
        let mut pool = pool_with(b"GET /x%zz%4 HTTP/1.0\r\n");
        let line = next_line(&mut pool, false, false).unwrap().unwrap();
        let rl = parse_request_line(&mut pool, line).unwrap();
        assert_eq!(rl.url.get(&pool), "/x%zz%4");
    }

    #[test]
    fn header_line_rules() {
        let mut pool = pool_with(b"Content-Type:  text/plain \r\nBad Header: x\r\n:novalue\r\n");
        let l = next_line(&mut pool, true, false).unwrap().unwrap();
        let (n, v) = parse_header_line(&pool, l).unwrap();
        assert_eq!(n.get(&pool), "Content-Type");
        assert_eq!(v.get(&pool), "text/plain");
        let l = next_line(&mut pool, true, false).unwrap().unwrap();
        assert_matches!(parse_header_line(&pool, l), Err(ProtocolError::BadHeader));
        let l = next_line(&mut pool, true, true).unwrap().unwrap();
        assert_matches!(parse_header_line(&pool, l), Err(ProtocolError::BadHeader));
    }

    #[test]
    fn cookies_split() {
        let mut pool = pool_with(b"Cookie: a=1; b=2; bare\r\n");
        let line = next_line(&mut pool, true, true).unwrap().unwrap();
        let (_, value) = parse_header_line(&pool, line).unwrap();
        let mut table = Table::new();
        parse_cookies(&pool, value, &mut table);
        let mask: KindMask = ValueKind::Cookie.into();
        assert_eq!(table.lookup(&pool, mask, "a"), Some("1"));
        assert_eq!(table.lookup(&pool, mask, "b"), Some("2"));
        assert_eq!(table.lookup(&pool, mask, "bare"), Some(""));
        // cookie names are case-sensitive
        assert_eq!(table.lookup(&pool, mask, "A"), None);
    }

    #[test]
    fn chunk_sizes() {
        assert_eq!(parse_chunk_size(b"4").unwrap(), 4);
        assert_eq!(parse_chunk_size(b"0004").unwrap(), 4);
        assert_eq!(parse_chunk_size(b"400").unwrap(), 0x400);
        assert_eq!(parse_chunk_size(b"a;ext=1").unwrap(), 10);
        assert_eq!(parse_chunk_size(b"0").unwrap(), 0);
        assert_matches!(parse_chunk_size(b""), Err(ProtocolError::BadChunkSize));
        assert_matches!(parse_chunk_size(b"xyz"), Err(ProtocolError::BadChunkSize));
        assert_matches!(
            parse_chunk_size(b"ffffffffffffffffff"),
            Err(ProtocolError::ChunkTooLarge)
        );
    }
}
