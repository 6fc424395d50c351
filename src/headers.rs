//! Byte-level helpers for header comparison. Header names and a few
//! well-known values are matched case-insensitively without allocating.

#[inline]
pub fn eq_ignore_case(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter()
        .zip(b.iter())
        .all(|(&x, &y)| x.to_ascii_lowercase() == y.to_ascii_lowercase())
}

/// Compares a header value against an expected token, ignoring case and
/// surrounding whitespace.
#[inline]
pub fn value_is(val: &[u8], token: &[u8]) -> bool {
    let trimmed = trim(val);
    eq_ignore_case(trimmed, token)
}

/// True if the comma-separated header value contains the given token
/// (case-insensitive). Used for `Connection: keep-alive, upgrade`-style
/// lists.
pub fn has_token(val: &[u8], token: &[u8]) -> bool {
    val.split(|&b| b == b',').any(|part| value_is(part, token))
}

#[inline]
pub fn is_close(val: &[u8]) -> bool {
    has_token(val, b"close")
}

#[inline]
pub fn is_keep_alive(val: &[u8]) -> bool {
    has_token(val, b"keep-alive")
}

#[inline]
pub fn is_chunked(val: &[u8]) -> bool {
    value_is(val, b"chunked")
}

#[inline]
pub fn is_100_continue(val: &[u8]) -> bool {
    value_is(val, b"100-continue")
}

#[inline]
pub fn trim(val: &[u8]) -> &[u8] {
    let start = val
        .iter()
        .position(|&b| !matches!(b, b' ' | b'\t' | b'\r' | b'\n'))
        .unwrap_or(val.len());
    let end = val
        .iter()
        .rposition(|&b| !matches!(b, b' ' | b'\t' | b'\r' | b'\n'))
        .map(|p| p + 1)
        .unwrap_or(start);
    &val[start..end]
}

#[cfg(test)]
mod test {
    use super::{is_100_continue, is_chunked, is_close, is_keep_alive};
    use super::{eq_ignore_case, has_token, trim};

    #[test]
    fn test_chunked() {
        assert!(is_chunked(b"chunked"));
        assert!(is_chunked(b"Chunked"));
        assert!(is_chunked(b"chuNKED"));
        assert!(is_chunked(b"CHUNKED"));
        assert!(is_chunked(b"   CHUNKED"));
        assert!(is_chunked(b"   CHUNKED  "));
        assert!(is_chunked(b"chunked  "));
        assert!(!is_chunked(b"gzip, chunked"));
    }

    #[test]
    fn test_close() {
        assert!(is_close(b"close"));
        assert!(is_close(b"Close"));
        assert!(is_close(b"clOSE"));
        assert!(is_close(b" CLOSE"));
        assert!(is_close(b"   close   "));
        assert!(is_close(b"keep-alive, close"));
        assert!(!is_close(b"closed"));
        assert!(!is_close(b"clo"));
    }

    #[test]
    fn test_keep_alive() {
        assert!(is_keep_alive(b"keep-alive"));
        assert!(is_keep_alive(b"Keep-Alive"));
        assert!(is_keep_alive(b" keep-alive , upgrade"));
        assert!(!is_keep_alive(b"keep"));
    }

    #[test]
    fn test_continue() {
        assert!(is_100_continue(b"100-continue"));
        assert!(is_100_continue(b" 100-Continue "));
        assert!(!is_100_continue(b"100"));
    }

    #[test]
    fn test_eq_ignore_case() {
        assert!(eq_ignore_case(b"Content-Length", b"content-length"));
        assert!(eq_ignore_case(b"HOST", b"host"));
        assert!(!eq_ignore_case(b"host", b"hostname"));
    }

    #[test]
    fn test_token_list() {
        assert!(has_token(b"gzip, chunked", b"chunked"));
        assert!(has_token(b"chunked", b"chunked"));
        assert!(!has_token(b"gzip;q=1", b"gzip, chunked"));
    }

    #[test]
    fn test_trim() {
        assert_eq!(trim(b"  x "), b"x");
        assert_eq!(trim(b"\t\r\n"), b"");
        assert_eq!(trim(b"abc"), b"abc");
    }
}
