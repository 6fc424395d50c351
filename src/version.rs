use std::fmt::{self, Display};

/// Represents a version of the HTTP spec.
///
/// HTTP/0.9 is only of historic importance and is not supported.
/// Most requests that appear to be HTTP/0.9 are malformed HTTP/1.0
/// requests. Unknown HTTP/1.x minor versions are treated as HTTP/1.1.
#[derive(Copy, Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Version {
    /// HTTP/1.0 protocol version.
    Http10,
    /// HTTP/1.1 protocol version as described in RFC7230 and others.
    Http11,
}

impl Version {
    pub fn as_str(&self) -> &'static str {
        match *self {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
        }
    }

    /// Parses the version token of a request line.
    pub fn parse(token: &str) -> Option<Version> {
        match token {
            "HTTP/1.0" => Some(Version::Http10),
            "HTTP/1.1" => Some(Version::Http11),
            _ => {
                // "HTTP/1.x" with an unknown minor is answered as 1.1
                let rest = token.strip_prefix("HTTP/1.")?;
                if !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()) {
                    Some(Version::Http11)
                } else {
                    None
                }
            }
        }
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
