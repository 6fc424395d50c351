use std::io;
use std::num::ParseIntError;
use std::str::Utf8Error;

use quick_error::quick_error;

use crate::status::Status;

quick_error! {
    /// Protocol-level fault raised while parsing a request.
    ///
    /// Note, you should not make an exhaustive match over the enum.
    /// More errors will be added at will. Use the `http_status()`
    /// method to build an error response.
    #[derive(Debug)]
    pub enum ProtocolError {
        BadRequestLine {
            display("malformed request line")
        }
        BadVersion {
            display("unsupported HTTP version in request line")
        }
        BadHeader {
            display("malformed header line")
        }
        BadUtf8(err: Utf8Error) {
            from()
            display("invalid utf-8 in request head: {}", err)
        }
        MissingHost {
            display("HTTP/1.1 request without a Host header")
        }
        DuplicateContentLength {
            display("conflicting `Content-Length` headers in request")
        }
        BadContentLength(err: ParseIntError) {
            display("error parsing `Content-Length` header: {}", err)
        }
        BadTransferEncoding {
            display("transfer coding other than `chunked` requested")
        }
        BadChunkSize {
            display("error parsing chunk size")
        }
        ChunkTooLarge {
            display("chunk size overflows the host size type")
        }
        BadChunkTerminator {
            display("chunk data not terminated by CRLF")
        }
        BadTrailer {
            display("malformed trailer line after last chunk")
        }
        HeadersTooLarge {
            display("request head does not fit into the connection pool")
        }
    }
}

impl ProtocolError {
    /// Status code of the best-effort error response for this fault.
    pub fn http_status(&self) -> Status {
        use self::ProtocolError::*;
        match *self {
            BadRequestLine | BadHeader | BadUtf8(_) | MissingHost
            | DuplicateContentLength | BadContentLength(_)
            | BadChunkSize | ChunkTooLarge | BadChunkTerminator
            | BadTrailer => Status::BAD_REQUEST,
            BadVersion => Status::VERSION_NOT_SUPPORTED,
            BadTransferEncoding => Status::NOT_IMPLEMENTED,
            HeadersTooLarge => Status::HEADER_FIELDS_TOO_LARGE,
        }
    }
}

quick_error! {
    /// Error starting or reconfiguring a daemon.
    #[derive(Debug)]
    pub enum StartError {
        Io(err: io::Error) {
            from()
            display("i/o error during daemon setup: {}", err)
        }
        BadConfig(what: &'static str) {
            display("invalid daemon configuration: {}", what)
        }
    }
}
