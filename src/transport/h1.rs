//! HTTP/1.1 request encoding and incremental response parsing.
//!
//! Every request is sent with `Connection: close`, so a response body is framed by
//! `Content-Length`, by chunked transfer coding, or by the server closing the socket.
use super::{ResponseParts, TransferError, url::Url};
use crate::slot::{HeaderEntry, Method};

/// Refuse header sections larger than this before the blank line shows up.
const MAX_HEAD_SIZE: usize = 64 * 1024;

const USER_AGENT: &str = concat!("reqpool/", env!("CARGO_PKG_VERSION"));

/// Headers the encoder owns; caller supplied values are dropped.
const FRAMING_HEADERS: [&str; 3] = ["content-length", "transfer-encoding", "connection"];

/// Serialize a request into `out`, replacing its previous contents.
pub fn encode_request(
    method: Method,
    url: &Url,
    headers: &[HeaderEntry],
    body: &[u8],
    out: &mut Vec<u8>,
) {
    out.clear();
    out.extend_from_slice(method.as_str().as_bytes());
    out.push(b' ');
    out.extend_from_slice(url.target.as_bytes());
    out.extend_from_slice(b" HTTP/1.1\r\n");

    let has = |name: &str| headers.iter().any(|h| h.name.eq_ignore_ascii_case(name));

    if !has("host") {
        push_header(out, "Host", &url.host_header());
    }
    if !has("user-agent") {
        push_header(out, "User-Agent", USER_AGENT);
    }
    if !has("accept") {
        push_header(out, "Accept", "*/*");
    }

    for header in headers {
        if FRAMING_HEADERS
            .iter()
            .any(|f| header.name.eq_ignore_ascii_case(f))
        {
            continue;
        }
        push_header(out, &header.name, &header.value);
    }

    let send_body = method.has_body();
    if send_body {
        if !has("content-type") {
            push_header(out, "Content-Type", "application/json");
        }
        push_header(out, "Content-Length", &body.len().to_string());
    }
    push_header(out, "Connection", "close");
    out.extend_from_slice(b"\r\n");

    if send_body {
        out.extend_from_slice(body);
    }
}

fn push_header(out: &mut Vec<u8>, name: &str, value: &str) {
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(b": ");
    out.extend_from_slice(value.as_bytes());
    out.extend_from_slice(b"\r\n");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    Length(usize),
    Chunked,
    Close,
    Empty,
}

#[derive(Debug)]
struct Head {
    status: u16,
    headers: Vec<HeaderEntry>,
    framing: Framing,
}

/// Accumulates response bytes until a full response is available.
#[derive(Debug)]
pub struct ResponseParser {
    buf: Vec<u8>,
    head: Option<Head>,
    body_start: usize,
    chunk_pos: usize,
    decoded: Vec<u8>,
    limit: usize,
}

impl ResponseParser {
    /// `limit` caps the decoded body size.
    pub fn new(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            head: None,
            body_start: 0,
            chunk_pos: 0,
            decoded: Vec::new(),
            limit,
        }
    }

    /// Append received bytes. Returns the response once it is complete.
    pub fn feed(&mut self, data: &[u8]) -> Result<Option<ResponseParts>, TransferError> {
        self.buf.extend_from_slice(data);

        while self.head.is_none() {
            let Some(end) = find_header_end(&self.buf) else {
                if self.buf.len() > MAX_HEAD_SIZE {
                    return Err(TransferError::WeirdServerReply(
                        "header section too large".into(),
                    ));
                }
                return Ok(None);
            };

            let head = parse_head(&self.buf[..end])?;
            // interim 1xx responses carry no body and are followed by the real one
            if (100..200).contains(&head.status) && head.status != 101 {
                self.buf.drain(..end + 4);
                continue;
            }
            self.body_start = end + 4;
            self.chunk_pos = self.body_start;
            self.head = Some(head);
        }

        self.try_complete()
    }

    /// The peer closed the connection: whatever arrived must be a full response.
    pub fn finish(&mut self) -> Result<ResponseParts, TransferError> {
        if let Some(parts) = self.try_complete()? {
            return Ok(parts);
        }

        let Some(head) = self.head.take() else {
            return Err(if self.buf.is_empty() {
                TransferError::GotNothing
            } else {
                TransferError::WeirdServerReply("incomplete status line or headers".into())
            });
        };

        match head.framing {
            Framing::Length(expected) => Err(TransferError::PartialFile {
                missing: expected.saturating_sub(self.buf.len() - self.body_start),
            }),
            Framing::Chunked => Err(TransferError::Recv("chunked body truncated".into())),
            Framing::Close | Framing::Empty => {
                let body = self.buf[self.body_start..].to_vec();
                Ok(ResponseParts {
                    status: head.status,
                    headers: head.headers,
                    body,
                })
            }
        }
    }

    fn try_complete(&mut self) -> Result<Option<ResponseParts>, TransferError> {
        let Some(framing) = self.head.as_ref().map(|h| h.framing) else {
            return Ok(None);
        };

        let body = match framing {
            Framing::Empty => Vec::new(),
            Framing::Length(len) => {
                if len > self.limit {
                    return Err(TransferError::ResponseTooLarge { limit: self.limit });
                }
                if self.buf.len() - self.body_start < len {
                    return Ok(None);
                }
                self.buf[self.body_start..self.body_start + len].to_vec()
            }
            Framing::Chunked => {
                if !self.decode_chunks()? {
                    return Ok(None);
                }
                std::mem::take(&mut self.decoded)
            }
            Framing::Close => {
                if self.buf.len() - self.body_start > self.limit {
                    return Err(TransferError::ResponseTooLarge { limit: self.limit });
                }
                return Ok(None);
            }
        };

        let Some(head) = self.head.take() else {
            return Ok(None);
        };
        Ok(Some(ResponseParts {
            status: head.status,
            headers: head.headers,
            body,
        }))
    }

    /// Decode as many chunks as are buffered. `true` once the last chunk was seen.
    fn decode_chunks(&mut self) -> Result<bool, TransferError> {
        loop {
            let room = self.limit.saturating_sub(self.decoded.len());
            match decode_chunk(&self.buf[self.chunk_pos..], room)? {
                Chunk::NeedMore => return Ok(false),
                Chunk::Last => return Ok(true),
                Chunk::TooLarge => {
                    return Err(TransferError::ResponseTooLarge { limit: self.limit });
                }
                Chunk::Data { start, len, consumed } => {
                    let from = self.chunk_pos + start;
                    self.decoded.extend_from_slice(&self.buf[from..from + len]);
                    self.chunk_pos += consumed;
                }
            }
        }
    }
}

/// Position of the first `\r` of the `\r\n\r\n` ending the header section.
fn find_header_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n")
}

fn find_crlf(data: &[u8]) -> Option<usize> {
    data.windows(2).position(|w| w == b"\r\n")
}

fn parse_head(data: &[u8]) -> Result<Head, TransferError> {
    let text = std::str::from_utf8(data)
        .map_err(|_| TransferError::WeirdServerReply("header section is not utf-8".into()))?;
    let mut lines = text.split("\r\n");

    // HTTP/1.1 200 OK
    let status_line = lines.next().unwrap_or_default();
    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/") {
        return Err(TransferError::WeirdServerReply(format!(
            "bad status line '{status_line}'"
        )));
    }
    let status: u16 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .filter(|s| (100..1000).contains(s))
        .ok_or_else(|| TransferError::WeirdServerReply(format!("bad status line '{status_line}'")))?;

    let mut headers = Vec::new();
    let mut content_length = None;
    let mut chunked = false;

    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim();
        let value = value.trim();

        if name.eq_ignore_ascii_case("content-length") {
            let len = value.parse::<usize>().map_err(|_| {
                TransferError::WeirdServerReply(format!("bad content-length '{value}'"))
            })?;
            content_length = Some(len);
        }
        if name.eq_ignore_ascii_case("transfer-encoding")
            && value
                .rsplit(',')
                .next()
                .is_some_and(|v| v.trim().eq_ignore_ascii_case("chunked"))
        {
            chunked = true;
        }

        headers.push(HeaderEntry::new(name, value));
    }

    let framing = if status == 204 || status == 304 || (100..200).contains(&status) {
        Framing::Empty
    } else if chunked {
        Framing::Chunked
    } else if let Some(len) = content_length {
        Framing::Length(len)
    } else {
        Framing::Close
    };

    Ok(Head {
        status,
        headers,
        framing,
    })
}

#[derive(Debug, PartialEq, Eq)]
enum Chunk {
    Data {
        start: usize,
        len: usize,
        consumed: usize,
    },
    Last,
    NeedMore,
    /// The announced chunk does not fit in the remaining body allowance.
    TooLarge,
}

/// Decode one chunk header (`<hex>[;ext]\r\n`) and locate its data. Chunks longer
/// than `room` are refused before any of their data is buffered.
fn decode_chunk(data: &[u8], room: usize) -> Result<Chunk, TransferError> {
    let Some(crlf) = find_crlf(data) else {
        return Ok(Chunk::NeedMore);
    };

    let line = std::str::from_utf8(&data[..crlf])
        .map_err(|_| TransferError::WeirdServerReply("bad chunk size line".into()))?;
    let size_hex = line.split(';').next().unwrap_or_default().trim();
    let size = usize::from_str_radix(size_hex, 16)
        .map_err(|_| TransferError::WeirdServerReply(format!("bad chunk size '{size_hex}'")))?;

    if size == 0 {
        return Ok(Chunk::Last);
    }
    if size > room {
        return Ok(Chunk::TooLarge);
    }

    let start = crlf + 2;
    let Some(consumed) = start.checked_add(size).and_then(|end| end.checked_add(2)) else {
        return Ok(Chunk::TooLarge);
    };
    if data.len() < consumed {
        return Ok(Chunk::NeedMore);
    }

    Ok(Chunk::Data {
        start,
        len: size,
        consumed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url() -> Url {
        Url::parse("http://localhost:8080/items?id=3").unwrap()
    }

    #[test]
    fn encodes_get_without_body() {
        let mut out = Vec::new();
        encode_request(Method::Get, &url(), &[], b"ignored", &mut out);
        let text = String::from_utf8(out).unwrap();

        assert!(text.starts_with("GET /items?id=3 HTTP/1.1\r\nHost: localhost:8080\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(!text.contains("Content-Length"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn encodes_post_with_default_content_type() {
        let mut out = Vec::new();
        encode_request(Method::Post, &url(), &[], b"{\"a\":1}", &mut out);
        let text = String::from_utf8(out).unwrap();

        assert!(text.starts_with("POST "));
        assert!(text.contains("Content-Type: application/json\r\n"));
        assert!(text.contains("Content-Length: 7\r\n"));
        assert!(text.ends_with("\r\n\r\n{\"a\":1}"));
    }

    #[test]
    fn caller_headers_win_but_framing_is_ours() {
        let headers = vec![
            HeaderEntry::new("Content-Type", "text/plain"),
            HeaderEntry::new("Content-Length", "999"),
            HeaderEntry::new("Host", "override"),
        ];
        let mut out = Vec::new();
        encode_request(Method::Put, &url(), &headers, b"abc", &mut out);
        let text = String::from_utf8(out).unwrap();

        assert!(text.contains("Host: override\r\n"));
        assert!(!text.contains("localhost:8080"));
        assert!(text.contains("Content-Type: text/plain\r\n"));
        assert!(!text.contains("application/json"));
        assert!(text.contains("Content-Length: 3\r\n"));
        assert!(!text.contains("999"));
    }

    #[test]
    fn parses_content_length_response_in_pieces() {
        let mut parser = ResponseParser::new(1024);
        assert_eq!(parser.feed(b"HTTP/1.1 200 OK\r\nContent-Le").unwrap(), None);
        assert_eq!(parser.feed(b"ngth: 4\r\nX-A: b\r\n\r\npo").unwrap(), None);
        let parts = parser.feed(b"ng").unwrap().unwrap();

        assert_eq!(parts.status, 200);
        assert_eq!(parts.body, b"pong");
        assert_eq!(parts.headers[1], HeaderEntry::new("X-A", "b"));
    }

    #[test]
    fn parses_chunked_response() {
        let mut parser = ResponseParser::new(1024);
        let head = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n";
        assert_eq!(parser.feed(head).unwrap(), None);
        assert_eq!(parser.feed(b"2\r\npo\r\n2;ext=1\r\nn").unwrap(), None);
        let parts = parser.feed(b"g\r\n0\r\n\r\n").unwrap().unwrap();

        assert_eq!(parts.body, b"pong");
    }

    #[test]
    fn read_to_close_completes_on_finish() {
        let mut parser = ResponseParser::new(1024);
        assert_eq!(parser.feed(b"HTTP/1.0 200 OK\r\n\r\nhello").unwrap(), None);
        let parts = parser.finish().unwrap();
        assert_eq!(parts.body, b"hello");
    }

    #[test]
    fn skips_interim_continue() {
        let mut parser = ResponseParser::new(1024);
        let data = b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 201 Created\r\nContent-Length: 0\r\n\r\n";
        let parts = parser.feed(data).unwrap().unwrap();
        assert_eq!(parts.status, 201);
        assert!(parts.body.is_empty());
    }

    #[test]
    fn no_content_has_no_body() {
        let mut parser = ResponseParser::new(1024);
        let parts = parser.feed(b"HTTP/1.1 204 No Content\r\n\r\n").unwrap().unwrap();
        assert_eq!(parts.status, 204);
    }

    #[test]
    fn truncated_bodies_are_errors() {
        let mut parser = ResponseParser::new(1024);
        parser
            .feed(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nabc")
            .unwrap();
        assert_eq!(
            parser.finish(),
            Err(TransferError::PartialFile { missing: 7 })
        );

        let mut parser = ResponseParser::new(1024);
        assert_eq!(parser.finish(), Err(TransferError::GotNothing));
    }

    #[test]
    fn malformed_status_line() {
        let mut parser = ResponseParser::new(1024);
        assert!(matches!(
            parser.feed(b"SSH-2.0-OpenSSH\r\n\r\n"),
            Err(TransferError::WeirdServerReply(_))
        ));
    }

    #[test]
    fn enforces_body_limit() {
        let mut parser = ResponseParser::new(3);
        assert_eq!(
            parser.feed(b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\n"),
            Err(TransferError::ResponseTooLarge { limit: 3 })
        );
    }

    #[test]
    fn decode_chunk_states() {
        assert_eq!(decode_chunk(b"5\r\nhel", 16).unwrap(), Chunk::NeedMore);
        assert_eq!(decode_chunk(b"0\r\n", 16).unwrap(), Chunk::Last);
        assert_eq!(decode_chunk(b"5\r\nhello\r\n", 4).unwrap(), Chunk::TooLarge);
        assert_eq!(
            decode_chunk(b"5\r\nhello\r\n", 16).unwrap(),
            Chunk::Data {
                start: 3,
                len: 5,
                consumed: 10
            }
        );
        assert!(decode_chunk(b"zz\r\n", 16).is_err());
    }

    #[test]
    fn decode_chunk_refuses_sizes_near_usize_max() {
        assert_eq!(
            decode_chunk(b"ffffffffffffffff\r\nxx", usize::MAX).unwrap(),
            Chunk::TooLarge
        );
    }

    #[test]
    fn oversized_chunk_fails_before_its_data_arrives() {
        let mut parser = ResponseParser::new(8);
        let head = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n";
        assert_eq!(parser.feed(head).unwrap(), None);
        assert_eq!(
            parser.feed(b"4\r\nabcd\r\n5\r\n"),
            Err(TransferError::ResponseTooLarge { limit: 8 })
        );
    }

    #[test]
    fn overflowing_chunk_size_is_an_error() {
        let mut parser = ResponseParser::new(1024);
        let data = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
            1\r\na\r\nffffffffffffffff\r\nxxxxxxxx";
        assert_eq!(
            parser.feed(data),
            Err(TransferError::ResponseTooLarge { limit: 1024 })
        );
    }
}
