//! HTTP request/response line parser (spec §6). Accepts RFC-2616-style
//! start lines and folded headers, emitting a structured record. This is
//! a from-scratch incremental parser rather than a port of the original's
//! hand-built character-class state table (`original_source/lem/http/core.c`)
//! — the externally observable contract (the fields in §6 and the §8
//! round-trip fixture) is what's preserved, not the table-driven DFA
//! implementation technique.

use crate::buffer::{StreamBuffer, StreamParser};
use crate::error::IoError;

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: String,
    pub uri: String,
    pub path: String,
    pub version: String,
    pub header_list: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub version: String,
    pub status: u16,
    pub text: String,
    pub header_list: Vec<(String, String)>,
}

fn percent_decode(raw: &str) -> Result<String, IoError> {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hi = *bytes.get(i + 1).ok_or(IoError::ParseError)?;
                let lo = *bytes.get(i + 2).ok_or(IoError::ParseError)?;
                let hi = (hi as char).to_digit(16).ok_or(IoError::ParseError)?;
                let lo = (lo as char).to_digit(16).ok_or(IoError::ParseError)?;
                out.push((hi * 16 + lo) as u8);
                i += 3;
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8(out).map_err(|_| IoError::ParseError)
}

fn split_path(uri: &str) -> Result<String, IoError> {
    let raw_path = uri.split('?').next().unwrap_or(uri);
    percent_decode(raw_path)
}

fn parse_header_block(lines: &[&str]) -> Result<Vec<(String, String)>, IoError> {
    let mut headers: Vec<(String, String)> = Vec::new();
    for line in lines {
        if line.starts_with(' ') || line.starts_with('\t') {
            let last = headers.last_mut().ok_or(IoError::ParseError)?;
            last.1.push(' ');
            last.1.push_str(line.trim());
        } else {
            let (name, value) = line.split_once(':').ok_or(IoError::ParseError)?;
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }
    Ok(headers)
}

fn find_header_block(buf: &[u8]) -> Option<usize> {
    buf.windows(HEADER_TERMINATOR.len())
        .position(|w| w == HEADER_TERMINATOR)
}

pub struct HttpRequestParser;

impl HttpRequestParser {
    pub fn new() -> Self {
        Self
    }
}

impl Default for HttpRequestParser {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamParser for HttpRequestParser {
    type Output = HttpRequest;

    fn parse(&mut self, buf: &mut StreamBuffer) -> Result<Option<HttpRequest>, IoError> {
        let Some(term_at) = find_header_block(buf.filled()) else {
            return Ok(None);
        };
        let text = std::str::from_utf8(&buf.filled()[..term_at]).map_err(|_| IoError::ParseError)?;
        let mut lines = text.split("\r\n");
        let request_line = lines.next().ok_or(IoError::ParseError)?;
        let mut parts = request_line.split(' ');
        let method = parts.next().ok_or(IoError::ParseError)?.to_string();
        let uri = parts.next().ok_or(IoError::ParseError)?.to_string();
        let http_version = parts.next().ok_or(IoError::ParseError)?;
        let version = http_version
            .strip_prefix("HTTP/")
            .ok_or(IoError::ParseError)?
            .to_string();
        let path = split_path(&uri)?;

        let header_lines: Vec<&str> = lines.collect();
        let header_list = parse_header_block(&header_lines)?;

        let consumed = term_at + HEADER_TERMINATOR.len();
        buf.consume(consumed);

        Ok(Some(HttpRequest {
            method,
            uri,
            path,
            version,
            header_list,
        }))
    }
}

pub struct HttpResponseParser;

impl HttpResponseParser {
    pub fn new() -> Self {
        Self
    }
}

impl Default for HttpResponseParser {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamParser for HttpResponseParser {
    type Output = HttpResponse;

    fn parse(&mut self, buf: &mut StreamBuffer) -> Result<Option<HttpResponse>, IoError> {
        let Some(term_at) = find_header_block(buf.filled()) else {
            return Ok(None);
        };
        let text = std::str::from_utf8(&buf.filled()[..term_at]).map_err(|_| IoError::ParseError)?;
        let mut lines = text.split("\r\n");
        let status_line = lines.next().ok_or(IoError::ParseError)?;
        let mut parts = status_line.splitn(3, ' ');
        let http_version = parts.next().ok_or(IoError::ParseError)?;
        let version = http_version
            .strip_prefix("HTTP/")
            .ok_or(IoError::ParseError)?
            .to_string();
        let status: u16 = parts
            .next()
            .ok_or(IoError::ParseError)?
            .parse()
            .map_err(|_| IoError::ParseError)?;
        let text_reason = parts.next().unwrap_or("").to_string();

        let header_lines: Vec<&str> = lines.collect();
        let header_list = parse_header_block(&header_lines)?;

        let consumed = term_at + HEADER_TERMINATOR.len();
        buf.consume(consumed);

        Ok(Some(HttpResponse {
            version,
            status,
            text: text_reason,
            header_list,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::DEFAULT_BUFFER_CAPACITY;

    #[test]
    fn request_round_trip_matches_fixture() {
        let mut buf = StreamBuffer::new(DEFAULT_BUFFER_CAPACITY);
        let input = b"GET /foo?bar=baz%20qux HTTP/1.1\r\nHost: x\r\nX: a\r\n b\r\n\r\n";
        buf.spare_mut()[..input.len()].copy_from_slice(input);
        buf.note_appended(input.len());

        let mut parser = HttpRequestParser::new();
        let req = parser.parse(&mut buf).unwrap().expect("fully buffered");

        assert_eq!(req.method, "GET");
        assert_eq!(req.uri, "/foo?bar=baz%20qux");
        assert_eq!(req.path, "/foo");
        assert_eq!(req.version, "1.1");
        assert_eq!(
            req.header_list,
            vec![
                ("Host".to_string(), "x".to_string()),
                ("X".to_string(), "a b".to_string()),
            ]
        );
    }

    #[test]
    fn incomplete_request_returns_none() {
        let mut buf = StreamBuffer::new(DEFAULT_BUFFER_CAPACITY);
        let input = b"GET / HTTP/1.1\r\nHost: x\r\n";
        buf.spare_mut()[..input.len()].copy_from_slice(input);
        buf.note_appended(input.len());

        let mut parser = HttpRequestParser::new();
        assert!(parser.parse(&mut buf).unwrap().is_none());
    }

    #[test]
    fn invalid_percent_escape_is_a_parse_error() {
        let mut buf = StreamBuffer::new(DEFAULT_BUFFER_CAPACITY);
        let input = b"GET /%zz HTTP/1.1\r\n\r\n";
        buf.spare_mut()[..input.len()].copy_from_slice(input);
        buf.note_appended(input.len());

        let mut parser = HttpRequestParser::new();
        assert!(matches!(parser.parse(&mut buf), Err(IoError::ParseError)));
    }
}
