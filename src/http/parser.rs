// SPDX-License-Identifier: MIT OR Apache-2.0

//! Incremental HTTP/1.1 response parser.
//!
//! Feed raw socket bytes in with [`ResponseParser::push`]; events come out
//! as headers-complete, body fragments, and a final done marker carrying
//! keep-alive eligibility. The parser handles `Content-Length`, chunked
//! transfer encoding, and read-until-close bodies, and never emits a body
//! fragment that spans an undecoded chunk boundary.

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};

use crate::error::{CouchError, Result};

/// Parser output events, in stream order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseEvent {
    /// Status line and headers are complete.
    Header,
    /// One decoded body fragment.
    Body(Bytes),
    /// Response complete. `keep_alive` says the connection may be pooled.
    Done { keep_alive: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    StatusLine,
    Headers,
    Body,
    ChunkSize,
    ChunkData,
    ChunkDataCrlf,
    Trailers,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyMode {
    ContentLength(u64),
    Chunked,
    /// No framing: body runs to connection close.
    Eof,
    None,
}

/// Streaming response parser; one instance per response.
#[derive(Debug)]
pub struct ResponseParser {
    buf: BytesMut,
    state: State,
    body_mode: BodyMode,
    chunk_remaining: u64,
    status: StatusCode,
    version_11: bool,
    headers: HeaderMap,
    connection_close: bool,
    /// HEAD responses and 204/304 carry no body regardless of headers.
    head_request: bool,
}

impl ResponseParser {
    #[must_use]
    pub fn new(head_request: bool) -> Self {
        Self {
            buf: BytesMut::with_capacity(4096),
            state: State::StatusLine,
            body_mode: BodyMode::None,
            chunk_remaining: 0,
            status: StatusCode::OK,
            version_11: true,
            headers: HeaderMap::new(),
            connection_close: false,
            head_request,
        }
    }

    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.state == State::Done
    }

    /// Whether the connection can go back to the pool once done.
    #[must_use]
    pub fn keep_alive(&self) -> bool {
        if self.connection_close || !self.version_11 {
            return false;
        }
        // An EOF-delimited body consumes the connection by definition.
        !matches!(self.body_mode, BodyMode::Eof)
    }

    fn take_line(&mut self) -> Option<String> {
        let pos = self.buf.windows(2).position(|w| w == b"\r\n")?;
        let line = self.buf.split_to(pos + 2);
        Some(String::from_utf8_lossy(&line[..pos]).into_owned())
    }

    /// Feed bytes and collect every event they complete.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<ParseEvent>> {
        self.buf.extend_from_slice(data);
        let mut events = Vec::new();

        loop {
            match self.state {
                State::StatusLine => {
                    let Some(line) = self.take_line() else { break };
                    let mut parts = line.splitn(3, ' ');
                    let version = parts.next().unwrap_or_default();
                    self.version_11 = version.eq_ignore_ascii_case("HTTP/1.1");
                    if !version.starts_with("HTTP/1.") {
                        return Err(CouchError::Protocol(format!(
                            "bad HTTP version {version:?}"
                        )));
                    }
                    let code = parts.next().unwrap_or_default();
                    self.status = code.parse::<u16>().ok().and_then(|c| StatusCode::from_u16(c).ok()).ok_or_else(
                        || CouchError::Protocol(format!("bad HTTP status {code:?}")),
                    )?;
                    self.state = State::Headers;
                }

                State::Headers => {
                    let Some(line) = self.take_line() else { break };
                    if line.is_empty() {
                        self.finish_headers(&mut events)?;
                        continue;
                    }
                    let Some((name, value)) = line.split_once(':') else {
                        return Err(CouchError::Protocol(format!("bad header line {line:?}")));
                    };
                    let name = HeaderName::from_bytes(name.trim().as_bytes())
                        .map_err(|e| CouchError::Protocol(format!("bad header name: {e}")))?;
                    let value = HeaderValue::from_str(value.trim())
                        .map_err(|e| CouchError::Protocol(format!("bad header value: {e}")))?;
                    self.headers.append(name, value);
                }

                State::Body => match self.body_mode {
                    BodyMode::ContentLength(remaining) => {
                        if self.buf.is_empty() {
                            break;
                        }
                        let take = (self.buf.len() as u64).min(remaining) as usize;
                        let fragment = self.buf.split_to(take).freeze();
                        let left = remaining - take as u64;
                        events.push(ParseEvent::Body(fragment));
                        if left == 0 {
                            self.state = State::Done;
                            events.push(ParseEvent::Done {
                                keep_alive: self.keep_alive(),
                            });
                        } else {
                            self.body_mode = BodyMode::ContentLength(left);
                            break;
                        }
                    }
                    BodyMode::Eof => {
                        if self.buf.is_empty() {
                            break;
                        }
                        let fragment = self.buf.split().freeze();
                        events.push(ParseEvent::Body(fragment));
                        break;
                    }
                    _ => {
                        return Err(CouchError::Internal(
                            "body state with no body mode".into(),
                        ))
                    }
                },

                State::ChunkSize => {
                    let Some(line) = self.take_line() else { break };
                    let size_str = line.split(';').next().unwrap_or_default().trim();
                    let size = u64::from_str_radix(size_str, 16).map_err(|_| {
                        CouchError::Protocol(format!("bad chunk size {size_str:?}"))
                    })?;
                    if size == 0 {
                        self.state = State::Trailers;
                    } else {
                        self.chunk_remaining = size;
                        self.state = State::ChunkData;
                    }
                }

                State::ChunkData => {
                    if self.buf.is_empty() {
                        break;
                    }
                    let take = (self.buf.len() as u64).min(self.chunk_remaining) as usize;
                    let fragment = self.buf.split_to(take).freeze();
                    self.chunk_remaining -= take as u64;
                    events.push(ParseEvent::Body(fragment));
                    if self.chunk_remaining == 0 {
                        self.state = State::ChunkDataCrlf;
                    } else {
                        break;
                    }
                }

                State::ChunkDataCrlf => {
                    if self.buf.len() < 2 {
                        break;
                    }
                    let crlf = self.buf.split_to(2);
                    if &crlf[..] != b"\r\n" {
                        return Err(CouchError::Protocol("chunk not CRLF-terminated".into()));
                    }
                    self.state = State::ChunkSize;
                }

                State::Trailers => {
                    let Some(line) = self.take_line() else { break };
                    if line.is_empty() {
                        self.state = State::Done;
                        events.push(ParseEvent::Done {
                            keep_alive: self.keep_alive(),
                        });
                    }
                }

                State::Done => break,
            }
        }

        Ok(events)
    }

    fn finish_headers(&mut self, events: &mut Vec<ParseEvent>) -> Result<()> {
        self.connection_close = self
            .headers
            .get(http::header::CONNECTION)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.eq_ignore_ascii_case("close"));

        let chunked = self
            .headers
            .get(http::header::TRANSFER_ENCODING)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"));

        let no_body = self.head_request
            || self.status == StatusCode::NO_CONTENT
            || self.status == StatusCode::NOT_MODIFIED
            || self.status.is_informational();

        events.push(ParseEvent::Header);

        if no_body {
            self.body_mode = BodyMode::None;
            self.state = State::Done;
            events.push(ParseEvent::Done {
                keep_alive: self.keep_alive(),
            });
            return Ok(());
        }

        if chunked {
            self.body_mode = BodyMode::Chunked;
            self.state = State::ChunkSize;
        } else if let Some(len) = self
            .headers
            .get(http::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
        {
            if len == 0 {
                self.body_mode = BodyMode::ContentLength(0);
                self.state = State::Done;
                events.push(ParseEvent::Done {
                    keep_alive: self.keep_alive(),
                });
            } else {
                self.body_mode = BodyMode::ContentLength(len);
                self.state = State::Body;
            }
        } else {
            self.body_mode = BodyMode::Eof;
            self.state = State::Body;
        }
        Ok(())
    }

    /// Signal connection EOF. Legal only for EOF-delimited bodies; framed
    /// bodies cut short are protocol errors.
    pub fn finish(&mut self) -> Result<ParseEvent> {
        match (self.state, self.body_mode) {
            (State::Done, _) => Ok(ParseEvent::Done {
                keep_alive: self.keep_alive(),
            }),
            (State::Body, BodyMode::Eof) => {
                self.state = State::Done;
                Ok(ParseEvent::Done { keep_alive: false })
            }
            _ => Err(CouchError::Network(
                "connection closed mid-response".into(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_all(parser: &mut ResponseParser, data: &[u8]) -> Vec<ParseEvent> {
        parser.push(data).unwrap()
    }

    fn body_of(events: &[ParseEvent]) -> Vec<u8> {
        events
            .iter()
            .filter_map(|e| match e {
                ParseEvent::Body(b) => Some(b.to_vec()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    #[test]
    fn test_content_length_response() {
        let mut parser = ResponseParser::new(false);
        let events = feed_all(
            &mut parser,
            b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 5\r\n\r\nhello",
        );
        assert_eq!(events[0], ParseEvent::Header);
        assert_eq!(body_of(&events), b"hello");
        assert!(matches!(
            events.last(),
            Some(ParseEvent::Done { keep_alive: true })
        ));
        assert_eq!(parser.status(), StatusCode::OK);
    }

    #[test]
    fn test_split_across_reads() {
        let mut parser = ResponseParser::new(false);
        let full = b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n0123456789";
        let mut all = Vec::new();
        // One byte at a time: no event may fire early, none may be lost.
        for b in full.iter() {
            all.extend(parser.push(std::slice::from_ref(b)).unwrap());
        }
        assert_eq!(all[0], ParseEvent::Header);
        assert_eq!(body_of(&all), b"0123456789");
        assert!(parser.is_done());
    }

    #[test]
    fn test_chunked_response() {
        let mut parser = ResponseParser::new(false);
        let events = feed_all(
            &mut parser,
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
              4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n",
        );
        assert_eq!(body_of(&events), b"Wikipedia");
        assert!(matches!(
            events.last(),
            Some(ParseEvent::Done { keep_alive: true })
        ));
    }

    #[test]
    fn test_connection_close_disables_keep_alive() {
        let mut parser = ResponseParser::new(false);
        let events = feed_all(
            &mut parser,
            b"HTTP/1.1 200 OK\r\nConnection: close\r\nContent-Length: 2\r\n\r\nok",
        );
        assert!(matches!(
            events.last(),
            Some(ParseEvent::Done { keep_alive: false })
        ));
    }

    #[test]
    fn test_eof_delimited_body() {
        let mut parser = ResponseParser::new(false);
        let events = feed_all(&mut parser, b"HTTP/1.0 200 OK\r\n\r\npartial");
        assert_eq!(body_of(&events), b"partial");
        assert!(!parser.is_done());
        let done = parser.finish().unwrap();
        assert_eq!(done, ParseEvent::Done { keep_alive: false });
    }

    #[test]
    fn test_no_content_has_no_body() {
        let mut parser = ResponseParser::new(false);
        let events = feed_all(&mut parser, b"HTTP/1.1 204 No Content\r\n\r\n");
        assert_eq!(events[0], ParseEvent::Header);
        assert!(matches!(events[1], ParseEvent::Done { .. }));
    }

    #[test]
    fn test_redirect_headers_exposed() {
        let mut parser = ResponseParser::new(false);
        let events = feed_all(
            &mut parser,
            b"HTTP/1.1 302 Found\r\nLocation: http://other:8092/x\r\nContent-Length: 0\r\n\r\n",
        );
        assert!(matches!(events[0], ParseEvent::Header));
        assert_eq!(
            parser.headers().get(http::header::LOCATION).unwrap(),
            "http://other:8092/x"
        );
        assert!(parser.is_done());
    }

    #[test]
    fn test_truncated_framed_body_is_error() {
        let mut parser = ResponseParser::new(false);
        let _ = feed_all(&mut parser, b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nabc");
        assert!(parser.finish().is_err());
    }

    #[test]
    fn test_bad_chunk_size_rejected() {
        let mut parser = ResponseParser::new(false);
        let res = parser.push(
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\nzz\r\n",
        );
        assert!(res.is_err());
    }
}
