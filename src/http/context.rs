// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Streaming request decoder.
//!
//! The context consumes whatever complete lines the session buffer holds
//! and leaves partial ones for the next read, so it can be fed byte by
//! byte. A parse failure is permanent: every later call reports the same
//! error until [`HttpContext::reset`].

use std::time::Instant;

use memchr::memchr;

use crate::buffer::Buffer;

use super::{HttpRequest, Method, ParseError, Version};

/// Default cap on a declared request body.
pub const DEFAULT_MAX_BODY: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    ExpectRequestLine,
    ExpectHeaders,
    ExpectBody,
    Done,
}

/// Decoder state carried across reads of one connection.
#[derive(Debug)]
pub struct HttpContext {
    state: ParseState,
    request: HttpRequest,
    body_remaining: usize,
    max_body: usize,
    failed: Option<ParseError>,
}

impl Default for HttpContext {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpContext {
    /// Creates a decoder with the default body cap.
    pub fn new() -> Self {
        Self::with_max_body(DEFAULT_MAX_BODY)
    }

    /// Creates a decoder rejecting bodies larger than `max_body`.
    pub fn with_max_body(max_body: usize) -> Self {
        Self {
            state: ParseState::ExpectRequestLine,
            request: HttpRequest::new(),
            body_remaining: 0,
            max_body,
            failed: None,
        }
    }

    /// Advances the decoder as far as the buffered bytes allow.
    ///
    /// `Ok(())` means no error so far; completion is a separate question
    /// answered by [`is_done`](Self::is_done) since a request can span many
    /// reads.
    pub fn parse(&mut self, buf: &mut Buffer, recv_time: Instant) -> Result<(), ParseError> {
        if let Some(err) = self.failed {
            return Err(err);
        }
        self.advance(buf, recv_time).inspect_err(|&err| {
            self.failed = Some(err);
        })
    }

    /// True once a full request has been decoded.
    pub fn is_done(&self) -> bool {
        self.state == ParseState::Done
    }

    /// The request decoded so far.
    pub fn request(&self) -> &HttpRequest {
        &self.request
    }

    /// Returns the decoder to its initial state with a fresh request.
    pub fn reset(&mut self) {
        self.state = ParseState::ExpectRequestLine;
        self.request = HttpRequest::new();
        self.body_remaining = 0;
        self.failed = None;
    }

    fn advance(&mut self, buf: &mut Buffer, recv_time: Instant) -> Result<(), ParseError> {
        loop {
            match self.state {
                ParseState::ExpectRequestLine => {
                    let Some(eol) = buf.find_crlf() else {
                        return Ok(());
                    };
                    self.process_request_line(&buf.peek()[..eol])?;
                    self.request.recv_time = Some(recv_time);
                    buf.consume(eol + 2);
                    self.state = ParseState::ExpectHeaders;
                }
                ParseState::ExpectHeaders => {
                    let Some(eol) = buf.find_crlf() else {
                        return Ok(());
                    };
                    if eol == 0 {
                        buf.consume(2);
                        self.process_end_of_headers()?;
                    } else {
                        self.process_header_line(&buf.peek()[..eol])?;
                        buf.consume(eol + 2);
                    }
                }
                ParseState::ExpectBody => {
                    if buf.readable_bytes() < self.body_remaining {
                        return Ok(());
                    }
                    self.request.body = buf.take(self.body_remaining);
                    self.body_remaining = 0;
                    self.state = ParseState::Done;
                }
                ParseState::Done => return Ok(()),
            }
        }
    }

    /// `METHOD SP PATH[?QUERY] SP VERSION`
    fn process_request_line(&mut self, line: &[u8]) -> Result<(), ParseError> {
        let mut parts = line.splitn(3, |&b| b == b' ');
        let method = parts.next().ok_or(ParseError::Method)?;
        let target = parts.next().ok_or(ParseError::Target)?;
        let version = parts.next().ok_or(ParseError::Version)?;

        self.request.method = Some(Method::from_bytes(method)?);
        self.request.version = Some(Version::from_bytes(version)?);

        if target.is_empty() || target.iter().any(|&b| b <= b' ' || b == 0x7f) {
            return Err(ParseError::Target);
        }
        let target = std::str::from_utf8(target).map_err(|_| ParseError::Target)?;
        match target.split_once('?') {
            Some((path, query)) => {
                self.request.path = path.to_owned();
                self.request.query = Some(query.to_owned());
            }
            None => self.request.path = target.to_owned(),
        }
        Ok(())
    }

    /// `field-name ":" OWS field-value OWS`
    fn process_header_line(&mut self, line: &[u8]) -> Result<(), ParseError> {
        let colon = memchr(b':', line).ok_or(ParseError::Header)?;
        let name = &line[..colon];
        if name.is_empty() || !name.iter().all(|&b| is_header_name_byte(b)) {
            return Err(ParseError::Header);
        }
        let value = trim_ows(&line[colon + 1..]);

        let name = std::str::from_utf8(name)
            .map_err(|_| ParseError::Header)?
            .to_owned();
        let value = std::str::from_utf8(value)
            .map_err(|_| ParseError::Header)?
            .to_owned();
        self.request.add_header(name, value);
        Ok(())
    }

    /// Empty line: decide between a body and completion.
    fn process_end_of_headers(&mut self) -> Result<(), ParseError> {
        if let Some(encoding) = self.request.header("Transfer-Encoding") {
            if !encoding.trim().eq_ignore_ascii_case("identity") {
                return Err(ParseError::TransferEncoding);
            }
        }
        let length = match self.request.header("Content-Length") {
            Some(value) => value
                .trim()
                .parse::<usize>()
                .map_err(|_| ParseError::ContentLength)?,
            None => 0,
        };
        if length > self.max_body {
            return Err(ParseError::BodyTooLarge);
        }
        if length > 0 {
            self.body_remaining = length;
            self.state = ParseState::ExpectBody;
        } else {
            self.state = ParseState::Done;
        }
        Ok(())
    }
}

/// RFC 9110 token bytes, the only ones legal in a field name.
fn is_header_name_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

/// Strips optional whitespace (SP / HTAB) from both ends.
fn trim_ows(mut bytes: &[u8]) -> &[u8] {
    while let [b' ' | b'\t', rest @ ..] = bytes {
        bytes = rest;
    }
    while let [rest @ .., b' ' | b'\t'] = bytes {
        bytes = rest;
    }
    bytes
}

#[cfg(test)]
mod test {
    use std::time::Instant;

    use crate::buffer::Buffer;
    use crate::http::{Method, ParseError, Version};

    use super::HttpContext;

    fn parse_all(input: &[u8]) -> (HttpContext, Result<(), ParseError>) {
        let mut ctx = HttpContext::new();
        let mut buf = Buffer::new();
        buf.append(input);
        let result = ctx.parse(&mut buf, Instant::now());
        (ctx, result)
    }

    #[test]
    fn parses_a_full_request_with_query() {
        let (ctx, result) =
            parse_all(b"GET /x?y=1 HTTP/1.1\r\nHost: h\r\nUser-Agent: a\r\n\r\n");
        result.unwrap();
        assert!(ctx.is_done());

        let req = ctx.request();
        assert_eq!(Some(Method::Get), req.method());
        assert_eq!("/x", req.path());
        assert_eq!(Some("y=1"), req.query());
        assert_eq!(Some(Version::H1_1), req.version());
        assert_eq!(Some("h"), req.header("Host"));
        assert_eq!(Some("a"), req.header("User-Agent"));
        assert!(req.body().is_empty());
    }

    #[test]
    fn decodes_byte_by_byte_to_the_same_request() {
        let input: &[u8] = b"POST /submit HTTP/1.1\r\nHost: h\r\nContent-Length: 4\r\n\r\nword";
        let mut ctx = HttpContext::new();
        let mut buf = Buffer::new();
        let now = Instant::now();
        for &b in input {
            buf.append(&[b]);
            ctx.parse(&mut buf, now).unwrap();
        }
        assert!(ctx.is_done());
        let req = ctx.request();
        assert_eq!(Some(Method::Post), req.method());
        assert_eq!("/submit", req.path());
        assert_eq!(None, req.query());
        assert_eq!(b"word", req.body());
        assert_eq!(0, buf.readable_bytes());
    }

    #[test]
    fn rejects_unknown_version() {
        let (ctx, result) = parse_all(b"GET /x HTTP/9.9\r\n\r\n");
        assert_eq!(Err(ParseError::Version), result);
        assert!(!ctx.is_done());
    }

    #[test]
    fn rejects_unknown_method() {
        let (_, result) = parse_all(b"BREW /pot HTTP/1.1\r\n\r\n");
        assert_eq!(Err(ParseError::Method), result);
    }

    #[test]
    fn failure_is_permanent_until_reset() {
        let (mut ctx, result) = parse_all(b"GET /x HTTP/9.9\r\n\r\n");
        assert_eq!(Err(ParseError::Version), result);

        let mut buf = Buffer::new();
        buf.append(b"GET / HTTP/1.1\r\n\r\n");
        assert_eq!(Err(ParseError::Version), ctx.parse(&mut buf, Instant::now()));

        ctx.reset();
        ctx.parse(&mut buf, Instant::now()).unwrap();
        assert!(ctx.is_done());
    }

    #[test]
    fn rejects_chunked_transfer_encoding() {
        let (_, result) =
            parse_all(b"POST /x HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n");
        assert_eq!(Err(ParseError::TransferEncoding), result);
    }

    #[test]
    fn rejects_bodies_over_the_cap() {
        let mut ctx = HttpContext::with_max_body(16);
        let mut buf = Buffer::new();
        buf.append(b"POST /x HTTP/1.1\r\nContent-Length: 17\r\n\r\n");
        assert_eq!(
            Err(ParseError::BodyTooLarge),
            ctx.parse(&mut buf, Instant::now())
        );
    }

    #[test]
    fn rejects_malformed_content_length() {
        let (_, result) = parse_all(b"POST /x HTTP/1.1\r\nContent-Length: ten\r\n\r\n");
        assert_eq!(Err(ParseError::ContentLength), result);
    }

    #[test]
    fn header_values_are_ows_trimmed() {
        let (ctx, result) = parse_all(b"GET / HTTP/1.1\r\nHost: \t spaced out \t\r\n\r\n");
        result.unwrap();
        assert_eq!(Some("spaced out"), ctx.request().header("Host"));
    }

    #[test]
    fn rejects_header_without_colon() {
        let (_, result) = parse_all(b"GET / HTTP/1.1\r\nno-colon-here\r\n\r\n");
        assert_eq!(Err(ParseError::Header), result);
    }

    #[test]
    fn partial_request_line_waits_for_more_bytes() {
        let (ctx, result) = parse_all(b"GET / HTT");
        result.unwrap();
        assert!(!ctx.is_done());
    }

    #[test]
    fn reset_allows_the_next_pipelined_request() {
        let (mut ctx, result) = parse_all(b"GET /a HTTP/1.1\r\n\r\n");
        result.unwrap();
        assert!(ctx.is_done());
        ctx.reset();

        let mut buf = Buffer::new();
        buf.append(b"GET /b HTTP/1.0\r\n\r\n");
        ctx.parse(&mut buf, Instant::now()).unwrap();
        assert!(ctx.is_done());
        assert_eq!("/b", ctx.request().path());
        assert_eq!(Some(Version::H1_0), ctx.request().version());
    }
}
