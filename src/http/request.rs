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

//! Parsed HTTP/1.x request.

use std::time::Instant;

use super::{Method, Version};

/// A request assembled by [`HttpContext`](super::HttpContext).
///
/// Fields stay `None` until the decoder has seen the corresponding part of
/// the request line.
#[derive(Debug, Default)]
pub struct HttpRequest {
    pub(crate) method: Option<Method>,
    pub(crate) path: String,
    pub(crate) query: Option<String>,
    pub(crate) version: Option<Version>,
    pub(crate) headers: Vec<(String, String)>,
    pub(crate) body: Vec<u8>,
    pub(crate) recv_time: Option<Instant>,
}

impl HttpRequest {
    /// Creates an empty request.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request method.
    pub fn method(&self) -> Option<Method> {
        self.method
    }

    /// Request path, without the query.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Query string, the part after the first `?` of the target.
    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// HTTP version of the request line.
    pub fn version(&self) -> Option<Version> {
        self.version
    }

    /// Header lookup, ASCII case-insensitive on the name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(stored, _)| stored.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// All headers, in first-seen order with first-seen name casing.
    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    /// Request body; empty unless `Content-Length` said otherwise.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Demultiplexer timestamp of the read that started this request.
    pub fn recv_time(&self) -> Option<Instant> {
        self.recv_time
    }

    /// Inserts a header. Duplicate names keep the first-seen casing and the
    /// last-seen value.
    pub(crate) fn add_header(&mut self, name: String, value: String) {
        match self
            .headers
            .iter_mut()
            .find(|(stored, _)| stored.eq_ignore_ascii_case(&name))
        {
            Some((_, stored_value)) => *stored_value = value,
            None => self.headers.push((name, value)),
        }
    }
}

#[cfg(test)]
mod test {
    use super::HttpRequest;

    #[test]
    fn header_lookup_is_case_insensitive() {
        let mut req = HttpRequest::new();
        req.add_header("Host".to_owned(), "example.org".to_owned());
        assert_eq!(Some("example.org"), req.header("host"));
        assert_eq!(Some("example.org"), req.header("HOST"));
        assert_eq!(None, req.header("User-Agent"));
    }

    #[test]
    fn duplicate_header_keeps_first_case_and_last_value() {
        let mut req = HttpRequest::new();
        req.add_header("Accept".to_owned(), "text/html".to_owned());
        req.add_header("ACCEPT".to_owned(), "*/*".to_owned());
        let headers: Vec<_> = req.headers().collect();
        assert_eq!(vec![("Accept", "*/*")], headers);
    }
}
