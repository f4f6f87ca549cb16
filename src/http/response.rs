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

//! HTTP/1.x response serialisation.

use crate::buffer::Buffer;

/// Status codes produced by this server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Response not filled in yet.
    Unknown,
    /// 200
    Ok,
    /// 301
    MovedPermanently,
    /// 400
    BadRequest,
    /// 404
    NotFound,
}

impl Status {
    /// Numeric status code.
    pub fn code(self) -> u16 {
        match self {
            Self::Unknown => 0,
            Self::Ok => 200,
            Self::MovedPermanently => 301,
            Self::BadRequest => 400,
            Self::NotFound => 404,
        }
    }

    /// Canonical reason phrase.
    pub fn reason(self) -> &'static str {
        match self {
            Self::Unknown => "",
            Self::Ok => "OK",
            Self::MovedPermanently => "Moved Permanently",
            Self::BadRequest => "Bad Request",
            Self::NotFound => "Not Found",
        }
    }
}

/// A response under construction by the application callback.
#[derive(Debug)]
pub struct HttpResponse {
    status: Status,
    close_connection: bool,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl HttpResponse {
    /// Creates an empty response; `close_connection` carries the keep-alive
    /// decision made from the request.
    pub fn new(close_connection: bool) -> Self {
        Self {
            status: Status::Unknown,
            close_connection,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// Sets the status line.
    pub fn set_status(&mut self, status: Status) {
        self.status = status;
    }

    /// Overrides the keep-alive decision.
    pub fn set_close_connection(&mut self, close: bool) {
        self.close_connection = close;
    }

    /// True when the connection closes after this response.
    pub fn close_connection(&self) -> bool {
        self.close_connection
    }

    /// Adds a header; a duplicate name replaces the previous value.
    pub fn add_header(&mut self, name: &str, value: &str) {
        match self
            .headers
            .iter_mut()
            .find(|(stored, _)| stored.eq_ignore_ascii_case(name))
        {
            Some((_, stored_value)) => *stored_value = value.to_owned(),
            None => self.headers.push((name.to_owned(), value.to_owned())),
        }
    }

    /// Sets the `Content-Type` header.
    pub fn set_content_type(&mut self, content_type: &str) {
        self.add_header("Content-Type", content_type);
    }

    /// Sets the response body.
    pub fn set_body(&mut self, body: impl Into<Vec<u8>>) {
        self.body = body.into();
    }

    /// Serialises the response into `out`.
    ///
    /// A keep-alive response carries `Content-Length` so the peer can frame
    /// it; a closing response announces `Connection: close` and frames by
    /// the close itself.
    pub fn append_to(&self, out: &mut Buffer) {
        out.append(format!("HTTP/1.1 {} {}\r\n", self.status.code(), self.status.reason()).as_bytes());
        if self.close_connection {
            out.append(b"Connection: close\r\n");
        } else {
            out.append(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
            out.append(b"Connection: Keep-Alive\r\n");
        }
        for (name, value) in &self.headers {
            out.append(name.as_bytes());
            out.append(b": ");
            out.append(value.as_bytes());
            out.append(b"\r\n");
        }
        out.append(b"\r\n");
        out.append(&self.body);
    }
}

#[cfg(test)]
mod test {
    use crate::buffer::Buffer;

    use super::{HttpResponse, Status};

    #[test]
    fn keep_alive_response_serialises_with_content_length() {
        let mut response = HttpResponse::new(false);
        response.set_status(Status::Ok);
        response.set_content_type("text/plain");
        response.set_body("hello");

        let mut out = Buffer::new();
        response.append_to(&mut out);
        assert_eq!(
            "HTTP/1.1 200 OK\r\nContent-Length: 5\r\nConnection: Keep-Alive\r\n\
             Content-Type: text/plain\r\n\r\nhello",
            out.take_all_string()
        );
    }

    #[test]
    fn closing_response_announces_connection_close() {
        let mut response = HttpResponse::new(true);
        response.set_status(Status::NotFound);

        let mut out = Buffer::new();
        response.append_to(&mut out);
        assert_eq!(
            "HTTP/1.1 404 Not Found\r\nConnection: close\r\n\r\n",
            out.take_all_string()
        );
    }

    #[test]
    fn duplicate_header_is_replaced() {
        let mut response = HttpResponse::new(true);
        response.set_status(Status::Ok);
        response.set_content_type("text/html");
        response.set_content_type("application/json");

        let mut out = Buffer::new();
        response.append_to(&mut out);
        let text = out.take_all_string();
        assert_eq!(1, text.matches("Content-Type").count());
        assert!(text.contains("Content-Type: application/json\r\n"));
    }
}
