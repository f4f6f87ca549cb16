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

//! Minimal HTTP/1.x layer: a streaming request decoder over the session
//! buffer, response serialisation, and a server tying both to
//! [`TcpServer`](crate::server::TcpServer).

use std::fmt::Display;

use thiserror::Error;

pub mod context;
pub mod request;
pub mod response;
mod server;

pub use context::HttpContext;
pub use request::HttpRequest;
pub use response::{HttpResponse, Status};
pub use server::{HttpCallback, HttpServer};

/// Representation of the requested HTTP method.
/// [IETF RFC 9110 Section 9](https://www.rfc-editor.org/rfc/rfc9110#section-9)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// RFC 9110 9.3.1
    Get,
    /// RFC 9110 9.3.3
    Post,
    /// RFC 9110 9.3.2
    Head,
    /// RFC 9110 9.3.4
    Put,
    /// RFC 9110 9.3.5
    Delete,
}

impl Method {
    /// Parses the request-line method token; anything outside the supported
    /// set is a parse failure.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        match bytes {
            b"GET" => Ok(Self::Get),
            b"POST" => Ok(Self::Post),
            b"HEAD" => Ok(Self::Head),
            b"PUT" => Ok(Self::Put),
            b"DELETE" => Ok(Self::Delete),
            _ => Err(ParseError::Method),
        }
    }
}

impl Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Head => "HEAD",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
        })
    }
}

/// Representation of the requested HTTP version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    /// HTTP/1.0
    H1_0,
    /// HTTP/1.1
    H1_1,
}

impl Version {
    /// Parses the request-line version token, accepting exactly `HTTP/1.0`
    /// and `HTTP/1.1`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        match bytes {
            b"HTTP/1.0" => Ok(Self::H1_0),
            b"HTTP/1.1" => Ok(Self::H1_1),
            _ => Err(ParseError::Version),
        }
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::H1_0 => "HTTP/1.0",
            Self::H1_1 => "HTTP/1.1",
        })
    }
}

/// Represents possible failures while parsing a request.
///
/// A failed parse is permanent for the connection: the caller answers
/// `400 Bad Request` and shuts down.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    /// Unknown or malformed method.
    #[error("invalid token in method")]
    Method,
    /// Invalid byte in target.
    #[error("invalid token in target")]
    Target,
    /// Unsupported HTTP version.
    #[error("invalid version")]
    Version,
    /// Malformed header line.
    #[error("invalid header line")]
    Header,
    /// Unparsable `Content-Length` value.
    #[error("invalid content length")]
    ContentLength,
    /// Declared body exceeds the configured cap.
    #[error("body exceeds size limit")]
    BodyTooLarge,
    /// `Transfer-Encoding` other than identity (chunked is unsupported).
    #[error("unsupported transfer encoding")]
    TransferEncoding,
}
