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

#![deny(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unused_imports
)]
// Disallow warnings in examples.
#![doc(test(attr(deny(warnings))))]

//! snar is a non-blocking TCP networking runtime built on the
//! reactor-per-thread model: one controller reactor accepts connections and
//! hands each one to a fixed pool of worker reactors, each driving its own
//! event loop on a dedicated thread.
//!
//! Applications register callbacks on a [`server::TcpServer`] and never touch
//! sockets or threads directly. Received bytes land in a [`buffer::Buffer`],
//! responses are written back through the owning connection, and timers run
//! on the reactor that created them. A minimal HTTP/1.x server
//! ([`http::HttpServer`]) is layered on top as the first consumer.

pub mod buffer;
pub mod codec;
pub mod http;
pub mod net;
pub mod reactor;
pub mod server;

pub use buffer::Buffer;
pub use reactor::{Reactor, ReactorHandle, TimerId};
pub use server::{TcpConnection, TcpServer};
