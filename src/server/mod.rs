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

//! TCP server: acceptor, per-connection state machines, and the listener
//! server tying them to a reactor pool.

mod acceptor;
mod connection;
mod tcp_server;

pub use connection::{
    default_on_connect, default_on_message, ConnectionCallback, HighWaterCallback,
    MessageCallback, TcpConnection, WriteCompleteCallback, DEFAULT_HIGH_WATER_MARK,
};
pub use tcp_server::TcpServer;
