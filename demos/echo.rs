//! Echo server on port 8080: everything received goes straight back.

use std::io::Result;
use std::sync::Arc;

use snar::{Reactor, TcpServer};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut reactor = Reactor::new()?;
    let server = TcpServer::new(
        &reactor.handle(),
        "127.0.0.1:8080".parse().unwrap(),
        "echo",
        false,
    )?;
    server.set_reactor_count(4);
    server.set_on_message(Arc::new(|conn, buf, _ts| {
        conn.send_buffer(buf);
    }));
    server.start()?;

    reactor.run();
    Ok(())
}
