//! Small HTTP server on port 8080 with a fixed route table.

use std::io::Result;
use std::sync::Arc;

use snar::http::{HttpServer, Status};
use snar::Reactor;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut reactor = Reactor::new()?;
    let server = HttpServer::new(
        &reactor.handle(),
        "127.0.0.1:8080".parse().unwrap(),
        "demo",
        false,
    )?;
    server.set_reactor_count(4);
    server.set_http_callback(Arc::new(|request, response| {
        match request.path() {
            "/" => {
                response.set_status(Status::Ok);
                response.set_content_type("text/html");
                response.set_body("<html><body><h1>hello</h1></body></html>");
            }
            "/hello" => {
                response.set_status(Status::Ok);
                response.set_content_type("text/plain");
                let who = request.query().unwrap_or("world");
                response.set_body(format!("hello, {who}\n"));
            }
            "/old" => {
                response.set_status(Status::MovedPermanently);
                response.add_header("Location", "/");
            }
            _ => {
                response.set_status(Status::NotFound);
                response.set_close_connection(true);
            }
        };
    }));
    server.start()?;

    reactor.run();
    Ok(())
}
