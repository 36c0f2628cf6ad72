//! vassal echo server
//!
//! Echoes the body of every line-protocol request back to the client,
//! prefixed with the request's `PATH_INFO`.
//!
//! Usage:
//!     cargo build --release -p vassal-echo
//!     VASSAL_WORKERS=4 VASSAL_HARAKIRI=30 ./target/release/vassal-echo
//!
//! Test with:
//!     printf 'PATH_INFO=/ping\n\nhello' | nc -q1 127.0.0.1 3031

use std::process::ExitCode;
use std::sync::Arc;

use tracing::error;
use vassal::{init_logging, Application, LineProtocol, RequestContext, Server, ServerConfig};

struct Echo;

impl Application for Echo {
    fn handle(&self, ctx: &mut RequestContext<'_>) -> i32 {
        let path = ctx.var("PATH_INFO").unwrap_or(b"/").to_vec();
        let body = ctx.payload().to_vec();

        ctx.start_response(200, "OK");
        ctx.add_header(format!("Content-Length: {}", path.len() + 1 + body.len()));
        for chunk in [&path[..], &b"\n"[..], &body[..]] {
            if ctx.write(chunk).is_err() {
                return 1;
            }
        }
        0
    }
}

fn main() -> ExitCode {
    init_logging();

    let config = ServerConfig::from_env();
    let protocol = Arc::new(LineProtocol::new(std::time::Duration::from_secs(
        config.socket_timeout,
    )));
    let server = match Server::new(config, Arc::new(Echo), protocol) {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "invalid server setup");
            return ExitCode::FAILURE;
        }
    };

    match server.run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "server stopped");
            ExitCode::FAILURE
        }
    }
}
