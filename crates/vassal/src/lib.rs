//! # vassal
//!
//! A prefork request-serving core: a master process owns the listening
//! sockets and the shared process table, forks workers, and enforces
//! harakiri deadlines; each worker multiplexes its cores over the sockets
//! and reports to an optional supervisor.
//!
//! ```text
//!   ┌──────────────── master ────────────────┐
//!   │ sockets   process table   monitor scan │
//!   └────┬───────────────┬──────────────┬────┘
//!        │ fork          │ fork         │ SIGKILL on expiry
//!   ┌────▼─────┐    ┌────▼─────┐        │
//!   │ worker 1 │    │ worker 2 │ ◄──────┘
//!   │ core 0..N│    │ core 0..N│
//!   └──────────┘    └──────────┘
//! ```
//!
//! # Quick start
//!
//! ```ignore
//! use std::sync::Arc;
//! use vassal::{Application, LineProtocol, RequestContext, Server, ServerConfig};
//!
//! struct Hello;
//!
//! impl Application for Hello {
//!     fn handle(&self, ctx: &mut RequestContext<'_>) -> i32 {
//!         ctx.start_response(200, "OK");
//!         let _ = ctx.write(b"hello\n");
//!         0
//!     }
//! }
//!
//! let config = ServerConfig::from_env().listen(vec!["127.0.0.1:3031".into()]);
//! let server = Server::new(config, Arc::new(Hello), Arc::new(LineProtocol::default()))?;
//! server.run()?;
//! ```

mod server;

pub use server::{Server, SignalSender};

pub use vassal_core::{
    Application, AsyncId, Clock, CoreError, CoreResult, HarakiriKind, Protocol, ReceiveStatus,
    Request, RequestContext, SupervisorLink, SystemClock, Transformation,
};
pub use vassal_runtime::{
    init_logging, ConfigError, LineProtocol, ProcessTable, ServerConfig, SignalHandler,
    SignalTable, WorkerContext,
};
