// Copyright (C) 2025 Tom Waddington
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

//! # nREPL Server
//!
//! An async nREPL server speaking bencode over TCP. Code evaluation and
//! symbol lookup are delegated to pluggable [`Evaluator`] and
//! [`Introspector`] implementations; [`BuiltinEvaluator`] is a small
//! in-process engine that implements both.
//!
//! ## Example
//!
//! ```no_run
//! use nrepl_server::{BuiltinEvaluator, NReplServer, ServerConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = NReplServer::new(Arc::new(BuiltinEvaluator::new()));
//!     let handle = server.bind(&ServerConfig::new("127.0.0.1", 7888)).await?;
//!     println!("Listening on {}", handle.local_addr());
//!
//!     tokio::signal::ctrl_c().await?;
//!     handle.stop();
//!     handle.join().await?;
//!     Ok(())
//! }
//! ```

mod builtin;
pub mod codec;
mod connection;
mod error;
mod eval;
pub mod framer;
mod message;
mod ops;
mod server;
mod session;

pub use builtin::BuiltinEvaluator;
pub use codec::{Dict, Kind, Value};
pub use connection::{ResponseWriter, handle_connection};
pub use error::{NReplError, Result};
pub use eval::{
    Completion, DEFAULT_NAMESPACE, Eldoc, EvalContext, EvalError, EvalOutput, Evaluator,
    Introspector, SymbolInfo,
};
pub use framer::{FrameFormat, Framer};
pub use message::{Request, Response, UNKNOWN_ID};
pub use ops::{Dispatcher, Op};
pub use server::{DEFAULT_HOST, DEFAULT_PORT, NReplServer, ServerConfig, ServerHandle};
pub use session::{Session, SessionStore};
