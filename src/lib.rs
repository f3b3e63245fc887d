//! unimock
//!
//! A programmable HTTP mock server. Operators register triggers that match
//! inbound requests, each bound to an ordered scenario of steps that build the
//! response from placeholder templates. Everything is stored in SQLite and
//! served from in-memory caches.
//!
//! # Features
//!
//! - **Triggers**: Match the body by regex, JSON path existence or a JSON path
//!   predicate, plus expected header values
//! - **Scenarios**: Ordered template rendering and delay steps per trigger
//! - **Templates**: `${N}` placeholders filled from request headers
//! - **HTTP API**: CRUD for all three, a template preview endpoint and the
//!   catch-all mock endpoint
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use unimock::config::GlobalSettings;
//! use unimock::trigger::{Trigger, TriggerKind};
//! use unimock::{Database, Message, MockEngine};
//!
//! # async fn run() -> unimock::error::Result<()> {
//! let db = Arc::new(Database::open("unimock.db")?);
//! let engine = MockEngine::new(db, GlobalSettings::default());
//! engine.load().await?;
//!
//! engine
//!     .triggers()
//!     .add_trigger(Trigger::new(TriggerKind::Regex, "^ERR"))
//!     .await?;
//!
//! let reply = engine
//!     .process_inbound_message(&Message::new("ERR: disk full"))
//!     .await?;
//! assert!(reply.is_empty());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod extract;
pub mod matcher;
pub mod message;
pub mod scenario;
pub mod server;
pub mod template;
pub mod trigger;

pub use config::MockServerConfig;
pub use db::Database;
pub use engine::MockEngine;
pub use error::MockError;
pub use message::Message;
