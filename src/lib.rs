//! Connector bridge - native side of a Safari web extension.
//!
//! The bridge sits between the browser (windows, tabs, pages and their
//! content scripts) and a long-lived JavaScript runtime that runs the
//! connector's global scripts. Browser objects have no stable identity, so
//! the bridge hands out synthetic tab ids, routes messages in both
//! directions, and answers a fixed set of requests natively.
//!
//! # Architecture
//!
//! The library is organized into these main modules:
//!
//! - [`config`] - Configuration loading and management
//! - [`host`] - Browser host abstraction and timed host queries
//! - [`identity`] - Synthetic ids for windows and tabs
//! - [`router`] - Message routing and native request handling
//! - [`runtime`] - The script runtime thread and its capabilities
//! - [`http`] - HTTP relay for the runtime
//! - [`bridge`] - Ties everything together
//!
//! # FFI Layer
//!
//! The app extension interacts via the C FFI layer in [`ffi`]: it passes in a
//! host vtable and an engine vtable and gets an opaque handle back.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use connector_bridge::{Bridge, Config};
//!
//! let config = Config::load();
//! let bridge = Bridge::start(config, Arc::new(my_host), my_engine_factory)?;
//! bridge.message_received(page, user_info);
//! ```

// Public modules
pub mod bridge;
pub mod buffer;
pub mod config;
pub mod encoding;
pub mod host;
pub mod http;
pub mod identity;
pub mod logging;
pub mod message;
pub mod prefs;
pub mod resources;
pub mod router;
pub mod runtime;
pub mod timer;

// FFI module - internal implementation details
#[doc(hidden)]
pub mod ffi;

// Internal modules
mod error;

#[cfg(test)]
mod testing;

// Re-export commonly used types for convenience
pub use bridge::Bridge;
pub use config::Config;
pub use error::{BridgeError, BridgeResult};
pub use host::{BrowserHost, Completion, HostObject};
pub use message::{CorrelationId, Envelope, TabId};
pub use router::MenuSlot;
pub use runtime::{Capabilities, EngineFactory, RuntimeState, ScriptEngine, ScriptError};
