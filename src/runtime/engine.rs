//! The script engine seam.
//!
//! The engine is supplied by the embedder (the app extension wraps its own
//! JavaScript context). It is created on the runtime thread and never leaves
//! it, which is why [`ScriptEngine`] is not `Send`.

use serde_json::Value;
use thiserror::Error;

use super::Capabilities;
use crate::http::HttpOutcome;
use crate::message::Envelope;
use crate::timer::TimerTag;

/// Identifier of an HTTP request issued through [`Capabilities::http_request`].
pub type RequestId = u64;

/// An uncaught script exception or an engine failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ScriptError {
    pub message: String,
}

impl ScriptError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// A single-threaded script execution context.
///
/// Errors returned from the delivery methods are logged and execution carries
/// on with the next task. An error from [`evaluate`](Self::evaluate) during
/// bootstrap is fatal for the bridge, so engines should reserve it for scripts
/// that could not be compiled.
pub trait ScriptEngine {
    /// Evaluate a script with `source_name` as its debug source URL.
    fn evaluate(&mut self, source_name: &str, source: &str) -> Result<(), ScriptError>;

    /// Hand a message to the runtime's receive entry point.
    fn receive_message(&mut self, envelope: Envelope) -> Result<(), ScriptError>;

    /// Complete a request started with [`Capabilities::http_request`].
    fn complete_http(&mut self, request: RequestId, outcome: HttpOutcome) -> Result<(), ScriptError>;

    /// Run the callback of a due timer. `finished` is set for one-shot timers,
    /// whose callback can be dropped afterwards.
    fn fire_timer(&mut self, tag: TimerTag, finished: bool) -> Result<(), ScriptError>;

    /// A window opened with a close token has gone away.
    fn window_closed(&mut self, token: Value) -> Result<(), ScriptError>;

    /// Drain microtasks or other deferred work after each task.
    fn run_pending(&mut self) -> Result<(), ScriptError> {
        Ok(())
    }
}

/// Builds the engine on the runtime thread.
pub type EngineFactory =
    Box<dyn FnOnce(Capabilities) -> Result<Box<dyn ScriptEngine>, ScriptError> + Send>;
