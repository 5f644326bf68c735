//! Native functions injected into the script namespace.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use serde_json::Value;
use tokio::runtime::Handle;
use tracing::{info, warn};

use super::engine::RequestId;
use super::{RuntimeHandle, RuntimeTask};
use crate::buffer::{BufferId, BufferLedger, SharedBuffer};
use crate::encoding::{self, EncodingError};
use crate::http::{HttpRelay, HttpRequest};
use crate::message::{CorrelationId, Destination, OutboundMessage, TabId};
use crate::router::{NativeRequest, Outbound, OutboundQueue};
use crate::timer::{TimerKind, TimerService, TimerTag};

struct Inner {
    runtime: RuntimeHandle,
    outbound: OutboundQueue,
    native_prefix: String,
    http: Arc<HttpRelay>,
    io: Handle,
    timers: TimerService,
    buffers: BufferLedger,
    next_request: AtomicU64,
}

/// Everything script code may call into. Cheap to clone and safe to use from
/// any thread; results that touch the engine come back as runtime tasks.
#[derive(Clone)]
pub struct Capabilities {
    inner: Arc<Inner>,
}

/// Parts [`Capabilities`] is assembled from.
pub struct CapabilityParts {
    pub runtime: RuntimeHandle,
    pub outbound: OutboundQueue,
    pub native_prefix: String,
    pub http: Arc<HttpRelay>,
    pub io: Handle,
    pub timers: TimerService,
    pub buffers: BufferLedger,
}

impl Capabilities {
    pub fn new(parts: CapabilityParts) -> Self {
        Self {
            inner: Arc::new(Inner {
                runtime: parts.runtime,
                outbound: parts.outbound,
                native_prefix: parts.native_prefix,
                http: parts.http,
                io: parts.io,
                timers: parts.timers,
                buffers: parts.buffers,
                next_request: AtomicU64::new(1),
            }),
        }
    }

    /// Console output of the script runtime.
    pub fn log(&self, message: &str) {
        info!(target: "global", "{}", message);
    }

    /// Send a message from the runtime.
    ///
    /// Natively handled names are checked here so a malformed request can be
    /// refused synchronously; everything else is queued for the router. Returns
    /// `false` when the message was dropped.
    pub fn send_message(
        &self,
        name: &str,
        correlation_id: CorrelationId,
        args: Value,
        tab_id: Option<TabId>,
    ) -> bool {
        let destination = Destination::from_tab_arg(tab_id);

        let outbound = match NativeRequest::parse(&self.inner.native_prefix, name, &args) {
            Ok(Some(request)) => Outbound::Native {
                request,
                correlation_id,
                destination,
            },
            Ok(None) => Outbound::Forward(OutboundMessage {
                name: name.to_string(),
                correlation_id,
                args,
                destination,
            }),
            Err(e) => {
                warn!(target: "router", "Failure: {}", e);
                return false;
            }
        };

        self.inner.outbound.push(outbound)
    }

    /// Start an HTTP request. The outcome arrives through
    /// [`ScriptEngine::complete_http`](super::ScriptEngine::complete_http)
    /// under the returned id.
    pub fn http_request(&self, method: Option<&str>, url: &str, options: &Value) -> RequestId {
        let id = self.inner.next_request.fetch_add(1, Ordering::Relaxed);
        let request = HttpRequest::from_parts(method, url, options);

        let relay = Arc::clone(&self.inner.http);
        let runtime = self.inner.runtime.clone();
        self.inner.io.spawn(async move {
            let outcome = relay.execute(request).await;
            if !runtime.post(RuntimeTask::HttpComplete {
                request: id,
                outcome,
            }) {
                warn!(target: "http", "runtime gone, dropping response to request {}", id);
            }
        });

        id
    }

    pub fn set_timeout(&self, delay_ms: f64) -> TimerTag {
        self.inner.timers.schedule(delay_ms, TimerKind::Once)
    }

    pub fn set_interval(&self, delay_ms: f64) -> TimerTag {
        self.inner.timers.schedule(delay_ms, TimerKind::Repeating)
    }

    /// Both `clearTimeout` and `clearInterval`.
    pub fn clear_timer(&self, tag: TimerTag) -> bool {
        self.inner.timers.cancel(tag)
    }

    pub fn encode_utf8(&self, text: &str) -> Vec<u8> {
        encoding::encode_utf8(text)
    }

    pub fn atob(&self, encoded: &str) -> String {
        encoding::atob(encoded)
    }

    pub fn btoa(&self, binary: &str) -> Result<String, EncodingError> {
        encoding::btoa(binary)
    }

    pub fn base64_encode(&self, bytes: &[u8]) -> String {
        encoding::base64_encode(bytes)
    }

    pub fn base64_decode(&self, encoded: &str) -> Result<Vec<u8>, EncodingError> {
        encoding::base64_decode(encoded)
    }

    /// Lend `bytes` to the engine without copying. Paired with
    /// [`release_buffer`](Self::release_buffer).
    pub fn share_buffer(&self, bytes: Bytes) -> SharedBuffer {
        self.inner.buffers.share(bytes)
    }

    /// The engine finalised a shared buffer.
    pub fn release_buffer(&self, id: BufferId) -> bool {
        self.inner.buffers.release(id)
    }

    pub fn buffers(&self) -> &BufferLedger {
        &self.inner.buffers
    }

    pub fn timers(&self) -> &TimerService {
        &self.inner.timers
    }
}
