//! Runtime gateway: the only way into the script engine.
//!
//! The engine lives on one dedicated OS thread. Everybody else (host
//! callbacks, HTTP completions, timers) posts [`RuntimeTask`]s to an unbounded
//! queue and never waits for them to run. The engine is built on that thread
//! by an [`EngineFactory`] and never leaves it.

mod capabilities;
mod engine;

pub use capabilities::{Capabilities, CapabilityParts};
pub use engine::{EngineFactory, RequestId, ScriptEngine, ScriptError};

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};
use std::thread;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::error::{BridgeError, BridgeResult};
use crate::http::HttpOutcome;
use crate::message::Envelope;
use crate::resources::ResourceBundle;
use crate::timer::{TimerKind, TimerSink, TimerTag};

/// Work for the runtime thread.
#[derive(Debug)]
pub enum RuntimeTask {
    Deliver(Envelope),
    HttpComplete {
        request: RequestId,
        outcome: HttpOutcome,
    },
    FireTimer(TimerTag),
    WindowClosed(Value),
    Shutdown,
}

/// Lifecycle of the runtime thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RuntimeState {
    /// Bootstrap in progress; posted tasks queue up.
    Starting = 0,
    Ready = 1,
    /// Bootstrap failed. The bridge drops everything from now on.
    Inert = 2,
    Stopped = 3,
}

impl RuntimeState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => RuntimeState::Starting,
            1 => RuntimeState::Ready,
            2 => RuntimeState::Inert,
            _ => RuntimeState::Stopped,
        }
    }
}

/// Posting side of the runtime queue.
#[derive(Clone)]
pub struct RuntimeHandle {
    tx: mpsc::UnboundedSender<RuntimeTask>,
    state: Arc<AtomicU8>,
}

/// Receiving side, consumed by [`RuntimeGateway::spawn`].
pub struct RuntimeInbox {
    rx: mpsc::UnboundedReceiver<RuntimeTask>,
}

/// Create a connected handle/inbox pair in the `Starting` state.
pub fn runtime_channel() -> (RuntimeHandle, RuntimeInbox) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = RuntimeHandle {
        tx,
        state: Arc::new(AtomicU8::new(RuntimeState::Starting as u8)),
    };
    (handle, RuntimeInbox { rx })
}

impl RuntimeHandle {
    /// Queue a task. Returns false once the runtime is inert or stopped.
    pub fn post(&self, task: RuntimeTask) -> bool {
        match self.state() {
            RuntimeState::Inert | RuntimeState::Stopped => false,
            RuntimeState::Starting | RuntimeState::Ready => self.tx.send(task).is_ok(),
        }
    }

    pub fn deliver(&self, envelope: Envelope) -> bool {
        self.post(RuntimeTask::Deliver(envelope))
    }

    pub fn state(&self) -> RuntimeState {
        RuntimeState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: RuntimeState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

impl TimerSink for RuntimeHandle {
    fn timer_due(&self, tag: TimerTag) {
        self.post(RuntimeTask::FireTimer(tag));
    }
}

impl RuntimeInbox {
    pub async fn recv(&mut self) -> Option<RuntimeTask> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<RuntimeTask> {
        self.rx.try_recv().ok()
    }
}

/// Scripts evaluated at startup.
pub struct Bootstrap {
    pub resources: ResourceBundle,
    pub scripts: Vec<String>,
}

/// Owner of the runtime thread.
pub struct RuntimeGateway {
    handle: RuntimeHandle,
    thread: Option<thread::JoinHandle<()>>,
}

impl RuntimeGateway {
    /// Start the runtime thread and wait until bootstrap has finished.
    ///
    /// A failed bootstrap is not an error here: the gateway comes back in the
    /// `Inert` state and drops every task. Only failing to start the thread
    /// at all is reported.
    pub fn spawn(
        inbox: RuntimeInbox,
        handle: RuntimeHandle,
        bootstrap: Bootstrap,
        capabilities: Capabilities,
        factory: EngineFactory,
    ) -> BridgeResult<Self> {
        let (init_tx, init_rx) = std_mpsc::channel::<RuntimeState>();
        let thread_handle = handle.clone();

        let thread = thread::Builder::new()
            .name("bridge-runtime".to_string())
            .spawn(move || {
                let handle = thread_handle;
                let booted = panic::catch_unwind(AssertUnwindSafe(|| {
                    RuntimeCore::boot(bootstrap, capabilities, factory)
                }));

                let mut core = match booted {
                    Ok(Ok(core)) => core,
                    Ok(Err(e)) => {
                        error!(target: "runtime", "Bootstrap failed, bridge is inert: {}", e);
                        handle.set_state(RuntimeState::Inert);
                        let _ = init_tx.send(RuntimeState::Inert);
                        return;
                    }
                    Err(_) => {
                        error!(target: "runtime", "Script engine panicked during bootstrap, bridge is inert");
                        handle.set_state(RuntimeState::Inert);
                        let _ = init_tx.send(RuntimeState::Inert);
                        return;
                    }
                };

                handle.set_state(RuntimeState::Ready);
                let _ = init_tx.send(RuntimeState::Ready);
                info!(target: "runtime", "Runtime ready");

                core.run(inbox);
                handle.set_state(RuntimeState::Stopped);
                debug!(target: "runtime", "Runtime thread exiting");
            })
            .map_err(|e| BridgeError::Runtime(format!("Failed to spawn runtime thread: {}", e)))?;

        if init_rx.recv().is_err() {
            return Err(BridgeError::Runtime(
                "Runtime thread exited during bootstrap".to_string(),
            ));
        }

        Ok(Self {
            handle,
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> &RuntimeHandle {
        &self.handle
    }

    pub fn state(&self) -> RuntimeState {
        self.handle.state()
    }

    /// Stop the runtime thread after the tasks already queued.
    pub fn shutdown(&mut self) {
        if let Some(thread) = self.thread.take() {
            // Bypasses `post`, which refuses once the state is terminal
            let _ = self.handle.tx.send(RuntimeTask::Shutdown);
            if thread.join().is_err() {
                error!(target: "runtime", "Runtime thread panicked");
            }
        }
        if self.handle.state() != RuntimeState::Inert {
            self.handle.set_state(RuntimeState::Stopped);
        }
    }
}

impl Drop for RuntimeGateway {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// State owned by the runtime thread.
struct RuntimeCore {
    engine: Box<dyn ScriptEngine>,
    capabilities: Capabilities,
}

impl RuntimeCore {
    fn boot(
        bootstrap: Bootstrap,
        capabilities: Capabilities,
        factory: EngineFactory,
    ) -> BridgeResult<Self> {
        let scripts = bootstrap.resources.bootstrap(&bootstrap.scripts)?;

        let mut engine = factory(capabilities.clone())
            .map_err(|e| BridgeError::Runtime(format!("Failed to create script engine: {}", e)))?;

        for script in &scripts {
            engine.evaluate(&script.name, &script.source).map_err(|e| {
                BridgeError::Runtime(format!("Failed to evaluate {}: {}", script.name, e))
            })?;
        }
        debug!(target: "runtime", "Evaluated {} bootstrap script(s)", scripts.len());

        Ok(Self {
            engine,
            capabilities,
        })
    }

    fn run(&mut self, mut inbox: RuntimeInbox) {
        while let Some(task) = inbox.rx.blocking_recv() {
            match task {
                RuntimeTask::Shutdown => break,
                RuntimeTask::Deliver(envelope) => {
                    self.guarded("receive_message", |engine| engine.receive_message(envelope))
                }
                RuntimeTask::HttpComplete { request, outcome } => {
                    self.guarded("complete_http", |engine| engine.complete_http(request, outcome))
                }
                RuntimeTask::FireTimer(tag) => {
                    // Cleared between waking up and getting here
                    let Some(kind) = self.capabilities.timers().claim(tag) else {
                        continue;
                    };
                    self.guarded("timer", |engine| {
                        engine.fire_timer(tag, kind == TimerKind::Once)
                    })
                }
                RuntimeTask::WindowClosed(token) => {
                    self.guarded("window_closed", |engine| engine.window_closed(token))
                }
            }
            self.guarded("run_pending", |engine| engine.run_pending());
        }

        self.capabilities.timers().cancel_all();
    }

    /// Run one engine call. Script errors and panics are logged and swallowed.
    fn guarded<F>(&mut self, what: &str, call: F)
    where
        F: FnOnce(&mut dyn ScriptEngine) -> Result<(), ScriptError>,
    {
        let engine = self.engine.as_mut();
        match panic::catch_unwind(AssertUnwindSafe(|| call(engine))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(target: "runtime", "Global Error in {}: {}", what, e),
            Err(_) => error!(target: "runtime", "Script engine panicked in {}", what),
        }
    }
}
