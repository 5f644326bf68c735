//! Top-level bridge object.
//!
//! Owns the I/O runtime, the runtime gateway and the router, and exposes the
//! handful of entry points the host extension calls.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::runtime::Runtime;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::buffer::BufferLedger;
use crate::config::Config;
use crate::error::{BridgeError, BridgeResult};
use crate::host::{BrowserHost, HostQueries};
use crate::http::HttpRelay;
use crate::identity::TabTracker;
use crate::message::{CorrelationId, GLOBAL_AVAILABLE};
use crate::prefs::PreferenceStore;
use crate::resources::ResourceBundle;
use crate::router::{outbound_channel, MenuSlot, Router, RouterParts};
use crate::runtime::{
    runtime_channel, Bootstrap, Capabilities, CapabilityParts, EngineFactory, RuntimeGateway,
    RuntimeState,
};
use crate::timer::TimerService;

/// How long shutdown waits for I/O tasks to wind down.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// A running bridge between one host and one script engine.
pub struct Bridge<H: BrowserHost> {
    gateway: RuntimeGateway,
    router: Arc<Router<H>>,
    capabilities: Capabilities,
    sweeper: Option<JoinHandle<()>>,
    // Dropped last: every task above runs on it
    io: Option<Runtime>,
}

impl<H: BrowserHost> Bridge<H> {
    /// Start the I/O runtime and the runtime thread, then bootstrap the engine.
    ///
    /// A bootstrap failure does not fail `start`: the bridge comes up inert
    /// and [`runtime_state`](Self::runtime_state) reports it.
    pub fn start(config: Config, host: Arc<H>, factory: EngineFactory) -> BridgeResult<Self> {
        let io = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("bridge-io")
            .enable_all()
            .build()
            .map_err(|e| BridgeError::Runtime(format!("Failed to start I/O runtime: {}", e)))?;
        let handle = io.handle().clone();

        let (runtime, inbox) = runtime_channel();
        let (outbound, outbound_rx) = outbound_channel();
        let http = Arc::new(HttpRelay::new(&config.http)?);
        let resources = ResourceBundle::from_config(&config.resources);

        let capabilities = Capabilities::new(CapabilityParts {
            runtime: runtime.clone(),
            outbound,
            native_prefix: config.protocol.native_prefix.clone(),
            http: Arc::clone(&http),
            io: handle.clone(),
            timers: TimerService::new(handle.clone(), Arc::new(runtime.clone())),
            buffers: BufferLedger::new(),
        });

        let queries = HostQueries::new(host, config.host.callback_timeout());
        let tracker = Arc::new(TabTracker::new(queries));

        let router = Router::start(
            RouterParts {
                tracker: Arc::clone(&tracker),
                runtime: runtime.clone(),
                resources: resources.clone(),
                prefs: PreferenceStore::open(&config.prefs.path, config.prefs.key.clone()),
                http,
                protocol: config.protocol.clone(),
                window_poll: config.host.window_poll(),
                io: handle.clone(),
            },
            outbound_rx,
        );

        let sweeper = match config.host.sweep_interval() {
            Some(every) => Some(tracker.spawn_periodic_sweep(&handle, every)),
            None => {
                // Still reconcile once at startup
                let tracker = Arc::clone(&tracker);
                handle.spawn(async move {
                    tracker.sweep().await;
                });
                None
            }
        };

        let gateway = RuntimeGateway::spawn(
            inbox,
            runtime,
            Bootstrap {
                resources,
                scripts: config.resources.bootstrap.clone(),
            },
            capabilities.clone(),
            factory,
        )?;

        info!(
            "Bridge started ({:?}, resources at {})",
            gateway.state(),
            config.resources.root.display()
        );

        Ok(Self {
            gateway,
            router,
            capabilities,
            sweeper,
            io: Some(io),
        })
    }

    /// A content script posted a message from `page`.
    pub fn message_received(&self, page: H::Page, user_info: Value) {
        self.router.message_received(page, user_info);
    }

    pub fn toolbar_item_clicked(&self, window: H::Window) {
        self.router.toolbar_item_clicked(window);
    }

    pub fn validate_menu_item(&self, command: &str) -> MenuSlot {
        self.router.validate_menu_item(command)
    }

    pub fn menu_item_selected(&self, command: &str) {
        self.router.menu_item_selected(command);
    }

    pub fn runtime_state(&self) -> RuntimeState {
        self.gateway.state()
    }

    /// The functions injected into the script namespace.
    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    pub fn tracker(&self) -> &Arc<TabTracker<H>> {
        self.router.tracker()
    }

    /// Ask every page to announce itself, as the runtime does once loaded.
    pub fn announce_global_available(&self) -> bool {
        self.capabilities.send_message(
            &format!("{}{}", self.router.native_prefix(), GLOBAL_AVAILABLE),
            CorrelationId::generated(GLOBAL_AVAILABLE),
            Value::Null,
            None,
        )
    }

    /// Stop everything. Queued runtime tasks run first; pending host queries
    /// and HTTP requests are abandoned. Once this returns the host is no
    /// longer called, unless a host call itself outlasted the grace period.
    ///
    /// Must not be called from inside an async context.
    pub fn shutdown(&mut self) {
        self.gateway.shutdown();
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
        self.router.shutdown();
        if let Some(io) = self.io.take() {
            io.shutdown_timeout(SHUTDOWN_GRACE);
            debug!("Bridge stopped");
        }
    }
}

impl<H: BrowserHost> Drop for Bridge<H> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
