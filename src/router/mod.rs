//! Message router between pages and the runtime.
//!
//! Inbound messages from content scripts are fanned out into one lane per
//! page. A lane resolves the sending tab and posts to the runtime in arrival
//! order, so a host query that never answers only holds up its own page. The
//! outbound pump takes sends issued by the runtime, answers the native ones
//! locally and dispatches everything else to a page in issue order.

mod menu;
mod native;

pub use menu::{parse_command, MenuSlot, Translator, TranslatorMenu};
pub use native::NativeRequest;

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::config::ProtocolConfig;
use crate::host::{BrowserHost, HostObject, HostQueries};
use crate::http::{outcome_to_wire, HttpRelay};
use crate::identity::TabTracker;
use crate::message::{
    empty_payload, page_payload, CorrelationId, Destination, Envelope, InboundMessage,
    OutboundMessage, TabId, BUTTON_CLICK, CONTEXT_MENU_ITEM, GLOBAL_AVAILABLE, NO_TAB, PAGE_LOAD,
    RESPONSE, UNKNOWN_TITLE,
};
use crate::prefs::PreferenceStore;
use crate::resources::{ResourceBundle, ResourceError};
use crate::runtime::{RuntimeHandle, RuntimeTask};

/// Error name for a missing bundled resource in a reply.
const NOT_FOUND_ERROR_NAME: &str = "NotFoundError";

/// A send issued by the runtime, after native matching.
#[derive(Debug)]
pub enum Outbound {
    Native {
        request: NativeRequest,
        correlation_id: CorrelationId,
        destination: Destination,
    },
    Forward(OutboundMessage),
}

/// Posting side of the outbound queue, held by the runtime's capabilities.
#[derive(Clone)]
pub struct OutboundQueue {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl OutboundQueue {
    pub fn push(&self, outbound: Outbound) -> bool {
        self.tx.send(outbound).is_ok()
    }
}

pub struct OutboundReceiver {
    rx: mpsc::UnboundedReceiver<Outbound>,
}

impl OutboundReceiver {
    pub async fn recv(&mut self) -> Option<Outbound> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Outbound> {
        self.rx.try_recv().ok()
    }
}

pub fn outbound_channel() -> (OutboundQueue, OutboundReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (OutboundQueue { tx }, OutboundReceiver { rx })
}

/// Inbound messages of one page.
struct PageLane<P> {
    page: P,
    tx: mpsc::UnboundedSender<Value>,
    /// Messages queued or being handled
    busy: Arc<AtomicUsize>,
}

/// Everything the router is built from.
pub struct RouterParts<H: BrowserHost> {
    pub tracker: Arc<TabTracker<H>>,
    pub runtime: RuntimeHandle,
    pub resources: ResourceBundle,
    pub prefs: PreferenceStore,
    pub http: Arc<HttpRelay>,
    pub protocol: ProtocolConfig,
    pub window_poll: Duration,
    pub io: Handle,
}

pub struct Router<H: BrowserHost> {
    tracker: Arc<TabTracker<H>>,
    runtime: RuntimeHandle,
    resources: ResourceBundle,
    prefs: Mutex<PreferenceStore>,
    http: Arc<HttpRelay>,
    menu: TranslatorMenu,
    protocol: ProtocolConfig,
    window_poll: Duration,
    io: Handle,
    inbound: mpsc::UnboundedSender<(H::Page, Value)>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<H: BrowserHost> Router<H> {
    /// Build the router and start both pumps on `parts.io`.
    pub fn start(parts: RouterParts<H>, mut outbound: OutboundReceiver) -> Arc<Self> {
        let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel::<(H::Page, Value)>();

        let router = Arc::new(Self {
            tracker: parts.tracker,
            runtime: parts.runtime,
            resources: parts.resources,
            prefs: Mutex::new(parts.prefs),
            http: parts.http,
            menu: TranslatorMenu::new(parts.protocol.preferences_label.clone()),
            protocol: parts.protocol,
            window_poll: parts.window_poll,
            io: parts.io,
            inbound: inbound_tx,
            tasks: Mutex::new(Vec::new()),
        });

        let inbound_router = Arc::clone(&router);
        let inbound_pump = router.io.spawn(async move {
            let mut lanes: Vec<PageLane<H::Page>> = Vec::new();
            while let Some((page, user_info)) = inbound_rx.recv().await {
                // Only this task adds work, so an idle lane stays idle until dropped.
                lanes.retain(|lane| lane.busy.load(Ordering::Acquire) > 0);
                let index = match lanes.iter().position(|lane| lane.page.same_object(&page)) {
                    Some(index) => index,
                    None => {
                        lanes.push(inbound_router.open_lane(page));
                        lanes.len() - 1
                    }
                };
                let lane = &lanes[index];
                lane.busy.fetch_add(1, Ordering::AcqRel);
                if lane.tx.send(user_info).is_err() {
                    lane.busy.fetch_sub(1, Ordering::AcqRel);
                }
            }
        });

        let outbound_router = Arc::clone(&router);
        let outbound_pump = router.io.spawn(async move {
            while let Some(item) = outbound.recv().await {
                match item {
                    Outbound::Native {
                        request,
                        correlation_id,
                        destination,
                    } => {
                        outbound_router
                            .handle_native(request, correlation_id, destination)
                            .await
                    }
                    Outbound::Forward(message) => outbound_router.forward(message).await,
                }
            }
        });

        router.tasks.lock().extend([inbound_pump, outbound_pump]);
        router
    }

    fn queries(&self) -> &HostQueries<H> {
        self.tracker.queries()
    }

    fn host(&self) -> &H {
        self.queries().host()
    }

    pub fn tracker(&self) -> &Arc<TabTracker<H>> {
        &self.tracker
    }

    pub fn menu(&self) -> &TranslatorMenu {
        &self.menu
    }

    pub fn native_prefix(&self) -> &str {
        &self.protocol.native_prefix
    }

    /// Stop the pumps and every window watcher.
    pub fn shutdown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    fn track(&self, task: JoinHandle<()>) {
        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    // ========================================================================
    // Inbound: content scripts -> runtime
    // ========================================================================

    /// A content script sent `user_info` from `page`. Returns immediately.
    pub fn message_received(&self, page: H::Page, user_info: Value) {
        if self.inbound.send((page, user_info)).is_err() {
            debug!(target: "router", "inbound pump stopped, dropping message");
        }
    }

    fn open_lane(self: &Arc<Self>, page: H::Page) -> PageLane<H::Page> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Value>();
        let busy = Arc::new(AtomicUsize::new(0));

        let router = Arc::clone(self);
        let lane_page = page.clone();
        let lane_busy = Arc::clone(&busy);
        let task = self.io.spawn(async move {
            while let Some(user_info) = rx.recv().await {
                router.handle_inbound(lane_page.clone(), user_info).await;
                lane_busy.fetch_sub(1, Ordering::AcqRel);
            }
        });
        self.track(task);

        PageLane { page, tx, busy }
    }

    async fn handle_inbound(&self, page: H::Page, user_info: Value) {
        let message = match InboundMessage::from_user_info(&user_info) {
            Ok(message) => message,
            Err(e) => {
                warn!(target: "router", "Dropping inbound message: {}", e);
                return;
            }
        };

        let mut args = message.args;
        if message.name == PAGE_LOAD {
            let title = self
                .queries()
                .page_title(&page)
                .await
                .unwrap_or_else(|| UNKNOWN_TITLE.to_string());
            if let Value::Array(list) = &mut args {
                list.insert(0, Value::String(title));
            }
        }

        self.tracker.page_id(&page);
        let tab_id = match self.queries().containing_tab(&page).await {
            Some(tab) => self.tracker.tab_id(&tab),
            None => NO_TAB,
        };

        self.deliver_to_runtime(&message.name, message.correlation_id, args, tab_id);
    }

    fn deliver_to_runtime(&self, name: &str, correlation_id: CorrelationId, args: Value, tab_id: TabId) {
        let delivered = self.runtime.deliver(Envelope {
            name: name.to_string(),
            correlation_id,
            args,
            tab_id,
        });
        if !delivered {
            debug!(target: "router", "runtime not accepting messages, dropped {}", name);
        }
    }

    /// Answer a native request. The tab id is the active tab's, or `-1`.
    async fn reply(&self, correlation_id: CorrelationId, args: Value) {
        let tab_id = self.tracker.active_tab_id().await.unwrap_or(NO_TAB);
        self.deliver_to_runtime(RESPONSE, correlation_id, args, tab_id);
    }

    // ========================================================================
    // Outbound: runtime -> pages
    // ========================================================================

    async fn forward(&self, message: OutboundMessage) {
        let page = match message.destination {
            Destination::Tab(id) => {
                let Some(tab) = self.tracker.tab(id).await else {
                    warn!(
                        target: "router",
                        "Attempted to send a message {} to a dead tab {}",
                        message.name,
                        id
                    );
                    return;
                };
                self.queries().active_page(&tab).await
            }
            Destination::ActiveTab => self.queries().frontmost_page().await,
        };

        match page {
            Some(page) => {
                let payload = page_payload(&message.args, &message.correlation_id);
                self.host().dispatch(&page, &message.name, payload);
            }
            None => debug!(target: "router", "no page to receive {}", message.name),
        }
    }

    async fn handle_native(
        self: &Arc<Self>,
        request: NativeRequest,
        correlation_id: CorrelationId,
        destination: Destination,
    ) {
        match request {
            NativeRequest::OpenWindow { url, close_token } => {
                let Some(window) = self.queries().open_window(&url).await else {
                    warn!(target: "router", "Failed to open window for {}", url);
                    return;
                };
                if let Some(token) = close_token {
                    self.watch_window(window, token);
                }
            }
            NativeRequest::OpenTab { url } => match self.queries().active_window().await {
                Some(window) => {
                    if self.queries().open_tab(&window, &url).await.is_none() {
                        warn!(target: "router", "Failed to open tab for {}", url);
                    }
                }
                None => warn!(target: "router", "No active window to open {} in", url),
            },
            NativeRequest::CloseTab { tab_id } => match self.tracker.tab(tab_id).await {
                Some(tab) => self.host().close_tab(&tab),
                None => debug!(target: "router", "closeTab: tab {} already gone", tab_id),
            },
            NativeRequest::Activate => {
                if let Some(tab) = self.queries().frontmost_tab().await {
                    self.host().activate_tab(&tab);
                }
            }
            NativeRequest::GetVersion => {
                let version = self
                    .host()
                    .version()
                    .unwrap_or_else(|| self.protocol.fallback_version.clone());
                self.reply(correlation_id, Value::String(version)).await;
            }
            NativeRequest::GetBaseUri => {
                let uri = self.queries().base_uri().await;
                self.reply(correlation_id, uri.map(Value::String).unwrap_or(Value::Null))
                    .await;
            }
            NativeRequest::GetCurrentLocale => {
                let language = self.current_language();
                let locale = self.locale_json(&language);
                self.reply(correlation_id, Value::String(locale)).await;
            }
            NativeRequest::GetDefaultLocale => {
                let locale = self.locale_json(&self.protocol.default_locale);
                self.reply(correlation_id, Value::String(locale)).await;
            }
            NativeRequest::GetDateFormats => {
                let answer = resource_reply(self.resources.date_formats());
                self.reply(correlation_id, answer).await;
            }
            NativeRequest::GetFileContents { path } => {
                let answer = resource_reply(self.resources.read(&path));
                self.reply(correlation_id, answer).await;
            }
            NativeRequest::GetPrefs => {
                let blob = self.prefs.lock().get();
                self.reply(correlation_id, Value::String(blob)).await;
            }
            NativeRequest::SetPrefs { blob } => {
                if let Err(e) = self.prefs.lock().set(&blob) {
                    error!(target: "router", "Failed to store preferences: {:#}", e);
                }
            }
            NativeRequest::UpdateButton {
                image_path,
                tooltip,
                translators,
            } => {
                self.menu.set(translators);
                match self.resources.toolbar_image(&image_path) {
                    Ok(image) => self.update_toolbar(image, tooltip, destination).await,
                    Err(e) => warn!(target: "router", "Unable to read toolbar image file: {}", e),
                }
            }
            NativeRequest::GlobalAvailable => self.announce_global_available().await,
            NativeRequest::HttpRequest(request) => {
                // Off the pump, so a slow server does not hold up page dispatch
                let router = Arc::clone(self);
                let task = self.io.spawn(async move {
                    let outcome = router.http.execute(request).await;
                    router.reply(correlation_id, outcome_to_wire(&outcome)).await;
                });
                self.track(task);
            }
        }
    }

    /// First preferred language, without its region.
    fn current_language(&self) -> String {
        self.host()
            .preferred_languages()
            .first()
            .and_then(|tag| tag.split('-').next())
            .filter(|lang| !lang.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| self.protocol.default_locale.clone())
    }

    fn locale_json(&self, language: &str) -> String {
        self.resources
            .locale(language, &self.protocol.default_locale)
            .unwrap_or_else(|| {
                warn!(target: "router", "Unable to read locale file for {}", language);
                String::new()
            })
    }

    /// Apply a toolbar update sent on behalf of tab `destination`, but only
    /// while that tab is the active one.
    async fn update_toolbar(&self, image: PathBuf, tooltip: String, destination: Destination) {
        let Destination::Tab(tab_id) = destination else {
            return;
        };
        let Some(window) = self.queries().active_window().await else {
            return;
        };
        let Some(active) = self.queries().active_tab(&window).await else {
            return;
        };

        if self.tracker.tab_id(&active) != tab_id {
            debug!(target: "router", "ignoring toolbar update for inactive tab {}", tab_id);
            return;
        }
        self.host().set_toolbar_item(&window, Some(&image), &tooltip);
    }

    /// Tell the page in every tab of every window that the runtime is up.
    async fn announce_global_available(&self) {
        let Some(windows) = self.queries().windows().await else {
            warn!(target: "router", "window enumeration unanswered, globalAvailable not sent");
            return;
        };

        for window in &windows {
            let Some(tabs) = self.queries().tabs(window).await else {
                continue;
            };
            for tab in &tabs {
                if let Some(page) = self.queries().active_page(tab).await {
                    self.host().dispatch(&page, GLOBAL_AVAILABLE, empty_payload());
                }
            }
        }
    }

    /// The host has no close events, so poll the window list until `window`
    /// is gone, then hand `token` back to the runtime once.
    fn watch_window(self: &Arc<Self>, window: H::Window, token: Value) {
        let router = Arc::clone(self);
        let task = self.io.spawn(async move {
            let start = tokio::time::Instant::now() + router.window_poll;
            let mut ticker = tokio::time::interval_at(start, router.window_poll);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                // Unanswered enumeration proves nothing; try again next tick
                let Some(windows) = router.queries().windows().await else {
                    continue;
                };
                if !windows.iter().any(|w| w.same_object(&window)) {
                    router.runtime.post(RuntimeTask::WindowClosed(token));
                    break;
                }
            }
        });
        self.track(task);
    }

    // ========================================================================
    // Toolbar and context menu
    // ========================================================================

    pub fn toolbar_item_clicked(self: &Arc<Self>, window: H::Window) {
        let router = Arc::clone(self);
        self.io.spawn(async move {
            let Some(tab) = router.queries().active_tab(&window).await else {
                return;
            };
            let Some(page) = router.queries().active_page(&tab).await else {
                return;
            };
            router.host().dispatch(&page, BUTTON_CLICK, empty_payload());
        });
    }

    pub fn validate_menu_item(&self, command: &str) -> MenuSlot {
        match parse_command(command) {
            Some(index) => self.menu.slot(index),
            None => MenuSlot::Hidden,
        }
    }

    pub fn menu_item_selected(self: &Arc<Self>, command: &str) {
        let Some(index) = parse_command(command) else {
            warn!(target: "router", "unknown menu command {}", command);
            return;
        };
        let Some(args) = self.menu.selection(index) else {
            debug!(target: "router", "menu slot {} is empty", index);
            return;
        };

        let router = Arc::clone(self);
        self.io.spawn(async move {
            let tab_id = router.tracker.active_tab_id().await.unwrap_or(NO_TAB);
            router.deliver_to_runtime(
                CONTEXT_MENU_ITEM,
                CorrelationId::generated(CONTEXT_MENU_ITEM),
                args,
                tab_id,
            );
        });
    }
}

/// Resource contents, or a structured not-found error.
fn resource_reply(result: Result<String, ResourceError>) -> Value {
    match result {
        Ok(contents) => Value::String(contents),
        Err(e) => {
            warn!(target: "router", "{}", e);
            json!(["error", { "message": e.to_string(), "name": NOT_FOUND_ERROR_NAME }])
        }
    }
}
