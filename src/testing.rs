//! In-memory host and engine used by the unit tests.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::runtime::Handle;

use crate::buffer::BufferLedger;
use crate::config::{Config, HttpConfig};
use crate::host::{BrowserHost, Completion, HostObject};
use crate::http::{HttpOutcome, HttpRelay};
use crate::message::Envelope;
use crate::router::{outbound_channel, OutboundReceiver};
use crate::runtime::{
    runtime_channel, Capabilities, CapabilityParts, EngineFactory, RequestId, RuntimeHandle,
    RuntimeInbox, ScriptEngine, ScriptError,
};
use crate::timer::{TimerService, TimerTag};

static SERIAL: AtomicU64 = AtomicU64::new(1);

fn serial() -> u64 {
    SERIAL.fetch_add(1, Ordering::Relaxed)
}

macro_rules! fake_object {
    ($name:ident) => {
        /// Compared by allocation, like a host wrapper around a native object.
        #[derive(Debug, Clone)]
        pub struct $name(Arc<u64>);

        impl $name {
            fn fresh() -> Self {
                Self(Arc::new(serial()))
            }
        }

        impl HostObject for $name {
            fn same_object(&self, other: &Self) -> bool {
                Arc::ptr_eq(&self.0, &other.0)
            }
        }
    };
}

fake_object!(FakeWindow);
fake_object!(FakeTab);
fake_object!(FakePage);

struct TabEntry {
    tab: FakeTab,
    page: Option<(FakePage, Option<String>)>,
}

struct WindowEntry {
    window: FakeWindow,
    tabs: Vec<TabEntry>,
    active: Option<usize>,
}

#[derive(Default)]
struct World {
    windows: Vec<WindowEntry>,
    active_window: Option<FakeWindow>,
}

impl World {
    fn window_mut(&mut self, window: &FakeWindow) -> Option<&mut WindowEntry> {
        self.windows.iter_mut().find(|w| w.window.same_object(window))
    }

    fn tab_entry(&self, tab: &FakeTab) -> Option<&TabEntry> {
        self.windows
            .iter()
            .flat_map(|w| w.tabs.iter())
            .find(|t| t.tab.same_object(tab))
    }

    fn push_tab(&mut self, window: &FakeWindow, url: Option<&str>) -> Option<(FakeTab, FakePage)> {
        let entry = self.window_mut(window)?;
        let tab = FakeTab::fresh();
        let page = FakePage::fresh();
        entry.tabs.push(TabEntry {
            tab: tab.clone(),
            page: Some((page.clone(), url.map(str::to_string))),
        });
        entry.active = Some(entry.tabs.len() - 1);
        Some((tab, page))
    }
}

/// A page dispatch recorded by [`FakeHost`].
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub page: FakePage,
    pub name: String,
    pub user_info: Value,
}

/// Scriptable in-memory browser.
#[derive(Default)]
pub struct FakeHost {
    world: Mutex<World>,
    parked_active_window: Mutex<Vec<Completion<Option<FakeWindow>>>>,
    parked_windows: Mutex<Vec<Completion<Vec<FakeWindow>>>>,
    parked_containing_tab: Mutex<Vec<Completion<Option<FakeTab>>>>,

    /// Park `active_window` completions instead of answering
    pub silent_active_window: AtomicBool,
    /// Park `windows` completions instead of answering
    pub silent_windows: AtomicBool,
    /// Pages whose `containing_tab` is never answered
    pub silent_pages: Mutex<Vec<FakePage>>,

    pub dispatched: Mutex<Vec<Dispatch>>,
    pub toolbar: Mutex<Vec<(FakeWindow, Option<PathBuf>, String)>>,
    pub opened_urls: Mutex<Vec<String>>,
    pub closed_tabs: Mutex<Vec<FakeTab>>,
    pub activated_tabs: Mutex<Vec<FakeTab>>,
    pub version: Mutex<Option<String>>,
    pub languages: Mutex<Vec<String>>,
    pub base: Mutex<Option<String>>,
}

impl FakeHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Open an empty window and bring it to the front.
    pub fn add_window(&self) -> FakeWindow {
        let window = FakeWindow::fresh();
        let mut world = self.world.lock();
        world.windows.push(WindowEntry {
            window: window.clone(),
            tabs: Vec::new(),
            active: None,
        });
        world.active_window = Some(window.clone());
        window
    }

    pub fn close_window(&self, window: &FakeWindow) {
        let mut world = self.world.lock();
        world.windows.retain(|w| !w.window.same_object(window));
        if world
            .active_window
            .as_ref()
            .map(|w| w.same_object(window))
            .unwrap_or(false)
        {
            world.active_window = world.windows.last().map(|w| w.window.clone());
        }
    }

    pub fn set_active_window(&self, window: &FakeWindow) {
        self.world.lock().active_window = Some(window.clone());
    }

    /// Add a tab showing a page titled `title` and select it.
    pub fn add_tab(&self, window: &FakeWindow, title: Option<&str>) -> (FakeTab, FakePage) {
        self.world
            .lock()
            .push_tab(window, title)
            .expect("add_tab on a closed window")
    }

    pub fn select_tab(&self, tab: &FakeTab) {
        let mut world = self.world.lock();
        for entry in &mut world.windows {
            if let Some(index) = entry.tabs.iter().position(|t| t.tab.same_object(tab)) {
                entry.active = Some(index);
            }
        }
    }

    pub fn remove_tab(&self, tab: &FakeTab) {
        let mut world = self.world.lock();
        for entry in &mut world.windows {
            if let Some(index) = entry.tabs.iter().position(|t| t.tab.same_object(tab)) {
                entry.tabs.remove(index);
                entry.active = if entry.tabs.is_empty() {
                    None
                } else {
                    Some(entry.tabs.len() - 1)
                };
            }
        }
    }

    /// Load a new page in `tab`.
    pub fn navigate(&self, tab: &FakeTab, title: Option<&str>) -> FakePage {
        let page = FakePage::fresh();
        let mut world = self.world.lock();
        for entry in &mut world.windows {
            for t in &mut entry.tabs {
                if t.tab.same_object(tab) {
                    t.page = Some((page.clone(), title.map(str::to_string)));
                }
            }
        }
        page
    }

    pub fn is_same_window(&self, a: &FakeWindow, b: &FakeWindow) -> bool {
        a.same_object(b)
    }

    pub fn is_same_tab(&self, a: &FakeTab, b: &FakeTab) -> bool {
        a.same_object(b)
    }

    /// Answer every parked `active_window` completion; returns how many.
    pub fn flush_parked_active_window(&self) -> usize {
        let parked: Vec<_> = self.parked_active_window.lock().drain(..).collect();
        let active = self.world.lock().active_window.clone();
        let count = parked.len();
        for done in parked {
            done(active.clone());
        }
        count
    }

    /// Dispatches that went to `page`, as `(name, user_info)`.
    pub fn dispatched_to(&self, page: &FakePage) -> Vec<(String, Value)> {
        self.dispatched
            .lock()
            .iter()
            .filter(|d| d.page.same_object(page))
            .map(|d| (d.name.clone(), d.user_info.clone()))
            .collect()
    }

    pub fn dispatch_count(&self) -> usize {
        self.dispatched.lock().len()
    }

    pub fn window_count(&self) -> usize {
        self.world.lock().windows.len()
    }
}

impl BrowserHost for FakeHost {
    type Window = FakeWindow;
    type Tab = FakeTab;
    type Page = FakePage;

    fn windows(&self, done: Completion<Vec<FakeWindow>>) {
        if self.silent_windows.load(Ordering::SeqCst) {
            self.parked_windows.lock().push(done);
            return;
        }
        let windows = self.world.lock().windows.iter().map(|w| w.window.clone()).collect();
        done(windows);
    }

    fn active_window(&self, done: Completion<Option<FakeWindow>>) {
        if self.silent_active_window.load(Ordering::SeqCst) {
            self.parked_active_window.lock().push(done);
            return;
        }
        let active = self.world.lock().active_window.clone();
        done(active);
    }

    fn tabs(&self, window: &FakeWindow, done: Completion<Vec<FakeTab>>) {
        let tabs = self
            .world
            .lock()
            .window_mut(window)
            .map(|w| w.tabs.iter().map(|t| t.tab.clone()).collect())
            .unwrap_or_default();
        done(tabs);
    }

    fn active_tab(&self, window: &FakeWindow, done: Completion<Option<FakeTab>>) {
        let tab = self.world.lock().window_mut(window).and_then(|w| {
            w.active
                .and_then(|i| w.tabs.get(i))
                .map(|t| t.tab.clone())
        });
        done(tab);
    }

    fn active_page(&self, tab: &FakeTab, done: Completion<Option<FakePage>>) {
        let page = self
            .world
            .lock()
            .tab_entry(tab)
            .and_then(|t| t.page.as_ref().map(|(page, _)| page.clone()));
        done(page);
    }

    fn containing_tab(&self, page: &FakePage, done: Completion<Option<FakeTab>>) {
        if self.silent_pages.lock().iter().any(|p| p.same_object(page)) {
            self.parked_containing_tab.lock().push(done);
            return;
        }
        let world = self.world.lock();
        let tab = world
            .windows
            .iter()
            .flat_map(|w| w.tabs.iter())
            .find(|t| {
                t.page
                    .as_ref()
                    .map(|(p, _)| p.same_object(page))
                    .unwrap_or(false)
            })
            .map(|t| t.tab.clone());
        drop(world);
        done(tab);
    }

    fn page_title(&self, page: &FakePage, done: Completion<Option<String>>) {
        let world = self.world.lock();
        let title = world
            .windows
            .iter()
            .flat_map(|w| w.tabs.iter())
            .filter_map(|t| t.page.as_ref())
            .find(|(p, _)| p.same_object(page))
            .and_then(|(_, title)| title.clone());
        drop(world);
        done(title);
    }

    fn dispatch(&self, page: &FakePage, name: &str, user_info: Value) {
        self.dispatched.lock().push(Dispatch {
            page: page.clone(),
            name: name.to_string(),
            user_info,
        });
    }

    fn open_window(&self, url: &str, done: Completion<Option<FakeWindow>>) {
        self.opened_urls.lock().push(url.to_string());
        let window = self.add_window();
        self.world.lock().push_tab(&window, Some(url));
        done(Some(window));
    }

    fn open_tab(&self, window: &FakeWindow, url: &str, done: Completion<Option<FakeTab>>) {
        self.opened_urls.lock().push(url.to_string());
        let tab = self.world.lock().push_tab(window, Some(url)).map(|(tab, _)| tab);
        done(tab);
    }

    fn close_tab(&self, tab: &FakeTab) {
        self.closed_tabs.lock().push(tab.clone());
        self.remove_tab(tab);
    }

    fn activate_tab(&self, tab: &FakeTab) {
        self.activated_tabs.lock().push(tab.clone());
        self.select_tab(tab);
    }

    fn set_toolbar_item(&self, window: &FakeWindow, image: Option<&Path>, label: &str) {
        self.toolbar
            .lock()
            .push((window.clone(), image.map(Path::to_path_buf), label.to_string()));
    }

    fn base_uri(&self, done: Completion<Option<String>>) {
        done(self.base.lock().clone());
    }

    fn preferred_languages(&self) -> Vec<String> {
        self.languages.lock().clone()
    }

    fn version(&self) -> Option<String> {
        self.version.lock().clone()
    }
}

#[derive(Default)]
struct EngineRecord {
    evaluated: Vec<String>,
    envelopes: Vec<Envelope>,
    http: Vec<(RequestId, HttpOutcome)>,
    timers: Vec<(TimerTag, bool)>,
    closed_windows: Vec<Value>,
    threads: Vec<String>,
    fail_on: HashSet<String>,
    panic_on: HashSet<String>,
}

/// Shared record of everything a [`RecordingEngine`] saw.
#[derive(Clone, Default)]
pub struct EngineLog(Arc<Mutex<EngineRecord>>);

impl EngineLog {
    /// Script names and message names that make the engine return an error.
    pub fn fail_on(&self, name: &str) {
        self.0.lock().fail_on.insert(name.to_string());
    }

    /// Message names that make the engine panic.
    pub fn panic_on(&self, name: &str) {
        self.0.lock().panic_on.insert(name.to_string());
    }

    pub fn evaluated(&self) -> Vec<String> {
        self.0.lock().evaluated.clone()
    }

    pub fn envelopes(&self) -> Vec<Envelope> {
        self.0.lock().envelopes.clone()
    }

    pub fn http(&self) -> Vec<(RequestId, HttpOutcome)> {
        self.0.lock().http.clone()
    }

    pub fn timers(&self) -> Vec<(TimerTag, bool)> {
        self.0.lock().timers.clone()
    }

    pub fn closed_windows(&self) -> Vec<Value> {
        self.0.lock().closed_windows.clone()
    }

    /// Distinct threads the engine was entered from.
    pub fn thread_names(&self) -> Vec<String> {
        self.0.lock().threads.clone()
    }

    fn touch(&self) {
        let name = std::thread::current().name().unwrap_or("<unnamed>").to_string();
        let mut record = self.0.lock();
        if !record.threads.contains(&name) {
            record.threads.push(name);
        }
    }
}

/// Engine that records calls instead of running scripts.
pub struct RecordingEngine {
    log: EngineLog,
}

impl ScriptEngine for RecordingEngine {
    fn evaluate(&mut self, source_name: &str, _source: &str) -> Result<(), ScriptError> {
        self.log.touch();
        let mut record = self.log.0.lock();
        if record.fail_on.contains(source_name) {
            return Err(ScriptError::new(format!("SyntaxError in {}", source_name)));
        }
        record.evaluated.push(source_name.to_string());
        Ok(())
    }

    fn receive_message(&mut self, envelope: Envelope) -> Result<(), ScriptError> {
        self.log.touch();
        let name = envelope.name.clone();
        let (fail, panic) = {
            let mut record = self.log.0.lock();
            record.envelopes.push(envelope);
            (record.fail_on.contains(&name), record.panic_on.contains(&name))
        };
        if panic {
            panic!("engine blew up on {}", name);
        }
        if fail {
            return Err(ScriptError::new(format!("TypeError handling {}", name)));
        }
        Ok(())
    }

    fn complete_http(&mut self, request: RequestId, outcome: HttpOutcome) -> Result<(), ScriptError> {
        self.log.touch();
        self.log.0.lock().http.push((request, outcome));
        Ok(())
    }

    fn fire_timer(&mut self, tag: TimerTag, finished: bool) -> Result<(), ScriptError> {
        self.log.touch();
        self.log.0.lock().timers.push((tag, finished));
        Ok(())
    }

    fn window_closed(&mut self, token: Value) -> Result<(), ScriptError> {
        self.log.touch();
        self.log.0.lock().closed_windows.push(token);
        Ok(())
    }
}

pub fn recording_factory(log: EngineLog) -> EngineFactory {
    Box::new(
        move |_capabilities: Capabilities| -> Result<Box<dyn ScriptEngine>, ScriptError> {
            Ok(Box::new(RecordingEngine { log }))
        },
    )
}

/// Capabilities wired to plain channels, for tests without a gateway.
pub struct Harness {
    pub capabilities: Capabilities,
    pub handle: RuntimeHandle,
    pub inbox: RuntimeInbox,
    pub outbound: OutboundReceiver,
}

impl Harness {
    /// Must be called inside a tokio runtime.
    pub fn new() -> Self {
        let (handle, inbox) = runtime_channel();
        let (queue, outbound) = outbound_channel();
        let io = Handle::current();

        let capabilities = Capabilities::new(CapabilityParts {
            runtime: handle.clone(),
            outbound: queue,
            native_prefix: "Swift.".to_string(),
            http: Arc::new(HttpRelay::new(&offline_http()).expect("http client")),
            io: io.clone(),
            timers: TimerService::new(io, Arc::new(handle.clone())),
            buffers: BufferLedger::new(),
        });

        Self {
            capabilities,
            handle,
            inbox,
            outbound,
        }
    }
}

/// HTTP settings that ignore proxies from the environment.
pub fn offline_http() -> HttpConfig {
    HttpConfig {
        system_proxy: false,
        ..HttpConfig::default()
    }
}

/// Create files under `root`.
pub fn write_bundle(root: &Path, files: &[(&str, &str)]) {
    for (path, contents) in files {
        let full = root.join(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(full, contents).unwrap();
    }
}

/// Config rooted in a temp directory with a two-script bootstrap.
pub fn test_config(root: &Path) -> Config {
    write_bundle(
        root,
        &[
            ("bundle/safari/zotero.js", "// zotero"),
            ("bundle/safari/global.js", "// global"),
        ],
    );

    let mut config = Config::default();
    config.resources.root = root.join("bundle");
    config.resources.bootstrap = vec!["zotero.js".to_string(), "global.js".to_string()];
    config.prefs.path = root.join("prefs.json");
    config.host.sweep_interval_secs = 0;
    config.http = offline_http();
    config
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
