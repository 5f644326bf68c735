//! C FFI layer for the connector bridge.
//!
//! The app extension embeds the bridge through this interface. It supplies two
//! vtables: one for the browser host (windows, tabs, pages, toolbar) and one
//! for its JavaScript context. Host objects cross the boundary as opaque
//! pointers the bridge retains and releases through the host vtable.
//!
//! Structured values are JSON strings. Strings returned by the bridge must be
//! freed with `bridge_string_free()`. Byte results are lent as [`BridgeBytes`]
//! and given back with `bridge_buffer_release()`.

use std::collections::BTreeMap;
use std::ffi::{c_void, CStr, CString};
use std::os::raw::c_char;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use once_cell::sync::{Lazy, OnceCell};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;
use tracing::{error, trace, warn};
use tracing_appender::non_blocking::WorkerGuard;

use crate::bridge::Bridge;
use crate::buffer::{BufferId, SharedBuffer};
use crate::config::{Config, LoggingConfig};
use crate::encoding;
use crate::error::{BridgeError, BridgeResult};
use crate::host::{BrowserHost, Completion, HostObject};
use crate::http::{outcome_to_wire, HttpOutcome, HttpResponse, ResponseBody};
use crate::logging;
use crate::message::{CorrelationId, Envelope, TabId};
use crate::runtime::{
    Capabilities, EngineFactory, RequestId, RuntimeState, ScriptEngine, ScriptError,
};
use crate::timer::TimerTag;

/// Kept for the life of the process once file logging is on.
static LOG_GUARD: OnceCell<Mutex<Option<WorkerGuard>>> = OnceCell::new();

/// Host answers still owed, keyed by the token handed to the host.
static COMPLETIONS: Lazy<Mutex<CompletionTable>> =
    Lazy::new(|| Mutex::new(CompletionTable::default()));

// ============================================================================
// Vtables
// ============================================================================

/// Browser host functions supplied by the app extension.
///
/// Object arguments are borrowed; the bridge calls `retain` for every object
/// it keeps. Functions taking a `BridgeCompletion` must finish it at most once
/// with one of the `bridge_complete_*` functions, from any thread. A completion
/// that is never finished is treated as "no answer" after the host timeout.
///
/// Every function may be called from any thread.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct BridgeHostVTable {
    pub context: *mut c_void,
    pub retain: unsafe extern "C" fn(context: *mut c_void, object: *mut c_void),
    pub release: unsafe extern "C" fn(context: *mut c_void, object: *mut c_void),
    pub is_equal: unsafe extern "C" fn(context: *mut c_void, a: *mut c_void, b: *mut c_void) -> bool,
    pub windows: unsafe extern "C" fn(context: *mut c_void, done: *mut BridgeCompletion),
    pub active_window: unsafe extern "C" fn(context: *mut c_void, done: *mut BridgeCompletion),
    pub tabs:
        unsafe extern "C" fn(context: *mut c_void, window: *mut c_void, done: *mut BridgeCompletion),
    pub active_tab:
        unsafe extern "C" fn(context: *mut c_void, window: *mut c_void, done: *mut BridgeCompletion),
    pub active_page:
        unsafe extern "C" fn(context: *mut c_void, tab: *mut c_void, done: *mut BridgeCompletion),
    pub containing_tab:
        unsafe extern "C" fn(context: *mut c_void, page: *mut c_void, done: *mut BridgeCompletion),
    pub page_title:
        unsafe extern "C" fn(context: *mut c_void, page: *mut c_void, done: *mut BridgeCompletion),
    pub dispatch: unsafe extern "C" fn(
        context: *mut c_void,
        page: *mut c_void,
        name: *const c_char,
        user_info_json: *const c_char,
    ),
    pub open_window:
        unsafe extern "C" fn(context: *mut c_void, url: *const c_char, done: *mut BridgeCompletion),
    pub open_tab: unsafe extern "C" fn(
        context: *mut c_void,
        window: *mut c_void,
        url: *const c_char,
        done: *mut BridgeCompletion,
    ),
    pub close_tab: unsafe extern "C" fn(context: *mut c_void, tab: *mut c_void),
    pub activate_tab: unsafe extern "C" fn(context: *mut c_void, tab: *mut c_void),
    /// `image_path` is null when the toolbar image should be left alone.
    pub set_toolbar_item: unsafe extern "C" fn(
        context: *mut c_void,
        window: *mut c_void,
        image_path: *const c_char,
        label: *const c_char,
    ),
    pub base_uri: unsafe extern "C" fn(context: *mut c_void, done: *mut BridgeCompletion),
}

/// JavaScript context supplied by the app extension.
///
/// All functions are called on the bridge's runtime thread. Functions
/// returning `*const c_char` return null on success, or an error message the
/// bridge copies before the next call.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct BridgeEngineVTable {
    pub context: *mut c_void,
    /// Called once before any script runs. `capabilities` is valid until `detach`.
    pub attach: unsafe extern "C" fn(context: *mut c_void, capabilities: *const BridgeCapabilities),
    pub evaluate: unsafe extern "C" fn(
        context: *mut c_void,
        source_name: *const c_char,
        source: *const c_char,
    ) -> *const c_char,
    pub receive:
        unsafe extern "C" fn(context: *mut c_void, envelope_json: *const c_char) -> *const c_char,
    /// A binary body is passed as `body`/`body_len` and must be released with
    /// `bridge_buffer_release(buffer_id)`; its slot in `outcome_json` is null.
    /// Without one, `body` is null and `buffer_id` is 0.
    pub complete_http: unsafe extern "C" fn(
        context: *mut c_void,
        request: u64,
        outcome_json: *const c_char,
        body: *const u8,
        body_len: usize,
        buffer_id: u64,
    ) -> *const c_char,
    pub fire_timer:
        unsafe extern "C" fn(context: *mut c_void, tag: u64, finished: bool) -> *const c_char,
    pub window_closed:
        unsafe extern "C" fn(context: *mut c_void, token_json: *const c_char) -> *const c_char,
    pub run_pending: unsafe extern "C" fn(context: *mut c_void) -> *const c_char,
    pub detach: unsafe extern "C" fn(context: *mut c_void),
}

/// Options for `bridge_new()`, as JSON.
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct BridgeOptions {
    /// Explicit config file instead of the default location
    config_path: Option<PathBuf>,
    /// Version of the containing app
    version: Option<String>,
    preferred_languages: Vec<String>,
}

// ============================================================================
// Host Adapter
// ============================================================================

struct HostTable(BridgeHostVTable);

// The host promises its vtable is callable from any thread.
unsafe impl Send for HostTable {}
unsafe impl Sync for HostTable {}

/// A retained host object.
pub struct ForeignObject {
    raw: *mut c_void,
    host: Arc<HostTable>,
}

unsafe impl Send for ForeignObject {}
unsafe impl Sync for ForeignObject {}

impl ForeignObject {
    /// Take a reference to a borrowed host pointer.
    fn retained(raw: *mut c_void, host: &Arc<HostTable>) -> Self {
        unsafe { (host.0.retain)(host.0.context, raw) };
        Self {
            raw,
            host: Arc::clone(host),
        }
    }

    pub fn as_ptr(&self) -> *mut c_void {
        self.raw
    }
}

impl Clone for ForeignObject {
    fn clone(&self) -> Self {
        Self::retained(self.raw, &self.host)
    }
}

impl Drop for ForeignObject {
    fn drop(&mut self) {
        unsafe { (self.host.0.release)(self.host.0.context, self.raw) };
    }
}

impl HostObject for ForeignObject {
    fn same_object(&self, other: &Self) -> bool {
        self.raw == other.raw || unsafe { (self.host.0.is_equal)(self.host.0.context, self.raw, other.raw) }
    }
}

enum CompletionKind {
    Objects(Completion<Vec<ForeignObject>>),
    Object(Completion<Option<ForeignObject>>),
    Text(Completion<Option<String>>),
}

/// A pending host answer, as the host sees it: an opaque token finished by
/// one of the `bridge_complete_*` functions. Never dereferenced.
#[repr(C)]
pub struct BridgeCompletion {
    _opaque: [u8; 0],
}

struct PendingCompletion {
    host: Arc<HostTable>,
    kind: CompletionKind,
    expires: Instant,
}

/// Every completion handed out and not yet finished or expired.
///
/// An entry lives until the host answers or its waiter's timeout has passed,
/// so a host that never answers cannot grow the table without bound. Tokens
/// are never reused; a late answer finds nothing and is ignored.
#[derive(Default)]
struct CompletionTable {
    last_token: u64,
    pending: BTreeMap<u64, PendingCompletion>,
}

impl CompletionTable {
    fn insert(&mut self, completion: PendingCompletion) -> u64 {
        self.last_token += 1;
        self.pending.insert(self.last_token, completion);
        self.last_token
    }

    fn remove_where(&mut self, stale: impl Fn(&PendingCompletion) -> bool) -> Vec<PendingCompletion> {
        let tokens: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, completion)| stale(completion))
            .map(|(token, _)| *token)
            .collect();
        tokens
            .iter()
            .filter_map(|token| self.pending.remove(token))
            .collect()
    }
}

/// Register an answer the host owes and return its token. Expired entries
/// are dropped on the way; their waiters already settled on "no answer".
fn register_completion(
    host: &Arc<HostTable>,
    kind: CompletionKind,
    window: Duration,
) -> *mut BridgeCompletion {
    let now = Instant::now();
    let (token, expired) = {
        let mut table = COMPLETIONS.lock();
        let expired = table.remove_where(|completion| completion.expires <= now);
        let token = table.insert(PendingCompletion {
            host: Arc::clone(host),
            kind,
            expires: now + window,
        });
        (token, expired)
    };
    if !expired.is_empty() {
        trace!("dropped {} unanswered host completions", expired.len());
    }
    drop(expired);
    token as usize as *mut BridgeCompletion
}

/// Claim a completion. `None` for tokens that expired or were already used.
fn take_completion(done: *mut BridgeCompletion) -> Option<PendingCompletion> {
    let token = done as usize as u64;
    let completion = COMPLETIONS.lock().pending.remove(&token);
    if completion.is_none() {
        trace!("ignoring late or repeated completion {}", token);
    }
    completion
}

/// Drop every completion still owed by `host`.
fn forget_completions(host: &Arc<HostTable>) {
    let stale = COMPLETIONS
        .lock()
        .remove_where(|completion| Arc::ptr_eq(&completion.host, host));
    drop(stale);
}

/// [`BrowserHost`] backed by a C vtable.
pub struct ForeignHost {
    table: Arc<HostTable>,
    version: Option<String>,
    languages: Vec<String>,
    /// How long a completion is kept for an answer
    answer_window: Duration,
}

impl ForeignHost {
    fn new(
        vtable: BridgeHostVTable,
        version: Option<String>,
        languages: Vec<String>,
        answer_window: Duration,
    ) -> Self {
        Self {
            table: Arc::new(HostTable(vtable)),
            version,
            languages,
            answer_window,
        }
    }

    fn vtable(&self) -> &BridgeHostVTable {
        &self.table.0
    }

    fn completion(&self, kind: CompletionKind) -> *mut BridgeCompletion {
        register_completion(&self.table, kind, self.answer_window)
    }
}

impl BrowserHost for ForeignHost {
    type Window = ForeignObject;
    type Tab = ForeignObject;
    type Page = ForeignObject;

    fn windows(&self, done: Completion<Vec<ForeignObject>>) {
        let done = self.completion(CompletionKind::Objects(done));
        unsafe { (self.vtable().windows)(self.vtable().context, done) };
    }

    fn active_window(&self, done: Completion<Option<ForeignObject>>) {
        let done = self.completion(CompletionKind::Object(done));
        unsafe { (self.vtable().active_window)(self.vtable().context, done) };
    }

    fn tabs(&self, window: &ForeignObject, done: Completion<Vec<ForeignObject>>) {
        let done = self.completion(CompletionKind::Objects(done));
        unsafe { (self.vtable().tabs)(self.vtable().context, window.as_ptr(), done) };
    }

    fn active_tab(&self, window: &ForeignObject, done: Completion<Option<ForeignObject>>) {
        let done = self.completion(CompletionKind::Object(done));
        unsafe { (self.vtable().active_tab)(self.vtable().context, window.as_ptr(), done) };
    }

    fn active_page(&self, tab: &ForeignObject, done: Completion<Option<ForeignObject>>) {
        let done = self.completion(CompletionKind::Object(done));
        unsafe { (self.vtable().active_page)(self.vtable().context, tab.as_ptr(), done) };
    }

    fn containing_tab(&self, page: &ForeignObject, done: Completion<Option<ForeignObject>>) {
        let done = self.completion(CompletionKind::Object(done));
        unsafe { (self.vtable().containing_tab)(self.vtable().context, page.as_ptr(), done) };
    }

    fn page_title(&self, page: &ForeignObject, done: Completion<Option<String>>) {
        let done = self.completion(CompletionKind::Text(done));
        unsafe { (self.vtable().page_title)(self.vtable().context, page.as_ptr(), done) };
    }

    fn dispatch(&self, page: &ForeignObject, name: &str, user_info: Value) {
        let (Some(name), Some(user_info)) = (to_c_string(name), to_c_string(&user_info.to_string()))
        else {
            warn!("Dropping dispatch of {} with an embedded NUL", name);
            return;
        };
        unsafe {
            (self.vtable().dispatch)(
                self.vtable().context,
                page.as_ptr(),
                name.as_ptr(),
                user_info.as_ptr(),
            )
        };
    }

    fn open_window(&self, url: &str, done: Completion<Option<ForeignObject>>) {
        let Some(url) = to_c_string(url) else {
            done(None);
            return;
        };
        let done = self.completion(CompletionKind::Object(done));
        unsafe { (self.vtable().open_window)(self.vtable().context, url.as_ptr(), done) };
    }

    fn open_tab(&self, window: &ForeignObject, url: &str, done: Completion<Option<ForeignObject>>) {
        let Some(url) = to_c_string(url) else {
            done(None);
            return;
        };
        let done = self.completion(CompletionKind::Object(done));
        unsafe {
            (self.vtable().open_tab)(self.vtable().context, window.as_ptr(), url.as_ptr(), done)
        };
    }

    fn close_tab(&self, tab: &ForeignObject) {
        unsafe { (self.vtable().close_tab)(self.vtable().context, tab.as_ptr()) };
    }

    fn activate_tab(&self, tab: &ForeignObject) {
        unsafe { (self.vtable().activate_tab)(self.vtable().context, tab.as_ptr()) };
    }

    fn set_toolbar_item(&self, window: &ForeignObject, image: Option<&Path>, label: &str) {
        let image = image.and_then(|path| to_c_string(&path.to_string_lossy()));
        let Some(label) = to_c_string(label) else {
            return;
        };
        let image_ptr = image.as_ref().map_or(ptr::null(), |path| path.as_ptr());
        unsafe {
            (self.vtable().set_toolbar_item)(
                self.vtable().context,
                window.as_ptr(),
                image_ptr,
                label.as_ptr(),
            )
        };
    }

    fn base_uri(&self, done: Completion<Option<String>>) {
        let done = self.completion(CompletionKind::Text(done));
        unsafe { (self.vtable().base_uri)(self.vtable().context, done) };
    }

    fn preferred_languages(&self) -> Vec<String> {
        self.languages.clone()
    }

    fn version(&self) -> Option<String> {
        self.version.clone()
    }
}

// ============================================================================
// Engine Adapter
// ============================================================================

/// Script namespace handed to the engine in `attach`.
pub struct BridgeCapabilities {
    capabilities: Capabilities,
}

impl BridgeCapabilities {
    fn lend(&self, bytes: Vec<u8>) -> BridgeBytes {
        BridgeBytes::from(self.capabilities.share_buffer(Bytes::from(bytes)))
    }
}

/// Bytes lent to the engine. Valid until `bridge_buffer_release(id)`.
///
/// An `id` of 0 means nothing was lent; `ptr` is then null.
#[repr(C)]
#[derive(Debug)]
pub struct BridgeBytes {
    pub ptr: *const u8,
    pub len: usize,
    pub id: BufferId,
}

impl BridgeBytes {
    fn none() -> Self {
        Self {
            ptr: ptr::null(),
            len: 0,
            id: 0,
        }
    }
}

impl From<SharedBuffer> for BridgeBytes {
    fn from(buffer: SharedBuffer) -> Self {
        Self {
            ptr: buffer.ptr,
            len: buffer.len,
            id: buffer.id,
        }
    }
}

struct EngineTable(BridgeEngineVTable);

// Only moved once, onto the runtime thread, where it stays.
unsafe impl Send for EngineTable {}

/// [`ScriptEngine`] backed by a C vtable.
struct ForeignEngine {
    table: BridgeEngineVTable,
    // Boxed so the pointer given to `attach` stays put
    capabilities: Box<BridgeCapabilities>,
}

impl ForeignEngine {
    fn attach(table: EngineTable, capabilities: Capabilities) -> Self {
        let engine = Self {
            table: table.0,
            capabilities: Box::new(BridgeCapabilities { capabilities }),
        };
        unsafe { (engine.table.attach)(engine.table.context, &*engine.capabilities) };
        engine
    }

    fn call(&self, what: &str, result: *const c_char) -> Result<(), ScriptError> {
        if result.is_null() {
            Ok(())
        } else {
            let message = unsafe { CStr::from_ptr(result) }.to_string_lossy();
            Err(ScriptError::new(format!("{}: {}", what, message)))
        }
    }
}

fn c_arg(value: &str) -> Result<CString, ScriptError> {
    CString::new(value).map_err(|_| ScriptError::new("embedded NUL in engine argument"))
}

impl ScriptEngine for ForeignEngine {
    fn evaluate(&mut self, source_name: &str, source: &str) -> Result<(), ScriptError> {
        let (name, source) = (c_arg(source_name)?, c_arg(source)?);
        let result =
            unsafe { (self.table.evaluate)(self.table.context, name.as_ptr(), source.as_ptr()) };
        self.call(source_name, result)
    }

    fn receive_message(&mut self, envelope: Envelope) -> Result<(), ScriptError> {
        let json = serde_json::to_string(&envelope).map_err(|e| ScriptError::new(e.to_string()))?;
        let json = c_arg(&json)?;
        let result = unsafe { (self.table.receive)(self.table.context, json.as_ptr()) };
        self.call(&envelope.name, result)
    }

    fn complete_http(&mut self, request: RequestId, outcome: HttpOutcome) -> Result<(), ScriptError> {
        let mut wire = outcome_to_wire(&outcome);
        let shared = match &outcome {
            Ok(HttpResponse {
                body: ResponseBody::Binary(bytes),
                ..
            }) => {
                if let Some(slot) = wire.get_mut(1) {
                    *slot = Value::Null;
                }
                Some(self.capabilities.capabilities.share_buffer(bytes.clone()))
            }
            _ => None,
        };

        let json = c_arg(&wire.to_string())?;
        let (body, len, id) = shared
            .as_ref()
            .map_or((ptr::null(), 0, 0), |buffer| (buffer.ptr, buffer.len, buffer.id));
        let result = unsafe {
            (self.table.complete_http)(self.table.context, request, json.as_ptr(), body, len, id)
        };
        self.call("http completion", result)
    }

    fn fire_timer(&mut self, tag: TimerTag, finished: bool) -> Result<(), ScriptError> {
        let result = unsafe { (self.table.fire_timer)(self.table.context, tag, finished) };
        self.call("timer", result)
    }

    fn window_closed(&mut self, token: Value) -> Result<(), ScriptError> {
        let json = c_arg(&token.to_string())?;
        let result = unsafe { (self.table.window_closed)(self.table.context, json.as_ptr()) };
        self.call("window close", result)
    }

    fn run_pending(&mut self) -> Result<(), ScriptError> {
        let result = unsafe { (self.table.run_pending)(self.table.context) };
        self.call("pending jobs", result)
    }
}

impl Drop for ForeignEngine {
    fn drop(&mut self) {
        unsafe { (self.table.detach)(self.table.context) };
    }
}

// ============================================================================
// Bridge Lifecycle
// ============================================================================

/// Opaque handle to a running bridge.
///
/// Created by `bridge_new()` and freed with `bridge_free()`.
pub struct BridgeHandle {
    bridge: Bridge<ForeignHost>,
    host: Arc<HostTable>,
}

/// Create and start a bridge.
///
/// `options_json` may be null or a JSON object with `configPath`, `version`
/// and `preferredLanguages`. The engine is attached and the bootstrap scripts
/// evaluated before this returns.
///
/// Returns null on failure. A bootstrap failure is not a failure here: the
/// bridge starts inert and `bridge_runtime_state()` reports it.
///
/// # Safety
/// Both vtables must be valid and stay callable until `bridge_free()` returns.
#[no_mangle]
pub unsafe extern "C" fn bridge_new(
    host: *const BridgeHostVTable,
    engine: *const BridgeEngineVTable,
    options_json: *const c_char,
) -> *mut BridgeHandle {
    match create_bridge(host, engine, options_json) {
        Ok((bridge, host)) => Box::into_raw(Box::new(BridgeHandle { bridge, host })),
        Err(e) => {
            error!("Failed to create bridge: {}", e);
            ptr::null_mut()
        }
    }
}

unsafe fn create_bridge(
    host: *const BridgeHostVTable,
    engine: *const BridgeEngineVTable,
    options_json: *const c_char,
) -> BridgeResult<(Bridge<ForeignHost>, Arc<HostTable>)> {
    if host.is_null() || engine.is_null() {
        return Err(BridgeError::Host("missing host or engine vtable".to_string()));
    }

    let options = if options_json.is_null() {
        BridgeOptions::default()
    } else {
        let text = CStr::from_ptr(options_json)
            .to_str()
            .map_err(|_| BridgeError::Config("options are not UTF-8".to_string()))?;
        serde_json::from_str(text)
            .map_err(|e| BridgeError::Config(format!("invalid options: {}", e)))?
    };

    let config = match &options.config_path {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    };
    init_logging_once(&config.logging);

    let host = Arc::new(ForeignHost::new(
        *host,
        options.version,
        options.preferred_languages,
        config.host.callback_timeout(),
    ));
    let table = Arc::clone(&host.table);
    let engine = EngineTable(*engine);
    let factory: EngineFactory = Box::new(move |capabilities| {
        Ok(Box::new(ForeignEngine::attach(engine, capabilities)) as Box<dyn ScriptEngine>)
    });

    Ok((Bridge::start(config, host, factory)?, table))
}

fn init_logging_once(config: &LoggingConfig) {
    LOG_GUARD.get_or_init(|| match logging::init_logging(config) {
        Ok(guard) => Mutex::new(guard),
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            Mutex::new(None)
        }
    });
}

/// Stop and free a bridge. Queued runtime work finishes first; the engine is
/// detached before this returns.
///
/// # Safety
/// The handle must be a valid pointer returned by `bridge_new()`.
/// After calling this function, the handle is no longer valid.
#[no_mangle]
pub unsafe extern "C" fn bridge_free(handle: *mut BridgeHandle) {
    if handle.is_null() {
        return;
    }
    let handle = Box::from_raw(handle);
    let host = Arc::clone(&handle.host);
    drop(handle);
    forget_completions(&host);
}

/// Runtime state: 0 starting, 1 ready, 2 inert, 3 stopped.
///
/// # Safety
/// The handle must be valid or null.
#[no_mangle]
pub unsafe extern "C" fn bridge_runtime_state(handle: *const BridgeHandle) -> u8 {
    match handle.as_ref() {
        Some(handle) => handle.bridge.runtime_state() as u8,
        None => RuntimeState::Stopped as u8,
    }
}

// ============================================================================
// Host Events
// ============================================================================

/// A content script posted a message.
///
/// `page` is borrowed. `name` is the host's event name and is only logged;
/// the message itself is described by `user_info_json`.
///
/// # Safety
/// The handle must be valid. Strings must be valid C strings or null.
#[no_mangle]
pub unsafe extern "C" fn bridge_message_received(
    handle: *const BridgeHandle,
    page: *mut c_void,
    name: *const c_char,
    user_info_json: *const c_char,
) {
    let Some(handle) = handle.as_ref() else {
        return;
    };
    if page.is_null() {
        return;
    }
    let user_info = match c_str(user_info_json).map(serde_json::from_str::<Value>) {
        Some(Ok(value)) => value,
        _ => {
            warn!(target: "router", "Dropping message with unreadable userInfo");
            return;
        }
    };
    trace!(target: "router", "host event {:?}", c_str(name));

    let page = ForeignObject::retained(page, &handle.host);
    handle.bridge.message_received(page, user_info);
}

/// The toolbar item of `window` was clicked.
///
/// # Safety
/// The handle must be valid; `window` is borrowed.
#[no_mangle]
pub unsafe extern "C" fn bridge_toolbar_item_clicked(handle: *const BridgeHandle, window: *mut c_void) {
    let Some(handle) = handle.as_ref() else {
        return;
    };
    if window.is_null() {
        return;
    }
    let window = ForeignObject::retained(window, &handle.host);
    handle.bridge.toolbar_item_clicked(window);
}

/// How a context menu placeholder should be shown, as JSON:
/// `{"kind":"translator","label":...}`, `{"kind":"preferences","label":...}`
/// or `{"kind":"hidden"}`.
///
/// # Returns
/// A JSON string the caller must free with `bridge_string_free()`, or null.
///
/// # Safety
/// The handle must be valid and `command` a valid C string.
#[no_mangle]
pub unsafe extern "C" fn bridge_validate_menu_item(
    handle: *const BridgeHandle,
    command: *const c_char,
) -> *mut c_char {
    let (Some(handle), Some(command)) = (handle.as_ref(), c_str(command)) else {
        return ptr::null_mut();
    };
    let slot = handle.bridge.validate_menu_item(command);
    match serde_json::to_string(&slot) {
        Ok(json) => into_raw_string(json),
        Err(_) => ptr::null_mut(),
    }
}

/// A context menu placeholder was picked.
///
/// # Safety
/// The handle must be valid and `command` a valid C string.
#[no_mangle]
pub unsafe extern "C" fn bridge_menu_item_selected(handle: *const BridgeHandle, command: *const c_char) {
    if let (Some(handle), Some(command)) = (handle.as_ref(), c_str(command)) {
        handle.bridge.menu_item_selected(command);
    }
}

/// Ask every page to announce itself.
///
/// # Safety
/// The handle must be valid.
#[no_mangle]
pub unsafe extern "C" fn bridge_announce_global_available(handle: *const BridgeHandle) -> bool {
    handle
        .as_ref()
        .map(|handle| handle.bridge.announce_global_available())
        .unwrap_or(false)
}

// ============================================================================
// Host Completions
// ============================================================================

/// Finish a completion expecting a list of objects. The objects are borrowed.
///
/// Late and repeated answers are ignored.
///
/// # Safety
/// `done` must come from the bridge. `objects` must point to `count` object
/// pointers, or be null when `count` is 0.
#[no_mangle]
pub unsafe extern "C" fn bridge_complete_objects(
    done: *mut BridgeCompletion,
    objects: *const *mut c_void,
    count: usize,
) {
    let Some(PendingCompletion { host, kind, .. }) = take_completion(done) else {
        return;
    };
    match kind {
        CompletionKind::Objects(finish) => {
            let list = slice(objects, count)
                .iter()
                .filter(|object| !object.is_null())
                .map(|object| ForeignObject::retained(*object, &host))
                .collect();
            finish(list);
        }
        _ => warn!("Completion finished with a list it did not ask for"),
    }
}

/// Finish a completion expecting an optional object. Null means none.
///
/// # Safety
/// `done` must come from the bridge. `object` is borrowed.
#[no_mangle]
pub unsafe extern "C" fn bridge_complete_object(done: *mut BridgeCompletion, object: *mut c_void) {
    let Some(PendingCompletion { host, kind, .. }) = take_completion(done) else {
        return;
    };
    match kind {
        CompletionKind::Object(finish) => {
            let object =
                (!object.is_null()).then(|| ForeignObject::retained(object, &host));
            finish(object);
        }
        _ => warn!("Completion finished with an object it did not ask for"),
    }
}

/// Finish a completion expecting an optional string. Null means none.
///
/// # Safety
/// `done` must come from the bridge. `text` must be a valid C string or null.
#[no_mangle]
pub unsafe extern "C" fn bridge_complete_string(done: *mut BridgeCompletion, text: *const c_char) {
    let Some(PendingCompletion { kind, .. }) = take_completion(done) else {
        return;
    };
    match kind {
        CompletionKind::Text(finish) => finish(c_str(text).map(str::to_string)),
        _ => warn!("Completion finished with a string it did not ask for"),
    }
}

// ============================================================================
// Engine Calls
// ============================================================================

/// Send a message from the runtime.
///
/// `id_json` is the correlation id as JSON (string or integer). `args_json`
/// may be null. The tab id is used only when `has_tab_id` is set; otherwise
/// the message goes to the active tab.
///
/// Returns false when the message was refused.
///
/// # Safety
/// `capabilities` must be the pointer passed to `attach`. Strings must be
/// valid C strings or null.
#[no_mangle]
pub unsafe extern "C" fn bridge_send_message(
    capabilities: *const BridgeCapabilities,
    name: *const c_char,
    id_json: *const c_char,
    args_json: *const c_char,
    tab_id: TabId,
    has_tab_id: bool,
) -> bool {
    let (Some(capabilities), Some(name)) = (capabilities.as_ref(), c_str(name)) else {
        return false;
    };
    let Some(correlation_id) = json_arg(id_json).as_ref().and_then(CorrelationId::from_value)
    else {
        warn!(target: "router", "Message {} without a usable id", name);
        return false;
    };
    let args = json_arg(args_json).unwrap_or(Value::Null);

    capabilities.capabilities.send_message(
        name,
        correlation_id,
        args,
        has_tab_id.then_some(tab_id),
    )
}

/// Start an HTTP request. `method` and `options_json` may be null.
///
/// Returns the request id the outcome will carry, or 0 when `url` is unreadable.
///
/// # Safety
/// `capabilities` must be the pointer passed to `attach`. Strings must be
/// valid C strings or null.
#[no_mangle]
pub unsafe extern "C" fn bridge_http_request(
    capabilities: *const BridgeCapabilities,
    method: *const c_char,
    url: *const c_char,
    options_json: *const c_char,
) -> u64 {
    let (Some(capabilities), Some(url)) = (capabilities.as_ref(), c_str(url)) else {
        return 0;
    };
    let options = json_arg(options_json).unwrap_or(Value::Null);
    capabilities
        .capabilities
        .http_request(c_str(method), url, &options)
}

/// Schedule a timer. Returns its tag, or 0 without capabilities.
///
/// # Safety
/// `capabilities` must be the pointer passed to `attach`.
#[no_mangle]
pub unsafe extern "C" fn bridge_set_timer(
    capabilities: *const BridgeCapabilities,
    delay_ms: f64,
    repeat: bool,
) -> u64 {
    let Some(capabilities) = capabilities.as_ref() else {
        return 0;
    };
    if repeat {
        capabilities.capabilities.set_interval(delay_ms)
    } else {
        capabilities.capabilities.set_timeout(delay_ms)
    }
}

/// Cancel a timer. Returns false for unknown or finished tags.
///
/// # Safety
/// `capabilities` must be the pointer passed to `attach`.
#[no_mangle]
pub unsafe extern "C" fn bridge_clear_timer(capabilities: *const BridgeCapabilities, tag: u64) -> bool {
    capabilities
        .as_ref()
        .map(|capabilities| capabilities.capabilities.clear_timer(tag))
        .unwrap_or(false)
}

/// Script console output.
///
/// # Safety
/// `capabilities` must be the pointer passed to `attach`.
#[no_mangle]
pub unsafe extern "C" fn bridge_log(capabilities: *const BridgeCapabilities, message: *const c_char) {
    if let (Some(capabilities), Some(message)) = (capabilities.as_ref(), c_str(message)) {
        capabilities.capabilities.log(message);
    }
}

/// `atob`: decode base64 into a binary string, lent as one byte per char.
/// Undecodable input gives an empty buffer.
///
/// # Safety
/// `capabilities` must be the pointer passed to `attach`. `encoded` must point
/// to `len` bytes, or be null when `len` is 0.
#[no_mangle]
pub unsafe extern "C" fn bridge_atob(
    capabilities: *const BridgeCapabilities,
    encoded: *const u8,
    len: usize,
) -> BridgeBytes {
    let Some(capabilities) = capabilities.as_ref() else {
        return BridgeBytes::none();
    };
    capabilities.lend(encoding::atob_bytes(slice(encoded, len)))
}

/// `btoa`: encode a script string, given as UTF-16 code units, as base64.
/// Returns null when a unit is outside Latin-1. The caller frees the result
/// with `bridge_string_free()`.
///
/// # Safety
/// `capabilities` must be the pointer passed to `attach`. `units` must point
/// to `len` code units, or be null when `len` is 0.
#[no_mangle]
pub unsafe extern "C" fn bridge_btoa(
    capabilities: *const BridgeCapabilities,
    units: *const u16,
    len: usize,
) -> *mut c_char {
    if capabilities.is_null() {
        return ptr::null_mut();
    }
    match encoding::btoa_utf16(slice(units, len)) {
        Ok(encoded) => into_raw_string(encoded),
        Err(e) => {
            warn!(target: "global", "btoa: {}", e);
            ptr::null_mut()
        }
    }
}

/// `TextEncoder.encode` of a script string given as UTF-16 code units.
///
/// # Safety
/// `capabilities` must be the pointer passed to `attach`. `units` must point
/// to `len` code units, or be null when `len` is 0.
#[no_mangle]
pub unsafe extern "C" fn bridge_encode_utf8(
    capabilities: *const BridgeCapabilities,
    units: *const u16,
    len: usize,
) -> BridgeBytes {
    let Some(capabilities) = capabilities.as_ref() else {
        return BridgeBytes::none();
    };
    capabilities.lend(encoding::encode_utf16_as_utf8(slice(units, len)))
}

/// Encode raw bytes as base64. The caller frees the result with
/// `bridge_string_free()`.
///
/// # Safety
/// `capabilities` must be the pointer passed to `attach`. `bytes` must point
/// to `len` bytes, or be null when `len` is 0.
#[no_mangle]
pub unsafe extern "C" fn bridge_base64_encode(
    capabilities: *const BridgeCapabilities,
    bytes: *const u8,
    len: usize,
) -> *mut c_char {
    let Some(capabilities) = capabilities.as_ref() else {
        return ptr::null_mut();
    };
    into_raw_string(capabilities.capabilities.base64_encode(slice(bytes, len)))
}

/// Strict base64 decode. Malformed input gives a buffer with id 0.
///
/// # Safety
/// `capabilities` must be the pointer passed to `attach`. `encoded` must point
/// to `len` bytes, or be null when `len` is 0.
#[no_mangle]
pub unsafe extern "C" fn bridge_base64_decode(
    capabilities: *const BridgeCapabilities,
    encoded: *const u8,
    len: usize,
) -> BridgeBytes {
    let Some(capabilities) = capabilities.as_ref() else {
        return BridgeBytes::none();
    };
    match encoding::base64_decode(slice(encoded, len)) {
        Ok(bytes) => capabilities.lend(bytes),
        Err(e) => {
            warn!(target: "global", "base64 decode: {}", e);
            BridgeBytes::none()
        }
    }
}

/// The engine finalised a buffer it got from `complete_http` or as
/// [`BridgeBytes`]. Unknown and repeated ids are ignored.
///
/// # Safety
/// `capabilities` must be the pointer passed to `attach`.
#[no_mangle]
pub unsafe extern "C" fn bridge_buffer_release(
    capabilities: *const BridgeCapabilities,
    id: BufferId,
) -> bool {
    capabilities
        .as_ref()
        .map(|capabilities| capabilities.capabilities.release_buffer(id))
        .unwrap_or(false)
}

/// Free a string allocated by the FFI functions.
///
/// # Safety
/// The pointer must be a valid string returned by one of the FFI functions,
/// or null (which is safely ignored).
#[no_mangle]
pub unsafe extern "C" fn bridge_string_free(ptr: *mut c_char) {
    if !ptr.is_null() {
        drop(CString::from_raw(ptr));
    }
}

// ============================================================================
// Internal Helper Functions
// ============================================================================

/// Borrow a C string. Null and invalid UTF-8 read as `None`.
unsafe fn c_str<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    CStr::from_ptr(ptr).to_str().ok()
}

/// Borrow `len` elements. Null reads as empty.
unsafe fn slice<'a, T>(ptr: *const T, len: usize) -> &'a [T] {
    if ptr.is_null() || len == 0 {
        &[]
    } else {
        std::slice::from_raw_parts(ptr, len)
    }
}

unsafe fn json_arg(ptr: *const c_char) -> Option<Value> {
    c_str(ptr).and_then(|text| serde_json::from_str(text).ok())
}

fn to_c_string(text: &str) -> Option<CString> {
    CString::new(text).ok()
}

fn into_raw_string(text: String) -> *mut c_char {
    match CString::new(text) {
        Ok(s) => s.into_raw(),
        Err(_) => ptr::null_mut(),
    }
}

#[cfg(test)]
mod tests;
