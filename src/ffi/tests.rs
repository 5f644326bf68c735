use super::*;
use crate::testing::test_config;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::io::{Read, Write};
use std::net::TcpListener;
use std::time::{Duration, Instant};
use tempfile::TempDir;

// ============================================================================
// C-style host
// ============================================================================

#[derive(Default)]
struct TestHost {
    retains: AtomicUsize,
    releases: AtomicUsize,
    dispatched: Mutex<Vec<(String, Value)>>,
}

unsafe fn host<'a>(context: *mut c_void) -> &'a TestHost {
    &*(context as *const TestHost)
}

fn object(n: usize) -> *mut c_void {
    n as *mut c_void
}

unsafe extern "C" fn retain(context: *mut c_void, _object: *mut c_void) {
    host(context).retains.fetch_add(1, Ordering::SeqCst);
}

unsafe extern "C" fn release(context: *mut c_void, _object: *mut c_void) {
    host(context).releases.fetch_add(1, Ordering::SeqCst);
}

unsafe extern "C" fn is_equal(_context: *mut c_void, a: *mut c_void, b: *mut c_void) -> bool {
    a == b
}

unsafe extern "C" fn no_objects(_context: *mut c_void, done: *mut BridgeCompletion) {
    bridge_complete_objects(done, ptr::null(), 0);
}

unsafe extern "C" fn no_object(_context: *mut c_void, done: *mut BridgeCompletion) {
    bridge_complete_object(done, ptr::null_mut());
}

unsafe extern "C" fn no_objects_of(
    _context: *mut c_void,
    _parent: *mut c_void,
    done: *mut BridgeCompletion,
) {
    bridge_complete_objects(done, ptr::null(), 0);
}

unsafe extern "C" fn no_object_of(
    _context: *mut c_void,
    _parent: *mut c_void,
    done: *mut BridgeCompletion,
) {
    bridge_complete_object(done, ptr::null_mut());
}

unsafe extern "C" fn page_title(_context: *mut c_void, _page: *mut c_void, done: *mut BridgeCompletion) {
    let title = CString::new("Example Domain").unwrap();
    bridge_complete_string(done, title.as_ptr());
}

unsafe extern "C" fn dispatch(
    context: *mut c_void,
    _page: *mut c_void,
    name: *const c_char,
    user_info_json: *const c_char,
) {
    let name = CStr::from_ptr(name).to_str().unwrap().to_string();
    let user_info = serde_json::from_str(CStr::from_ptr(user_info_json).to_str().unwrap()).unwrap();
    host(context).dispatched.lock().push((name, user_info));
}

unsafe extern "C" fn open_window(_context: *mut c_void, _url: *const c_char, done: *mut BridgeCompletion) {
    bridge_complete_object(done, ptr::null_mut());
}

unsafe extern "C" fn open_tab(
    _context: *mut c_void,
    _window: *mut c_void,
    _url: *const c_char,
    done: *mut BridgeCompletion,
) {
    bridge_complete_object(done, ptr::null_mut());
}

unsafe extern "C" fn ignore_object(_context: *mut c_void, _object: *mut c_void) {}

unsafe extern "C" fn set_toolbar_item(
    _context: *mut c_void,
    _window: *mut c_void,
    _image_path: *const c_char,
    _label: *const c_char,
) {
}

unsafe extern "C" fn base_uri(_context: *mut c_void, done: *mut BridgeCompletion) {
    bridge_complete_string(done, ptr::null());
}

fn host_vtable(host: &TestHost) -> BridgeHostVTable {
    BridgeHostVTable {
        context: host as *const TestHost as *mut c_void,
        retain,
        release,
        is_equal,
        windows: no_objects,
        active_window: no_object,
        tabs: no_objects_of,
        active_tab: no_object_of,
        active_page: no_object_of,
        containing_tab: no_object_of,
        page_title,
        dispatch,
        open_window,
        open_tab,
        close_tab: ignore_object,
        activate_tab: ignore_object,
        set_toolbar_item,
        base_uri,
    }
}

// ============================================================================
// C-style engine
// ============================================================================

/// What the engine saw in one `complete_http` call.
struct HttpCompletion {
    request: u64,
    outcome: Value,
    body: *const u8,
    body_len: usize,
    /// Copied during the call
    body_copy: Vec<u8>,
    buffer_id: u64,
}

#[derive(Default)]
struct TestEngine {
    capabilities: AtomicUsize,
    evaluated: Mutex<Vec<String>>,
    received: Mutex<Vec<Value>>,
    http: Mutex<Vec<HttpCompletion>>,
    detached: AtomicBool,
    /// Returned from `evaluate` when set
    compile_error: Option<CString>,
}

impl TestEngine {
    fn capabilities(&self) -> *const BridgeCapabilities {
        self.capabilities.load(Ordering::SeqCst) as *const BridgeCapabilities
    }

    fn wait_for_messages(&self, count: usize) -> Vec<Value> {
        let deadline = Instant::now() + Duration::from_secs(10);
        while self.received.lock().len() < count && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        self.received.lock().clone()
    }

    fn wait_for_http(&self) -> bool {
        let deadline = Instant::now() + Duration::from_secs(10);
        while self.http.lock().is_empty() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        !self.http.lock().is_empty()
    }
}

unsafe fn engine<'a>(context: *mut c_void) -> &'a TestEngine {
    &*(context as *const TestEngine)
}

unsafe extern "C" fn attach(context: *mut c_void, capabilities: *const BridgeCapabilities) {
    engine(context)
        .capabilities
        .store(capabilities as usize, Ordering::SeqCst);
}

unsafe extern "C" fn evaluate(
    context: *mut c_void,
    source_name: *const c_char,
    _source: *const c_char,
) -> *const c_char {
    let engine = engine(context);
    if let Some(error) = &engine.compile_error {
        return error.as_ptr();
    }
    let name = CStr::from_ptr(source_name).to_str().unwrap().to_string();
    engine.evaluated.lock().push(name);
    ptr::null()
}

unsafe extern "C" fn receive(context: *mut c_void, envelope_json: *const c_char) -> *const c_char {
    let envelope = serde_json::from_str(CStr::from_ptr(envelope_json).to_str().unwrap()).unwrap();
    engine(context).received.lock().push(envelope);
    ptr::null()
}

unsafe extern "C" fn complete_http(
    context: *mut c_void,
    request: u64,
    outcome_json: *const c_char,
    body: *const u8,
    body_len: usize,
    buffer_id: u64,
) -> *const c_char {
    let outcome = serde_json::from_str(CStr::from_ptr(outcome_json).to_str().unwrap()).unwrap();
    engine(context).http.lock().push(HttpCompletion {
        request,
        outcome,
        body,
        body_len,
        body_copy: slice(body, body_len).to_vec(),
        buffer_id,
    });
    ptr::null()
}

unsafe extern "C" fn fire_timer(_context: *mut c_void, _tag: u64, _finished: bool) -> *const c_char {
    ptr::null()
}

unsafe extern "C" fn window_closed(_context: *mut c_void, _token_json: *const c_char) -> *const c_char {
    ptr::null()
}

unsafe extern "C" fn run_pending(_context: *mut c_void) -> *const c_char {
    ptr::null()
}

unsafe extern "C" fn detach(context: *mut c_void) {
    engine(context).detached.store(true, Ordering::SeqCst);
}

fn engine_vtable(engine: &TestEngine) -> BridgeEngineVTable {
    BridgeEngineVTable {
        context: engine as *const TestEngine as *mut c_void,
        attach,
        evaluate,
        receive,
        complete_http,
        fire_timer,
        window_closed,
        run_pending,
        detach,
    }
}

fn options(dir: &TempDir) -> CString {
    let path = dir.path().join("config.toml");
    test_config(dir.path()).save_to(&path).unwrap();
    let options = json!({
        "configPath": path,
        "version": "7.0.1",
        "preferredLanguages": ["de-AT"],
    });
    CString::new(options.to_string()).unwrap()
}

/// Copy lent bytes and hand them back.
unsafe fn take_bytes(caps: *const BridgeCapabilities, bytes: BridgeBytes) -> Vec<u8> {
    assert_ne!(bytes.id, 0);
    let copy = slice(bytes.ptr, bytes.len).to_vec();
    assert!(bridge_buffer_release(caps, bytes.id));
    copy
}

fn utf16(text: &str) -> Vec<u16> {
    text.encode_utf16().collect()
}

/// Serve one canned HTTP response on loopback.
fn serve_once(body: &'static [u8]) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    std::thread::spawn(move || {
        let (mut socket, _) = listener.accept().unwrap();
        let mut request = Vec::new();
        let mut chunk = [0u8; 1024];
        while !request.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = socket.read(&mut chunk).unwrap();
            if n == 0 {
                break;
            }
            request.extend_from_slice(&chunk[..n]);
        }
        let head = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/pdf\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        );
        socket.write_all(head.as_bytes()).unwrap();
        socket.write_all(body).unwrap();
    });
    format!("http://{}/paper.pdf", addr)
}

unsafe fn take_string(ptr: *mut c_char) -> String {
    assert!(!ptr.is_null());
    let text = CStr::from_ptr(ptr).to_str().unwrap().to_string();
    bridge_string_free(ptr);
    text
}

// ============================================================================
// Tests
// ============================================================================

#[test]
fn test_bridge_lifecycle() {
    let dir = TempDir::new().unwrap();
    let host = TestHost::default();
    let engine = TestEngine::default();
    let options = options(&dir);

    unsafe {
        let handle = bridge_new(&host_vtable(&host), &engine_vtable(&engine), options.as_ptr());
        assert!(!handle.is_null());
        assert_eq!(bridge_runtime_state(handle), RuntimeState::Ready as u8);
        assert_eq!(*engine.evaluated.lock(), vec!["zotero.js", "global.js"]);
        assert!(!engine.capabilities().is_null());

        let menu = CString::new("menu0").unwrap();
        let slot = take_string(bridge_validate_menu_item(handle, menu.as_ptr()));
        assert_eq!(
            serde_json::from_str::<Value>(&slot).unwrap(),
            json!({ "kind": "preferences", "label": "Zotero Preferences" })
        );

        bridge_free(handle);
    }

    assert!(engine.detached.load(Ordering::SeqCst));
}

#[test]
fn test_native_request_round_trip() {
    let dir = TempDir::new().unwrap();
    let host = TestHost::default();
    let engine = TestEngine::default();
    let options = options(&dir);

    unsafe {
        let handle = bridge_new(&host_vtable(&host), &engine_vtable(&engine), options.as_ptr());
        let name = CString::new("Swift.getVersion").unwrap();
        let id = CString::new("\"v1\"").unwrap();
        assert!(bridge_send_message(
            engine.capabilities(),
            name.as_ptr(),
            id.as_ptr(),
            ptr::null(),
            0,
            false
        ));

        let received = engine.wait_for_messages(1);
        assert_eq!(
            received,
            vec![json!({ "name": "response", "correlationId": "v1", "args": "7.0.1", "tabId": -1 })]
        );

        bridge_free(handle);
    }
}

#[test]
fn test_page_load_from_host() {
    let dir = TempDir::new().unwrap();
    let host = TestHost::default();
    let engine = TestEngine::default();
    let options = options(&dir);

    unsafe {
        let handle = bridge_new(&host_vtable(&host), &engine_vtable(&engine), options.as_ptr());
        let name = CString::new("message").unwrap();
        let user_info = CString::new(
            json!({ "message": "Connector_Browser.onPageLoad", "messageId": 3, "args": [] })
                .to_string(),
        )
        .unwrap();
        bridge_message_received(handle, object(0x10), name.as_ptr(), user_info.as_ptr());

        let received = engine.wait_for_messages(1);
        assert_eq!(
            received,
            vec![json!({
                "name": "Connector_Browser.onPageLoad",
                "correlationId": 3,
                "args": ["Example Domain"],
                "tabId": -1
            })]
        );

        bridge_free(handle);
    }
}

#[test]
fn test_malformed_user_info_is_dropped() {
    let dir = TempDir::new().unwrap();
    let host = TestHost::default();
    let engine = TestEngine::default();
    let options = options(&dir);

    unsafe {
        let handle = bridge_new(&host_vtable(&host), &engine_vtable(&engine), options.as_ptr());
        let garbage = CString::new("{not json").unwrap();
        bridge_message_received(handle, object(0x10), ptr::null(), garbage.as_ptr());
        std::thread::sleep(Duration::from_millis(50));
        bridge_free(handle);
    }

    assert!(engine.received.lock().is_empty());
}

#[test]
fn test_global_available_without_tabs() {
    let dir = TempDir::new().unwrap();
    let host = TestHost::default();
    let engine = TestEngine::default();
    let options = options(&dir);

    unsafe {
        let handle = bridge_new(&host_vtable(&host), &engine_vtable(&engine), options.as_ptr());
        assert!(bridge_announce_global_available(handle));
        std::thread::sleep(Duration::from_millis(50));
        bridge_free(handle);
    }

    assert!(host.dispatched.lock().is_empty());
}

#[test]
fn test_compile_error_leaves_bridge_inert() {
    let dir = TempDir::new().unwrap();
    let host = TestHost::default();
    let engine = TestEngine {
        compile_error: Some(CString::new("SyntaxError: unexpected token").unwrap()),
        ..TestEngine::default()
    };
    let options = options(&dir);

    unsafe {
        let handle = bridge_new(&host_vtable(&host), &engine_vtable(&engine), options.as_ptr());
        assert!(!handle.is_null());
        assert_eq!(bridge_runtime_state(handle), RuntimeState::Inert as u8);
        bridge_free(handle);
    }
}

#[test]
fn test_bad_arguments_to_new() {
    let host = TestHost::default();
    let engine = TestEngine::default();
    let bad_options = CString::new("[1, 2").unwrap();

    unsafe {
        assert!(bridge_new(ptr::null(), &engine_vtable(&engine), ptr::null()).is_null());
        assert!(bridge_new(&host_vtable(&host), ptr::null(), ptr::null()).is_null());
        assert!(bridge_new(
            &host_vtable(&host),
            &engine_vtable(&engine),
            bad_options.as_ptr()
        )
        .is_null());
    }
}

#[test]
fn test_encoding_calls() {
    let dir = TempDir::new().unwrap();
    let host = TestHost::default();
    let engine = TestEngine::default();
    let options = options(&dir);

    unsafe {
        let handle = bridge_new(&host_vtable(&host), &engine_vtable(&engine), options.as_ptr());
        let caps = engine.capabilities();

        let plain = utf16("hello");
        let encoded = take_string(bridge_btoa(caps, plain.as_ptr(), plain.len()));
        assert_eq!(encoded, "aGVsbG8=");
        assert_eq!(
            take_bytes(caps, bridge_atob(caps, encoded.as_ptr(), encoded.len())),
            b"hello"
        );

        let wide = utf16("日本");
        assert!(bridge_btoa(caps, wide.as_ptr(), wide.len()).is_null());

        let text = utf16("Zürich");
        assert_eq!(
            take_bytes(caps, bridge_encode_utf8(caps, text.as_ptr(), text.len())),
            "Zürich".as_bytes()
        );

        let bytes = [0x25u8, 0x50, 0x44, 0x46];
        let encoded = take_string(bridge_base64_encode(caps, bytes.as_ptr(), bytes.len()));
        assert_eq!(encoded, "JVBERg==");
        assert_eq!(
            take_bytes(caps, bridge_base64_decode(caps, encoded.as_ptr(), encoded.len())),
            bytes
        );

        let garbage = b"%%%";
        let decoded = bridge_base64_decode(caps, garbage.as_ptr(), garbage.len());
        assert_eq!(decoded.id, 0);
        assert!(decoded.ptr.is_null());

        assert!(!bridge_buffer_release(caps, 42));
        bridge_free(handle);
    }
}

#[test]
fn test_binary_strings_keep_nul_bytes() {
    let dir = TempDir::new().unwrap();
    let host = TestHost::default();
    let engine = TestEngine::default();
    let options = options(&dir);

    unsafe {
        let handle = bridge_new(&host_vtable(&host), &engine_vtable(&engine), options.as_ptr());
        let caps = engine.capabilities();

        let encoded = b"AEE=";
        assert_eq!(
            take_bytes(caps, bridge_atob(caps, encoded.as_ptr(), encoded.len())),
            vec![0x00, 0x41]
        );

        let binary: Vec<u16> = vec![0x00, 0x41, 0x00];
        assert_eq!(
            take_string(bridge_btoa(caps, binary.as_ptr(), binary.len())),
            "AEEA"
        );

        let empty = bridge_btoa(caps, ptr::null(), 0);
        assert_eq!(take_string(empty), "");

        bridge_free(handle);
    }
}

#[test]
fn test_binary_response_is_lent_once() {
    const PDF: &[u8] = b"%PDF-1.4\x00\x01\xff";

    let dir = TempDir::new().unwrap();
    let host = TestHost::default();
    let engine = TestEngine::default();
    let options = options(&dir);
    let url = CString::new(serve_once(PDF)).unwrap();
    let method = CString::new("GET").unwrap();
    let request_options = CString::new(r#"{"responseType":"arraybuffer"}"#).unwrap();

    unsafe {
        let handle = bridge_new(&host_vtable(&host), &engine_vtable(&engine), options.as_ptr());
        let caps = engine.capabilities();

        let request = bridge_http_request(caps, method.as_ptr(), url.as_ptr(), request_options.as_ptr());
        assert_ne!(request, 0);
        assert!(engine.wait_for_http());

        let (body, body_len, buffer_id) = {
            let http = engine.http.lock();
            let done = &http[0];
            assert_eq!(done.request, request);
            assert_eq!(done.outcome[0], json!(200));
            // The body travels out of band
            assert_eq!(done.outcome[1], Value::Null);
            assert_eq!(done.body_copy, PDF);
            assert_ne!(done.buffer_id, 0);
            (done.body, done.body_len, done.buffer_id)
        };

        // Still readable after the call returned, until released
        assert_eq!(slice(body, body_len), PDF);
        assert!(bridge_buffer_release(caps, buffer_id));
        assert!(!bridge_buffer_release(caps, buffer_id));

        bridge_free(handle);
    }
}

#[test]
fn test_null_capabilities_are_refused() {
    let name = CString::new("ping").unwrap();
    let id = CString::new("1").unwrap();

    unsafe {
        assert!(!bridge_send_message(ptr::null(), name.as_ptr(), id.as_ptr(), ptr::null(), 0, false));
        assert_eq!(bridge_http_request(ptr::null(), ptr::null(), name.as_ptr(), ptr::null()), 0);
        assert_eq!(bridge_set_timer(ptr::null(), 10.0, false), 0);
        assert!(!bridge_clear_timer(ptr::null(), 1));
        assert_eq!(bridge_atob(ptr::null(), ptr::null(), 0).id, 0);
        assert_eq!(bridge_encode_utf8(ptr::null(), ptr::null(), 0).id, 0);
        assert!(bridge_base64_encode(ptr::null(), ptr::null(), 0).is_null());
        assert_eq!(bridge_runtime_state(ptr::null()), RuntimeState::Stopped as u8);
        bridge_string_free(ptr::null_mut());
        bridge_free(ptr::null_mut());
    }
}

#[test]
fn test_objects_are_retained_and_released() {
    let host = TestHost::default();
    let table = Arc::new(HostTable(host_vtable(&host)));

    let first = ForeignObject::retained(object(1), &table);
    let copy = first.clone();
    let other = ForeignObject::retained(object(2), &table);

    assert!(first.same_object(&copy));
    assert!(!first.same_object(&other));
    assert_eq!(host.retains.load(Ordering::SeqCst), 3);

    drop((first, copy, other));
    assert_eq!(host.releases.load(Ordering::SeqCst), 3);
}

fn token(done: *mut BridgeCompletion) -> u64 {
    done as usize as u64
}

fn is_pending(done: *mut BridgeCompletion) -> bool {
    COMPLETIONS.lock().pending.contains_key(&token(done))
}

#[test]
fn test_completions() {
    let host = TestHost::default();
    let table = Arc::new(HostTable(host_vtable(&host)));
    let got = Arc::new(Mutex::new(None));

    let sink = Arc::clone(&got);
    let done = register_completion(
        &table,
        CompletionKind::Objects(Box::new(move |objects: Vec<ForeignObject>| {
            *sink.lock() = Some(objects.len());
        })),
        Duration::from_secs(30),
    );
    assert!(!done.is_null());
    let raw = [object(1), ptr::null_mut(), object(2)];
    unsafe { bridge_complete_objects(done, raw.as_ptr(), raw.len()) };
    assert_eq!(*got.lock(), Some(2));
    assert!(!is_pending(done));
    assert_eq!(
        host.retains.load(Ordering::SeqCst),
        host.releases.load(Ordering::SeqCst)
    );

    // A second answer to the same completion is ignored
    *got.lock() = None;
    unsafe { bridge_complete_objects(done, raw.as_ptr(), raw.len()) };
    assert_eq!(*got.lock(), None);

    // Finishing with the wrong kind drops the completion unanswered
    let called = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&called);
    let done = register_completion(
        &table,
        CompletionKind::Text(Box::new(move |_: Option<String>| {
            flag.store(true, Ordering::SeqCst)
        })),
        Duration::from_secs(30),
    );
    unsafe { bridge_complete_object(done, object(3)) };
    assert!(!called.load(Ordering::SeqCst));
    assert!(!is_pending(done));
}

#[test]
fn test_unanswered_completions_expire() {
    let host = TestHost::default();
    let table = Arc::new(HostTable(host_vtable(&host)));

    let alive = Arc::new(());
    let held = Arc::clone(&alive);
    let called = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&called);
    let silent = register_completion(
        &table,
        CompletionKind::Object(Box::new(move |_: Option<ForeignObject>| {
            let _held = &held;
            flag.store(true, Ordering::SeqCst);
        })),
        Duration::from_millis(10),
    );
    assert!(is_pending(silent));
    assert_eq!(Arc::strong_count(&alive), 2);

    std::thread::sleep(Duration::from_millis(30));
    let next = register_completion(
        &table,
        CompletionKind::Text(Box::new(|_: Option<String>| {})),
        Duration::from_secs(30),
    );

    // The expired entry and everything it captured are gone
    assert!(!is_pending(silent));
    assert_eq!(Arc::strong_count(&alive), 1);

    // A late answer is ignored without touching the object
    unsafe { bridge_complete_object(silent, object(4)) };
    assert!(!called.load(Ordering::SeqCst));
    assert_eq!(host.retains.load(Ordering::SeqCst), 0);

    unsafe { bridge_complete_string(next, ptr::null()) };
    assert!(!is_pending(next));
}

#[test]
fn test_free_forgets_owed_completions() {
    let dir = TempDir::new().unwrap();
    let host = TestHost::default();
    let engine = TestEngine::default();
    let options = options(&dir);

    unsafe {
        let handle = bridge_new(&host_vtable(&host), &engine_vtable(&engine), options.as_ptr());
        let table = Arc::clone(&(*handle).host);
        let owed = register_completion(
            &table,
            CompletionKind::Text(Box::new(|_: Option<String>| {})),
            Duration::from_secs(30),
        );
        assert!(is_pending(owed));

        bridge_free(handle);
        assert!(!is_pending(owed));
    }
}
