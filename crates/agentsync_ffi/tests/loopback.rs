//! A full round through the C ABI against the loopback manager.

use agentsync_engine::{LoopbackOptions, LoopbackServer, Transport};
use agentsync_ffi::{
    asp_create, asp_destroy, asp_parse_response_buffer, asp_persist_diff, asp_sync_module,
    AspHandle, AspLogLevel, AspMqFunctions,
};
use agentsync_queue::PersistentQueue;
use parking_lot::Mutex;
use std::ffi::{c_char, c_int, c_void, CStr, CString};
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::OnceLock;
use tempfile::tempdir;

static MANAGER: OnceLock<LoopbackServer> = OnceLock::new();
static HANDLE: AtomicPtr<AspHandle> = AtomicPtr::new(std::ptr::null_mut());
static IN_FLIGHT: AtomicUsize = AtomicUsize::new(0);
static LOG: Mutex<Vec<(AspLogLevel, String)>> = Mutex::new(Vec::new());

fn manager() -> &'static LoopbackServer {
    MANAGER.get_or_init(|| {
        let server = LoopbackServer::with_options(LoopbackOptions::new().with_dropped([2]));
        server.set_responder(|buffer| {
            IN_FLIGHT.fetch_add(1, Ordering::SeqCst);
            let handle = HANDLE.load(Ordering::SeqCst);
            if !handle.is_null() {
                unsafe { asp_parse_response_buffer(handle, buffer.as_ptr(), buffer.len()) };
            }
            IN_FLIGHT.fetch_sub(1, Ordering::SeqCst);
        });
        server
    })
}

unsafe extern "C" fn mq_start(_key: *const c_char, _ty: i16, _attempts: i16) -> c_int {
    1
}

unsafe extern "C" fn mq_send(
    _queue: c_int,
    message: *const c_void,
    len: usize,
    locmsg: *const c_char,
    _loc: c_char,
) -> c_int {
    let payload = std::slice::from_raw_parts(message.cast::<u8>(), len);
    let location = CStr::from_ptr(locmsg).to_string_lossy();
    match manager().send_binary(&location, payload) {
        Ok(()) => 0,
        Err(_) => -1,
    }
}

extern "C" fn logger(level: AspLogLevel, message: *const c_char) {
    let text = unsafe { CStr::from_ptr(message) }.to_string_lossy().into_owned();
    LOG.lock().push((level, text));
}

fn cstr(s: &str) -> CString {
    CString::new(s).unwrap()
}

#[test]
fn loopback_round_through_the_c_abi() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("agent_modules_state.db");
    let path = path.to_str().unwrap().to_string();
    manager();

    let funcs = AspMqFunctions {
        start: Some(mq_start),
        send_binary: Some(mq_send),
    };
    let handle = unsafe { asp_create(cstr("FIM").as_ptr(), cstr(&path).as_ptr(), &funcs, Some(logger)) };
    assert!(!handle.is_null());
    HANDLE.store(handle, Ordering::SeqCst);

    for id in ["a", "b", "c"] {
        unsafe {
            asp_persist_diff(
                handle,
                cstr(id).as_ptr(),
                0,
                cstr("fim_file").as_ptr(),
                cstr(r#"{"v":1}"#).as_ptr(),
            );
        }
    }

    assert!(unsafe { asp_sync_module(handle, 1, 5, 2, 0) });

    HANDLE.store(std::ptr::null_mut(), Ordering::SeqCst);
    while IN_FLIGHT.load(Ordering::SeqCst) > 0 {
        std::thread::yield_now();
    }
    unsafe { asp_destroy(handle) };

    // start, three data, end, the lost seq again, end again
    assert_eq!(manager().frames_received(), 7);

    let queue = PersistentQueue::open(&path).unwrap();
    assert_eq!(queue.pending_count("FIM").unwrap(), 0);

    let log = LOG.lock();
    assert!(log
        .iter()
        .any(|(level, text)| *level == AspLogLevel::Info && text.starts_with("round completed")));
}
