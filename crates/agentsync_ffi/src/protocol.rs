//! Protocol FFI functions.

use crate::logging::dispatch_for;
use crate::queues::shared_queue;
use crate::types::{AspHandle, AspLogger, AspMqFunctions, MqSendBinaryFn, MqStartFn};
use agentsync_engine::{AgentSyncProtocol, MessageQueue, MqTransport, ProtocolEngine, SyncConfig};
use agentsync_protocol::{Mode, Operation};
use std::ffi::{c_char, c_int, c_uint, CStr, CString};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, Dispatch};

/// What an [`AspHandle`] points to.
struct Instance {
    protocol: AgentSyncProtocol,
    dispatch: Dispatch,
}

impl Instance {
    fn run<R>(&self, f: impl FnOnce(&AgentSyncProtocol) -> R) -> R {
        tracing::dispatcher::with_default(&self.dispatch, || f(&self.protocol))
    }
}

/// [`MessageQueue`] over the host's function pointers.
struct HostQueue {
    start: MqStartFn,
    send_binary: MqSendBinaryFn,
}

impl MessageQueue for HostQueue {
    fn start(&self, key: &str, queue_type: i16, attempts: i16) -> i32 {
        let Ok(key) = CString::new(key) else {
            return -1;
        };
        unsafe { (self.start)(key.as_ptr(), queue_type, attempts) }
    }

    fn send_binary(&self, queue: i32, payload: &[u8], location: &str, location_char: u8) -> i32 {
        let Ok(location) = CString::new(location) else {
            return -1;
        };
        unsafe {
            (self.send_binary)(
                queue,
                payload.as_ptr().cast(),
                payload.len(),
                location.as_ptr(),
                location_char as c_char,
            )
        }
    }
}

unsafe fn str_arg<'a>(ptr: *const c_char, name: &str) -> Option<&'a str> {
    if ptr.is_null() {
        error!(argument = name, "null pointer argument");
        return None;
    }
    match CStr::from_ptr(ptr).to_str() {
        Ok(s) => Some(s),
        Err(_) => {
            error!(argument = name, "invalid UTF-8 in argument");
            None
        }
    }
}

unsafe fn instance<'a>(handle: *mut AspHandle) -> Option<&'a Instance> {
    (handle as *const Instance).as_ref()
}

/// Creates a protocol handle for one module.
///
/// Handles opened on the same `db_path` share one queue. `":memory:"`
/// selects an in-memory store. `logger` may be null, in which case
/// nothing is logged.
///
/// # Returns
///
/// The handle, or null if an argument is invalid or the store cannot be
/// opened.
///
/// # Safety
///
/// - `module` and `db_path` must be valid null-terminated strings
/// - `mq_funcs` must point to a valid [`AspMqFunctions`]; its functions are
///   called from whichever thread runs a synchronization
#[no_mangle]
pub unsafe extern "C" fn asp_create(
    module: *const c_char,
    db_path: *const c_char,
    mq_funcs: *const AspMqFunctions,
    logger: Option<AspLogger>,
) -> *mut AspHandle {
    let dispatch = dispatch_for(logger);

    tracing::dispatcher::with_default(&dispatch, || {
        let (Some(module), Some(db_path)) = (str_arg(module, "module"), str_arg(db_path, "db_path"))
        else {
            return std::ptr::null_mut();
        };
        if module.is_empty() {
            error!("module name must not be empty");
            return std::ptr::null_mut();
        }

        let Some(AspMqFunctions {
            start: Some(start),
            send_binary: Some(send_binary),
        }) = mq_funcs.as_ref().copied()
        else {
            error!(module, "message queue functions missing");
            return std::ptr::null_mut();
        };

        let queue = match shared_queue(db_path) {
            Ok(queue) => queue,
            Err(e) => {
                error!(module, db_path, error = %e, "cannot open queue");
                return std::ptr::null_mut();
            }
        };

        let config = SyncConfig::default();
        let transport = MqTransport::new(HostQueue { start, send_binary }, config.binding.clone());
        let engine = Arc::new(ProtocolEngine::new(queue, transport, config));
        debug!(module, db_path, "protocol handle created");

        let instance = Box::new(Instance {
            protocol: engine.module(module),
            dispatch: dispatch.clone(),
        });
        Box::into_raw(instance).cast::<AspHandle>()
    })
}

/// Destroys a protocol handle. Null is ignored.
///
/// # Safety
///
/// `handle` must come from [`asp_create`] and must not be used afterwards.
#[no_mangle]
pub unsafe extern "C" fn asp_destroy(handle: *mut AspHandle) {
    if handle.is_null() {
        return;
    }
    let instance = Box::from_raw(handle.cast::<Instance>());
    instance.run(|protocol| debug!(module = protocol.module(), "protocol handle destroyed"));
}

/// Records a change for the next synchronization.
///
/// `operation` is 0 for upsert and 1 for delete. Failures are logged.
///
/// # Safety
///
/// `handle` must be live; string arguments must be valid null-terminated
/// strings.
#[no_mangle]
pub unsafe extern "C" fn asp_persist_diff(
    handle: *mut AspHandle,
    id: *const c_char,
    operation: c_int,
    index: *const c_char,
    data: *const c_char,
) {
    let Some(instance) = instance(handle) else {
        return;
    };
    instance.run(|protocol| {
        let (Some(id), Some(index), Some(data)) = (
            str_arg(id, "id"),
            str_arg(index, "index"),
            str_arg(data, "data"),
        ) else {
            return;
        };
        let operation = match u8::try_from(operation).ok().map(Operation::try_from) {
            Some(Ok(operation)) => operation,
            _ => {
                error!(module = protocol.module(), operation, "unknown operation");
                return;
            }
        };
        protocol.persist_difference(id, operation, index, data);
    });
}

/// Runs one synchronization round for the handle's module.
///
/// `mode` is 0 for full and 1 for delta. `sync_timeout` is in seconds per
/// attempt; `max_eps` of 0 disables throttling.
///
/// # Returns
///
/// `true` if the manager acknowledged the round.
///
/// # Safety
///
/// `handle` must be live.
#[no_mangle]
pub unsafe extern "C" fn asp_sync_module(
    handle: *mut AspHandle,
    mode: c_int,
    sync_timeout: c_uint,
    sync_retries: c_uint,
    max_eps: usize,
) -> bool {
    let Some(instance) = instance(handle) else {
        return false;
    };
    instance.run(|protocol| {
        let Some(Ok(mode)) = u8::try_from(mode).ok().map(Mode::try_from) else {
            error!(module = protocol.module(), mode, "unknown mode");
            return false;
        };
        protocol.synchronize_module(
            mode,
            Duration::from_secs(u64::from(sync_timeout)),
            sync_retries,
            max_eps,
        )
    })
}

/// Hands a manager response to the handle's engine.
///
/// # Returns
///
/// `0` if the buffer was accepted, `-1` if it was malformed or does not
/// belong to the round in flight.
///
/// # Safety
///
/// `handle` must be live; `data` must point to `len` readable bytes.
#[no_mangle]
pub unsafe extern "C" fn asp_parse_response_buffer(
    handle: *mut AspHandle,
    data: *const u8,
    len: usize,
) -> c_int {
    let Some(instance) = instance(handle) else {
        return -1;
    };
    if data.is_null() {
        return -1;
    }
    let buffer = std::slice::from_raw_parts(data, len);
    if instance.run(|protocol| protocol.parse_response_buffer(buffer)) {
        0
    } else {
        -1
    }
}

/// Drops every pending diff of the handle's module.
///
/// # Safety
///
/// `handle` must be live.
#[no_mangle]
pub unsafe extern "C" fn asp_reset_module(handle: *mut AspHandle) -> bool {
    match instance(handle) {
        Some(instance) => instance.run(AgentSyncProtocol::reset),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentsync_protocol::{Message, MessageType};
    use parking_lot::Mutex;
    use std::ffi::c_void;
    use tempfile::tempdir;

    static SENT: Mutex<Vec<(i32, Vec<u8>, String, u8)>> = Mutex::new(Vec::new());

    unsafe extern "C" fn start_ok(_key: *const c_char, _ty: i16, _attempts: i16) -> c_int {
        7
    }

    unsafe extern "C" fn start_fail(_key: *const c_char, _ty: i16, _attempts: i16) -> c_int {
        -1
    }

    unsafe extern "C" fn record_send(
        queue: c_int,
        message: *const c_void,
        len: usize,
        locmsg: *const c_char,
        loc: c_char,
    ) -> c_int {
        let payload = std::slice::from_raw_parts(message.cast::<u8>(), len).to_vec();
        let location = CStr::from_ptr(locmsg).to_string_lossy().into_owned();
        SENT.lock().push((queue, payload, location, loc as u8));
        0
    }

    fn cstr(s: &str) -> CString {
        CString::new(s).unwrap()
    }

    fn create(module: &str, path: &str, funcs: &AspMqFunctions) -> *mut AspHandle {
        let module = cstr(module);
        let path = cstr(path);
        unsafe { asp_create(module.as_ptr(), path.as_ptr(), funcs, None) }
    }

    fn sent_for(module: &str) -> Vec<Message> {
        SENT.lock()
            .iter()
            .filter(|(_, _, location, _)| location == module)
            .filter_map(|(_, payload, _, _)| Message::decode(payload).ok())
            .collect()
    }

    #[test]
    fn create_rejects_bad_arguments() {
        let funcs = AspMqFunctions {
            start: Some(start_ok),
            send_binary: Some(record_send),
        };
        let path = cstr(":memory:");
        unsafe {
            assert!(asp_create(std::ptr::null(), path.as_ptr(), &funcs, None).is_null());
            assert!(create("", ":memory:", &funcs).is_null());
            assert!(asp_create(cstr("m").as_ptr(), path.as_ptr(), std::ptr::null(), None).is_null());
        }
        let partial = AspMqFunctions {
            start: Some(start_ok),
            send_binary: None,
        };
        assert!(create("m", ":memory:", &partial).is_null());
    }

    #[test]
    fn persist_and_reset_through_handle() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.db");
        let funcs = AspMqFunctions {
            start: Some(start_ok),
            send_binary: Some(record_send),
        };
        let handle = create("ffi-persist", path.to_str().unwrap(), &funcs);
        assert!(!handle.is_null());

        let queue = shared_queue(path.to_str().unwrap()).unwrap();
        unsafe {
            asp_persist_diff(handle, cstr("a").as_ptr(), 0, cstr("idx").as_ptr(), cstr("{}").as_ptr());
            asp_persist_diff(handle, cstr("b").as_ptr(), 1, cstr("idx").as_ptr(), cstr("").as_ptr());
            // unknown operation and null data are ignored
            asp_persist_diff(handle, cstr("c").as_ptr(), 7, cstr("idx").as_ptr(), cstr("{}").as_ptr());
            asp_persist_diff(handle, cstr("d").as_ptr(), 0, cstr("idx").as_ptr(), std::ptr::null());
        }

        let rows = queue.fetch_all("ffi-persist").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].operation, Operation::Delete);

        unsafe {
            assert!(asp_reset_module(handle));
            asp_destroy(handle);
        }
        assert_eq!(queue.pending_count("ffi-persist").unwrap(), 0);
    }

    #[test]
    fn sync_sends_through_host_queue() {
        let funcs = AspMqFunctions {
            start: Some(start_ok),
            send_binary: Some(record_send),
        };
        let handle = create("ffi-sync", ":memory:", &funcs);
        unsafe {
            asp_persist_diff(handle, cstr("a").as_ptr(), 0, cstr("idx").as_ptr(), cstr("{}").as_ptr());
            // nobody answers: the round times out after one-second waits
            assert!(!asp_sync_module(handle, 1, 1, 1, 0));
            assert!(!asp_sync_module(handle, 9, 1, 1, 0));
            asp_destroy(handle);
        }

        let types: Vec<MessageType> = sent_for("ffi-sync").iter().map(Message::message_type).collect();
        assert_eq!(&types[..3], &[MessageType::Start, MessageType::Data, MessageType::End]);
        let (queue, _, _, loc) = SENT
            .lock()
            .iter()
            .find(|(_, _, location, _)| location == "ffi-sync")
            .cloned()
            .unwrap();
        assert_eq!((queue, loc), (7, b's'));
    }

    #[test]
    fn unopenable_queue_fails_the_round() {
        let funcs = AspMqFunctions {
            start: Some(start_fail),
            send_binary: Some(record_send),
        };
        let handle = create("ffi-noqueue", ":memory:", &funcs);
        unsafe {
            assert!(!asp_sync_module(handle, 0, 1, 2, 0));
            asp_destroy(handle);
        }
        assert!(sent_for("ffi-noqueue").is_empty());
    }

    #[test]
    fn null_handles_are_harmless() {
        unsafe {
            asp_destroy(std::ptr::null_mut());
            asp_persist_diff(
                std::ptr::null_mut(),
                cstr("a").as_ptr(),
                0,
                cstr("i").as_ptr(),
                cstr("{}").as_ptr(),
            );
            assert!(!asp_sync_module(std::ptr::null_mut(), 0, 1, 1, 0));
            assert!(!asp_reset_module(std::ptr::null_mut()));
            assert_eq!(asp_parse_response_buffer(std::ptr::null_mut(), [1u8].as_ptr(), 1), -1);
        }
    }

    #[test]
    fn garbage_response_is_refused() {
        let funcs = AspMqFunctions {
            start: Some(start_ok),
            send_binary: Some(record_send),
        };
        let handle = create("ffi-garbage", ":memory:", &funcs);
        let junk = [0x41u8, 0x53, 0x09, 0x01];
        unsafe {
            assert_eq!(asp_parse_response_buffer(handle, junk.as_ptr(), junk.len()), -1);
            assert_eq!(asp_parse_response_buffer(handle, std::ptr::null(), 0), -1);
            asp_destroy(handle);
        }
    }
}
