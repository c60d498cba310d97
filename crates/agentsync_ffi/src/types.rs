//! Type definitions for FFI.

use std::ffi::{c_char, c_int, c_short, c_void};

/// An opaque protocol handle.
///
/// Returned by `asp_create`; never dereference or modify directly.
#[repr(C)]
pub struct AspHandle {
    _private: [u8; 0],
}

/// Log level passed to the logger callback.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AspLogLevel {
    /// Diagnostic detail.
    Debug = 0,
    /// Normal operation.
    Info = 1,
    /// Recoverable problem.
    Warning = 2,
    /// Failed operation.
    Error = 3,
}

impl From<&tracing::Level> for AspLogLevel {
    fn from(level: &tracing::Level) -> Self {
        match *level {
            tracing::Level::ERROR => AspLogLevel::Error,
            tracing::Level::WARN => AspLogLevel::Warning,
            tracing::Level::INFO => AspLogLevel::Info,
            _ => AspLogLevel::Debug,
        }
    }
}

/// Logger callback: level and a null-terminated message.
///
/// The message pointer is only valid for the duration of the call.
pub type AspLogger = extern "C" fn(level: AspLogLevel, message: *const c_char);

/// Opens a message queue; returns the queue id or a negative value.
pub type MqStartFn =
    unsafe extern "C" fn(key: *const c_char, queue_type: c_short, attempts: c_short) -> c_int;

/// Sends a binary message; returns 0 on success.
pub type MqSendBinaryFn = unsafe extern "C" fn(
    queue: c_int,
    message: *const c_void,
    message_len: usize,
    locmsg: *const c_char,
    loc: c_char,
) -> c_int;

/// Message-queue primitives supplied by the host.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct AspMqFunctions {
    /// Opens the queue.
    pub start: Option<MqStartFn>,
    /// Sends one message.
    pub send_binary: Option<MqSendBinaryFn>,
}
