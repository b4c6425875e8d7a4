//! XPC transport to the broker's Mach service.
//!
//! libxpc ships in libSystem, so the handful of functions used here are
//! declared directly. Objects returned by `*_create` and
//! `send_message_with_reply_sync` are owned (+1) and released by
//! [`XpcObject`]'s `Drop`; values read out of a dictionary are borrowed and
//! retained before they escape.

use std::ffi::{c_char, c_void, CStr, CString};
use std::ptr::NonNull;
use std::sync::Mutex;

use block2::{DynBlock, RcBlock};
use tracing::debug;

use crate::client::Transport;
use crate::protocol::{
    BrokerRequest, Reply, ERROR_CODE, ERROR_MESSAGE, MACH_SERVICE_NAME, REPLY_ERROR,
    REPLY_NETWORK, REQUEST_COMMAND, REQUEST_NETWORK_NAME,
};

#[allow(non_camel_case_types)]
pub type xpc_object_t = *mut c_void;
#[allow(non_camel_case_types)]
type xpc_type_t = *const c_void;

#[allow(non_upper_case_globals)]
extern "C" {
    static _xpc_type_error: c_void;
    static _xpc_type_dictionary: c_void;
    static _xpc_type_int64: c_void;
    static _xpc_error_key_description: *const c_char;

    fn xpc_connection_create_mach_service(
        name: *const c_char,
        targetq: *mut c_void,
        flags: u64,
    ) -> xpc_object_t;
    fn xpc_connection_set_event_handler(
        connection: xpc_object_t,
        handler: &DynBlock<dyn Fn(xpc_object_t)>,
    );
    fn xpc_connection_resume(connection: xpc_object_t);
    fn xpc_connection_cancel(connection: xpc_object_t);
    fn xpc_connection_send_message_with_reply_sync(
        connection: xpc_object_t,
        message: xpc_object_t,
    ) -> xpc_object_t;

    fn xpc_dictionary_create_empty() -> xpc_object_t;
    fn xpc_dictionary_set_string(dict: xpc_object_t, key: *const c_char, value: *const c_char);
    fn xpc_dictionary_get_value(dict: xpc_object_t, key: *const c_char) -> xpc_object_t;
    fn xpc_dictionary_get_string(dict: xpc_object_t, key: *const c_char) -> *const c_char;
    fn xpc_dictionary_get_int64(dict: xpc_object_t, key: *const c_char) -> i64;
    fn xpc_int64_get_value(object: xpc_object_t) -> i64;

    fn xpc_get_type(object: xpc_object_t) -> xpc_type_t;
    fn xpc_type_get_name(kind: xpc_type_t) -> *const c_char;
    fn xpc_retain(object: xpc_object_t) -> xpc_object_t;
    fn xpc_release(object: xpc_object_t);
}

/// An owned reference to an XPC object.
pub struct XpcObject(NonNull<c_void>);

// XPC objects are reference counted with atomic operations and immutable
// once sent; the serialized network is only read after it is received.
unsafe impl Send for XpcObject {}
unsafe impl Sync for XpcObject {}

impl XpcObject {
    /// Take ownership of a +1 reference. Returns `None` for NULL.
    ///
    /// # Safety
    ///
    /// `raw` must be NULL or a valid XPC object the caller owns.
    pub unsafe fn from_owned(raw: xpc_object_t) -> Option<Self> {
        NonNull::new(raw).map(Self)
    }

    /// Retain a borrowed reference. Returns `None` for NULL.
    ///
    /// # Safety
    ///
    /// `raw` must be NULL or a valid XPC object.
    pub unsafe fn from_borrowed(raw: xpc_object_t) -> Option<Self> {
        NonNull::new(raw).map(|ptr| Self(NonNull::new_unchecked(xpc_retain(ptr.as_ptr()))))
    }

    /// The underlying `xpc_object_t`, valid while `self` is alive.
    pub fn as_raw(&self) -> xpc_object_t {
        self.0.as_ptr()
    }

    fn type_name(&self) -> String {
        unsafe { cstr_lossy(xpc_type_get_name(xpc_get_type(self.as_raw()))) }
            .unwrap_or_else(|| "(unknown)".to_string())
    }

    fn is_type(&self, kind: &c_void) -> bool {
        unsafe { xpc_get_type(self.as_raw()) == kind as *const c_void }
    }
}

impl Clone for XpcObject {
    fn clone(&self) -> Self {
        unsafe { xpc_retain(self.as_raw()) };
        Self(self.0)
    }
}

impl Drop for XpcObject {
    fn drop(&mut self) {
        unsafe { xpc_release(self.as_raw()) };
    }
}

impl std::fmt::Debug for XpcObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "XpcObject({}, {:p})", self.type_name(), self.0)
    }
}

unsafe fn cstr_lossy(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        None
    } else {
        Some(CStr::from_ptr(ptr).to_string_lossy().into_owned())
    }
}

fn key(s: &str) -> CString {
    // Protocol keys are static ASCII.
    CString::new(s).unwrap_or_default()
}

/// Transport over the broker's Mach service.
///
/// The connection is created on first use and kept open for the transport's
/// lifetime: the kernel invalidates the broker connection when this process
/// exits, which is how the broker notices our leases are gone.
pub struct XpcTransport {
    service: CString,
    connection: Mutex<Option<XpcObject>>,
}

impl Default for XpcTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl XpcTransport {
    pub fn new() -> Self {
        Self::with_service(MACH_SERVICE_NAME)
    }

    pub fn with_service(service: &str) -> Self {
        Self {
            service: CString::new(service).unwrap_or_else(|_| key(MACH_SERVICE_NAME)),
            connection: Mutex::new(None),
        }
    }

    fn connection(&self) -> Option<XpcObject> {
        let mut guard = self
            .connection
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if guard.is_none() {
            debug!(service = ?self.service, "connecting to broker");
            let raw = unsafe {
                xpc_connection_create_mach_service(self.service.as_ptr(), std::ptr::null_mut(), 0)
            };
            let connection = unsafe { XpcObject::from_owned(raw) }?;

            // A handler is mandatory before resume. Errors surface as the
            // reply of the synchronous send, so events are ignored here.
            let handler = RcBlock::new(|_event: xpc_object_t| {});
            unsafe {
                xpc_connection_set_event_handler(connection.as_raw(), &handler);
                xpc_connection_resume(connection.as_raw());
            }
            *guard = Some(connection);
        }
        guard.clone()
    }

    fn build_message(request: &BrokerRequest) -> Result<XpcObject, String> {
        let name = CString::new(request.network_name.as_str())
            .map_err(|_| "network name contains NUL".to_string())?;
        let command = key(request.command.as_str());

        let message = unsafe { XpcObject::from_owned(xpc_dictionary_create_empty()) }
            .ok_or_else(|| "failed to create xpc dictionary".to_string())?;
        unsafe {
            xpc_dictionary_set_string(
                message.as_raw(),
                key(REQUEST_COMMAND).as_ptr(),
                command.as_ptr(),
            );
            xpc_dictionary_set_string(
                message.as_raw(),
                key(REQUEST_NETWORK_NAME).as_ptr(),
                name.as_ptr(),
            );
        }
        Ok(message)
    }

    fn decode_reply(reply: XpcObject) -> Reply<XpcObject> {
        if reply.is_type(unsafe { &_xpc_type_error }) {
            let reason = unsafe {
                cstr_lossy(xpc_dictionary_get_string(
                    reply.as_raw(),
                    _xpc_error_key_description,
                ))
            };
            return Reply::Transport(reason.unwrap_or_else(|| "unknown xpc error".to_string()));
        }

        if !reply.is_type(unsafe { &_xpc_type_dictionary }) {
            return Reply::Malformed(format!("invalid reply type: {}", reply.type_name()));
        }

        let error = unsafe { XpcObject::from_borrowed(
            xpc_dictionary_get_value(reply.as_raw(), key(REPLY_ERROR).as_ptr()),
        ) };
        if let Some(error) = error {
            if error.is_type(unsafe { &_xpc_type_int64 }) {
                return Reply::Status(unsafe { xpc_int64_get_value(error.as_raw()) });
            }
            if error.is_type(unsafe { &_xpc_type_dictionary }) {
                let code =
                    unsafe { xpc_dictionary_get_int64(error.as_raw(), key(ERROR_CODE).as_ptr()) };
                let message = unsafe {
                    cstr_lossy(xpc_dictionary_get_string(
                        error.as_raw(),
                        key(ERROR_MESSAGE).as_ptr(),
                    ))
                };
                if let Some(message) = message {
                    debug!(code, "broker returned an error: {}", message);
                }
                return Reply::Status(code);
            }
            return Reply::Malformed(format!("invalid error type: {}", error.type_name()));
        }

        let network = unsafe {
            XpcObject::from_borrowed(xpc_dictionary_get_value(
                reply.as_raw(),
                key(REPLY_NETWORK).as_ptr(),
            ))
        };
        match network {
            Some(network) => Reply::Network(network),
            None => Reply::Malformed(format!("missing '{}' key", REPLY_NETWORK)),
        }
    }
}

impl Transport for XpcTransport {
    type Descriptor = XpcObject;

    fn round_trip(&self, request: &BrokerRequest) -> Reply<XpcObject> {
        let message = match Self::build_message(request) {
            Ok(message) => message,
            Err(reason) => return Reply::Transport(reason),
        };
        let Some(connection) = self.connection() else {
            return Reply::Transport(format!("failed to connect to {:?}", self.service));
        };

        let reply = unsafe {
            XpcObject::from_owned(xpc_connection_send_message_with_reply_sync(
                connection.as_raw(),
                message.as_raw(),
            ))
        };
        match reply {
            Some(reply) => Self::decode_reply(reply),
            None => Reply::Transport("no reply".to_string()),
        }
    }
}

impl Drop for XpcTransport {
    fn drop(&mut self) {
        let connection = self
            .connection
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(connection) = connection {
            unsafe { xpc_connection_cancel(connection.as_raw()) };
        }
    }
}
