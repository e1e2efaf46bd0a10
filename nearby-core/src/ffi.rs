//! C ABI for linking nearby-core as a static library from Android (NDK) or other C/C++ hosts.
//!
//! Events go in as encoded `HostMessage` frames. Actions come out as encoded
//! `CoreMessage::Action` frames queued on the handle; every entry point
//! returns the number of queued bytes and `nearby_core_drain` copies them out.

use std::ffi::c_void;
use std::os::raw::c_int;
use std::slice;
use std::time::Instant;

use tracing::warn;
use uuid::Uuid;

use crate::config::DiscoveryConfig;
use crate::protocol::{version_compatible, CoreMessage, HostMessage, PROTOCOL_VERSION};
use crate::wire::{decode_frame, encode_frame, frame_len};
use crate::{Action, DiscoveryCore};

struct Handle {
    core: DiscoveryCore,
    pending: Vec<u8>,
}

impl Handle {
    fn queue(&mut self, actions: Vec<Action>) -> c_int {
        for action in actions {
            match encode_frame(&CoreMessage::Action(action)) {
                Ok(frame) => self.pending.extend_from_slice(&frame),
                Err(e) => warn!(%e, "dropping unencodable action"),
            }
        }
        c_int::try_from(self.pending.len()).unwrap_or(c_int::MAX)
    }
}

fn handle<'a>(h: *mut c_void) -> Option<&'a mut Handle> {
    if h.is_null() {
        None
    } else {
        Some(unsafe { &mut *(h as *mut Handle) })
    }
}

/// Returns the current protocol version.
#[no_mangle]
pub extern "C" fn nearby_core_version() -> u8 {
    PROTOCOL_VERSION
}

/// Create a core with default timings. `name` is UTF-8 of `name_len` bytes;
/// `service_uuid_16` is the service id in big-endian byte order.
/// Returns opaque handle or null on failure.
#[no_mangle]
pub extern "C" fn nearby_core_create(
    name: *const u8,
    name_len: usize,
    service_uuid_16: *const u8,
) -> *mut c_void {
    if name.is_null() || service_uuid_16.is_null() {
        return std::ptr::null_mut();
    }
    let name = unsafe { slice::from_raw_parts(name, name_len) };
    let Ok(name) = std::str::from_utf8(name) else {
        return std::ptr::null_mut();
    };
    let mut id = [0u8; 16];
    unsafe {
        id.copy_from_slice(slice::from_raw_parts(service_uuid_16, 16));
    }
    let config = DiscoveryConfig::new(name, Uuid::from_bytes(id));
    match DiscoveryCore::new(config) {
        Ok(core) => Box::into_raw(Box::new(Handle {
            core,
            pending: Vec::new(),
        })) as *mut c_void,
        Err(e) => {
            warn!(%e, "rejected discovery config");
            std::ptr::null_mut()
        }
    }
}

/// Destroy core instance. No-op if h is null.
#[no_mangle]
pub extern "C" fn nearby_core_destroy(h: *mut c_void) {
    if h.is_null() {
        return;
    }
    let _ = unsafe { Box::from_raw(h as *mut Handle) };
}

/// Apply the configured start mode. Returns queued bytes, or -1 if h is null.
#[no_mangle]
pub extern "C" fn nearby_core_start(h: *mut c_void) -> c_int {
    let Some(handle) = handle(h) else {
        return -1;
    };
    let actions = handle.core.start(Instant::now());
    handle.queue(actions)
}

/// Feed one encoded `HostMessage` frame. Returns queued bytes, or -1 on a
/// null handle, a malformed frame or an incompatible `Hello`.
#[no_mangle]
pub extern "C" fn nearby_core_handle_frame(h: *mut c_void, frame: *const u8, len: usize) -> c_int {
    let Some(handle) = handle(h) else {
        return -1;
    };
    if frame.is_null() {
        return -1;
    }
    let bytes = unsafe { slice::from_raw_parts(frame, len) };
    let msg: HostMessage = match decode_frame(bytes) {
        Ok((msg, _)) => msg,
        Err(e) => {
            warn!(%e, "bad host frame");
            return -1;
        }
    };
    match msg {
        HostMessage::Hello { protocol_version } => {
            if !version_compatible(protocol_version) {
                warn!(protocol_version, "incompatible host protocol version");
                return -1;
            }
            handle.queue(Vec::new())
        }
        HostMessage::Event(event) => {
            let actions = handle.core.handle(event, Instant::now());
            handle.queue(actions)
        }
    }
}

/// Returns queued bytes, or -1 if h is null.
#[no_mangle]
pub extern "C" fn nearby_core_set_discovery_enabled(h: *mut c_void, enabled: c_int) -> c_int {
    let Some(handle) = handle(h) else {
        return -1;
    };
    let actions = handle.core.set_discovery_enabled(enabled != 0, Instant::now());
    handle.queue(actions)
}

/// Returns queued bytes, or -1 if h is null.
#[no_mangle]
pub extern "C" fn nearby_core_set_advertising_enabled(h: *mut c_void, enabled: c_int) -> c_int {
    let Some(handle) = handle(h) else {
        return -1;
    };
    let actions = handle.core.set_advertising_enabled(enabled != 0);
    handle.queue(actions)
}

/// Returns queued bytes, or -1 if h is null.
#[no_mangle]
pub extern "C" fn nearby_core_set_paused(h: *mut c_void, paused: c_int) -> c_int {
    let Some(handle) = handle(h) else {
        return -1;
    };
    let actions = handle.core.set_paused(paused != 0, Instant::now());
    handle.queue(actions)
}

/// Copy as many whole queued frames as fit into out_buf and drop them from the
/// queue. Returns bytes written (0 if none fit), or -1 on null arguments.
#[no_mangle]
pub extern "C" fn nearby_core_drain(h: *mut c_void, out_buf: *mut u8, out_buf_len: usize) -> c_int {
    let Some(handle) = handle(h) else {
        return -1;
    };
    if out_buf.is_null() {
        return -1;
    }
    let take = whole_frames(&handle.pending, out_buf_len);
    unsafe {
        out_buf.copy_from_nonoverlapping(handle.pending.as_ptr(), take);
    }
    handle.pending.drain(..take);
    take as c_int
}

/// Length of the longest prefix of `pending` made of whole frames that fits in
/// `limit` bytes and in a `c_int`.
fn whole_frames(pending: &[u8], limit: usize) -> usize {
    let limit = limit.min(c_int::MAX as usize);
    let mut take = 0;
    while let Ok(Some(len)) = frame_len(&pending[take..]) {
        let end = take + 4 + len;
        if end > limit || end > pending.len() {
            break;
        }
        take = end;
    }
    take
}
