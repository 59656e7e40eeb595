//! C-ABI exports for embedding the engine (`provchain_core` cdylib).
//!
//! Every function returns an `i32` status code (0 = success, negative =
//! error kind, see [`FfiErrorCode`]).  Requests and results are JSON
//! strings; output is returned via a `*mut *mut c_char` parameter and must
//! be freed with [`prov_free_string`].  Error messages are available via
//! [`prov_last_error`].
//!
//! The ledger mode is taken from the `PROV_*` environment variables.
//!
//! # Safety
//! All functions that accept raw pointers are `unsafe`.  Callers must ensure
//! that string pointers are valid, null-terminated UTF-8.

#![allow(unsafe_code)]

use std::cell::RefCell;
use std::ffi::{c_char, c_int, c_longlong, CStr, CString};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::ProvConfig;
use crate::engine::Engine;
use crate::error::{FfiErrorCode, ProvError, Result};
use crate::product::{RegisterRequest, Role, TransferRequest};
use crate::reconcile::ScanRequest;
use crate::store::Store;

// ---------------------------------------------------------------------------
// Thread-local last error
// ---------------------------------------------------------------------------

thread_local! {
    static LAST_ERROR: RefCell<CString> = RefCell::new(CString::default());
}

fn set_last_error(msg: &str) {
    let c = CString::new(msg.replace('\0', " ")).unwrap_or_default();
    LAST_ERROR.with(|e| *e.borrow_mut() = c);
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

unsafe fn ptr_to_str<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    unsafe { CStr::from_ptr(ptr) }.to_str().ok()
}

unsafe fn required_str<'a>(ptr: *const c_char, name: &str) -> Result<&'a str> {
    unsafe { ptr_to_str(ptr) }
        .ok_or_else(|| ProvError::Validation(format!("{name} is null or not UTF-8")))
}

fn write_out(out: *mut *mut c_char, val: String) {
    if !out.is_null() {
        let c = CString::new(val).unwrap_or_default();
        unsafe { *out = c.into_raw() };
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| ProvError::Other(format!("serialize: {e}")))
}

fn parse_request<'de, T: Deserialize<'de>>(json: &'de str) -> Result<T> {
    serde_json::from_str(json).map_err(|e| ProvError::Validation(format!("invalid request JSON: {e}")))
}

/// Open an engine on `db_path` with the environment-selected ledger.
unsafe fn open_engine(db_path: *const c_char) -> Result<Engine> {
    let db = unsafe { required_str(db_path, "db_path") }?;
    let mut cfg = ProvConfig::default();
    cfg.apply_env()?;
    cfg.paths.db = db.into();
    Engine::from_config(&cfg)
}

/// Run `body`, catch panics, map errors to FFI codes.
fn ffi_run(
    out: *mut *mut c_char,
    body: impl FnOnce() -> Result<String> + std::panic::UnwindSafe,
) -> c_int {
    match std::panic::catch_unwind(body) {
        Ok(Ok(json)) => {
            write_out(out, json);
            FfiErrorCode::Ok as c_int
        }
        Ok(Err(e)) => {
            set_last_error(&e.to_string());
            FfiErrorCode::from(&e) as c_int
        }
        Err(_) => {
            set_last_error("internal panic");
            FfiErrorCode::InternalError as c_int
        }
    }
}

// ---------------------------------------------------------------------------
// Public FFI functions
// ---------------------------------------------------------------------------

/// Copy the last error message into `buf`.  Returns the number of bytes
/// written including the null terminator; with a null `buf` or zero
/// `buf_len`, returns the required size.
#[no_mangle]
pub unsafe extern "C" fn prov_last_error(buf: *mut u8, buf_len: usize) -> c_int {
    LAST_ERROR.with(|e| {
        let msg = e.borrow();
        let bytes = msg.as_bytes_with_nul();
        if buf.is_null() || buf_len == 0 {
            return bytes.len() as c_int;
        }
        let copy_len = bytes.len().min(buf_len);
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), buf, copy_len) };
        if copy_len < bytes.len() {
            unsafe { *buf.add(copy_len - 1) = 0 };
        }
        copy_len as c_int
    })
}

/// Free a string previously returned by a `prov_*` function.
#[no_mangle]
pub unsafe extern "C" fn prov_free_string(ptr: *mut c_char) {
    if !ptr.is_null() {
        unsafe { drop(CString::from_raw(ptr)) };
    }
}

#[no_mangle]
pub unsafe extern "C" fn prov_version(out_json: *mut *mut c_char) -> c_int {
    ffi_run(out_json, || {
        to_json(&serde_json::json!({
            "version": crate::util::VERSION,
            "git_hash": crate::util::GIT_HASH,
            "build_ts": crate::util::BUILD_TS,
        }))
    })
}

/// Create a new store database.
#[no_mangle]
pub unsafe extern "C" fn prov_init_store(
    db_path: *const c_char,
    out_json: *mut *mut c_char,
) -> c_int {
    ffi_run(out_json, || {
        let db = unsafe { required_str(db_path, "db_path") }?;
        let store = Store::create_new(Path::new(db))?;
        to_json(store.meta())
    })
}

/// Request: `{"role": "...", "email": "...", "wallet": "0x.."}`.
#[no_mangle]
pub unsafe extern "C" fn prov_add_user(
    db_path: *const c_char,
    request_json: *const c_char,
    out_json: *mut *mut c_char,
) -> c_int {
    #[derive(Deserialize)]
    struct AddUser {
        role: String,
        email: String,
        #[serde(default)]
        wallet: Option<String>,
    }

    ffi_run(out_json, || {
        let req: AddUser = parse_request(unsafe { required_str(request_json, "request_json") }?)?;
        let engine = unsafe { open_engine(db_path) }?;
        let role: Role = req.role.parse()?;
        to_json(&engine.add_user(role, &req.email, req.wallet.as_deref())?)
    })
}

/// Request: [`RegisterRequest`] as JSON.
#[no_mangle]
pub unsafe extern "C" fn prov_register(
    db_path: *const c_char,
    actor_id: c_longlong,
    request_json: *const c_char,
    out_json: *mut *mut c_char,
) -> c_int {
    ffi_run(out_json, || {
        let req: RegisterRequest =
            parse_request(unsafe { required_str(request_json, "request_json") }?)?;
        let mut engine = unsafe { open_engine(db_path) }?;
        to_json(&engine.register(actor_id, req)?)
    })
}

/// Request: [`TransferRequest`] as JSON (a null `request_json` means `{}`).
#[no_mangle]
pub unsafe extern "C" fn prov_transfer(
    db_path: *const c_char,
    actor_id: c_longlong,
    product_code: *const c_char,
    request_json: *const c_char,
    out_json: *mut *mut c_char,
) -> c_int {
    ffi_run(out_json, || {
        let code = unsafe { required_str(product_code, "product_code") }?;
        let req: TransferRequest = match unsafe { ptr_to_str(request_json) } {
            Some(json) => parse_request(json)?,
            None => TransferRequest::default(),
        };
        let mut engine = unsafe { open_engine(db_path) }?;
        to_json(&engine.transfer(actor_id, code, req)?)
    })
}

#[no_mangle]
pub unsafe extern "C" fn prov_history(
    db_path: *const c_char,
    product_code: *const c_char,
    out_json: *mut *mut c_char,
) -> c_int {
    ffi_run(out_json, || {
        let code = unsafe { required_str(product_code, "product_code") }?;
        let engine = unsafe { open_engine(db_path) }?;
        to_json(&engine.history(code)?)
    })
}

/// Request: `{"productId": "...", "stateHash": "...", "nfc_uid": null}`,
/// i.e. the scanned QR payload.
#[no_mangle]
pub unsafe extern "C" fn prov_scan(
    db_path: *const c_char,
    request_json: *const c_char,
    out_json: *mut *mut c_char,
) -> c_int {
    ffi_run(out_json, || {
        let req: ScanRequest = parse_request(unsafe { required_str(request_json, "request_json") }?)?;
        let engine = unsafe { open_engine(db_path) }?;
        to_json(&engine.scan(&req)?)
    })
}

/// Export the store to a JSON backup file.
#[no_mangle]
pub unsafe extern "C" fn prov_export_store(
    db_path: *const c_char,
    export_path: *const c_char,
    out_json: *mut *mut c_char,
) -> c_int {
    ffi_run(out_json, || {
        let db = unsafe { required_str(db_path, "db_path") }?;
        let out = unsafe { required_str(export_path, "export_path") }?;
        let store = Store::open_existing(Path::new(db))?;
        crate::store::export_store_json(&store, Path::new(out))?;
        to_json(&serde_json::json!({ "status": "ok", "path": out }))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr;
    use tempfile::tempdir;

    unsafe fn take_string(ptr: *mut c_char) -> String {
        if ptr.is_null() {
            return String::new();
        }
        let s = unsafe { CStr::from_ptr(ptr) }
            .to_str()
            .unwrap_or_default()
            .to_string();
        unsafe { prov_free_string(ptr) };
        s
    }

    #[test]
    fn version_returns_json() {
        let mut out: *mut c_char = ptr::null_mut();
        let code = unsafe { prov_version(&mut out) };
        assert_eq!(code, 0);
        let json = unsafe { take_string(out) };
        assert!(json.contains("version"));
    }

    #[test]
    fn back_to_back_calls_are_not_throttled() {
        for _ in 0..500 {
            let mut out: *mut c_char = ptr::null_mut();
            assert_eq!(unsafe { prov_version(&mut out) }, 0);
            unsafe { prov_free_string(out) };
        }
    }

    #[test]
    fn init_store_rejects_null_path() {
        let mut out: *mut c_char = ptr::null_mut();
        let code = unsafe { prov_init_store(ptr::null(), &mut out) };
        assert_eq!(code, FfiErrorCode::InvalidArgument as c_int);
        assert!(out.is_null());
    }

    #[test]
    fn malformed_request_is_invalid_argument() {
        let dir = tempdir().unwrap();
        let db = CString::new(dir.path().join("t.db").to_string_lossy().to_string()).unwrap();
        let req = CString::new("{not json").unwrap();
        let mut out: *mut c_char = ptr::null_mut();
        let code = unsafe { prov_scan(db.as_ptr(), req.as_ptr(), &mut out) };
        assert_eq!(code, FfiErrorCode::InvalidArgument as c_int);

        let needed = unsafe { prov_last_error(ptr::null_mut(), 0) };
        let mut buf = vec![0u8; needed as usize];
        unsafe { prov_last_error(buf.as_mut_ptr(), buf.len()) };
        let msg = CStr::from_bytes_until_nul(&buf).unwrap().to_str().unwrap();
        assert!(msg.contains("invalid request JSON"));
    }
}
