use std::ffi::{c_char, CStr, CString};
use std::ptr;

use anyhow::Result;
use tempfile::tempdir;

use provchain_core::error::FfiErrorCode;
use provchain_core::ffi::{
    prov_add_user, prov_free_string, prov_history, prov_init_store, prov_register, prov_scan,
    prov_transfer, prov_version,
};

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

fn json_of(ptr: *mut c_char) -> Result<serde_json::Value> {
    Ok(serde_json::from_str(&unsafe { take_string(ptr) })?)
}

#[test]
fn ffi_version_and_init() -> Result<()> {
    let mut out = ptr::null_mut();
    let code = unsafe { prov_version(&mut out) };
    assert_eq!(code, 0);
    assert!(json_of(out)?["version"].is_string());

    let dir = tempdir()?;
    let db_path = dir.path().join("ffi_smoke.db");
    let db_c = CString::new(db_path.to_string_lossy().to_string())?;
    let mut out2 = ptr::null_mut();
    let code = unsafe { prov_init_store(db_c.as_ptr(), &mut out2) };
    assert_eq!(code, 0);
    assert!(json_of(out2)?["store_id"].is_string());
    assert!(db_path.exists());
    Ok(())
}

#[test]
fn ffi_register_transfer_scan() -> Result<()> {
    let dir = tempdir()?;
    let db_c = CString::new(dir.path().join("ffi.db").to_string_lossy().to_string())?;

    let add = |req: &str| -> Result<i64> {
        let req = CString::new(req)?;
        let mut out = ptr::null_mut();
        let code = unsafe { prov_add_user(db_c.as_ptr(), req.as_ptr(), &mut out) };
        assert_eq!(code, 0);
        json_of(out)?["id"]
            .as_i64()
            .ok_or_else(|| anyhow::anyhow!("no id"))
    };
    let maker = add(r#"{"role":"manufacturer","email":"m@example.com"}"#)?;
    let seller = add(r#"{"role":"seller","email":"s@example.com"}"#)?;

    let req = CString::new(r#"{"product_code":"ABC123","name":"Widget"}"#)?;
    let mut out = ptr::null_mut();
    let code = unsafe { prov_register(db_c.as_ptr(), maker, req.as_ptr(), &mut out) };
    assert_eq!(code, 0);
    let reg = json_of(out)?;
    let h1 = reg["product"]["current_state_hash"].as_str().unwrap_or_default().to_string();

    // Seller cannot register.
    let mut out = ptr::null_mut();
    let code = unsafe { prov_register(db_c.as_ptr(), seller, req.as_ptr(), &mut out) };
    assert_eq!(code, FfiErrorCode::Forbidden as i32);
    assert!(out.is_null());

    let code_c = CString::new("ABC123")?;
    let mut out = ptr::null_mut();
    let code = unsafe {
        prov_transfer(db_c.as_ptr(), seller, code_c.as_ptr(), ptr::null(), &mut out)
    };
    assert_eq!(code, 0);
    let qr_payload = json_of(out)?["qr_payload"].as_str().unwrap_or_default().to_string();

    let scan_req = CString::new(qr_payload)?;
    let mut out = ptr::null_mut();
    let code = unsafe { prov_scan(db_c.as_ptr(), scan_req.as_ptr(), &mut out) };
    assert_eq!(code, 0);
    assert_eq!(json_of(out)?["is_original"], true);

    let stale = CString::new(format!(r#"{{"productId":"ABC123","stateHash":"{h1}"}}"#))?;
    let mut out = ptr::null_mut();
    let code = unsafe { prov_scan(db_c.as_ptr(), stale.as_ptr(), &mut out) };
    assert_eq!(code, 0);
    assert_eq!(json_of(out)?["message"], "Mismatch (old QR or duplicate risk)");

    let mut out = ptr::null_mut();
    let code = unsafe { prov_history(db_c.as_ptr(), code_c.as_ptr(), &mut out) };
    assert_eq!(code, 0);
    assert_eq!(json_of(out)?["events"].as_array().map(Vec::len), Some(2));
    Ok(())
}
