//! Time helpers, input validation, and build metadata.

use std::path::Path;

use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::error::{ProvError, Result};

// ---------------------------------------------------------------------------
// Time
// ---------------------------------------------------------------------------

pub fn now_utc_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_unix_millis() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

// ---------------------------------------------------------------------------
// Validation helpers
// ---------------------------------------------------------------------------

/// Product codes are opaque identities; only their length is bounded.
pub const MAX_PRODUCT_CODE_CHARS: usize = 128;

static WALLET_RE: std::sync::LazyLock<regex::Regex> =
    std::sync::LazyLock::new(|| regex::Regex::new(r"^0[xX][0-9a-fA-F]{40}$").unwrap());

/// Trim and validate a product code.
pub fn validate_product_code(code: &str) -> Result<String> {
    let code = code.trim();
    if code.is_empty() {
        return Err(ProvError::Validation("Missing product_code".into()));
    }
    if code.chars().count() > MAX_PRODUCT_CODE_CHARS {
        return Err(ProvError::Validation(format!(
            "product_code longer than {MAX_PRODUCT_CODE_CHARS} characters"
        )));
    }
    Ok(code.to_string())
}

/// Trim a required free-text field; empty after trimming is a validation error.
pub fn require_text(value: &str, field: &str) -> Result<String> {
    let v = value.trim();
    if v.is_empty() {
        return Err(ProvError::Validation(format!("Missing {field}")));
    }
    Ok(v.to_string())
}

/// Trim an optional field, mapping blank to `None`.
pub fn optional_text(value: Option<&str>) -> Option<String> {
    value.map(str::trim).filter(|s| !s.is_empty()).map(str::to_string)
}

/// Format check only; checksum normalization belongs to the wallet layer.
pub fn validate_wallet_address(addr: &str) -> Result<String> {
    let addr = addr.trim();
    if addr.is_empty() {
        return Err(ProvError::Validation("Missing wallet_address".into()));
    }
    if !WALLET_RE.is_match(addr) {
        return Err(ProvError::Validation(format!(
            "invalid wallet_address '{addr}': expected 0x followed by 40 hex chars"
        )));
    }
    Ok(addr.to_string())
}

/// Validate that a path is not empty and does not contain null bytes.
pub fn validate_path(p: &Path, label: &str) -> Result<()> {
    let s = p.to_string_lossy();
    if s.is_empty() {
        return Err(ProvError::Validation(format!("{label} path is empty")));
    }
    if s.contains('\0') {
        return Err(ProvError::Validation(format!(
            "{label} path contains null byte"
        )));
    }
    Ok(())
}

/// Maximum number of rows allowed in CSV inputs.
pub const MAX_CSV_ROWS: usize = 10_000;

// ---------------------------------------------------------------------------
// Version constants (set by build.rs)
// ---------------------------------------------------------------------------

pub const GIT_HASH: &str = env!("PROV_GIT_HASH");
pub const BUILD_TS: &str = env!("PROV_BUILD_TS");
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// One-line version string for display.
pub fn version_string() -> String {
    format!("provchain v{VERSION} (git {GIT_HASH}, built {BUILD_TS})")
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
