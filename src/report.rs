//! Audit pack generation: batch-scan a CSV of QR claims and write the
//! verdicts plus a chain-integrity audit as JSON.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::engine::Engine;
use crate::error::{ProvError, Result, ResultExt as _};
use crate::reconcile::{self, ChainAudit, ScanRequest, Verdict};
use crate::store::StoreMeta;
use crate::util;

// ---------------------------------------------------------------------------
// CSV input
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CsvRow {
    #[serde(rename = "productId")]
    product_id: String,
    #[serde(rename = "stateHash")]
    state_hash: String,
    #[serde(default)]
    nfc_uid: Option<String>,
}

/// Read scan claims from a CSV with header `productId,stateHash` (and an
/// optional `nfc_uid` column).
pub fn read_scan_csv(path: &Path) -> Result<Vec<ScanRequest>> {
    let mut rdr = csv::Reader::from_path(path)
        .map_err(|e| ProvError::Report(format!("open csv {}: {e}", path.display())))?;
    let headers = rdr.headers().ctx_report("read csv headers")?.clone();
    for required in ["productId", "stateHash"] {
        if !headers.iter().any(|h| h == required) {
            return Err(ProvError::Validation(format!(
                "csv missing required header '{required}'"
            )));
        }
    }

    let mut out = Vec::new();
    for rec in rdr.deserialize::<CsvRow>() {
        if out.len() == util::MAX_CSV_ROWS {
            return Err(ProvError::Validation(format!(
                "csv exceeds maximum row limit of {}",
                util::MAX_CSV_ROWS
            )));
        }
        let row = rec.ctx_report("parse csv row")?;
        out.push(ScanRequest {
            product_id: row.product_id,
            state_hash: row.state_hash,
            nfc_uid: row.nfc_uid,
        });
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Batch scan
// ---------------------------------------------------------------------------

/// One CSV row's outcome.  Rows that fail validation or lookup keep their
/// error instead of aborting the batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchVerdict {
    pub product_id: String,
    pub state_hash: String,
    pub verdict: Option<Verdict>,
    pub message: String,
    pub is_original: Option<bool>,
    pub is_authentic: Option<bool>,
    pub error_status: Option<u16>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchCounts {
    pub rows: usize,
    pub original: usize,
    pub not_original: usize,
    pub authentic: usize,
    pub not_authentic: usize,
    pub errors: usize,
}

pub fn batch_scan(engine: &Engine, claims: &[ScanRequest]) -> (Vec<BatchVerdict>, BatchCounts) {
    let mut counts = BatchCounts {
        rows: claims.len(),
        ..Default::default()
    };
    let mut verdicts = Vec::with_capacity(claims.len());

    for (i, claim) in claims.iter().enumerate() {
        let v = match engine.scan(claim) {
            Ok(r) => {
                if r.is_original {
                    counts.original += 1;
                } else {
                    counts.not_original += 1;
                }
                match r.is_authentic {
                    Some(true) => counts.authentic += 1,
                    Some(false) => counts.not_authentic += 1,
                    None => {}
                }
                BatchVerdict {
                    product_id: r.product_code,
                    state_hash: r.claimed_state_hash,
                    verdict: Some(r.verdict),
                    message: r.message,
                    is_original: Some(r.is_original),
                    is_authentic: r.is_authentic,
                    error_status: None,
                }
            }
            Err(e) => {
                warn!(row = i + 1, product_id = %claim.product_id, error = %e, "batch row rejected");
                counts.errors += 1;
                BatchVerdict {
                    product_id: claim.product_id.clone(),
                    state_hash: claim.state_hash.clone(),
                    verdict: None,
                    message: e.public_message(),
                    is_original: None,
                    is_authentic: None,
                    error_status: Some(e.status_code()),
                }
            }
        };
        verdicts.push(v);
    }
    (verdicts, counts)
}

// ---------------------------------------------------------------------------
// Pack writer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditPackManifest {
    pub format: String,
    pub generated_at_utc: String,
    pub generator: String,
    pub store: StoreMeta,
    /// Ledger backend label, `None` in ledger-less mode.
    pub ledger: Option<String>,
    pub counts: BatchCounts,
    pub chains_audited: usize,
    pub chains_failing: usize,
}

/// Scan every claim, audit every product chain, and write
/// `manifest.json`, `verdicts.json` and `chain_audit.json` into `out_dir`.
pub fn write_audit_pack(
    out_dir: &Path,
    engine: &Engine,
    claims: &[ScanRequest],
) -> Result<AuditPackManifest> {
    std::fs::create_dir_all(out_dir)
        .map_err(|e| ProvError::Report(format!("create out dir {}: {e}", out_dir.display())))?;

    let (verdicts, counts) = batch_scan(engine, claims);
    let audits: Vec<ChainAudit> = reconcile::audit_all(engine.store())?;

    let manifest = AuditPackManifest {
        format: "provchain audit-pack v1".to_string(),
        generated_at_utc: util::now_utc_rfc3339(),
        generator: util::version_string(),
        store: engine.store().meta().clone(),
        ledger: engine.chain().map(|c| c.describe()),
        counts,
        chains_audited: audits.len(),
        chains_failing: audits.iter().filter(|a| !a.ok).count(),
    };

    write_json(&out_dir.join("manifest.json"), &manifest)?;
    write_json(&out_dir.join("verdicts.json"), &verdicts)?;
    write_json(&out_dir.join("chain_audit.json"), &audits)?;

    info!(
        out_dir = %out_dir.display(),
        rows = manifest.counts.rows,
        errors = manifest.counts.errors,
        chains_failing = manifest.chains_failing,
        "audit pack written"
    );
    Ok(manifest)
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_vec_pretty(value)
        .map_err(|e| ProvError::Report(format!("serialize {}: {e}", path.display())))?;
    std::fs::write(path, json)
        .map_err(|e| ProvError::Report(format!("write {}: {e}", path.display())))
}
