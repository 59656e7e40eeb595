//! Reconciliation: turn a scanned QR claim into an authenticity verdict by
//! cross-checking the relational record against the ledger record, and
//! audit the per-product hash chains.
//!
//! Nothing in here mutates state.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::chain::{ChainLedger, ChainProduct};
use crate::error::{OptionExt as _, ProvError, Result};
use crate::hash;
use crate::product::{EventKind, Product, ProductEvent, QrPayload};
use crate::store::Store;
use crate::util;

// ---------------------------------------------------------------------------
// Scan request / verdict
// ---------------------------------------------------------------------------

/// A scanned claim: the QR payload fields plus an optional NFC tag read.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanRequest {
    #[serde(rename = "productId", default)]
    pub product_id: String,
    #[serde(rename = "stateHash", default)]
    pub state_hash: String,
    #[serde(default)]
    pub nfc_uid: Option<String>,
}

impl ScanRequest {
    pub fn new(product_id: &str, state_hash: &str) -> Self {
        Self {
            product_id: product_id.to_string(),
            state_hash: state_hash.to_string(),
            nfc_uid: None,
        }
    }

    /// Build from the raw text of a scanned QR code.
    pub fn from_qr(payload: &str) -> Result<Self> {
        let qr = QrPayload::parse(payload)?;
        Ok(Self::new(&qr.product_id, &qr.state_hash))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Original,
    Mismatch,
    Authentic,
    AuthenticStaleQr,
    NotRegisteredOnChain,
    TamperedOffChain,
    TamperedOnChain,
    NfcMismatch,
    LedgerUnavailable,
}

impl Verdict {
    pub fn message(&self) -> &'static str {
        match self {
            Self::Original => "Original (latest state matches)",
            Self::Mismatch => "Mismatch (old QR or duplicate risk)",
            Self::Authentic => "Authentic (off-chain and on-chain hashes match)",
            Self::AuthenticStaleQr => "Authentic product, but QR is not the latest state",
            Self::NotRegisteredOnChain => "Not registered on-chain",
            Self::TamperedOffChain => "Tampered (off-chain data does not match registered hash)",
            Self::TamperedOnChain => "Tampered (on-chain hash mismatch)",
            Self::NfcMismatch => "NFC tag does not match registered tag",
            Self::LedgerUnavailable => "Ledger unavailable (cannot confirm authenticity)",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanReport {
    pub product_code: String,
    pub claimed_state_hash: String,
    pub current_state_hash: String,
    pub is_original: bool,
    /// `None` when no ledger is configured.
    pub is_authentic: Option<bool>,
    pub verdict: Verdict,
    pub message: String,
    /// Recomputed canonical data hash equals the one stored at registration.
    pub offchain_hash_match: bool,
    pub onchain_exists: Option<bool>,
    pub onchain_hash_match: Option<bool>,
    /// `None` unless the scan carried an NFC read.
    pub nfc_match: Option<bool>,
    pub chain: Option<ChainProduct>,
    pub product: Product,
    pub events: Vec<ProductEvent>,
}

/// Verify a scanned claim.
///
/// Without a ledger the verdict is the plain state-hash comparison.  With
/// one, authenticity additionally requires the product to exist on-chain
/// with the same canonical data hash as the one recomputed off-chain.  A
/// failing ledger read never yields a positive verdict.
pub fn verify(
    store: &Store,
    chain: Option<&dyn ChainLedger>,
    req: &ScanRequest,
) -> Result<ScanReport> {
    let code = req.product_id.trim();
    let claimed = req.state_hash.trim();
    if code.is_empty() || claimed.is_empty() {
        return Err(ProvError::Validation("productId and stateHash required".into()));
    }

    let (product, events) = store.read_snapshot(|s| {
        let product = s.product_by_code(code)?.found("Product not found")?;
        let events = s.events_for(product.id)?;
        Ok((product, events))
    })?;

    let is_original = claimed == product.current_state_hash;
    let recomputed = product.recompute_cloud_hash();
    let offchain_hash_match = product
        .cloud_hash
        .as_deref()
        .is_some_and(|stored| hash::fixed32_eq(stored, &recomputed));

    let nfc_digest = util::optional_text(req.nfc_uid.as_deref()).map(hash::digest_hex);
    let offchain_nfc_match = nfc_digest.as_ref().map(|d| {
        product
            .nfc_uid_hash
            .as_deref()
            .is_some_and(|stored| hash::fixed32_eq(stored, d))
    });

    let mut report = ScanReport {
        product_code: product.product_code.clone(),
        claimed_state_hash: claimed.to_string(),
        current_state_hash: product.current_state_hash.clone(),
        is_original,
        is_authentic: None,
        verdict: if is_original {
            Verdict::Original
        } else {
            Verdict::Mismatch
        },
        message: String::new(),
        offchain_hash_match,
        onchain_exists: None,
        onchain_hash_match: None,
        nfc_match: offchain_nfc_match,
        chain: None,
        product,
        events,
    };

    if let Some(chain) = chain {
        match chain.read_product(&report.product_code) {
            Ok(onchain) => {
                let onchain_hash_match = onchain.exists
                    && hash::fixed32_eq(&onchain.cloud_hash, &recomputed);
                let nfc_match = match (offchain_nfc_match, &nfc_digest) {
                    (Some(off), Some(d)) => {
                        Some(off && hash::fixed32_eq(&onchain.secondary_hash, d))
                    }
                    _ => None,
                };
                let verdict = if !onchain.exists {
                    Verdict::NotRegisteredOnChain
                } else if !offchain_hash_match {
                    Verdict::TamperedOffChain
                } else if !onchain_hash_match {
                    Verdict::TamperedOnChain
                } else if nfc_match == Some(false) {
                    Verdict::NfcMismatch
                } else if is_original {
                    Verdict::Authentic
                } else {
                    Verdict::AuthenticStaleQr
                };
                report.is_authentic = Some(matches!(
                    verdict,
                    Verdict::Authentic | Verdict::AuthenticStaleQr
                ));
                report.verdict = verdict;
                report.onchain_exists = Some(onchain.exists);
                report.onchain_hash_match = Some(onchain_hash_match);
                report.nfc_match = nfc_match;
                report.chain = Some(onchain);
            }
            Err(e) => {
                warn!(product_code = %report.product_code, error = %e, "ledger read failed during scan");
                report.is_authentic = Some(false);
                report.verdict = Verdict::LedgerUnavailable;
            }
        }
    }

    report.message = report.verdict.message().to_string();
    info!(
        product_code = %report.product_code,
        verdict = ?report.verdict,
        is_original = report.is_original,
        "scan verified"
    );
    Ok(report)
}

// ---------------------------------------------------------------------------
// Chain integrity audit
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainAudit {
    pub product_code: String,
    pub events: usize,
    pub head: String,
    pub ok: bool,
    pub problems: Vec<String>,
}

/// Walk the event log of one product and check the hash-chain invariants:
/// a single leading REGISTER with no predecessor, each event linking to
/// the previous event's hash, the product head equal to the last hash, and
/// the QR record carrying that head.
pub fn audit_chain(store: &Store, product_code: &str) -> Result<ChainAudit> {
    let (product, events, qr) = store.read_snapshot(|s| {
        let product = s.product_by_code(product_code)?.found("Product not found")?;
        let events = s.events_for(product.id)?;
        let qr = s.qr_for(product.id)?;
        Ok((product, events, qr))
    })?;
    let mut problems = Vec::new();

    let mut prev: Option<&str> = None;
    let mut seen = std::collections::HashSet::new();
    for (i, ev) in events.iter().enumerate() {
        let want_kind = if i == 0 {
            EventKind::Register
        } else {
            EventKind::Transfer
        };
        if ev.event_type != want_kind {
            problems.push(format!("event {}: expected {want_kind}, found {}", ev.id, ev.event_type));
        }
        if ev.prev_state_hash.as_deref() != prev {
            problems.push(format!(
                "event {}: prev_state_hash {:?} does not link to {:?}",
                ev.id, ev.prev_state_hash, prev
            ));
        }
        if !hash::is_state_hash(&ev.new_state_hash) {
            problems.push(format!("event {}: malformed state hash", ev.id));
        }
        if !seen.insert(ev.new_state_hash.as_str()) {
            problems.push(format!("event {}: repeated state hash", ev.id));
        }
        prev = Some(ev.new_state_hash.as_str());
    }

    match prev {
        None => problems.push("no events recorded".to_string()),
        Some(last) if last != product.current_state_hash => problems.push(format!(
            "product head {} differs from last event hash {last}",
            product.current_state_hash
        )),
        Some(_) => {}
    }

    match qr {
        None => problems.push("no QR record".to_string()),
        Some(qr) => {
            if qr.last_state_hash != product.current_state_hash {
                problems.push("QR last_state_hash differs from product head".to_string());
            }
            match QrPayload::parse(&qr.qr_payload) {
                Ok(p) if p == QrPayload::new(&product.product_code, &product.current_state_hash) => {}
                Ok(_) => problems.push("QR payload does not encode the current head".to_string()),
                Err(e) => problems.push(format!("QR payload unreadable: {e}")),
            }
        }
    }

    if !problems.is_empty() {
        warn!(product_code, problems = problems.len(), "chain audit found problems");
    }
    Ok(ChainAudit {
        product_code: product.product_code,
        events: events.len(),
        head: product.current_state_hash,
        ok: problems.is_empty(),
        problems,
    })
}

pub fn audit_all(store: &Store) -> Result<Vec<ChainAudit>> {
    store
        .product_codes()?
        .iter()
        .map(|code| audit_chain(store, code))
        .collect()
}
