//! Product lifecycle data model and the request/response shapes of the
//! chain-mutating operations.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::canonical;
use crate::error::{ProvError, Result};
use crate::hash;

// ---------------------------------------------------------------------------
// Actors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Manufacturer,
    Seller,
    Customer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manufacturer => "manufacturer",
            Self::Seller => "seller",
            Self::Customer => "customer",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = ProvError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "manufacturer" => Ok(Self::Manufacturer),
            "seller" => Ok(Self::Seller),
            "customer" => Ok(Self::Customer),
            other => Err(ProvError::Validation(format!("unknown role '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Actor {
    pub id: i64,
    pub role: Role,
    pub email: String,
    pub wallet_address: Option<String>,
    pub created_at: String,
}

impl Actor {
    /// Authorization gate for chain-mutating operations.
    pub fn require_role(&self, role: Role, action: &str) -> Result<()> {
        if self.role != role {
            return Err(ProvError::Forbidden(format!("Only {role} can {action}")));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Lifecycle transition kinds.  New kinds go here together with the role
/// allowed to perform them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventKind {
    Register,
    Transfer,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Register => "REGISTER",
            Self::Transfer => "TRANSFER",
        }
    }

    pub fn required_role(&self) -> Role {
        match self {
            Self::Register => Role::Manufacturer,
            Self::Transfer => Role::Seller,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = ProvError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "REGISTER" => Ok(Self::Register),
            "TRANSFER" => Ok(Self::Transfer),
            other => Err(ProvError::Store(format!("unknown event_type '{other}'"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Stored records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Product {
    pub id: i64,
    pub product_code: String,
    pub manufacturer_id: i64,
    pub name: String,
    pub batch: Option<String>,
    pub meta_json: Value,
    pub ipfs_cid: Option<String>,
    /// Head of the per-product hash chain.
    pub current_state_hash: String,
    /// Canonical-data hash taken at registration.
    pub cloud_hash: Option<String>,
    pub nfc_uid_hash: Option<String>,
    pub chain_register_tx_hash: Option<String>,
    pub created_at: String,
}

impl Product {
    /// Recompute the canonical-data hash from the current off-chain fields.
    pub fn recompute_cloud_hash(&self) -> String {
        cloud_hash(
            &self.product_code,
            &self.name,
            self.batch.as_deref(),
            &self.meta_json,
            self.ipfs_cid.as_deref(),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductEvent {
    pub id: i64,
    pub product_id: i64,
    pub event_type: EventKind,
    pub actor_id: i64,
    pub actor_role: Option<Role>,
    pub actor_email: Option<String>,
    /// `None` only for the first event of a product.
    pub prev_state_hash: Option<String>,
    pub new_state_hash: String,
    pub chain_tx_hash: Option<String>,
    pub notes: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QrRecord {
    pub product_id: i64,
    pub qr_payload: String,
    pub last_state_hash: String,
    pub updated_at: String,
}

/// What gets printed on the physical QR code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QrPayload {
    #[serde(rename = "productId")]
    pub product_id: String,
    #[serde(rename = "stateHash")]
    pub state_hash: String,
}

impl QrPayload {
    pub fn new(product_code: &str, state_hash: &str) -> Self {
        Self {
            product_id: product_code.to_string(),
            state_hash: state_hash.to_string(),
        }
    }

    pub fn to_json(&self) -> String {
        // Two string fields; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn parse(s: &str) -> Result<Self> {
        serde_json::from_str(s)
            .map_err(|e| ProvError::Validation(format!("invalid QR payload: {e}")))
    }
}

// ---------------------------------------------------------------------------
// Canonical product data
// ---------------------------------------------------------------------------

/// The timestamp-free payload whose hash is committed at registration.
pub fn cloud_payload(
    product_code: &str,
    name: &str,
    batch: Option<&str>,
    meta: &Value,
    content_ref: Option<&str>,
) -> Value {
    json!({
        "productCode": product_code,
        "name": name,
        "batch": batch,
        "meta": meta,
        "contentRef": content_ref,
    })
}

pub fn cloud_hash(
    product_code: &str,
    name: &str,
    batch: Option<&str>,
    meta: &Value,
    content_ref: Option<&str>,
) -> String {
    let payload = cloud_payload(product_code, name, batch, meta, content_ref);
    hash::digest_hex(canonical::canonical_json(&payload))
}

// ---------------------------------------------------------------------------
// Operation inputs / outputs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub product_code: String,
    pub name: String,
    #[serde(default)]
    pub batch: Option<String>,
    /// Free-form key/value document; anything but an object is stored as `{}`.
    #[serde(default)]
    pub meta_json: Option<Value>,
    #[serde(default)]
    pub ipfs_cid: Option<String>,
    /// Raw NFC tag UID; only its digest is stored.
    #[serde(default)]
    pub nfc_uid: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterOutcome {
    pub product: Product,
    pub qr: QrRecord,
    pub event: ProductEvent,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransferRequest {
    /// Destination wallet for the on-chain transfer; defaults to the
    /// seller's linked wallet.
    #[serde(default)]
    pub to_address: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub extra: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferOutcome {
    pub product_code: String,
    pub prev_state_hash: String,
    pub new_state_hash: String,
    pub qr_payload: String,
    pub chain_tx_hash: Option<String>,
}
