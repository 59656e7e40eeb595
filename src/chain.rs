//! Ledger adapter: the narrow capability surface of the on-chain product
//! registry, plus an in-process simulated contract.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ProvError, Result, ResultExt as _};
use crate::hash;
use crate::util;

#[cfg(feature = "evm")]
pub mod evm;

/// Transaction hash returned by a confirmed write.
pub type TxRef = String;

pub const ZERO_ADDRESS: &str = "0x0000000000000000000000000000000000000000";

/// Authoritative on-chain fields for one product code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainProduct {
    pub exists: bool,
    pub manufacturer: String,
    pub current_owner: String,
    /// 0x-prefixed bytes32.
    pub cloud_hash: String,
    /// 0x-prefixed bytes32 (NFC UID hash slot).
    pub secondary_hash: String,
}

impl ChainProduct {
    pub fn absent() -> Self {
        Self {
            exists: false,
            manufacturer: ZERO_ADDRESS.to_string(),
            current_owner: ZERO_ADDRESS.to_string(),
            cloud_hash: hash::ZERO_FIXED32.to_string(),
            secondary_hash: hash::ZERO_FIXED32.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Capability trait
// ---------------------------------------------------------------------------

/// Every ledger backend implements this.
///
/// Writes block until the transaction is confirmed and return its hash; a
/// revert or an unconfirmed submission is an error.  Reads may fail when
/// the ledger is unreachable, which callers treat as recoverable.
pub trait ChainLedger: Send + Sync {
    fn submit_registration(
        &self,
        product_code: &str,
        cloud_hash_fixed32: &str,
        secondary_hash_fixed32: &str,
    ) -> Result<TxRef>;

    fn submit_transfer(&self, product_code: &str, new_owner: &str) -> Result<TxRef>;

    fn read_product(&self, product_code: &str) -> Result<ChainProduct>;

    fn verify_seller(&self, seller: &str) -> Result<TxRef>;

    fn revoke_seller(&self, seller: &str) -> Result<TxRef>;

    /// Short label for logs.
    fn describe(&self) -> String;
}

impl<T: ChainLedger + ?Sized> ChainLedger for Arc<T> {
    fn submit_registration(&self, code: &str, cloud: &str, secondary: &str) -> Result<TxRef> {
        (**self).submit_registration(code, cloud, secondary)
    }
    fn submit_transfer(&self, code: &str, new_owner: &str) -> Result<TxRef> {
        (**self).submit_transfer(code, new_owner)
    }
    fn read_product(&self, code: &str) -> Result<ChainProduct> {
        (**self).read_product(code)
    }
    fn verify_seller(&self, seller: &str) -> Result<TxRef> {
        (**self).verify_seller(seller)
    }
    fn revoke_seller(&self, seller: &str) -> Result<TxRef> {
        (**self).revoke_seller(seller)
    }
    fn describe(&self) -> String {
        (**self).describe()
    }
}

// ---------------------------------------------------------------------------
// Simulated contract
// ---------------------------------------------------------------------------

/// In-memory registry contract for development and CI.
///
/// Mirrors the contract rules: duplicate registration reverts, transfers
/// of unknown products revert, and transfers only go to verified sellers.
/// With a state file the contract survives process restarts (CLI use).
#[derive(Debug)]
pub struct SimulatedChain {
    operator: String,
    state: Mutex<SimState>,
    state_file: Option<PathBuf>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SimState {
    products: HashMap<String, ChainProduct>,
    verified_sellers: HashSet<String>,
    nonce: u64,
    #[serde(skip)]
    offline: bool,
    #[serde(skip)]
    reject_writes: bool,
}

impl Default for SimulatedChain {
    fn default() -> Self {
        Self::new("0x00000000000000000000000000000000000000a1")
    }
}

impl SimulatedChain {
    /// `operator` is the address that signs every write (recorded as the
    /// manufacturer of registered products).
    pub fn new(operator: &str) -> Self {
        Self {
            operator: operator.to_string(),
            state: Mutex::new(SimState::default()),
            state_file: None,
        }
    }

    /// Load contract state from `path` (if present) and write it back after
    /// every confirmed write.
    pub fn with_state_file(operator: &str, path: &Path) -> Result<Self> {
        let state = if path.exists() {
            let bytes = std::fs::read(path)
                .map_err(|e| ProvError::Chain(format!("read {}: {e}", path.display())))?;
            serde_json::from_slice(&bytes).ctx_chain("parse simulated chain state")?
        } else {
            SimState::default()
        };
        Ok(Self {
            operator: operator.to_string(),
            state: Mutex::new(state),
            state_file: Some(path.to_path_buf()),
        })
    }

    /// Make every call fail as if the RPC endpoint were unreachable.
    pub fn set_offline(&self, offline: bool) {
        if let Ok(mut s) = self.state.lock() {
            s.offline = offline;
        }
    }

    /// Make writes revert while reads keep working.
    pub fn set_reject_writes(&self, reject: bool) {
        if let Ok(mut s) = self.state.lock() {
            s.reject_writes = reject;
        }
    }

    /// Replace the stored cloud hash of a registered product.
    pub fn overwrite_cloud_hash(&self, product_code: &str, cloud_hash_fixed32: &str) -> Result<()> {
        let mut s = self.lock()?;
        let p = s
            .products
            .get_mut(product_code)
            .ok_or_else(|| ProvError::NotFound(format!("no on-chain product {product_code}")))?;
        p.cloud_hash = cloud_hash_fixed32.to_ascii_lowercase();
        Ok(())
    }

    pub fn is_verified_seller(&self, seller: &str) -> bool {
        self.lock()
            .map(|s| s.verified_sellers.contains(&seller.to_ascii_lowercase()))
            .unwrap_or(false)
    }

    fn lock(&self) -> Result<MutexGuard<'_, SimState>> {
        self.state
            .lock()
            .map_err(|_| ProvError::Chain("simulated chain state poisoned".into()))
    }

    fn begin_write(&self) -> Result<MutexGuard<'_, SimState>> {
        let s = self.lock()?;
        if s.offline {
            return Err(ProvError::Chain("simulated chain unreachable".into()));
        }
        if s.reject_writes {
            return Err(ProvError::Chain("execution reverted: writes disabled".into()));
        }
        Ok(s)
    }

    fn next_tx(state: &mut SimState, op: &str, args: &str) -> TxRef {
        state.nonce += 1;
        hash::digest_fixed32(format!("{op}:{}:{args}", state.nonce))
    }

    fn persist(&self, state: &SimState) -> Result<()> {
        let Some(path) = &self.state_file else {
            return Ok(());
        };
        let json = serde_json::to_vec_pretty(state).ctx_chain("serialize simulated chain state")?;
        std::fs::write(path, json)
            .map_err(|e| ProvError::Chain(format!("write {}: {e}", path.display())))
    }
}

impl ChainLedger for SimulatedChain {
    fn submit_registration(
        &self,
        product_code: &str,
        cloud_hash_fixed32: &str,
        secondary_hash_fixed32: &str,
    ) -> Result<TxRef> {
        let mut s = self.begin_write()?;
        if s.products.contains_key(product_code) {
            return Err(ProvError::Chain(format!(
                "execution reverted: product {product_code} already registered"
            )));
        }
        s.products.insert(
            product_code.to_string(),
            ChainProduct {
                exists: true,
                manufacturer: self.operator.clone(),
                current_owner: self.operator.clone(),
                cloud_hash: cloud_hash_fixed32.to_ascii_lowercase(),
                secondary_hash: secondary_hash_fixed32.to_ascii_lowercase(),
            },
        );
        let tx = Self::next_tx(&mut s, "registerProduct", product_code);
        self.persist(&s)?;
        debug!(product_code, tx = %tx, "simulated registerProduct");
        Ok(tx)
    }

    fn submit_transfer(&self, product_code: &str, new_owner: &str) -> Result<TxRef> {
        let to = util::validate_wallet_address(new_owner)
            .map_err(|e| ProvError::Chain(format!("execution reverted: {e}")))?;
        let mut s = self.begin_write()?;
        if !s.verified_sellers.contains(&to.to_ascii_lowercase()) {
            return Err(ProvError::Chain(format!(
                "execution reverted: {to} is not a verified seller"
            )));
        }
        let p = s.products.get_mut(product_code).ok_or_else(|| {
            ProvError::Chain(format!(
                "execution reverted: product {product_code} not registered"
            ))
        })?;
        p.current_owner = to.clone();
        let tx = Self::next_tx(&mut s, "transferProduct", &format!("{product_code}:{to}"));
        self.persist(&s)?;
        debug!(product_code, to = %to, tx = %tx, "simulated transferProduct");
        Ok(tx)
    }

    fn read_product(&self, product_code: &str) -> Result<ChainProduct> {
        let s = self.lock()?;
        if s.offline {
            return Err(ProvError::Chain("simulated chain unreachable".into()));
        }
        Ok(s
            .products
            .get(product_code)
            .cloned()
            .unwrap_or_else(ChainProduct::absent))
    }

    fn verify_seller(&self, seller: &str) -> Result<TxRef> {
        let seller = util::validate_wallet_address(seller)?;
        let mut s = self.begin_write()?;
        s.verified_sellers.insert(seller.to_ascii_lowercase());
        let tx = Self::next_tx(&mut s, "verifySeller", &seller);
        self.persist(&s)?;
        Ok(tx)
    }

    fn revoke_seller(&self, seller: &str) -> Result<TxRef> {
        let seller = util::validate_wallet_address(seller)?;
        let mut s = self.begin_write()?;
        s.verified_sellers.remove(&seller.to_ascii_lowercase());
        let tx = Self::next_tx(&mut s, "revokeSeller", &seller);
        self.persist(&s)?;
        Ok(tx)
    }

    fn describe(&self) -> String {
        format!("simulated(operator={})", self.operator)
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
