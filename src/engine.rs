//! State-chain engine: the chain-mutating lifecycle operations.
//!
//! Each write runs in one `IMMEDIATE` store transaction.  The head is read
//! under the write lock, the ledger write (if any) is submitted before any
//! row is written, and the new event, head and QR record are committed
//! together.  A failure anywhere rolls the whole transition back.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use crate::canonical;
use crate::chain::{ChainLedger, ChainProduct, SimulatedChain, TxRef};
use crate::config::{ChainMode, ProvConfig};
use crate::error::{OptionExt as _, ProvError, Result};
use crate::hash;
use crate::product::{
    Actor, EventKind, Product, ProductEvent, QrPayload, QrRecord, RegisterOutcome,
    RegisterRequest, Role, TransferOutcome, TransferRequest,
};
use crate::reconcile::{self, ScanReport, ScanRequest};
use crate::store::{NewEvent, NewProduct, Store, StoreTx};
use crate::util;

const REGISTER_NOTES: &str = "Product registered";
const TRANSFER_NOTES: &str = "Transferred/Updated";

/// Everything known about one product.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductHistory {
    pub product: Product,
    pub qr: Option<QrRecord>,
    pub events: Vec<ProductEvent>,
    /// `None` without a ledger or when the ledger read failed.
    pub chain: Option<ChainProduct>,
}

pub struct Engine {
    store: Store,
    chain: Option<Box<dyn ChainLedger>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("store", &self.store)
            .field("chain", &self.chain.as_ref().map(|c| c.describe()))
            .finish()
    }
}

/// Hash of the canonical transition composite.  `ts` makes two otherwise
/// identical transitions distinct.
pub fn next_state_hash(
    product_code: &str,
    kind: EventKind,
    actor_id: i64,
    prev_hash: Option<&str>,
    extra: &Value,
) -> String {
    let composite = json!({
        "productCode": product_code,
        "action": kind.as_str(),
        "actorId": actor_id,
        "prevHash": prev_hash,
        "extra": extra,
        "ts": util::now_unix_millis(),
    });
    hash::digest_hex(canonical::canonical_json(&composite))
}

/// Build the ledger adapter selected by `[chain]`.
pub fn chain_from_config(cfg: &ProvConfig) -> Result<Option<Box<dyn ChainLedger>>> {
    match cfg.chain.mode {
        ChainMode::None => Ok(None),
        ChainMode::Simulated => {
            let path = cfg.sim_state_file();
            let chain = SimulatedChain::with_state_file(
                "0x00000000000000000000000000000000000000a1",
                &path,
            )?;
            Ok(Some(Box::new(chain)))
        }
        #[cfg(feature = "evm")]
        ChainMode::Evm => {
            let rpc = cfg.chain.rpc_url.as_deref().required_config("chain.rpc_url")?;
            let contract = cfg
                .chain
                .contract_address
                .as_deref()
                .required_config("chain.contract_address")?;
            let key = cfg.chain.private_key().required_config("chain.private_key")?;
            let chain = crate::chain::evm::EvmChain::connect(rpc, contract, &key)?;
            Ok(Some(Box::new(chain)))
        }
        #[cfg(not(feature = "evm"))]
        ChainMode::Evm => Err(ProvError::Config(
            "chain.mode = evm but this build lacks the `evm` feature".into(),
        )),
    }
}

impl Engine {
    pub fn new(store: Store, chain: Option<Box<dyn ChainLedger>>) -> Self {
        if let Some(c) = &chain {
            info!(ledger = %c.describe(), "ledger-integrated mode");
        }
        Self { store, chain }
    }

    pub fn from_config(cfg: &ProvConfig) -> Result<Self> {
        cfg.validate()?;
        let store = Store::open_or_create(&cfg.paths.db)?;
        let chain = chain_from_config(cfg)?;
        Ok(Self::new(store, chain))
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn chain(&self) -> Option<&dyn ChainLedger> {
        self.chain.as_deref()
    }

    // -- actors ------------------------------------------------------------

    pub fn add_user(&self, role: Role, email: &str, wallet: Option<&str>) -> Result<Actor> {
        let wallet = wallet.map(util::validate_wallet_address).transpose()?;
        let actor = self.store.add_user(role, email, wallet.as_deref())?;
        info!(actor_id = actor.id, role = %actor.role, "user added");
        Ok(actor)
    }

    pub fn link_wallet(&self, actor_id: i64, address: &str) -> Result<Actor> {
        let address = util::validate_wallet_address(address)?;
        self.store.set_wallet(actor_id, &address)?;
        info!(actor_id, wallet = %address, "wallet linked");
        self.store.actor(actor_id)?.found("User not found")
    }

    pub fn verify_seller(&self, actor_id: i64, address: &str) -> Result<TxRef> {
        let chain = self.admin_chain(actor_id, "verify sellers")?;
        let address = util::validate_wallet_address(address)?;
        let tx = chain.verify_seller(&address)?;
        info!(actor_id, seller = %address, tx = %tx, "seller verified");
        Ok(tx)
    }

    pub fn revoke_seller(&self, actor_id: i64, address: &str) -> Result<TxRef> {
        let chain = self.admin_chain(actor_id, "revoke sellers")?;
        let address = util::validate_wallet_address(address)?;
        let tx = chain.revoke_seller(&address)?;
        info!(actor_id, seller = %address, tx = %tx, "seller revoked");
        Ok(tx)
    }

    fn admin_chain(&self, actor_id: i64, action: &str) -> Result<&dyn ChainLedger> {
        let actor = self.store.actor(actor_id)?.ok_or_else(unknown_actor)?;
        actor.require_role(Role::Manufacturer, action)?;
        self.chain
            .as_deref()
            .ok_or_else(|| ProvError::Config("no ledger configured (chain.mode = none)".into()))
    }

    // -- lifecycle ---------------------------------------------------------

    pub fn register(&mut self, actor_id: i64, req: RegisterRequest) -> Result<RegisterOutcome> {
        let chain = self.chain.as_deref();
        let tx = self.store.begin_write()?;

        let actor = tx.actor(actor_id)?.ok_or_else(unknown_actor)?;
        actor.require_role(EventKind::Register.required_role(), "register product")?;

        let code = util::validate_product_code(&req.product_code)?;
        let name = util::require_text(&req.name, "name")?;
        if tx.product_by_code(&code)?.is_some() {
            return Err(ProvError::Conflict("product_code already exists".into()));
        }

        let batch = util::optional_text(req.batch.as_deref());
        let content_ref = util::optional_text(req.ipfs_cid.as_deref());
        let meta = match req.meta_json {
            Some(Value::Object(m)) => Value::Object(m),
            _ => json!({}),
        };
        let cloud_hash =
            crate::product::cloud_hash(&code, &name, batch.as_deref(), &meta, content_ref.as_deref());
        let nfc_uid_hash = util::optional_text(req.nfc_uid.as_deref()).map(hash::digest_hex);

        let chain_tx = match chain {
            Some(c) => {
                let secondary = nfc_uid_hash
                    .as_deref()
                    .map(hash::hex_to_fixed32)
                    .unwrap_or_else(|| hash::ZERO_FIXED32.to_string());
                Some(c.submit_registration(&code, &hash::hex_to_fixed32(&cloud_hash), &secondary)?)
            }
            None => None,
        };

        let extra = json!({
            "name": name,
            "batch": batch,
            "meta": meta,
            "contentRef": content_ref,
            "chainTx": chain_tx,
        });
        let state_hash = next_state_hash(&code, EventKind::Register, actor.id, None, &extra);

        let product = tx.insert_product(NewProduct {
            product_code: &code,
            manufacturer_id: actor.id,
            name: &name,
            batch: batch.as_deref(),
            meta_json: &meta,
            ipfs_cid: content_ref.as_deref(),
            current_state_hash: &state_hash,
            cloud_hash: Some(&cloud_hash),
            nfc_uid_hash: nfc_uid_hash.as_deref(),
            chain_register_tx_hash: chain_tx.as_deref(),
        })?;
        let (event, qr) = append_event(
            &tx,
            &product,
            EventKind::Register,
            &actor,
            None,
            &state_hash,
            chain_tx.as_deref(),
            REGISTER_NOTES,
        )?;
        tx.commit()?;

        info!(
            product_code = %product.product_code,
            state_hash = %state_hash,
            chain_tx = chain_tx.as_deref().unwrap_or("-"),
            "product registered"
        );
        Ok(RegisterOutcome { product, qr, event })
    }

    pub fn transfer(
        &mut self,
        actor_id: i64,
        product_code: &str,
        req: TransferRequest,
    ) -> Result<TransferOutcome> {
        let chain = self.chain.as_deref();
        let tx = self.store.begin_write()?;

        let actor = tx.actor(actor_id)?.ok_or_else(unknown_actor)?;
        actor.require_role(EventKind::Transfer.required_role(), "transfer/update")?;

        let code = product_code.trim();
        let product = tx.product_by_code(code)?.found("Product not found")?;

        let notes = util::optional_text(req.notes.as_deref())
            .unwrap_or_else(|| TRANSFER_NOTES.to_string());
        let mut extra = match req.extra {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(m)) => m,
            Some(_) => return Err(ProvError::Validation("extra must be a JSON object".into())),
        };
        let to_party = util::optional_text(req.to_address.as_deref())
            .or_else(|| actor.wallet_address.clone())
            .map(|a| util::validate_wallet_address(&a))
            .transpose()?;

        let chain_tx = match chain {
            Some(c) => {
                let to = to_party.as_deref().ok_or_else(|| {
                    ProvError::Validation("Missing to_address (and no linked wallet)".into())
                })?;
                Some(c.submit_transfer(&product.product_code, to)?)
            }
            None => None,
        };
        extra.insert("toParty".into(), json!(to_party));
        extra.insert("chainTx".into(), json!(chain_tx));

        let prev = product.current_state_hash.clone();
        let new_hash = next_state_hash(
            &product.product_code,
            EventKind::Transfer,
            actor.id,
            Some(&prev),
            &Value::Object(extra),
        );
        let (_, qr) = append_event(
            &tx,
            &product,
            EventKind::Transfer,
            &actor,
            Some(&prev),
            &new_hash,
            chain_tx.as_deref(),
            &notes,
        )?;
        tx.commit()?;

        info!(
            product_code = %product.product_code,
            prev = %prev,
            state_hash = %new_hash,
            chain_tx = chain_tx.as_deref().unwrap_or("-"),
            "product transferred"
        );
        Ok(TransferOutcome {
            product_code: product.product_code,
            prev_state_hash: prev,
            new_state_hash: new_hash,
            qr_payload: qr.qr_payload,
            chain_tx_hash: chain_tx,
        })
    }

    // -- reads -------------------------------------------------------------

    pub fn history(&self, product_code: &str) -> Result<ProductHistory> {
        let (product, qr, events) = self.store.read_snapshot(|s| {
            let product = s
                .product_by_code(product_code.trim())?
                .found("Product not found")?;
            let qr = s.qr_for(product.id)?;
            let events = s.events_for(product.id)?;
            Ok((product, qr, events))
        })?;
        let chain = self.chain.as_deref().and_then(|c| {
            c.read_product(&product.product_code)
                .map_err(|e| {
                    warn!(product_code = %product.product_code, error = %e, "ledger read failed; history without chain section");
                })
                .ok()
        });
        Ok(ProductHistory {
            product,
            qr,
            events,
            chain,
        })
    }

    pub fn scan(&self, req: &ScanRequest) -> Result<ScanReport> {
        reconcile::verify(&self.store, self.chain.as_deref(), req)
    }
}

fn unknown_actor() -> ProvError {
    ProvError::Forbidden("unknown actor".into())
}

/// Append one event and move the head plus QR record to `new_hash`.
///
/// `prev` is `None` only for the first event, whose head was written with
/// the product row.
#[allow(clippy::too_many_arguments)]
fn append_event(
    tx: &StoreTx<'_>,
    product: &Product,
    kind: EventKind,
    actor: &Actor,
    prev: Option<&str>,
    new_hash: &str,
    chain_tx: Option<&str>,
    notes: &str,
) -> Result<(ProductEvent, QrRecord)> {
    if let Some(prev) = prev {
        tx.update_head(product.id, prev, new_hash)?;
    }
    let event = tx.insert_event(NewEvent {
        product_id: product.id,
        kind,
        actor,
        prev_state_hash: prev,
        new_state_hash: new_hash,
        chain_tx_hash: chain_tx,
        notes,
    })?;
    let payload = QrPayload::new(&product.product_code, new_hash).to_json();
    let qr = tx.upsert_qr(product.id, &payload, new_hash)?;
    Ok((event, qr))
}
