use std::sync::Arc;

use anyhow::Result;
use tempfile::tempdir;

use provchain_core::{
    chain::{ChainLedger as _, SimulatedChain},
    engine::Engine,
    hash,
    product::{Actor, RegisterRequest, Role, TransferRequest},
    reconcile::{self, ScanRequest, Verdict},
    report,
    store::{self, Store},
};

const SELLER_WALLET: &str = "0x00000000000000000000000000000000000000b2";

struct Setup {
    engine: Engine,
    chain: Arc<SimulatedChain>,
    maker: Actor,
    seller: Actor,
}

fn ledger_engine(db_path: &std::path::Path) -> Result<Setup> {
    let chain = Arc::new(SimulatedChain::default());
    let engine = Engine::new(Store::open_or_create(db_path)?, Some(Box::new(chain.clone())));
    let maker = engine.add_user(Role::Manufacturer, "maker@example.com", None)?;
    let seller = engine.add_user(Role::Seller, "seller@example.com", Some(SELLER_WALLET))?;
    engine.verify_seller(maker.id, SELLER_WALLET)?;
    Ok(Setup {
        engine,
        chain,
        maker,
        seller,
    })
}

fn widget(code: &str) -> RegisterRequest {
    RegisterRequest {
        product_code: code.into(),
        name: "Widget".into(),
        batch: Some("B-1".into()),
        meta_json: Some(serde_json::json!({"color": "red"})),
        ipfs_cid: Some("bafybeigdyrzt".into()),
        nfc_uid: None,
    }
}

#[test]
fn ledger_mode_verdicts() -> Result<()> {
    let dir = tempdir()?;
    let mut s = ledger_engine(&dir.path().join("prov.db"))?;

    let reg = s.engine.register(s.maker.id, widget("ABC123"))?;
    let h1 = reg.product.current_state_hash.clone();
    let onchain = s.chain.read_product("ABC123")?;
    assert!(hash::fixed32_eq(
        &onchain.cloud_hash,
        reg.product.cloud_hash.as_deref().unwrap_or_default()
    ));

    let r = s.engine.scan(&ScanRequest::new("ABC123", &h1))?;
    assert_eq!(r.verdict, Verdict::Authentic);
    assert_eq!(r.is_authentic, Some(true));
    assert_eq!(r.onchain_exists, Some(true));
    assert_eq!(r.onchain_hash_match, Some(true));
    assert_eq!(r.message, "Authentic (off-chain and on-chain hashes match)");

    let t = s.engine.transfer(s.seller.id, "ABC123", TransferRequest::default())?;
    assert!(t.chain_tx_hash.is_some());
    assert_eq!(s.chain.read_product("ABC123")?.current_owner, SELLER_WALLET);

    let r = s.engine.scan(&ScanRequest::new("ABC123", &h1))?;
    assert_eq!(r.verdict, Verdict::AuthenticStaleQr);
    assert_eq!(r.is_authentic, Some(true));
    assert!(!r.is_original);

    let hist = s.engine.history("ABC123")?;
    assert_eq!(hist.events.len(), 2);
    assert!(hist.events.iter().all(|e| e.chain_tx_hash.is_some()));
    assert!(hist.chain.is_some_and(|c| c.exists));
    Ok(())
}

#[test]
fn tampering_is_detected() -> Result<()> {
    let dir = tempdir()?;
    let db_path = dir.path().join("prov.db");
    let mut s = ledger_engine(&db_path)?;

    let a = s.engine.register(s.maker.id, widget("OFFCHAIN"))?;
    let b = s.engine.register(s.maker.id, widget("ONCHAIN"))?;

    // Off-chain record edited behind the engine's back.
    let raw = rusqlite::Connection::open(&db_path)?;
    raw.execute("UPDATE products SET name='Counterfeit' WHERE product_code='OFFCHAIN'", [])?;
    let r = s
        .engine
        .scan(&ScanRequest::new("OFFCHAIN", &a.product.current_state_hash))?;
    assert_eq!(r.verdict, Verdict::TamperedOffChain);
    assert_eq!(r.is_authentic, Some(false));
    assert!(!r.offchain_hash_match);

    s.chain
        .overwrite_cloud_hash("ONCHAIN", &hash::digest_fixed32("something else"))?;
    let r = s
        .engine
        .scan(&ScanRequest::new("ONCHAIN", &b.product.current_state_hash))?;
    assert_eq!(r.verdict, Verdict::TamperedOnChain);
    assert_eq!(r.onchain_hash_match, Some(false));
    assert_eq!(r.message, "Tampered (on-chain hash mismatch)");
    Ok(())
}

#[test]
fn product_missing_on_chain() -> Result<()> {
    let dir = tempdir()?;
    let db_path = dir.path().join("prov.db");

    let head = {
        let mut offline = Engine::new(Store::open_or_create(&db_path)?, None);
        let maker = offline.add_user(Role::Manufacturer, "early@example.com", None)?;
        offline
            .register(maker.id, widget("LEGACY"))?
            .product
            .current_state_hash
    };

    let s = ledger_engine(&db_path)?;
    let r = s.engine.scan(&ScanRequest::new("LEGACY", &head))?;
    assert_eq!(r.verdict, Verdict::NotRegisteredOnChain);
    assert_eq!(r.onchain_exists, Some(false));
    assert_eq!(r.is_authentic, Some(false));
    Ok(())
}

#[test]
fn unreachable_ledger_never_authenticates() -> Result<()> {
    let dir = tempdir()?;
    let mut s = ledger_engine(&dir.path().join("prov.db"))?;
    let reg = s.engine.register(s.maker.id, widget("ABC123"))?;

    s.chain.set_offline(true);
    let r = s
        .engine
        .scan(&ScanRequest::new("ABC123", &reg.product.current_state_hash))?;
    assert_eq!(r.verdict, Verdict::LedgerUnavailable);
    assert_eq!(r.is_authentic, Some(false));
    assert!(r.is_original);
    assert!(r.chain.is_none());
    assert_eq!(r.events.len(), 1);

    // Writes fail and leave nothing behind.
    let before = s.engine.store().counts()?;
    assert!(s
        .engine
        .transfer(s.seller.id, "ABC123", TransferRequest::default())
        .is_err());
    assert!(s.engine.register(s.maker.id, widget("XYZ789")).is_err());
    assert_eq!(s.engine.store().counts()?, before);
    Ok(())
}

#[test]
fn rejected_transfer_keeps_head() -> Result<()> {
    let dir = tempdir()?;
    let mut s = ledger_engine(&dir.path().join("prov.db"))?;
    let reg = s.engine.register(s.maker.id, widget("ABC123"))?;

    s.engine.revoke_seller(s.maker.id, SELLER_WALLET)?;
    let err = s
        .engine
        .transfer(s.seller.id, "ABC123", TransferRequest::default())
        .unwrap_err();
    assert_eq!(err.status_code(), 500);
    assert_eq!(err.public_message(), "Server error");

    let hist = s.engine.history("ABC123")?;
    assert_eq!(hist.events.len(), 1);
    assert_eq!(hist.product.current_state_hash, reg.product.current_state_hash);
    Ok(())
}

#[test]
fn broken_chain_fails_audit() -> Result<()> {
    let dir = tempdir()?;
    let db_path = dir.path().join("prov.db");
    let mut s = ledger_engine(&db_path)?;
    s.engine.register(s.maker.id, widget("ABC123"))?;
    s.engine
        .transfer(s.seller.id, "ABC123", TransferRequest::default())?;

    let raw = rusqlite::Connection::open(&db_path)?;
    raw.execute_batch(
        "DROP TRIGGER product_events_no_update;
         UPDATE product_events SET prev_state_hash='forged' WHERE event_type='TRANSFER';",
    )?;

    let audit = reconcile::audit_chain(s.engine.store(), "ABC123")?;
    assert!(!audit.ok);
    assert!(audit.problems.iter().any(|p| p.contains("does not link")));
    Ok(())
}

#[test]
fn batch_scan_pack_and_export() -> Result<()> {
    let dir = tempdir()?;
    let mut s = ledger_engine(&dir.path().join("prov.db"))?;
    let reg = s.engine.register(s.maker.id, widget("ABC123"))?;

    let csv_path = dir.path().join("claims.csv");
    std::fs::write(
        &csv_path,
        format!(
            "productId,stateHash\nABC123,{}\n,missing\n",
            reg.product.current_state_hash
        ),
    )?;
    let claims = report::read_scan_csv(&csv_path)?;
    let out_dir = dir.path().join("audit");
    let manifest = report::write_audit_pack(&out_dir, &s.engine, &claims)?;
    assert_eq!(manifest.counts.authentic, 1);
    assert_eq!(manifest.counts.errors, 1);
    assert!(manifest.ledger.is_some_and(|l| l.starts_with("simulated")));

    let export = dir.path().join("backup.json");
    store::export_store_json(s.engine.store(), &export)?;
    let doc: serde_json::Value = serde_json::from_slice(&std::fs::read(&export)?)?;
    assert_eq!(doc["format"], "provchain-store-backup-v1");
    assert_eq!(doc["products"].as_array().map(Vec::len), Some(1));
    Ok(())
}
