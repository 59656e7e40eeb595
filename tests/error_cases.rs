use anyhow::Result;
use tempfile::tempdir;

use provchain_core::{
    engine::Engine,
    error::{FfiErrorCode, ProvError},
    product::{RegisterRequest, Role, TransferRequest},
    reconcile::ScanRequest,
    report,
    store::Store,
};

fn widget() -> RegisterRequest {
    RegisterRequest {
        product_code: "ABC123".into(),
        name: "Widget".into(),
        ..Default::default()
    }
}

#[test]
fn corrupt_db_rejected() -> Result<()> {
    let dir = tempdir()?;
    let db_path = dir.path().join("corrupt.db");
    std::fs::write(&db_path, b"not-a-sqlite-db")?;

    let err = Store::open_existing(&db_path).unwrap_err();
    assert!(matches!(err, ProvError::Store(_) | ProvError::Database(_)));
    Ok(())
}

#[test]
fn rejected_operations_do_not_mutate() -> Result<()> {
    let mut engine = Engine::new(Store::open_in_memory()?, None);
    let maker = engine.add_user(Role::Manufacturer, "maker@example.com", None)?;
    let seller = engine.add_user(Role::Seller, "seller@example.com", None)?;
    let customer = engine.add_user(Role::Customer, "customer@example.com", None)?;

    let err = engine.register(customer.id, widget()).unwrap_err();
    assert_eq!(err.status_code(), 403);

    let mut no_code = widget();
    no_code.product_code = String::new();
    let err = engine.register(maker.id, no_code).unwrap_err();
    assert_eq!(err.status_code(), 400);
    assert!(err.to_string().contains("Missing product_code"));
    assert_eq!(engine.store().counts()?, (0, 0, 0));

    let reg = engine.register(maker.id, widget())?;
    let err = engine.register(maker.id, widget()).unwrap_err();
    assert_eq!(err.status_code(), 409);
    assert_eq!(FfiErrorCode::from(&err), FfiErrorCode::Conflict);

    let err = engine
        .transfer(maker.id, "ABC123", TransferRequest::default())
        .unwrap_err();
    assert_eq!(err.status_code(), 403);
    let err = engine
        .transfer(seller.id, "MISSING", TransferRequest::default())
        .unwrap_err();
    assert_eq!(err.status_code(), 404);
    assert!(err.to_string().contains("Product not found"));

    let hist = engine.history("ABC123")?;
    assert_eq!(hist.events.len(), 1);
    assert_eq!(hist.product.current_state_hash, reg.product.current_state_hash);
    assert_eq!(engine.store().counts()?, (1, 1, 1));
    Ok(())
}

#[test]
fn unknown_actor_is_forbidden() -> Result<()> {
    let mut engine = Engine::new(Store::open_in_memory()?, None);
    let err = engine.register(42, widget()).unwrap_err();
    assert_eq!(err.status_code(), 403);
    Ok(())
}

#[test]
fn scan_validation() -> Result<()> {
    let engine = Engine::new(Store::open_in_memory()?, None);
    let err = engine.scan(&ScanRequest::new("ABC123", "  ")).unwrap_err();
    assert_eq!(err.status_code(), 400);
    let err = engine.scan(&ScanRequest::new("ABC123", "abc")).unwrap_err();
    assert_eq!(err.status_code(), 404);
    assert!(engine.history("ABC123").is_err());
    Ok(())
}

#[test]
fn invalid_csv_header_rejected() -> Result<()> {
    let dir = tempdir()?;
    let csv_path = dir.path().join("bad.csv");
    std::fs::write(&csv_path, "bad_header\nvalue\n")?;
    let err = report::read_scan_csv(&csv_path).unwrap_err();
    assert!(err.to_string().contains("productId"));
    Ok(())
}

#[test]
fn seller_admin_without_ledger() -> Result<()> {
    let engine = Engine::new(Store::open_in_memory()?, None);
    let maker = engine.add_user(Role::Manufacturer, "maker@example.com", None)?;
    let err = engine
        .verify_seller(maker.id, "0x00000000000000000000000000000000000000b2")
        .unwrap_err();
    assert!(matches!(err, ProvError::Config(_)));
    Ok(())
}
