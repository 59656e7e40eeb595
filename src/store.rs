//! Relational store: users, products, the append-only product event log,
//! and one QR record per product, in SQLite.

use std::path::Path;
use std::time::Duration;

use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension as _, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::error::{ProvError, Result, ResultExt as _};
use crate::product::{Actor, EventKind, Product, ProductEvent, QrRecord, Role};
use crate::util;

pub const STORE_SCHEMA_VERSION: i64 = 1;

const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS meta(
  k TEXT PRIMARY KEY,
  v TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS users(
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  role TEXT NOT NULL CHECK (role IN ('manufacturer','seller','customer')),
  email TEXT NOT NULL UNIQUE,
  wallet_address TEXT,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS products(
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  product_code TEXT NOT NULL UNIQUE,
  manufacturer_id INTEGER NOT NULL REFERENCES users(id),
  name TEXT NOT NULL,
  batch TEXT,
  meta_json TEXT NOT NULL DEFAULT '{}',
  ipfs_cid TEXT,
  current_state_hash TEXT NOT NULL,
  cloud_hash TEXT,
  nfc_uid_hash TEXT,
  chain_register_tx_hash TEXT,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS product_events(
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  product_id INTEGER NOT NULL REFERENCES products(id),
  event_type TEXT NOT NULL,
  actor_id INTEGER NOT NULL REFERENCES users(id),
  prev_state_hash TEXT,
  new_state_hash TEXT NOT NULL,
  chain_tx_hash TEXT,
  notes TEXT NOT NULL DEFAULT '',
  created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_events_product ON product_events(product_id, id);

CREATE TRIGGER IF NOT EXISTS product_events_no_update
BEFORE UPDATE ON product_events
BEGIN
  SELECT RAISE(ABORT, 'product_events is append-only');
END;

CREATE TRIGGER IF NOT EXISTS product_events_no_delete
BEFORE DELETE ON product_events
BEGIN
  SELECT RAISE(ABORT, 'product_events is append-only');
END;

CREATE TABLE IF NOT EXISTS qr_codes(
  product_id INTEGER PRIMARY KEY REFERENCES products(id),
  qr_payload TEXT NOT NULL,
  last_state_hash TEXT NOT NULL,
  updated_at TEXT NOT NULL
);
"#;

const PRODUCT_COLS: &str = "id, product_code, manufacturer_id, name, batch, meta_json, ipfs_cid, \
     current_state_hash, cloud_hash, nfc_uid_hash, chain_register_tx_hash, created_at";

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreMeta {
    pub store_id: Uuid,
    pub created_at_utc: String,
    pub schema_version: i64,
}

/// Insert shape for a freshly registered product.
#[derive(Debug, Clone)]
pub struct NewProduct<'a> {
    pub product_code: &'a str,
    pub manufacturer_id: i64,
    pub name: &'a str,
    pub batch: Option<&'a str>,
    pub meta_json: &'a serde_json::Value,
    pub ipfs_cid: Option<&'a str>,
    pub current_state_hash: &'a str,
    pub cloud_hash: Option<&'a str>,
    pub nfc_uid_hash: Option<&'a str>,
    pub chain_register_tx_hash: Option<&'a str>,
}

#[derive(Debug, Clone)]
pub struct NewEvent<'a> {
    pub product_id: i64,
    pub kind: EventKind,
    pub actor: &'a Actor,
    pub prev_state_hash: Option<&'a str>,
    pub new_state_hash: &'a str,
    pub chain_tx_hash: Option<&'a str>,
    pub notes: &'a str,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

pub struct Store {
    conn: Connection,
    meta: StoreMeta,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("meta", &self.meta)
            .finish_non_exhaustive()
    }
}

impl Store {
    pub fn create_new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                ProvError::Store(format!("create db parent dir {}: {e}", parent.display()))
            })?;
        }

        let conn = Connection::open(db_path)
            .map_err(|e| ProvError::Store(format!("open db {}: {e}", db_path.display())))?;
        Self::initialize(conn)
    }

    pub fn open_existing(db_path: &Path) -> Result<Self> {
        if !db_path.exists() {
            return Err(ProvError::Store(format!("db {} does not exist", db_path.display())));
        }
        let conn = Connection::open(db_path)
            .map_err(|e| ProvError::Store(format!("open db {}: {e}", db_path.display())))?;
        configure_connection(&conn)?;

        let store_id: String = conn
            .query_row("SELECT v FROM meta WHERE k='store_id'", [], |row| row.get(0))
            .ctx_store("read store_id")?;
        let created_at_utc: String = conn
            .query_row("SELECT v FROM meta WHERE k='created_at_utc'", [], |row| row.get(0))
            .ctx_store("read created_at_utc")?;
        let schema_version: i64 = conn
            .query_row("SELECT v FROM meta WHERE k='schema_version'", [], |row| {
                row.get::<_, String>(0)
            })
            .ctx_store("read schema_version")?
            .parse()
            .ctx_store("parse schema_version")?;

        if schema_version != STORE_SCHEMA_VERSION {
            return Err(ProvError::Store(format!(
                "unsupported schema_version {schema_version} (expected {STORE_SCHEMA_VERSION})"
            )));
        }

        let meta = StoreMeta {
            store_id: Uuid::parse_str(&store_id).ctx_store("parse store_id uuid")?,
            created_at_utc,
            schema_version,
        };
        Ok(Self { conn, meta })
    }

    /// Open the database at `db_path`, creating it on first use.
    pub fn open_or_create(db_path: &Path) -> Result<Self> {
        if db_path.exists() {
            Self::open_existing(db_path)
        } else {
            Self::create_new(db_path)
        }
    }

    /// Private in-memory database (tests, benches).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().ctx_store("open in-memory db")?;
        Self::initialize(conn)
    }

    fn initialize(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL;")
            .ctx_store("set journal mode")?;
        configure_connection(&conn)?;
        conn.execute_batch(SCHEMA_SQL).ctx_store("create tables")?;

        let meta = StoreMeta {
            store_id: Uuid::new_v4(),
            created_at_utc: util::now_utc_rfc3339(),
            schema_version: STORE_SCHEMA_VERSION,
        };
        let rows: [(&str, String); 3] = [
            ("store_id", meta.store_id.to_string()),
            ("created_at_utc", meta.created_at_utc.clone()),
            ("schema_version", meta.schema_version.to_string()),
        ];
        for (k, v) in rows {
            conn.execute("INSERT OR REPLACE INTO meta(k,v) VALUES (?1,?2)", params![k, v])?;
        }

        Ok(Self { conn, meta })
    }

    pub fn meta(&self) -> &StoreMeta {
        &self.meta
    }

    /// Begin a write transaction.  `IMMEDIATE` takes the database write
    /// lock up front, so everything read inside the transaction stays
    /// current until commit.
    pub fn begin_write(&mut self) -> Result<StoreTx<'_>> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .ctx_store("begin tx")?;
        Ok(StoreTx { tx })
    }

    /// Run `f` inside one deferred read transaction, so every query it
    /// makes sees the same committed state.
    pub fn read_snapshot<T>(&self, f: impl FnOnce(&Store) -> Result<T>) -> Result<T> {
        let tx = self
            .conn
            .unchecked_transaction()
            .ctx_store("begin read tx")?;
        let out = f(self)?;
        tx.commit().ctx_store("end read tx")?;
        Ok(out)
    }

    // -- users -------------------------------------------------------------

    pub fn add_user(&self, role: Role, email: &str, wallet_address: Option<&str>) -> Result<Actor> {
        let email = util::require_text(email, "email")?.to_lowercase();
        let created_at = util::now_utc_rfc3339();
        self.conn
            .execute(
                "INSERT INTO users(role, email, wallet_address, created_at) VALUES (?1,?2,?3,?4)",
                params![role.as_str(), email, wallet_address, created_at],
            )
            .map_err(|e| conflict_or(e, || format!("user {email} already exists")))?;
        Ok(Actor {
            id: self.conn.last_insert_rowid(),
            role,
            email,
            wallet_address: wallet_address.map(str::to_string),
            created_at,
        })
    }

    pub fn actor(&self, id: i64) -> Result<Option<Actor>> {
        query_actor(&self.conn, id)
    }

    pub fn set_wallet(&self, actor_id: i64, wallet_address: &str) -> Result<()> {
        let n = self
            .conn
            .execute(
                "UPDATE users SET wallet_address=?1 WHERE id=?2",
                params![wallet_address, actor_id],
            )
            .ctx_store("update wallet")?;
        if n == 0 {
            return Err(ProvError::NotFound(format!("user {actor_id} not found")));
        }
        Ok(())
    }

    // -- products ----------------------------------------------------------

    pub fn product_by_code(&self, code: &str) -> Result<Option<Product>> {
        query_product(&self.conn, code)
    }

    /// Events of one product in append order.
    pub fn events_for(&self, product_id: i64) -> Result<Vec<ProductEvent>> {
        let mut stmt = self
            .conn
            .prepare(
                r#"
                SELECT e.id, e.product_id, e.event_type, e.actor_id, u.role, u.email,
                       e.prev_state_hash, e.new_state_hash, e.chain_tx_hash, e.notes, e.created_at
                FROM product_events e
                LEFT JOIN users u ON u.id = e.actor_id
                WHERE e.product_id = ?1
                ORDER BY e.id ASC
                "#,
            )
            .ctx_store("prepare select events")?;
        let rows = stmt
            .query_map(params![product_id], read_event)
            .ctx_store("query events")?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn qr_for(&self, product_id: i64) -> Result<Option<QrRecord>> {
        query_qr(&self.conn, product_id)
    }

    /// Number of QR rows for a product (always 0 or 1).
    pub fn qr_count(&self, product_id: i64) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM qr_codes WHERE product_id=?1",
                params![product_id],
                |row| row.get(0),
            )
            .ctx_store("count qr rows")
    }

    pub fn product_codes(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT product_code FROM products ORDER BY id ASC")
            .ctx_store("prepare select product codes")?;
        let rows = stmt
            .query_map([], |row| row.get(0))
            .ctx_store("query product codes")?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Row counts `(products, events, qr_codes)`.
    pub fn counts(&self) -> Result<(i64, i64, i64)> {
        self.conn
            .query_row(
                "SELECT (SELECT COUNT(*) FROM products), \
                        (SELECT COUNT(*) FROM product_events), \
                        (SELECT COUNT(*) FROM qr_codes)",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .ctx_store("count rows")
    }
}

// ---------------------------------------------------------------------------
// Write transaction
// ---------------------------------------------------------------------------

/// One atomic lifecycle transition.  Dropping without [`StoreTx::commit`]
/// rolls everything back.
pub struct StoreTx<'a> {
    tx: rusqlite::Transaction<'a>,
}

impl StoreTx<'_> {
    pub fn actor(&self, id: i64) -> Result<Option<Actor>> {
        query_actor(&self.tx, id)
    }

    pub fn product_by_code(&self, code: &str) -> Result<Option<Product>> {
        query_product(&self.tx, code)
    }

    pub fn insert_product(&self, p: NewProduct<'_>) -> Result<Product> {
        let meta_text = serde_json::to_string(p.meta_json).ctx_store("serialize meta_json")?;
        self.tx
            .execute(
                r#"
                INSERT INTO products(
                  product_code, manufacturer_id, name, batch, meta_json, ipfs_cid,
                  current_state_hash, cloud_hash, nfc_uid_hash, chain_register_tx_hash, created_at
                ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)
                "#,
                params![
                    p.product_code,
                    p.manufacturer_id,
                    p.name,
                    p.batch,
                    meta_text,
                    p.ipfs_cid,
                    p.current_state_hash,
                    p.cloud_hash,
                    p.nfc_uid_hash,
                    p.chain_register_tx_hash,
                    util::now_utc_rfc3339(),
                ],
            )
            .map_err(|e| conflict_or(e, || "product_code already exists".to_string()))?;
        query_product(&self.tx, p.product_code)?
            .ok_or_else(|| ProvError::Store("inserted product vanished".into()))
    }

    pub fn insert_event(&self, e: NewEvent<'_>) -> Result<ProductEvent> {
        let created_at = util::now_utc_rfc3339();
        self.tx
            .execute(
                r#"
                INSERT INTO product_events(
                  product_id, event_type, actor_id, prev_state_hash, new_state_hash,
                  chain_tx_hash, notes, created_at
                ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8)
                "#,
                params![
                    e.product_id,
                    e.kind.as_str(),
                    e.actor.id,
                    e.prev_state_hash,
                    e.new_state_hash,
                    e.chain_tx_hash,
                    e.notes,
                    created_at,
                ],
            )
            .ctx_store("insert product event")?;
        Ok(ProductEvent {
            id: self.tx.last_insert_rowid(),
            product_id: e.product_id,
            event_type: e.kind,
            actor_id: e.actor.id,
            actor_role: Some(e.actor.role),
            actor_email: Some(e.actor.email.clone()),
            prev_state_hash: e.prev_state_hash.map(str::to_string),
            new_state_hash: e.new_state_hash.to_string(),
            chain_tx_hash: e.chain_tx_hash.map(str::to_string),
            notes: e.notes.to_string(),
            created_at,
        })
    }

    /// Advance the chain head, failing if it is no longer `expected_prev`.
    pub fn update_head(&self, product_id: i64, expected_prev: &str, new_hash: &str) -> Result<()> {
        let n = self
            .tx
            .execute(
                "UPDATE products SET current_state_hash=?1 WHERE id=?2 AND current_state_hash=?3",
                params![new_hash, product_id, expected_prev],
            )
            .ctx_store("update state head")?;
        if n != 1 {
            return Err(ProvError::Store(format!(
                "state head of product {product_id} moved during transition"
            )));
        }
        Ok(())
    }

    /// Insert or overwrite the single QR row of a product.
    pub fn upsert_qr(&self, product_id: i64, qr_payload: &str, state_hash: &str) -> Result<QrRecord> {
        let updated_at = util::now_utc_rfc3339();
        self.tx
            .execute(
                r#"
                INSERT INTO qr_codes(product_id, qr_payload, last_state_hash, updated_at)
                VALUES (?1,?2,?3,?4)
                ON CONFLICT(product_id) DO UPDATE SET
                  qr_payload=excluded.qr_payload,
                  last_state_hash=excluded.last_state_hash,
                  updated_at=excluded.updated_at
                "#,
                params![product_id, qr_payload, state_hash, updated_at],
            )
            .ctx_store("upsert qr record")?;
        Ok(QrRecord {
            product_id,
            qr_payload: qr_payload.to_string(),
            last_state_hash: state_hash.to_string(),
            updated_at,
        })
    }

    pub fn commit(self) -> Result<()> {
        self.tx.commit().ctx_store("commit tx")
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn query_actor(conn: &Connection, id: i64) -> Result<Option<Actor>> {
    Ok(conn
        .query_row(
            "SELECT id, role, email, wallet_address, created_at FROM users WHERE id=?1",
            params![id],
            |row| {
                Ok(Actor {
                    id: row.get(0)?,
                    role: parse_col(row, 1)?,
                    email: row.get(2)?,
                    wallet_address: row.get(3)?,
                    created_at: row.get(4)?,
                })
            },
        )
        .optional()?)
}

fn query_product(conn: &Connection, code: &str) -> Result<Option<Product>> {
    Ok(conn
        .query_row(
            &format!("SELECT {PRODUCT_COLS} FROM products WHERE product_code=?1"),
            params![code],
            read_product,
        )
        .optional()?)
}

fn query_qr(conn: &Connection, product_id: i64) -> Result<Option<QrRecord>> {
    Ok(conn
        .query_row(
            "SELECT product_id, qr_payload, last_state_hash, updated_at FROM qr_codes WHERE product_id=?1",
            params![product_id],
            |row| {
                Ok(QrRecord {
                    product_id: row.get(0)?,
                    qr_payload: row.get(1)?,
                    last_state_hash: row.get(2)?,
                    updated_at: row.get(3)?,
                })
            },
        )
        .optional()?)
}

fn read_product(row: &Row<'_>) -> rusqlite::Result<Product> {
    let meta_text: String = row.get(5)?;
    let meta_json = serde_json::from_str(&meta_text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e)))?;
    Ok(Product {
        id: row.get(0)?,
        product_code: row.get(1)?,
        manufacturer_id: row.get(2)?,
        name: row.get(3)?,
        batch: row.get(4)?,
        meta_json,
        ipfs_cid: row.get(6)?,
        current_state_hash: row.get(7)?,
        cloud_hash: row.get(8)?,
        nfc_uid_hash: row.get(9)?,
        chain_register_tx_hash: row.get(10)?,
        created_at: row.get(11)?,
    })
}

fn read_event(row: &Row<'_>) -> rusqlite::Result<ProductEvent> {
    let actor_role: Option<String> = row.get(4)?;
    let actor_role = actor_role
        .map(|r| r.parse::<Role>())
        .transpose()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(e)))?;
    Ok(ProductEvent {
        id: row.get(0)?,
        product_id: row.get(1)?,
        event_type: parse_col(row, 2)?,
        actor_id: row.get(3)?,
        actor_role,
        actor_email: row.get(5)?,
        prev_state_hash: row.get(6)?,
        new_state_hash: row.get(7)?,
        chain_tx_hash: row.get(8)?,
        notes: row.get(9)?,
        created_at: row.get(10)?,
    })
}

fn parse_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = ProvError>,
{
    let s: String = row.get(idx)?;
    s.parse()
        .map_err(|e: ProvError| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Unique-constraint violations become [`ProvError::Conflict`].
fn conflict_or(e: rusqlite::Error, msg: impl FnOnce() -> String) -> ProvError {
    match e {
        rusqlite::Error::SqliteFailure(ref f, _) if f.code == ErrorCode::ConstraintViolation => {
            ProvError::Conflict(msg())
        }
        other => ProvError::Database(other),
    }
}

fn configure_connection(conn: &Connection) -> Result<()> {
    conn.execute_batch("PRAGMA foreign_keys=ON;")
        .ctx_store("enable foreign keys")?;
    conn.busy_timeout(BUSY_TIMEOUT).ctx_store("set busy timeout")
}

// ---------------------------------------------------------------------------
// Backup
// ---------------------------------------------------------------------------

/// Export every product with its QR record and full event log to JSON.
pub fn export_store_json(store: &Store, out_path: &Path) -> Result<()> {
    let mut products = Vec::new();
    for code in store.product_codes()? {
        let Some(product) = store.product_by_code(&code)? else {
            continue;
        };
        let qr = store.qr_for(product.id)?;
        let events = store.events_for(product.id)?;
        products.push(serde_json::json!({
            "product": product,
            "qr": qr,
            "events": events,
        }));
    }
    let export = serde_json::json!({
        "format": "provchain-store-backup-v1",
        "exported_at_utc": util::now_utc_rfc3339(),
        "meta": store.meta(),
        "products": products,
    });
    let json = serde_json::to_vec_pretty(&export).ctx_store("serialize store export")?;
    std::fs::write(out_path, json)
        .map_err(|e| ProvError::Store(format!("write export {}: {e}", out_path.display())))?;
    info!(path = %out_path.display(), products = products.len(), "store exported");
    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OptionExt as _;
    use serde_json::json;
    use tempfile::tempdir;

    fn seed_product(store: &mut Store, code: &str) -> (Actor, Product) {
        let m = store
            .add_user(Role::Manufacturer, &format!("m-{code}@example.com"), None)
            .unwrap();
        let tx = store.begin_write().unwrap();
        let p = tx
            .insert_product(NewProduct {
                product_code: code,
                manufacturer_id: m.id,
                name: "Widget",
                batch: None,
                meta_json: &json!({}),
                ipfs_cid: None,
                current_state_hash: "h1",
                cloud_hash: None,
                nfc_uid_hash: None,
                chain_register_tx_hash: None,
            })
            .unwrap();
        tx.commit().unwrap();
        (m, p)
    }

    #[test]
    fn create_and_open_store() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("test.db");
        let store = Store::create_new(&db).unwrap();
        let meta = store.meta().clone();
        drop(store);

        let store2 = Store::open_existing(&db).unwrap();
        assert_eq!(store2.meta().store_id, meta.store_id);
        assert_eq!(store2.meta().schema_version, STORE_SCHEMA_VERSION);
    }

    #[test]
    fn duplicate_email_is_conflict() {
        let store = Store::open_in_memory().unwrap();
        store.add_user(Role::Seller, "s@example.com", None).unwrap();
        let err = store.add_user(Role::Seller, "s@example.com", None).unwrap_err();
        assert!(matches!(err, ProvError::Conflict(_)));
    }

    #[test]
    fn rollback_on_drop() {
        let mut store = Store::open_in_memory().unwrap();
        let m = store.add_user(Role::Manufacturer, "m@example.com", None).unwrap();
        {
            let tx = store.begin_write().unwrap();
            tx.insert_product(NewProduct {
                product_code: "P1",
                manufacturer_id: m.id,
                name: "Widget",
                batch: None,
                meta_json: &json!({}),
                ipfs_cid: None,
                current_state_hash: "h1",
                cloud_hash: None,
                nfc_uid_hash: None,
                chain_register_tx_hash: None,
            })
            .unwrap();
        }
        assert!(store.product_by_code("P1").unwrap().is_none());
    }

    #[test]
    fn qr_upsert_overwrites() {
        let mut store = Store::open_in_memory().unwrap();
        let (_, p) = seed_product(&mut store, "P1");
        let tx = store.begin_write().unwrap();
        tx.upsert_qr(p.id, "a", "h1").unwrap();
        tx.upsert_qr(p.id, "b", "h2").unwrap();
        tx.commit().unwrap();
        assert_eq!(store.qr_count(p.id).unwrap(), 1);
        assert_eq!(store.qr_for(p.id).unwrap().unwrap().last_state_hash, "h2");
    }

    #[test]
    fn head_update_checks_expected_prev() {
        let mut store = Store::open_in_memory().unwrap();
        let (_, p) = seed_product(&mut store, "P1");
        let tx = store.begin_write().unwrap();
        assert!(tx.update_head(p.id, "stale", "h2").is_err());
        tx.update_head(p.id, "h1", "h2").unwrap();
        tx.commit().unwrap();
        assert_eq!(
            store.product_by_code("P1").unwrap().unwrap().current_state_hash,
            "h2"
        );
    }

    #[test]
    fn events_are_append_only() {
        let mut store = Store::open_in_memory().unwrap();
        let (m, p) = seed_product(&mut store, "P1");
        let tx = store.begin_write().unwrap();
        tx.insert_event(NewEvent {
            product_id: p.id,
            kind: EventKind::Register,
            actor: &m,
            prev_state_hash: None,
            new_state_hash: "h1",
            chain_tx_hash: None,
            notes: "Product registered",
        })
        .unwrap();
        tx.commit().unwrap();

        let events = store.events_for(p.id).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].actor_role, Some(Role::Manufacturer));

        assert!(store
            .conn
            .execute("UPDATE product_events SET notes='x'", [])
            .is_err());
        assert!(store.conn.execute("DELETE FROM product_events", []).is_err());
    }

    #[test]
    fn emails_are_case_insensitive() {
        let store = Store::open_in_memory().unwrap();
        let a = store.add_user(Role::Seller, " A@Example.com ", None).unwrap();
        assert_eq!(a.email, "a@example.com");
        let err = store.add_user(Role::Customer, "a@example.COM", None).unwrap_err();
        assert!(matches!(err, ProvError::Conflict(_)));
    }

    #[test]
    fn snapshot_hides_concurrent_commit() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("snap.db");
        let mut writer = Store::create_new(&db).unwrap();
        let (m, p) = seed_product(&mut writer, "P1");
        let reader = Store::open_existing(&db).unwrap();

        let (product, events) = reader
            .read_snapshot(|s| {
                let product = s.product_by_code("P1")?.found("Product not found")?;
                let tx = writer.begin_write()?;
                tx.update_head(p.id, "h1", "h2")?;
                tx.insert_event(NewEvent {
                    product_id: p.id,
                    kind: EventKind::Transfer,
                    actor: &m,
                    prev_state_hash: Some("h1"),
                    new_state_hash: "h2",
                    chain_tx_hash: None,
                    notes: "Transferred/Updated",
                })?;
                tx.commit()?;
                Ok((product, s.events_for(p.id)?))
            })
            .unwrap();
        assert_eq!(product.current_state_hash, "h1");
        assert!(events.is_empty());

        // Outside the snapshot the commit is visible.
        assert_eq!(reader.events_for(p.id).unwrap().len(), 1);
    }

    #[test]
    fn open_existing_rejects_missing_file() {
        let dir = tempdir().unwrap();
        let err = Store::open_existing(&dir.path().join("absent.db")).unwrap_err();
        assert!(matches!(err, ProvError::Store(_)));
    }
}
