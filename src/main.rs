use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;

use provchain_core::{
    config::{ChainMode, LoggingConfig, ProvConfig},
    engine::Engine,
    product::{RegisterRequest, Role, TransferRequest},
    reconcile::{self, ScanRequest},
    report,
    store::{self, Store},
    util,
};

// ---------------------------------------------------------------------------
// CLI definition
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "provchain",
    version = util::VERSION,
    about = "Product provenance: chained state hashes reconciled against an on-chain registry"
)]
struct Cli {
    /// Path to the store database (SQLite).
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Path to a TOML config file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override `[chain] mode` (none, simulated, evm).
    #[arg(long, global = true)]
    chain_mode: Option<String>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a new, empty store database.
    InitDb,

    /// Create an actor (manufacturer, seller or customer).
    AddUser {
        #[arg(long)]
        role: String,
        #[arg(long)]
        email: String,
        #[arg(long)]
        wallet: Option<String>,
    },

    /// Link a wallet address to an existing actor.
    LinkWallet {
        #[arg(long)]
        actor: i64,
        #[arg(long)]
        address: String,
    },

    /// Register a product (manufacturer).
    Register {
        #[arg(long)]
        actor: i64,
        #[arg(long)]
        code: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        batch: Option<String>,
        /// Free-form metadata as a JSON object.
        #[arg(long)]
        meta: Option<String>,
        #[arg(long)]
        ipfs_cid: Option<String>,
        #[arg(long)]
        nfc_uid: Option<String>,
    },

    /// Transfer or update a product (seller).
    Transfer {
        #[arg(long)]
        actor: i64,
        #[arg(long)]
        code: String,
        /// Destination wallet; defaults to the seller's linked wallet.
        #[arg(long)]
        to: Option<String>,
        #[arg(long)]
        notes: Option<String>,
        /// Extra event data as a JSON object.
        #[arg(long)]
        extra: Option<String>,
    },

    /// Show a product with its QR record, event history and chain record.
    History {
        #[arg(long)]
        code: String,
    },

    /// Verify a scanned QR claim.
    Scan {
        /// Raw QR payload text, e.g. {"productId":"..","stateHash":".."}.
        #[arg(long, conflicts_with_all = ["code", "state_hash"])]
        qr: Option<String>,
        #[arg(long)]
        code: Option<String>,
        #[arg(long)]
        state_hash: Option<String>,
        #[arg(long)]
        nfc_uid: Option<String>,
    },

    /// Scan every claim in a CSV (productId,stateHash) and write an audit pack.
    BatchScan {
        #[arg(long)]
        csv: PathBuf,
        #[arg(long)]
        out_dir: Option<PathBuf>,
    },

    /// Mark a wallet as a verified seller on the ledger (manufacturer).
    VerifySeller {
        #[arg(long)]
        actor: i64,
        #[arg(long)]
        address: String,
    },

    /// Revoke a seller's verification on the ledger (manufacturer).
    RevokeSeller {
        #[arg(long)]
        actor: i64,
        #[arg(long)]
        address: String,
    },

    /// Check the hash chain of one product, or of every product.
    AuditChain {
        #[arg(long)]
        code: Option<String>,
    },

    /// Export the store to a JSON backup file.
    Export {
        #[arg(long)]
        out: PathBuf,
    },

    /// Print version information.
    Version,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut cfg = ProvConfig::load(cli.config.as_deref()).context("load config")?;
    cfg.apply_env().context("apply environment overrides")?;
    if let Some(db) = cli.db {
        cfg.paths.db = db;
    }
    if let Some(mode) = cli.chain_mode.as_deref() {
        cfg.chain.mode = mode.parse::<ChainMode>()?;
    }

    init_logging(&cfg.logging).context("init logging")?;
    util::validate_path(&cfg.paths.db, "db")?;
    cfg.validate().context("validate config")?;

    match cli.cmd {
        Commands::Version => {
            println!("{}", util::version_string());
        }

        Commands::InitDb => {
            anyhow::ensure!(
                !cfg.paths.db.exists(),
                "database {} already exists",
                cfg.paths.db.display()
            );
            let store = Store::create_new(&cfg.paths.db).context("create store")?;
            info!(store_id = %store.meta().store_id, "store initialized");
            print_json(store.meta())?;
        }

        Commands::AddUser {
            role,
            email,
            wallet,
        } => {
            let engine = open_engine(&cfg)?;
            let role: Role = role.parse()?;
            let actor = engine.add_user(role, &email, wallet.as_deref())?;
            print_json(&actor)?;
        }

        Commands::LinkWallet { actor, address } => {
            let engine = open_engine(&cfg)?;
            print_json(&engine.link_wallet(actor, &address)?)?;
        }

        Commands::Register {
            actor,
            code,
            name,
            batch,
            meta,
            ipfs_cid,
            nfc_uid,
        } => {
            let mut engine = open_engine(&cfg)?;
            let meta_json: Option<serde_json::Value> = meta
                .as_deref()
                .map(serde_json::from_str)
                .transpose()
                .context("parse --meta as JSON")?;
            let out = engine.register(
                actor,
                RegisterRequest {
                    product_code: code,
                    name,
                    batch,
                    meta_json,
                    ipfs_cid,
                    nfc_uid,
                },
            )?;
            print_json(&out)?;
        }

        Commands::Transfer {
            actor,
            code,
            to,
            notes,
            extra,
        } => {
            let mut engine = open_engine(&cfg)?;
            let extra: Option<serde_json::Value> = extra
                .as_deref()
                .map(serde_json::from_str)
                .transpose()
                .context("parse --extra as JSON")?;
            let out = engine.transfer(
                actor,
                &code,
                TransferRequest {
                    to_address: to,
                    notes,
                    extra,
                },
            )?;
            print_json(&out)?;
        }

        Commands::History { code } => {
            let engine = open_engine(&cfg)?;
            print_json(&engine.history(&code)?)?;
        }

        Commands::Scan {
            qr,
            code,
            state_hash,
            nfc_uid,
        } => {
            let engine = open_engine(&cfg)?;
            let mut req = match qr {
                Some(text) => ScanRequest::from_qr(&text)?,
                None => ScanRequest::new(
                    code.as_deref().unwrap_or_default(),
                    state_hash.as_deref().unwrap_or_default(),
                ),
            };
            req.nfc_uid = nfc_uid;
            print_json(&engine.scan(&req)?)?;
        }

        Commands::BatchScan { csv, out_dir } => {
            let engine = open_engine(&cfg)?;
            let claims = report::read_scan_csv(&csv).context("read scan csv")?;
            let out_dir = out_dir.unwrap_or_else(|| cfg.paths.audit_out_dir.clone());
            let manifest = report::write_audit_pack(&out_dir, &engine, &claims)
                .context("write audit pack")?;
            print_json(&manifest)?;
        }

        Commands::VerifySeller { actor, address } => {
            let engine = open_engine(&cfg)?;
            let tx = engine.verify_seller(actor, &address)?;
            print_json(&serde_json::json!({ "seller": address, "chain_tx_hash": tx }))?;
        }

        Commands::RevokeSeller { actor, address } => {
            let engine = open_engine(&cfg)?;
            let tx = engine.revoke_seller(actor, &address)?;
            print_json(&serde_json::json!({ "seller": address, "chain_tx_hash": tx }))?;
        }

        Commands::AuditChain { code } => {
            let engine = open_engine(&cfg)?;
            let audits = match code {
                Some(code) => vec![reconcile::audit_chain(engine.store(), &code)?],
                None => reconcile::audit_all(engine.store())?,
            };
            let failing = audits.iter().filter(|a| !a.ok).count();
            print_json(&audits)?;
            anyhow::ensure!(failing == 0, "{failing} product chain(s) failed the audit");
        }

        Commands::Export { out } => {
            let store = Store::open_existing(&cfg.paths.db).context("open store")?;
            store::export_store_json(&store, &out).context("export store")?;
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn open_engine(cfg: &ProvConfig) -> Result<Engine> {
    Engine::from_config(cfg)
        .with_context(|| format!("open engine on {}", cfg.paths.db.display()))
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("serialize output")?;
    println!("{json}");
    Ok(())
}

/// Logs go to stderr; stdout carries command output.
fn init_logging(cfg: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::prelude::*;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.level));

    let registry = tracing_subscriber::registry().with(filter);

    if cfg.json_console {
        let json_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr);
        registry.with(json_layer).init();
    } else if !cfg.json_log_file.is_empty() {
        let log_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&cfg.json_log_file)
            .with_context(|| format!("open json log file {}", cfg.json_log_file))?;
        let file_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::sync::Mutex::new(log_file));
        let console_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
        registry.with(file_layer).with(console_layer).init();
    } else {
        let console_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
        registry.with(console_layer).init();
    }
    Ok(())
}
