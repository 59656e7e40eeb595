//! Product provenance engine.
//!
//! Physical products are authenticated by a per-product chain of state
//! hashes: every lifecycle event (manufacturer registration, seller
//! transfer) derives a new hash from the previous one, and the latest hash
//! is printed in the product's QR code.  A scan compares the claimed hash
//! with the current head and, when a ledger is configured, cross-checks
//! the canonical product data hash against the on-chain registry record.
//!
//! This crate provides:
//! - Canonical JSON and SHA-256 hashing (`canonical`, `hash`)
//! - A SQLite store with an append-only event log (`store`)
//! - The ledger capability trait with a simulated and an EVM backend (`chain`)
//! - The lifecycle operations (`engine`) and scan verdicts (`reconcile`)
//! - Batch-scan audit packs (`report`)
//! - C-ABI FFI exports for native callers (`ffi`)
//!
//! The CLI wrapper lives in `src/main.rs`.

#![deny(unsafe_code)]

pub mod error;
pub mod config;

pub mod canonical;
pub mod chain;
pub mod engine;
pub mod hash;
pub mod product;
pub mod reconcile;
pub mod report;
pub mod store;
pub mod util;

#[allow(unsafe_code)]
pub mod ffi;
