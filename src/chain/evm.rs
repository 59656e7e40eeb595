//! EVM registry contract adapter (feature `evm`).
//!
//! Each call runs on a private current-thread tokio runtime so the
//! synchronous [`ChainLedger`] contract holds: writes return only once the
//! receipt is available.

use std::str::FromStr;

use alloy::network::{EthereumWallet, ReceiptResponse as _};
use alloy::primitives::{Address, FixedBytes};
use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use alloy::signers::local::PrivateKeySigner;
use alloy::sol;
use alloy::transports::http::reqwest::Url;
use secrecy::{ExposeSecret as _, SecretString};
use tokio::runtime::Runtime;
use tracing::info;

use super::{ChainLedger, ChainProduct, TxRef};
use crate::error::{ProvError, Result, ResultExt as _};

sol! {
    #[sol(rpc)]
    interface IProductRegistry {
        function verifySeller(address seller) external;
        function revokeSeller(address seller) external;
        function registerProduct(string productCode, bytes32 cloudHash, bytes32 nfcUidHash) external;
        function transferProduct(string productCode, address to) external;
        function getProduct(string productCode) external view returns (
            bool exists,
            address manufacturer,
            address currentOwner,
            bytes32 cloudHash,
            bytes32 nfcUidHash
        );
    }
}

type Registry = IProductRegistry::IProductRegistryInstance<DynProvider>;

pub struct EvmChain {
    runtime: Runtime,
    contract: Registry,
    operator: Address,
}

impl std::fmt::Debug for EvmChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvmChain")
            .field("contract", self.contract.address())
            .field("operator", &self.operator)
            .finish_non_exhaustive()
    }
}

impl EvmChain {
    pub fn connect(rpc_url: &str, contract_address: &str, private_key: &SecretString) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .ctx_chain("start chain runtime")?;

        // Keep key material out of error strings.
        let signer = PrivateKeySigner::from_str(private_key.expose_secret())
            .map_err(|_| ProvError::Config("chain private key is not a valid secp256k1 key".into()))?;
        let operator = signer.address();
        let address = Address::from_str(contract_address.trim())
            .ctx_config("parse contract address")?;
        let url: Url = rpc_url.trim().parse().ctx_config("parse rpc url")?;

        let provider = ProviderBuilder::new()
            .wallet(EthereumWallet::from(signer))
            .connect_http(url)
            .erased();
        let contract = IProductRegistry::new(address, provider);

        info!(contract = %address, operator = %operator, "EVM registry adapter ready");
        Ok(Self {
            runtime,
            contract,
            operator,
        })
    }
}

fn parse_fixed32(s: &str) -> Result<FixedBytes<32>> {
    FixedBytes::<32>::from_str(s.trim()).ctx_chain("parse bytes32")
}

fn parse_address(s: &str) -> Result<Address> {
    Address::from_str(s.trim())
        .map_err(|e| ProvError::Validation(format!("invalid address '{s}': {e}")))
}

fn fixed32_hex(b: &FixedBytes<32>) -> String {
    format!("0x{}", hex::encode(b.as_slice()))
}

/// Await the receipt and turn a reverted transaction into an error.
macro_rules! confirm {
    ($self:ident, $what:literal, $call:expr) => {{
        $self.runtime.block_on(async {
            let pending = $call.send().await.ctx_chain(concat!("send ", $what))?;
            let receipt = pending
                .get_receipt()
                .await
                .ctx_chain(concat!("await receipt for ", $what))?;
            let tx = receipt.transaction_hash;
            if !receipt.status() {
                return Err(ProvError::Chain(format!(
                    "{} reverted on-chain (tx {tx:#x})",
                    $what
                )));
            }
            Ok::<TxRef, ProvError>(format!("{tx:#x}"))
        })
    }};
}

impl ChainLedger for EvmChain {
    fn submit_registration(
        &self,
        product_code: &str,
        cloud_hash_fixed32: &str,
        secondary_hash_fixed32: &str,
    ) -> Result<TxRef> {
        let cloud = parse_fixed32(cloud_hash_fixed32)?;
        let secondary = parse_fixed32(secondary_hash_fixed32)?;
        confirm!(
            self,
            "registerProduct",
            self.contract
                .registerProduct(product_code.to_string(), cloud, secondary)
        )
    }

    fn submit_transfer(&self, product_code: &str, new_owner: &str) -> Result<TxRef> {
        let to = parse_address(new_owner)?;
        confirm!(
            self,
            "transferProduct",
            self.contract.transferProduct(product_code.to_string(), to)
        )
    }

    fn read_product(&self, product_code: &str) -> Result<ChainProduct> {
        let r = self.runtime.block_on(async {
            self.contract
                .getProduct(product_code.to_string())
                .call()
                .await
                .ctx_chain("call getProduct")
        })?;
        Ok(ChainProduct {
            exists: r.exists,
            manufacturer: r.manufacturer.to_string(),
            current_owner: r.currentOwner.to_string(),
            cloud_hash: fixed32_hex(&r.cloudHash),
            secondary_hash: fixed32_hex(&r.nfcUidHash),
        })
    }

    fn verify_seller(&self, seller: &str) -> Result<TxRef> {
        let seller = parse_address(seller)?;
        confirm!(self, "verifySeller", self.contract.verifySeller(seller))
    }

    fn revoke_seller(&self, seller: &str) -> Result<TxRef> {
        let seller = parse_address(seller)?;
        confirm!(self, "revokeSeller", self.contract.revokeSeller(seller))
    }

    fn describe(&self) -> String {
        format!("evm(contract={})", self.contract.address())
    }
}
