//! On-chain trade settlement.
//!
//! Submits a `settleTrade(tokenSold, tokenBought, seller, buyer,
//! amountSold, amountBought)` call to the configured `Settlement`
//! contract for every fill the engine produces. Failure here never
//! unwinds the match: the caller records the trade with `tx_hash = None`
//! and moves on.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use ethers::abi::Abi;
use ethers::contract::Contract;
use ethers::middleware::SignerMiddleware;
use ethers::providers::{Http, Middleware, Provider};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, U256};
use rust_decimal::Decimal;

use crate::config::AppConfig;
use crate::errors::SettlementError;

/// Narrow seam between the engine and the chain client, so the matching
/// loop's tests can run against a fake that never opens a connection.
#[async_trait]
pub trait Settlement: Send + Sync {
    async fn settle(&self, leg: &TradeLeg, config: &AppConfig) -> Result<String, SettlementError>;
}

const SETTLEMENT_ABI: &str = r#"[
    {
        "type": "function",
        "name": "settleTrade",
        "stateMutability": "nonpayable",
        "inputs": [
            { "name": "tokenSold", "type": "address" },
            { "name": "tokenBought", "type": "address" },
            { "name": "seller", "type": "address" },
            { "name": "buyer", "type": "address" },
            { "name": "amountSold", "type": "uint256" },
            { "name": "amountBought", "type": "uint256" }
        ],
        "outputs": []
    }
]"#;

pub type SettlementMiddleware = SignerMiddleware<Provider<Http>, LocalWallet>;

/// One leg of a matched trade, already resolved to on-chain terms.
pub struct TradeLeg {
    pub base_symbol: String,
    pub quote_symbol: String,
    pub seller: String,
    pub buyer: String,
    /// Quantity of the base asset the seller gave up.
    pub amount_sold: Decimal,
    /// Quantity of the quote asset the buyer paid.
    pub amount_bought: Decimal,
}

/// Submits settlement transactions for matched trades.
pub struct SettlementClient {
    contract: Contract<SettlementMiddleware>,
    client: Arc<SettlementMiddleware>,
}

impl SettlementClient {
    pub async fn connect(config: &AppConfig) -> Result<Self, SettlementError> {
        let provider = Provider::<Http>::try_from(config.rpc_url.as_str())
            .map_err(|e| SettlementError::Submission(e.to_string()))?;

        let wallet: LocalWallet = config
            .backend_wallet_private_key
            .parse()
            .map_err(|e: ethers::signers::WalletError| SettlementError::Signing(e.to_string()))?;

        let chain_id = provider
            .get_chainid()
            .await
            .map_err(|e| SettlementError::NonceFetch(e.to_string()))?
            .as_u64();
        let wallet = wallet.with_chain_id(chain_id);

        let client = Arc::new(SignerMiddleware::new(provider, wallet));

        let contract_address: Address = config
            .settlement_contract_address
            .parse()
            .map_err(|_| SettlementError::Submission("invalid settlement contract address".into()))?;
        let abi: Abi =
            serde_json::from_str(SETTLEMENT_ABI).expect("settlement ABI literal is valid JSON");
        let contract = Contract::new(contract_address, abi, client.clone());

        Ok(Self { contract, client })
    }

    fn resolve_token_address(&self, symbol: &str, config: &AppConfig) -> Result<Address, SettlementError> {
        let token = config
            .token(symbol)
            .ok_or_else(|| SettlementError::UnknownToken(symbol.to_string()))?;
        Address::from_str(&token.address)
            .map_err(|_| SettlementError::UnknownToken(symbol.to_string()))
    }

    fn token_decimals(&self, symbol: &str, config: &AppConfig) -> Result<u32, SettlementError> {
        config
            .token(symbol)
            .map(|t| t.decimals)
            .ok_or_else(|| SettlementError::UnknownToken(symbol.to_string()))
    }
}

#[async_trait]
impl Settlement for SettlementClient {
    /// Submit one settlement transaction and wait for it to be accepted
    /// into the mempool (not mined — only requires the node to
    /// accept the transaction before a `tx_hash` is recorded, §4.2).
    async fn settle(&self, leg: &TradeLeg, config: &AppConfig) -> Result<String, SettlementError> {
        let token_sold = self.resolve_token_address(&leg.base_symbol, config)?;
        let token_bought = self.resolve_token_address(&leg.quote_symbol, config)?;

        let seller: Address = leg
            .seller
            .parse()
            .map_err(|_| SettlementError::Submission(format!("invalid seller address: {}", leg.seller)))?;
        let buyer: Address = leg
            .buyer
            .parse()
            .map_err(|_| SettlementError::Submission(format!("invalid buyer address: {}", leg.buyer)))?;

        let sold_decimals = self.token_decimals(&leg.base_symbol, config)?;
        let bought_decimals = self.token_decimals(&leg.quote_symbol, config)?;
        let amount_sold = to_wei(leg.amount_sold, sold_decimals)?;
        let amount_bought = to_wei(leg.amount_bought, bought_decimals)?;

        let nonce = self
            .client
            .get_transaction_count(self.client.address(), None)
            .await
            .map_err(|e| SettlementError::NonceFetch(e.to_string()))?;
        let gas_price = self
            .client
            .get_gas_price()
            .await
            .map_err(|e| SettlementError::NonceFetch(e.to_string()))?;

        let call = self
            .contract
            .method::<_, ()>(
                "settleTrade",
                (token_sold, token_bought, seller, buyer, amount_sold, amount_bought),
            )
            .map_err(|e| SettlementError::Submission(e.to_string()))?
            .nonce(nonce)
            .gas(U256::from(200_000))
            .gas_price(gas_price);

        let pending = call
            .send()
            .await
            .map_err(|e| SettlementError::Submission(e.to_string()))?;

        Ok(format!("{:?}", pending.tx_hash()))
    }
}

/// Scale a decimal quantity to the smallest on-chain unit for a token with
/// `decimals` precision. Unlike the reference worker, which assumed 18
/// decimals (`w3.to_wei(..., 'ether')`) for every token, this reads the
/// per-token decimals from config instead.
fn to_wei(amount: Decimal, decimals: u32) -> Result<U256, SettlementError> {
    let scaled = amount * Decimal::from(10u64.pow(decimals));
    let scaled = scaled.trunc();
    U256::from_str(&scaled.to_string())
        .map_err(|e| SettlementError::Submission(format!("amount out of range: {e}")))
}

/// Settlement double for engine tests: always fails, matching the policy
/// a chain node being unreachable would produce, without needing a live
/// RPC endpoint.
#[cfg(test)]
pub struct FailingSettlement;

#[cfg(test)]
#[async_trait]
impl Settlement for FailingSettlement {
    async fn settle(&self, _leg: &TradeLeg, _config: &AppConfig) -> Result<String, SettlementError> {
        Err(SettlementError::Submission("no chain endpoint in test".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn to_wei_scales_by_token_decimals() {
        assert_eq!(to_wei(dec!(1), 18).unwrap(), U256::from(10).pow(U256::from(18)));
        assert_eq!(to_wei(dec!(1), 6).unwrap(), U256::from(1_000_000));
    }

    #[test]
    fn to_wei_truncates_sub_unit_precision() {
        // 8 decimals of precision into a 6-decimal token: the extra
        // precision is simply dropped, matching integer settlement math.
        assert_eq!(to_wei(dec!(1.123456789), 6).unwrap(), U256::from(1_123_456));
    }
}
