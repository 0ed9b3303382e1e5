//! Worker configuration, loaded from the environment.
//!
//! Wires up `DATABASE_URL` / `REDIS_URL` and friends at boot: fail fast
//! with a descriptive error if a required setting is missing rather than
//! defaulting silently.

use std::collections::HashMap;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Per-token settlement configuration: on-chain address and decimals.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenConfig {
    pub address: String,
    pub decimals: u32,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Postgres connection string for the order/trade store.
    pub database_url: String,
    /// Redis connection string backing the durable order queue and the
    /// market-data pub/sub fan-out.
    pub redis_url: String,

    /// Chain RPC endpoint the settlement client submits transactions to.
    pub rpc_url: String,
    /// Address of the deployed `Settlement` contract.
    pub settlement_contract_address: String,
    /// Operator private key used to sign settlement transactions.
    pub backend_wallet_private_key: String,
    /// `BASE/QUOTE` token symbol -> on-chain address + decimals.
    pub token_map: HashMap<String, TokenConfig>,

    /// Trading symbols the engine maintains order books for.
    pub trading_pairs: Vec<String>,

    /// Consumer group name used on the order stream.
    pub consumer_group: String,
    /// Consumer name within the group (must be unique per worker instance).
    pub consumer_name: String,
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let settings = config::Config::builder()
            .add_source(config::Environment::default().separator("__"))
            .build()
            .context("failed to build configuration from environment")?;

        let database_url = env_required("DATABASE_URL")?;
        let redis_url = env_required("REDIS_URL")?;
        let rpc_url = env_required("SEPOLIA_RPC_URL")?;
        let settlement_contract_address = env_required("SETTLEMENT_CONTRACT_ADDRESS")?;
        let backend_wallet_private_key = env_required("BACKEND_WALLET_PRIVATE_KEY")?;

        let token_map: HashMap<String, TokenConfig> = settings
            .get("token_map")
            .context("TOKEN_MAP must be set to a JSON object of {SYMBOL: {address, decimals}}")?;

        let trading_pairs: Vec<String> = std::env::var("TRADING_PAIRS")
            .unwrap_or_else(|_| "BTC/USDT,ETH/USDT".to_string())
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();

        let consumer_group =
            std::env::var("QUEUE_CONSUMER_GROUP").unwrap_or_else(|_| "matching-workers".into());
        let consumer_name = std::env::var("QUEUE_CONSUMER_NAME")
            .unwrap_or_else(|_| format!("worker-{}", uuid::Uuid::new_v4()));

        Ok(Self {
            database_url,
            redis_url,
            rpc_url,
            settlement_contract_address,
            backend_wallet_private_key,
            token_map,
            trading_pairs,
            consumer_group,
            consumer_name,
        })
    }

    /// Resolve the on-chain token address and decimals for one half of a
    /// `BASE/QUOTE` symbol.
    pub fn token(&self, symbol: &str) -> Option<&TokenConfig> {
        self.token_map.get(symbol)
    }
}

fn env_required(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("missing required environment variable {key}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_lookup_is_case_sensitive_on_symbol_key() {
        let mut token_map = HashMap::new();
        token_map.insert(
            "BTC".to_string(),
            TokenConfig {
                address: "0xabc".to_string(),
                decimals: 8,
            },
        );
        let config = AppConfig {
            database_url: String::new(),
            redis_url: String::new(),
            rpc_url: String::new(),
            settlement_contract_address: String::new(),
            backend_wallet_private_key: String::new(),
            token_map,
            trading_pairs: vec!["BTC/USDT".to_string()],
            consumer_group: "g".to_string(),
            consumer_name: "c".to_string(),
        };

        assert!(config.token("BTC").is_some());
        assert!(config.token("btc").is_none());
    }
}
