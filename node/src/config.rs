// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::crypto::{ChannelSigner, EthMessageSigner};
use crate::ledger::eth::EthLedgerClient;
use crate::CHANNEL_DISPUTE_TIMEOUT;
use anyhow::anyhow;
use ethers::providers::{Http, Middleware, Provider};
use ethers::types::{Address, U256};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DisplayFromStr};
use statechannel_config::Config;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const DEFAULT_MIN_DISPUTE_TIMEOUT: u64 = 8000;
const DEFAULT_MAX_DISPUTE_TIMEOUT: u64 = 20000;
const DEFAULT_OSP_DEPOSIT_MULTIPLIER: u64 = 10;
// 1 ether
const DEFAULT_COLD_BOOTSTRAP_DEPOSIT: u128 = 1_000_000_000_000_000_000;

/// Limits an approver applies to a standard open request for one token.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct StandardDepositPolicy {
    // Max ratio of my deposit over the requester's. Unset means deposits must match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matching_ratio: Option<f64>,
    #[serde_as(as = "DisplayFromStr")]
    pub min_deposit: u128,
    #[serde_as(as = "DisplayFromStr")]
    pub max_deposit: u128,
    // Accepted open deadline window, in blocks from now
    pub min_deadline_delta: u64,
    pub max_deadline_delta: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct StandardPolicyConfig {
    // Token address (zero for ETH) to policy. Tokens not listed are rejected.
    #[serde(default)]
    pub tokens: BTreeMap<Address, StandardDepositPolicy>,
    // Peer OSP address to per-token policy, falls back to `tokens`
    #[serde(default)]
    pub osp_to_osp: BTreeMap<Address, BTreeMap<Address, StandardDepositPolicy>>,
}

#[serde_as]
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ColdBootstrapConfig {
    // Max self deposit per token when the requester deposits nothing
    #[serde_as(as = "BTreeMap<_, DisplayFromStr>")]
    #[serde(default)]
    pub max_self_deposit: BTreeMap<Address, u128>,
    #[serde(default = "default_osp_deposit_multiplier")]
    pub osp_deposit_multiplier: u64,
}

impl Default for ColdBootstrapConfig {
    fn default() -> Self {
        Self {
            max_self_deposit: BTreeMap::new(),
            osp_deposit_multiplier: DEFAULT_OSP_DEPOSIT_MULTIPLIER,
        }
    }
}

impl ColdBootstrapConfig {
    pub fn max_self_deposit_for(&self, token: Address) -> U256 {
        U256::from(
            self.max_self_deposit
                .get(&token)
                .copied()
                .unwrap_or(DEFAULT_COLD_BOOTSTRAP_DEPOSIT),
        )
    }
}

#[serde_as]
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct TcbTokenPolicy {
    // Upper bound of virtual deposits, further capped by on-chain allowance and balance
    #[serde_as(as = "DisplayFromStr")]
    pub capacity: u128,
    #[serde_as(as = "DisplayFromStr")]
    pub safety_margin: u128,
    #[serde_as(as = "DisplayFromStr")]
    pub max_per_client: u128,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct TcbPolicyConfig {
    #[serde(default)]
    pub tokens: BTreeMap<Address, TcbTokenPolicy>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct PolicyConfig {
    pub standard: Option<StandardPolicyConfig>,
    pub cold_bootstrap: ColdBootstrapConfig,
    pub tcb: TcbPolicyConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ChannelNodeConfig {
    // Rpc url of the Ethereum node
    pub eth_rpc_url: String,
    // Hex encoded secp256k1 key of this node
    pub eth_private_key_path: PathBuf,
    pub ledger_address: Address,
    pub wallet_address: Address,
    pub pay_registry_address: Address,
    pub pay_resolver_address: Address,
    // JSON file backing the channel store. In memory if unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_path: Option<PathBuf>,
    #[serde(default)]
    pub is_osp: bool,
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
    #[serde(default = "default_monitor_poll_interval_ms")]
    pub monitor_poll_interval_ms: u64,
    // Blocks to stay behind the head when reading logs
    #[serde(default)]
    pub monitor_block_delay: u64,
    #[serde(default = "default_channel_dispute_timeout")]
    pub channel_dispute_timeout: u64,
    #[serde(default = "default_min_dispute_timeout")]
    pub min_dispute_timeout: u64,
    #[serde(default = "default_max_dispute_timeout")]
    pub max_dispute_timeout: u64,
    // Unset allows every standard open request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub standard_policy: Option<StandardPolicyConfig>,
    #[serde(default)]
    pub cold_bootstrap: ColdBootstrapConfig,
    #[serde(default)]
    pub tcb_policy: TcbPolicyConfig,
    #[serde(default = "default_tx_retry_max_elapsed_secs")]
    pub tx_retry_max_elapsed_secs: u64,
}

fn default_osp_deposit_multiplier() -> u64 {
    DEFAULT_OSP_DEPOSIT_MULTIPLIER
}

fn default_metrics_port() -> u16 {
    9184
}

fn default_monitor_poll_interval_ms() -> u64 {
    2000
}

fn default_channel_dispute_timeout() -> u64 {
    CHANNEL_DISPUTE_TIMEOUT
}

fn default_min_dispute_timeout() -> u64 {
    DEFAULT_MIN_DISPUTE_TIMEOUT
}

fn default_max_dispute_timeout() -> u64 {
    DEFAULT_MAX_DISPUTE_TIMEOUT
}

fn default_tx_retry_max_elapsed_secs() -> u64 {
    60
}

impl Config for ChannelNodeConfig {}

/// Settings every protocol component reads.
#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolConfig {
    pub is_osp: bool,
    pub ledger_address: Address,
    pub wallet_address: Address,
    pub pay_registry_address: Address,
    pub pay_resolver_address: Address,
    pub channel_dispute_timeout: u64,
    pub min_dispute_timeout: u64,
    pub max_dispute_timeout: u64,
    pub tx_retry_max_elapsed: Duration,
}

pub struct ServerConfig {
    pub protocol: ProtocolConfig,
    pub policy: PolicyConfig,
    pub signer: Arc<EthMessageSigner>,
    pub provider: Arc<Provider<Http>>,
    pub ledger: Arc<EthLedgerClient<Http>>,
    pub store_path: Option<PathBuf>,
    pub metrics_port: u16,
    pub monitor_poll_interval: Duration,
    pub monitor_block_delay: u64,
}

impl ChannelNodeConfig {
    pub fn protocol_config(&self) -> ProtocolConfig {
        ProtocolConfig {
            is_osp: self.is_osp,
            ledger_address: self.ledger_address,
            wallet_address: self.wallet_address,
            pay_registry_address: self.pay_registry_address,
            pay_resolver_address: self.pay_resolver_address,
            channel_dispute_timeout: self.channel_dispute_timeout,
            min_dispute_timeout: self.min_dispute_timeout,
            max_dispute_timeout: self.max_dispute_timeout,
            tx_retry_max_elapsed: Duration::from_secs(self.tx_retry_max_elapsed_secs),
        }
    }

    pub fn policy_config(&self) -> PolicyConfig {
        PolicyConfig {
            standard: self.standard_policy.clone(),
            cold_bootstrap: self.cold_bootstrap.clone(),
            tcb: self.tcb_policy.clone(),
        }
    }

    /// Checks static invariants that do not need the network.
    pub fn check(&self) -> anyhow::Result<()> {
        if self.min_dispute_timeout > self.max_dispute_timeout {
            return Err(anyhow!(
                "min-dispute-timeout {} is larger than max-dispute-timeout {}",
                self.min_dispute_timeout,
                self.max_dispute_timeout
            ));
        }
        if self.channel_dispute_timeout < self.min_dispute_timeout
            || self.channel_dispute_timeout > self.max_dispute_timeout
        {
            return Err(anyhow!(
                "channel-dispute-timeout {} is outside [{}, {}]",
                self.channel_dispute_timeout,
                self.min_dispute_timeout,
                self.max_dispute_timeout
            ));
        }
        for (name, addr) in [
            ("ledger-address", self.ledger_address),
            ("wallet-address", self.wallet_address),
            ("pay-registry-address", self.pay_registry_address),
            ("pay-resolver-address", self.pay_resolver_address),
        ] {
            if addr.is_zero() {
                return Err(anyhow!("{} must not be zero", name));
            }
        }
        if let Some(standard) = &self.standard_policy {
            for (token, policy) in &standard.tokens {
                if policy.min_deadline_delta > policy.max_deadline_delta {
                    return Err(anyhow!(
                        "standard policy of token {:?} has an empty deadline window",
                        token
                    ));
                }
            }
        }
        Ok(())
    }

    pub async fn validate(&self) -> anyhow::Result<ServerConfig> {
        info!("Starting config validation");
        self.check()?;

        let signer = Arc::new(EthMessageSigner::from_key_file(
            &self.eth_private_key_path,
        )?);
        let provider = Arc::new(
            Provider::<Http>::try_from(self.eth_rpc_url.as_str())
                .map_err(|e| anyhow!("Invalid eth-rpc-url {}: {}", self.eth_rpc_url, e))?
                .interval(Duration::from_millis(self.monitor_poll_interval_ms)),
        );
        let chain_id = provider
            .get_chainid()
            .await
            .map_err(|e| anyhow!("Failed to get chain id from {}: {}", self.eth_rpc_url, e))?;
        info!(
            "Connected to chain {} as {:?}",
            chain_id,
            signer.address()
        );

        let ledger = Arc::new(EthLedgerClient::new(
            provider.as_ref().clone(),
            signer.wallet().clone(),
            chain_id.as_u64(),
            self.ledger_address,
            self.wallet_address,
            self.pay_registry_address,
            self.pay_resolver_address,
            Duration::from_millis(self.monitor_poll_interval_ms),
        ));

        info!("Config validation complete");
        Ok(ServerConfig {
            protocol: self.protocol_config(),
            policy: self.policy_config(),
            signer,
            provider,
            ledger,
            store_path: self.store_path.clone(),
            metrics_port: self.metrics_port,
            monitor_poll_interval: Duration::from_millis(self.monitor_poll_interval_ms),
            monitor_block_delay: self.monitor_block_delay,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
eth-rpc-url: "http://127.0.0.1:8545"
eth-private-key-path: /tmp/node.key
ledger-address: "0x1111111111111111111111111111111111111111"
wallet-address: "0x2222222222222222222222222222222222222222"
pay-registry-address: "0x3333333333333333333333333333333333333333"
pay-resolver-address: "0x4444444444444444444444444444444444444444"
is-osp: true
standard-policy:
  tokens:
    "0x0000000000000000000000000000000000000000":
      min-deposit: "1"
      max-deposit: "1000000000000000000000"
      min-deadline-delta: 10
      max-deadline-delta: 200
cold-bootstrap:
  max-self-deposit:
    "0x0000000000000000000000000000000000000000": "500"
"#;

    #[test]
    fn test_parse_yaml_with_defaults() {
        let config: ChannelNodeConfig = serde_yaml::from_str(SAMPLE).unwrap();
        assert!(config.is_osp);
        assert_eq!(config.channel_dispute_timeout, CHANNEL_DISPUTE_TIMEOUT);
        assert_eq!(config.min_dispute_timeout, 8000);
        assert_eq!(config.max_dispute_timeout, 20000);
        assert_eq!(config.monitor_block_delay, 0);
        assert!(config.store_path.is_none());
        config.check().unwrap();

        let standard = config.standard_policy.as_ref().unwrap();
        let eth = standard.tokens.get(&Address::zero()).unwrap();
        assert_eq!(eth.matching_ratio, None);
        assert_eq!(eth.max_deposit, 1_000_000_000_000_000_000_000);

        let cold = &config.cold_bootstrap;
        assert_eq!(cold.osp_deposit_multiplier, 10);
        assert_eq!(cold.max_self_deposit_for(Address::zero()), U256::from(500));
        assert_eq!(
            cold.max_self_deposit_for(Address::repeat_byte(9)),
            U256::from(DEFAULT_COLD_BOOTSTRAP_DEPOSIT)
        );

        let protocol = config.protocol_config();
        assert_eq!(protocol.tx_retry_max_elapsed, Duration::from_secs(60));
        assert_eq!(protocol.ledger_address, Address::repeat_byte(0x11));
    }

    #[test]
    fn test_check_rejects_bad_dispute_timeout() {
        let mut config: ChannelNodeConfig = serde_yaml::from_str(SAMPLE).unwrap();
        config.channel_dispute_timeout = 100;
        let err = config.check().unwrap_err();
        assert!(err.to_string().contains("channel-dispute-timeout"));

        let mut config: ChannelNodeConfig = serde_yaml::from_str(SAMPLE).unwrap();
        config.wallet_address = Address::zero();
        assert!(config.check().is_err());
    }

    #[test]
    fn test_config_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.yaml");
        let config: ChannelNodeConfig = serde_yaml::from_str(SAMPLE).unwrap();
        config.save(&path).unwrap();
        assert_eq!(ChannelNodeConfig::load(&path).unwrap(), config);
    }
}
