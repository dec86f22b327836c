// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::encoding::ChannelMessageEncoding;
use crate::error::{ChannelError, ChannelResult};
use crate::types::{ChannelId, ChannelInitializer, ConditionalPay, PayId};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, Bytes, Signature, TxHash, H256, U256};
use ethers::utils::{hash_message, keccak256};
use sha3::{Digest, Sha3_256};
use std::path::Path;
use std::str::FromStr;
use tap::TapFallible;

/// Signs serialized channel messages with the node's on-chain key.
pub trait ChannelSigner: Send + Sync {
    fn address(&self) -> Address;

    /// Returns a 65-byte Ethereum personal-message signature over `data`.
    fn sign(&self, data: &[u8]) -> ChannelResult<Bytes>;
}

#[derive(Clone, Debug)]
pub struct EthMessageSigner {
    wallet: LocalWallet,
}

impl EthMessageSigner {
    pub fn new(wallet: LocalWallet) -> Self {
        Self { wallet }
    }

    /// Reads a hex encoded secp256k1 private key, with or without `0x`.
    pub fn from_key_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            anyhow::anyhow!("Failed to read private key file {}: {}", path.display(), e)
        })?;
        let wallet = LocalWallet::from_str(content.trim())
            .map_err(|e| anyhow::anyhow!("Invalid private key in {}: {}", path.display(), e))?;
        Ok(Self { wallet })
    }

    pub fn wallet(&self) -> &LocalWallet {
        &self.wallet
    }
}

impl ChannelSigner for EthMessageSigner {
    fn address(&self) -> Address {
        self.wallet.address()
    }

    fn sign(&self, data: &[u8]) -> ChannelResult<Bytes> {
        let signature = self
            .wallet
            .sign_hash(hash_message(data))
            .map_err(|e| ChannelError::Internal(format!("signing failed: {}", e)))
            .tap_err(|e| tracing::error!("{}", e))?;
        Ok(Bytes::from(signature.to_vec()))
    }
}

pub fn recover_signer(data: &[u8], sig: &[u8]) -> ChannelResult<Address> {
    let signature = Signature::try_from(sig).map_err(|_| ChannelError::InvalidSignature)?;
    signature
        .recover(hash_message(data))
        .map_err(|_| ChannelError::InvalidSignature)
}

pub fn sig_is_valid(signer: Address, data: &[u8], sig: &[u8]) -> bool {
    matches!(recover_signer(data, sig), Ok(addr) if addr == signer)
}

/// `keccak256(wallet ++ ledger ++ keccak256(initializer))`, the same packing the
/// ledger contract uses when it creates the channel.
pub fn compute_channel_id(
    wallet: Address,
    ledger: Address,
    initializer: &ChannelInitializer,
) -> ChannelId {
    let nonce = keccak256(initializer.as_bytes());
    let mut packed = Vec::with_capacity(20 + 20 + 32);
    packed.extend_from_slice(wallet.as_bytes());
    packed.extend_from_slice(ledger.as_bytes());
    packed.extend_from_slice(&nonce);
    H256::from(keccak256(packed))
}

/// `keccak256(keccak256(pay) ++ resolver)`
pub fn compute_pay_id(pay: &ConditionalPay, pay_resolver: Address) -> PayId {
    let mut packed = keccak256(pay.as_bytes()).to_vec();
    packed.extend_from_slice(pay_resolver.as_bytes());
    H256::from(keccak256(packed))
}

/// Dedup key of a cooperative withdraw: `sha3_256(ledger ++ cid ++ seq_le)`.
pub fn withdraw_hash(ledger: Address, cid: ChannelId, seq_num: u64) -> String {
    let mut hasher = Sha3_256::new();
    hasher.update(ledger.as_bytes());
    hasher.update(cid.as_bytes());
    hasher.update(seq_num.to_le_bytes());
    hex::encode(hasher.finalize())
}

pub fn deposit_job_id(cid: ChannelId, amount: U256, first_tx: TxHash) -> String {
    let mut amount_bytes = [0u8; 32];
    amount.to_big_endian(&mut amount_bytes);
    let mut packed = cid.as_bytes().to_vec();
    packed.extend_from_slice(&amount_bytes);
    packed.extend_from_slice(first_tx.as_bytes());
    hex::encode(keccak256(packed))
}

/// Hash a hash lock commits to.
pub fn hash_lock_of(preimage: &[u8]) -> H256 {
    H256::from(keccak256(preimage))
}
