// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Transactional channel store.
//!
//! Every mutation runs through [`ChannelStore::transactional`]: the closure works on a
//! private copy of the state, which replaces the live state (and the backing file, if
//! any) only when the closure returns `Ok`. Side effects the closure wants to trigger
//! are queued as [`TxEffect`]s and handed back to the caller after commit.

use crate::error::{ChannelError, ChannelResult};
use crate::types::{
    ChannelId, ChannelRow, ChannelState, ConditionalPay, CooperativeWithdrawJob, DepositJob,
    PayId, PayRecord, TokenInfo, TxEffect,
};
use ethers::types::{Address, Bytes, H256, U256};
use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use std::collections::{BTreeSet, HashMap};
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tap::TapFallible;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

/// Open request bookkeeping for one (peer, token) pair, in unix millis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenChannelTs {
    pub request_ts: u64,
    pub finish_ts: Option<u64>,
}

/// A virtual deposit promised to a trust-opened channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcbCommitment {
    pub token: TokenInfo,
    pub amount: U256,
}

#[serde_as]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreState {
    #[serde_as(as = "Vec<(_, _)>")]
    pub channels: HashMap<ChannelId, ChannelRow>,
    #[serde_as(as = "Vec<(_, _)>")]
    pub closed_channels: HashMap<ChannelId, ChannelRow>,
    #[serde_as(as = "Vec<(_, _)>")]
    cid_by_peer_token: HashMap<(Address, TokenInfo), ChannelId>,
    #[serde_as(as = "Vec<(_, _)>")]
    pub pays: HashMap<PayId, PayRecord>,
    // hash lock -> preimage
    #[serde_as(as = "Vec<(_, _)>")]
    pub secrets: HashMap<H256, Bytes>,
    pub deposit_jobs: HashMap<String, DepositJob>,
    pub withdraw_jobs: HashMap<String, CooperativeWithdrawJob>,
    monitor_bits: BTreeSet<String>,
    monitor_cursors: HashMap<String, u64>,
    #[serde_as(as = "Vec<(_, _)>")]
    open_channel_ts: HashMap<(Address, TokenInfo), OpenChannelTs>,
    #[serde_as(as = "Vec<(_, _)>")]
    tcb_commitments: HashMap<ChannelId, TcbCommitment>,
}

impl StoreState {
    pub fn channel(&self, cid: &ChannelId) -> ChannelResult<&ChannelRow> {
        self.channels
            .get(cid)
            .ok_or(ChannelError::ChannelNotFound(*cid))
    }

    pub fn channel_mut(&mut self, cid: &ChannelId) -> ChannelResult<&mut ChannelRow> {
        self.channels
            .get_mut(cid)
            .ok_or(ChannelError::ChannelNotFound(*cid))
    }

    pub fn has_channel(&self, cid: &ChannelId) -> bool {
        self.channels.contains_key(cid)
    }

    pub fn channel_state(&self, cid: &ChannelId) -> ChannelState {
        self.channels
            .get(cid)
            .map(|row| row.state)
            .unwrap_or(ChannelState::Null)
    }

    pub fn cid_by_peer_token(&self, peer: Address, token: TokenInfo) -> Option<ChannelId> {
        self.cid_by_peer_token.get(&(peer, token)).copied()
    }

    pub fn channels_with_peer(&self, peer: Address) -> impl Iterator<Item = &ChannelRow> {
        self.channels.values().filter(move |row| row.peer == peer)
    }

    /// Inserts a live channel, keeping at most one per (peer, token).
    pub fn insert_channel(&mut self, row: ChannelRow) -> ChannelResult<()> {
        if self.channels.contains_key(&row.cid) {
            return Err(ChannelError::ChannelAlreadyExists(row.cid));
        }
        if let Some(existing) = self.cid_by_peer_token(row.peer, row.token) {
            if self.channels.contains_key(&existing) {
                return Err(ChannelError::ChannelAlreadyExists(existing));
            }
        }
        self.cid_by_peer_token.insert((row.peer, row.token), row.cid);
        self.channels.insert(row.cid, row);
        Ok(())
    }

    /// Moves a live channel to the closed archive.
    pub fn close_channel(&mut self, cid: &ChannelId) -> ChannelResult<ChannelRow> {
        let mut row = self
            .channels
            .remove(cid)
            .ok_or(ChannelError::ChannelNotFound(*cid))?;
        row.state = ChannelState::Closed;
        if self.cid_by_peer_token(row.peer, row.token) == Some(*cid) {
            self.cid_by_peer_token.remove(&(row.peer, row.token));
        }
        self.tcb_commitments.remove(cid);
        self.closed_channels.insert(*cid, row.clone());
        Ok(row)
    }

    pub fn put_pay(&mut self, pay_id: PayId, record: PayRecord) {
        self.pays.insert(pay_id, record);
    }

    pub fn pay(&self, pay_id: &PayId) -> Option<&PayRecord> {
        self.pays.get(pay_id)
    }

    /// Known pays among `ids`, in order. Unknown ids are skipped.
    pub fn pays_of(&self, ids: &[PayId]) -> Vec<ConditionalPay> {
        ids.iter()
            .filter_map(|id| self.pays.get(id).map(|record| record.pay.clone()))
            .collect()
    }

    pub fn put_secret(&mut self, hash: H256, preimage: Bytes) {
        self.secrets.insert(hash, preimage);
    }

    pub fn secret(&self, hash: &H256) -> Option<&Bytes> {
        self.secrets.get(hash)
    }

    pub fn open_channel_ts(&self, peer: Address, token: TokenInfo) -> Option<OpenChannelTs> {
        self.open_channel_ts.get(&(peer, token)).copied()
    }

    pub fn put_open_channel_ts(&mut self, peer: Address, token: TokenInfo, ts: OpenChannelTs) {
        self.open_channel_ts.insert((peer, token), ts);
    }

    pub fn delete_open_channel_ts(&mut self, peer: Address, token: TokenInfo) {
        self.open_channel_ts.remove(&(peer, token));
    }

    /// True while an open request awaits its on-chain confirmation.
    pub fn has_unfinished_opens(&self) -> bool {
        self.open_channel_ts.values().any(|ts| ts.finish_ts.is_none())
            || self.channels.values().any(|row| {
                matches!(
                    row.state,
                    ChannelState::TrustOpened | ChannelState::Instantiating
                )
            })
    }

    pub fn has_monitor_bit(&self, name: &str) -> bool {
        self.monitor_bits.contains(name)
    }

    pub fn put_monitor_bit(&mut self, name: &str) {
        self.monitor_bits.insert(name.to_string());
    }

    pub fn delete_monitor_bit(&mut self, name: &str) {
        self.monitor_bits.remove(name);
    }

    pub fn monitor_cursor(&self, name: &str) -> Option<u64> {
        self.monitor_cursors.get(name).copied()
    }

    pub fn put_monitor_cursor(&mut self, name: &str, next_block: u64) {
        self.monitor_cursors.insert(name.to_string(), next_block);
    }

    pub fn put_tcb_commitment(&mut self, cid: ChannelId, commitment: TcbCommitment) {
        self.tcb_commitments.insert(cid, commitment);
    }

    pub fn remove_tcb_commitment(&mut self, cid: &ChannelId) -> Option<TcbCommitment> {
        self.tcb_commitments.remove(cid)
    }

    /// Sum of virtual deposits currently promised in `token`.
    pub fn tcb_committed(&self, token: TokenInfo) -> U256 {
        self.tcb_commitments
            .values()
            .filter(|c| c.token == token)
            .fold(U256::zero(), |acc, c| acc.saturating_add(c.amount))
    }
}

/// Mutable view handed to a transaction closure.
pub struct StoreTx<'a> {
    state: &'a mut StoreState,
    effects: Vec<TxEffect>,
}

impl StoreTx<'_> {
    /// Queues an effect to dispatch once the transaction commits.
    pub fn emit(&mut self, effect: TxEffect) {
        self.effects.push(effect);
    }
}

impl Deref for StoreTx<'_> {
    type Target = StoreState;

    fn deref(&self) -> &Self::Target {
        self.state
    }
}

impl DerefMut for StoreTx<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.state
    }
}

#[derive(Debug)]
pub struct TxOutput<T> {
    pub value: T,
    pub effects: Vec<TxEffect>,
}

pub struct ChannelStore {
    path: Option<PathBuf>,
    state: Mutex<StoreState>,
}

impl ChannelStore {
    pub fn new_in_memory() -> Self {
        Self {
            path: None,
            state: Mutex::new(StoreState::default()),
        }
    }

    /// Opens a JSON backed store, loading the file if it exists.
    pub fn open(path: &Path) -> ChannelResult<Self> {
        let state = if path.exists() {
            let content = std::fs::read(path)
                .tap_err(|e| error!("Failed to read store {}: {:?}", path.display(), e))?;
            let state: StoreState = serde_json::from_slice(&content)?;
            info!(
                "Loaded channel store {} with {} channels, {} deposit jobs, {} withdraw jobs",
                path.display(),
                state.channels.len(),
                state.deposit_jobs.len(),
                state.withdraw_jobs.len()
            );
            state
        } else {
            StoreState::default()
        };
        Ok(Self {
            path: Some(path.to_path_buf()),
            state: Mutex::new(state),
        })
    }

    pub async fn transactional<T, F>(&self, f: F) -> ChannelResult<TxOutput<T>>
    where
        F: FnOnce(&mut StoreTx<'_>) -> ChannelResult<T>,
    {
        let mut guard = self.state.lock().await;
        let mut snapshot = guard.clone();
        let (value, effects) = {
            let mut tx = StoreTx {
                state: &mut snapshot,
                effects: Vec::new(),
            };
            let value = f(&mut tx)?;
            (value, tx.effects)
        };
        if let Some(path) = &self.path {
            persist(path, &snapshot)?;
        }
        *guard = snapshot;
        Ok(TxOutput { value, effects })
    }

    pub async fn view<T>(&self, f: impl FnOnce(&StoreState) -> T) -> T {
        let guard = self.state.lock().await;
        f(&guard)
    }
}

fn persist(path: &Path, state: &StoreState) -> ChannelResult<()> {
    let content = serde_json::to_vec_pretty(state)?;
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, content)
        .and_then(|_| std::fs::rename(&tmp, path))
        .tap_err(|e| error!("Failed to persist store {}: {:?}", path.display(), e))?;
    debug!("Persisted channel store {}", path.display());
    Ok(())
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::test_channel_row;

    #[tokio::test]
    async fn test_commit_and_rollback() {
        let store = ChannelStore::new_in_memory();
        let me = Address::repeat_byte(1);
        let peer = Address::repeat_byte(2);
        let cid = H256::repeat_byte(7);

        let out = store
            .transactional(|tx| {
                tx.insert_channel(test_channel_row(cid, me, peer, TokenInfo::eth(), ChannelState::Opened))?;
                tx.emit(TxEffect::ChannelClosed { cid });
                Ok(42)
            })
            .await
            .unwrap();
        assert_eq!(out.value, 42);
        assert_eq!(out.effects, vec![TxEffect::ChannelClosed { cid }]);

        // A failing closure leaves no trace.
        let err = store
            .transactional(|tx| {
                tx.channel_mut(&cid)?.state = ChannelState::Settling;
                tx.put_monitor_bit("OpenChannel");
                Err::<(), _>(ChannelError::Internal("abort".into()))
            })
            .await
            .unwrap_err();
        assert_eq!(err, ChannelError::Internal("abort".into()));
        store
            .view(|s| {
                assert_eq!(s.channel_state(&cid), ChannelState::Opened);
                assert!(!s.has_monitor_bit("OpenChannel"));
            })
            .await;
    }

    #[tokio::test]
    async fn test_one_live_channel_per_peer_token() {
        let store = ChannelStore::new_in_memory();
        let me = Address::repeat_byte(1);
        let peer = Address::repeat_byte(2);
        let first = H256::repeat_byte(1);
        let second = H256::repeat_byte(2);

        store
            .transactional(|tx| {
                tx.insert_channel(test_channel_row(first, me, peer, TokenInfo::eth(), ChannelState::Opened))
            })
            .await
            .unwrap();
        let err = store
            .transactional(|tx| {
                tx.insert_channel(test_channel_row(second, me, peer, TokenInfo::eth(), ChannelState::Opened))
            })
            .await
            .unwrap_err();
        assert_eq!(err, ChannelError::ChannelAlreadyExists(first));

        // A different token is a different pair.
        let token = TokenInfo::erc20(Address::repeat_byte(9));
        store
            .transactional(|tx| {
                tx.insert_channel(test_channel_row(second, me, peer, token, ChannelState::Opened))
            })
            .await
            .unwrap();

        // Closing frees the pair.
        let third = H256::repeat_byte(3);
        store
            .transactional(|tx| {
                let closed = tx.close_channel(&first)?;
                assert_eq!(closed.state, ChannelState::Closed);
                tx.insert_channel(test_channel_row(third, me, peer, TokenInfo::eth(), ChannelState::Opened))
            })
            .await
            .unwrap();
        store
            .view(|s| {
                assert!(s.closed_channels.contains_key(&first));
                assert_eq!(s.cid_by_peer_token(peer, TokenInfo::eth()), Some(third));
            })
            .await;
    }

    #[tokio::test]
    async fn test_file_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        let me = Address::repeat_byte(1);
        let peer = Address::repeat_byte(2);
        let cid = H256::repeat_byte(7);

        {
            let store = ChannelStore::open(&path).unwrap();
            store
                .transactional(|tx| {
                    tx.insert_channel(test_channel_row(cid, me, peer, TokenInfo::eth(), ChannelState::TrustOpened))?;
                    tx.put_monitor_bit("OpenChannel");
                    tx.put_monitor_cursor("OpenChannel", 77);
                    tx.put_tcb_commitment(
                        cid,
                        TcbCommitment {
                            token: TokenInfo::eth(),
                            amount: U256::from(50),
                        },
                    );
                    Ok(())
                })
                .await
                .unwrap();
        }

        let store = ChannelStore::open(&path).unwrap();
        store
            .view(|s| {
                assert_eq!(s.channel_state(&cid), ChannelState::TrustOpened);
                assert_eq!(s.cid_by_peer_token(peer, TokenInfo::eth()), Some(cid));
                assert!(s.has_monitor_bit("OpenChannel"));
                assert_eq!(s.monitor_cursor("OpenChannel"), Some(77));
                assert_eq!(s.tcb_committed(TokenInfo::eth()), U256::from(50));
            })
            .await;
    }
}
