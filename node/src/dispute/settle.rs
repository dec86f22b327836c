// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use super::{close_channel_in_tx, DisputeProcessor};
use crate::error::{ChannelError, ChannelResult};
use crate::fsm;
use crate::ledger::LedgerTx;
use crate::types::{ChannelId, ChannelRow, ChannelState, SignedSimplexState, TxEffect};
use ethers::types::{Address, TxHash};
use tracing::{info, warn};

/// Whether an IntendSettle that recorded `seq_nums` (ordered by ascending peer address)
/// is behind a co-signed state this node holds.
pub fn need_respond(row: &ChannelRow, me: Address, seq_nums: [u64; 2]) -> bool {
    let (mine, theirs) = if me < row.peer {
        (seq_nums[0], seq_nums[1])
    } else {
        (seq_nums[1], seq_nums[0])
    };
    let ahead = |state: &SignedSimplexState, recorded: u64| {
        state.is_co_signed() && state.seq_num() > recorded
    };
    ahead(&row.self_simplex, mine) || ahead(&row.peer_simplex, theirs)
}

/// Latest states to submit: every co-signed direction, or this node's own empty state
/// when neither direction carried traffic.
fn settle_states(row: &ChannelRow) -> Vec<SignedSimplexState> {
    let states: Vec<_> = [&row.self_simplex, &row.peer_simplex]
        .into_iter()
        .filter(|s| s.is_co_signed())
        .cloned()
        .collect();
    if states.is_empty() {
        vec![row.self_simplex.clone()]
    } else {
        states
    }
}

impl DisputeProcessor {
    pub async fn intend_settle(&self, cid: ChannelId) -> ChannelResult<TxHash> {
        let row = self
            .ctx
            .store
            .view(|s| s.channel(&cid).cloned())
            .await?;
        if !matches!(row.state, ChannelState::Opened | ChannelState::Settling) {
            return Err(ChannelError::InvalidChannelState {
                from: row.state,
                to: ChannelState::Settling,
            });
        }
        let states = settle_states(&row);
        info!(
            "[Dispute] Intend settle {:?} with seq {} / {}",
            cid,
            row.self_simplex.seq_num(),
            row.peer_simplex.seq_num()
        );
        let receipt = self
            .ctx
            .submit_and_wait(LedgerTx::IntendSettle { states })
            .await?;
        self.ctx
            .metrics
            .dispute_txs
            .with_label_values(&["intend_settle"])
            .inc();
        self.ctx
            .commit(|tx| {
                if let Some(effect) = mark_settling(tx.channel_mut(&cid)?, cid)? {
                    tx.emit(effect);
                }
                Ok(())
            })
            .await?;
        Ok(receipt.tx_hash)
    }

    pub async fn confirm_settle(&self, cid: ChannelId) -> ChannelResult<TxHash> {
        let state = self.ctx.store.view(|s| s.channel(&cid).map(|r| r.state)).await?;
        if state != ChannelState::Settling {
            return Err(ChannelError::InvalidChannelState {
                from: state,
                to: ChannelState::Closed,
            });
        }
        let finalized = self.ctx.ledger.settle_finalized_time(cid).await?;
        let block = self.ctx.block_number().await?;
        if block < finalized {
            return Err(ChannelError::DisputeWindowOpen {
                current: block,
                until: finalized,
            });
        }
        let receipt = self
            .ctx
            .submit_and_wait(LedgerTx::ConfirmSettle { cid })
            .await?;
        self.ctx
            .metrics
            .dispute_txs
            .with_label_values(&["confirm_settle"])
            .inc();
        if !self.ctx.protocol.is_osp {
            self.ctx.commit(|tx| close_channel_in_tx(tx, cid)).await?;
        }
        info!("[Dispute] Channel {:?} settled in {:?}", cid, receipt.tx_hash);
        Ok(receipt.tx_hash)
    }

    /// Returns whether the recorded states are behind ours and need a counter-settle.
    pub(super) async fn on_intend_settle_event(
        &self,
        cid: ChannelId,
        seq_nums: [u64; 2],
    ) -> ChannelResult<bool> {
        let me = self.ctx.me();
        let respond = self
            .ctx
            .commit(|tx| {
                let effect = mark_settling(tx.channel_mut(&cid)?, cid)?;
                let respond = need_respond(tx.channel(&cid)?, me, seq_nums);
                if let Some(effect) = effect {
                    tx.emit(effect);
                }
                Ok(respond)
            })
            .await?;
        if respond {
            warn!(
                "[Dispute] IntendSettle of {:?} recorded stale seq {:?}, responding",
                cid, seq_nums
            );
        }
        Ok(respond)
    }

    pub(super) async fn on_confirm_settle_event(&self, cid: ChannelId) -> ChannelResult<()> {
        self.ctx.commit(|tx| close_channel_in_tx(tx, cid)).await?;
        info!("[Dispute] Channel {:?} closed on-chain", cid);
        Ok(())
    }
}

/// Moves a channel to SETTLING, returning the route removal effect if it was open.
fn mark_settling(row: &mut ChannelRow, cid: ChannelId) -> ChannelResult<Option<TxEffect>> {
    let was_opened = row.state == ChannelState::Opened;
    fsm::on_intend_settle(row)?;
    Ok(was_opened.then_some(TxEffect::RouteEdgeRemoved { cid }))
}
