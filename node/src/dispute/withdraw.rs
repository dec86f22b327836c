// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use super::DisputeProcessor;
use crate::balance::free_balance_for_withdraw;
use crate::error::{ChannelError, ChannelResult};
use crate::ledger::{LedgerTx, WithdrawIntent};
use crate::types::{ChannelId, ChannelState, PendingWithdrawal};
use ethers::types::{Address, TxHash, U256};
use tracing::{debug, info, warn};

impl DisputeProcessor {
    async fn withdraw_intent(&self, cid: ChannelId) -> ChannelResult<WithdrawIntent> {
        self.ctx.ledger.withdraw_intent(cid).await?.ok_or_else(|| {
            ChannelError::InvalidArgument(format!("no withdraw intent on {:?}", cid))
        })
    }

    /// Starts a non-cooperative withdraw of `amount` to self, or into `recipient_cid`
    /// when it is non-zero.
    pub async fn intend_withdraw(
        &self,
        cid: ChannelId,
        amount: U256,
        recipient_cid: ChannelId,
    ) -> ChannelResult<TxHash> {
        let me = self.ctx.me();
        let row = self
            .ctx
            .store
            .view(|s| s.channel(&cid).cloned())
            .await?;
        if row.state != ChannelState::Opened {
            return Err(ChannelError::InvalidChannelState {
                from: row.state,
                to: ChannelState::Opened,
            });
        }
        if amount.is_zero() {
            return Err(ChannelError::InvalidArgument(
                "withdraw amount is zero".to_string(),
            ));
        }
        if self.ctx.ledger.withdraw_intent(cid).await?.is_some() {
            return Err(ChannelError::PreviousWithdrawPending);
        }
        let block = self.ctx.block_number().await?;
        let available = free_balance_for_withdraw(&row, me, block)?;
        if available < amount {
            return Err(ChannelError::InsufficientBalance {
                required: amount,
                available,
            });
        }
        let dispute_timeout = self.ctx.ledger.dispute_timeout(cid).await?;

        let receipt = self
            .ctx
            .submit_and_wait(LedgerTx::IntendWithdraw {
                cid,
                amount,
                recipient_cid,
            })
            .await?;
        self.ctx
            .metrics
            .dispute_txs
            .with_label_values(&["intend_withdraw"])
            .inc();
        self.ctx
            .commit(|tx| {
                tx.channel_mut(&cid)?.on_chain_balance.pending_withdrawal =
                    Some(PendingWithdrawal {
                        amount,
                        receiver: me,
                        deadline: receipt.block_number + dispute_timeout,
                    });
                Ok(())
            })
            .await?;
        info!(
            "[Dispute] Intend withdraw {} from {:?} in {:?}",
            amount, cid, receipt.tx_hash
        );
        Ok(receipt.tx_hash)
    }

    pub async fn confirm_withdraw(&self, cid: ChannelId) -> ChannelResult<TxHash> {
        let intent = self.withdraw_intent(cid).await?;
        if intent.receiver != self.ctx.me() {
            return Err(ChannelError::InvalidArgument(format!(
                "withdraw on {:?} goes to {:?}",
                cid, intent.receiver
            )));
        }
        let dispute_timeout = self.ctx.ledger.dispute_timeout(cid).await?;
        let until = intent.request_block + dispute_timeout;
        let block = self.ctx.block_number().await?;
        if block < until {
            return Err(ChannelError::DisputeWindowOpen {
                current: block,
                until,
            });
        }
        let receipt = self
            .ctx
            .submit_and_wait(LedgerTx::ConfirmWithdraw { cid })
            .await?;
        self.ctx
            .metrics
            .dispute_txs
            .with_label_values(&["confirm_withdraw"])
            .inc();
        let balance = self.ctx.ledger.balance_map(cid).await?;
        self.on_confirm_withdraw_event(cid, balance.deposits, balance.withdrawals)
            .await?;
        Ok(receipt.tx_hash)
    }

    pub async fn veto_withdraw(&self, cid: ChannelId) -> ChannelResult<TxHash> {
        let intent = self.withdraw_intent(cid).await?;
        if intent.receiver == self.ctx.me() {
            return Err(ChannelError::InvalidArgument(format!(
                "cannot veto own withdraw on {:?}",
                cid
            )));
        }
        let receipt = self
            .ctx
            .submit_and_wait(LedgerTx::VetoWithdraw { cid })
            .await?;
        self.ctx
            .metrics
            .dispute_txs
            .with_label_values(&["veto_withdraw"])
            .inc();
        self.on_veto_withdraw_event(cid).await?;
        info!(
            "[Dispute] Vetoed withdraw of {} by {:?} on {:?}",
            intent.amount, intent.receiver, cid
        );
        Ok(receipt.tx_hash)
    }

    /// Records a withdraw intent still live on the ledger. Returns whether it must be
    /// vetoed. Logs of an intent that was since confirmed, vetoed or replaced are
    /// ignored.
    pub(super) async fn on_intend_withdraw_event(
        &self,
        cid: ChannelId,
        receiver: Address,
        amount: U256,
    ) -> ChannelResult<bool> {
        let intent = match self.ctx.ledger.withdraw_intent(cid).await? {
            Some(intent) if intent.receiver == receiver && intent.amount == amount => intent,
            _ => {
                debug!(
                    "[Dispute] Withdraw intent of {} by {:?} on {:?} is no longer live",
                    amount, receiver, cid
                );
                return Ok(false);
            }
        };
        let dispute_timeout = self.ctx.ledger.dispute_timeout(cid).await?;
        self.ctx
            .commit(|tx| {
                tx.channel_mut(&cid)?.on_chain_balance.pending_withdrawal =
                    Some(PendingWithdrawal {
                        amount,
                        receiver,
                        deadline: intent.request_block + dispute_timeout,
                    });
                Ok(())
            })
            .await?;
        let veto = self.ctx.protocol.is_osp && receiver != self.ctx.me();
        if veto {
            warn!(
                "[Dispute] {:?} intends to withdraw {} from {:?}, vetoing",
                receiver, amount, cid
            );
        }
        Ok(veto)
    }

    pub(super) async fn on_confirm_withdraw_event(
        &self,
        cid: ChannelId,
        deposits: [U256; 2],
        withdrawals: [U256; 2],
    ) -> ChannelResult<()> {
        let me = self.ctx.me();
        self.ctx
            .commit(|tx| {
                let row = tx.channel_mut(&cid)?;
                let peer = row.peer;
                row.on_chain_balance.merge_deposits(me, peer, deposits);
                row.on_chain_balance.merge_withdrawals(me, peer, withdrawals);
                Ok(())
            })
            .await
    }

    /// Drops the pending withdrawal unless the ledger already holds a newer intent.
    pub(super) async fn on_veto_withdraw_event(&self, cid: ChannelId) -> ChannelResult<()> {
        if self.ctx.ledger.withdraw_intent(cid).await?.is_some() {
            debug!("[Dispute] Ignoring veto of a replaced withdraw intent on {:?}", cid);
            return Ok(());
        }
        self.ctx
            .commit(|tx| {
                tx.channel_mut(&cid)?.on_chain_balance.pending_withdrawal = None;
                Ok(())
            })
            .await
    }
}
