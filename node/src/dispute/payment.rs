// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use super::DisputeProcessor;
use crate::error::{ChannelError, ChannelResult};
use crate::ledger::LedgerTx;
use crate::types::{ConditionalPay, PayId, PayState};
use ethers::types::TxHash;
use tracing::{info, warn};

impl DisputeProcessor {
    /// Resolves a pay on the pay registry by revealing its hash lock preimages.
    ///
    /// Returns `None` when the registry already records the maximum amount, whether
    /// before this call or because another party resolved it concurrently.
    pub async fn settle_conditional_pay(&self, pay_id: PayId) -> ChannelResult<Option<TxHash>> {
        let pay = self
            .ctx
            .store
            .view(|s| s.pay(&pay_id).map(|record| record.pay.clone()))
            .await
            .ok_or_else(|| ChannelError::InvalidArgument(format!("unknown pay {:?}", pay_id)))?;
        if self.is_resolved(pay_id, &pay).await? {
            info!("[Dispute] Pay {:?} already resolved", pay_id);
            self.mark_paid(pay_id).await?;
            return Ok(None);
        }

        let block = self.ctx.block_number().await?;
        if block > pay.resolve_deadline {
            return Err(ChannelError::DeadlinePassed(format!(
                "pay {:?} resolve deadline {} at block {}",
                pay_id, pay.resolve_deadline, block
            )));
        }
        let preimages = self
            .ctx
            .store
            .view(|s| {
                pay.hash_locks()
                    .map(|hash| {
                        s.secret(hash)
                            .cloned()
                            .ok_or(ChannelError::SecretNotRevealed(*hash))
                    })
                    .collect::<ChannelResult<Vec<_>>>()
            })
            .await?;

        let result = self
            .ctx
            .submit_and_wait(LedgerTx::ResolvePaymentByConditions {
                pay: pay.clone(),
                preimages,
            })
            .await;
        self.ctx
            .metrics
            .dispute_txs
            .with_label_values(&["resolve_payment"])
            .inc();
        match result {
            Ok(receipt) => {
                self.mark_paid(pay_id).await?;
                info!("[Dispute] Resolved pay {:?} in {:?}", pay_id, receipt.tx_hash);
                Ok(Some(receipt.tx_hash))
            }
            Err(e) => {
                if self.is_resolved(pay_id, &pay).await? {
                    warn!(
                        "[Dispute] Pay {:?} was resolved concurrently, ignoring: {}",
                        pay_id, e
                    );
                    self.mark_paid(pay_id).await?;
                    return Ok(None);
                }
                Err(e)
            }
        }
    }

    async fn is_resolved(&self, pay_id: PayId, pay: &ConditionalPay) -> ChannelResult<bool> {
        let info = self.ctx.ledger.pay_info(pay_id).await?;
        Ok(info.amount == pay.max_amount())
    }

    async fn mark_paid(&self, pay_id: PayId) -> ChannelResult<()> {
        self.ctx
            .commit(|tx| {
                if let Some(mut record) = tx.pay(&pay_id).cloned() {
                    for placement in [&mut record.ingress, &mut record.egress]
                        .into_iter()
                        .flatten()
                    {
                        placement.state = PayState::PaidMax;
                    }
                    tx.put_pay(pay_id, record);
                }
                Ok(())
            })
            .await
    }
}
