// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! On-chain dispute handling: unilateral settle, conditional pay resolution and
//! non-cooperative withdraw, both as API calls and as reactions to ledger events.

use crate::error::ChannelResult;
use crate::fsm;
use crate::monitor::{event_callback, EventCallback, MonitorConfig};
use crate::node::ChannelContext;
use crate::store::StoreTx;
use crate::types::{ChannelId, ChannelState, LedgerEvent, LedgerEventKind, LedgerLog, TxEffect};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::{debug, error};

mod payment;
mod settle;
mod withdraw;

pub use settle::need_respond;

/// On-chain reaction to a dispute event of the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum DisputeResponse {
    IntendSettle,
    VetoWithdraw,
}

impl DisputeResponse {
    fn name(&self) -> &'static str {
        match self {
            DisputeResponse::IntendSettle => "intend_settle",
            DisputeResponse::VetoWithdraw => "veto_withdraw",
        }
    }
}

pub struct DisputeProcessor {
    ctx: ChannelContext,
    // Responses whose transaction is still being sent or mined.
    responding: Mutex<HashSet<(ChannelId, DisputeResponse)>>,
}

impl DisputeProcessor {
    pub fn new(ctx: ChannelContext) -> Self {
        Self {
            ctx,
            responding: Mutex::new(HashSet::new()),
        }
    }

    /// Settle events are watched by every node. Withdraw events only by an OSP, which
    /// vetoes withdrawals that would drain its receivable balance.
    pub async fn start_monitors(self: &Arc<Self>) -> ChannelResult<()> {
        let mut kinds = vec![LedgerEventKind::IntendSettle, LedgerEventKind::ConfirmSettle];
        if self.ctx.protocol.is_osp {
            kinds.extend([
                LedgerEventKind::IntendWithdraw,
                LedgerEventKind::ConfirmWithdraw,
                LedgerEventKind::VetoWithdraw,
            ]);
        }
        let ledger = self.ctx.ledger.ledger_address();
        for kind in kinds {
            self.ctx
                .monitor
                .monitor(MonitorConfig::new(kind, ledger), self.event_handler())
                .await?;
        }
        Ok(())
    }

    fn event_handler(self: &Arc<Self>) -> EventCallback {
        let this = Arc::downgrade(self);
        event_callback(move |_id, log| {
            let this = this.clone();
            async move {
                if let Some(this) = this.upgrade() {
                    this.handle_event(log).await;
                }
            }
        })
    }

    /// Records the event and hands any counter-transaction to a background task, so
    /// that waiting for it to be mined does not hold up events of other channels.
    async fn handle_event(self: &Arc<Self>, log: LedgerLog) {
        let cid = log.event.cid();
        if !self.ctx.store.view(|s| s.has_channel(&cid)).await {
            debug!(
                "[Dispute] Ignoring {} event of unknown channel {:?}",
                log.event.kind().name(),
                cid
            );
            return;
        }
        self.ctx
            .metrics
            .dispute_events
            .with_label_values(&[log.event.kind().name()])
            .inc();
        let kind = log.event.kind();
        let result = match log.event {
            LedgerEvent::IntendSettle { cid, seq_nums } => self
                .on_intend_settle_event(cid, seq_nums)
                .await
                .map(|respond| respond.then_some(DisputeResponse::IntendSettle)),
            LedgerEvent::ConfirmSettle { cid, .. } => {
                self.on_confirm_settle_event(cid).await.map(|_| None)
            }
            LedgerEvent::IntendWithdraw {
                cid,
                receiver,
                amount,
            } => self
                .on_intend_withdraw_event(cid, receiver, amount)
                .await
                .map(|veto| veto.then_some(DisputeResponse::VetoWithdraw)),
            LedgerEvent::ConfirmWithdraw {
                cid,
                deposits,
                withdrawals,
                ..
            } => self
                .on_confirm_withdraw_event(cid, deposits, withdrawals)
                .await
                .map(|_| None),
            LedgerEvent::VetoWithdraw { cid } => {
                self.on_veto_withdraw_event(cid).await.map(|_| None)
            }
            _ => Ok(None),
        };
        match result {
            Ok(Some(response)) => self.spawn_response(cid, response),
            Ok(None) => {}
            Err(e) => {
                self.ctx.metrics.record_error(&e);
                error!(
                    "[Dispute] Failed to handle {} event of {:?} in tx {:?}: {}",
                    kind.name(),
                    cid,
                    log.tx_hash,
                    e
                );
            }
        }
    }

    /// At most one response of each kind is in flight per channel.
    fn spawn_response(self: &Arc<Self>, cid: ChannelId, response: DisputeResponse) {
        let inserted = self
            .responding
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert((cid, response));
        if !inserted {
            debug!(
                "[Dispute] {} of {:?} already in flight",
                response.name(),
                cid
            );
            return;
        }
        let this = self.clone();
        tokio::spawn(async move {
            let result = match response {
                DisputeResponse::IntendSettle => this.intend_settle(cid).await,
                DisputeResponse::VetoWithdraw => this.veto_withdraw(cid).await,
            };
            this.responding
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&(cid, response));
            if let Err(e) = result {
                this.ctx.metrics.record_error(&e);
                error!(
                    "[Dispute] Failed to send {} for {:?}: {}",
                    response.name(),
                    cid,
                    e
                );
            }
        });
    }
}

/// Archives a channel whose settlement finished.
pub(crate) fn close_channel_in_tx(tx: &mut StoreTx<'_>, cid: ChannelId) -> ChannelResult<()> {
    let row = tx.channel_mut(&cid)?;
    let was_opened = row.state == ChannelState::Opened;
    fsm::on_confirm_settle(row)?;
    tx.close_channel(&cid)?;
    if was_opened {
        tx.emit(TxEffect::RouteEdgeRemoved { cid });
    }
    tx.emit(TxEffect::ChannelClosed { cid });
    Ok(())
}
