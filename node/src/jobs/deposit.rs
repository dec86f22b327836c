// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Deposit jobs: an optional ERC20 approve followed by the ledger deposit.

use super::JobRegistry;
use crate::crypto::deposit_job_id;
use crate::error::{ChannelError, ChannelResult};
use crate::ledger::LedgerTx;
use crate::monitor::{event_callback, EventCallback, MonitorConfig};
use crate::node::ChannelContext;
use crate::types::{
    ChannelId, ChannelState, DepositJob, DepositJobState, LedgerEvent, LedgerEventKind,
    LedgerLog, TxEffect,
};
use ethers::types::{TxHash, U256};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const JOB_KIND: &str = "deposit";

pub trait DepositCallback: Send + Sync {
    fn on_deposit(&self, job_id: &str, tx_hash: TxHash);

    fn on_error(&self, job_id: &str, err: ChannelError);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DepositAction {
    WaitApprove(TxHash),
    SubmitDeposit,
    WaitDeposit(TxHash),
    Finished,
}

pub(crate) fn next_action(job: &DepositJob) -> DepositAction {
    match (job.state, job.approve_tx, job.deposit_tx) {
        (state, _, _) if state.is_terminal() => DepositAction::Finished,
        (DepositJobState::WaitDeposit, _, Some(tx_hash)) => DepositAction::WaitDeposit(tx_hash),
        (DepositJobState::WaitApprove, Some(tx_hash), _) => DepositAction::WaitApprove(tx_hash),
        _ => DepositAction::SubmitDeposit,
    }
}

pub struct DepositProcessor {
    ctx: ChannelContext,
    jobs: Arc<JobRegistry>,
}

impl DepositProcessor {
    pub fn new(ctx: ChannelContext, jobs: Arc<JobRegistry>) -> Self {
        Self { ctx, jobs }
    }

    pub async fn start_monitors(self: &Arc<Self>) -> ChannelResult<()> {
        let config = MonitorConfig::new(LedgerEventKind::Deposit, self.ctx.ledger.ledger_address());
        self.ctx.monitor.monitor(config, self.event_handler()).await?;
        Ok(())
    }

    fn event_handler(self: &Arc<Self>) -> EventCallback {
        let this = Arc::downgrade(self);
        event_callback(move |_id, log| {
            let this = this.clone();
            async move {
                if let Some(this) = this.upgrade() {
                    this.handle_deposit_event(log).await;
                }
            }
        })
    }

    /// Refreshes the deposit totals of a channel from a Deposit log. Withdrawals are
    /// owned by the withdraw logs, which the Deposit subscription may lag behind.
    async fn handle_deposit_event(&self, log: LedgerLog) {
        let LedgerEvent::Deposit { cid, deposits, .. } = log.event else {
            return;
        };
        let me = self.ctx.me();
        let result = self
            .ctx
            .commit(|tx| {
                if !tx.has_channel(&cid) {
                    return Ok(false);
                }
                let row = tx.channel_mut(&cid)?;
                let peer = row.peer;
                row.on_chain_balance.merge_deposits(me, peer, deposits);
                Ok(true)
            })
            .await;
        match result {
            Ok(true) => {
                self.ctx.metrics.deposit_events.inc();
                info!(
                    "[Deposit] Channel {:?} deposits now {:?} in tx {:?}",
                    cid, deposits, log.tx_hash
                );
            }
            Ok(false) => debug!("[Deposit] Ignoring deposit to unknown channel {:?}", cid),
            Err(e) => {
                self.ctx.metrics.record_error(&e);
                error!("[Deposit] Failed to apply deposit event of {:?}: {}", cid, e);
            }
        }
    }

    /// Starts a deposit of `amount` into `cid` and returns the job id.
    ///
    /// The first transaction is sent before the job is persisted, its hash is part of
    /// the job id.
    pub async fn deposit(
        self: &Arc<Self>,
        cid: ChannelId,
        amount: U256,
        cb: Option<Arc<dyn DepositCallback>>,
    ) -> ChannelResult<String> {
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
                "deposit amount is zero".to_string(),
            ));
        }
        let me = self.ctx.me();
        let spender = self.ctx.ledger.ledger_address();
        let needs_approve = !row.token.is_eth()
            && self
                .ctx
                .ledger
                .erc20_allowance(row.token.address, me, spender)
                .await?
                < amount;

        let mut job = DepositJob {
            job_id: String::new(),
            cid,
            token: row.token,
            amount,
            state: DepositJobState::WaitDeposit,
            approve_tx: None,
            deposit_tx: None,
            error: None,
        };
        let first_tx = if needs_approve {
            let tx_hash = self
                .ctx
                .submit(LedgerTx::Erc20Approve {
                    token: row.token.address,
                    spender,
                    amount,
                })
                .await?;
            job.state = DepositJobState::WaitApprove;
            job.approve_tx = Some(tx_hash);
            tx_hash
        } else {
            let tx_hash = self.ctx.submit(self.deposit_tx(&job)).await?;
            job.deposit_tx = Some(tx_hash);
            tx_hash
        };
        let job_id = deposit_job_id(cid, amount, first_tx);
        job.job_id = job_id.clone();
        info!(
            "[Deposit] Job {} deposits {} into {:?}, first tx {:?}",
            job_id, amount, cid, first_tx
        );

        self.ctx
            .commit(|tx| {
                tx.deposit_jobs.insert(job_id.clone(), job);
                Ok(())
            })
            .await?;
        if let Some(cb) = cb {
            self.ctx.effects.register_deposit_callback(&job_id, cb).await;
        }
        self.spawn_dispatch(job_id.clone());
        Ok(job_id)
    }

    fn deposit_tx(&self, job: &DepositJob) -> LedgerTx {
        LedgerTx::Deposit {
            cid: job.cid,
            receiver: self.ctx.me(),
            amount: job.amount,
            token: job.token,
        }
    }

    fn spawn_dispatch(self: &Arc<Self>, job_id: String) {
        let this = self.clone();
        tokio::spawn(async move { this.dispatch(job_id).await });
    }

    /// Drives a job from its persisted state until it is terminal or hits a transient
    /// error, in which case it stays as is for the next resume.
    async fn dispatch(&self, job_id: String) {
        let Some(_guard) = self.jobs.try_start(JOB_KIND, &job_id) else {
            return;
        };
        loop {
            let Some(job) = self
                .ctx
                .store
                .view(|s| s.deposit_jobs.get(&job_id).cloned())
                .await
            else {
                debug!("[Deposit] Job {} was removed", job_id);
                return;
            };
            let result = match next_action(&job) {
                DepositAction::Finished => return,
                DepositAction::WaitApprove(tx_hash) => {
                    match self.ctx.wait_mined("approve", tx_hash).await {
                        Ok(_) => self.submit_deposit(&job).await,
                        Err(e) => Err(e),
                    }
                }
                DepositAction::SubmitDeposit => self.submit_deposit(&job).await,
                DepositAction::WaitDeposit(tx_hash) => {
                    match self.ctx.wait_mined("deposit", tx_hash).await {
                        Ok(_) => self.finish(&job_id, Ok(tx_hash)).await,
                        Err(e) => Err(e),
                    }
                }
            };
            match result {
                Ok(()) => continue,
                Err(e) if e.is_transient() => {
                    warn!("[Deposit] Job {} paused on transient error: {}", job_id, e);
                    return;
                }
                Err(e) => {
                    if let Err(e) = self.finish(&job_id, Err(e)).await {
                        error!("[Deposit] Failed to record failure of job {}: {}", job_id, e);
                        return;
                    }
                }
            }
        }
    }

    async fn submit_deposit(&self, job: &DepositJob) -> ChannelResult<()> {
        let tx_hash = self.ctx.submit(self.deposit_tx(job)).await?;
        self.ctx
            .commit(|tx| {
                let job = tx
                    .deposit_jobs
                    .get_mut(&job.job_id)
                    .ok_or_else(|| ChannelError::JobNotFound(job.job_id.clone()))?;
                job.state = DepositJobState::WaitDeposit;
                job.deposit_tx = Some(tx_hash);
                Ok(())
            })
            .await
    }

    /// Persists the terminal state. The outcome effect is emitted in the same store
    /// transaction, so a callback never fires for an unrecorded result.
    async fn finish(&self, job_id: &str, outcome: Result<TxHash, ChannelError>) -> ChannelResult<()> {
        if let Err(e) = &outcome {
            self.ctx.metrics.deposit_errors.inc();
            error!("[Deposit] Job {} failed: {}", job_id, e);
        } else {
            info!("[Deposit] Job {} succeeded", job_id);
        }
        self.ctx
            .commit(|tx| {
                let job = tx
                    .deposit_jobs
                    .get_mut(job_id)
                    .ok_or_else(|| ChannelError::JobNotFound(job_id.to_string()))?;
                if job.state.is_terminal() {
                    return Ok(());
                }
                match &outcome {
                    Ok(_) => job.state = DepositJobState::Succeeded,
                    Err(e) => {
                        job.state = DepositJobState::Failed;
                        job.error = Some(e.to_string());
                    }
                }
                tx.emit(TxEffect::DepositJobFinished {
                    job_id: job_id.to_string(),
                    outcome,
                });
                Ok(())
            })
            .await
    }

    /// Restarts every unfinished job, returning how many there were.
    pub async fn resume_jobs(self: &Arc<Self>) -> usize {
        let pending: Vec<String> = self
            .ctx
            .store
            .view(|s| {
                s.deposit_jobs
                    .values()
                    .filter(|job| !job.state.is_terminal())
                    .map(|job| job.job_id.clone())
                    .collect()
            })
            .await;
        for job_id in &pending {
            info!("[Deposit] Resuming job {}", job_id);
            self.spawn_dispatch(job_id.clone());
        }
        pending.len()
    }

    /// Attaches `cb` to a job. A finished job reports its recorded outcome right away,
    /// an unfinished one is resumed if nothing drives it.
    pub async fn monitor_job(
        self: &Arc<Self>,
        job_id: &str,
        cb: Arc<dyn DepositCallback>,
    ) -> ChannelResult<()> {
        if !self
            .ctx
            .store
            .view(|s| s.deposit_jobs.contains_key(job_id))
            .await
        {
            return Err(ChannelError::JobNotFound(job_id.to_string()));
        }
        self.ctx.effects.register_deposit_callback(job_id, cb).await;
        // Read after registering so an outcome recorded in between is not lost.
        let job = self
            .ctx
            .store
            .view(|s| s.deposit_jobs.get(job_id).cloned())
            .await
            .ok_or_else(|| ChannelError::JobNotFound(job_id.to_string()))?;
        match job.state {
            DepositJobState::Succeeded => {
                let tx_hash = job.deposit_tx.unwrap_or_default();
                self.ctx.effects.notify_deposit(job_id, Ok(tx_hash)).await;
            }
            DepositJobState::Failed => {
                let error = ChannelError::JobFailed(job.error.unwrap_or_default());
                self.ctx.effects.notify_deposit(job_id, Err(error)).await;
            }
            DepositJobState::WaitApprove | DepositJobState::WaitDeposit => {
                self.spawn_dispatch(job_id.to_string());
            }
        }
        Ok(())
    }

    pub async fn remove_job(&self, job_id: &str) -> ChannelResult<()> {
        self.ctx
            .commit(|tx| {
                tx.deposit_jobs
                    .remove(job_id)
                    .map(|_| ())
                    .ok_or_else(|| ChannelError::JobNotFound(job_id.to_string()))
            })
            .await
    }
}
