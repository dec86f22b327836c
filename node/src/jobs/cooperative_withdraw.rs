// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Cooperative withdraw: the proposer signs a withdraw info, the peer co-signs it and
//! the proposer submits both signatures to the ledger.
//!
//! A job is keyed by its withdraw hash, which covers the ledger, the channel and the
//! next on-chain withdraw sequence number. Both sides reserve the amount from the
//! proposer's free balance until the withdraw deadline, so no payment can spend it
//! while the withdraw is in flight.

use super::JobRegistry;
use crate::balance::reserve_withdrawal;
use crate::crypto::{sig_is_valid, withdraw_hash};
use crate::encoding::ChannelMessageEncoding;
use crate::error::{ChannelError, ChannelResult};
use crate::ledger::LedgerTx;
use crate::monitor::{event_callback, EventCallback, MonitorConfig};
use crate::node::ChannelContext;
use crate::types::{
    AccountAmtPair, ChannelId, ChannelState, CooperativeWithdrawInfo, CooperativeWithdrawJob,
    CooperativeWithdrawRequest, CooperativeWithdrawResponse, LedgerEvent, LedgerEventKind,
    LedgerLog, PeerMessage, TxEffect, WithdrawJobState,
};
use crate::{COOPERATIVE_WITHDRAW_RESPONSE_TIMEOUT, COOPERATIVE_WITHDRAW_TIMEOUT};
use ethers::types::{Address, Bytes, TxHash, U256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, error, info, warn};

const JOB_KIND: &str = "cooperative_withdraw";

pub trait WithdrawCallback: Send + Sync {
    fn on_withdraw(&self, withdraw_hash: &str, tx_hash: TxHash);

    fn on_error(&self, withdraw_hash: &str, err: ChannelError);
}

type ResponseWaiter = oneshot::Sender<(Address, CooperativeWithdrawResponse)>;

pub struct CooperativeWithdrawProcessor {
    ctx: ChannelContext,
    jobs: Arc<JobRegistry>,
    waiters: Mutex<HashMap<String, ResponseWaiter>>,
}

impl CooperativeWithdrawProcessor {
    pub fn new(ctx: ChannelContext, jobs: Arc<JobRegistry>) -> Self {
        Self {
            ctx,
            jobs,
            waiters: Mutex::new(HashMap::new()),
        }
    }

    pub async fn start_monitors(self: &Arc<Self>) -> ChannelResult<()> {
        let config = MonitorConfig::new(
            LedgerEventKind::CooperativeWithdraw,
            self.ctx.ledger.ledger_address(),
        );
        self.ctx.monitor.monitor(config, self.event_handler()).await?;
        Ok(())
    }

    fn event_handler(self: &Arc<Self>) -> EventCallback {
        let this = Arc::downgrade(self);
        event_callback(move |_id, log| {
            let this = this.clone();
            async move {
                if let Some(this) = this.upgrade() {
                    this.handle_withdraw_event(log).await;
                }
            }
        })
    }

    /// Applies a mined cooperative withdraw: refreshes the balance, drops the
    /// reservation and finishes the matching job if this node proposed it.
    async fn handle_withdraw_event(&self, log: LedgerLog) {
        let LedgerEvent::CooperativeWithdraw {
            cid,
            withdrawn_amount,
            receiver,
            deposits,
            withdrawals,
            seq_num,
            ..
        } = log.event
        else {
            return;
        };
        let me = self.ctx.me();
        let hash = withdraw_hash(self.ctx.ledger.ledger_address(), cid, seq_num);
        let result = self
            .ctx
            .commit(|tx| {
                if !tx.has_channel(&cid) {
                    return Ok(false);
                }
                let row = tx.channel_mut(&cid)?;
                let peer = row.peer;
                row.on_chain_balance.merge_deposits(me, peer, deposits);
                row.on_chain_balance.merge_withdrawals(me, peer, withdrawals);
                if let Some(job) = tx.withdraw_jobs.get_mut(&hash) {
                    if !job.state.is_terminal() {
                        job.state = WithdrawJobState::Succeeded;
                        job.tx_hash = Some(log.tx_hash);
                        tx.emit(TxEffect::WithdrawJobFinished {
                            withdraw_hash: hash.clone(),
                            outcome: Ok(log.tx_hash),
                        });
                    }
                }
                Ok(true)
            })
            .await;
        match result {
            Ok(true) => {
                self.ctx.metrics.coop_withdraw_events.inc();
                info!(
                    "[CooperativeWithdraw] {:?} withdrew {} from {:?} at seq {}",
                    receiver, withdrawn_amount, cid, seq_num
                );
            }
            Ok(false) => debug!(
                "[CooperativeWithdraw] Ignoring withdraw from unknown channel {:?}",
                cid
            ),
            Err(e) => {
                self.ctx.metrics.record_error(&e);
                error!(
                    "[CooperativeWithdraw] Failed to apply withdraw event of {:?}: {}",
                    cid, e
                );
            }
        }
    }

    /// Proposes withdrawing `amount` of this node's free balance in `cid` to its own
    /// account. Returns the withdraw hash identifying the job.
    pub async fn cooperative_withdraw(
        self: &Arc<Self>,
        cid: ChannelId,
        amount: U256,
        cb: Option<Arc<dyn WithdrawCallback>>,
    ) -> ChannelResult<String> {
        let state = self
            .ctx
            .store
            .view(|s| s.channel(&cid).map(|row| row.state))
            .await?;
        if state != ChannelState::Opened {
            return Err(ChannelError::InvalidChannelState {
                from: state,
                to: ChannelState::Opened,
            });
        }
        if amount.is_zero() {
            return Err(ChannelError::InvalidArgument(
                "withdraw amount is zero".to_string(),
            ));
        }
        let me = self.ctx.me();
        let seq_num = self.ctx.ledger.cooperative_withdraw_seq_num(cid).await? + 1;
        let hash = withdraw_hash(self.ctx.ledger.ledger_address(), cid, seq_num);
        let block = self.ctx.block_number().await?;
        let deadline = block + COOPERATIVE_WITHDRAW_TIMEOUT;
        let withdraw_info = CooperativeWithdrawInfo {
            channel_id: cid,
            seq_num,
            withdraw: AccountAmtPair {
                account: me,
                amount,
            },
            withdraw_deadline: deadline,
            recipient_channel_id: ChannelId::zero(),
        };
        let requester_sig = self.ctx.signer.sign(&withdraw_info.as_bytes())?;

        self.ctx
            .commit(|tx| {
                if tx
                    .withdraw_jobs
                    .get(&hash)
                    .is_some_and(|job| job.state != WithdrawJobState::Failed)
                {
                    return Err(ChannelError::PreviousWithdrawPending);
                }
                reserve_withdrawal(tx.channel_mut(&cid)?, me, amount, deadline, block)?;
                tx.withdraw_jobs.insert(
                    hash.clone(),
                    CooperativeWithdrawJob {
                        withdraw_hash: hash.clone(),
                        cid,
                        request: CooperativeWithdrawRequest {
                            withdraw_info,
                            requester_sig,
                        },
                        state: WithdrawJobState::WaitResponse,
                        tx_hash: None,
                        error: None,
                    },
                );
                Ok(())
            })
            .await?;
        info!(
            "[CooperativeWithdraw] Job {} withdraws {} from {:?} at seq {}",
            hash, amount, cid, seq_num
        );
        if let Some(cb) = cb {
            self.ctx.effects.register_withdraw_callback(&hash, cb).await;
        }
        self.spawn_dispatch(hash.clone());
        Ok(hash)
    }

    fn spawn_dispatch(self: &Arc<Self>, withdraw_hash: String) {
        let this = self.clone();
        tokio::spawn(async move { this.dispatch(withdraw_hash).await });
    }

    async fn dispatch(&self, withdraw_hash: String) {
        let Some(_guard) = self.jobs.try_start(JOB_KIND, &withdraw_hash) else {
            return;
        };
        loop {
            let Some(job) = self
                .ctx
                .store
                .view(|s| s.withdraw_jobs.get(&withdraw_hash).cloned())
                .await
            else {
                debug!("[CooperativeWithdraw] Job {} was removed", withdraw_hash);
                return;
            };
            let result = match (job.state, job.tx_hash) {
                (WithdrawJobState::Succeeded | WithdrawJobState::Failed, _) => return,
                (WithdrawJobState::WaitResponse, _) => self.request_co_sign(&job).await,
                (WithdrawJobState::WaitTx, Some(tx_hash)) => {
                    match self.ctx.wait_mined(JOB_KIND, tx_hash).await {
                        Ok(_) => self.finish(&withdraw_hash, Ok(tx_hash)).await,
                        Err(e) => Err(e),
                    }
                }
                (_, None) => Err(ChannelError::Internal(format!(
                    "job {} has no transaction",
                    withdraw_hash
                ))),
            };
            match result {
                Ok(()) => continue,
                // Only an unreachable chain pauses a job. A silent peer fails it.
                Err(e @ ChannelError::Provider(_)) => {
                    warn!(
                        "[CooperativeWithdraw] Job {} paused on transient error: {}",
                        withdraw_hash, e
                    );
                    return;
                }
                Err(e) => {
                    if let Err(e) = self.finish(&withdraw_hash, Err(e)).await {
                        error!(
                            "[CooperativeWithdraw] Failed to record failure of job {}: {}",
                            withdraw_hash, e
                        );
                        return;
                    }
                }
            }
        }
    }

    /// Sends the request, waits for the co-signature and submits the withdraw.
    /// A resumed job sends the same request again, the peer answers it idempotently.
    async fn request_co_sign(&self, job: &CooperativeWithdrawJob) -> ChannelResult<()> {
        let info = &job.request.withdraw_info;
        let block = self.ctx.block_number().await?;
        if block > info.withdraw_deadline {
            return Err(ChannelError::DeadlinePassed(format!(
                "withdraw deadline {} at block {}",
                info.withdraw_deadline, block
            )));
        }
        let peer = self
            .ctx
            .store
            .view(|s| s.channel(&job.cid).map(|row| row.peer))
            .await?;

        let (sender, receiver) = oneshot::channel();
        self.waiters
            .lock()
            .await
            .insert(job.withdraw_hash.clone(), sender);
        let response = self.exchange(peer, job, receiver).await;
        self.waiters.lock().await.remove(&job.withdraw_hash);
        let (from, response) = response?;

        if from != peer || response.withdraw_info != *info {
            return Err(ChannelError::InvalidArgument(format!(
                "withdraw response from {:?} does not match the request",
                from
            )));
        }
        if let Some(reason) = response.error {
            return Err(ChannelError::PolicyRejected(format!(
                "peer declined withdraw: {}",
                reason
            )));
        }
        let approver_sig = response
            .approver_sig
            .ok_or_else(|| ChannelError::InvalidArgument("missing approver signature".into()))?;
        if !sig_is_valid(peer, &info.as_bytes(), &approver_sig) {
            return Err(ChannelError::InvalidSignature);
        }
        let sigs = sorted_sigs(
            self.ctx.me(),
            job.request.requester_sig.clone(),
            peer,
            approver_sig,
        );
        let tx_hash = self
            .ctx
            .submit(LedgerTx::CooperativeWithdraw {
                info: info.clone(),
                sigs,
            })
            .await?;
        self.ctx
            .commit(|tx| {
                let job = tx
                    .withdraw_jobs
                    .get_mut(&job.withdraw_hash)
                    .ok_or_else(|| ChannelError::JobNotFound(job.withdraw_hash.clone()))?;
                job.state = WithdrawJobState::WaitTx;
                job.tx_hash = Some(tx_hash);
                Ok(())
            })
            .await
    }

    async fn exchange(
        &self,
        peer: Address,
        job: &CooperativeWithdrawJob,
        receiver: oneshot::Receiver<(Address, CooperativeWithdrawResponse)>,
    ) -> ChannelResult<(Address, CooperativeWithdrawResponse)> {
        self.ctx
            .messenger
            .send(
                peer,
                PeerMessage::CooperativeWithdrawRequest(job.request.clone()),
            )
            .await?;
        match tokio::time::timeout(COOPERATIVE_WITHDRAW_RESPONSE_TIMEOUT, receiver).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(ChannelError::Internal(format!(
                "response waiter of {} dropped",
                job.withdraw_hash
            ))),
            Err(_) => Err(ChannelError::Timeout(format!(
                "no withdraw response from {:?}",
                peer
            ))),
        }
    }

    /// Records the terminal state. A failure releases the local reservation.
    async fn finish(
        &self,
        withdraw_hash: &str,
        outcome: Result<TxHash, ChannelError>,
    ) -> ChannelResult<()> {
        match &outcome {
            Ok(tx_hash) => info!(
                "[CooperativeWithdraw] Job {} mined in {:?}",
                withdraw_hash, tx_hash
            ),
            Err(e) => error!("[CooperativeWithdraw] Job {} failed: {}", withdraw_hash, e),
        }
        let me = self.ctx.me();
        self.ctx
            .commit(|tx| {
                let job = tx
                    .withdraw_jobs
                    .get_mut(withdraw_hash)
                    .ok_or_else(|| ChannelError::JobNotFound(withdraw_hash.to_string()))?;
                if job.state.is_terminal() {
                    return Ok(());
                }
                let cid = job.cid;
                let amount = job.request.withdraw_info.withdraw.amount;
                match &outcome {
                    Ok(tx_hash) => {
                        job.state = WithdrawJobState::Succeeded;
                        job.tx_hash = Some(*tx_hash);
                    }
                    Err(e) => {
                        job.state = WithdrawJobState::Failed;
                        job.error = Some(e.to_string());
                        if let Ok(row) = tx.channel_mut(&cid) {
                            let pending = &mut row.on_chain_balance.pending_withdrawal;
                            if pending.is_some_and(|p| p.receiver == me && p.amount == amount) {
                                *pending = None;
                            }
                        }
                    }
                }
                tx.emit(TxEffect::WithdrawJobFinished {
                    withdraw_hash: withdraw_hash.to_string(),
                    outcome,
                });
                Ok(())
            })
            .await
    }

    /// Co-signs a peer's withdraw of its own balance. Every outcome is answered with a
    /// response message, a rejection carries the reason.
    pub async fn handle_withdraw_request(
        &self,
        from: Address,
        request: CooperativeWithdrawRequest,
    ) -> ChannelResult<()> {
        let result = self.approve_withdraw(from, &request).await;
        let (approver_sig, error) = match &result {
            Ok(sig) => (Some(sig.clone()), None),
            Err(e) => {
                warn!(
                    "[CooperativeWithdraw] Rejecting withdraw of {:?} from {:?}: {}",
                    from, request.withdraw_info.channel_id, e
                );
                (None, Some(e.to_string()))
            }
        };
        let response = CooperativeWithdrawResponse {
            withdraw_info: request.withdraw_info,
            requester_sig: request.requester_sig,
            approver_sig,
            error,
        };
        self.ctx
            .messenger
            .send(from, PeerMessage::CooperativeWithdrawResponse(response))
            .await?;
        result.map(|_| ())
    }

    async fn approve_withdraw(
        &self,
        from: Address,
        request: &CooperativeWithdrawRequest,
    ) -> ChannelResult<Bytes> {
        let info = &request.withdraw_info;
        let cid = info.channel_id;
        let row = self
            .ctx
            .store
            .view(|s| s.channel(&cid).cloned())
            .await?;
        if row.peer != from {
            return Err(ChannelError::InvalidPeerFrom(format!(
                "{:?} is not the peer of {:?}",
                from, cid
            )));
        }
        if row.state != ChannelState::Opened {
            return Err(ChannelError::InvalidChannelState {
                from: row.state,
                to: ChannelState::Opened,
            });
        }
        if info.withdraw.account != from {
            return Err(ChannelError::InvalidArgument(format!(
                "withdraw to {:?} instead of the requester",
                info.withdraw.account
            )));
        }
        if !info.recipient_channel_id.is_zero() {
            return Err(ChannelError::InvalidArgument(
                "withdraw into another channel is not supported".to_string(),
            ));
        }
        if !sig_is_valid(from, &info.as_bytes(), &request.requester_sig) {
            return Err(ChannelError::InvalidSignature);
        }
        let block = self.ctx.block_number().await?;
        if block > info.withdraw_deadline {
            return Err(ChannelError::DeadlinePassed(format!(
                "withdraw deadline {} at block {}",
                info.withdraw_deadline, block
            )));
        }
        let expected_seq = self.ctx.ledger.cooperative_withdraw_seq_num(cid).await? + 1;
        if info.seq_num != expected_seq {
            return Err(ChannelError::InvalidSeqNum(format!(
                "withdraw seq {} expected {}",
                info.seq_num, expected_seq
            )));
        }

        let amount = info.withdraw.amount;
        let deadline = info.withdraw_deadline;
        self.ctx
            .commit(|tx| {
                let row = tx.channel_mut(&cid)?;
                let already_reserved = row.on_chain_balance.pending_withdrawal.is_some_and(|p| {
                    p.receiver == from && p.amount == amount && p.deadline == deadline
                });
                if !already_reserved {
                    reserve_withdrawal(row, from, amount, deadline, block)?;
                }
                Ok(())
            })
            .await?;
        info!(
            "[CooperativeWithdraw] Co-signing withdraw of {} by {:?} from {:?}",
            amount, from, cid
        );
        self.ctx.signer.sign(&info.as_bytes())
    }

    pub async fn handle_withdraw_response(
        &self,
        from: Address,
        response: CooperativeWithdrawResponse,
    ) -> ChannelResult<()> {
        let info = &response.withdraw_info;
        let hash = withdraw_hash(
            self.ctx.ledger.ledger_address(),
            info.channel_id,
            info.seq_num,
        );
        match self.waiters.lock().await.remove(&hash) {
            Some(waiter) => {
                // The waiter may have timed out in the meantime.
                let _ = waiter.send((from, response));
            }
            None => debug!(
                "[CooperativeWithdraw] No pending withdraw {} for response from {:?}",
                hash, from
            ),
        }
        Ok(())
    }

    pub async fn resume_jobs(self: &Arc<Self>) -> usize {
        let pending: Vec<String> = self
            .ctx
            .store
            .view(|s| {
                s.withdraw_jobs
                    .values()
                    .filter(|job| !job.state.is_terminal())
                    .map(|job| job.withdraw_hash.clone())
                    .collect()
            })
            .await;
        for hash in &pending {
            info!("[CooperativeWithdraw] Resuming job {}", hash);
            self.spawn_dispatch(hash.clone());
        }
        pending.len()
    }

    pub async fn monitor_job(
        self: &Arc<Self>,
        withdraw_hash: &str,
        cb: Arc<dyn WithdrawCallback>,
    ) -> ChannelResult<()> {
        if !self
            .ctx
            .store
            .view(|s| s.withdraw_jobs.contains_key(withdraw_hash))
            .await
        {
            return Err(ChannelError::JobNotFound(withdraw_hash.to_string()));
        }
        self.ctx
            .effects
            .register_withdraw_callback(withdraw_hash, cb)
            .await;
        let job = self
            .ctx
            .store
            .view(|s| s.withdraw_jobs.get(withdraw_hash).cloned())
            .await
            .ok_or_else(|| ChannelError::JobNotFound(withdraw_hash.to_string()))?;
        match job.state {
            WithdrawJobState::Succeeded => {
                let tx_hash = job.tx_hash.unwrap_or_default();
                self.ctx
                    .effects
                    .notify_withdraw(withdraw_hash, Ok(tx_hash))
                    .await;
            }
            WithdrawJobState::Failed => {
                let error = ChannelError::JobFailed(job.error.unwrap_or_default());
                self.ctx
                    .effects
                    .notify_withdraw(withdraw_hash, Err(error))
                    .await;
            }
            WithdrawJobState::WaitResponse | WithdrawJobState::WaitTx => {
                self.spawn_dispatch(withdraw_hash.to_string());
            }
        }
        Ok(())
    }

    pub async fn remove_job(&self, withdraw_hash: &str) -> ChannelResult<()> {
        self.ctx
            .commit(|tx| {
                tx.withdraw_jobs
                    .remove(withdraw_hash)
                    .map(|_| ())
                    .ok_or_else(|| ChannelError::JobNotFound(withdraw_hash.to_string()))
            })
            .await
    }
}

/// Signatures in the ledger's order, by ascending signer address.
fn sorted_sigs(me: Address, my_sig: Bytes, peer: Address, peer_sig: Bytes) -> [Bytes; 2] {
    if me < peer {
        [my_sig, peer_sig]
    } else {
        [peer_sig, my_sig]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{RecordingCallbacks, TestNetwork};

    #[tokio::test]
    async fn test_cooperative_withdraw() {
        let net = TestNetwork::new(false, true).await;
        let cid = net.open_funded_channel(100, 100).await;
        let (callbacks, mut events) = RecordingCallbacks::new();

        let hash = net
            .a
            .cooperative_withdraw(cid, U256::from(30), Some(callbacks.clone()))
            .await
            .unwrap();
        assert_eq!(
            hash,
            withdraw_hash(net.a.context().protocol.ledger_address, cid, 1)
        );
        assert!(events
            .next()
            .await
            .starts_with(&format!("withdraw_ok {}", hash)));
        assert_eq!(
            net.chain.tx_kinds(),
            vec!["open_channel", "cooperative_withdraw"]
        );
        // Reserved on both sides until the event arrives.
        assert_eq!(net.a.get_balance(cid).await.unwrap().my_free, U256::from(70));
        assert_eq!(net.b.get_balance(cid).await.unwrap().peer_free, U256::from(70));

        net.deliver_events().await;
        for (node, mine) in [(&net.a, true), (&net.b, false)] {
            let row = net.row(node, cid).await.unwrap();
            assert!(row.on_chain_balance.pending_withdrawal.is_none());
            let withdrawn = if mine {
                row.on_chain_balance.my_withdrawal
            } else {
                row.on_chain_balance.peer_withdrawal
            };
            assert_eq!(withdrawn, U256::from(30));
        }
        assert_eq!(net.a.get_balance(cid).await.unwrap().my_free, U256::from(70));
        assert_eq!(net.a.context().metrics.coop_withdraw_events.get(), 1);

        net.a.monitor_withdraw_job(&hash, callbacks).await.unwrap();
        assert!(events
            .next()
            .await
            .starts_with(&format!("withdraw_ok {}", hash)));
    }

    #[tokio::test]
    async fn test_second_withdraw_while_pending() {
        let net = TestNetwork::new(false, true).await;
        let cid = net.open_funded_channel(100, 100).await;

        net.a
            .cooperative_withdraw(cid, U256::from(10), None)
            .await
            .unwrap();
        let err = net
            .a
            .cooperative_withdraw(cid, U256::from(10), None)
            .await
            .unwrap_err();
        assert_eq!(err, ChannelError::PreviousWithdrawPending);
    }

    #[tokio::test]
    async fn test_withdraw_rejected_by_peer() {
        let net = TestNetwork::new(false, true).await;
        let cid = net.open_funded_channel(100, 100).await;
        // b believes a only deposited 10.
        net.store_of(&net.b)
            .transactional(|tx| {
                tx.channel_mut(&cid)?.on_chain_balance.peer_deposit = U256::from(10);
                Ok(())
            })
            .await
            .unwrap();
        let (callbacks, mut events) = RecordingCallbacks::new();

        let hash = net
            .a
            .cooperative_withdraw(cid, U256::from(30), Some(callbacks))
            .await
            .unwrap();
        let event = events.next().await;
        assert!(event.starts_with(&format!("withdraw_error {}", hash)));
        assert!(event.contains("insufficient balance"));

        assert_eq!(net.chain.tx_kinds(), vec!["open_channel"]);
        let job = net
            .store_of(&net.a)
            .view(|s| s.withdraw_jobs.get(&hash).cloned())
            .await
            .unwrap();
        assert_eq!(job.state, WithdrawJobState::Failed);
        assert_eq!(net.a.get_balance(cid).await.unwrap().my_free, U256::from(100));
        assert!(net
            .row(&net.b, cid)
            .await
            .unwrap()
            .on_chain_balance
            .pending_withdrawal
            .is_none());
    }

    #[tokio::test]
    async fn test_approver_rejects_forged_request() {
        let net = TestNetwork::new(false, true).await;
        let cid = net.open_funded_channel(100, 100).await;
        let info = CooperativeWithdrawInfo {
            channel_id: cid,
            seq_num: 1,
            withdraw: AccountAmtPair {
                account: net.a.address(),
                amount: U256::from(10),
            },
            withdraw_deadline: 5000,
            recipient_channel_id: ChannelId::zero(),
        };
        // Signed by b itself rather than the requester.
        let requester_sig = net.b.context().signer.sign(&info.as_bytes()).unwrap();
        let err = net
            .b
            .handle_message(
                net.a.address(),
                PeerMessage::CooperativeWithdrawRequest(CooperativeWithdrawRequest {
                    withdraw_info: info,
                    requester_sig,
                }),
            )
            .await
            .unwrap_err();
        assert_eq!(err, ChannelError::InvalidSignature);
        assert!(net
            .row(&net.b, cid)
            .await
            .unwrap()
            .on_chain_balance
            .pending_withdrawal
            .is_none());
    }

    #[test]
    fn test_sorted_sigs() {
        let low = Address::repeat_byte(1);
        let high = Address::repeat_byte(2);
        let low_sig = Bytes::from(vec![1u8]);
        let high_sig = Bytes::from(vec![2u8]);
        let expected = [low_sig.clone(), high_sig.clone()];
        assert_eq!(sorted_sigs(low, low_sig.clone(), high, high_sig.clone()), expected);
        assert_eq!(sorted_sigs(high, high_sig, low, low_sig), expected);
    }

    #[tokio::test]
    async fn test_late_withdraw_log_keeps_newer_totals() {
        let net = TestNetwork::new(false, true).await;
        let cid = net.open_funded_channel(100, 100).await;
        let (a, b) = (net.a.address(), net.b.address());
        let mine = |amount: u64| {
            if a < b {
                [U256::from(amount), U256::zero()]
            } else {
                [U256::zero(), U256::from(amount)]
            }
        };

        let (callbacks, mut events) = RecordingCallbacks::new();
        for amount in [30, 20] {
            net.a
                .cooperative_withdraw(cid, U256::from(amount), Some(callbacks.clone()))
                .await
                .unwrap();
            assert!(events.next().await.starts_with("withdraw_ok"));
            net.deliver_events().await;
        }
        assert_eq!(net.a.get_balance(cid).await.unwrap().my_withdrawal, U256::from(50));

        // The first withdraw's log arrives again after the second one.
        for withdrawals in [mine(30), [U256::zero(); 2]] {
            net.chain.emit(LedgerEvent::CooperativeWithdraw {
                cid,
                withdrawn_amount: U256::from(30),
                receiver: a,
                recipient_cid: ChannelId::zero(),
                deposits: [U256::from(100); 2],
                withdrawals,
                seq_num: 1,
            });
        }
        net.deliver_events().await;

        for (node, is_a) in [(&net.a, true), (&net.b, false)] {
            let row = net.row(node, cid).await.unwrap();
            let withdrawn = if is_a {
                row.on_chain_balance.my_withdrawal
            } else {
                row.on_chain_balance.peer_withdrawal
            };
            assert_eq!(withdrawn, U256::from(50));
            assert!(row.on_chain_balance.pending_withdrawal.is_none());
        }
        assert_eq!(net.a.get_balance(cid).await.unwrap().my_free, U256::from(50));
        assert_eq!(net.a.context().metrics.coop_withdraw_events.get(), 4);
    }
}
