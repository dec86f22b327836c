// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Wiring of the protocol components and dispatch of incoming peer traffic.

use crate::auth::AuthProtocol;
use crate::balance::{compute_balance, ChannelBalance};
use crate::config::ProtocolConfig;
use crate::crypto::ChannelSigner;
use crate::dispute::DisputeProcessor;
use crate::error::{ChannelError, ChannelResult};
use crate::jobs::cooperative_withdraw::{CooperativeWithdrawProcessor, WithdrawCallback};
use crate::jobs::deposit::{DepositCallback, DepositProcessor};
use crate::jobs::JobRegistry;
use crate::ledger::{LedgerClient, LedgerTx, TxReceipt};
use crate::messenger::PeerMessenger;
use crate::metrics::ChannelMetrics;
use crate::monitor::EventMonitor;
use crate::open_channel::{OpenChannelCallback, OpenChannelProcessor};
use crate::policy::PolicyEngine;
use crate::retry_with_max_elapsed_time;
use crate::store::{ChannelStore, StoreTx, TxOutput};
use crate::types::{
    ChannelId, PayId, PeerMessage, PeerRequest, PeerResponse, TokenInfo, TxEffect,
};
use ethers::types::{Address, TxHash, U256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tap::TapFallible;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Consumer of channel graph changes, typically the routing layer.
pub trait RouteObserver: Send + Sync {
    fn edge_added(&self, cid: ChannelId, peers: [Address; 2], token: TokenInfo);

    fn edge_removed(&self, cid: ChannelId);
}

/// Fires application callbacks for effects queued by committed store transactions.
///
/// Each registered callback fires at most once and always on its own task, so a slow
/// callback never holds up protocol processing.
pub struct EffectDispatcher {
    open_callbacks: Mutex<HashMap<TokenInfo, Arc<dyn OpenChannelCallback>>>,
    deposit_callbacks: Mutex<HashMap<String, Arc<dyn DepositCallback>>>,
    withdraw_callbacks: Mutex<HashMap<String, Arc<dyn WithdrawCallback>>>,
    route_observer: Option<Arc<dyn RouteObserver>>,
    metrics: Arc<ChannelMetrics>,
}

impl EffectDispatcher {
    pub fn new(metrics: Arc<ChannelMetrics>, route_observer: Option<Arc<dyn RouteObserver>>) -> Self {
        Self {
            open_callbacks: Mutex::new(HashMap::new()),
            deposit_callbacks: Mutex::new(HashMap::new()),
            withdraw_callbacks: Mutex::new(HashMap::new()),
            route_observer,
            metrics,
        }
    }

    pub async fn register_open_callback(&self, token: TokenInfo, cb: Arc<dyn OpenChannelCallback>) {
        self.open_callbacks.lock().await.insert(token, cb);
    }

    pub async fn unregister_open_callback(&self, token: TokenInfo) {
        self.open_callbacks.lock().await.remove(&token);
    }

    pub async fn register_deposit_callback(&self, job_id: &str, cb: Arc<dyn DepositCallback>) {
        self.deposit_callbacks
            .lock()
            .await
            .insert(job_id.to_string(), cb);
    }

    pub async fn register_withdraw_callback(&self, withdraw_hash: &str, cb: Arc<dyn WithdrawCallback>) {
        self.withdraw_callbacks
            .lock()
            .await
            .insert(withdraw_hash.to_string(), cb);
    }

    pub async fn dispatch(&self, effects: Vec<TxEffect>) {
        for effect in effects {
            self.dispatch_one(effect).await;
        }
    }

    async fn dispatch_one(&self, effect: TxEffect) {
        match effect {
            TxEffect::OpenChannelFinished { token, cid } => {
                self.metrics
                    .open_channel_events
                    .with_label_values(&["opened"])
                    .inc();
                match self.open_callbacks.lock().await.remove(&token) {
                    Some(cb) => {
                        tokio::spawn(async move { cb.handle_open_channel_finish(cid) });
                    }
                    None => debug!("[OpenChannel] No callback for {:?} opened {:?}", token, cid),
                }
            }
            TxEffect::OpenChannelFailed { token, error } => {
                self.metrics
                    .open_channel_events
                    .with_label_values(&["failed"])
                    .inc();
                match self.open_callbacks.lock().await.remove(&token) {
                    Some(cb) => {
                        tokio::spawn(async move { cb.handle_open_channel_err(error) });
                    }
                    None => warn!("[OpenChannel] Open of {:?} failed: {}", token, error),
                }
            }
            TxEffect::RouteEdgeAdded { cid, peers, token } => {
                info!("Channel {:?} between {:?} is open", cid, peers);
                if let Some(observer) = &self.route_observer {
                    observer.edge_added(cid, peers, token);
                }
            }
            TxEffect::RouteEdgeRemoved { cid } => {
                if let Some(observer) = &self.route_observer {
                    observer.edge_removed(cid);
                }
            }
            TxEffect::ChannelClosed { cid } => {
                info!("Channel {:?} is closed", cid);
            }
            TxEffect::DepositJobFinished { job_id, outcome } => {
                self.record_job_result("deposit", &outcome);
                self.notify_deposit(&job_id, outcome).await;
            }
            TxEffect::WithdrawJobFinished {
                withdraw_hash,
                outcome,
            } => {
                self.record_job_result("cooperative_withdraw", &outcome);
                self.notify_withdraw(&withdraw_hash, outcome).await;
            }
        }
    }

    /// Fires and drops the deposit callback of `job_id`, if one is registered.
    pub async fn notify_deposit(&self, job_id: &str, outcome: Result<TxHash, ChannelError>) {
        let Some(cb) = self.deposit_callbacks.lock().await.remove(job_id) else {
            return;
        };
        let job_id = job_id.to_string();
        tokio::spawn(async move {
            match outcome {
                Ok(tx_hash) => cb.on_deposit(&job_id, tx_hash),
                Err(e) => cb.on_error(&job_id, e),
            }
        });
    }

    pub async fn notify_withdraw(
        &self,
        withdraw_hash: &str,
        outcome: Result<TxHash, ChannelError>,
    ) {
        let Some(cb) = self.withdraw_callbacks.lock().await.remove(withdraw_hash) else {
            return;
        };
        let withdraw_hash = withdraw_hash.to_string();
        tokio::spawn(async move {
            match outcome {
                Ok(tx_hash) => cb.on_withdraw(&withdraw_hash, tx_hash),
                Err(e) => cb.on_error(&withdraw_hash, e),
            }
        });
    }

    fn record_job_result(&self, kind: &str, outcome: &Result<TxHash, ChannelError>) {
        let result = if outcome.is_ok() { "succeeded" } else { "failed" };
        self.metrics
            .job_results
            .with_label_values(&[kind, result])
            .inc();
    }
}

/// Everything a protocol component needs to talk to the outside world.
#[derive(Clone)]
pub struct ChannelContext {
    pub signer: Arc<dyn ChannelSigner>,
    pub store: Arc<ChannelStore>,
    pub ledger: Arc<dyn LedgerClient>,
    pub monitor: Arc<dyn EventMonitor>,
    pub messenger: Arc<dyn PeerMessenger>,
    pub metrics: Arc<ChannelMetrics>,
    pub protocol: ProtocolConfig,
    pub effects: Arc<EffectDispatcher>,
}

impl ChannelContext {
    pub fn me(&self) -> Address {
        self.signer.address()
    }

    /// Runs a store transaction and dispatches its effects once it committed.
    pub async fn commit<T, F>(&self, f: F) -> ChannelResult<T>
    where
        F: FnOnce(&mut StoreTx<'_>) -> ChannelResult<T>,
    {
        let TxOutput { value, effects } = self.store.transactional(f).await?;
        self.effects.dispatch(effects).await;
        Ok(value)
    }

    pub async fn block_number(&self) -> ChannelResult<u64> {
        match retry_with_max_elapsed_time!(
            self.ledger.block_number(),
            self.protocol.tx_retry_max_elapsed
        ) {
            Ok(Ok(block)) => Ok(block),
            Ok(Err(e)) | Err(e) => Err(e),
        }
    }

    /// Sends a transaction. Submission is never retried, a failed send may still have
    /// reached the mempool.
    pub async fn submit(&self, tx: LedgerTx) -> ChannelResult<TxHash> {
        let kind = tx.kind();
        let tx_hash = self
            .ledger
            .submit(tx)
            .await
            .tap_err(|e| error!("Failed to submit {} transaction: {}", kind, e))?;
        info!("Submitted {} transaction {:?}", kind, tx_hash);
        Ok(tx_hash)
    }

    /// Waits until `tx_hash` is mined. A reverted transaction is an error.
    pub async fn wait_mined(&self, kind: &str, tx_hash: TxHash) -> ChannelResult<TxReceipt> {
        let start = Instant::now();
        let receipt = match retry_with_max_elapsed_time!(
            self.ledger.wait_mined(tx_hash),
            self.protocol.tx_retry_max_elapsed
        ) {
            Ok(Ok(receipt)) => receipt,
            Ok(Err(e)) | Err(e) => return Err(e),
        };
        self.metrics
            .tx_mined_latency
            .with_label_values(&[kind])
            .observe(start.elapsed().as_secs_f64());
        if !receipt.success {
            error!("{} transaction {:?} reverted", kind, tx_hash);
            return Err(ChannelError::TxFailed(tx_hash));
        }
        Ok(receipt)
    }

    pub async fn submit_and_wait(&self, tx: LedgerTx) -> ChannelResult<TxReceipt> {
        let kind = tx.kind();
        let tx_hash = self.submit(tx).await?;
        self.wait_mined(kind, tx_hash).await
    }
}

pub struct ChannelNode {
    ctx: ChannelContext,
    auth: Arc<AuthProtocol>,
    open_channel: Arc<OpenChannelProcessor>,
    dispute: Arc<DisputeProcessor>,
    deposit: Arc<DepositProcessor>,
    withdraw: Arc<CooperativeWithdrawProcessor>,
}

impl ChannelNode {
    pub fn new(ctx: ChannelContext, policy: PolicyEngine) -> Self {
        let jobs = Arc::new(JobRegistry::new(ctx.metrics.clone()));
        Self {
            auth: Arc::new(AuthProtocol::new(ctx.clone())),
            open_channel: Arc::new(OpenChannelProcessor::new(ctx.clone(), Arc::new(policy))),
            dispute: Arc::new(DisputeProcessor::new(ctx.clone())),
            deposit: Arc::new(DepositProcessor::new(ctx.clone(), jobs.clone())),
            withdraw: Arc::new(CooperativeWithdrawProcessor::new(ctx.clone(), jobs)),
            ctx,
        }
    }

    pub fn address(&self) -> Address {
        self.ctx.me()
    }

    pub fn context(&self) -> &ChannelContext {
        &self.ctx
    }

    /// Arms ledger event monitors and resumes every unfinished job.
    pub async fn start(&self) -> ChannelResult<()> {
        self.open_channel.start_monitors().await?;
        self.dispute.start_monitors().await?;
        self.deposit.start_monitors().await?;
        self.withdraw.start_monitors().await?;
        let deposits = self.deposit.resume_jobs().await;
        let withdraws = self.withdraw.resume_jobs().await;
        info!(
            "Channel node {:?} started, resumed {} deposit and {} withdraw jobs",
            self.ctx.me(),
            deposits,
            withdraws
        );
        Ok(())
    }

    pub async fn handle_request(
        &self,
        from: Address,
        request: PeerRequest,
    ) -> ChannelResult<PeerResponse> {
        let result = match request {
            PeerRequest::Auth(req) => self
                .auth
                .handle_auth_req(from, req)
                .await
                .map(PeerResponse::AuthAck),
            PeerRequest::OpenChannel(req) => self
                .open_channel
                .process_open_request(from, req)
                .await
                .map(PeerResponse::OpenChannel),
            PeerRequest::TcbOpenChannel(req) => self
                .open_channel
                .process_tcb_open_request(from, req)
                .await
                .map(PeerResponse::OpenChannel),
        };
        result.tap_err(|e| {
            self.ctx.metrics.record_error(e);
            warn!("Request from {:?} failed: {}", from, e);
        })
    }

    pub async fn handle_message(&self, from: Address, message: PeerMessage) -> ChannelResult<()> {
        let result = match message {
            PeerMessage::CooperativeWithdrawRequest(req) => {
                self.withdraw.handle_withdraw_request(from, req).await
            }
            PeerMessage::CooperativeWithdrawResponse(resp) => {
                self.withdraw.handle_withdraw_response(from, resp).await
            }
        };
        result.tap_err(|e| {
            self.ctx.metrics.record_error(e);
            warn!("Message from {:?} failed: {}", from, e);
        })
    }

    /// Reconciles channel state with `peer`, returning the number of channels applied.
    pub async fn authenticate(&self, peer: Address) -> ChannelResult<usize> {
        self.auth.authenticate(peer).await
    }

    pub async fn open_channel(
        &self,
        peer: Address,
        self_amount: U256,
        peer_amount: U256,
        token: TokenInfo,
        osp_to_osp: bool,
        cb: Option<Arc<dyn OpenChannelCallback>>,
    ) -> ChannelResult<ChannelId> {
        self.open_channel
            .open_channel(peer, self_amount, peer_amount, token, osp_to_osp, cb)
            .await
    }

    pub async fn tcb_open_channel(
        &self,
        peer: Address,
        peer_amount: U256,
        token: TokenInfo,
    ) -> ChannelResult<ChannelId> {
        self.open_channel
            .tcb_open_channel(peer, peer_amount, token)
            .await
    }

    pub async fn instantiate_channel(&self, cid: ChannelId) -> ChannelResult<TxHash> {
        self.open_channel.instantiate_channel(cid).await
    }

    pub async fn deposit(
        &self,
        cid: ChannelId,
        amount: U256,
        cb: Option<Arc<dyn DepositCallback>>,
    ) -> ChannelResult<String> {
        self.deposit.deposit(cid, amount, cb).await
    }

    pub async fn monitor_deposit_job(
        &self,
        job_id: &str,
        cb: Arc<dyn DepositCallback>,
    ) -> ChannelResult<()> {
        self.deposit.monitor_job(job_id, cb).await
    }

    pub async fn remove_deposit_job(&self, job_id: &str) -> ChannelResult<()> {
        self.deposit.remove_job(job_id).await
    }

    pub async fn cooperative_withdraw(
        &self,
        cid: ChannelId,
        amount: U256,
        cb: Option<Arc<dyn WithdrawCallback>>,
    ) -> ChannelResult<String> {
        self.withdraw.cooperative_withdraw(cid, amount, cb).await
    }

    pub async fn monitor_withdraw_job(
        &self,
        withdraw_hash: &str,
        cb: Arc<dyn WithdrawCallback>,
    ) -> ChannelResult<()> {
        self.withdraw.monitor_job(withdraw_hash, cb).await
    }

    pub async fn remove_withdraw_job(&self, withdraw_hash: &str) -> ChannelResult<()> {
        self.withdraw.remove_job(withdraw_hash).await
    }

    pub async fn intend_settle(&self, cid: ChannelId) -> ChannelResult<TxHash> {
        self.dispute.intend_settle(cid).await
    }

    pub async fn confirm_settle(&self, cid: ChannelId) -> ChannelResult<TxHash> {
        self.dispute.confirm_settle(cid).await
    }

    pub async fn settle_conditional_pay(&self, pay_id: PayId) -> ChannelResult<Option<TxHash>> {
        self.dispute.settle_conditional_pay(pay_id).await
    }

    pub async fn intend_withdraw(
        &self,
        cid: ChannelId,
        amount: U256,
        recipient_cid: ChannelId,
    ) -> ChannelResult<TxHash> {
        self.dispute.intend_withdraw(cid, amount, recipient_cid).await
    }

    pub async fn confirm_withdraw(&self, cid: ChannelId) -> ChannelResult<TxHash> {
        self.dispute.confirm_withdraw(cid).await
    }

    pub async fn veto_withdraw(&self, cid: ChannelId) -> ChannelResult<TxHash> {
        self.dispute.veto_withdraw(cid).await
    }

    pub async fn get_balance(&self, cid: ChannelId) -> ChannelResult<ChannelBalance> {
        let block = self.ctx.block_number().await?;
        self.ctx
            .store
            .view(|s| s.channel(&cid).map(|row| compute_balance(row, block)))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{RecordingCallbacks, TestNetwork};
    use crate::types::ChannelState;

    #[tokio::test]
    async fn test_effects_fire_registered_callbacks_once() {
        let metrics = Arc::new(ChannelMetrics::new_for_testing());
        let dispatcher = EffectDispatcher::new(metrics.clone(), None);
        let (callbacks, mut events) = RecordingCallbacks::new();
        let token = TokenInfo::eth();
        let cid = ChannelId::repeat_byte(1);

        dispatcher
            .register_open_callback(token, callbacks.clone())
            .await;
        dispatcher
            .dispatch(vec![
                TxEffect::OpenChannelFinished { token, cid },
                TxEffect::OpenChannelFinished { token, cid },
            ])
            .await;
        assert_eq!(events.next().await, format!("open_finished {:?}", cid));
        assert!(events.try_next().is_none());
        assert_eq!(
            metrics
                .open_channel_events
                .with_label_values(&["opened"])
                .get(),
            2
        );

        dispatcher
            .register_deposit_callback("job", callbacks.clone())
            .await;
        dispatcher
            .dispatch(vec![TxEffect::DepositJobFinished {
                job_id: "job".to_string(),
                outcome: Err(ChannelError::TxFailed(TxHash::zero())),
            }])
            .await;
        assert!(events.next().await.starts_with("deposit_error job"));
        assert_eq!(
            metrics
                .job_results
                .with_label_values(&["deposit", "failed"])
                .get(),
            1
        );
    }

    #[tokio::test]
    async fn test_get_balance_of_unknown_channel() {
        let net = TestNetwork::new(false, false).await;
        let err = net
            .a
            .get_balance(ChannelId::repeat_byte(9))
            .await
            .unwrap_err();
        assert_eq!(err, ChannelError::ChannelNotFound(ChannelId::repeat_byte(9)));

        let cid = net.open_funded_channel(100, 100).await;
        let balance = net.a.get_balance(cid).await.unwrap();
        assert_eq!(balance.my_free, U256::from(100));
        assert_eq!(balance.peer_free, U256::from(100));
        assert_eq!(
            net.a
                .context()
                .store
                .view(|s| s.channel_state(&cid))
                .await,
            ChannelState::Opened
        );
    }
}
