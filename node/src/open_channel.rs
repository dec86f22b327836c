// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Channel opening.
//!
//! A standard open is signed by both parties and submitted by whichever side carries the
//! deposit. A trust-before-collateral (TCB) open lets an OSP promise a virtual deposit and
//! mark the channel usable right away; the on-chain open follows later through
//! [`OpenChannelProcessor::instantiate_channel`]. Both paths end in the same OpenChannel
//! event handler.

use crate::crypto::{compute_channel_id, sig_is_valid, ChannelSigner};
use crate::encoding::ChannelMessageEncoding;
use crate::error::{ChannelError, ChannelResult};
use crate::fsm;
use crate::ledger::LedgerTx;
use crate::monitor::{event_callback, CallbackId, EventCallback, MonitorConfig};
use crate::node::ChannelContext;
use crate::policy::PolicyEngine;
use crate::store::{now_millis, OpenChannelTs, StoreTx, TcbCommitment};
use crate::types::{
    AccountAmtPair, ChannelId, ChannelInitializer, ChannelRow, ChannelState, LedgerEvent,
    LedgerEventKind, LedgerLog, OnChainBalance, OpenBy, OpenChannelRequest, OpenChannelResponse,
    OpenChannelStatus, PeerRequest, PeerResponse, SeqNums, SignedSimplexState,
    SimplexPaymentChannel, TokenDistribution, TokenInfo, TxEffect,
};
use crate::{
    MAX_OPEN_CHANNEL_TIMEOUT, OPEN_CHANNEL_RPC_DEADLINE, OPEN_CHANNEL_TIMEOUT,
    TCB_TIMEOUT_IN_BLOCKS,
};
use ethers::types::{Address, TxHash, U256};
use std::sync::Arc;
use tap::TapFallible;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

pub const OPEN_CHANNEL_MONITOR_BIT: &str = "OpenChannel";

pub trait OpenChannelCallback: Send + Sync {
    fn handle_open_channel_finish(&self, cid: ChannelId);

    fn handle_open_channel_err(&self, err: ChannelError);
}

/// Both directions of a fresh channel at sequence 0, signed in this node's slots.
pub(crate) fn signed_empty_simplexes(
    signer: &dyn ChannelSigner,
    cid: ChannelId,
    peer: Address,
    token: TokenInfo,
) -> ChannelResult<(SignedSimplexState, SignedSimplexState)> {
    let me = signer.address();
    let mine = SimplexPaymentChannel::new_empty(cid, me, peer, token);
    let theirs = SimplexPaymentChannel::new_empty(cid, peer, me, token);
    Ok((
        SignedSimplexState {
            sig_of_peer_from: Some(signer.sign(&mine.as_bytes())?),
            sig_of_peer_to: None,
            simplex: mine,
        },
        SignedSimplexState {
            sig_of_peer_from: None,
            sig_of_peer_to: Some(signer.sign(&theirs.as_bytes())?),
            simplex: theirs,
        },
    ))
}

pub(crate) fn new_channel_row(
    cid: ChannelId,
    peer: Address,
    token: TokenInfo,
    ledger: Address,
    state: ChannelState,
    on_chain_balance: OnChainBalance,
    open_response: Option<OpenChannelResponse>,
    simplexes: (SignedSimplexState, SignedSimplexState),
) -> ChannelRow {
    let (self_simplex, peer_simplex) = simplexes;
    ChannelRow {
        cid,
        peer,
        token,
        ledger,
        state,
        open_response,
        on_chain_balance,
        self_simplex,
        peer_simplex,
        seq_nums: SeqNums::starting_at(0),
    }
}

/// Initial balances promised by an initializer.
pub(crate) fn initial_balance(
    initializer: &ChannelInitializer,
    me: Address,
    peer: Address,
) -> OnChainBalance {
    let d = &initializer.init_distribution.distribution;
    OnChainBalance::from_sorted(me, peer, [d[0].amount, d[1].amount], [U256::zero(); 2])
}

fn build_initializer(
    me: Address,
    peer: Address,
    my_amount: U256,
    peer_amount: U256,
    token: TokenInfo,
    open_deadline: u64,
    dispute_timeout: u64,
    submitter: Address,
) -> ChannelInitializer {
    let mine = AccountAmtPair {
        account: me,
        amount: my_amount,
    };
    let theirs = AccountAmtPair {
        account: peer,
        amount: peer_amount,
    };
    let distribution = if me < peer {
        [mine, theirs]
    } else {
        [theirs, mine]
    };
    let msg_value_receiver = if distribution[0].account == submitter {
        0
    } else {
        1
    };
    ChannelInitializer {
        init_distribution: TokenDistribution {
            token,
            distribution,
        },
        open_deadline,
        dispute_timeout,
        msg_value_receiver,
    }
}

/// Native value `submitter` attaches to the open transaction.
fn open_value(initializer: &ChannelInitializer, submitter: Address) -> U256 {
    let receiver = initializer.peers()[initializer.msg_value_receiver as usize];
    if initializer.token().is_eth() && receiver == submitter {
        initializer.amount_of(submitter).unwrap_or_default()
    } else {
        U256::zero()
    }
}

fn begin_open(tx: &mut StoreTx<'_>, peer: Address, token: TokenInfo) -> ChannelResult<()> {
    if let Some(existing) = tx.cid_by_peer_token(peer, token) {
        if tx.has_channel(&existing) {
            return Err(ChannelError::ChannelAlreadyExists(existing));
        }
    }
    let now = now_millis();
    if let Some(ts) = tx.open_channel_ts(peer, token) {
        let age = now.saturating_sub(ts.request_ts);
        if ts.finish_ts.is_none() && age < MAX_OPEN_CHANNEL_TIMEOUT.as_millis() as u64 {
            return Err(ChannelError::DuplicateOpenRequest);
        }
        debug!(
            "[OpenChannel] Replacing in-flight record with {:?} for {:?}, age {}ms",
            peer, token, age
        );
    }
    tx.put_open_channel_ts(
        peer,
        token,
        OpenChannelTs {
            request_ts: now,
            finish_ts: None,
        },
    );
    Ok(())
}

fn finish_open(tx: &mut StoreTx<'_>, peer: Address, token: TokenInfo) {
    if let Some(mut ts) = tx.open_channel_ts(peer, token) {
        if ts.finish_ts.is_none() {
            ts.finish_ts = Some(now_millis());
            tx.put_open_channel_ts(peer, token, ts);
        }
    }
}

struct ArmedMonitor {
    id: CallbackId,
    start: u64,
    end: u64,
}

pub struct OpenChannelProcessor {
    ctx: ChannelContext,
    policy: Arc<PolicyEngine>,
    // Single-shot OpenChannel watch of a non-OSP node
    open_monitor: Mutex<Option<ArmedMonitor>>,
}

impl OpenChannelProcessor {
    pub fn new(ctx: ChannelContext, policy: Arc<PolicyEngine>) -> Self {
        Self {
            ctx,
            policy,
            open_monitor: Mutex::new(None),
        }
    }

    pub async fn start_monitors(self: &Arc<Self>) -> ChannelResult<()> {
        let ledger = self.ctx.ledger.ledger_address();
        if self.ctx.protocol.is_osp {
            self.ctx
                .monitor
                .monitor(
                    MonitorConfig::new(LedgerEventKind::OpenChannel, ledger),
                    self.open_event_callback(),
                )
                .await?;
            return Ok(());
        }

        let (armed, tcb_deadline) = self
            .ctx
            .store
            .view(|s| {
                let tcb_deadline = s
                    .channels
                    .values()
                    .filter(|row| {
                        matches!(
                            row.state,
                            ChannelState::TrustOpened | ChannelState::Instantiating
                        )
                    })
                    .filter_map(|row| row.open_response.as_ref())
                    .map(|resp| resp.channel_initializer.open_deadline)
                    .max();
                (s.has_monitor_bit(OPEN_CHANNEL_MONITOR_BIT), tcb_deadline)
            })
            .await;
        if armed {
            let block = self.ctx.block_number().await?;
            let end = std::cmp::max(
                block + OPEN_CHANNEL_TIMEOUT,
                tcb_deadline.unwrap_or_default(),
            );
            info!("[OpenChannel] Re-arming OpenChannel monitor up to block {}", end);
            self.arm_open_monitor(block, end).await?;
        }
        Ok(())
    }

    fn open_event_callback(self: &Arc<Self>) -> EventCallback {
        let this = Arc::downgrade(self);
        event_callback(move |_id, log| {
            let this = this.clone();
            async move {
                if let Some(this) = this.upgrade() {
                    this.handle_open_event(log).await;
                }
            }
        })
    }

    /// Watches OpenChannel events in `[start, end]`. OSP nodes watch permanently instead.
    async fn arm_open_monitor(self: &Arc<Self>, start: u64, end: u64) -> ChannelResult<()> {
        if self.ctx.protocol.is_osp {
            return Ok(());
        }
        let mut armed = self.open_monitor.lock().await;
        let mut start = start;
        if let Some(current) = armed.as_ref() {
            if current.end >= end {
                return Ok(());
            }
            start = std::cmp::min(start, current.start);
            self.ctx.monitor.remove_event(current.id).await;
        }
        let config = MonitorConfig {
            start_block: Some(start),
            end_block: Some(end),
            ..MonitorConfig::new(LedgerEventKind::OpenChannel, self.ctx.ledger.ledger_address())
        };
        let id = self
            .ctx
            .monitor
            .monitor(config, self.open_event_callback())
            .await?;
        *armed = Some(ArmedMonitor { id, start, end });
        drop(armed);
        self.ctx
            .commit(|tx| {
                tx.put_monitor_bit(OPEN_CHANNEL_MONITOR_BIT);
                Ok(())
            })
            .await
    }

    async fn maybe_remove_open_monitor(&self) {
        if self.ctx.protocol.is_osp {
            return;
        }
        let mut armed = self.open_monitor.lock().await;
        if self.ctx.store.view(|s| s.has_unfinished_opens()).await {
            return;
        }
        if let Some(current) = armed.take() {
            debug!("[OpenChannel] Removing OpenChannel monitor {}", current.id);
            self.ctx.monitor.remove_event(current.id).await;
        }
        drop(armed);
        let _ = self
            .ctx
            .commit(|tx| {
                tx.delete_monitor_bit(OPEN_CHANNEL_MONITOR_BIT);
                Ok(())
            })
            .await
            .tap_err(|e| error!("[OpenChannel] Failed to clear monitor bit: {}", e));
    }

    async fn ensure_allowance(&self, token: Address, amount: U256) -> ChannelResult<()> {
        let me = self.ctx.me();
        let spender = self.ctx.ledger.ledger_address();
        let allowance = self.ctx.ledger.erc20_allowance(token, me, spender).await?;
        if allowance >= amount {
            return Ok(());
        }
        info!(
            "[OpenChannel] Approving {} of token {:?}, allowance {}",
            amount, token, allowance
        );
        self.ctx
            .submit_and_wait(LedgerTx::Erc20Approve {
                token,
                spender,
                amount,
            })
            .await?;
        Ok(())
    }

    /// Checks a peer-built initializer before this node signs it.
    fn validate_request(&self, from: Address, request: &OpenChannelRequest) -> ChannelResult<()> {
        let initializer = &request.channel_initializer;
        if !initializer.is_sorted() {
            return Err(ChannelError::InvalidArgument(
                "peers not in ascending order".to_string(),
            ));
        }
        if initializer.msg_value_receiver > 1 {
            return Err(ChannelError::InvalidArgument(format!(
                "msg value receiver {} out of range",
                initializer.msg_value_receiver
            )));
        }
        match initializer.counterparty(self.ctx.me()) {
            Some(peer) if peer == from => {}
            Some(peer) => {
                return Err(ChannelError::InvalidPeerFrom(format!(
                    "request from {:?} for counterparty {:?}",
                    from, peer
                )))
            }
            None => {
                return Err(ChannelError::InvalidArgument(
                    "self is not a participant".to_string(),
                ))
            }
        }
        if !sig_is_valid(from, &initializer.as_bytes(), &request.requester_sig) {
            return Err(ChannelError::InvalidSignature);
        }
        let protocol = &self.ctx.protocol;
        if initializer.dispute_timeout < protocol.min_dispute_timeout
            || initializer.dispute_timeout > protocol.max_dispute_timeout
        {
            return Err(ChannelError::PolicyRejected(format!(
                "dispute timeout {} outside [{}, {}]",
                initializer.dispute_timeout,
                protocol.min_dispute_timeout,
                protocol.max_dispute_timeout
            )));
        }
        Ok(())
    }

    fn validate_response(
        &self,
        peer: Address,
        initializer: &ChannelInitializer,
        response: PeerResponse,
    ) -> ChannelResult<OpenChannelResponse> {
        let PeerResponse::OpenChannel(response) = response else {
            return Err(ChannelError::InvalidArgument(
                "unexpected response to open channel request".to_string(),
            ));
        };
        if &response.channel_initializer != initializer {
            return Err(ChannelError::InvalidArgument(
                "approver changed the channel initializer".to_string(),
            ));
        }
        if !sig_is_valid(peer, &initializer.as_bytes(), &response.approver_sig) {
            return Err(ChannelError::InvalidSignature);
        }
        Ok(response)
    }

    async fn send_open_request(
        &self,
        peer: Address,
        request: PeerRequest,
    ) -> ChannelResult<PeerResponse> {
        match tokio::time::timeout(
            OPEN_CHANNEL_RPC_DEADLINE,
            self.ctx.messenger.request(peer, request),
        )
        .await
        {
            Ok(response) => response,
            Err(_) => Err(ChannelError::Timeout(format!(
                "open channel request to {:?}",
                peer
            ))),
        }
    }

    /// Requests a standard open with `peer`. Completion is reported through `cb` once
    /// the OpenChannel event is observed.
    pub async fn open_channel(
        self: &Arc<Self>,
        peer: Address,
        self_amount: U256,
        peer_amount: U256,
        token: TokenInfo,
        osp_to_osp: bool,
        cb: Option<Arc<dyn OpenChannelCallback>>,
    ) -> ChannelResult<ChannelId> {
        if peer == self.ctx.me() {
            return Err(ChannelError::InvalidArgument(
                "cannot open a channel with self".to_string(),
            ));
        }
        if self_amount.is_zero() && peer_amount.is_zero() {
            return Err(ChannelError::InvalidArgument(
                "both deposits are zero".to_string(),
            ));
        }
        let block = self.ctx.block_number().await?;
        self.ctx.commit(|tx| begin_open(tx, peer, token)).await?;

        match self
            .request_open(peer, self_amount, peer_amount, token, osp_to_osp, cb, block)
            .await
        {
            Ok(cid) => Ok(cid),
            Err(e) => {
                warn!("[OpenChannel] Open with {:?} failed: {}", peer, e);
                self.ctx.metrics.record_error(&e);
                self.ctx
                    .metrics
                    .open_channel_events
                    .with_label_values(&["rejected"])
                    .inc();
                self.ctx.effects.unregister_open_callback(token).await;
                self.ctx
                    .commit(|tx| {
                        finish_open(tx, peer, token);
                        Ok(())
                    })
                    .await?;
                self.maybe_remove_open_monitor().await;
                Err(e)
            }
        }
    }

    async fn request_open(
        self: &Arc<Self>,
        peer: Address,
        self_amount: U256,
        peer_amount: U256,
        token: TokenInfo,
        osp_to_osp: bool,
        cb: Option<Arc<dyn OpenChannelCallback>>,
        block: u64,
    ) -> ChannelResult<ChannelId> {
        let me = self.ctx.me();
        let open_by = if self_amount.is_zero() {
            OpenBy::Approver
        } else {
            OpenBy::Proposer
        };
        let submitter = match open_by {
            OpenBy::Proposer => me,
            OpenBy::Approver => peer,
        };
        let initializer = build_initializer(
            me,
            peer,
            self_amount,
            peer_amount,
            token,
            block + OPEN_CHANNEL_TIMEOUT,
            self.ctx.protocol.channel_dispute_timeout,
            submitter,
        );
        let cid = compute_channel_id(
            self.ctx.ledger.wallet_address(),
            self.ctx.ledger.ledger_address(),
            &initializer,
        );
        self.arm_open_monitor(block, block + OPEN_CHANNEL_TIMEOUT)
            .await?;

        let request = OpenChannelRequest {
            requester_sig: self.ctx.signer.sign(&initializer.as_bytes())?,
            channel_initializer: initializer.clone(),
            open_by,
            osp_to_osp,
        };
        info!(
            "[OpenChannel] Requesting channel {:?} with {:?}, deposits {} / {}, {:?}",
            cid, peer, self_amount, peer_amount, open_by
        );
        let response = self
            .send_open_request(peer, PeerRequest::OpenChannel(request))
            .await?;
        let response = self.validate_response(peer, &initializer, response)?;
        if let Some(cb) = cb {
            self.ctx.effects.register_open_callback(token, cb).await;
        }

        match (open_by, response.status) {
            (OpenBy::Proposer, OpenChannelStatus::Approved) => {
                if !token.is_eth() {
                    self.ensure_allowance(token.address, self_amount).await?;
                }
                let tx_hash = self
                    .ctx
                    .submit(LedgerTx::OpenChannel {
                        sigs: response.sorted_sigs(me, peer),
                        value: open_value(&initializer, me),
                        initializer,
                    })
                    .await?;
                self.watch_open_tx(peer, token, tx_hash);
            }
            (OpenBy::Approver, OpenChannelStatus::TxSubmitted) => {
                debug!("[OpenChannel] {:?} submitted channel {:?}", peer, cid);
            }
            (_, status) => {
                return Err(ChannelError::InvalidArgument(format!(
                    "unexpected open channel status {:?}",
                    status
                )))
            }
        }
        Ok(cid)
    }

    /// Fails the open attempt if the submitted transaction reverts.
    fn watch_open_tx(self: &Arc<Self>, peer: Address, token: TokenInfo, tx_hash: TxHash) {
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.ctx.wait_mined("open_channel", tx_hash).await {
                error!(
                    "[OpenChannel] Open transaction {:?} with {:?} failed: {}",
                    tx_hash, peer, e
                );
                let _ = this
                    .ctx
                    .commit(|tx| {
                        finish_open(tx, peer, token);
                        tx.emit(TxEffect::OpenChannelFailed { token, error: e });
                        Ok(())
                    })
                    .await
                    .tap_err(|e| error!("[OpenChannel] Failed to record open failure: {}", e));
                this.maybe_remove_open_monitor().await;
            }
        });
    }

    /// Approver side of a standard open.
    pub async fn process_open_request(
        self: &Arc<Self>,
        from: Address,
        request: OpenChannelRequest,
    ) -> ChannelResult<OpenChannelResponse> {
        self.validate_request(from, &request)?;
        let me = self.ctx.me();
        let initializer = &request.channel_initializer;
        let token = initializer.token();
        let block = self.ctx.block_number().await?;
        if initializer.open_deadline <= block {
            return Err(ChannelError::DeadlinePassed(format!(
                "open deadline {} at block {}",
                initializer.open_deadline, block
            )));
        }
        self.policy
            .check_open_request(block, me, initializer, request.osp_to_osp)
            .tap_err(|_| {
                self.ctx
                    .metrics
                    .open_channel_events
                    .with_label_values(&["rejected"])
                    .inc()
            })?;
        self.ctx.commit(|tx| begin_open(tx, from, token)).await?;

        match self.approve_open(from, &request, block).await {
            Ok(response) => {
                self.ctx
                    .metrics
                    .open_channel_events
                    .with_label_values(&["approved"])
                    .inc();
                Ok(response)
            }
            Err(e) => {
                self.ctx
                    .commit(|tx| {
                        finish_open(tx, from, token);
                        Ok(())
                    })
                    .await?;
                self.maybe_remove_open_monitor().await;
                Err(e)
            }
        }
    }

    async fn approve_open(
        self: &Arc<Self>,
        from: Address,
        request: &OpenChannelRequest,
        block: u64,
    ) -> ChannelResult<OpenChannelResponse> {
        let me = self.ctx.me();
        let initializer = &request.channel_initializer;
        let token = initializer.token();
        let approver_sig = match self.ctx.signer.sign(&initializer.as_bytes()) {
            Ok(sig) => sig,
            Err(e) => {
                self.ctx
                    .commit(|tx| {
                        tx.delete_open_channel_ts(from, token);
                        Ok(())
                    })
                    .await?;
                return Err(e);
            }
        };
        self.arm_open_monitor(block, initializer.open_deadline)
            .await?;

        let mut response = OpenChannelResponse {
            channel_initializer: initializer.clone(),
            requester_sig: request.requester_sig.clone(),
            approver_sig,
            status: OpenChannelStatus::Approved,
        };
        if request.open_by == OpenBy::Approver {
            if !token.is_eth() {
                self.ensure_allowance(token.address, initializer.amount_of(me).unwrap_or_default())
                    .await?;
            }
            let tx_hash = self
                .ctx
                .submit(LedgerTx::OpenChannel {
                    initializer: initializer.clone(),
                    sigs: response.sorted_sigs(from, me),
                    value: open_value(initializer, me),
                })
                .await?;
            self.watch_open_tx(from, token, tx_hash);
            response.status = OpenChannelStatus::TxSubmitted;
        }
        info!(
            "[OpenChannel] Approved channel with {:?}, status {:?}",
            from, response.status
        );
        Ok(response)
    }

    async fn tcb_on_chain_available(&self, token: TokenInfo) -> ChannelResult<U256> {
        let me = self.ctx.me();
        if token.is_eth() {
            return self.ctx.ledger.native_balance(me).await;
        }
        let balance = self.ctx.ledger.erc20_balance(token.address, me).await?;
        let allowance = self
            .ctx
            .ledger
            .erc20_allowance(token.address, me, self.ctx.ledger.ledger_address())
            .await?;
        Ok(std::cmp::min(balance, allowance))
    }

    /// OSP side of a trust-before-collateral open.
    pub async fn process_tcb_open_request(
        self: &Arc<Self>,
        from: Address,
        request: OpenChannelRequest,
    ) -> ChannelResult<OpenChannelResponse> {
        let result = self.approve_tcb_open(from, request).await;
        let label = if result.is_ok() { "accepted" } else { "rejected" };
        self.ctx.metrics.tcb_opens.with_label_values(&[label]).inc();
        result
    }

    async fn approve_tcb_open(
        self: &Arc<Self>,
        from: Address,
        request: OpenChannelRequest,
    ) -> ChannelResult<OpenChannelResponse> {
        if !self.ctx.protocol.is_osp {
            return Err(ChannelError::InvalidArgument(
                "trust-before-collateral open is only served by an osp".to_string(),
            ));
        }
        self.validate_request(from, &request)?;
        let me = self.ctx.me();
        let initializer = request.channel_initializer.clone();
        let token = initializer.token();
        if !initializer.amount_of(from).unwrap_or_default().is_zero() {
            return Err(ChannelError::PolicyRejected(
                "requester deposit must be zero for tcb open".to_string(),
            ));
        }
        let block = self.ctx.block_number().await?;
        if initializer.open_deadline <= block {
            return Err(ChannelError::DeadlinePassed(format!(
                "tcb open deadline {} at block {}",
                initializer.open_deadline, block
            )));
        }
        if initializer.open_deadline > block + TCB_TIMEOUT_IN_BLOCKS {
            return Err(ChannelError::PolicyRejected(format!(
                "tcb open deadline {} too far from block {}",
                initializer.open_deadline, block
            )));
        }

        let amount = initializer.amount_of(me).unwrap_or_default();
        let available = self.tcb_on_chain_available(token).await?;
        let ledger = self.ctx.ledger.ledger_address();
        let cid = compute_channel_id(self.ctx.ledger.wallet_address(), ledger, &initializer);
        let response = OpenChannelResponse {
            approver_sig: self.ctx.signer.sign(&initializer.as_bytes())?,
            requester_sig: request.requester_sig,
            channel_initializer: initializer.clone(),
            status: OpenChannelStatus::TcbOpened,
        };
        let simplexes = signed_empty_simplexes(self.ctx.signer.as_ref(), cid, from, token)?;
        let policy = self.policy.clone();
        let row = new_channel_row(
            cid,
            from,
            token,
            ledger,
            ChannelState::TrustOpened,
            initial_balance(&initializer, me, from),
            Some(response.clone()),
            simplexes,
        );
        self.ctx
            .commit(|tx| {
                if let Some(existing) = tx.cid_by_peer_token(from, token) {
                    if tx.has_channel(&existing) {
                        return Err(ChannelError::ChannelAlreadyExists(existing));
                    }
                }
                policy.check_tcb_open(token, amount, available, tx.tcb_committed(token))?;
                tx.insert_channel(row)?;
                tx.put_tcb_commitment(cid, TcbCommitment { token, amount });
                Ok(())
            })
            .await?;
        info!(
            "[OpenChannel] Trust-opened channel {:?} with {:?}, virtual deposit {}",
            cid, from, amount
        );
        Ok(response)
    }

    /// Client side of a trust-before-collateral open: the OSP deposits `peer_amount`,
    /// this node nothing.
    pub async fn tcb_open_channel(
        self: &Arc<Self>,
        peer: Address,
        peer_amount: U256,
        token: TokenInfo,
    ) -> ChannelResult<ChannelId> {
        let me = self.ctx.me();
        if peer == me || peer_amount.is_zero() {
            return Err(ChannelError::InvalidArgument(
                "tcb open needs another peer and a non-zero deposit".to_string(),
            ));
        }
        let block = self.ctx.block_number().await?;
        self.ctx.commit(|tx| begin_open(tx, peer, token)).await?;
        let result = self.request_tcb_open(peer, peer_amount, token, block).await;
        self.ctx
            .commit(|tx| {
                finish_open(tx, peer, token);
                Ok(())
            })
            .await?;
        if let Err(e) = &result {
            warn!("[OpenChannel] Tcb open with {:?} failed: {}", peer, e);
            self.maybe_remove_open_monitor().await;
        }
        result
    }

    async fn request_tcb_open(
        self: &Arc<Self>,
        peer: Address,
        peer_amount: U256,
        token: TokenInfo,
        block: u64,
    ) -> ChannelResult<ChannelId> {
        let me = self.ctx.me();
        let ledger = self.ctx.ledger.ledger_address();
        let initializer = build_initializer(
            me,
            peer,
            U256::zero(),
            peer_amount,
            token,
            block + TCB_TIMEOUT_IN_BLOCKS,
            self.ctx.protocol.channel_dispute_timeout,
            peer,
        );
        let cid = compute_channel_id(self.ctx.ledger.wallet_address(), ledger, &initializer);
        self.arm_open_monitor(block, initializer.open_deadline)
            .await?;

        let request = OpenChannelRequest {
            requester_sig: self.ctx.signer.sign(&initializer.as_bytes())?,
            channel_initializer: initializer.clone(),
            open_by: OpenBy::Approver,
            osp_to_osp: false,
        };
        let response = self
            .send_open_request(peer, PeerRequest::TcbOpenChannel(request))
            .await?;
        let response = self.validate_response(peer, &initializer, response)?;
        if response.status != OpenChannelStatus::TcbOpened {
            return Err(ChannelError::InvalidArgument(format!(
                "unexpected tcb open status {:?}",
                response.status
            )));
        }

        let row = new_channel_row(
            cid,
            peer,
            token,
            ledger,
            ChannelState::TrustOpened,
            initial_balance(&initializer, me, peer),
            Some(response),
            signed_empty_simplexes(self.ctx.signer.as_ref(), cid, peer, token)?,
        );
        self.ctx.commit(|tx| tx.insert_channel(row)).await?;
        info!("[OpenChannel] Channel {:?} with {:?} is trust-opened", cid, peer);
        Ok(cid)
    }

    /// Submits the on-chain open of a trust-opened channel. On failure the channel goes
    /// back to TRUST_OPENED and its virtual deposit returns to the pool.
    pub async fn instantiate_channel(self: &Arc<Self>, cid: ChannelId) -> ChannelResult<TxHash> {
        let me = self.ctx.me();
        let (response, peer) = self
            .ctx
            .commit(|tx| {
                let row = tx.channel_mut(&cid)?;
                fsm::on_instantiate(row)?;
                let response = row.open_response.clone().ok_or_else(|| {
                    ChannelError::InvalidArgument(format!("channel {:?} has no open response", cid))
                })?;
                Ok((response, row.peer))
            })
            .await?;
        let initializer = response.channel_initializer.clone();
        info!("[OpenChannel] Instantiating channel {:?} with {:?}", cid, peer);

        let result = async {
            let token = initializer.token();
            if !token.is_eth() {
                self.ensure_allowance(token.address, initializer.amount_of(me).unwrap_or_default())
                    .await?;
            }
            self.ctx
                .submit_and_wait(LedgerTx::OpenChannel {
                    sigs: response.sorted_sigs(peer, me),
                    value: open_value(&initializer, me),
                    initializer: initializer.clone(),
                })
                .await
        }
        .await;

        match result {
            Ok(receipt) => Ok(receipt.tx_hash),
            Err(e) => {
                error!("[OpenChannel] Failed to instantiate channel {:?}: {}", cid, e);
                self.ctx
                    .commit(|tx| {
                        fsm::on_instantiate_failed(tx.channel_mut(&cid)?)?;
                        tx.remove_tcb_commitment(&cid);
                        Ok(())
                    })
                    .await?;
                Err(e)
            }
        }
    }

    /// Handles a confirmed OpenChannel log. Redelivery of an already applied log is
    /// rejected by the state table and leaves the store untouched.
    pub async fn handle_open_event(&self, log: LedgerLog) {
        let LedgerEvent::OpenChannel {
            cid,
            token,
            peers,
            initial_deposits,
        } = log.event
        else {
            return;
        };
        let me = self.ctx.me();
        let peer = if peers[0] == me {
            peers[1]
        } else if peers[1] == me {
            peers[0]
        } else {
            return;
        };
        let ledger = self.ctx.ledger.ledger_address();
        let signer = self.ctx.signer.clone();

        let result = self
            .ctx
            .commit(|tx| {
                let balance =
                    OnChainBalance::from_sorted(me, peer, initial_deposits, [U256::zero(); 2]);
                if tx.has_channel(&cid) {
                    let row = tx.channel_mut(&cid)?;
                    if row.token != token || row.peer != peer {
                        return Err(ChannelError::OpenEventMismatch(format!(
                            "stored token {:?} peer {:?}, event token {:?} peers {:?}",
                            row.token, row.peer, token, peers
                        )));
                    }
                    fsm::on_open_event(row)?;
                    row.on_chain_balance = balance;
                } else {
                    let simplexes = signed_empty_simplexes(signer.as_ref(), cid, peer, token)?;
                    tx.insert_channel(new_channel_row(
                        cid,
                        peer,
                        token,
                        ledger,
                        ChannelState::Opened,
                        balance,
                        None,
                        simplexes,
                    ))?;
                }
                finish_open(tx, peer, token);
                tx.remove_tcb_commitment(&cid);
                tx.emit(TxEffect::OpenChannelFinished { token, cid });
                tx.emit(TxEffect::RouteEdgeAdded { cid, peers, token });
                Ok(())
            })
            .await;
        match result {
            Ok(()) => info!(
                "[OpenChannel] Channel {:?} with {:?} opened in block {}",
                cid, peer, log.block_number
            ),
            Err(ChannelError::OpenEventOnWrongState(state)) => warn!(
                "[OpenChannel] Ignoring OpenChannel event of {:?} in state {}",
                cid, state
            ),
            Err(ChannelError::OpenEventMismatch(detail)) => warn!(
                "[OpenChannel] Ignoring OpenChannel event of {:?} in tx {:?}, {}",
                cid, log.tx_hash, detail
            ),
            Err(e) => {
                self.ctx.metrics.record_error(&e);
                error!(
                    "[OpenChannel] Failed to apply OpenChannel event of {:?} in tx {:?}: {}",
                    cid, log.tx_hash, e
                );
            }
        }
        self.maybe_remove_open_monitor().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PolicyConfig, StandardDepositPolicy, StandardPolicyConfig};
    use crate::test_utils::{default_policy_config, RecordingCallbacks, TestNetwork};
    use std::collections::BTreeMap;

    fn matching_eth_policy() -> PolicyConfig {
        PolicyConfig {
            standard: Some(StandardPolicyConfig {
                tokens: BTreeMap::from([(
                    Address::zero(),
                    StandardDepositPolicy {
                        matching_ratio: None,
                        min_deposit: 1,
                        max_deposit: 1000,
                        min_deadline_delta: 10,
                        max_deadline_delta: 200,
                    },
                )]),
                osp_to_osp: BTreeMap::new(),
            }),
            ..default_policy_config()
        }
    }

    #[tokio::test]
    async fn test_standard_open_reaches_opened_on_both_sides() {
        let net = TestNetwork::with_policy(false, true, matching_eth_policy()).await;
        let (callbacks, mut events) = RecordingCallbacks::new();
        let cid = net
            .a
            .open_channel(
                net.b.address(),
                U256::from(100),
                U256::from(100),
                TokenInfo::eth(),
                false,
                Some(callbacks),
            )
            .await
            .unwrap();
        assert_eq!(net.chain.tx_kinds(), vec!["open_channel"]);
        assert!(net.store_of(&net.a).view(|s| s.has_unfinished_opens()).await);

        assert_eq!(net.deliver_events().await, 1);
        assert_eq!(events.next().await, format!("open_finished {:?}", cid));

        for node in [&net.a, &net.b] {
            let row = net.row(node, cid).await.unwrap();
            assert_eq!(row.state, ChannelState::Opened);
            assert_eq!(row.on_chain_balance.my_deposit, U256::from(100));
            assert_eq!(row.on_chain_balance.peer_deposit, U256::from(100));
            assert_eq!(row.self_simplex.seq_num(), 0);
        }
        let a_store = net.store_of(&net.a);
        assert!(!a_store.view(|s| s.has_unfinished_opens()).await);
        assert!(!a_store.view(|s| s.has_monitor_bit(OPEN_CHANNEL_MONITOR_BIT)).await);

        // At-least-once redelivery leaves the rows alone.
        net.chain.redeliver_all();
        net.deliver_events().await;
        assert_eq!(net.row(&net.a, cid).await.unwrap().state, ChannelState::Opened);

        let err = net
            .a
            .open_channel(
                net.b.address(),
                U256::from(100),
                U256::from(100),
                TokenInfo::eth(),
                false,
                None,
            )
            .await
            .unwrap_err();
        assert_eq!(err, ChannelError::ChannelAlreadyExists(cid));
    }

    #[tokio::test]
    async fn test_cold_bootstrap_open_is_submitted_by_approver() {
        let net = TestNetwork::new(false, true).await;
        let cid = net
            .a
            .open_channel(
                net.b.address(),
                U256::zero(),
                U256::from(50),
                TokenInfo::eth(),
                false,
                None,
            )
            .await
            .unwrap();
        let submitted = net.chain.submitted();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].0, net.b.address());

        net.deliver_events().await;
        let row = net.row(&net.a, cid).await.unwrap();
        assert_eq!(row.state, ChannelState::Opened);
        assert_eq!(row.on_chain_balance.my_deposit, U256::zero());
        assert_eq!(row.on_chain_balance.peer_deposit, U256::from(50));
    }

    #[tokio::test]
    async fn test_policy_rejection_finishes_in_flight_request() {
        let net = TestNetwork::with_policy(false, true, matching_eth_policy()).await;
        let peer = net.b.address();
        let err = net
            .a
            .open_channel(peer, U256::from(100), U256::from(50), TokenInfo::eth(), false, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::PolicyRejected(_)));
        assert!(net.chain.submitted().is_empty());
        let ts = net
            .store_of(&net.a)
            .view(|s| s.open_channel_ts(peer, TokenInfo::eth()))
            .await
            .unwrap();
        assert!(ts.finish_ts.is_some());

        // A finished record does not block a retry.
        net.a
            .open_channel(peer, U256::from(100), U256::from(100), TokenInfo::eth(), false, None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_open_request() {
        let net = TestNetwork::new(false, true).await;
        let peer = net.b.address();
        let store = net.store_of(&net.a);
        store
            .transactional(|tx| {
                tx.put_open_channel_ts(
                    peer,
                    TokenInfo::eth(),
                    OpenChannelTs {
                        request_ts: now_millis(),
                        finish_ts: None,
                    },
                );
                Ok(())
            })
            .await
            .unwrap();
        let err = net
            .a
            .open_channel(peer, U256::from(10), U256::from(10), TokenInfo::eth(), false, None)
            .await
            .unwrap_err();
        assert_eq!(err, ChannelError::DuplicateOpenRequest);

        // An abandoned record is cleared.
        let stale = now_millis() - MAX_OPEN_CHANNEL_TIMEOUT.as_millis() as u64 - 1000;
        store
            .transactional(|tx| {
                tx.put_open_channel_ts(
                    peer,
                    TokenInfo::eth(),
                    OpenChannelTs {
                        request_ts: stale,
                        finish_ts: None,
                    },
                );
                Ok(())
            })
            .await
            .unwrap();
        net.a
            .open_channel(peer, U256::from(10), U256::from(10), TokenInfo::eth(), false, None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_erc20_open_approves_first() {
        let net = TestNetwork::new(false, true).await;
        let token = TokenInfo::erc20(Address::repeat_byte(0x77));
        let cid = net
            .a
            .open_channel(net.b.address(), U256::from(20), U256::from(20), token, false, None)
            .await
            .unwrap();
        assert_eq!(net.chain.tx_kinds(), vec!["approve", "open_channel"]);
        net.deliver_events().await;
        let row = net.row(&net.b, cid).await.unwrap();
        assert_eq!(row.state, ChannelState::Opened);
        assert_eq!(row.token, token);
    }

    #[tokio::test]
    async fn test_reverted_open_reports_error_once() {
        let net = TestNetwork::new(false, true).await;
        net.chain.revert_kind("open_channel");
        let (callbacks, mut events) = RecordingCallbacks::new();
        let peer = net.b.address();
        net.a
            .open_channel(peer, U256::from(10), U256::from(10), TokenInfo::eth(), false, Some(callbacks))
            .await
            .unwrap();
        assert!(events.next().await.starts_with("open_error"));
        let ts = net
            .store_of(&net.a)
            .view(|s| s.open_channel_ts(peer, TokenInfo::eth()))
            .await
            .unwrap();
        assert!(ts.finish_ts.is_some());
        assert_eq!(net.deliver_events().await, 0);
        assert!(events.try_next().is_none());
    }

    #[tokio::test]
    async fn test_tcb_open_then_instantiate() {
        let net = TestNetwork::new(false, true).await;
        let osp = net.b.address();
        let cid = net
            .a
            .tcb_open_channel(osp, U256::from(50), TokenInfo::eth())
            .await
            .unwrap();
        assert!(net.chain.submitted().is_empty());
        for node in [&net.a, &net.b] {
            assert_eq!(net.row(node, cid).await.unwrap().state, ChannelState::TrustOpened);
        }
        let osp_store = net.store_of(&net.b);
        assert_eq!(
            osp_store.view(|s| s.tcb_committed(TokenInfo::eth())).await,
            U256::from(50)
        );
        let client_row = net.row(&net.a, cid).await.unwrap();
        assert_eq!(client_row.on_chain_balance.peer_deposit, U256::from(50));

        net.b.instantiate_channel(cid).await.unwrap();
        assert_eq!(
            net.row(&net.b, cid).await.unwrap().state,
            ChannelState::Instantiating
        );
        assert_eq!(net.deliver_events().await, 1);
        for node in [&net.a, &net.b] {
            assert_eq!(net.row(node, cid).await.unwrap().state, ChannelState::Opened);
        }
        assert_eq!(
            osp_store.view(|s| s.tcb_committed(TokenInfo::eth())).await,
            U256::zero()
        );
    }

    #[tokio::test]
    async fn test_mismatched_open_event_is_ignored() {
        let net = TestNetwork::new(false, true).await;
        let (a, osp) = (net.a.address(), net.b.address());
        let cid = net
            .a
            .tcb_open_channel(osp, U256::from(50), TokenInfo::eth())
            .await
            .unwrap();
        let peers = if a < osp { [a, osp] } else { [osp, a] };

        net.chain.emit(LedgerEvent::OpenChannel {
            cid,
            token: TokenInfo::erc20(Address::repeat_byte(0x77)),
            peers,
            initial_deposits: [U256::from(500); 2],
        });
        net.chain.emit(LedgerEvent::OpenChannel {
            cid,
            token: TokenInfo::eth(),
            peers: [a, Address::repeat_byte(0x55)],
            initial_deposits: [U256::from(500); 2],
        });
        net.deliver_events().await;
        for node in [&net.a, &net.b] {
            let row = net.row(node, cid).await.unwrap();
            assert_eq!(row.state, ChannelState::TrustOpened);
            assert_eq!(row.token, TokenInfo::eth());
        }
        assert_eq!(
            net.row(&net.a, cid).await.unwrap().on_chain_balance.peer_deposit,
            U256::from(50)
        );
        assert_eq!(
            net.store_of(&net.b)
                .view(|s| s.tcb_committed(TokenInfo::eth()))
                .await,
            U256::from(50)
        );

        // The real event still opens the channel.
        net.b.instantiate_channel(cid).await.unwrap();
        net.deliver_events().await;
        for node in [&net.a, &net.b] {
            assert_eq!(net.row(node, cid).await.unwrap().state, ChannelState::Opened);
        }
    }

    #[tokio::test]
    async fn test_tcb_rejections() {
        let net = TestNetwork::new(false, true).await;
        let osp = net.b.address();
        // Above the per-client maximum of the test pool
        let err = net
            .a
            .tcb_open_channel(osp, U256::from(501), TokenInfo::eth())
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::PolicyRejected(_)));
        assert!(net.store_of(&net.b).view(|s| s.channels.is_empty()).await);
        assert_eq!(
            net.store_of(&net.b)
                .view(|s| s.tcb_committed(TokenInfo::eth()))
                .await,
            U256::zero()
        );

        // Only an OSP serves tcb opens.
        let err = net
            .b
            .tcb_open_channel(net.a.address(), U256::from(10), TokenInfo::eth())
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_failed_instantiation_recycles_virtual_deposit() {
        let net = TestNetwork::new(false, true).await;
        let cid = net
            .a
            .tcb_open_channel(net.b.address(), U256::from(50), TokenInfo::eth())
            .await
            .unwrap();
        net.chain.revert_kind("open_channel");
        let err = net.b.instantiate_channel(cid).await.unwrap_err();
        assert!(matches!(err, ChannelError::TxFailed(_)));
        assert_eq!(
            net.row(&net.b, cid).await.unwrap().state,
            ChannelState::TrustOpened
        );
        assert_eq!(
            net.store_of(&net.b)
                .view(|s| s.tcb_committed(TokenInfo::eth()))
                .await,
            U256::zero()
        );
    }
}
