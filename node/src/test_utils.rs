// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! In-process chain, event monitor and peer transport for driving nodes in tests.

use crate::config::{PolicyConfig, ProtocolConfig, TcbPolicyConfig, TcbTokenPolicy};
use crate::crypto::{
    compute_channel_id, compute_pay_id, hash_lock_of, sig_is_valid, ChannelSigner,
    EthMessageSigner,
};
use crate::encoding::ChannelMessageEncoding;
use crate::error::{ChannelError, ChannelResult};
use crate::jobs::cooperative_withdraw::WithdrawCallback;
use crate::jobs::deposit::DepositCallback;
use crate::ledger::{BalanceMap, LedgerClient, LedgerTx, PayInfo, TxReceipt, WithdrawIntent};
use crate::messenger::PeerMessenger;
use crate::metrics::ChannelMetrics;
use crate::monitor::{CallbackId, EventCallback, EventMonitor, MonitorConfig};
use crate::node::{ChannelContext, ChannelNode, EffectDispatcher};
use crate::open_channel::OpenChannelCallback;
use crate::policy::PolicyEngine;
use crate::store::ChannelStore;
use crate::types::{
    AccountAmtPair, ChannelId, ChannelInitializer, ChannelRow, ChannelState, Condition,
    ConditionalPay, LedgerEvent, LedgerLog, PayId, PeerMessage, PeerRequest, PeerResponse,
    SeqNums, SignedSimplexState, SimplexPaymentChannel, TokenDistribution, TokenInfo,
    TokenTransfer, TransferFunction, TransferLogic,
};
use crate::CHANNEL_DISPUTE_TIMEOUT;
use async_trait::async_trait;
use ethers::signers::LocalWallet;
use ethers::types::{Address, TxHash, H256, U256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

pub const A_SEED: u64 = 1;
pub const B_SEED: u64 = 2;

pub fn init_tracing_for_testing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_test_writer()
        .try_init();
}

pub fn signer_from_seed(seed: u64) -> EthMessageSigner {
    let wallet = LocalWallet::from_str(&format!("{:064x}", seed)).unwrap();
    EthMessageSigner::new(wallet)
}

pub fn test_initializer(
    a: Address,
    b: Address,
    amt_a: U256,
    amt_b: U256,
    token: TokenInfo,
    open_deadline: u64,
) -> ChannelInitializer {
    let pa = AccountAmtPair {
        account: a,
        amount: amt_a,
    };
    let pb = AccountAmtPair {
        account: b,
        amount: amt_b,
    };
    ChannelInitializer {
        init_distribution: TokenDistribution {
            token,
            distribution: if a < b { [pa, pb] } else { [pb, pa] },
        },
        open_deadline,
        dispute_timeout: CHANNEL_DISPUTE_TIMEOUT,
        msg_value_receiver: 0,
    }
}

pub fn test_channel_row(
    cid: ChannelId,
    me: Address,
    peer: Address,
    token: TokenInfo,
    state: ChannelState,
) -> ChannelRow {
    let unsigned = |simplex| SignedSimplexState {
        simplex,
        sig_of_peer_from: None,
        sig_of_peer_to: None,
    };
    ChannelRow {
        cid,
        peer,
        token,
        ledger: Address::repeat_byte(0x1e),
        state,
        open_response: None,
        on_chain_balance: Default::default(),
        self_simplex: unsigned(SimplexPaymentChannel::new_empty(cid, me, peer, token)),
        peer_simplex: unsigned(SimplexPaymentChannel::new_empty(cid, peer, me, token)),
        seq_nums: SeqNums::default(),
    }
}

/// Signs `simplex` by its sender (`from_seed`) and receiver (`to_seed`).
pub fn co_sign(simplex: SimplexPaymentChannel, from_seed: u64, to_seed: u64) -> SignedSimplexState {
    let bytes = simplex.as_bytes();
    SignedSimplexState {
        sig_of_peer_from: Some(signer_from_seed(from_seed).sign(&bytes).unwrap()),
        sig_of_peer_to: Some(signer_from_seed(to_seed).sign(&bytes).unwrap()),
        simplex,
    }
}

pub fn test_hash_lock_pay(
    src: Address,
    dest: Address,
    hash: H256,
    amount: u64,
    resolve_deadline: u64,
    pay_resolver: Address,
) -> ConditionalPay {
    ConditionalPay {
        pay_timestamp: 1,
        src,
        dest,
        conditions: vec![Condition::HashLock(hash)],
        transfer_func: TransferFunction {
            logic: TransferLogic::BooleanAndMax,
            max_transfer: TokenTransfer {
                token: TokenInfo::eth(),
                receiver: AccountAmtPair {
                    account: dest,
                    amount: U256::from(amount),
                },
            },
        },
        resolve_deadline,
        resolve_timeout: 10,
        pay_resolver,
    }
}

/// No standard policy, the default cold bootstrap caps and a small ETH pool for
/// trust-before-collateral opens.
pub fn default_policy_config() -> PolicyConfig {
    PolicyConfig {
        standard: None,
        cold_bootstrap: Default::default(),
        tcb: TcbPolicyConfig {
            tokens: BTreeMap::from([(
                Address::zero(),
                TcbTokenPolicy {
                    capacity: 1000,
                    safety_margin: 100,
                    max_per_client: 500,
                },
            )]),
        },
    }
}

/// Polls `condition` until it holds, for work finished by background tasks.
pub async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

pub fn test_protocol_config(is_osp: bool) -> ProtocolConfig {
    ProtocolConfig {
        is_osp,
        ledger_address: Address::repeat_byte(0x1e),
        wallet_address: Address::repeat_byte(0x2e),
        pay_registry_address: Address::repeat_byte(0x3e),
        pay_resolver_address: Address::repeat_byte(0x4e),
        channel_dispute_timeout: CHANNEL_DISPUTE_TIMEOUT,
        min_dispute_timeout: 8000,
        max_dispute_timeout: 20000,
        tx_retry_max_elapsed: Duration::from_millis(300),
    }
}

#[derive(Debug, Clone, Default)]
struct MockChannel {
    peers: [Address; 2],
    deposits: [U256; 2],
    withdrawals: [U256; 2],
    dispute_timeout: u64,
    withdraw_seq: u64,
    settle_seqs: Option<[u64; 2]>,
    settle_finalized: u64,
    intent: Option<WithdrawIntent>,
}

impl MockChannel {
    fn index_of(&self, account: Address) -> Result<usize, String> {
        self.peers
            .iter()
            .position(|p| *p == account)
            .ok_or_else(|| format!("{:?} is not a peer", account))
    }

    fn balance(&self) -> U256 {
        let deposits = self.deposits[0] + self.deposits[1];
        let withdrawals = self.withdrawals[0] + self.withdrawals[1];
        deposits.saturating_sub(withdrawals)
    }
}

#[derive(Default)]
struct ChainState {
    block: u64,
    tx_count: u64,
    submitted: Vec<(Address, LedgerTx)>,
    receipts: HashMap<TxHash, TxReceipt>,
    reverted_kinds: HashSet<&'static str>,
    hold_receipts: bool,
    allowances: HashMap<(Address, Address), U256>,
    channels: HashMap<ChannelId, MockChannel>,
    pays: HashMap<PayId, PayInfo>,
    logs: Vec<LedgerLog>,
    pending_logs: Vec<LedgerLog>,
}

/// Ledger contract simulation. Every transaction is mined into the current block,
/// which then advances by one.
pub struct MockChain {
    ledger: Address,
    wallet: Address,
    state: Mutex<ChainState>,
}

impl MockChain {
    pub fn new(ledger: Address, wallet: Address) -> Self {
        Self {
            ledger,
            wallet,
            state: Mutex::new(ChainState {
                block: 1000,
                ..Default::default()
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ChainState> {
        self.state.lock().unwrap()
    }

    pub fn block_number(&self) -> u64 {
        self.state().block
    }

    pub fn advance_blocks(&self, blocks: u64) {
        self.state().block += blocks;
    }

    /// Transactions of `kind` are mined but revert from now on.
    pub fn revert_kind(&self, kind: &'static str) {
        self.state().reverted_kinds.insert(kind);
    }

    /// While held, receipts are reported as not yet available.
    pub fn hold_receipts(&self, hold: bool) {
        self.state().hold_receipts = hold;
    }

    pub fn submitted(&self) -> Vec<(Address, LedgerTx)> {
        self.state().submitted.clone()
    }

    pub fn tx_kinds(&self) -> Vec<&'static str> {
        self.state()
            .submitted
            .iter()
            .map(|(_, tx)| tx.kind())
            .collect()
    }

    pub fn withdraw_intent_of(&self, cid: ChannelId) -> Option<WithdrawIntent> {
        self.state().channels.get(&cid).and_then(|c| c.intent)
    }

    /// Queues an event that no transaction produced.
    pub fn emit(&self, event: LedgerEvent) {
        let mut state = self.state();
        state.tx_count += 1;
        let log = LedgerLog {
            tx_hash: TxHash::from_low_u64_be(state.tx_count),
            block_number: state.block,
            log_index: 0,
            event,
        };
        state.logs.push(log.clone());
        state.pending_logs.push(log);
    }

    /// Queues every log ever produced again.
    pub fn redeliver_all(&self) {
        let mut state = self.state();
        let logs = state.logs.clone();
        state.pending_logs.extend(logs);
    }

    fn take_pending_logs(&self) -> Vec<LedgerLog> {
        std::mem::take(&mut self.state().pending_logs)
    }

    fn submit(&self, from: Address, tx: LedgerTx) -> TxHash {
        let mut state = self.state();
        state.tx_count += 1;
        let tx_hash = TxHash::from_low_u64_be(state.tx_count);
        let block = state.block;
        state.submitted.push((from, tx.clone()));

        let events = if state.reverted_kinds.contains(tx.kind()) {
            Err(format!("{} reverted", tx.kind()))
        } else {
            self.execute(&mut state, from, tx)
        };
        let success = match events {
            Ok(events) => {
                for (log_index, event) in events.into_iter().enumerate() {
                    let log = LedgerLog {
                        tx_hash,
                        block_number: block,
                        log_index: log_index as u64,
                        event,
                    };
                    state.logs.push(log.clone());
                    state.pending_logs.push(log);
                }
                true
            }
            Err(reason) => {
                tracing::warn!("Mock transaction {:?} reverted: {}", tx_hash, reason);
                false
            }
        };
        state.receipts.insert(
            tx_hash,
            TxReceipt {
                tx_hash,
                block_number: block,
                success,
            },
        );
        state.block += 1;
        tx_hash
    }

    fn execute(
        &self,
        state: &mut ChainState,
        from: Address,
        tx: LedgerTx,
    ) -> Result<Vec<LedgerEvent>, String> {
        let block = state.block;
        match tx {
            LedgerTx::Erc20Approve { token, amount, .. } => {
                state.allowances.insert((token, from), amount);
                Ok(vec![])
            }
            LedgerTx::OpenChannel {
                initializer, sigs, ..
            } => {
                if block > initializer.open_deadline {
                    return Err("open deadline passed".to_string());
                }
                let peers = initializer.peers();
                let bytes = initializer.as_bytes();
                for (peer, sig) in peers.iter().zip(sigs.iter()) {
                    if !sig_is_valid(*peer, &bytes, sig) {
                        return Err(format!("bad open signature of {:?}", peer));
                    }
                }
                let cid = compute_channel_id(self.wallet, self.ledger, &initializer);
                if state.channels.contains_key(&cid) {
                    return Err("channel exists".to_string());
                }
                let d = &initializer.init_distribution.distribution;
                let initial_deposits = [d[0].amount, d[1].amount];
                state.channels.insert(
                    cid,
                    MockChannel {
                        peers,
                        deposits: initial_deposits,
                        dispute_timeout: initializer.dispute_timeout,
                        ..Default::default()
                    },
                );
                Ok(vec![LedgerEvent::OpenChannel {
                    cid,
                    token: initializer.token(),
                    peers,
                    initial_deposits,
                }])
            }
            LedgerTx::Deposit {
                cid,
                receiver,
                amount,
                ..
            } => {
                let channel = channel_mut(state, cid)?;
                let index = channel.index_of(receiver)?;
                channel.deposits[index] += amount;
                Ok(vec![LedgerEvent::Deposit {
                    cid,
                    peers: channel.peers,
                    deposits: channel.deposits,
                    withdrawals: channel.withdrawals,
                }])
            }
            LedgerTx::CooperativeWithdraw { info, sigs } => {
                let cid = info.channel_id;
                let channel = channel_mut(state, cid)?;
                if info.seq_num != channel.withdraw_seq + 1 {
                    return Err(format!("withdraw seq {}", info.seq_num));
                }
                if block > info.withdraw_deadline {
                    return Err("withdraw deadline passed".to_string());
                }
                let bytes = info.as_bytes();
                for (peer, sig) in channel.peers.iter().zip(sigs.iter()) {
                    if !sig_is_valid(*peer, &bytes, sig) {
                        return Err(format!("bad withdraw signature of {:?}", peer));
                    }
                }
                let amount = info.withdraw.amount;
                if amount > channel.balance() {
                    return Err("withdraw above channel balance".to_string());
                }
                let index = channel.index_of(info.withdraw.account)?;
                channel.withdrawals[index] += amount;
                channel.withdraw_seq = info.seq_num;
                Ok(vec![LedgerEvent::CooperativeWithdraw {
                    cid,
                    withdrawn_amount: amount,
                    receiver: info.withdraw.account,
                    recipient_cid: info.recipient_channel_id,
                    deposits: channel.deposits,
                    withdrawals: channel.withdrawals,
                    seq_num: info.seq_num,
                }])
            }
            LedgerTx::IntendSettle { states } => {
                let cid = states
                    .first()
                    .map(|s| s.simplex.channel_id)
                    .ok_or_else(|| "no states".to_string())?;
                let channel = channel_mut(state, cid)?;
                let mut seqs = channel.settle_seqs.unwrap_or_default();
                for signed in &states {
                    let index = channel.index_of(signed.simplex.peer_from)?;
                    seqs[index] = seqs[index].max(signed.seq_num());
                }
                channel.settle_seqs = Some(seqs);
                channel.settle_finalized = block + channel.dispute_timeout;
                Ok(vec![LedgerEvent::IntendSettle {
                    cid,
                    seq_nums: seqs,
                }])
            }
            LedgerTx::ConfirmSettle { cid } => {
                let channel = channel_mut(state, cid)?;
                if channel.settle_seqs.is_none() || block < channel.settle_finalized {
                    return Err("settle not finalized".to_string());
                }
                let settle_balance = [
                    channel.deposits[0].saturating_sub(channel.withdrawals[0]),
                    channel.deposits[1].saturating_sub(channel.withdrawals[1]),
                ];
                Ok(vec![LedgerEvent::ConfirmSettle {
                    cid,
                    settle_balance,
                }])
            }
            LedgerTx::IntendWithdraw {
                cid,
                amount,
                recipient_cid,
            } => {
                let channel = channel_mut(state, cid)?;
                channel.index_of(from)?;
                if channel.intent.is_some() {
                    return Err("withdraw intent exists".to_string());
                }
                channel.intent = Some(WithdrawIntent {
                    receiver: from,
                    amount,
                    request_block: block,
                    recipient_cid,
                });
                Ok(vec![LedgerEvent::IntendWithdraw {
                    cid,
                    receiver: from,
                    amount,
                }])
            }
            LedgerTx::ConfirmWithdraw { cid } => {
                let channel = channel_mut(state, cid)?;
                let intent = channel.intent.ok_or_else(|| "no intent".to_string())?;
                if block < intent.request_block + channel.dispute_timeout {
                    return Err("withdraw window open".to_string());
                }
                let index = channel.index_of(intent.receiver)?;
                channel.withdrawals[index] += intent.amount;
                channel.intent = None;
                Ok(vec![LedgerEvent::ConfirmWithdraw {
                    cid,
                    withdrawn_amount: intent.amount,
                    receiver: intent.receiver,
                    recipient_cid: intent.recipient_cid,
                    deposits: channel.deposits,
                    withdrawals: channel.withdrawals,
                }])
            }
            LedgerTx::VetoWithdraw { cid } => {
                let channel = channel_mut(state, cid)?;
                channel.index_of(from)?;
                match channel.intent {
                    Some(intent) if intent.receiver != from => {
                        channel.intent = None;
                        Ok(vec![LedgerEvent::VetoWithdraw { cid }])
                    }
                    _ => Err("nothing to veto".to_string()),
                }
            }
            LedgerTx::ResolvePaymentByConditions { pay, preimages } => {
                if block > pay.resolve_deadline {
                    return Err("resolve deadline passed".to_string());
                }
                let revealed: HashSet<H256> = preimages.iter().map(|p| hash_lock_of(p)).collect();
                if pay.hash_locks().any(|hash| !revealed.contains(hash)) {
                    return Err("missing preimage".to_string());
                }
                state.pays.insert(
                    compute_pay_id(&pay, pay.pay_resolver),
                    PayInfo {
                        amount: pay.max_amount(),
                        resolve_deadline: pay.resolve_deadline,
                    },
                );
                Ok(vec![])
            }
        }
    }
}

fn channel_mut(state: &mut ChainState, cid: ChannelId) -> Result<&mut MockChannel, String> {
    state
        .channels
        .get_mut(&cid)
        .ok_or_else(|| format!("unknown channel {:?}", cid))
}

pub struct MockLedgerClient {
    chain: Arc<MockChain>,
    account: Address,
}

impl MockLedgerClient {
    pub fn new(chain: Arc<MockChain>, account: Address) -> Self {
        Self { chain, account }
    }

    fn channel(&self, cid: ChannelId) -> ChannelResult<MockChannel> {
        self.chain
            .state()
            .channels
            .get(&cid)
            .cloned()
            .ok_or(ChannelError::ChannelNotFound(cid))
    }
}

#[async_trait]
impl LedgerClient for MockLedgerClient {
    fn ledger_address(&self) -> Address {
        self.chain.ledger
    }

    fn wallet_address(&self) -> Address {
        self.chain.wallet
    }

    fn account(&self) -> Address {
        self.account
    }

    async fn block_number(&self) -> ChannelResult<u64> {
        Ok(self.chain.block_number())
    }

    async fn submit(&self, tx: LedgerTx) -> ChannelResult<TxHash> {
        Ok(self.chain.submit(self.account, tx))
    }

    async fn wait_mined(&self, tx_hash: TxHash) -> ChannelResult<TxReceipt> {
        let state = self.chain.state();
        if state.hold_receipts {
            return Err(ChannelError::Provider(format!("{:?} is pending", tx_hash)));
        }
        state
            .receipts
            .get(&tx_hash)
            .copied()
            .ok_or_else(|| ChannelError::Provider(format!("unknown transaction {:?}", tx_hash)))
    }

    async fn erc20_allowance(
        &self,
        token: Address,
        owner: Address,
        _spender: Address,
    ) -> ChannelResult<U256> {
        Ok(self
            .chain
            .state()
            .allowances
            .get(&(token, owner))
            .copied()
            .unwrap_or_default())
    }

    async fn erc20_balance(&self, _token: Address, _owner: Address) -> ChannelResult<U256> {
        Ok(U256::exp10(24))
    }

    async fn native_balance(&self, _owner: Address) -> ChannelResult<U256> {
        Ok(U256::exp10(24))
    }

    async fn cooperative_withdraw_seq_num(&self, cid: ChannelId) -> ChannelResult<u64> {
        Ok(self.channel(cid).map(|c| c.withdraw_seq).unwrap_or_default())
    }

    async fn settle_finalized_time(&self, cid: ChannelId) -> ChannelResult<u64> {
        Ok(self.channel(cid)?.settle_finalized)
    }

    async fn withdraw_intent(&self, cid: ChannelId) -> ChannelResult<Option<WithdrawIntent>> {
        Ok(self.channel(cid)?.intent)
    }

    async fn dispute_timeout(&self, cid: ChannelId) -> ChannelResult<u64> {
        Ok(self.channel(cid)?.dispute_timeout)
    }

    async fn balance_map(&self, cid: ChannelId) -> ChannelResult<BalanceMap> {
        let channel = self.channel(cid)?;
        Ok(BalanceMap {
            peers: channel.peers,
            deposits: channel.deposits,
            withdrawals: channel.withdrawals,
        })
    }

    async fn pay_info(&self, pay_id: H256) -> ChannelResult<PayInfo> {
        Ok(self
            .chain
            .state()
            .pays
            .get(&pay_id)
            .copied()
            .unwrap_or_default())
    }
}

struct Subscription {
    owner: Address,
    config: MonitorConfig,
    callback: EventCallback,
}

/// Shared subscription table of every node on a [`MockChain`]. Logs reach callbacks
/// only when a test calls [`MockEventMonitor::deliver_pending`].
pub struct MockEventMonitor {
    chain: Arc<MockChain>,
    subscriptions: Mutex<BTreeMap<CallbackId, Subscription>>,
    next_id: AtomicU64,
}

impl MockEventMonitor {
    pub fn new(chain: Arc<MockChain>) -> Self {
        Self {
            chain,
            subscriptions: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn for_node(self: &Arc<Self>, owner: Address) -> NodeEventMonitor {
        NodeEventMonitor {
            shared: self.clone(),
            owner,
        }
    }

    pub fn remove_owner(&self, owner: Address) {
        self.subscriptions
            .lock()
            .unwrap()
            .retain(|_, sub| sub.owner != owner);
    }

    /// Delivers the logs queued so far and returns how many there were. Logs produced
    /// by the callbacks wait for the next call.
    pub async fn deliver_pending(&self) -> usize {
        let logs = self.chain.take_pending_logs();
        for log in &logs {
            let targets: Vec<(CallbackId, EventCallback)> = self
                .subscriptions
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, sub)| subscribed(&sub.config, self.chain.ledger, log))
                .map(|(id, sub)| (*id, sub.callback.clone()))
                .collect();
            for (id, callback) in targets {
                callback(id, log.clone()).await;
            }
        }
        logs.len()
    }
}

fn subscribed(config: &MonitorConfig, ledger: Address, log: &LedgerLog) -> bool {
    config.event == log.event.kind()
        && config.contract == ledger
        && config.start_block.map_or(true, |s| log.block_number >= s)
        && config.end_block.map_or(true, |e| log.block_number <= e)
}

pub struct NodeEventMonitor {
    shared: Arc<MockEventMonitor>,
    owner: Address,
}

#[async_trait]
impl EventMonitor for NodeEventMonitor {
    async fn monitor(
        &self,
        config: MonitorConfig,
        callback: EventCallback,
    ) -> ChannelResult<CallbackId> {
        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        self.shared.subscriptions.lock().unwrap().insert(
            id,
            Subscription {
                owner: self.owner,
                config,
                callback,
            },
        );
        Ok(id)
    }

    async fn remove_event(&self, id: CallbackId) {
        self.shared.subscriptions.lock().unwrap().remove(&id);
    }
}

/// Routes peer traffic between nodes of one process.
#[derive(Default)]
pub struct LoopbackHub {
    nodes: Mutex<HashMap<Address, Weak<ChannelNode>>>,
}

impl LoopbackHub {
    pub fn register(&self, node: &Arc<ChannelNode>) {
        self.nodes
            .lock()
            .unwrap()
            .insert(node.address(), Arc::downgrade(node));
    }

    fn node(&self, address: Address) -> ChannelResult<Arc<ChannelNode>> {
        self.nodes
            .lock()
            .unwrap()
            .get(&address)
            .and_then(Weak::upgrade)
            .ok_or(ChannelError::PeerNotFound(address))
    }
}

pub struct LoopbackPeer {
    me: Address,
    hub: Arc<LoopbackHub>,
}

#[async_trait]
impl PeerMessenger for LoopbackPeer {
    async fn request(&self, peer: Address, request: PeerRequest) -> ChannelResult<PeerResponse> {
        self.hub.node(peer)?.handle_request(self.me, request).await
    }

    async fn send(&self, peer: Address, message: PeerMessage) -> ChannelResult<()> {
        let node = self.hub.node(peer)?;
        let me = self.me;
        tokio::spawn(async move {
            let _ = node.handle_message(me, message).await;
        });
        Ok(())
    }
}

/// Records every callback invocation as a line of text.
pub struct RecordingCallbacks {
    sender: mpsc::UnboundedSender<String>,
}

pub struct RecordedEvents {
    receiver: mpsc::UnboundedReceiver<String>,
}

impl RecordingCallbacks {
    pub fn new() -> (Arc<Self>, RecordedEvents) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Arc::new(Self { sender }), RecordedEvents { receiver })
    }

    fn record(&self, event: String) {
        let _ = self.sender.send(event);
    }
}

impl RecordedEvents {
    pub async fn next(&mut self) -> String {
        tokio::time::timeout(Duration::from_secs(10), self.receiver.recv())
            .await
            .expect("timed out waiting for a callback")
            .expect("callback sender dropped")
    }

    pub fn try_next(&mut self) -> Option<String> {
        self.receiver.try_recv().ok()
    }
}

impl OpenChannelCallback for RecordingCallbacks {
    fn handle_open_channel_finish(&self, cid: ChannelId) {
        self.record(format!("open_finished {:?}", cid));
    }

    fn handle_open_channel_err(&self, err: ChannelError) {
        self.record(format!("open_error {}", err));
    }
}

impl DepositCallback for RecordingCallbacks {
    fn on_deposit(&self, job_id: &str, tx_hash: TxHash) {
        self.record(format!("deposit_ok {} {:?}", job_id, tx_hash));
    }

    fn on_error(&self, job_id: &str, err: ChannelError) {
        self.record(format!("deposit_error {} {}", job_id, err));
    }
}

impl WithdrawCallback for RecordingCallbacks {
    fn on_withdraw(&self, withdraw_hash: &str, tx_hash: TxHash) {
        self.record(format!("withdraw_ok {} {:?}", withdraw_hash, tx_hash));
    }

    fn on_error(&self, withdraw_hash: &str, err: ChannelError) {
        self.record(format!("withdraw_error {} {}", withdraw_hash, err));
    }
}

/// Two started nodes, `a` (seed [`A_SEED`]) and `b` (seed [`B_SEED`]), on one mock chain.
pub struct TestNetwork {
    pub chain: Arc<MockChain>,
    pub monitor: Arc<MockEventMonitor>,
    pub hub: Arc<LoopbackHub>,
    pub a: Arc<ChannelNode>,
    pub b: Arc<ChannelNode>,
    a_is_osp: bool,
    policy: PolicyConfig,
    tx_retry_max_elapsed: Duration,
}

impl TestNetwork {
    pub async fn new(a_is_osp: bool, b_is_osp: bool) -> Self {
        Self::with_policy(a_is_osp, b_is_osp, default_policy_config()).await
    }

    pub async fn with_policy(a_is_osp: bool, b_is_osp: bool, policy: PolicyConfig) -> Self {
        let tx_retry_max_elapsed = test_protocol_config(false).tx_retry_max_elapsed;
        Self::build(a_is_osp, b_is_osp, policy, tx_retry_max_elapsed).await
    }

    /// Nodes keep polling for receipts up to `tx_retry_max_elapsed` before giving up.
    pub async fn with_tx_retry(
        a_is_osp: bool,
        b_is_osp: bool,
        tx_retry_max_elapsed: Duration,
    ) -> Self {
        Self::build(a_is_osp, b_is_osp, default_policy_config(), tx_retry_max_elapsed).await
    }

    async fn build(
        a_is_osp: bool,
        b_is_osp: bool,
        policy: PolicyConfig,
        tx_retry_max_elapsed: Duration,
    ) -> Self {
        init_tracing_for_testing();
        let protocol = test_protocol_config(false);
        let chain = Arc::new(MockChain::new(
            protocol.ledger_address,
            protocol.wallet_address,
        ));
        let monitor = Arc::new(MockEventMonitor::new(chain.clone()));
        let hub = Arc::new(LoopbackHub::default());
        let a = spawn_node(
            &chain,
            &monitor,
            &hub,
            A_SEED,
            a_is_osp,
            &policy,
            tx_retry_max_elapsed,
            Arc::new(ChannelStore::new_in_memory()),
        )
        .await;
        let b = spawn_node(
            &chain,
            &monitor,
            &hub,
            B_SEED,
            b_is_osp,
            &policy,
            tx_retry_max_elapsed,
            Arc::new(ChannelStore::new_in_memory()),
        )
        .await;
        Self {
            chain,
            monitor,
            hub,
            a,
            b,
            a_is_osp,
            policy,
            tx_retry_max_elapsed,
        }
    }

    /// Replaces `a` by a fresh node on the same store, as after a process restart.
    pub async fn restart_a(&self) -> Arc<ChannelNode> {
        self.monitor.remove_owner(self.a.address());
        spawn_node(
            &self.chain,
            &self.monitor,
            &self.hub,
            A_SEED,
            self.a_is_osp,
            &self.policy,
            self.tx_retry_max_elapsed,
            self.store_of(&self.a),
        )
        .await
    }

    pub async fn deliver_events(&self) -> usize {
        self.monitor.deliver_pending().await
    }

    /// Opens an ETH channel from `a` to `b` and delivers its OpenChannel event.
    pub async fn open_funded_channel(&self, a_amount: u64, b_amount: u64) -> ChannelId {
        self.open_funded_channel_with(TokenInfo::eth(), a_amount, b_amount)
            .await
    }

    pub async fn open_funded_channel_with(
        &self,
        token: TokenInfo,
        a_amount: u64,
        b_amount: u64,
    ) -> ChannelId {
        let cid = self
            .a
            .open_channel(
                self.b.address(),
                U256::from(a_amount),
                U256::from(b_amount),
                token,
                false,
                None,
            )
            .await
            .unwrap();
        self.deliver_events().await;
        assert_eq!(
            self.row(&self.a, cid).await.unwrap().state,
            ChannelState::Opened
        );
        cid
    }

    pub async fn row(&self, node: &ChannelNode, cid: ChannelId) -> Option<ChannelRow> {
        node.context()
            .store
            .view(|s| s.channels.get(&cid).cloned())
            .await
    }

    pub fn store_of(&self, node: &ChannelNode) -> Arc<ChannelStore> {
        node.context().store.clone()
    }
}

async fn spawn_node(
    chain: &Arc<MockChain>,
    monitor: &Arc<MockEventMonitor>,
    hub: &Arc<LoopbackHub>,
    seed: u64,
    is_osp: bool,
    policy: &PolicyConfig,
    tx_retry_max_elapsed: Duration,
    store: Arc<ChannelStore>,
) -> Arc<ChannelNode> {
    let signer = Arc::new(signer_from_seed(seed));
    let me = signer.address();
    let metrics = Arc::new(ChannelMetrics::new_for_testing());
    let ctx = ChannelContext {
        signer,
        store,
        ledger: Arc::new(MockLedgerClient::new(chain.clone(), me)),
        monitor: Arc::new(monitor.for_node(me)),
        messenger: Arc::new(LoopbackPeer {
            me,
            hub: hub.clone(),
        }),
        effects: Arc::new(EffectDispatcher::new(metrics.clone(), None)),
        metrics,
        protocol: ProtocolConfig {
            tx_retry_max_elapsed,
            ..test_protocol_config(is_osp)
        },
    };
    let node = Arc::new(ChannelNode::new(ctx, PolicyEngine::new(policy.clone())));
    hub.register(&node);
    node.start().await.unwrap();
    node
}
