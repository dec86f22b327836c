// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::error::ChannelError;
use ethers::types::{Address, Bytes, TxHash, H256, U256};
use serde::{Deserialize, Serialize};
use std::fmt;

pub type ChannelId = H256;
pub type PayId = H256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TokenType {
    Eth,
    Erc20,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TokenInfo {
    pub token_type: TokenType,
    /// Zero for the native token.
    pub address: Address,
}

impl TokenInfo {
    pub fn eth() -> Self {
        Self {
            token_type: TokenType::Eth,
            address: Address::zero(),
        }
    }

    pub fn erc20(address: Address) -> Self {
        Self {
            token_type: TokenType::Erc20,
            address,
        }
    }

    /// Zero address maps to the native token.
    pub fn from_address(address: Address) -> Self {
        if address.is_zero() {
            Self::eth()
        } else {
            Self::erc20(address)
        }
    }

    pub fn is_eth(&self) -> bool {
        self.token_type == TokenType::Eth
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountAmtPair {
    pub account: Address,
    pub amount: U256,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenDistribution {
    pub token: TokenInfo,
    /// Ordered by ascending account address.
    pub distribution: [AccountAmtPair; 2],
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInitializer {
    pub init_distribution: TokenDistribution,
    pub open_deadline: u64,
    pub dispute_timeout: u64,
    /// Index of the party whose deposit is carried as the transaction value.
    pub msg_value_receiver: u8,
}

impl ChannelInitializer {
    pub fn peers(&self) -> [Address; 2] {
        let d = &self.init_distribution.distribution;
        [d[0].account, d[1].account]
    }

    pub fn token(&self) -> TokenInfo {
        self.init_distribution.token
    }

    pub fn is_sorted(&self) -> bool {
        let [low, high] = self.peers();
        low < high
    }

    pub fn amount_of(&self, account: Address) -> Option<U256> {
        self.init_distribution
            .distribution
            .iter()
            .find(|pair| pair.account == account)
            .map(|pair| pair.amount)
    }

    /// The participant that is not `me`.
    pub fn counterparty(&self, me: Address) -> Option<Address> {
        let [a, b] = self.peers();
        if a == me {
            Some(b)
        } else if b == me {
            Some(a)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenTransfer {
    pub token: TokenInfo,
    pub receiver: AccountAmtPair,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayIdList {
    pub pay_ids: Vec<PayId>,
    pub next_list_hash: Option<H256>,
}

impl PayIdList {
    pub fn is_empty(&self) -> bool {
        self.pay_ids.is_empty() && self.next_list_hash.is_none()
    }
}

/// One direction of a duplex channel, from `peer_from` to the other party.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimplexPaymentChannel {
    pub channel_id: ChannelId,
    pub peer_from: Address,
    pub seq_num: u64,
    pub transfer_to_peer: TokenTransfer,
    pub pending_pay_ids: PayIdList,
    pub last_pay_resolve_deadline: u64,
    pub total_pending_amount: U256,
}

impl SimplexPaymentChannel {
    pub fn new_empty(cid: ChannelId, from: Address, to: Address, token: TokenInfo) -> Self {
        Self {
            channel_id: cid,
            peer_from: from,
            seq_num: 0,
            transfer_to_peer: TokenTransfer {
                token,
                receiver: AccountAmtPair {
                    account: to,
                    amount: U256::zero(),
                },
            },
            pending_pay_ids: PayIdList::default(),
            last_pay_resolve_deadline: 0,
            total_pending_amount: U256::zero(),
        }
    }

    pub fn transfer_amount(&self) -> U256 {
        self.transfer_to_peer.receiver.amount
    }

    pub fn peer_to(&self) -> Address {
        self.transfer_to_peer.receiver.account
    }

    /// Nothing transferred and nothing pending.
    pub fn is_empty(&self) -> bool {
        self.transfer_amount().is_zero()
            && self.total_pending_amount.is_zero()
            && self.pending_pay_ids.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedSimplexState {
    pub simplex: SimplexPaymentChannel,
    pub sig_of_peer_from: Option<Bytes>,
    pub sig_of_peer_to: Option<Bytes>,
}

impl SignedSimplexState {
    pub fn seq_num(&self) -> u64 {
        self.simplex.seq_num
    }

    pub fn is_co_signed(&self) -> bool {
        self.sig_of_peer_from.is_some() && self.sig_of_peer_to.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Condition {
    HashLock(H256),
    DeployedContract {
        contract: Address,
        args_query_finalization: Bytes,
        args_query_outcome: Bytes,
    },
    VirtualContract {
        virtual_address: H256,
        args_query_finalization: Bytes,
        args_query_outcome: Bytes,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferLogic {
    BooleanAndMax,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferFunction {
    pub logic: TransferLogic,
    pub max_transfer: TokenTransfer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionalPay {
    pub pay_timestamp: u64,
    pub src: Address,
    pub dest: Address,
    pub conditions: Vec<Condition>,
    pub transfer_func: TransferFunction,
    pub resolve_deadline: u64,
    pub resolve_timeout: u64,
    pub pay_resolver: Address,
}

impl ConditionalPay {
    pub fn max_amount(&self) -> U256 {
        self.transfer_func.max_transfer.receiver.amount
    }

    pub fn hash_locks(&self) -> impl Iterator<Item = &H256> {
        self.conditions.iter().filter_map(|c| match c {
            Condition::HashLock(hash) => Some(hash),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PayState {
    Created,
    OneSigPending,
    CoSignedPending,
    SecretRevealed,
    PaidMax,
    Canceled,
    Rejected,
    Nacked,
}

impl PayState {
    pub fn is_resolved(&self) -> bool {
        matches!(
            self,
            PayState::PaidMax | PayState::Canceled | PayState::Rejected | PayState::Nacked
        )
    }
}

/// Where a pay sits on one of its adjoining channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayPlacement {
    pub cid: ChannelId,
    pub state: PayState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayRecord {
    pub pay: ConditionalPay,
    pub ingress: Option<PayPlacement>,
    pub egress: Option<PayPlacement>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingWithdrawal {
    pub amount: U256,
    pub receiver: Address,
    pub deadline: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnChainBalance {
    pub my_deposit: U256,
    pub my_withdrawal: U256,
    pub peer_deposit: U256,
    pub peer_withdrawal: U256,
    pub pending_withdrawal: Option<PendingWithdrawal>,
}

impl OnChainBalance {
    /// Builds a snapshot from ledger arrays ordered by ascending address.
    pub fn from_sorted(
        me: Address,
        peer: Address,
        deposits: [U256; 2],
        withdrawals: [U256; 2],
    ) -> Self {
        let my_index = if me < peer { 0 } else { 1 };
        Self {
            my_deposit: deposits[my_index],
            my_withdrawal: withdrawals[my_index],
            peer_deposit: deposits[1 - my_index],
            peer_withdrawal: withdrawals[1 - my_index],
            pending_withdrawal: None,
        }
    }

    /// Folds deposit totals from a ledger log into the snapshot. Ledger totals never
    /// decrease, so a log older than the snapshot changes nothing.
    pub fn merge_deposits(&mut self, me: Address, peer: Address, deposits: [U256; 2]) {
        let my_index = if me < peer { 0 } else { 1 };
        self.my_deposit = self.my_deposit.max(deposits[my_index]);
        self.peer_deposit = self.peer_deposit.max(deposits[1 - my_index]);
    }

    /// Folds withdrawal totals from a ledger log into the snapshot and drops the
    /// pending withdrawal once its receiver's total has grown. Returns whether any
    /// total grew.
    pub fn merge_withdrawals(
        &mut self,
        me: Address,
        peer: Address,
        withdrawals: [U256; 2],
    ) -> bool {
        let my_index = if me < peer { 0 } else { 1 };
        let mine = withdrawals[my_index] > self.my_withdrawal;
        let peers = withdrawals[1 - my_index] > self.peer_withdrawal;
        if mine {
            self.my_withdrawal = withdrawals[my_index];
        }
        if peers {
            self.peer_withdrawal = withdrawals[1 - my_index];
        }
        let settled = self.pending_withdrawal.is_some_and(|p| {
            (p.receiver == me && mine) || (p.receiver == peer && peers)
        });
        if settled {
            self.pending_withdrawal = None;
        }
        mine || peers
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelState {
    Null,
    TrustOpened,
    Instantiating,
    Opened,
    Settling,
    Closed,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelState::Null => "NULL",
            ChannelState::TrustOpened => "TRUST_OPENED",
            ChannelState::Instantiating => "INSTANTIATING",
            ChannelState::Opened => "OPENED",
            ChannelState::Settling => "SETTLING",
            ChannelState::Closed => "CLOSED",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeqNums {
    pub base: u64,
    pub last_used: u64,
    pub last_acked: u64,
    pub last_nacked: u64,
}

impl SeqNums {
    pub fn starting_at(seq: u64) -> Self {
        Self {
            base: seq,
            last_used: seq,
            last_acked: seq,
            last_nacked: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRow {
    pub cid: ChannelId,
    pub peer: Address,
    pub token: TokenInfo,
    pub ledger: Address,
    pub state: ChannelState,
    pub open_response: Option<OpenChannelResponse>,
    pub on_chain_balance: OnChainBalance,
    /// Direction from this node to the peer.
    pub self_simplex: SignedSimplexState,
    /// Direction from the peer to this node.
    pub peer_simplex: SignedSimplexState,
    pub seq_nums: SeqNums,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSummary {
    pub cid: ChannelId,
    pub my_seq: u64,
    pub peer_seq: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthReq {
    pub my_addr: Address,
    pub timestamp: u64,
    pub my_sig: Bytes,
    pub expect_peer: Address,
    pub protocol_version: u64,
    pub opened_channels: Vec<ChannelSummary>,
}

/// Per-channel sync record. "authreq" refers to the requester's outgoing direction,
/// "authack" to the responder's.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInAuth {
    pub cid: ChannelId,
    pub state: ChannelState,
    pub ledger: Address,
    pub open_channel_response: Option<OpenChannelResponse>,
    pub authreq_simplex: Option<SignedSimplexState>,
    pub authack_simplex: Option<SignedSimplexState>,
    pub authreq_pays: Vec<ConditionalPay>,
    pub authack_pays: Vec<ConditionalPay>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthAck {
    pub sync_channels: Vec<ChannelInAuth>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpenBy {
    /// The requester submits the open transaction.
    Proposer,
    /// The approver submits the open transaction.
    Approver,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenChannelRequest {
    pub channel_initializer: ChannelInitializer,
    pub requester_sig: Bytes,
    pub open_by: OpenBy,
    pub osp_to_osp: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpenChannelStatus {
    Approved,
    TxSubmitted,
    TcbOpened,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenChannelResponse {
    pub channel_initializer: ChannelInitializer,
    pub requester_sig: Bytes,
    pub approver_sig: Bytes,
    pub status: OpenChannelStatus,
}

impl OpenChannelResponse {
    /// Signatures ordered like the initializer's distribution.
    pub fn sorted_sigs(&self, requester: Address, approver: Address) -> [Bytes; 2] {
        if requester < approver {
            [self.requester_sig.clone(), self.approver_sig.clone()]
        } else {
            [self.approver_sig.clone(), self.requester_sig.clone()]
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CooperativeWithdrawInfo {
    pub channel_id: ChannelId,
    pub seq_num: u64,
    pub withdraw: AccountAmtPair,
    pub withdraw_deadline: u64,
    /// Zero when withdrawing to the receiver's account.
    pub recipient_channel_id: ChannelId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CooperativeWithdrawRequest {
    pub withdraw_info: CooperativeWithdrawInfo,
    pub requester_sig: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CooperativeWithdrawResponse {
    pub withdraw_info: CooperativeWithdrawInfo,
    pub requester_sig: Bytes,
    pub approver_sig: Option<Bytes>,
    pub error: Option<String>,
}

/// Peer RPCs that expect a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerRequest {
    Auth(AuthReq),
    OpenChannel(OpenChannelRequest),
    TcbOpenChannel(OpenChannelRequest),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerResponse {
    AuthAck(AuthAck),
    OpenChannel(OpenChannelResponse),
}

/// One-way peer messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerMessage {
    CooperativeWithdrawRequest(CooperativeWithdrawRequest),
    CooperativeWithdrawResponse(CooperativeWithdrawResponse),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LedgerEventKind {
    OpenChannel,
    Deposit,
    CooperativeWithdraw,
    IntendSettle,
    ConfirmSettle,
    IntendWithdraw,
    ConfirmWithdraw,
    VetoWithdraw,
}

impl LedgerEventKind {
    pub const ALL: [LedgerEventKind; 8] = [
        LedgerEventKind::OpenChannel,
        LedgerEventKind::Deposit,
        LedgerEventKind::CooperativeWithdraw,
        LedgerEventKind::IntendSettle,
        LedgerEventKind::ConfirmSettle,
        LedgerEventKind::IntendWithdraw,
        LedgerEventKind::ConfirmWithdraw,
        LedgerEventKind::VetoWithdraw,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            LedgerEventKind::OpenChannel => "OpenChannel",
            LedgerEventKind::Deposit => "Deposit",
            LedgerEventKind::CooperativeWithdraw => "CooperativeWithdraw",
            LedgerEventKind::IntendSettle => "IntendSettle",
            LedgerEventKind::ConfirmSettle => "ConfirmSettle",
            LedgerEventKind::IntendWithdraw => "IntendWithdraw",
            LedgerEventKind::ConfirmWithdraw => "ConfirmWithdraw",
            LedgerEventKind::VetoWithdraw => "VetoWithdraw",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerEvent {
    OpenChannel {
        cid: ChannelId,
        token: TokenInfo,
        peers: [Address; 2],
        initial_deposits: [U256; 2],
    },
    Deposit {
        cid: ChannelId,
        peers: [Address; 2],
        deposits: [U256; 2],
        withdrawals: [U256; 2],
    },
    CooperativeWithdraw {
        cid: ChannelId,
        withdrawn_amount: U256,
        receiver: Address,
        recipient_cid: ChannelId,
        deposits: [U256; 2],
        withdrawals: [U256; 2],
        seq_num: u64,
    },
    IntendSettle {
        cid: ChannelId,
        /// Ordered by ascending peer address.
        seq_nums: [u64; 2],
    },
    ConfirmSettle {
        cid: ChannelId,
        settle_balance: [U256; 2],
    },
    IntendWithdraw {
        cid: ChannelId,
        receiver: Address,
        amount: U256,
    },
    ConfirmWithdraw {
        cid: ChannelId,
        withdrawn_amount: U256,
        receiver: Address,
        recipient_cid: ChannelId,
        deposits: [U256; 2],
        withdrawals: [U256; 2],
    },
    VetoWithdraw {
        cid: ChannelId,
    },
}

impl LedgerEvent {
    pub fn kind(&self) -> LedgerEventKind {
        match self {
            LedgerEvent::OpenChannel { .. } => LedgerEventKind::OpenChannel,
            LedgerEvent::Deposit { .. } => LedgerEventKind::Deposit,
            LedgerEvent::CooperativeWithdraw { .. } => LedgerEventKind::CooperativeWithdraw,
            LedgerEvent::IntendSettle { .. } => LedgerEventKind::IntendSettle,
            LedgerEvent::ConfirmSettle { .. } => LedgerEventKind::ConfirmSettle,
            LedgerEvent::IntendWithdraw { .. } => LedgerEventKind::IntendWithdraw,
            LedgerEvent::ConfirmWithdraw { .. } => LedgerEventKind::ConfirmWithdraw,
            LedgerEvent::VetoWithdraw { .. } => LedgerEventKind::VetoWithdraw,
        }
    }

    pub fn cid(&self) -> ChannelId {
        match self {
            LedgerEvent::OpenChannel { cid, .. }
            | LedgerEvent::Deposit { cid, .. }
            | LedgerEvent::CooperativeWithdraw { cid, .. }
            | LedgerEvent::IntendSettle { cid, .. }
            | LedgerEvent::ConfirmSettle { cid, .. }
            | LedgerEvent::IntendWithdraw { cid, .. }
            | LedgerEvent::ConfirmWithdraw { cid, .. }
            | LedgerEvent::VetoWithdraw { cid } => *cid,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerLog {
    pub tx_hash: TxHash,
    pub block_number: u64,
    pub log_index: u64,
    pub event: LedgerEvent,
}

/// Work queued by a store transaction, dispatched only after it commits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxEffect {
    OpenChannelFinished { token: TokenInfo, cid: ChannelId },
    OpenChannelFailed { token: TokenInfo, error: ChannelError },
    RouteEdgeAdded { cid: ChannelId, peers: [Address; 2], token: TokenInfo },
    RouteEdgeRemoved { cid: ChannelId },
    ChannelClosed { cid: ChannelId },
    DepositJobFinished {
        job_id: String,
        outcome: Result<TxHash, ChannelError>,
    },
    WithdrawJobFinished {
        withdraw_hash: String,
        outcome: Result<TxHash, ChannelError>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DepositJobState {
    WaitApprove,
    WaitDeposit,
    Succeeded,
    Failed,
}

impl DepositJobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DepositJobState::Succeeded | DepositJobState::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositJob {
    pub job_id: String,
    pub cid: ChannelId,
    pub token: TokenInfo,
    pub amount: U256,
    pub state: DepositJobState,
    pub approve_tx: Option<TxHash>,
    pub deposit_tx: Option<TxHash>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WithdrawJobState {
    WaitResponse,
    WaitTx,
    Succeeded,
    Failed,
}

impl WithdrawJobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WithdrawJobState::Succeeded | WithdrawJobState::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CooperativeWithdrawJob {
    pub withdraw_hash: String,
    pub cid: ChannelId,
    pub request: CooperativeWithdrawRequest,
    pub state: WithdrawJobState,
    pub tx_hash: Option<TxHash>,
    pub error: Option<String>,
}
