// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! On-chain ledger access: reads and transaction submission.

use crate::error::ChannelResult;
use crate::types::{
    ChannelId, ChannelInitializer, ConditionalPay, CooperativeWithdrawInfo, SignedSimplexState,
    TokenInfo,
};
use async_trait::async_trait;
use ethers::types::{Address, Bytes, TxHash, H256, U256};

pub mod eth;

/// Every transaction this node can submit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerTx {
    Erc20Approve {
        token: Address,
        spender: Address,
        amount: U256,
    },
    OpenChannel {
        initializer: ChannelInitializer,
        /// Ordered like the initializer distribution.
        sigs: [Bytes; 2],
        value: U256,
    },
    Deposit {
        cid: ChannelId,
        receiver: Address,
        amount: U256,
        token: TokenInfo,
    },
    CooperativeWithdraw {
        info: CooperativeWithdrawInfo,
        sigs: [Bytes; 2],
    },
    IntendSettle {
        states: Vec<SignedSimplexState>,
    },
    ConfirmSettle {
        cid: ChannelId,
    },
    IntendWithdraw {
        cid: ChannelId,
        amount: U256,
        recipient_cid: ChannelId,
    },
    ConfirmWithdraw {
        cid: ChannelId,
    },
    VetoWithdraw {
        cid: ChannelId,
    },
    ResolvePaymentByConditions {
        pay: ConditionalPay,
        preimages: Vec<Bytes>,
    },
}

impl LedgerTx {
    pub fn kind(&self) -> &'static str {
        match self {
            LedgerTx::Erc20Approve { .. } => "approve",
            LedgerTx::OpenChannel { .. } => "open_channel",
            LedgerTx::Deposit { .. } => "deposit",
            LedgerTx::CooperativeWithdraw { .. } => "cooperative_withdraw",
            LedgerTx::IntendSettle { .. } => "intend_settle",
            LedgerTx::ConfirmSettle { .. } => "confirm_settle",
            LedgerTx::IntendWithdraw { .. } => "intend_withdraw",
            LedgerTx::ConfirmWithdraw { .. } => "confirm_withdraw",
            LedgerTx::VetoWithdraw { .. } => "veto_withdraw",
            LedgerTx::ResolvePaymentByConditions { .. } => "resolve_payment",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxReceipt {
    pub tx_hash: TxHash,
    pub block_number: u64,
    /// False when the transaction was mined but reverted.
    pub success: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PayInfo {
    pub amount: U256,
    pub resolve_deadline: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WithdrawIntent {
    pub receiver: Address,
    pub amount: U256,
    pub request_block: u64,
    pub recipient_cid: ChannelId,
}

/// Deposits and withdrawals of both peers, ordered by ascending address.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BalanceMap {
    pub peers: [Address; 2],
    pub deposits: [U256; 2],
    pub withdrawals: [U256; 2],
}

#[async_trait]
pub trait LedgerClient: Send + Sync {
    fn ledger_address(&self) -> Address;

    fn wallet_address(&self) -> Address;

    /// Account transactions are sent from.
    fn account(&self) -> Address;

    async fn block_number(&self) -> ChannelResult<u64>;

    async fn submit(&self, tx: LedgerTx) -> ChannelResult<TxHash>;

    async fn wait_mined(&self, tx_hash: TxHash) -> ChannelResult<TxReceipt>;

    async fn erc20_allowance(
        &self,
        token: Address,
        owner: Address,
        spender: Address,
    ) -> ChannelResult<U256>;

    async fn erc20_balance(&self, token: Address, owner: Address) -> ChannelResult<U256>;

    async fn native_balance(&self, owner: Address) -> ChannelResult<U256>;

    async fn cooperative_withdraw_seq_num(&self, cid: ChannelId) -> ChannelResult<u64>;

    async fn settle_finalized_time(&self, cid: ChannelId) -> ChannelResult<u64>;

    async fn withdraw_intent(&self, cid: ChannelId) -> ChannelResult<Option<WithdrawIntent>>;

    async fn dispute_timeout(&self, cid: ChannelId) -> ChannelResult<u64>;

    async fn balance_map(&self, cid: ChannelId) -> ChannelResult<BalanceMap>;

    async fn pay_info(&self, pay_id: H256) -> ChannelResult<PayInfo>;
}
