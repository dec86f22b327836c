// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::types::{ChannelId, ChannelState};
use ethers::types::{Address, TxHash, U256};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    // Signature does not recover to the expected signer
    #[error("invalid signature")]
    InvalidSignature,
    // Sequence number is not newer than the local one
    #[error("invalid sequence number: {0}")]
    InvalidSeqNum(String),
    // Message refers to a different channel than expected
    #[error("invalid channel id: {0}")]
    InvalidChannelId(String),
    // Simplex sender is not the expected party
    #[error("invalid peer from: {0}")]
    InvalidPeerFrom(String),
    // Empty simplex carries pending pays
    #[error("invalid pending pays: {0}")]
    InvalidPendingPays(String),
    #[error("channel {0:?} not found")]
    ChannelNotFound(ChannelId),
    #[error("no channel with peer {0:?}")]
    PeerNotFound(Address),
    // Transition rejected by the channel state table
    #[error("invalid channel state change from {from} to {to}")]
    InvalidChannelState { from: ChannelState, to: ChannelState },
    // OpenChannel event observed for a channel that is already live
    #[error("open channel event on wrong state {0}")]
    OpenEventOnWrongState(ChannelState),
    // OpenChannel event whose token or peers differ from the stored channel
    #[error("open channel event does not match channel: {0}")]
    OpenEventMismatch(String),
    // Auth replay
    #[error("stale auth timestamp {got}, last seen {last}")]
    StaleAuthTimestamp { last: u64, got: u64 },
    #[error("rejected by policy: {0}")]
    PolicyRejected(String),
    #[error("insufficient balance, required {required} available {available}")]
    InsufficientBalance { required: U256, available: U256 },
    #[error("previous withdraw still pending")]
    PreviousWithdrawPending,
    #[error("deadline passed: {0}")]
    DeadlinePassed(String),
    // Confirm attempted before the on-chain dispute window closed
    #[error("dispute window open until block {until}, current block {current}")]
    DisputeWindowOpen { current: u64, until: u64 },
    #[error("secret of hash lock {0:?} not revealed")]
    SecretNotRevealed(ethers::types::H256),
    // Another open for the same (peer, token) is in flight
    #[error("more than one inflight open channel request")]
    DuplicateOpenRequest,
    #[error("channel already exists: {0:?}")]
    ChannelAlreadyExists(ChannelId),
    #[error("job {0} not found")]
    JobNotFound(String),
    // Persisted failure of a finished job
    #[error("job failed: {0}")]
    JobFailed(String),
    #[error("timeout: {0}")]
    Timeout(String),
    // Mined but reverted
    #[error("transaction {0:?} failed")]
    TxFailed(TxHash),
    // Transient RPC error
    #[error("provider error: {0}")]
    Provider(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ChannelError {
    /// Returns a short string identifying the error type for metrics labels
    pub fn error_type(&self) -> &'static str {
        match self {
            ChannelError::InvalidSignature => "invalid_signature",
            ChannelError::InvalidSeqNum(_) => "invalid_seq_num",
            ChannelError::InvalidChannelId(_) => "invalid_channel_id",
            ChannelError::InvalidPeerFrom(_) => "invalid_peer_from",
            ChannelError::InvalidPendingPays(_) => "invalid_pending_pays",
            ChannelError::ChannelNotFound(_) => "channel_not_found",
            ChannelError::PeerNotFound(_) => "peer_not_found",
            ChannelError::InvalidChannelState { .. } => "invalid_channel_state",
            ChannelError::OpenEventOnWrongState(_) => "open_event_on_wrong_state",
            ChannelError::OpenEventMismatch(_) => "open_event_mismatch",
            ChannelError::StaleAuthTimestamp { .. } => "stale_auth_timestamp",
            ChannelError::PolicyRejected(_) => "policy_rejected",
            ChannelError::InsufficientBalance { .. } => "insufficient_balance",
            ChannelError::PreviousWithdrawPending => "previous_withdraw_pending",
            ChannelError::DeadlinePassed(_) => "deadline_passed",
            ChannelError::DisputeWindowOpen { .. } => "dispute_window_open",
            ChannelError::SecretNotRevealed(_) => "secret_not_revealed",
            ChannelError::DuplicateOpenRequest => "duplicate_open_request",
            ChannelError::ChannelAlreadyExists(_) => "channel_already_exists",
            ChannelError::JobNotFound(_) => "job_not_found",
            ChannelError::JobFailed(_) => "job_failed",
            ChannelError::Timeout(_) => "timeout",
            ChannelError::TxFailed(_) => "tx_failed",
            ChannelError::Provider(_) => "provider_error",
            ChannelError::Storage(_) => "storage_error",
            ChannelError::Serialization(_) => "serialization_error",
            ChannelError::InvalidArgument(_) => "invalid_argument",
            ChannelError::Internal(_) => "internal_error",
        }
    }

    /// Transient infrastructure failures are the only ones worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, ChannelError::Provider(_) | ChannelError::Timeout(_))
    }
}

impl From<serde_json::Error> for ChannelError {
    fn from(e: serde_json::Error) -> Self {
        ChannelError::Serialization(e.to_string())
    }
}

impl From<ethers::providers::ProviderError> for ChannelError {
    fn from(e: ethers::providers::ProviderError) -> Self {
        ChannelError::Provider(e.to_string())
    }
}

impl From<ethers::abi::Error> for ChannelError {
    fn from(e: ethers::abi::Error) -> Self {
        ChannelError::Serialization(e.to_string())
    }
}

impl From<std::io::Error> for ChannelError {
    fn from(e: std::io::Error) -> Self {
        ChannelError::Storage(e.to_string())
    }
}

pub type ChannelResult<T> = Result<T, ChannelError>;
