// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::error::{ChannelError, ChannelResult};
use crate::types::{PeerMessage, PeerRequest, PeerResponse};
use async_trait::async_trait;
use ethers::types::Address;

/// Transport to other nodes. Framing and connection management live behind it.
#[async_trait]
pub trait PeerMessenger: Send + Sync {
    /// Sends a request and waits for the peer's response.
    async fn request(&self, peer: Address, request: PeerRequest) -> ChannelResult<PeerResponse>;

    /// Sends a one-way message.
    async fn send(&self, peer: Address, message: PeerMessage) -> ChannelResult<()>;
}

/// Messenger of a node whose peer transport is not wired up. Every peer is unreachable.
pub struct DisconnectedMessenger;

#[async_trait]
impl PeerMessenger for DisconnectedMessenger {
    async fn request(&self, peer: Address, _request: PeerRequest) -> ChannelResult<PeerResponse> {
        Err(ChannelError::PeerNotFound(peer))
    }

    async fn send(&self, peer: Address, _message: PeerMessage) -> ChannelResult<()> {
        Err(ChannelError::PeerNotFound(peer))
    }
}
