// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Subscriptions to ledger contract events.
//!
//! Delivery is at least once: a subscription resumes from its persisted cursor after a
//! restart and may hand the same log to its callback again, so callbacks are idempotent.

use crate::error::ChannelResult;
use crate::types::{LedgerEventKind, LedgerLog};
use async_trait::async_trait;
use ethers::types::Address;
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;

pub mod eth;

pub type CallbackId = u64;

pub type EventCallback =
    Arc<dyn Fn(CallbackId, LedgerLog) -> BoxFuture<'static, ()> + Send + Sync>;

pub fn event_callback<F, Fut>(f: F) -> EventCallback
where
    F: Fn(CallbackId, LedgerLog) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |id, log| Box::pin(f(id, log)))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorConfig {
    pub event: LedgerEventKind,
    pub contract: Address,
    /// Defaults to the persisted cursor, then the current block.
    pub start_block: Option<u64>,
    /// Inclusive. `None` watches forever.
    pub end_block: Option<u64>,
    /// Skip the poll interval while behind the chain head.
    pub quick_catch: bool,
    /// Ignore the persisted cursor.
    pub reset: bool,
}

impl MonitorConfig {
    pub fn new(event: LedgerEventKind, contract: Address) -> Self {
        Self {
            event,
            contract,
            start_block: None,
            end_block: None,
            quick_catch: false,
            reset: false,
        }
    }

    pub fn bounded(mut self, start_block: u64, end_block: u64) -> Self {
        self.start_block = Some(start_block);
        self.end_block = Some(end_block);
        self.reset = true;
        self
    }

    /// Key of the persisted cursor for this subscription.
    pub fn cursor_key(&self) -> String {
        format!("{}-{:?}", self.event.name(), self.contract)
    }
}

#[async_trait]
pub trait EventMonitor: Send + Sync {
    async fn monitor(
        &self,
        config: MonitorConfig,
        callback: EventCallback,
    ) -> ChannelResult<CallbackId>;

    async fn remove_event(&self, id: CallbackId);
}
