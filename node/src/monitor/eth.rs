// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::error::{ChannelError, ChannelResult};
use crate::monitor::{CallbackId, EventCallback, EventMonitor, MonitorConfig};
use crate::retry_with_max_elapsed_time;
use crate::store::ChannelStore;
use crate::types::{LedgerEvent, LedgerEventKind, LedgerLog, TokenInfo, TokenType};
use async_trait::async_trait;
use ethers::abi::{self, ParamType, Token};
use ethers::providers::{JsonRpcClient, Middleware, Provider};
use ethers::types::{Address, Filter, Log, H256, U256};
use ethers::utils::keccak256;
use once_cell::sync::Lazy;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const MAX_BLOCK_RANGE: u64 = 1000;

static EVENT_TOPICS: Lazy<BTreeMap<LedgerEventKind, H256>> = Lazy::new(|| {
    LedgerEventKind::ALL
        .iter()
        .map(|kind| (*kind, H256::from(keccak256(event_signature(*kind)))))
        .collect()
});

fn event_signature(kind: LedgerEventKind) -> &'static str {
    match kind {
        LedgerEventKind::OpenChannel => "OpenChannel(bytes32,uint256,address,address[2],uint256[2])",
        LedgerEventKind::Deposit => "Deposit(bytes32,address[2],uint256[2],uint256[2])",
        LedgerEventKind::CooperativeWithdraw => {
            "CooperativeWithdraw(bytes32,uint256,address,bytes32,uint256[2],uint256[2],uint256)"
        }
        LedgerEventKind::IntendSettle => "IntendSettle(bytes32,uint256[2])",
        LedgerEventKind::ConfirmSettle => "ConfirmSettle(bytes32,uint256[2])",
        LedgerEventKind::IntendWithdraw => "IntendWithdraw(bytes32,address,uint256)",
        LedgerEventKind::ConfirmWithdraw => {
            "ConfirmWithdraw(bytes32,uint256,address,bytes32,uint256[2],uint256[2])"
        }
        LedgerEventKind::VetoWithdraw => "VetoWithdraw(bytes32)",
    }
}

pub fn event_topic(kind: LedgerEventKind) -> H256 {
    EVENT_TOPICS.get(&kind).copied().unwrap_or_default()
}

fn topic_at(log: &Log, index: usize) -> Option<H256> {
    log.topics.get(index).copied()
}

fn topic_address(topic: H256) -> Address {
    Address::from_slice(&topic.as_bytes()[12..])
}

fn uint_pair(token: Token) -> Option<[U256; 2]> {
    let items: Vec<U256> = token
        .into_fixed_array()?
        .into_iter()
        .filter_map(Token::into_uint)
        .collect();
    <[U256; 2]>::try_from(items).ok()
}

fn address_pair(token: Token) -> Option<[Address; 2]> {
    let items: Vec<Address> = token
        .into_fixed_array()?
        .into_iter()
        .filter_map(Token::into_address)
        .collect();
    <[Address; 2]>::try_from(items).ok()
}

fn u64_of(token: Token) -> Option<u64> {
    let value = token.into_uint()?;
    (value <= U256::from(u64::MAX)).then(|| value.low_u64())
}

fn fixed_pair(kind: ParamType) -> ParamType {
    ParamType::FixedArray(Box::new(kind), 2)
}

/// Decodes a raw ledger log. Returns `None` for logs of other events or malformed data.
pub fn decode_ledger_event(kind: LedgerEventKind, log: &Log) -> Option<LedgerEvent> {
    if topic_at(log, 0)? != event_topic(kind) {
        return None;
    }
    let cid = topic_at(log, 1)?;
    let event = match kind {
        LedgerEventKind::OpenChannel => {
            let mut data = abi::decode(
                &[
                    ParamType::Uint(256),
                    fixed_pair(ParamType::Address),
                    fixed_pair(ParamType::Uint(256)),
                ],
                &log.data,
            )
            .ok()?
            .into_iter();
            let token_type = data.next()?.into_uint()?;
            let token_address = topic_address(topic_at(log, 2)?);
            let token = if token_type == U256::one() {
                TokenInfo::eth()
            } else {
                TokenInfo {
                    token_type: TokenType::Erc20,
                    address: token_address,
                }
            };
            LedgerEvent::OpenChannel {
                cid,
                token,
                peers: address_pair(data.next()?)?,
                initial_deposits: uint_pair(data.next()?)?,
            }
        }
        LedgerEventKind::Deposit => {
            let mut data = abi::decode(
                &[
                    fixed_pair(ParamType::Address),
                    fixed_pair(ParamType::Uint(256)),
                    fixed_pair(ParamType::Uint(256)),
                ],
                &log.data,
            )
            .ok()?
            .into_iter();
            LedgerEvent::Deposit {
                cid,
                peers: address_pair(data.next()?)?,
                deposits: uint_pair(data.next()?)?,
                withdrawals: uint_pair(data.next()?)?,
            }
        }
        LedgerEventKind::CooperativeWithdraw => {
            let mut data = abi::decode(
                &[
                    ParamType::Uint(256),
                    fixed_pair(ParamType::Uint(256)),
                    fixed_pair(ParamType::Uint(256)),
                    ParamType::Uint(256),
                ],
                &log.data,
            )
            .ok()?
            .into_iter();
            LedgerEvent::CooperativeWithdraw {
                cid,
                withdrawn_amount: data.next()?.into_uint()?,
                receiver: topic_address(topic_at(log, 2)?),
                recipient_cid: topic_at(log, 3)?,
                deposits: uint_pair(data.next()?)?,
                withdrawals: uint_pair(data.next()?)?,
                seq_num: u64_of(data.next()?)?,
            }
        }
        LedgerEventKind::IntendSettle => {
            let mut data = abi::decode(&[fixed_pair(ParamType::Uint(256))], &log.data)
                .ok()?
                .into_iter();
            let [low, high] = uint_pair(data.next()?)?;
            LedgerEvent::IntendSettle {
                cid,
                seq_nums: [u64_of(Token::Uint(low))?, u64_of(Token::Uint(high))?],
            }
        }
        LedgerEventKind::ConfirmSettle => {
            let mut data = abi::decode(&[fixed_pair(ParamType::Uint(256))], &log.data)
                .ok()?
                .into_iter();
            LedgerEvent::ConfirmSettle {
                cid,
                settle_balance: uint_pair(data.next()?)?,
            }
        }
        LedgerEventKind::IntendWithdraw => {
            let mut data = abi::decode(&[ParamType::Uint(256)], &log.data)
                .ok()?
                .into_iter();
            LedgerEvent::IntendWithdraw {
                cid,
                receiver: topic_address(topic_at(log, 2)?),
                amount: data.next()?.into_uint()?,
            }
        }
        LedgerEventKind::ConfirmWithdraw => {
            let mut data = abi::decode(
                &[
                    ParamType::Uint(256),
                    fixed_pair(ParamType::Uint(256)),
                    fixed_pair(ParamType::Uint(256)),
                ],
                &log.data,
            )
            .ok()?
            .into_iter();
            LedgerEvent::ConfirmWithdraw {
                cid,
                withdrawn_amount: data.next()?.into_uint()?,
                receiver: topic_address(topic_at(log, 2)?),
                recipient_cid: topic_at(log, 3)?,
                deposits: uint_pair(data.next()?)?,
                withdrawals: uint_pair(data.next()?)?,
            }
        }
        LedgerEventKind::VetoWithdraw => LedgerEvent::VetoWithdraw { cid },
    };
    Some(event)
}

fn to_ledger_log(kind: LedgerEventKind, log: &Log) -> Option<LedgerLog> {
    Some(LedgerLog {
        tx_hash: log.transaction_hash?,
        block_number: log.block_number?.as_u64(),
        log_index: log.log_index?.low_u64(),
        event: decode_ledger_event(kind, log)?,
    })
}

/// Polls the ledger contract for logs, one task per subscription.
pub struct EthEventMonitor<P> {
    provider: Arc<Provider<P>>,
    store: Arc<ChannelStore>,
    poll_interval: Duration,
    block_delay: u64,
    max_retry_duration: Duration,
    next_id: AtomicU64,
    subscriptions: Mutex<HashMap<CallbackId, CancellationToken>>,
    cancel: CancellationToken,
}

impl<P> EthEventMonitor<P>
where
    P: JsonRpcClient + 'static,
{
    pub fn new(
        provider: Arc<Provider<P>>,
        store: Arc<ChannelStore>,
        poll_interval: Duration,
        block_delay: u64,
        max_retry_duration: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            provider,
            store,
            poll_interval,
            block_delay,
            max_retry_duration,
            next_id: AtomicU64::new(1),
            subscriptions: Mutex::new(HashMap::new()),
            cancel,
        }
    }

    async fn confirmed_head(&self) -> ChannelResult<u64> {
        let head = match retry_with_max_elapsed_time!(
            self.provider.get_block_number(),
            self.max_retry_duration
        ) {
            Ok(Ok(head)) => head.as_u64(),
            Ok(Err(e)) | Err(e) => return Err(ChannelError::from(e)),
        };
        Ok(head.saturating_sub(self.block_delay))
    }
}

#[async_trait]
impl<P> EventMonitor for EthEventMonitor<P>
where
    P: JsonRpcClient + 'static,
{
    async fn monitor(
        &self,
        config: MonitorConfig,
        callback: EventCallback,
    ) -> ChannelResult<CallbackId> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let cursor_key = config.cursor_key();
        let persisted = if config.reset {
            None
        } else {
            self.store.view(|s| s.monitor_cursor(&cursor_key)).await
        };
        let start_block = match persisted.or(config.start_block) {
            Some(block) => block,
            None => self.confirmed_head().await?,
        };

        let cancel = self.cancel.child_token();
        self.subscriptions.lock().await.insert(id, cancel.clone());
        info!(
            "[EventMonitor] Watching {} on {:?} from block {} to {:?}, id {}",
            config.event.name(),
            config.contract,
            start_block,
            config.end_block,
            id
        );

        let task = SubscriptionTask {
            id,
            config,
            cursor_key,
            next_block: start_block,
            provider: self.provider.clone(),
            store: self.store.clone(),
            poll_interval: self.poll_interval,
            block_delay: self.block_delay,
            max_retry_duration: self.max_retry_duration,
            callback,
            cancel,
        };
        tokio::spawn(task.run());
        Ok(id)
    }

    async fn remove_event(&self, id: CallbackId) {
        if let Some(cancel) = self.subscriptions.lock().await.remove(&id) {
            debug!("[EventMonitor] Removing subscription {}", id);
            cancel.cancel();
        }
    }
}

struct SubscriptionTask<P> {
    id: CallbackId,
    config: MonitorConfig,
    cursor_key: String,
    next_block: u64,
    provider: Arc<Provider<P>>,
    store: Arc<ChannelStore>,
    poll_interval: Duration,
    block_delay: u64,
    max_retry_duration: Duration,
    callback: EventCallback,
    cancel: CancellationToken,
}

impl<P> SubscriptionTask<P>
where
    P: JsonRpcClient + 'static,
{
    async fn run(mut self) {
        let event_name = self.config.event.name();
        let topic = event_topic(self.config.event);
        let mut catching_up = false;

        loop {
            if !(catching_up && self.config.quick_catch) {
                tokio::select! {
                    _ = self.cancel.cancelled() => {
                        info!("[EventMonitor] Subscription {} for {} cancelled", self.id, event_name);
                        break;
                    }
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }
            } else if self.cancel.is_cancelled() {
                break;
            }

            let head = match retry_with_max_elapsed_time!(
                self.provider.get_block_number(),
                self.max_retry_duration
            ) {
                Ok(Ok(head)) => head.as_u64().saturating_sub(self.block_delay),
                Ok(Err(e)) | Err(e) => {
                    error!("[EventMonitor] Failed to get block number: {:?}", e);
                    continue;
                }
            };
            if head < self.next_block {
                catching_up = false;
                continue;
            }

            let mut end_block = std::cmp::min(self.next_block + MAX_BLOCK_RANGE - 1, head);
            if let Some(last) = self.config.end_block {
                end_block = std::cmp::min(end_block, last);
            }
            catching_up = end_block < head;

            let filter = Filter::new()
                .address(self.config.contract)
                .topic0(topic)
                .from_block(self.next_block)
                .to_block(end_block);
            let logs = match retry_with_max_elapsed_time!(
                self.provider.get_logs(&filter),
                self.max_retry_duration
            ) {
                Ok(Ok(logs)) => logs,
                Ok(Err(e)) | Err(e) => {
                    error!(
                        "[EventMonitor] Failed to fetch {} logs in blocks {}-{}: {:?}",
                        event_name, self.next_block, end_block, e
                    );
                    continue;
                }
            };
            debug!(
                "[EventMonitor] Fetched {} {} logs in blocks {}-{}",
                logs.len(),
                event_name,
                self.next_block,
                end_block
            );

            for log in &logs {
                if self.cancel.is_cancelled() {
                    return;
                }
                match to_ledger_log(self.config.event, log) {
                    Some(ledger_log) => (self.callback)(self.id, ledger_log).await,
                    None => warn!(
                        "[EventMonitor] Skipping undecodable {} log {:?}",
                        event_name, log.transaction_hash
                    ),
                }
            }

            self.next_block = end_block + 1;
            let cursor_key = self.cursor_key.clone();
            let next_block = self.next_block;
            if let Err(e) = self
                .store
                .transactional(|tx| {
                    tx.put_monitor_cursor(&cursor_key, next_block);
                    Ok(())
                })
                .await
            {
                error!(
                    "[EventMonitor] Failed to persist cursor {} at {}: {:?}",
                    cursor_key, next_block, e
                );
            }

            if self.config.end_block.is_some_and(|last| end_block >= last) {
                info!(
                    "[EventMonitor] Subscription {} for {} reached end block {}",
                    self.id, event_name, end_block
                );
                break;
            }
        }
    }
}
