// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Reconciliation of channel state with a peer after (re)connecting.
//!
//! The initiator sends a signed, timestamped summary of its live channels with the
//! responder. The responder answers with every channel where its view is ahead, and the
//! initiator applies those records one channel at a time. A malformed record only skips
//! its own channel.
//!
//! Replay protection keeps the last timestamp seen per address in memory. Two devices
//! logged in with the same key share that address and may race on sequence numbers;
//! this is a known limitation and no tie-break between such devices is attempted.

use crate::crypto::{compute_channel_id, compute_pay_id, sig_is_valid, ChannelSigner};
use crate::encoding::{auth_timestamp_bytes, ChannelMessageEncoding};
use crate::error::{ChannelError, ChannelResult};
use crate::fsm::merge_auth_state;
use crate::ledger::BalanceMap;
use crate::node::ChannelContext;
use crate::open_channel::initial_balance;
use crate::store::{now_millis, StoreTx};
use crate::types::{
    AuthAck, AuthReq, ChannelId, ChannelInAuth, ChannelRow, ChannelState, ChannelSummary, ConditionalPay,
    OnChainBalance, PayPlacement, PayRecord, PayState, PeerRequest, PeerResponse, SeqNums,
    SignedSimplexState, TxEffect,
};
use crate::AUTH_PROTOCOL_VERSION;
use ethers::types::{Address, Bytes};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tap::TapFallible;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

pub struct AuthProtocol {
    ctx: ChannelContext,
    last_seen: Mutex<HashMap<Address, u64>>,
    last_sent: AtomicU64,
}

impl AuthProtocol {
    pub fn new(ctx: ChannelContext) -> Self {
        Self {
            ctx,
            last_seen: Mutex::new(HashMap::new()),
            last_sent: AtomicU64::new(0),
        }
    }

    fn next_timestamp(&self) -> u64 {
        let now = now_millis();
        let prev = self
            .last_sent
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(std::cmp::max(now, last + 1))
            })
            .unwrap_or_default();
        std::cmp::max(now, prev + 1)
    }

    pub async fn build_auth_req(&self, peer: Address) -> ChannelResult<AuthReq> {
        let timestamp = self.next_timestamp();
        let opened_channels = self
            .ctx
            .store
            .view(|s| {
                s.channels_with_peer(peer)
                    .map(|row| ChannelSummary {
                        cid: row.cid,
                        my_seq: row.self_simplex.seq_num(),
                        peer_seq: row.peer_simplex.seq_num(),
                    })
                    .collect::<Vec<_>>()
            })
            .await;
        Ok(AuthReq {
            my_addr: self.ctx.me(),
            timestamp,
            my_sig: self.ctx.signer.sign(&auth_timestamp_bytes(timestamp))?,
            expect_peer: peer,
            protocol_version: AUTH_PROTOCOL_VERSION,
            opened_channels,
        })
    }

    /// Responder side. Returns the channels the requester is missing or behind on.
    pub async fn handle_auth_req(&self, from: Address, req: AuthReq) -> ChannelResult<AuthAck> {
        let result = self.verify_auth_req(from, &req).await;
        let label = if result.is_ok() { "accepted" } else { "rejected" };
        self.ctx
            .metrics
            .auth_requests
            .with_label_values(&[label])
            .inc();
        result?;

        let summaries: HashMap<_, _> = req
            .opened_channels
            .iter()
            .map(|summary| (summary.cid, *summary))
            .collect();
        let ack = self
            .ctx
            .store
            .view(|s| {
                let sync_channels = s
                    .channels_with_peer(from)
                    .filter_map(|row| {
                        let summary = summaries.get(&row.cid);
                        // Requester's outgoing direction is our peer simplex.
                        let send_authreq =
                            summary.map_or(true, |sm| row.peer_simplex.seq_num() > sm.my_seq);
                        let send_authack =
                            summary.map_or(true, |sm| row.self_simplex.seq_num() > sm.peer_seq);
                        if !send_authreq && !send_authack {
                            return None;
                        }
                        let pays_of = |simplex: &SignedSimplexState| {
                            s.pays_of(&simplex.simplex.pending_pay_ids.pay_ids)
                        };
                        Some(ChannelInAuth {
                            cid: row.cid,
                            state: row.state,
                            ledger: row.ledger,
                            open_channel_response: row.open_response.clone(),
                            authreq_pays: if send_authreq {
                                pays_of(&row.peer_simplex)
                            } else {
                                vec![]
                            },
                            authack_pays: if send_authack {
                                pays_of(&row.self_simplex)
                            } else {
                                vec![]
                            },
                            authreq_simplex: send_authreq.then(|| row.peer_simplex.clone()),
                            authack_simplex: send_authack.then(|| row.self_simplex.clone()),
                        })
                    })
                    .collect();
                AuthAck { sync_channels }
            })
            .await;
        info!(
            "[Auth] Authenticated {:?}, syncing {} of {} reported channels",
            from,
            ack.sync_channels.len(),
            req.opened_channels.len()
        );
        Ok(ack)
    }

    async fn verify_auth_req(&self, from: Address, req: &AuthReq) -> ChannelResult<()> {
        if req.expect_peer != self.ctx.me() {
            return Err(ChannelError::InvalidPeerFrom(format!(
                "auth expects {:?}",
                req.expect_peer
            )));
        }
        if req.my_addr != from {
            return Err(ChannelError::InvalidPeerFrom(format!(
                "auth from {:?} claims {:?}",
                from, req.my_addr
            )));
        }
        if req.protocol_version != AUTH_PROTOCOL_VERSION {
            return Err(ChannelError::InvalidArgument(format!(
                "unsupported auth protocol version {}",
                req.protocol_version
            )));
        }
        if !sig_is_valid(from, &auth_timestamp_bytes(req.timestamp), &req.my_sig) {
            return Err(ChannelError::InvalidSignature);
        }
        let mut last_seen = self.last_seen.lock().await;
        let last = last_seen.get(&from).copied().unwrap_or_default();
        if req.timestamp <= last {
            return Err(ChannelError::StaleAuthTimestamp {
                last,
                got: req.timestamp,
            });
        }
        last_seen.insert(from, req.timestamp);
        Ok(())
    }

    /// Initiator side: reconciles every channel with `peer`, returning how many were applied.
    pub async fn authenticate(&self, peer: Address) -> ChannelResult<usize> {
        let req = self.build_auth_req(peer).await?;
        let response = self
            .ctx
            .messenger
            .request(peer, PeerRequest::Auth(req))
            .await
            .tap_err(|e| warn!("[Auth] Auth with {:?} failed: {}", peer, e))?;
        let PeerResponse::AuthAck(ack) = response else {
            return Err(ChannelError::InvalidArgument(
                "unexpected response to auth request".to_string(),
            ));
        };
        Ok(self.handle_auth_ack(peer, ack).await)
    }

    pub async fn handle_auth_ack(&self, peer: Address, ack: AuthAck) -> usize {
        let mut applied = 0;
        for channel in ack.sync_channels {
            let cid = channel.cid;
            match self.sync_channel(peer, channel).await {
                Ok(()) => applied += 1,
                Err(e) => {
                    self.ctx.metrics.record_error(&e);
                    error!("[Auth] Skipping channel {:?} from {:?}: {}", cid, peer, e);
                }
            }
        }
        self.ctx
            .metrics
            .auth_synced_channels
            .inc_by(applied as u64);
        applied
    }

    async fn sync_channel(&self, peer: Address, channel: ChannelInAuth) -> ChannelResult<()> {
        let cid = channel.cid;
        let known = self.ctx.store.view(|s| s.has_channel(&cid)).await;
        let balance = if !known
            && matches!(channel.state, ChannelState::Opened | ChannelState::Settling)
        {
            Some(self.ctx.ledger.balance_map(cid).await?)
        } else {
            None
        };
        let me = self.ctx.me();
        let signer = self.ctx.signer.clone();
        let wallet = self.ctx.ledger.wallet_address();
        let resolver = self.ctx.protocol.pay_resolver_address;

        self.ctx
            .commit(|tx| {
                // From here on both simplexes are in our orientation.
                let self_simplex = channel
                    .authreq_simplex
                    .clone()
                    .map(|s| countersign(s, me, peer, true, signer.as_ref()))
                    .transpose()?;
                let peer_simplex = channel
                    .authack_simplex
                    .clone()
                    .map(|s| countersign(s, peer, me, false, signer.as_ref()))
                    .transpose()?;
                for simplex in [&self_simplex, &peer_simplex].into_iter().flatten() {
                    if simplex.simplex.channel_id != cid {
                        return Err(ChannelError::InvalidChannelId(format!(
                            "simplex of {:?} in record of {:?}",
                            simplex.simplex.channel_id, cid
                        )));
                    }
                }
                if let Some(response) = &channel.open_channel_response {
                    let derived =
                        compute_channel_id(wallet, channel.ledger, &response.channel_initializer);
                    if derived != cid {
                        return Err(ChannelError::InvalidChannelId(format!(
                            "open response derives {:?}, record is {:?}",
                            derived, cid
                        )));
                    }
                }

                if tx.has_channel(&cid) {
                    merge_channel(tx, peer, &channel, self_simplex, peer_simplex)?;
                } else {
                    insert_synced_channel(tx, me, peer, &channel, self_simplex, peer_simplex, balance)?;
                }
                if tx.has_channel(&cid) {
                    store_pays(tx, cid, &channel.authreq_pays, resolver, true)?;
                    store_pays(tx, cid, &channel.authack_pays, resolver, false)?;
                }
                Ok(())
            })
            .await?;
        debug!("[Auth] Applied channel {:?} from {:?}", cid, peer);
        Ok(())
    }
}

/// Verifies a synced simplex and adds this node's signature to it.
///
/// A non-zero sequence must carry valid signatures of both parties. A sequence-0
/// simplex is only accepted empty; this node signs its own slot and keeps the peer's
/// signature when it is valid.
fn countersign(
    mut state: SignedSimplexState,
    from: Address,
    to: Address,
    self_is_from: bool,
    signer: &dyn ChannelSigner,
) -> ChannelResult<SignedSimplexState> {
    if state.simplex.peer_from != from || state.simplex.peer_to() != to {
        return Err(ChannelError::InvalidPeerFrom(format!(
            "simplex {:?} -> {:?}, expected {:?} -> {:?}",
            state.simplex.peer_from,
            state.simplex.peer_to(),
            from,
            to
        )));
    }
    let bytes = state.simplex.as_bytes();
    let valid = |signer: Address, sig: &Option<Bytes>| {
        sig.as_ref().is_some_and(|sig| sig_is_valid(signer, &bytes, sig))
    };
    if state.seq_num() > 0 {
        if !valid(from, &state.sig_of_peer_from) || !valid(to, &state.sig_of_peer_to) {
            return Err(ChannelError::InvalidSignature);
        }
        return Ok(state);
    }
    if !state.simplex.is_empty() {
        return Err(ChannelError::InvalidPendingPays(format!(
            "sequence 0 simplex of {:?} is not empty",
            state.simplex.channel_id
        )));
    }
    let my_sig = Some(signer.sign(&bytes)?);
    if self_is_from {
        if !valid(to, &state.sig_of_peer_to) {
            state.sig_of_peer_to = None;
        }
        state.sig_of_peer_from = my_sig;
    } else {
        if !valid(from, &state.sig_of_peer_from) {
            state.sig_of_peer_from = None;
        }
        state.sig_of_peer_to = my_sig;
    }
    Ok(state)
}

/// Fills missing signatures of an equal sequence-0 state.
fn merge_sigs(local: &mut SignedSimplexState, synced: SignedSimplexState) {
    if local.sig_of_peer_from.is_none() {
        local.sig_of_peer_from = synced.sig_of_peer_from;
    }
    if local.sig_of_peer_to.is_none() {
        local.sig_of_peer_to = synced.sig_of_peer_to;
    }
}

fn merge_channel(
    tx: &mut StoreTx<'_>,
    peer: Address,
    channel: &ChannelInAuth,
    self_simplex: Option<SignedSimplexState>,
    peer_simplex: Option<SignedSimplexState>,
) -> ChannelResult<()> {
    let cid = channel.cid;
    let row = tx.channel_mut(&cid)?;
    if row.peer != peer {
        return Err(ChannelError::InvalidPeerFrom(format!(
            "channel {:?} belongs to {:?}",
            cid, row.peer
        )));
    }
    let before = row.state;
    let state = merge_auth_state(before, channel.state)?;

    if let Some(synced) = self_simplex {
        let seq = synced.seq_num();
        if seq > row.self_simplex.seq_num() {
            row.self_simplex = synced;
            row.seq_nums.last_used = std::cmp::max(row.seq_nums.last_used, seq);
            row.seq_nums.last_acked = std::cmp::max(row.seq_nums.last_acked, seq);
        } else if seq == row.self_simplex.seq_num() && synced.simplex == row.self_simplex.simplex {
            merge_sigs(&mut row.self_simplex, synced);
        } else {
            debug!(
                "[Auth] Keeping local self simplex {} of {:?} over synced {}",
                row.self_simplex.seq_num(),
                cid,
                seq
            );
        }
    }
    if let Some(synced) = peer_simplex {
        let seq = synced.seq_num();
        if seq > row.peer_simplex.seq_num() {
            row.peer_simplex = synced;
        } else if seq == row.peer_simplex.seq_num() && synced.simplex == row.peer_simplex.simplex {
            merge_sigs(&mut row.peer_simplex, synced);
        } else {
            return Err(ChannelError::InvalidSeqNum(format!(
                "synced peer simplex {} of {:?} behind local {}",
                seq,
                cid,
                row.peer_simplex.seq_num()
            )));
        }
    }
    if row.open_response.is_none() {
        row.open_response = channel.open_channel_response.clone();
    }
    row.state = state;
    let (token, me) = (row.token, row.self_simplex.simplex.peer_from);

    match state {
        ChannelState::Closed => {
            tx.close_channel(&cid)?;
            tx.emit(TxEffect::RouteEdgeRemoved { cid });
            tx.emit(TxEffect::ChannelClosed { cid });
        }
        ChannelState::Opened if before != ChannelState::Opened => {
            tx.remove_tcb_commitment(&cid);
            tx.emit(TxEffect::RouteEdgeAdded {
                cid,
                peers: sorted_pair(me, peer),
                token,
            });
        }
        _ => {}
    }
    if state != before {
        info!(
            "[Auth] Channel {:?} with {:?} moved from {} to {}",
            cid, peer, before, state
        );
    }
    Ok(())
}

fn insert_synced_channel(
    tx: &mut StoreTx<'_>,
    me: Address,
    peer: Address,
    channel: &ChannelInAuth,
    self_simplex: Option<SignedSimplexState>,
    peer_simplex: Option<SignedSimplexState>,
    balance: Option<BalanceMap>,
) -> ChannelResult<()> {
    let cid = channel.cid;
    let (Some(self_simplex), Some(peer_simplex)) = (self_simplex, peer_simplex) else {
        return Err(ChannelError::InvalidArgument(format!(
            "unknown channel {:?} synced with one direction only",
            cid
        )));
    };
    let on_chain_balance = match channel.state {
        ChannelState::Opened | ChannelState::Settling => {
            let balance = balance.ok_or_else(|| {
                ChannelError::Internal(format!("no on-chain balance for {:?}", cid))
            })?;
            OnChainBalance::from_sorted(me, peer, balance.deposits, balance.withdrawals)
        }
        ChannelState::TrustOpened | ChannelState::Instantiating => {
            let response = channel.open_channel_response.as_ref().ok_or_else(|| {
                ChannelError::InvalidArgument(format!(
                    "trust-opened channel {:?} without open response",
                    cid
                ))
            })?;
            initial_balance(&response.channel_initializer, me, peer)
        }
        ChannelState::Null | ChannelState::Closed => {
            debug!("[Auth] Not restoring channel {:?} in state {}", cid, channel.state);
            return Ok(());
        }
    };
    let token = self_simplex.simplex.transfer_to_peer.token;
    let seq = self_simplex.seq_num();
    let row = ChannelRow {
        cid,
        peer,
        token,
        ledger: channel.ledger,
        state: channel.state,
        open_response: channel.open_channel_response.clone(),
        on_chain_balance,
        self_simplex,
        peer_simplex,
        seq_nums: SeqNums::starting_at(seq),
    };
    tx.insert_channel(row)?;
    if channel.state == ChannelState::Opened {
        tx.emit(TxEffect::RouteEdgeAdded {
            cid,
            peers: sorted_pair(me, peer),
            token,
        });
    }
    info!(
        "[Auth] Restored channel {:?} with {:?} in state {} at seq {}",
        cid, peer, channel.state, seq
    );
    Ok(())
}

fn sorted_pair(a: Address, b: Address) -> [Address; 2] {
    if a < b {
        [a, b]
    } else {
        [b, a]
    }
}

/// Records pays riding on a synced simplex. `egress` marks pays this node sends.
fn store_pays(
    tx: &mut StoreTx<'_>,
    cid: ChannelId,
    pays: &[ConditionalPay],
    resolver: Address,
    egress: bool,
) -> ChannelResult<()> {
    if pays.is_empty() {
        return Ok(());
    }
    let row = tx.channel(&cid)?;
    let simplex = if egress {
        &row.self_simplex
    } else {
        &row.peer_simplex
    };
    let pending = simplex.simplex.pending_pay_ids.pay_ids.clone();
    for pay in pays {
        let pay_id = compute_pay_id(pay, resolver);
        if !pending.contains(&pay_id) {
            return Err(ChannelError::InvalidPendingPays(format!(
                "pay {:?} not pending on {:?}",
                pay_id, cid
            )));
        }
        let placement = Some(PayPlacement {
            cid,
            state: PayState::CoSignedPending,
        });
        let mut record = tx.pay(&pay_id).cloned().unwrap_or(PayRecord {
            pay: pay.clone(),
            ingress: None,
            egress: None,
        });
        if egress && record.egress.is_none() {
            record.egress = placement;
        } else if !egress && record.ingress.is_none() {
            record.ingress = placement;
        }
        tx.put_pay(pay_id, record);
    }
    Ok(())
}
