// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Gatekeeping of incoming open requests.
//!
//! A standard request is checked against the per-token deposit policy, except when the
//! requester deposits nothing: that cold bootstrap request is only bounded by the
//! cold-bootstrap cap. A request with a non-zero requester deposit is additionally
//! bounded by the OSP deposit multiplier. Trust-before-collateral requests draw from a
//! per-token pool of virtual deposits.

use crate::config::{PolicyConfig, StandardDepositPolicy};
use crate::error::{ChannelError, ChannelResult};
use crate::types::{ChannelInitializer, TokenInfo};
use ethers::types::{Address, U256};
use tracing::debug;

const RATIO_SCALE: u64 = 1_000_000;

pub struct PolicyEngine {
    config: PolicyConfig,
}

fn reject(reason: String) -> ChannelError {
    debug!("[Policy] Rejected: {}", reason);
    ChannelError::PolicyRejected(reason)
}

impl PolicyEngine {
    pub fn new(config: PolicyConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    /// Checks a standard open request where `me` is the approver.
    pub fn check_open_request(
        &self,
        block: u64,
        me: Address,
        initializer: &ChannelInitializer,
        osp_to_osp: bool,
    ) -> ChannelResult<()> {
        let peer = initializer
            .counterparty(me)
            .ok_or_else(|| reject("not a participant".to_string()))?;
        let my_amt = initializer.amount_of(me).unwrap_or_default();
        let peer_amt = initializer.amount_of(peer).unwrap_or_default();
        let token = initializer.token();

        if peer_amt.is_zero() {
            return self.check_cold_bootstrap(token, my_amt);
        }
        self.check_standard(block, peer, initializer, my_amt, peer_amt, osp_to_osp)?;
        self.check_deposit_multiplier(my_amt, peer_amt)
    }

    fn standard_policy_for(
        &self,
        peer: Address,
        token: TokenInfo,
        osp_to_osp: bool,
    ) -> Option<Option<&StandardDepositPolicy>> {
        let standard = self.config.standard.as_ref()?;
        if osp_to_osp {
            if let Some(policy) = standard
                .osp_to_osp
                .get(&peer)
                .and_then(|tokens| tokens.get(&token.address))
            {
                return Some(Some(policy));
            }
        }
        Some(standard.tokens.get(&token.address))
    }

    fn check_standard(
        &self,
        block: u64,
        peer: Address,
        initializer: &ChannelInitializer,
        my_amt: U256,
        peer_amt: U256,
        osp_to_osp: bool,
    ) -> ChannelResult<()> {
        let token = initializer.token();
        let policy = match self.standard_policy_for(peer, token, osp_to_osp) {
            // No standard policy configured at all
            None => return Ok(()),
            Some(None) => return Err(reject(format!("token {:?} not supported", token.address))),
            Some(Some(policy)) => policy,
        };

        let earliest = block.saturating_add(policy.min_deadline_delta);
        let latest = block.saturating_add(policy.max_deadline_delta);
        if initializer.open_deadline < earliest || initializer.open_deadline > latest {
            return Err(reject(format!(
                "open deadline {} outside [{}, {}]",
                initializer.open_deadline, earliest, latest
            )));
        }

        match policy.matching_ratio {
            Some(ratio) => {
                let ratio_ppm = U256::from((ratio * RATIO_SCALE as f64).round().max(0.0) as u64);
                let scaled_mine = my_amt.saturating_mul(U256::from(RATIO_SCALE));
                if scaled_mine > peer_amt.saturating_mul(ratio_ppm) {
                    return Err(reject(format!(
                        "deposit {} exceeds {} x {}",
                        my_amt, ratio, peer_amt
                    )));
                }
            }
            None => {
                if my_amt != peer_amt {
                    return Err(reject(format!(
                        "deposits must match, mine {} peer {}",
                        my_amt, peer_amt
                    )));
                }
            }
        }

        if my_amt < U256::from(policy.min_deposit) {
            return Err(reject(format!(
                "deposit {} below minimum {}",
                my_amt, policy.min_deposit
            )));
        }
        if peer_amt > U256::from(policy.max_deposit) {
            return Err(reject(format!(
                "peer deposit {} above maximum {}",
                peer_amt, policy.max_deposit
            )));
        }
        Ok(())
    }

    fn check_cold_bootstrap(&self, token: TokenInfo, my_amt: U256) -> ChannelResult<()> {
        let cap = self
            .config
            .cold_bootstrap
            .max_self_deposit_for(token.address);
        if my_amt > cap {
            return Err(reject(format!(
                "cold bootstrap deposit {} above cap {}",
                my_amt, cap
            )));
        }
        Ok(())
    }

    fn check_deposit_multiplier(&self, my_amt: U256, peer_amt: U256) -> ChannelResult<()> {
        let multiplier = self.config.cold_bootstrap.osp_deposit_multiplier;
        let limit = peer_amt.saturating_mul(U256::from(multiplier));
        if my_amt > limit {
            return Err(reject(format!(
                "deposit {} exceeds {} x peer deposit {}",
                my_amt, multiplier, peer_amt
            )));
        }
        Ok(())
    }

    /// Virtual deposit still available in `token`.
    ///
    /// `on_chain_available` is the smaller of what the node holds and what the ledger
    /// may pull, `committed` what earlier trust-opened channels already promised.
    pub fn tcb_available(
        &self,
        token: TokenInfo,
        on_chain_available: U256,
        committed: U256,
    ) -> ChannelResult<U256> {
        let policy = self
            .config
            .tcb
            .tokens
            .get(&token.address)
            .ok_or_else(|| reject(format!("token {:?} not enabled for tcb", token.address)))?;
        let cap = std::cmp::min(on_chain_available, U256::from(policy.capacity));
        Ok(cap
            .saturating_sub(U256::from(policy.safety_margin))
            .saturating_sub(committed))
    }

    pub fn check_tcb_open(
        &self,
        token: TokenInfo,
        amount: U256,
        on_chain_available: U256,
        committed: U256,
    ) -> ChannelResult<()> {
        let available = self.tcb_available(token, on_chain_available, committed)?;
        if amount > available {
            return Err(reject(format!(
                "tcb deposit {} above available {}",
                amount, available
            )));
        }
        let per_client = self
            .config
            .tcb
            .tokens
            .get(&token.address)
            .map(|p| U256::from(p.max_per_client))
            .unwrap_or_default();
        if amount > per_client {
            return Err(reject(format!(
                "tcb deposit {} above per client max {}",
                amount, per_client
            )));
        }
        Ok(())
    }
}
