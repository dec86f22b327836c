// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

#![allow(clippy::too_many_arguments, clippy::new_without_default)]

use std::time::Duration;

pub mod auth;
pub mod balance;
pub mod config;
pub mod crypto;
pub mod dispute;
pub mod encoding;
pub mod error;
pub mod fsm;
pub mod jobs;
pub mod ledger;
pub mod messenger;
pub mod metrics;
pub mod monitor;
pub mod node;
pub mod open_channel;
pub mod policy;
pub mod store;
pub mod types;

#[cfg(test)]
pub mod test_utils;

/// Blocks an open request stays valid for after the requester signs it.
pub const OPEN_CHANNEL_TIMEOUT: u64 = 100;
/// Blocks a cooperative withdraw stays valid for on-chain.
pub const COOPERATIVE_WITHDRAW_TIMEOUT: u64 = 10;
/// Extra blocks a pending withdrawal keeps its amount reserved after its deadline.
pub const WITHDRAW_TIMEOUT_SAFE_MARGIN: u64 = 6;
/// Default on-chain dispute window of a new channel, in blocks.
pub const CHANNEL_DISPUTE_TIMEOUT: u64 = 10000;
pub const OPEN_CHANNEL_RPC_DEADLINE: Duration = Duration::from_secs(5);
/// In-flight open requests older than this are considered abandoned.
pub const MAX_OPEN_CHANNEL_TIMEOUT: Duration = Duration::from_secs(10 * 60);
pub const TCB_TIMEOUT_IN_BLOCKS: u64 = 576000;
pub const AUTH_PROTOCOL_VERSION: u64 = 1;
/// How long a cooperative withdraw proposer waits for the peer's co-signature.
pub const COOPERATIVE_WITHDRAW_RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

#[macro_export]
macro_rules! retry_with_max_elapsed_time {
    ($func:expr, $max_elapsed_time:expr) => {{
        // The following delay sequence (in secs) will be used, applied with jitter
        // 0.4, 0.8, 1.6, 3.2, 6.4, 12.8, 25.6, 30, 60, 120, 120 ...
        let backoff = backoff::ExponentialBackoff {
            initial_interval: std::time::Duration::from_millis(400),
            randomization_factor: 0.1,
            multiplier: 2.0,
            max_interval: std::time::Duration::from_secs(120),
            max_elapsed_time: Some($max_elapsed_time),
            ..Default::default()
        };
        backoff::future::retry(backoff, || {
            let fut = async {
                let result = $func.await;
                match result {
                    Ok(_) => {
                        return Ok(result);
                    }
                    Err(e) => {
                        // Every error is treated as transient until max_elapsed_time runs out
                        tracing::debug!("Retrying due to error: {:?}", e);
                        return Err(backoff::Error::transient(e));
                    }
                }
            };
            std::boxed::Box::pin(fut)
        })
        .await
    }};
}
