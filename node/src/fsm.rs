// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Channel lifecycle transition table.
//!
//! ```text
//! NULL ──> TRUST_OPENED <──> INSTANTIATING
//!   │           │                 │
//!   └───────────┴──> OPENED <─────┘
//!                      │
//!                      ├──> SETTLING ──> CLOSED
//!                      └───────────────> CLOSED
//! ```

use crate::error::{ChannelError, ChannelResult};
use crate::types::{ChannelRow, ChannelState};

pub fn is_state_change_valid(from: ChannelState, to: ChannelState) -> bool {
    use ChannelState::*;
    if from == to {
        return true;
    }
    matches!(
        (from, to),
        (Null, TrustOpened)
            | (Null, Instantiating)
            | (Null, Opened)
            | (TrustOpened, Instantiating)
            | (TrustOpened, Opened)
            | (Instantiating, Opened)
            | (Instantiating, TrustOpened)
            | (Opened, Settling)
            | (Opened, Closed)
            | (Settling, Closed)
    )
}

fn transition(row: &mut ChannelRow, to: ChannelState) -> ChannelResult<()> {
    if !is_state_change_valid(row.state, to) {
        return Err(ChannelError::InvalidChannelState {
            from: row.state,
            to,
        });
    }
    row.state = to;
    Ok(())
}

/// Resolves the state to keep when a peer reports `remote` for a channel we hold in
/// `local`. The more advanced of the two wins; unrelated states are rejected.
pub fn merge_auth_state(local: ChannelState, remote: ChannelState) -> ChannelResult<ChannelState> {
    if is_state_change_valid(local, remote) {
        Ok(remote)
    } else if is_state_change_valid(remote, local) {
        Ok(local)
    } else {
        Err(ChannelError::InvalidChannelState {
            from: local,
            to: remote,
        })
    }
}

/// OpenChannel event confirmation. Only rows still waiting for the chain may move.
pub fn on_open_event(row: &mut ChannelRow) -> ChannelResult<()> {
    match row.state {
        ChannelState::Null | ChannelState::TrustOpened | ChannelState::Instantiating => {
            row.state = ChannelState::Opened;
            Ok(())
        }
        other => Err(ChannelError::OpenEventOnWrongState(other)),
    }
}

pub fn on_instantiate(row: &mut ChannelRow) -> ChannelResult<()> {
    if row.state != ChannelState::TrustOpened {
        return Err(ChannelError::InvalidChannelState {
            from: row.state,
            to: ChannelState::Instantiating,
        });
    }
    transition(row, ChannelState::Instantiating)
}

pub fn on_instantiate_failed(row: &mut ChannelRow) -> ChannelResult<()> {
    if row.state != ChannelState::Instantiating {
        return Err(ChannelError::InvalidChannelState {
            from: row.state,
            to: ChannelState::TrustOpened,
        });
    }
    transition(row, ChannelState::TrustOpened)
}

pub fn on_intend_settle(row: &mut ChannelRow) -> ChannelResult<()> {
    match row.state {
        ChannelState::Settling => Ok(()),
        ChannelState::Opened => transition(row, ChannelState::Settling),
        from => Err(ChannelError::InvalidChannelState {
            from,
            to: ChannelState::Settling,
        }),
    }
}

pub fn on_confirm_settle(row: &mut ChannelRow) -> ChannelResult<()> {
    transition(row, ChannelState::Closed)
}
