// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::error::{ChannelError, ChannelResult};
use crate::types::{ChannelRow, PendingWithdrawal};
use crate::WITHDRAW_TIMEOUT_SAFE_MARGIN;
use ethers::types::{Address, U256};
use serde::{Deserialize, Serialize};

/// Local view of a channel's balances.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelBalance {
    pub my_free: U256,
    pub peer_free: U256,
    pub my_deposit: U256,
    pub my_withdrawal: U256,
    pub peer_deposit: U256,
    pub peer_withdrawal: U256,
    pub my_locked: U256,
    pub peer_locked: U256,
}

/// A pending withdrawal keeps its amount reserved until a few blocks past its deadline.
pub fn pending_withdrawal_active(pending: &PendingWithdrawal, block: u64) -> bool {
    block <= pending.deadline.saturating_add(WITHDRAW_TIMEOUT_SAFE_MARGIN)
}

pub fn compute_balance(row: &ChannelRow, block: u64) -> ChannelBalance {
    let on_chain = &row.on_chain_balance;
    let to_peer = row.self_simplex.simplex.transfer_amount();
    let from_peer = row.peer_simplex.simplex.transfer_amount();
    let my_locked = row.self_simplex.simplex.total_pending_amount;
    let peer_locked = row.peer_simplex.simplex.total_pending_amount;

    let mut my_free = on_chain
        .my_deposit
        .saturating_add(from_peer)
        .saturating_sub(on_chain.my_withdrawal)
        .saturating_sub(to_peer)
        .saturating_sub(my_locked);
    let mut peer_free = on_chain
        .peer_deposit
        .saturating_add(to_peer)
        .saturating_sub(on_chain.peer_withdrawal)
        .saturating_sub(from_peer)
        .saturating_sub(peer_locked);

    if let Some(pending) = on_chain
        .pending_withdrawal
        .as_ref()
        .filter(|p| pending_withdrawal_active(p, block))
    {
        if pending.receiver == row.peer {
            peer_free = peer_free.saturating_sub(pending.amount);
        } else {
            my_free = my_free.saturating_sub(pending.amount);
        }
    }

    ChannelBalance {
        my_free,
        peer_free,
        my_deposit: on_chain.my_deposit,
        my_withdrawal: on_chain.my_withdrawal,
        peer_deposit: on_chain.peer_deposit,
        peer_withdrawal: on_chain.peer_withdrawal,
        my_locked,
        peer_locked,
    }
}

/// Free balance of `account` if no withdrawal is in flight.
pub fn free_balance_for_withdraw(
    row: &ChannelRow,
    account: Address,
    block: u64,
) -> ChannelResult<U256> {
    if row
        .on_chain_balance
        .pending_withdrawal
        .as_ref()
        .is_some_and(|p| pending_withdrawal_active(p, block))
    {
        return Err(ChannelError::PreviousWithdrawPending);
    }
    let balance = compute_balance(row, block);
    Ok(if account == row.peer {
        balance.peer_free
    } else {
        balance.my_free
    })
}

/// Reserves `amount` for `receiver` until `deadline`, failing if another withdrawal is
/// still in flight or the free balance does not cover it.
pub fn reserve_withdrawal(
    row: &mut ChannelRow,
    receiver: Address,
    amount: U256,
    deadline: u64,
    block: u64,
) -> ChannelResult<()> {
    let available = free_balance_for_withdraw(row, receiver, block)?;
    if available < amount {
        return Err(ChannelError::InsufficientBalance {
            required: amount,
            available,
        });
    }
    row.on_chain_balance.pending_withdrawal = Some(PendingWithdrawal {
        amount,
        receiver,
        deadline,
    });
    Ok(())
}
