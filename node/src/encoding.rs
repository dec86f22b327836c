// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Canonical byte encoding of everything both parties sign.
//!
//! All messages are ABI encoded as a single tuple so that signatures stay stable
//! across serde representations.

use crate::types::{
    AccountAmtPair, ChannelInitializer, Condition, ConditionalPay, CooperativeWithdrawInfo,
    PayIdList, SimplexPaymentChannel, TokenDistribution, TokenInfo, TokenTransfer, TokenType,
};
use ethers::abi::Token;
use ethers::types::{H256, U256};

pub trait ChannelMessageEncoding {
    fn as_token(&self) -> Token;

    fn as_bytes(&self) -> Vec<u8> {
        ethers::abi::encode(&[self.as_token()])
    }
}

fn h256_token(h: &H256) -> Token {
    Token::FixedBytes(h.as_bytes().to_vec())
}

fn u64_token(v: u64) -> Token {
    Token::Uint(U256::from(v))
}

impl ChannelMessageEncoding for TokenInfo {
    fn as_token(&self) -> Token {
        let token_type = match self.token_type {
            TokenType::Eth => 1u64,
            TokenType::Erc20 => 2u64,
        };
        Token::Tuple(vec![u64_token(token_type), Token::Address(self.address)])
    }
}

impl ChannelMessageEncoding for AccountAmtPair {
    fn as_token(&self) -> Token {
        Token::Tuple(vec![
            Token::Address(self.account),
            Token::Uint(self.amount),
        ])
    }
}

impl ChannelMessageEncoding for TokenDistribution {
    fn as_token(&self) -> Token {
        Token::Tuple(vec![
            self.token.as_token(),
            Token::FixedArray(self.distribution.iter().map(|p| p.as_token()).collect()),
        ])
    }
}

impl ChannelMessageEncoding for ChannelInitializer {
    fn as_token(&self) -> Token {
        Token::Tuple(vec![
            self.init_distribution.as_token(),
            u64_token(self.open_deadline),
            u64_token(self.dispute_timeout),
            u64_token(self.msg_value_receiver as u64),
        ])
    }
}

impl ChannelMessageEncoding for TokenTransfer {
    fn as_token(&self) -> Token {
        Token::Tuple(vec![self.token.as_token(), self.receiver.as_token()])
    }
}

impl ChannelMessageEncoding for PayIdList {
    fn as_token(&self) -> Token {
        Token::Tuple(vec![
            Token::Array(self.pay_ids.iter().map(h256_token).collect()),
            h256_token(&self.next_list_hash.unwrap_or_default()),
        ])
    }
}

impl ChannelMessageEncoding for SimplexPaymentChannel {
    fn as_token(&self) -> Token {
        Token::Tuple(vec![
            h256_token(&self.channel_id),
            Token::Address(self.peer_from),
            u64_token(self.seq_num),
            self.transfer_to_peer.as_token(),
            self.pending_pay_ids.as_token(),
            u64_token(self.last_pay_resolve_deadline),
            Token::Uint(self.total_pending_amount),
        ])
    }
}

impl ChannelMessageEncoding for Condition {
    fn as_token(&self) -> Token {
        match self {
            Condition::HashLock(hash) => Token::Tuple(vec![
                u64_token(0),
                h256_token(hash),
                Token::Address(Default::default()),
                h256_token(&H256::zero()),
                Token::Bytes(vec![]),
                Token::Bytes(vec![]),
            ]),
            Condition::DeployedContract {
                contract,
                args_query_finalization,
                args_query_outcome,
            } => Token::Tuple(vec![
                u64_token(1),
                h256_token(&H256::zero()),
                Token::Address(*contract),
                h256_token(&H256::zero()),
                Token::Bytes(args_query_finalization.to_vec()),
                Token::Bytes(args_query_outcome.to_vec()),
            ]),
            Condition::VirtualContract {
                virtual_address,
                args_query_finalization,
                args_query_outcome,
            } => Token::Tuple(vec![
                u64_token(2),
                h256_token(&H256::zero()),
                Token::Address(Default::default()),
                h256_token(virtual_address),
                Token::Bytes(args_query_finalization.to_vec()),
                Token::Bytes(args_query_outcome.to_vec()),
            ]),
        }
    }
}

impl ChannelMessageEncoding for ConditionalPay {
    fn as_token(&self) -> Token {
        Token::Tuple(vec![
            u64_token(self.pay_timestamp),
            Token::Address(self.src),
            Token::Address(self.dest),
            Token::Array(self.conditions.iter().map(|c| c.as_token()).collect()),
            // BooleanAndMax is the only transfer logic
            Token::Tuple(vec![u64_token(0), self.transfer_func.max_transfer.as_token()]),
            u64_token(self.resolve_deadline),
            u64_token(self.resolve_timeout),
            Token::Address(self.pay_resolver),
        ])
    }
}

impl ChannelMessageEncoding for CooperativeWithdrawInfo {
    fn as_token(&self) -> Token {
        Token::Tuple(vec![
            h256_token(&self.channel_id),
            u64_token(self.seq_num),
            self.withdraw.as_token(),
            u64_token(self.withdraw_deadline),
            h256_token(&self.recipient_channel_id),
        ])
    }
}

/// Bytes signed in an auth request.
pub fn auth_timestamp_bytes(timestamp: u64) -> Vec<u8> {
    timestamp.to_be_bytes().to_vec()
}
