// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::encoding::ChannelMessageEncoding;
use crate::error::{ChannelError, ChannelResult};
use crate::ledger::{BalanceMap, LedgerClient, LedgerTx, PayInfo, TxReceipt, WithdrawIntent};
use crate::types::{ChannelId, SignedSimplexState};
use async_trait::async_trait;
use ethers::abi::{self, ParamType, Token};
use ethers::middleware::SignerMiddleware;
use ethers::providers::{JsonRpcClient, Middleware, Provider};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, TransactionRequest, TxHash, H256, U256};
use std::time::Duration;
use tap::TapFallible;
use tracing::{debug, error, info, warn};

pub struct EthLedgerClient<P> {
    client: SignerMiddleware<Provider<P>, LocalWallet>,
    ledger: Address,
    wallet: Address,
    pay_registry: Address,
    pay_resolver: Address,
    poll_interval: Duration,
}

impl<P> EthLedgerClient<P>
where
    P: JsonRpcClient + 'static,
{
    pub fn new(
        provider: Provider<P>,
        wallet: LocalWallet,
        chain_id: u64,
        ledger: Address,
        wallet_address: Address,
        pay_registry: Address,
        pay_resolver: Address,
        poll_interval: Duration,
    ) -> Self {
        let client = SignerMiddleware::new(provider, wallet.with_chain_id(chain_id));
        Self {
            client,
            ledger,
            wallet: wallet_address,
            pay_registry,
            pay_resolver,
            poll_interval,
        }
    }

    pub fn provider(&self) -> &Provider<P> {
        self.client.inner()
    }

    async fn call(
        &self,
        to: Address,
        data: Bytes,
        outputs: &[ParamType],
    ) -> ChannelResult<Vec<Token>> {
        let tx: TypedTransaction = TransactionRequest::new().to(to).data(data).into();
        let raw = self
            .client
            .inner()
            .call(&tx, None)
            .await
            .tap_err(|e| error!("eth_call to {:?} failed: {:?}", to, e))?;
        Ok(abi::decode(outputs, &raw)?)
    }

    fn encode_tx(&self, tx: &LedgerTx) -> (Address, Bytes, U256) {
        match tx {
            LedgerTx::Erc20Approve {
                token,
                spender,
                amount,
            } => (
                *token,
                call_data(
                    "approve(address,uint256)",
                    &[Token::Address(*spender), Token::Uint(*amount)],
                ),
                U256::zero(),
            ),
            LedgerTx::OpenChannel {
                initializer,
                sigs,
                value,
            } => {
                let request = abi::encode(&[Token::Tuple(vec![
                    Token::Bytes(initializer.as_bytes()),
                    sigs_token(sigs.iter()),
                ])]);
                (
                    self.ledger,
                    call_data("openChannel(bytes)", &[Token::Bytes(request)]),
                    *value,
                )
            }
            LedgerTx::Deposit {
                cid,
                receiver,
                amount,
                token,
            } => {
                let value = if token.is_eth() { *amount } else { U256::zero() };
                (
                    self.ledger,
                    call_data(
                        "deposit(bytes32,address,uint256)",
                        &[
                            bytes32(cid),
                            Token::Address(*receiver),
                            Token::Uint(*amount),
                        ],
                    ),
                    value,
                )
            }
            LedgerTx::CooperativeWithdraw { info, sigs } => {
                let request = abi::encode(&[Token::Tuple(vec![
                    Token::Bytes(info.as_bytes()),
                    sigs_token(sigs.iter()),
                ])]);
                (
                    self.ledger,
                    call_data("cooperativeWithdraw(bytes)", &[Token::Bytes(request)]),
                    U256::zero(),
                )
            }
            LedgerTx::IntendSettle { states } => {
                let request = abi::encode(&[Token::Array(
                    states.iter().map(signed_simplex_token).collect(),
                )]);
                (
                    self.ledger,
                    call_data("intendSettle(bytes)", &[Token::Bytes(request)]),
                    U256::zero(),
                )
            }
            LedgerTx::ConfirmSettle { cid } => (
                self.ledger,
                call_data("confirmSettle(bytes32)", &[bytes32(cid)]),
                U256::zero(),
            ),
            LedgerTx::IntendWithdraw {
                cid,
                amount,
                recipient_cid,
            } => (
                self.ledger,
                call_data(
                    "intendWithdraw(bytes32,uint256,bytes32)",
                    &[bytes32(cid), Token::Uint(*amount), bytes32(recipient_cid)],
                ),
                U256::zero(),
            ),
            LedgerTx::ConfirmWithdraw { cid } => (
                self.ledger,
                call_data("confirmWithdraw(bytes32)", &[bytes32(cid)]),
                U256::zero(),
            ),
            LedgerTx::VetoWithdraw { cid } => (
                self.ledger,
                call_data("vetoWithdraw(bytes32)", &[bytes32(cid)]),
                U256::zero(),
            ),
            LedgerTx::ResolvePaymentByConditions { pay, preimages } => {
                let request = abi::encode(&[Token::Tuple(vec![
                    Token::Bytes(pay.as_bytes()),
                    Token::Array(preimages.iter().map(|p| Token::Bytes(p.to_vec())).collect()),
                ])]);
                (
                    self.pay_resolver,
                    call_data("resolvePaymentByConditions(bytes)", &[Token::Bytes(request)]),
                    U256::zero(),
                )
            }
        }
    }
}

fn call_data(signature: &str, args: &[Token]) -> Bytes {
    let mut data = ethers::utils::id(signature).to_vec();
    data.extend(abi::encode(args));
    Bytes::from(data)
}

fn bytes32(h: &H256) -> Token {
    Token::FixedBytes(h.as_bytes().to_vec())
}

fn sigs_token<'a>(sigs: impl Iterator<Item = &'a Bytes>) -> Token {
    Token::Array(sigs.map(|s| Token::Bytes(s.to_vec())).collect())
}

fn signed_simplex_token(state: &SignedSimplexState) -> Token {
    let sigs = state
        .sig_of_peer_from
        .iter()
        .chain(state.sig_of_peer_to.iter());
    Token::Tuple(vec![
        Token::Bytes(state.simplex.as_bytes()),
        sigs_token(sigs),
    ])
}

fn token_at(tokens: &[Token], index: usize) -> ChannelResult<Token> {
    tokens
        .get(index)
        .cloned()
        .ok_or_else(|| ChannelError::Serialization(format!("missing return value {}", index)))
}

fn uint_at(tokens: &[Token], index: usize) -> ChannelResult<U256> {
    token_at(tokens, index)?
        .into_uint()
        .ok_or_else(|| ChannelError::Serialization(format!("return value {} is not uint", index)))
}

fn address_at(tokens: &[Token], index: usize) -> ChannelResult<Address> {
    token_at(tokens, index)?.into_address().ok_or_else(|| {
        ChannelError::Serialization(format!("return value {} is not an address", index))
    })
}

fn fixed_array_at(tokens: &[Token], index: usize) -> ChannelResult<Vec<Token>> {
    token_at(tokens, index)?.into_fixed_array().ok_or_else(|| {
        ChannelError::Serialization(format!("return value {} is not an array", index))
    })
}

fn to_u64(value: U256) -> ChannelResult<u64> {
    if value > U256::from(u64::MAX) {
        return Err(ChannelError::Serialization(format!(
            "{} does not fit in u64",
            value
        )));
    }
    Ok(value.low_u64())
}

fn pair<T: Clone>(items: Vec<T>) -> ChannelResult<[T; 2]> {
    <[T; 2]>::try_from(items)
        .map_err(|items| ChannelError::Serialization(format!("expected 2 items, got {}", items.len())))
}

#[async_trait]
impl<P> LedgerClient for EthLedgerClient<P>
where
    P: JsonRpcClient + 'static,
{
    fn ledger_address(&self) -> Address {
        self.ledger
    }

    fn wallet_address(&self) -> Address {
        self.wallet
    }

    fn account(&self) -> Address {
        self.client.address()
    }

    async fn block_number(&self) -> ChannelResult<u64> {
        let block = self.client.inner().get_block_number().await?;
        Ok(block.as_u64())
    }

    async fn submit(&self, tx: LedgerTx) -> ChannelResult<TxHash> {
        let kind = tx.kind();
        let (to, data, value) = self.encode_tx(&tx);
        let request = TransactionRequest::new().to(to).data(data).value(value);
        let pending = self
            .client
            .send_transaction(request, None)
            .await
            .map_err(|e| ChannelError::Provider(e.to_string()))
            .tap_err(|e| error!("Failed to submit {} tx to {:?}: {:?}", kind, to, e))?;
        let tx_hash = pending.tx_hash();
        info!("Submitted {} tx {:?} to {:?}", kind, tx_hash, to);
        Ok(tx_hash)
    }

    async fn wait_mined(&self, tx_hash: TxHash) -> ChannelResult<TxReceipt> {
        let mut interval = tokio::time::interval(self.poll_interval);
        loop {
            interval.tick().await;
            match self.client.inner().get_transaction_receipt(tx_hash).await {
                Ok(Some(receipt)) => {
                    let Some(block_number) = receipt.block_number else {
                        continue;
                    };
                    let success = receipt.status.map(|s| s.as_u64() == 1).unwrap_or(false);
                    debug!(
                        "Tx {:?} mined at block {}, success: {}",
                        tx_hash, block_number, success
                    );
                    return Ok(TxReceipt {
                        tx_hash,
                        block_number: block_number.as_u64(),
                        success,
                    });
                }
                Ok(None) => continue,
                Err(e) => {
                    warn!("Failed to fetch receipt of {:?}: {:?}", tx_hash, e);
                }
            }
        }
    }

    async fn erc20_allowance(
        &self,
        token: Address,
        owner: Address,
        spender: Address,
    ) -> ChannelResult<U256> {
        let tokens = self
            .call(
                token,
                call_data(
                    "allowance(address,address)",
                    &[Token::Address(owner), Token::Address(spender)],
                ),
                &[ParamType::Uint(256)],
            )
            .await?;
        uint_at(&tokens, 0)
    }

    async fn erc20_balance(&self, token: Address, owner: Address) -> ChannelResult<U256> {
        let tokens = self
            .call(
                token,
                call_data("balanceOf(address)", &[Token::Address(owner)]),
                &[ParamType::Uint(256)],
            )
            .await?;
        uint_at(&tokens, 0)
    }

    async fn native_balance(&self, owner: Address) -> ChannelResult<U256> {
        Ok(self.client.inner().get_balance(owner, None).await?)
    }

    async fn cooperative_withdraw_seq_num(&self, cid: ChannelId) -> ChannelResult<u64> {
        let tokens = self
            .call(
                self.ledger,
                call_data("getCooperativeWithdrawSeqNum(bytes32)", &[bytes32(&cid)]),
                &[ParamType::Uint(256)],
            )
            .await?;
        to_u64(uint_at(&tokens, 0)?)
    }

    async fn settle_finalized_time(&self, cid: ChannelId) -> ChannelResult<u64> {
        let tokens = self
            .call(
                self.ledger,
                call_data("getSettleFinalizedTime(bytes32)", &[bytes32(&cid)]),
                &[ParamType::Uint(256)],
            )
            .await?;
        to_u64(uint_at(&tokens, 0)?)
    }

    async fn withdraw_intent(&self, cid: ChannelId) -> ChannelResult<Option<WithdrawIntent>> {
        let tokens = self
            .call(
                self.ledger,
                call_data("getWithdrawIntent(bytes32)", &[bytes32(&cid)]),
                &[
                    ParamType::Address,
                    ParamType::Uint(256),
                    ParamType::Uint(256),
                    ParamType::FixedBytes(32),
                ],
            )
            .await?;
        let receiver = address_at(&tokens, 0)?;
        if receiver.is_zero() {
            return Ok(None);
        }
        let recipient_cid = token_at(&tokens, 3)?
            .into_fixed_bytes()
            .filter(|b| b.len() == 32)
            .map(|b| H256::from_slice(&b))
            .ok_or_else(|| ChannelError::Serialization("bad recipient channel id".into()))?;
        Ok(Some(WithdrawIntent {
            receiver,
            amount: uint_at(&tokens, 1)?,
            request_block: to_u64(uint_at(&tokens, 2)?)?,
            recipient_cid,
        }))
    }

    async fn dispute_timeout(&self, cid: ChannelId) -> ChannelResult<u64> {
        let tokens = self
            .call(
                self.ledger,
                call_data("getDisputeTimeout(bytes32)", &[bytes32(&cid)]),
                &[ParamType::Uint(256)],
            )
            .await?;
        to_u64(uint_at(&tokens, 0)?)
    }

    async fn balance_map(&self, cid: ChannelId) -> ChannelResult<BalanceMap> {
        let tokens = self
            .call(
                self.ledger,
                call_data("getBalanceMap(bytes32)", &[bytes32(&cid)]),
                &[
                    ParamType::FixedArray(Box::new(ParamType::Address), 2),
                    ParamType::FixedArray(Box::new(ParamType::Uint(256)), 2),
                    ParamType::FixedArray(Box::new(ParamType::Uint(256)), 2),
                ],
            )
            .await?;
        let peers = fixed_array_at(&tokens, 0)?
            .into_iter()
            .filter_map(Token::into_address)
            .collect();
        let deposits = fixed_array_at(&tokens, 1)?
            .into_iter()
            .filter_map(Token::into_uint)
            .collect();
        let withdrawals = fixed_array_at(&tokens, 2)?
            .into_iter()
            .filter_map(Token::into_uint)
            .collect();
        Ok(BalanceMap {
            peers: pair(peers)?,
            deposits: pair(deposits)?,
            withdrawals: pair(withdrawals)?,
        })
    }

    async fn pay_info(&self, pay_id: H256) -> ChannelResult<PayInfo> {
        let tokens = self
            .call(
                self.pay_registry,
                call_data("getPayInfo(bytes32)", &[bytes32(&pay_id)]),
                &[ParamType::Uint(256), ParamType::Uint(256)],
            )
            .await?;
        Ok(PayInfo {
            amount: uint_at(&tokens, 0)?,
            resolve_deadline: to_u64(uint_at(&tokens, 1)?)?,
        })
    }
}
