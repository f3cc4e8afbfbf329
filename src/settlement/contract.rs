//! Chain-side call shapes.
//!
//! The core only produces ABI-encoded calldata for the counterparty
//! contract; signing and submission belong to the embedder. Every builder
//! returns the encoded bytes plus the idempotency key derived from the
//! inputs.

use alloy_primitives::{Address, FixedBytes, U256};
use alloy_sol_types::{sol, SolCall};
use std::str::FromStr;

use crate::error::CoreError;
use crate::precision::Amount;
use crate::storage::cold::keccak_hex;

sol! {
    function depositToDEX(address token, uint256 amount);
    function withdrawFromDEX(address token, uint256 amount);
    function settleDEXTrade(address buyer, address seller, address token, uint256 amount, bytes32 orderRef);
    function batchSettleDEX(address[] buyers, address[] sellers, address[] tokens, uint256[] amounts, bytes32 batchRef);
    function distributeDEXFees(address token, uint256 totalFee, address validatorAddress);
}

/// Parse a 0x-prefixed account or token address.
pub fn parse_address(s: &str) -> Result<Address, CoreError> {
    Address::from_str(s)
        .map_err(|_| CoreError::Validation(format!("invalid on-chain address: {s}")))
}

/// 32-byte reference derived from an identifier (trade id, batch id).
pub fn reference(id: &str) -> FixedBytes<32> {
    let hash = keccak_hex(id.as_bytes());
    let mut out = [0u8; 32];
    // keccak_hex always yields 64 hex chars.
    if let Ok(bytes) = hex::decode(hash) {
        out.copy_from_slice(&bytes);
    }
    FixedBytes(out)
}

pub fn encode_deposit(token: Address, amount: Amount) -> Vec<u8> {
    depositToDEXCall {
        token,
        amount: amount.0,
    }
    .abi_encode()
}

pub fn encode_withdraw(token: Address, amount: Amount) -> Vec<u8> {
    withdrawFromDEXCall {
        token,
        amount: amount.0,
    }
    .abi_encode()
}

pub fn encode_settle_trade(
    buyer: Address,
    seller: Address,
    token: Address,
    amount: Amount,
    order_ref: FixedBytes<32>,
) -> Vec<u8> {
    settleDEXTradeCall {
        buyer,
        seller,
        token,
        amount: amount.0,
        orderRef: order_ref,
    }
    .abi_encode()
}

pub fn encode_batch_settle(
    buyers: Vec<Address>,
    sellers: Vec<Address>,
    tokens: Vec<Address>,
    amounts: Vec<Amount>,
    batch_ref: FixedBytes<32>,
) -> Vec<u8> {
    batchSettleDEXCall {
        buyers,
        sellers,
        tokens,
        amounts: amounts.into_iter().map(|a| a.0).collect::<Vec<U256>>(),
        batchRef: batch_ref,
    }
    .abi_encode()
}

pub fn encode_fee_distribution(token: Address, total_fee: Amount, validator: Address) -> Vec<u8> {
    distributeDEXFeesCall {
        token,
        totalFee: total_fee.0,
        validatorAddress: validator,
    }
    .abi_encode()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_parsing() {
        assert!(parse_address("0x000000000000000000000000000000000000dEaD").is_ok());
        assert!(parse_address("not-an-address").is_err());
    }

    #[test]
    fn references_are_deterministic() {
        let a = reference("trade-1");
        let b = reference("trade-1");
        let c = reference("trade-2");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn calldata_carries_the_selector() {
        let token = Address::ZERO;
        let calldata = encode_deposit(token, Amount::from_u64(1));
        assert_eq!(&calldata[..4], depositToDEXCall::SELECTOR.as_slice());

        let decoded = depositToDEXCall::abi_decode(&calldata, true).unwrap();
        assert_eq!(decoded.amount, U256::from(1u64));
    }

    #[test]
    fn batch_encoding_round_trips() {
        let addr = Address::ZERO;
        let calldata = encode_batch_settle(
            vec![addr, addr],
            vec![addr, addr],
            vec![addr, addr],
            vec![Amount::from_u64(10), Amount::from_u64(20)],
            reference("batch-1"),
        );
        let decoded = batchSettleDEXCall::abi_decode(&calldata, true).unwrap();
        assert_eq!(decoded.amounts.len(), 2);
        assert_eq!(decoded.amounts[1], U256::from(20u64));
    }
}
