//! Contract ABI definitions
//!
//! ERC-20, Multicall3, ERC-4337 EntryPoint and the smart-account batch
//! entry point, declared once with `sol!` and used for both encoding calls
//! and decoding `eth_call` results.

use alloy_primitives::{Address, Bytes, U256};
use alloy_sol_types::{sol, SolCall};

sol! {
    // ERC20
    function balanceOf(address account) external view returns (uint256);
    function decimals() external view returns (uint8);
    function allowance(address owner, address spender) external view returns (uint256);
    function approve(address spender, uint256 amount) external returns (bool);
    function transfer(address to, uint256 amount) external returns (bool);

    event Transfer(address indexed from, address indexed to, uint256 value);

    // Multicall3
    #[derive(Debug)]
    struct Call3 {
        address target;
        bool allowFailure;
        bytes callData;
    }

    #[derive(Debug)]
    struct Call3Result {
        bool success;
        bytes returnData;
    }

    function aggregate3(Call3[] calldata calls) external payable returns (Call3Result[] memory returnData);

    // ERC-4337 EntryPoint
    function getNonce(address sender, uint192 key) external view returns (uint256 nonce);

    // Smart account batch execution
    #[derive(Debug)]
    struct BatchCall {
        address target;
        uint256 value;
        bytes data;
    }

    function executeBatch(BatchCall[] calldata calls) external;
}

/// Encode `balanceOf(owner)`
pub fn encode_balance_of(owner: Address) -> Bytes {
    balanceOfCall { account: owner }.abi_encode().into()
}

/// Encode `decimals()`
pub fn encode_decimals() -> Bytes {
    decimalsCall {}.abi_encode().into()
}

/// Encode `allowance(owner, spender)`
pub fn encode_allowance(owner: Address, spender: Address) -> Bytes {
    allowanceCall { owner, spender }.abi_encode().into()
}

/// Encode `approve(spender, amount)`
pub fn encode_approve(spender: Address, amount: U256) -> Bytes {
    approveCall { spender, amount }.abi_encode().into()
}

/// Encode `transfer(to, amount)`
pub fn encode_transfer(to: Address, amount: U256) -> Bytes {
    transferCall { to, amount }.abi_encode().into()
}

/// Encode `getNonce(sender, 0)` on the EntryPoint
pub fn encode_get_nonce(sender: Address) -> Bytes {
    getNonceCall {
        sender,
        key: Default::default(),
    }
    .abi_encode()
    .into()
}

/// Encode a Multicall3 `aggregate3` with failures allowed per call
pub fn encode_aggregate3(calls: &[(Address, Bytes)]) -> Bytes {
    let calls = calls
        .iter()
        .map(|(target, data)| Call3 {
            target: *target,
            allowFailure: true,
            callData: data.clone(),
        })
        .collect();
    aggregate3Call { calls }.abi_encode().into()
}

/// Decode `aggregate3` return data into per-call (success, returnData)
pub fn decode_aggregate3(data: &[u8]) -> Option<Vec<(bool, Bytes)>> {
    let decoded = aggregate3Call::abi_decode_returns(data, true).ok()?;
    Some(
        decoded
            .returnData
            .into_iter()
            .map(|r| (r.success, r.returnData))
            .collect(),
    )
}

/// Decode a single `uint256` return value
pub fn decode_uint256(data: &[u8]) -> Option<U256> {
    balanceOfCall::abi_decode_returns(data, true).ok().map(|r| r._0)
}

/// Decode a `decimals()` return value
pub fn decode_decimals(data: &[u8]) -> Option<u8> {
    decimalsCall::abi_decode_returns(data, true).ok().map(|r| r._0)
}

/// Encode the smart-account `executeBatch` payload
pub fn encode_execute_batch(calls: &[(Address, U256, Bytes)]) -> Bytes {
    let calls = calls
        .iter()
        .map(|(target, value, data)| BatchCall {
            target: *target,
            value: *value,
            data: data.clone(),
        })
        .collect();
    executeBatchCall { calls }.abi_encode().into()
}
