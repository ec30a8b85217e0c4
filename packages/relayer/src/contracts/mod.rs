//! Contract ABI definitions for the EVM side of the bridge

pub mod erc20;

pub use erc20::IERC20;
