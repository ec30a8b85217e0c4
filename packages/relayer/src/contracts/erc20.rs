//! ERC-20 token interface
//!
//! Uses alloy's sol! macro to generate type-safe bindings. The vault only
//! ever moves stablecoins with `transfer` and reads its own `balanceOf`.

use alloy::primitives::B256;
use alloy::sol;

sol! {
    /// Minimal ERC-20 surface used by the watcher and the payout writer
    #[sol(rpc)]
    contract IERC20 {
        /// Emitted on every token movement; `to` is topic 2
        event Transfer(address indexed from, address indexed to, uint256 value);

        /// Move `amount` base units from the caller to `to`
        function transfer(address to, uint256 amount) external returns (bool);

        function balanceOf(address account) external view returns (uint256);

        function decimals() external view returns (uint8);
    }
}

/// keccak256("Transfer(address,address,uint256)")
pub fn transfer_topic() -> B256 {
    alloy::primitives::keccak256(b"Transfer(address,address,uint256)")
}
