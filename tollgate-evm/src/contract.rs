//! Solidity interface used for refunds.

use alloy_sol_types::sol;

sol! {
    /// Minimal ERC-20 surface: the transfer a refund makes and the balance
    /// check before it.
    #[allow(missing_docs)]
    #[derive(Debug)]
    interface IERC20 {
        function balanceOf(address account) external view returns (uint256);
        function transfer(address to, uint256 amount) external returns (bool);
    }
}
