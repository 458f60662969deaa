// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Contract bindings for the three on-chain surfaces the daemon touches.
//!
//! Only the functions and the one event the pipeline consumes are declared;
//! the deployed contracts carry far more surface than this.

use ethers::contract::abigen;

abigen!(
    DepositSecurityModule,
    r#"[
        struct Signature { bytes32 r; bytes32 vs; }
        function ATTEST_MESSAGE_PREFIX() external view returns (bytes32)
        function PAUSE_MESSAGE_PREFIX() external view returns (bytes32)
        function getGuardians() external view returns (address[])
        function getGuardianQuorum() external view returns (uint256)
        function getMaxDeposits() external view returns (uint256)
        function pauseDeposits(uint256 blockNumber, uint256 stakingModuleId, Signature sig) external
    ]"#
);

abigen!(
    StakingRouter,
    r#"[
        function getStakingModuleIds() external view returns (uint256[])
        function getStakingModuleIsActive(uint256 stakingModuleId) external view returns (bool)
        function getStakingModuleIsDepositsPaused(uint256 stakingModuleId) external view returns (bool)
        function getStakingModuleNonce(uint256 stakingModuleId) external view returns (uint256)
        function getStakingModuleLastDepositBlock(uint256 stakingModuleId) external view returns (uint256)
        function getWithdrawalCredentials() external view returns (bytes32)
    ]"#
);

abigen!(
    DepositContract,
    r#"[
        function get_deposit_root() external view returns (bytes32)
        event DepositEvent(bytes pubkey, bytes withdrawal_credentials, bytes amount, bytes signature, bytes index)
    ]"#
);
