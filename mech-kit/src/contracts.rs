//! ABI bindings for every contract the engine touches.
//!
//! Only the functions, events and structs actually used are declared.

use alloy_core::{sol, sol_types::SolCall};
use alloy_primitives::Address;
use mech_core::{
    errors::LedgerError,
    ledger::{ContractCall, LedgerGateway},
};

use crate::retry::ReadRetry;

sol! {
    interface IERC20 {
        function balanceOf(address account) external view returns (uint256);
        function allowance(address owner, address spender) external view returns (uint256);
        function approve(address spender, uint256 amount) external returns (bool);
    }

    interface IERC1155 {
        function balanceOf(address account, uint256 id) external view returns (uint256);
    }

    interface IMech {
        function paymentType() external view returns (bytes32);
        function maxDeliveryRate() external view returns (uint256);

        event Deliver(
            address indexed mech,
            address indexed mechServiceMultisig,
            bytes32 requestId,
            uint256 deliveryRate,
            bytes data
        );
    }

    interface IMechMarketplace {
        function request(
            bytes requestData,
            uint256 maxDeliveryRate,
            bytes32 paymentType,
            address priorityMech,
            uint256 responseTimeout,
            bytes paymentData
        ) external payable returns (bytes32 requestId);

        function requestBatch(
            bytes[] requestDatas,
            uint256 maxDeliveryRate,
            bytes32 paymentType,
            address priorityMech,
            uint256 responseTimeout,
            bytes paymentData
        ) external payable returns (bytes32[] requestIds);

        function mapPaymentTypeBalanceTrackers(bytes32 paymentType) external view returns (address);

        function mapRequestIdInfos(bytes32 requestId) external view returns (
            address priorityMech,
            address deliveryMech,
            address requester,
            uint256 responseTimeout,
            uint256 deliveryRate,
            bytes32 paymentType
        );

        event MarketplaceRequest(
            address indexed priorityMech,
            address indexed requester,
            uint256 numRequests,
            bytes32[] requestIds,
            bytes[] requestDatas
        );
    }

    interface IBalanceTracker {
        function token() external view returns (address);
        function subscriptionNFT() external view returns (address);
        function subscriptionTokenId() external view returns (uint256);
        function mapRequesterBalances(address requester) external view returns (uint256);
    }

    /// Proxy wallet transaction, signed by the owners under EIP-712.
    struct SafeTx {
        address to;
        uint256 value;
        bytes data;
        uint8 operation;
        uint256 safeTxGas;
        uint256 baseGas;
        uint256 gasPrice;
        address gasToken;
        address refundReceiver;
        uint256 nonce;
    }

    interface ISafe {
        function nonce() external view returns (uint256);

        function execTransaction(
            address to,
            uint256 value,
            bytes data,
            uint8 operation,
            uint256 safeTxGas,
            uint256 baseGas,
            uint256 gasPrice,
            address gasToken,
            address refundReceiver,
            bytes signatures
        ) external payable returns (bool success);
    }

    interface ICondition {
        function generateId(bytes32 agreementId, bytes32 valueHash) external view returns (bytes32);
    }

    interface INFTSalesTemplate {
        function createAgreementAndPayEscrow(
            bytes32 id,
            bytes32 did,
            bytes32[] conditionIds,
            uint256[] timeLocks,
            uint256[] timeOuts,
            address accessConsumer,
            uint256 idx,
            address rewardAddress,
            address tokenAddress,
            uint256[] amounts,
            address[] receivers
        ) external payable;
    }

    struct FulfillForDelegateParams {
        address nftHolder;
        address nftReceiver;
        uint256 nftAmount;
        bytes32 lockPaymentCondition;
        address nftContractAddress;
        bool transfer;
        uint256 expirationBlock;
    }

    struct FulfillParams {
        uint256[] amounts;
        address[] receivers;
        address returnAddress;
        address lockPaymentAddress;
        address tokenAddress;
        bytes32 lockCondition;
        bytes32[] releaseConditions;
    }

    interface ISubscriptionProvider {
        function fulfill(
            bytes32 agreementId,
            bytes32 did,
            FulfillForDelegateParams fulfillForDelegateParams,
            FulfillParams fulfillParams
        ) external;
    }
}

/// Read `call` from `to` under the read retry policy and decode its return value.
pub(crate) async fn read_call<L, C>(
    ledger: &L,
    retry: &ReadRetry,
    to: Address,
    call: &C,
) -> Result<C::Return, LedgerError>
where
    L: LedgerGateway,
    C: SolCall,
{
    let request = ContractCall::new(to, call.abi_encode());
    let request = &request;
    let data = retry.run(|| ledger.read(request)).await?;
    C::abi_decode_returns(&data).map_err(|e| LedgerError::decode(e.to_string()))
}
