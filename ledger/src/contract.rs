use alloy::sol;

sol! {
    #[sol(rpc, all_derives)]
    contract Escrow {
        function createJob(uint256 jobId, address freelancer) external payable;
        function releasePayment(uint256 jobId) external;
        function getJob(uint256 jobId) external view returns (address client, address freelancer, uint256 amount, uint8 state, uint256 createdAt);

        event JobCreated(uint256 indexed jobId, address client, address freelancer, uint256 amount);
        event PaymentReleased(uint256 indexed jobId, address freelancer, uint256 amount);
    }
}
