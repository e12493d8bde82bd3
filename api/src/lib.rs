pub mod codes;
pub mod rpc;
pub mod types;
