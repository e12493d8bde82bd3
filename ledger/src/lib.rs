pub mod contract;
mod gateway;

pub use gateway::{create_provider, EscrowGateway, EscrowGatewayConfig};
