// Retrying, clock-stamped access to the exchange
pub mod exchange_gateway;
pub mod retry;

pub use exchange_gateway::{ExchangeGateway, GatewayError};
pub use retry::RetryPolicy;
