pub mod order;
pub mod position;
pub mod trade;

pub use order::{
    CancelOrderResponse, Order, OrderStatus, OrderType, PlaceOrderRequest, PlaceOrderResponse,
    Side, TimeInForce, UserOrdersQuery,
};
pub use position::{Position, PositionSide};
pub use trade::{Trade, TradeQuery};
