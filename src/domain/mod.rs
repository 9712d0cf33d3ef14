pub mod message;
pub mod order;

pub use message::OrderMessage;
pub use order::{NewOrder, Order, OrderStatus};
