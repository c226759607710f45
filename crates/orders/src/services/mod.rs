//! Domain services behind each saga participant, with in-memory implementations.

pub mod inventory;
pub mod orders;
pub mod payment;

pub use inventory::{InMemoryInventoryService, InventoryService};
pub use orders::{InMemoryOrderService, Order, OrderService, OrderState};
pub use payment::{InMemoryPaymentService, PaymentService};
