pub mod broker;
pub mod client;
pub mod retry;
pub mod sqlite;

pub use broker::{Broker, Delivery, QueueDepth};
pub use client::{dead_letter_queue, ConsumeOptions, ConsumeStats, MessageHandler, QueueClient};
pub use retry::RetryPolicy;
pub use sqlite::SqliteBroker;
