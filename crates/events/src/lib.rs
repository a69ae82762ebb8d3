//! Dispatch channel mechanics: the ordered, at-least-once transport that
//! carries job identifiers from submission/retry points to the worker.

pub mod bus;
pub mod in_memory_bus;

pub use bus::{
    ChannelError, Delivery, DispatchChannel, PublishError, Receipt, RecvTimeoutError, Subscription,
};
pub use in_memory_bus::InMemoryDispatchChannel;
