//! Event bus and built-in listeners

mod bus;
mod stats;

pub use bus::{EventBus, Listener, ListenerError};
pub use stats::{Stats, StatsCollector};
