//! Handoff lifecycle management.
//!
//! This module sequences one handoff generation from the publishing side:
//! - Publication of the bundle (`Empty -> Published`)
//! - Counting consumers, in-process or through durable receipts (`Published -> Consumed`)
//! - Exactly-once removal of the channel (`Consumed -> Cleaned`)
//! - Reporting of handoffs that never completed (`Failed`), plus a sweep for leftovers
//!
//! # Example
//!
//! ```rust,ignore
//! use handoff::lifecycle::Coordinator;
//! use handoff::{Bundle, CancelToken, ChannelLocation, HandoffConfig};
//!
//! let location = ChannelLocation::tagged("/tmp", &image_ref)?;
//! let mut coordinator = Coordinator::new(location, HandoffConfig::default())?;
//!
//! coordinator.publish(bundle)?;
//! coordinator.await_consumed(&CancelToken::new())?;
//! coordinator.cleanup()?;
//! ```

mod coordinator;
mod state;
pub mod status;
pub mod sweep;

pub use coordinator::{remove_channel, Coordinator};
pub use state::HandoffState;
pub use status::{inspect, ChannelStatus};
pub use sweep::{sweep, SweepConfig, SweepReport};
