//! Durable cross-process handoff channel.
//!
//! One process publishes a bundle of resource descriptors at an agreed location; one or
//! more other processes block until it is observable, read it, and leave a receipt. The
//! publishing side removes the channel once every expected consumer has its copy.

pub mod ack;
pub mod bundle;
pub mod cancel;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod location;
pub mod publish_lock;
pub mod publisher;
pub mod schema;
pub mod waiter;

pub use bundle::{Bundle, Descriptor, MalformedBundle};
pub use cancel::CancelToken;
pub use config::HandoffConfig;
pub use error::{Error, Result};
pub use lifecycle::{Coordinator, HandoffState};
pub use location::ChannelLocation;
pub use publisher::{publish, read_published, PublishOutcome};
pub use schema::BundleSchema;
pub use waiter::{wait, Waiter};
