use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::bundle::MalformedBundle;
use crate::lifecycle::HandoffState;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),

    /// The artifact at `location` cannot be decoded. Waiting longer will not fix it.
    #[error("malformed bundle at {}: {source}", location.display())]
    MalformedBundle {
        location: PathBuf,
        #[source]
        source: MalformedBundle,
    },

    /// A different bundle already occupies the slot, or another publisher holds it.
    #[error("channel {} is occupied by another bundle or publisher", location.display())]
    ChannelOccupied { location: PathBuf },

    #[error("no bundle appeared at {} within {elapsed:?}", location.display())]
    ChannelTimeout { location: PathBuf, elapsed: Duration },

    #[error(
        "only {consumed} of {expected} consumers retrieved the bundle at {} within {elapsed:?}",
        location.display()
    )]
    ConsumptionTimeout {
        location: PathBuf,
        consumed: usize,
        expected: usize,
        elapsed: Duration,
    },

    #[error("handoff on {} cancelled", location.display())]
    Cancelled { location: PathBuf },

    /// Deleting the channel artifacts failed. Needs an operator; never retried.
    #[error("cleanup of {} failed: {source}", location.display())]
    Cleanup {
        location: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A consumer receipt that does not parse.
    #[error("corrupt receipt {}: {source}", path.display())]
    CorruptReceipt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("cannot {action} while handoff is {state}")]
    InvalidTransition {
        state: HandoffState,
        action: &'static str,
    },

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("invalid consumer name: {0:?}")]
    InvalidConsumer(String),

    #[error("invalid channel location: {0}")]
    InvalidLocation(String),
}

impl Error {
    /// Errors that end a handoff for good, as opposed to a cooperative abort.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::Cancelled { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
