//! Blocking retrieval of a bundle from a channel location.

use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::ack;
use crate::bundle::Bundle;
use crate::cancel::CancelToken;
use crate::config::HandoffConfig;
use crate::location::ChannelLocation;
use crate::publisher::read_published;
use crate::schema::BundleSchema;
use crate::{Error, Result};

/// Polls a channel until a complete bundle is observable there.
///
/// A waiter only reads the bundle. With a consumer name it also leaves a receipt in the
/// channel's ack directory so the publishing side can tell it was retrieved.
#[derive(Debug, Clone)]
pub struct Waiter {
    location: ChannelLocation,
    poll_interval: Duration,
    timeout: Duration,
    cancel: CancelToken,
    schema: BundleSchema,
    consumer: Option<String>,
}

impl Waiter {
    pub fn new(location: ChannelLocation, config: &HandoffConfig) -> Self {
        Self {
            location,
            poll_interval: config.poll_interval,
            timeout: config.timeout,
            cancel: CancelToken::new(),
            schema: BundleSchema::empty(),
            consumer: None,
        }
    }

    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_schema(mut self, schema: BundleSchema) -> Self {
        self.schema = schema;
        self
    }

    pub fn as_consumer(mut self, consumer: impl Into<String>) -> Self {
        self.consumer = Some(consumer.into());
        self
    }

    pub fn location(&self) -> &ChannelLocation {
        &self.location
    }

    /// One observability check. `Ok(None)` means nothing is published yet.
    pub fn poll_once(&self) -> Result<Option<Bundle>> {
        let Some(bundle) = read_published(&self.location)? else {
            return Ok(None);
        };
        self.schema
            .check(&bundle)
            .map_err(|source| Error::MalformedBundle {
                location: self.location.path().to_path_buf(),
                source,
            })?;
        Ok(Some(bundle))
    }

    /// Block until a bundle is observable, the timeout elapses, or the wait is cancelled.
    ///
    /// Malformed contents fail at once; they will not heal by waiting.
    pub fn wait(&self) -> Result<Bundle> {
        if let Some(consumer) = &self.consumer {
            ack::validate_consumer_name(consumer)?;
        }
        if self.poll_interval.is_zero() {
            return Err(Error::InvalidConfig("poll_interval must be positive".into()));
        }

        let start = Instant::now();
        let mut polls: u64 = 0;
        loop {
            if self.cancel.is_cancelled() {
                debug!("wait on {} cancelled after {polls} polls", self.location);
                return Err(self.cancelled());
            }

            polls += 1;
            if let Some(bundle) = self.poll_once()? {
                let elapsed = start.elapsed();
                if let Some(consumer) = &self.consumer {
                    ack::acknowledge(&self.location, consumer, &bundle)?;
                }
                info!(
                    "received generation {} from {} after {elapsed:?} ({polls} polls)",
                    bundle.generation(),
                    self.location
                );
                return Ok(bundle);
            }

            let elapsed = start.elapsed();
            if elapsed >= self.timeout {
                warn!("no bundle at {} after {elapsed:?}", self.location);
                return Err(Error::ChannelTimeout {
                    location: self.location.path().to_path_buf(),
                    elapsed,
                });
            }
            debug!("nothing at {} yet, poll {polls}", self.location);

            let pause = self.poll_interval.min(self.timeout - elapsed);
            if self.cancel.sleep(pause) {
                return Err(self.cancelled());
            }
        }
    }

    fn cancelled(&self) -> Error {
        Error::Cancelled {
            location: self.location.path().to_path_buf(),
        }
    }
}

/// Wait for a bundle at `location` with no consumer receipt and no schema.
pub fn wait(location: &ChannelLocation, poll_interval: Duration, timeout: Duration) -> Result<Bundle> {
    Waiter::new(location.clone(), &HandoffConfig::default())
        .poll_interval(poll_interval)
        .timeout(timeout)
        .wait()
}
