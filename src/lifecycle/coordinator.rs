//! Sequencing of publish, consumption and cleanup for one channel.

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use log::{error, info, warn};

use crate::ack;
use crate::bundle::Bundle;
use crate::cancel::CancelToken;
use crate::config::HandoffConfig;
use crate::lifecycle::HandoffState;
use crate::location::ChannelLocation;
use crate::publisher::{self, PublishOutcome};
use crate::schema::BundleSchema;
use crate::{Error, Result};

/// Owns one handoff generation from the publishing side.
///
/// The coordinator is the only party that deletes the channel, and it does so only once
/// the expected number of consumers have retrieved the bundle.
pub struct Coordinator {
    location: ChannelLocation,
    config: HandoffConfig,
    schema: BundleSchema,
    state: HandoffState,
    bundle: Option<Bundle>,
    published_at: Option<Instant>,
    consumed: BTreeSet<String>,
    detached: bool,
}

impl Coordinator {
    pub fn new(location: ChannelLocation, config: HandoffConfig) -> Result<Self> {
        config.validate()?;
        let schema = BundleSchema::from_config(&config);
        Ok(Self {
            location,
            config,
            schema,
            state: HandoffState::Empty,
            bundle: None,
            published_at: None,
            consumed: BTreeSet::new(),
            detached: false,
        })
    }

    /// Replace the schema derived from the config.
    pub fn with_schema(mut self, schema: BundleSchema) -> Self {
        self.schema = schema;
        self
    }

    pub fn state(&self) -> HandoffState {
        self.state
    }

    pub fn location(&self) -> &ChannelLocation {
        &self.location
    }

    pub fn bundle(&self) -> Option<&Bundle> {
        self.bundle.as_ref()
    }

    pub fn consumed_count(&self) -> usize {
        self.consumed.len()
    }

    pub fn expected_consumers(&self) -> usize {
        self.config.expected_consumers
    }

    pub fn publish(&mut self, bundle: Bundle) -> Result<()> {
        match self.state {
            HandoffState::Empty => {}
            HandoffState::Published if self.bundle.as_ref() == Some(&bundle) => return Ok(()),
            state => {
                return Err(Error::InvalidTransition {
                    state,
                    action: "publish",
                })
            }
        }
        self.schema
            .check(&bundle)
            .map_err(|source| Error::MalformedBundle {
                location: self.location.path().to_path_buf(),
                source,
            })?;

        if publisher::publish(&bundle, &self.location)? == PublishOutcome::AlreadyPublished {
            info!("{} already carried this bundle, adopting it", self.location);
        }
        self.bundle = Some(bundle);
        self.published_at = Some(Instant::now());
        self.transition(HandoffState::Published);
        Ok(())
    }

    /// Count a consumer that retrieved the bundle inside this process.
    pub fn record_consumed(&mut self, consumer: &str) -> Result<HandoffState> {
        ack::validate_consumer_name(consumer)?;
        match self.state {
            HandoffState::Published => {
                self.consumed.insert(consumer.to_string());
                self.settle();
                Ok(self.state)
            }
            HandoffState::Consumed => {
                self.consumed.insert(consumer.to_string());
                Ok(self.state)
            }
            state => Err(Error::InvalidTransition {
                state,
                action: "record a consumer",
            }),
        }
    }

    /// Pick up receipts left by consumers in other processes and apply the timeout.
    pub fn refresh(&mut self) -> Result<HandoffState> {
        if self.state != HandoffState::Published {
            return Ok(self.state);
        }
        if let Some(bundle) = &self.bundle {
            let durable = ack::consumers_of(&self.location, bundle)?;
            self.consumed.extend(durable);
        }
        self.settle();
        if self.state == HandoffState::Published && self.elapsed() >= self.config.timeout {
            error!(
                "{} of {} consumers retrieved {} within {:?}; leaving it for an operator",
                self.consumed.len(),
                self.config.expected_consumers,
                self.location,
                self.config.timeout
            );
            self.transition(HandoffState::Failed);
        }
        Ok(self.state)
    }

    /// Block until every expected consumer has retrieved the bundle.
    pub fn await_consumed(&mut self, cancel: &CancelToken) -> Result<()> {
        if self.state == HandoffState::Empty {
            return Err(Error::InvalidTransition {
                state: self.state,
                action: "await consumers",
            });
        }
        loop {
            match self.refresh()? {
                HandoffState::Consumed | HandoffState::Cleaned => return Ok(()),
                HandoffState::Failed => return Err(self.consumption_timeout()),
                HandoffState::Empty | HandoffState::Published => {}
            }
            if cancel.is_cancelled() {
                return Err(Error::Cancelled {
                    location: self.location.path().to_path_buf(),
                });
            }
            let remaining = self.config.timeout.saturating_sub(self.elapsed());
            let pause = self.config.poll_interval.min(remaining.max(Duration::from_millis(1)));
            if cancel.sleep(pause) {
                return Err(Error::Cancelled {
                    location: self.location.path().to_path_buf(),
                });
            }
        }
    }

    /// Remove the channel. Allowed once, and only after consumption.
    pub fn cleanup(&mut self) -> Result<()> {
        if self.state != HandoffState::Consumed {
            return Err(Error::InvalidTransition {
                state: self.state,
                action: "clean up",
            });
        }
        match remove_channel(&self.location) {
            Ok(()) => {
                info!("cleaned up {}", self.location);
                self.transition(HandoffState::Cleaned);
                Ok(())
            }
            Err(err) => {
                error!("cleanup of {} failed: {err}", self.location);
                self.transition(HandoffState::Failed);
                Err(err)
            }
        }
    }

    /// Give up ownership of a published channel, e.g. to a separate cleanup step.
    pub fn detach(mut self) -> ChannelLocation {
        if self.state.holds_artifact() {
            info!("{} handed off while {}", self.location, self.state);
        }
        self.detached = true;
        self.location.clone()
    }

    fn settle(&mut self) {
        if self.state == HandoffState::Published
            && self.consumed.len() >= self.config.expected_consumers
        {
            info!(
                "all {} consumers retrieved {}",
                self.config.expected_consumers, self.location
            );
            self.transition(HandoffState::Consumed);
        }
    }

    fn transition(&mut self, next: HandoffState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "{} -> {next}",
            self.state
        );
        self.state = next;
    }

    fn elapsed(&self) -> Duration {
        self.published_at
            .map(|at| at.elapsed())
            .unwrap_or_default()
    }

    fn consumption_timeout(&self) -> Error {
        Error::ConsumptionTimeout {
            location: self.location.path().to_path_buf(),
            consumed: self.consumed.len(),
            expected: self.config.expected_consumers,
            elapsed: self.elapsed(),
        }
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        if self.detached {
            return;
        }
        match self.state {
            HandoffState::Published | HandoffState::Consumed => {
                warn!(
                    "handoff coordinator dropped while {}; {} was not cleaned up",
                    self.state, self.location
                );
            }
            HandoffState::Failed => {
                error!("{} left behind after a failed handoff", self.location);
            }
            HandoffState::Empty | HandoffState::Cleaned => {}
        }
    }
}

/// Delete the bundle, its receipts and its lock file.
///
/// A missing bundle file is an error: someone other than the owner removed it.
pub fn remove_channel(location: &ChannelLocation) -> Result<()> {
    let cleanup_err = |source: std::io::Error| Error::Cleanup {
        location: location.path().to_path_buf(),
        source,
    };
    std::fs::remove_file(location.path()).map_err(cleanup_err)?;
    match std::fs::remove_dir_all(location.acks_dir()) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(cleanup_err(err)),
    }
    match std::fs::remove_file(location.lock_path()) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(cleanup_err(err)),
    }
    Ok(())
}
