//! Configuration synchronizer
//!
//! Holds a module back until every mandatory configuration has arrived.
//!
//! ## Readiness
//!
//! ```text
//!            require()                      last wait pattern matched
//! Configured ─────────► Unconfigured{waiting} ─────────────────────► Configured
//!     ▲                        │  ▲                                  (drain queue,
//!     └────────────────────────┘  └── require() adds to waiting       on_start)
//! ```
//!
//! ## Configuration requests
//!
//! Brokers from protocol v2 on do not retain configuration, so the module
//! asks the config authority for each file it listens to and repeats the
//! request every retry interval until the authority acknowledges it. The
//! retry timer is a deadline owned by the synchronizer; the client event
//! loop sleeps until it and then calls [`ConfigSynchronizer::retry_tick`].

use std::time::Duration;
use tokio::time::Instant;

use crate::config::MAX_CONFIG_RETRY_INTERVAL_SECS;
use crate::message::Message;
use crate::topic;

/// Longest delay between two configuration requests
pub const MAX_RETRY_INTERVAL: Duration = Duration::from_secs(MAX_CONFIG_RETRY_INTERVAL_SECS);

/// Module readiness
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// Every mandatory configuration has arrived
    Configured,
    /// Waiting for the listed configuration patterns
    Unconfigured { waiting: Vec<String> },
}

/// Outcome of matching a configuration against the wait list
#[derive(Debug, Clone, PartialEq)]
pub enum Satisfaction {
    /// The module was already configured
    NotWaiting,
    /// No wait pattern matched
    Unmatched,
    /// Some patterns matched, others are still awaited
    Partial { remaining: usize },
    /// The last wait pattern matched; configurations queued meanwhile are
    /// returned in arrival order
    Completed { queued: Vec<Message> },
}

/// What a retry tick asks the caller to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryTick {
    /// The timer was not armed or not due yet
    Idle,
    /// Nothing pending: the timer disarmed itself
    Cancelled,
    /// Re-send a request for each of these patterns
    Resend(Vec<String>),
}

/// Per-module configuration state machine
#[derive(Debug)]
pub struct ConfigSynchronizer {
    readiness: Readiness,
    queue: Vec<Message>,
    requests_enabled: bool,
    pending: Vec<String>,
    retry_interval: Duration,
    next_retry: Option<Instant>,
}

impl ConfigSynchronizer {
    /// Create a synchronizer
    ///
    /// # Parameters
    ///
    /// - `requests_enabled`: Whether configuration must be requested
    ///   explicitly (non-retaining broker)
    /// - `retry_interval`: Delay between request retries, capped at
    ///   [`MAX_RETRY_INTERVAL`]
    pub fn new(requests_enabled: bool, retry_interval: Duration) -> Self {
        Self {
            readiness: Readiness::Configured,
            queue: Vec::new(),
            requests_enabled,
            pending: Vec::new(),
            retry_interval: retry_interval.min(MAX_RETRY_INTERVAL),
            next_retry: None,
        }
    }

    pub fn readiness(&self) -> &Readiness {
        &self.readiness
    }

    pub fn is_configured(&self) -> bool {
        matches!(self.readiness, Readiness::Configured)
    }

    /// Patterns still awaited
    pub fn waiting(&self) -> &[String] {
        match &self.readiness {
            Readiness::Configured => &[],
            Readiness::Unconfigured { waiting } => waiting,
        }
    }

    /// Make `pattern` mandatory, blocking the module even if it was
    /// already configured
    pub fn require(&mut self, pattern: &str) {
        match &mut self.readiness {
            Readiness::Unconfigured { waiting } => waiting.push(pattern.to_string()),
            Readiness::Configured => {
                self.readiness = Readiness::Unconfigured {
                    waiting: vec![pattern.to_string()],
                }
            }
        }
    }

    /// Match a delivered configuration topic against the wait list
    ///
    /// Every wait pattern whose normalized form matches is removed. When the
    /// list empties the module becomes configured and the configuration
    /// queue is handed back for delivery.
    pub fn satisfy(&mut self, configuration_topic: &str) -> Satisfaction {
        let Readiness::Unconfigured { waiting } = &mut self.readiness else {
            return Satisfaction::NotWaiting;
        };

        let before = waiting.len();
        waiting.retain(|pattern| {
            !topic::matches(&topic::normalize_wait_pattern(pattern), configuration_topic)
        });

        if waiting.len() == before {
            Satisfaction::Unmatched
        } else if waiting.is_empty() {
            self.readiness = Readiness::Configured;
            Satisfaction::Completed {
                queued: std::mem::take(&mut self.queue),
            }
        } else {
            Satisfaction::Partial {
                remaining: waiting.len(),
            }
        }
    }

    /// Hold a configuration until the module is configured
    pub fn enqueue(&mut self, message: Message) {
        self.queue.push(message);
    }

    /// Configurations held back so far
    pub fn queued(&self) -> &[Message] {
        &self.queue
    }

    /// Whether configuration must be requested explicitly
    pub fn requests_enabled(&self) -> bool {
        self.requests_enabled
    }

    /// Record a configuration request and arm the retry timer
    ///
    /// Returns `false` when requests are not needed on this broker. Arming an
    /// already armed timer keeps its deadline.
    pub fn track_request(&mut self, pattern: &str, now: Instant) -> bool {
        if !self.requests_enabled {
            return false;
        }

        self.pending.push(pattern.to_string());
        if self.next_retry.is_none() {
            self.next_retry = Some(self.deadline_after(now));
        }
        true
    }

    /// Forget a request the config authority acknowledged
    ///
    /// Returns `true` if the pattern was pending.
    pub fn acknowledge(&mut self, pattern: &str) -> bool {
        let before = self.pending.len();
        self.pending.retain(|p| p != pattern);
        self.pending.len() != before
    }

    /// Requests not acknowledged yet
    pub fn pending(&self) -> &[String] {
        &self.pending
    }

    /// Deadline of the retry timer, `None` when disarmed
    pub fn next_retry(&self) -> Option<Instant> {
        self.next_retry
    }

    /// Whether the retry timer is armed
    pub fn retry_active(&self) -> bool {
        self.next_retry.is_some()
    }

    /// Fire the retry timer if it is due
    pub fn retry_tick(&mut self, now: Instant) -> RetryTick {
        match self.next_retry {
            Some(deadline) if deadline <= now => {}
            _ => return RetryTick::Idle,
        }

        if self.pending.is_empty() {
            self.next_retry = None;
            return RetryTick::Cancelled;
        }

        self.next_retry = Some(self.deadline_after(now));
        RetryTick::Resend(self.pending.clone())
    }

    fn deadline_after(&self, now: Instant) -> Instant {
        now.checked_add(self.retry_interval).unwrap_or(now)
    }
}
