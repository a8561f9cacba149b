//! Stepping and seeking through a recorded log.
//!
//! Playback hosts have no dispatcher thread. Every record produced here is
//! routed on the calling thread before the call returns, so subscribers have
//! seen it by the time the caller gets it back.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use tether_wire::Data;

use crate::host::{HOST_TARGET, Shared};
use crate::transport::{Received, ReplayTransport, Transport};

/// Invalid seek request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SeekError {
    /// Both a timestamp and a sequence number were given.
    #[error("seek takes a timestamp or a sequence number, not both")]
    Ambiguous,
    /// Neither a timestamp nor a sequence number was given.
    #[error("seek needs a timestamp or a sequence number")]
    MissingTarget,
}

/// Playback controls for a host opened over a recorded log.
#[derive(Clone)]
pub struct Playback {
    replay: Arc<ReplayTransport>,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Playback {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Playback")
            .field("records", &self.replay.len())
            .field("client", &self.replay.client_id())
            .field("available", &self.available())
            .finish()
    }
}

impl Playback {
    pub(crate) const fn new(replay: Arc<ReplayTransport>, shared: Arc<Shared>) -> Self {
        Self { replay, shared }
    }

    /// Returns `true` while records remain after the cursor.
    #[must_use]
    pub fn available(&self) -> bool {
        !self.shared.is_closed() && self.replay.available()
    }

    /// Dispatches and returns the next record, or `None` at the end of the
    /// log or once the host has closed.
    #[must_use]
    pub fn next(&self) -> Option<Data> {
        if self.shared.is_closed() {
            return None;
        }
        self.shared.flush();
        self.replay.step()?;
        self.pump()
    }

    /// Jumps to a record and dispatches it.
    ///
    /// With a sequence number the exact record is preferred, then the first
    /// one recorded after it. With a timestamp the first record captured at
    /// or after it is chosen. Anything buffered before the jump is dropped.
    ///
    /// Returns `Ok(None)` when nothing matches; the cursor is then at the end
    /// of the log.
    ///
    /// # Errors
    ///
    /// Returns [`SeekError::Ambiguous`] when both targets are given and
    /// [`SeekError::MissingTarget`] when neither is.
    pub fn seek(
        &self,
        timestamp: Option<f64>,
        sequence: Option<u64>,
    ) -> Result<Option<Data>, SeekError> {
        let found = match (timestamp, sequence) {
            (Some(_), Some(_)) => return Err(SeekError::Ambiguous),
            (None, None) => return Err(SeekError::MissingTarget),
            (None, Some(seq)) => {
                self.shared.flush();
                self.replay.seek_sequence(seq)
            }
            (Some(ts), None) => {
                self.shared.flush();
                self.replay.seek_timestamp(ts)
            }
        };
        if found.is_none() {
            debug!(target: HOST_TARGET, ?timestamp, ?sequence, "seek found no record");
            return Ok(None);
        }
        Ok(self.pump())
    }

    /// Number of records playback can produce.
    #[must_use]
    pub fn len(&self) -> usize {
        self.replay.len()
    }

    /// Returns `true` when playback can produce nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.replay.is_empty()
    }

    /// Recorded client whose view is being replayed, if any.
    #[must_use]
    pub fn client_id(&self) -> Option<&str> {
        self.replay.client_id()
    }

    fn pump(&self) -> Option<Data> {
        match self.replay.receive(Duration::ZERO) {
            Received::Data(data) => {
                self.shared.dispatch(&data);
                Some(data)
            }
            Received::Timeout | Received::Closed => None,
        }
    }
}
