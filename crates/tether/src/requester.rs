//! Tag-correlated request/response on top of a [`Device`].
//!
//! A correlation is a fan-out subscriber that only forwards [`Data`] whose
//! `tag` equals the tag of the command that opened it. It ends when a
//! terminal status arrives, when its optional timeout elapses, when the
//! caller cancels it, or when the device closes. Tags stay reserved for as
//! long as their correlation is outstanding.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, trace};

use tether_wire::{CMD_STATUS, Command, Data, FRAME_REQUEST, Status, fresh_tag};

use crate::device::{DEVICE_TARGET, Device};
use crate::fanout::{Flow, Subscription};
use crate::poll::TimerHandle;

/// Errors returned synchronously for misuse of the request API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    /// A correlated send was attempted with an untagged command.
    #[error("a correlated command for {address} must carry a tag")]
    MissingTag {
        /// Device address of the command.
        address: String,
    },
    /// The tag already belongs to an outstanding correlation.
    #[error("tag '{tag}' is already awaiting a response")]
    TagInUse {
        /// Offending tag.
        tag: String,
    },
    /// The device has been closed.
    #[error("device {address} is closed")]
    Closed {
        /// Device address.
        address: String,
    },
    /// A poll period of zero was requested.
    #[error("poll period must be greater than zero")]
    InvalidPeriod,
}

/// Options of one correlation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Correlation {
    /// End the correlation if no terminal status arrives in time.
    pub timeout: Option<Duration>,
    /// Number of tagged responses expected before the correlation may end.
    pub expect_messages: Option<usize>,
    /// With `expect_messages` set, whether a `done` status must also arrive.
    /// When `false`, reaching the count ends the correlation on its own.
    pub expect_cmd_status: bool,
}

impl Default for Correlation {
    fn default() -> Self {
        Self {
            timeout: None,
            expect_messages: None,
            expect_cmd_status: true,
        }
    }
}

impl Correlation {
    /// Correlation ending after `timeout`.
    #[must_use]
    pub const fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            expect_messages: None,
            expect_cmd_status: true,
        }
    }

    /// Holds back an early `done` until `count` responses arrived.
    #[must_use]
    pub const fn expecting(mut self, count: usize) -> Self {
        self.expect_messages = Some(count);
        self
    }

    /// Ends the correlation once the expected count is reached, without
    /// waiting for a command status.
    #[must_use]
    pub const fn without_cmd_status(mut self) -> Self {
        self.expect_cmd_status = false;
        self
    }
}

/// Result of a synchronous request.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Every response, ending with the terminal one.
    Completed(Vec<Data>),
    /// Nothing terminal arrived before the timeout or the device closed.
    NoResponse,
}

impl Outcome {
    /// Returns `true` for [`Outcome::NoResponse`].
    #[must_use]
    pub const fn is_no_response(&self) -> bool {
        matches!(self, Self::NoResponse)
    }

    /// Final response, if any.
    #[must_use]
    pub fn last(&self) -> Option<&Data> {
        match self {
            Self::Completed(responses) => responses.last(),
            Self::NoResponse => None,
        }
    }
}

/// Decides, per tagged response, whether the correlation is over.
struct CorrelationTracker {
    expect_messages: Option<usize>,
    expect_cmd_status: bool,
    received: usize,
    held_done: Option<Data>,
}

impl CorrelationTracker {
    const fn new(correlation: Correlation) -> Self {
        Self {
            expect_messages: correlation.expect_messages,
            expect_cmd_status: correlation.expect_cmd_status,
            received: 0,
            held_done: None,
        }
    }

    fn observe<F>(&mut self, data: &Data, on_response: &mut F) -> Flow
    where
        F: FnMut(&Data),
    {
        let is_status = data.data_type == CMD_STATUS;
        if is_status && is_clean_done(data) && self.counting() && !self.expected_reached() {
            self.held_done = Some(data.clone());
            return Flow::Continue;
        }
        self.received = self.received.saturating_add(1);
        on_response(data);
        if self.counting()
            && self.expected_reached()
            && (self.held_done.is_some() || !self.expect_cmd_status)
        {
            if let Some(done) = self.held_done.take() {
                on_response(&done);
            }
            return Flow::StopAndFinish;
        }
        if is_status && data.status.is_some_and(Status::is_terminal) {
            Flow::StopAndFinish
        } else {
            Flow::Continue
        }
    }

    const fn counting(&self) -> bool {
        self.expect_messages.is_some()
    }

    fn expected_reached(&self) -> bool {
        self.expect_messages
            .is_none_or(|expected| self.received >= expected)
    }
}

/// A `done` status that carries no error text.
fn is_clean_done(data: &Data) -> bool {
    data.status == Some(Status::Done)
        && data
            .field("error")
            .and_then(|error| error.as_str())
            .is_none_or(str::is_empty)
}

enum Event {
    Response(Data),
    Finished,
}

/// Correlating front end of one device.
#[derive(Debug)]
pub struct Requester {
    device: Arc<Device>,
    outstanding: Arc<Mutex<HashSet<String>>>,
    untagged_generation: Arc<AtomicU64>,
    resend: Duration,
}

impl Requester {
    /// Wraps `device`; untagged requests are re-sent every `resend`.
    #[must_use]
    pub fn new(device: Arc<Device>, resend: Duration) -> Self {
        Self {
            device,
            outstanding: Arc::new(Mutex::new(HashSet::new())),
            untagged_generation: Arc::new(AtomicU64::new(0)),
            resend,
        }
    }

    /// Underlying device.
    #[must_use]
    pub const fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Number of correlations still awaiting a terminal response.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.outstanding
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Sends `command` and forwards every response carrying its tag.
    ///
    /// `on_finished` fires exactly once when the correlation ends for any
    /// reason. The returned subscription cancels the correlation early.
    ///
    /// # Errors
    ///
    /// Fails synchronously when the command is untagged, its tag is already
    /// outstanding, or the device is closed.
    pub fn send_with_correlation<R, F>(
        &self,
        command: Command,
        correlation: Correlation,
        mut on_response: R,
        on_finished: F,
    ) -> Result<Subscription, RequestError>
    where
        R: FnMut(&Data) + Send + 'static,
        F: FnOnce() + Send + 'static,
    {
        let Some(tag) = command.tag.clone() else {
            return Err(RequestError::MissingTag {
                address: command.address.to_string(),
            });
        };
        if self.device.is_closed() {
            return Err(RequestError::Closed {
                address: self.device.address().to_string(),
            });
        }
        if !self
            .outstanding
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(tag.clone())
        {
            return Err(RequestError::TagInUse { tag });
        }

        let mut tracker = CorrelationTracker::new(correlation);
        let filter_tag = tag.clone();
        let outstanding = Arc::clone(&self.outstanding);
        let expiry_slot: Arc<Mutex<Option<TimerHandle>>> = Arc::new(Mutex::new(None));
        let finished_flag = Arc::new(AtomicBool::new(false));
        let pending_expiry = Arc::clone(&expiry_slot);
        let ended = Arc::clone(&finished_flag);
        let subscription = self.device.add_callback(
            move |data| {
                if data.tag.as_deref() != Some(filter_tag.as_str()) {
                    return Flow::Continue;
                }
                tracker.observe(data, &mut on_response)
            },
            move || {
                ended.store(true, Ordering::SeqCst);
                let expiry = pending_expiry
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take();
                if let Some(timer) = expiry {
                    timer.cancel();
                }
                outstanding
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&tag);
                on_finished();
            },
        );

        if let Some(timeout) = correlation.timeout {
            let expiry = subscription.clone();
            let timer = self.device.schedule(timeout, move || expiry.cancel());
            let mut slot = expiry_slot.lock().unwrap_or_else(PoisonError::into_inner);
            if finished_flag.load(Ordering::SeqCst) {
                timer.cancel();
            } else {
                *slot = Some(timer);
            }
        }
        trace!(
            target: DEVICE_TARGET,
            address = %self.device.address(),
            data_type = %command.data_type,
            tag = ?command.tag,
            "sending correlated command"
        );
        self.device.send(command);
        Ok(subscription)
    }

    /// Sends `command` and blocks until its terminal response or `timeout`.
    ///
    /// # Errors
    ///
    /// Same contract violations as [`Requester::send_with_correlation`].
    /// Running out of time is reported as [`Outcome::NoResponse`].
    pub fn request(&self, command: Command, timeout: Duration) -> Result<Outcome, RequestError> {
        self.request_with(command, Correlation::default(), timeout)
    }

    /// Like [`Requester::request`], with explicit correlation options.
    ///
    /// # Errors
    ///
    /// Same contract violations as [`Requester::send_with_correlation`].
    pub fn request_with(
        &self,
        command: Command,
        correlation: Correlation,
        timeout: Duration,
    ) -> Result<Outcome, RequestError> {
        let (sender, receiver) = mpsc::channel();
        let responses = sender.clone();
        let subscription = self.send_with_correlation(
            command,
            correlation,
            move |data| {
                if responses.send(Event::Response(data.clone())).is_err() {
                    trace!(target: DEVICE_TARGET, "response after request gave up");
                }
            },
            move || {
                if sender.send(Event::Finished).is_err() {
                    trace!(target: DEVICE_TARGET, "finished after request gave up");
                }
            },
        )?;
        Ok(collect_until_terminal(&receiver, &subscription, timeout))
    }

    /// Sends `command` with a freshly generated tag and waits for the answer.
    ///
    /// # Errors
    ///
    /// Same contract violations as [`Requester::send_with_correlation`].
    pub fn request_tagged(
        &self,
        command: Command,
        timeout: Duration,
    ) -> Result<Outcome, RequestError> {
        self.request(command.with_tag(fresh_tag()), timeout)
    }

    /// Polls with an untagged `frame-request` until one `data_type` sample
    /// arrives or `timeout` elapses.
    #[must_use]
    pub fn request_untagged(&self, data_type: &str, timeout: Duration) -> Option<Data> {
        let (sender, receiver) = mpsc::channel();
        let wanted = data_type.to_owned();
        let subscription = self.device.add_callback(
            move |data| {
                if data.data_type != wanted {
                    return Flow::Continue;
                }
                if sender.send(data.clone()).is_err() {
                    trace!(target: DEVICE_TARGET, "untagged sample after request gave up");
                }
                Flow::StopAndFinish
            },
            || {},
        );
        let deadline = Instant::now() + timeout;
        let mut answer = None;
        while answer.is_none() && !self.device.is_closed() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            self.send_frame_request();
            let wait = self.resend.min(deadline - now);
            match receiver.recv_timeout(wait) {
                Ok(data) => answer = Some(data),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        subscription.cancel();
        answer
    }

    /// Installs, replaces or clears a periodic untagged `frame-request`.
    ///
    /// Every call retires the poll installed by the previous call.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError::InvalidPeriod`] for a zero period.
    pub fn set_untagged_request_period(
        &self,
        period: Option<Duration>,
    ) -> Result<(), RequestError> {
        if period.is_some_and(|value| value.is_zero()) {
            return Err(RequestError::InvalidPeriod);
        }
        let generation = self
            .untagged_generation
            .fetch_add(1, Ordering::SeqCst)
            .wrapping_add(1);
        let Some(every) = period else {
            debug!(
                target: DEVICE_TARGET,
                address = %self.device.address(),
                "untagged poll cleared"
            );
            return Ok(());
        };
        debug!(
            target: DEVICE_TARGET,
            address = %self.device.address(),
            period = ?every,
            "untagged poll installed"
        );
        let current = Arc::clone(&self.untagged_generation);
        let device: Weak<Device> = Arc::downgrade(&self.device);
        self.device.poll(every, move || {
            if current.load(Ordering::SeqCst) != generation {
                return Flow::StopAndFinish;
            }
            let Some(live) = device.upgrade() else {
                return Flow::StopAndFinish;
            };
            live.send(Command::new(live.address().clone(), FRAME_REQUEST));
            Flow::Continue
        });
        Ok(())
    }

    fn send_frame_request(&self) {
        self.device
            .send(Command::new(self.device.address().clone(), FRAME_REQUEST));
    }
}

fn collect_until_terminal(
    receiver: &mpsc::Receiver<Event>,
    subscription: &Subscription,
    timeout: Duration,
) -> Outcome {
    let deadline = Instant::now() + timeout;
    let mut responses = Vec::new();
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match receiver.recv_timeout(remaining) {
            Ok(Event::Response(data)) => responses.push(data),
            Ok(Event::Finished) => {
                let terminal = responses.last().is_some_and(Data::is_terminal);
                return if terminal {
                    Outcome::Completed(responses)
                } else {
                    Outcome::NoResponse
                };
            }
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => {
                subscription.cancel();
                return Outcome::NoResponse;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use rstest::{fixture, rstest};

    use tether_wire::Address;

    use super::*;
    use crate::device::MockCommandSink;

    fn arm() -> Address {
        Address::singleton("arm")
    }

    #[fixture]
    fn requester() -> Requester {
        let mut sink = MockCommandSink::new();
        sink.expect_send().return_const(());
        let device = Arc::new(Device::new(arm(), Arc::new(sink)));
        Requester::new(device, Duration::from_millis(20))
    }

    fn status(tag: &str, status: Status) -> Data {
        Data::new(arm(), CMD_STATUS).with_tag(tag).with_status(status)
    }

    #[rstest]
    fn untagged_correlation_is_rejected(requester: Requester) {
        let error = requester
            .send_with_correlation(
                Command::new(arm(), "move"),
                Correlation::default(),
                |_| {},
                || {},
            )
            .expect_err("untagged command must fail");
        assert!(matches!(error, RequestError::MissingTag { .. }));
    }

    #[rstest]
    fn outstanding_tag_cannot_be_reused(requester: Requester) {
        let command = Command::new(arm(), "move").with_tag("t-1");
        requester
            .send_with_correlation(command.clone(), Correlation::default(), |_| {}, || {})
            .expect("first correlation");
        let error = requester
            .send_with_correlation(command, Correlation::default(), |_| {}, || {})
            .expect_err("tag is outstanding");
        assert_eq!(error, RequestError::TagInUse { tag: "t-1".to_owned() });
    }

    #[rstest]
    fn terminal_status_releases_the_tag(requester: Requester) {
        let command = Command::new(arm(), "move").with_tag("t-2");
        requester
            .send_with_correlation(command, Correlation::default(), |_| {}, || {})
            .expect("correlation");
        assert_eq!(requester.outstanding(), 1);
        requester.device().deliver(&status("t-2", Status::Running));
        assert_eq!(requester.outstanding(), 1);
        requester.device().deliver(&status("t-2", Status::Done));
        assert_eq!(requester.outstanding(), 0);
    }

    #[rstest]
    fn early_done_is_held_until_expected_count(requester: Requester) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        requester
            .send_with_correlation(
                Command::new(arm(), "scan").with_tag("t-3"),
                Correlation::default().expecting(2),
                move |data| sink.lock().expect("lock").push(data.data_type.clone()),
                || {},
            )
            .expect("correlation");
        let device = requester.device();
        device.deliver(&Data::new(arm(), "scan").with_tag("t-3"));
        device.deliver(&status("t-3", Status::Done));
        assert_eq!(requester.outstanding(), 1);
        device.deliver(&Data::new(arm(), "scan").with_tag("t-3"));
        assert_eq!(requester.outstanding(), 0);
        assert_eq!(
            *seen.lock().expect("lock"),
            vec!["scan".to_owned(), "scan".to_owned(), CMD_STATUS.to_owned()]
        );
    }

    #[rstest]
    fn rejection_ends_even_when_more_expected(requester: Requester) {
        requester
            .send_with_correlation(
                Command::new(arm(), "scan").with_tag("t-4"),
                Correlation::default().expecting(5),
                |_| {},
                || {},
            )
            .expect("correlation");
        requester.device().deliver(&status("t-4", Status::Rejected));
        assert_eq!(requester.outstanding(), 0);
    }

    #[rstest]
    fn count_alone_ends_correlation_without_status(requester: Requester) {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&finished);
        requester
            .send_with_correlation(
                Command::new(arm(), "scan").with_tag("t-8"),
                Correlation::default().expecting(2).without_cmd_status(),
                |_| {},
                move || flag.store(true, Ordering::SeqCst),
            )
            .expect("correlation");
        let device = requester.device();
        device.deliver(&Data::new(arm(), "scan").with_tag("t-8"));
        assert_eq!(requester.outstanding(), 1);
        device.deliver(&Data::new(arm(), "scan").with_tag("t-8"));
        assert_eq!(requester.outstanding(), 0);
        assert!(finished.load(Ordering::SeqCst));
    }

    #[rstest]
    fn answered_correlations_release_their_timers(requester: Requester) {
        for index in 0..300 {
            let tag = format!("timed-{index}");
            requester
                .send_with_correlation(
                    Command::new(arm(), "move").with_tag(tag.clone()),
                    Correlation::with_timeout(Duration::from_secs(30)),
                    |_| {},
                    || {},
                )
                .expect("correlation");
            requester.device().deliver(&status(&tag, Status::Done));
        }
        assert_eq!(requester.outstanding(), 0);
        assert_eq!(requester.device().pending_timers(), 0);
    }

    #[rstest]
    fn correlation_timeout_fires_finished(requester: Requester) {
        let (sender, receiver) = mpsc::channel();
        requester
            .send_with_correlation(
                Command::new(arm(), "move").with_tag("t-5"),
                Correlation::with_timeout(Duration::from_millis(20)),
                |_| {},
                move || sender.send(()).expect("send"),
            )
            .expect("correlation");
        receiver
            .recv_timeout(Duration::from_secs(2))
            .expect("timeout should finish the correlation");
        assert_eq!(requester.outstanding(), 0);
    }

    #[rstest]
    fn synchronous_request_collects_responses(requester: Requester) {
        let device = Arc::clone(requester.device());
        let responder = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            device.deliver(&Data::new(arm(), "pose").with_tag("t-6"));
            device.deliver(&status("t-6", Status::Done));
        });
        let outcome = requester
            .request(Command::new(arm(), "pose-request").with_tag("t-6"), Duration::from_secs(5))
            .expect("request");
        responder.join().expect("responder");
        match outcome {
            Outcome::Completed(responses) => assert_eq!(responses.len(), 2),
            Outcome::NoResponse => panic!("expected responses"),
        }
    }

    #[rstest]
    fn closing_the_device_yields_no_response(requester: Requester) {
        let device = Arc::clone(requester.device());
        let closer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            device.close();
        });
        let outcome = requester
            .request(Command::new(arm(), "move").with_tag("t-7"), Duration::from_secs(5))
            .expect("request");
        closer.join().expect("closer");
        assert!(outcome.is_no_response());
    }

    #[rstest]
    fn zero_period_is_rejected(requester: Requester) {
        assert_eq!(
            requester.set_untagged_request_period(Some(Duration::ZERO)),
            Err(RequestError::InvalidPeriod)
        );
    }
}
