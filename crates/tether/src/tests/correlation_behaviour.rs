//! Behavioural tests for tag correlation.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rstest::fixture;
use rstest_bdd_macros::{given, scenario, then, when};

use tether_wire::{Address, CMD_STATUS, Command, Data, Status};

use crate::device::{CommandSink, Device};
use crate::requester::{Correlation, Outcome, RequestError, Requester};

#[derive(Default)]
struct RecordingSink {
    sent: Mutex<Vec<Command>>,
}

impl CommandSink for RecordingSink {
    fn send(&self, command: Command) {
        self.sent.lock().expect("sink lock").push(command);
    }
}

struct CorrelationWorld {
    sink: Arc<RecordingSink>,
    requester: Option<Requester>,
    responses: Arc<Mutex<Vec<Data>>>,
    finished: Arc<AtomicBool>,
    outcome: Option<Outcome>,
    rejection: Option<RequestError>,
}

impl CorrelationWorld {
    fn new() -> Self {
        Self {
            sink: Arc::new(RecordingSink::default()),
            requester: None,
            responses: Arc::new(Mutex::new(Vec::new())),
            finished: Arc::new(AtomicBool::new(false)),
            outcome: None,
            rejection: None,
        }
    }

    fn requester(&self) -> &Requester {
        self.requester.as_ref().expect("requester should be built")
    }

    fn correlate(&self, tag: &str) -> Result<(), RequestError> {
        let responses = Arc::clone(&self.responses);
        let finished = Arc::clone(&self.finished);
        self.requester()
            .send_with_correlation(
                Command::new(arm(), "move").with_tag(tag),
                Correlation::default(),
                move |data| responses.lock().expect("responses lock").push(data.clone()),
                move || finished.store(true, Ordering::SeqCst),
            )
            .map(|_subscription| ())
    }
}

fn arm() -> Address {
    Address::singleton("arm")
}

#[fixture]
fn world() -> RefCell<CorrelationWorld> {
    RefCell::new(CorrelationWorld::new())
}

#[given("a requester for the arm device")]
fn given_requester(world: &RefCell<CorrelationWorld>) {
    let mut world = world.borrow_mut();
    let sink: Arc<dyn CommandSink> = Arc::<RecordingSink>::clone(&world.sink);
    let device = Arc::new(Device::new(arm(), sink));
    world.requester = Some(Requester::new(device, Duration::from_millis(50)));
}

#[when("a move command tagged {tag} is requested")]
fn when_requested(world: &RefCell<CorrelationWorld>, tag: String) {
    world
        .borrow()
        .correlate(&tag)
        .expect("correlation should start");
}

#[when("a move command tagged {tag} is sent without waiting")]
fn when_sent(world: &RefCell<CorrelationWorld>, tag: String) {
    world
        .borrow()
        .correlate(&tag)
        .expect("correlation should start");
}

#[when("a move command tagged {tag} waits {millis} ms for an answer")]
fn when_requested_with_timeout(world: &RefCell<CorrelationWorld>, tag: String, millis: u64) {
    let outcome = world
        .borrow()
        .requester()
        .request(
            Command::new(arm(), "move").with_tag(tag),
            Duration::from_millis(millis),
        )
        .expect("request should be accepted");
    world.borrow_mut().outcome = Some(outcome);
}

#[when("the host answers {tag} with status {status}")]
fn when_host_answers(world: &RefCell<CorrelationWorld>, tag: String, status: String) {
    let reply = Data::new(arm(), CMD_STATUS)
        .with_tag(tag)
        .with_status(Status::from_wire(&status));
    world.borrow().requester().device().deliver(&reply);
}

#[then("the request completes with {count} responses")]
fn then_completes(world: &RefCell<CorrelationWorld>, count: usize) {
    let world = world.borrow();
    assert!(world.finished.load(Ordering::SeqCst), "correlation still open");
    let responses = world.responses.lock().expect("responses lock");
    assert_eq!(responses.len(), count, "responses: {responses:?}");
    assert!(responses.last().is_some_and(Data::is_terminal));
}

#[then("the request reports no response")]
fn then_no_response(world: &RefCell<CorrelationWorld>) {
    assert_eq!(world.borrow().outcome, Some(Outcome::NoResponse));
}

#[then("no correlation is outstanding")]
fn then_none_outstanding(world: &RefCell<CorrelationWorld>) {
    assert_eq!(world.borrow().requester().outstanding(), 0);
}

#[then("sending another command tagged {tag} is rejected")]
fn then_rejected(world: &RefCell<CorrelationWorld>, tag: String) {
    let result = world.borrow().correlate(&tag);
    world.borrow_mut().rejection = result.err();
    let world = world.borrow();
    assert!(
        matches!(&world.rejection, Some(RequestError::TagInUse { tag: used }) if *used == tag),
        "expected tag reuse rejection, got {:?}",
        world.rejection
    );
    let sent = world.sink.sent.lock().expect("sink lock");
    assert_eq!(sent.len(), 1, "the rejected command must not be sent");
}

#[scenario(
    path = "tests/features/tag_correlation.feature",
    name = "A tagged request completes on a terminal status"
)]
fn terminal_status(world: RefCell<CorrelationWorld>) {
    let _ = world;
}

#[scenario(
    path = "tests/features/tag_correlation.feature",
    name = "A request without a response reports no response"
)]
fn no_response(world: RefCell<CorrelationWorld>) {
    let _ = world;
}

#[scenario(
    path = "tests/features/tag_correlation.feature",
    name = "Responses for other tags are ignored"
)]
fn other_tags(world: RefCell<CorrelationWorld>) {
    let _ = world;
}

#[scenario(
    path = "tests/features/tag_correlation.feature",
    name = "Reusing an outstanding tag is rejected"
)]
fn tag_reuse(world: RefCell<CorrelationWorld>) {
    let _ = world;
}
