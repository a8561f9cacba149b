//! Behavioural tests for per-device callback fan-out.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use rstest::fixture;
use rstest_bdd_macros::{given, scenario, then, when};

use tether_wire::{Address, Data};

use crate::device::{Device, MockCommandSink};
use crate::fanout::Flow;

#[derive(Default)]
struct Observations {
    log: Mutex<Vec<(usize, u64)>>,
    finished: Mutex<HashMap<usize, usize>>,
    limits: Mutex<HashMap<usize, usize>>,
    late_from: Mutex<Option<usize>>,
    late_seen: AtomicUsize,
}

impl Observations {
    fn seen_by(&self, index: usize) -> Vec<u64> {
        self.log
            .lock()
            .expect("log lock")
            .iter()
            .filter(|(subscriber, _)| *subscriber == index)
            .map(|(_, seq)| *seq)
            .collect()
    }

    fn finished_count(&self, index: usize) -> usize {
        self.finished
            .lock()
            .expect("finished lock")
            .get(&index)
            .copied()
            .unwrap_or_default()
    }
}

struct FanoutWorld {
    device: Arc<Device>,
    observations: Arc<Observations>,
    subscribers: usize,
    next_seq: u64,
}

impl FanoutWorld {
    fn new() -> Self {
        Self {
            device: Arc::new(Device::new(
                Address::singleton("arm"),
                Arc::new(MockCommandSink::new()),
            )),
            observations: Arc::new(Observations::default()),
            subscribers: 0,
            next_seq: 1,
        }
    }

    fn add_subscriber(&mut self, index: usize) {
        let observations = Arc::clone(&self.observations);
        let finished = Arc::clone(&self.observations);
        let device: Weak<Device> = Arc::downgrade(&self.device);
        self.device.add_callback(
            move |data| record(&observations, &device, index, data),
            move || {
                *finished
                    .finished
                    .lock()
                    .expect("finished lock")
                    .entry(index)
                    .or_default() += 1;
            },
        );
        self.subscribers = self.subscribers.max(index);
    }

    fn deliver(&mut self, count: usize) {
        for _ in 0..count {
            let sample =
                Data::new(Address::singleton("arm"), "joint-state").with_seq(self.next_seq);
            self.next_seq += 1;
            self.device.deliver(&sample);
        }
    }
}

fn record(
    observations: &Arc<Observations>,
    device: &Weak<Device>,
    index: usize,
    data: &Data,
) -> Flow {
    let seen = {
        let mut log = observations.log.lock().expect("log lock");
        log.push((index, data.seq.unwrap_or_default()));
        log.iter().filter(|(subscriber, _)| *subscriber == index).count()
    };
    let late = *observations.late_from.lock().expect("late lock") == Some(index);
    if late
        && seen == 1
        && let Some(live) = device.upgrade()
    {
        let counter = Arc::clone(observations);
        live.subscribe(move |_| {
            counter.late_seen.fetch_add(1, Ordering::SeqCst);
        });
    }
    let limit = observations
        .limits
        .lock()
        .expect("limits lock")
        .get(&index)
        .copied();
    if limit.is_some_and(|stop_at| seen >= stop_at) {
        Flow::StopAndFinish
    } else {
        Flow::Continue
    }
}

#[fixture]
fn world() -> RefCell<FanoutWorld> {
    RefCell::new(FanoutWorld::new())
}

#[given("a device with {count} recording subscribers")]
fn given_subscribers(world: &RefCell<FanoutWorld>, count: usize) {
    let mut world = world.borrow_mut();
    for index in 1..=count {
        world.add_subscriber(index);
    }
}

#[given("subscriber {index} stops after {limit} sample")]
fn given_limit(world: &RefCell<FanoutWorld>, index: usize, limit: usize) {
    world
        .borrow()
        .observations
        .limits
        .lock()
        .expect("limits lock")
        .insert(index, limit);
}

#[given("subscriber {index} registers a late subscriber on its first sample")]
fn given_late_subscriber(world: &RefCell<FanoutWorld>, index: usize) {
    *world
        .borrow()
        .observations
        .late_from
        .lock()
        .expect("late lock") = Some(index);
}

#[when("{count} samples are delivered")]
fn when_delivered(world: &RefCell<FanoutWorld>, count: usize) {
    world.borrow_mut().deliver(count);
}

#[when("the device is closed")]
fn when_closed(world: &RefCell<FanoutWorld>) {
    world.borrow().device.close();
}

#[then("subscriber {index} saw {count} samples")]
fn then_saw(world: &RefCell<FanoutWorld>, index: usize, count: usize) {
    let seen = world.borrow().observations.seen_by(index);
    assert_eq!(seen.len(), count, "subscriber {index} saw {seen:?}");
}

#[then("subscriber {index} was finished {count} times")]
fn then_finished(world: &RefCell<FanoutWorld>, index: usize, count: usize) {
    assert_eq!(world.borrow().observations.finished_count(index), count);
}

#[then("every subscriber was finished once")]
fn then_all_finished(world: &RefCell<FanoutWorld>) {
    let world = world.borrow();
    for index in 1..=world.subscribers {
        assert_eq!(
            world.observations.finished_count(index),
            1,
            "subscriber {index} finished count"
        );
    }
}

#[then("every sample reached the subscribers in registration order")]
fn then_ordered(world: &RefCell<FanoutWorld>) {
    let world = world.borrow();
    let log = world.observations.log.lock().expect("log lock").clone();
    let expected: Vec<(usize, u64)> = (1..world.next_seq)
        .flat_map(|seq| (1..=world.subscribers).map(move |index| (index, seq)))
        .collect();
    assert_eq!(log, expected);
}

#[then("the late subscriber saw {count} samples")]
fn then_late_saw(world: &RefCell<FanoutWorld>, count: usize) {
    let seen = world.borrow().observations.late_seen.load(Ordering::SeqCst);
    assert_eq!(seen, count);
}

#[scenario(
    path = "tests/features/callback_fanout.feature",
    name = "Subscribers see samples in registration order"
)]
fn registration_order(world: RefCell<FanoutWorld>) {
    let _ = world;
}

#[scenario(
    path = "tests/features/callback_fanout.feature",
    name = "A subscriber that stops is finished once"
)]
fn stop_and_finish(world: RefCell<FanoutWorld>) {
    let _ = world;
}

#[scenario(
    path = "tests/features/callback_fanout.feature",
    name = "Closing the device finishes every subscriber"
)]
fn close_finishes(world: RefCell<FanoutWorld>) {
    let _ = world;
}

#[scenario(
    path = "tests/features/callback_fanout.feature",
    name = "A subscriber added during delivery waits for the next sample"
)]
fn late_subscriber(world: RefCell<FanoutWorld>) {
    let _ = world;
}
