//! Test suites for the tether engine.

mod correlation_behaviour;
mod fanout_behaviour;
mod host_api;
mod support;
