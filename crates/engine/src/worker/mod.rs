//! Backpressure support shared by the [`crate::dispatcher::JobDispatcher`].
//!
//! A remote-queue poller claiming rows across a fleet of worker processes
//! needs its own module; a single in-process dispatcher (see
//! `dispatcher`) does not, so only the load-aware acceptance policy lives
//! here.

mod backpressure;

pub use backpressure::{BackpressureConfig, BackpressureError, BackpressureState};
