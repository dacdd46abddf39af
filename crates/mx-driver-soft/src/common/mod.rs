//! Infrastructure shared by the soft drivers.
//!
//! - **faults**: error injection for driving GET/PUT failure paths in tests
//! - **rng**: seeded random numbers for noise and random failures

pub mod faults;
pub mod rng;

pub use faults::FaultInjector;
pub use rng::SoftRng;
