//! Integration test driver for the `tests/integration/` submodules.
//!
//! Each `mod` below maps to a file that exercises one slice of the
//! supervisor against the in-memory doubles in [`mock_hw`].  All tests run
//! on the host with no real hardware required.

// Links the host embassy-time driver that async-io-mini timers need.
#[cfg(not(target_os = "espidf"))]
extern crate embassy_time;

mod bringup_tests;
mod mock_hw;
mod ops_tests;
mod scenario_tests;
