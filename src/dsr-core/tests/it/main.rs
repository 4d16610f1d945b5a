//! Consolidated integration tests for dsr-core.
//!
//! One test binary instead of one per file keeps link times down and lets
//! the modules share fakes.

mod flows;
mod support;
mod wire;
