//! Copy progress accounting and reporting.

pub mod progress;
