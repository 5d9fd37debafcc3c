//! Test suites for daemon supervision.

mod support;
