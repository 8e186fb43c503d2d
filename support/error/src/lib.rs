/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Shared error-handling scaffolding used by every crate in this workspace:
//! the `define_error!` macro that builds a boxed `Error`/`Result` pair
//! around a crate's `ErrorKind`, the `ErrorHandling`/`GetErrorHandling`
//! helpers for deciding how an internal error should be logged and
//! reported, and an `ApplicationErrorReporter` hook so a host application
//! can learn about dead-lettered sync entries and other background
//! failures without the core panicking or going silent.

#[macro_use]
mod macros;
mod handling;
mod reporting;

pub use handling::{convert_log_report_error, ErrorHandling, ErrorReporting, GetErrorHandling};
pub use reporting::{
    report_breadcrumb, report_error_to_app, set_application_error_reporter,
    unset_application_error_reporter, ApplicationErrorReporter, ArcReporterAdapter,
    TestErrorReporter,
};

/// Initializes `env_logger` for tests; safe to call more than once (ignores
/// the "a logger has already been set" error every other test in the binary
/// produced).
pub fn init_test_logging() {
    let _ = env_logger::try_init();
}
