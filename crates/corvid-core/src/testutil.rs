//! Test utilities for corvid
//!
//! Helpers that run a snippet in a fresh VM and render the results as
//! strings, so tests can compare against plain literals.

use crate::vm::{OutputCapture, VM};

/// Result type for test helpers
pub type TestResult<T> = Result<T, String>;

/// Run `source` in a new VM with the standard library and render every
/// returned value the way `print` would (strings without quotes)
///
/// # Errors
/// Returns the error message if compilation or execution fails
pub fn run(source: &str) -> TestResult<Vec<String>> {
    let mut vm = VM::new();
    run_in(&mut vm, source)
}

/// Like [`run`], on an existing VM
///
/// # Errors
/// Returns the error message if compilation or execution fails
pub fn run_in(vm: &mut VM, source: &str) -> TestResult<Vec<String>> {
    let n = vm.do_string(source).map_err(|e| e.to_string())?;
    let top = vm.top();
    let values = (top - n + 1..=top)
        .map(|i| vm.display_value(vm.read(i as i32)))
        .collect();
    vm.set_top(top - n);
    Ok(values)
}

/// Run `source` and return its error message
///
/// # Panics
/// Panics if the snippet succeeds
pub fn run_err(source: &str) -> String {
    match run(source) {
        Ok(values) => panic!("expected an error, got {values:?}"),
        Err(message) => message,
    }
}

/// Run `source` and return the lines it printed
///
/// # Errors
/// Returns the error message if compilation or execution fails
pub fn run_output(source: &str) -> TestResult<Vec<String>> {
    let mut vm = VM::new();
    let capture = OutputCapture::new();
    vm.set_output(capture.clone());
    vm.do_string(source).map_err(|e| e.to_string())?;
    Ok(capture.take())
}
