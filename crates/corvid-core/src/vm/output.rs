//! Destination for script `print` output
//!
//! The VM writes every `print` line to an [`OutputSink`]. The default sink
//! is stdout; [`OutputCapture`] collects lines so tests and embedders can
//! inspect them.

use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

pub trait OutputSink {
    fn write_line(&mut self, line: &str);
}

/// Writes to the process stdout
#[derive(Debug, Default)]
pub struct StdoutSink;

impl OutputSink for StdoutSink {
    fn write_line(&mut self, line: &str) {
        let mut out = std::io::stdout().lock();
        let _ = writeln!(out, "{line}");
    }
}

/// Captured output lines, shared between the VM and the caller
#[derive(Debug, Clone, Default)]
pub struct OutputCapture {
    lines: Rc<RefCell<Vec<String>>>,
}

impl OutputCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// A copy of everything printed so far
    pub fn lines(&self) -> Vec<String> {
        self.lines.borrow().clone()
    }

    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.lines.borrow_mut())
    }
}

impl OutputSink for OutputCapture {
    fn write_line(&mut self, line: &str) {
        self.lines.borrow_mut().push(line.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_is_shared() {
        let capture = OutputCapture::new();
        let mut sink: Box<dyn OutputSink> = Box::new(capture.clone());
        sink.write_line("hello");
        sink.write_line("world");
        assert_eq!(capture.lines(), vec!["hello", "world"]);
        assert_eq!(capture.take().len(), 2);
        assert!(capture.lines().is_empty());
    }
}
