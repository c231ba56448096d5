//! Terminal rendering of container output
//!
//! [`TerminalSink`] receives the demultiplexed payload of every container
//! the run starts and prints it as it arrives, flushing after each write.
//! It remembers whether the last byte written was a newline so headers and
//! separators never get glued onto a partial line of container output.
//!
//! # Example
//!
//! ```no_run
//! use insulate::cli::terminal_output::TerminalSink;
//! use insulate::engine::OutputSink;
//!
//! let sink = TerminalSink::new();
//! sink.print_step_header(1, 3, "build");
//! sink.write_output(b"compiling...\n");
//! sink.print_separator();
//! ```

use crate::engine::OutputSink;
use console::style;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};

/// Prints container output to stdout
#[derive(Debug)]
pub struct TerminalSink {
    /// True when the cursor sits at the start of a line
    at_line_start: AtomicBool,
}

impl Default for TerminalSink {
    fn default() -> Self {
        Self::new()
    }
}

impl TerminalSink {
    pub fn new() -> Self {
        Self {
            at_line_start: AtomicBool::new(true),
        }
    }

    /// Print a step header
    ///
    /// Format: `[N/M] Step Name`
    pub fn print_step_header(&self, index: usize, total: usize, name: &str) {
        self.finish_line();
        println!(
            "\n[{} / {}] {}\n",
            style(index).cyan(),
            style(total).dim(),
            style(name).bold()
        );
    }

    /// Print a horizontal rule spanning the terminal width
    pub fn print_separator(&self) {
        self.finish_line();
        println!("{}", separator(terminal_width()));
    }

    /// Terminate a partial line left by container output
    pub fn finish_line(&self) {
        if !self.at_line_start.swap(true, Ordering::SeqCst) {
            println!();
        }
    }
}

impl OutputSink for TerminalSink {
    fn write_output(&self, bytes: &[u8]) {
        let Some(last) = bytes.last() else {
            return;
        };
        let mut stdout = io::stdout().lock();
        let _ = stdout.write_all(bytes);
        let _ = stdout.flush();
        self.at_line_start.store(*last == b'\n', Ordering::SeqCst);
    }
}

/// Width of stdout, 80 when it is not a terminal
pub fn terminal_width() -> usize {
    term_size::dimensions_stdout().map(|(w, _)| w).unwrap_or(80)
}

fn separator(width: usize) -> String {
    "─".repeat(width)
}
