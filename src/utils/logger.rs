// Not every helper is wired up in every build; keep the full set
#![allow(dead_code)]

use std::env;
use std::io::{self, Write as _};

/// ANSI color codes for terminal output
pub struct Colors;

impl Colors {
    /// Primary actions/success
    pub const MAIN: &'static str = "\x1b[38;2;95;173;235m";
    /// Info/progress
    pub const SECONDARY: &'static str = "\x1b[38;2;74;155;217m";
    /// Technical details
    pub const DIM_GRAY: &'static str = "\x1b[38;2;128;128;128m";
    /// Errors
    pub const ERROR: &'static str = "\x1b[38;2;255;59;48m";
    /// Warnings
    pub const WARNING: &'static str = "\x1b[38;2;255;149;0m";
    /// Reset all formatting
    pub const RESET: &'static str = "\x1b[0m";
}

/// Unicode symbols for different message types
pub struct Symbols;

impl Symbols {
    pub const SUCCESS: &'static str = "✓";
    pub const ERROR: &'static str = "✗";
    pub const WARNING: &'static str = "!";
    pub const INFO: &'static str = "ℹ";
    pub const ARROW: &'static str = "→";
    pub const BULLET: &'static str = "•";
}

/// Clean single-channel logger for the conversion pipeline
pub struct Logger;

impl Logger {
    /// Log a success message (blue checkmark)
    pub fn success(message: &str) {
        if is_quiet_mode() {
            return;
        }
        println!("{}{} {}{}", Colors::MAIN, Symbols::SUCCESS, message, Colors::RESET);
    }

    /// Log an error message (red X) to stderr
    pub fn error(message: &str) {
        eprintln!("{}{} {}{}", Colors::ERROR, Symbols::ERROR, message, Colors::RESET);
    }

    /// Log a warning message (orange exclamation)
    pub fn warning(message: &str) {
        if is_quiet_mode() {
            return;
        }
        println!("{}{} {}{}", Colors::WARNING, Symbols::WARNING, message, Colors::RESET);
    }

    /// Log an info message (blue info icon)
    pub fn info(message: &str) {
        if is_quiet_mode() {
            return;
        }
        println!("{}{} {}{}", Colors::SECONDARY, Symbols::INFO, message, Colors::RESET);
    }

    /// Log a debug message (only shown if FLATPOD_DEBUG=1)
    pub fn debug(message: &str) {
        if is_verbose_mode() {
            println!("{}{} {}{}", Colors::DIM_GRAY, Symbols::BULLET, message, Colors::RESET);
        }
    }

    /// Display a key-value detail line (indented, dimmed label with colored value)
    pub fn detail(label: &str, value: &str) {
        if is_quiet_mode() {
            return;
        }
        println!(
            "  {}{}{} {} {}{}{}",
            Colors::DIM_GRAY,
            label,
            Colors::RESET,
            Symbols::ARROW,
            Colors::SECONDARY,
            value,
            Colors::RESET
        );
    }

    /// Display an error with a suggestion
    pub fn error_with_hint(error: &str, hint: &str) {
        eprintln!("{}{} {}{}", Colors::ERROR, Symbols::ERROR, error, Colors::RESET);
        eprintln!("  {}{} {}{}", Colors::DIM_GRAY, Symbols::ARROW, hint, Colors::RESET);
    }
}

/// Single-line incremental status renderer for long-running steps.
///
/// Redraws one line in place on every update; `finish()` terminates the
/// line with a newline.
pub struct Progress {
    label: String,
    count: u64,
    active: bool,
}

impl Progress {
    pub fn new(label: &str) -> Self {
        Progress {
            label: label.to_string(),
            count: 0,
            active: !is_quiet_mode(),
        }
    }

    /// Advance the counter by one and redraw the line.
    pub fn tick(&mut self) {
        self.count += 1;
        if !self.active {
            return;
        }
        print!(
            "\r\x1b[K{}{} {}: {}{}",
            Colors::SECONDARY,
            Symbols::INFO,
            self.label,
            self.count,
            Colors::RESET
        );
        io::stdout().flush().ok();
    }

    /// Replace the trailing status text and redraw the line.
    pub fn set_message(&mut self, message: &str) {
        if !self.active {
            return;
        }
        print!(
            "\r\x1b[K{}{} {}: {}{}",
            Colors::SECONDARY,
            Symbols::INFO,
            self.label,
            message,
            Colors::RESET
        );
        io::stdout().flush().ok();
    }

    /// Terminate the status line with a newline.
    pub fn finish(self) {
        if self.active && self.count > 0 {
            println!();
        }
    }
}

/// Check if we should suppress output (for --quiet mode)
pub fn is_quiet_mode() -> bool {
    env::var("FLATPOD_QUIET").is_ok()
}

/// Check if we should show verbose output
pub fn is_verbose_mode() -> bool {
    env::var("FLATPOD_VERBOSE").is_ok() || env::var("FLATPOD_DEBUG").is_ok()
}

/// Check if colors should be disabled
pub fn should_use_colors() -> bool {
    env::var("NO_COLOR").is_err() && console::Term::stdout().is_term()
}
