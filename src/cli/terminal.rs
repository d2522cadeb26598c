//! Terminal capability detection and styling

use std::sync::OnceLock;

use owo_colors::{colors::css, OwoColorize};

/// Whether stdout accepts colour. Detected once per process.
pub fn supports_color() -> bool {
    static SUPPORTED: OnceLock<bool> = OnceLock::new();
    *SUPPORTED.get_or_init(|| supports_color::on(supports_color::Stream::Stdout).is_some())
}

/// Whether the terminal is too narrow to show node ids beside titles.
pub fn is_narrow() -> bool {
    terminal_size::terminal_size().is_some_and(|(width, _)| width.0 < 60)
}

fn styled(text: &str, style: impl FnOnce(&str) -> String) -> String {
    if supports_color() {
        style(text)
    } else {
        text.to_string()
    }
}

/// Extension trait for colorizing output
pub trait Colorize {
    /// Green, for completed actions.
    fn success(&self) -> String;
    /// Amber, for anything the user should double-check.
    fn warning(&self) -> String;
    /// Blue, for group operators.
    fn info(&self) -> String;
    /// Red and struck through, for excluded nodes.
    fn negated(&self) -> String;
    /// Dimmed, for ids and counts.
    fn dim(&self) -> String;
}

impl Colorize for str {
    fn success(&self) -> String {
        styled(self, |s| s.fg::<css::Green>().to_string())
    }

    fn warning(&self) -> String {
        styled(self, |s| s.fg::<css::Orange>().to_string())
    }

    fn info(&self) -> String {
        styled(self, |s| s.fg::<css::LightBlue>().bold().to_string())
    }

    fn negated(&self) -> String {
        styled(self, |s| s.fg::<css::IndianRed>().strikethrough().to_string())
    }

    fn dim(&self) -> String {
        styled(self, |s| s.dimmed().to_string())
    }
}

impl Colorize for String {
    fn success(&self) -> String {
        self.as_str().success()
    }

    fn warning(&self) -> String {
        self.as_str().warning()
    }

    fn info(&self) -> String {
        self.as_str().info()
    }

    fn negated(&self) -> String {
        self.as_str().negated()
    }

    fn dim(&self) -> String {
        self.as_str().dim()
    }
}
