//! Console output: a serialized sink, per-package colors, prefixed writers.

use colored::{Color, Colorize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Single console sink. Writes take the lock so concurrent tasks never
/// interleave mid-line.
#[derive(Debug, Default)]
pub struct Ui {
    lock: Mutex<()>,
}

impl Ui {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn output(&self, msg: &str) {
        let _guard = self.lock.lock().unwrap();
        println!("{msg}");
    }

    pub fn info(&self, msg: &str) {
        let _guard = self.lock.lock().unwrap();
        println!("{}", msg.dimmed());
    }

    pub fn warn(&self, msg: &str) {
        let _guard = self.lock.lock().unwrap();
        eprintln!("{} {}", "WARNING".yellow().bold(), msg);
    }

    pub fn error(&self, msg: &str) {
        let _guard = self.lock.lock().unwrap();
        eprintln!("{} {}", "ERROR".red().bold(), msg);
    }
}

const PREFIX_PALETTE: [Color; 5] = [
    Color::Cyan,
    Color::Magenta,
    Color::Green,
    Color::Yellow,
    Color::Blue,
];

/// Assigns each package a stable color from a fixed palette, in first-seen
/// order.
#[derive(Debug, Default)]
pub struct ColorCache {
    state: Mutex<ColorCacheState>,
}

#[derive(Debug, Default)]
struct ColorCacheState {
    next: usize,
    assigned: HashMap<String, Color>,
}

impl ColorCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn color_for(&self, key: &str) -> Color {
        let mut state = self.state.lock().unwrap();
        if let Some(color) = state.assigned.get(key) {
            return *color;
        }
        let color = PREFIX_PALETTE[state.next % PREFIX_PALETTE.len()];
        state.next += 1;
        state.assigned.insert(key.to_string(), color);
        color
    }

    /// A colored `pkg:task: ` prefix, or empty when prefixes are off.
    pub fn prefix_with_color(&self, package: &str, prefix: &str) -> String {
        if prefix.is_empty() {
            return String::new();
        }
        format!("{}: ", prefix.color(self.color_for(package)))
    }
}

/// A `Ui` handle that prepends a task's prefix to every line.
#[derive(Clone)]
pub struct PrefixedUi {
    ui: Arc<Ui>,
    prefix: String,
}

impl PrefixedUi {
    pub fn new(ui: Arc<Ui>, prefix: String) -> Self {
        Self { ui, prefix }
    }

    pub fn output(&self, msg: &str) {
        self.ui.output(&format!("{}{}", self.prefix, msg));
    }

    pub fn warn(&self, msg: &str) {
        self.ui.warn(&format!("{}{}", self.prefix, msg));
    }

    pub fn error(&self, msg: &str) {
        self.ui.error(&format!("{}{}", self.prefix, msg));
    }
}
