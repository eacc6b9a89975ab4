//! Tracing layer appending one ISO-8601 stamped line per event to a log file.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

pub struct FileLogLayer {
    file: Mutex<File>,
}

impl FileLogLayer {
    /// Open `path` for appending, creating parent directories as needed.
    pub fn new(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

/// Flattens an event into `message, key = value, ...`.
#[derive(Default)]
struct LineVisitor {
    line: String,
}

impl LineVisitor {
    fn push(&mut self, name: &str, value: String) {
        if name == "message" {
            if self.line.is_empty() {
                self.line = value;
            } else {
                self.line = format!("{value}, {}", self.line);
            }
            return;
        }
        if !self.line.is_empty() {
            self.line.push_str(", ");
        }
        self.line.push_str(&format!("{name} = {value}"));
    }
}

impl Visit for LineVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.push(field.name(), format!("{value:?}"));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.push(field.name(), value.to_string());
    }
}

impl<S: Subscriber> Layer<S> for FileLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        let mut visitor = LineVisitor::default();
        event.record(&mut visitor);

        let line = format!(
            "[{}] {:>5} {}: {}\n",
            chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z"),
            meta.level(),
            meta.target(),
            visitor.line
        );

        if let Ok(mut file) = self.file.lock() {
            let _ = file.write_all(line.as_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_visitor_puts_message_first() {
        let mut v = LineVisitor::default();
        v.push("event", "peer_discovered".into());
        v.push("message", "Peer discovered".into());
        v.push("peer", "abc".into());
        assert_eq!(v.line, "Peer discovered, event = peer_discovered, peer = abc");
    }
}
