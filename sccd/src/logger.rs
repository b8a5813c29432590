// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! In-process log capture. A `tracing` layer formats every event into one
//! line and stores it in a bounded buffer, so that clients issuing `Log.`
//! can receive history and then follow along live.

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex};

use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

/// Total bytes of history kept; oldest lines are dropped first.
const BUFFER_SIZE: usize = 20480;

#[derive(Default)]
pub struct LogBuffer {
    lines: VecDeque<String>,
    used: usize,
    fresh: Vec<String>,
}

impl LogBuffer {
    fn push(&mut self, line: String) {
        if line.len() >= BUFFER_SIZE {
            return;
        }

        while self.used + line.len() > BUFFER_SIZE {
            match self.lines.pop_front() {
                Some(old) => self.used -= old.len(),
                None => break,
            }
        }

        self.used += line.len();
        self.lines.push_back(line.clone());
        self.fresh.push(line);
    }

    pub fn history(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }

    /// Lines accumulated since the last call. The mainloop drains these once
    /// per tick and fans them out to subscribed clients.
    pub fn take_fresh(&mut self) -> Vec<String> {
        std::mem::take(&mut self.fresh)
    }
}

pub type LogSink = Arc<Mutex<LogBuffer>>;

pub fn new_sink() -> LogSink {
    Arc::new(Mutex::new(LogBuffer::default()))
}

pub struct CaptureLayer {
    sink: LogSink,
}

impl CaptureLayer {
    pub fn new(sink: LogSink) -> Self {
        CaptureLayer { sink }
    }
}

#[derive(Default)]
struct LineVisitor {
    message: String,
    rest: String,
}

impl Visit for LineVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{:?}", value);
        } else {
            let _ = write!(self.rest, " {}={:?}", field.name(), value);
        }
    }
}

fn level_tag(level: &Level) -> &'static str {
    match *level {
        Level::ERROR => "E",
        Level::WARN => "W",
        Level::INFO => "L",
        Level::DEBUG => "D",
        Level::TRACE => "D",
    }
}

impl<S: Subscriber> Layer<S> for CaptureLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = LineVisitor::default();
        event.record(&mut visitor);

        let meta = event.metadata();
        let line = format!(
            "{} {} {}{}",
            level_tag(meta.level()),
            meta.target(),
            visitor.message,
            visitor.rest,
        );
        self.sink.lock().unwrap().push(line);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn history_and_fresh() {
        let mut buf = LogBuffer::default();
        buf.push("one".to_owned());
        buf.push("two".to_owned());

        assert_eq!(buf.history(), vec!["one", "two"]);
        assert_eq!(buf.take_fresh(), vec!["one", "two"]);
        assert_eq!(buf.take_fresh(), Vec::<String>::new());
        assert_eq!(buf.history(), vec!["one", "two"]);
    }

    #[test]
    fn old_lines_rotate_out() {
        let mut buf = LogBuffer::default();
        let chunk = "x".repeat(BUFFER_SIZE / 4);
        for _ in 0..8 {
            buf.push(chunk.clone());
        }

        assert!(buf.used <= BUFFER_SIZE);
        assert_eq!(buf.history().len(), 4);
    }

    #[test]
    fn captures_tracing_events() {
        use tracing_subscriber::layer::SubscriberExt;

        let sink = new_sink();
        let subscriber =
            tracing_subscriber::registry().with(CaptureLayer::new(sink.clone()));

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("hello from the daemon");
        });

        let history = sink.lock().unwrap().history();
        assert_eq!(history.len(), 1);
        assert!(history[0].starts_with("L "));
        assert!(history[0].contains("hello from the daemon"));
    }
}
