//! Prefixed, optionally colorized and timestamped line output for the four
//! stream kinds the watcher ever prints.
//!
//! Mirrors `LogFormat`/`TaskKey._log` in the source tool: a prefix built
//! from a (by default 6-character-truncated) allocation id, group, and task
//! name, followed by a single `A`/`E`/`O` stream marker. Allocation-event
//! lines always carry their own timestamp inline after the marker; with
//! `--log-timestamp` that timestamp instead moves to the front of every
//! line, stdout/stderr included.

use chrono::{DateTime, Utc};
use colored::{Color, Colorize};

use crate::tasks::TaskKey;
use crate::types::{Options, StreamKind};

const DEFAULT_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%z";

/// Renders the four line kinds into a single ordered, prefixed stdout
/// stream, honoring the presentation toggles carried on [`Options`].
#[derive(Debug, Clone)]
pub struct OutputFormatter {
    streams: Vec<StreamKind>,
    color: bool,
    log_timestamp: bool,
    timestamp_format: String,
    show_group: bool,
    show_task: bool,
    long_alloc: bool,
    only_task: bool,
    none: bool,
}

impl OutputFormatter {
    /// Builds a formatter from the resolved options. `color` is passed
    /// separately since it depends on terminal detection the options
    /// record itself does not perform.
    pub fn new(options: &Options, color: bool) -> Self {
        OutputFormatter {
            streams: options.streams.clone(),
            color,
            log_timestamp: options.log_timestamp,
            timestamp_format: options
                .log_timestamp_format
                .clone()
                .unwrap_or_else(|| DEFAULT_TIMESTAMP_FORMAT.to_string()),
            show_group: !options.log_no_group,
            show_task: !options.log_no_task,
            long_alloc: options.log_long_alloc,
            only_task: options.log_only_task,
            none: options.log_none,
        }
    }

    fn enabled(&self, kind: StreamKind) -> bool {
        self.streams.contains(&kind)
    }

    fn short(&self, id: &str) -> &str {
        if self.long_alloc {
            id
        } else {
            let end = id.char_indices().nth(6).map(|(i, _)| i).unwrap_or(id.len());
            &id[..end]
        }
    }

    /// The `allocid:group:task:` (or reduced) segment that precedes the
    /// stream marker. Empty under `--log-none`.
    fn identity_prefix(&self, key: &TaskKey) -> String {
        if self.none {
            return String::new();
        }
        if self.only_task {
            return format!("{}:", key.task);
        }
        let mut parts = vec![self.short(&key.alloc_id).to_string()];
        if self.show_group {
            parts.push(key.group.clone());
        }
        if self.show_task {
            parts.push(key.task.clone());
        }
        format!("{}:", parts.join(":"))
    }

    fn leading_timestamp(&self, now: DateTime<Utc>) -> String {
        if self.log_timestamp {
            format!("{}:", now.format(&self.timestamp_format))
        } else {
            String::new()
        }
    }

    fn emit(&self, body: String, color: Color) {
        use std::io::Write;
        let rendered = if self.color { body.color(color).to_string() } else { body };
        println!("{rendered}");
        let _ = std::io::stdout().flush();
    }

    /// `<EVALID:.6>:eval <message>`.
    pub fn print_eval(&self, eval_id: &str, message: &str) {
        if !self.enabled(StreamKind::Eval) {
            return;
        }
        let short = self.short(eval_id);
        self.emit(format!("{short}:eval {message}"), Color::Blue);
    }

    /// `<prefix>A [<timestamp>] <kind> <display-message>`. `event_time_ns`
    /// is the allocation event's own nanosecond timestamp and is always
    /// shown inline unless `--log-timestamp` moved timestamps to the
    /// line's front, in which case it is shown there instead.
    pub fn print_alloc(&self, key: &TaskKey, event_time_ns: i64, kind: &str, display_message: &str) {
        if !self.enabled(StreamKind::Alloc) {
            return;
        }
        let now = DateTime::<Utc>::from_timestamp(event_time_ns / 1_000_000_000, 0).unwrap_or_else(Utc::now);
        let front = self.leading_timestamp(now);
        let prefix = self.identity_prefix(key);
        let inline_ts = if self.log_timestamp {
            String::new()
        } else {
            format!(" {}", now.format(&self.timestamp_format))
        };
        let message = if display_message.is_empty() { kind.to_string() } else { format!("{kind} {display_message}") };
        self.emit(format!("{front}{prefix}A{inline_ts} {message}"), Color::Cyan);
    }

    /// `<prefix>O <line>`.
    pub fn print_stdout(&self, key: &TaskKey, line: &str) {
        if !self.enabled(StreamKind::Stdout) {
            return;
        }
        let front = self.leading_timestamp(Utc::now());
        let prefix = self.identity_prefix(key);
        println!("{front}{prefix}O {line}");
        use std::io::Write;
        let _ = std::io::stdout().flush();
    }

    /// `<prefix>E <line>`.
    pub fn print_stderr(&self, key: &TaskKey, line: &str) {
        if !self.enabled(StreamKind::Stderr) {
            return;
        }
        let front = self.leading_timestamp(Utc::now());
        let prefix = self.identity_prefix(key);
        self.emit(format!("{front}{prefix}E {line}"), Color::Yellow);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Options;

    fn key() -> TaskKey {
        TaskKey { alloc_id: "abcdef0123456789".into(), group: "g".into(), task: "t".into() }
    }

    fn opts() -> Options {
        Options { streams: vec![StreamKind::Eval, StreamKind::Alloc, StreamKind::Stdout, StreamKind::Stderr], ..Options::default() }
    }

    #[test]
    fn short_alloc_truncates_to_six_chars_by_default() {
        let f = OutputFormatter::new(&opts(), false);
        assert_eq!(f.short(&key().alloc_id), "abcdef");
    }

    #[test]
    fn long_alloc_keeps_full_id() {
        let mut o = opts();
        o.log_long_alloc = true;
        let f = OutputFormatter::new(&o, false);
        assert_eq!(f.short(&key().alloc_id), "abcdef0123456789");
    }

    #[test]
    fn identity_prefix_respects_group_task_suppression() {
        let mut o = opts();
        o.log_no_group = true;
        let f = OutputFormatter::new(&o, false);
        assert_eq!(f.identity_prefix(&key()), "abcdef:t:");
    }

    #[test]
    fn only_task_reduces_prefix_to_task_name() {
        let mut o = opts();
        o.log_only_task = true;
        let f = OutputFormatter::new(&o, false);
        assert_eq!(f.identity_prefix(&key()), "t:");
    }

    #[test]
    fn log_none_produces_empty_prefix() {
        let mut o = opts();
        o.log_none = true;
        let f = OutputFormatter::new(&o, false);
        assert_eq!(f.identity_prefix(&key()), "");
    }

    #[test]
    fn disabled_stream_is_a_silent_no_op() {
        let mut o = opts();
        o.streams = vec![StreamKind::Stdout];
        let f = OutputFormatter::new(&o, false);
        assert!(!f.enabled(StreamKind::Eval));
        assert!(f.enabled(StreamKind::Stdout));
    }
}
