//! Per-task log following: frames flat JSON objects off a byte stream,
//! base64-decodes their `Data` field into lines, and applies the "last N
//! lines" quiet-window tail heuristic before streaming line-by-line.
//!
//! The retry/backoff shape of `spawn_log_streamer` mirrors
//! `run_worker_task`/`submit_witness` in the teacher engine's `worker.rs`:
//! a loop receiving from a channel, a rate-limited warning on repeated
//! failures, and a cooperative stop flag checked at every keep-alive.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use futures_util::StreamExt;
use tokio::sync::mpsc;

use crate::client::SchedulerClient;
use crate::error::WatchError;

/// Extracts every complete `{...}` JSON object currently available at the
/// front of `buf`, consuming their bytes (plus surrounding whitespace) and
/// leaving any trailing partial object in place for the next call.
fn extract_objects(buf: &mut Vec<u8>) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    loop {
        let start = buf.iter().position(|b| !b.is_ascii_whitespace());
        let Some(start) = start else {
            buf.clear();
            break;
        };
        if start > 0 {
            buf.drain(..start);
        }
        let mut depth = 0i32;
        let mut end = None;
        for (i, &b) in buf.iter().enumerate() {
            match b {
                b'{' => depth += 1,
                b'}' => {
                    depth -= 1;
                    if depth == 0 {
                        end = Some(i);
                        break;
                    }
                }
                _ => {}
            }
        }
        match end {
            Some(i) => out.push(buf.drain(..=i).collect()),
            None => break,
        }
    }
    out
}

/// Decodes one framed log-stream object into its newline-split lines, or
/// `None` for an empty keep-alive object.
fn decode_chunk_lines(object: &[u8]) -> Result<Option<Vec<String>>, WatchError> {
    let value: serde_json::Value =
        serde_json::from_slice(object).map_err(|e| WatchError::MalformedChunk(e.to_string()))?;
    let Some(data) = value.get("Data").and_then(serde_json::Value::as_str) else {
        return Ok(None);
    };
    let bytes = B64.decode(data).map_err(|e| WatchError::MalformedChunk(e.to_string()))?;
    let text = String::from_utf8_lossy(&bytes);
    Ok(Some(text.lines().map(str::to_string).collect()))
}

/// Buffers lines during an initial quiet window, replacing the buffer with
/// each new batch (trimmed to a line cap) until the window expires or the
/// task finishes, then flushes and lets lines through one at a time.
pub struct TailWindow {
    deadline: Instant,
    cap: Option<usize>,
    buf: VecDeque<String>,
    expired: bool,
}

impl TailWindow {
    /// Starts a new window. A zero-length window behaves as if already expired.
    pub fn new(quiet_window: Duration, cap: Option<usize>) -> Self {
        TailWindow { deadline: Instant::now() + quiet_window, cap, buf: VecDeque::new(), expired: quiet_window.is_zero() }
    }

    /// Feeds one line; returns the lines that should be emitted now (empty
    /// while still inside the quiet window).
    pub fn feed(&mut self, line: String) -> Vec<String> {
        if self.expired {
            return vec![line];
        }
        self.buf.push_back(line);
        if let Some(cap) = self.cap {
            while self.buf.len() > cap {
                self.buf.pop_front();
            }
        }
        if Instant::now() >= self.deadline {
            self.expired = true;
            return self.buf.drain(..).collect();
        }
        Vec::new()
    }

    /// Forces an immediate flush, used when the task reaches `dead` before
    /// the quiet window naturally expires.
    pub fn flush(&mut self) -> Vec<String> {
        if self.expired {
            return Vec::new();
        }
        self.expired = true;
        self.buf.drain(..).collect()
    }
}

/// A running log follower. Dropping the handle does not stop the task;
/// call `stop()` (or let the owning `AllocationWorkers`' grace timer do it).
pub struct LogStreamerHandle {
    stop: Arc<AtomicBool>,
    join: tokio::task::JoinHandle<()>,
}

impl LogStreamerHandle {
    /// Requests the streamer stop at its next keep-alive or line boundary.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Waits for the streamer task to exit.
    pub async fn join(self) {
        let _ = self.join.await;
    }
}

/// Opens a follow stream for one task's stdout or stderr and forwards
/// decoded lines to `sink` until stopped, the task's grace period elapses,
/// or the upstream stream closes.
pub fn spawn_log_streamer(
    client: SchedulerClient,
    alloc_id: String,
    task: String,
    log_type: &'static str,
    tail: bool,
    quiet_window: Duration,
    lines_cap: Option<usize>,
    sink: mpsc::UnboundedSender<String>,
) -> LogStreamerHandle {
    let stop = Arc::new(AtomicBool::new(false));
    let stop_inner = Arc::clone(&stop);

    let join = tokio::spawn(async move {
        let mut window = TailWindow::new(quiet_window, lines_cap);
        let mut attempt = 0u32;
        loop {
            if stop_inner.load(Ordering::SeqCst) {
                return;
            }
            match client.follow_log(&alloc_id, &task, log_type, tail).await {
                Ok(stream) => {
                    attempt = 0;
                    let mut stream = Box::pin(stream);
                    let mut carry: Vec<u8> = Vec::new();
                    loop {
                        if stop_inner.load(Ordering::SeqCst) {
                            for line in window.flush() {
                                let _ = sink.send(line);
                            }
                            return;
                        }
                        match stream.next().await {
                            Some(Ok(chunk)) => {
                                carry.extend_from_slice(&chunk);
                                for object in extract_objects(&mut carry) {
                                    match decode_chunk_lines(&object) {
                                        Ok(Some(lines)) => {
                                            for line in lines {
                                                for ready in window.feed(line) {
                                                    let _ = sink.send(ready);
                                                }
                                            }
                                        }
                                        Ok(None) => {}
                                        Err(e) => {
                                            tracing::warn!(error = %e, alloc = %alloc_id, task = %task, "malformed log-stream chunk, skipping");
                                        }
                                    }
                                }
                            }
                            Some(Err(e)) => {
                                tracing::warn!(error = %e, alloc = %alloc_id, task = %task, "log stream transport error, reconnecting");
                                break;
                            }
                            None => {
                                for line in window.flush() {
                                    let _ = sink.send(line);
                                }
                                return;
                            }
                        }
                    }
                }
                Err(e) => {
                    attempt += 1;
                    tracing::warn!(error = %e, alloc = %alloc_id, task = %task, attempt, "failed to open log stream");
                    if attempt >= 5 {
                        return;
                    }
                    tokio::time::sleep(Duration::from_millis(250 * attempt as u64)).await;
                }
            }
        }
    });

    LogStreamerHandle { stop, join }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_two_adjacent_objects_and_keeps_partial_tail() {
        let mut buf = br#"{"Data":"aGk="}{"Data":"Ynll"}{"partial"#.to_vec();
        let objs = extract_objects(&mut buf);
        assert_eq!(objs.len(), 2);
        assert_eq!(buf, br#"{"partial"#.to_vec());
    }

    #[test]
    fn empty_heartbeat_object_decodes_to_none() {
        assert!(decode_chunk_lines(b"{}").unwrap().is_none());
    }

    #[test]
    fn base64_data_decodes_into_lines() {
        let obj = br#"{"Data":"aGVsbG8Kd29ybGQ="}"#;
        let lines = decode_chunk_lines(obj).unwrap().unwrap();
        assert_eq!(lines, vec!["hello".to_string(), "world".to_string()]);
    }

    #[test]
    fn zero_length_window_passes_lines_through_immediately() {
        let mut w = TailWindow::new(Duration::ZERO, Some(10));
        assert_eq!(w.feed("a".to_string()), vec!["a".to_string()]);
    }

    #[test]
    fn window_buffers_and_caps_until_flushed() {
        let mut w = TailWindow::new(Duration::from_secs(60), Some(2));
        assert!(w.feed("a".to_string()).is_empty());
        assert!(w.feed("b".to_string()).is_empty());
        assert!(w.feed("c".to_string()).is_empty());
        let flushed = w.flush();
        assert_eq!(flushed, vec!["b".to_string(), "c".to_string()]);
    }

    #[test]
    fn flush_after_expiry_is_a_no_op() {
        let mut w = TailWindow::new(Duration::ZERO, None);
        w.feed("a".to_string());
        assert!(w.flush().is_empty());
    }
}
