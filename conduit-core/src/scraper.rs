// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Worker output scraping.
//!
//! Workers report state as free text on stdout/stderr. Two markers form a
//! versioned contract with the relay engine wrapper:
//!
//! ```text
//! [OK] Connected to Psiphon network
//! <ts> [STATS] Connecting: <int> | Connected: <int> | Up: <float> <unit> | Down: <float> <unit> ...
//! ```
//!
//! Stats fields are matched independently, anywhere in the line, each as
//! `label ws* number` (counts) or `label ws* number ws* unit` (bytes). Every
//! other line is opaque.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio_util::sync::CancellationToken;

use crate::aggregator::Aggregate;
use crate::types::InstanceId;
use crate::units::{parse_byte_value, parse_count};

/// Printed once by a worker when it has joined the network.
pub const LIVENESS_MARKER: &str = "[OK] Connected to Psiphon network";

/// Present on every worker stats line.
pub const STATS_MARKER: &str = "[STATS]";

const CONNECTING_LABEL: &str = "Connecting:";
const CONNECTED_LABEL: &str = "Connected:";
const UP_LABEL: &str = "Up:";
const DOWN_LABEL: &str = "Down:";

/// Verbosity at which opaque worker lines are forwarded.
const FORWARD_VERBOSITY: u8 = 1;

/// Fields recovered from one stats line. `None` means "not reported".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsUpdate {
    pub connecting: Option<u64>,
    pub connected: Option<u64>,
    pub bytes_up: Option<i64>,
    pub bytes_down: Option<i64>,
}

impl StatsUpdate {
    pub fn is_empty(&self) -> bool {
        self.connecting.is_none()
            && self.connected.is_none()
            && self.bytes_up.is_none()
            && self.bytes_down.is_none()
    }
}

/// Classification of one worker output line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusLine {
    Live,
    Stats(StatsUpdate),
    Other,
}

impl StatusLine {
    pub fn classify(line: &str) -> Self {
        if line.contains(LIVENESS_MARKER) {
            Self::Live
        } else if line.contains(STATS_MARKER) {
            Self::Stats(parse_stats_fields(line))
        } else {
            Self::Other
        }
    }
}

/// Extract whichever of the four stats fields appear in `line`.
pub fn parse_stats_fields(line: &str) -> StatsUpdate {
    StatsUpdate {
        connecting: find_count(line, CONNECTING_LABEL),
        connected: find_count(line, CONNECTED_LABEL),
        bytes_up: find_bytes(line, UP_LABEL),
        bytes_down: find_bytes(line, DOWN_LABEL),
    }
}

/// First `label ws* digits` in the line. A digit run that does not fit
/// in a counter leaves the field unreported.
fn find_count(line: &str, label: &str) -> Option<u64> {
    line.match_indices(label).find_map(|(at, _)| {
        let rest = line[at + label.len()..].trim_start();
        let digits = leading(rest, |c| c.is_ascii_digit());
        (!digits.is_empty()).then_some(digits)
    })
    .and_then(parse_count)
}

/// First `label ws* [0-9.]+ ws* [KMGTPE]?B` in the line.
fn find_bytes(line: &str, label: &str) -> Option<i64> {
    line.match_indices(label).find_map(|(at, _)| {
        let rest = line[at + label.len()..].trim_start();
        let number = leading(rest, |c| c.is_ascii_digit() || c == '.');
        if number.is_empty() {
            return None;
        }
        let unit = unit_token(rest[number.len()..].trim_start())?;
        Some(parse_byte_value(number, unit))
    })
}

fn leading(s: &str, accept: impl Fn(char) -> bool) -> &str {
    let end = s.find(|c: char| !accept(c)).unwrap_or(s.len());
    &s[..end]
}

fn unit_token(s: &str) -> Option<&str> {
    let bytes = s.as_bytes();
    match bytes {
        [prefix, b'B', ..] if b"KMGTPE".contains(prefix) => Some(&s[..2]),
        [b'B', ..] => Some(&s[..1]),
        _ => None,
    }
}

/// What processing a line did, so callers can tell a banner from a repeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineOutcome {
    BecameLive,
    AlreadyLive,
    Stats { changed: bool },
    Forwarded,
    Suppressed,
}

/// Consumes one worker stream and feeds the shared aggregate.
#[derive(Clone)]
pub struct OutputScraper {
    instance: InstanceId,
    aggregate: Arc<Aggregate>,
    verbosity: u8,
    cancel: CancellationToken,
}

impl OutputScraper {
    pub fn new(
        instance: InstanceId,
        aggregate: Arc<Aggregate>,
        verbosity: u8,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            instance,
            aggregate,
            verbosity,
            cancel,
        }
    }

    /// Opaque lines are forwarded only when verbose and not shutting down.
    fn forwarding(&self) -> bool {
        self.verbosity >= FORWARD_VERBOSITY && !self.cancel.is_cancelled()
    }

    /// Apply one line to the aggregate and echo it as configured.
    pub async fn process_line(&self, line: &str) -> LineOutcome {
        match StatusLine::classify(line) {
            StatusLine::Live => {
                let newly_live = self
                    .aggregate
                    .update(self.instance, |stats| stats.mark_live())
                    .await
                    .unwrap_or(false);
                if !newly_live {
                    return LineOutcome::AlreadyLive;
                }
                self.aggregate.notify_changed();
                println!("[{}] Connected to Psiphon network", self.instance);
                LineOutcome::BecameLive
            }
            StatusLine::Stats(update) => {
                let changed = self
                    .aggregate
                    .update(self.instance, |stats| stats.apply(&update))
                    .await
                    .unwrap_or(false);
                if changed {
                    self.aggregate.notify_changed();
                }
                if self.forwarding() {
                    println!("[{}] {}", self.instance, line);
                }
                LineOutcome::Stats { changed }
            }
            StatusLine::Other => {
                if self.forwarding() {
                    println!("[{}] {}", self.instance, line);
                    LineOutcome::Forwarded
                } else {
                    LineOutcome::Suppressed
                }
            }
        }
    }

    /// Read `reader` line by line until end of stream.
    ///
    /// Invalid UTF-8 is replaced rather than rejected. A read error is
    /// reported with the instance prefix and ends the stream; the worker's
    /// exit status decides what happens next, not the stream.
    pub async fn consume<R>(self, reader: R)
    where
        R: AsyncRead + Unpin,
    {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::with_capacity(1024);

        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let text = String::from_utf8_lossy(&buf);
                    let line = text.trim_end_matches(['\n', '\r']);
                    self.process_line(line).await;
                }
                Err(e) => {
                    eprintln!("[{}] {}", self.instance, e);
                    break;
                }
            }
        }

        tracing::trace!(instance = %self.instance, "Worker stream closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scraper(verbosity: u8) -> (OutputScraper, Arc<Aggregate>) {
        let (aggregate, _changes) = Aggregate::new(1, true);
        let scraper = OutputScraper::new(
            InstanceId::new(0),
            aggregate.clone(),
            verbosity,
            CancellationToken::new(),
        );
        (scraper, aggregate)
    }

    #[test]
    fn test_parse_full_stats_line() {
        let update = parse_stats_fields("[STATS] Connecting: 3 Connected: 5 Up: 1.5 MB Down: 0 B");
        assert_eq!(
            update,
            StatsUpdate {
                connecting: Some(3),
                connected: Some(5),
                bytes_up: Some(1_572_864),
                bytes_down: Some(0),
            }
        );
    }

    #[test]
    fn test_parse_worker_formatted_line() {
        let line = "2025-01-01 10:00:00 [STATS] Connecting: 2 | Connected: 11 | Up: 3.2 GB | Down: 512 B | Uptime: 1h2m3s";
        let update = parse_stats_fields(line);
        assert_eq!(update.connecting, Some(2));
        assert_eq!(update.connected, Some(11));
        assert_eq!(update.bytes_up, Some((3.2 * 1024f64.powi(3)) as i64));
        assert_eq!(update.bytes_down, Some(512));
    }

    #[test]
    fn test_parse_partial_and_malformed_fields() {
        let update = parse_stats_fields("[STATS] Connected: 4 Up: lots Down: 2 KB");
        assert_eq!(update.connecting, None);
        assert_eq!(update.connected, Some(4));
        assert_eq!(update.bytes_up, None);
        assert_eq!(update.bytes_down, Some(2048));

        // Uptime must not be mistaken for Up.
        let update = parse_stats_fields("[STATS] Uptime: 5s");
        assert!(update.is_empty());

        // A number without a unit is not a byte field.
        let update = parse_stats_fields("[STATS] Up: 12");
        assert_eq!(update.bytes_up, None);
    }

    #[test]
    fn test_parse_skips_label_without_value() {
        let update = parse_stats_fields("[STATS] Connected: n/a, later Connected: 9");
        assert_eq!(update.connected, Some(9));
    }

    #[test]
    fn test_classify() {
        assert_eq!(
            StatusLine::classify("2025-01-01 [OK] Connected to Psiphon network"),
            StatusLine::Live
        );
        assert!(matches!(
            StatusLine::classify("[STATS] Connected: 1"),
            StatusLine::Stats(_)
        ));
        assert_eq!(StatusLine::classify("[INFO] hello"), StatusLine::Other);
    }

    #[tokio::test]
    async fn test_identical_stats_line_changes_once() {
        let (scraper, aggregate) = scraper(0);
        let line = "[STATS] Connecting: 3 Connected: 5 Up: 1.5 MB Down: 0 B";

        assert_eq!(
            scraper.process_line(line).await,
            LineOutcome::Stats { changed: true }
        );
        assert_eq!(
            scraper.process_line(line).await,
            LineOutcome::Stats { changed: false }
        );

        let stats = aggregate.instance(InstanceId::new(0)).await.unwrap();
        assert_eq!(stats.connecting, 3);
        assert_eq!(stats.connected, 5);
        assert_eq!(stats.bytes_up, 1_572_864);
        assert_eq!(stats.bytes_down, 0);
    }

    #[tokio::test]
    async fn test_liveness_is_idempotent() {
        let (scraper, aggregate) = scraper(0);

        assert_eq!(
            scraper.process_line(LIVENESS_MARKER).await,
            LineOutcome::BecameLive
        );
        let after_first = aggregate.instance(InstanceId::new(0)).await.unwrap();

        assert_eq!(
            scraper.process_line(LIVENESS_MARKER).await,
            LineOutcome::AlreadyLive
        );
        let after_second = aggregate.instance(InstanceId::new(0)).await.unwrap();

        assert!(after_first.is_live);
        assert_eq!(after_first, after_second);
    }

    #[tokio::test]
    async fn test_forwarding_follows_verbosity_and_cancel() {
        let (quiet, _) = scraper(0);
        assert_eq!(quiet.process_line("hello").await, LineOutcome::Suppressed);

        let (verbose, _) = scraper(1);
        assert_eq!(verbose.process_line("hello").await, LineOutcome::Forwarded);

        verbose.cancel.cancel();
        assert_eq!(verbose.process_line("hello").await, LineOutcome::Suppressed);
    }

    #[tokio::test]
    async fn test_stats_applied_after_cancel() {
        let (scraper, aggregate) = scraper(1);
        scraper.cancel.cancel();
        scraper.process_line("[STATS] Connected: 7").await;
        assert_eq!(aggregate.instance(InstanceId::new(0)).await.unwrap().connected, 7);
    }

    #[tokio::test]
    async fn test_consume_reads_until_eof() {
        let (scraper, aggregate) = scraper(0);
        let input: &[u8] = b"booting\r\n[OK] Connected to Psiphon network\n[STATS] Connected: 2 Down: 1 KB";
        scraper.consume(input).await;

        let stats = aggregate.instance(InstanceId::new(0)).await.unwrap();
        assert!(stats.is_live);
        assert_eq!(stats.connected, 2);
        assert_eq!(stats.bytes_down, 1024);
    }
}
