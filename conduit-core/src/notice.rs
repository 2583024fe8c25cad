// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Relay engine notices.
//!
//! The engine reports activity as one JSON object per line:
//! `{"noticeType": "...", "data": {...}, "timestamp": "..."}`. A worker
//! turns those into its own counters and the status lines the parent
//! scrapes.

use std::time::Duration;

use chrono::{DateTime, Local, SecondsFormat};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::scraper::{LIVENESS_MARKER, STATS_MARKER};
use crate::units::{format_bytes, format_duration};

/// Info message the engine emits once a broker accepted the proxy.
const BROKER_SELECTED_PREFIX: &str = "inproxy: selected broker ";

/// Routine Info message, only shown at the highest verbosity.
const ANNOUNCEMENT_REQUEST: &str = "announcement request";

/// Warning that fires constantly on a healthy proxy.
const NO_CAPABLE_SERVERS: &str = "tactics request aborted: no capable servers";

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Notice {
    #[serde(rename = "noticeType")]
    pub notice_type: String,
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default)]
    pub timestamp: String,
}

impl Notice {
    /// `None` for lines that are not notices.
    pub fn parse(line: &str) -> Option<Self> {
        serde_json::from_str(line.trim()).ok()
    }

    fn count(&self, key: &str) -> Option<u64> {
        self.data.get(key).and_then(Value::as_f64).map(|v| v.max(0.0) as u64)
    }

    fn bytes(&self, key: &str) -> Option<i64> {
        self.data.get(key).and_then(Value::as_f64).map(|v| v as i64)
    }

    fn text(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }
}

/// Inproxy errors that repeat during normal operation.
pub fn is_noisy_error(message: &str) -> bool {
    message.starts_with("inproxy")
        && ["limited", "no match", "announcement", "status code 502", "status code 503", "status code 504"]
            .iter()
            .any(|needle| message.contains(needle))
}

/// What a notice asks the worker to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoticeAction {
    /// Client counts moved: emit a stats line.
    CountsChanged,
    /// First broker acceptance: emit the liveness line.
    BecameLive,
    /// Print this line as is.
    Print(String),
    None,
}

/// Counters of a single relay.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RelayStats {
    pub connecting: u64,
    pub connected: u64,
    pub bytes_up: i64,
    pub bytes_down: i64,
    pub is_live: bool,
}

/// The single-instance stats document.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayStatsDocument {
    pub connecting_clients: u64,
    pub connected_clients: u64,
    pub total_bytes_up: i64,
    pub total_bytes_down: i64,
    pub uptime_seconds: u64,
    pub is_live: bool,
    pub timestamp: String,
}

impl RelayStats {
    /// `<ts> [STATS] Connecting: C | Connected: D | Up: X | Down: Y | Uptime: Z`
    pub fn stats_line(&self, now: DateTime<Local>, uptime: Duration) -> String {
        format!(
            "{} {} Connecting: {} | Connected: {} | Up: {} | Down: {} | Uptime: {}",
            now.format("%Y-%m-%d %H:%M:%S"),
            STATS_MARKER,
            self.connecting,
            self.connected,
            format_bytes(self.bytes_up),
            format_bytes(self.bytes_down),
            format_duration(uptime),
        )
    }

    pub fn document(&self, now: DateTime<Local>, uptime: Duration) -> RelayStatsDocument {
        RelayStatsDocument {
            connecting_clients: self.connecting,
            connected_clients: self.connected,
            total_bytes_up: self.bytes_up,
            total_bytes_down: self.bytes_down,
            uptime_seconds: uptime.as_secs(),
            is_live: self.is_live,
            timestamp: now.to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }
}

/// Applies notices to [`RelayStats`].
#[derive(Debug)]
pub struct NoticeHandler {
    stats: RelayStats,
    verbosity: u8,
}

impl NoticeHandler {
    pub fn new(verbosity: u8) -> Self {
        Self {
            stats: RelayStats::default(),
            verbosity,
        }
    }

    pub fn stats(&self) -> &RelayStats {
        &self.stats
    }

    pub fn handle(&mut self, notice: &Notice) -> NoticeAction {
        match notice.notice_type.as_str() {
            "InproxyProxyActivity" => self.activity(notice, false),
            "InproxyProxyTotalActivity" => self.activity(notice, true),
            "Info" => self.info(notice),
            "InproxyMustUpgrade" => NoticeAction::Print(
                "\nWARNING: A newer version of Conduit is required. Please upgrade.".to_string(),
            ),
            "Error" => self.error(notice),
            other => {
                if self.verbosity < 2 {
                    return NoticeAction::None;
                }
                if other == "Warning" && notice.text("message") == Some(NO_CAPABLE_SERVERS) {
                    return NoticeAction::None;
                }
                NoticeAction::Print(format!("[DEBUG] {}: {}", other, Value::Object(notice.data.clone())))
            }
        }
    }

    /// Per-interval activity carries byte deltas; total activity carries totals.
    fn activity(&mut self, notice: &Notice, totals: bool) -> NoticeAction {
        let before = (self.stats.connecting, self.stats.connected);

        if let Some(v) = notice.count("connectingClients") {
            self.stats.connecting = v;
        }
        if let Some(v) = notice.count("connectedClients") {
            self.stats.connected = v;
        }
        if totals {
            if let Some(v) = notice.bytes("totalBytesUp") {
                self.stats.bytes_up = v;
            }
            if let Some(v) = notice.bytes("totalBytesDown") {
                self.stats.bytes_down = v;
            }
        } else {
            if let Some(v) = notice.bytes("bytesUp") {
                self.stats.bytes_up = self.stats.bytes_up.saturating_add(v);
            }
            if let Some(v) = notice.bytes("bytesDown") {
                self.stats.bytes_down = self.stats.bytes_down.saturating_add(v);
            }
        }

        if (self.stats.connecting, self.stats.connected) != before {
            NoticeAction::CountsChanged
        } else {
            NoticeAction::None
        }
    }

    fn info(&mut self, notice: &Notice) -> NoticeAction {
        let Some(message) = notice.text("message") else {
            return NoticeAction::None;
        };
        if message.starts_with(BROKER_SELECTED_PREFIX) {
            if self.stats.is_live {
                return NoticeAction::None;
            }
            self.stats.is_live = true;
            return NoticeAction::BecameLive;
        }
        match self.verbosity {
            0 => NoticeAction::None,
            1 if message == ANNOUNCEMENT_REQUEST => NoticeAction::None,
            _ if message == ANNOUNCEMENT_REQUEST => NoticeAction::Print(format!(
                "[DEBUG] Info: {}",
                Value::Object(notice.data.clone())
            )),
            _ => NoticeAction::Print(format!("[INFO] {}", message)),
        }
    }

    fn error(&self, notice: &Notice) -> NoticeAction {
        if self.verbosity < 1 {
            return NoticeAction::None;
        }
        match notice.text("error") {
            Some(message) if self.verbosity >= 2 || !is_noisy_error(message) => {
                NoticeAction::Print(format!("[ERROR] {}", message))
            }
            Some(_) => NoticeAction::None,
            None if self.verbosity >= 2 => NoticeAction::Print(format!(
                "[DEBUG] Error: {}",
                Value::Object(notice.data.clone())
            )),
            None => NoticeAction::None,
        }
    }
}

/// The line a worker prints when it joins the network.
pub fn liveness_line() -> &'static str {
    LIVENESS_MARKER
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scraper::{parse_stats_fields, StatusLine};

    fn notice(json: &str) -> Notice {
        Notice::parse(json).unwrap()
    }

    #[test]
    fn test_parse() {
        let n = notice(r#"{"noticeType":"Info","data":{"message":"hi"},"timestamp":"2025-01-01T00:00:00Z"}"#);
        assert_eq!(n.notice_type, "Info");
        assert_eq!(n.text("message"), Some("hi"));
        assert!(Notice::parse("plain text").is_none());
        assert!(Notice::parse(r#"{"data":{}}"#).is_none());
    }

    #[test]
    fn test_activity_accumulates_deltas() {
        let mut handler = NoticeHandler::new(0);
        let n = notice(r#"{"noticeType":"InproxyProxyActivity","data":{"connectingClients":1,"connectedClients":2,"bytesUp":100,"bytesDown":50}}"#);

        assert_eq!(handler.handle(&n), NoticeAction::CountsChanged);
        assert_eq!(handler.handle(&n), NoticeAction::None);
        assert_eq!(handler.stats().bytes_up, 200);
        assert_eq!(handler.stats().bytes_down, 100);
    }

    #[test]
    fn test_total_activity_overwrites() {
        let mut handler = NoticeHandler::new(0);
        handler.handle(&notice(r#"{"noticeType":"InproxyProxyActivity","data":{"bytesUp":100}}"#));
        let action = handler.handle(&notice(
            r#"{"noticeType":"InproxyProxyTotalActivity","data":{"connectingClients":0,"connectedClients":4,"totalBytesUp":4096,"totalBytesDown":8192}}"#,
        ));

        assert_eq!(action, NoticeAction::CountsChanged);
        assert_eq!(
            handler.stats(),
            &RelayStats {
                connecting: 0,
                connected: 4,
                bytes_up: 4096,
                bytes_down: 8192,
                is_live: false,
            }
        );
    }

    #[test]
    fn test_broker_selection_goes_live_once() {
        let mut handler = NoticeHandler::new(0);
        let n = notice(r#"{"noticeType":"Info","data":{"message":"inproxy: selected broker abc"}}"#);
        assert_eq!(handler.handle(&n), NoticeAction::BecameLive);
        assert_eq!(handler.handle(&n), NoticeAction::None);
        assert!(handler.stats().is_live);
    }

    #[test]
    fn test_info_verbosity() {
        let n = notice(r#"{"noticeType":"Info","data":{"message":"hello"}}"#);
        let announce = notice(r#"{"noticeType":"Info","data":{"message":"announcement request"}}"#);

        assert_eq!(NoticeHandler::new(0).handle(&n), NoticeAction::None);
        assert_eq!(
            NoticeHandler::new(1).handle(&n),
            NoticeAction::Print("[INFO] hello".to_string())
        );
        assert_eq!(NoticeHandler::new(1).handle(&announce), NoticeAction::None);
        assert!(matches!(NoticeHandler::new(2).handle(&announce), NoticeAction::Print(_)));
    }

    #[test]
    fn test_noisy_errors_filtered() {
        assert!(is_noisy_error("inproxy: proxy limited"));
        assert!(is_noisy_error("inproxy: broker status code 503"));
        assert!(!is_noisy_error("inproxy: handshake failed"));
        assert!(!is_noisy_error("limited"));

        let noisy = notice(r#"{"noticeType":"Error","data":{"error":"inproxy: no match"}}"#);
        let real = notice(r#"{"noticeType":"Error","data":{"error":"disk full"}}"#);

        assert_eq!(NoticeHandler::new(0).handle(&real), NoticeAction::None);
        assert_eq!(
            NoticeHandler::new(1).handle(&real),
            NoticeAction::Print("[ERROR] disk full".to_string())
        );
        assert_eq!(NoticeHandler::new(1).handle(&noisy), NoticeAction::None);
        assert_eq!(
            NoticeHandler::new(2).handle(&noisy),
            NoticeAction::Print("[ERROR] inproxy: no match".to_string())
        );
    }

    #[test]
    fn test_other_notices_only_when_debugging() {
        let n = notice(r#"{"noticeType":"Alert","data":{"x":1}}"#);
        let quiet = notice(r#"{"noticeType":"Warning","data":{"message":"tactics request aborted: no capable servers"}}"#);

        assert_eq!(NoticeHandler::new(1).handle(&n), NoticeAction::None);
        assert_eq!(
            NoticeHandler::new(2).handle(&n),
            NoticeAction::Print(r#"[DEBUG] Alert: {"x":1}"#.to_string())
        );
        assert_eq!(NoticeHandler::new(2).handle(&quiet), NoticeAction::None);
    }

    #[test]
    fn test_must_upgrade_always_printed() {
        let n = notice(r#"{"noticeType":"InproxyMustUpgrade","data":{}}"#);
        assert!(matches!(NoticeHandler::new(0).handle(&n), NoticeAction::Print(_)));
    }

    #[test]
    fn test_worker_lines_match_scraper_grammar() {
        let stats = RelayStats {
            connecting: 2,
            connected: 7,
            bytes_up: 1_572_864,
            bytes_down: 3 * 1024,
            is_live: true,
        };
        let line = stats.stats_line(Local::now(), Duration::from_secs(61));
        assert!(line.ends_with("Uptime: 1m1s"));

        let update = parse_stats_fields(&line);
        assert_eq!(update.connecting, Some(2));
        assert_eq!(update.connected, Some(7));
        assert_eq!(update.bytes_up, Some(1_572_864));
        assert_eq!(update.bytes_down, Some(3072));

        assert_eq!(StatusLine::classify(liveness_line()), StatusLine::Live);
    }

    #[test]
    fn test_document_fields() {
        let doc = RelayStats::default().document(Local::now(), Duration::from_secs(9));
        let json = serde_json::to_value(&doc).unwrap();
        for key in [
            "connectingClients",
            "connectedClients",
            "totalBytesUp",
            "totalBytesDown",
            "uptimeSeconds",
            "isLive",
            "timestamp",
        ] {
            assert!(json.get(key).is_some(), "missing {key}");
        }
        assert_eq!(json["uptimeSeconds"], 9);
    }
}
