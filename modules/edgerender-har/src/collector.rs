//! Passive per-render network event collector.
//!
//! The browser reports request lifecycle events keyed by an opaque request
//! id. Redirects replay the same id: the collector updates URL and method
//! in place instead of opening a second record. Failed and blocked
//! requests move to dedicated lists and drop out of the entry stream.
//!
//! Timestamps are collector-local millisecond offsets; the wall-clock
//! anchor is taken once at collector construction. This makes absolute
//! times an approximation, which is acceptable for debugging output.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Hard cap on tracked requests. Past it the collector only flips the
/// `truncated` flag.
pub const MAX_TRACKED_REQUESTS: usize = 2000;

#[derive(Debug, Clone)]
pub struct RequestRecord {
    pub request_id: String,
    pub url: String,
    pub method: String,
    pub request_headers: HashMap<String, String>,
    pub resource_type: Option<String>,
    /// Offset from the collector start, milliseconds.
    pub started_ms: f64,
    pub redirect_count: u32,
    pub response: Option<ResponseRecord>,
    pub finished_ms: Option<f64>,
    pub encoded_bytes: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct ResponseRecord {
    pub status: u16,
    pub status_text: String,
    pub headers: HashMap<String, String>,
    pub mime_type: String,
    /// Negotiated protocol as reported by the browser (`h2`, `h3`, ...).
    pub protocol: Option<String>,
    pub remote_ip: Option<String>,
    pub received_ms: f64,
    /// Phase timings in ms; None when the connection was reused.
    pub dns_ms: Option<f64>,
    pub connect_ms: Option<f64>,
    pub ssl_ms: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct FailedRequest {
    pub request_id: String,
    pub url: String,
    pub error: String,
    pub at_ms: f64,
}

#[derive(Debug, Clone)]
pub struct BlockedRequest {
    pub request_id: String,
    pub url: String,
    pub reason: String,
    pub at_ms: f64,
}

#[derive(Debug, Clone)]
pub struct LifecycleEvent {
    pub name: String,
    pub at_ms: f64,
}

pub struct HarCollector {
    pub page_url: String,
    /// Wall-clock anchor for millisecond offsets.
    pub started_at: DateTime<Utc>,
    requests: HashMap<String, RequestRecord>,
    /// Insertion order of request ids, for stable iteration.
    order: Vec<String>,
    failed: Vec<FailedRequest>,
    blocked: Vec<BlockedRequest>,
    lifecycle: Vec<LifecycleEvent>,
    console_errors: Vec<String>,
    truncated: bool,
}

impl HarCollector {
    pub fn new(page_url: impl Into<String>) -> Self {
        Self {
            page_url: page_url.into(),
            started_at: Utc::now(),
            requests: HashMap::new(),
            order: Vec::new(),
            failed: Vec::new(),
            blocked: Vec::new(),
            lifecycle: Vec::new(),
            console_errors: Vec::new(),
            truncated: false,
        }
    }

    /// A request is leaving the browser. A repeated id is a redirect hop:
    /// the record's URL and method are updated in place.
    pub fn request_will_be_sent(
        &mut self,
        request_id: &str,
        url: &str,
        method: &str,
        headers: HashMap<String, String>,
        at_ms: f64,
    ) {
        if let Some(existing) = self.requests.get_mut(request_id) {
            existing.url = url.to_string();
            existing.method = method.to_string();
            existing.request_headers = headers;
            existing.redirect_count += 1;
            // Response of the previous hop no longer describes the record.
            existing.response = None;
            return;
        }

        if self.requests.len() >= MAX_TRACKED_REQUESTS {
            self.truncated = true;
            return;
        }

        self.order.push(request_id.to_string());
        self.requests.insert(
            request_id.to_string(),
            RequestRecord {
                request_id: request_id.to_string(),
                url: url.to_string(),
                method: method.to_string(),
                request_headers: headers,
                resource_type: None,
                started_ms: at_ms,
                redirect_count: 0,
                response: None,
                finished_ms: None,
                encoded_bytes: None,
            },
        );
    }

    pub fn set_resource_type(&mut self, request_id: &str, resource_type: &str) {
        if let Some(record) = self.requests.get_mut(request_id) {
            record.resource_type = Some(resource_type.to_string());
        }
    }

    pub fn response_received(&mut self, request_id: &str, response: ResponseRecord) {
        if let Some(record) = self.requests.get_mut(request_id) {
            record.response = Some(response);
        }
    }

    pub fn loading_finished(&mut self, request_id: &str, at_ms: f64, encoded_bytes: i64) {
        if let Some(record) = self.requests.get_mut(request_id) {
            record.finished_ms = Some(at_ms);
            record.encoded_bytes = Some(encoded_bytes);
        }
    }

    /// The request died. Moves the record to the failed list.
    pub fn loading_failed(&mut self, request_id: &str, error: &str, at_ms: f64) {
        if let Some(record) = self.take(request_id) {
            self.failed.push(FailedRequest {
                request_id: record.request_id,
                url: record.url,
                error: error.to_string(),
                at_ms,
            });
        }
    }

    /// The request matched a blocked pattern or resource type.
    pub fn request_blocked(&mut self, request_id: &str, url: &str, reason: &str, at_ms: f64) {
        // Blocked requests may never have produced a willBeSent record.
        let record = self.take(request_id);
        self.blocked.push(BlockedRequest {
            request_id: request_id.to_string(),
            url: record.map(|r| r.url).unwrap_or_else(|| url.to_string()),
            reason: reason.to_string(),
            at_ms,
        });
    }

    pub fn lifecycle_event(&mut self, name: &str, at_ms: f64) {
        self.lifecycle.push(LifecycleEvent {
            name: name.to_string(),
            at_ms,
        });
    }

    pub fn console_error(&mut self, message: &str) {
        self.console_errors.push(message.to_string());
    }

    fn take(&mut self, request_id: &str) -> Option<RequestRecord> {
        let record = self.requests.remove(request_id)?;
        self.order.retain(|id| id != request_id);
        Some(record)
    }

    /// Completed and in-flight records in arrival order.
    pub fn records(&self) -> impl Iterator<Item = &RequestRecord> {
        self.order.iter().filter_map(|id| self.requests.get(id))
    }

    pub fn failed(&self) -> &[FailedRequest] {
        &self.failed
    }

    pub fn blocked(&self) -> &[BlockedRequest] {
        &self.blocked
    }

    pub fn lifecycle(&self) -> &[LifecycleEvent] {
        &self.lifecycle
    }

    pub fn console_errors(&self) -> &[String] {
        &self.console_errors
    }

    pub fn truncated(&self) -> bool {
        self.truncated
    }

    /// Millisecond offset of the first lifecycle event with this name.
    pub fn lifecycle_ms(&self, name: &str) -> Option<f64> {
        self.lifecycle
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.at_ms)
    }
}

/// Wire form of a browser network lifecycle event, as the render service
/// reports them. Timestamps are millisecond offsets from navigation start.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NetworkEvent {
    RequestWillBeSent {
        request_id: String,
        url: String,
        method: String,
        #[serde(default)]
        headers: HashMap<String, String>,
        at_ms: f64,
        #[serde(default)]
        resource_type: Option<String>,
    },
    ResponseReceived {
        request_id: String,
        status: u16,
        #[serde(default)]
        status_text: String,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default)]
        mime_type: String,
        #[serde(default)]
        protocol: Option<String>,
        #[serde(default)]
        remote_ip: Option<String>,
        at_ms: f64,
        #[serde(default)]
        dns_ms: Option<f64>,
        #[serde(default)]
        connect_ms: Option<f64>,
        #[serde(default)]
        ssl_ms: Option<f64>,
    },
    LoadingFinished {
        request_id: String,
        at_ms: f64,
        #[serde(default)]
        encoded_bytes: i64,
    },
    LoadingFailed {
        request_id: String,
        error: String,
        at_ms: f64,
    },
    RequestBlocked {
        request_id: String,
        #[serde(default)]
        url: String,
        reason: String,
        at_ms: f64,
    },
    Lifecycle {
        name: String,
        at_ms: f64,
    },
    ConsoleError {
        message: String,
    },
}

/// Replay a reported event stream into a fresh collector.
pub fn collect(page_url: &str, events: &[NetworkEvent]) -> HarCollector {
    let mut collector = HarCollector::new(page_url);
    for event in events {
        match event {
            NetworkEvent::RequestWillBeSent {
                request_id,
                url,
                method,
                headers,
                at_ms,
                resource_type,
            } => {
                collector.request_will_be_sent(request_id, url, method, headers.clone(), *at_ms);
                if let Some(resource_type) = resource_type {
                    collector.set_resource_type(request_id, resource_type);
                }
            }
            NetworkEvent::ResponseReceived {
                request_id,
                status,
                status_text,
                headers,
                mime_type,
                protocol,
                remote_ip,
                at_ms,
                dns_ms,
                connect_ms,
                ssl_ms,
            } => {
                collector.response_received(
                    request_id,
                    ResponseRecord {
                        status: *status,
                        status_text: status_text.clone(),
                        headers: headers.clone(),
                        mime_type: mime_type.clone(),
                        protocol: protocol.clone(),
                        remote_ip: remote_ip.clone(),
                        received_ms: *at_ms,
                        dns_ms: *dns_ms,
                        connect_ms: *connect_ms,
                        ssl_ms: *ssl_ms,
                    },
                );
            }
            NetworkEvent::LoadingFinished {
                request_id,
                at_ms,
                encoded_bytes,
            } => collector.loading_finished(request_id, *at_ms, *encoded_bytes),
            NetworkEvent::LoadingFailed {
                request_id,
                error,
                at_ms,
            } => collector.loading_failed(request_id, error, *at_ms),
            NetworkEvent::RequestBlocked {
                request_id,
                url,
                reason,
                at_ms,
            } => collector.request_blocked(request_id, url, reason, *at_ms),
            NetworkEvent::Lifecycle { name, at_ms } => collector.lifecycle_event(name, *at_ms),
            NetworkEvent::ConsoleError { message } => collector.console_error(message),
        }
    }
    collector
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers() -> HashMap<String, String> {
        HashMap::new()
    }

    #[test]
    fn redirect_replays_update_in_place() {
        let mut c = HarCollector::new("https://example.com/");
        c.request_will_be_sent("r1", "https://example.com/old", "GET", headers(), 0.0);
        c.response_received(
            "r1",
            ResponseRecord {
                status: 301,
                status_text: "Moved Permanently".into(),
                headers: headers(),
                mime_type: "text/html".into(),
                protocol: Some("h2".into()),
                remote_ip: None,
                received_ms: 5.0,
                dns_ms: None,
                connect_ms: None,
                ssl_ms: None,
            },
        );
        c.request_will_be_sent("r1", "https://example.com/new", "GET", headers(), 6.0);

        let records: Vec<_> = c.records().collect();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].url, "https://example.com/new");
        assert_eq!(records[0].redirect_count, 1);
        assert!(records[0].response.is_none());
    }

    #[test]
    fn failed_requests_leave_the_entry_stream() {
        let mut c = HarCollector::new("https://example.com/");
        c.request_will_be_sent("r1", "https://example.com/a", "GET", headers(), 0.0);
        c.request_will_be_sent("r2", "https://example.com/b", "GET", headers(), 1.0);
        c.loading_failed("r2", "net::ERR_CONNECTION_RESET", 8.0);

        assert_eq!(c.records().count(), 1);
        assert_eq!(c.failed().len(), 1);
        assert_eq!(c.failed()[0].url, "https://example.com/b");
    }

    #[test]
    fn blocked_requests_without_prior_record_are_captured() {
        let mut c = HarCollector::new("https://example.com/");
        c.request_blocked("r9", "https://ads.example.net/pixel", "pattern", 2.0);
        assert_eq!(c.blocked().len(), 1);
        assert_eq!(c.blocked()[0].url, "https://ads.example.net/pixel");
    }

    #[test]
    fn event_stream_replay_matches_direct_calls() {
        let events = vec![
            NetworkEvent::RequestWillBeSent {
                request_id: "r1".into(),
                url: "https://example.com/a".into(),
                method: "GET".into(),
                headers: HashMap::new(),
                at_ms: 0.0,
                resource_type: Some("document".into()),
            },
            NetworkEvent::ResponseReceived {
                request_id: "r1".into(),
                status: 200,
                status_text: "OK".into(),
                headers: HashMap::new(),
                mime_type: "text/html".into(),
                protocol: Some("h2".into()),
                remote_ip: None,
                at_ms: 12.0,
                dns_ms: Some(2.0),
                connect_ms: None,
                ssl_ms: None,
            },
            NetworkEvent::LoadingFinished {
                request_id: "r1".into(),
                at_ms: 15.0,
                encoded_bytes: 512,
            },
            NetworkEvent::Lifecycle {
                name: "load".into(),
                at_ms: 20.0,
            },
        ];

        let collector = collect("https://example.com/a", &events);
        let records: Vec<_> = collector.records().collect();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].resource_type.as_deref(), Some("document"));
        assert_eq!(records[0].finished_ms, Some(15.0));
        assert_eq!(collector.lifecycle_ms("load"), Some(20.0));
    }

    #[test]
    fn event_wire_format_round_trips() {
        let event = NetworkEvent::LoadingFailed {
            request_id: "r1".into(),
            error: "net::ERR_FAILED".into(),
            at_ms: 3.0,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"loading_failed\""));
        let parsed: NetworkEvent = serde_json::from_str(&json).unwrap();
        assert!(matches!(parsed, NetworkEvent::LoadingFailed { .. }));
    }

    #[test]
    fn cap_sets_truncated_flag() {
        let mut c = HarCollector::new("https://example.com/");
        for i in 0..MAX_TRACKED_REQUESTS + 5 {
            c.request_will_be_sent(&format!("r{i}"), "https://example.com/x", "GET", headers(), i as f64);
        }
        assert!(c.truncated());
        assert_eq!(c.records().count(), MAX_TRACKED_REQUESTS);
    }
}
