//! HAR 1.2 document assembly from a collector.
//!
//! One page per render; entries sorted chronologically by start time;
//! timings in milliseconds with `-1` for not-applicable DNS/connect/SSL
//! phases (reused connections). The non-standard `_metadata` block carries
//! everything HAR has no slot for: blocked and failed requests, lifecycle
//! events, console errors, render metrics, and the request config.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::collector::{HarCollector, RequestRecord};

pub const HAR_VERSION: &str = "1.2";
pub const CREATOR_NAME: &str = "edgerender";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Har {
    pub log: HarLog,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarLog {
    pub version: String,
    pub creator: HarCreator,
    pub pages: Vec<HarPage>,
    pub entries: Vec<HarEntry>,
    #[serde(rename = "_metadata")]
    pub metadata: HarMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarCreator {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarPage {
    pub started_date_time: DateTime<Utc>,
    pub id: String,
    pub title: String,
    pub page_timings: HarPageTimings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarPageTimings {
    /// Milliseconds to DOMContentLoaded, -1 when not observed.
    pub on_content_load: f64,
    pub on_load: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarEntry {
    pub pageref: String,
    pub started_date_time: DateTime<Utc>,
    /// Total entry time in milliseconds.
    pub time: f64,
    pub request: HarRequest,
    pub response: HarResponse,
    pub cache: serde_json::Value,
    pub timings: HarTimings,
    #[serde(rename = "serverIPAddress", skip_serializing_if = "Option::is_none")]
    pub server_ip_address: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarRequest {
    pub method: String,
    pub url: String,
    pub http_version: String,
    pub headers: Vec<HarNameValue>,
    pub query_string: Vec<HarNameValue>,
    pub cookies: Vec<serde_json::Value>,
    pub headers_size: i64,
    pub body_size: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarResponse {
    pub status: i64,
    pub status_text: String,
    pub http_version: String,
    pub headers: Vec<HarNameValue>,
    pub cookies: Vec<serde_json::Value>,
    pub content: HarContent,
    #[serde(rename = "redirectURL")]
    pub redirect_url: String,
    pub headers_size: i64,
    pub body_size: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarContent {
    pub size: i64,
    pub mime_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarNameValue {
    pub name: String,
    pub value: String,
}

/// Phase timings in milliseconds. `-1` marks a phase that did not happen
/// (connection reuse skips DNS/connect/SSL).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarTimings {
    pub blocked: f64,
    pub dns: f64,
    pub connect: f64,
    pub ssl: f64,
    pub send: f64,
    pub wait: f64,
    pub receive: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarMetadata {
    pub blocked: Vec<MetaBlocked>,
    pub failed: Vec<MetaFailed>,
    pub lifecycle: Vec<MetaLifecycle>,
    pub console_errors: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub render_metrics: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_config: Option<serde_json::Value>,
    pub truncated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaBlocked {
    pub url: String,
    pub reason: String,
    pub at_ms: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaFailed {
    pub url: String,
    pub error: String,
    pub at_ms: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaLifecycle {
    pub name: String,
    pub at_ms: f64,
}

/// Assemble the HAR document. `render_metrics` and `request_config` are
/// opaque JSON from the render pipeline.
pub fn build(
    collector: &HarCollector,
    render_metrics: Option<serde_json::Value>,
    request_config: Option<serde_json::Value>,
) -> Har {
    let page_id = "page_1".to_string();

    let mut entries: Vec<HarEntry> = collector
        .records()
        .map(|record| build_entry(collector.started_at, &page_id, record))
        .collect();
    entries.sort_by(|a, b| {
        a.started_date_time
            .cmp(&b.started_date_time)
            .then_with(|| a.request.url.cmp(&b.request.url))
    });

    let page = HarPage {
        started_date_time: collector.started_at,
        id: page_id,
        title: collector.page_url.clone(),
        page_timings: HarPageTimings {
            on_content_load: collector.lifecycle_ms("DOMContentLoaded").unwrap_or(-1.0),
            on_load: collector.lifecycle_ms("load").unwrap_or(-1.0),
        },
    };

    let metadata = HarMetadata {
        blocked: collector
            .blocked()
            .iter()
            .map(|b| MetaBlocked {
                url: b.url.clone(),
                reason: b.reason.clone(),
                at_ms: b.at_ms,
            })
            .collect(),
        failed: collector
            .failed()
            .iter()
            .map(|f| MetaFailed {
                url: f.url.clone(),
                error: f.error.clone(),
                at_ms: f.at_ms,
            })
            .collect(),
        lifecycle: collector
            .lifecycle()
            .iter()
            .map(|e| MetaLifecycle {
                name: e.name.clone(),
                at_ms: e.at_ms,
            })
            .collect(),
        console_errors: collector.console_errors().to_vec(),
        render_metrics,
        request_config,
        truncated: collector.truncated(),
    };

    Har {
        log: HarLog {
            version: HAR_VERSION.to_string(),
            creator: HarCreator {
                name: CREATOR_NAME.to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            pages: vec![page],
            entries,
            metadata,
        },
    }
}

fn build_entry(anchor: DateTime<Utc>, page_id: &str, record: &RequestRecord) -> HarEntry {
    let started = anchor + Duration::microseconds((record.started_ms * 1000.0) as i64);
    let end_ms = record
        .finished_ms
        .or(record.response.as_ref().map(|r| r.received_ms))
        .unwrap_or(record.started_ms);
    let total = (end_ms - record.started_ms).max(0.0);

    let http_version = record
        .response
        .as_ref()
        .and_then(|r| r.protocol.as_deref())
        .map(protocol_name)
        .unwrap_or("HTTP/1.1")
        .to_string();

    let request = HarRequest {
        method: record.method.clone(),
        url: record.url.clone(),
        http_version: http_version.clone(),
        headers: name_values(&record.request_headers),
        query_string: query_pairs(&record.url),
        cookies: Vec::new(),
        headers_size: -1,
        body_size: -1,
    };

    let response = match &record.response {
        Some(resp) => HarResponse {
            status: resp.status as i64,
            status_text: resp.status_text.clone(),
            http_version,
            headers: name_values(&resp.headers),
            cookies: Vec::new(),
            content: HarContent {
                size: record.encoded_bytes.unwrap_or(-1),
                mime_type: resp.mime_type.clone(),
            },
            redirect_url: String::new(),
            headers_size: -1,
            body_size: record.encoded_bytes.unwrap_or(-1),
        },
        // In-flight at capture time: an empty response shell.
        None => HarResponse {
            status: 0,
            status_text: String::new(),
            http_version,
            headers: Vec::new(),
            cookies: Vec::new(),
            content: HarContent {
                size: -1,
                mime_type: String::new(),
            },
            redirect_url: String::new(),
            headers_size: -1,
            body_size: -1,
        },
    };

    let timings = match &record.response {
        Some(resp) => {
            let wait = (resp.received_ms - record.started_ms).max(0.0);
            let receive = record
                .finished_ms
                .map(|f| (f - resp.received_ms).max(0.0))
                .unwrap_or(0.0);
            HarTimings {
                blocked: -1.0,
                dns: resp.dns_ms.unwrap_or(-1.0),
                connect: resp.connect_ms.unwrap_or(-1.0),
                ssl: resp.ssl_ms.unwrap_or(-1.0),
                send: 0.0,
                wait,
                receive,
            }
        }
        None => HarTimings {
            blocked: -1.0,
            dns: -1.0,
            connect: -1.0,
            ssl: -1.0,
            send: 0.0,
            wait: total,
            receive: 0.0,
        },
    };

    HarEntry {
        pageref: page_id.to_string(),
        started_date_time: started,
        time: total,
        request,
        response,
        cache: serde_json::json!({}),
        timings,
        server_ip_address: record.response.as_ref().and_then(|r| r.remote_ip.clone()),
    }
}

/// Browser protocol id → HAR httpVersion.
fn protocol_name(protocol: &str) -> &'static str {
    match protocol {
        "h2" => "HTTP/2",
        "h3" => "HTTP/3",
        _ => "HTTP/1.1",
    }
}

fn name_values(map: &std::collections::HashMap<String, String>) -> Vec<HarNameValue> {
    let mut pairs: Vec<HarNameValue> = map
        .iter()
        .map(|(name, value)| HarNameValue {
            name: name.clone(),
            value: value.clone(),
        })
        .collect();
    pairs.sort_by(|a, b| a.name.cmp(&b.name));
    pairs
}

fn query_pairs(url: &str) -> Vec<HarNameValue> {
    let Some(query) = url.split_once('?').map(|(_, q)| q) else {
        return Vec::new();
    };
    query
        .split('&')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let (name, value) = part.split_once('=').unwrap_or((part, ""));
            HarNameValue {
                name: name.to_string(),
                value: value.to_string(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::ResponseRecord;
    use std::collections::HashMap;

    fn respond(collector: &mut HarCollector, id: &str, at: f64, protocol: &str) {
        collector.response_received(
            id,
            ResponseRecord {
                status: 200,
                status_text: "OK".into(),
                headers: HashMap::new(),
                mime_type: "text/html".into(),
                protocol: Some(protocol.into()),
                remote_ip: Some("192.0.2.10".into()),
                received_ms: at,
                dns_ms: None,
                connect_ms: None,
                ssl_ms: None,
            },
        );
    }

    #[test]
    fn entries_are_sorted_chronologically() {
        let mut c = HarCollector::new("https://example.com/");
        c.request_will_be_sent("late", "https://example.com/late", "GET", HashMap::new(), 50.0);
        c.request_will_be_sent("early", "https://example.com/early", "GET", HashMap::new(), 1.0);
        respond(&mut c, "late", 60.0, "h2");
        respond(&mut c, "early", 4.0, "h2");
        c.loading_finished("late", 61.0, 100);
        c.loading_finished("early", 5.0, 100);

        let har = build(&c, None, None);
        let times: Vec<_> = har
            .log
            .entries
            .iter()
            .map(|e| e.started_date_time)
            .collect();
        let mut sorted = times.clone();
        sorted.sort();
        assert_eq!(times, sorted);
        assert!(har.log.entries[0].request.url.ends_with("/early"));
    }

    #[test]
    fn round_trip_preserves_order() {
        let mut c = HarCollector::new("https://example.com/");
        for i in 0..5 {
            let id = format!("r{i}");
            c.request_will_be_sent(&id, &format!("https://example.com/{i}"), "GET", HashMap::new(), i as f64 * 10.0);
            respond(&mut c, &id, i as f64 * 10.0 + 3.0, "h2");
            c.loading_finished(&id, i as f64 * 10.0 + 5.0, 64);
        }

        let har = build(&c, None, None);
        let json = serde_json::to_string(&har).unwrap();
        let parsed: Har = serde_json::from_str(&json).unwrap();

        let mut previous = None;
        for entry in &parsed.log.entries {
            if let Some(prev) = previous {
                assert!(entry.started_date_time >= prev, "entries out of order");
            }
            previous = Some(entry.started_date_time);
        }
    }

    #[test]
    fn protocol_mapping() {
        let mut c = HarCollector::new("https://example.com/");
        c.request_will_be_sent("a", "https://example.com/a", "GET", HashMap::new(), 0.0);
        respond(&mut c, "a", 1.0, "h3");
        c.request_will_be_sent("b", "https://example.com/b", "GET", HashMap::new(), 2.0);
        respond(&mut c, "b", 3.0, "http/1.1");

        let har = build(&c, None, None);
        let versions: Vec<_> = har
            .log
            .entries
            .iter()
            .map(|e| e.response.http_version.as_str())
            .collect();
        assert!(versions.contains(&"HTTP/3"));
        assert!(versions.contains(&"HTTP/1.1"));
    }

    #[test]
    fn missing_phases_use_minus_one_sentinel() {
        let mut c = HarCollector::new("https://example.com/");
        c.request_will_be_sent("a", "https://example.com/a", "GET", HashMap::new(), 0.0);
        respond(&mut c, "a", 2.0, "h2");

        let har = build(&c, None, None);
        let t = &har.log.entries[0].timings;
        assert_eq!(t.dns, -1.0);
        assert_eq!(t.connect, -1.0);
        assert_eq!(t.ssl, -1.0);
        assert!(t.wait >= 0.0);
    }

    #[test]
    fn metadata_carries_blocked_failed_and_truncation() {
        let mut c = HarCollector::new("https://example.com/");
        c.request_blocked("x", "https://ads.example.net/p", "blocked_pattern", 1.0);
        c.request_will_be_sent("y", "https://example.com/y", "GET", HashMap::new(), 2.0);
        c.loading_failed("y", "net::ERR_FAILED", 3.0);
        c.console_error("TypeError: undefined");
        c.lifecycle_event("DOMContentLoaded", 40.0);

        let har = build(
            &c,
            Some(serde_json::json!({"render_time_ms": 1200})),
            Some(serde_json::json!({"wait_for": "networkIdle"})),
        );
        let meta = &har.log.metadata;
        assert_eq!(meta.blocked.len(), 1);
        assert_eq!(meta.failed.len(), 1);
        assert_eq!(meta.console_errors.len(), 1);
        assert!(!meta.truncated);
        assert_eq!(har.log.pages[0].page_timings.on_content_load, 40.0);
        assert_eq!(har.log.pages[0].page_timings.on_load, -1.0);
        assert!(meta.render_metrics.is_some());
    }

    #[test]
    fn page_entry_is_singular() {
        let c = HarCollector::new("https://example.com/");
        let har = build(&c, None, None);
        assert_eq!(har.log.pages.len(), 1);
        assert_eq!(har.log.version, "1.2");
    }
}
