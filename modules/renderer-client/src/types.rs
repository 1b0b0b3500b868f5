//! Wire envelope for the external render service (RS). The RS is a
//! headless-browser fleet reached over HTTP; this module pins down the
//! request/response contract and the render error taxonomy.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use edgerender_common::{Viewport, WaitFor};
use edgerender_har::NetworkEvent;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderRequest {
    pub request_id: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tab_id: Option<String>,
    pub viewport: Viewport,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    /// Hard budget for the whole render, in milliseconds.
    pub timeout_ms: u64,
    pub wait_for: WaitFor,
    /// Extra settle time after `wait_for` fires, in milliseconds.
    #[serde(default)]
    pub extra_wait_ms: u64,
    #[serde(default)]
    pub blocked_patterns: Vec<String>,
    #[serde(default)]
    pub blocked_resource_types: Vec<String>,
    #[serde(default)]
    pub include_har: bool,
    /// Request headers forwarded into the browser (already allowlisted).
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub strip_scripts: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderResponse {
    pub success: bool,
    #[serde(default)]
    pub html: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<RenderErrorType>,
    #[serde(default)]
    pub render_time_ms: u64,
    #[serde(default)]
    pub html_size: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chrome_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<PageMetrics>,
    /// Final response headers from the page navigation.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Raw HAR JSON when `include_har` was requested and the RS built it
    /// itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub har: Option<serde_json::Value>,
    /// Network lifecycle event stream; the gateway assembles the HAR from
    /// these when no raw HAR rides along.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_events: Option<Vec<NetworkEvent>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_seo: Option<PageSeo>,
    /// HTTP status of the final navigation response.
    #[serde(default)]
    pub status_code: Option<u16>,
}

impl RenderResponse {
    /// Soft timeouts still carry whatever HTML the page had produced;
    /// that output is storable. Everything else requires `success`.
    pub fn has_storable_html(&self) -> bool {
        if self.html.is_empty() {
            return false;
        }
        self.success || self.error_type == Some(RenderErrorType::SoftTimeout)
    }
}

/// Failure taxonomy reported by the RS, mapped onto HTTP statuses at the
/// gateway edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderErrorType {
    HardTimeout,
    SoftTimeout,
    ChromeCrash,
    PoolUnavailable,
    NavigationFailed,
    NetworkError,
    InvalidUrl,
    Origin4xx,
    Origin5xx,
    EmptyResponse,
    ResponseTooLarge,
}

impl RenderErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RenderErrorType::HardTimeout => "hard_timeout",
            RenderErrorType::SoftTimeout => "soft_timeout",
            RenderErrorType::ChromeCrash => "chrome_crash",
            RenderErrorType::PoolUnavailable => "pool_unavailable",
            RenderErrorType::NavigationFailed => "navigation_failed",
            RenderErrorType::NetworkError => "network_error",
            RenderErrorType::InvalidUrl => "invalid_url",
            RenderErrorType::Origin4xx => "origin_4xx",
            RenderErrorType::Origin5xx => "origin_5xx",
            RenderErrorType::EmptyResponse => "empty_response",
            RenderErrorType::ResponseTooLarge => "response_too_large",
        }
    }

    /// HTTP status the gateway answers with when a render fails this way.
    pub fn http_status(&self) -> u16 {
        match self {
            RenderErrorType::HardTimeout | RenderErrorType::SoftTimeout => 504,
            RenderErrorType::ChromeCrash | RenderErrorType::PoolUnavailable => 503,
            RenderErrorType::NavigationFailed
            | RenderErrorType::NetworkError
            | RenderErrorType::EmptyResponse
            | RenderErrorType::ResponseTooLarge => 502,
            RenderErrorType::InvalidUrl => 400,
            RenderErrorType::Origin4xx => 502,
            RenderErrorType::Origin5xx => 502,
        }
    }
}

/// Browser-side page metrics reported with a render.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PageMetrics {
    #[serde(default)]
    pub dom_content_loaded_ms: u64,
    #[serde(default)]
    pub load_event_ms: u64,
    #[serde(default)]
    pub network_requests: u32,
    #[serde(default)]
    pub transferred_bytes: u64,
    #[serde(default)]
    pub console_errors: u32,
}

/// SEO signals extracted by the post-processing pipeline. Opaque to the
/// cache core; carried through for API consumers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PageSeo {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub meta_description: Option<String>,
    #[serde(default)]
    pub canonical: Option<String>,
    #[serde(default)]
    pub robots: Option<String>,
    #[serde(default)]
    pub open_graph: HashMap<String, String>,
    #[serde(default)]
    pub index_status: IndexStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexStatus {
    #[default]
    Index,
    Noindex,
}

/// RS instance status, polled before debug renders and by the daemon's
/// capacity probe fallback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RsStatus {
    pub available: bool,
    #[serde(default)]
    pub capacity: u32,
    #[serde(default)]
    pub load: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_type_wire_names() {
        let json = serde_json::to_string(&RenderErrorType::SoftTimeout).unwrap();
        assert_eq!(json, "\"soft_timeout\"");
        let parsed: RenderErrorType = serde_json::from_str("\"hard_timeout\"").unwrap();
        assert_eq!(parsed, RenderErrorType::HardTimeout);
    }

    #[test]
    fn status_mapping_covers_taxonomy() {
        assert_eq!(RenderErrorType::HardTimeout.http_status(), 504);
        assert_eq!(RenderErrorType::PoolUnavailable.http_status(), 503);
        assert_eq!(RenderErrorType::InvalidUrl.http_status(), 400);
        assert_eq!(RenderErrorType::NavigationFailed.http_status(), 502);
    }

    #[test]
    fn soft_timeout_with_html_is_storable() {
        let resp = RenderResponse {
            success: false,
            html: "<html>partial</html>".into(),
            error: Some("soft timeout".into()),
            error_type: Some(RenderErrorType::SoftTimeout),
            render_time_ms: 30_000,
            html_size: 20,
            timestamp: Utc::now(),
            chrome_id: None,
            metrics: None,
            headers: HashMap::new(),
            har: None,
            network_events: None,
            page_seo: None,
            status_code: Some(200),
        };
        assert!(resp.has_storable_html());

        let hard = RenderResponse {
            error_type: Some(RenderErrorType::HardTimeout),
            ..resp.clone()
        };
        assert!(!hard.has_storable_html());

        let empty = RenderResponse {
            html: String::new(),
            ..resp
        };
        assert!(!empty.has_storable_html());
    }
}
