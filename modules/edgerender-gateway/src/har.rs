//! HAR assembly from a render response: prefer the RS-built raw HAR,
//! otherwise replay the reported network event stream through the
//! collector and build HAR 1.2 locally.

use renderer_client::{RenderRequest, RenderResponse};

pub fn har_bytes(
    page_url: &str,
    request: &RenderRequest,
    response: &RenderResponse,
) -> Option<Vec<u8>> {
    if let Some(har) = &response.har {
        return serde_json::to_vec(har).ok();
    }

    let events = response.network_events.as_deref()?;
    let collector = edgerender_har::collect(page_url, events);
    let har = edgerender_har::build(
        &collector,
        response
            .metrics
            .as_ref()
            .and_then(|m| serde_json::to_value(m).ok()),
        serde_json::to_value(request).ok(),
    );
    serde_json::to_vec(&har).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use edgerender_common::{Viewport, WaitFor};
    use edgerender_har::NetworkEvent;
    use std::collections::HashMap;

    fn request() -> RenderRequest {
        RenderRequest {
            request_id: "req-1".into(),
            url: "https://example.com/".into(),
            tab_id: None,
            viewport: Viewport::default(),
            user_agent: None,
            timeout_ms: 30_000,
            wait_for: WaitFor::NetworkIdle,
            extra_wait_ms: 0,
            blocked_patterns: vec![],
            blocked_resource_types: vec![],
            include_har: true,
            headers: HashMap::new(),
            strip_scripts: true,
        }
    }

    fn response(har: Option<serde_json::Value>, events: Option<Vec<NetworkEvent>>) -> RenderResponse {
        RenderResponse {
            success: true,
            html: "<html></html>".into(),
            error: None,
            error_type: None,
            render_time_ms: 100,
            html_size: 13,
            timestamp: Utc::now(),
            chrome_id: None,
            metrics: None,
            headers: HashMap::new(),
            har,
            network_events: events,
            page_seo: None,
            status_code: Some(200),
        }
    }

    #[test]
    fn raw_har_wins_over_events() {
        let raw = serde_json::json!({"log": {"version": "1.2"}});
        let resp = response(Some(raw.clone()), Some(vec![]));
        let bytes = har_bytes("https://example.com/", &request(), &resp).unwrap();
        assert_eq!(serde_json::from_slice::<serde_json::Value>(&bytes).unwrap(), raw);
    }

    #[test]
    fn events_build_a_valid_har_document() {
        let events = vec![
            NetworkEvent::RequestWillBeSent {
                request_id: "r1".into(),
                url: "https://example.com/".into(),
                method: "GET".into(),
                headers: HashMap::new(),
                at_ms: 0.0,
                resource_type: None,
            },
            NetworkEvent::ResponseReceived {
                request_id: "r1".into(),
                status: 200,
                status_text: "OK".into(),
                headers: HashMap::new(),
                mime_type: "text/html".into(),
                protocol: Some("h2".into()),
                remote_ip: None,
                at_ms: 10.0,
                dns_ms: None,
                connect_ms: None,
                ssl_ms: None,
            },
        ];
        let resp = response(None, Some(events));
        let bytes = har_bytes("https://example.com/", &request(), &resp).unwrap();

        let har: edgerender_har::Har = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(har.log.version, "1.2");
        assert_eq!(har.log.entries.len(), 1);
        assert_eq!(har.log.entries[0].response.http_version, "HTTP/2");
        assert!(har.log.metadata.request_config.is_some());
    }

    #[test]
    fn no_har_material_yields_none() {
        let resp = response(None, None);
        assert!(har_bytes("https://example.com/", &request(), &resp).is_none());
    }
}
