pub mod error;
pub mod types;

pub use error::{RendererError, Result};
pub use types::{
    IndexStatus, PageMetrics, PageSeo, RenderErrorType, RenderRequest, RenderResponse, RsStatus,
};

use std::time::Duration;

use tracing::{debug, warn};

/// HTTP client for the render service fleet. RS addresses come from the
/// cluster registry, so every call takes the target address explicitly.
#[derive(Clone)]
pub struct RendererClient {
    client: reqwest::Client,
}

impl RendererClient {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .pool_idle_timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to build HTTP client");
        Self { client }
    }

    /// Issue a render. `budget` is the remaining request deadline; the HTTP
    /// timeout gets a small grace on top of the render timeout so the RS
    /// can report a soft timeout instead of the socket dying first.
    pub async fn render(
        &self,
        addr: &str,
        request: &RenderRequest,
        budget: Duration,
    ) -> Result<RenderResponse> {
        let endpoint = format!("{}/render", addr.trim_end_matches('/'));

        let resp = self
            .client
            .post(&endpoint)
            .timeout(budget + Duration::from_secs(2))
            .json(request)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(RendererError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let rendered: RenderResponse = resp.json().await?;
        debug!(
            request_id = request.request_id.as_str(),
            success = rendered.success,
            render_time_ms = rendered.render_time_ms,
            "Render response received"
        );
        Ok(rendered)
    }

    /// Fetch an RS instance's status.
    pub async fn status(&self, addr: &str) -> Result<RsStatus> {
        let endpoint = format!("{}/status", addr.trim_end_matches('/'));
        let resp = self
            .client
            .get(&endpoint)
            .timeout(Duration::from_secs(3))
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(RendererError::Api {
                status: status.as_u16(),
                message,
            });
        }
        Ok(resp.json().await?)
    }

    /// Poll until the RS reports availability, up to `max_wait`. Used by
    /// the on-demand debug render endpoint.
    pub async fn wait_available(&self, addr: &str, max_wait: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + max_wait;
        let mut poll = tokio::time::interval(Duration::from_millis(500));

        loop {
            poll.tick().await;
            match self.status(addr).await {
                Ok(status) if status.available => return Ok(()),
                Ok(_) => {}
                Err(e) => warn!(addr, error = %e, "RS status poll failed"),
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(RendererError::Unavailable {
                    addr: addr.to_string(),
                    waited_secs: max_wait.as_secs(),
                });
            }
        }
    }
}

impl Default for RendererClient {
    fn default() -> Self {
        Self::new()
    }
}
