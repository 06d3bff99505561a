use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::UpstreamError;

// Body of POST /api/forward
#[derive(Deserialize, Clone, Debug)]
pub struct ForwardRequest {
    pub key: String,   // governor key, e.g. "ndvi:health"
    pub path: String,  // joined onto the upstream base URL
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub body: Option<Value>,
    #[serde(default)]
    pub deduplicate: bool,
}

// What the gateway hands back for a forwarded call
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct UpstreamResponse {
    pub status: u16,
    pub body: String,
}

pub fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

// One call to the upstream. Non-2xx statuses come back as errors so the
// retry classifier can look at them.
pub async fn send(
    client: reqwest::Client,
    url: String,
    method: Method,
    body: Option<Value>,
) -> Result<UpstreamResponse, UpstreamError> {
    let mut request = client.request(method, &url);
    if let Some(body) = &body {
        request = request.json(body);
    }

    let res = request.send().await?;
    let status = res.status().as_u16();
    let text = res.text().await?;

    if !(200..300).contains(&status) {
        return Err(UpstreamError::Status { status, body: text });
    }

    Ok(UpstreamResponse { status, body: text })
}
