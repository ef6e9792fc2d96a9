use std::time::Duration;

use anyhow::Context;
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};

pub const CLIENT_USER_AGENT: &str = concat!("meshmap/", env!("CARGO_PKG_VERSION"));

/// Default deadline for snapshot and directory fetches; probes and the
/// metrics proxy override this per request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Build the shared outbound HTTP client.
pub fn build_client() -> anyhow::Result<reqwest::Client> {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static(CLIENT_USER_AGENT));

    reqwest::Client::builder()
        .default_headers(headers)
        .timeout(REQUEST_TIMEOUT)
        .build()
        .map_err(Into::into)
}

/// Read a response body, truncating at `cap` bytes.
///
/// Upstreams are untrusted; every read in the pipeline carries a cap so a
/// misbehaving source cannot exhaust memory.
pub async fn read_capped(resp: reqwest::Response, cap: usize) -> anyhow::Result<Vec<u8>> {
    let mut body: Vec<u8> = Vec::new();
    let mut stream = resp.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.context("reading response body")?;
        let remaining = cap - body.len();
        if chunk.len() >= remaining {
            body.extend_from_slice(&chunk[..remaining]);
            break;
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}
