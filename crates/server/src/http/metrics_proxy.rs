//! Sanitized proxy for per-node time-series charts.
//!
//! The node id is validated against a strict character set before it is
//! spliced into a query, and every outbound URL passes the URL gate.
//! Upstream failures degrade to empty metric arrays; partial results are
//! more useful than a 500.

use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::cached_json;
use crate::app_state::AppState;
use crate::coerce;
use crate::error::{ApiResult, AppError};
use crate::fetch;
use crate::urlsafe;

const METRICS_TIMEOUT: Duration = Duration::from_secs(15);
const METRICS_BODY_CAP: usize = 5 * 1024 * 1024;

pub fn router() -> Router<AppState> {
    Router::<AppState>::new().route("/api/metrics/{node_id}", get(node_metrics))
}

#[derive(Deserialize)]
pub(crate) struct MetricsParams {
    metric: Option<String>,
    duration: Option<String>,
}

#[derive(Serialize, Default)]
struct MetricResult {
    name: String,
    times: Vec<i64>,
    values: Vec<f64>,
}

/// Group-by interval per duration; unknown durations rebind to 24h/5m.
pub(crate) fn group_interval(duration: &str) -> (&'static str, &'static str) {
    match duration {
        "6h" => ("6h", "1m"),
        "12h" => ("12h", "2m"),
        "24h" => ("24h", "5m"),
        "48h" => ("48h", "10m"),
        "7d" => ("7d", "30m"),
        "14d" => ("14d", "1h"),
        "30d" => ("30d", "2h"),
        _ => ("24h", "5m"),
    }
}

/// Only hex digits, colons, and dashes may reach a query.
pub(crate) fn is_valid_node_id(node_id: &str) -> bool {
    !node_id.is_empty()
        && node_id
            .chars()
            .all(|c| c.is_ascii_hexdigit() || c == ':' || c == '-')
}

fn query_template(metric: &str) -> Option<&'static str> {
    Some(match metric {
        "clients" => {
            r#"SELECT round(mean("clients.total")) FROM "node" WHERE ("nodeid" =~ /^{node}$/) AND time >= now() - {duration} GROUP BY time({interval}) fill(null)"#
        }
        "traffic_forward" => {
            r#"SELECT non_negative_derivative(mean("traffic.forward.bytes"), 1s) * 8 FROM "node" WHERE ("nodeid" =~ /^{node}$/) AND time >= now() - {duration} GROUP BY time({interval}) fill(none)"#
        }
        "traffic_rx" => {
            r#"SELECT non_negative_derivative(mean("traffic.rx.bytes"), 1s) * 8 FROM "node" WHERE ("nodeid" =~ /^{node}$/) AND time >= now() - {duration} GROUP BY time({interval}) fill(none)"#
        }
        "traffic_tx" => {
            r#"SELECT non_negative_derivative(mean("traffic.tx.bytes"), 1s) * 8 FROM "node" WHERE ("nodeid" =~ /^{node}$/) AND time >= now() - {duration} GROUP BY time({interval}) fill(none)"#
        }
        "load" => {
            r#"SELECT mean("load") FROM "node" WHERE ("nodeid" =~ /^{node}$/) AND time >= now() - {duration} GROUP BY time({interval}) fill(null)"#
        }
        "memory" => {
            r#"SELECT mean("memory.usage") FROM "node" WHERE ("nodeid" =~ /^{node}$/) AND time >= now() - {duration} GROUP BY time({interval}) fill(null)"#
        }
        _ => return None,
    })
}

pub(crate) fn influx_query(
    metric: &str,
    node_id: &str,
    duration: &str,
    interval: &str,
) -> Option<String> {
    Some(
        query_template(metric)?
            .replace("{node}", node_id)
            .replace("{duration}", duration)
            .replace("{interval}", interval),
    )
}

fn query_escape(text: &str) -> String {
    url::form_urlencoded::byte_serialize(text.as_bytes()).collect()
}

/// Datasource-proxy URL for one influx query.
pub(crate) fn build_query_url(base: &str, datasource_id: i64, database: &str, query: &str) -> String {
    format!(
        "{}/api/datasources/proxy/{}/query?db={}&q={}&epoch=s",
        base.trim_end_matches('/'),
        datasource_id,
        query_escape(database),
        query_escape(query),
    )
}

async fn node_metrics(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
    Query(params): Query<MetricsParams>,
) -> ApiResult<Response> {
    // Resolve the upstream target: federation consults the metadata cache by
    // the node's community keys; single mode uses the configured values.
    let (base_url, datasource_id, database, query_node_id) = match &state.federation {
        Some(federation) => {
            let (info, original_id) = federation.grafana_info_for_node(&node_id);
            let Some(info) = info else {
                return Err(AppError::not_found(
                    "no time-series datasource for this community",
                ));
            };
            let Some(datasource_id) = info.datasource_id else {
                return Err(AppError::not_found(
                    "no time-series datasource for this community",
                ));
            };
            if info.base_url.is_empty() {
                return Err(AppError::not_found(
                    "no time-series datasource for this community",
                ));
            }
            let database = if info.database.is_empty() {
                state.cfg.grafana_database.clone()
            } else {
                info.database.clone()
            };
            (info.base_url, datasource_id, database, original_id)
        }
        None => {
            if state.cfg.grafana_url.is_empty() {
                return Err(AppError::not_found("time-series backend not configured"));
            }
            (
                state.cfg.grafana_url.clone(),
                state.cfg.grafana_datasource_id,
                state.cfg.grafana_database.clone(),
                node_id.clone(),
            )
        }
    };

    if !is_valid_node_id(&query_node_id) {
        return Err(AppError::bad_request("invalid node id"));
    }

    let metric = params.metric.as_deref().unwrap_or("clients");
    let (duration, interval) = group_interval(params.duration.as_deref().unwrap_or("24h"));

    let metric_names: Vec<&str> = if metric == "traffic" {
        vec!["traffic_forward", "traffic_rx", "traffic_tx"]
    } else {
        vec![metric]
    };

    let mut results: Vec<MetricResult> = Vec::with_capacity(metric_names.len());
    for name in metric_names {
        let Some(query) = influx_query(name, &query_node_id, duration, interval) else {
            continue;
        };
        let url = build_query_url(&base_url, datasource_id, &database, &query);
        if !urlsafe::check_url(&url, state.cfg.allow_private_upstreams).await {
            continue;
        }

        let mut result = MetricResult {
            name: name.to_string(),
            ..Default::default()
        };
        match fetch_series(&state.client, &url).await {
            Some((times, values)) => {
                result.times = times;
                result.values = values;
            }
            None => debug!(metric = name, "time-series upstream query failed"),
        }
        results.push(result);
    }

    Ok(cached_json(&results, "public, max-age=60"))
}

/// Fetch one query and flatten the standard envelope
/// (`results[0].series[0].values` as `[[ts, value], …]`).
async fn fetch_series(client: &reqwest::Client, url: &str) -> Option<(Vec<i64>, Vec<f64>)> {
    let resp = client
        .get(url)
        .timeout(METRICS_TIMEOUT)
        .header(reqwest::header::ACCEPT, "application/json")
        .send()
        .await
        .ok()?;
    if resp.status().as_u16() != 200 {
        return None;
    }
    let body = fetch::read_capped(resp, METRICS_BODY_CAP).await.ok()?;
    let parsed: Value = serde_json::from_slice(&body).ok()?;

    let mut times = Vec::new();
    let mut values = Vec::new();
    if let Some(rows) = parsed
        .pointer("/results/0/series/0/values")
        .and_then(Value::as_array)
    {
        for row in rows {
            let Some(row) = row.as_array() else {
                continue;
            };
            if row.len() < 2 {
                continue;
            }
            times.push(coerce::as_i64(&row[0]));
            values.push(if row[1].is_null() {
                0.0
            } else {
                coerce::as_f64(&row[1])
            });
        }
    }
    Some((times, values))
}
