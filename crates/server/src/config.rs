use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const ENV_PREFIX: &str = "MESHMAP";

pub const DEFAULT_DIRECTORY_URL: &str = "https://api.freifunk.net/data/ffSummarizedDir.json";

const DEFAULT_SITE_NAME: &str = "Mesh Map";
const DEFAULT_MAP_CENTER: [f64; 2] = [48.1351, 11.582];
/// Wide-area view used when federation is enabled and the operator kept the
/// single-community default center.
const FEDERATION_MAP_CENTER: [f64; 2] = [51.1657, 10.4515];

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Bind address for the HTTP server.
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Display name surfaced to the browser client.
    #[serde(default = "default_site_name")]
    pub site_name: String,
    /// The one snapshot URL; required unless federation is enabled.
    #[serde(default)]
    pub data_url: String,
    /// Duration string, e.g. "60s" or "5m".
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval: String,
    /// Discover communities from the directory instead of polling `data_url`.
    #[serde(default)]
    pub federation: bool,
    /// Directory document listing every community.
    #[serde(default = "default_directory_url")]
    pub directory_url: String,
    /// Time-series frontend base URL for single-community mode.
    #[serde(default)]
    pub grafana_url: String,
    #[serde(default)]
    pub grafana_dashboard: String,
    /// Datasource routed through the time-series proxy in single-community
    /// mode; federation discovers these per community.
    #[serde(default = "default_grafana_datasource_id")]
    pub grafana_datasource_id: i64,
    #[serde(default = "default_grafana_database")]
    pub grafana_database: String,
    #[serde(default = "default_map_center")]
    pub map_center: [f64; 2],
    #[serde(default = "default_map_zoom")]
    pub map_zoom: i64,
    #[serde(default)]
    pub tile_layers: Vec<TileLayer>,
    /// Domain key to display name.
    #[serde(default)]
    pub domain_names: HashMap<String, String>,
    /// Header navigation links for the client.
    #[serde(default)]
    pub links: Vec<ExternalLink>,
    /// Template with a `{MODEL}` placeholder.
    #[serde(default = "default_device_picture_url")]
    pub device_picture_url: String,
    #[serde(default)]
    pub eol_info_url: String,
    /// Directory for the persisted state and metadata cache files.
    #[serde(default = "default_state_dir")]
    pub state_dir: String,
    /// Cap on concurrent discovery and refresh fetches.
    #[serde(default = "default_fetch_concurrency")]
    pub fetch_concurrency: usize,
    /// Waive the private-address rejection of the outbound URL gate.
    /// Development setups only; metadata endpoints stay blocked either way.
    #[serde(default)]
    pub allow_private_upstreams: bool,

    /// Parsed from `refresh_interval`; not read from configuration sources.
    #[serde(skip)]
    pub refresh_duration: Duration,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TileLayer {
    pub name: String,
    pub url: String,
    pub attribution: String,
    pub max_zoom: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExternalLink {
    pub title: String,
    pub href: String,
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_site_name() -> String {
    DEFAULT_SITE_NAME.to_string()
}

fn default_refresh_interval() -> String {
    "60s".to_string()
}

fn default_directory_url() -> String {
    DEFAULT_DIRECTORY_URL.to_string()
}

fn default_grafana_datasource_id() -> i64 {
    5
}

fn default_grafana_database() -> String {
    "yanic".to_string()
}

fn default_map_center() -> [f64; 2] {
    DEFAULT_MAP_CENTER
}

fn default_map_zoom() -> i64 {
    10
}

fn default_device_picture_url() -> String {
    "https://map.example.org/pictures-svg/{MODEL}.svg".to_string()
}

fn default_state_dir() -> String {
    ".".to_string()
}

fn default_fetch_concurrency() -> usize {
    50
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            site_name: default_site_name(),
            data_url: String::new(),
            refresh_interval: default_refresh_interval(),
            federation: false,
            directory_url: default_directory_url(),
            grafana_url: String::new(),
            grafana_dashboard: String::new(),
            grafana_datasource_id: default_grafana_datasource_id(),
            grafana_database: default_grafana_database(),
            map_center: default_map_center(),
            map_zoom: default_map_zoom(),
            tile_layers: Vec::new(),
            domain_names: HashMap::new(),
            links: Vec::new(),
            device_picture_url: default_device_picture_url(),
            eol_info_url: String::new(),
            state_dir: default_state_dir(),
            fetch_concurrency: default_fetch_concurrency(),
            allow_private_upstreams: false,
            refresh_duration: Duration::from_secs(60),
        }
    }
}

impl AppConfig {
    pub fn validate(&mut self) -> anyhow::Result<()> {
        if self.data_url.is_empty() && !self.federation {
            anyhow::bail!("data_url is required (or set federation = true)");
        }

        self.refresh_duration =
            parse_duration(&self.refresh_interval).unwrap_or(Duration::from_secs(60));
        if self.refresh_duration.is_zero() {
            self.refresh_duration = Duration::from_secs(60);
        }

        if self.federation {
            if self.site_name == DEFAULT_SITE_NAME {
                self.site_name = "Mesh Federation Map".to_string();
            }
            // Zoom out to a wide-area view unless the operator moved the map.
            if self.map_center == DEFAULT_MAP_CENTER {
                self.map_center = FEDERATION_MAP_CENTER;
                if self.map_zoom == default_map_zoom() {
                    self.map_zoom = 6;
                }
            }
        }

        if self.fetch_concurrency == 0 {
            self.fetch_concurrency = default_fetch_concurrency();
        }

        Ok(())
    }
}

/// Parse duration strings of chained `<number><unit>` segments, e.g. "90s",
/// "5m", "1h30m", "250ms".
pub fn parse_duration(text: &str) -> anyhow::Result<Duration> {
    let text = text.trim();
    if text.is_empty() {
        anyhow::bail!("empty duration");
    }

    let mut total = Duration::ZERO;
    let mut rest = text;
    while !rest.is_empty() {
        let digits = rest.chars().take_while(|c| c.is_ascii_digit()).count();
        if digits == 0 {
            anyhow::bail!("invalid duration: {text}");
        }
        let value: u64 = rest[..digits].parse()?;
        rest = &rest[digits..];

        let unit_len = rest.chars().take_while(|c| c.is_ascii_alphabetic()).count();
        let unit = &rest[..unit_len];
        rest = &rest[unit_len..];

        total += match unit {
            "ms" => Duration::from_millis(value),
            "s" => Duration::from_secs(value),
            "m" => Duration::from_secs(value * 60),
            "h" => Duration::from_secs(value * 3600),
            _ => anyhow::bail!("invalid duration unit in {text}"),
        };
    }
    Ok(total)
}

/// Load configuration from the optional config file plus `MESHMAP__*`
/// environment overrides.
pub fn load(path: Option<&str>) -> anyhow::Result<AppConfig> {
    let env = config::Environment::with_prefix(ENV_PREFIX)
        .separator("__")
        .try_parsing(false);

    let file = match path {
        Some(path) => config::File::with_name(path).required(true),
        None => config::File::with_name("config").required(false),
    };

    let cfg = config::Config::builder()
        .add_source(file)
        .add_source(env)
        .build()?;

    let mut app: AppConfig = cfg.try_deserialize()?;
    app.validate()?;
    Ok(app)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_parse_like_the_config_examples() {
        assert_eq!(parse_duration("60s").expect("parse"), Duration::from_secs(60));
        assert_eq!(parse_duration("5m").expect("parse"), Duration::from_secs(300));
        assert_eq!(
            parse_duration("1h30m").expect("parse"),
            Duration::from_secs(5400)
        );
        assert_eq!(
            parse_duration("250ms").expect("parse"),
            Duration::from_millis(250)
        );
        assert!(parse_duration("").is_err());
        assert!(parse_duration("60x").is_err());
        assert!(parse_duration("soon").is_err());
    }

    #[test]
    fn validate_requires_data_url_without_federation() {
        let mut cfg = AppConfig::default();
        assert!(cfg.validate().is_err());

        cfg.data_url = "https://map.example.org/meshviewer.json".into();
        cfg.validate().expect("valid");
        assert_eq!(cfg.refresh_duration, Duration::from_secs(60));
    }

    #[test]
    fn federation_mode_adjusts_display_defaults() {
        let mut cfg = AppConfig {
            federation: true,
            ..AppConfig::default()
        };
        cfg.validate().expect("valid");
        assert_eq!(cfg.site_name, "Mesh Federation Map");
        assert_eq!(cfg.map_center, FEDERATION_MAP_CENTER);
        assert_eq!(cfg.map_zoom, 6);
    }

    #[test]
    fn federation_mode_keeps_operator_overrides() {
        let mut cfg = AppConfig {
            federation: true,
            site_name: "My Region".into(),
            map_center: [40.0, -3.7],
            map_zoom: 12,
            ..AppConfig::default()
        };
        cfg.validate().expect("valid");
        assert_eq!(cfg.site_name, "My Region");
        assert_eq!(cfg.map_center, [40.0, -3.7]);
        assert_eq!(cfg.map_zoom, 12);
    }

    #[test]
    fn bad_refresh_intervals_fall_back_to_a_minute() {
        let mut cfg = AppConfig {
            data_url: "https://x.example/m.json".into(),
            refresh_interval: "whenever".into(),
            ..AppConfig::default()
        };
        cfg.validate().expect("valid");
        assert_eq!(cfg.refresh_duration, Duration::from_secs(60));
    }
}
