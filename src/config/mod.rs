use serde::Deserialize;
use std::path::{Path, PathBuf};

use tracing::error;

use crate::err::Error;

const DEFAULT_RESTRICTED_PORTS: &str = "";

// ─── TOML config file ─────────────────────────────────────────────────────────

/// `{data_dir}/proxyd.toml` — all fields are optional overrides.
/// Priority: CLI / env var  >  TOML  >  built-in default.
#[derive(Deserialize, Default)]
struct TomlConfig {
    /// Tuple range list `"lo-hi;lo-hi;…"` of forbidden destination ports.
    restricted_ports: Option<String>,
    /// Path to an additional policy file (consumed by policy collaborators).
    policy_import: Option<String>,
    /// Enable filesystem browsing through the internal browse server.
    browse_fs: Option<bool>,
    /// Shared-access token time to live, seconds (transport collaborator).
    token_ttl: Option<u64>,
    /// Upstream web proxy for outbound bus connections (transport collaborator).
    proxy_host: Option<String>,
    proxy_user: Option<String>,
    proxy_pwd: Option<String>,
    /// Forward log records as telemetry (logging collaborator).
    log_telemetry: Option<bool>,
    /// Log level filter string, e.g. "debug", "info,proxyd=trace".
    log: Option<String>,
    /// Bus connection string for the control listener.
    connection_string: Option<String>,
    /// Name-service registry file.
    ns_registry: Option<PathBuf>,
}

fn load_toml(data_dir: &Path) -> Option<TomlConfig> {
    let path = data_dir.join("proxyd.toml");
    let contents = std::fs::read_to_string(&path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse proxyd.toml — using defaults");
            None
        }
    }
}

// ─── ProxyConfig ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub data_dir: PathBuf,
    pub log: String,
    /// Parsed restricted-port tuples, inclusive ranges.
    pub restricted_ports: Vec<(u16, u16)>,
    pub policy_import: Option<String>,
    pub browse_fs: bool,
    pub token_ttl: Option<u64>,
    pub proxy_host: Option<String>,
    pub proxy_user: Option<String>,
    pub proxy_pwd: Option<String>,
    pub log_telemetry: bool,
    /// Bus connection string (PROXYD_CS env var or TOML).
    pub connection_string: Option<String>,
    pub ns_registry: Option<PathBuf>,
}

impl ProxyConfig {
    /// Build config from CLI/env args + optional TOML file.
    pub fn new(
        data_dir: Option<PathBuf>,
        log: Option<String>,
        connection_string: Option<String>,
        restricted_ports: Option<String>,
    ) -> Self {
        let data_dir = data_dir.unwrap_or_else(default_data_dir);

        // TOML is the lowest-priority override layer.
        let toml = load_toml(&data_dir).unwrap_or_default();

        let log = log.or(toml.log).unwrap_or_else(|| "info".to_string());
        let ports_text = restricted_ports
            .or(toml.restricted_ports)
            .unwrap_or_else(|| DEFAULT_RESTRICTED_PORTS.to_string());
        let restricted_ports = parse_range_list(&ports_text).unwrap_or_else(|_| {
            error!(ports = %ports_text, "bad restricted_ports value — ignoring");
            Vec::new()
        });

        let connection_string = std::env::var("PROXYD_CS")
            .ok()
            .filter(|v| !v.is_empty())
            .or(connection_string)
            .or(toml.connection_string);

        Self {
            data_dir,
            log,
            restricted_ports,
            policy_import: toml.policy_import,
            browse_fs: toml.browse_fs.unwrap_or(false),
            token_ttl: toml.token_ttl,
            proxy_host: toml.proxy_host,
            proxy_user: toml.proxy_user,
            proxy_pwd: toml.proxy_pwd,
            log_telemetry: toml.log_telemetry.unwrap_or(false),
            connection_string,
            ns_registry: toml.ns_registry,
        }
    }
}

/// Parse `"lo-hi;lo-hi;…"` (a bare `"p"` means `p-p`) into inclusive tuples.
/// The empty string is the empty list.
pub fn parse_range_list(text: &str) -> Result<Vec<(u16, u16)>, Error> {
    let mut out = Vec::new();
    for part in text.split(';') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let (lo, hi) = match part.split_once('-') {
            Some((lo, hi)) => (
                lo.trim().parse().map_err(|_| Error::InvalidFormat)?,
                hi.trim().parse().map_err(|_| Error::InvalidFormat)?,
            ),
            None => {
                let p: u16 = part.parse().map_err(|_| Error::InvalidFormat)?;
                (p, p)
            }
        };
        if lo > hi {
            return Err(Error::InvalidFormat);
        }
        out.push((lo, hi));
    }
    Ok(out)
}

fn default_data_dir() -> PathBuf {
    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join("proxyd");
        }
    }
    #[cfg(target_os = "linux")]
    {
        if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
            return PathBuf::from(xdg).join("proxyd");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join(".local")
                .join("share")
                .join("proxyd");
        }
    }
    #[cfg(target_os = "windows")]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("proxyd");
        }
    }
    PathBuf::from(".proxyd")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_range_list() {
        assert_eq!(parse_range_list("").unwrap(), vec![]);
        assert_eq!(parse_range_list("80-80").unwrap(), vec![(80, 80)]);
        assert_eq!(
            parse_range_list("80-80;443-443").unwrap(),
            vec![(80, 80), (443, 443)]
        );
        assert_eq!(
            parse_range_list("1-1024; 8080").unwrap(),
            vec![(1, 1024), (8080, 8080)]
        );
    }

    #[test]
    fn test_parse_range_list_rejects_garbage() {
        assert!(parse_range_list("abc").is_err());
        assert!(parse_range_list("100-1").is_err());
        assert!(parse_range_list("80-").is_err());
    }

    #[test]
    fn test_toml_layering() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("proxyd.toml"),
            "restricted_ports = \"22-22\"\nbrowse_fs = true\nlog = \"debug\"\n",
        )
        .unwrap();

        let config = ProxyConfig::new(Some(dir.path().to_owned()), None, None, None);
        assert_eq!(config.restricted_ports, vec![(22, 22)]);
        assert!(config.browse_fs);
        assert_eq!(config.log, "debug");

        // CLI overrides TOML.
        let config = ProxyConfig::new(
            Some(dir.path().to_owned()),
            Some("warn".into()),
            None,
            Some("80-81".into()),
        );
        assert_eq!(config.restricted_ports, vec![(80, 81)]);
        assert_eq!(config.log, "warn");
    }
}
