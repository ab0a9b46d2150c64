use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use attendsync_core::errors::{Error, Result};
use attendsync_core::sync::{SyncDomain, SYNC_DEFAULT_INTERVAL_SECS};

const DEFAULT_DATA_DIR: &str = "./data";
const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8088";
const DEFAULT_SWEEP_SECS: u64 = 60;
const DEFAULT_REMOTE_CACHE_TTL_SECS: u64 = 300;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub data_dir: String,
    pub listen_addr: SocketAddr,
    pub remote_store_url: String,
    pub remote_store_token: Option<String>,
    pub push_api_url: Option<String>,
    pub push_server_key: Option<String>,
    pub webhook_secret: Option<String>,
    pub sync_interval_secs: u64,
    pub sync_autostart: Vec<SyncDomain>,
    pub notification_sweep: Duration,
    pub remote_cache_ttl: Duration,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the config from any variable source. Values are trimmed and
    /// empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let remote_store_url = get("REMOTE_STORE_URL")
            .map(|url| url.trim_end_matches('/').to_string())
            .ok_or_else(|| Error::Config("missing env: REMOTE_STORE_URL".to_string()))?;

        let listen_raw = get("ATTENDSYNC_LISTEN_ADDR").unwrap_or_else(|| DEFAULT_LISTEN_ADDR.into());
        let listen_addr = SocketAddr::from_str(&listen_raw).map_err(|err| {
            Error::Config(format!("invalid socket addr for ATTENDSYNC_LISTEN_ADDR: {}", err))
        })?;

        let sync_autostart = match get("SYNC_AUTOSTART") {
            Some(raw) => parse_domain_list(&raw)?,
            None => Vec::new(),
        };

        Ok(Self {
            data_dir: get("ATTENDSYNC_DATA_DIR").unwrap_or_else(|| DEFAULT_DATA_DIR.into()),
            listen_addr,
            remote_store_url,
            remote_store_token: get("REMOTE_STORE_TOKEN"),
            push_api_url: get("PUSH_API_URL"),
            push_server_key: get("PUSH_SERVER_KEY"),
            webhook_secret: get("WEBHOOK_SECRET"),
            sync_interval_secs: parse_secs(
                "SYNC_INTERVAL_SECS",
                get("SYNC_INTERVAL_SECS"),
                SYNC_DEFAULT_INTERVAL_SECS,
            )?,
            sync_autostart,
            notification_sweep: Duration::from_secs(parse_secs(
                "NOTIFICATION_SWEEP_SECS",
                get("NOTIFICATION_SWEEP_SECS"),
                DEFAULT_SWEEP_SECS,
            )?),
            remote_cache_ttl: Duration::from_secs(parse_secs(
                "REMOTE_CACHE_TTL_SECS",
                get("REMOTE_CACHE_TTL_SECS"),
                DEFAULT_REMOTE_CACHE_TTL_SECS,
            )?),
        })
    }
}

fn parse_secs(name: &str, value: Option<String>, default: u64) -> Result<u64> {
    match value {
        Some(raw) => raw
            .parse::<u64>()
            .map_err(|err| Error::Config(format!("invalid seconds for {}: {}", name, err))),
        None => Ok(default),
    }
}

fn parse_domain_list(raw: &str) -> Result<Vec<SyncDomain>> {
    let mut domains = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let domain = part
            .parse::<SyncDomain>()
            .map_err(|_| Error::Config(format!("unknown domain in SYNC_AUTOSTART: {}", part)))?;
        if !domains.contains(&domain) {
            domains.push(domain);
        }
    }
    Ok(domains)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::env;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| vars.get(name).cloned()
    }

    #[test]
    fn defaults_apply_when_only_remote_url_is_set() {
        let config =
            ServerConfig::from_lookup(lookup(&[("REMOTE_STORE_URL", "http://remote.test/")]))
                .unwrap();
        assert_eq!(config.remote_store_url, "http://remote.test");
        assert_eq!(config.data_dir, "./data");
        assert_eq!(config.listen_addr, "0.0.0.0:8088".parse().unwrap());
        assert_eq!(config.sync_interval_secs, 300);
        assert_eq!(config.notification_sweep, Duration::from_secs(60));
        assert_eq!(config.remote_cache_ttl, Duration::from_secs(300));
        assert!(config.webhook_secret.is_none());
        assert!(config.push_api_url.is_none());
        assert!(config.sync_autostart.is_empty());
    }

    #[test]
    fn missing_remote_url_is_a_config_error() {
        let err = ServerConfig::from_lookup(lookup(&[("REMOTE_STORE_URL", "   ")])).unwrap_err();
        assert_eq!(err.code(), "config_error");
        assert!(err.to_string().contains("REMOTE_STORE_URL"));
    }

    #[test]
    fn empty_values_count_as_unset() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("REMOTE_STORE_URL", "http://remote.test"),
            ("WEBHOOK_SECRET", "  "),
            ("SYNC_INTERVAL_SECS", ""),
        ]))
        .unwrap();
        assert!(config.webhook_secret.is_none());
        assert_eq!(config.sync_interval_secs, 300);
    }

    #[test]
    fn autostart_accepts_domain_and_collection_names() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("REMOTE_STORE_URL", "http://remote.test"),
            ("SYNC_AUTOSTART", "employee, permits,,employees"),
        ]))
        .unwrap();
        assert_eq!(
            config.sync_autostart,
            vec![SyncDomain::Employee, SyncDomain::Permit]
        );
    }

    #[test]
    fn invalid_values_are_rejected() {
        let base = [("REMOTE_STORE_URL", "http://remote.test")];
        for (key, value) in [
            ("SYNC_AUTOSTART", "employee,payroll"),
            ("ATTENDSYNC_LISTEN_ADDR", "not-a-socket"),
            ("SYNC_INTERVAL_SECS", "-5"),
        ] {
            let mut pairs = base.to_vec();
            pairs.push((key, value));
            let err = ServerConfig::from_lookup(lookup(&pairs)).unwrap_err();
            assert_eq!(err.code(), "config_error", "{}={}", key, value);
        }
    }

    struct EnvGuard {
        key: &'static str,
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            env::remove_var(self.key);
        }
    }

    fn set_env(key: &'static str, value: &str) -> EnvGuard {
        env::set_var(key, value);
        EnvGuard { key }
    }

    #[test]
    fn from_env_reads_process_environment() {
        let _url = set_env("REMOTE_STORE_URL", "http://env.test");
        let _secret = set_env("WEBHOOK_SECRET", "s3cret");
        let config = ServerConfig::from_env().unwrap();
        assert_eq!(config.remote_store_url, "http://env.test");
        assert_eq!(config.webhook_secret.as_deref(), Some("s3cret"));
    }
}
