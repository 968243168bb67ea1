//! Service configuration
//!
//! Every knob is a flag with an environment-variable twin, so the same
//! binary runs from a shell, a container spec, or a systemd unit without a
//! config file. Durations accept humantime forms (`90s`, `5m`, `1h`).
//!
//! Startup validation beyond what the parser enforces lives in
//! [`Config::key_set_source`]: exactly one issuer key-set source must be
//! given.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use url::Url;

use crate::keyset::KeySetSource;

/// Runtime configuration, parsed from flags and environment.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "natsgate",
    about = "NATS auth callout service for Kubernetes workload identities",
    version
)]
pub struct Config {
    /// Broker address, e.g. nats://nats.nats.svc:4222
    #[arg(long, env = "BROKER_URL")]
    pub broker_url: String,

    /// Credentials file containing the response-signing nkey seed
    #[arg(long, env = "BROKER_CREDENTIALS_FILE")]
    pub broker_credentials_file: PathBuf,

    /// Account identifier used as the audience of signed replies
    #[arg(long, env = "BROKER_ACCOUNT")]
    pub broker_account: String,

    /// Issuer JWKS endpoint (mutually exclusive with --issuer-jwks-path)
    #[arg(long, env = "ISSUER_JWKS_URL")]
    pub issuer_jwks_url: Option<Url>,

    /// Local JWKS file (test/bootstrap; mutually exclusive with --issuer-jwks-url)
    #[arg(long, env = "ISSUER_JWKS_PATH")]
    pub issuer_jwks_path: Option<PathBuf>,

    /// Expected `iss` claim of presented tokens
    #[arg(long, env = "ISSUER_EXPECTED_ISSUER")]
    pub issuer_expected_issuer: String,

    /// Expected `aud` claim of presented tokens
    #[arg(long, env = "ISSUER_EXPECTED_AUDIENCE", default_value = "nats")]
    pub issuer_expected_audience: String,

    /// Restrict the identity watch to one namespace; empty watches cluster-wide
    #[arg(long, env = "CACHE_WATCH_NAMESPACE")]
    pub cache_watch_namespace: Option<String>,

    /// Cadence of the full re-list reconcile sweep
    #[arg(long, env = "CACHE_CLEANUP_INTERVAL", default_value = "15m", value_parser = humantime::parse_duration)]
    pub cache_cleanup_interval: Duration,

    /// Prefix of the recognized capability annotations
    #[arg(long, env = "CACHE_ANNOTATION_PREFIX", default_value = "nats.io/")]
    pub cache_annotation_prefix: String,

    /// Point-read the platform on a cache miss
    #[arg(long, env = "CACHE_READ_THROUGH", default_value_t = true, action = clap::ArgAction::Set)]
    pub cache_read_through: bool,

    /// Scheduled key-set refresh cadence
    #[arg(long, env = "KEYSET_REFRESH_INTERVAL", default_value = "1h", value_parser = humantime::parse_duration)]
    pub keyset_refresh_interval: Duration,

    /// Rate-limit floor between key-set refreshes
    #[arg(long, env = "KEYSET_MIN_REFRESH_GAP", default_value = "5m", value_parser = humantime::parse_duration)]
    pub keyset_min_refresh_gap: Duration,

    /// Per-fetch timeout for the key set
    #[arg(long, env = "KEYSET_FETCH_TIMEOUT", default_value = "10s", value_parser = humantime::parse_duration)]
    pub keyset_fetch_timeout: Duration,

    /// Validity window of issued authorizations
    #[arg(long, env = "TOKEN_TTL", default_value = "5m", value_parser = humantime::parse_duration)]
    pub token_ttl: Duration,

    /// Log level: debug | info | warn | error
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON
    #[arg(long, env = "LOG_JSON", default_value_t = false, action = clap::ArgAction::Set)]
    pub log_json: bool,
}

impl Config {
    /// Resolve the issuer key-set source; exactly one must be configured.
    pub fn key_set_source(&self) -> anyhow::Result<KeySetSource> {
        match (&self.issuer_jwks_url, &self.issuer_jwks_path) {
            (Some(url), None) => Ok(KeySetSource::Url(url.clone())),
            (None, Some(path)) => Ok(KeySetSource::File(path.clone())),
            (Some(_), Some(_)) => {
                anyhow::bail!("--issuer-jwks-url and --issuer-jwks-path are mutually exclusive")
            }
            (None, None) => {
                anyhow::bail!("one of --issuer-jwks-url or --issuer-jwks-path is required")
            }
        }
    }

    /// Watch namespace, with empty normalized to cluster-wide.
    pub fn watch_namespace(&self) -> Option<String> {
        self.cache_watch_namespace
            .as_deref()
            .filter(|ns| !ns.is_empty())
            .map(String::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> Vec<&'static str> {
        vec![
            "natsgate",
            "--broker-url",
            "nats://127.0.0.1:4222",
            "--broker-credentials-file",
            "/etc/natsgate/service.creds",
            "--broker-account",
            "APP",
            "--issuer-expected-issuer",
            "https://kubernetes.default.svc",
        ]
    }

    #[test]
    fn defaults_match_documented_values() {
        let mut args = base_args();
        args.extend(["--issuer-jwks-path", "/etc/natsgate/jwks.json"]);
        let config = Config::try_parse_from(args).unwrap();
        assert_eq!(config.issuer_expected_audience, "nats");
        assert_eq!(config.cache_annotation_prefix, "nats.io/");
        assert_eq!(config.cache_cleanup_interval, Duration::from_secs(15 * 60));
        assert!(config.cache_read_through);
        assert_eq!(config.keyset_refresh_interval, Duration::from_secs(3600));
        assert_eq!(config.keyset_min_refresh_gap, Duration::from_secs(300));
        assert_eq!(config.keyset_fetch_timeout, Duration::from_secs(10));
        assert_eq!(config.token_ttl, Duration::from_secs(300));
        assert_eq!(config.log_level, "info");
        assert!(!config.log_json);
    }

    #[test]
    fn humantime_durations_parse() {
        let mut args = base_args();
        args.extend([
            "--issuer-jwks-path",
            "/jwks.json",
            "--keyset-refresh-interval",
            "90s",
            "--token-ttl",
            "2m",
        ]);
        let config = Config::try_parse_from(args).unwrap();
        assert_eq!(config.keyset_refresh_interval, Duration::from_secs(90));
        assert_eq!(config.token_ttl, Duration::from_secs(120));
    }

    #[test]
    fn exactly_one_key_set_source() {
        let mut args = base_args();
        args.extend(["--issuer-jwks-url", "https://issuer/jwks"]);
        let config = Config::try_parse_from(args).unwrap();
        assert!(matches!(
            config.key_set_source().unwrap(),
            KeySetSource::Url(_)
        ));

        let config = Config::try_parse_from(base_args()).unwrap();
        assert!(config.key_set_source().is_err());

        let mut args = base_args();
        args.extend([
            "--issuer-jwks-url",
            "https://issuer/jwks",
            "--issuer-jwks-path",
            "/jwks.json",
        ]);
        let config = Config::try_parse_from(args).unwrap();
        assert!(config.key_set_source().is_err());
    }

    #[test]
    fn empty_watch_namespace_means_cluster_wide() {
        let mut args = base_args();
        args.extend(["--issuer-jwks-path", "/jwks.json", "--cache-watch-namespace", ""]);
        let config = Config::try_parse_from(args).unwrap();
        assert_eq!(config.watch_namespace(), None);

        let mut args = base_args();
        args.extend([
            "--issuer-jwks-path",
            "/jwks.json",
            "--cache-watch-namespace",
            "payments",
        ]);
        let config = Config::try_parse_from(args).unwrap();
        assert_eq!(config.watch_namespace().as_deref(), Some("payments"));
    }
}
