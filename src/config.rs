use crate::{
    services::{
        policy::DefaultPolicy,
        signer::{MAX_URL_TTL_SECS, UrlSigner},
    },
    transfer::engine::RetryPolicy,
};
use anyhow::{Context, Result, bail};
use clap::Parser;
use std::{env, str::FromStr, time::Duration};

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    /// Base URL of the storage service signed URLs point at.
    pub endpoint: String,
    pub signing_secret: String,
    pub url_ttl_secs: u64,
    pub key_prefix: Option<String>,
    pub allowed_buckets: Vec<String>,
    pub max_operations: usize,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Gatekeeper issuing signed object-store URLs")]
pub struct Args {
    /// Host to bind to (overrides GATEKEEPER_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides GATEKEEPER_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Storage endpoint signed URLs address (overrides GATEKEEPER_ENDPOINT)
    #[arg(long)]
    pub endpoint: Option<String>,

    /// HMAC secret shared with the storage service (overrides GATEKEEPER_SIGNING_SECRET)
    #[arg(long)]
    pub signing_secret: Option<String>,

    /// Lifetime of signed URLs in seconds (overrides GATEKEEPER_URL_TTL_SECS)
    #[arg(long)]
    pub url_ttl_secs: Option<u64>,

    /// Prefix forced onto every granted key (overrides GATEKEEPER_KEY_PREFIX)
    #[arg(long)]
    pub key_prefix: Option<String>,

    /// Comma-separated buckets clients may use (overrides GATEKEEPER_ALLOWED_BUCKETS)
    #[arg(long, value_delimiter = ',')]
    pub allowed_buckets: Option<Vec<String>>,

    /// Operations authorized per request (overrides GATEKEEPER_MAX_OPERATIONS)
    #[arg(long)]
    pub max_operations: Option<usize>,
}

/// Parse an optional variable, falling back to `default` when it is unset.
fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(name) {
        Some(value) => value
            .trim()
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        None => Ok(default),
    }
}

fn env_lookup(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig.
    pub fn from_env_and_args() -> Result<Self> {
        Self::merge(Args::parse(), env_lookup)
    }

    /// CLI values win over environment values, which win over defaults.
    pub fn merge(args: Args, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let env_host = lookup("GATEKEEPER_HOST").unwrap_or_else(|| "0.0.0.0".into());
        let env_port = parse_var(&lookup, "GATEKEEPER_PORT", 3000u16)?;
        let env_endpoint =
            lookup("GATEKEEPER_ENDPOINT").unwrap_or_else(|| "http://127.0.0.1:9000/".into());
        let env_ttl = parse_var(&lookup, "GATEKEEPER_URL_TTL_SECS", 300u64)?;
        let env_max_ops = parse_var(&lookup, "GATEKEEPER_MAX_OPERATIONS", 1000usize)?;
        let env_buckets = lookup("GATEKEEPER_ALLOWED_BUCKETS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|b| !b.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        let Some(signing_secret) = args
            .signing_secret
            .or_else(|| lookup("GATEKEEPER_SIGNING_SECRET"))
        else {
            bail!("a signing secret is required (--signing-secret or GATEKEEPER_SIGNING_SECRET)");
        };

        let url_ttl_secs = args.url_ttl_secs.unwrap_or(env_ttl);
        if url_ttl_secs == 0 || url_ttl_secs > MAX_URL_TTL_SECS {
            bail!(
                "url lifetime must be between 1 and {} seconds, got {}",
                MAX_URL_TTL_SECS,
                url_ttl_secs
            );
        }

        Ok(Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            endpoint: args.endpoint.unwrap_or(env_endpoint),
            signing_secret,
            url_ttl_secs,
            key_prefix: args.key_prefix.or_else(|| lookup("GATEKEEPER_KEY_PREFIX")),
            allowed_buckets: args.allowed_buckets.unwrap_or(env_buckets),
            max_operations: args.max_operations.unwrap_or(env_max_ops),
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn signer(&self) -> Result<UrlSigner> {
        UrlSigner::new(
            &self.signing_secret,
            &self.endpoint,
            Duration::from_secs(self.url_ttl_secs),
        )
        .with_context(|| format!("configuring signer for endpoint `{}`", self.endpoint))
    }

    pub fn policy(&self) -> DefaultPolicy {
        DefaultPolicy {
            allowed_buckets: self.allowed_buckets.iter().cloned().collect(),
            key_prefix: self.key_prefix.clone(),
            max_operations: self.max_operations,
            ..DefaultPolicy::default()
        }
    }
}

/// Settings for embedding the transfer engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferConfig {
    pub concurrency: usize,
    pub retry_ceiling: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            retry_ceiling: 3,
            backoff_base_ms: 200,
            backoff_max_ms: 5_000,
        }
    }
}

impl TransferConfig {
    /// Read `TRANSFER_*` variables from `lookup` over the defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            concurrency: parse_var(&lookup, "TRANSFER_CONCURRENCY", defaults.concurrency)?,
            retry_ceiling: parse_var(&lookup, "TRANSFER_RETRY_CEILING", defaults.retry_ceiling)?,
            backoff_base_ms: parse_var(&lookup, "TRANSFER_BACKOFF_BASE_MS", defaults.backoff_base_ms)?,
            backoff_max_ms: parse_var(&lookup, "TRANSFER_BACKOFF_MAX_MS", defaults.backoff_max_ms)?,
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            ceiling: self.retry_ceiling,
            backoff_base: Duration::from_millis(self.backoff_base_ms),
            backoff_max: Duration::from_millis(self.backoff_max_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| map.get(name).cloned()
    }

    #[test]
    fn cli_overrides_environment() {
        let args = Args {
            port: Some(8080),
            signing_secret: Some("cli-secret".into()),
            ..Args::default()
        };
        let cfg = AppConfig::merge(
            args,
            vars(&[
                ("GATEKEEPER_PORT", "7000"),
                ("GATEKEEPER_SIGNING_SECRET", "env-secret"),
                ("GATEKEEPER_ALLOWED_BUCKETS", "a, b,,c"),
            ]),
        )
        .unwrap();
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.signing_secret, "cli-secret");
        assert_eq!(cfg.allowed_buckets, vec!["a", "b", "c"]);
        assert_eq!(cfg.addr(), "0.0.0.0:8080");
        assert_eq!(cfg.policy().allowed_buckets.len(), 3);
        assert!(cfg.signer().is_ok());
    }

    #[test]
    fn missing_secret_is_an_error() {
        assert!(AppConfig::merge(Args::default(), vars(&[])).is_err());
    }

    #[test]
    fn bad_numbers_are_reported() {
        let err = AppConfig::merge(
            Args::default(),
            vars(&[("GATEKEEPER_SIGNING_SECRET", "s"), ("GATEKEEPER_PORT", "http")]),
        )
        .unwrap_err();
        assert!(err.to_string().contains("GATEKEEPER_PORT"));
    }

    #[test]
    fn url_lifetime_is_bounded() {
        let args = |ttl| Args {
            signing_secret: Some("s".into()),
            url_ttl_secs: Some(ttl),
            ..Args::default()
        };
        assert!(AppConfig::merge(args(MAX_URL_TTL_SECS), vars(&[])).is_ok());
        for ttl in [0, MAX_URL_TTL_SECS + 1, u64::MAX] {
            let err = AppConfig::merge(args(ttl), vars(&[])).unwrap_err();
            assert!(err.to_string().contains("url lifetime"), "{ttl} accepted");
        }
    }

    #[test]
    fn transfer_config_reads_overrides() {
        let cfg = TransferConfig::from_lookup(vars(&[("TRANSFER_RETRY_CEILING", "5")])).unwrap();
        assert_eq!(cfg.retry_ceiling, 5);
        assert_eq!(cfg.concurrency, 4);
        assert_eq!(cfg.retry_policy().ceiling, 5);
    }
}
