//! Service configuration, built from environment variables.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::dispatch::GraphConfig;
use crate::error::ConfigError;
use crate::llm::LlmConfig;
use crate::queue::RetryPolicy;

/// Inbound webhook settings.
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    /// Token the platform echoes back during the subscription handshake.
    pub verify_token: SecretString,
    /// App secret for `X-Hub-Signature-256`. `None` disables verification.
    pub app_secret: Option<SecretString>,
}

/// Worker pool settings.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub concurrency: usize,
    /// Idle wait between claim attempts when no wakeup arrives.
    pub poll_interval: Duration,
    /// How long a claimed job stays invisible to other workers.
    pub lease: Duration,
    /// USER-turn count at which qualification first runs.
    pub qualify_threshold: usize,
    /// Further USER turns between re-qualifications. 0 qualifies only once.
    pub requalify_every: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            poll_interval: Duration::from_secs(1),
            lease: Duration::from_secs(300), // 5 minutes
            qualify_threshold: 3,
            requalify_every: 1,
        }
    }
}

/// Everything `main` needs to assemble the service.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub bind_addr: SocketAddr,
    pub db_path: PathBuf,
    pub webhook: WebhookConfig,
    pub worker: WorkerConfig,
    pub retry: RetryPolicy,
    /// `None` when no API key is set: generation runs unconfigured.
    pub llm: Option<LlmConfig>,
    pub dispatch: GraphConfig,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the config from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);

        let bind_addr = env.parse_or("SETTER_BIND_ADDR", SocketAddr::from(([0, 0, 0, 0], 3000)))?;
        let db_path = env
            .get("SETTER_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./data/setter-ai.db"));

        let verify_token = env.secret("META_VERIFY_TOKEN").ok_or_else(|| {
            ConfigError::MissingRequired {
                key: "META_VERIFY_TOKEN".into(),
                hint: "Set it to the verify token configured on the Meta app webhook.".into(),
            }
        })?;
        let app_secret = env.secret("META_APP_SECRET");
        let require_signature = env.parse_or("SETTER_REQUIRE_SIGNATURE", false)?;
        if require_signature && app_secret.is_none() {
            return Err(ConfigError::MissingRequired {
                key: "META_APP_SECRET".into(),
                hint: "SETTER_REQUIRE_SIGNATURE is on, so webhook signatures must be verifiable."
                    .into(),
            });
        }

        let defaults = WorkerConfig::default();
        let worker = WorkerConfig {
            concurrency: env.parse_or("SETTER_WORKER_CONCURRENCY", defaults.concurrency)?,
            poll_interval: env.millis_or("SETTER_POLL_INTERVAL_MS", defaults.poll_interval)?,
            lease: env.secs_or("SETTER_JOB_LEASE_SECS", defaults.lease)?,
            qualify_threshold: env.parse_or("SETTER_QUALIFY_THRESHOLD", defaults.qualify_threshold)?,
            requalify_every: env.parse_or("SETTER_REQUALIFY_EVERY", defaults.requalify_every)?,
        };
        if worker.concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                key: "SETTER_WORKER_CONCURRENCY".into(),
                message: "must be at least 1".into(),
            });
        }

        let retry_defaults = RetryPolicy::default();
        let retry = RetryPolicy {
            max_attempts: env.parse_or("SETTER_JOB_MAX_ATTEMPTS", retry_defaults.max_attempts)?,
            base_delay: env.secs_or("SETTER_RETRY_BASE_SECS", retry_defaults.base_delay)?,
            max_delay: env.secs_or("SETTER_RETRY_MAX_SECS", retry_defaults.max_delay)?,
        };

        let llm = match env.secret("ANTHROPIC_API_KEY") {
            Some(api_key) => Some(LlmConfig {
                api_key,
                model: env
                    .get("SETTER_MODEL")
                    .unwrap_or_else(|| "claude-sonnet-4-20250514".to_string()),
                base_url: env.get("ANTHROPIC_BASE_URL"),
                max_tokens: env.parse_or("SETTER_MAX_TOKENS", 1024)?,
                timeout: env.secs_or("SETTER_LLM_TIMEOUT_SECS", Duration::from_secs(30))?,
            }),
            None => None,
        };

        let graph_defaults = GraphConfig::default();
        let dispatch = GraphConfig {
            base_url: env.get("META_GRAPH_BASE_URL").unwrap_or(graph_defaults.base_url),
            api_version: env.get("META_GRAPH_VERSION").unwrap_or(graph_defaults.api_version),
            timeout: env.secs_or("SETTER_DISPATCH_TIMEOUT_SECS", graph_defaults.timeout)?,
        };

        Ok(Self {
            bind_addr,
            db_path,
            webhook: WebhookConfig {
                verify_token,
                app_secret,
            },
            worker,
            retry,
            llm,
            dispatch,
        })
    }
}

struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Unset and blank values both count as absent.
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|v| !v.trim().is_empty())
    }

    fn secret(&self, key: &str) -> Option<SecretString> {
        self.get(key).map(SecretString::from)
    }

    fn parse_or<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("{raw:?}: {e}"),
            }),
            None => Ok(default),
        }
    }

    fn secs_or(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        self.parse_or::<u64>(key, default.as_secs())
            .map(Duration::from_secs)
    }

    fn millis_or(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        let ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
        self.parse_or::<u64>(key, ms).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<ServiceConfig, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServiceConfig::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn defaults_with_only_verify_token() {
        let config = load(&[("META_VERIFY_TOKEN", "verify-me")]).unwrap();
        assert_eq!(config.webhook.verify_token.expose_secret(), "verify-me");
        assert!(config.webhook.app_secret.is_none());
        assert_eq!(config.worker.concurrency, 5);
        assert_eq!(config.worker.qualify_threshold, 3);
        assert_eq!(config.retry, RetryPolicy::default());
        assert!(config.llm.is_none());
        assert_eq!(config.dispatch.api_version, "v18.0");
        assert_eq!(config.bind_addr.port(), 3000);
    }

    #[test]
    fn missing_verify_token_is_an_error() {
        let err = load(&[]).unwrap_err();
        assert!(matches!(err, ConfigError::MissingRequired { ref key, .. } if key == "META_VERIFY_TOKEN"));
    }

    #[test]
    fn required_signature_needs_secret() {
        let err = load(&[
            ("META_VERIFY_TOKEN", "t"),
            ("SETTER_REQUIRE_SIGNATURE", "true"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::MissingRequired { ref key, .. } if key == "META_APP_SECRET"));

        let config = load(&[
            ("META_VERIFY_TOKEN", "t"),
            ("SETTER_REQUIRE_SIGNATURE", "true"),
            ("META_APP_SECRET", "s3cret"),
        ])
        .unwrap();
        assert!(config.webhook.app_secret.is_some());
    }

    #[test]
    fn invalid_number_is_rejected() {
        let err = load(&[
            ("META_VERIFY_TOKEN", "t"),
            ("SETTER_WORKER_CONCURRENCY", "lots"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let err = load(&[
            ("META_VERIFY_TOKEN", "t"),
            ("SETTER_WORKER_CONCURRENCY", "0"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn api_key_enables_generation() {
        let config = load(&[
            ("META_VERIFY_TOKEN", "t"),
            ("ANTHROPIC_API_KEY", "sk-ant-test"),
            ("SETTER_LLM_TIMEOUT_SECS", "12"),
        ])
        .unwrap();
        let llm = config.llm.unwrap();
        assert_eq!(llm.timeout, Duration::from_secs(12));
        assert_eq!(llm.max_tokens, 1024);
    }

    #[test]
    fn blank_values_fall_back_to_defaults() {
        let config = load(&[
            ("META_VERIFY_TOKEN", "t"),
            ("ANTHROPIC_API_KEY", "  "),
            ("SETTER_POLL_INTERVAL_MS", ""),
        ])
        .unwrap();
        assert!(config.llm.is_none());
        assert_eq!(config.worker.poll_interval, Duration::from_secs(1));
    }
}
