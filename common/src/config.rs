//! Environment-driven configuration.
//!
//! Every setting can be given as a flag or through its environment variable
//! and has a default, so the binary starts with no configuration at all.

use std::collections::HashMap;
use std::time::Duration;

/// Broker connection and addressing.
#[derive(clap::Args, Debug, Clone)]
pub struct BrokerConfig {
    // ---
    /// Broker service URL. `memory://` runs an in-process loopback broker.
    #[arg(long = "broker-url", env = "PULSAR_URL", default_value = "pulsar://localhost:6650")]
    pub url: String,

    /// Token for broker authentication. Anonymous access when unset or empty.
    #[arg(long, env = "PULSAR_AUTH_TOKEN", hide_env_values = true)]
    pub auth_token: Option<String>,

    /// Topic to publish to and consume from
    #[arg(long, env = "PULSAR_TOPIC", default_value = "my-topic")]
    pub topic: String,

    /// Producer name announced to the broker
    #[arg(long, env = "PULSAR_PRODUCER_NAME", default_value = "my-producer")]
    pub producer_name: String,

    /// Shared subscription the consumer joins
    #[arg(long, env = "PULSAR_SUBSCRIPTION", default_value = "my-subscription")]
    pub subscription: String,

    /// Per-operation timeout enforced by the broker client
    #[arg(long, env = "PULSAR_OPERATION_TIMEOUT_SECS", default_value = "30")]
    pub operation_timeout_secs: u64,

    /// Connection timeout enforced by the broker client
    #[arg(long, env = "PULSAR_CONNECTION_TIMEOUT_SECS", default_value = "30")]
    pub connection_timeout_secs: u64,
}

impl BrokerConfig {
    // ---
    /// Returns the auth token, treating an empty value as absent.
    pub fn token(&self) -> Option<&str> {
        // ---
        self.auth_token.as_deref().filter(|t| !t.is_empty())
    }

    pub fn operation_timeout(&self) -> Duration {
        // ---
        Duration::from_secs(self.operation_timeout_secs)
    }

    pub fn connection_timeout(&self) -> Duration {
        // ---
        Duration::from_secs(self.connection_timeout_secs)
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        // ---
        Self {
            url: "pulsar://localhost:6650".to_string(),
            auth_token: None,
            topic: "my-topic".to_string(),
            producer_name: "my-producer".to_string(),
            subscription: "my-subscription".to_string(),
            operation_timeout_secs: 30,
            connection_timeout_secs: 30,
        }
    }
}

/// Telemetry exporter settings.
#[derive(clap::Args, Debug, Clone)]
pub struct ExporterConfig {
    // ---
    /// OTLP/gRPC collector endpoint. Spans and metrics go to stdout when unset.
    #[arg(long = "otlp-endpoint", env = "OTEL_EXPORTER_OTLP_ENDPOINT")]
    pub endpoint: Option<String>,

    /// Connect to the collector without TLS
    #[arg(
        long = "otlp-insecure",
        env = "OTEL_EXPORTER_OTLP_INSECURE",
        value_parser = clap::builder::FalseyValueParser::new()
    )]
    pub insecure: bool,

    /// Extra exporter headers as `key1=value1,key2=value2`
    #[arg(long = "otlp-headers", env = "OTEL_EXPORTER_OTLP_HEADERS", hide_env_values = true)]
    pub headers: Option<String>,

    /// How often the metric reader pushes
    #[arg(long, env = "OTEL_METRIC_EXPORT_INTERVAL_SECS", default_value = "15")]
    pub export_interval_secs: u64,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        // ---
        Self {
            endpoint: None,
            insecure: false,
            headers: None,
            export_interval_secs: 15,
        }
    }
}

/// Pacing of the three long-running loops and of shutdown.
///
/// The defaults mirror a demo deployment; none of them is a rate contract.
#[derive(clap::Args, Debug, Clone)]
pub struct LoopConfig {
    // ---
    /// Delay between two publishes
    #[arg(long, env = "APP_PUBLISH_INTERVAL_MS", default_value = "2000")]
    pub publish_interval_ms: u64,

    /// Simulated processing time per consumed message
    #[arg(long, env = "APP_PROCESSING_DELAY_MS", default_value = "500")]
    pub processing_delay_ms: u64,

    /// Pause before retrying after a failed receive
    #[arg(long, env = "APP_RECEIVE_RETRY_MS", default_value = "100")]
    pub receive_retry_ms: u64,

    /// Host sampling interval
    #[arg(long, env = "APP_SAMPLE_INTERVAL_SECS", default_value = "15")]
    pub sample_interval_secs: u64,

    /// Grace period granted to each resource at shutdown
    #[arg(long, env = "APP_SHUTDOWN_GRACE_SECS", default_value = "5")]
    pub shutdown_grace_secs: u64,

    /// Prefix for message metric names
    #[arg(long, env = "APP_METRICS_NAMESPACE", default_value = "pulsar")]
    pub metrics_namespace: String,
}

impl LoopConfig {
    // ---
    pub fn publish_interval(&self) -> Duration {
        // ---
        Duration::from_millis(self.publish_interval_ms)
    }

    pub fn processing_delay(&self) -> Duration {
        // ---
        Duration::from_millis(self.processing_delay_ms)
    }

    pub fn receive_retry(&self) -> Duration {
        // ---
        Duration::from_millis(self.receive_retry_ms)
    }

    pub fn sample_interval(&self) -> Duration {
        // ---
        Duration::from_secs(self.sample_interval_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        // ---
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

impl Default for LoopConfig {
    fn default() -> Self {
        // ---
        Self {
            publish_interval_ms: 2000,
            processing_delay_ms: 500,
            receive_retry_ms: 100,
            sample_interval_secs: 15,
            shutdown_grace_secs: 5,
            metrics_namespace: "pulsar".to_string(),
        }
    }
}

/// Parses `key1=value1,key2=value2` into a map.
///
/// Pairs without `=` or with an empty key are dropped silently. Values may
/// contain further `=` characters; surrounding whitespace is trimmed.
pub fn parse_headers(header_string: &str) -> HashMap<String, String> {
    // ---
    header_string
        .split(',')
        .filter_map(|pair| pair.split_once('='))
        .map(|(key, value)| (key.trim(), value.trim()))
        .filter(|(key, _)| !key.is_empty())
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_malformed_pair_is_dropped() {
        // ---
        let headers = parse_headers("a=1,b");
        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get("a").map(String::as_str), Some("1"));
    }

    #[test]
    fn test_value_keeps_embedded_equals() {
        // ---
        let headers = parse_headers("authorization=Basic dXNlcjpwYXNz==,x-team=core");
        assert_eq!(
            headers.get("authorization").map(String::as_str),
            Some("Basic dXNlcjpwYXNz==")
        );
        assert_eq!(headers.get("x-team").map(String::as_str), Some("core"));
    }

    #[test]
    fn test_empty_string_parses_to_empty_map() {
        // ---
        assert!(parse_headers("").is_empty());
        assert!(parse_headers(",,=x").is_empty());
    }

    #[test]
    fn test_empty_token_means_anonymous() {
        // ---
        let cfg = BrokerConfig {
            auth_token: Some(String::new()),
            ..BrokerConfig::default()
        };
        assert_eq!(cfg.token(), None);

        let cfg = BrokerConfig {
            auth_token: Some("secret".into()),
            ..BrokerConfig::default()
        };
        assert_eq!(cfg.token(), Some("secret"));
    }
}
