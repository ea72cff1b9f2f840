use clap::Parser;
use lib_common::identity::{DirectCertOrder, TlsPassThrough};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Routing applied when no dispatch rules are configured anywhere.
const DEFAULT_DISPATCH_RULES: &str = r#"{"V":["logger"]}"#;

#[derive(Parser, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "INGRESS_HOST", default_value = "0.0.0.0")]
    pub host: String,

    #[clap(long, env = "INGRESS_PORT", default_value = "8443")]
    pub port: u16,

    #[clap(long, env = "INGRESS_CONFIG_PATH")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "INGRESS_LOG_DIR", default_value = "./logs")]
    pub log_dir: PathBuf,

    #[clap(long, env = "INGRESS_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[clap(long, env = "TLS_CERT_PATH")]
    pub tls_cert_path: Option<PathBuf>,

    #[clap(long, env = "TLS_KEY_PATH")]
    pub tls_key_path: Option<PathBuf>,

    /// CA bundle used to require and verify client certificates when this
    /// process terminates TLS itself.
    #[clap(long, env = "TLS_CLIENT_CA_PATH")]
    pub tls_client_ca_path: Option<PathBuf>,

    /// Identity extraction mode: unset for direct TLS, "RFC9440" or
    /// "AWSApplicationLoadBalancer" behind a terminating balancer.
    #[clap(long, env = "TLS_PASS_THROUGH")]
    pub tls_pass_through: Option<String>,

    /// Which end of the peer chain direct-TLS extraction reads ("last",
    /// the default, or "first").
    #[clap(long, env = "DIRECT_CERT_ORDER")]
    pub direct_cert_order: Option<String>,

    /// Attach the decoded envelope to each record handed to sinks.
    #[clap(long, env = "INGRESS_TRANSMIT_DECODED")]
    pub transmit_decoded_records: bool,

    /// JSON object mapping topics to ordered producer names,
    /// e.g. {"V":["logger"],"connectivity":["logger"]}.
    #[clap(long, env = "INGRESS_DISPATCH_RULES")]
    pub dispatch_rules: Option<String>,

    /// JSON object mapping record types to the dispatcher that acks them,
    /// e.g. {"V":"kafka"}.
    #[clap(long, env = "INGRESS_RELIABLE_ACK_SOURCES")]
    pub reliable_ack_sources: Option<String>,
}

impl Config {
    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid bind address: {e}"))
    }

    pub fn pass_through(&self) -> anyhow::Result<TlsPassThrough> {
        self.tls_pass_through
            .as_deref()
            .unwrap_or("")
            .parse()
            .map_err(|e: String| anyhow::anyhow!(e))
    }

    pub fn cert_order(&self) -> anyhow::Result<DirectCertOrder> {
        self.direct_cert_order
            .as_deref()
            .unwrap_or("last")
            .parse()
            .map_err(|e: String| anyhow::anyhow!(e))
    }

    pub fn parsed_dispatch_rules(&self) -> anyhow::Result<HashMap<String, Vec<String>>> {
        serde_json::from_str(self.dispatch_rules.as_deref().unwrap_or(DEFAULT_DISPATCH_RULES))
            .map_err(|e| anyhow::anyhow!("invalid dispatch_rules: {e}"))
    }

    pub fn parsed_reliable_ack_sources(&self) -> anyhow::Result<HashMap<String, String>> {
        serde_json::from_str(self.reliable_ack_sources.as_deref().unwrap_or("{}"))
            .map_err(|e| anyhow::anyhow!("invalid reliable_ack_sources: {e}"))
    }
}

/// Command-line arguments override file configuration; unset optional
/// fields fall back to the file's values.
fn merge(cli_config: Config, file_config: Config) -> Config {
    Config {
        host: cli_config.host,
        port: cli_config.port,
        config_path: cli_config.config_path.or(file_config.config_path),
        log_dir: cli_config.log_dir,
        log_level: cli_config.log_level,
        tls_cert_path: cli_config.tls_cert_path.or(file_config.tls_cert_path),
        tls_key_path: cli_config.tls_key_path.or(file_config.tls_key_path),
        tls_client_ca_path: cli_config.tls_client_ca_path.or(file_config.tls_client_ca_path),
        tls_pass_through: cli_config.tls_pass_through.or(file_config.tls_pass_through),
        direct_cert_order: cli_config.direct_cert_order.or(file_config.direct_cert_order),
        transmit_decoded_records: cli_config.transmit_decoded_records
            || file_config.transmit_decoded_records,
        dispatch_rules: cli_config.dispatch_rules.or(file_config.dispatch_rules),
        reliable_ack_sources: cli_config
            .reliable_ack_sources
            .or(file_config.reliable_ack_sources),
    }
}

pub fn load_config() -> Config {
    let cli_config = Config::parse();

    // Runs before the logger is installed, hence eprintln for diagnostics.
    let config_from_file = cli_config.config_path.as_ref().and_then(|path| {
        fs::read_to_string(path)
            .map_err(|e| eprintln!("cannot read config file {}: {}", path.display(), e))
            .ok()
            .and_then(|c| {
                serde_json::from_str::<Config>(&c)
                    .map_err(|e| eprintln!("cannot parse config file {}: {}", path.display(), e))
                    .ok()
            })
    });

    match config_from_file {
        Some(file_config) => merge(cli_config, file_config),
        None => cli_config,
    }
}
