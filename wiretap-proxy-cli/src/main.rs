use clap::Parser;
use std::path::Path;
use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;
use wiretap_net::{RootAuthority, generate_ca};
use wiretap_proxy::{Proxy, ProxyConfig};
use wiretap_storage::SqliteStore;

const GENERATED_CA_NAME: &str = "wiretap root CA";

#[derive(Debug, Parser)]
#[command(name = "wiretap", about = "Intercepting HTTP/HTTPS proxy")]
struct Cli {
    /// PEM certificate of the signing root.
    #[arg(long = "ca-cert", default_value = "ca.crt")]
    ca_cert: String,

    /// PEM private key of the signing root.
    #[arg(long = "ca-key", default_value = "ca.key")]
    ca_key: String,

    #[arg(long = "proxy-addr", default_value = "0.0.0.0:8080")]
    proxy_addr: String,

    /// SQLite database receiving captured exchanges.
    #[arg(long = "db", default_value = "wiretap.db")]
    db: String,

    #[arg(long = "max-connections")]
    max_connections: Option<usize>,

    /// Extra PEM roots trusted when verifying origins. Repeatable.
    #[arg(long = "upstream-ca")]
    upstream_ca: Vec<String>,

    /// Create a root pair at the configured paths when none exists.
    #[arg(long = "generate-ca")]
    generate_ca: bool,

    /// Re-send the stored capture with this id, print the origin's reply and exit.
    #[arg(long = "replay", value_name = "ID")]
    replay: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<(), String> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = build_config(&cli)?;

    if cli.generate_ca {
        ensure_authority(&config.tls.ca_cert_path, &config.tls.ca_key_path)?;
    }
    let authority = RootAuthority::load(&config.tls.ca_cert_path, &config.tls.ca_key_path)
        .map_err(|err| err.to_string())?;
    info!(subject = %authority.subject, not_after = %authority.not_after, "loaded root authority");

    let store = SqliteStore::open(&config.storage.database_path).map_err(|err| err.to_string())?;
    let proxy = Proxy::new(config, authority, Arc::new(store)).map_err(|err| err.to_string())?;
    if let Some(id) = cli.replay {
        let outcome = proxy.replay(id).await.map_err(|err| err.to_string())?;
        info!(id, capture = ?outcome.capture_id, status = outcome.response.status_code, "replay finished");
        print!("{}", String::from_utf8_lossy(&outcome.raw));
        return Ok(());
    }
    proxy.run().await.map_err(|err| err.to_string())
}

fn build_config(cli: &Cli) -> Result<ProxyConfig, String> {
    let (host, port) = cli
        .proxy_addr
        .rsplit_once(':')
        .ok_or_else(|| format!("proxy address {:?} has no port", cli.proxy_addr))?;
    let port = port
        .parse::<u16>()
        .map_err(|err| format!("proxy address {:?}: {err}", cli.proxy_addr))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');

    let mut config = ProxyConfig::default();
    config.listen.host = if host.is_empty() { "0.0.0.0" } else { host }.to_string();
    config.listen.port = port;
    config.tls.ca_cert_path = cli.ca_cert.clone();
    config.tls.ca_key_path = cli.ca_key.clone();
    config.tls.upstream_roots = cli.upstream_ca.clone();
    config.limits.max_connections = cli.max_connections;
    config.storage.database_path = cli.db.clone();
    Ok(config)
}

fn ensure_authority(cert_path: &str, key_path: &str) -> Result<(), String> {
    if Path::new(cert_path).exists() && Path::new(key_path).exists() {
        return Ok(());
    }
    let authority = generate_ca(GENERATED_CA_NAME).map_err(|err| err.to_string())?;
    authority
        .write_pem(cert_path, key_path)
        .map_err(|err| err.to_string())?;
    info!(cert = cert_path, key = key_path, "generated root authority");
    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::{Cli, build_config};

    #[test]
    fn flags_map_onto_config() {
        let cli = Cli::parse_from([
            "wiretap",
            "--proxy-addr",
            "127.0.0.1:3128",
            "--db",
            "captures.db",
            "--max-connections",
            "64",
            "--upstream-ca",
            "a.pem",
            "--upstream-ca",
            "b.pem",
        ]);
        let config = build_config(&cli).unwrap();
        assert_eq!(config.listen.address(), "127.0.0.1:3128");
        assert_eq!(config.storage.database_path, "captures.db");
        assert_eq!(config.limits.max_connections, Some(64));
        assert_eq!(config.tls.upstream_roots, vec!["a.pem", "b.pem"]);
        assert_eq!(config.tls.ca_cert_path, "ca.crt");
    }

    #[test]
    fn replay_takes_a_capture_id() {
        let cli = Cli::parse_from(["wiretap", "--replay", "42"]);
        assert_eq!(cli.replay, Some(42));
        assert!(Cli::try_parse_from(["wiretap", "--replay", "latest"]).is_err());
        assert_eq!(Cli::parse_from(["wiretap"]).replay, None);
    }

    #[test]
    fn bare_port_listens_everywhere() {
        let cli = Cli::parse_from(["wiretap", "--proxy-addr", ":8080"]);
        assert_eq!(build_config(&cli).unwrap().listen.address(), "0.0.0.0:8080");
    }

    #[test]
    fn address_without_port_is_rejected() {
        let cli = Cli::parse_from(["wiretap", "--proxy-addr", "localhost"]);
        assert!(build_config(&cli).is_err());
    }
}
