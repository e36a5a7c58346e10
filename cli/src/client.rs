//! mTLS channel construction for the CLI.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use runner_proto::runner_client::RunnerClient;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Identity};

/// Connect to the server using client.crt / client.key / ca.crt from
/// `certs_dir`. `domain` is the name the server certificate is expected to
/// carry.
pub async fn connect(server: &str, certs_dir: &Path, domain: &str) -> Result<RunnerClient<Channel>> {
    let read = |name: &str| {
        let path = certs_dir.join(name);
        fs::read(&path).with_context(|| format!("failed to read {}", path.display()))
    };
    let ca = read("ca.crt")?;
    let cert = read("client.crt")?;
    let key = read("client.key")?;

    let tls = ClientTlsConfig::new()
        .domain_name(domain)
        .ca_certificate(Certificate::from_pem(ca))
        .identity(Identity::from_pem(cert, key));

    let channel = Channel::from_shared(server.to_string())
        .with_context(|| format!("invalid server url {server}"))?
        .tls_config(tls)
        .context("invalid tls configuration")?
        .connect()
        .await
        .with_context(|| format!("failed to connect to {server}"))?;
    Ok(RunnerClient::new(channel))
}
