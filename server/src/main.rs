mod interceptors;
mod service;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use runner_proto::runner_server::RunnerServer;
use runnerlib::RunnerConfig;
use tonic::transport::{Certificate, Identity, Server, ServerTlsConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

use interceptors::cert;
use service::RunnerService;

/// Remote job execution server.
#[derive(Debug, Parser)]
#[command(name = "runner-server")]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = "[::]:9000")]
    listen: SocketAddr,
    /// Directory holding ca.crt, server.crt and server.key.
    #[arg(long)]
    certs_dir: PathBuf,
    /// Base scratch directory for job state.
    #[arg(long, default_value = "/tmp/runner")]
    runner_home: PathBuf,
    /// Root filesystem template copied for every job; defaults to
    /// <runner-home>/rootfs.
    #[arg(long)]
    rootfs: Option<PathBuf>,
    /// Verbose logging.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.debug);

    let config = RunnerConfig {
        rootfs_source: args
            .rootfs
            .unwrap_or_else(|| args.runner_home.join("rootfs")),
        runner_home: args.runner_home,
        debug: args.debug,
    };
    serve(args.listen, &args.certs_dir, Arc::new(config)).await
}

fn init_tracing(debug: bool) {
    let default_filter = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn serve(addr: SocketAddr, certs_dir: &Path, config: Arc<RunnerConfig>) -> Result<()> {
    let tls = load_tls_config(certs_dir)?;
    let service = RunnerService::new(config).context("failed to initialize job runner")?;

    info!(%addr, "listening");
    Server::builder()
        .tls_config(tls)
        .context("invalid tls configuration")?
        .add_service(RunnerServer::with_interceptor(
            service,
            cert::extract_common_name,
        ))
        .serve(addr)
        .await
        .context("server exited with error")
}

fn load_tls_config(certs_dir: &Path) -> Result<ServerTlsConfig> {
    let read = |name: &str| {
        let path = certs_dir.join(name);
        std::fs::read(&path).with_context(|| format!("failed to read {}", path.display()))
    };
    let cert = read("server.crt")?;
    let key = read("server.key")?;
    let ca = read("ca.crt")?;
    // Client certificates are mandatory; the common name of the verified
    // peer certificate becomes the job owner identity.
    Ok(ServerTlsConfig::new()
        .identity(Identity::from_pem(cert, key))
        .client_ca_root(Certificate::from_pem(ca)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{
        BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
    };
    use runner_proto::runner_client::RunnerClient;
    use runner_proto::{StartRequest, StatusRequest, StopRequest};
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;
    use tonic::transport::{Channel, ClientTlsConfig};
    use tonic::Code;

    struct TestPki {
        dir: TempDir,
        ca_params: CertificateParams,
        ca_key: KeyPair,
    }

    impl TestPki {
        /// Mint a throwaway CA and the server's leaf certificate for
        /// localhost, laid out the way the server expects.
        fn new() -> Self {
            let dir = TempDir::new().unwrap();

            let mut ca_params = CertificateParams::default();
            let mut dn = DistinguishedName::new();
            dn.push(DnType::CommonName, "runner test ca");
            ca_params.distinguished_name = dn;
            ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
            let ca_key = KeyPair::generate().unwrap();
            let ca_cert = ca_params.self_signed(&ca_key).unwrap();
            fs::write(dir.path().join("ca.crt"), ca_cert.pem()).unwrap();

            let pki = Self {
                dir,
                ca_params,
                ca_key,
            };
            pki.issue("localhost", "server");
            pki
        }

        /// Issue a leaf certificate with the given common name, writing
        /// `<name>.crt` / `<name>.key` into the certs dir.
        fn issue(&self, common_name: &str, name: &str) {
            let mut params = CertificateParams::new(vec!["localhost".to_string()]).unwrap();
            let mut dn = DistinguishedName::new();
            if !common_name.is_empty() {
                dn.push(DnType::CommonName, common_name);
            }
            params.distinguished_name = dn;
            let key = KeyPair::generate().unwrap();
            let issuer = Issuer::from_params(&self.ca_params, &self.ca_key);
            let cert = params.signed_by(&key, &issuer).unwrap();
            fs::write(self.dir.path().join(format!("{name}.crt")), cert.pem()).unwrap();
            fs::write(
                self.dir.path().join(format!("{name}.key")),
                key.serialize_pem(),
            )
            .unwrap();
        }

        fn client_tls(&self, name: &str) -> ClientTlsConfig {
            let ca = fs::read(self.dir.path().join("ca.crt")).unwrap();
            let cert = fs::read(self.dir.path().join(format!("{name}.crt"))).unwrap();
            let key = fs::read(self.dir.path().join(format!("{name}.key"))).unwrap();
            ClientTlsConfig::new()
                .domain_name("localhost")
                .ca_certificate(Certificate::from_pem(ca))
                .identity(Identity::from_pem(cert, key))
        }
    }

    async fn start_server(pki: &TestPki, port: u16) -> TempDir {
        let home = TempDir::new().unwrap();
        // an empty template keeps rootfs provisioning happy without
        // depending on a real distro tree
        let rootfs_source = home.path().join("template");
        fs::create_dir(&rootfs_source).unwrap();
        let config = RunnerConfig {
            runner_home: home.path().join("home"),
            rootfs_source,
            debug: true,
        };
        let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
        let certs_dir = pki.dir.path().to_path_buf();
        tokio::spawn(async move {
            let _ = serve(addr, &certs_dir, Arc::new(config)).await;
        });
        // give the listener a moment to come up
        tokio::time::sleep(Duration::from_secs(1)).await;
        home
    }

    async fn connect(pki: &TestPki, name: &str, port: u16) -> RunnerClient<Channel> {
        let channel = Channel::from_shared(format!("https://127.0.0.1:{port}"))
            .unwrap()
            .tls_config(pki.client_tls(name))
            .unwrap()
            .connect()
            .await
            .expect("client connect");
        RunnerClient::new(channel)
    }

    fn start_request(command: &str) -> StartRequest {
        StartRequest {
            command: command.to_string(),
            timeout: 0,
            profile: "default".to_string(),
        }
    }

    #[tokio::test]
    async fn owner_can_use_own_job_other_owners_cannot() {
        let pki = TestPki::new();
        pki.issue("alice", "alice");
        pki.issue("bob", "bob");
        let _home = start_server(&pki, 28091).await;

        let mut alice = connect(&pki, "alice", 28091).await;
        let mut bob = connect(&pki, "bob", 28091).await;

        let job_id = alice
            .start(start_request("echo hello alice"))
            .await
            .expect("start job")
            .into_inner()
            .job_id;
        assert_eq!(job_id.len(), 24);

        // the creating owner can query it
        alice
            .status(StatusRequest {
                job_id: job_id.clone(),
            })
            .await
            .expect("owner status");

        // everyone else is told it does not exist for them
        for response in [
            bob.status(StatusRequest {
                job_id: job_id.clone(),
            })
            .await
            .map(|_| ()),
            bob.stop(StopRequest {
                job_id: job_id.clone(),
            })
            .await
            .map(|_| ()),
        ] {
            let status = response.expect_err("foreign job access succeeded");
            assert_eq!(status.code(), Code::PermissionDenied);
        }
    }

    #[tokio::test]
    async fn unknown_job_is_permission_denied() {
        let pki = TestPki::new();
        pki.issue("alice", "alice");
        let _home = start_server(&pki, 28092).await;

        let mut alice = connect(&pki, "alice", 28092).await;
        let status = alice
            .status(StatusRequest {
                job_id: "0123456789abcdef01234567".to_string(),
            })
            .await
            .expect_err("unknown job lookup succeeded");
        assert_eq!(status.code(), Code::PermissionDenied);
    }

    #[tokio::test]
    async fn empty_command_start_fails() {
        let pki = TestPki::new();
        pki.issue("alice", "alice");
        let _home = start_server(&pki, 28093).await;

        let mut alice = connect(&pki, "alice", 28093).await;
        let status = alice
            .start(start_request(""))
            .await
            .expect_err("empty command accepted");
        assert_eq!(status.code(), Code::Unknown);
    }

    #[tokio::test]
    async fn client_without_common_name_is_unauthenticated() {
        let pki = TestPki::new();
        pki.issue("", "anonymous");
        let _home = start_server(&pki, 28094).await;

        let mut anonymous = connect(&pki, "anonymous", 28094).await;
        let status = anonymous
            .start(start_request("echo hi"))
            .await
            .expect_err("nameless client accepted");
        assert_eq!(status.code(), Code::Unauthenticated);
    }

    #[tokio::test]
    async fn self_signed_client_is_rejected() {
        let pki = TestPki::new();
        let _home = start_server(&pki, 28095).await;

        // eve's certificate chains to a different ca
        let eve_pki = TestPki::new();
        eve_pki.issue("eve", "eve");
        let result = Channel::from_shared(format!("https://127.0.0.1:{}", 28095))
            .unwrap()
            .tls_config(
                eve_pki
                    .client_tls("eve")
                    .ca_certificate(Certificate::from_pem(
                        fs::read(pki.dir.path().join("ca.crt")).unwrap(),
                    )),
            )
            .unwrap()
            .connect()
            .await;

        match result {
            // handshake refused while connecting
            Err(_) => {}
            // some stacks surface the handshake failure on first use instead
            Ok(channel) => {
                let mut eve = RunnerClient::new(channel);
                eve.start(start_request("echo hi"))
                    .await
                    .expect_err("untrusted client accepted");
            }
        }
    }
}
