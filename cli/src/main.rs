mod client;

use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use runner_proto::{JobStatus, OutputRequest, StartRequest, StatusRequest, StopRequest};

/// Client for the remote job execution server.
#[derive(Debug, Parser)]
#[command(name = "runner-cli")]
struct Cli {
    /// Server URL.
    #[arg(short, long, default_value = "https://localhost:9000")]
    server: String,
    /// Directory holding ca.crt, client.crt and client.key.
    #[arg(long)]
    certs_dir: PathBuf,
    /// Name the server certificate is expected to carry.
    #[arg(long, default_value = "localhost")]
    domain: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start a new job.
    Start {
        /// Timeout in seconds; 0 disables the timeout.
        #[arg(short, long, default_value_t = 0)]
        timeout: i32,
        /// Resource profile for the job.
        #[arg(short, long, default_value = "default")]
        profile: String,
        /// Shell command line to run.
        command: String,
    },
    /// Stop a job.
    Stop { job_id: String },
    /// Fetch the status of a job.
    Status { job_id: String },
    /// Stream the output of a job from the beginning.
    Output { job_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut client = client::connect(&cli.server, &cli.certs_dir, &cli.domain).await?;

    match cli.command {
        Command::Start {
            timeout,
            profile,
            command,
        } => {
            let response = client
                .start(StartRequest {
                    command,
                    timeout,
                    profile,
                })
                .await?
                .into_inner();
            println!("{}", response.job_id);
        }
        Command::Stop { job_id } => {
            let response = client.stop(StopRequest { job_id }).await?.into_inner();
            println!("{} ({})", status_name(response.status), response.exit_code);
        }
        Command::Status { job_id } => {
            let response = client.status(StatusRequest { job_id }).await?.into_inner();
            println!("{} ({})", status_name(response.status), response.exit_code);
        }
        Command::Output { job_id } => {
            let mut stream = client.output(OutputRequest { job_id }).await?.into_inner();
            let mut stdout = io::stdout();
            while let Some(response) = stream.message().await? {
                stdout.write_all(&response.buffer)?;
                stdout.flush()?;
            }
        }
    }
    Ok(())
}

fn status_name(value: i32) -> &'static str {
    match JobStatus::try_from(value) {
        Ok(JobStatus::Running) => "RUNNING",
        Ok(JobStatus::Completed) => "COMPLETED",
        Ok(JobStatus::Stopped) => "STOPPED",
        Ok(JobStatus::Timedout) => "TIMEDOUT",
        Err(_) => "UNKNOWN",
    }
}
