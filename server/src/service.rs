use std::collections::HashMap;
use std::io;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use runner_proto::runner_server::Runner as RunnerRpc;
use runner_proto::{
    OutputRequest, OutputResponse, StartRequest, StartResponse, StatusRequest, StatusResponse,
    StopRequest, StopResponse,
};
use runnerlib::{Job, JobConfig, JobStatus, Runner, RunnerConfig};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};
use tracing::{debug, info};

use crate::interceptors::cert::ClientIdentity;

/// Capacity of the relay channel between a tailer and the gRPC stream.
const OUTPUT_RELAY_CAPACITY: usize = 16;

/// Jobs keyed by `(job id, owner common name)`.
///
/// The composite key fuses the lookup and the ownership check under one
/// lock: a wrong owner and a missing job are indistinguishable, so job ids
/// cannot be probed.
#[derive(Default)]
struct JobTable {
    table: RwLock<HashMap<(String, String), Arc<Job>>>,
}

impl JobTable {
    fn insert(&self, job_id: String, owner: String, job: Arc<Job>) {
        self.table.write().unwrap().insert((job_id, owner), job);
    }

    fn get(&self, job_id: &str, owner: &str) -> Option<Arc<Job>> {
        self.table
            .read()
            .unwrap()
            .get(&(job_id.to_string(), owner.to_string()))
            .cloned()
    }
}

pub struct RunnerService {
    runner: Runner,
    jobs: JobTable,
}

impl RunnerService {
    pub fn new(config: Arc<RunnerConfig>) -> io::Result<Self> {
        Ok(Self {
            runner: Runner::new(config)?,
            jobs: JobTable::default(),
        })
    }

    fn lookup(&self, job_id: &str, owner: &str) -> Result<Arc<Job>, Status> {
        self.jobs.get(job_id, owner).ok_or_else(|| {
            Status::permission_denied(format!("cannot find job {job_id} for {owner}"))
        })
    }
}

fn identity<T>(req: &Request<T>) -> Result<String, Status> {
    req.extensions()
        .get::<ClientIdentity>()
        .map(|id| id.common_name.clone())
        .ok_or_else(|| Status::unauthenticated("client identity missing"))
}

fn proto_status(status: JobStatus) -> runner_proto::JobStatus {
    match status {
        JobStatus::Running => runner_proto::JobStatus::Running,
        JobStatus::Completed => runner_proto::JobStatus::Completed,
        JobStatus::Stopped => runner_proto::JobStatus::Stopped,
        JobStatus::TimedOut => runner_proto::JobStatus::Timedout,
    }
}

#[tonic::async_trait]
impl RunnerRpc for RunnerService {
    type OutputStream = ReceiverStream<Result<OutputResponse, Status>>;

    async fn start(&self, req: Request<StartRequest>) -> Result<Response<StartResponse>, Status> {
        let owner = identity(&req)?;
        let StartRequest {
            command,
            timeout,
            profile,
        } = req.into_inner();
        info!(owner = %owner, command = %command, timeout, profile = %profile, "start request");

        let config = JobConfig {
            command,
            timeout: Duration::from_secs(timeout.max(0) as u64),
            profile,
        };
        let job = self
            .runner
            .start_job(config)
            .await
            .map_err(|err| Status::unknown(err.to_string()))?;
        let job_id = job.id().to_string();
        self.jobs.insert(job_id.clone(), owner, job);
        Ok(Response::new(StartResponse { job_id }))
    }

    async fn stop(&self, req: Request<StopRequest>) -> Result<Response<StopResponse>, Status> {
        let owner = identity(&req)?;
        let StopRequest { job_id } = req.into_inner();
        info!(owner = %owner, job_id = %job_id, "stop request");

        let job = self.lookup(&job_id, &owner)?;
        job.stop().await;
        let (status, exit_code) = job.status();
        info!(job_id = %job_id, status = %status, exit_code, "stopped");
        Ok(Response::new(StopResponse {
            status: proto_status(status).into(),
            exit_code,
        }))
    }

    async fn status(
        &self,
        req: Request<StatusRequest>,
    ) -> Result<Response<StatusResponse>, Status> {
        let owner = identity(&req)?;
        let StatusRequest { job_id } = req.into_inner();
        info!(owner = %owner, job_id = %job_id, "status request");

        let job = self.lookup(&job_id, &owner)?;
        let (status, exit_code) = job.status();
        Ok(Response::new(StatusResponse {
            status: proto_status(status).into(),
            exit_code,
        }))
    }

    async fn output(
        &self,
        req: Request<OutputRequest>,
    ) -> Result<Response<Self::OutputStream>, Status> {
        let owner = identity(&req)?;
        let OutputRequest { job_id } = req.into_inner();
        info!(owner = %owner, job_id = %job_id, "output request");

        let job = self.lookup(&job_id, &owner)?;
        let (mut chunks, cancel) = job
            .output()
            .map_err(|err| Status::internal(err.to_string()))?;

        let (tx, rx) = mpsc::channel(OUTPUT_RELAY_CAPACITY);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    chunk = chunks.recv() => match chunk {
                        Some(bytes) => {
                            let resp = OutputResponse {
                                buffer: bytes.to_vec(),
                            };
                            if tx.send(Ok(resp)).await.is_err() {
                                cancel.cancel();
                                return;
                            }
                        }
                        // end of output
                        None => return,
                    },
                    _ = tx.closed() => {
                        debug!(job_id = %job_id, "output client disconnected");
                        cancel.cancel();
                        return;
                    }
                }
            }
        });
        Ok(Response::new(ReceiverStream::new(rx)))
    }
}
