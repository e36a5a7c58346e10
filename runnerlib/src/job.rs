//! Job supervision: sandboxed child spawning, lifecycle state, stop/wait.

use std::fmt;
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use bytes::Bytes;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::fs::File;
use tokio::process::{Child, Command};
use tokio::select;
use tokio::sync::{mpsc, watch};
use tokio::time;
use tracing::{debug, error};

use crate::config::RunnerConfig;
use crate::error::{Error, Result};
use crate::output::{self, CancelHandle};
use crate::rootfs;
use crate::sandbox;
use crate::status::{JobStatus, StatusCell};

/// The resource profile every job gets unless it asks for another one.
pub const DEFAULT_PROFILE: &str = "default";

const JOB_ID_BYTES: usize = 12;
const OUTPUT_FILE: &str = "output.log";
const ROOTFS_DIR: &str = "rootfs";

/// Everything needed to start a job. Immutable once accepted.
#[derive(Clone, Debug)]
pub struct JobConfig {
    /// Shell command line, run as `sh -c <command>`.
    pub command: String,
    /// Wall-clock limit; `Duration::ZERO` means no timeout.
    pub timeout: Duration,
    /// Resource profile label. Unknown labels are accepted; only
    /// [`DEFAULT_PROFILE`] is recognized today.
    pub profile: String,
}

/// Spawns and supervises jobs according to a shared [`RunnerConfig`].
#[derive(Clone, Debug)]
pub struct Runner {
    config: Arc<RunnerConfig>,
}

impl Runner {
    /// Creates the runner scratch directory (mode 0755) if it is missing.
    pub fn new(config: Arc<RunnerConfig>) -> io::Result<Self> {
        fs::create_dir_all(&config.runner_home)?;
        fs::set_permissions(&config.runner_home, fs::Permissions::from_mode(0o755))?;
        Ok(Self { config })
    }

    /// Start a new job. Either returns a live job or an error with nothing
    /// left behind on disk.
    pub async fn start_job(&self, config: JobConfig) -> Result<Arc<Job>> {
        Job::start(self.config.clone(), config).await
    }
}

/// A single supervised job.
///
/// The job owns an output-writer task and a waiter task; [`Job::wait`]
/// returns once both have finished and the child is reaped.
#[derive(Debug)]
pub struct Job {
    id: String,
    config: JobConfig,
    out_file: PathBuf,
    rootfs_path: PathBuf,
    status: StatusCell,
    exit_code: AtomicI32,
    /// pid of the sandbox helper, which is also its process group id.
    pid: i32,
    /// collapses concurrent stop/timeout kills into a single SIGKILL
    stop_once: Once,
    writer_done: watch::Receiver<bool>,
    done: watch::Receiver<bool>,
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Job[id='{}', command='{}', status='{}']",
            self.id,
            self.config.command,
            self.status.get()
        )
    }
}

impl Job {
    async fn start(runner: Arc<RunnerConfig>, config: JobConfig) -> Result<Arc<Job>> {
        if config.command.is_empty() {
            return Err(Error::EmptyCommand);
        }

        let id = generate_job_id();
        let job_dir = runner.runner_home.join(&id);
        let rootfs_path = job_dir.join(ROOTFS_DIR);
        let out_file = job_dir.join(OUTPUT_FILE);

        // every failure past this point removes the job directory again
        let cleanup = |err: Error| {
            let _ = fs::remove_dir_all(&job_dir);
            err
        };

        fs::create_dir_all(&job_dir)
            .map_err(Error::Rootfs)
            .map_err(cleanup)?;
        debug!(job_id = %id, "creating root filesystem tree");
        let (src, dst) = (runner.rootfs_source.clone(), rootfs_path.clone());
        tokio::task::spawn_blocking(move || rootfs::copy_tree(&src, &dst))
            .await
            .map_err(|err| Error::Rootfs(io::Error::other(err)))
            .and_then(|res| res.map_err(Error::Rootfs))
            .map_err(cleanup)?;

        let file = File::create(&out_file)
            .await
            .map_err(Error::Output)
            .map_err(cleanup)?;

        let helper = sandbox::helper_path()
            .map_err(Error::Spawn)
            .map_err(cleanup)?;
        let mut command = Command::new(helper);
        command
            .arg(&rootfs_path)
            .arg(&config.profile)
            .arg(&config.command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        // A dedicated process group, so one SIGKILL to the negated pid
        // reaches the shell and everything it spawned.
        unsafe {
            command.pre_exec(|| {
                if libc::setpgid(0, 0) != 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }
        let mut child = command.spawn().map_err(Error::Spawn).map_err(cleanup)?;

        let pipe_err = || Error::Spawn(io::Error::other("job output pipes missing"));
        let pid = child
            .id()
            .ok_or_else(pipe_err)
            .map_err(cleanup)? as i32;
        let stdout = child.stdout.take().ok_or_else(pipe_err).map_err(cleanup)?;
        let stderr = child.stderr.take().ok_or_else(pipe_err).map_err(cleanup)?;

        let (writer_done_tx, writer_done_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(false);
        tokio::spawn(output::write_output(
            id.clone(),
            stdout,
            stderr,
            file,
            writer_done_tx,
        ));

        let job = Arc::new(Job {
            id,
            config,
            out_file,
            rootfs_path,
            status: StatusCell::new(JobStatus::Running),
            exit_code: AtomicI32::new(-1),
            pid,
            stop_once: Once::new(),
            writer_done: writer_done_rx,
            done: done_rx,
        });
        debug!(job = %job, "started");

        tokio::spawn(Arc::clone(&job).waiter(child, done_tx));
        Ok(job)
    }

    /// The job identifier: 12 random bytes, hex encoded.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current status and exit code. The exit code is undefined while the
    /// status is `Running`; once a terminal status is visible the code is
    /// stable forever.
    pub fn status(&self) -> (JobStatus, i32) {
        (self.status.get(), self.exit_code.load(Ordering::SeqCst))
    }

    /// Stop the job. Idempotent: the first call kills the job's process
    /// group; every call returns only after the job's bookkeeping tasks have
    /// drained.
    pub async fn stop(&self) {
        debug!(job = %self, "stopping");
        self.kill(JobStatus::Stopped);
        self.wait().await;
    }

    /// Block until the job is terminal and its bookkeeping tasks have exited.
    pub async fn wait(&self) {
        let mut done = self.done.clone();
        let _ = done.wait_for(|done| *done).await;
    }

    /// Subscribe to the job's combined output from the very beginning.
    ///
    /// Every subscriber gets an independent stream; see [`CancelHandle`] for
    /// how a stream ends early.
    pub fn output(&self) -> Result<(mpsc::Receiver<Bytes>, CancelHandle)> {
        output::spawn_tailer(self.id.clone(), &self.out_file, self.writer_done.clone())
            .map_err(Error::Output)
    }

    /// Kill the whole process group, once. The first of stop/timeout to get
    /// here while the job is still running sets the terminal status.
    fn kill(&self, cause: JobStatus) {
        self.stop_once.call_once(|| {
            if self.status.get() == JobStatus::Running {
                // negative pid: the signal goes to every process in the group
                if let Err(err) = kill(Pid::from_raw(-self.pid), Signal::SIGKILL) {
                    debug!(job = %self, error = %err, "failed to kill job process group");
                }
                self.status.set(cause);
            }
        });
    }

    /// Supervision task: enforces the timeout, reaps the child after the
    /// output writer has seen both pipes close, and cleans up the rootfs.
    async fn waiter(self: Arc<Self>, mut child: Child, done: watch::Sender<bool>) {
        debug!(job = %self, "waiter started");
        let mut writer_done = self.writer_done.clone();

        if !self.config.timeout.is_zero() {
            select! {
                _ = time::sleep(self.config.timeout) => self.kill(JobStatus::TimedOut),
                _ = writer_done.wait_for(|done| *done) => {}
            }
        }
        // The writer must observe pipe EOF before the child is reaped, or
        // bytes still in flight would be lost.
        let _ = writer_done.wait_for(|done| *done).await;

        match child.wait().await {
            Ok(exit) => {
                self.status.update_if(JobStatus::Running, JobStatus::Completed);
                self.exit_code
                    .store(exit.code().unwrap_or(-1), Ordering::SeqCst);
                debug!(job = %self, exit_code = self.exit_code.load(Ordering::SeqCst), "completed");
            }
            Err(err) => {
                self.status.update_if(JobStatus::Running, JobStatus::Completed);
                error!(job = %self, error = %err, "failed to reap job child");
            }
        }

        debug!(job = %self, "deleting root filesystem tree");
        let rootfs_path = self.rootfs_path.clone();
        match tokio::task::spawn_blocking(move || fs::remove_dir_all(rootfs_path)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => debug!(job = %self, error = %err, "failed to delete root filesystem"),
            Err(err) => debug!(job = %self, error = %err, "rootfs cleanup task failed"),
        }

        let _ = done.send(true);
    }
}

/// Generate a 12-byte random job id, hex encoded to 24 characters.
fn generate_job_id() -> String {
    let bytes: [u8; JOB_ID_BYTES] = rand::random();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
