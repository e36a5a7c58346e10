use std::path::PathBuf;

/// Process-wide configuration for the job runner.
///
/// Set once at startup and shared as an `Arc`; nothing mutates it afterwards.
#[derive(Clone, Debug)]
pub struct RunnerConfig {
    /// Base scratch directory holding per-job state.
    pub runner_home: PathBuf,
    /// Template directory copied as each job's private root filesystem.
    pub rootfs_source: PathBuf,
    /// Verbose logging toggle.
    pub debug: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        let runner_home = PathBuf::from("/tmp/runner");
        let rootfs_source = runner_home.join("rootfs");
        Self {
            runner_home,
            rootfs_source,
            debug: false,
        }
    }
}
