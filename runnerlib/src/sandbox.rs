//! Sandbox entry: the code behind the `runner-sandbox` helper binary.
//!
//! The supervisor cannot enter namespaces itself: `unshare(CLONE_NEWUSER)`
//! is refused in a multi-threaded process, and only a process inside the new
//! PID namespace may mount a `/proc` that reflects it. The helper binary
//! starts single-threaded, unshares all five namespaces, maps itself to root,
//! and forks once; the fork child is PID 1 of the new PID namespace, performs
//! the `pivot_root` sequence, and execs the user command under a shell.
//!
//! Exit status: the shell's exit code, `128 + signo` if the shell was killed
//! by a signal, or non-zero if any setup step failed.

use std::env;
use std::ffi::CString;
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process;

use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sched::{unshare, CloneFlags};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{chdir, execvp, fork, getgid, getuid, pivot_root, ForkResult};
use thiserror::Error;

/// Name of the helper binary, expected next to the supervisor's executable.
pub const SANDBOX_BIN: &str = "runner-sandbox";

/// Directory inside the new root where the old root is parked for unmounting.
const PUT_OLD: &str = "old_root";

#[derive(Debug, Error)]
pub enum SetupError {
    #[error("failed to unshare namespaces: {0}")]
    Unshare(#[source] nix::Error),
    #[error("failed to write {path}: {source}")]
    IdMap {
        path: &'static str,
        source: io::Error,
    },
    #[error("failed to fork sandbox init: {0}")]
    Fork(#[source] nix::Error),
    #[error("failed to make mounts private: {0}")]
    MakePrivate(#[source] nix::Error),
    #[error("failed to bind mount new root {path:?}: {source}")]
    BindRoot {
        path: PathBuf,
        source: nix::Error,
    },
    #[error("failed to create {path:?}: {source}")]
    PutOldDir {
        path: PathBuf,
        source: io::Error,
    },
    #[error("failed to pivot_root into {path:?}: {source}")]
    PivotRoot {
        path: PathBuf,
        source: nix::Error,
    },
    #[error("failed to chdir to /: {0}")]
    Chdir(#[source] nix::Error),
    #[error("failed to mount /proc: {0}")]
    MountProc(#[source] nix::Error),
    #[error("failed to unmount old root: {0}")]
    UnmountOld(#[source] nix::Error),
    #[error("failed to remove old root: {0}")]
    RemoveOld(#[source] io::Error),
    #[error("command contains a NUL byte")]
    BadCommand,
    #[error("failed to exec /bin/sh: {0}")]
    Exec(#[source] nix::Error),
    #[error("failed to wait for sandbox init: {0}")]
    Wait(#[source] nix::Error),
}

/// Run `command` under `/bin/sh -c` inside fresh user/UTS/PID/net/mount
/// namespaces rooted at `new_root`. Blocks until the shell exits and returns
/// its exit code.
///
/// `profile` names the resource profile to apply; only `default` is
/// recognized today and no limits are enforced yet.
// TODO: apply cgroup limits for the requested profile
pub fn run(new_root: &Path, _profile: &str, command: &str) -> Result<i32, SetupError> {
    let uid = getuid();
    let gid = getgid();

    unshare(
        CloneFlags::CLONE_NEWUSER
            | CloneFlags::CLONE_NEWUTS
            | CloneFlags::CLONE_NEWPID
            | CloneFlags::CLONE_NEWNET
            | CloneFlags::CLONE_NEWNS,
    )
    .map_err(SetupError::Unshare)?;
    write_id_maps(uid.as_raw(), gid.as_raw())?;

    // Only children created after unshare(CLONE_NEWPID) live in the new PID
    // namespace, so the filesystem setup and exec happen in a fork child
    // which is PID 1 there.
    match unsafe { fork() }.map_err(SetupError::Fork)? {
        ForkResult::Child => {
            if let Err(err) = enter_rootfs(new_root) {
                eprintln!("sandbox setup failed: {err}");
                process::exit(1);
            }
            if let Err(err) = exec_shell(command) {
                eprintln!("sandbox exec failed: {err}");
                process::exit(127);
            }
            unreachable!("exec_shell returned without error");
        }
        ForkResult::Parent { child } => match waitpid(child, None).map_err(SetupError::Wait)? {
            WaitStatus::Exited(_, code) => Ok(code),
            WaitStatus::Signaled(_, signal, _) => Ok(128 + signal as i32),
            _ => Ok(1),
        },
    }
}

/// Map uid/gid 0 inside the new user namespace to the invoking host ids.
///
/// `setgroups` must be denied before the gid map may be written.
fn write_id_maps(uid: u32, gid: u32) -> Result<(), SetupError> {
    let write = |path: &'static str, contents: String| {
        fs::write(path, contents).map_err(|source| SetupError::IdMap { path, source })
    };
    write("/proc/self/setgroups", "deny\n".to_string())?;
    write("/proc/self/uid_map", format!("0 {uid} 1\n"))?;
    write("/proc/self/gid_map", format!("0 {gid} 1\n"))
}

/// Swap the root filesystem for `new_root` and mount a fresh `/proc`.
///
/// Must run as PID 1 of the new PID namespace so the proc mount reflects it.
fn enter_rootfs(new_root: &Path) -> Result<(), SetupError> {
    let put_old_abs = new_root.join(PUT_OLD);

    // Host distros mount / shared; pivot_root refuses shared mounts.
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .map_err(SetupError::MakePrivate)?;

    // Bind the new root onto itself so it is a mount point eligible for
    // pivot_root.
    mount(
        Some(new_root),
        new_root,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|source| SetupError::BindRoot {
        path: new_root.to_path_buf(),
        source,
    })?;

    fs::create_dir_all(&put_old_abs)
        .and_then(|()| fs::set_permissions(&put_old_abs, fs::Permissions::from_mode(0o700)))
        .map_err(|source| SetupError::PutOldDir {
            path: put_old_abs.clone(),
            source,
        })?;

    pivot_root(new_root, &put_old_abs).map_err(|source| SetupError::PivotRoot {
        path: new_root.to_path_buf(),
        source,
    })?;
    chdir("/").map_err(SetupError::Chdir)?;

    // Fresh procfs so ps and /proc/self see only the new PID namespace.
    mount(
        Some("proc"),
        "/proc",
        Some("proc"),
        MsFlags::empty(),
        None::<&str>,
    )
    .map_err(SetupError::MountProc)?;

    let put_old = Path::new("/").join(PUT_OLD);
    umount2(&put_old, MntFlags::MNT_DETACH).map_err(SetupError::UnmountOld)?;
    fs::remove_dir_all(&put_old).map_err(SetupError::RemoveOld)?;
    Ok(())
}

/// Exec the user command under a shell, inheriting stdin/stdout/stderr, so
/// pipes, redirection, chains and backgrounding all work.
fn exec_shell(command: &str) -> Result<(), SetupError> {
    let sh = CString::new("/bin/sh").map_err(|_| SetupError::BadCommand)?;
    let dash_c = CString::new("-c").map_err(|_| SetupError::BadCommand)?;
    let command = CString::new(command).map_err(|_| SetupError::BadCommand)?;
    execvp(&sh, &[sh.clone(), dash_c, command]).map_err(SetupError::Exec)?;
    Ok(())
}

/// Locate the `runner-sandbox` helper next to the current executable.
///
/// Test binaries live one level down in `deps/`, so that directory is
/// stripped before looking.
pub(crate) fn helper_path() -> io::Result<PathBuf> {
    let exe = env::current_exe()?;
    let mut dir = exe
        .parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| io::Error::other("current executable has no parent directory"))?;
    if dir.ends_with("deps") {
        dir.pop();
    }
    let path = dir.join(SANDBOX_BIN);
    if path.is_file() {
        Ok(path)
    } else {
        Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("sandbox helper not found at {}", path.display()),
        ))
    }
}
