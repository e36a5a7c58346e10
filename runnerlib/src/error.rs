use std::io;
use std::result;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("job command is empty")]
    EmptyCommand,
    #[error("failed to provision job root filesystem: {0}")]
    Rootfs(#[source] io::Error),
    #[error("failed to spawn job process: {0}")]
    Spawn(#[source] io::Error),
    #[error("failed to open job output stream: {0}")]
    Output(#[source] io::Error),
}

pub type Result<T> = result::Result<T, Error>;
