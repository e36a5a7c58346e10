//! Output capture and fan-out.
//!
//! One writer task per job drains the child's stdout and stderr into the
//! job's output file and fires the writer-done latch when both pipes close.
//! Any number of tailer tasks then follow that file independently, each with
//! its own descriptor and inotify watcher, always starting from offset 0.
//! That is what lets a late subscriber still see the whole stream.

use std::io;
use std::path::Path;

use bytes::{Bytes, BytesMut};
use inotify::{EventStream, Inotify, WatchMask};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStderr, ChildStdout};
use tokio::select;
use tokio::sync::{mpsc, watch};
use tokio_stream::StreamExt;
use tracing::debug;

/// Upper bound for a single chunk handed to an output consumer.
const OUTPUT_BUF_SIZE: usize = 1024;

/// Tailer chunk channel capacity; the consumer paces the reads.
const TAILER_CHANNEL_CAPACITY: usize = 1;

/// Cancels one output stream.
///
/// `cancel` is idempotent. Dropping the last handle for a stream cancels it
/// as well, so an abandoned subscription never leaks its tailer.
#[derive(Clone, Debug)]
pub struct CancelHandle {
    cancel_tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }
}

/// Drain both child pipes into the output file.
///
/// Interleaving between stdout and stderr is scheduling-defined, matching
/// what an interactive shell would show. Read errors other than EOF are
/// logged; the writer-done latch fires on every exit path so consumers never
/// hang.
pub(crate) async fn write_output(
    job_id: String,
    mut stdout: ChildStdout,
    mut stderr: ChildStderr,
    mut file: File,
    done: watch::Sender<bool>,
) {
    debug!(job_id = %job_id, "output writer started");
    let mut out_buf = BytesMut::with_capacity(OUTPUT_BUF_SIZE);
    let mut err_buf = BytesMut::with_capacity(OUTPUT_BUF_SIZE);
    let mut stdout_open = true;
    let mut stderr_open = true;
    while stdout_open || stderr_open {
        select! {
            res = stdout.read_buf(&mut out_buf), if stdout_open => match res {
                Ok(0) => stdout_open = false,
                Ok(_) => {
                    if !append(&mut file, out_buf.split().freeze(), &job_id).await {
                        break;
                    }
                }
                Err(err) => {
                    debug!(job_id = %job_id, error = %err, "failed to read stdout pipe");
                    break;
                }
            },
            res = stderr.read_buf(&mut err_buf), if stderr_open => match res {
                Ok(0) => stderr_open = false,
                Ok(_) => {
                    if !append(&mut file, err_buf.split().freeze(), &job_id).await {
                        break;
                    }
                }
                Err(err) => {
                    debug!(job_id = %job_id, error = %err, "failed to read stderr pipe");
                    break;
                }
            },
        }
    }
    if let Err(err) = file.flush().await {
        debug!(job_id = %job_id, error = %err, "failed to flush output file");
    }
    drop(file);
    debug!(job_id = %job_id, "output writer done");
    let _ = done.send(true);
}

/// Append one chunk and flush it so watchers see the write immediately.
/// Returns false when the file is no longer writable.
async fn append(file: &mut File, chunk: Bytes, job_id: &str) -> bool {
    if let Err(err) = file.write_all(&chunk).await {
        debug!(job_id = %job_id, error = %err, "failed to write output file");
        return false;
    }
    if let Err(err) = file.flush().await {
        debug!(job_id = %job_id, error = %err, "failed to flush output file");
        return false;
    }
    true
}

/// Start a tailer for the output file at `path`.
///
/// Returns the chunk stream and its cancellation handle. The stream yields
/// the file's bytes in order from offset 0 and ends at the true end of
/// output, on cancellation, or on a watcher failure.
pub(crate) fn spawn_tailer(
    job_id: String,
    path: &Path,
    writer_done: watch::Receiver<bool>,
) -> io::Result<(mpsc::Receiver<Bytes>, CancelHandle)> {
    let mut inotify = Inotify::init()?;
    inotify.watches().add(path, WatchMask::MODIFY)?;
    let events = inotify.into_event_stream([0u8; 1024])?;
    let file = File::from_std(std::fs::File::open(path)?);

    let (cancel_tx, cancel_rx) = watch::channel(false);
    let (chunk_tx, chunk_rx) = mpsc::channel(TAILER_CHANNEL_CAPACITY);
    tokio::spawn(tail(job_id, file, events, chunk_tx, cancel_rx, writer_done));
    Ok((chunk_rx, CancelHandle { cancel_tx }))
}

async fn tail(
    job_id: String,
    mut file: File,
    mut events: EventStream<[u8; 1024]>,
    chunks: mpsc::Sender<Bytes>,
    mut cancelled: watch::Receiver<bool>,
    mut writer_done: watch::Receiver<bool>,
) {
    debug!(job_id = %job_id, "output tailer started");
    let mut read_once_more = true;
    let mut buf = [0u8; OUTPUT_BUF_SIZE];
    loop {
        match file.read(&mut buf).await {
            Ok(n) if n > 0 => {
                // the read buffer is reused, so hand consumers an owned copy
                if chunks.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                    debug!(job_id = %job_id, "output consumer went away");
                    return;
                }
                continue;
            }
            Ok(_) => {}
            Err(err) => {
                debug!(job_id = %job_id, error = %err, "failed to read output file");
                return;
            }
        }
        // At EOF: wait for more output, cancellation, or the writer finishing.
        select! {
            event = events.next() => match event {
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!(job_id = %job_id, error = %err, "output watcher error");
                    return;
                }
                None => {
                    debug!(job_id = %job_id, "output watcher shut down");
                    return;
                }
            },
            // an Err here means every cancel handle was dropped; same outcome
            _ = cancelled.wait_for(|cancelled| *cancelled) => {
                debug!(job_id = %job_id, "output streaming cancelled");
                return;
            }
            _ = writer_done.wait_for(|done| *done) => {
                // Writer-done can beat the final watcher event; read once
                // more so the tail of the stream is not truncated.
                if read_once_more {
                    read_once_more = false;
                    continue;
                }
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs as stdfs;
    use std::io::Write;
    use std::time::Duration;
    use tokio::time::sleep;

    fn out_file(dir: &tempfile::TempDir) -> std::path::PathBuf {
        let path = dir.path().join("output.log");
        stdfs::File::create(&path).unwrap();
        path
    }

    async fn collect(mut chunks: mpsc::Receiver<Bytes>) -> Vec<u8> {
        let mut bytes = Vec::new();
        while let Some(chunk) = chunks.recv().await {
            bytes.extend_from_slice(&chunk);
        }
        bytes
    }

    #[tokio::test]
    async fn streams_from_offset_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = out_file(&dir);
        stdfs::write(&path, b"hello ").unwrap();

        let (done_tx, done_rx) = watch::channel(false);
        let (chunks, _cancel) = spawn_tailer("t".into(), &path, done_rx).unwrap();

        let appender = path.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(100)).await;
            let mut f = stdfs::OpenOptions::new().append(true).open(&appender).unwrap();
            f.write_all(b"world").unwrap();
            sleep(Duration::from_millis(100)).await;
            let _ = done_tx.send(true);
        });

        assert_eq!(collect(chunks).await, b"hello world");
    }

    #[tokio::test]
    async fn late_subscriber_sees_everything() {
        let dir = tempfile::tempdir().unwrap();
        let path = out_file(&dir);
        stdfs::write(&path, b"all output already written\n").unwrap();

        let (done_tx, done_rx) = watch::channel(false);
        let _ = done_tx.send(true);

        let (chunks, _cancel) = spawn_tailer("t".into(), &path, done_rx).unwrap();
        assert_eq!(collect(chunks).await, b"all output already written\n");
    }

    #[tokio::test]
    async fn concurrent_tailers_agree() {
        let dir = tempfile::tempdir().unwrap();
        let path = out_file(&dir);
        let (done_tx, done_rx) = watch::channel(false);

        let mut handles = Vec::new();
        for i in 0..5 {
            let done_rx = done_rx.clone();
            let path = path.clone();
            handles.push(tokio::spawn(async move {
                // stagger subscriptions while the producer is writing
                sleep(Duration::from_millis(i * 40)).await;
                let (chunks, _cancel) = spawn_tailer(format!("t{i}"), &path, done_rx).unwrap();
                collect(chunks).await
            }));
        }

        let mut expected = Vec::new();
        for i in 0..10u32 {
            let line = format!("line {i}\n");
            expected.extend_from_slice(line.as_bytes());
            let mut f = stdfs::OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(line.as_bytes()).unwrap();
            sleep(Duration::from_millis(30)).await;
        }
        let _ = done_tx.send(true);

        for handle in handles {
            assert_eq!(handle.await.unwrap(), expected);
        }
    }

    #[tokio::test]
    async fn writer_done_racing_last_write_is_not_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let path = out_file(&dir);
        let (done_tx, done_rx) = watch::channel(false);
        let (chunks, _cancel) = spawn_tailer("t".into(), &path, done_rx).unwrap();

        // fire done immediately after the final write, with no pause for the
        // watcher event to arrive first
        let mut f = stdfs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(b"final bytes").unwrap();
        drop(f);
        let _ = done_tx.send(true);

        assert_eq!(collect(chunks).await, b"final bytes");
    }

    #[tokio::test]
    async fn cancel_ends_stream_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = out_file(&dir);
        let (_done_tx, done_rx) = watch::channel(false);
        let (mut chunks, cancel) = spawn_tailer("t".into(), &path, done_rx).unwrap();

        let mut f = stdfs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(b"chunk").unwrap();
        assert_eq!(chunks.recv().await.unwrap(), Bytes::from_static(b"chunk"));

        cancel.cancel();
        cancel.cancel();
        cancel.cancel();
        assert!(chunks.recv().await.is_none());
    }

    #[tokio::test]
    async fn silent_job_cancellation_yields_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = out_file(&dir);
        let (_done_tx, done_rx) = watch::channel(false);
        let (mut chunks, cancel) = spawn_tailer("t".into(), &path, done_rx).unwrap();

        tokio::spawn(async move {
            sleep(Duration::from_millis(150)).await;
            cancel.cancel();
        });
        assert!(chunks.recv().await.is_none());
    }

    #[tokio::test]
    async fn dropping_all_handles_cancels() {
        let dir = tempfile::tempdir().unwrap();
        let path = out_file(&dir);
        let (_done_tx, done_rx) = watch::channel(false);
        let (mut chunks, cancel) = spawn_tailer("t".into(), &path, done_rx).unwrap();
        drop(cancel);
        assert!(chunks.recv().await.is_none());
    }
}
