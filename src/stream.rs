//! Output streamer.
//!
//! Reads a child's combined output pipe, appends each chunk to the task's
//! accumulator and publishes a snapshot per chunk on the bounded result
//! channel. The accumulator is owned by the streaming task and handed back
//! when the stream ends; nothing else writes to it.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::DEFAULT_CHUNK_SIZE;
use crate::error::TaskError;
use crate::task::{TaskHeader, TaskResult};
use crate::{rlog_debug, rlog_trace, rlog_warn};

/// What the streamer hands back to the executor.
#[derive(Debug, Default)]
pub struct StreamOutcome {
    /// Every byte read, in the order received.
    pub output: Vec<u8>,
    /// Set when a read failed; reading stopped at that point.
    pub error: Option<TaskError>,
    /// Number of partial snapshots delivered.
    pub published: usize,
    /// Set when the pipe was still open after the drain grace ran out.
    pub abandoned: bool,
}

/// Streams one task's output into the result channel.
#[derive(Debug, Clone)]
pub struct OutputStreamer {
    chunk_size: usize,
    drain_grace: Duration,
}

impl Default for OutputStreamer {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            drain_grace: Duration::from_millis(crate::config::DEFAULT_DRAIN_GRACE_MS),
        }
    }
}

impl OutputStreamer {
    pub fn new(chunk_size: usize, drain_grace: Duration) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            drain_grace,
        }
    }

    /// Drain `source` until end of stream.
    ///
    /// `source` is the read end of the one pipe the child's stdout and stderr
    /// both write to, so every write arrives whole and in order.
    ///
    /// Each chunk is published as a partial snapshot; the send waits when the
    /// channel is full. If the receiver is gone the streamer keeps draining so
    /// the child is never blocked on a full pipe.
    ///
    /// `exited` is cancelled by the executor once the child has been reaped.
    /// From then on the streamer reads for at most the drain grace; a pipe held
    /// open by a grandchild would otherwise keep it reading forever.
    pub async fn stream<R>(
        &self,
        mut source: R,
        header: TaskHeader,
        tx: mpsc::Sender<TaskResult>,
        exited: CancellationToken,
    ) -> StreamOutcome
    where
        R: AsyncRead + Unpin,
    {
        let mut outcome = StreamOutcome::default();
        let mut publishing = true;
        let mut buf = vec![0u8; self.chunk_size];

        let grace = self.drain_grace;
        let deadline = async move {
            exited.cancelled().await;
            tokio::time::sleep(grace).await;
        };
        tokio::pin!(deadline);

        loop {
            let read = tokio::select! {
                biased;
                read = source.read(&mut buf) => read,
                _ = &mut deadline => {
                    rlog_warn!(
                        "{}: output still open {:?} after exit; stopped reading",
                        header.task_name,
                        grace
                    );
                    outcome.abandoned = true;
                    break;
                }
            };

            match read {
                Ok(0) => {
                    rlog_debug!("{}: end of output", header.task_name);
                    break;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    rlog_warn!("{}: read failed: {}", header.task_name, e);
                    outcome.error = Some(TaskError::Stream(e.to_string()));
                    break;
                }
                Ok(n) => {
                    outcome.output.extend_from_slice(&buf[..n]);
                    rlog_trace!(
                        "{}: +{} bytes (total {})",
                        header.task_name,
                        n,
                        outcome.output.len()
                    );
                    if publishing {
                        let snapshot = header.snapshot(outcome.output.clone(), None, false);
                        if tx.send(snapshot).await.is_err() {
                            rlog_debug!(
                                "{}: result receiver dropped; draining without publishing",
                                header.task_name
                            );
                            publishing = false;
                        } else {
                            outcome.published += 1;
                        }
                    }
                }
            }
        }

        outcome
    }
}
