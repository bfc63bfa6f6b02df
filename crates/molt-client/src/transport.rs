//! The stdio/Unix-socket transport underneath [`crate::Client`]: a writer
//! task serializing frame writes, a reader task demultiplexing frames by
//! `request_id` into a `pending` map of oneshot senders, with `Drop`
//! aborting both tasks and killing a spawned child. Works the same way
//! whether the worker is a spawned child or an attached socket, and over
//! either length-framed msgpack or json envelopes.

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use molt_wire::{decode_response_frame, read_frame_async, write_frame_async, ResponseEnvelope};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::error::ClientError;

/// Where a [`crate::Client`] gets its worker connection from.
#[derive(Clone, Debug)]
pub enum WorkerTarget {
    Spawn { program: OsString, args: Vec<OsString> },
    Socket(PathBuf),
}

impl WorkerTarget {
    pub fn spawn(program: impl Into<OsString>, args: impl IntoIterator<Item = impl Into<OsString>>) -> Self {
        Self::Spawn {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    pub fn socket(path: impl Into<PathBuf>) -> Self {
        Self::Socket(path.into())
    }
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<ResponseEnvelope, ClientError>>>>>;

/// One live connection to a worker. Torn down and replaced wholesale on
/// restart; never mutated in place.
pub(crate) struct Transport {
    writer_tx: mpsc::UnboundedSender<Vec<u8>>,
    pending: PendingMap,
    dead: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
    child: Option<Child>,
}

impl Transport {
    pub(crate) async fn connect(target: &WorkerTarget, max_frame_bytes: u32) -> Result<Self, ClientError> {
        match target {
            WorkerTarget::Spawn { program, args } => Self::spawn_child(program, args, max_frame_bytes).await,
            WorkerTarget::Socket(path) => Self::connect_socket(path, max_frame_bytes).await,
        }
    }

    async fn spawn_child(program: &OsString, args: &[OsString], max_frame_bytes: u32) -> Result<Self, ClientError> {
        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        let command_debug = format!("{command:?}");

        let mut child = command.spawn().map_err(|source| ClientError::Spawn {
            command: command_debug,
            source,
        })?;

        let stdin = child.stdin.take().ok_or(ClientError::ChannelClosed)?;
        let stdout = child.stdout.take().ok_or(ClientError::ChannelClosed)?;
        let stderr = child.stderr.take();

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let dead = Arc::new(AtomicBool::new(false));
        let (writer_tx, writer_rx) = mpsc::unbounded_channel::<Vec<u8>>();

        let writer_handle = tokio::spawn(writer_task(Box::new(stdin), writer_rx));
        let reader_handle = tokio::spawn(reader_task(Box::new(stdout), pending.clone(), dead.clone(), max_frame_bytes));
        let mut tasks = vec![writer_handle, reader_handle];
        if let Some(stderr) = stderr {
            tasks.push(tokio::spawn(stderr_task(stderr)));
        }

        Ok(Self {
            writer_tx,
            pending,
            dead,
            tasks,
            child: Some(child),
        })
    }

    async fn connect_socket(path: &Path, max_frame_bytes: u32) -> Result<Self, ClientError> {
        let stream = tokio::net::UnixStream::connect(path).await?;
        let (read_half, write_half) = tokio::io::split(stream);

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let dead = Arc::new(AtomicBool::new(false));
        let (writer_tx, writer_rx) = mpsc::unbounded_channel::<Vec<u8>>();

        let writer_handle = tokio::spawn(writer_task(Box::new(write_half), writer_rx));
        let reader_handle = tokio::spawn(reader_task(Box::new(read_half), pending.clone(), dead.clone(), max_frame_bytes));

        Ok(Self {
            writer_tx,
            pending,
            dead,
            tasks: vec![writer_handle, reader_handle],
            child: None,
        })
    }

    /// Registers a pending slot for `request_id` before the frame is sent,
    /// so a response racing ahead of registration is impossible.
    pub(crate) async fn register(&self, request_id: u64) -> oneshot::Receiver<Result<ResponseEnvelope, ClientError>> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id, tx);
        rx
    }

    pub(crate) async fn unregister(&self, request_id: u64) {
        self.pending.lock().await.remove(&request_id);
    }

    pub(crate) fn send_frame(&self, bytes: Vec<u8>) -> Result<(), ClientError> {
        self.writer_tx.send(bytes).map_err(|_| ClientError::ChannelClosed)
    }

    pub(crate) fn is_dead(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }

    pub(crate) async fn in_flight_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        for handle in &self.tasks {
            handle.abort();
        }
        if let Some(mut child) = self.child.take() {
            let _ = child.start_kill();
        }
    }
}

async fn writer_task(mut writer: Box<dyn AsyncWrite + Send + Unpin>, mut rx: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(frame) = rx.recv().await {
        if write_frame_async(&mut writer, &frame).await.is_err() {
            break;
        }
    }
    let _ = writer.shutdown().await;
}

async fn reader_task(
    mut reader: Box<dyn AsyncRead + Send + Unpin>,
    pending: PendingMap,
    dead: Arc<AtomicBool>,
    max_frame_bytes: u32,
) {
    loop {
        match read_frame_async(&mut reader, max_frame_bytes).await {
            Ok(Some(bytes)) => match decode_response_frame(&bytes) {
                Ok(response) => {
                    let sender = pending.lock().await.remove(&response.request_id);
                    if let Some(tx) = sender {
                        let _ = tx.send(Ok(response));
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "failed to decode response envelope; dropping frame");
                }
            },
            Ok(None) => break,
            Err(err) => {
                tracing::warn!(error = %err, "frame read error; closing transport");
                break;
            }
        }
    }

    dead.store(true, Ordering::SeqCst);
    let mut guard = pending.lock().await;
    for (_, tx) in guard.drain() {
        let _ = tx.send(Err(ClientError::WorkerUnavailable));
    }
}

async fn stderr_task(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(worker_stderr = %line);
    }
}
