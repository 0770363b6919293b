//! Async Unix socket IPC server for daemon control.

use crate::error::{BgmixError, Result};
use crate::events::{EngineEvent, EventSender};
use crate::ipc::protocol::{Command, Response};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{Mutex, mpsc};

/// Chunks buffered between the audio producer thread and the socket.
const AUDIO_BUFFER: usize = 4;

/// Blocking source of audio chunks, drained on a blocking thread.
///
/// Dropping it must release whatever produces the audio (child processes,
/// stream subscriptions).
pub type AudioChunks = Box<dyn Iterator<Item = Result<Vec<u8>>> + Send>;

/// What a handler sends back.
pub enum Reply {
    /// A single JSON line.
    Message(Response),
    /// A JSON header line, then raw bytes until `chunks` ends.
    Audio { header: Response, chunks: AudioChunks },
}

impl From<Response> for Reply {
    fn from(response: Response) -> Self {
        Reply::Message(response)
    }
}

impl std::fmt::Debug for Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Reply::Message(response) => f.debug_tuple("Message").field(response).finish(),
            Reply::Audio { header, .. } => f.debug_struct("Audio").field("header", header).finish(),
        }
    }
}

/// Handler trait for processing IPC commands.
#[async_trait::async_trait]
pub trait CommandHandler: Send + Sync {
    /// Handle a command and return a reply.
    async fn handle(&self, command: Command) -> Reply;
}

/// State for managing server shutdown.
#[derive(Debug, Clone)]
struct ServerState {
    shutdown: Arc<Mutex<bool>>,
}

impl ServerState {
    fn new() -> Self {
        Self {
            shutdown: Arc::new(Mutex::new(false)),
        }
    }

    async fn is_shutdown(&self) -> bool {
        *self.shutdown.lock().await
    }

    async fn set_shutdown(&self) {
        *self.shutdown.lock().await = true;
    }
}

/// IPC server for handling daemon control commands via Unix socket.
pub struct IpcServer {
    socket_path: PathBuf,
    state: ServerState,
    events: EventSender,
}

impl IpcServer {
    /// Create a new IPC server bound to the specified socket path.
    pub fn new(socket_path: PathBuf) -> Result<Self> {
        Ok(Self {
            socket_path,
            state: ServerState::new(),
            events: EventSender::disabled(),
        })
    }

    /// Report client errors and disconnects as events.
    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = events;
        self
    }

    /// Get the socket path this server is using.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Get the default socket path based on XDG_RUNTIME_DIR or fallback.
    pub fn default_socket_path() -> PathBuf {
        match std::env::var("XDG_RUNTIME_DIR") {
            Ok(xdg_runtime) if !xdg_runtime.is_empty() => {
                PathBuf::from(xdg_runtime).join(crate::defaults::SOCKET_NAME)
            }
            _ => {
                // SAFETY: getuid has no preconditions and cannot fail
                let uid = unsafe { libc::getuid() };
                PathBuf::from(format!("/tmp/bgmix-{}.sock", uid))
            }
        }
    }

    /// Start the IPC server and handle incoming connections.
    pub async fn start<H>(&self, handler: H) -> Result<()>
    where
        H: CommandHandler + 'static,
    {
        // Clean up any existing socket file
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path).map_err(|e| BgmixError::IpcSocket {
                message: format!("Failed to remove existing socket: {}", e),
            })?;
        }

        let listener =
            UnixListener::bind(&self.socket_path).map_err(|e| BgmixError::IpcSocket {
                message: format!("Failed to bind to socket: {}", e),
            })?;

        let handler = Arc::new(handler);

        loop {
            if self.state.is_shutdown().await {
                break;
            }

            // Accept connection with timeout to check for shutdown
            let accept_result =
                tokio::time::timeout(tokio::time::Duration::from_millis(100), listener.accept())
                    .await;

            match accept_result {
                Ok(Ok((stream, _))) => {
                    let handler = Arc::clone(&handler);
                    let events = self.events.clone();
                    tokio::spawn(async move {
                        match handle_client(stream, handler, &events).await {
                            Ok(()) | Err(BgmixError::ConsumerDisconnected) => {}
                            Err(e) => events.emit(EngineEvent::warning(format!(
                                "Error handling client: {}",
                                e
                            ))),
                        }
                    });
                }
                Ok(Err(e)) => {
                    return Err(BgmixError::IpcConnection {
                        message: format!("Failed to accept connection: {}", e),
                    });
                }
                Err(_) => {
                    // Timeout - check shutdown flag again
                    continue;
                }
            }
        }

        Ok(())
    }

    /// Stop the IPC server and clean up the socket file.
    pub async fn stop(&self) -> Result<()> {
        self.state.set_shutdown().await;

        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path).map_err(|e| BgmixError::IpcSocket {
                message: format!("Failed to remove socket file: {}", e),
            })?;
        }

        Ok(())
    }
}

/// Handle a single client connection.
async fn handle_client<H>(stream: UnixStream, handler: Arc<H>, events: &EventSender) -> Result<()>
where
    H: CommandHandler,
{
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    reader
        .read_line(&mut line)
        .await
        .map_err(|e| BgmixError::IpcConnection {
            message: format!("Failed to read from client: {}", e),
        })?;

    let reply = match Command::from_json(line.trim()) {
        Ok(command) => handler.handle(command).await,
        Err(e) => Response::error(format!("Failed to parse command: {}", e)).into(),
    };

    match reply {
        Reply::Message(response) => write_line(&mut writer, &response).await,
        Reply::Audio { header, chunks } => {
            write_line(&mut writer, &header).await?;
            stream_audio(chunks, &mut writer, events).await.map(|_| ())
        }
    }
}

async fn write_line(writer: &mut OwnedWriteHalf, response: &Response) -> Result<()> {
    let mut json = response.to_json().map_err(|e| BgmixError::IpcProtocol {
        message: format!("Failed to serialize response: {}", e),
    })?;
    json.push('\n');

    writer
        .write_all(json.as_bytes())
        .await
        .map_err(|e| BgmixError::IpcConnection {
            message: format!("Failed to write to client: {}", e),
        })?;

    writer
        .flush()
        .await
        .map_err(|e| BgmixError::IpcConnection {
            message: format!("Failed to flush writer: {}", e),
        })
}

/// Copies audio to the client until the source ends or the client leaves.
///
/// The source is drained on a blocking thread. When the client goes away
/// the channel closes, the thread stops and drops the source, which tears
/// down its processes.
async fn stream_audio(
    mut chunks: AudioChunks,
    writer: &mut OwnedWriteHalf,
    events: &EventSender,
) -> Result<u64> {
    let (tx, mut rx) = mpsc::channel::<Result<Vec<u8>>>(AUDIO_BUFFER);
    let producer = tokio::task::spawn_blocking(move || {
        for chunk in chunks.by_ref() {
            if tx.blocking_send(chunk).is_err() {
                break;
            }
        }
        drop(chunks);
    });

    let mut written = 0u64;
    let mut result = Ok(());
    while let Some(chunk) = rx.recv().await {
        let bytes = match chunk {
            Ok(bytes) => bytes,
            Err(e) => {
                result = Err(e);
                break;
            }
        };
        if writer.write_all(&bytes).await.is_err() {
            events.emit(EngineEvent::ConsumerDisconnected);
            result = Err(BgmixError::ConsumerDisconnected);
            break;
        }
        written += bytes.len() as u64;
    }
    drop(rx);

    if producer.await.is_err() {
        events.emit(EngineEvent::warning("audio producer panicked"));
    }
    result?;
    writer.flush().await.ok();
    Ok(written)
}
