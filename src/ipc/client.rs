//! IPC client for sending commands to the daemon.

use crate::error::{BgmixError, Result};
use crate::ipc::protocol::{Command, Response};
use std::path::Path;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

/// Send a command to the daemon via Unix socket.
///
/// # Errors
/// Returns `BgmixError::IpcConnection` if connection fails
/// Returns `BgmixError::IpcProtocol` if serialization/deserialization fails
pub async fn send_command(socket_path: &Path, command: Command) -> Result<Response> {
    let (mut reader, _writer) = request(socket_path, &command).await?;
    read_response(&mut reader).await
}

/// Send a command whose reply may carry audio, copying the audio to `out`.
///
/// Returns the header line and the number of audio bytes copied. A reply
/// that is not an audio header is returned as is, with nothing copied.
pub async fn receive_audio<W>(
    socket_path: &Path,
    command: Command,
    out: &mut W,
) -> Result<(Response, u64)>
where
    W: AsyncWrite + Unpin,
{
    let (mut reader, _writer) = request(socket_path, &command).await?;
    let header = read_response(&mut reader).await?;
    if !matches!(header, Response::Audio { .. }) {
        return Ok((header, 0));
    }

    let copied = tokio::io::copy(&mut reader, out).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::BrokenPipe {
            BgmixError::ConsumerDisconnected
        } else {
            BgmixError::IpcConnection {
                message: format!("Failed to copy audio: {}", e),
            }
        }
    })?;
    out.flush().await.ok();
    Ok((header, copied))
}

async fn request(
    socket_path: &Path,
    command: &Command,
) -> Result<(
    BufReader<tokio::net::unix::OwnedReadHalf>,
    tokio::net::unix::OwnedWriteHalf,
)> {
    let stream =
        UnixStream::connect(socket_path)
            .await
            .map_err(|e| BgmixError::IpcConnection {
                message: format!("Failed to connect to daemon: {}", e),
            })?;

    let (reader, mut writer) = stream.into_split();

    let mut command_json = command.to_json().map_err(|e| BgmixError::IpcProtocol {
        message: format!("Failed to serialize command: {}", e),
    })?;
    command_json.push('\n');

    writer
        .write_all(command_json.as_bytes())
        .await
        .map_err(|e| BgmixError::IpcConnection {
            message: format!("Failed to write command: {}", e),
        })?;

    writer
        .flush()
        .await
        .map_err(|e| BgmixError::IpcConnection {
            message: format!("Failed to flush writer: {}", e),
        })?;

    Ok((BufReader::new(reader), writer))
}

async fn read_response<R>(reader: &mut BufReader<R>) -> Result<Response>
where
    R: AsyncRead + Unpin,
{
    let mut response_line = String::new();
    let read = reader
        .read_line(&mut response_line)
        .await
        .map_err(|e| BgmixError::IpcConnection {
            message: format!("Failed to read response: {}", e),
        })?;
    if read == 0 {
        return Err(BgmixError::IpcConnection {
            message: "Daemon closed the connection without replying".to_string(),
        });
    }

    Response::from_json(response_line.trim()).map_err(|e| BgmixError::IpcProtocol {
        message: format!("Failed to deserialize response: {}", e),
    })
}
