//! Command handler implementation for the daemon.

use crate::audio::format::OutputFormat;
use crate::engine::AudioEngine;
use crate::error::{BgmixError, Result};
use crate::ipc::protocol::{Command, Response};
use crate::ipc::server::{AudioChunks, CommandHandler, Reply};
use crate::mixer::MixStream;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Command handler for daemon IPC commands.
pub struct DaemonCommandHandler {
    engine: Arc<AudioEngine>,
    shutdown: Arc<Notify>,
}

impl DaemonCommandHandler {
    /// Creates a new command handler. `shutdown` is notified on `Shutdown`.
    pub fn new(engine: Arc<AudioEngine>, shutdown: Arc<Notify>) -> Self {
        Self { engine, shutdown }
    }

    /// Runs a blocking engine call off the async workers.
    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&AudioEngine) -> Result<T> + Send + 'static,
    {
        let engine = Arc::clone(&self.engine);
        tokio::task::spawn_blocking(move || f(&engine))
            .await
            .map_err(|e| BgmixError::Other(format!("engine task failed: {}", e)))?
    }

    fn audio_header(&self, format: OutputFormat) -> Response {
        let output = &self.engine.config().output;
        Response::Audio {
            format,
            sample_rate: output.sample_rate,
            channels: output.channels,
        }
    }

    /// The header names the container the stream actually carries, which
    /// an mp3 request loses when it falls back to WAV speech or silence.
    fn audio_reply(&self, stream: Result<(MixStream, OutputFormat)>) -> Reply {
        match stream {
            Ok((stream, format)) => Reply::Audio {
                header: self.audio_header(format),
                chunks: Box::new(stream) as AudioChunks,
            },
            Err(e) => Response::error(e).into(),
        }
    }

    async fn mix(
        &self,
        text: String,
        background: Option<PathBuf>,
        ducking: bool,
        duck_level: f32,
    ) -> Reply {
        let stream = self
            .blocking(move |engine| {
                resolved(engine.mix(&text, background.as_deref(), ducking, duck_level))
            })
            .await;
        self.audio_reply(stream)
    }

    async fn background(&self, seconds: Option<f64>) -> Reply {
        let stream = self
            .blocking(move |engine| resolved(engine.background_stream(seconds)))
            .await;
        self.audio_reply(stream)
    }

    fn listen(&self) -> Reply {
        if !self.engine.status().running {
            return Response::error("Continuous stream is not running").into();
        }
        let rx = self.engine.subscribe();
        Reply::Audio {
            header: self.audio_header(OutputFormat::Pcm),
            chunks: Box::new(rx.into_iter().map(Ok)),
        }
    }

    fn duck(&self, seconds: Option<f64>) -> Response {
        let duration = match seconds.map(Duration::try_from_secs_f64).transpose() {
            Ok(duration) => duration,
            Err(e) => return Response::error(format!("Invalid duck duration: {}", e)),
        };
        let duration = self.engine.duck_then_restore(duration);
        Response::Ducked {
            level: self.engine.ducking().duck_level(),
            restore_after_secs: duration.as_secs_f64(),
        }
    }
}

/// Pairs a stream with the container its first chunk is in.
fn resolved(stream: Result<MixStream>) -> Result<(MixStream, OutputFormat)> {
    let mut stream = stream?;
    let format = stream.resolved_format()?;
    Ok((stream, format))
}

#[async_trait::async_trait]
impl CommandHandler for DaemonCommandHandler {
    async fn handle(&self, command: Command) -> Reply {
        match command {
            Command::Mix {
                text,
                background,
                ducking,
                duck_level,
            } => self.mix(text, background, ducking, duck_level).await,
            Command::Background { seconds } => self.background(seconds).await,
            Command::Listen => self.listen(),
            Command::Speak { text } => {
                let accepted = self.engine.enqueue_speech(&text);
                Response::Queued {
                    accepted,
                    pending: self.engine.status().pending,
                }
                .into()
            }
            Command::Offset => Response::Offset {
                offset_secs: self.engine.current_offset(),
                track_duration_secs: self.engine.playback_clock().track_duration_secs(),
            }
            .into(),
            Command::Start => match self.blocking(AudioEngine::start).await {
                Ok(started) => Response::Started { started }.into(),
                Err(e) => Response::error(e).into(),
            },
            Command::Stop => match self
                .blocking(|engine| {
                    engine.stop();
                    Ok(())
                })
                .await
            {
                Ok(()) => Response::Ok.into(),
                Err(e) => Response::error(e).into(),
            },
            Command::Status => Response::Status {
                status: self.engine.status(),
            }
            .into(),
            Command::Duck { seconds } => self.duck(seconds).into(),
            Command::Transcript => Response::Transcript {
                entries: self.engine.transcript(),
                summary: self.engine.summary(),
            }
            .into(),
            Command::Shutdown => {
                // The daemon loop stops the engine and the server
                self.shutdown.notify_one();
                Response::Ok.into()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::clock::ManualClock;
    use crate::audio::format::AudioSpec;
    use crate::config::Config;
    use crate::events::EventSender;
    use crate::stream::StreamState;
    use crate::synth::MockSynthesizer;

    fn create_test_handler() -> (DaemonCommandHandler, Arc<Notify>) {
        create_handler_with(Config::default())
    }

    fn create_handler_with(mut config: Config) -> (DaemonCommandHandler, Arc<Notify>) {
        config.mixer.program = "/nonexistent/bgmix-mixer".to_string();
        let synth = MockSynthesizer::with_silence(AudioSpec::default(), 100).unwrap();
        let engine = AudioEngine::with_parts(
            config,
            Arc::new(synth),
            Arc::new(ManualClock::new()),
            EventSender::disabled(),
        )
        .unwrap();
        let shutdown = Arc::new(Notify::new());
        (
            DaemonCommandHandler::new(Arc::new(engine), Arc::clone(&shutdown)),
            shutdown,
        )
    }

    fn message(reply: Reply) -> Response {
        match reply {
            Reply::Message(response) => response,
            Reply::Audio { header, .. } => panic!("Expected message, got audio {:?}", header),
        }
    }

    #[tokio::test]
    async fn test_handler_offset() {
        let (handler, _) = create_test_handler();
        let response = message(handler.handle(Command::Offset).await);
        assert_eq!(
            response,
            Response::Offset {
                offset_secs: 0.0,
                track_duration_secs: 159.0
            }
        );
    }

    #[tokio::test]
    async fn test_handler_status_idle() {
        let (handler, _) = create_test_handler();
        match message(handler.handle(Command::Status).await) {
            Response::Status { status } => {
                assert!(!status.running);
                assert_eq!(status.state, StreamState::Idle);
                assert_eq!(status.track, None);
            }
            other => panic!("Expected Status response, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_handler_start_without_track_is_error() {
        let (handler, _) = create_test_handler();
        match message(handler.handle(Command::Start).await) {
            Response::Error { message } => assert!(message.contains("track")),
            other => panic!("Expected Error response, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_handler_speak_queues_and_rejects_empty() {
        let (handler, _) = create_test_handler();
        let response = message(
            handler
                .handle(Command::Speak {
                    text: "goal".to_string(),
                })
                .await,
        );
        assert_eq!(
            response,
            Response::Queued {
                accepted: true,
                pending: 1
            }
        );
        let response = message(
            handler
                .handle(Command::Speak {
                    text: "   ".to_string(),
                })
                .await,
        );
        assert_eq!(
            response,
            Response::Queued {
                accepted: false,
                pending: 1
            }
        );
    }

    #[tokio::test]
    async fn test_handler_mix_returns_audio() {
        let (handler, _) = create_test_handler();
        match handler.handle(Command::mix("hello")).await {
            Reply::Audio { header, chunks } => {
                assert_eq!(
                    header,
                    Response::Audio {
                        format: OutputFormat::Wav,
                        sample_rate: 8000,
                        channels: 1
                    }
                );
                let bytes: Vec<u8> = chunks.map(|c| c.unwrap()).flatten().collect();
                assert!(crate::audio::wav::looks_like_wav(&bytes));
            }
            Reply::Message(response) => panic!("Expected audio, got {:?}", response),
        }
    }

    #[tokio::test]
    async fn test_handler_mp3_fallback_advertises_wav() {
        let mut config = Config::default();
        config.output.format = OutputFormat::Mp3;
        let (handler, _) = create_handler_with(config);
        match handler.handle(Command::mix("hello")).await {
            Reply::Audio { header, chunks } => {
                assert!(matches!(
                    header,
                    Response::Audio {
                        format: OutputFormat::Wav,
                        ..
                    }
                ));
                let bytes: Vec<u8> = chunks.map(|c| c.unwrap()).flatten().collect();
                assert!(crate::audio::wav::looks_like_wav(&bytes));
            }
            Reply::Message(response) => panic!("Expected audio, got {:?}", response),
        }
    }

    #[tokio::test]
    async fn test_handler_background_without_track_is_error() {
        let (handler, _) = create_test_handler();
        let response = message(handler.handle(Command::Background { seconds: None }).await);
        assert!(matches!(response, Response::Error { .. }));
    }

    #[tokio::test]
    async fn test_handler_listen_requires_running_stream() {
        let (handler, _) = create_test_handler();
        let response = message(handler.handle(Command::Listen).await);
        assert!(matches!(response, Response::Error { .. }));
    }

    #[tokio::test]
    async fn test_handler_duck() {
        let (handler, _) = create_test_handler();
        let response = message(handler.handle(Command::Duck { seconds: Some(0.5) }).await);
        assert_eq!(
            response,
            Response::Ducked {
                level: 0.15,
                restore_after_secs: 0.5
            }
        );
        let response = message(handler.handle(Command::Duck { seconds: Some(-1.0) }).await);
        assert!(matches!(response, Response::Error { .. }));
    }

    #[tokio::test]
    async fn test_handler_transcript_empty() {
        let (handler, _) = create_test_handler();
        match message(handler.handle(Command::Transcript).await) {
            Response::Transcript { entries, summary } => {
                assert!(entries.is_empty());
                assert_eq!(summary.total_entries, 0);
            }
            other => panic!("Expected Transcript response, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_handler_shutdown_notifies() {
        let (handler, shutdown) = create_test_handler();
        let response = message(handler.handle(Command::Shutdown).await);
        assert_eq!(response, Response::Ok);
        tokio::time::timeout(Duration::from_secs(1), shutdown.notified())
            .await
            .unwrap();
    }
}
