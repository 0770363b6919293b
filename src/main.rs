use anyhow::Result;
use bgmix::app::{self, Logging};
use bgmix::cli::{Cli, Commands, ConfigAction, MixOptions};
use bgmix::config::Config;
use bgmix::daemon::run_daemon;
use bgmix::diagnostics::check_dependencies;
use bgmix::engine::AudioEngine;
use bgmix::ipc::client::{receive_audio, send_command};
use bgmix::ipc::protocol::{Command, Response};
use bgmix::ipc::server::IpcServer;
use bgmix::output::{format_entry, format_summary};
use clap::{CommandFactory, Parser};
use owo_colors::OwoColorize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let logging = Logging::start(cli.quiet, cli.verbose);
    let result = run(cli, &logging).await;
    logging.finish();
    result
}

async fn run(cli: Cli, logging: &Logging) -> Result<()> {
    let socket = cli.socket.clone();
    match cli.command {
        Commands::Mix {
            text,
            options,
            format,
        } => {
            let config = app::with_format(load_config(cli.config.as_deref())?, format);
            let engine = AudioEngine::new(config, logging.events())?;
            tokio::task::spawn_blocking(move || app::run_mix(&engine, &text, &options)).await??;
        }
        Commands::Background { duration, format } => {
            let config = app::with_format(load_config(cli.config.as_deref())?, format);
            let engine = AudioEngine::new(config, logging.events())?;
            tokio::task::spawn_blocking(move || app::run_background(&engine, duration)).await??;
        }
        Commands::Stream => {
            let config = load_config(cli.config.as_deref())?;
            let engine = Arc::new(AudioEngine::new(config, logging.events())?);
            tokio::task::spawn_blocking(move || app::run_stream(engine)).await??;
        }
        Commands::Daemon => {
            let config = load_config(cli.config.as_deref())?;
            run_daemon(config, socket, cli.quiet, logging.events()).await?;
        }
        Commands::Play { text, options } => {
            let config = load_config(cli.config.as_deref())?;
            app::ensure_audio_sink()?;
            let command = Command::Mix {
                text,
                background: options.background.clone(),
                ducking: config.ducking.enabled && !options.no_ducking,
                duck_level: duck_level(&options, &config),
            };
            handle_audio_command(socket, command).await?;
        }
        Commands::Listen => {
            app::ensure_audio_sink()?;
            handle_audio_command(socket, Command::Listen).await?;
        }
        Commands::Say { text } => handle_ipc_command(socket, Command::Speak { text }).await?,
        Commands::Offset => handle_ipc_command(socket, Command::Offset).await?,
        Commands::Duck { duration } => {
            handle_ipc_command(socket, Command::Duck { seconds: duration }).await?
        }
        Commands::Start => handle_ipc_command(socket, Command::Start).await?,
        Commands::Stop => handle_ipc_command(socket, Command::Stop).await?,
        Commands::Status => handle_ipc_command(socket, Command::Status).await?,
        Commands::Transcript => handle_ipc_command(socket, Command::Transcript).await?,
        Commands::Shutdown => handle_ipc_command(socket, Command::Shutdown).await?,
        Commands::Check => {
            let config = load_config(cli.config.as_deref())?;
            check_dependencies(&config);
        }
        Commands::Config { action } => {
            handle_config_command(action, cli.config.as_deref())?;
        }
        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "bgmix", &mut std::io::stdout());
        }
    }

    Ok(())
}

/// Load configuration from file or use defaults.
///
/// Priority order:
/// 1. Custom config path from CLI (--config)
/// 2. Default config path (~/.config/bgmix/config.toml)
/// 3. Built-in defaults
///
/// Environment variable overrides apply on top of all three.
fn load_config(custom_path: Option<&Path>) -> Result<Config> {
    let config = match custom_path {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default(&Config::default_path())?,
    };
    Ok(config.with_env_overrides()?)
}

fn duck_level(options: &MixOptions, config: &Config) -> f32 {
    options.duck_level.unwrap_or(config.ducking.level)
}

/// Handle configuration commands.
fn handle_config_command(action: ConfigAction, custom_path: Option<&Path>) -> Result<()> {
    let config_path = custom_path
        .map(PathBuf::from)
        .unwrap_or_else(Config::default_path);

    match action {
        ConfigAction::Path => println!("{}", config_path.display()),
        ConfigAction::Show => {
            let config = load_config(custom_path)?;
            print!("{}", config.to_toml()?);
        }
        ConfigAction::Get { key } => {
            let config = load_config(custom_path)?;
            match config.get_value_by_path(&key) {
                Ok(value) => println!("{}", value),
                Err(e) => {
                    eprintln!("Error: {}", e);
                    std::process::exit(1);
                }
            }
        }
    }
    Ok(())
}

/// Send an audio command to the daemon and copy the audio to stdout.
async fn handle_audio_command(socket: Option<PathBuf>, command: Command) -> Result<()> {
    let socket_path = socket.unwrap_or_else(IpcServer::default_socket_path);
    let mut stdout = tokio::io::stdout();
    match receive_audio(&socket_path, command, &mut stdout).await {
        Ok((Response::Audio { .. }, _)) => Ok(()),
        Ok((Response::Error { message }, _)) => {
            eprintln!("{} {}", "Error:".red(), message);
            std::process::exit(1);
        }
        Ok((other, _)) => {
            eprintln!("Unexpected response: {:?}", other);
            std::process::exit(1);
        }
        Err(bgmix::BgmixError::ConsumerDisconnected) => Ok(()),
        Err(e) => {
            report_connection_error(&socket_path, &e);
            std::process::exit(1);
        }
    }
}

/// Send IPC command to daemon and print the response.
async fn handle_ipc_command(socket: Option<PathBuf>, command: Command) -> Result<()> {
    let socket_path = socket.unwrap_or_else(IpcServer::default_socket_path);

    let response = match send_command(&socket_path, command).await {
        Ok(response) => response,
        Err(e) => {
            report_connection_error(&socket_path, &e);
            std::process::exit(1);
        }
    };

    match response {
        Response::Ok => println!("{}", "OK".green()),
        Response::Queued { accepted, pending } => {
            if accepted {
                println!("{} ({} pending)", "Queued".green(), pending);
            } else {
                println!("{} ({} pending)", "Dropped".yellow(), pending);
            }
        }
        Response::Offset {
            offset_secs,
            track_duration_secs,
        } => println!("{:.3} / {:.1}", offset_secs, track_duration_secs),
        Response::Started { started } => {
            if started {
                println!("{}", "Stream started".green());
            } else {
                println!("Stream already running");
            }
        }
        Response::Status { status } => {
            let client_version = bgmix::version_string();
            println!("Status:");
            println!("  {}     {}", "Client:".dimmed(), client_version);
            println!(
                "  {}      {}",
                "State:".dimmed(),
                if status.running {
                    status.state.to_string().green().to_string()
                } else {
                    status.state.to_string()
                }
            );
            match &status.track {
                Some(track) => println!("  {}      {}", "Track:".dimmed(), track.display()),
                None => println!("  {}      (none)", "Track:".dimmed()),
            }
            println!(
                "  {}     {:.3}s of {:.1}s",
                "Offset:".dimmed(),
                status.offset_secs,
                status.track_duration_secs
            );
            println!("  {}       {:.2}", "Gain:".dimmed(), status.gain);
            println!("  {}    {}", "Pending:".dimmed(), status.pending);
            println!("  {}  {}", "Listeners:".dimmed(), status.subscribers);
        }
        Response::Ducked {
            level,
            restore_after_secs,
        } => println!(
            "Ducked to {:.2}, restoring in {:.1}s",
            level, restore_after_secs
        ),
        Response::Transcript { entries, summary } => {
            for entry in &entries {
                println!("{}", format_entry(entry));
            }
            if !entries.is_empty() {
                println!();
            }
            print!("{}", format_summary(&summary));
        }
        Response::Audio { .. } => {
            eprintln!("Unexpected audio reply");
            std::process::exit(1);
        }
        Response::Error { message } => {
            eprintln!("{} {}", "Error:".red(), message);
            std::process::exit(1);
        }
    }

    Ok(())
}

fn report_connection_error(socket_path: &Path, error: &bgmix::BgmixError) {
    eprintln!("{} {}", "Error:".red(), error);
    eprintln!(
        "Is the daemon running? Start it with `bgmix daemon` (socket: {})",
        socket_path.display()
    );
}
