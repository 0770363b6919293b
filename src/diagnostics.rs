//! System diagnostics and dependency checking.
//!
//! Reports which speech engines and which mixing engine can actually be
//! started, in the order they would be tried.

use crate::config::Config;
use std::process::{Command, Stdio};

/// Result of a dependency check.
#[derive(Debug, PartialEq)]
pub enum CheckResult {
    /// Tool is installed and working
    Ok,
    /// Tool is not found
    NotFound,
    /// Tool is found but has issues (e.g., version probe failed)
    Warning(String),
}

/// Role a checked program plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolRole {
    Speech,
    Mixer,
}

/// One line of the `check` report.
#[derive(Debug)]
pub struct ToolCheck {
    pub role: ToolRole,
    pub name: String,
    pub program: String,
    pub result: CheckResult,
}

/// Check if a command exists and is executable.
fn check_command(command: &str, version_arg: &str) -> CheckResult {
    match Command::new(command)
        .arg(version_arg)
        .stdin(Stdio::null())
        .output()
    {
        Ok(output) if output.status.success() => CheckResult::Ok,
        Ok(_) => CheckResult::Warning(format!("'{}' found but {} failed", command, version_arg)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => CheckResult::NotFound,
        Err(e) => CheckResult::Warning(format!("Error checking '{}': {}", command, e)),
    }
}

/// Probes every configured speech engine, then the mixer.
pub fn check_tools(config: &Config) -> Vec<ToolCheck> {
    let mut checks: Vec<ToolCheck> = config
        .synth
        .engines
        .iter()
        .map(|engine| ToolCheck {
            role: ToolRole::Speech,
            name: engine.name.clone(),
            program: engine.program.clone(),
            result: check_command(&engine.program, "--version"),
        })
        .collect();
    checks.push(ToolCheck {
        role: ToolRole::Mixer,
        name: "mixer".to_string(),
        program: config.mixer.program.clone(),
        result: check_command(&config.mixer.program, "-version"),
    });
    checks
}

/// The engine that would synthesize speech, if any can be started.
pub fn selected_engine(checks: &[ToolCheck]) -> Option<&ToolCheck> {
    checks
        .iter()
        .filter(|c| c.role == ToolRole::Speech)
        .find(|c| c.result != CheckResult::NotFound)
}

/// Run all dependency checks and print results.
pub fn check_dependencies(config: &Config) {
    println!("Checking system dependencies...\n");

    let checks = check_tools(config);
    println!("Speech engines (tried in order):");
    for check in checks.iter().filter(|c| c.role == ToolRole::Speech) {
        print!("  {} ({}): ", check.name, check.program);
        print_result(&check.result);
    }

    println!();
    let mixer_ok = match checks.iter().find(|c| c.role == ToolRole::Mixer) {
        Some(check) => {
            print!("Mixing engine ({}): ", check.program);
            print_result(&check.result);
            check.result != CheckResult::NotFound
        }
        None => false,
    };

    println!();
    match selected_engine(&checks) {
        Some(engine) => println!("✓ Speech will be synthesized with {}.", engine.name),
        None => println!(
            "⚠ No speech engine found; speech is replaced by {}ms of silence.",
            config.synth.silence_ms
        ),
    }
    if !mixer_ok {
        println!("⚠ Mixing engine not found; requests degrade to speech only.");
        println!("  Install: sudo apt install ffmpeg  (Debian/Ubuntu)");
        println!("           sudo pacman -S ffmpeg    (Arch)");
    }
    match &config.track.path {
        Some(path) if path.exists() => println!("✓ Background track: {}", path.display()),
        Some(path) => println!("✗ Background track not found: {}", path.display()),
        None => println!("- No background track configured (track.path)"),
    }
}

fn print_result(result: &CheckResult) {
    match result {
        CheckResult::Ok => println!("✓ OK"),
        CheckResult::NotFound => println!("✗ NOT FOUND"),
        CheckResult::Warning(msg) => println!("⚠ WARNING: {}", msg),
    }
}
