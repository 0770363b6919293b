//! Supervised child processes connected by pipes.
//!
//! Every external engine (speech synthesizer, mixer, background source) runs
//! as a [`SupervisedChild`]. Dropping one closes its pipes, kills it if it is
//! still running and reaps it, so no exit path can leak a descriptor or leave
//! a zombie behind.

use crate::error::{BgmixError, Result};
use std::io::{self, Read, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Poll interval while waiting for a child to exit on its own.
const EXIT_POLL: Duration = Duration::from_millis(5);

const SPAWN_RETRIES: u32 = 5;

/// A program plus its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandLine {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

impl std::fmt::Display for CommandLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            if arg.contains(char::is_whitespace) || arg.is_empty() {
                write!(f, " '{arg}'")?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

/// What a child reads on its standard input.
pub enum PipeInput {
    /// Nothing (`/dev/null`).
    Null,
    /// The standard output of another child, connected fd to fd.
    Child(ChildStdout),
    /// An in-memory buffer, written by a feeder thread.
    Bytes(Vec<u8>),
}

#[derive(Debug, Default)]
struct SwitchState {
    tripped: bool,
    /// Children attached and not yet reaped.
    pids: Vec<u32>,
}

/// Kills attached children from another thread, e.g. while their owner is
/// blocked reading them.
///
/// A pid stays in the switch only until its owner reaps it, and reaping
/// happens under the switch's lock, so a tripped switch never signals a
/// recycled pid. Children attached after the switch tripped die at once.
#[derive(Debug, Clone, Default)]
pub struct KillSwitch {
    state: Arc<Mutex<SwitchState>>,
}

impl KillSwitch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Kills every attached child, now and from here on. Idempotent.
    pub fn trip(&self) {
        let mut state = self.lock();
        state.tripped = true;
        for pid in &state.pids {
            // SAFETY: `pid` is an unreaped child of this process.
            unsafe {
                libc::kill(*pid as libc::pid_t, libc::SIGKILL);
            }
        }
    }

    pub fn is_tripped(&self) -> bool {
        self.lock().tripped
    }

    fn lock(&self) -> MutexGuard<'_, SwitchState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Child process that is always torn down and reaped.
pub struct SupervisedChild {
    label: String,
    child: Child,
    stdout: Option<ChildStdout>,
    feeder: Option<JoinHandle<()>>,
    status: Option<ExitStatus>,
    switch: Option<KillSwitch>,
}

impl SupervisedChild {
    /// Spawns `command` with stdout piped and stderr discarded.
    ///
    /// A program that does not exist or cannot be executed maps to
    /// [`BgmixError::EngineUnavailable`]; other spawn failures to
    /// [`BgmixError::Spawn`].
    pub fn spawn(label: &str, command: &CommandLine, input: PipeInput) -> Result<Self> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::null());

        let bytes = match input {
            PipeInput::Null => {
                cmd.stdin(Stdio::null());
                None
            }
            PipeInput::Child(upstream) => {
                cmd.stdin(Stdio::from(upstream));
                None
            }
            PipeInput::Bytes(bytes) => {
                cmd.stdin(Stdio::piped());
                Some(bytes)
            }
        };

        let mut child = spawn_retrying(&mut cmd).map_err(|e| spawn_error(label, command, &e))?;
        let stdout = child.stdout.take();
        let feeder = match (bytes, child.stdin.take()) {
            (Some(bytes), Some(stdin)) => Some(spawn_feeder(stdin, bytes)),
            _ => None,
        };

        Ok(Self {
            label: label.to_string(),
            child,
            stdout,
            feeder,
            status: None,
            switch: None,
        })
    }

    /// Lets `switch` kill this child. Kills it right away if the switch has
    /// already tripped.
    pub fn attach(&mut self, switch: &KillSwitch) {
        if self.status.is_some() {
            return;
        }
        let mut state = switch.lock();
        if state.tripped {
            drop(state);
            self.child.kill().ok();
            return;
        }
        let pid = self.pid();
        if !state.pids.contains(&pid) {
            state.pids.push(pid);
        }
        drop(state);
        self.switch = Some(switch.clone());
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Hands the stdout pipe to the caller, e.g. to connect it to another child.
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    /// Exit status if the child has already exited.
    pub fn try_status(&mut self) -> Option<ExitStatus> {
        if self.status.is_none() {
            self.status = self.try_reap().ok().flatten();
        }
        self.status
    }

    /// Closes the pipes and waits up to `grace` for the child to exit on its
    /// own, then kills it. Returns the exit status.
    pub fn finish(&mut self, grace: Duration) -> Result<ExitStatus> {
        if let Some(status) = self.status {
            return Ok(status);
        }
        self.stdout = None;

        let deadline = Instant::now() + grace;
        loop {
            if let Some(status) = self.try_reap()? {
                self.status = Some(status);
                break;
            }
            if Instant::now() >= deadline {
                self.detach();
                self.child.kill().ok();
                self.status = Some(self.child.wait()?);
                break;
            }
            thread::sleep(EXIT_POLL);
        }
        self.join_feeder();
        self.status.ok_or_else(|| BgmixError::Other(format!("{} was not reaped", self.label)))
    }

    /// Kills the child (if still running) and reaps it. Idempotent.
    pub fn terminate(&mut self) {
        self.stdout = None;
        if self.status.is_none() {
            self.detach();
            if let Ok(None) = self.child.try_wait() {
                self.child.kill().ok();
            }
            self.status = self.child.wait().ok();
        }
        self.join_feeder();
    }

    /// Non-blocking wait; a reaped child leaves its switch in the same step.
    fn try_reap(&mut self) -> io::Result<Option<ExitStatus>> {
        let Some(switch) = self.switch.clone() else {
            return self.child.try_wait();
        };
        let mut state = switch.lock();
        let status = self.child.try_wait()?;
        if status.is_some() {
            let pid = self.child.id();
            state.pids.retain(|p| *p != pid);
            drop(state);
            self.switch = None;
        }
        Ok(status)
    }

    /// Removes this child from its switch before the owner reaps it.
    fn detach(&mut self) {
        if let Some(switch) = self.switch.take() {
            let pid = self.child.id();
            switch.lock().pids.retain(|p| *p != pid);
        }
    }

    fn join_feeder(&mut self) {
        if let Some(feeder) = self.feeder.take() {
            // Feeder only panics if the write loop itself panics
            feeder.join().ok();
        }
    }
}

impl Read for SupervisedChild {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.stdout.as_mut() {
            Some(stdout) => stdout.read(buf),
            None => Ok(0),
        }
    }
}

impl Drop for SupervisedChild {
    fn drop(&mut self) {
        self.terminate();
    }
}

impl std::fmt::Debug for SupervisedChild {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SupervisedChild")
            .field("label", &self.label)
            .field("pid", &self.child.id())
            .field("status", &self.status)
            .finish()
    }
}

/// Human-readable exit status ("exit status: 1", "signal: 9 (SIGKILL)").
pub fn describe_status(status: &ExitStatus) -> String {
    status.to_string()
}

/// Retries briefly while the executable is still open for writing
/// elsewhere (ETXTBSY), e.g. right after an engine binary was replaced.
fn spawn_retrying(cmd: &mut Command) -> io::Result<Child> {
    let mut attempts = 0;
    loop {
        match cmd.spawn() {
            Err(e) if e.raw_os_error() == Some(libc::ETXTBSY) && attempts < SPAWN_RETRIES => {
                attempts += 1;
                thread::sleep(EXIT_POLL * attempts);
            }
            result => return result,
        }
    }
}

fn spawn_feeder(mut stdin: ChildStdin, bytes: Vec<u8>) -> JoinHandle<()> {
    thread::spawn(move || {
        // BrokenPipe means the consumer exited or was killed
        stdin.write_all(&bytes).ok();
    })
}

fn spawn_error(label: &str, command: &CommandLine, e: &io::Error) -> BgmixError {
    match e.kind() {
        io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => {
            BgmixError::EngineUnavailable {
                engine: label.to_string(),
            }
        }
        _ => BgmixError::Spawn {
            program: command.program.clone(),
            message: e.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> CommandLine {
        CommandLine::new("sh").args(["-c", script])
    }

    #[test]
    fn test_command_line_display_quotes_spaces() {
        let cmd = CommandLine::new("espeak").args(["-s", "150", "hello world"]);
        assert_eq!(cmd.to_string(), "espeak -s 150 'hello world'");
    }

    #[test]
    fn test_missing_program_is_engine_unavailable() {
        let err = SupervisedChild::spawn(
            "ghost",
            &CommandLine::new("/nonexistent/bgmix-engine"),
            PipeInput::Null,
        )
        .unwrap_err();
        assert!(matches!(err, BgmixError::EngineUnavailable { engine } if engine == "ghost"));
    }

    #[test]
    fn test_reads_stdout_and_exit_status() {
        let mut child = SupervisedChild::spawn("echo", &sh("printf abc"), PipeInput::Null).unwrap();
        let mut out = String::new();
        child.read_to_string(&mut out).unwrap();
        assert_eq!(out, "abc");
        assert!(child.finish(Duration::from_secs(5)).unwrap().success());
    }

    #[test]
    fn test_nonzero_exit_status_reported() {
        let mut child = SupervisedChild::spawn("fail", &sh("exit 3"), PipeInput::Null).unwrap();
        let status = child.finish(Duration::from_secs(5)).unwrap();
        assert_eq!(status.code(), Some(3));
        assert!(describe_status(&status).contains('3'));
    }

    #[test]
    fn test_bytes_input_is_fed_to_stdin() {
        let mut child =
            SupervisedChild::spawn("cat", &CommandLine::new("cat"), PipeInput::Bytes(b"hello".to_vec()))
                .unwrap();
        let mut out = Vec::new();
        child.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"hello");
        child.finish(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn test_child_stdout_connects_to_next_stdin() {
        let mut producer = SupervisedChild::spawn("producer", &sh("printf piped"), PipeInput::Null).unwrap();
        let stdout = producer.take_stdout().unwrap();
        let mut consumer =
            SupervisedChild::spawn("consumer", &CommandLine::new("cat"), PipeInput::Child(stdout)).unwrap();
        let mut out = String::new();
        consumer.read_to_string(&mut out).unwrap();
        assert_eq!(out, "piped");
        consumer.finish(Duration::from_secs(5)).unwrap();
        producer.finish(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn test_finish_kills_after_grace() {
        let mut child = SupervisedChild::spawn("sleeper", &sh("sleep 30"), PipeInput::Null).unwrap();
        let started = Instant::now();
        let status = child.finish(Duration::from_millis(50)).unwrap();
        assert!(!status.success());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_drop_reaps_running_child() {
        let child = SupervisedChild::spawn("sleeper", &sh("sleep 30"), PipeInput::Null).unwrap();
        let pid = child.pid();
        drop(child);
        // Reaped: the pid no longer names a child of ours
        let rc = unsafe { libc::waitpid(pid as libc::pid_t, std::ptr::null_mut(), libc::WNOHANG) };
        assert_eq!(rc, -1);
    }

    #[test]
    fn test_terminate_is_idempotent() {
        let mut child = SupervisedChild::spawn("sleeper", &sh("sleep 30"), PipeInput::Null).unwrap();
        child.terminate();
        child.terminate();
        assert!(child.try_status().is_some());
    }

    #[test]
    fn test_kill_switch_unblocks_reader_on_another_thread() {
        let mut child = SupervisedChild::spawn("stalled", &sh("exec sleep 30"), PipeInput::Null).unwrap();
        let switch = KillSwitch::new();
        child.attach(&switch);

        let tripper = {
            let switch = switch.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(100));
                switch.trip();
            })
        };
        let started = Instant::now();
        let mut out = Vec::new();
        child.read_to_end(&mut out).unwrap();
        assert!(started.elapsed() < Duration::from_secs(10));
        tripper.join().unwrap();
        assert!(!child.finish(Duration::from_secs(5)).unwrap().success());
        assert!(switch.lock().pids.is_empty());
    }

    #[test]
    fn test_attach_to_tripped_switch_kills_immediately() {
        let switch = KillSwitch::new();
        switch.trip();
        switch.trip();
        assert!(switch.is_tripped());
        let mut child = SupervisedChild::spawn("late", &sh("exec sleep 30"), PipeInput::Null).unwrap();
        child.attach(&switch);
        let started = Instant::now();
        child.finish(Duration::from_secs(20)).unwrap();
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_reaped_child_leaves_switch() {
        let switch = KillSwitch::new();
        let mut child = SupervisedChild::spawn("quick", &sh("exit 0"), PipeInput::Null).unwrap();
        child.attach(&switch);
        assert_eq!(switch.lock().pids.len(), 1);
        assert!(child.finish(Duration::from_secs(5)).unwrap().success());
        assert!(switch.lock().pids.is_empty());
        // Nothing left to signal
        switch.trip();
    }

    #[test]
    fn test_feeder_survives_consumer_exit() {
        // Consumer exits without reading; the feeder sees a broken pipe
        let mut child = SupervisedChild::spawn(
            "early-exit",
            &sh("exit 0"),
            PipeInput::Bytes(vec![0u8; 1 << 20]),
        )
        .unwrap();
        child.finish(Duration::from_secs(5)).unwrap();
    }
}
