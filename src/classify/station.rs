//! Station abstraction: one worker thread fed by a bounded channel.

use crate::events::{EngineEvent, EventSender};
use crossbeam_channel::{Receiver, Sender};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Errors that can occur during station processing.
#[derive(Debug, Clone)]
pub enum StationError {
    /// The station keeps going after reporting.
    Recoverable(String),
    /// The station shuts down after reporting.
    Fatal(String),
}

impl fmt::Display for StationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StationError::Recoverable(msg) => write!(f, "Recoverable error: {}", msg),
            StationError::Fatal(msg) => write!(f, "Fatal error: {}", msg),
        }
    }
}

impl std::error::Error for StationError {}

/// Trait for reporting station errors.
pub trait ErrorReporter: Send + Sync {
    fn report(&self, station: &str, error: &StationError);
}

/// Forwards station errors to the event channel as warnings.
#[derive(Debug, Clone)]
pub struct EventReporter {
    events: EventSender,
}

impl EventReporter {
    pub fn new(events: EventSender) -> Self {
        Self { events }
    }
}

impl ErrorReporter for EventReporter {
    fn report(&self, station: &str, error: &StationError) {
        self.events
            .emit(EngineEvent::warning(format!("[{station}] {error}")));
    }
}

/// A processing step running on its own thread.
pub trait Station: Send + 'static {
    type Input: Send + 'static;
    type Output: Send + 'static;

    /// `Ok(None)` means the input was consumed without producing output.
    fn process(&mut self, input: Self::Input) -> Result<Option<Self::Output>, StationError>;

    fn name(&self) -> &'static str;

    /// Called once when the input channel closes or a fatal error occurs.
    fn shutdown(&mut self) {}
}

/// Runs a station in a dedicated thread until its input channel closes.
pub struct StationRunner<S: Station> {
    handle: Option<JoinHandle<()>>,
    station_name: &'static str,
    _phantom: PhantomData<S>,
}

impl<S: Station> StationRunner<S> {
    /// Spawns `station`. Without an output channel the station is a sink
    /// and its outputs are discarded.
    pub fn spawn(
        mut station: S,
        input_rx: Receiver<S::Input>,
        output_tx: Option<Sender<S::Output>>,
        error_reporter: Arc<dyn ErrorReporter>,
    ) -> Self {
        let station_name = station.name();

        let handle = thread::spawn(move || {
            Self::run_station(&mut station, input_rx, output_tx, error_reporter);
        });

        Self {
            handle: Some(handle),
            station_name,
            _phantom: PhantomData,
        }
    }

    fn run_station(
        station: &mut S,
        input_rx: Receiver<S::Input>,
        output_tx: Option<Sender<S::Output>>,
        error_reporter: Arc<dyn ErrorReporter>,
    ) {
        let station_name = station.name();

        while let Ok(input) = input_rx.recv() {
            match station.process(input) {
                Ok(Some(output)) => {
                    if let Some(tx) = &output_tx
                        && tx.send(output).is_err()
                    {
                        break;
                    }
                }
                Ok(None) => {}
                Err(error @ StationError::Recoverable(_)) => {
                    error_reporter.report(station_name, &error);
                }
                Err(error @ StationError::Fatal(_)) => {
                    error_reporter.report(station_name, &error);
                    break;
                }
            }
        }

        station.shutdown();
    }

    /// Waits for the station thread to complete.
    pub fn join(mut self) -> Result<(), String> {
        if let Some(handle) = self.handle.take() {
            handle
                .join()
                .map_err(|_| format!("Station '{}' thread panicked", self.station_name))
        } else {
            Ok(())
        }
    }

    pub fn name(&self) -> &'static str {
        self.station_name
    }
}
