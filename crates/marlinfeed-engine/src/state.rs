//! Observable printer state.
//!
//! `PrinterState` aggregates everything the HTTP surface reports: the
//! conversation phase, temperatures and the active job descriptor. It is a
//! pure function of the events the protocol engine feeds it; nothing here
//! talks to the printer.
//!
//! The engine owns the single writer side. HTTP connections get a
//! [`StateHandle`] and read point-in-time snapshots rendered to JSON; they
//! never share the engine's mutable structures.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;

use marlinfeed_core::Phase;
use marlinfeed_protocol::TemperatureReport;

/// Temperatures, job progress and phase as last reported by the engine.
#[derive(Debug, Clone)]
pub struct PrinterState {
    /// `[actual, target]` per hotend.
    tool: [[f64; 2]; 2],
    /// `[actual, target]` for the bed.
    bed: [f64; 2],

    phase: Phase,

    job_name: String,
    job_size: u64,
    printed_bytes: u64,

    start_time: Option<Instant>,
    /// Derived end time from a slicer estimate; `None` until parsed.
    end_time: Option<Instant>,
    pause_start: Option<Instant>,
    pause_time: Duration,
}

impl PrinterState {
    pub fn new() -> Self {
        PrinterState {
            tool: [[0.0; 2]; 2],
            bed: [0.0; 2],
            phase: Phase::Disconnected,
            job_name: "None".to_string(),
            job_size: 0,
            printed_bytes: 0,
            start_time: None,
            end_time: None,
            pause_start: None,
            pause_time: Duration::ZERO,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Applies a phase change with its job bookkeeping side effects:
    /// entering Printing from outside a job stamps the start time, pause
    /// transitions accumulate paused time, and leaving the job clears the
    /// descriptor.
    pub fn set_phase(&mut self, phase: Phase) {
        if !phase.job_active() {
            self.clear_job();
        }
        if phase == Phase::Printing && !self.phase.job_active() {
            self.start_time = Some(Instant::now());
        }
        if phase == Phase::Paused && self.phase != Phase::Paused {
            self.pause_start = Some(Instant::now());
        }
        if self.phase == Phase::Paused && phase != Phase::Paused {
            if let Some(t) = self.pause_start.take() {
                self.pause_time += t.elapsed();
            }
        }
        self.phase = phase;
    }

    pub fn clear_job(&mut self) {
        self.start_time = None;
        self.end_time = None;
        self.pause_start = None;
        self.pause_time = Duration::ZERO;
        self.job_name = "None".to_string();
        self.job_size = 0;
        self.printed_bytes = 0;
    }

    pub fn set_job_name(&mut self, name: &str) {
        self.job_name = name.to_string();
    }

    pub fn set_job_size(&mut self, bytes: u64) {
        self.job_size = bytes;
    }

    pub fn set_printed_bytes(&mut self, bytes: u64) {
        self.printed_bytes = bytes;
    }

    /// Stores a slicer estimate, deriving the expected end time.
    pub fn set_estimated_print_time(&mut self, seconds: u32) {
        if seconds > 0 {
            if let Some(start) = self.start_time {
                self.end_time = Some(start + Duration::from_secs(seconds as u64));
            }
        }
    }

    /// Folds a temperature report into the snapshot. Absent fields keep
    /// their previous values.
    pub fn apply_temperatures(&mut self, report: &TemperatureReport) {
        for t in 0..2 {
            for i in 0..2 {
                if let Some(v) = report.tool[t][i] {
                    self.tool[t][i] = v;
                }
            }
        }
        for i in 0..2 {
            if let Some(v) = report.bed[i] {
                self.bed[i] = v;
            }
        }
    }

    pub fn tool0(&self) -> (f64, f64) {
        (self.tool[0][0], self.tool[0][1])
    }

    /// Elapsed print time with paused spans subtracted; frozen while
    /// paused.
    fn elapsed(&self) -> Duration {
        let Some(start) = self.start_time else {
            return Duration::ZERO;
        };
        let upto = match self.pause_start {
            Some(p) => p.duration_since(start),
            None => start.elapsed(),
        };
        upto.saturating_sub(self.pause_time)
    }

    /// Percent complete: elapsed/estimated when a slicer estimate is
    /// known, else bytes-read/size, else zero.
    fn completion(&self) -> f64 {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) if end > start => {
                100.0 * self.elapsed().as_secs_f64() / (end - start).as_secs_f64()
            }
            _ if self.job_size > 0 => 100.0 * self.printed_bytes as f64 / self.job_size as f64,
            _ => 0.0,
        }
    }

    /// The Octoprint "printer" document: state text, flags and
    /// temperatures.
    pub fn printer_document(&self) -> PrinterDocument {
        // A stall is not an error and not observable from outside: the
        // printer is just busy with a long command, so it reports as
        // Printing.
        let text = match self.phase {
            Phase::Printing | Phase::Stalled => "Printing",
            Phase::Paused => "Paused",
            _ => "Operational",
        };
        PrinterDocument {
            sd: SdBlock { ready: false },
            state: StateBlock {
                text: text.to_string(),
                flags: Flags {
                    operational: true,
                    paused: self.phase == Phase::Paused,
                    printing: matches!(self.phase, Phase::Printing | Phase::Stalled),
                    cancelling: false,
                    pausing: false,
                    sd_ready: false,
                    error: false,
                    ready: true,
                    closed_or_error: false,
                },
            },
            temperature: TemperatureBlock {
                tool0: Heater::new(self.tool[0]),
                tool1: Heater::new(self.tool[1]),
                bed: Heater::new(self.bed),
            },
        }
    }

    /// The Octoprint "job" document: file name, progress, elapsed time.
    /// A stall is reported as Printing; the distinction is internal.
    pub fn job_document(&self) -> JobDocument {
        let text = match self.phase {
            Phase::Printing | Phase::Stalled => "Printing",
            Phase::Paused => "Paused",
            _ => "Operational",
        };
        let name_only = self
            .job_name
            .rsplit('/')
            .next()
            .unwrap_or(&self.job_name)
            .to_string();
        JobDocument {
            state: text.to_string(),
            job: JobBlock {
                file: FileBlock { name: name_only },
            },
            progress: ProgressBlock {
                print_time: self.elapsed().as_secs_f64(),
                print_time_left: None,
                completion: self.completion(),
            },
        }
    }
}

impl Default for PrinterState {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Serialize)]
pub struct PrinterDocument {
    pub sd: SdBlock,
    pub state: StateBlock,
    pub temperature: TemperatureBlock,
}

#[derive(Debug, Serialize)]
pub struct SdBlock {
    pub ready: bool,
}

#[derive(Debug, Serialize)]
pub struct StateBlock {
    pub text: String,
    pub flags: Flags,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Flags {
    pub operational: bool,
    pub paused: bool,
    pub printing: bool,
    pub cancelling: bool,
    pub pausing: bool,
    pub sd_ready: bool,
    pub error: bool,
    pub ready: bool,
    pub closed_or_error: bool,
}

#[derive(Debug, Serialize)]
pub struct TemperatureBlock {
    pub tool0: Heater,
    pub tool1: Heater,
    pub bed: Heater,
}

#[derive(Debug, Serialize)]
pub struct Heater {
    pub actual: f64,
    pub target: f64,
    pub offset: f64,
}

impl Heater {
    fn new(pair: [f64; 2]) -> Self {
        Heater {
            actual: pair[0],
            target: pair[1],
            offset: 0.0,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct JobDocument {
    pub state: String,
    pub job: JobBlock,
    pub progress: ProgressBlock,
}

#[derive(Debug, Serialize)]
pub struct JobBlock {
    pub file: FileBlock,
}

#[derive(Debug, Serialize)]
pub struct FileBlock {
    pub name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressBlock {
    pub print_time: f64,
    pub print_time_left: Option<f64>,
    pub completion: f64,
}

/// Shared, snapshot-readable handle onto the printer state. The engine is
/// the only writer; HTTP tasks read.
#[derive(Debug, Clone, Default)]
pub struct StateHandle(Arc<Mutex<PrinterState>>);

impl StateHandle {
    pub fn new() -> Self {
        StateHandle(Arc::new(Mutex::new(PrinterState::new())))
    }

    /// Runs `f` against the live state. Kept short by all callers; the
    /// lock is never held across an await point.
    pub fn with<R>(&self, f: impl FnOnce(&mut PrinterState) -> R) -> R {
        let mut guard = self.0.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    pub fn phase(&self) -> Phase {
        self.with(|s| s.phase())
    }

    pub fn set_phase(&self, phase: Phase) {
        self.with(|s| s.set_phase(phase));
    }

    pub fn printer_json(&self) -> String {
        let doc = self.with(|s| s.printer_document());
        serde_json::to_string_pretty(&doc).unwrap_or_else(|_| "{}".to_string())
    }

    pub fn job_json(&self) -> String {
        let doc = self.with(|s| s.job_document());
        serde_json::to_string_pretty(&doc).unwrap_or_else(|_| "{}".to_string())
    }
}
