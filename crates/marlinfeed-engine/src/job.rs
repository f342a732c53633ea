//! Job sequencing: the source queue, the directory watcher and the
//! per-job retry policy.
//!
//! The controller owns the engine. It feeds it one job at a time from a
//! FIFO of sources (paths and the stdin sentinel, seeded from the command
//! line) topped up by a directory scanner that discovers freshly uploaded
//! `.gcode` files. When nothing is queued but injected commands are
//! waiting, a drain job with an empty source runs so the injections reach
//! the printer.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use marlinfeed_core::constants::{HARD_FAULT_BACKOFF, MIN_FILE_AGE};
use marlinfeed_core::{Error, FaultSite, IoErrorPolicy, Phase};

use crate::engine::{Connect, JobError, JobSpec, ProtocolEngine};

/// One entry of the job queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobRequest {
    Path(PathBuf),
    Stdin,
}

/// Watches directories for new files.
///
/// A scan picks up regular files whose mtime falls between the previous
/// and the current scan. Found files become candidates and are only
/// released once their mtime is at least [`MIN_FILE_AGE`] in the past, so
/// a file still being uploaded is not printed half-done.
#[derive(Debug, Default)]
pub struct DirScanner {
    dirs: Vec<PathBuf>,
    candidates: VecDeque<PathBuf>,
    /// Seconds-resolution timestamp of the previous scan. The sub-second
    /// part of file mtimes is unreliable relative to the realtime clock,
    /// so comparisons stay at whole seconds.
    last_scan: u64,
}

impl DirScanner {
    /// A scanner that reports only files newer than its creation time.
    pub fn new() -> Self {
        DirScanner {
            dirs: Vec::new(),
            candidates: VecDeque::new(),
            last_scan: unix_seconds(SystemTime::now()),
        }
    }

    pub fn add_dir(&mut self, path: impl Into<PathBuf>) {
        let path = path.into();
        if path.as_os_str().is_empty() {
            return;
        }
        self.dirs.push(path);
    }

    /// True iff refill can never produce another entry.
    pub fn is_empty(&self) -> bool {
        self.dirs.is_empty() && self.candidates.is_empty()
    }

    /// Moves ripe `.gcode` candidates into `queue`.
    pub fn refill(&mut self, queue: &mut VecDeque<JobRequest>) {
        self.scan();
        for _ in 0..self.candidates.len() {
            let Some(candidate) = self.candidates.pop_front() else {
                break;
            };
            if !ripe(&candidate) {
                self.candidates.push_back(candidate);
            } else if has_gcode_extension(&candidate) {
                info!(file = %candidate.display(), "new print file");
                queue.push_back(JobRequest::Path(candidate));
            }
            // ripe non-gcode files are dropped
        }
    }

    fn scan(&mut self) {
        let last = self.last_scan;
        let cur = unix_seconds(SystemTime::now());
        if last == cur {
            // scanning twice within a second would rediscover files
            return;
        }
        self.last_scan = cur;

        for dir in &self.dirs {
            let entries = match std::fs::read_dir(dir) {
                Ok(e) => e,
                Err(e) => {
                    warn!(dir = %dir.display(), error = %e, "cannot scan directory");
                    continue;
                }
            };
            for entry in entries.flatten() {
                let Ok(meta) = entry.metadata() else {
                    continue;
                };
                if !meta.is_file() {
                    continue;
                }
                let Ok(modified) = meta.modified() else {
                    continue;
                };
                let mtime = unix_seconds(modified);
                if mtime < last || mtime >= cur {
                    continue;
                }
                let path = entry.path();
                if !self.candidates.contains(&path) {
                    debug!(file = %path.display(), "upload candidate");
                    self.candidates.push_back(path);
                }
            }
        }
    }

    #[cfg(test)]
    fn backdate_last_scan(&mut self, seconds: u64) {
        self.last_scan -= seconds;
    }
}

fn unix_seconds(t: SystemTime) -> u64 {
    t.duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// True iff the file can be statted and its mtime lies at least
/// [`MIN_FILE_AGE`] in the past.
fn ripe(path: &Path) -> bool {
    let Ok(meta) = std::fs::metadata(path) else {
        return false;
    };
    let Ok(modified) = meta.modified() else {
        return false;
    };
    let mtime = unix_seconds(modified);
    let now = unix_seconds(SystemTime::now());
    mtime + MIN_FILE_AGE.as_secs() <= now
}

fn has_gcode_extension(path: &Path) -> bool {
    path.extension().map(|e| e == "gcode").unwrap_or(false)
}

/// Sequences jobs through the engine and applies the failure policy.
pub struct JobController<C: Connect> {
    engine: ProtocolEngine<C>,
    queue: VecDeque<JobRequest>,
    scanner: DirScanner,
    policy: IoErrorPolicy,
    /// True while the HTTP surface can still produce work, keeping the
    /// controller alive on an empty queue.
    serving: bool,
    abort: CancellationToken,
    last_printed: Option<PathBuf>,
    hard_error_count: u32,
}

impl<C: Connect> JobController<C> {
    pub fn new(
        engine: ProtocolEngine<C>,
        scanner: DirScanner,
        policy: IoErrorPolicy,
        serving: bool,
        abort: CancellationToken,
    ) -> Self {
        JobController {
            engine,
            queue: VecDeque::new(),
            scanner,
            policy,
            serving,
            abort,
            last_printed: None,
            hard_error_count: 0,
        }
    }

    pub fn queue_path(&mut self, path: impl Into<PathBuf>) {
        self.queue.push_back(JobRequest::Path(path.into()));
    }

    pub fn queue_stdin(&mut self) {
        self.queue.push_back(JobRequest::Stdin);
    }

    pub fn last_printed(&self) -> Option<&Path> {
        self.last_printed.as_deref()
    }

    /// Runs until every reachable source is exhausted, the policy says
    /// quit, or an abort is requested while idle.
    pub async fn run(mut self) -> Result<(), Error> {
        loop {
            if self.abort.is_cancelled() {
                info!("terminating on request");
                return Ok(());
            }
            // done with all sources and no chance of new ones appearing
            if self.queue.is_empty() && !self.serving && self.scanner.is_empty() {
                return Ok(());
            }

            if self.queue.is_empty() {
                self.scanner.refill(&mut self.queue);
                if self.queue.is_empty() && !self.engine.injection_pending() {
                    sleep(Duration::from_millis(250)).await;
                    continue;
                }
            }

            let outcome = match self.queue.pop_front() {
                Some(JobRequest::Path(path)) => {
                    self.last_printed = Some(path.clone());
                    self.run_file_job(path).await
                }
                Some(JobRequest::Stdin) => {
                    let spec = JobSpec {
                        name: "stdin".to_string(),
                        size: 0,
                        dummy: false,
                    };
                    self.engine.run_job(tokio::io::stdin(), &spec).await
                }
                // nothing queued but injections are waiting: drain them
                None => {
                    let spec = JobSpec {
                        name: "injected".to_string(),
                        size: 0,
                        dummy: true,
                    };
                    self.engine.run_job(tokio::io::empty(), &spec).await
                }
            };

            match outcome {
                Ok(_) => {
                    self.hard_error_count = 0;
                    self.engine.state().set_phase(Phase::Idle);
                }
                Err(err) => self.handle_failure(err).await?,
            }
        }
    }

    async fn run_file_job(&mut self, path: PathBuf) -> Result<crate::engine::JobStats, JobError> {
        let file = match tokio::fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) => {
                return Err(JobError {
                    site: FaultSite::Source,
                    error: Error::Io(e),
                })
            }
        };
        let size = file.metadata().await.map(|m| m.len()).unwrap_or(0);
        let spec = JobSpec {
            name: path.display().to_string(),
            size,
            dummy: false,
        };
        self.engine.run_job(file, &spec).await
    }

    async fn handle_failure(&mut self, err: JobError) -> Result<(), Error> {
        error!(error = %err, "job failed");
        match err.site {
            FaultSite::Abort => {
                self.engine.state().set_phase(Phase::Idle);
            }
            FaultSite::Source => {
                if self.policy == IoErrorPolicy::Quit {
                    return Err(err.error);
                }
                self.engine.state().set_phase(Phase::Idle);
            }
            FaultSite::Printer => {
                self.engine.state().set_phase(Phase::Disconnected);
                if self.policy == IoErrorPolicy::Quit {
                    return Err(err.error);
                }
            }
            FaultSite::PrinterHard => {
                self.engine.state().set_phase(Phase::Disconnected);
                if self.policy == IoErrorPolicy::Quit {
                    return Err(err.error);
                }
                // wait for the fault to clear, e.g. a USB cable being
                // replugged and the device re-enumerating
                if self.hard_error_count < 4 {
                    self.hard_error_count += 1;
                }
                let backoff = HARD_FAULT_BACKOFF * self.hard_error_count;
                warn!(
                    seconds = backoff.as_secs(),
                    "suspending operation in hopes the hard error will disappear"
                );
                sleep(backoff).await;
            }
        }
        Ok(())
    }
}
