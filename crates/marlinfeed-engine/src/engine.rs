//! The protocol engine: the dialogue state machine between a G-code
//! source and a Marlin-compatible printer.
//!
//! One engine owns one printer link. Per job it drives a loop of
//!
//! 1. suspend until progress is possible (serial readable, injection
//!    pending, source readable, or a timer due),
//! 2. drain and classify printer replies,
//! 3. fill the send window from the injection channel (priority) and the
//!    job source,
//! 4. transmit everything the window yields,
//! 5. update the observable phase,
//! 6. enforce the error-window / silence / resend-storm limits,
//! 7. detect job completion.
//!
//! The engine is the single execution context touching the link, the send
//! window and the state's writer side. HTTP workers reach it only through
//! the injection channel and the pause switch.
//!
//! # Resync
//!
//! Any transition into Disconnected triggers the handshake before the
//! next job: optionally reopen the transport, wait for Marlin's banner,
//! then repeatedly probe with the wrap-around frame until the printer
//! answers a probe with `ok`. A failed soft handshake is promoted to a
//! hard reopen exactly once per attempt cycle.

use std::io;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use marlinfeed_core::constants::{
    BANNER_WAIT, COOLDOWN_GCODE, DEFAULT_RX_BUFFER, ERROR_BURST_PAUSE, HARD_RESET_PAUSE,
    LIFT_NOZZLE_GCODE, MAX_HANDSHAKE_ATTEMPTS, MAX_RESENDS, MAX_TIME_SILENCE, MAX_TIME_WITH_ERROR,
    QUIESCENCE, SOFT_RETRY_PAUSE, STALL_TIME, STOP_SD_PRINT_GCODE, WRAP_AROUND_FRAME,
};
use marlinfeed_core::{Error, FaultSite, Phase};
use marlinfeed_protocol::{classify, parse_temperature_report, GcodeParser, Reply, SendWindow};

use crate::control::PauseSwitch;
use crate::state::StateHandle;

/// Slack added to timer deadlines so a wakeup lands strictly after the
/// compared-against duration has elapsed.
const TICK: Duration = Duration::from_millis(10);

/// Opens (and reopens) the byte stream to the printer. Production code
/// connects TTYs and sockets; tests hand out scripted duplex streams.
pub trait Connect {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send;

    fn connect(&mut self) -> impl std::future::Future<Output = io::Result<Self::Stream>> + Send;
}

/// A job failure, tagged with where it originated so the controller can
/// pick between resync, reopen backoff and the ioerror policy.
#[derive(Debug)]
pub struct JobError {
    pub site: FaultSite,
    pub error: Error,
}

impl JobError {
    fn source(error: Error) -> Self {
        JobError {
            site: FaultSite::Source,
            error,
        }
    }

    fn printer(error: Error) -> Self {
        JobError {
            site: FaultSite::Printer,
            error,
        }
    }

    fn hard(error: Error) -> Self {
        JobError {
            site: FaultSite::PrinterHard,
            error,
        }
    }

    fn abort() -> Self {
        JobError {
            site: FaultSite::Abort,
            error: Error::Aborted,
        }
    }
}

impl std::fmt::Display for JobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl std::error::Error for JobError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// What the engine is told about a job before driving it.
#[derive(Debug, Clone)]
pub struct JobSpec {
    /// Display name (path, "stdin", ...).
    pub name: String,
    /// Source size in bytes; 0 if unknown (pipes, stdin).
    pub size: u64,
    /// A drain job: no real source, only injected commands are processed.
    pub dummy: bool,
}

/// Per-job transfer statistics, reported at completion.
#[derive(Debug)]
pub struct JobStats {
    pub errors: u32,
    pub resends: u32,
    pub gcodes: u64,
    pub bytes: u64,
    start: Instant,
    g28: Option<Instant>,
}

impl JobStats {
    fn new() -> Self {
        JobStats {
            errors: 0,
            resends: 0,
            gcodes: 0,
            bytes: 0,
            start: Instant::now(),
            g28: None,
        }
    }

    /// G28 marks the real start of a print; counters restart there so the
    /// transfer rate is not skewed by the homing wait.
    fn mark_g28(&mut self) {
        self.g28 = Some(Instant::now());
        self.gcodes = 0;
        self.bytes = 0;
    }
}

/// Dialogue bookkeeping that lives for the duration of one job.
struct Dialogue {
    /// Set by `Resend:` so its accompanying `ok` is not counted as an ack.
    ignore_ok: bool,
    resend_count: u32,
    /// Start of the current error burst; cleared by `ok` or other chatter.
    first_error: Option<Instant>,
    last_ok: Instant,
    /// Last reply of any kind while waiting for an ack; `None` while not
    /// waiting.
    last_lifesign: Option<Instant>,
}

impl Dialogue {
    fn new() -> Self {
        Dialogue {
            ignore_ok: false,
            resend_count: 0,
            first_error: None,
            last_ok: Instant::now(),
            last_lifesign: None,
        }
    }
}

/// The engine. See module docs.
pub struct ProtocolEngine<C: Connect> {
    connector: C,
    link: Option<C::Stream>,
    state: StateHandle,
    pause: PauseSwitch,
    abort: CancellationToken,
    inject_rx: mpsc::UnboundedReceiver<Bytes>,
    /// False once every injection sender is gone (e.g. the API was never
    /// enabled); stops the event loop from polling a dead channel.
    inject_open: bool,
    /// Parses the injection byte stream into lines; persists across jobs.
    inject: GcodeParser,
    rx_buffer: usize,
}

impl<C: Connect> ProtocolEngine<C> {
    pub fn new(
        connector: C,
        state: StateHandle,
        pause: PauseSwitch,
        abort: CancellationToken,
        inject_rx: mpsc::UnboundedReceiver<Bytes>,
    ) -> Self {
        let mut inject = GcodeParser::new();
        inject.whitespace_compression(1);
        ProtocolEngine {
            connector,
            link: None,
            state,
            pause,
            abort,
            inject_rx,
            inject_open: true,
            inject,
            rx_buffer: DEFAULT_RX_BUFFER,
        }
    }

    /// Overrides the assumed printer receive-buffer size.
    pub fn set_rx_buffer(&mut self, bytes: usize) {
        self.rx_buffer = bytes;
    }

    pub fn state(&self) -> &StateHandle {
        &self.state
    }

    /// Drops the link; the next job starts with a hard reconnect.
    pub fn disconnect(&mut self) {
        self.link = None;
        self.state.set_phase(Phase::Disconnected);
    }

    /// True if injected commands are waiting to be processed. Drains the
    /// channel into the injection parser as a side effect.
    pub fn injection_pending(&mut self) -> bool {
        while let Ok(chunk) = self.inject_rx.try_recv() {
            self.inject.feed(&chunk);
        }
        self.inject.has_next() || self.inject.partial_len() > 0
    }

    /// The resync procedure, run before every job. A soft handshake
    /// reuses the open transport; if it fails it is promoted to a hard
    /// reopen exactly once.
    async fn handshake(&mut self) -> Result<(), JobError> {
        self.state.set_phase(Phase::Handshaking);
        let mut link = self.link.take();
        let mut hard = link.is_none();

        loop {
            if link.is_none() {
                hard = true;
                match self.connector.connect().await {
                    Ok(stream) => {
                        debug!("printer device opened");
                        link = Some(stream);
                    }
                    Err(e) => {
                        self.state.set_phase(Phase::Disconnected);
                        return Err(JobError::hard(e.into()));
                    }
                }
            }
            let Some(stream) = link.as_mut() else {
                continue;
            };

            match probe(stream, hard).await {
                Ok(()) => {
                    if hard {
                        info!("successfully established printer connection");
                    }
                    self.link = link;
                    self.state.set_phase(Phase::Idle);
                    return Ok(());
                }
                Err(e) if hard => {
                    self.state.set_phase(Phase::Disconnected);
                    return Err(JobError::hard(e));
                }
                Err(e) => {
                    debug!(error = %e, "soft handshake failed, reopening printer device");
                    link = None;
                }
            }
        }
    }

    /// Drives one job to completion (or failure). Resyncs with the
    /// printer first: a soft handshake if the link survived the previous
    /// job, a hard reopen otherwise. On success the link is kept for the
    /// next job; printer-side failures drop it so the next job reconnects.
    pub async fn run_job<S>(&mut self, source: S, spec: &JobSpec) -> Result<JobStats, JobError>
    where
        S: AsyncRead + Unpin + Send,
    {
        self.handshake().await?;
        let mut link = match self.link.take() {
            Some(l) => l,
            None => return Err(JobError::hard(Error::HandshakeFailed)),
        };

        if !spec.dummy {
            info!(file = %spec.name, "started print");
            let (name, size) = (spec.name.clone(), spec.size);
            self.state.with(|s| {
                s.set_job_name(&name);
                s.set_job_size(size);
            });
        }
        self.pause.reset();
        self.state.set_phase(Phase::Printing);

        let result = self.drive(&mut link, source, spec).await;

        match &result {
            Ok(_) => self.link = Some(link),
            Err(e) => match e.site {
                // the printer link is still good
                FaultSite::Source | FaultSite::Abort => self.link = Some(link),
                // drop the link so the next job reconnects hard
                FaultSite::Printer | FaultSite::PrinterHard => {}
            },
        }
        result
    }

    /// The main loop for one job. `link` is borrowed for the whole job so
    /// the transmit path can block on it (that blocking is the
    /// back-pressure mechanism; every frame is small).
    async fn drive<S>(
        &mut self,
        link: &mut C::Stream,
        mut source: S,
        spec: &JobSpec,
    ) -> Result<JobStats, JobError>
    where
        S: AsyncRead + Unpin + Send,
    {
        let state = self.state.clone();
        let pause = self.pause.clone();
        let abort = self.abort.clone();

        let mut window = SendWindow::new();
        window.set_buf_size(self.rx_buffer);

        let mut replies = GcodeParser::new();
        replies.whitespace_compression(1);

        let mut source_parser = GcodeParser::new();
        source_parser.whitespace_compression(1);

        let mut dlg = Dialogue::new();
        let mut stats = JobStats::new();
        let mut next_gcode: Option<marlinfeed_protocol::Line> = None;
        let mut source_eof = spec.dummy;
        let mut have_time = false;

        let mut serial_buf = [0u8; 1024];
        let mut source_buf = [0u8; 1024];

        loop {
            if abort.is_cancelled() {
                abort_teardown(link).await;
                return Err(JobError::abort());
            }

            // 2. drain printer replies
            while let Some(line) = replies.next() {
                process_reply(&state, &mut window, line, &mut dlg, &mut stats).await?;
            }
            if let Some(t0) = dlg.first_error {
                if t0.elapsed() > MAX_TIME_WITH_ERROR {
                    return Err(JobError::printer(Error::PersistentPrinterError));
                }
            }

            // 3. fill the window: injection first, then the job source
            while let Ok(chunk) = self.inject_rx.try_recv() {
                self.inject.feed(&chunk);
            }
            loop {
                if next_gcode.is_none() {
                    next_gcode = self.inject.next();
                }
                if next_gcode.is_none() && !pause.is_paused() {
                    next_gcode = source_parser.next();
                }

                if !have_time {
                    match source_parser.estimated_print_time() {
                        Some(secs) => {
                            have_time = true;
                            state.with(|s| s.set_estimated_print_time(secs));
                        }
                        None => {
                            let read = source_parser.total_bytes_read();
                            state.with(|s| s.set_printed_bytes(read));
                        }
                    }
                }

                match &next_gcode {
                    Some(line) if line.len() <= window.max_append_len() => {
                        if line.prefix_match("G28\u{8}") != 0 {
                            stats.mark_g28();
                        }
                        window.append(line.data());
                        next_gcode = None;
                    }
                    _ => break,
                }
            }

            // 4. transmit; this write is allowed to block
            while window.has_next() {
                let frame = window.next();
                if let Err(e) = link.write_all(&frame).await {
                    return Err(JobError::printer(Error::Io(e)));
                }
                stats.gcodes += 1;
                stats.bytes += frame.len() as u64;
                trace!(frame = %String::from_utf8_lossy(&frame).trim_end(), "sent");
            }

            // 5. phase
            let phase = if pause.is_paused() {
                Phase::Paused
            } else if next_gcode.is_some() && dlg.last_ok.elapsed() > STALL_TIME {
                Phase::Stalled
            } else {
                Phase::Printing
            };
            state.set_phase(phase);

            // 6. escalations
            if dlg.resend_count > MAX_RESENDS {
                return Err(JobError::printer(Error::ResendStorm));
            }
            if window.needs_ack() {
                let lifesign = *dlg.last_lifesign.get_or_insert_with(Instant::now);
                if lifesign.elapsed() > MAX_TIME_SILENCE {
                    return Err(JobError::printer(Error::AckTimeout));
                }
            } else {
                dlg.last_lifesign = None;
                // 7. job end
                if source_eof && next_gcode.is_none() && !source_parser.has_next() {
                    if !spec.dummy {
                        log_job_record(spec, &stats);
                    }
                    return Ok(stats);
                }
            }

            // 1. suspend until progress is possible
            let deadline = next_deadline(&dlg, &window, &pause, next_gcode.is_some(), phase);
            let want_source = !source_eof
                && next_gcode.is_none()
                && !pause.is_paused()
                && !source_parser.has_next();

            tokio::select! {
                biased;
                _ = abort.cancelled() => {
                    abort_teardown(link).await;
                    return Err(JobError::abort());
                }
                read = link.read(&mut serial_buf) => match read {
                    Ok(0) => return Err(JobError::printer(Error::PrinterEof)),
                    Ok(n) => replies.feed(&serial_buf[..n]),
                    Err(e) => return Err(JobError::printer(Error::Io(e))),
                },
                chunk = self.inject_rx.recv(), if self.inject_open => {
                    match chunk {
                        Some(chunk) => self.inject.feed(&chunk),
                        None => self.inject_open = false,
                    }
                }
                read = source.read(&mut source_buf), if want_source => match read {
                    Ok(0) => {
                        source_eof = true;
                        source_parser.flush();
                    }
                    Ok(n) => source_parser.feed(&source_buf[..n]),
                    Err(e) => return Err(JobError::source(Error::Io(e))),
                },
                _ = pause.changed() => {}
                _ = sleep_until(deadline) => {}
            }
        }
    }
}

/// Earliest point at which a timer-driven decision is due. Deadlines that
/// already fired and were acted on (a stall transition, an abort) are not
/// re-armed, so a wakeup always makes progress.
fn next_deadline(
    dlg: &Dialogue,
    window: &SendWindow,
    pause: &PauseSwitch,
    line_waiting: bool,
    phase: Phase,
) -> Instant {
    let mut deadline = Instant::now() + Duration::from_secs(3600);
    if let Some(t0) = dlg.first_error {
        deadline = deadline.min(t0 + MAX_TIME_WITH_ERROR + TICK);
    }
    if window.needs_ack() {
        if let Some(lifesign) = dlg.last_lifesign {
            deadline = deadline.min(lifesign + MAX_TIME_SILENCE + TICK);
        }
    }
    if line_waiting && !pause.is_paused() && phase != Phase::Stalled {
        deadline = deadline.min(dlg.last_ok + STALL_TIME + TICK);
    }
    deadline
}

/// Classifies and acts on one reply line, re-examining anything that
/// follows an `ok` on the same line (usually a temperature report).
async fn process_reply(
    state: &StateHandle,
    window: &mut SendWindow,
    line: marlinfeed_protocol::Line,
    dlg: &mut Dialogue,
    stats: &mut JobStats,
) -> Result<(), JobError> {
    dlg.last_lifesign = Some(Instant::now());
    let mut input = line;
    loop {
        match classify(&input) {
            Reply::Ok { matched } => {
                trace!("ok");
                dlg.last_ok = Instant::now();
                if dlg.ignore_ok {
                    dlg.ignore_ok = false;
                } else {
                    dlg.resend_count = 0;
                    dlg.first_error = None;
                    if !window.ack() {
                        // Not fatal. The user knows best; a human may be
                        // driving the printer from its own panel.
                        warn!("spurious 'ok'! is a user manually controlling the printer?");
                    }
                }
                input.slice_from(matched as isize);
                if !input.is_empty() {
                    continue;
                }
            }
            Reply::Temperature => {
                state.with(|s| s.apply_temperatures(&parse_temperature_report(input.data())));
                debug!(report = %input.as_str().trim_end(), "temperature");
            }
            Reply::Error => {
                stats.errors += 1;
                dlg.first_error.get_or_insert_with(Instant::now);
                warn!(line = %input.as_str().trim_end(), "printer error");
                // let a potential error burst arrive before transmitting
                // anything else into it
                sleep(ERROR_BURST_PAUSE).await;
            }
            Reply::Resend { matched } => {
                dlg.first_error.get_or_insert_with(Instant::now);
                dlg.resend_count += 1;
                stats.resends += 1;
                input.slice_from(matched as isize);
                let requested = input.number();
                info!(line = requested, "printer requested resend");
                let valid = (0..=i32::MAX as i64).contains(&requested);
                if !valid || !window.seek(requested) {
                    return Err(JobError::printer(Error::IllegalResend));
                }
                // the Resend is accompanied by its own ok which must not
                // free a window slot
                dlg.ignore_ok = true;
                sleep(ERROR_BURST_PAUSE).await;
            }
            Reply::Other => {
                dlg.first_error = None;
                if !input.is_empty() {
                    debug!(line = %input.as_str().trim_end(), "printer chatter");
                }
            }
        }
        break;
    }

    if let Some(t0) = dlg.first_error {
        if t0.elapsed() > MAX_TIME_WITH_ERROR {
            return Err(JobError::printer(Error::PersistentPrinterError));
        }
    }
    Ok(())
}

/// Cools the hotend and lifts the nozzle on an aborted job. Errors here
/// are ignored; the link may already be half dead.
async fn abort_teardown<S: AsyncWrite + Unpin>(link: &mut S) {
    info!("sending cooldown request to printer");
    for _ in 0..3 {
        if link.write_all(COOLDOWN_GCODE.as_bytes()).await.is_err() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    let _ = link.write_all(LIFT_NOZZLE_GCODE.as_bytes()).await;
    sleep(Duration::from_millis(250)).await;
}

fn log_job_record(spec: &JobSpec, stats: &JobStats) {
    let total = stats.start.elapsed();
    let transfer = stats.g28.map(|t| t.elapsed()).unwrap_or(total);
    let dt = transfer.as_secs_f64().max(1.0);
    info!(
        file = %spec.name,
        errors = stats.errors,
        resends = stats.resends,
        seconds = total.as_secs(),
        gcodes_per_sec = format!("{:.1}", stats.gcodes as f64 / dt),
        bits_per_sec = (stats.bytes as f64 * 8.0 / dt) as u64,
        "print finished"
    );
}

/// Probes the printer until it acknowledges a wrap-around frame. Reads
/// with quiescence tolerance (Marlin spams a banner after reset), judges
/// the last full line, and paces retries so the printer can finish
/// resetting.
async fn probe<S>(link: &mut S, hard: bool) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut chatter = GcodeParser::new();
    chatter.whitespace_compression(1);
    let mut buf = [0u8; 1024];

    for attempt in 1..=MAX_HANDSHAKE_ATTEMPTS {
        let mut wait = if hard && attempt == 1 {
            BANNER_WAIT
        } else {
            QUIESCENCE
        };
        loop {
            match timeout(wait, link.read(&mut buf)).await {
                Ok(Ok(0)) => return Err(Error::PrinterEof),
                Ok(Ok(n)) => {
                    chatter.feed(&buf[..n]);
                    wait = QUIESCENCE;
                }
                Ok(Err(e)) => return Err(Error::Io(e)),
                Err(_) => break, // line went quiet
            }
        }
        if chatter.partial_len() > 0 {
            chatter.feed(b"\n");
        }
        let mut last_line = None;
        while let Some(line) = chatter.next() {
            debug!(line = %line.as_str().trim_end(), "printer");
            last_line = Some(line);
        }

        // Until we have sent the wrap-around at least once, any 'ok' on
        // the line is unrelated and proves nothing.
        if attempt > 1 {
            if let Some(line) = &last_line {
                if line.prefix_match("ok\u{8}") != 0 {
                    return Ok(());
                }
            }
        }

        if hard {
            link.write_all(STOP_SD_PRINT_GCODE.as_bytes()).await?;
        }
        link.write_all(WRAP_AROUND_FRAME).await?;

        // give the printer some time to reset itself: a hard reopen
        // doubles the wait per attempt (3s, 6s, 12s, 24s), a soft probe
        // grows it linearly (100ms, 200ms, ...)
        let pace = if hard {
            HARD_RESET_PAUSE * (1u32 << attempt)
        } else {
            SOFT_RETRY_PAUSE * attempt
        };
        sleep(pace).await;
    }
    Err(Error::HandshakeFailed)
}
