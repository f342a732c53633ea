use std::time::Duration;

/// The fixed frame that rolls the printer's expected line number back to 0.
/// Always occupies slot 99 of the send window.
pub const WRAP_AROUND_FRAME: &[u8] = b"N99M110N-1*97\n";
pub const WRAP_AROUND_LEN: usize = 14;

/// Size of the printer's serial receive buffer. This is the limiting factor,
/// because pushing more than this causes data loss and forces resends. The
/// buffers Marlin manages internally (e.g. the planner buffer) are less
/// relevant: when those fill, Marlin simply stops sending 'ok' and stops
/// reading, with no data loss. 128 is the buffer size of the FTDI FT232R
/// USB->UART chip commonly found on 8-bit boards.
pub const DEFAULT_RX_BUFFER: usize = 128;

/// Number of slots in the send window ring. Slot 99 is reserved for
/// [`WRAP_AROUND_FRAME`], so at most 99 numbered lines are in flight.
pub const WINDOW_SLOTS: usize = 100;

/// Maximum time the printer may keep replying with errors before the
/// current job is aborted.
pub const MAX_TIME_WITH_ERROR: Duration = Duration::from_secs(5);

/// Maximum time with no message from the printer while at least one
/// command is unacknowledged. Needs to be longer than the longest blocking
/// command that is silent (e.g. G28).
pub const MAX_TIME_SILENCE: Duration = Duration::from_secs(120);

/// If this much time passes with a G-code line ready to send but no 'ok'
/// freeing up buffer space, the phase changes to Stalled. This indicates a
/// long running command like G28.
pub const STALL_TIME: Duration = Duration::from_secs(2);

/// More resend requests than this within one error burst abort the job.
pub const MAX_RESENDS: u32 = 3;

/// Handshake tuning.
pub const MAX_HANDSHAKE_ATTEMPTS: u32 = 4;
pub const BANNER_WAIT: Duration = Duration::from_secs(3);
pub const QUIESCENCE: Duration = Duration::from_millis(500);

/// Base of the post-probe wait after a hard reopen; doubled per attempt
/// (base << attempt: 3s, 6s, 12s, 24s). A freshly opened TTY resets most
/// printer boards, and the bootloader takes several seconds.
pub const HARD_RESET_PAUSE: Duration = Duration::from_millis(1500);

/// Base of the post-probe wait on a soft handshake; grows linearly with
/// the attempt number.
pub const SOFT_RETRY_PAUSE: Duration = Duration::from_millis(100);

/// Grace period after an `Error:` or `Resend:` line so a potential error
/// burst arrives before we resume transmitting.
pub const ERROR_BURST_PAUSE: Duration = Duration::from_millis(100);

/// Base backoff after the printer device failed to open (e.g. USB
/// unplugged), to give re-enumeration a chance.
pub const HARD_FAULT_BACKOFF: Duration = Duration::from_secs(5);

/// A watched file's mtime must be at least this old before it is printed,
/// so uploads still in progress are not picked up.
pub const MIN_FILE_AGE: Duration = Duration::from_secs(2);

/// Sent when a print is aborted. The nozzle must cool before power-off
/// because heat creep can melt filament above the heat break and clog the
/// nozzle once the fan stops. The bed is intentionally left alone.
pub const COOLDOWN_GCODE: &str = "M108\nM104 S0\nM105\n";

/// Sent on hard reconnect to stop any pending SD card print.
pub const STOP_SD_PRINT_GCODE: &str = "M524\n";

/// Lifts the nozzle after an abort so it does not melt into the print.
pub const LIFT_NOZZLE_GCODE: &str = "G91\nG0 Z10\nG90\n";

/// Size of the G-code line assembly buffer. Lines longer than this are
/// emitted as split fragments.
pub const LINE_BUFSIZE: usize = 1024;

/// Capacity for captured slicer comments (`;TIME:...` etc.).
pub const COMMENT_BUFSIZE: usize = 64;

/// Upper bound for a plausible slicer print time estimate, in seconds.
pub const MAX_PRINT_TIME_SECS: i64 = 8_640_000;

pub const BAUD_RATE: u32 = 115_200;

pub const DEFAULT_HTTP_PORT: u16 = 8080;
pub const MIN_HTTP_PORT: u16 = 10;
