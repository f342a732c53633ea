pub mod control;
pub mod engine;
pub mod job;
pub mod state;

pub use control::{injection_channel, Injector, PauseSwitch};
pub use engine::{Connect, JobError, JobSpec, JobStats, ProtocolEngine};
pub use job::{DirScanner, JobController, JobRequest};
pub use state::{PrinterState, StateHandle};
