//! Control-side handles shared between the core and HTTP workers.
//!
//! Workers never touch the send window or the serial link. They get
//! exactly three handles: the [`Injector`] (out-of-band G-code), the
//! [`PauseSwitch`] (toggle notification) and a read-only
//! [`StateHandle`](crate::state::StateHandle). Everything else stays owned
//! by the engine task, so a misbehaving request cannot corrupt core state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::sync::Notify;

/// Sender side of the injection channel. Lines posted here are fed to the
/// printer with priority over the current job file.
#[derive(Debug, Clone)]
pub struct Injector {
    tx: mpsc::UnboundedSender<Bytes>,
}

impl Injector {
    /// Queues one G-code line, newline-terminated on the wire.
    pub fn send_line(&self, command: &str) {
        let mut bytes = Vec::with_capacity(command.len() + 1);
        bytes.extend_from_slice(command.as_bytes());
        if !command.ends_with('\n') {
            bytes.push(b'\n');
        }
        // A closed channel means the engine is gone; nothing to do.
        let _ = self.tx.send(Bytes::from(bytes));
    }

    /// Queues a raw chunk of G-code text.
    pub fn send_raw(&self, data: Bytes) {
        let _ = self.tx.send(data);
    }
}

/// Creates the injection channel: the cloneable sender for workers and
/// the receiver the engine drains.
pub fn injection_channel() -> (Injector, mpsc::UnboundedReceiver<Bytes>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Injector { tx }, rx)
}

/// The user pause flag: one bit plus a wakeup for the engine's
/// multiplexed wait. Toggled from HTTP workers and from SIGUSR1.
#[derive(Debug, Clone, Default)]
pub struct PauseSwitch {
    inner: Arc<PauseInner>,
}

#[derive(Debug, Default)]
struct PauseInner {
    paused: AtomicBool,
    notify: Notify,
}

impl PauseSwitch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst)
    }

    /// Flips the flag and wakes the engine. Returns the new value.
    pub fn toggle(&self) -> bool {
        let now = !self.inner.paused.fetch_xor(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
        now
    }

    /// Clears the flag without waking anyone (job teardown).
    pub fn reset(&self) {
        self.inner.paused.store(false, Ordering::SeqCst);
    }

    /// Resolves when the flag is toggled.
    pub async fn changed(&self) {
        self.inner.notify.notified().await;
    }
}
