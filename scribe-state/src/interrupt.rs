//! Process-wide cooperative cancellation.

use tokio::sync::watch;

/// Creates a connected [`InterruptHandle`] / [`Interrupt`] pair.
pub fn interrupt_pair() -> (InterruptHandle, Interrupt) {
    let (tx, rx) = watch::channel(false);
    (InterruptHandle { tx }, Interrupt { rx })
}

/// The raising side of the cancellation signal.
///
/// Dropping the handle raises the signal, so an owner that dies takes its
/// long-running passes down with it.
#[derive(Debug)]
pub struct InterruptHandle {
    tx: watch::Sender<bool>,
}

impl InterruptHandle {
    /// Raises the signal. Idempotent.
    pub fn raise(&self) {
        let _ = self.tx.send(true);
    }

    /// Returns a new observer of this signal.
    pub fn subscribe(&self) -> Interrupt {
        Interrupt {
            rx: self.tx.subscribe(),
        }
    }
}

/// The observing side of the cancellation signal.
///
/// Long-running passes poll [`Interrupt::is_raised`] at per-block
/// checkpoints and abort with a distinguished "interrupted" error.
#[derive(Debug, Clone)]
pub struct Interrupt {
    rx: watch::Receiver<bool>,
}

impl Interrupt {
    /// True once the signal has been raised.
    pub fn is_raised(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    /// Waits until the signal is raised.
    pub async fn raised(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                // Handle dropped: treated as raised.
                return;
            }
        }
    }
}
