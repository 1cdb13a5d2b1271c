//! Presence Monitor (spec.md §4.D): a dedicated background task per open
//! `DeviceSession` that reliably reports card removal even on hardware whose
//! native status APIs are unreliable.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use log::warn;
use pcsc::{Context, ReaderState, State};

const POLL_DEADLINE: Duration = Duration::from_millis(500);

pub struct PresenceMonitor {
    removed: Arc<AtomicBool>,
    stop_tx: Sender<()>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl PresenceMonitor {
    pub fn spawn(context: Context, reader_name: String) -> Self {
        let removed = Arc::new(AtomicBool::new(false));
        let (stop_tx, stop_rx) = bounded::<()>(1);

        let removed_writer = removed.clone();
        let handle = std::thread::spawn(move || {
            run(context, reader_name, removed_writer, stop_rx);
        });

        Self { removed, stop_tx, handle: Some(handle) }
    }

    /// Non-blocking: has removal been observed? Sticky once set — the
    /// Device/Tag layers each check this before every transmit, and a
    /// removed card stays removed until the session is recreated.
    pub fn removal_signalled(&self) -> bool {
        self.removed.load(Ordering::SeqCst)
    }

    pub fn stop(&mut self) {
        let _ = self.stop_tx.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for PresenceMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(context: Context, reader_name: String, removed: Arc<AtomicBool>, stop_rx: Receiver<()>) {
    let name = match std::ffi::CString::new(reader_name.clone()) {
        Ok(n) => n,
        Err(_) => {
            removed.store(true, Ordering::SeqCst);
            return;
        }
    };
    let mut states = vec![ReaderState::new(name, State::UNAWARE)];

    loop {
        if stop_rx.try_recv().is_ok() {
            return; // Cancelled: exit cleanly, no removal signal.
        }

        match context.get_status_change(POLL_DEADLINE, &mut states) {
            Ok(()) => {
                states[0].sync_current_state();
                let event = states[0].event_state();
                if event.intersects(State::EMPTY) {
                    removed.store(true, Ordering::SeqCst);
                    return;
                }
            }
            Err(pcsc::Error::Timeout) => continue,
            Err(pcsc::Error::Cancelled) => return,
            Err(err) => {
                // Any other error: the reader is presumed gone.
                warn!("presence monitor for {}: treating error as removal: {}", reader_name, err);
                removed.store(true, Ordering::SeqCst);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn removal_signal_is_sticky_once_observed() {
        let removed = Arc::new(AtomicBool::new(false));
        let monitor = PresenceMonitor { removed: removed.clone(), stop_tx: bounded(1).0, handle: None };
        assert!(!monitor.removal_signalled());
        removed.store(true, Ordering::SeqCst);
        assert!(monitor.removal_signalled());
        assert!(monitor.removal_signalled());
    }
}
