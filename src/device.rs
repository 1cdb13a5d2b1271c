//! Device (reader session) — spec.md §3 `DeviceSession` / §4.C.
//!
//! Owns exactly one open `pcsc::Card`. Exclusively owned by the
//! [`crate::lifecycle::LifecycleManager`]; the presence monitor and tag
//! engines only ever borrow it through a shared handle guarded by a mutex.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use pcsc::{Card, Context, Disposition, Protocol, Protocols, ShareMode};

use crate::apdu::{self, Transmit};
use crate::error::ErrorKind;
use crate::presence::PresenceMonitor;

/// Thread-safe handle to an open device, shared between the lifecycle
/// manager, the presence monitor and tag engines.
pub type SharedDevice = Arc<Mutex<DeviceSession>>;

pub struct DeviceSession {
    reader_name: String,
    card: Card,
    atr: Vec<u8>,
    unsupported_reported: bool,
    presence: Option<PresenceMonitor>,
}

impl DeviceSession {
    pub(crate) fn new(reader_name: String, card: Card, atr: Vec<u8>) -> Self {
        Self { reader_name, card, atr, unsupported_reported: false, presence: None }
    }

    pub fn reader_name(&self) -> &str {
        &self.reader_name
    }

    pub fn atr(&self) -> &[u8] {
        &self.atr
    }

    pub fn take_unsupported_reported(&mut self) -> bool {
        std::mem::replace(&mut self.unsupported_reported, false)
    }

    pub fn mark_unsupported_reported(&mut self) {
        self.unsupported_reported = true;
    }

    pub fn start_presence_monitor(&mut self, context: Context) {
        self.presence = Some(PresenceMonitor::spawn(context, self.reader_name.clone()));
    }

    /// Non-blocking check: has the presence monitor observed removal?
    pub fn removal_signalled(&self) -> bool {
        self.presence.as_ref().is_some_and(|p| p.removal_signalled())
    }

    /// `FF CA 00 00 00` GET_UID active probe; success requires SW=9000.
    pub fn is_card_present(&self) -> bool {
        self.card.transmit(&apdu::get_uid(), &mut [0u8; 16]).is_ok_and(|resp| {
            resp.len() >= 2 && resp[resp.len() - 2..] == apdu::SW_SUCCESS
        })
    }

    pub fn is_healthy(&self) -> bool {
        self.card.status2_owned().is_ok()
    }

    /// Stops the presence monitor first (unlocked with respect to the
    /// caller — it just signals the background thread), then disconnects
    /// the reader session.
    pub fn close(mut self) {
        if let Some(mut presence) = self.presence.take() {
            presence.stop();
        }
        let _ = self.card.disconnect(Disposition::LeaveCard);
    }
}

impl Transmit for DeviceSession {
    fn transmit(&self, apdu: &[u8]) -> Result<Vec<u8>, ErrorKind> {
        if self.removal_signalled() {
            return Err(ErrorKind::CardRemoved("presence monitor observed removal".into()));
        }
        let mut recv_buffer = [0u8; pcsc::MAX_BUFFER_SIZE];
        match self.card.transmit(apdu, &mut recv_buffer) {
            Ok(resp) => Ok(resp.to_vec()),
            Err(err) => Err(classify_pcsc_error(err, &self.reader_name)),
        }
    }
}

/// Maps a `pcsc::Error` onto the canonical taxonomy (spec.md §4.J), folding
/// in the ACR-specific heuristic spec.md §4.E needs (driver name containing
/// a known quirky vendor substring plus an error shape that vendor is known
/// to emit transiently).
pub fn classify_pcsc_error(err: pcsc::Error, reader_name: &str) -> ErrorKind {
    use pcsc::Error::*;
    match err {
        Timeout => ErrorKind::Timeout,
        NoSmartcard | RemovedCard | ResetCard | UnpoweredCard | NotTransacted => {
            ErrorKind::CardRemoved(err.to_string())
        }
        InvalidHandle | Shutdown => ErrorKind::DeviceClosed,
        ServiceStopped | NoService | ReaderUnavailable | NoReadersAvailable => {
            ErrorKind::Io(err.to_string())
        }
        CommError | UnresponsiveCard | UnknownError if is_quirky_reader(reader_name) => {
            ErrorKind::AcrSpecific(err.to_string())
        }
        InvalidParameter | InvalidValue | UnknownReader => ErrorKind::DeviceConfig(err.to_string()),
        _ => ErrorKind::Io(err.to_string()),
    }
}

fn is_quirky_reader(reader_name: &str) -> bool {
    let lower = reader_name.to_ascii_lowercase();
    ["acr122", "acr1252", "acr38"].iter().any(|needle| lower.contains(needle))
}

/// Validates the active protocol is T0 or T1, per spec.md §4.B `open`.
pub fn validate_protocol(protocol: Option<Protocol>) -> Result<(), ErrorKind> {
    match protocol {
        Some(Protocol::T0) | Some(Protocol::T1) => Ok(()),
        other => Err(ErrorKind::DeviceConfig(format!("unsupported protocol: {:?}", other))),
    }
}

pub(crate) fn connect_card(context: &Context, reader_name: &str) -> Result<Card, ErrorKind> {
    let name = std::ffi::CString::new(reader_name)
        .map_err(|_| ErrorKind::DeviceConfig("reader name contains NUL byte".into()))?;
    context
        .connect(&name, ShareMode::Shared, Protocols::ANY)
        .map_err(|e| classify_pcsc_error(e, reader_name))
}

/// Forces the reader to reset before reconnecting — used by `reconnect(..,
/// force=true)` in the lifecycle manager (spec.md §4.E).
pub fn reset_wait_time() -> Duration {
    Duration::from_millis(500)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_protocol_accepts_t0_and_t1() {
        assert!(validate_protocol(Some(Protocol::T0)).is_ok());
        assert!(validate_protocol(Some(Protocol::T1)).is_ok());
    }

    #[test]
    fn validate_protocol_rejects_raw_and_none() {
        assert!(validate_protocol(Some(Protocol::RAW)).is_err());
        assert!(validate_protocol(None).is_err());
    }

    #[test]
    fn classify_pcsc_error_maps_removed_card() {
        let kind = classify_pcsc_error(pcsc::Error::RemovedCard, "ACS ACR122U");
        assert!(kind.is_card_removed());
    }

    #[test]
    fn classify_pcsc_error_maps_timeout() {
        let kind = classify_pcsc_error(pcsc::Error::Timeout, "Generic Reader");
        assert!(kind.is_timeout());
    }

    #[test]
    fn classify_pcsc_error_flags_acr_comm_errors_as_acr_specific() {
        let kind = classify_pcsc_error(pcsc::Error::CommError, "ACS ACR122U PICC Interface");
        assert!(kind.is_acr_specific());
    }

    #[test]
    fn classify_pcsc_error_treats_comm_error_on_other_readers_as_io() {
        let kind = classify_pcsc_error(pcsc::Error::CommError, "Generic Reader");
        assert!(kind.is_io());
    }

    #[test]
    fn classify_pcsc_error_maps_service_stopped_to_io() {
        let kind = classify_pcsc_error(pcsc::Error::ServiceStopped, "Generic Reader");
        assert!(kind.is_io());
    }
}
