//! Reader Manager (spec.md §4.B): enumerates readers and opens a Device.

use std::time::Duration;

use pcsc::{Context, Scope};

use crate::device::{self, DeviceSession};
use crate::error::ErrorKind;

pub type ReaderDescriptor = String;

const LIST_RETRIES: u32 = 3;
const LIST_RETRY_PAUSE: Duration = Duration::from_millis(100);

/// Name substrings that mark a reader as a likely NFC/contactless interface
/// rather than a SAM/contact-only slot.
const PREFERRED_SUBSTRINGS: &[&str] =
    &["acr", "acs", "nfc", "picc", "contactless", "scl", "hid", "identiv", "ccid", "dual"];

/// Substrings that mark a reader as a secure-element/SAM slot to exclude.
const SAM_SUBSTRINGS: &[&str] = &["sam"];

fn is_sam_slot(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    SAM_SUBSTRINGS.iter().any(|needle| lower.contains(needle))
}

fn is_preferred(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    PREFERRED_SUBSTRINGS.iter().any(|needle| lower.contains(needle))
}

/// Lists attached readers, retried up to `LIST_RETRIES` times on transient
/// errors, filtering out SAM slots and preferring known NFC-reader names
/// (spec.md §4.B).
pub fn list_readers(context: &Context) -> Result<Vec<ReaderDescriptor>, ErrorKind> {
    let mut last_err = None;
    for attempt in 0..LIST_RETRIES {
        let mut buffer = [0u8; 2048];
        match context.list_readers(&mut buffer) {
            Ok(iter) => {
                let all: Vec<String> =
                    iter.map(|name| name.to_string_lossy().into_owned()).collect();
                let non_sam: Vec<String> =
                    all.into_iter().filter(|name| !is_sam_slot(name)).collect();
                let preferred: Vec<String> =
                    non_sam.iter().filter(|name| is_preferred(name)).cloned().collect();
                return Ok(if preferred.is_empty() { non_sam } else { preferred });
            }
            Err(err) => {
                last_err = Some(device::classify_pcsc_error(err, ""));
                if attempt + 1 < LIST_RETRIES {
                    std::thread::sleep(LIST_RETRY_PAUSE);
                }
            }
        }
    }
    Err(last_err.unwrap_or(ErrorKind::Io("list_readers exhausted retries".into())))
}

/// Opens a reader by descriptor (empty = first filtered reader), validating
/// card presence, protocol, and retrieving the ATR (spec.md §4.B).
pub fn open(context: &Context, descriptor: &str) -> Result<DeviceSession, ErrorKind> {
    let reader_name = if descriptor.is_empty() {
        list_readers(context)?
            .into_iter()
            .next()
            .ok_or_else(|| ErrorKind::DeviceConfig("no readers available".into()))?
    } else {
        descriptor.to_string()
    };

    probe_card_present(context, &reader_name)?;

    let card = device::connect_card(context, &reader_name)?;
    let status = card
        .status2_owned()
        .map_err(|e| device::classify_pcsc_error(e, &reader_name))?;
    device::validate_protocol(status.protocol2())?;
    let atr = status.atr().to_vec();

    let mut session = DeviceSession::new(reader_name, card, atr);
    session.start_presence_monitor(context.clone());
    Ok(session)
}

/// Zero-timeout status check: fails fast with `NoCard` rather than blocking
/// a doomed `connect` call (spec.md §4.B).
fn probe_card_present(context: &Context, reader_name: &str) -> Result<(), ErrorKind> {
    let name = std::ffi::CString::new(reader_name)
        .map_err(|_| ErrorKind::DeviceConfig("reader name contains NUL byte".into()))?;
    let mut states = vec![pcsc::ReaderState::new(name, pcsc::State::UNAWARE)];
    match context.get_status_change(Duration::from_millis(0), &mut states) {
        Ok(()) | Err(pcsc::Error::Timeout) => {
            if states[0].event_state().intersects(pcsc::State::PRESENT) {
                Ok(())
            } else {
                Err(ErrorKind::NoCard)
            }
        }
        Err(err) => Err(device::classify_pcsc_error(err, reader_name)),
    }
}

/// Establishes a new PC/SC context (`Scope::User`), mapping establishment
/// failures onto the canonical taxonomy.
pub fn establish_context() -> Result<Context, ErrorKind> {
    Context::establish(Scope::User).map_err(|e| device::classify_pcsc_error(e, ""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_sam_slot_matches_sam_substring() {
        assert!(is_sam_slot("ACS SAM Slot 0"));
        assert!(!is_sam_slot("ACS ACR122U PICC Interface"));
    }

    #[test]
    fn is_preferred_matches_known_nfc_reader_names() {
        assert!(is_preferred("ACS ACR122U PICC Interface"));
        assert!(is_preferred("Identiv uTrust 3700 F"));
        assert!(!is_preferred("Generic Smart Card Reader"));
    }
}
