//! Minimal NDEF record construction/parsing for the Text and URI well-known
//! types used by the CLI `write`/`read` subcommands and the test fixtures.
//!
//! The CORE treats NDEF message bytes as an opaque container produced and
//! consumed by a dedicated record codec library (spec.md §1 lists low-level
//! NDEF record codecs as an external collaborator); this module is the thin,
//! practical subset the teacher's own `ndef.rs` carried rather than a
//! general-purpose NDEF library.

const TNF_WELL_KNOWN: u8 = 0x01;
const NDEF_HEADER_SR: u8 = 0xD1; // MB=1, ME=1, CF=0, SR=1, IL=0, TNF=001

pub fn encode_text_record(text: &str, lang: &str) -> Vec<u8> {
    let lang_bytes = lang.as_bytes();
    let mut payload = Vec::with_capacity(1 + lang_bytes.len() + text.len());
    payload.push(lang_bytes.len() as u8);
    payload.extend_from_slice(lang_bytes);
    payload.extend_from_slice(text.as_bytes());
    wrap_short_record(b"T", &payload)
}

pub fn encode_uri_record(uri: &str) -> Vec<u8> {
    // Identifier code 0x00: no abbreviation, URI carried verbatim.
    let mut payload = Vec::with_capacity(1 + uri.len());
    payload.push(0x00);
    payload.extend_from_slice(uri.as_bytes());
    wrap_short_record(b"U", &payload)
}

fn wrap_short_record(record_type: &[u8], payload: &[u8]) -> Vec<u8> {
    let mut record = Vec::with_capacity(3 + record_type.len() + payload.len());
    record.push(NDEF_HEADER_SR);
    record.push(record_type.len() as u8);
    record.push(payload.len() as u8);
    record.extend_from_slice(record_type);
    record.extend_from_slice(payload);
    record
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NdefRecord {
    pub tnf: u8,
    pub record_type: Vec<u8>,
    pub payload: Vec<u8>,
}

/// Parses the single leading short record from an NDEF message. Returns
/// `None` rather than panicking on malformed input.
pub fn decode_first_record(message: &[u8]) -> Option<NdefRecord> {
    if message.len() < 3 {
        return None;
    }
    let header = message[0];
    let tnf = header & 0x07;
    let type_len = message[1] as usize;
    let payload_len = message[2] as usize;
    let type_start = 3;
    let payload_start = type_start + type_len;
    let payload_end = payload_start + payload_len;
    if payload_end > message.len() {
        return None;
    }
    Some(NdefRecord {
        tnf,
        record_type: message[type_start..payload_start].to_vec(),
        payload: message[payload_start..payload_end].to_vec(),
    })
}

pub fn decode_text_payload(record: &NdefRecord) -> Option<String> {
    if record.tnf != TNF_WELL_KNOWN || record.record_type != b"T" {
        return None;
    }
    let status = *record.payload.first()?;
    let lang_len = (status & 0x3F) as usize;
    let text_start = 1 + lang_len;
    std::str::from_utf8(record.payload.get(text_start..)?).ok().map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_record_round_trips() {
        let encoded = encode_text_record("Hello World", "en");
        let record = decode_first_record(&encoded).unwrap();
        assert_eq!(decode_text_payload(&record).unwrap(), "Hello World");
    }

    #[test]
    fn uri_record_round_trips_type_and_payload() {
        let encoded = encode_uri_record("example.com");
        let record = decode_first_record(&encoded).unwrap();
        assert_eq!(record.record_type, b"U");
        assert_eq!(&record.payload[1..], b"example.com");
    }

    #[test]
    fn decode_first_record_rejects_truncated_message() {
        let encoded = encode_text_record("Hi", "en");
        assert!(decode_first_record(&encoded[..3]).is_none());
    }
}
