//! APDU vocabulary (spec.md §6) and the status-word handling shared by every
//! tag dialect engine. Building the bytes is pure and synchronous; sending
//! them goes through whatever implements [`Transmit`] (normally a
//! [`crate::device::DeviceSession`], a mock in tests).

use crate::error::ErrorKind;

/// The low-level transmit primitive the reader driver provides (spec.md
/// §6). Implemented by `DeviceSession` over the `pcsc` crate; tests provide
/// an in-memory fake so the dialect engines can be exercised without
/// hardware.
pub trait Transmit {
    fn transmit(&self, apdu: &[u8]) -> Result<Vec<u8>, ErrorKind>;
}

pub const SW_SUCCESS: [u8; 2] = [0x90, 0x00];

/// Strips and validates the trailing status word, returning the data bytes
/// on `90 00` and a classified failure otherwise.
pub fn check_status(response: &[u8], on_failure: impl FnOnce(&[u8]) -> ErrorKind) -> Result<Vec<u8>, ErrorKind> {
    if response.len() < 2 {
        return Err(on_failure(response));
    }
    let (data, sw) = response.split_at(response.len() - 2);
    if sw == SW_SUCCESS {
        Ok(data.to_vec())
    } else {
        Err(on_failure(sw))
    }
}

/// `FF CA 00 00 00` — GET_UID.
pub fn get_uid() -> Vec<u8> {
    vec![0xFF, 0xCA, 0x00, 0x00, 0x00]
}

/// Wraps `60 00 00` (GET_VERSION) in the transparent-APDU frame the reader
/// expects: `FF 00 00 00 05 D4 42 60 00 00`.
pub fn get_version() -> Vec<u8> {
    vec![0xFF, 0x00, 0x00, 0x00, 0x05, 0xD4, 0x42, 0x60, 0x00, 0x00]
}

/// `FF 82 00 00 06 <key>` — LOAD_KEY into reader volatile memory slot 0.
pub fn load_key(key: &[u8; 6]) -> Vec<u8> {
    let mut apdu = vec![0xFF, 0x82, 0x00, 0x00, 0x06];
    apdu.extend_from_slice(key);
    apdu
}

pub const KEY_TYPE_A: u8 = 0x60;
pub const KEY_TYPE_B: u8 = 0x61;

/// `FF 86 00 00 05 01 00 <block> <key_type> <slot>` — MIFARE AUTHENTICATE.
pub fn authenticate(block: u8, key_type: u8, slot: u8) -> Vec<u8> {
    vec![0xFF, 0x86, 0x00, 0x00, 0x05, 0x01, 0x00, block, key_type, slot]
}

/// `FF B0 00 <block> <len>` — READ_BINARY.
pub fn read_binary(block: u8, length: u8) -> Vec<u8> {
    vec![0xFF, 0xB0, 0x00, block, length]
}

/// `FF D6 00 <block> <len> <data>` — UPDATE_BINARY.
pub fn update_binary(block: u8, data: &[u8]) -> Vec<u8> {
    let mut apdu = vec![0xFF, 0xD6, 0x00, block, data.len() as u8];
    apdu.extend_from_slice(data);
    apdu
}

/// DESFire native SELECT APPLICATION: command byte `5A` + 3-byte AID.
pub fn desfire_select_application(aid: [u8; 3]) -> Vec<u8> {
    let mut apdu = vec![0x5A];
    apdu.extend_from_slice(&aid);
    apdu
}

/// DESFire native READ_DATA: `BD`, file-no, 3-byte offset LE, 3-byte length LE.
pub fn desfire_read_data(file_no: u8, offset: u32, length: u32) -> Vec<u8> {
    let mut apdu = vec![0xBD, file_no];
    apdu.extend_from_slice(&offset.to_le_bytes()[..3]);
    apdu.extend_from_slice(&length.to_le_bytes()[..3]);
    apdu
}

/// DESFire native WRITE_DATA: `3D`, file-no, 3-byte offset LE, 3-byte length LE, data.
pub fn desfire_write_data(file_no: u8, offset: u32, data: &[u8]) -> Vec<u8> {
    let mut apdu = vec![0x3D, file_no];
    apdu.extend_from_slice(&offset.to_le_bytes()[..3]);
    apdu.extend_from_slice(&(data.len() as u32).to_le_bytes()[..3]);
    apdu.extend_from_slice(data);
    apdu
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_uid_matches_spec_bytes() {
        assert_eq!(get_uid(), vec![0xFF, 0xCA, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn authenticate_embeds_block_keytype_and_slot() {
        let apdu = authenticate(7, KEY_TYPE_B, 0x00);
        assert_eq!(apdu, vec![0xFF, 0x86, 0x00, 0x00, 0x05, 0x01, 0x00, 7, 0x61, 0x00]);
    }

    #[test]
    fn check_status_strips_success_sw() {
        let resp = vec![1, 2, 3, 0x90, 0x00];
        let data = check_status(&resp, |sw| ErrorKind::ReadFailed(format!("{:02x?}", sw))).unwrap();
        assert_eq!(data, vec![1, 2, 3]);
    }

    #[test]
    fn check_status_classifies_failure_sw() {
        let resp = vec![0x6A, 0x82];
        let err = check_status(&resp, |sw| ErrorKind::ReadFailed(format!("{:02x?}", sw))).unwrap_err();
        assert!(err.is_read_failed());
    }

    #[test]
    fn desfire_offsets_are_little_endian_three_byte() {
        let apdu = desfire_read_data(2, 0x0102, 0x0304);
        assert_eq!(apdu, vec![0xBD, 2, 0x02, 0x01, 0x00, 0x04, 0x03, 0x00]);
    }
}
