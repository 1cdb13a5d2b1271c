//! DESFire dialect engine (spec.md §4.G). Selects the standard NDEF
//! application and reads/writes its NDEF file through the 2-byte NLEN
//! length prefix. Cryptographic personalisation beyond what an NDEF write
//! needs is out of scope (spec.md §1 Non-goals), so writability is
//! determined by whether the NDEF application selects cleanly rather than
//! by performing a full DES/3DES/3K3DES authentication handshake.

use crate::apdu;
use crate::error::ErrorKind;

use super::{BaseTag, Capabilities, TagFamily, TagOps};

const NDEF_AID: [u8; 3] = [0x01, 0x00, 0x00];
const DEFAULT_FILE_NO: u8 = 2;
/// DESFire EV1 2K is a common floor for the standard NDEF application.
const ASSUMED_CAPACITY: usize = 2048 - 2;

pub struct DesfireTag {
    pub base: BaseTag,
    pub numeric_type: u8,
    pub file_no: u8,
}

impl DesfireTag {
    pub fn new(base: BaseTag, numeric_type: u8) -> Self {
        Self { base, numeric_type, file_no: DEFAULT_FILE_NO }
    }

    fn select_application(&self) -> Result<(), ErrorKind> {
        let resp = self.base.transceive(&apdu::desfire_select_application(NDEF_AID))
            .map_err(|e| self.base.reclassify_if_removed(e))?;
        apdu::check_status(&resp, |sw| {
            self.base.reclassify_if_removed(ErrorKind::ReadFailed(format!("select application: {:02x?}", sw)))
        })
        .map(|_| ())
    }
}

impl TagOps for DesfireTag {
    fn uid(&self) -> &str {
        &self.base.uid
    }

    fn family(&self) -> TagFamily {
        TagFamily::DESFire
    }

    fn numeric_type(&self) -> u8 {
        self.numeric_type
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            can_read: true,
            can_write: true,
            can_lock: false,
            supports_ndef: true,
            supports_crypto: true,
            memory_size: ASSUMED_CAPACITY + 2,
            max_ndef_size: ASSUMED_CAPACITY,
        }
    }

    fn transceive(&self, apdu: &[u8]) -> Result<Vec<u8>, ErrorKind> {
        self.base.transceive(apdu).map_err(|e| self.base.reclassify_if_removed(e))
    }

    fn read_data(&self) -> Result<Vec<u8>, ErrorKind> {
        self.select_application()?;

        let nlen_resp = self.base.transceive(&apdu::desfire_read_data(self.file_no, 0, 2))
            .map_err(|e| self.base.reclassify_if_removed(e))?;
        let nlen_bytes = apdu::check_status(&nlen_resp, |sw| {
            self.base.reclassify_if_removed(ErrorKind::ReadFailed(format!("{:02x?}", sw)))
        })?;
        if nlen_bytes.len() < 2 {
            return Err(ErrorKind::ReadFailed("NLEN prefix truncated".into()));
        }
        let nlen = u16::from_be_bytes([nlen_bytes[0], nlen_bytes[1]]) as u32;

        let payload_resp = self.base.transceive(&apdu::desfire_read_data(self.file_no, 2, nlen))
            .map_err(|e| self.base.reclassify_if_removed(e))?;
        apdu::check_status(&payload_resp, |sw| {
            self.base.reclassify_if_removed(ErrorKind::ReadFailed(format!("{:02x?}", sw)))
        })
    }

    fn write_data(&self, data: &[u8]) -> Result<(), ErrorKind> {
        if data.len() > ASSUMED_CAPACITY {
            return Err(ErrorKind::CapacityExceeded { wanted: data.len(), available: ASSUMED_CAPACITY });
        }
        self.select_application()?;

        let mut buffer = (data.len() as u16).to_be_bytes().to_vec();
        buffer.extend_from_slice(data);

        let resp = self.base.transceive(&apdu::desfire_write_data(self.file_no, 0, &buffer))
            .map_err(|e| self.base.reclassify_if_removed(e))?;
        apdu::check_status(&resp, |sw| {
            self.base.reclassify_if_removed(ErrorKind::WriteFailed(format!("{:02x?}", sw)))
        })
        .map(|_| ())
    }

    fn is_writable(&self) -> bool {
        self.select_application().is_ok()
    }

    fn can_make_read_only(&self) -> bool {
        false
    }

    fn make_read_only(&mut self) -> Result<(), ErrorKind> {
        Err(ErrorKind::NotSupported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_file_no_is_two() {
        assert_eq!(DEFAULT_FILE_NO, 2);
    }
}
