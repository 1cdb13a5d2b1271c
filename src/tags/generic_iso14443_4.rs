//! Generic ISO-14443-4 fallback (spec.md §4.G): exposes transceive only.
//! Used as a last-resort container for cards that answer but match none of
//! the specific dialect probes.

use crate::error::ErrorKind;

use super::{BaseTag, Capabilities, TagFamily, TagOps};

pub struct GenericIso14443_4Tag {
    pub base: BaseTag,
    pub numeric_type: u8,
}

impl GenericIso14443_4Tag {
    pub fn new(base: BaseTag, numeric_type: u8) -> Self {
        Self { base, numeric_type }
    }
}

impl TagOps for GenericIso14443_4Tag {
    fn uid(&self) -> &str {
        &self.base.uid
    }

    fn family(&self) -> TagFamily {
        TagFamily::GenericIso14443_4
    }

    fn numeric_type(&self) -> u8 {
        self.numeric_type
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            can_read: false,
            can_write: false,
            can_lock: false,
            supports_ndef: false,
            supports_crypto: false,
            memory_size: 0,
            max_ndef_size: 0,
        }
    }

    fn transceive(&self, apdu: &[u8]) -> Result<Vec<u8>, ErrorKind> {
        self.base.transceive(apdu).map_err(|e| self.base.reclassify_if_removed(e))
    }

    fn read_data(&self) -> Result<Vec<u8>, ErrorKind> {
        Err(ErrorKind::NotSupported)
    }

    fn write_data(&self, _data: &[u8]) -> Result<(), ErrorKind> {
        Err(ErrorKind::NotSupported)
    }

    fn is_writable(&self) -> bool {
        false
    }

    fn can_make_read_only(&self) -> bool {
        false
    }

    fn make_read_only(&mut self) -> Result<(), ErrorKind> {
        Err(ErrorKind::NotSupported)
    }
}
