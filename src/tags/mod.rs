//! Tag Dialect Engines (spec.md §4.G) behind a common capability interface,
//! realised as a tagged enum of engine variants rather than a virtual-dispatch
//! tree (spec.md §9 design note). Shared transmit state lives in `BaseTag`.

pub mod desfire;
pub mod generic_iso14443_4;
pub mod mifare_classic;
pub mod ultralight;

use crate::device::SharedDevice;
use crate::error::ErrorKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TagFamily {
    Classic1K,
    Classic4K,
    Ultralight,
    UltralightC,
    Ntag213,
    Ntag215,
    Ntag216,
    DESFire,
    GenericIso14443_4,
}

impl TagFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            TagFamily::Classic1K => "mifare_classic_1k",
            TagFamily::Classic4K => "mifare_classic_4k",
            TagFamily::Ultralight => "ultralight",
            TagFamily::UltralightC => "ultralight_c",
            TagFamily::Ntag213 => "ntag213",
            TagFamily::Ntag215 => "ntag215",
            TagFamily::Ntag216 => "ntag216",
            TagFamily::DESFire => "desfire",
            TagFamily::GenericIso14443_4 => "iso14443_4",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub can_read: bool,
    pub can_write: bool,
    pub can_lock: bool,
    pub supports_ndef: bool,
    pub supports_crypto: bool,
    pub memory_size: usize,
    pub max_ndef_size: usize,
}

/// Transmit state shared by every engine variant.
pub struct BaseTag {
    pub device: SharedDevice,
    pub uid: String,
}

impl BaseTag {
    pub fn transceive(&self, apdu: &[u8]) -> Result<Vec<u8>, ErrorKind> {
        use crate::apdu::Transmit;
        let device = self.device.lock().expect("device mutex poisoned");
        device.transmit(apdu)
    }

    /// Reclassifies a raw failure as `CardRemoved` if the device's presence
    /// probe now reports the card absent (spec.md §4.G error propagation
    /// rule).
    pub fn reclassify_if_removed(&self, err: ErrorKind) -> ErrorKind {
        if err.is_card_removed() {
            return err;
        }
        let device = self.device.lock().expect("device mutex poisoned");
        if device.removal_signalled() || !device.is_card_present() {
            ErrorKind::CardRemoved(format!("card absent after failure: {}", err))
        } else {
            err
        }
    }
}

pub trait TagOps {
    fn uid(&self) -> &str;
    fn family(&self) -> TagFamily;
    /// The raw family discriminant observed during classification (the last
    /// ATR byte, or a GET_VERSION/auth-probe derived code).
    fn numeric_type(&self) -> u8;
    fn capabilities(&self) -> Capabilities;

    fn connect(&mut self) -> Result<(), ErrorKind> {
        Ok(())
    }
    fn disconnect(&mut self) -> Result<(), ErrorKind> {
        Ok(())
    }
    fn transceive(&self, apdu: &[u8]) -> Result<Vec<u8>, ErrorKind> {
        let _ = apdu;
        Err(ErrorKind::NotSupported)
    }

    /// Returns the NDEF payload stripped of TLV wrapping.
    fn read_data(&self) -> Result<Vec<u8>, ErrorKind>;
    fn write_data(&self, data: &[u8]) -> Result<(), ErrorKind>;
    fn is_writable(&self) -> bool;
    fn can_make_read_only(&self) -> bool;
    fn make_read_only(&mut self) -> Result<(), ErrorKind>;
}

/// Polymorphic Tag handle (spec.md §3 `Card`). A tagged enum avoids a
/// virtual-dispatch tree while still letting the reader loop treat every
/// family uniformly through `TagOps`.
pub enum Tag {
    Classic1K(mifare_classic::MifareClassicTag),
    Classic4K(mifare_classic::MifareClassicTag),
    Ultralight(ultralight::UltralightTag),
    DESFire(desfire::DesfireTag),
    GenericIso14443_4(generic_iso14443_4::GenericIso14443_4Tag),
}

impl Tag {
    fn ops(&self) -> &dyn TagOps {
        match self {
            Tag::Classic1K(t) | Tag::Classic4K(t) => t,
            Tag::Ultralight(t) => t,
            Tag::DESFire(t) => t,
            Tag::GenericIso14443_4(t) => t,
        }
    }

    fn ops_mut(&mut self) -> &mut dyn TagOps {
        match self {
            Tag::Classic1K(t) | Tag::Classic4K(t) => t,
            Tag::Ultralight(t) => t,
            Tag::DESFire(t) => t,
            Tag::GenericIso14443_4(t) => t,
        }
    }
}

impl TagOps for Tag {
    fn uid(&self) -> &str {
        self.ops().uid()
    }
    fn family(&self) -> TagFamily {
        self.ops().family()
    }
    fn numeric_type(&self) -> u8 {
        self.ops().numeric_type()
    }
    fn capabilities(&self) -> Capabilities {
        self.ops().capabilities()
    }
    fn connect(&mut self) -> Result<(), ErrorKind> {
        self.ops_mut().connect()
    }
    fn disconnect(&mut self) -> Result<(), ErrorKind> {
        self.ops_mut().disconnect()
    }
    fn transceive(&self, apdu: &[u8]) -> Result<Vec<u8>, ErrorKind> {
        self.ops().transceive(apdu)
    }
    fn read_data(&self) -> Result<Vec<u8>, ErrorKind> {
        self.ops().read_data()
    }
    fn write_data(&self, data: &[u8]) -> Result<(), ErrorKind> {
        self.ops().write_data(data)
    }
    fn is_writable(&self) -> bool {
        self.ops().is_writable()
    }
    fn can_make_read_only(&self) -> bool {
        self.ops().can_make_read_only()
    }
    fn make_read_only(&mut self) -> Result<(), ErrorKind> {
        self.ops_mut().make_read_only()
    }
}
