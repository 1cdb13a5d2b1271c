//! Tag Classifier (spec.md §4.F): from ATR and/or active probing, produces a
//! typed `Tag`. Decision order: exact ATR match → GET_VERSION probe →
//! MIFARE auth probe → ISO-14443-4 fallback → unsupported (reported once
//! per card session).

use crate::apdu::{self, Transmit};
use crate::device::SharedDevice;
use crate::error::ErrorKind;
use crate::tags::{
    desfire::DesfireTag, generic_iso14443_4::GenericIso14443_4Tag,
    mifare_classic::MifareClassicTag, ultralight::UltralightTag, BaseTag, Tag, TagFamily,
};

/// Historical-byte → family table for cards whose ATR alone identifies them
/// unambiguously, mirroring the last-ATR-byte heuristic the teacher's own
/// ACR-driven classification used (`0x6A` MIFARE 1K, `0x68` NTAG/Ultralight).
const ATR_FAMILY_TABLE: &[(u8, TagFamily)] = &[
    (0x6A, TagFamily::Classic1K),
    (0x02, TagFamily::Classic4K),
    (0x68, TagFamily::Ultralight),
    (0x18, TagFamily::DESFire),
];

fn classify_atr(atr: &[u8]) -> Option<TagFamily> {
    let last = *atr.last()?;
    ATR_FAMILY_TABLE.iter().find(|(byte, _)| *byte == last).map(|(_, family)| *family)
}

/// Parses an 8-byte NXP GET_VERSION response into a family + storage-size
/// numeric type, distinguishing NTAG213/215/216 from Ultralight/Ultralight-C.
fn classify_get_version(resp: &[u8]) -> Option<(TagFamily, u8)> {
    if resp.len() < 8 {
        return None;
    }
    let product_subtype = resp[3];
    let storage_size = resp[6];
    let family = match storage_size {
        0x0B if product_subtype == 0x00 => TagFamily::Ultralight,
        0x0B => TagFamily::UltralightC,
        0x0F => TagFamily::Ntag213,
        0x11 => TagFamily::Ntag215,
        0x13 => TagFamily::Ntag216,
        _ => return None,
    };
    Some((family, storage_size))
}

/// ISO-14443-4 fallback condition: ATR contains `80 xx` where bit 5 of `xx`
/// is set.
fn atr_indicates_iso14443_4(atr: &[u8]) -> bool {
    atr.windows(2).any(|w| w[0] == 0x80 && (w[1] & 0x20) != 0)
}

fn uid_hex(uid_bytes: &[u8]) -> String {
    hex::encode(uid_bytes)
}

/// Builds the matching `Tag` from the device's ATR and/or active probes.
/// Returns `Ok(None)` for an unsupported card whose warning has already
/// been reported this card session.
pub fn classify(device: &SharedDevice, atr: &[u8]) -> Result<Option<Tag>, ErrorKind> {
    let uid_bytes = {
        let guard = device.lock().expect("device mutex poisoned");
        let resp = guard.transmit(&apdu::get_uid())?;
        apdu::check_status(&resp, |sw| ErrorKind::ReadFailed(format!("{:02x?}", sw)))?
    };
    let uid = uid_hex(&uid_bytes);
    let base = BaseTag { device: device.clone(), uid: uid.clone() };

    if let Some(family) = classify_atr(atr) {
        return Ok(Some(build_tag(base, family, *atr.last().unwrap_or(&0))));
    }

    if let Ok(resp) = base.transceive(&apdu::get_version()) {
        if let Ok(data) = apdu::check_status(&resp, |sw| ErrorKind::ReadFailed(format!("{:02x?}", sw))) {
            if let Some((family, numeric_type)) = classify_get_version(&data) {
                return Ok(Some(build_tag(base, family, numeric_type)));
            }
        }
    }

    if mifare_auth_probe_succeeds(&base, 3) {
        let family = if mifare_auth_probe_succeeds(&base, 127) {
            TagFamily::Classic4K
        } else {
            TagFamily::Classic1K
        };
        let numeric_type = *atr.last().unwrap_or(&0);
        return Ok(Some(build_tag(base, family, numeric_type)));
    }

    if atr_indicates_iso14443_4(atr) {
        let numeric_type = *atr.last().unwrap_or(&0);
        return Ok(Some(Tag::GenericIso14443_4(GenericIso14443_4Tag::new(base, numeric_type))));
    }

    device.lock().expect("device mutex poisoned").mark_unsupported_reported();
    Ok(None)
}

fn mifare_auth_probe_succeeds(base: &BaseTag, trailer_block: u8) -> bool {
    for key in crate::tags::mifare_classic::DEFAULT_KEYS.iter() {
        if base.transceive(&apdu::load_key(key)).is_err() {
            continue;
        }
        for key_type in [apdu::KEY_TYPE_A, apdu::KEY_TYPE_B] {
            if let Ok(resp) = base.transceive(&apdu::authenticate(trailer_block, key_type, 0x00)) {
                if apdu::check_status(&resp, |_| ErrorKind::AuthFailed).is_ok() {
                    return true;
                }
            }
        }
    }
    false
}

fn build_tag(base: BaseTag, family: TagFamily, numeric_type: u8) -> Tag {
    match family {
        TagFamily::Classic1K => Tag::Classic1K(MifareClassicTag::new(base, family, numeric_type)),
        TagFamily::Classic4K => Tag::Classic4K(MifareClassicTag::new(base, family, numeric_type)),
        TagFamily::Ultralight
        | TagFamily::UltralightC
        | TagFamily::Ntag213
        | TagFamily::Ntag215
        | TagFamily::Ntag216 => Tag::Ultralight(UltralightTag::new(base, family, numeric_type)),
        TagFamily::DESFire => Tag::DESFire(DesfireTag::new(base, numeric_type)),
        TagFamily::GenericIso14443_4 => {
            Tag::GenericIso14443_4(GenericIso14443_4Tag::new(base, numeric_type))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_atr_matches_known_last_byte() {
        assert_eq!(classify_atr(&[0x3B, 0x8F, 0x80, 0x01, 0x6A]), Some(TagFamily::Classic1K));
        assert_eq!(classify_atr(&[0x3B, 0x8F, 0x80, 0x01, 0x68]), Some(TagFamily::Ultralight));
    }

    #[test]
    fn classify_atr_returns_none_for_unknown_suffix() {
        assert_eq!(classify_atr(&[0x3B, 0x8F, 0x80, 0x01, 0xEE]), None);
    }

    #[test]
    fn classify_get_version_distinguishes_ntag_sizes() {
        let resp215 = [0x00, 0x04, 0x04, 0x02, 0x01, 0x00, 0x11, 0x03];
        assert_eq!(classify_get_version(&resp215), Some((TagFamily::Ntag215, 0x11)));
        let resp213 = [0x00, 0x04, 0x04, 0x02, 0x01, 0x00, 0x0F, 0x03];
        assert_eq!(classify_get_version(&resp213), Some((TagFamily::Ntag213, 0x0F)));
    }

    #[test]
    fn classify_get_version_rejects_truncated_response() {
        assert_eq!(classify_get_version(&[0x00, 0x04]), None);
    }

    #[test]
    fn iso14443_4_fallback_requires_bit5_set() {
        assert!(atr_indicates_iso14443_4(&[0x3B, 0x80, 0x20, 0x00]));
        assert!(!atr_indicates_iso14443_4(&[0x3B, 0x80, 0x00, 0x00]));
    }
}
