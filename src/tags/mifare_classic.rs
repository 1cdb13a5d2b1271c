//! MIFARE Classic 1K/4K dialect engine (spec.md §4.G).

use crate::apdu;
use crate::error::ErrorKind;
use crate::tlv;

use super::{BaseTag, Capabilities, TagFamily, TagOps};

pub const FACTORY_KEY: [u8; 6] = [0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF];
pub const PUBLIC_KEY: [u8; 6] = [0xD3, 0xF7, 0xD3, 0xF7, 0xD3, 0xF7];
pub(crate) const DEFAULT_KEYS: [[u8; 6]; 3] =
    [FACTORY_KEY, PUBLIC_KEY, [0xA0, 0xA1, 0xA2, 0xA3, 0xA4, 0xA5]];

const MAD_ACCESS_BITS: [u8; 4] = [0x78, 0x77, 0x88, 0xC1];
const DATA_ACCESS_BITS: [u8; 4] = [0x7F, 0x07, 0x88, 0x40];
const READ_ONLY_ACCESS_BITS: [u8; 4] = [0xFF, 0x07, 0x88, 0xC1];

const BLOCK_SIZE: usize = 16;

/// Describes one sector: its first block index, block count, and whether it
/// is a MAD sector (skipped for NDEF payload).
struct Sector {
    first_block: u8,
    block_count: u8,
    is_mad: bool,
}

fn sectors(family: TagFamily) -> Vec<Sector> {
    match family {
        TagFamily::Classic1K => (0..16)
            .map(|s| Sector { first_block: s * 4, block_count: 4, is_mad: s == 0 })
            .collect(),
        TagFamily::Classic4K => {
            let mut v: Vec<Sector> = (0..32)
                .map(|s| Sector { first_block: s * 4, block_count: 4, is_mad: s == 0 || s == 16 })
                .collect();
            let mut block: u16 = 32 * 4;
            for _ in 32..40 {
                v.push(Sector { first_block: block as u8, block_count: 16, is_mad: false });
                block += 16;
            }
            v
        }
        _ => unreachable!("sectors() only called for MIFARE Classic families"),
    }
}

/// Data blocks usable for NDEF payload: every block except sector trailers
/// and MAD-sector blocks (spec.md §4.G).
fn data_blocks(family: TagFamily) -> Vec<u8> {
    let mut blocks = Vec::new();
    for sector in sectors(family) {
        if sector.is_mad {
            continue;
        }
        let trailer = (sector.first_block as u16 + sector.block_count as u16 - 1) as u8;
        for b in sector.first_block..trailer {
            blocks.push(b);
        }
    }
    blocks
}

fn sector_trailer_of(family: TagFamily, block: u8) -> u8 {
    for sector in sectors(family) {
        let last = (sector.first_block as u16 + sector.block_count as u16 - 1) as u8;
        if block >= sector.first_block && block <= last {
            return last;
        }
    }
    unreachable!("block {} out of range for {:?}", block, family)
}

pub struct MifareClassicTag {
    pub base: BaseTag,
    pub family: TagFamily,
    pub numeric_type: u8,
}

impl MifareClassicTag {
    pub fn new(base: BaseTag, family: TagFamily, numeric_type: u8) -> Self {
        Self { base, family, numeric_type }
    }

    fn capacity(&self) -> usize {
        data_blocks(self.family).len() * BLOCK_SIZE
    }

    /// Authenticates `block`'s sector with whichever default key works, Key
    /// A then Key B, returning the key that succeeded.
    fn authenticate_sector(&self, block: u8) -> Result<[u8; 6], ErrorKind> {
        for key in DEFAULT_KEYS.iter() {
            let loaded = self.base.transceive(&apdu::load_key(key));
            if loaded.is_err() {
                continue;
            }
            for key_type in [apdu::KEY_TYPE_A, apdu::KEY_TYPE_B] {
                let resp = self.base.transceive(&apdu::authenticate(block, key_type, 0x00));
                if let Ok(resp) = resp {
                    if apdu::check_status(&resp, |_| ErrorKind::AuthFailed).is_ok() {
                        return Ok(*key);
                    }
                }
            }
        }
        Err(ErrorKind::AuthFailed)
    }

    fn read_block(&self, block: u8) -> Result<Vec<u8>, ErrorKind> {
        let resp = self.base.transceive(&apdu::read_binary(block, BLOCK_SIZE as u8))
            .map_err(|e| self.base.reclassify_if_removed(e))?;
        apdu::check_status(&resp, |sw| {
            self.base.reclassify_if_removed(ErrorKind::ReadFailed(format!("{:02x?}", sw)))
        })
    }

    fn write_block(&self, block: u8, data: &[u8; BLOCK_SIZE]) -> Result<(), ErrorKind> {
        let resp = self.base.transceive(&apdu::update_binary(block, data))
            .map_err(|e| self.base.reclassify_if_removed(e))?;
        apdu::check_status(&resp, |sw| {
            self.base.reclassify_if_removed(ErrorKind::WriteFailed(format!("{:02x?}", sw)))
        })
        .map(|_| ())
    }
}

impl TagOps for MifareClassicTag {
    fn uid(&self) -> &str {
        &self.base.uid
    }

    fn family(&self) -> TagFamily {
        self.family
    }

    fn numeric_type(&self) -> u8 {
        self.numeric_type
    }

    fn capabilities(&self) -> Capabilities {
        let memory_size = match self.family {
            TagFamily::Classic1K => 1024,
            TagFamily::Classic4K => 4096,
            _ => 0,
        };
        Capabilities {
            can_read: true,
            can_write: true,
            can_lock: true,
            supports_ndef: true,
            supports_crypto: false,
            memory_size,
            max_ndef_size: self.capacity(),
        }
    }

    fn transceive(&self, apdu: &[u8]) -> Result<Vec<u8>, ErrorKind> {
        self.base.transceive(apdu).map_err(|e| self.base.reclassify_if_removed(e))
    }

    fn read_data(&self) -> Result<Vec<u8>, ErrorKind> {
        let mut buffer = Vec::new();
        let mut authenticated_trailer: Option<u8> = None;

        for block in data_blocks(self.family) {
            let trailer = sector_trailer_of(self.family, block);
            if authenticated_trailer != Some(trailer) {
                self.authenticate_sector(block)?;
                authenticated_trailer = Some(trailer);
            }

            let data = self.read_block(block)?;
            buffer.extend_from_slice(&data);

            if buffer.contains(&tlv::TLV_TERMINATOR) {
                if let Ok((value, _ty)) = tlv::decode(&buffer) {
                    return Ok(value);
                }
            }
        }

        tlv::decode(&buffer).map(|(value, _ty)| value)
    }

    fn write_data(&self, data: &[u8]) -> Result<(), ErrorKind> {
        let capacity = self.capacity();
        if data.len() > capacity {
            return Err(ErrorKind::CapacityExceeded { wanted: data.len(), available: capacity });
        }

        let encoded = tlv::encode(data, tlv::TLV_TYPE_NDEF);
        let mut padded = encoded.clone();
        while padded.len() % BLOCK_SIZE != 0 {
            padded.push(0x00);
        }
        if padded.len() > capacity {
            return Err(ErrorKind::CapacityExceeded { wanted: padded.len(), available: capacity });
        }

        let blocks = data_blocks(self.family);
        let mut authenticated_trailer: Option<u8> = None;
        for (chunk, &block) in padded.chunks(BLOCK_SIZE).zip(blocks.iter()) {
            let trailer = sector_trailer_of(self.family, block);
            if authenticated_trailer != Some(trailer) {
                self.authenticate_sector(block)?;
                authenticated_trailer = Some(trailer);
            }
            let mut buf = [0u8; BLOCK_SIZE];
            buf[..chunk.len()].copy_from_slice(chunk);
            self.write_block(block, &buf)?;
        }
        Ok(())
    }

    fn is_writable(&self) -> bool {
        let Some(&first_data_block) = data_blocks(self.family).first() else { return false };
        self.authenticate_sector(first_data_block).is_ok()
    }

    fn can_make_read_only(&self) -> bool {
        true
    }

    /// Rewrites data-sector trailers with access bits that disable all
    /// future writes; MAD sectors are left addressable.
    fn make_read_only(&mut self) -> Result<(), ErrorKind> {
        for sector in sectors(self.family) {
            if sector.is_mad {
                continue;
            }
            let trailer = (sector.first_block as u16 + sector.block_count as u16 - 1) as u8;
            let key = self.authenticate_sector(trailer)?;
            let mut trailer_block = [0u8; BLOCK_SIZE];
            trailer_block[0..6].copy_from_slice(&key);
            trailer_block[6..10].copy_from_slice(&READ_ONLY_ACCESS_BITS);
            trailer_block[10..16].copy_from_slice(&key);
            self.write_block(trailer, &trailer_block)?;
        }
        Ok(())
    }
}

/// Rewrites every sector trailer with `PublicKey` as Key A and controlled
/// access bits (spec.md §4.G `ForceInitialize`). Requires sector 0 to
/// authenticate with the factory key first.
pub fn force_initialize(tag: &MifareClassicTag) -> Result<(), ErrorKind> {
    let sector_zero_trailer = sector_trailer_of(tag.family, 0);
    let resp = tag.base.transceive(&apdu::load_key(&FACTORY_KEY))?;
    apdu::check_status(&resp, |_| ErrorKind::AuthFailed)?;
    let resp = tag.base.transceive(&apdu::authenticate(sector_zero_trailer, apdu::KEY_TYPE_A, 0x00))?;
    apdu::check_status(&resp, |_| ErrorKind::AuthFailed)?;

    for sector in sectors(tag.family) {
        let trailer = (sector.first_block as u16 + sector.block_count as u16 - 1) as u8;
        tag.authenticate_sector(trailer)?;
        let access_bits = if sector.is_mad { MAD_ACCESS_BITS } else { DATA_ACCESS_BITS };
        let mut trailer_block = [0u8; BLOCK_SIZE];
        trailer_block[0..6].copy_from_slice(&PUBLIC_KEY);
        trailer_block[6..10].copy_from_slice(&access_bits);
        trailer_block[10..16].copy_from_slice(&FACTORY_KEY);
        tag.write_block(trailer, &trailer_block)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classic_1k_data_blocks_match_known_layout() {
        let blocks = data_blocks(TagFamily::Classic1K);
        assert_eq!(blocks.len(), 45);
        assert_eq!(blocks[0], 4);
        assert!(!blocks.contains(&0));
        assert!(!blocks.contains(&1));
        assert!(!blocks.contains(&2));
        assert!(!blocks.contains(&3)); // sector 0 (MAD) fully skipped
        assert!(!blocks.contains(&7)); // sector 1 trailer
    }

    #[test]
    fn classic_4k_skips_both_mad_sectors() {
        let blocks = data_blocks(TagFamily::Classic4K);
        assert!(!blocks.iter().any(|&b| b < 4)); // sector 0
        assert!(!blocks.iter().any(|&b| (64..68).contains(&b))); // sector 16
    }

    #[test]
    fn sector_trailer_of_returns_last_block_in_sector() {
        assert_eq!(sector_trailer_of(TagFamily::Classic1K, 4), 7);
        assert_eq!(sector_trailer_of(TagFamily::Classic1K, 6), 7);
    }

    #[test]
    fn capacity_matches_data_block_count_times_block_size() {
        assert_eq!(data_blocks(TagFamily::Classic1K).len() * BLOCK_SIZE, 45 * 16);
    }
}
