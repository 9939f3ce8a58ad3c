//! Delta updates: the UPDATE partition holds a signed patch script instead
//! of a flat image, and the new image is reconstructed against the base
//! image sitting in BOOT.
//!
//! The payload is an opcode stream:
//!
//! ```text
//! 0x00  copy    { src_offset: u32 LE, len: u32 LE }   bytes from the base
//! 0x01  literal { len: u32 LE, bytes }                verbatim bytes
//! ```
//!
//! Output is assembled one sector at a time in RAM and emitted over the
//! base in place, so copy opcodes must never reach back into base sectors
//! that have already been replaced (sources at or beyond the sector being
//! built are fine: the sector is read before it is erased). The whole
//! stream is validated with a dry run before the first erase. Patch bytes
//! are protected by the container signature, so the container is fully
//! verified before application; like every direct-mode install there is no
//! backup and no rollback.

use byteorder::{ByteOrder, LittleEndian};
use vaultboot_hal::FlashInterface;

use crate::constants::*;
use crate::crypto::constant_time_eq;
use crate::flashapi::{erase_with_retry, write_with_retry};
use crate::image::image::{open_image_at, Boot, PartDescriptor};
use crate::keystore::Keystore;
use crate::parser::Tags;
use crate::trailer;
use crate::{Result, VaultbootError};

const OP_COPY: u8 = 0x00;
const OP_LITERAL: u8 = 0x01;

/// RAM assembly buffer; targets with larger erase sectors cannot use delta
/// updates.
const SECTOR_BUF_SIZE: usize = SECTOR_SIZE;

#[derive(Debug, Clone, Copy)]
enum PatchOp {
    Copy { src: usize, len: usize },
    /// Verbatim bytes at an absolute flash address inside the patch
    /// payload.
    Literal { addr: usize, len: usize },
}

struct PatchReader<'a, I: FlashInterface> {
    iface: &'a I,
    base: usize,
    len: usize,
    pos: usize,
}

impl<'a, I: FlashInterface> PatchReader<'a, I> {
    fn new(iface: &'a I, base: usize, len: usize) -> Self {
        PatchReader {
            iface,
            base,
            len,
            pos: 0,
        }
    }

    fn next_op(&mut self) -> Result<Option<PatchOp>> {
        if self.pos >= self.len {
            return Ok(None);
        }
        let mut opcode = [0u8; 1];
        self.iface.hal_flash_read(self.base + self.pos, &mut opcode);
        match opcode[0] {
            OP_COPY => {
                if self.pos + 9 > self.len {
                    return Err(VaultbootError::BadPatch);
                }
                let mut fields = [0u8; 8];
                self.iface
                    .hal_flash_read(self.base + self.pos + 1, &mut fields);
                let src = LittleEndian::read_u32(&fields[..4]) as usize;
                let len = LittleEndian::read_u32(&fields[4..]) as usize;
                self.pos += 9;
                if len == 0 {
                    return Err(VaultbootError::BadPatch);
                }
                Ok(Some(PatchOp::Copy { src, len }))
            }
            OP_LITERAL => {
                if self.pos + 5 > self.len {
                    return Err(VaultbootError::BadPatch);
                }
                let mut fields = [0u8; 4];
                self.iface
                    .hal_flash_read(self.base + self.pos + 1, &mut fields);
                let len = LittleEndian::read_u32(&fields) as usize;
                let addr = self.base + self.pos + 5;
                self.pos += 5 + len;
                if len == 0 || self.pos > self.len {
                    return Err(VaultbootError::BadPatch);
                }
                Ok(Some(PatchOp::Literal { addr, len }))
            }
            _ => Err(VaultbootError::BadPatch),
        }
    }
}

/// Verifies and applies a delta patch held in UPDATE. On success BOOT
/// holds the reconstructed image in `testing` state and the patch is
/// consumed.
pub(crate) fn apply_delta<I: FlashInterface>(
    iface: &I,
    layout: &FlashLayout,
    keystore: &Keystore<'_>,
    mut patch: PartDescriptor<Boot>,
) -> Result<()> {
    if layout.sector_size > SECTOR_BUF_SIZE {
        return Err(VaultbootError::InvalidState);
    }
    // The signature is what protects the patch bytes: full verification
    // before a single opcode is honored.
    patch.verify_integrity(iface)?;
    patch.verify_authenticity(iface, keystore)?;

    // The patch binds to one exact base image.
    let mut base = open_image_at(iface, layout.boot_base, layout.body_size())?;
    base.verify_integrity(iface)?;
    let expected = patch.get_tlv(Tags::DeltaBase)?;
    if !constant_time_eq(base.get_tlv(Tags::Digest)?, expected) {
        return Err(VaultbootError::BadPatch);
    }

    // Dry run: opcode structure, source monotonicity and output size are
    // all checked before the base is touched.
    reconstruct(iface, layout, &patch, true)?;

    info!("applying delta patch");
    trailer::reset_trailer(iface, layout, layout.boot_base, None)?;
    reconstruct(iface, layout, &patch, false)?;

    trailer::write_state(iface, layout, layout.update_base, STATE_SUCCESS)?;
    trailer::write_state(iface, layout, layout.boot_base, STATE_TESTING)?;
    Ok(())
}

/// Walks the opcode stream, assembling output sectors. With `dry` no flash
/// is modified; the same checks run either way.
fn reconstruct<I: FlashInterface>(
    iface: &I,
    layout: &FlashLayout,
    patch: &PartDescriptor<Boot>,
    dry: bool,
) -> Result<usize> {
    let sector_size = layout.sector_size;
    let mut reader = PatchReader::new(iface, patch.base + IMAGE_HEADER_SIZE, patch.fw_size);
    let mut buf = [0xFFu8; SECTOR_BUF_SIZE];

    let mut out_sector = 0usize;
    let mut emitted = 0usize;
    let mut new_total: Option<usize> = None;
    let mut op = reader.next_op()?;
    let mut consumed = 0usize;

    loop {
        let mut fill = 0usize;
        while fill < sector_size {
            let current = match op {
                Some(current) => current,
                None => break,
            };
            let n = match current {
                PatchOp::Copy { src, len } => {
                    let n = core::cmp::min(len - consumed, sector_size - fill);
                    let src_at = src + consumed;
                    // Base sectors before the one being built are already
                    // overwritten.
                    if src_at < out_sector * sector_size
                        || src_at + n > layout.body_size()
                    {
                        return Err(VaultbootError::BadPatch);
                    }
                    iface.hal_flash_read(layout.boot_base + src_at, &mut buf[fill..fill + n]);
                    n
                }
                PatchOp::Literal { addr, len } => {
                    let n = core::cmp::min(len - consumed, sector_size - fill);
                    iface.hal_flash_read(addr + consumed, &mut buf[fill..fill + n]);
                    n
                }
            };
            fill += n;
            consumed += n;
            let done = match current {
                PatchOp::Copy { len, .. } | PatchOp::Literal { len, .. } => consumed >= len,
            };
            if done {
                op = reader.next_op()?;
                consumed = 0;
            }
        }
        if fill == 0 {
            break;
        }

        if out_sector == 0 {
            // The stream emits the complete container, header first; the
            // prefix is validated before the base loses its first sector.
            if fill < IMAGE_HEADER_OFFSET {
                return Err(VaultbootError::BadPatch);
            }
            if LittleEndian::read_u32(&buf[..4]) != VAULTBOOT_MAGIC {
                return Err(VaultbootError::BadPatch);
            }
            let fw_size = LittleEndian::read_u32(&buf[4..8]) as usize;
            if fw_size == 0 || fw_size > layout.max_image_size() {
                return Err(VaultbootError::BadPatch);
            }
            new_total = Some(fw_size + IMAGE_HEADER_SIZE);
        }

        if !dry {
            let dst = layout.boot_base + out_sector * sector_size;
            erase_with_retry(iface, dst, sector_size)?;
            let mut offset = 0;
            while offset < sector_size {
                write_with_retry(iface, dst + offset, &buf[offset..offset + FLASHBUFFER_SIZE])?;
                offset += FLASHBUFFER_SIZE;
            }
        }
        emitted += fill;
        out_sector += 1;
        buf = [0xFFu8; SECTOR_BUF_SIZE];
        iface.hal_watchdog_feed();

        if op.is_none() {
            break;
        }
        if out_sector >= layout.num_body_sectors() {
            return Err(VaultbootError::BadPatch);
        }
    }

    let total = new_total.ok_or(VaultbootError::BadPatch)?;
    if emitted != total {
        return Err(VaultbootError::BadPatch);
    }
    if !dry {
        for sector in out_sector..layout.num_body_sectors() {
            erase_with_retry(
                iface,
                layout.boot_base + sector * sector_size,
                sector_size,
            )?;
        }
    }
    Ok(emitted)
}
