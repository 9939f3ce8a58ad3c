//! Thin plumbing over the flash interface: bounded retries for transient
//! failures and the block-wise flash-to-flash copy loop used by the swap
//! engine.

use byteorder::ByteOrder;
use vaultboot_hal::{FlashError, FlashInterface};

use crate::constants::{FLASHBUFFER_SIZE, FLASH_RETRY_LIMIT};
use crate::{Result, VaultbootError};

/// Program with retries. `NeedsErase` is semantic, not transient, and is
/// reported immediately.
pub(crate) fn write_with_retry<I: FlashInterface>(
    iface: &I,
    addr: usize,
    data: &[u8],
) -> Result<()> {
    let mut tries = 0;
    loop {
        match iface.hal_flash_write(addr, data) {
            Ok(()) => return Ok(()),
            Err(FlashError::NeedsErase) => return Err(VaultbootError::NeedsErase),
            Err(e) => {
                tries += 1;
                if tries >= FLASH_RETRY_LIMIT {
                    error!("flash write at {:x} failed after {} tries", addr, tries);
                    return Err(e.into());
                }
            }
        }
    }
}

pub(crate) fn erase_with_retry<I: FlashInterface>(iface: &I, addr: usize, len: usize) -> Result<()> {
    let mut tries = 0;
    loop {
        match iface.hal_flash_erase(addr, len) {
            Ok(()) => return Ok(()),
            Err(e) => {
                tries += 1;
                if tries >= FLASH_RETRY_LIMIT {
                    error!("flash erase at {:x} failed after {} tries", addr, tries);
                    return Err(e.into());
                }
            }
        }
    }
}

/// Copies `len` bytes of flash from `src` to `dst` in
/// [`FLASHBUFFER_SIZE`] blocks. The destination must be erased.
pub(crate) fn copy_region<I: FlashInterface>(
    iface: &I,
    src: usize,
    dst: usize,
    len: usize,
) -> Result<()> {
    let mut buf = [0xFFu8; FLASHBUFFER_SIZE];
    let mut pos = 0;
    while pos < len {
        let n = core::cmp::min(FLASHBUFFER_SIZE, len - pos);
        iface.hal_flash_read(src + pos, &mut buf[..n]);
        write_with_retry(iface, dst + pos, &buf[..n])?;
        pos += n;
    }
    Ok(())
}

pub(crate) fn read_u32<I: FlashInterface>(iface: &I, addr: usize) -> u32 {
    let mut buf = [0u8; 4];
    iface.hal_flash_read(addr, &mut buf);
    byteorder::LittleEndian::read_u32(&buf)
}
