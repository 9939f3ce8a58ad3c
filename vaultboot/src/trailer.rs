//! Partition trailer codec: the state byte and the per-sector flag nibbles
//! at the tail of each partition.
//!
//! Every trailer update is composed as `old & intended` and programmed at
//! the flash write granularity, so a value already reached stays put and a
//! transition that would set a bit is refused with `NeedsErase` instead of
//! corrupting the medium. The only erase of a trailer sector happens at
//! swap entry, before any image data has moved.

use byteorder::{ByteOrder, LittleEndian};
use vaultboot_hal::FlashInterface;

use crate::constants::*;
use crate::flashapi::{erase_with_retry, write_with_retry};
use crate::{Result, VaultbootError};

/// Widest span a trailer update can touch: the programmed bytes plus a
/// write-granularity word on either side.
const PROGRAM_SPAN_MAX: usize = 32;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum SectFlags {
    NewFlag,
    SwappingFlag,
    BackupFlag,
    UpdatedFlag,
}

impl SectFlags {
    pub fn from_nibble(nibble: u8) -> Result<Self> {
        match nibble {
            SECT_FLAG_NEW => Ok(SectFlags::NewFlag),
            SECT_FLAG_SWAPPING => Ok(SectFlags::SwappingFlag),
            SECT_FLAG_BACKUP => Ok(SectFlags::BackupFlag),
            SECT_FLAG_UPDATED => Ok(SectFlags::UpdatedFlag),
            _ => Err(VaultbootError::InvalidSectorFlag),
        }
    }

    pub fn nibble(self) -> u8 {
        match self {
            SectFlags::NewFlag => SECT_FLAG_NEW,
            SectFlags::SwappingFlag => SECT_FLAG_SWAPPING,
            SectFlags::BackupFlag => SECT_FLAG_BACKUP,
            SectFlags::UpdatedFlag => SECT_FLAG_UPDATED,
        }
    }
}

const fn part_end(layout: &FlashLayout, base: usize) -> usize {
    base + layout.partition_size
}

fn state_addr(layout: &FlashLayout, base: usize) -> usize {
    part_end(layout, base) - (MAGIC_TRAIL_LEN + PART_STATUS_LEN)
}

fn magic_addr(layout: &FlashLayout, base: usize) -> usize {
    part_end(layout, base) - MAGIC_TRAIL_LEN
}

fn flag_addr(layout: &FlashLayout, base: usize, sector: usize) -> usize {
    part_end(layout, base) - (MAGIC_TRAIL_LEN + PART_STATUS_LEN + 1) - (sector >> 1)
}

/// Program `new` at `addr`, widened to the flash write granularity.
///
/// Surrounding bytes within the widened words are reprogrammed with their
/// current value, which a NOR write leaves untouched. A no-op update (all
/// bytes already at their target value) skips the write entirely.
pub(crate) fn program_monotonic<I: FlashInterface>(
    iface: &I,
    addr: usize,
    new: &[u8],
) -> Result<()> {
    let gran = I::WRITE_SIZE;
    let start = addr & !(gran - 1);
    let end = (addr + new.len() + gran - 1) & !(gran - 1);
    let span = end - start;
    debug_assert!(span <= PROGRAM_SPAN_MAX);

    let mut old = [0xFFu8; PROGRAM_SPAN_MAX];
    iface.hal_flash_read(start, &mut old[..span]);
    let mut out = [0xFFu8; PROGRAM_SPAN_MAX];
    out[..span].copy_from_slice(&old[..span]);

    for (i, byte) in new.iter().enumerate() {
        let at = addr - start + i;
        if old[at] & *byte != *byte {
            return Err(VaultbootError::NeedsErase);
        }
        out[at] = old[at] & *byte;
    }
    if out[..span] == old[..span] {
        return Ok(());
    }
    write_with_retry(iface, start, &out[..span])
}

/// Reads the trailer state byte. A missing or corrupt trailer magic
/// reports `STATE_NEW` with `trailer_valid = false`.
pub fn read_state<I: FlashInterface>(iface: &I, layout: &FlashLayout, base: usize) -> (u8, bool) {
    let mut buf = [0u8; MAGIC_TRAIL_LEN + PART_STATUS_LEN];
    iface.hal_flash_read(state_addr(layout, base), &mut buf);
    let magic = LittleEndian::read_u32(&buf[PART_STATUS_LEN..]);
    if magic != VAULTBOOT_MAGIC_TRAIL {
        return (STATE_NEW, false);
    }
    (buf[0], true)
}

/// Writes the trailer state, installing the trailer magic first when it is
/// absent. State transitions only ever clear bits; anything else reports
/// `NeedsErase`.
pub fn write_state<I: FlashInterface>(
    iface: &I,
    layout: &FlashLayout,
    base: usize,
    state: u8,
) -> Result<()> {
    let (_, trailer_valid) = read_state(iface, layout, base);
    if !trailer_valid {
        write_magic(iface, layout, base)?;
    }
    program_monotonic(iface, state_addr(layout, base), &[state])
}

pub(crate) fn write_magic<I: FlashInterface>(
    iface: &I,
    layout: &FlashLayout,
    base: usize,
) -> Result<()> {
    let mut magic = [0u8; MAGIC_TRAIL_LEN];
    LittleEndian::write_u32(&mut magic, VAULTBOOT_MAGIC_TRAIL);
    program_monotonic(iface, magic_addr(layout, base), &magic)
}

pub fn read_sector_flag<I: FlashInterface>(
    iface: &I,
    layout: &FlashLayout,
    base: usize,
    sector: usize,
) -> Result<SectFlags> {
    let mut byte = [0u8; 1];
    iface.hal_flash_read(flag_addr(layout, base, sector), &mut byte);
    let nibble = if sector & 1 == 0 {
        byte[0] & 0x0F
    } else {
        byte[0] >> 4
    };
    SectFlags::from_nibble(nibble)
}

/// Updates one sector's flag nibble. The containing byte is re-assembled
/// around the untouched neighbour nibble and programmed through
/// [`program_monotonic`], so only the target nibble gains zeros.
pub fn write_sector_flag<I: FlashInterface>(
    iface: &I,
    layout: &FlashLayout,
    base: usize,
    sector: usize,
    flag: SectFlags,
) -> Result<()> {
    let addr = flag_addr(layout, base, sector);
    let mut byte = [0u8; 1];
    iface.hal_flash_read(addr, &mut byte);
    let assembled = if sector & 1 == 0 {
        (byte[0] & 0xF0) | flag.nibble()
    } else {
        (flag.nibble() << 4) | (byte[0] & 0x0F)
    };
    program_monotonic(iface, addr, &[assembled])
}

/// Erases the trailer sector and rewrites the trailer magic, optionally
/// seeding a state byte. This is the swap-entry reset that clears stale
/// flags; it runs before any image data has been touched, so a power cut
/// inside it leaves a restartable configuration.
pub fn reset_trailer<I: FlashInterface>(
    iface: &I,
    layout: &FlashLayout,
    base: usize,
    state: Option<u8>,
) -> Result<()> {
    let trailer_sector = part_end(layout, base) - layout.sector_size;
    erase_with_retry(iface, trailer_sector, layout.sector_size)?;
    write_magic(iface, layout, base)?;
    if let Some(state) = state {
        program_monotonic(iface, state_addr(layout, base), &[state])?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::TEST_LAYOUT;
    use vaultboot_hal::mock::MockFlash;

    fn test_flash() -> MockFlash {
        let flash = MockFlash::new(0xA000, TEST_LAYOUT.sector_size);
        flash.hal_flash_unlock();
        flash
    }

    #[test]
    fn missing_magic_reads_as_new() {
        let flash = test_flash();
        let (state, valid) = read_state(&flash, &TEST_LAYOUT, TEST_LAYOUT.boot_base);
        assert_eq!(state, STATE_NEW);
        assert!(!valid);
    }

    #[test]
    fn state_transitions_follow_bit_clearing() {
        let flash = test_flash();
        let base = TEST_LAYOUT.update_base;
        write_state(&flash, &TEST_LAYOUT, base, STATE_UPDATING).unwrap();
        assert_eq!(read_state(&flash, &TEST_LAYOUT, base), (STATE_UPDATING, true));

        // Idempotent rewrite.
        write_state(&flash, &TEST_LAYOUT, base, STATE_UPDATING).unwrap();

        write_state(&flash, &TEST_LAYOUT, base, STATE_SUCCESS).unwrap();
        assert_eq!(read_state(&flash, &TEST_LAYOUT, base), (STATE_SUCCESS, true));

        // SUCCESS -> TESTING would need 0 -> 1.
        assert_eq!(
            write_state(&flash, &TEST_LAYOUT, base, STATE_TESTING),
            Err(VaultbootError::NeedsErase)
        );
        assert_eq!(flash.violation_count(), 0);
    }

    #[test]
    fn flag_nibbles_pack_two_sectors_per_byte() {
        let flash = test_flash();
        let base = TEST_LAYOUT.boot_base;
        write_magic(&flash, &TEST_LAYOUT, base).unwrap();

        for sector in 0..TEST_LAYOUT.num_body_sectors() {
            assert_eq!(
                read_sector_flag(&flash, &TEST_LAYOUT, base, sector).unwrap(),
                SectFlags::NewFlag
            );
        }

        write_sector_flag(&flash, &TEST_LAYOUT, base, 0, SectFlags::SwappingFlag).unwrap();
        write_sector_flag(&flash, &TEST_LAYOUT, base, 1, SectFlags::BackupFlag).unwrap();
        assert_eq!(
            read_sector_flag(&flash, &TEST_LAYOUT, base, 0).unwrap(),
            SectFlags::SwappingFlag
        );
        assert_eq!(
            read_sector_flag(&flash, &TEST_LAYOUT, base, 1).unwrap(),
            SectFlags::BackupFlag
        );

        // Neighbour nibble untouched by a further update of sector 0.
        write_sector_flag(&flash, &TEST_LAYOUT, base, 0, SectFlags::UpdatedFlag).unwrap();
        assert_eq!(
            read_sector_flag(&flash, &TEST_LAYOUT, base, 1).unwrap(),
            SectFlags::BackupFlag
        );
        assert_eq!(flash.violation_count(), 0);
    }

    #[test]
    fn flags_only_ever_clear_bits() {
        let flash = test_flash();
        let base = TEST_LAYOUT.boot_base;
        write_magic(&flash, &TEST_LAYOUT, base).unwrap();
        write_sector_flag(&flash, &TEST_LAYOUT, base, 2, SectFlags::UpdatedFlag).unwrap();
        assert_eq!(
            write_sector_flag(&flash, &TEST_LAYOUT, base, 2, SectFlags::SwappingFlag),
            Err(VaultbootError::NeedsErase)
        );
        assert_eq!(flash.violation_count(), 0);
    }

    #[test]
    fn reset_clears_flags_and_seeds_state() {
        let flash = test_flash();
        let base = TEST_LAYOUT.update_base;
        write_state(&flash, &TEST_LAYOUT, base, STATE_SUCCESS).unwrap();
        write_sector_flag(&flash, &TEST_LAYOUT, base, 0, SectFlags::BackupFlag).unwrap();

        reset_trailer(&flash, &TEST_LAYOUT, base, Some(STATE_UPDATING)).unwrap();
        assert_eq!(read_state(&flash, &TEST_LAYOUT, base), (STATE_UPDATING, true));
        assert_eq!(
            read_sector_flag(&flash, &TEST_LAYOUT, base, 0).unwrap(),
            SectFlags::NewFlag
        );
    }
}
