//! The generic power-fail-safe exchange engine.
//!
//! A swap moves the candidate image from UPDATE into BOOT while parking
//! the previous firmware in UPDATE as a backup, one sector at a time
//! through the scratch region:
//!
//! 1. stage:   UPDATE[i] -> scratch, then the scratch header, then
//!             BOOT's sector flag goes `swapping`
//! 2. backup:  BOOT[i] -> UPDATE[i], UPDATE's sector flag goes `backup`
//! 3. install: scratch -> BOOT[i], BOOT's sector flag goes `updated`
//! 4. the scratch region is erased for the next sector
//!
//! Flags are written strictly after the data they protect, so a reset
//! after any single program or erase lands in a row of the resume table
//! and the next run completes the exchange. BOOT is at every moment
//! either fully old, fully new, or a prefix of the new image followed by
//! a suffix of the old one; a concurrent verification can only fail
//! cleanly.

use core::sync::atomic::{compiler_fence, Ordering};

use byteorder::{ByteOrder, LittleEndian};
use vaultboot_hal::{FlashInterface, MonotonicCounter};

use super::{delta, UpdateInterface};
use crate::constants::*;
use crate::flashapi::{copy_region, erase_with_retry, write_with_retry};
use crate::image::image::{open_image_at, read_image_header, PartId};
use crate::keystore::Keystore;
use crate::parser::{parse_tlv, Tags};
use crate::trailer::{self, SectFlags};
use crate::{Result, VaultbootError};

/// Key material for encrypted updates. The stream cipher is selected by
/// [`BootConfig::encryption`]; ChaCha20 uses the first 12 nonce bytes.
pub struct UpdateKey {
    pub key: [u8; 32],
    pub nonce: [u8; 16],
}

/// The swap engine plus everything the boot policy and the application
/// API need: flash access, layout, trusted keys, and the optional
/// anti-rollback counter and update cipher key.
pub struct FlashUpdater<'k, I: FlashInterface> {
    iface: I,
    layout: FlashLayout,
    config: BootConfig,
    keystore: Keystore<'k>,
    counter: Option<&'k dyn MonotonicCounter>,
    update_key: Option<UpdateKey>,
}

struct ExchangeInfo {
    total_size: usize,
    img_type: u16,
}

impl<'k, I: FlashInterface> FlashUpdater<'k, I> {
    pub fn new(iface: I, layout: FlashLayout, keystore: Keystore<'k>) -> Self {
        FlashUpdater {
            iface,
            layout,
            config: DEFAULT_CONFIG,
            keystore,
            counter: None,
            update_key: None,
        }
    }

    pub fn with_config(mut self, config: BootConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_rollback_counter(mut self, counter: &'k dyn MonotonicCounter) -> Self {
        self.counter = Some(counter);
        self
    }

    pub fn with_update_key(mut self, key: UpdateKey) -> Self {
        self.update_key = Some(key);
        self
    }

    fn exchange(&self, rollback: bool) -> Result<()> {
        match self.config.update_mode {
            UpdateMode::Swap => self.swap_exchange(rollback),
            UpdateMode::Direct if !rollback => self.direct_exchange(),
            // Rollback is not available in direct mode, and hardware bank
            // exchange lives in the dual-bank updater, not here.
            UpdateMode::Direct | UpdateMode::DualbankHwSwap => Err(VaultbootError::InvalidState),
        }
    }

    fn swap_exchange(&self, rollback: bool) -> Result<()> {
        let iface = &self.iface;
        let layout = &self.layout;

        let mut started = self.swap_started();
        if rollback {
            let complete = started && self.exchange_complete();
            if complete && self.boot_older_than_update() == Some(true) {
                // The restore itself already ran to the end; only the
                // finalize was lost to a power cut. Re-running the swap
                // would put the rejected image back.
                return self.finalize(STATE_SUCCESS);
            }
            if !started || complete {
                // Fresh rollback (or re-arming after a completed forward
                // swap). The incoming image is the backup; refuse before
                // touching anything if there is none. A consumed delta
                // patch is not a backup.
                let backup = open_image_at(iface, layout.update_base, layout.body_size())?;
                if backup.image_type()? & IMG_TYPE_DELTA != 0 {
                    return Err(VaultbootError::InvalidState);
                }
                trailer::reset_trailer(iface, layout, layout.update_base, Some(STATE_UPDATING))?;
                // The testing marker keeps the policy routing resets into
                // this rollback until it finalizes as SUCCESS.
                trailer::reset_trailer(iface, layout, layout.boot_base, Some(STATE_TESTING))?;
                started = false;
            }
            // Otherwise an interrupted rollback: resume it below off the
            // sector flags, exactly like a forward resume.
        } else if !started {
            let updt = match open_image_at(iface, layout.update_base, layout.body_size()) {
                Ok(desc) => desc,
                Err(e) => {
                    self.consume_update();
                    return Err(e);
                }
            };
            let img_type = match updt.image_type() {
                Ok(t) => t,
                Err(e) => {
                    self.consume_update();
                    return Err(e);
                }
            };
            if img_type & IMG_TYPE_DELTA != 0 {
                if !self.config.delta_updates {
                    self.consume_update();
                    return Err(VaultbootError::InvalidState);
                }
                return delta::apply_delta(iface, layout, &self.keystore, updt).map_err(|e| {
                    self.consume_update();
                    e
                });
            }
            // Downgrades do not reach the swap; the anti-rollback counter
            // (when fitted) is enforced separately at verification time.
            if let Ok(boot) = open_image_at(iface, layout.boot_base, layout.body_size()) {
                match (updt.firmware_version(), boot.firmware_version()) {
                    (Ok(new), Ok(cur)) if new <= cur => {
                        self.consume_update();
                        return Err(VaultbootError::VersionRollback);
                    }
                    (Err(e), _) => {
                        self.consume_update();
                        return Err(e);
                    }
                    _ => {}
                }
            }
            trailer::reset_trailer(iface, layout, layout.boot_base, None)?;
        }

        let info = self.exchange_info(started)?;
        let encrypted = !rollback && info.img_type & IMG_TYPE_ENCRYPTED != 0;
        let sector_size = layout.sector_size;
        let used = core::cmp::min(
            (info.total_size + sector_size - 1) / sector_size,
            layout.num_body_sectors(),
        );
        debug!("exchanging {} sectors", used);

        for sector in 0..used {
            self.process_sector(sector, encrypted)?;
            iface.hal_watchdog_feed();
        }
        for sector in used..layout.num_body_sectors() {
            erase_with_retry(iface, layout.boot_base + sector * sector_size, sector_size)?;
            erase_with_retry(iface, layout.update_base + sector * sector_size, sector_size)?;
        }

        // A restored image proved itself before; a fresh one has to.
        self.finalize(if rollback { STATE_SUCCESS } else { STATE_TESTING })
    }

    fn finalize(&self, state: u8) -> Result<()> {
        let iface = &self.iface;
        let layout = &self.layout;
        compiler_fence(Ordering::SeqCst);
        trailer::write_state(iface, layout, layout.boot_base, state)?;
        // The candidate is consumed: UPDATE leaves `updating` so the
        // policy stops re-entering, while its content stays addressable
        // as the backup.
        trailer::write_state(iface, layout, layout.update_base, STATE_SUCCESS)?;
        self.erase_scratch()?;
        info!("exchange complete");
        Ok(())
    }

    /// Every sector of the exchange carries its terminal flag pair.
    fn exchange_complete(&self) -> bool {
        let layout = &self.layout;
        let info = match self.exchange_info(true) {
            Ok(info) => info,
            Err(_) => return false,
        };
        let used = core::cmp::min(
            (info.total_size + layout.sector_size - 1) / layout.sector_size,
            layout.num_body_sectors(),
        );
        (0..used).all(|sector| {
            matches!(
                trailer::read_sector_flag(&self.iface, layout, layout.boot_base, sector),
                Ok(SectFlags::UpdatedFlag)
            ) && matches!(
                trailer::read_sector_flag(&self.iface, layout, layout.update_base, sector),
                Ok(SectFlags::BackupFlag)
            )
        })
    }

    /// `Some(true)` when BOOT already holds the older of the two images,
    /// i.e. a restore has happened.
    fn boot_older_than_update(&self) -> Option<bool> {
        let layout = &self.layout;
        let boot = open_image_at(&self.iface, layout.boot_base, layout.body_size())
            .ok()?
            .firmware_version()
            .ok()?;
        let updt = open_image_at(&self.iface, layout.update_base, layout.body_size())
            .ok()?
            .firmware_version()
            .ok()?;
        Some(boot < updt)
    }

    /// In-place UPDATE -> BOOT copy: restartable after power loss (the
    /// candidate stays intact until the trailer consume), but with no
    /// backup and therefore no rollback.
    fn direct_exchange(&self) -> Result<()> {
        let iface = &self.iface;
        let layout = &self.layout;

        let updt = match open_image_at(iface, layout.update_base, layout.body_size()) {
            Ok(desc) => desc,
            Err(e) => {
                self.consume_update();
                return Err(e);
            }
        };
        let img_type = match updt.image_type() {
            Ok(t) => t,
            Err(e) => {
                self.consume_update();
                return Err(e);
            }
        };
        if img_type & IMG_TYPE_DELTA != 0 {
            if !self.config.delta_updates {
                self.consume_update();
                return Err(VaultbootError::InvalidState);
            }
            return delta::apply_delta(iface, layout, &self.keystore, updt).map_err(|e| {
                self.consume_update();
                e
            });
        }
        if let Ok(boot) = open_image_at(iface, layout.boot_base, layout.body_size()) {
            match (updt.firmware_version(), boot.firmware_version()) {
                (Ok(new), Ok(cur)) if new <= cur => {
                    self.consume_update();
                    return Err(VaultbootError::VersionRollback);
                }
                (Err(e), _) => {
                    self.consume_update();
                    return Err(e);
                }
                _ => {}
            }
        }
        let encrypted = img_type & IMG_TYPE_ENCRYPTED != 0;

        trailer::reset_trailer(iface, layout, layout.boot_base, None)?;
        let sector_size = layout.sector_size;
        let total = updt.fw_size + IMAGE_HEADER_SIZE;
        let used = (total + sector_size - 1) / sector_size;
        for sector in 0..used {
            let dst = layout.boot_base + sector * sector_size;
            erase_with_retry(iface, dst, sector_size)?;
            self.copy_update_sector(sector, dst, encrypted)?;
            iface.hal_watchdog_feed();
        }
        for sector in used..layout.num_body_sectors() {
            erase_with_retry(iface, layout.boot_base + sector * sector_size, sector_size)?;
        }
        compiler_fence(Ordering::SeqCst);
        trailer::write_state(iface, layout, layout.update_base, STATE_SUCCESS)?;
        trailer::write_state(iface, layout, layout.boot_base, STATE_TESTING)?;
        Ok(())
    }

    /// Resume-or-execute for one sector, following the flag-pair table.
    fn process_sector(&self, sector: usize, encrypted: bool) -> Result<()> {
        let iface = &self.iface;
        let layout = &self.layout;
        let boot_flag = trailer::read_sector_flag(iface, layout, layout.boot_base, sector)
            .unwrap_or(SectFlags::NewFlag);
        let updt_flag = trailer::read_sector_flag(iface, layout, layout.update_base, sector)
            .unwrap_or(SectFlags::NewFlag);

        match (boot_flag, updt_flag) {
            // Fully exchanged, move on.
            (SectFlags::UpdatedFlag, SectFlags::BackupFlag) => Ok(()),
            // Backup done; the staged copy still has to land in BOOT.
            (SectFlags::SwappingFlag, SectFlags::BackupFlag) => {
                if !self.scratch_valid(sector) {
                    return Err(VaultbootError::Fatal);
                }
                self.install_step(sector)
            }
            // Staged but not backed up; redo from the backup step, or from
            // the top if the scratch never became valid.
            (SectFlags::SwappingFlag, SectFlags::NewFlag) => {
                if !self.scratch_valid(sector) {
                    self.stage_step(sector, encrypted)?;
                }
                self.backup_step(sector)?;
                self.install_step(sector)
            }
            (SectFlags::NewFlag, SectFlags::NewFlag) => {
                self.stage_step(sector, encrypted)?;
                self.backup_step(sector)?;
                self.install_step(sector)
            }
            _ => Err(VaultbootError::Fatal),
        }
    }

    fn stage_step(&self, sector: usize, encrypted: bool) -> Result<()> {
        let iface = &self.iface;
        let layout = &self.layout;
        self.erase_scratch()?;
        self.copy_update_sector(sector, layout.scratch_payload_base(), encrypted)?;
        compiler_fence(Ordering::SeqCst);
        self.write_scratch_header(sector)?;
        compiler_fence(Ordering::SeqCst);
        trailer::write_sector_flag(
            iface,
            layout,
            layout.boot_base,
            sector,
            SectFlags::SwappingFlag,
        )
    }

    fn backup_step(&self, sector: usize) -> Result<()> {
        let iface = &self.iface;
        let layout = &self.layout;
        let offset = sector * layout.sector_size;
        erase_with_retry(iface, layout.update_base + offset, layout.sector_size)?;
        copy_region(
            iface,
            layout.boot_base + offset,
            layout.update_base + offset,
            layout.sector_size,
        )?;
        compiler_fence(Ordering::SeqCst);
        trailer::write_sector_flag(
            iface,
            layout,
            layout.update_base,
            sector,
            SectFlags::BackupFlag,
        )
    }

    fn install_step(&self, sector: usize) -> Result<()> {
        let iface = &self.iface;
        let layout = &self.layout;
        let offset = sector * layout.sector_size;
        erase_with_retry(iface, layout.boot_base + offset, layout.sector_size)?;
        copy_region(
            iface,
            layout.scratch_payload_base(),
            layout.boot_base + offset,
            layout.sector_size,
        )?;
        compiler_fence(Ordering::SeqCst);
        trailer::write_sector_flag(
            iface,
            layout,
            layout.boot_base,
            sector,
            SectFlags::UpdatedFlag,
        )
    }

    /// An exchange is underway once sector 0 has progressed: its UPDATE
    /// flag left `new`, or its staged copy and `swapping` flag exist.
    fn swap_started(&self) -> bool {
        let layout = &self.layout;
        if let Ok(flag) = trailer::read_sector_flag(&self.iface, layout, layout.update_base, 0) {
            if flag != SectFlags::NewFlag {
                return true;
            }
        }
        matches!(
            trailer::read_sector_flag(&self.iface, layout, layout.boot_base, 0),
            Ok(SectFlags::SwappingFlag)
        ) && self.scratch_valid(0)
    }

    /// Sizes and the incoming image type, readable at any point of an
    /// interrupted exchange: the new header lives in UPDATE before sector
    /// 0 moves, afterwards in BOOT, and in the staged scratch copy while
    /// sector 0 is in flight.
    fn exchange_info(&self, started: bool) -> Result<ExchangeInfo> {
        let iface = &self.iface;
        let layout = &self.layout;
        let mut total_size = 0usize;
        let mut updt_type = None;
        let mut boot_type = None;
        let mut scratch_type = None;

        if let Ok((hdr, fw_size)) = read_image_header(iface, layout, layout.update_base) {
            total_size = total_size.max(fw_size + IMAGE_HEADER_SIZE);
            updt_type = img_type_of(&hdr);
        }
        if let Ok((hdr, fw_size)) = read_image_header(iface, layout, layout.boot_base) {
            total_size = total_size.max(fw_size + IMAGE_HEADER_SIZE);
            boot_type = img_type_of(&hdr);
        }
        if self.scratch_valid(0) {
            if let Ok(desc) =
                open_image_at(iface, layout.scratch_payload_base(), layout.body_size())
            {
                total_size = total_size.max(desc.fw_size + IMAGE_HEADER_SIZE);
                scratch_type = desc.image_type().ok();
            }
        }
        if total_size == 0 {
            return Err(VaultbootError::BadMagic);
        }
        // While sector 0 is in flight BOOT still holds the old header;
        // the staged copy is authoritative then.
        let img_type = if started {
            scratch_type.or(boot_type).or(updt_type)
        } else {
            updt_type.or(boot_type)
        };
        Ok(ExchangeInfo {
            total_size,
            img_type: img_type.unwrap_or(0),
        })
    }

    /// Copies one UPDATE sector to `dst` (which must be erased),
    /// decrypting payload blocks in flight for encrypted updates.
    fn copy_update_sector(&self, sector: usize, dst: usize, encrypted: bool) -> Result<()> {
        let iface = &self.iface;
        let layout = &self.layout;
        let src = layout.update_base + sector * layout.sector_size;
        let mut buf = [0xFFu8; FLASHBUFFER_SIZE];
        let mut offset = 0;
        while offset < layout.sector_size {
            iface.hal_flash_read(src + offset, &mut buf);
            let image_offset = sector * layout.sector_size + offset;
            if encrypted && image_offset >= IMAGE_HEADER_SIZE {
                self.decrypt_block(image_offset - IMAGE_HEADER_SIZE, &mut buf)?;
            }
            write_with_retry(iface, dst + offset, &buf)?;
            offset += FLASHBUFFER_SIZE;
        }
        Ok(())
    }

    #[allow(unused_variables)]
    fn decrypt_block(&self, payload_offset: usize, buf: &mut [u8]) -> Result<()> {
        let key = self
            .update_key
            .as_ref()
            .ok_or(VaultbootError::InvalidState)?;
        match self.config.encryption {
            Encryption::AesCtr => {
                #[cfg(feature = "aes-ctr")]
                {
                    use ctr::cipher::generic_array::GenericArray;
                    use ctr::cipher::{NewCipher, StreamCipher, StreamCipherSeek};
                    type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;
                    let mut cipher = Aes256Ctr::new(
                        GenericArray::from_slice(&key.key),
                        GenericArray::from_slice(&key.nonce),
                    );
                    cipher.seek(payload_offset as u64);
                    cipher.apply_keystream(buf);
                    return Ok(());
                }
                #[allow(unreachable_code)]
                Err(VaultbootError::UnsupportedAlgorithm)
            }
            Encryption::ChaCha20 => {
                #[cfg(feature = "chacha20-cipher")]
                {
                    use chacha20::cipher::{NewCipher, StreamCipher, StreamCipherSeek};
                    use chacha20::{ChaCha20, Key, Nonce};
                    let mut cipher = ChaCha20::new(
                        Key::from_slice(&key.key),
                        Nonce::from_slice(&key.nonce[..12]),
                    );
                    cipher.seek(payload_offset as u64);
                    cipher.apply_keystream(buf);
                    return Ok(());
                }
                #[allow(unreachable_code)]
                Err(VaultbootError::UnsupportedAlgorithm)
            }
            Encryption::None => Err(VaultbootError::UnsupportedAlgorithm),
        }
    }

    fn erase_scratch(&self) -> Result<()> {
        erase_with_retry(
            &self.iface,
            self.layout.swap_base,
            self.layout.scratch_size(),
        )
    }

    /// The scratch header is written after the payload, so its validity
    /// implies a complete staged copy.
    fn write_scratch_header(&self, sector: usize) -> Result<()> {
        let mut header = [0xFFu8; SCRATCH_HEADER_SIZE];
        LittleEndian::write_u32(&mut header[..4], VAULTBOOT_MAGIC_SCRATCH);
        LittleEndian::write_u16(
            &mut header[SCRATCH_SRC_OFFSET..SCRATCH_SRC_OFFSET + 2],
            PartId::PartUpdate.as_u16(),
        );
        LittleEndian::write_u32(
            &mut header[SCRATCH_INDEX_OFFSET..SCRATCH_INDEX_OFFSET + 4],
            sector as u32,
        );
        write_with_retry(&self.iface, self.layout.swap_base, &header)
    }

    fn scratch_valid(&self, sector: usize) -> bool {
        let mut header = [0u8; SCRATCH_HEADER_SIZE];
        self.iface.hal_flash_read(self.layout.swap_base, &mut header);
        LittleEndian::read_u32(&header[..4]) == VAULTBOOT_MAGIC_SCRATCH
            && LittleEndian::read_u16(&header[SCRATCH_SRC_OFFSET..SCRATCH_SRC_OFFSET + 2])
                == PartId::PartUpdate.as_u16()
            && LittleEndian::read_u32(&header[SCRATCH_INDEX_OFFSET..SCRATCH_INDEX_OFFSET + 4])
                == sector as u32
    }

    /// A candidate that can never install (structurally broken or a
    /// downgrade) is marked consumed so the policy stops retrying it every
    /// reset.
    fn consume_update(&self) {
        let _ = trailer::write_state(
            &self.iface,
            &self.layout,
            self.layout.update_base,
            STATE_SUCCESS,
        );
    }
}

fn img_type_of(hdr: &[u8]) -> Option<u16> {
    let val = parse_tlv(hdr, Tags::ImgType).ok()?;
    if val.len() != HDR_IMG_TYPE_LEN {
        return None;
    }
    Some(val[0] as u16 | (val[1] as u16) << 8)
}

impl<'k, I: FlashInterface> UpdateInterface for FlashUpdater<'k, I> {
    type Flash = I;

    fn flash(&self) -> &I {
        &self.iface
    }

    fn layout(&self) -> &FlashLayout {
        &self.layout
    }

    fn keystore(&self) -> &Keystore<'_> {
        &self.keystore
    }

    fn rollback_counter(&self) -> Option<&dyn MonotonicCounter> {
        self.counter
    }

    fn update(&self, rollback: bool) -> Result<()> {
        self.iface.hal_flash_unlock();
        let res = self.exchange(rollback);
        self.iface.hal_flash_lock();
        res
    }
}
