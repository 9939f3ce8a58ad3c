pub mod delta;
pub mod dualbank;
pub mod update_flash;

use vaultboot_hal::{BootInterface, FlashInterface, MonotonicCounter};

use crate::constants::*;
use crate::image::image::{open_image_at, Boot, ImageType, PartDescriptor, PartId};
use crate::keystore::Keystore;
use crate::trailer;
use crate::{Result, VaultbootError};

pub use update_flash::{FlashUpdater, UpdateKey};

/// The exchange engine plus the application-facing update API, implemented
/// by [`FlashUpdater`] (generic sector swap) and by the dual-bank updater
/// (hardware-assisted bank exchange). The boot policy and the state
/// plumbing are shared default methods over the engine's `update`.
pub trait UpdateInterface {
    type Flash: FlashInterface;

    fn flash(&self) -> &Self::Flash;
    fn layout(&self) -> &FlashLayout;
    fn keystore(&self) -> &Keystore<'_>;

    /// Anti-rollback floor, when the target carries one.
    fn rollback_counter(&self) -> Option<&dyn MonotonicCounter> {
        None
    }

    /// Runs or resumes the exchange. With `rollback` the engine restores
    /// the previous firmware from the UPDATE partition's backup.
    fn update(&self, rollback: bool) -> Result<()>;

    /// Marks the UPDATE partition for installation on the next reset.
    /// Idempotent. Stale trailer bytes from a consumed update are erased
    /// through the trailer-reset path.
    fn update_trigger(&self) -> Result<()> {
        let iface = self.flash();
        let layout = self.layout();
        iface.hal_flash_unlock();
        let res = match trailer::write_state(iface, layout, layout.update_base, STATE_UPDATING) {
            Err(VaultbootError::NeedsErase) => {
                trailer::reset_trailer(iface, layout, layout.update_base, Some(STATE_UPDATING))
            }
            other => other,
        };
        iface.hal_flash_lock();
        res
    }

    /// Confirms the running firmware: BOOT leaves `testing` for `success`
    /// and the anti-rollback counter advances to its version. Idempotent.
    fn update_success(&self) -> Result<()> {
        let iface = self.flash();
        let layout = self.layout();
        iface.hal_flash_unlock();
        let res = trailer::write_state(iface, layout, layout.boot_base, STATE_SUCCESS);
        iface.hal_flash_lock();
        res?;
        if let Some(counter) = self.rollback_counter() {
            let version = self.current_firmware_version()?;
            counter.advance(version)?;
        }
        Ok(())
    }

    fn current_firmware_version(&self) -> Result<u32> {
        let layout = self.layout();
        open_image_at(self.flash(), layout.boot_base, layout.body_size())?.firmware_version()
    }

    /// `VERSION` of the update candidate, or 0 when UPDATE holds no valid
    /// container magic.
    fn update_firmware_version(&self) -> Result<u32> {
        let layout = self.layout();
        match open_image_at(self.flash(), layout.update_base, layout.body_size()) {
            Ok(img) => img.firmware_version(),
            Err(VaultbootError::BadMagic) => Ok(0),
            Err(e) => Err(e),
        }
    }

    /// Raw trailer state byte; `STATE_NEW` when the trailer magic is
    /// absent. The SWAP scratch carries no state.
    fn get_partition_state(&self, part: PartId) -> u8 {
        let layout = self.layout();
        let base = match part {
            PartId::PartBoot => layout.boot_base,
            PartId::PartUpdate => layout.update_base,
            PartId::PartSwap => return STATE_NEW,
        };
        trailer::read_state(self.flash(), layout, base).0
    }

    fn erase_partition(&self, part: PartId) -> Result<()> {
        let iface = self.flash();
        let layout = self.layout();
        let (base, len) = match part {
            PartId::PartBoot => (layout.boot_base, layout.partition_size),
            PartId::PartUpdate => (layout.update_base, layout.partition_size),
            PartId::PartSwap => (layout.swap_base, layout.scratch_size()),
        };
        iface.hal_flash_unlock();
        let res = crate::flashapi::erase_with_retry(iface, base, len);
        iface.hal_flash_lock();
        res
    }

    /// The per-reset boot policy: finish or roll back a pending exchange,
    /// then verify BOOT and hand back its entry address. A verification
    /// failure falls back to the backup in UPDATE; with that exhausted the
    /// error propagates and the caller halts.
    fn prepare_boot(&self) -> Result<usize> {
        let iface = self.flash();
        let layout = self.layout();
        iface.hal_init();

        let (boot_state, _) = trailer::read_state(iface, layout, layout.boot_base);
        let (updt_state, _) = trailer::read_state(iface, layout, layout.update_base);

        if boot_state == STATE_TESTING {
            // The swapped-in image never confirmed itself; put the old one
            // back.
            info!("boot image unconfirmed, restoring previous firmware");
            if self.update(true).is_err() {
                warn!("restore not possible, keeping the testing image");
            }
        } else if updt_state == STATE_UPDATING {
            info!("update pending, running the exchange");
            if self.update(false).is_err() {
                warn!("update aborted");
            }
        }

        match verify_boot(iface, layout, self.keystore(), self.rollback_counter()) {
            Ok(addr) => Ok(addr),
            Err(_) => {
                error!("boot image rejected, attempting restore from backup");
                self.update(true)?;
                verify_boot(iface, layout, self.keystore(), self.rollback_counter())
            }
        }
    }
}

/// Full verification chain for the BOOT candidate: open, integrity,
/// authenticity, anti-rollback floor.
fn verify_boot<I: FlashInterface>(
    iface: &I,
    layout: &FlashLayout,
    keystore: &Keystore<'_>,
    counter: Option<&dyn MonotonicCounter>,
) -> Result<usize> {
    let mut part_desc = match PartDescriptor::open_partition(iface, layout, Boot)? {
        ImageType::BootInNewState(img) => img.part_desc,
        ImageType::BootInTestingState(img) => img.part_desc,
        ImageType::BootInSuccessState(img) => img.part_desc,
        _ => return Err(VaultbootError::InvalidState),
    };
    part_desc.verify_integrity(iface)?;
    part_desc.verify_authenticity(iface, keystore)?;
    if let Some(counter) = counter {
        if part_desc.firmware_version()? < counter.read() {
            return Err(VaultbootError::VersionRollback);
        }
    }
    Ok(layout.boot_fw_base())
}

/// Runs the boot policy and transfers control to the verified firmware;
/// enters the halt loop when every option is exhausted.
pub fn vaultboot_start<U: UpdateInterface, B: BootInterface>(updater: &U, boot: &B) -> ! {
    match updater.prepare_boot() {
        Ok(addr) => {
            boot.preboot();
            boot.boot_from(addr)
        }
        Err(_) => halt(),
    }
}

/// Defined failure loop. A configured watchdog resets the target out of
/// it; otherwise it spins.
pub fn halt() -> ! {
    loop {
        core::hint::spin_loop();
    }
}
