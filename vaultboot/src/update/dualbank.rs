//! Hardware-assisted exchange for flash controllers with remappable
//! banks.
//!
//! Where the part offers an atomic bank swap, the whole sector-by-sector
//! engine collapses into one HAL call: BOOT and UPDATE exchange roles,
//! trailers travelling with their banks. This is a separate
//! [`UpdateInterface`] implementation, never a branch inside the generic
//! engine; rollback is another bank swap.

use vaultboot_hal::{DualbankFlash, MonotonicCounter};

use super::UpdateInterface;
use crate::constants::*;
use crate::image::image::open_image_at;
use crate::keystore::Keystore;
use crate::trailer;
use crate::Result;

pub struct DualbankUpdater<'k, I: DualbankFlash> {
    iface: I,
    layout: FlashLayout,
    keystore: Keystore<'k>,
    counter: Option<&'k dyn MonotonicCounter>,
}

impl<'k, I: DualbankFlash> DualbankUpdater<'k, I> {
    pub fn new(iface: I, layout: FlashLayout, keystore: Keystore<'k>) -> Self {
        DualbankUpdater {
            iface,
            layout,
            keystore,
            counter: None,
        }
    }

    pub fn with_rollback_counter(mut self, counter: &'k dyn MonotonicCounter) -> Self {
        self.counter = Some(counter);
        self
    }

    fn bank_exchange(&self, rollback: bool) -> Result<()> {
        let iface = &self.iface;
        let layout = &self.layout;

        if !rollback {
            // Nothing swaps until the candidate at least parses.
            if let Err(e) = open_image_at(iface, layout.update_base, layout.body_size()) {
                let _ =
                    trailer::write_state(iface, layout, layout.update_base, STATE_SUCCESS);
                return Err(e);
            }
        }

        iface.hal_flash_dualbank_swap()?;

        // The trailers moved with their banks: the new BOOT carries the
        // candidate's `updating` marker (or, on rollback, the previous
        // firmware's confirmation), the new UPDATE carries the displaced
        // one. Both are settled monotonically.
        let state = if rollback { STATE_SUCCESS } else { STATE_TESTING };
        trailer::write_state(iface, layout, layout.boot_base, state)?;
        trailer::write_state(iface, layout, layout.update_base, STATE_SUCCESS)?;
        info!("bank exchange complete");
        Ok(())
    }
}

impl<'k, I: DualbankFlash> UpdateInterface for DualbankUpdater<'k, I> {
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
        let res = self.bank_exchange(rollback);
        self.iface.hal_flash_lock();
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::image::PartId;
    use crate::testutil::{self, TEST_LAYOUT};
    use vaultboot_hal::mock::MockFlash;
    use vaultboot_hal::{FlashError, FlashInterface};

    /// Bank-remap model over the mock: a swap exchanges the two partition
    /// address windows, the way a controller remaps its banks.
    struct BankFlash<'a>(&'a MockFlash);

    impl<'a> FlashInterface for BankFlash<'a> {
        const WRITE_SIZE: usize = MockFlash::WRITE_SIZE;

        fn hal_flash_read(&self, addr: usize, buf: &mut [u8]) {
            self.0.hal_flash_read(addr, buf)
        }
        fn hal_flash_write(&self, addr: usize, data: &[u8]) -> core::result::Result<(), FlashError> {
            self.0.hal_flash_write(addr, data)
        }
        fn hal_flash_erase(&self, addr: usize, len: usize) -> core::result::Result<(), FlashError> {
            self.0.hal_flash_erase(addr, len)
        }
        fn hal_flash_unlock(&self) {
            self.0.hal_flash_unlock()
        }
        fn hal_flash_lock(&self) {
            self.0.hal_flash_lock()
        }
    }

    impl<'a> DualbankFlash for BankFlash<'a> {
        fn hal_flash_dualbank_swap(&self) -> core::result::Result<(), FlashError> {
            let boot = self
                .0
                .contents(TEST_LAYOUT.boot_base, TEST_LAYOUT.partition_size);
            let updt = self
                .0
                .contents(TEST_LAYOUT.update_base, TEST_LAYOUT.partition_size);
            self.0.load(TEST_LAYOUT.boot_base, &updt);
            self.0.load(TEST_LAYOUT.update_base, &boot);
            Ok(())
        }
    }

    #[test]
    fn bank_swap_updates_and_rolls_back() {
        let sk = testutil::signing_key();
        let pubkey = testutil::raw_pubkey(&sk);
        let v1 = testutil::build_image(
            &testutil::payload(2000, 1),
            1,
            &sk,
            testutil::DEFAULT_IMG_TYPE,
        );
        let v2 = testutil::build_image(
            &testutil::payload(2500, 2),
            2,
            &sk,
            testutil::DEFAULT_IMG_TYPE,
        );
        let flash = testutil::empty_flash();
        flash.load(TEST_LAYOUT.boot_base, &v1);
        testutil::set_state(&flash, TEST_LAYOUT.boot_base, STATE_SUCCESS);
        flash.load(TEST_LAYOUT.update_base, &v2);

        let entries = [testutil::p256_entry(&pubkey)];
        let keystore = Keystore::new(&entries);
        let bank = BankFlash(&flash);
        let updater = DualbankUpdater::new(bank, TEST_LAYOUT, keystore);

        updater.update_trigger().unwrap();
        updater.prepare_boot().unwrap();
        assert_eq!(flash.contents(TEST_LAYOUT.boot_base, v2.len()), v2);
        assert_eq!(updater.get_partition_state(PartId::PartBoot), STATE_TESTING);

        // Unconfirmed: the next reset swaps the banks back.
        updater.prepare_boot().unwrap();
        assert_eq!(flash.contents(TEST_LAYOUT.boot_base, v1.len()), v1);
        assert_eq!(updater.get_partition_state(PartId::PartBoot), STATE_SUCCESS);
        assert_eq!(updater.current_firmware_version().unwrap(), 1);
    }
}
