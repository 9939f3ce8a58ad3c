use super::sealed::Sealed;
use crate::constants::*;
use crate::crypto::signatures::verify_image_signature;
use crate::crypto::{constant_time_eq, ImageHash, SignatureAlg};
use crate::keystore::Keystore;
use crate::parser::{parse_tlv, tlv_offset, Tags};
use crate::trailer;
use crate::{Result, VaultbootError};

use byteorder::{ByteOrder, LittleEndian};
use core::convert::TryInto;
use sha2::Digest;
use vaultboot_hal::FlashInterface;

pub enum States {
    New(StateNew),
    Updating(StateUpdating),
    Testing(StateTesting),
    Success(StateSuccess),
    NoState(NoState),
}

/// All valid partition states implement this trait.
pub trait TypeState: Sealed {
    fn as_byte(&self) -> Option<u8>;
}

/// Any state implementing this marker trait participates in an exchange:
/// - [`StateTesting`] - if the boot partition is still marked `testing`
///   after an update, a roll-back is triggered
/// - [`StateUpdating`] - if the update partition holds a downloaded image
///   and is marked `updating`, an update is triggered
pub trait Updateable: Sealed + TypeState {}

/// An image that has not been staged for boot or triggered for an update.
#[derive(Debug)]
pub struct StateNew;
impl TypeState for StateNew {
    fn as_byte(&self) -> Option<u8> {
        Some(STATE_NEW)
    }
}

/// Only valid in the `UPDATE` partition: the image is marked for update
/// and should replace the current image in `BOOT` on the next reset.
#[derive(Debug)]
pub struct StateUpdating;
impl TypeState for StateUpdating {
    fn as_byte(&self) -> Option<u8> {
        Some(STATE_UPDATING)
    }
}
impl Updateable for StateUpdating {}

/// Only valid in the `BOOT` partition: the image was just swapped in and
/// is pending confirmation. If still present after a reset, the updated
/// image failed to prove itself and a rollback is triggered.
#[derive(Debug)]
pub struct StateTesting;
impl TypeState for StateTesting {
    fn as_byte(&self) -> Option<u8> {
        Some(STATE_TESTING)
    }
}
impl Updateable for StateTesting {}

/// Only valid in the `BOOT` partition: the running firmware confirmed
/// itself at least once; the update is complete.
#[derive(Debug)]
pub struct StateSuccess;
impl TypeState for StateSuccess {
    fn as_byte(&self) -> Option<u8> {
        Some(STATE_SUCCESS)
    }
}

/// The `SWAP` scratch region carries no state field and needs none.
#[derive(Debug)]
pub struct NoState;
impl TypeState for NoState {
    fn as_byte(&self) -> Option<u8> {
        None
    }
}

/// All valid partitions implement `ValidPart`, which allows us to
/// enumerate a valid partition.
pub trait ValidPart: Sealed {
    fn part_id(&self) -> PartId;
}
/// A marker trait to indicate which partitions are swappable.
pub trait Swappable: Sealed + ValidPart {}

/// Enumerated partitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartId {
    PartBoot,
    PartUpdate,
    PartSwap,
}

impl PartId {
    /// The wire encoding used in the scratch header.
    pub(crate) fn as_u16(self) -> u16 {
        match self {
            PartId::PartBoot => 0,
            PartId::PartUpdate => 1,
            PartId::PartSwap => 2,
        }
    }
}

/// A zero-sized struct to represent the `BOOT` image/partition.
#[derive(Debug, PartialEq, Eq)]
pub struct Boot;
impl Swappable for Boot {}
impl ValidPart for Boot {
    fn part_id(&self) -> PartId {
        PartId::PartBoot
    }
}

/// A zero-sized struct to represent the `UPDATE` image/partition.
#[derive(Debug, PartialEq, Eq)]
pub struct Update;
impl Swappable for Update {}
impl ValidPart for Update {
    fn part_id(&self) -> PartId {
        PartId::PartUpdate
    }
}

/// A zero-sized struct to represent the `SWAP` scratch region.
#[derive(Debug, PartialEq, Eq)]
pub struct Swap;
impl ValidPart for Swap {
    fn part_id(&self) -> PartId {
        PartId::PartSwap
    }
}

/// A typed view of one partition: its base address, an owned copy of the
/// image header, and the verification progress. All header access is a
/// bounds-checked slice walk over the copy; payload bytes are streamed
/// from flash on demand.
#[derive(Debug)]
pub struct PartDescriptor<Part: ValidPart> {
    pub base: usize,
    pub hdr: [u8; IMAGE_HEADER_SIZE],
    pub fw_size: usize,
    pub hdr_ok: bool,
    sha_ok: bool,
    signature_ok: bool,
    pub part: Part,
}

/// Reads and structurally validates the fixed image prefix of a
/// partition: container magic and a payload size that fits the body.
pub(crate) fn read_image_header<I: FlashInterface>(
    iface: &I,
    layout: &FlashLayout,
    base: usize,
) -> Result<([u8; IMAGE_HEADER_SIZE], usize)> {
    read_header_with_capacity(iface, base, layout.max_image_size())
}

fn read_header_with_capacity<I: FlashInterface>(
    iface: &I,
    base: usize,
    capacity: usize,
) -> Result<([u8; IMAGE_HEADER_SIZE], usize)> {
    let mut hdr = [0xFFu8; IMAGE_HEADER_SIZE];
    iface.hal_flash_read(base, &mut hdr);
    let magic = LittleEndian::read_u32(&hdr[..4]);
    if magic != VAULTBOOT_MAGIC {
        return Err(VaultbootError::BadMagic);
    }
    let fw_size = LittleEndian::read_u32(&hdr[4..8]) as usize;
    if fw_size == 0 || fw_size > capacity {
        return Err(VaultbootError::BadHeader);
    }
    Ok((hdr, fw_size))
}

/// Loader-style open that bypasses the partition role lookup: parses an
/// image at an arbitrary flash address with `capacity` bytes available
/// (header included).
pub fn open_image_at<I: FlashInterface>(
    iface: &I,
    addr: usize,
    capacity: usize,
) -> Result<PartDescriptor<Boot>> {
    if capacity <= IMAGE_HEADER_SIZE {
        return Err(VaultbootError::BadHeader);
    }
    let (hdr, fw_size) = read_header_with_capacity(iface, addr, capacity - IMAGE_HEADER_SIZE)?;
    Ok(PartDescriptor {
        base: addr,
        hdr,
        fw_size,
        hdr_ok: true,
        sha_ok: false,
        signature_ok: false,
        part: Boot,
    })
}

fn part_status<I: FlashInterface>(iface: &I, layout: &FlashLayout, base: usize) -> Result<States> {
    let (state, _trailer_valid) = trailer::read_state(iface, layout, base);
    match state {
        STATE_NEW => Ok(States::New(StateNew)),
        STATE_UPDATING => Ok(States::Updating(StateUpdating)),
        STATE_TESTING => Ok(States::Testing(StateTesting)),
        STATE_SUCCESS => Ok(States::Success(StateSuccess)),
        _ => Err(VaultbootError::InvalidState),
    }
}

impl<Part: ValidPart> PartDescriptor<Part> {
    /// Open a partition of type `BOOT` or `UPDATE` or `SWAP`.
    ///
    /// This is the exclusive constructor for partition images, i.e. the
    /// only way to create [`VaultbootImage`] instances.
    pub fn open_partition<I: FlashInterface>(
        iface: &I,
        layout: &FlashLayout,
        part: Part,
    ) -> Result<ImageType> {
        match part.part_id() {
            PartId::PartBoot => {
                let (hdr, fw_size) = read_image_header(iface, layout, layout.boot_base)?;
                let part_desc = PartDescriptor {
                    base: layout.boot_base,
                    hdr,
                    fw_size,
                    hdr_ok: true,
                    sha_ok: false,
                    signature_ok: false,
                    part: Boot,
                };
                match part_status(iface, layout, layout.boot_base)? {
                    States::New(state) => Ok(ImageType::BootInNewState(VaultbootImage {
                        part_desc,
                        state,
                    })),
                    States::Testing(state) => Ok(ImageType::BootInTestingState(VaultbootImage {
                        part_desc,
                        state,
                    })),
                    States::Success(state) => Ok(ImageType::BootInSuccessState(VaultbootImage {
                        part_desc,
                        state,
                    })),
                    _ => Err(VaultbootError::InvalidState),
                }
            }
            PartId::PartUpdate => {
                let (hdr, fw_size) = read_image_header(iface, layout, layout.update_base)?;
                let part_desc = PartDescriptor {
                    base: layout.update_base,
                    hdr,
                    fw_size,
                    hdr_ok: true,
                    sha_ok: false,
                    signature_ok: false,
                    part: Update,
                };
                match part_status(iface, layout, layout.update_base)? {
                    States::New(state) => Ok(ImageType::UpdateInNewState(VaultbootImage {
                        part_desc,
                        state,
                    })),
                    States::Updating(state) => {
                        Ok(ImageType::UpdateInUpdatingState(VaultbootImage {
                            part_desc,
                            state,
                        }))
                    }
                    _ => Err(VaultbootError::InvalidState),
                }
            }
            PartId::PartSwap => {
                let part_desc = PartDescriptor {
                    base: layout.swap_base,
                    hdr: [0xFF; IMAGE_HEADER_SIZE],
                    fw_size: layout.sector_size,
                    hdr_ok: false,
                    sha_ok: false,
                    signature_ok: false,
                    part: Swap,
                };
                Ok(ImageType::NoStateSwap(VaultbootImage {
                    part_desc,
                    state: NoState,
                }))
            }
        }
    }
}

impl<Part: ValidPart + Swappable> PartDescriptor<Part> {
    pub fn get_tlv(&self, tag: Tags) -> Result<&[u8]> {
        parse_tlv(&self.hdr, tag)
    }

    pub fn firmware_version(&self) -> Result<u32> {
        let val = self.get_tlv(Tags::Version)?;
        Ok(u32::from_be_bytes(
            val.try_into().map_err(|_| VaultbootError::InvalidValue)?,
        ))
    }

    pub fn timestamp(&self) -> Result<u64> {
        let val = self.get_tlv(Tags::TimeStamp)?;
        Ok(u64::from_le_bytes(
            val.try_into().map_err(|_| VaultbootError::InvalidValue)?,
        ))
    }

    pub fn image_type(&self) -> Result<u16> {
        let val = self.get_tlv(Tags::ImgType)?;
        let bytes: [u8; HDR_IMG_TYPE_LEN] =
            val.try_into().map_err(|_| VaultbootError::InvalidValue)?;
        Ok(u16::from_le_bytes(bytes))
    }

    /// Verifies the integrity of the image: streams the header up to the
    /// digest TLV followed by the payload through the hash and compares
    /// against the stored digest in constant time.
    pub fn verify_integrity<I: FlashInterface>(&mut self, iface: &I) -> Result<()> {
        let stored = self.get_tlv(Tags::Digest)?;
        if stored.len() != IMAGE_DIGEST_SIZE {
            return Err(VaultbootError::InvalidValue);
        }
        let hasher = compute_img_hash(iface, &self.hdr, self.base, self.fw_size)?;
        let computed = hasher.finalize();
        if !constant_time_eq(&computed, stored) {
            return Err(VaultbootError::HashMismatch);
        }
        self.sha_ok = true;
        Ok(())
    }

    /// Authenticates the image against the keystore: locates the entry
    /// matching the public-key hint, checks its permission mask against
    /// the image type, and verifies the signature (both signatures for a
    /// hybrid-signed image).
    ///
    /// [`Self::verify_integrity`] must have succeeded first; the stored
    /// digest is untrusted until then.
    pub fn verify_authenticity<I: FlashInterface>(
        &mut self,
        iface: &I,
        keystore: &Keystore<'_>,
    ) -> Result<()> {
        if !self.sha_ok {
            return Err(VaultbootError::InvalidState);
        }
        let img_type = self.image_type()?;
        let alg = SignatureAlg::from_id((img_type & HDR_MASK_LOWBYTE) as u8)
            .ok_or(VaultbootError::UnsupportedAlgorithm)?;

        let hint = self.get_tlv(Tags::PubkeyHint)?;
        let (primary_idx, entry) = keystore
            .find_by_hint(hint)
            .ok_or(VaultbootError::NoTrustedKey)?;
        if entry.alg != alg || entry.permission_mask & alg.permission_bit() == 0 {
            return Err(VaultbootError::PermissionDenied);
        }

        let signature = self.get_tlv(Tags::Signature)?;
        let hasher = compute_img_hash(iface, &self.hdr, self.base, self.fw_size)?;
        verify_image_signature(alg, entry.pubkey, hasher, signature)?;

        if img_type & IMG_TYPE_HYBRID != 0 {
            let secondary = keystore
                .find_secondary(primary_idx)
                .ok_or(VaultbootError::NoTrustedKey)?;
            let second_sig = self.get_tlv(Tags::SecondarySignature)?;
            let hasher = compute_img_hash(iface, &self.hdr, self.base, self.fw_size)?;
            verify_image_signature(secondary.alg, secondary.pubkey, hasher, second_sig)?;
        }

        self.signature_ok = true;
        Ok(())
    }
}

/// Computes the hash of the image in a partition. Returns the pre-updated
/// [`Digest`] instance rather than a raw digest value, so signature
/// verification can consume it directly.
///
/// Covers the header up to (but not including) the digest TLV, then the
/// payload, streamed from flash in [`FLASHBUFFER_SIZE`] blocks with the
/// watchdog serviced between blocks.
fn compute_img_hash<I: FlashInterface>(
    iface: &I,
    hdr: &[u8],
    base: usize,
    fw_size: usize,
) -> Result<ImageHash> {
    let digest_offset = tlv_offset(hdr, Tags::Digest)?;
    let mut hasher = ImageHash::new();
    hasher.update(&hdr[..digest_offset]);

    let mut buf = [0u8; FLASHBUFFER_SIZE];
    let mut pos = 0;
    while pos < fw_size {
        let n = core::cmp::min(FLASHBUFFER_SIZE, fw_size - pos);
        iface.hal_flash_read(base + IMAGE_HEADER_SIZE + pos, &mut buf[..n]);
        hasher.update(&buf[..n]);
        iface.hal_watchdog_feed();
        pos += n;
    }
    Ok(hasher)
}

/// A struct describing the layout and contents of a given partition. The
/// two generic type parameters indicate `partition type` and `partition
/// state`.
#[derive(Debug)]
pub struct VaultbootImage<Part: ValidPart, State: TypeState> {
    pub part_desc: PartDescriptor<Part>,
    state: State,
}

/// An enum holding all valid (i.e. legal) image-types, one variant per
/// reachable `partition-state` combination.
#[derive(Debug)]
pub enum ImageType {
    BootInNewState(VaultbootImage<Boot, StateNew>),
    UpdateInNewState(VaultbootImage<Update, StateNew>),
    NoStateSwap(VaultbootImage<Swap, NoState>),
    UpdateInUpdatingState(VaultbootImage<Update, StateUpdating>),
    BootInTestingState(VaultbootImage<Boot, StateTesting>),
    BootInSuccessState(VaultbootImage<Boot, StateSuccess>),
}

impl<Part: ValidPart + Swappable, State: TypeState> VaultbootImage<Part, State> {
    pub fn get_state(&self) -> &State {
        &self.state
    }

    pub fn get_firmware_version(&self) -> Result<u32> {
        self.part_desc.firmware_version()
    }

    pub fn get_image_type(&self) -> Result<u16> {
        self.part_desc.image_type()
    }

    pub fn verify_integrity<I: FlashInterface>(&mut self, iface: &I) -> Result<()> {
        self.part_desc.verify_integrity(iface)
    }

    pub fn verify_authenticity<I: FlashInterface>(
        &mut self,
        iface: &I,
        keystore: &Keystore<'_>,
    ) -> Result<()> {
        self.part_desc.verify_authenticity(iface, keystore)
    }
}
