use crate::crypto::SignatureAlg;

// **** TARGET PLATFORM - FLASH PARTITIONING ****

pub const SECTOR_SIZE: usize = 4096;
pub const PARTITION_SIZE: usize = 0x20000;

pub const BOOT_PARTITION_ADDRESS: usize = 0x08000;
pub const UPDATE_PARTITION_ADDRESS: usize = 0x28000;
pub const SWAP_PARTITION_ADDRESS: usize = 0x48000;

// **** vaultboot constants ****

pub const IMAGE_HEADER_SIZE: usize = 0x100;
pub const IMAGE_HEADER_OFFSET: usize = 0x8;

pub const HDR_VERSION: u16 = 0x0001;
pub const HDR_VERSION_LEN: usize = 0x4;
pub const HDR_TIMESTAMP: u16 = 0x0002;
pub const HDR_TIMESTAMP_LEN: usize = 0x8;
pub const HDR_SHA256: u16 = 0x0003;
pub const HDR_IMG_TYPE: u16 = 0x0004;
pub const HDR_IMG_TYPE_LEN: usize = 0x2;
pub const HDR_DELTA_BASE: u16 = 0x0005;
pub const HDR_DEVICE_ID: u16 = 0x0008;
pub const HDR_PUBKEY_HINT: u16 = 0x0010;
pub const HDR_SHA384: u16 = 0x0013;
pub const HDR_SHA3_384: u16 = 0x0014;
pub const HDR_SIGNATURE: u16 = 0x0020;
pub const HDR_SECONDARY_SIGNATURE: u16 = 0x0021;
pub const HDR_PADDING: u8 = 0xFF;

/// A tag with the high bit set must be understood; skipping it is an error.
pub const HDR_TAG_CRITICAL: u16 = 0x8000;
/// Reading this tag at a TLV boundary terminates the header. Erased flash
/// past the last TLV decodes to it, so trailing 0xFF padding is always
/// acceptable.
pub const HDR_TAG_END: u16 = 0xFFFF;

pub const HDR_MASK_LOWBYTE: u16 = 0x00FF;
pub const HDR_MASK_HIGHBYTE: u16 = 0xFF00;

/// `IMAGE_TYPE` high-byte flags. The low byte selects the signature
/// algorithm, see [`SignatureAlg`].
pub const IMG_TYPE_DELTA: u16 = 0x1000;
pub const IMG_TYPE_ENCRYPTED: u16 = 0x2000;
pub const IMG_TYPE_HYBRID: u16 = 0x4000;

pub const VAULTBOOT_MAGIC: u32 = 0x544C4256; // b"VBLT"
pub const VAULTBOOT_MAGIC_TRAIL: u32 = 0x52544256; // b"VBTR"
pub const VAULTBOOT_MAGIC_SCRATCH: u32 = 0x57534256; // b"VBSW"

// Partition trailer states. Transitions only ever clear bits, so they can
// be programmed over each other without an erase.
pub const STATE_NEW: u8 = 0xFF;
pub const STATE_UPDATING: u8 = 0x70;
pub const STATE_TESTING: u8 = 0x10;
pub const STATE_SUCCESS: u8 = 0x00;

// Per-sector swap flags, one nibble each, same monotonicity rule.
pub const SECT_FLAG_NEW: u8 = 0x0F;
pub const SECT_FLAG_SWAPPING: u8 = 0x07;
pub const SECT_FLAG_BACKUP: u8 = 0x03;
pub const SECT_FLAG_UPDATED: u8 = 0x00;

pub const PART_STATUS_LEN: usize = 1;
pub const MAGIC_TRAIL_LEN: usize = 4;

// Scratch sector header, see the swap engine.
pub const SCRATCH_HEADER_SIZE: usize = 16;
pub const SCRATCH_SRC_OFFSET: usize = 4;
pub const SCRATCH_INDEX_OFFSET: usize = 8;

/*  Hash Config */

// SHA256 constants
pub const SHA256_DIGEST_SIZE: usize = 32;
// SHA384 constants
pub const SHA384_DIGEST_SIZE: usize = 48;

#[cfg(feature = "sha256")]
pub const HDR_DIGEST: u16 = HDR_SHA256;
#[cfg(feature = "sha384")]
pub const HDR_DIGEST: u16 = HDR_SHA384;
#[cfg(feature = "sha3-384")]
pub const HDR_DIGEST: u16 = HDR_SHA3_384;

#[cfg(feature = "sha256")]
pub const IMAGE_DIGEST_SIZE: usize = SHA256_DIGEST_SIZE;
#[cfg(any(feature = "sha384", feature = "sha3-384"))]
pub const IMAGE_DIGEST_SIZE: usize = SHA384_DIGEST_SIZE;

/// The public-key hint is a digest of the raw key under the image hash.
pub const PUBKEY_DIGEST_SIZE: usize = IMAGE_DIGEST_SIZE;

// Copy-loop block size for flash-to-flash moves.
pub const FLASHBUFFER_SIZE: usize = 0x100;

/// Transient flash failures are retried this many times, then treated as
/// fatal.
pub const FLASH_RETRY_LIMIT: usize = 3;

/* Signature Config */
pub const ECC_SIGNATURE_SIZE: usize = 64;

/// Where the trailer bytes live relative to the partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrailerMode {
    /// Trailer shares the last data sector. Recognized for images produced
    /// by other tools; the swap engine requires `DedicatedSector`.
    Inline,
    /// The last sector of the partition belongs to the trailer alone, so
    /// flag updates can never corrupt payload data.
    DedicatedSector,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateMode {
    /// Three-way exchange through the scratch sector; power-fail safe with
    /// automatic rollback.
    Swap,
    /// In-place UPDATE → BOOT copy. Restartable but without rollback.
    Direct,
    /// Hardware-assisted bank exchange; handled by the dual-bank updater,
    /// never by the generic engine.
    DualbankHwSwap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encryption {
    None,
    AesCtr,
    ChaCha20,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlg {
    Sha256,
    Sha384,
    Sha3_384,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AntiRollback {
    Off,
    OtpCounter,
    LockedSector,
}

/// Build-time bootloader configuration, one value per recognized option.
#[derive(Debug, Clone, Copy)]
pub struct BootConfig {
    pub trailer_mode: TrailerMode,
    pub update_mode: UpdateMode,
    pub encryption: Encryption,
    pub signature_alg: SignatureAlg,
    pub hash_alg: HashAlg,
    pub keystore_size: usize,
    pub anti_rollback: AntiRollback,
    pub delta_updates: bool,
    pub hybrid_signing: bool,
}

pub const DEFAULT_CONFIG: BootConfig = BootConfig {
    trailer_mode: TrailerMode::DedicatedSector,
    update_mode: UpdateMode::Swap,
    encryption: Encryption::None,
    signature_alg: SignatureAlg::EcdsaP256,
    hash_alg: HashAlg::Sha256,
    keystore_size: 1,
    anti_rollback: AntiRollback::Off,
    delta_updates: true,
    hybrid_signing: false,
};

/// Flash geometry of the three bootloader regions.
///
/// BOOT and UPDATE are `partition_size` bytes each and end in a dedicated
/// trailer sector; the swap scratch spans two sectors (16-byte header plus
/// one sector of staged payload).
#[derive(Debug, Clone, Copy)]
pub struct FlashLayout {
    pub boot_base: usize,
    pub update_base: usize,
    pub swap_base: usize,
    pub partition_size: usize,
    pub sector_size: usize,
}

impl FlashLayout {
    /// Bytes of a partition that hold image data, i.e. everything except
    /// the trailer sector.
    pub const fn body_size(&self) -> usize {
        self.partition_size - self.sector_size
    }

    pub const fn num_body_sectors(&self) -> usize {
        self.body_size() / self.sector_size
    }

    pub const fn max_image_size(&self) -> usize {
        self.body_size() - IMAGE_HEADER_SIZE
    }

    pub const fn boot_fw_base(&self) -> usize {
        self.boot_base + IMAGE_HEADER_SIZE
    }

    pub const fn scratch_size(&self) -> usize {
        2 * self.sector_size
    }

    /// Address of the staged payload inside the scratch region.
    pub const fn scratch_payload_base(&self) -> usize {
        self.swap_base + SCRATCH_HEADER_SIZE
    }
}

pub const DEFAULT_LAYOUT: FlashLayout = FlashLayout {
    boot_base: BOOT_PARTITION_ADDRESS,
    update_base: UPDATE_PARTITION_ADDRESS,
    swap_base: SWAP_PARTITION_ADDRESS,
    partition_size: PARTITION_SIZE,
    sector_size: SECTOR_SIZE,
};
