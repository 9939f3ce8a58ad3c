//! Shared fixtures for the hosted tests: a deterministic signing key, an
//! in-memory image builder that mirrors the host signing tool, and mock
//! flash setup helpers.

use crate::constants::*;
use crate::crypto::{key_hint, SignatureAlg};
use crate::keystore::KeystoreEntry;

use byteorder::{ByteOrder, LittleEndian};
use p256::ecdsa::{signature::DigestSigner, Signature, SigningKey};
use sha2::{Digest, Sha256};
use vaultboot_hal::mock::MockFlash;

/// Small geometry so the power-cut sweeps stay fast: four 4 KiB sectors
/// per partition (three body sectors plus the trailer sector).
pub const TEST_LAYOUT: FlashLayout = FlashLayout {
    boot_base: 0x0000,
    update_base: 0x4000,
    swap_base: 0x8000,
    partition_size: 0x4000,
    sector_size: 0x1000,
};

pub const TEST_FLASH_SIZE: usize = 0xA000;

/// Plain application image signed with ECDSA P-256.
pub const DEFAULT_IMG_TYPE: u16 = SignatureAlg::EcdsaP256 as u8 as u16;

const TEST_SK_BYTES: [u8; 32] = [
    0x1a, 0x41, 0x5e, 0x09, 0xc7, 0x8c, 0x2f, 0xd4, 0xb3, 0x2e, 0x95, 0x60, 0x7b, 0x21, 0x8f,
    0x4d, 0xe6, 0x0a, 0xd3, 0x37, 0x5c, 0x88, 0x16, 0xf2, 0x9b, 0x44, 0xa1, 0x73, 0x0e, 0xc5,
    0x52, 0x6d,
];

const SECOND_SK_BYTES: [u8; 32] = [
    0x2f, 0x90, 0x13, 0xa8, 0x55, 0xe4, 0xc1, 0x7e, 0x08, 0xbd, 0x62, 0x3b, 0x97, 0x40, 0xd9,
    0x2a, 0x71, 0xcc, 0x05, 0x8e, 0x36, 0xf1, 0xaa, 0x19, 0x64, 0x0b, 0xd2, 0x47, 0x83, 0x5f,
    0x28, 0xb6,
];

pub fn signing_key() -> SigningKey {
    SigningKey::from_bytes(&TEST_SK_BYTES).unwrap()
}

pub fn second_signing_key() -> SigningKey {
    SigningKey::from_bytes(&SECOND_SK_BYTES).unwrap()
}

/// Untagged SEC1 point bytes, the keystore's key material format.
pub fn raw_pubkey(sk: &SigningKey) -> [u8; 64] {
    let point = sk.verifying_key().to_encoded_point(false);
    let mut out = [0u8; 64];
    out.copy_from_slice(&point.as_bytes()[1..]);
    out
}

pub fn p256_entry<'a>(pubkey: &'a [u8]) -> KeystoreEntry<'a> {
    KeystoreEntry::new(
        SignatureAlg::EcdsaP256,
        pubkey,
        SignatureAlg::EcdsaP256.permission_bit(),
    )
}

pub fn payload(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

pub struct ImageBuilder<'a> {
    payload: &'a [u8],
    version: u32,
    img_type: u16,
    timestamp: u64,
    delta_base: Option<[u8; IMAGE_DIGEST_SIZE]>,
    secondary: Option<&'a SigningKey>,
}

impl<'a> ImageBuilder<'a> {
    pub fn new(payload: &'a [u8], version: u32) -> Self {
        ImageBuilder {
            payload,
            version,
            img_type: DEFAULT_IMG_TYPE,
            timestamp: 1_700_000_000,
            delta_base: None,
            secondary: None,
        }
    }

    pub fn img_type(mut self, img_type: u16) -> Self {
        self.img_type = img_type;
        self
    }

    pub fn delta_base(mut self, digest: [u8; IMAGE_DIGEST_SIZE]) -> Self {
        self.delta_base = Some(digest);
        self
    }

    pub fn secondary_signer(mut self, sk: &'a SigningKey) -> Self {
        self.secondary = Some(sk);
        self
    }

    /// Emits the signed container exactly as the host tool lays it out:
    /// version, timestamp and image-type TLVs, the digest over everything
    /// before the digest TLV plus the payload, the signer's key hint, and
    /// the signature(s).
    pub fn build(self, sk: &SigningKey) -> Vec<u8> {
        let mut hdr = [0xFFu8; IMAGE_HEADER_SIZE];
        LittleEndian::write_u32(&mut hdr[..4], VAULTBOOT_MAGIC);
        LittleEndian::write_u32(&mut hdr[4..8], self.payload.len() as u32);
        let mut off = IMAGE_HEADER_OFFSET;

        put_tlv(&mut hdr, &mut off, HDR_VERSION, &self.version.to_be_bytes());
        put_tlv(
            &mut hdr,
            &mut off,
            HDR_TIMESTAMP,
            &self.timestamp.to_le_bytes(),
        );
        put_tlv(&mut hdr, &mut off, HDR_IMG_TYPE, &self.img_type.to_le_bytes());
        if let Some(base) = self.delta_base {
            put_tlv(&mut hdr, &mut off, HDR_DELTA_BASE, &base);
        }

        let mut hasher = Sha256::new();
        hasher.update(&hdr[..off]);
        hasher.update(self.payload);
        let digest = hasher.clone().finalize();
        put_tlv(&mut hdr, &mut off, HDR_DIGEST, &digest);

        let pubkey = raw_pubkey(sk);
        put_tlv(&mut hdr, &mut off, HDR_PUBKEY_HINT, &key_hint(&pubkey));

        let signature: Signature = sk.sign_digest(hasher.clone());
        put_tlv(&mut hdr, &mut off, HDR_SIGNATURE, signature.as_ref());

        if let Some(second) = self.secondary {
            let signature: Signature = second.sign_digest(hasher.clone());
            put_tlv(&mut hdr, &mut off, HDR_SECONDARY_SIGNATURE, signature.as_ref());
        }
        assert!(off <= IMAGE_HEADER_SIZE);

        let mut image = hdr.to_vec();
        image.extend_from_slice(self.payload);
        image
    }
}

fn put_tlv(hdr: &mut [u8; IMAGE_HEADER_SIZE], off: &mut usize, tag: u16, value: &[u8]) {
    LittleEndian::write_u16(&mut hdr[*off..*off + 2], tag);
    LittleEndian::write_u16(&mut hdr[*off + 2..*off + 4], value.len() as u16);
    hdr[*off + 4..*off + 4 + value.len()].copy_from_slice(value);
    *off = (*off + 4 + value.len() + 3) & !3;
}

pub fn build_image(payload: &[u8], version: u32, sk: &SigningKey, img_type: u16) -> Vec<u8> {
    ImageBuilder::new(payload, version)
        .img_type(img_type)
        .build(sk)
}

/// Ed25519-signed container and the raw verifying key for its keystore
/// entry. Ed25519 signs the finalized image digest as its message.
#[cfg(feature = "ed25519")]
pub fn build_ed25519_image(payload: &[u8], version: u32) -> (Vec<u8>, [u8; 32]) {
    use ed25519_dalek::Signer;

    let sk = ed25519_dalek::SigningKey::from_bytes(&[0x77u8; 32]);
    let pubkey = sk.verifying_key().to_bytes();

    let mut hdr = [0xFFu8; IMAGE_HEADER_SIZE];
    LittleEndian::write_u32(&mut hdr[..4], VAULTBOOT_MAGIC);
    LittleEndian::write_u32(&mut hdr[4..8], payload.len() as u32);
    let mut off = IMAGE_HEADER_OFFSET;
    put_tlv(&mut hdr, &mut off, HDR_VERSION, &version.to_be_bytes());
    put_tlv(
        &mut hdr,
        &mut off,
        HDR_IMG_TYPE,
        &(SignatureAlg::Ed25519 as u8 as u16).to_le_bytes(),
    );

    let mut hasher = Sha256::new();
    hasher.update(&hdr[..off]);
    hasher.update(payload);
    let digest = hasher.finalize();
    put_tlv(&mut hdr, &mut off, HDR_DIGEST, &digest);
    put_tlv(&mut hdr, &mut off, HDR_PUBKEY_HINT, &key_hint(&pubkey));
    let signature = sk.sign(&digest);
    put_tlv(&mut hdr, &mut off, HDR_SIGNATURE, &signature.to_bytes());

    let mut image = hdr.to_vec();
    image.extend_from_slice(payload);
    (image, pubkey)
}

pub fn empty_flash() -> MockFlash {
    MockFlash::new(TEST_FLASH_SIZE, TEST_LAYOUT.sector_size)
}

/// Seeds a partition trailer directly (magic plus state), bypassing NOR
/// semantics; fixture setup only.
pub fn set_state(flash: &MockFlash, base: usize, state: u8) {
    let end = base + TEST_LAYOUT.partition_size;
    let mut trailer = [0u8; 5];
    trailer[0] = state;
    LittleEndian::write_u32(&mut trailer[1..], VAULTBOOT_MAGIC_TRAIL);
    flash.load(end - 5, &trailer);
}
