use crate::curve::*;
use field::*;
use p256::ecdsa::signature::{digest::Digest, DigestSigner};
use p256::ecdsa::Signature;
use sha2::Sha256;
use vaultboot::constants::*;
use vaultboot::crypto::SignatureAlg;

use filetime::FileTime;
use std::fs;

/// Byte ranges of every header field. The layout is fixed: the digest
/// covers everything before its own TLV plus the payload, so the
/// digest, key-hint and signature TLVs come last.
mod field {
    use core::ops::Range;

    pub type Field = Range<usize>;

    pub const MAGIC: Field = 0..4;
    pub const IMAGE_SIZE: Field = 4..8;

    pub const VERSION_TYPE: Field = 8..10;
    pub const VERSION_LEN: Field = 10..12;
    pub const VERSION_VALUE: Field = 12..16;

    pub const TIMESTAMP_TYPE: Field = 16..18;
    pub const TIMESTAMP_LEN: Field = 18..20;
    pub const TIMESTAMP_VALUE: Field = 20..28;

    pub const IMAGE_TYPE: Field = 28..30;
    pub const IMAGE_LEN: Field = 30..32;
    pub const IMAGE_VALUE: Field = 32..34;

    pub const DIGEST_TYPE: Field = 36..38;
    pub const DIGEST_LEN: Field = 38..40;
    pub const SHA256_DIGEST: Field = 40..72;

    pub const PUBKEY_TYPE: Field = 72..74;
    pub const PUBKEY_LEN: Field = 74..76;
    pub const PUBKEY_DIGEST_VALUE: Field = 76..108;

    pub const SIGNATURE_TYPE: Field = 108..110;
    pub const SIGNATURE_LEN: Field = 110..112;
    pub const SIGNATURE_VALUE: Field = 112..176;
}

/// Returns a signed image, given a firmware blob, the path to the blob
/// (its modification time becomes the timestamp TLV), a signing key and a
/// version.
pub fn sign_image(
    mut fw_blob: Vec<u8>,
    path: &str,
    sk_type: SigningKeyType,
    version: u32,
) -> Result<Vec<u8>> {
    if fw_blob.is_empty() || fw_blob.len() > DEFAULT_LAYOUT.max_image_size() {
        return Err(VbSignerError::ImageTooLarge(fw_blob.len()));
    }
    match sk_type {
        SigningKeyType::NistP256(sk) => {
            let (mut header, prehashed_digest) = construct_img_header::<Sha256>(
                fw_blob.as_slice(),
                path,
                version,
                SignatureAlg::EcdsaP256,
            )?;

            // Key hint: image hash over the raw (untagged) public key.
            let derived_pk = sk.verifying_key().to_encoded_point(false);
            let pubkey_hint = Sha256::digest(&derived_pk.as_bytes()[1..]);
            header.set_pubkey_hint(pubkey_hint.as_slice())?;
            log::info!("public key hint: {}", hex(pubkey_hint.as_slice()));

            let signature: Signature = sk
                .try_sign_digest(prehashed_digest)
                .map_err(VbSignerError::SignatureError)?;
            header.set_signature_value(signature.as_ref())?;

            fw_blob.splice(0..0, header.as_slice().iter().cloned());
            Ok(fw_blob)
        }
        #[cfg(feature = "ed25519")]
        SigningKeyType::Ed25519(sk) => {
            use ed25519_dalek::Signer;

            let (mut header, prehashed_digest) = construct_img_header::<Sha256>(
                fw_blob.as_slice(),
                path,
                version,
                SignatureAlg::Ed25519,
            )?;

            // Key hint: image hash over the raw 32-byte verifying key.
            let pubkey = sk.verifying_key().to_bytes();
            let pubkey_hint = Sha256::digest(&pubkey);
            header.set_pubkey_hint(pubkey_hint.as_slice())?;
            log::info!("public key hint: {}", hex(pubkey_hint.as_slice()));

            // Ed25519 signs the finalized image digest as its message,
            // which is what the bootloader verifies against.
            let digest = prehashed_digest.finalize();
            let signature = sk.sign(&digest);
            header.set_signature_value(&signature.to_bytes())?;

            fw_blob.splice(0..0, header.as_slice().iter().cloned());
            Ok(fw_blob)
        }
    }
}

pub fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Fills everything the digest covers and returns the header plus the
/// pre-updated hasher (header-so-far followed by the payload), ready for
/// the signature.
fn construct_img_header<D>(
    fw_blob: &[u8],
    path: &str,
    version: u32,
    alg: SignatureAlg,
) -> Result<(ImageHeader<[u8; IMAGE_HEADER_SIZE]>, D)>
where
    D: Digest + Clone,
{
    let mut header = ImageHeader::new_checked([0xFF; IMAGE_HEADER_SIZE])?;

    header.set_magic();
    header.set_image_size(fw_blob.len() as u32);
    header.set_version(version);

    let timestamp = match fs::metadata(path) {
        Ok(metadata) => FileTime::from_last_modification_time(&metadata).unix_seconds() as u64,
        Err(_) => 0,
    };
    header.set_timestamp(timestamp);
    header.set_image_type(alg as u8 as u16);

    let mut hasher = D::new();
    hasher.update(&header.inner_ref()[..DIGEST_TYPE.start]);
    hasher.update(fw_blob);
    let digest = hasher.clone().finalize();
    if digest.len() != SHA256_DIGEST_SIZE {
        return Err(VbSignerError::BadHashValue);
    }
    header.set_digest_value(digest.as_slice())?;

    Ok((header, hasher))
}

#[derive(Debug, PartialEq, Clone)]
pub struct ImageHeader<T> {
    buffer: T,
}

impl<T: AsRef<[u8]>> ImageHeader<T> {
    /// Imbue a raw octet buffer with `ImageHeader` structure.
    pub fn new_unchecked(buffer: T) -> ImageHeader<T> {
        ImageHeader { buffer }
    }

    pub fn new_checked(buffer: T) -> Result<ImageHeader<T>> {
        let hdr = Self::new_unchecked(buffer);
        if hdr.inner_ref().as_ref().len() != IMAGE_HEADER_SIZE {
            return Err(VbSignerError::BadHashValue);
        }
        Ok(hdr)
    }

    pub fn inner_ref(&self) -> &T {
        &self.buffer
    }

    pub fn as_slice(&self) -> &[u8] {
        self.buffer.as_ref()
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> ImageHeader<T> {
    fn set_tlv_header(&mut self, ty: Field, len_field: Field, tag: u16, len: usize) {
        let header = self.buffer.as_mut();
        header[ty].copy_from_slice(&tag.to_le_bytes());
        header[len_field].copy_from_slice(&(len as u16).to_le_bytes());
    }

    /// Sets the 4-byte container magic.
    #[inline]
    pub fn set_magic(&mut self) {
        let header = self.buffer.as_mut();
        header[MAGIC].copy_from_slice(&VAULTBOOT_MAGIC.to_le_bytes());
    }

    /// Sets the payload size field.
    #[inline]
    pub fn set_image_size(&mut self, value: u32) {
        let header = self.buffer.as_mut();
        header[IMAGE_SIZE].copy_from_slice(&value.to_le_bytes());
    }

    /// Version TLV; the value is stored big-endian.
    #[inline]
    pub fn set_version(&mut self, version: u32) {
        self.set_tlv_header(VERSION_TYPE, VERSION_LEN, HDR_VERSION, HDR_VERSION_LEN);
        let header = self.buffer.as_mut();
        header[VERSION_VALUE].copy_from_slice(&version.to_be_bytes());
    }

    /// Timestamp TLV, unix seconds little-endian.
    #[inline]
    pub fn set_timestamp(&mut self, timestamp: u64) {
        self.set_tlv_header(
            TIMESTAMP_TYPE,
            TIMESTAMP_LEN,
            HDR_TIMESTAMP,
            HDR_TIMESTAMP_LEN,
        );
        let header = self.buffer.as_mut();
        header[TIMESTAMP_VALUE].copy_from_slice(&timestamp.to_le_bytes());
    }

    /// Image-type TLV: low byte algorithm id, high byte feature flags.
    #[inline]
    pub fn set_image_type(&mut self, img_type: u16) {
        self.set_tlv_header(IMAGE_TYPE, IMAGE_LEN, HDR_IMG_TYPE, HDR_IMG_TYPE_LEN);
        let header = self.buffer.as_mut();
        header[IMAGE_VALUE].copy_from_slice(&img_type.to_le_bytes());
    }

    /// Image digest TLV.
    #[inline]
    pub fn set_digest_value(&mut self, value: &[u8]) -> Result<()> {
        if value.len() != SHA256_DIGEST_SIZE {
            return Err(VbSignerError::BadHashValue);
        }
        self.set_tlv_header(DIGEST_TYPE, DIGEST_LEN, HDR_SHA256, SHA256_DIGEST_SIZE);
        let header = self.buffer.as_mut();
        header[SHA256_DIGEST].copy_from_slice(value);
        Ok(())
    }

    /// Public-key hint TLV.
    #[inline]
    pub fn set_pubkey_hint(&mut self, value: &[u8]) -> Result<()> {
        if value.len() != SHA256_DIGEST_SIZE {
            return Err(VbSignerError::BadHashValue);
        }
        self.set_tlv_header(
            PUBKEY_TYPE,
            PUBKEY_LEN,
            HDR_PUBKEY_HINT,
            SHA256_DIGEST_SIZE,
        );
        let header = self.buffer.as_mut();
        header[PUBKEY_DIGEST_VALUE].copy_from_slice(value);
        Ok(())
    }

    /// Signature TLV.
    #[inline]
    pub fn set_signature_value(&mut self, value: &[u8]) -> Result<()> {
        if value.len() != ECC_SIGNATURE_SIZE {
            return Err(VbSignerError::BadHashValue);
        }
        self.set_tlv_header(
            SIGNATURE_TYPE,
            SIGNATURE_LEN,
            HDR_SIGNATURE,
            ECC_SIGNATURE_SIZE,
        );
        let header = self.buffer.as_mut();
        header[SIGNATURE_VALUE].copy_from_slice(value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vaultboot::crypto::key_hint;
    use vaultboot::image::image::open_image_at;
    use vaultboot::keystore::{Keystore, KeystoreEntry};
    use vaultboot_hal::mock::MockFlash;

    const TEST_SK: [u8; 32] = [
        0x1a, 0x41, 0x5e, 0x09, 0xc7, 0x8c, 0x2f, 0xd4, 0xb3, 0x2e, 0x95, 0x60, 0x7b, 0x21,
        0x8f, 0x4d, 0xe6, 0x0a, 0xd3, 0x37, 0x5c, 0x88, 0x16, 0xf2, 0x9b, 0x44, 0xa1, 0x73,
        0x0e, 0xc5, 0x52, 0x6d,
    ];

    #[test]
    fn magic_test() {
        let mut hdr = ImageHeader::new_checked([0xFF; IMAGE_HEADER_SIZE]).unwrap();
        hdr.set_magic();
        assert_eq!(&hdr.inner_ref()[MAGIC], &[0x56, 0x42, 0x4C, 0x54]); // b"VBLT"
    }

    #[test]
    fn image_size_test() {
        let mut hdr = ImageHeader::new_checked([0xFF; IMAGE_HEADER_SIZE]).unwrap();
        hdr.set_image_size(8192);
        assert_eq!(&hdr.inner_ref()[IMAGE_SIZE], &[0x00, 0x20, 0x00, 0x00]);
    }

    #[test]
    fn version_field_test() {
        let mut hdr = ImageHeader::new_checked([0xFF; IMAGE_HEADER_SIZE]).unwrap();
        hdr.set_version(0x01020304);
        assert_eq!(
            &hdr.inner_ref()[VERSION_TYPE.start..VERSION_VALUE.end],
            &[0x01, 0x00, 0x04, 0x00, 0x01, 0x02, 0x03, 0x04]
        );
    }

    #[test]
    fn image_type_field_test() {
        let mut hdr = ImageHeader::new_checked([0xFF; IMAGE_HEADER_SIZE]).unwrap();
        hdr.set_image_type(0x2002);
        assert_eq!(
            &hdr.inner_ref()[IMAGE_TYPE.start..IMAGE_VALUE.end],
            &[0x04, 0x00, 0x02, 0x00, 0x02, 0x20]
        );
    }

    #[test]
    fn signed_image_verifies_in_the_bootloader() {
        let sk_type = import_signing_key(CurveType::NistP256, &TEST_SK).unwrap();
        let derived_pk = match &sk_type {
            SigningKeyType::NistP256(sk) => sk.verifying_key().to_encoded_point(false),
            #[cfg(feature = "ed25519")]
            _ => unreachable!(),
        };
        let mut pubkey = [0u8; 64];
        pubkey.copy_from_slice(&derived_pk.as_bytes()[1..]);

        let fw: Vec<u8> = (0..5000u32).map(|i| (i % 253) as u8).collect();
        let signed = sign_image(fw, "Cargo.toml", sk_type, 7).unwrap();

        // Load the container into a mock partition and run the verifier
        // over it.
        let flash = MockFlash::new(0x8000, 0x1000);
        flash.load(0, &signed);
        let entries = [KeystoreEntry::new(
            vaultboot::crypto::SignatureAlg::EcdsaP256,
            &pubkey,
            vaultboot::crypto::SignatureAlg::EcdsaP256.permission_bit(),
        )];
        let keystore = Keystore::new(&entries);

        let mut img = open_image_at(&flash, 0, 0x7000).unwrap();
        assert_eq!(img.firmware_version().unwrap(), 7);
        img.verify_integrity(&flash).unwrap();
        img.verify_authenticity(&flash, &keystore).unwrap();
        assert_eq!(key_hint(&pubkey)[..], img.get_tlv(
            vaultboot::parser::Tags::PubkeyHint
        ).unwrap()[..]);
    }

    #[cfg(feature = "ed25519")]
    #[test]
    fn ed25519_signed_image_verifies_in_the_bootloader() {
        let sk_type = import_signing_key(CurveType::Ed25519, &TEST_SK).unwrap();
        let pubkey = match &sk_type {
            SigningKeyType::Ed25519(sk) => sk.verifying_key().to_bytes(),
            _ => unreachable!(),
        };

        let fw: Vec<u8> = (0..3000u32).map(|i| (i % 241) as u8).collect();
        let signed = sign_image(fw, "Cargo.toml", sk_type, 9).unwrap();

        let flash = MockFlash::new(0x8000, 0x1000);
        flash.load(0, &signed);
        let entries = [KeystoreEntry::new(
            vaultboot::crypto::SignatureAlg::Ed25519,
            &pubkey,
            vaultboot::crypto::SignatureAlg::Ed25519.permission_bit(),
        )];
        let keystore = Keystore::new(&entries);

        let mut img = open_image_at(&flash, 0, 0x7000).unwrap();
        assert_eq!(img.firmware_version().unwrap(), 9);
        img.verify_integrity(&flash).unwrap();
        img.verify_authenticity(&flash, &keystore).unwrap();
    }
}
