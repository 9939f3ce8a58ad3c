pub mod signatures;

use sha2::Digest;
use subtle::ConstantTimeEq;

use crate::constants::PUBKEY_DIGEST_SIZE;

/// The streaming hash used for image digests and public-key hints. One
/// algorithm per build, selected by feature.
#[cfg(feature = "sha256")]
pub type ImageHash = sha2::Sha256;
#[cfg(feature = "sha384")]
pub type ImageHash = sha2::Sha384;
#[cfg(feature = "sha3-384")]
pub type ImageHash = sha3::Sha3_384;

/// Signature algorithm ids as carried in the low byte of `IMAGE_TYPE` and
/// in keystore entries. The compiled subset is selected by feature; ids
/// outside it are still recognized so foreign images fail with a defined
/// error rather than a parse error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SignatureAlg {
    Ed25519 = 0x01,
    EcdsaP256 = 0x02,
    EcdsaP384 = 0x03,
    EcdsaP521 = 0x04,
    Rsa2048 = 0x05,
    Rsa3072 = 0x06,
    Rsa4096 = 0x07,
    Ed448 = 0x08,
    Lms = 0x09,
    Xmss = 0x0A,
    MlDsa = 0x0B,
}

impl SignatureAlg {
    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            0x01 => Some(SignatureAlg::Ed25519),
            0x02 => Some(SignatureAlg::EcdsaP256),
            0x03 => Some(SignatureAlg::EcdsaP384),
            0x04 => Some(SignatureAlg::EcdsaP521),
            0x05 => Some(SignatureAlg::Rsa2048),
            0x06 => Some(SignatureAlg::Rsa3072),
            0x07 => Some(SignatureAlg::Rsa4096),
            0x08 => Some(SignatureAlg::Ed448),
            0x09 => Some(SignatureAlg::Lms),
            0x0A => Some(SignatureAlg::Xmss),
            0x0B => Some(SignatureAlg::MlDsa),
            _ => None,
        }
    }

    pub fn id(self) -> u8 {
        self as u8
    }

    /// The bit this algorithm occupies in a keystore permission mask.
    pub fn permission_bit(self) -> u32 {
        1 << (self as u8)
    }
}

/// Digest comparison that does not leak the mismatch position.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// Hint identifying a public key: the image hash over the raw key bytes
/// (for ECDSA, the untagged SEC1 point).
pub fn key_hint(pubkey: &[u8]) -> [u8; PUBKEY_DIGEST_SIZE] {
    let digest = ImageHash::digest(pubkey);
    let mut hint = [0u8; PUBKEY_DIGEST_SIZE];
    hint.copy_from_slice(&digest);
    hint
}
