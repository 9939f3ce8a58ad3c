#![allow(unused_imports)]

use crate::{Result, VaultbootError};

use super::{ImageHash, SignatureAlg};

use core::convert::TryFrom;
use core::ops::Add;

#[cfg(feature = "nistp256")]
use p256::{
    ecdsa::signature::digest::Digest,
    ecdsa::{signature::DigestVerifier, Signature, VerifyingKey},
    elliptic_curve::consts::U32,
    elliptic_curve::{generic_array::GenericArray, FieldSize},
    EncodedPoint, NistP256,
};

#[cfg(not(feature = "nistp256"))]
use sha2::Digest;

pub const RAW_P256_PUBKEY_SIZE: usize = 64;
pub const ED25519_PUBKEY_SIZE: usize = 32;

/// A type to represent an ECDSA-SHA256 signature verifier.
#[cfg(feature = "nistp256")]
pub struct NistP256Signature {
    pub verify_key: VerifyingKey,
}

#[cfg(feature = "nistp256")]
impl NistP256Signature {
    /// Verifies an ECDSA signature. This method takes as argument a
    /// pre-updated [`Digest`] instance that needs to be finalized.
    pub fn verify<D: Digest<OutputSize = U32>>(self, digest: D, signature: &[u8]) -> Result<bool> {
        let res = self
            .verify_key
            .verify_digest(
                digest,
                &Signature::try_from(signature).map_err(|_| VaultbootError::BadSignature)?,
            )
            .is_ok();
        Ok(res)
    }
}

/// Imports a raw (untagged SEC1) P-256 public key from a keystore entry.
/// Fails when the bytes do not name a point on the curve.
#[cfg(feature = "nistp256")]
pub fn import_pubkey_p256(raw: &[u8]) -> Result<VerifyingKey> {
    if raw.len() != RAW_P256_PUBKEY_SIZE {
        return Err(VaultbootError::InvalidValue);
    }
    let untagged_bytes: &GenericArray<u8, <FieldSize<NistP256> as Add>::Output> =
        GenericArray::from_slice(raw);
    let sec1_encoded_pubkey = EncodedPoint::from_untagged_bytes(untagged_bytes);
    // `from_encoded_point` is fallible i.e. it will check to see if the
    // point (i.e. pubkey) is on the curve.
    VerifyingKey::from_encoded_point(&sec1_encoded_pubkey)
        .map_err(|_| VaultbootError::NoTrustedKey)
}

/// Verifies `signature` over the image digest with the given keystore key.
///
/// The digest arrives as a pre-updated hasher; algorithms that verify a
/// raw message (Ed25519) finalize it first, ECDSA consumes it directly.
/// Algorithms recognized by [`SignatureAlg`] but not compiled into this
/// build report [`VaultbootError::UnsupportedAlgorithm`].
pub fn verify_image_signature(
    alg: SignatureAlg,
    pubkey: &[u8],
    digest: ImageHash,
    signature: &[u8],
) -> Result<()> {
    match alg {
        #[cfg(feature = "nistp256")]
        SignatureAlg::EcdsaP256 => {
            let verifier = NistP256Signature {
                verify_key: import_pubkey_p256(pubkey)?,
            };
            match verifier.verify(digest, signature)? {
                true => Ok(()),
                false => Err(VaultbootError::BadSignature),
            }
        }
        #[cfg(feature = "ed25519")]
        SignatureAlg::Ed25519 => {
            use core::convert::TryInto;
            use ed25519_dalek::{Signature as EdSignature, Verifier, VerifyingKey as EdKey};

            let raw: &[u8; ED25519_PUBKEY_SIZE] = pubkey
                .try_into()
                .map_err(|_| VaultbootError::InvalidValue)?;
            let key = EdKey::from_bytes(raw).map_err(|_| VaultbootError::NoTrustedKey)?;
            let sig =
                EdSignature::from_slice(signature).map_err(|_| VaultbootError::BadSignature)?;
            let msg = digest.finalize();
            key.verify(&msg, &sig)
                .map_err(|_| VaultbootError::BadSignature)
        }
        _ => Err(VaultbootError::UnsupportedAlgorithm),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::key_hint;
    use crate::testutil;
    use p256::ecdsa::signature::DigestSigner;
    use sha2::{Digest as _, Sha256};

    #[test]
    fn p256_signature_roundtrip() {
        let sk = testutil::signing_key();
        let pubkey = testutil::raw_pubkey(&sk);

        let mut hasher = Sha256::new();
        hasher.update(b"firmware bytes");
        let sig: Signature = sk.sign_digest(hasher.clone());

        verify_image_signature(SignatureAlg::EcdsaP256, &pubkey, hasher.clone(), sig.as_ref())
            .unwrap();

        // Flip one signature byte.
        let mut bad = [0u8; 64];
        bad.copy_from_slice(sig.as_ref());
        bad[10] ^= 0x01;
        assert!(verify_image_signature(SignatureAlg::EcdsaP256, &pubkey, hasher, &bad).is_err());
    }

    #[test]
    fn uncompiled_algorithms_are_reported() {
        let sk = testutil::signing_key();
        let pubkey = testutil::raw_pubkey(&sk);
        let hasher = Sha256::new();
        assert_eq!(
            verify_image_signature(SignatureAlg::Rsa2048, &pubkey, hasher, &[0u8; 256]),
            Err(VaultbootError::UnsupportedAlgorithm)
        );
    }

    #[test]
    fn pubkey_hint_is_stable() {
        let sk = testutil::signing_key();
        let pubkey = testutil::raw_pubkey(&sk);
        assert_eq!(key_hint(&pubkey), key_hint(&pubkey));
        assert_ne!(key_hint(&pubkey), key_hint(&pubkey[..63]));
    }

    #[test]
    fn malformed_pubkey_is_rejected() {
        let hasher = Sha256::new();
        // 64 bytes that are not a curve point.
        let junk = [0x11u8; 64];
        assert!(matches!(
            verify_image_signature(SignatureAlg::EcdsaP256, &junk, hasher, &[0u8; 64]),
            Err(VaultbootError::NoTrustedKey) | Err(VaultbootError::BadSignature)
        ));
    }
}
