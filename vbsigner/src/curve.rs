use core::fmt;

use p256::ecdsa::SigningKey;
use signature::Error as SigningError;

#[derive(Debug)]
pub enum CurveType {
    NistP256,
    #[cfg(feature = "ed25519")]
    Ed25519,
}

#[derive(Debug)]
pub enum SigningKeyType {
    NistP256(SigningKey),
    #[cfg(feature = "ed25519")]
    Ed25519(ed25519_dalek::SigningKey),
}

/// Turns the raw 32-byte scalar from a key file into a signing key for
/// the requested curve.
pub fn import_signing_key(curve: CurveType, bytes: &[u8]) -> Result<SigningKeyType> {
    match curve {
        CurveType::NistP256 => {
            if bytes.len() != 32 {
                return Err(VbSignerError::InvalidKeyType);
            }
            let sk = SigningKey::from_bytes(bytes).map_err(VbSignerError::KeyError)?;
            Ok(SigningKeyType::NistP256(sk))
        }
        #[cfg(feature = "ed25519")]
        CurveType::Ed25519 => {
            let raw: &[u8; 32] = bytes
                .try_into()
                .map_err(|_| VbSignerError::InvalidKeyType)?;
            Ok(SigningKeyType::Ed25519(ed25519_dalek::SigningKey::from_bytes(raw)))
        }
    }
}

/// The result type for vbsigner.
pub type Result<T> = core::result::Result<T, VbSignerError>;

#[derive(Debug)]
pub enum VbSignerError {
    /// The hash output or length is invalid.
    BadHashValue,
    /// The firmware does not fit the partition body.
    ImageTooLarge(usize),
    /// Signature error
    SignatureError(SigningError),
    /// Key error
    KeyError(SigningError),
    /// The key material does not fit the requested curve.
    InvalidKeyType,
}

impl fmt::Display for VbSignerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            VbSignerError::BadHashValue => write!(f, "bad hash value"),
            VbSignerError::ImageTooLarge(size) => {
                write!(f, "firmware of {} bytes does not fit the partition", size)
            }
            VbSignerError::SignatureError(e) => write!(f, "signing failed: {}", e),
            VbSignerError::KeyError(e) => write!(f, "invalid signing key: {}", e),
            VbSignerError::InvalidKeyType => write!(f, "key material does not fit the curve"),
        }
    }
}

impl std::error::Error for VbSignerError {}
