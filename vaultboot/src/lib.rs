#![cfg_attr(not(test), no_std)]

#[macro_use]
mod fmt;

pub mod constants;
pub mod crypto;
pub mod flashapi;
pub mod image;
pub mod keystore;
pub mod parser;
pub mod trailer;
pub mod update;

use core::fmt as corefmt;

use vaultboot_hal::FlashError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// The VaultbootError type.
pub enum VaultbootError {
    /// The container magic at the start of the partition is wrong.
    BadMagic,
    /// The header is structurally unsound, e.g. the stated payload size
    /// does not fit the partition body.
    BadHeader,
    /// A TLV is malformed, crosses the header boundary, or carries an
    /// unknown critical tag.
    BadTlv,
    /// Type, length, value triple does not exist i.e. we reached the end
    /// of the header without finding the requested tag.
    TlvNotFound,
    /// The requested header field has an invalid value.
    InvalidValue,
    /// The computed image digest does not match the one in the header.
    HashMismatch,
    /// No keystore entry matches the image's public-key hint.
    NoTrustedKey,
    /// The keystore entry is not permitted to sign this image type, or its
    /// algorithm does not match the image's.
    PermissionDenied,
    /// Signature verification failed.
    BadSignature,
    /// The image names an algorithm this build does not carry.
    UnsupportedAlgorithm,
    /// The candidate's version is older than the anti-rollback floor or
    /// the currently installed firmware.
    VersionRollback,
    /// An operation is not permitted in the current state or an invalid
    /// state was reached.
    InvalidState,
    /// The sector flag nibble holds an undefined value.
    InvalidSectorFlag,
    /// A flash program failed and retries were exhausted.
    FlashWrite,
    /// A flash erase failed and retries were exhausted.
    FlashErase,
    /// A trailer update would need a 0→1 bit transition.
    NeedsErase,
    /// A delta patch is malformed or references an overwritten base range.
    BadPatch,
    /// All boot options are exhausted.
    Fatal,
}

/// The result type for vaultboot.
pub type Result<T> = core::result::Result<T, VaultbootError>;

impl From<FlashError> for VaultbootError {
    fn from(e: FlashError) -> Self {
        match e {
            FlashError::Write | FlashError::Alignment => VaultbootError::FlashWrite,
            FlashError::Erase => VaultbootError::FlashErase,
            FlashError::NeedsErase => VaultbootError::NeedsErase,
        }
    }
}

#[rustfmt::skip]
impl corefmt::Display for VaultbootError {
    fn fmt(&self, f: &mut corefmt::Formatter) -> corefmt::Result {
        match self {
            &VaultbootError::BadMagic             => write!(f, "Bad container magic"),
            &VaultbootError::BadHeader            => write!(f, "Malformed image header"),
            &VaultbootError::BadTlv               => write!(f, "Malformed or unknown-critical TLV"),
            &VaultbootError::TlvNotFound          => write!(f, "Reached end of header options"),
            &VaultbootError::InvalidValue         => write!(f, "Header field has an invalid value"),
            &VaultbootError::HashMismatch         => write!(f, "Image digest mismatch"),
            &VaultbootError::NoTrustedKey         => write!(f, "No trusted key for this image"),
            &VaultbootError::PermissionDenied     => write!(f, "Key not permitted for this image type"),
            &VaultbootError::BadSignature         => write!(f, "Bad signature"),
            &VaultbootError::UnsupportedAlgorithm => write!(f, "Signature algorithm not built in"),
            &VaultbootError::VersionRollback      => write!(f, "Version below the rollback floor"),
            &VaultbootError::InvalidState         => write!(f, "Invalid state, operation not permitted"),
            &VaultbootError::InvalidSectorFlag    => write!(f, "The sector flag value is invalid"),
            &VaultbootError::FlashWrite           => write!(f, "Flash write failed"),
            &VaultbootError::FlashErase           => write!(f, "Flash erase failed"),
            &VaultbootError::NeedsErase           => write!(f, "Write needs a prior sector erase"),
            &VaultbootError::BadPatch             => write!(f, "Malformed delta patch"),
            &VaultbootError::Fatal                => write!(f, "All boot options exhausted"),
        }
    }
}

#[cfg(test)]
pub(crate) mod testutil;
