//! The set of public keys this bootloader trusts.
//!
//! The table is created at build time (typically generated alongside the
//! signing key by the host tooling) and lives in read-only data or OTP; it
//! is never mutated at runtime. Key revocation, where a target supports it,
//! is an OTP-stored bitmap of revoked indices that is masked out of every
//! lookup.

use crate::constants::PUBKEY_DIGEST_SIZE;
use crate::crypto::{key_hint, SignatureAlg};

/// One trusted signer.
#[derive(Debug, Clone)]
pub struct KeystoreEntry<'a> {
    pub alg: SignatureAlg,
    /// Image hash over the raw public key; matched against the image's
    /// `PUBKEY_HINT` TLV.
    pub hint: [u8; PUBKEY_DIGEST_SIZE],
    /// Raw key material: untagged SEC1 point for ECDSA, 32 bytes for
    /// Ed25519.
    pub pubkey: &'a [u8],
    /// One bit per [`SignatureAlg`] id this key may sign; checked against
    /// the low byte of `IMAGE_TYPE`.
    pub permission_mask: u32,
}

impl<'a> KeystoreEntry<'a> {
    /// Entry with the hint derived from the key bytes.
    pub fn new(alg: SignatureAlg, pubkey: &'a [u8], permission_mask: u32) -> Self {
        KeystoreEntry {
            alg,
            hint: key_hint(pubkey),
            pubkey,
            permission_mask,
        }
    }

    /// Entry with a precomputed hint, for `const` keystore tables where the
    /// hint was emitted by the signing tool.
    pub const fn with_hint(
        alg: SignatureAlg,
        hint: [u8; PUBKEY_DIGEST_SIZE],
        pubkey: &'a [u8],
        permission_mask: u32,
    ) -> Self {
        KeystoreEntry {
            alg,
            hint,
            pubkey,
            permission_mask,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Keystore<'a> {
    entries: &'a [KeystoreEntry<'a>],
    revoked: u32,
}

impl<'a> Keystore<'a> {
    pub const fn new(entries: &'a [KeystoreEntry<'a>]) -> Self {
        Keystore {
            entries,
            revoked: 0,
        }
    }

    /// Keystore with a revocation bitmap, bit `i` masking out entry `i`.
    pub const fn with_revocation(entries: &'a [KeystoreEntry<'a>], revoked: u32) -> Self {
        Keystore { entries, revoked }
    }

    pub fn num_keys(&self) -> usize {
        self.entries.len()
    }

    pub fn key(&self, index: usize) -> Option<&KeystoreEntry<'a>> {
        self.entries.get(index)
    }

    fn is_revoked(&self, index: usize) -> bool {
        index < 32 && self.revoked & (1 << index) != 0
    }

    /// Linear scan for the entry matching a `PUBKEY_HINT` value; revoked
    /// entries never match.
    pub fn find_by_hint(&self, hint: &[u8]) -> Option<(usize, &KeystoreEntry<'a>)> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(i, _)| !self.is_revoked(*i))
            .find(|(_, e)| e.hint[..] == *hint)
    }

    /// The co-signer consulted for hybrid-signed images: the first
    /// non-revoked entry other than the primary.
    pub fn find_secondary(&self, primary: usize) -> Option<&KeystoreEntry<'a>> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != primary && !self.is_revoked(*i))
            .map(|(_, e)| e)
            .next()
    }
}
