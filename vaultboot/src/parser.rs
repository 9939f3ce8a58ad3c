//! Image-header TLV cursor.
//!
//! The header region after the magic and size words is a sequence of
//! 4-byte-aligned TLVs: `tag: u16 LE`, `len: u16 LE`, `len` value bytes,
//! `0xFF` padding up to the next 4-byte boundary. A tag read of `0xFFFF`
//! terminates the sequence, which makes erased flash after the last TLV an
//! acceptable tail. Scanning is a bounds-checked linear walk over a
//! borrowed slice; no field is ever addressed past the header boundary.

use crate::constants::*;
use crate::{Result, VaultbootError};

use nom::bytes::complete::{take, take_while};
use nom::error::Error;
use nom::number::complete::le_u16;
use nom::IResult;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
/// Each variant in [`Tags`] represents a field in the image-header.
pub enum Tags {
    Version,
    TimeStamp,
    ImgType,
    Digest,
    PubkeyHint,
    Signature,
    SecondarySignature,
    DeltaBase,
    DeviceId,
}

impl Tags {
    pub fn id(self) -> u16 {
        match self {
            Self::Version => HDR_VERSION,
            Self::TimeStamp => HDR_TIMESTAMP,
            Self::ImgType => HDR_IMG_TYPE,
            Self::Digest => HDR_DIGEST,
            Self::PubkeyHint => HDR_PUBKEY_HINT,
            Self::Signature => HDR_SIGNATURE,
            Self::SecondarySignature => HDR_SECONDARY_SIGNATURE,
            Self::DeltaBase => HDR_DELTA_BASE,
            Self::DeviceId => HDR_DEVICE_ID,
        }
    }
}

/// Tags this implementation understands; an unknown tag outside this set
/// is skipped unless its critical bit is set.
fn is_known(tag: u16) -> bool {
    matches!(
        tag,
        HDR_VERSION
            | HDR_TIMESTAMP
            | HDR_IMG_TYPE
            | HDR_SHA256
            | HDR_SHA384
            | HDR_SHA3_384
            | HDR_PUBKEY_HINT
            | HDR_SIGNATURE
            | HDR_SECONDARY_SIGNATURE
            | HDR_DELTA_BASE
            | HDR_DEVICE_ID
    )
}

/// Consumes a run of `0xFF` padding bytes: TLV alignment pads and the
/// erased tail both decode to it.
fn check_for_padding(input: &[u8]) -> IResult<&[u8], &[u8]> {
    take_while::<_, _, Error<&[u8]>>(|pad_byte| pad_byte == HDR_PADDING)(input)
}

/// One TLV frame: tag, length, value.
fn tlv_frame(input: &[u8]) -> IResult<&[u8], (u16, &[u8])> {
    let (rest, tag) = le_u16(input)?;
    let (rest, len) = le_u16(rest)?;
    let (rest, value) = take(len)(rest)?;
    Ok((rest, (tag, value)))
}

/// Scans the TLV region of `hdr` (a full header, magic and size included)
/// for `wanted`. Returns the value and the byte offset of the TLV's tag
/// field from the start of the header. The first occurrence of a tag wins;
/// an unknown critical tag aborts the scan.
pub(crate) fn find_tlv(hdr: &[u8], wanted: u16) -> Result<Option<(usize, &[u8])>> {
    if hdr.len() < IMAGE_HEADER_OFFSET + 4 {
        return Err(VaultbootError::BadHeader);
    }
    let region = &hdr[IMAGE_HEADER_OFFSET..];
    let mut rest = region;
    loop {
        let (after_pad, _) = check_for_padding(rest).map_err(|_| VaultbootError::BadTlv)?;
        rest = after_pad;
        if rest.len() < 4 {
            return Ok(None);
        }
        let peek = rest[0] as u16 | (rest[1] as u16) << 8;
        if peek == HDR_TAG_END {
            return Ok(None);
        }
        let offset = IMAGE_HEADER_OFFSET + (region.len() - rest.len());
        let (next, (tag, value)) = tlv_frame(rest).map_err(|_| VaultbootError::BadTlv)?;
        if tag == wanted {
            return Ok(Some((offset, value)));
        }
        if tag & HDR_TAG_CRITICAL != 0 && !is_known(tag) {
            return Err(VaultbootError::BadTlv);
        }
        rest = next;
    }
}

/// A function to parse the image-header contained in a `boot or update`
/// partition, for a given `TLV`. Returns a slice containing the value.
pub(crate) fn parse_tlv(hdr: &[u8], type_field: Tags) -> Result<&[u8]> {
    match find_tlv(hdr, type_field.id())? {
        Some((_, value)) => Ok(value),
        None => Err(VaultbootError::TlvNotFound),
    }
}

/// Returns the byte position of a TLV from the start of the header. The
/// digest computation uses this to hash everything up to the digest TLV.
pub(crate) fn tlv_offset(hdr: &[u8], type_field: Tags) -> Result<usize> {
    match find_tlv(hdr, type_field.id())? {
        Some((offset, _)) => Ok(offset),
        None => Err(VaultbootError::TlvNotFound),
    }
}
