//! Boxed container framing.
//!
//! Boxes are `{u32 be size}{4-byte type}{payload}` records; a size field of
//! zero means a u64 extended size follows the type. Sizes count the whole
//! box including its header. Boxes are strictly sequential; `jumb` is the
//! only superbox type and its children are not recursed into at this layer.

use crate::error::DecodeError;

/// Four-character box type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BoxType(pub [u8; 4]);

impl BoxType {
    pub const SIGNATURE: Self = Self(*b"JXL ");
    pub const FILE_TYPE: Self = Self(*b"ftyp");
    pub const LEVEL: Self = Self(*b"jxll");
    pub const CODESTREAM: Self = Self(*b"jxlc");
    pub const PARTIAL_CODESTREAM: Self = Self(*b"jxlp");
    pub const EXIF: Self = Self(*b"Exif");
    pub const XML: Self = Self(*b"xml ");
    pub const JUMBF: Self = Self(*b"jumb");
    pub const BROTLI_COMPRESSED: Self = Self(*b"brob");
    pub const JPEG_RECONSTRUCTION: Self = Self(*b"jbrd");
}

impl std::fmt::Display for BoxType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for b in self.0 {
            if b.is_ascii_graphic() || b == b' ' {
                write!(f, "{}", b as char)?;
            } else {
                write!(f, "\\x{b:02x}")?;
            }
        }
        Ok(())
    }
}

/// Parsed box header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoxHeader {
    pub ty: BoxType,
    /// Payload bytes following the header.
    pub payload_size: u64,
    /// Header length in bytes (8, or 16 for the extended form).
    pub header_size: usize,
}

impl BoxHeader {
    /// Total box size including the header.
    pub fn total_size(&self) -> u64 {
        self.header_size as u64 + self.payload_size
    }
}

/// Parse a box header from the front of `avail`.
///
/// Returns `Ok(None)` when `avail` is too short to hold the complete header;
/// nothing is consumed in that case.
pub fn parse_box_header(avail: &[u8]) -> Result<Option<BoxHeader>, DecodeError> {
    if avail.len() < 8 {
        return Ok(None);
    }
    let size32 = u32::from_be_bytes([avail[0], avail[1], avail[2], avail[3]]);
    let ty = BoxType([avail[4], avail[5], avail[6], avail[7]]);
    if size32 == 0 {
        // Extended form: u64 size follows the type.
        if avail.len() < 16 {
            return Ok(None);
        }
        let size64 = u64::from_be_bytes([
            avail[8], avail[9], avail[10], avail[11], avail[12], avail[13], avail[14], avail[15],
        ]);
        let payload = size64.checked_sub(16).ok_or(DecodeError::InvalidBoxSize)?;
        Ok(Some(BoxHeader {
            ty,
            payload_size: payload,
            header_size: 16,
        }))
    } else {
        let payload = u64::from(size32)
            .checked_sub(8)
            .ok_or(DecodeError::InvalidBoxSize)?;
        Ok(Some(BoxHeader {
            ty,
            payload_size: payload,
            header_size: 8,
        }))
    }
}

/// Append a box header to `out`, choosing the compact form when the total
/// size fits in a u32.
pub fn write_box_header(out: &mut Vec<u8>, ty: BoxType, payload_size: u64) {
    let compact_total = payload_size + 8;
    if compact_total <= u64::from(u32::MAX) {
        out.extend_from_slice(&(compact_total as u32).to_be_bytes());
        out.extend_from_slice(&ty.0);
    } else {
        out.extend_from_slice(&0u32.to_be_bytes());
        out.extend_from_slice(&ty.0);
        out.extend_from_slice(&(payload_size + 16).to_be_bytes());
    }
}
