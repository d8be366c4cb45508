//! Codestream segment framing.
//!
//! After the 2-byte magic, a codestream is a sequence of marker segments:
//! `0xFF <code> <len:u16 be> <payload>`, where `len` counts payload bytes
//! only. Frame pass sections follow their header segment unframed.

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::error::{DecodeError, UsageError};
use crate::frame::{BlendMode, CropInfo, FrameHeader};
use crate::metadata::{
    AnimationInfo, BasicInfo, ColorEncoding, ColorSpace, ExtraChannelInfo, ExtraChannelType,
    Orientation, PreviewInfo, Primaries, RenderingIntent, TransferFunction, WhitePoint,
};

pub const MARKER_START_BYTE: u8 = 0xFF;

/// Maximum payload bytes a single segment can carry.
pub const SEGMENT_MAX_PAYLOAD: usize = u16::MAX as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum MarkerCode {
    /// Stream geometry and capability flags; always the first segment.
    BasicInfo = 0xA1,
    /// Color encoding; always the second segment.
    ColorEncoding = 0xA2,
    /// Preview image payload, present iff basic info announces a preview.
    Preview = 0xA3,
    /// Frame header; pass sections follow unframed.
    FrameHeader = 0xC0,
}

/// A complete segment viewed in place.
#[derive(Debug)]
pub(crate) struct Segment<'a> {
    pub code: MarkerCode,
    pub payload: &'a [u8],
    /// Marker + length field + payload.
    pub total_len: usize,
}

/// Peek a complete segment at the front of `avail` without consuming.
///
/// `Ok(None)` means the segment is not yet fully present.
pub(crate) fn peek_segment(avail: &[u8]) -> Result<Option<Segment<'_>>, DecodeError> {
    if avail.len() < 4 {
        return Ok(None);
    }
    if avail[0] != MARKER_START_BYTE {
        return Err(DecodeError::InvalidMarker);
    }
    let code = MarkerCode::try_from(avail[1]).map_err(|_| DecodeError::InvalidMarker)?;
    let len = u16::from_be_bytes([avail[2], avail[3]]) as usize;
    if avail.len() < 4 + len {
        return Ok(None);
    }
    Ok(Some(Segment {
        code,
        payload: &avail[4..4 + len],
        total_len: 4 + len,
    }))
}

/// Append a framed segment to `out`.
pub(crate) fn write_segment(
    out: &mut Vec<u8>,
    code: MarkerCode,
    payload: &[u8],
) -> Result<(), UsageError> {
    if payload.len() > SEGMENT_MAX_PAYLOAD {
        return Err(UsageError::InvalidArgument);
    }
    out.push(MARKER_START_BYTE);
    out.push(code.into());
    out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    out.extend_from_slice(payload);
    Ok(())
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn u8(&mut self) -> Option<u8> {
        let v = *self.buf.get(self.pos)?;
        self.pos += 1;
        Some(v)
    }

    fn u16(&mut self) -> Option<u16> {
        Some(u16::from_be_bytes([self.u8()?, self.u8()?]))
    }

    fn u32(&mut self) -> Option<u32> {
        Some(u32::from_be_bytes([
            self.u8()?,
            self.u8()?,
            self.u8()?,
            self.u8()?,
        ]))
    }

    fn i32(&mut self) -> Option<i32> {
        self.u32().map(|v| v as i32)
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        let slice = self.buf.get(self.pos..end)?;
        self.pos = end;
        Some(slice)
    }

    fn done(&self) -> bool {
        self.pos == self.buf.len()
    }
}

const FLAG_ALPHA_PREMULTIPLIED: u8 = 1 << 0;
const FLAG_HAVE_PREVIEW: u8 = 1 << 1;
const FLAG_HAVE_ANIMATION: u8 = 1 << 2;
const FLAG_USES_ORIGINAL_PROFILE: u8 = 1 << 3;

pub(crate) fn parse_basic_info(payload: &[u8]) -> Result<BasicInfo, DecodeError> {
    let err = DecodeError::InvalidBasicInfo;
    let mut c = Cursor::new(payload);
    let xsize = c.u32().ok_or(err.clone())?;
    let ysize = c.u32().ok_or(err.clone())?;
    let bits_per_sample = c.u8().ok_or(err.clone())?;
    let exponent_bits = c.u8().ok_or(err.clone())?;
    let num_color_channels = c.u8().ok_or(err.clone())?;
    let num_extra = c.u8().ok_or(err.clone())?;
    let flags = c.u8().ok_or(err.clone())?;
    let orientation = Orientation::try_from(c.u8().ok_or(err.clone())?)?;

    let preview = if flags & FLAG_HAVE_PREVIEW != 0 {
        Some(PreviewInfo {
            xsize: c.u32().ok_or(err.clone())?,
            ysize: c.u32().ok_or(err.clone())?,
        })
    } else {
        None
    };
    let animation = if flags & FLAG_HAVE_ANIMATION != 0 {
        Some(AnimationInfo {
            tps_numerator: c.u32().ok_or(err.clone())?,
            tps_denominator: c.u32().ok_or(err.clone())?,
            num_loops: c.u32().ok_or(err.clone())?,
        })
    } else {
        None
    };

    let mut extra_channels = Vec::with_capacity(num_extra as usize);
    for _ in 0..num_extra {
        let channel_type = ExtraChannelType::try_from(c.u8().ok_or(err.clone())?)?;
        let bits = c.u8().ok_or(err.clone())?;
        let dim_shift = c.u8().ok_or(err.clone())?;
        let name_len = c.u8().ok_or(err.clone())? as usize;
        let name_bytes = c.take(name_len).ok_or(err.clone())?;
        let name = String::from_utf8(name_bytes.to_vec()).map_err(|_| err.clone())?;
        extra_channels.push(ExtraChannelInfo {
            channel_type,
            bits_per_sample: bits,
            dim_shift,
            name,
        });
    }
    if !c.done() {
        return Err(err);
    }

    let info = BasicInfo {
        xsize,
        ysize,
        bits_per_sample,
        exponent_bits,
        num_color_channels,
        alpha_premultiplied: flags & FLAG_ALPHA_PREMULTIPLIED != 0,
        uses_original_profile: flags & FLAG_USES_ORIGINAL_PROFILE != 0,
        orientation,
        preview,
        animation,
        extra_channels,
    };
    info.validate()?;
    Ok(info)
}

pub(crate) fn serialize_basic_info(info: &BasicInfo) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&info.xsize.to_be_bytes());
    out.extend_from_slice(&info.ysize.to_be_bytes());
    out.push(info.bits_per_sample);
    out.push(info.exponent_bits);
    out.push(info.num_color_channels);
    out.push(info.extra_channels.len() as u8);
    let mut flags = 0u8;
    if info.alpha_premultiplied {
        flags |= FLAG_ALPHA_PREMULTIPLIED;
    }
    if info.preview.is_some() {
        flags |= FLAG_HAVE_PREVIEW;
    }
    if info.animation.is_some() {
        flags |= FLAG_HAVE_ANIMATION;
    }
    if info.uses_original_profile {
        flags |= FLAG_USES_ORIGINAL_PROFILE;
    }
    out.push(flags);
    out.push(info.orientation as u8);
    if let Some(preview) = &info.preview {
        out.extend_from_slice(&preview.xsize.to_be_bytes());
        out.extend_from_slice(&preview.ysize.to_be_bytes());
    }
    if let Some(animation) = &info.animation {
        out.extend_from_slice(&animation.tps_numerator.to_be_bytes());
        out.extend_from_slice(&animation.tps_denominator.to_be_bytes());
        out.extend_from_slice(&animation.num_loops.to_be_bytes());
    }
    for ec in &info.extra_channels {
        out.push(ec.channel_type as u8);
        out.push(ec.bits_per_sample);
        out.push(ec.dim_shift);
        out.push(ec.name.len() as u8);
        out.extend_from_slice(ec.name.as_bytes());
    }
    out
}

const COLOR_KIND_ENUMERATED: u8 = 0;
const COLOR_KIND_ICC: u8 = 1;

pub(crate) fn parse_color_encoding(payload: &[u8]) -> Result<ColorEncoding, DecodeError> {
    let err = DecodeError::InvalidColorEncoding;
    let mut c = Cursor::new(payload);
    match c.u8().ok_or(err.clone())? {
        COLOR_KIND_ENUMERATED => {
            let encoding = ColorEncoding::Enumerated {
                color_space: ColorSpace::try_from(c.u8().ok_or(err.clone())?)?,
                white_point: WhitePoint::try_from(c.u8().ok_or(err.clone())?)?,
                primaries: Primaries::try_from(c.u8().ok_or(err.clone())?)?,
                transfer_function: TransferFunction::try_from(c.u8().ok_or(err.clone())?)?,
                rendering_intent: RenderingIntent::try_from(c.u8().ok_or(err.clone())?)?,
            };
            if !c.done() {
                return Err(err);
            }
            Ok(encoding)
        }
        COLOR_KIND_ICC => {
            let icc = &payload[1..];
            if icc.is_empty() {
                return Err(err);
            }
            Ok(ColorEncoding::Icc(icc.to_vec()))
        }
        _ => Err(err),
    }
}

pub(crate) fn serialize_color_encoding(encoding: &ColorEncoding) -> Vec<u8> {
    let mut out = Vec::new();
    match encoding {
        ColorEncoding::Enumerated {
            color_space,
            white_point,
            primaries,
            transfer_function,
            rendering_intent,
        } => {
            out.push(COLOR_KIND_ENUMERATED);
            out.push(*color_space as u8);
            out.push(*white_point as u8);
            out.push(*primaries as u8);
            out.push(*transfer_function as u8);
            out.push(*rendering_intent as u8);
        }
        ColorEncoding::Icc(icc) => {
            out.push(COLOR_KIND_ICC);
            out.extend_from_slice(icc);
        }
    }
    out
}

const FRAME_FLAG_IS_LAST: u8 = 1 << 0;
const FRAME_FLAG_HAVE_CROP: u8 = 1 << 1;
const FRAME_FLAG_HAVE_NAME: u8 = 1 << 2;
const FRAME_FLAG_HAVE_TIMECODE: u8 = 1 << 3;

pub(crate) fn parse_frame_header(payload: &[u8]) -> Result<FrameHeader, DecodeError> {
    let err = DecodeError::InvalidFrameHeader;
    let mut c = Cursor::new(payload);
    let flags = c.u8().ok_or(err.clone())?;
    let duration = c.u32().ok_or(err.clone())?;
    let timecode = if flags & FRAME_FLAG_HAVE_TIMECODE != 0 {
        Some(c.u32().ok_or(err.clone())?)
    } else {
        None
    };
    let name = if flags & FRAME_FLAG_HAVE_NAME != 0 {
        let len = c.u16().ok_or(err.clone())? as usize;
        let bytes = c.take(len).ok_or(err.clone())?;
        Some(String::from_utf8(bytes.to_vec()).map_err(|_| err.clone())?)
    } else {
        None
    };
    let crop = if flags & FRAME_FLAG_HAVE_CROP != 0 {
        Some(CropInfo {
            x0: c.i32().ok_or(err.clone())?,
            y0: c.i32().ok_or(err.clone())?,
            xsize: c.u32().ok_or(err.clone())?,
            ysize: c.u32().ok_or(err.clone())?,
        })
    } else {
        None
    };
    let blend_mode = BlendMode::try_from(c.u8().ok_or(err.clone())?)?;
    let num_passes = c.u8().ok_or(err.clone())?;
    let mut pass_sizes = Vec::with_capacity(num_passes as usize);
    for _ in 0..num_passes {
        pass_sizes.push(c.u32().ok_or(err.clone())?);
    }
    if !c.done() {
        return Err(err);
    }

    let header = FrameHeader {
        is_last: flags & FRAME_FLAG_IS_LAST != 0,
        duration,
        timecode,
        name,
        crop,
        blend_mode,
        num_passes,
        pass_sizes,
    };
    header.validate()?;
    Ok(header)
}

pub(crate) fn serialize_frame_header(header: &FrameHeader) -> Vec<u8> {
    let mut out = Vec::new();
    let mut flags = 0u8;
    if header.is_last {
        flags |= FRAME_FLAG_IS_LAST;
    }
    if header.crop.is_some() {
        flags |= FRAME_FLAG_HAVE_CROP;
    }
    if header.name.is_some() {
        flags |= FRAME_FLAG_HAVE_NAME;
    }
    if header.timecode.is_some() {
        flags |= FRAME_FLAG_HAVE_TIMECODE;
    }
    out.push(flags);
    out.extend_from_slice(&header.duration.to_be_bytes());
    if let Some(timecode) = header.timecode {
        out.extend_from_slice(&timecode.to_be_bytes());
    }
    if let Some(name) = &header.name {
        out.extend_from_slice(&(name.len() as u16).to_be_bytes());
        out.extend_from_slice(name.as_bytes());
    }
    if let Some(crop) = &header.crop {
        out.extend_from_slice(&crop.x0.to_be_bytes());
        out.extend_from_slice(&crop.y0.to_be_bytes());
        out.extend_from_slice(&crop.xsize.to_be_bytes());
        out.extend_from_slice(&crop.ysize.to_be_bytes());
    }
    out.push(header.blend_mode as u8);
    out.push(header.num_passes);
    for size in &header.pass_sizes {
        out.extend_from_slice(&size.to_be_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::SampleType;

    fn sample_info() -> BasicInfo {
        BasicInfo {
            xsize: 640,
            ysize: 480,
            bits_per_sample: 16,
            exponent_bits: 0,
            num_color_channels: 3,
            alpha_premultiplied: true,
            uses_original_profile: false,
            orientation: Orientation::Rotate90Cw,
            preview: Some(PreviewInfo {
                xsize: 80,
                ysize: 60,
            }),
            animation: Some(AnimationInfo {
                tps_numerator: 30,
                tps_denominator: 1,
                num_loops: 0,
            }),
            extra_channels: vec![ExtraChannelInfo {
                channel_type: ExtraChannelType::Alpha,
                bits_per_sample: 16,
                dim_shift: 0,
                name: "alpha".into(),
            }],
        }
    }

    #[test]
    fn basic_info_round_trip() {
        let info = sample_info();
        let bytes = serialize_basic_info(&info);
        let parsed = parse_basic_info(&bytes).unwrap();
        assert_eq!(parsed, info);
        assert_eq!(parsed.sample_type(), SampleType::U16);
        assert!(parsed.has_alpha());
    }

    #[test]
    fn basic_info_rejects_trailing_bytes() {
        let mut bytes = serialize_basic_info(&sample_info());
        bytes.push(0);
        assert_eq!(
            parse_basic_info(&bytes),
            Err(DecodeError::InvalidBasicInfo)
        );
    }

    #[test]
    fn color_encoding_round_trip() {
        for encoding in [ColorEncoding::srgb(), ColorEncoding::Icc(vec![1, 2, 3])] {
            let bytes = serialize_color_encoding(&encoding);
            assert_eq!(parse_color_encoding(&bytes).unwrap(), encoding);
        }
        assert_eq!(
            parse_color_encoding(&[COLOR_KIND_ICC]),
            Err(DecodeError::InvalidColorEncoding)
        );
        assert_eq!(
            parse_color_encoding(&[9]),
            Err(DecodeError::InvalidColorEncoding)
        );
    }

    #[test]
    fn frame_header_round_trip() {
        let header = FrameHeader {
            is_last: false,
            duration: 100,
            timecode: Some(0x00010203),
            name: Some("layer 1".into()),
            crop: Some(CropInfo {
                x0: -8,
                y0: 4,
                xsize: 32,
                ysize: 16,
            }),
            blend_mode: BlendMode::Add,
            num_passes: 2,
            pass_sizes: vec![12, 3456],
        };
        let bytes = serialize_frame_header(&header);
        assert_eq!(parse_frame_header(&bytes).unwrap(), header);
    }

    #[test]
    fn segment_framing() {
        let mut out = Vec::new();
        write_segment(&mut out, MarkerCode::ColorEncoding, &[1, 2, 3]).unwrap();
        assert_eq!(out[..2], [MARKER_START_BYTE, 0xA2]);

        // Incomplete: missing one payload byte.
        assert!(peek_segment(&out[..out.len() - 1]).unwrap().is_none());

        let segment = peek_segment(&out).unwrap().unwrap();
        assert_eq!(segment.code, MarkerCode::ColorEncoding);
        assert_eq!(segment.payload, &[1, 2, 3]);
        assert_eq!(segment.total_len, out.len());
    }

    #[test]
    fn unknown_marker_is_an_error() {
        // No segment code 0x01 exists.
        assert!(matches!(
            peek_segment(&[0xFF, 0x01, 0, 0]),
            Err(DecodeError::InvalidMarker)
        ));
        assert!(matches!(
            peek_segment(&[0x00, 0xA1, 0, 0]),
            Err(DecodeError::InvalidMarker)
        ));
    }
}
