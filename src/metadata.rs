//! Stream-level metadata records: basic info, color encoding, pixel formats.
//!
//! These are plain data records validated at construction; accessors do no
//! per-field revalidation.

use crate::error::{DecodeError, UsageError};

/// Sample storage width of decoded output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SampleType {
    #[default]
    U8,
    U16,
}

impl SampleType {
    pub fn bytes_per_sample(self) -> usize {
        match self {
            SampleType::U8 => 1,
            SampleType::U16 => 2,
        }
    }
}

/// Requested layout of decoded pixel output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelFormat {
    /// Interleaved channels per pixel.
    pub channels: u8,
    pub sample_type: SampleType,
}

impl PixelFormat {
    pub fn new(channels: u8, sample_type: SampleType) -> Self {
        Self {
            channels,
            sample_type,
        }
    }

    pub fn bytes_per_pixel(&self) -> usize {
        self.channels as usize * self.sample_type.bytes_per_sample()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Orientation {
    #[default]
    Identity = 1,
    FlipHorizontal = 2,
    Rotate180 = 3,
    FlipVertical = 4,
    Transpose = 5,
    Rotate90Cw = 6,
    AntiTranspose = 7,
    Rotate90Ccw = 8,
}

impl std::convert::TryFrom<u8> for Orientation {
    type Error = DecodeError;
    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            1 => Ok(Self::Identity),
            2 => Ok(Self::FlipHorizontal),
            3 => Ok(Self::Rotate180),
            4 => Ok(Self::FlipVertical),
            5 => Ok(Self::Transpose),
            6 => Ok(Self::Rotate90Cw),
            7 => Ok(Self::AntiTranspose),
            8 => Ok(Self::Rotate90Ccw),
            _ => Err(DecodeError::InvalidBasicInfo),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtraChannelType {
    Alpha = 0,
    Depth = 1,
    SpotColor = 2,
    SelectionMask = 3,
    Cfa = 4,
    Thermal = 5,
}

impl std::convert::TryFrom<u8> for ExtraChannelType {
    type Error = DecodeError;
    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Self::Alpha),
            1 => Ok(Self::Depth),
            2 => Ok(Self::SpotColor),
            3 => Ok(Self::SelectionMask),
            4 => Ok(Self::Cfa),
            5 => Ok(Self::Thermal),
            _ => Err(DecodeError::InvalidBasicInfo),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtraChannelInfo {
    pub channel_type: ExtraChannelType,
    pub bits_per_sample: u8,
    pub dim_shift: u8,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreviewInfo {
    pub xsize: u32,
    pub ysize: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnimationInfo {
    /// Ticks per second as a rational number.
    pub tps_numerator: u32,
    pub tps_denominator: u32,
    /// 0 means loop forever.
    pub num_loops: u32,
}

/// Container-level geometry and capability flags.
///
/// Produced exactly once per stream and immutable afterwards. All downstream
/// buffer-size calculations derive from this record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicInfo {
    pub xsize: u32,
    pub ysize: u32,
    pub bits_per_sample: u8,
    pub exponent_bits: u8,
    pub num_color_channels: u8,
    pub alpha_premultiplied: bool,
    pub uses_original_profile: bool,
    pub orientation: Orientation,
    pub preview: Option<PreviewInfo>,
    pub animation: Option<AnimationInfo>,
    pub extra_channels: Vec<ExtraChannelInfo>,
}

impl BasicInfo {
    /// Validate a freshly parsed record. Called at construction; the record
    /// is never mutated afterwards.
    pub(crate) fn validate(&self) -> Result<(), DecodeError> {
        if self.xsize == 0 || self.ysize == 0 {
            return Err(DecodeError::InvalidBasicInfo);
        }
        if self.bits_per_sample == 0 || self.bits_per_sample > 16 {
            return Err(DecodeError::InvalidBasicInfo);
        }
        if self.num_color_channels != 1 && self.num_color_channels != 3 {
            return Err(DecodeError::InvalidBasicInfo);
        }
        if let Some(preview) = &self.preview {
            if preview.xsize == 0 || preview.ysize == 0 {
                return Err(DecodeError::InvalidBasicInfo);
            }
        }
        if let Some(animation) = &self.animation {
            if animation.tps_numerator == 0 || animation.tps_denominator == 0 {
                return Err(DecodeError::InvalidBasicInfo);
            }
        }
        Ok(())
    }

    pub fn num_extra_channels(&self) -> u8 {
        self.extra_channels.len() as u8
    }

    /// Total interleaved channels carried by the codestream.
    pub fn total_channels(&self) -> usize {
        self.num_color_channels as usize + self.extra_channels.len()
    }

    /// Storage type of decoded samples for this stream.
    pub fn sample_type(&self) -> SampleType {
        if self.bits_per_sample <= 8 {
            SampleType::U8
        } else {
            SampleType::U16
        }
    }

    /// Whether extra channel 0 is an alpha channel.
    pub fn has_alpha(&self) -> bool {
        self.extra_channels
            .first()
            .is_some_and(|ec| ec.channel_type == ExtraChannelType::Alpha)
    }

    /// Eighth-resolution grid dimensions used by the DC path.
    pub fn dc_size(&self) -> (u32, u32) {
        (self.xsize.div_ceil(8), self.ysize.div_ceil(8))
    }

    /// Check that `format` is a valid output request for this stream:
    /// the color channel count (optionally plus alpha), or a single channel
    /// for extra-channel output, with the stream's sample type.
    pub(crate) fn check_format(&self, format: &PixelFormat, single: bool) -> Result<(), UsageError> {
        if format.sample_type != self.sample_type() {
            return Err(UsageError::InvalidArgument);
        }
        if single {
            if format.channels != 1 {
                return Err(UsageError::InvalidArgument);
            }
            return Ok(());
        }
        let color = self.num_color_channels;
        if format.channels == color || (format.channels == color + 1 && self.has_alpha()) {
            Ok(())
        } else {
            Err(UsageError::InvalidArgument)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorSpace {
    Rgb = 0,
    Gray = 1,
}

impl std::convert::TryFrom<u8> for ColorSpace {
    type Error = DecodeError;
    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Self::Rgb),
            1 => Ok(Self::Gray),
            _ => Err(DecodeError::InvalidColorEncoding),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WhitePoint {
    D65 = 0,
    E = 1,
    D50 = 2,
}

impl std::convert::TryFrom<u8> for WhitePoint {
    type Error = DecodeError;
    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Self::D65),
            1 => Ok(Self::E),
            2 => Ok(Self::D50),
            _ => Err(DecodeError::InvalidColorEncoding),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Primaries {
    Srgb = 0,
    Bt2100 = 1,
    P3 = 2,
}

impl std::convert::TryFrom<u8> for Primaries {
    type Error = DecodeError;
    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Self::Srgb),
            1 => Ok(Self::Bt2100),
            2 => Ok(Self::P3),
            _ => Err(DecodeError::InvalidColorEncoding),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferFunction {
    Srgb = 0,
    Linear = 1,
    Pq = 2,
    Hlg = 3,
}

impl std::convert::TryFrom<u8> for TransferFunction {
    type Error = DecodeError;
    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Self::Srgb),
            1 => Ok(Self::Linear),
            2 => Ok(Self::Pq),
            3 => Ok(Self::Hlg),
            _ => Err(DecodeError::InvalidColorEncoding),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderingIntent {
    Perceptual = 0,
    Relative = 1,
    Saturation = 2,
    Absolute = 3,
}

impl std::convert::TryFrom<u8> for RenderingIntent {
    type Error = DecodeError;
    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Self::Perceptual),
            1 => Ok(Self::Relative),
            2 => Ok(Self::Saturation),
            3 => Ok(Self::Absolute),
            _ => Err(DecodeError::InvalidColorEncoding),
        }
    }
}

/// Color interpretation of the decoded samples: an enumerated description
/// or a raw ICC profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColorEncoding {
    Enumerated {
        color_space: ColorSpace,
        white_point: WhitePoint,
        primaries: Primaries,
        transfer_function: TransferFunction,
        rendering_intent: RenderingIntent,
    },
    Icc(Vec<u8>),
}

impl ColorEncoding {
    /// A plain sRGB description, the most common enumerated encoding.
    pub fn srgb() -> Self {
        ColorEncoding::Enumerated {
            color_space: ColorSpace::Rgb,
            white_point: WhitePoint::D65,
            primaries: Primaries::Srgb,
            transfer_function: TransferFunction::Srgb,
            rendering_intent: RenderingIntent::Relative,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_info() -> BasicInfo {
        BasicInfo {
            xsize: 16,
            ysize: 16,
            bits_per_sample: 8,
            exponent_bits: 0,
            num_color_channels: 3,
            alpha_premultiplied: false,
            uses_original_profile: false,
            orientation: Orientation::Identity,
            preview: None,
            animation: None,
            extra_channels: Vec::new(),
        }
    }

    #[test]
    fn validation_rejects_degenerate_geometry() {
        assert!(minimal_info().validate().is_ok());

        let mut info = minimal_info();
        info.xsize = 0;
        assert_eq!(info.validate(), Err(DecodeError::InvalidBasicInfo));

        let mut info = minimal_info();
        info.bits_per_sample = 17;
        assert_eq!(info.validate(), Err(DecodeError::InvalidBasicInfo));

        let mut info = minimal_info();
        info.num_color_channels = 2;
        assert_eq!(info.validate(), Err(DecodeError::InvalidBasicInfo));

        let mut info = minimal_info();
        info.animation = Some(AnimationInfo {
            tps_numerator: 10,
            tps_denominator: 0,
            num_loops: 0,
        });
        assert_eq!(info.validate(), Err(DecodeError::InvalidBasicInfo));
    }

    #[test]
    fn format_checks() {
        let mut info = minimal_info();
        assert!(
            info.check_format(&PixelFormat::new(3, SampleType::U8), false)
                .is_ok()
        );
        // No alpha channel present, so 4 channels is not a valid request.
        assert_eq!(
            info.check_format(&PixelFormat::new(4, SampleType::U8), false),
            Err(UsageError::InvalidArgument)
        );
        info.extra_channels.push(ExtraChannelInfo {
            channel_type: ExtraChannelType::Alpha,
            bits_per_sample: 8,
            dim_shift: 0,
            name: String::new(),
        });
        assert!(
            info.check_format(&PixelFormat::new(4, SampleType::U8), false)
                .is_ok()
        );
        // Sample type must match the stream.
        assert_eq!(
            info.check_format(&PixelFormat::new(3, SampleType::U16), false),
            Err(UsageError::InvalidArgument)
        );
    }

    #[test]
    fn dc_size_rounds_up() {
        let mut info = minimal_info();
        info.xsize = 17;
        info.ysize = 8;
        assert_eq!(info.dc_size(), (3, 1));
    }
}
