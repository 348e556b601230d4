//! Decoders whose peak memory follows the sample size instead of the natural size

use imageproc::image::{DynamicImage, GrayAlphaImage, GrayImage, RgbImage, RgbaImage};
use jpeg_decoder::PixelFormat;

use crate::error::{Error, Result};

use super::{Codec, Dimensions, ImageSource, SampleSize};

/// Stream a PNG row by row, keeping every `sample`-th row and pixel.
///
/// Only one source row and the subsampled output are held at a time. Returns
/// `None` for layouts the row stream cannot subsample (interlaced images).
pub(super) fn decode_png(
    codec: &Codec,
    source: ImageSource,
    sample: SampleSize,
) -> Result<Option<DynamicImage>> {
    let mut decoder = png::Decoder::new(source.open()?);
    decoder.set_transformations(png::Transformations::EXPAND | png::Transformations::STRIP_16);
    let mut reader = decoder.read_info()?;

    let info = reader.info();
    if info.interlaced {
        return Ok(None);
    }
    let natural = Dimensions::new(info.width, info.height);

    let (color, depth) = reader.output_color_type();
    if depth != png::BitDepth::Eight || color == png::ColorType::Indexed {
        return Ok(None);
    }
    let channels = color.samples();

    let target = sample.scaled(natural);
    let mut pixels = codec.allocate_pixels(target, channels as u64)?;

    let step = sample.get() as usize;
    let mut out_rows = pixels.chunks_exact_mut(target.width as usize * channels);
    let mut y = 0usize;
    // read to the end so a corrupt tail still surfaces
    while let Some(row) = reader.next_row()? {
        if y % step == 0 {
            if let Some(dst) = out_rows.next() {
                let src = row.data().chunks_exact(channels).step_by(step);
                for (dst_px, src_px) in dst.chunks_exact_mut(channels).zip(src) {
                    dst_px.copy_from_slice(src_px);
                }
            }
        }
        y += 1;
    }

    let img = match color {
        png::ColorType::Grayscale => {
            GrayImage::from_raw(target.width, target.height, pixels).map(DynamicImage::ImageLuma8)
        }
        png::ColorType::GrayscaleAlpha => GrayAlphaImage::from_raw(target.width, target.height, pixels)
            .map(DynamicImage::ImageLumaA8),
        png::ColorType::Rgb => {
            RgbImage::from_raw(target.width, target.height, pixels).map(DynamicImage::ImageRgb8)
        }
        png::ColorType::Rgba | png::ColorType::Indexed => {
            RgbaImage::from_raw(target.width, target.height, pixels).map(DynamicImage::ImageRgba8)
        }
    };
    img.map(Some)
        .ok_or(Error::InvalidArgument("png rows do not match the image size"))
}

/// Decode a JPEG through DCT scaling, at the smallest of 1/1, 1/2, 1/4 or 1/8
/// that still covers `target`.
///
/// Returns `None` for pixel formats the `image` crate handles better (CMYK, 16 bit).
pub(super) fn decode_jpeg(
    codec: &Codec,
    source: ImageSource,
    target: Dimensions,
) -> Result<Option<DynamicImage>> {
    let mut decoder = jpeg_decoder::Decoder::new(source.open()?);
    decoder.read_info()?;

    let Some(info) = decoder.info() else {
        return Ok(None);
    };
    let channels = match info.pixel_format {
        PixelFormat::L8 => 1,
        PixelFormat::RGB24 => 3,
        _ => return Ok(None),
    };

    let requested_width = u16::try_from(target.width).unwrap_or(u16::MAX);
    let requested_height = u16::try_from(target.height).unwrap_or(u16::MAX);
    let (width, height) = decoder.scale(requested_width, requested_height)?;
    let scaled = Dimensions::new(width.into(), height.into());
    codec.check_bytes(scaled.pixels() * channels)?;

    let pixels = decoder.decode()?;
    let img = match channels {
        1 => GrayImage::from_raw(scaled.width, scaled.height, pixels).map(DynamicImage::ImageLuma8),
        _ => RgbImage::from_raw(scaled.width, scaled.height, pixels).map(DynamicImage::ImageRgb8),
    };
    img.map(Some)
        .ok_or(Error::InvalidArgument("jpeg pixels do not match the image size"))
}
