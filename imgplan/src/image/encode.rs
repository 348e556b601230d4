//! Image encoding: JPEG, PNG

use imageproc::image::codecs::jpeg::JpegEncoder;
use imageproc::image::codecs::png::{CompressionType, FilterType, PngEncoder};
use imageproc::image::{ColorType, DynamicImage, ImageEncoder};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum PngCompression {
    Fast,
    Default,
    Best,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum OutputFormat {
    Jpeg { quality: u8 },
    Png { compression: PngCompression },
}

impl Default for OutputFormat {
    fn default() -> Self {
        OutputFormat::Png {
            compression: PngCompression::Default,
        }
    }
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Jpeg { .. } => "jpg",
            OutputFormat::Png { .. } => "png",
        }
    }
}

/// Encode `img` into `writer` in the requested format
pub fn encode<W>(img: &DynamicImage, writer: &mut W, format: OutputFormat) -> Result<()>
where
    W: std::io::Write,
{
    match format {
        OutputFormat::Jpeg { quality } => compress_to_jpeg(img, writer, quality),
        OutputFormat::Png { compression } => compress_to_png(img, writer, compression),
    }
}

fn compress_to_jpeg<W>(img: &DynamicImage, writer: &mut W, quality: u8) -> Result<()>
where
    W: std::io::Write,
{
    // JPEG carries no alpha channel
    let img = match img.color() {
        ColorType::L8 | ColorType::Rgb8 => img.clone(),
        ColorType::La8 | ColorType::L16 | ColorType::La16 => DynamicImage::from(img.to_luma8()),
        _ => DynamicImage::from(img.to_rgb8()),
    };

    let encoder = JpegEncoder::new_with_quality(writer, quality.clamp(1, 100));
    encoder.write_image(
        img.as_bytes(),
        img.width(),
        img.height(),
        img.color().into(),
    )?;

    Ok(())
}

fn compress_to_png<W>(img: &DynamicImage, writer: &mut W, compression: PngCompression) -> Result<()>
where
    W: std::io::Write,
{
    let compression_type = match compression {
        PngCompression::Fast => CompressionType::Fast,
        PngCompression::Default => CompressionType::Default,
        PngCompression::Best => CompressionType::Best,
    };

    let is_grayscale = img.color() == ColorType::L8 || img.color() == ColorType::La8;

    let encoder = PngEncoder::new_with_quality(
        writer,
        compression_type,
        if is_grayscale {
            FilterType::NoFilter
        } else {
            FilterType::Adaptive
        },
    );

    encoder.write_image(
        img.as_bytes(),
        img.width(),
        img.height(),
        img.color().into(),
    )?;

    Ok(())
}
