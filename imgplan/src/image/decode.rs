//! Subsampled decoding with out-of-memory backoff

use fast_image_resize as fr;
use fr::images::Image as FrImage;
use imageproc::image::{DynamicImage, GrayImage, ImageFormat, Limits, RgbImage, RgbaImage};

use crate::error::{Error, Result};

use super::{scaled, Dimensions, FaultCounter, ImageSource, RetryPolicy, SampleSize};

/// Decodes pixel data, keeping roughly one pixel in `sample` per axis.
pub trait PixelDecoder {
    fn decode(&self, source: ImageSource, sample: SampleSize) -> Result<DynamicImage>;
}

/// Decode `source`, doubling the sample size every time memory runs out.
///
/// Out-of-memory faults retry immediately with no cap; each retry asks for a
/// quarter of the previous allocation. Any other fault is logged and retried
/// with the same sample size, as many times as `policy` allows.
pub fn decode_with_backoff<D>(
    decoder: &D,
    source: ImageSource,
    sample: SampleSize,
    policy: RetryPolicy,
) -> Result<DynamicImage>
where
    D: PixelDecoder + ?Sized,
{
    let mut sample = sample;
    let mut faults = FaultCounter::new("decode", policy);

    loop {
        match decoder.decode(source, sample) {
            Ok(img) => return Ok(img),
            Err(e) if e.is_out_of_memory() => {
                log::warn!(
                    "Out of memory decoding {} at sample size {sample}: {e}",
                    source.describe()
                );
                sample = sample
                    .doubled()
                    .ok_or(Error::ResourceExhausted(sample.get()))?;
            }
            Err(e) => faults.record(e)?,
        }
    }
}

/// Default codec on top of the `image` crate.
///
/// `max_alloc` caps the bytes a single decode or rotation may hold for pixels;
/// a request above it fails with [`Error::OutOfMemory`] the same way an
/// exhausted heap would. PNG and JPEG decode straight to the sampled size, so
/// a larger sample always asks for less.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Codec {
    pub max_alloc: Option<u64>,
}

pub(crate) const BYTES_PER_PIXEL: u64 = 4;

impl Codec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_alloc(max_alloc: u64) -> Self {
        Self {
            max_alloc: Some(max_alloc),
        }
    }

    pub(crate) fn check_bytes(&self, requested: u64) -> Result<u64> {
        if self.max_alloc.is_some_and(|max| requested > max) {
            return Err(Error::out_of_memory(requested));
        }
        Ok(requested)
    }

    /// Bytes an RGBA buffer of `dimensions` takes, if the budget allows it.
    pub(crate) fn check_budget(&self, dimensions: Dimensions) -> Result<u64> {
        self.check_bytes(dimensions.pixels() * BYTES_PER_PIXEL)
    }

    /// Reserve a zeroed RGBA buffer for `dimensions`, honouring the budget.
    pub(crate) fn allocate(&self, dimensions: Dimensions) -> Result<Vec<u8>> {
        self.allocate_pixels(dimensions, BYTES_PER_PIXEL)
    }

    pub(crate) fn allocate_pixels(&self, dimensions: Dimensions, channels: u64) -> Result<Vec<u8>> {
        let requested = self.check_bytes(dimensions.pixels() * channels)?;
        let len = usize::try_from(requested).map_err(|_| Error::out_of_memory(requested))?;
        let mut buffer = Vec::new();
        buffer
            .try_reserve_exact(len)
            .map_err(|_| Error::out_of_memory(requested))?;
        buffer.resize(len, 0);
        Ok(buffer)
    }

    /// Full decode for formats without a scaled path, bounded by the budget.
    fn decode_full(&self, source: ImageSource) -> Result<DynamicImage> {
        let mut reader = source.reader()?;
        let mut limits = Limits::default();
        if self.max_alloc.is_some() {
            limits.max_alloc = self.max_alloc;
        }
        reader.limits(limits);
        Ok(reader.decode()?)
    }

    /// Nearest-neighbour reduction of `img` to `target`, one source pixel per block.
    fn subsample(&self, img: DynamicImage, target: Dimensions) -> Result<DynamicImage> {
        let img = match img {
            DynamicImage::ImageLuma8(_) | DynamicImage::ImageRgb8(_) | DynamicImage::ImageRgba8(_) => img,
            other => DynamicImage::ImageRgba8(other.into_rgba8()),
        };
        let (pixel_type, channels) = match &img {
            DynamicImage::ImageLuma8(_) => (fr::PixelType::U8, 1),
            DynamicImage::ImageRgb8(_) => (fr::PixelType::U8x3, 3),
            _ => (fr::PixelType::U8x4, 4),
        };

        let mut dst_buffer = self.allocate_pixels(target, channels)?;

        let src_image = FrImage::from_vec_u8(img.width(), img.height(), img.into_bytes(), pixel_type)?;
        let mut dst_image =
            FrImage::from_slice_u8(target.width, target.height, &mut dst_buffer, pixel_type)?;

        let mut resizer = fr::Resizer::new();
        resizer.resize(
            &src_image,
            &mut dst_image,
            Some(&fr::ResizeOptions::new().resize_alg(fr::ResizeAlg::Nearest)),
        )?;

        let (width, height) = (target.width, target.height);
        let img = match channels {
            1 => GrayImage::from_raw(width, height, dst_buffer).map(DynamicImage::ImageLuma8),
            3 => RgbImage::from_raw(width, height, dst_buffer).map(DynamicImage::ImageRgb8),
            _ => RgbaImage::from_raw(width, height, dst_buffer).map(DynamicImage::ImageRgba8),
        };
        img.ok_or(Error::InvalidArgument("decoded buffer does not match its size"))
    }
}

impl PixelDecoder for Codec {
    fn decode(&self, source: ImageSource, sample: SampleSize) -> Result<DynamicImage> {
        let reader = source.reader()?;
        let format = reader.format();
        let natural = Dimensions::from(reader.into_dimensions()?);
        let target = sample.scaled(natural);

        // an oversized request fails before any pixel is decoded
        self.check_budget(target)?;

        let reduced = match format {
            Some(ImageFormat::Png) => scaled::decode_png(self, source, sample)?,
            Some(ImageFormat::Jpeg) => scaled::decode_jpeg(self, source, target)?,
            _ => None,
        };
        let img = match reduced {
            Some(img) => img,
            None => self.decode_full(source)?,
        };

        let img = if (img.width(), img.height()) == (target.width, target.height) {
            img
        } else {
            self.subsample(img, target)?
        };

        log::trace!(
            "decoded {} from {}x{} to {}x{}",
            source.describe(),
            natural.width,
            natural.height,
            target.width,
            target.height
        );
        Ok(img)
    }
}
