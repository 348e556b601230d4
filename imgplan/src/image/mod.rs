//! Image size planning: probe, pick a sample size, decode and rotate under a memory budget

mod decode;
mod encode;
mod probe;
mod rotate;
mod sample;
mod scaled;

// Re-export public API
pub use decode::{decode_with_backoff, Codec, PixelDecoder};
pub use encode::{encode, OutputFormat, PngCompression};
pub use probe::{probe_dimensions, BoundsProbe, ExifReader, MetadataReader};
pub use rotate::{rotate_with_backoff, Extent, Transformer};
pub use sample::{compute_sample_size, sample_size_for};

use std::fs::File;
use std::io::{BufRead, BufReader, Cursor, Seek};
use std::path::Path;

pub use imageproc::image::DynamicImage;

use imageproc::image::{ImageFormat, ImageReader};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl Dimensions {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Build dimensions from signed values reported by a decoder or metadata,
    /// where a negative or zero side means the size could not be read.
    pub fn from_signed(width: i64, height: i64) -> Option<Self> {
        let width = u32::try_from(width).ok().filter(|w| *w > 0)?;
        let height = u32::try_from(height).ok().filter(|h| *h > 0)?;
        Some(Self { width, height })
    }

    pub fn pixels(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

impl From<(u32, u32)> for Dimensions {
    fn from((width, height): (u32, u32)) -> Self {
        Self { width, height }
    }
}

/// The largest resolution a caller wants to hold in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundingBox {
    max_width: u32,
    max_height: u32,
}

impl BoundingBox {
    pub fn new(max_width: u32, max_height: u32) -> Result<Self> {
        if max_width == 0 || max_height == 0 {
            return Err(Error::InvalidArgument("bounding box sides must be positive"));
        }
        Ok(Self {
            max_width,
            max_height,
        })
    }

    pub fn max_width(&self) -> u32 {
        self.max_width
    }

    pub fn max_height(&self) -> u32 {
        self.max_height
    }
}

/// Subsampling factor: decoding at `n` keeps roughly one pixel in `n` per axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SampleSize(u32);

impl SampleSize {
    pub const ONE: SampleSize = SampleSize(1);

    /// Values below one are treated as one.
    pub fn new(factor: u32) -> Self {
        SampleSize(factor.max(1))
    }

    pub fn get(self) -> u32 {
        self.0
    }

    pub fn doubled(self) -> Option<Self> {
        self.0.checked_mul(2).map(SampleSize)
    }

    /// Output size of a decode at this factor, rounding partial blocks up.
    pub fn scaled(self, dimensions: Dimensions) -> Dimensions {
        Dimensions {
            width: dimensions.width.div_ceil(self.0),
            height: dimensions.height.div_ceil(self.0),
        }
    }
}

impl Default for SampleSize {
    fn default() -> Self {
        SampleSize::ONE
    }
}

impl std::fmt::Display for SampleSize {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where encoded image data comes from. Embedded resources are `Bytes`.
#[derive(Debug, Clone, Copy)]
pub enum ImageSource<'a> {
    Path(&'a Path),
    Bytes(&'a [u8]),
}

pub(crate) trait BufReadSeek: BufRead + Seek {}

impl<T: BufRead + Seek> BufReadSeek for T {}

impl<'a> ImageSource<'a> {
    pub(crate) fn open(&self) -> Result<Box<dyn BufReadSeek + 'a>> {
        Ok(match *self {
            ImageSource::Path(path) => Box::new(BufReader::new(File::open(path)?)),
            ImageSource::Bytes(bytes) => Box::new(Cursor::new(bytes)),
        })
    }

    /// Reader with the format sniffed from content, falling back to the file extension.
    pub(crate) fn reader(&self) -> Result<ImageReader<Box<dyn BufReadSeek + 'a>>> {
        let mut reader = ImageReader::new(self.open()?).with_guessed_format()?;
        if reader.format().is_none() {
            if let ImageSource::Path(path) = self {
                if let Ok(format) = ImageFormat::from_path(path) {
                    reader.set_format(format);
                }
            }
        }
        Ok(reader)
    }

    pub fn describe(&self) -> String {
        match self {
            ImageSource::Path(path) => path.display().to_string(),
            ImageSource::Bytes(bytes) => format!("<{} bytes>", bytes.len()),
        }
    }
}

impl<'a> From<&'a Path> for ImageSource<'a> {
    fn from(path: &'a Path) -> Self {
        ImageSource::Path(path)
    }
}

impl<'a> From<&'a [u8]> for ImageSource<'a> {
    fn from(bytes: &'a [u8]) -> Self {
        ImageSource::Bytes(bytes)
    }
}

/// How the decode and rotate loops treat faults other than running out of memory.
///
/// `fault_retry_limit: None` retries forever with unchanged parameters, so a
/// fault that repeats on every attempt never returns. `Some(n)` hands the
/// fault back to the caller after `n` retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryPolicy {
    pub fault_retry_limit: Option<u32>,
}

impl RetryPolicy {
    pub fn unbounded() -> Self {
        Self {
            fault_retry_limit: None,
        }
    }

    pub fn limited(retries: u32) -> Self {
        Self {
            fault_retry_limit: Some(retries),
        }
    }
}

/// Counts non-memory faults seen by one retry loop.
pub(crate) struct FaultCounter {
    operation: &'static str,
    limit: Option<u32>,
    seen: u32,
}

impl FaultCounter {
    pub(crate) fn new(operation: &'static str, policy: RetryPolicy) -> Self {
        Self {
            operation,
            limit: policy.fault_retry_limit,
            seen: 0,
        }
    }

    /// Log the fault and decide whether the loop may go around again.
    pub(crate) fn record(&mut self, err: Error) -> Result<()> {
        log::error!("{} failed: {err:?}", self.operation);
        self.seen = self.seen.saturating_add(1);
        match self.limit {
            Some(limit) if self.seen > limit => Err(err),
            _ => Ok(()),
        }
    }
}

/// Ties the probe, the sample-size calculator and the bounded decoder together.
#[derive(Debug, Clone, Default)]
pub struct Planner<C = Codec, M = ExifReader> {
    codec: C,
    metadata: M,
    policy: RetryPolicy,
}

impl<C, M> Planner<C, M> {
    pub fn new(codec: C, metadata: M) -> Self {
        Self {
            codec,
            metadata,
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }
}

impl<C: BoundsProbe, M: MetadataReader> Planner<C, M> {
    /// Natural size of the image, or `None` when neither the header nor the metadata tell.
    pub fn dimensions(&self, source: ImageSource) -> Option<Dimensions> {
        probe_dimensions(&self.codec, &self.metadata, source)
    }

    pub fn sample_size(&self, source: ImageSource, bounds: BoundingBox) -> SampleSize {
        sample_size_for(self.dimensions(source), bounds)
    }
}

impl<C: BoundsProbe + PixelDecoder, M: MetadataReader> Planner<C, M> {
    /// Decode `source` subsampled to fit `bounds`, backing off when memory runs short.
    pub fn decode(&self, source: ImageSource, bounds: BoundingBox) -> Result<DynamicImage> {
        let sample = self.sample_size(source, bounds);
        log::debug!("decoding {} at sample size {sample}", source.describe());
        decode_with_backoff(&self.codec, source, sample, self.policy)
    }
}

impl<C: Transformer, M> Planner<C, M> {
    pub fn rotate(&self, image: Option<&DynamicImage>, degrees: f32) -> Result<Option<DynamicImage>> {
        rotate_with_backoff(&self.codec, image, degrees, self.policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_dimensions_reject_sentinels() {
        assert_eq!(Dimensions::from_signed(-1, -1), None);
        assert_eq!(Dimensions::from_signed(640, -1), None);
        assert_eq!(Dimensions::from_signed(0, 480), None);
        assert_eq!(
            Dimensions::from_signed(640, 480),
            Some(Dimensions::new(640, 480))
        );
    }

    #[test]
    fn bounding_box_rejects_empty_sides() {
        assert!(matches!(
            BoundingBox::new(0, 10),
            Err(Error::InvalidArgument(_))
        ));
        assert!(BoundingBox::new(1, 1).is_ok());
    }

    #[test]
    fn sample_size_floors_at_one() {
        assert_eq!(SampleSize::new(0), SampleSize::ONE);
        assert_eq!(SampleSize::new(3).doubled(), Some(SampleSize::new(6)));
        assert_eq!(SampleSize::new(u32::MAX).doubled(), None);
    }

    #[test]
    fn scaled_rounds_partial_blocks_up() {
        let scaled = SampleSize::new(4).scaled(Dimensions::new(10, 7));
        assert_eq!(scaled, Dimensions::new(3, 2));
    }

    #[test]
    fn fault_counter_respects_limit() {
        let mut unbounded = FaultCounter::new("decode", RetryPolicy::unbounded());
        for _ in 0..100 {
            assert!(unbounded
                .record(Error::InvalidArgument("boom"))
                .is_ok());
        }

        // the count saturates instead of wrapping
        let mut long_running = FaultCounter {
            seen: u32::MAX,
            ..FaultCounter::new("decode", RetryPolicy::unbounded())
        };
        assert!(long_running.record(Error::InvalidArgument("boom")).is_ok());
        assert_eq!(long_running.seen, u32::MAX);

        let mut limited = FaultCounter::new("decode", RetryPolicy::limited(2));
        assert!(limited.record(Error::InvalidArgument("boom")).is_ok());
        assert!(limited.record(Error::InvalidArgument("boom")).is_ok());
        assert!(limited.record(Error::InvalidArgument("boom")).is_err());
    }
}
