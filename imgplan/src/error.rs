//! Fault taxonomy shared by the planner and the validity helpers

use imageproc::image::error::{ImageError, LimitErrorKind};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An allocation did not fit the memory budget, or the allocator refused it.
    /// Recovered by the decode and rotate loops, never surfaced by them.
    #[error("out of memory{}", requested_suffix(.requested))]
    OutOfMemory { requested: Option<u64> },

    /// Backoff ran out of room: the sample size can no longer be doubled.
    #[error("sample size cannot grow past {0}")]
    ResourceExhausted(u32),

    /// Rotation backoff shrank the working extent to nothing.
    #[error("rotation extent cannot shrink below {width}x{height}")]
    ExtentExhausted { width: u32, height: u32 },

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("image error: {0}")]
    Image(ImageError),

    #[error("png error: {0}")]
    Png(png::DecodingError),

    #[error("jpeg error: {0}")]
    Jpeg(#[from] jpeg_decoder::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("metadata error: {0}")]
    Metadata(#[from] exif::Error),

    #[error("resize error: {0}")]
    Resize(#[from] fast_image_resize::ResizeError),

    #[error("buffer error: {0}")]
    Buffer(#[from] fast_image_resize::ImageBufferError),
}

fn requested_suffix(requested: &Option<u64>) -> String {
    requested
        .map(|bytes| format!(" ({bytes} bytes requested)"))
        .unwrap_or_default()
}

impl Error {
    pub fn out_of_memory(requested: u64) -> Self {
        Error::OutOfMemory {
            requested: Some(requested),
        }
    }

    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, Error::OutOfMemory { .. })
    }
}

impl From<ImageError> for Error {
    fn from(err: ImageError) -> Self {
        match err {
            ImageError::Limits(ref limit) if limit.kind() == LimitErrorKind::InsufficientMemory => {
                Error::OutOfMemory { requested: None }
            }
            ImageError::IoError(io) => Error::Io(io),
            other => Error::Image(other),
        }
    }
}

impl From<png::DecodingError> for Error {
    fn from(err: png::DecodingError) -> Self {
        match err {
            png::DecodingError::LimitsExceeded => Error::OutOfMemory { requested: None },
            png::DecodingError::IoError(io) => Error::Io(io),
            other => Error::Png(other),
        }
    }
}

#[test]
fn insufficient_memory_maps_to_out_of_memory() {
    use imageproc::image::error::LimitError;

    let err: Error = ImageError::Limits(LimitError::from_kind(LimitErrorKind::InsufficientMemory)).into();
    assert!(err.is_out_of_memory());

    let err: Error =
        ImageError::Limits(LimitError::from_kind(LimitErrorKind::DimensionError)).into();
    assert!(!err.is_out_of_memory());
}

#[test]
fn png_limits_map_to_out_of_memory() {
    assert!(Error::from(png::DecodingError::LimitsExceeded).is_out_of_memory());

    let eof = std::io::Error::from(std::io::ErrorKind::UnexpectedEof);
    assert!(matches!(
        Error::from(png::DecodingError::IoError(eof)),
        Error::Io(_)
    ));
}

#[test]
fn out_of_memory_message_names_the_request() {
    assert_eq!(
        Error::out_of_memory(4096).to_string(),
        "out of memory (4096 bytes requested)"
    );
    assert_eq!(
        Error::OutOfMemory { requested: None }.to_string(),
        "out of memory"
    );
}
