pub mod config;
pub mod error;
pub mod image;
pub mod validity;

// Re-export commonly used types
pub use config::PlannerConfig;
pub use error::{Error, Result};
pub use image::{
    compute_sample_size, BoundingBox, Codec, Dimensions, ExifReader, ImageSource, OutputFormat,
    Planner, PngCompression, RetryPolicy, SampleSize,
};
