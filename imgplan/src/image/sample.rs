//! Sample-size calculation: how aggressively to subsample while decoding

use super::{BoundingBox, Dimensions, SampleSize};

/// Pick the downsampling factor that keeps a decode of `dimensions` within the
/// pixel budget of `bounds`.
///
/// The search is seeded with the rounded ratio of the shorter side to its box
/// side and then doubled until `width * height / factor²` fits inside
/// `max_width * max_height`. The seed itself is not necessarily a power of two.
pub fn compute_sample_size(dimensions: Dimensions, bounds: BoundingBox) -> SampleSize {
    let Dimensions { width, height } = dimensions;
    let (max_width, max_height) = (bounds.max_width(), bounds.max_height());

    if width <= max_width && height <= max_height {
        return SampleSize::ONE;
    }

    let seed = if width > height {
        (height as f64 / max_height as f64).round()
    } else {
        (width as f64 / max_width as f64).round()
    };

    // a zero seed never grows under doubling
    let mut factor = (seed as u32).max(1);

    let total_pixels = width as f64 * height as f64;
    let max_total_pixels = max_width as f64 * max_height as f64;

    while total_pixels / (factor as f64 * factor as f64) > max_total_pixels {
        match factor.checked_mul(2) {
            Some(next) => factor = next,
            None => break,
        }
    }

    log::trace!(
        "sample size for {width}x{height} in {max_width}x{max_height}: seed {seed}, factor {factor}"
    );

    SampleSize::new(factor)
}

/// Same as [`compute_sample_size`], treating unknown dimensions as needing no subsampling.
pub fn sample_size_for(dimensions: Option<Dimensions>, bounds: BoundingBox) -> SampleSize {
    match dimensions {
        Some(dimensions) => compute_sample_size(dimensions, bounds),
        None => SampleSize::ONE,
    }
}
