//! Rotation with progressive downscale when memory runs out

use imageproc::geometric_transformations::{warp_into, Interpolation, Projection};
use imageproc::image::{imageops, DynamicImage, GenericImage, GenericImageView, Rgba, RgbaImage};

use crate::error::{Error, Result};

use super::decode::BYTES_PER_PIXEL;
use super::{Codec, Dimensions, FaultCounter, RetryPolicy};

// Each out-of-memory retry keeps this fraction of the working width and height
const SHRINK_FACTOR: f64 = 0.8;

/// Region of the source, anchored at its top-left corner, fed to a rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub width: u32,
    pub height: u32,
}

impl Extent {
    pub fn of(image: &DynamicImage) -> Self {
        Self {
            width: image.width(),
            height: image.height(),
        }
    }

    /// Both sides scaled by 0.8, truncated.
    pub fn shrunk(self) -> Self {
        Self {
            width: (self.width as f64 * SHRINK_FACTOR) as u32,
            height: (self.height as f64 * SHRINK_FACTOR) as u32,
        }
    }

    fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Resamples `extent` of `image` through a rotation into a new image.
pub trait Transformer {
    /// Positive `degrees` turn clockwise. The output is sized to the rotated bounds.
    fn transform(&self, image: &DynamicImage, degrees: f32, extent: Extent) -> Result<DynamicImage>;
}

/// Rotate `image` by `degrees`, shrinking the working extent whenever memory runs out.
///
/// A missing or empty (released) image yields `Ok(None)`. Other faults are
/// logged and retried with the same extent, as many times as `policy` allows.
/// Running out of memory when the extent cannot shrink further returns
/// [`Error::ExtentExhausted`], so a returned image is never empty.
pub fn rotate_with_backoff<T>(
    transformer: &T,
    image: Option<&DynamicImage>,
    degrees: f32,
    policy: RetryPolicy,
) -> Result<Option<DynamicImage>>
where
    T: Transformer + ?Sized,
{
    let Some(image) = image.filter(|img| !Extent::of(img).is_empty()) else {
        return Ok(None);
    };

    let mut extent = Extent::of(image);
    let mut faults = FaultCounter::new("rotate", policy);

    loop {
        match transformer.transform(image, degrees, extent) {
            Ok(rotated) => return Ok(Some(rotated)),
            Err(e) if e.is_out_of_memory() => {
                log::warn!(
                    "Out of memory rotating {}x{} by {degrees}: {e}",
                    extent.width,
                    extent.height
                );
                let shrunk = extent.shrunk();
                if shrunk.is_empty() {
                    return Err(Error::ExtentExhausted {
                        width: extent.width,
                        height: extent.height,
                    });
                }
                extent = shrunk;
            }
            Err(e) => faults.record(e)?,
        }
    }
}

/// Quarter turns clockwise when `degrees` is a multiple of 90.
fn quarter_turns(degrees: f32) -> Option<u8> {
    let degrees = degrees.rem_euclid(360.0);
    [0.0, 90.0, 180.0, 270.0, 360.0]
        .iter()
        .position(|q| (degrees - q).abs() < 1e-3)
        .map(|turns| (turns % 4) as u8)
}

/// Axis-aligned bounds of `extent` after rotating it by `degrees`.
fn rotated_bounds(extent: Extent, degrees: f32) -> Dimensions {
    match quarter_turns(degrees) {
        Some(0) | Some(2) => Dimensions::new(extent.width, extent.height),
        Some(_) => Dimensions::new(extent.height, extent.width),
        None => {
            let radians = (degrees as f64).to_radians();
            let (sin, cos) = (radians.sin().abs(), radians.cos().abs());
            let (width, height) = (extent.width as f64, extent.height as f64);
            Dimensions::new(
                (width * cos + height * sin).round() as u32,
                (width * sin + height * cos).round() as u32,
            )
        }
    }
}

fn quarter_turn<I>(source: &I, turns: u8, out: &mut RgbaImage) -> Result<()>
where
    I: GenericImageView<Pixel = Rgba<u8>>,
{
    match turns {
        0 => out.copy_from(source, 0, 0)?,
        1 => imageops::rotate90_in(source, out)?,
        2 => imageops::rotate180_in(source, out)?,
        _ => imageops::rotate270_in(source, out)?,
    }
    Ok(())
}

impl Transformer for Codec {
    fn transform(&self, image: &DynamicImage, degrees: f32, extent: Extent) -> Result<DynamicImage> {
        let extent = Extent {
            width: extent.width.min(image.width()),
            height: extent.height.min(image.height()),
        };
        if extent.is_empty() {
            return Err(Error::InvalidArgument("rotation extent is empty"));
        }

        let turns = quarter_turns(degrees);
        let bounds = rotated_bounds(extent, degrees);
        let whole = extent == Extent::of(image);

        // cropping and converting for the warp each take an RGBA-sized copy
        let copies = u64::from(!whole) + u64::from(turns.is_none() && image.as_rgba8().is_none());
        let region = Dimensions::new(extent.width, extent.height);
        self.check_bytes((bounds.pixels() + copies * region.pixels()) * BYTES_PER_PIXEL)?;

        let buffer = self.allocate(bounds)?;
        let mut out = RgbaImage::from_raw(bounds.width, bounds.height, buffer)
            .ok_or(Error::InvalidArgument("rotation buffer does not match its size"))?;

        let cropped;
        let source = if whole {
            image
        } else {
            cropped = image.crop_imm(0, 0, extent.width, extent.height);
            &cropped
        };

        match turns {
            Some(turns) => quarter_turn(source, turns, &mut out)?,
            None => {
                let converted;
                let rgba = match source.as_rgba8() {
                    Some(rgba) => rgba,
                    None => {
                        converted = source.to_rgba8();
                        &converted
                    }
                };
                let projection = Projection::translate(
                    bounds.width as f32 / 2.0,
                    bounds.height as f32 / 2.0,
                ) * Projection::rotate(degrees.to_radians())
                    * Projection::translate(
                        -(extent.width as f32) / 2.0,
                        -(extent.height as f32) / 2.0,
                    );
                warp_into(
                    rgba,
                    &projection,
                    Interpolation::Bilinear,
                    Rgba([0, 0, 0, 0]),
                    &mut out,
                );
            }
        }

        Ok(DynamicImage::ImageRgba8(out))
    }
}
