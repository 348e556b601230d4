//! Dimension probing without decoding pixel data

use crate::error::{Error, Result};

use super::{Codec, Dimensions, ImageSource};

/// Header-only size read. Allocates no pixel storage.
pub trait BoundsProbe {
    /// `None` when the header cannot be read or reports no usable size.
    fn probe_bounds(&self, source: ImageSource) -> Option<Dimensions>;
}

/// Reads width and height from metadata embedded in the container.
pub trait MetadataReader {
    fn read_dimensions(&self, source: ImageSource) -> Result<Option<Dimensions>>;
}

/// Natural size of `source`: the header first, embedded metadata second.
///
/// Metadata faults are logged and swallowed; the result then stays unknown.
pub fn probe_dimensions<P, M>(probe: &P, metadata: &M, source: ImageSource) -> Option<Dimensions>
where
    P: BoundsProbe + ?Sized,
    M: MetadataReader + ?Sized,
{
    if let Some(dimensions) = probe.probe_bounds(source) {
        return Some(dimensions);
    }

    log::debug!(
        "bounds unreadable for {}, trying metadata",
        source.describe()
    );

    match metadata.read_dimensions(source) {
        Ok(dimensions) => dimensions,
        Err(e) => {
            log::warn!(
                "Failed to read metadata dimensions of {}: {:?}",
                source.describe(),
                e
            );
            None
        }
    }
}

impl BoundsProbe for Codec {
    fn probe_bounds(&self, source: ImageSource) -> Option<Dimensions> {
        let bounds = source
            .reader()
            .and_then(|reader| reader.into_dimensions().map_err(Error::from));

        match bounds {
            Ok((width, height)) => Dimensions::from_signed(width.into(), height.into()),
            Err(e) => {
                log::debug!("no bounds for {}: {}", source.describe(), e);
                None
            }
        }
    }
}

/// EXIF-backed [`MetadataReader`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ExifReader;

impl MetadataReader for ExifReader {
    fn read_dimensions(&self, source: ImageSource) -> Result<Option<Dimensions>> {
        let mut reader = source.open()?;
        let exif = exif::Reader::new().read_from_container(&mut reader)?;

        let field = |tag: exif::Tag| {
            exif.get_field(tag, exif::In::PRIMARY)
                .and_then(|f| f.value.get_uint(0))
                .map(i64::from)
        };

        let width = field(exif::Tag::ImageWidth).or_else(|| field(exif::Tag::PixelXDimension));
        let height = field(exif::Tag::ImageLength).or_else(|| field(exif::Tag::PixelYDimension));

        Ok(match (width, height) {
            (Some(width), Some(height)) => Dimensions::from_signed(width, height),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct Fixed(Option<Dimensions>);

    impl BoundsProbe for Fixed {
        fn probe_bounds(&self, _: ImageSource) -> Option<Dimensions> {
            self.0
        }
    }

    struct Metadata {
        result: fn() -> Result<Option<Dimensions>>,
        calls: Cell<u32>,
    }

    impl MetadataReader for Metadata {
        fn read_dimensions(&self, _: ImageSource) -> Result<Option<Dimensions>> {
            self.calls.set(self.calls.get() + 1);
            (self.result)()
        }
    }

    const SOURCE: ImageSource<'static> = ImageSource::Bytes(&[]);

    #[test]
    fn header_wins_without_touching_metadata() {
        let metadata = Metadata {
            result: || Ok(Some(Dimensions::new(1, 1))),
            calls: Cell::new(0),
        };
        let dims = probe_dimensions(&Fixed(Some(Dimensions::new(640, 480))), &metadata, SOURCE);
        assert_eq!(dims, Some(Dimensions::new(640, 480)));
        assert_eq!(metadata.calls.get(), 0);
    }

    #[test]
    fn metadata_fills_in_unknown_bounds() {
        let metadata = Metadata {
            result: || Ok(Some(Dimensions::new(4000, 3000))),
            calls: Cell::new(0),
        };
        let dims = probe_dimensions(&Fixed(None), &metadata, SOURCE);
        assert_eq!(dims, Some(Dimensions::new(4000, 3000)));
        assert_eq!(metadata.calls.get(), 1);
    }

    #[test]
    fn metadata_faults_leave_size_unknown() {
        let metadata = Metadata {
            result: || Err(Error::out_of_memory(1 << 30)),
            calls: Cell::new(0),
        };
        assert_eq!(probe_dimensions(&Fixed(None), &metadata, SOURCE), None);

        let metadata = Metadata {
            result: || Err(Error::Io(std::io::ErrorKind::UnexpectedEof.into())),
            calls: Cell::new(0),
        };
        assert_eq!(probe_dimensions(&Fixed(None), &metadata, SOURCE), None);
    }

    #[test]
    fn exif_reader_fails_on_garbage() {
        let garbage = [0u8, 1, 2, 3, 4, 5, 6, 7];
        assert!(ExifReader
            .read_dimensions(ImageSource::Bytes(&garbage))
            .is_err());
    }
}
