//! Per-pixel median compositing of a masked image stack.
use crate::error::{CompositeError, Result};
use crate::raster::RasterImage;
use log::{debug, info};
use ndarray::{Array2, Array3};

/// Median of `values`, averaging the two middle values for even counts.
/// Returns `None` for an empty slice. The slice is reordered.
pub fn median(values: &mut [f32]) -> Option<f32> {
    if values.is_empty() {
        return None;
    }
    values.sort_unstable_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        Some((values[mid - 1] + values[mid]) / 2.0)
    } else {
        Some(values[mid])
    }
}

/// Reduce `images` to one image holding, for every band and pixel, the median
/// over the images where that pixel is valid. Pixels valid in no image are
/// `NaN` and masked. A pixel is also masked when some band is `NaN` in every
/// contributing image, so a valid pixel has a value in every band.
///
/// `bands` and `shape` describe the output so that an empty collection still
/// yields an (all no-data) composite. Every image must carry exactly `bands`
/// in that order and have `shape`.
pub fn median_composite<S: AsRef<str>>(
    images: &[RasterImage],
    bands: &[S],
    shape: (usize, usize),
) -> Result<RasterImage> {
    let band_names = bands
        .iter()
        .map(|b| b.as_ref().to_string())
        .collect::<Vec<_>>();

    for image in images {
        if image.band_names() != band_names.as_slice() {
            return Err(CompositeError::BandMismatch {
                expected: band_names,
                found: image.band_names().to_vec(),
            });
        }
        if image.shape() != shape {
            return Err(CompositeError::ShapeMismatch {
                expected: shape,
                found: image.shape(),
            });
        }
    }

    if images.is_empty() {
        info!("Empty collection, composite is entirely no-data");
    }

    let (rows, cols) = shape;
    let mut values = Array3::from_elem((band_names.len(), rows, cols), f32::NAN);
    let mut mask = Array2::from_elem(shape, false);
    let mut stack: Vec<f32> = Vec::with_capacity(images.len());

    for row in 0..rows {
        for col in 0..cols {
            let contributors = images
                .iter()
                .filter(|image| image.mask()[[row, col]])
                .collect::<Vec<_>>();
            if contributors.is_empty() {
                continue;
            }
            let mut complete = true;
            for band in 0..band_names.len() {
                stack.clear();
                stack.extend(
                    contributors
                        .iter()
                        .map(|image| image.values()[[band, row, col]])
                        .filter(|v| !v.is_nan()),
                );
                match median(&mut stack) {
                    Some(m) => values[[band, row, col]] = m,
                    None => complete = false,
                }
            }
            // a band with no sample leaves the pixel masked
            mask[[row, col]] = complete;
        }
    }

    let composite = RasterImage::new(band_names, values)?.with_mask(mask)?;
    debug!(
        "Composite of {} images: {} of {} pixels valid",
        images.len(),
        composite.valid_pixel_count(),
        rows * cols
    );
    Ok(composite)
}
