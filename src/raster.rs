//! In-memory band-stacked rasters with a per-pixel validity mask.
use crate::error::{CompositeError, Result};
use ndarray::{Array2, Array3, Axis};

/// Digital numbers are divided by this to get surface reflectance.
pub const REFLECTANCE_SCALE: f32 = 10_000.0;

/// A multi-band raster. Values are laid out `(band, row, col)`; the mask is
/// shared by every band and `false` marks a pixel that later steps must skip.
#[derive(Debug, Clone, PartialEq)]
pub struct RasterImage {
    bands: Vec<String>,
    values: Array3<f32>,
    mask: Array2<bool>,
}

impl RasterImage {
    pub fn new(bands: Vec<String>, values: Array3<f32>) -> Result<Self> {
        let (band_count, rows, cols) = values.dim();
        if band_count != bands.len() {
            return Err(CompositeError::InvalidRaster(format!(
                "{} band names for {} bands of data",
                bands.len(),
                band_count
            )));
        }
        Ok(Self {
            bands,
            values,
            mask: Array2::from_elem((rows, cols), true),
        })
    }

    /// Build an image from separate band planes of identical shape.
    pub fn from_planes(planes: Vec<(String, Array2<f32>)>) -> Result<Self> {
        let shape = match planes.first() {
            Some((_, plane)) => plane.dim(),
            None => return Err(CompositeError::InvalidRaster("no bands".to_string())),
        };
        let mut values = Array3::from_elem((planes.len(), shape.0, shape.1), f32::NAN);
        let mut bands = Vec::with_capacity(planes.len());
        for (i, (name, plane)) in planes.into_iter().enumerate() {
            if plane.dim() != shape {
                return Err(CompositeError::ShapeMismatch {
                    expected: shape,
                    found: plane.dim(),
                });
            }
            values.index_axis_mut(Axis(0), i).assign(&plane);
            bands.push(name);
        }
        Self::new(bands, values)
    }

    pub fn with_mask(mut self, mask: Array2<bool>) -> Result<Self> {
        if mask.dim() != self.shape() {
            return Err(CompositeError::ShapeMismatch {
                expected: self.shape(),
                found: mask.dim(),
            });
        }
        self.mask = mask;
        Ok(self)
    }

    pub fn band_names(&self) -> &[String] {
        &self.bands
    }

    pub fn values(&self) -> &Array3<f32> {
        &self.values
    }

    pub fn mask(&self) -> &Array2<bool> {
        &self.mask
    }

    /// `(rows, cols)`
    pub fn shape(&self) -> (usize, usize) {
        self.mask.dim()
    }

    pub fn band_index(&self, name: &str) -> Result<usize> {
        self.bands
            .iter()
            .position(|b| b == name)
            .ok_or_else(|| CompositeError::MissingBand {
                band: name.to_string(),
                available: self.bands.clone(),
            })
    }

    pub fn band(&self, name: &str) -> Result<ndarray::ArrayView2<'_, f32>> {
        let index = self.band_index(name)?;
        Ok(self.values.index_axis(Axis(0), index))
    }

    pub fn band_mut(&mut self, name: &str) -> Result<ndarray::ArrayViewMut2<'_, f32>> {
        let index = self.band_index(name)?;
        Ok(self.values.index_axis_mut(Axis(0), index))
    }

    /// Invalidate every pixel where `keep` is false. Pixels already masked
    /// stay masked.
    pub fn update_mask(&mut self, keep: &Array2<bool>) -> Result<()> {
        if keep.dim() != self.shape() {
            return Err(CompositeError::ShapeMismatch {
                expected: self.shape(),
                found: keep.dim(),
            });
        }
        self.mask.zip_mut_with(keep, |m, &k| *m = *m && k);
        Ok(())
    }

    /// Divide every value by `scale`. The mask is untouched.
    pub fn rescale(mut self, scale: f32) -> Self {
        self.values.mapv_inplace(|v| v / scale);
        self
    }

    /// Keep only `names`, in that order.
    pub fn select<S: AsRef<str>>(&self, names: &[S]) -> Result<Self> {
        let indices = names
            .iter()
            .map(|n| self.band_index(n.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        let values = self.values.select(Axis(0), &indices);
        Ok(Self {
            bands: names.iter().map(|n| n.as_ref().to_string()).collect(),
            values,
            mask: self.mask.clone(),
        })
    }

    pub fn valid_pixel_count(&self) -> usize {
        self.mask.iter().filter(|&&m| m).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::{array, Array3};

    fn rgbn() -> RasterImage {
        let values = Array3::from_shape_fn((4, 2, 2), |(b, r, c)| (b * 100 + r * 10 + c) as f32);
        let bands = ["B2", "B3", "B4", "B8"].iter().map(|b| b.to_string()).collect();
        RasterImage::new(bands, values).unwrap()
    }

    #[test]
    fn test_rescale_reflectance() {
        let image = RasterImage::from_planes(vec![(
            "B4".to_string(),
            array![[10_000.0, 0.0], [5_000.0, 2_500.0]],
        )])
        .unwrap()
        .with_mask(array![[true, false], [true, true]])
        .unwrap();

        let scaled = image.rescale(REFLECTANCE_SCALE);
        let band = scaled.band("B4").unwrap();
        assert_relative_eq!(band[[0, 0]], 1.0);
        assert_relative_eq!(band[[0, 1]], 0.0);
        assert_relative_eq!(band[[1, 0]], 0.5);
        assert_eq!(scaled.mask(), &array![[true, false], [true, true]]);
    }

    #[test]
    fn test_rescale_by_one_is_identity() {
        let image = rgbn();
        assert_eq!(image.clone().rescale(1.0), image);
    }

    #[test]
    fn test_select_reorders_bands() {
        let image = rgbn();
        let selected = image.select(&["B4", "B3", "B2"]).unwrap();
        assert_eq!(selected.band_names(), &["B4", "B3", "B2"]);
        assert_eq!(selected.band("B4").unwrap()[[1, 1]], 211.0);
        assert_eq!(selected.values().dim(), (3, 2, 2));
    }

    #[test]
    fn test_select_missing_band() {
        let image = rgbn();
        match image.select(&["B4", "B11"]) {
            Err(CompositeError::MissingBand { band, available }) => {
                assert_eq!(band, "B11");
                assert_eq!(available.len(), 4);
            }
            other => panic!("expected MissingBand, got {:?}", other),
        }
    }

    #[test]
    fn test_update_mask_only_narrows() {
        let mut image = rgbn()
            .with_mask(array![[false, true], [true, true]])
            .unwrap();
        image.update_mask(&array![[true, true], [false, true]]).unwrap();
        assert_eq!(image.mask(), &array![[false, true], [false, true]]);
        assert_eq!(image.valid_pixel_count(), 2);
    }

    #[test]
    fn test_band_count_must_match_names() {
        let values = Array3::<f32>::zeros((2, 1, 1));
        assert!(RasterImage::new(vec!["B4".to_string()], values).is_err());
    }
}
