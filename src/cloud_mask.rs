//! Cloud and cirrus masking from the Sentinel-2 QA60 band, or from the
//! scene classification layer (SCL) translated to QA60 bits.
use crate::error::Result;
use crate::raster::RasterImage;
use serde::{Deserialize, Serialize};

pub const CLOUD_BIT_MASK: u32 = 1 << 10;
pub const CIRRUS_BIT_MASK: u32 = 1 << 11;

pub const SCL_CLOUD_MEDIUM_PROBABILITY: u32 = 8;
pub const SCL_CLOUD_HIGH_PROBABILITY: u32 = 9;
pub const SCL_THIN_CIRRUS: u32 = 10;

/// How the quality band flags clouds.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum QaEncoding {
    /// Bit 10 opaque clouds, bit 11 cirrus.
    #[default]
    Qa60,
    /// L2A scene classes.
    Scl,
}

/// QA60 bits equivalent to an SCL class.
pub fn scl_to_qa60(class: u32) -> u32 {
    match class {
        SCL_CLOUD_MEDIUM_PROBABILITY | SCL_CLOUD_HIGH_PROBABILITY => CLOUD_BIT_MASK,
        SCL_THIN_CIRRUS => CIRRUS_BIT_MASK,
        _ => 0,
    }
}

/// Rewrite `qa_band` in place as QA60 bits. NaN and negative samples are
/// left as they are so they still count as not clear.
pub fn normalize_quality_band(
    image: &mut RasterImage,
    qa_band: &str,
    encoding: QaEncoding,
) -> Result<()> {
    if encoding == QaEncoding::Scl {
        image.band_mut(qa_band)?.mapv_inplace(|sample| {
            if sample.is_finite() && sample >= 0.0 {
                scl_to_qa60(sample as u32) as f32
            } else {
                sample
            }
        });
    }
    Ok(())
}

/// Both the cloud and the cirrus flags must be unset for a pixel to be kept.
#[inline]
pub fn is_clear(qa: u32) -> bool {
    (qa & CLOUD_BIT_MASK) == 0 && (qa & CIRRUS_BIT_MASK) == 0
}

/// QA samples arrive as `f32` after decoding and resampling. No-data and
/// negative samples cannot be trusted, so they count as not clear.
#[inline]
fn is_clear_sample(sample: f32) -> bool {
    sample.is_finite() && sample >= 0.0 && is_clear(sample as u32)
}

/// Invalidate every pixel of `image` whose `qa_band` sample is flagged.
pub fn apply_cloud_mask(image: &mut RasterImage, qa_band: &str) -> Result<()> {
    let keep = image.band(qa_band)?.mapv(is_clear_sample);
    image.update_mask(&keep)
}
