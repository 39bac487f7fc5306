//! The composite workflow end to end: load scenes, mask, rescale, select,
//! reduce, export and wait for the export.
use crate::cloud_mask::{apply_cloud_mask, normalize_quality_band};
use crate::collection::Scene;
use crate::composite::median_composite;
use crate::composite_request::{CompositeRequest, QualityConfig};
use crate::export::{monitor, report_outcome, ExportSink, PollOptions, TaskStatus};
use crate::grid::ExportGrid;
use crate::image_source::ImageSource;
use crate::raster::RasterImage;
use anyhow::Result;
use log::{debug, info};
use std::future::Future;

/// Mask, rescale and band-select one scene.
pub fn prepare_scene(
    scene: Scene,
    quality: &QualityConfig,
    bands: &[String],
) -> crate::error::Result<RasterImage> {
    let mut image = scene.image;
    normalize_quality_band(&mut image, &quality.band.name, quality.encoding)?;
    apply_cloud_mask(&mut image, &quality.band.name)?;
    debug!(
        "Scene {}: {} clear pixels after cloud masking",
        scene.metadata.id,
        image.valid_pixel_count()
    );
    image.rescale(quality.reflectance_scale).select(bands)
}

/// Build the median composite for `request` on `grid`.
pub async fn build_composite(
    source: &impl ImageSource,
    request: &CompositeRequest,
    grid: &ExportGrid,
) -> Result<RasterImage> {
    let filter = request.filter();
    let scenes = source.load(&filter, &request.bands_to_load(), grid).await?;
    info!("Image collection filtered: {} scenes", scenes.len());

    let bands = request.band_names();
    let images = scenes
        .into_iter()
        .map(|scene| {
            prepare_scene(scene, &request.quality, &bands)
        })
        .collect::<crate::error::Result<Vec<_>>>()?;

    let composite = median_composite(&images, &bands, grid.shape())?;
    info!("Median composite created.");
    Ok(composite)
}

/// Build the composite, export it through `sink` and wait for the export to
/// finish (or for `shutdown`).
pub async fn run<F>(
    request: &CompositeRequest,
    source: &impl ImageSource,
    sink: &impl ExportSink,
    shutdown: F,
) -> Result<TaskStatus>
where
    F: Future<Output = ()>,
{
    let export_request = request.export_request();
    let grid = export_request.grid()?;
    info!(
        "Export grid: {}x{} pixels in EPSG:{}",
        grid.width, grid.height, grid.epsg
    );

    let composite = build_composite(source, request, &grid).await?;

    let task = sink.submit(composite, &export_request)?;
    let options = PollOptions {
        interval: request.poll_interval(),
        timeout: request.timeout(),
    };
    let status = monitor(&task, &options, shutdown).await?;
    report_outcome(&status, &sink.location(&export_request));
    Ok(status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud_mask::QaEncoding;
    use crate::collection::SceneMetadata;
    use crate::image_source::BandAsset;
    use crate::study_area::BoundingBox;
    use approx::assert_relative_eq;
    use chrono::{TimeZone, Utc};
    use ndarray::array;

    fn quality(name: &str, encoding: QaEncoding) -> QualityConfig {
        QualityConfig {
            reflectance_scale: 10_000.0,
            encoding,
            band: BandAsset::new(name, &name.to_lowercase(), None),
        }
    }

    #[test]
    fn test_prepare_scene() {
        let scene = Scene {
            metadata: SceneMetadata {
                id: "a".to_string(),
                acquired: Utc.with_ymd_and_hms(2023, 4, 1, 9, 0, 0).unwrap(),
                cloud_cover: 1.0,
                footprint: BoundingBox::new(0.0, 0.0, 1.0, 1.0),
            },
            image: RasterImage::from_planes(vec![
                ("B8".to_string(), array![[5_000.0, 6_000.0]]),
                ("B4".to_string(), array![[10_000.0, 20_000.0]]),
                ("QA60".to_string(), array![[0.0, 2048.0]]),
            ])
            .unwrap(),
        };

        let image = prepare_scene(scene, &quality("QA60", QaEncoding::Qa60), &["B4".to_string()])
            .unwrap();
        assert_eq!(image.band_names(), &["B4"]);
        assert_relative_eq!(image.band("B4").unwrap()[[0, 0]], 1.0);
        assert_eq!(image.mask(), &array![[true, false]]);
    }

    #[test]
    fn test_prepare_scene_with_scene_classes() {
        let scene = Scene {
            metadata: SceneMetadata {
                id: "b".to_string(),
                acquired: Utc.with_ymd_and_hms(2023, 4, 2, 9, 0, 0).unwrap(),
                cloud_cover: 1.0,
                footprint: BoundingBox::new(0.0, 0.0, 1.0, 1.0),
            },
            image: RasterImage::from_planes(vec![
                ("B4".to_string(), array![[1_000.0, 2_000.0, 3_000.0]]),
                ("SCL".to_string(), array![[5.0, 9.0, 10.0]]),
            ])
            .unwrap(),
        };

        let image = prepare_scene(scene, &quality("SCL", QaEncoding::Scl), &["B4".to_string()])
            .unwrap();
        assert_eq!(image.mask(), &array![[true, false, false]]);
        assert_relative_eq!(image.band("B4").unwrap()[[0, 0]], 0.1);
    }
}
