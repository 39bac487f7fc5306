//! Where scenes come from: a STAC catalogue backed by s3/https assets, or an
//! in-memory collection.
use crate::collection::{CollectionFilter, Scene, SceneMetadata};
use crate::error::CompositeError;
use crate::geotiff;
use crate::grid::{ExportGrid, SamplePlan};
use crate::raster::RasterImage;
use crate::s3::{S3Location, S3ObjOps};
use crate::stac_operations::{self, asset_href};
use anyhow::Result;
use log::{debug, info, warn};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// A band of the composite and the catalogue asset it is read from.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct BandAsset {
    pub name: String,
    pub asset: String,
    /// Source value that means "no data". Matching samples become `NaN` and
    /// the pixel is masked.
    #[serde(default)]
    pub nodata: Option<f32>,
}

impl BandAsset {
    pub fn new(name: &str, asset: &str, nodata: Option<f32>) -> Self {
        Self {
            name: name.to_string(),
            asset: asset.to_string(),
            nodata,
        }
    }
}

pub trait ImageSource {
    /// Scenes matching `filter`, in acquisition order, each carrying
    /// `bands` on `grid`.
    async fn load(
        &self,
        filter: &CollectionFilter,
        bands: &[BandAsset],
        grid: &ExportGrid,
    ) -> Result<Vec<Scene>>;
}

/// Pixels where any band is `NaN` are outside the scene footprint.
fn footprint_mask(image: &RasterImage) -> Array2<bool> {
    let (rows, cols) = image.shape();
    let values = image.values();
    Array2::from_shape_fn((rows, cols), |(r, c)| {
        (0..values.dim().0).all(|b| !values[[b, r, c]].is_nan())
    })
}

/// Replace each band's nodata samples with `NaN`, then mask every pixel
/// outside the footprint.
fn apply_nodata(mut image: RasterImage, bands: &[BandAsset]) -> crate::error::Result<RasterImage> {
    for band in bands {
        if let Some(nodata) = band.nodata {
            image
                .band_mut(&band.name)?
                .mapv_inplace(|v| if v == nodata { f32::NAN } else { v });
        }
    }
    let footprint = footprint_mask(&image);
    image.update_mask(&footprint)?;
    Ok(image)
}

pub struct StacImageSource<P: S3ObjOps> {
    api: String,
    collection: String,
    /// Region the provider's client is bound to.
    region: String,
    provider: P,
    http: reqwest::Client,
}

impl<P: S3ObjOps> StacImageSource<P> {
    pub fn new(api: &str, collection: &str, region: &str, provider: P) -> Self {
        Self {
            api: api.to_owned(),
            collection: collection.to_owned(),
            region: region.to_owned(),
            provider,
            http: reqwest::Client::new(),
        }
    }

    async fn fetch(&self, href: &str) -> Result<Vec<u8>> {
        match S3Location::from_href(href) {
            Ok(location) if !location.is_in_region(&self.region) => debug!(
                "{} is outside {}, reading it over https",
                href, self.region
            ),
            Ok(location) => match self.provider.read_object(&location.bucket, &location.key).await {
                Ok(bytes) => return Ok(bytes),
                Err(e) if href.starts_with("https://") => {
                    warn!("s3 read of {} failed ({}), falling back to https", href, e);
                }
                Err(e) => return Err(e),
            },
            Err(_) => debug!("{} is not an s3 location", href),
        }
        let bytes = self
            .http
            .get(href)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        Ok(bytes.to_vec())
    }

    async fn load_item(
        &self,
        item: &stac::Item,
        bands: &[BandAsset],
        grid: &ExportGrid,
    ) -> Result<RasterImage> {
        let mut current_plan: Option<SamplePlan> = None;
        let mut planes = Vec::with_capacity(bands.len());

        for band in bands {
            let href = asset_href(item, &band.asset).ok_or_else(|| CompositeError::MissingBand {
                band: band.name.clone(),
                available: item.assets.keys().cloned().collect(),
            })?;
            debug!("Fetching {} ({}) from {}", band.name, band.asset, href);
            let bytes = self.fetch(href).await?;
            let raster = geotiff::decode(bytes)?.into_first_band()?;

            // bands of one scene normally share a CRS, so the plan is reused
            let plan = match current_plan.take() {
                Some(p) if p.source_epsg() == raster.epsg => p,
                _ => SamplePlan::new(grid, raster.epsg)?,
            };
            let plane = plan.resample(&raster)?;
            current_plan = Some(plan);
            planes.push((band.name.clone(), plane));
        }

        Ok(apply_nodata(RasterImage::from_planes(planes)?, bands)?)
    }
}

impl<P: S3ObjOps> ImageSource for StacImageSource<P> {
    async fn load(
        &self,
        filter: &CollectionFilter,
        bands: &[BandAsset],
        grid: &ExportGrid,
    ) -> Result<Vec<Scene>> {
        let body = stac_operations::search_body(&self.collection, filter);
        let items = stac_operations::search(&self.api, body).await?;

        let mut candidates = vec![];
        for item in items {
            match stac_operations::scene_metadata(&item) {
                Ok(metadata) => candidates.push((metadata, item)),
                Err(e) => warn!("Skipping item: {}", e),
            }
        }
        let candidates = filter.apply(
            candidates
                .into_iter()
                .map(|(metadata, item)| CandidateItem { metadata, item })
                .collect(),
        );
        let total = candidates.len();
        info!("{} scenes match the collection filter", total);

        let mut scenes = Vec::with_capacity(total);
        for (i, candidate) in candidates.into_iter().enumerate() {
            info!(
                "Loading scene {} ({}/{}), cloud cover {:.1}%",
                candidate.metadata.id,
                i + 1,
                total,
                candidate.metadata.cloud_cover
            );
            let image = self.load_item(&candidate.item, bands, grid).await?;
            scenes.push(Scene {
                metadata: candidate.metadata,
                image,
            });
        }
        Ok(scenes)
    }
}

struct CandidateItem {
    metadata: SceneMetadata,
    item: stac::Item,
}

impl AsRef<SceneMetadata> for CandidateItem {
    fn as_ref(&self) -> &SceneMetadata {
        &self.metadata
    }
}

/// A fixed collection of scenes already on the export grid.
#[derive(Default)]
pub struct InMemoryImageSource {
    scenes: Vec<Scene>,
}

impl InMemoryImageSource {
    pub fn new(scenes: Vec<Scene>) -> Self {
        Self { scenes }
    }
}

impl ImageSource for InMemoryImageSource {
    async fn load(
        &self,
        filter: &CollectionFilter,
        bands: &[BandAsset],
        grid: &ExportGrid,
    ) -> Result<Vec<Scene>> {
        let names = bands.iter().map(|b| b.name.as_str()).collect::<Vec<_>>();
        filter
            .apply(self.scenes.clone())
            .into_iter()
            .map(|scene| -> Result<Scene> {
                if scene.image.shape() != grid.shape() {
                    return Err(CompositeError::ShapeMismatch {
                        expected: grid.shape(),
                        found: scene.image.shape(),
                    }
                    .into());
                }
                let image = apply_nodata(scene.image.select(&names)?, bands)?;
                Ok(Scene {
                    metadata: scene.metadata,
                    image,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::study_area::{BoundingBox, StudyArea};
    use anyhow::anyhow;
    use aws_sdk_s3::operation::get_object::GetObjectOutput;
    use aws_sdk_s3::operation::head_bucket::HeadBucketOutput;
    use aws_sdk_s3::operation::put_object::PutObjectOutput;
    use chrono::{NaiveDate, TimeZone, Utc};
    use ndarray::array;
    use std::collections::HashMap;

    fn grid() -> ExportGrid {
        ExportGrid {
            epsg: 4326,
            bounds: BoundingBox::new(26.0, 44.0, 26.2, 44.1),
            pixel_width: 0.1,
            pixel_height: 0.1,
            width: 2,
            height: 1,
        }
    }

    fn scene(day: u32, cloud_cover: f64) -> Scene {
        Scene {
            metadata: SceneMetadata {
                id: format!("scene-{day}"),
                acquired: Utc.with_ymd_and_hms(2023, 5, day, 9, 0, 0).unwrap(),
                cloud_cover,
                footprint: BoundingBox::new(25.0, 44.0, 27.0, 45.0),
            },
            image: RasterImage::from_planes(vec![
                ("B8".to_string(), array![[1.0, 2.0]]),
                ("B4".to_string(), array![[3.0, 4.0]]),
                ("QA60".to_string(), array![[0.0, 1024.0]]),
            ])
            .unwrap(),
        }
    }

    fn filter() -> CollectionFilter {
        CollectionFilter {
            start: NaiveDate::from_ymd_opt(2023, 1, 1).unwrap(),
            end: NaiveDate::from_ymd_opt(2023, 12, 31).unwrap(),
            region: StudyArea::new(26.1, 44.4, 5_000.0),
            max_cloud_cover: 20.0,
        }
    }

    #[tokio::test]
    async fn test_in_memory_source_filters_and_selects() {
        let source = InMemoryImageSource::new(vec![scene(20, 1.0), scene(3, 50.0), scene(10, 2.0)]);
        let bands = vec![
            BandAsset::new("B4", "red", Some(0.0)),
            BandAsset::new("QA60", "qa60", None),
        ];
        let scenes = source.load(&filter(), &bands, &grid()).await.unwrap();

        let ids = scenes.iter().map(|s| s.metadata.id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["scene-10", "scene-20"]);
        assert_eq!(scenes[0].image.band_names(), &["B4", "QA60"]);
    }

    #[tokio::test]
    async fn test_in_memory_source_missing_band() {
        let source = InMemoryImageSource::new(vec![scene(20, 1.0)]);
        let bands = vec![BandAsset::new("B2", "blue", None)];
        let err = source.load(&filter(), &bands, &grid()).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CompositeError>(),
            Some(CompositeError::MissingBand { .. })
        ));
    }

    #[tokio::test]
    async fn test_in_memory_source_masks_nodata() {
        let mut nodata_scene = scene(12, 1.0);
        nodata_scene.image = RasterImage::from_planes(vec![
            ("B4".to_string(), array![[0.0, 5.0]]),
            ("QA60".to_string(), array![[0.0, 0.0]]),
        ])
        .unwrap();
        let source = InMemoryImageSource::new(vec![nodata_scene]);
        let bands = vec![
            BandAsset::new("B4", "red", Some(0.0)),
            BandAsset::new("QA60", "qa60", None),
        ];

        let scenes = source.load(&filter(), &bands, &grid()).await.unwrap();

        let image = &scenes[0].image;
        assert!(image.band("B4").unwrap()[[0, 0]].is_nan());
        assert_eq!(image.band("B4").unwrap()[[0, 1]], 5.0);
        // a zero QA sample means clear, not no-data
        assert_eq!(image.band("QA60").unwrap()[[0, 0]], 0.0);
        assert_eq!(image.mask(), &array![[false, true]]);
    }

    /// Serves objects from memory, keyed by `(bucket, key)`.
    struct MemoryStore {
        objects: HashMap<(String, String), Vec<u8>>,
    }

    impl S3ObjOps for MemoryStore {
        async fn get_object(&self, bucket: &str, key: &str) -> Result<GetObjectOutput> {
            Err(anyhow!("get_object is not served for s3://{}/{}", bucket, key))
        }

        async fn put_object(&self, bucket: &str, _key: &str, _body: Vec<u8>) -> Result<PutObjectOutput> {
            Err(anyhow!("{} is read-only", bucket))
        }

        async fn head_bucket(&self, bucket: &str) -> Result<HeadBucketOutput> {
            Err(anyhow!("{} is read-only", bucket))
        }

        async fn read_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
            self.objects
                .get(&(bucket.to_string(), key.to_string()))
                .cloned()
                .ok_or_else(|| anyhow!("NoSuchKey: s3://{}/{}", bucket, key))
        }
    }

    const SCENE_PREFIX: &str = "sentinel-s2-l2a-cogs/35/T/MK/2023/6/S2A_35TMK_20230601_0_L2A";

    fn earth_search_item() -> stac::Item {
        let base = format!("https://sentinel-cogs.s3.us-west-2.amazonaws.com/{SCENE_PREFIX}");
        serde_json::from_value(serde_json::json!({
            "type": "Feature",
            "stac_version": "1.0.0",
            "id": "S2A_35TMK_20230601_0_L2A",
            "geometry": null,
            "bbox": [25.7, 44.1, 27.1, 45.1],
            "properties": {
                "datetime": "2023-06-01T09:20:31.024000Z",
                "eo:cloud_cover": 3.25
            },
            "links": [],
            "assets": {
                "red": { "href": format!("{base}/B04.tif"), "type": "image/tiff; application=geotiff; profile=cloud-optimized" },
                "scl": { "href": format!("{base}/SCL.tif"), "type": "image/tiff; application=geotiff; profile=cloud-optimized" }
            }
        }))
        .unwrap()
    }

    fn cog(values: Array2<f32>, pixel_size: f64) -> Vec<u8> {
        let (rows, cols) = values.dim();
        let source_grid = ExportGrid {
            epsg: 4326,
            bounds: BoundingBox::new(
                26.0,
                44.1 - rows as f64 * pixel_size,
                26.0 + cols as f64 * pixel_size,
                44.1,
            ),
            pixel_width: pixel_size,
            pixel_height: pixel_size,
            width: cols,
            height: rows,
        };
        let image = RasterImage::from_planes(vec![("band".to_string(), values)]).unwrap();
        geotiff::encode(&image, &source_grid).unwrap()
    }

    fn stac_source() -> StacImageSource<MemoryStore> {
        let mut objects = HashMap::new();
        // red at the grid's resolution, scene classes at half of it
        objects.insert(
            ("sentinel-cogs".to_string(), format!("{SCENE_PREFIX}/B04.tif")),
            cog(array![[0.0, 5_000.0]], 0.1),
        );
        objects.insert(
            ("sentinel-cogs".to_string(), format!("{SCENE_PREFIX}/SCL.tif")),
            cog(array![[4.0, 4.0, 9.0, 9.0], [4.0, 4.0, 9.0, 9.0]], 0.05),
        );
        StacImageSource::new(
            "https://earth-search.invalid/v1/search",
            "sentinel-2-l2a",
            "us-west-2",
            MemoryStore { objects },
        )
    }

    #[tokio::test]
    async fn test_stac_item_is_fetched_decoded_and_resampled() {
        let bands = vec![
            BandAsset::new("B4", "red", Some(0.0)),
            BandAsset::new("SCL", "scl", Some(0.0)),
        ];

        let image = stac_source()
            .load_item(&earth_search_item(), &bands, &grid())
            .await
            .unwrap();

        assert_eq!(image.band_names(), &["B4", "SCL"]);
        assert_eq!(image.shape(), (1, 2));
        assert!(image.band("B4").unwrap()[[0, 0]].is_nan());
        assert_eq!(image.band("B4").unwrap()[[0, 1]], 5_000.0);
        assert_eq!(image.band("SCL").unwrap()[[0, 0]], 4.0);
        assert_eq!(image.band("SCL").unwrap()[[0, 1]], 9.0);
        assert_eq!(image.mask(), &array![[false, true]]);
    }

    #[tokio::test]
    async fn test_stac_item_without_asset() {
        let bands = vec![BandAsset::new("B8", "nir", Some(0.0))];
        let err = stac_source()
            .load_item(&earth_search_item(), &bands, &grid())
            .await
            .unwrap_err();
        match err.downcast_ref::<CompositeError>() {
            Some(CompositeError::MissingBand { band, available }) => {
                assert_eq!(band, "B8");
                assert!(available.contains(&"scl".to_string()));
            }
            other => panic!("expected MissingBand, got {:?}", other),
        }
    }

    #[test]
    fn test_footprint_mask() {
        let image = RasterImage::from_planes(vec![
            ("B4".to_string(), array![[1.0, f32::NAN, 3.0]]),
            ("B8".to_string(), array![[1.0, 2.0, f32::NAN]]),
        ])
        .unwrap();
        assert_eq!(footprint_mask(&image), array![[true, false, false]]);
    }
}
