use crate::cloud_mask::QaEncoding;
use crate::collection::CollectionFilter;
use crate::export::{ExportRequest, DEFAULT_MAX_PIXELS};
use crate::image_source::BandAsset;
use crate::raster::REFLECTANCE_SCALE;
use crate::stac_operations::{SEARCH_API, SENTINEL_2_L2A};
use crate::study_area::StudyArea;
use anyhow::{anyhow, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use toml;

/// Everything that defines one composite: where, when, which bands, and where
/// the result goes.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct CompositeRequest {
    pub id: String,
    pub name: String,
    pub description: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub max_cloud_percentage: f64,
    pub area_of_interest: StudyArea,
    pub source: SourceConfig,
    pub bands: Vec<BandAsset>,
    pub quality: QualityConfig,
    pub export: ExportConfig,
    pub auth: AuthConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct SourceConfig {
    #[serde(default = "default_search_api")]
    pub search_api: String,
    #[serde(default = "default_collection")]
    pub collection: String,
    /// Region of the bucket holding the assets.
    pub region: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct QualityConfig {
    #[serde(default = "default_reflectance_scale")]
    pub reflectance_scale: f32,
    #[serde(default)]
    pub encoding: QaEncoding,
    /// Cloud/cirrus band, read as `encoding`.
    pub band: BandAsset,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct ExportConfig {
    pub description: String,
    pub bucket: String,
    pub region: String,
    pub file_name_prefix: String,
    /// Metres per pixel.
    pub scale: f64,
    pub crs: String,
    #[serde(default = "default_max_pixels")]
    pub max_pixels: u64,
    pub poll_interval_secs: u64,
    /// No timeout when absent: the export is polled until it finishes.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct AuthConfig {
    pub profile: String,
}

fn default_search_api() -> String {
    SEARCH_API.to_string()
}

fn default_collection() -> String {
    SENTINEL_2_L2A.to_string()
}

fn default_reflectance_scale() -> f32 {
    REFLECTANCE_SCALE
}

fn default_max_pixels() -> u64 {
    DEFAULT_MAX_PIXELS
}

impl CompositeRequest {
    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let request: Self = toml::from_str(&content)?;
        request.validate()?;
        Ok(request)
    }

    pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn from_template(table: &toml::Table) -> Result<Self> {
        let request: Self = toml::from_str(&table.to_string())?;
        Ok(request)
    }

    pub fn validate(&self) -> Result<()> {
        if self.end_date < self.start_date {
            return Err(anyhow!(
                "end_date {} is before start_date {}",
                self.end_date,
                self.start_date
            ));
        }
        if self.area_of_interest.radius_m <= 0.0 {
            return Err(anyhow!("area_of_interest.radius_m must be positive"));
        }
        if self.bands.is_empty() {
            return Err(anyhow!("No bands selected"));
        }
        if self.bands.iter().any(|b| b.name == self.quality.band.name) {
            return Err(anyhow!(
                "Quality band '{}' cannot also be a composite band",
                self.quality.band.name
            ));
        }
        if self.export.poll_interval_secs == 0 {
            return Err(anyhow!("export.poll_interval_secs must be at least 1"));
        }
        Ok(())
    }

    pub fn filter(&self) -> CollectionFilter {
        CollectionFilter {
            start: self.start_date,
            end: self.end_date,
            region: self.area_of_interest,
            max_cloud_cover: self.max_cloud_percentage,
        }
    }

    pub fn band_names(&self) -> Vec<String> {
        self.bands.iter().map(|b| b.name.clone()).collect()
    }

    /// Composite bands followed by the quality band: what has to be read
    /// for every scene.
    pub fn bands_to_load(&self) -> Vec<BandAsset> {
        let mut bands = self.bands.clone();
        bands.push(self.quality.band.clone());
        bands
    }

    pub fn export_request(&self) -> ExportRequest {
        ExportRequest {
            description: self.export.description.clone(),
            file_name_prefix: self.export.file_name_prefix.clone(),
            region: self.area_of_interest.bounds(),
            scale: self.export.scale,
            crs: self.export.crs.clone(),
            max_pixels: self.export.max_pixels,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.export.poll_interval_secs)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.export.timeout_secs.map(Duration::from_secs)
    }
}

pub fn request_template() -> toml::Table {
    toml::toml! {
        id = "sentinel2.median-composite.bucharest"

        name = "Sentinel-2 cloud-free median composite"

        description = "Yearly median of cloud and cirrus masked Sentinel-2 surface reflectance\n\
        (B4, B3, B2, B8) over a 5 km radius around Bucharest."

        start_date = "2023-01-01"

        end_date = "2023-12-31"

        max_cloud_percentage = 20.0

        [area_of_interest]
        longitude = 26.102857
        latitude = 44.427597
        radius_m = 5000.0

        [source]
        search_api = "https://earth-search.aws.element84.com/v1/search"
        collection = "sentinel-2-l2a"
        region = "us-west-2"

        [[bands]]
        name = "B4"
        asset = "red"
        nodata = 0.0

        [[bands]]
        name = "B3"
        asset = "green"
        nodata = 0.0

        [[bands]]
        name = "B2"
        asset = "blue"
        nodata = 0.0

        [[bands]]
        name = "B8"
        asset = "nir"
        nodata = 0.0

        [quality]
        reflectance_scale = 10000.0
        encoding = "scl"
        band = { name = "SCL", asset = "scl", nodata = 0.0 }

        [export]
        description = "Sentinel2BaseExport"
        bucket = "valkyrion-satellite-data"
        region = "eu-central-1"
        file_name_prefix = "bucharest-sentinel2"
        scale = 10.0
        crs = "EPSG:4326"
        poll_interval_secs = 10

        [auth]
        profile = "valkyrion"
    }
}
