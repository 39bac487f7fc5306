//! Scene metadata and the date / footprint / cloud-cover filter applied to
//! an image collection before compositing.
use crate::raster::RasterImage;
use crate::study_area::{BoundingBox, StudyArea};
use chrono::{DateTime, NaiveDate, Utc};
use log::debug;

#[derive(Debug, Clone, PartialEq)]
pub struct SceneMetadata {
    pub id: String,
    pub acquired: DateTime<Utc>,
    /// Scene-level cloudy pixel percentage, 0-100.
    pub cloud_cover: f64,
    /// Lon/lat footprint.
    pub footprint: BoundingBox,
}

/// A scene with its raster data.
#[derive(Debug, Clone)]
pub struct Scene {
    pub metadata: SceneMetadata,
    pub image: RasterImage,
}

impl AsRef<SceneMetadata> for SceneMetadata {
    fn as_ref(&self) -> &SceneMetadata {
        self
    }
}

impl AsRef<SceneMetadata> for Scene {
    fn as_ref(&self) -> &SceneMetadata {
        &self.metadata
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CollectionFilter {
    /// First acquisition date, inclusive.
    pub start: NaiveDate,
    /// Last acquisition date, inclusive.
    pub end: NaiveDate,
    pub region: StudyArea,
    /// Scenes must be strictly below this cloud-cover percentage.
    pub max_cloud_cover: f64,
}

impl CollectionFilter {
    pub fn matches(&self, scene: &SceneMetadata) -> bool {
        let date = scene.acquired.date_naive();
        date >= self.start
            && date <= self.end
            && scene.cloud_cover < self.max_cloud_cover
            && self.region.intersects(&scene.footprint)
    }

    /// The matching subsequence, in acquisition order.
    pub fn apply<T: AsRef<SceneMetadata>>(&self, scenes: Vec<T>) -> Vec<T> {
        let total = scenes.len();
        let mut kept = scenes
            .into_iter()
            .filter(|s| self.matches(s.as_ref()))
            .collect::<Vec<_>>();
        kept.sort_by_key(|s| s.as_ref().acquired);
        debug!("Collection filter kept {} of {} scenes", kept.len(), total);
        kept
    }

    /// STAC `datetime` interval covering both endpoint days.
    pub fn stac_datetime(&self) -> String {
        format!(
            "{}T00:00:00Z/{}T23:59:59Z",
            self.start.format("%Y-%m-%d"),
            self.end.format("%Y-%m-%d")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn scene(id: &str, date: (i32, u32, u32), cloud_cover: f64, footprint: BoundingBox) -> SceneMetadata {
        SceneMetadata {
            id: id.to_string(),
            acquired: Utc
                .with_ymd_and_hms(date.0, date.1, date.2, 9, 30, 0)
                .unwrap(),
            cloud_cover,
            footprint,
        }
    }

    fn filter() -> CollectionFilter {
        CollectionFilter {
            start: NaiveDate::from_ymd_opt(2023, 1, 1).unwrap(),
            end: NaiveDate::from_ymd_opt(2023, 12, 31).unwrap(),
            region: StudyArea::new(26.102857, 44.427597, 5_000.0),
            max_cloud_cover: 20.0,
        }
    }

    fn over_aoi() -> BoundingBox {
        BoundingBox::new(25.5, 44.0, 26.9, 45.0)
    }

    #[test]
    fn test_empty_collection() {
        let filtered = filter().apply(Vec::<SceneMetadata>::new());
        assert!(filtered.is_empty());
    }

    #[test]
    fn test_date_endpoints_inclusive() {
        let f = filter();
        assert!(f.matches(&scene("first", (2023, 1, 1), 5.0, over_aoi())));
        assert!(f.matches(&scene("last", (2023, 12, 31), 5.0, over_aoi())));
        assert!(!f.matches(&scene("before", (2022, 12, 31), 5.0, over_aoi())));
        assert!(!f.matches(&scene("after", (2024, 1, 1), 5.0, over_aoi())));
    }

    #[test]
    fn test_cloud_threshold_strict() {
        let f = filter();
        assert!(f.matches(&scene("a", (2023, 6, 1), 19.99, over_aoi())));
        assert!(!f.matches(&scene("b", (2023, 6, 1), 20.0, over_aoi())));
    }

    #[test]
    fn test_footprint_must_intersect() {
        let elsewhere = BoundingBox::new(10.0, 50.0, 11.0, 51.0);
        assert!(!filter().matches(&scene("a", (2023, 6, 1), 1.0, elsewhere)));
    }

    #[test]
    fn test_subsequence_in_acquisition_order() {
        let scenes = vec![
            scene("june", (2023, 6, 1), 1.0, over_aoi()),
            scene("cloudy", (2023, 3, 1), 80.0, over_aoi()),
            scene("feb", (2023, 2, 1), 10.0, over_aoi()),
            scene("sept", (2023, 9, 1), 3.0, over_aoi()),
        ];
        let ids = filter()
            .apply(scenes)
            .into_iter()
            .map(|s| s.id)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["feb", "june", "sept"]);
    }

    #[test]
    fn test_stac_datetime() {
        assert_eq!(
            filter().stac_datetime(),
            "2023-01-01T00:00:00Z/2023-12-31T23:59:59Z"
        );
    }
}
