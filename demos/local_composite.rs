//! Builds a composite from three synthetic scenes and writes it to
//! `./outputs/demo-composite.tif`, without touching the network.
use anyhow::{anyhow, Result};
use chrono::{TimeZone, Utc};
use env_logger::Env;
use log::info;
use ndarray::Array2;
use s2_composite::cloud_mask::SCL_CLOUD_HIGH_PROBABILITY;
use s2_composite::collection::{Scene, SceneMetadata};
use s2_composite::composite_request::{request_template, CompositeRequest};
use s2_composite::export::DirectoryExportSink;
use s2_composite::image_source::InMemoryImageSource;
use s2_composite::pipeline;
use s2_composite::raster::RasterImage;

const VEGETATION: f32 = 4.0;

fn synthetic_scene(request: &CompositeRequest, day: u32, cloudy: bool) -> Result<Scene> {
    let (rows, cols) = request.export_request().grid()?.shape();
    let mut planes = vec![];
    for (i, band) in request.band_names().into_iter().enumerate() {
        let plane = Array2::from_shape_fn((rows, cols), |(r, c)| {
            (1_000 * (i + 1) + 10 * r + c) as f32 + day as f32
        });
        planes.push((band, plane));
    }
    // scene classes: a cloud over the left half, vegetation elsewhere
    let qa = Array2::from_shape_fn((rows, cols), |(_, c)| {
        if cloudy && c < cols / 2 {
            SCL_CLOUD_HIGH_PROBABILITY as f32
        } else {
            VEGETATION
        }
    });
    planes.push((request.quality.band.name.clone(), qa));

    Ok(Scene {
        metadata: SceneMetadata {
            id: format!("synthetic-{day}"),
            acquired: Utc
                .with_ymd_and_hms(2023, 7, day, 9, 0, 0)
                .single()
                .ok_or_else(|| anyhow!("invalid acquisition day {day}"))?,
            cloud_cover: if cloudy { 15.0 } else { 2.0 },
            footprint: request.area_of_interest.bounds(),
        },
        image: RasterImage::from_planes(planes)?,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let mut request = CompositeRequest::from_template(&request_template())?;
    request.export.scale = 500.0;
    request.export.file_name_prefix = "demo-composite".to_string();
    request.export.poll_interval_secs = 1;

    let source = InMemoryImageSource::new(vec![
        synthetic_scene(&request, 3, false)?,
        synthetic_scene(&request, 13, true)?,
        synthetic_scene(&request, 23, false)?,
    ]);
    let sink = DirectoryExportSink::new("./outputs");

    let status = pipeline::run(&request, &source, &sink, std::future::pending()).await?;
    info!("Demo finished with {}", status.state);
    Ok(())
}
