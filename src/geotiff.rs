//! GeoTIFF decoding of source bands and encoding of the exported composite.
//!
//! Only north-up rasters georeferenced by ModelPixelScale + ModelTiepoint and
//! an EPSG code in the GeoKeyDirectory are supported, which covers the
//! Sentinel-2 COGs published on the common STAC catalogues.
use crate::error::{CompositeError, Result};
use crate::grid::{is_geographic, ExportGrid, GeoRaster, GeoTransform};
use crate::raster::RasterImage;
use log::debug;
use ndarray::Array2;
use std::io::{Cursor, Seek, Write};
use tiff::decoder::{Decoder, DecodingResult, Limits};
use tiff::encoder::{TiffEncoder, TiffKind};
use tiff::tags::Tag;

const MODEL_PIXEL_SCALE: u16 = 33550;
const MODEL_TIEPOINT: u16 = 33922;
const GEO_KEY_DIRECTORY: u16 = 34735;
const GDAL_NODATA: u16 = 42113;

const GT_MODEL_TYPE_GEO_KEY: u16 = 1024;
const GT_RASTER_TYPE_GEO_KEY: u16 = 1025;
const GEOGRAPHIC_TYPE_GEO_KEY: u16 = 2048;
const PROJECTED_CS_TYPE_GEO_KEY: u16 = 3072;

const MODEL_TYPE_PROJECTED: u16 = 1;
const MODEL_TYPE_GEOGRAPHIC: u16 = 2;
const RASTER_PIXEL_IS_AREA: u16 = 1;
const USER_DEFINED: u16 = 32767;

fn geotiff_tag(code: u16) -> Tag {
    Tag::from_u16_exhaustive(code)
}

/// Decoded sample planes of a GeoTIFF plus its georeferencing.
pub struct DecodedGeoTiff {
    pub bands: Vec<Array2<f32>>,
    pub transform: GeoTransform,
    pub epsg: u16,
}

impl DecodedGeoTiff {
    /// First band as a [`GeoRaster`].
    pub fn into_first_band(self) -> Result<GeoRaster> {
        let data = self
            .bands
            .into_iter()
            .next()
            .ok_or_else(|| CompositeError::InvalidRaster("no samples".to_string()))?;
        Ok(GeoRaster {
            data,
            transform: self.transform,
            epsg: self.epsg,
        })
    }
}

fn samples_to_f32(result: DecodingResult) -> Result<Vec<f32>> {
    let samples = match result {
        DecodingResult::U8(v) => v.into_iter().map(|s| s as f32).collect(),
        DecodingResult::U16(v) => v.into_iter().map(|s| s as f32).collect(),
        DecodingResult::U32(v) => v.into_iter().map(|s| s as f32).collect(),
        DecodingResult::U64(v) => v.into_iter().map(|s| s as f32).collect(),
        DecodingResult::I8(v) => v.into_iter().map(|s| s as f32).collect(),
        DecodingResult::I16(v) => v.into_iter().map(|s| s as f32).collect(),
        DecodingResult::I32(v) => v.into_iter().map(|s| s as f32).collect(),
        DecodingResult::I64(v) => v.into_iter().map(|s| s as f32).collect(),
        DecodingResult::F32(v) => v,
        DecodingResult::F64(v) => v.into_iter().map(|s| s as f32).collect(),
        #[allow(unreachable_patterns)]
        _ => {
            return Err(CompositeError::InvalidRaster(
                "unsupported sample format".to_string(),
            ))
        }
    };
    Ok(samples)
}

fn epsg_from_geokeys(keys: &[u16]) -> Result<u16> {
    if keys.len() < 4 {
        return Err(CompositeError::InvalidRaster(
            "GeoKeyDirectory is truncated".to_string(),
        ));
    }
    let entries = keys[4..].chunks_exact(4).collect::<Vec<_>>();
    let lookup = |id: u16| {
        entries
            .iter()
            .find(|e| e[0] == id && e[1] == 0)
            .map(|e| e[3])
    };
    match lookup(PROJECTED_CS_TYPE_GEO_KEY).or_else(|| lookup(GEOGRAPHIC_TYPE_GEO_KEY)) {
        Some(USER_DEFINED) | None => Err(CompositeError::InvalidRaster(
            "GeoTIFF does not declare an EPSG code".to_string(),
        )),
        Some(code) => Ok(code),
    }
}

/// Decode every sample plane of a GeoTIFF held in memory.
pub fn decode(bytes: Vec<u8>) -> Result<DecodedGeoTiff> {
    let mut decoder = Decoder::new(Cursor::new(bytes))?.with_limits(Limits::unlimited());
    let (width, height) = decoder.dimensions()?;
    let (width, height) = (width as usize, height as usize);

    let pixel_scale = decoder
        .get_tag_f64_vec(geotiff_tag(MODEL_PIXEL_SCALE))
        .map_err(|_| CompositeError::InvalidRaster("missing ModelPixelScale".to_string()))?;
    let tiepoint = decoder
        .get_tag_f64_vec(geotiff_tag(MODEL_TIEPOINT))
        .map_err(|_| CompositeError::InvalidRaster("missing ModelTiepoint".to_string()))?;
    let geokeys = decoder
        .get_tag_u16_vec(geotiff_tag(GEO_KEY_DIRECTORY))
        .map_err(|_| CompositeError::InvalidRaster("missing GeoKeyDirectory".to_string()))?;
    if pixel_scale.len() < 2 || tiepoint.len() < 6 {
        return Err(CompositeError::InvalidRaster(
            "malformed georeferencing tags".to_string(),
        ));
    }
    let epsg = epsg_from_geokeys(&geokeys)?;
    let transform = GeoTransform {
        origin_x: tiepoint[3] - tiepoint[0] * pixel_scale[0],
        pixel_width: pixel_scale[0],
        origin_y: tiepoint[4] + tiepoint[1] * pixel_scale[1],
        pixel_height: -pixel_scale[1],
    };

    let samples = samples_to_f32(decoder.read_image()?)?;
    let pixels = width * height;
    if pixels == 0 || samples.len() % pixels != 0 {
        return Err(CompositeError::InvalidRaster(format!(
            "{} samples for a {}x{} image",
            samples.len(),
            width,
            height
        )));
    }
    let samples_per_pixel = samples.len() / pixels;
    let bands = (0..samples_per_pixel)
        .map(|b| {
            let plane = samples
                .iter()
                .skip(b)
                .step_by(samples_per_pixel)
                .copied()
                .collect::<Vec<_>>();
            Array2::from_shape_vec((height, width), plane)
                .map_err(|e| CompositeError::InvalidRaster(e.to_string()))
        })
        .collect::<Result<Vec<_>>>()?;

    debug!(
        "Decoded {}x{} GeoTIFF with {} band(s), EPSG:{}",
        width, height, samples_per_pixel, epsg
    );
    Ok(DecodedGeoTiff {
        bands,
        transform,
        epsg,
    })
}

/// Classic TIFF addresses at most 4 GiB; leave room for the header and tags.
const CLASSIC_TIFF_MAX_DATA: u64 = u32::MAX as u64 - (1 << 20);

fn needs_bigtiff(data_len: u64) -> bool {
    data_len > CLASSIC_TIFF_MAX_DATA
}

/// Encode `image` on `grid` as an uncompressed, pixel-interleaved float32
/// GeoTIFF. Masked pixels are written as `NaN`, which is also declared as
/// the nodata value. Images too large for classic TIFF are written as
/// BigTIFF.
pub fn encode(image: &RasterImage, grid: &ExportGrid) -> Result<Vec<u8>> {
    let pixel_bytes = interleave(image, grid)?;
    let big = needs_bigtiff(pixel_bytes.len() as u64);
    write_geotiff(&pixel_bytes, image, grid, big)
}

/// Chunky samples in native byte order (the order the encoder declares in
/// the header), with masked pixels set to `NaN`.
fn interleave(image: &RasterImage, grid: &ExportGrid) -> Result<Vec<u8>> {
    if image.shape() != grid.shape() {
        return Err(CompositeError::ShapeMismatch {
            expected: grid.shape(),
            found: image.shape(),
        });
    }
    let (rows, cols) = image.shape();
    let bands = image.band_names().len();
    if rows == 0 || cols == 0 || bands == 0 {
        return Err(CompositeError::InvalidRaster(
            "composite has no pixels".to_string(),
        ));
    }

    let values = image.values();
    let mask = image.mask();
    let mut pixel_bytes = Vec::with_capacity(rows * cols * bands * 4);
    for row in 0..rows {
        for col in 0..cols {
            for band in 0..bands {
                let v = if mask[[row, col]] {
                    values[[band, row, col]]
                } else {
                    f32::NAN
                };
                pixel_bytes.extend_from_slice(&v.to_ne_bytes());
            }
        }
    }
    Ok(pixel_bytes)
}

fn write_geotiff(
    pixel_bytes: &[u8],
    image: &RasterImage,
    grid: &ExportGrid,
    big: bool,
) -> Result<Vec<u8>> {
    let mut buffer = Cursor::new(Vec::new());
    if big {
        debug!("Writing {} bytes of samples as BigTIFF", pixel_bytes.len());
        let mut encoder = TiffEncoder::new_big(&mut buffer)?;
        write_directory(&mut encoder, pixel_bytes, image, grid)?;
    } else {
        let mut encoder = TiffEncoder::new(&mut buffer)?;
        write_directory(&mut encoder, pixel_bytes, image, grid)?;
    }
    Ok(buffer.into_inner())
}

fn write_directory<W: Write + Seek, K: TiffKind>(
    encoder: &mut TiffEncoder<W, K>,
    pixel_bytes: &[u8],
    image: &RasterImage,
    grid: &ExportGrid,
) -> Result<()> {
    let (rows, cols) = image.shape();
    let bands = image.band_names().len();
    let mut dir = encoder.image_directory()?;

    dir.write_tag(Tag::ImageWidth, cols as u32)?;
    dir.write_tag(Tag::ImageLength, rows as u32)?;
    dir.write_tag(Tag::BitsPerSample, vec![32u16; bands].as_slice())?;
    dir.write_tag(Tag::Compression, 1u16)?;
    // BlackIsZero
    dir.write_tag(Tag::PhotometricInterpretation, 1u16)?;
    dir.write_tag(Tag::SamplesPerPixel, bands as u16)?;
    // IEEE float
    dir.write_tag(Tag::SampleFormat, vec![3u16; bands].as_slice())?;
    // chunky
    dir.write_tag(Tag::PlanarConfiguration, 1u16)?;
    dir.write_tag(Tag::RowsPerStrip, rows as u32)?;
    if bands > 1 {
        dir.write_tag(Tag::ExtraSamples, vec![0u16; bands - 1].as_slice())?;
    }

    let pixel_scale = [grid.pixel_width, grid.pixel_height, 0.0];
    dir.write_tag(geotiff_tag(MODEL_PIXEL_SCALE), pixel_scale.as_slice())?;
    let tiepoint = [0.0, 0.0, 0.0, grid.bounds.min_x, grid.bounds.max_y, 0.0];
    dir.write_tag(geotiff_tag(MODEL_TIEPOINT), tiepoint.as_slice())?;
    dir.write_tag(geotiff_tag(GEO_KEY_DIRECTORY), geokey_directory(grid.epsg).as_slice())?;
    dir.write_tag(geotiff_tag(GDAL_NODATA), "nan")?;

    let strip_offset = dir.write_data(pixel_bytes)?;
    dir.write_tag(Tag::StripOffsets, K::convert_offset(strip_offset)?)?;
    dir.write_tag(
        Tag::StripByteCounts,
        K::convert_offset(pixel_bytes.len() as u64)?,
    )?;
    dir.finish()?;
    Ok(())
}

fn geokey_directory(epsg: u16) -> Vec<u16> {
    let geographic = is_geographic(epsg);
    let mut keys = vec![1, 1, 0, 3];
    keys.extend_from_slice(&[
        GT_MODEL_TYPE_GEO_KEY,
        0,
        1,
        if geographic {
            MODEL_TYPE_GEOGRAPHIC
        } else {
            MODEL_TYPE_PROJECTED
        },
    ]);
    keys.extend_from_slice(&[GT_RASTER_TYPE_GEO_KEY, 0, 1, RASTER_PIXEL_IS_AREA]);
    if geographic {
        keys.extend_from_slice(&[GEOGRAPHIC_TYPE_GEO_KEY, 0, 1, epsg]);
    } else {
        keys.extend_from_slice(&[PROJECTED_CS_TYPE_GEO_KEY, 0, 1, epsg]);
    }
    keys
}
