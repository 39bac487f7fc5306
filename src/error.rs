use thiserror::Error;

#[derive(Error, Debug)]
pub enum CompositeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TIFF error: {0}")]
    Tiff(#[from] tiff::TiffError),

    #[error("Band '{band}' not found (available: {available:?})")]
    MissingBand { band: String, available: Vec<String> },

    #[error("Band schema mismatch: expected {expected:?}, found {found:?}")]
    BandMismatch {
        expected: Vec<String>,
        found: Vec<String>,
    },

    #[error("Raster shape mismatch: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        expected: (usize, usize),
        found: (usize, usize),
    },

    #[error("Invalid CRS string: {0} (expected 'EPSG:<code>')")]
    InvalidCrs(String),

    #[error("EPSG:{0} is not in the crs-definitions database")]
    UnsupportedCrs(u16),

    #[error("Projection error: {0}")]
    Projection(String),

    #[error("Invalid raster: {0}")]
    InvalidRaster(String),

    #[error("Export of {width}x{height} pixels exceeds the budget of {max_pixels}")]
    PixelBudgetExceeded {
        width: usize,
        height: usize,
        max_pixels: u64,
    },

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Export task {0} did not finish within {1} seconds")]
    ExportTimeout(String, u64),
}

pub type Result<T> = std::result::Result<T, CompositeError>;
