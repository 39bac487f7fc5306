#![allow(async_fn_in_trait)]
pub mod cli;
pub mod cloud_mask;
pub mod collection;
pub mod composite;
pub mod composite_request;
pub mod error;
pub mod export;
pub mod geotiff;
pub mod grid;
pub mod image_source;
pub mod pipeline;
pub mod raster;
pub mod s3;
pub mod session;
pub mod stac_operations;
pub mod study_area;

pub use error::{CompositeError, Result};
