use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "s2-composite")]
#[command(about = "Cloud-masked Sentinel-2 median composites exported as GeoTIFF")]
#[command(version)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Build the composite described by a request file and export it
    Run {
        /// Request file (TOML)
        #[arg(short, long, value_name = "FILE", default_value = "./inputs/composite_request.toml")]
        request: PathBuf,

        /// Write the GeoTIFF into this directory instead of the bucket
        #[arg(short, long, value_name = "DIR")]
        output_dir: Option<PathBuf>,
    },
    /// Write the default request file
    Template {
        #[arg(short, long, value_name = "FILE", default_value = "./inputs/composite_request.toml")]
        output: PathBuf,
    },
}
