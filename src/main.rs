use anyhow::Result;
use clap::Parser;
use env_logger::Env;
use log::{info, warn};
use s2_composite::cli::{Args, Command};
use s2_composite::composite_request::{request_template, CompositeRequest};
use s2_composite::export::{DirectoryExportSink, S3ExportSink, TaskState};
use s2_composite::image_source::StacImageSource;
use s2_composite::pipeline;
use s2_composite::s3::Provider;
use s2_composite::session;
use std::fs;

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        warn!("Unable to listen for Ctrl-C, the export can only end on its own");
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level)).init();

    match args.command {
        Command::Template { output } => {
            if let Some(parent) = output.parent() {
                fs::create_dir_all(parent)?;
            }
            let request = CompositeRequest::from_template(&request_template())?;
            request.write(&output)?;
            info!("Wrote request template to {}", output.display());
        }
        Command::Run {
            request,
            output_dir,
        } => {
            let request = CompositeRequest::read(&request)?;
            info!("=== {} ===", request.name);

            let assets = Provider::as_anon(&request.source.region).await;
            let source = StacImageSource::new(
                &request.source.search_api,
                &request.source.collection,
                &request.source.region,
                assets,
            );

            let status = match output_dir {
                Some(dir) => {
                    let sink = DirectoryExportSink::new(dir);
                    pipeline::run(&request, &source, &sink, shutdown_signal()).await?
                }
                None => {
                    let provider = session::initialize(
                        &request.auth.profile,
                        &request.export.region,
                        &request.export.bucket,
                    )
                    .await?;
                    let sink = S3ExportSink::new(provider, &request.export.bucket);
                    pipeline::run(&request, &source, &sink, shutdown_signal()).await?
                }
            };

            if status.state != TaskState::Completed {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
