//! Export of the composite as a GeoTIFF through an asynchronous task whose
//! status can be polled, mirroring a remote batch export.
use crate::error::CompositeError;
use crate::geotiff;
use crate::grid::{parse_crs, ExportGrid};
use crate::raster::RasterImage;
use crate::s3::{Provider, S3ObjOps};
use crate::study_area::BoundingBox;
use anyhow::Result;
use chrono::Utc;
use log::{debug, error, info, warn};
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_PIXELS: u64 = 10_000_000_000;

#[derive(Debug, Clone, PartialEq)]
pub struct ExportRequest {
    pub description: String,
    pub file_name_prefix: String,
    /// Lon/lat bounds of the exported area.
    pub region: BoundingBox,
    /// Metres per pixel.
    pub scale: f64,
    /// `EPSG:<code>`
    pub crs: String,
    pub max_pixels: u64,
}

impl ExportRequest {
    pub fn file_name(&self) -> String {
        format!("{}.tif", self.file_name_prefix)
    }

    /// Resolve the output grid and check it against the pixel budget.
    pub fn grid(&self) -> crate::error::Result<ExportGrid> {
        let epsg = parse_crs(&self.crs)?;
        let grid = ExportGrid::from_region(&self.region, self.scale, epsg)?;
        if grid.pixel_count() > self.max_pixels {
            return Err(CompositeError::PixelBudgetExceeded {
                width: grid.width,
                height: grid.height,
                max_pixels: self.max_pixels,
            });
        }
        Ok(grid)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Ready,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskState::Ready => write!(f, "READY"),
            TaskState::Running => write!(f, "RUNNING"),
            TaskState::Completed => write!(f, "COMPLETED"),
            TaskState::Failed => write!(f, "FAILED"),
            TaskState::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskStatus {
    pub state: TaskState,
    pub error_message: Option<String>,
}

impl TaskStatus {
    fn new(state: TaskState) -> Self {
        Self {
            state,
            error_message: None,
        }
    }

    fn failed(message: String) -> Self {
        Self {
            state: TaskState::Failed,
            error_message: Some(message),
        }
    }
}

/// Handle to a running export.
pub struct ExportTask {
    id: String,
    status: Arc<Mutex<TaskStatus>>,
    handle: JoinHandle<()>,
}

fn lock(status: &Mutex<TaskStatus>) -> MutexGuard<'_, TaskStatus> {
    status.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ExportTask {
    /// Run `job` in the background. The task is RUNNING while the job runs
    /// and ends COMPLETED, or FAILED with the job's error as message.
    pub fn spawn<F>(id: String, job: F) -> Self
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let status = Arc::new(Mutex::new(TaskStatus::new(TaskState::Ready)));
        let shared = Arc::clone(&status);
        let task_id = id.clone();
        let handle = tokio::spawn(async move {
            {
                let mut s = lock(&shared);
                if s.state == TaskState::Cancelled {
                    return;
                }
                *s = TaskStatus::new(TaskState::Running);
            }
            let outcome = job.await;
            let mut s = lock(&shared);
            if s.state == TaskState::Cancelled {
                return;
            }
            *s = match outcome {
                Ok(()) => TaskStatus::new(TaskState::Completed),
                Err(e) => {
                    debug!("Export task {} failed: {:#}", task_id, e);
                    TaskStatus::failed(format!("{e:#}"))
                }
            };
        });
        Self { id, status, handle }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn status(&self) -> TaskStatus {
        lock(&self.status).clone()
    }

    pub fn active(&self) -> bool {
        !self.status().state.is_terminal()
    }

    /// Stop the task. A task that already finished keeps its final state.
    pub fn cancel(&self) {
        let mut s = lock(&self.status);
        if !s.state.is_terminal() {
            self.handle.abort();
            *s = TaskStatus::new(TaskState::Cancelled);
        }
    }
}

fn task_id(request: &ExportRequest) -> String {
    format!(
        "{}-{}",
        request.description,
        Utc::now().format("%Y%m%dT%H%M%S%3f")
    )
}

/// Check `image` against the request and return the grid it is written on.
fn prepare(image: &RasterImage, request: &ExportRequest) -> crate::error::Result<ExportGrid> {
    let grid = request.grid()?;
    if image.shape() != grid.shape() {
        return Err(CompositeError::ShapeMismatch {
            expected: grid.shape(),
            found: image.shape(),
        });
    }
    Ok(grid)
}

async fn encode_in_background(image: RasterImage, grid: ExportGrid) -> Result<Vec<u8>> {
    let bytes = tokio::task::spawn_blocking(move || geotiff::encode(&image, &grid)).await??;
    Ok(bytes)
}

pub trait ExportSink {
    /// Where the file for `request` ends up.
    fn location(&self, request: &ExportRequest) -> String;

    /// Validate the request and start the export.
    fn submit(&self, image: RasterImage, request: &ExportRequest) -> Result<ExportTask>;
}

/// Uploads `<prefix>.tif` to a bucket.
pub struct S3ExportSink {
    provider: Arc<Provider>,
    bucket: String,
}

impl S3ExportSink {
    pub fn new(provider: Provider, bucket: &str) -> Self {
        Self {
            provider: Arc::new(provider),
            bucket: bucket.to_owned(),
        }
    }
}

impl ExportSink for S3ExportSink {
    fn location(&self, request: &ExportRequest) -> String {
        format!("s3://{}/{}", self.bucket, request.file_name())
    }

    fn submit(&self, image: RasterImage, request: &ExportRequest) -> Result<ExportTask> {
        let grid = prepare(&image, request)?;
        let provider = Arc::clone(&self.provider);
        let bucket = self.bucket.clone();
        let key = request.file_name();
        let id = task_id(request);
        info!("Submitting export {} to s3://{}/{}", id, bucket, key);

        Ok(ExportTask::spawn(id, async move {
            let bytes = encode_in_background(image, grid).await?;
            debug!("Uploading {} bytes", bytes.len());
            provider.put_object(&bucket, &key, bytes).await?;
            Ok(())
        }))
    }
}

/// Writes `<prefix>.tif` into a local directory.
pub struct DirectoryExportSink {
    dir: PathBuf,
}

impl DirectoryExportSink {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }
}

impl ExportSink for DirectoryExportSink {
    fn location(&self, request: &ExportRequest) -> String {
        self.dir.join(request.file_name()).display().to_string()
    }

    fn submit(&self, image: RasterImage, request: &ExportRequest) -> Result<ExportTask> {
        let grid = prepare(&image, request)?;
        let dir = self.dir.clone();
        let path = self.dir.join(request.file_name());
        let id = task_id(request);
        info!("Submitting export {} to {}", id, path.display());

        Ok(ExportTask::spawn(id, async move {
            let bytes = encode_in_background(image, grid).await?;
            tokio::fs::create_dir_all(&dir).await?;
            tokio::fs::write(&path, bytes).await?;
            Ok(())
        }))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PollOptions {
    pub interval: Duration,
    /// `None` polls until the task finishes.
    pub timeout: Option<Duration>,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            timeout: None,
        }
    }
}

async fn poll_until_finished(task: &ExportTask, interval: Duration) -> TaskStatus {
    while task.active() {
        info!("Task status: {}", task.status().state);
        tokio::time::sleep(interval).await;
    }
    task.status()
}

/// Poll `task` until it reaches a terminal state. The task is cancelled when
/// the timeout elapses (an error) or when `shutdown` resolves (the
/// CANCELLED status is returned).
pub async fn monitor<F>(task: &ExportTask, options: &PollOptions, shutdown: F) -> Result<TaskStatus>
where
    F: Future<Output = ()>,
{
    info!("Monitoring task: {}", task.id());
    let bounded = async {
        match options.timeout {
            Some(limit) => tokio::time::timeout(limit, poll_until_finished(task, options.interval))
                .await
                .ok(),
            None => Some(poll_until_finished(task, options.interval).await),
        }
    };

    tokio::select! {
        finished = bounded => match finished {
            Some(status) => Ok(status),
            None => {
                task.cancel();
                let secs = options.timeout.map(|t| t.as_secs()).unwrap_or_default();
                Err(CompositeError::ExportTimeout(task.id().to_owned(), secs).into())
            }
        },
        _ = shutdown => {
            warn!("Shutdown requested, cancelling task {}", task.id());
            task.cancel();
            Ok(task.status())
        }
    }
}

/// Log the final state of an export. A FAILED export is reported, not raised.
pub fn report_outcome(status: &TaskStatus, location: &str) {
    match status.state {
        TaskState::Completed => {
            info!("Export COMPLETED successfully!");
            info!("File should be in: {}", location);
        }
        TaskState::Failed => {
            error!("Export FAILED.");
            error!(
                "Error message: {}",
                status.error_message.as_deref().unwrap_or("<none>")
            );
        }
        state => info!("Task finished with state: {}", state),
    }
}
