//! Google Drive v3 upload sink
//!
//! Uses a resumable upload session but sends the whole archive in a single
//! PUT. A failed PUT is reported, never resumed.

use std::fs::File;
use std::path::Path;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use reqwest::blocking::{Body, Client, Response};
use reqwest::header::{CONTENT_TYPE, LOCATION};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::{TransportError, UploadSink};
use crate::auth::CredentialProvider;

/// Drive media upload endpoint
pub const DRIVE_UPLOAD_URL: &str = "https://www.googleapis.com/upload/drive/v3/files";

const ZIP_MIME: &str = "application/zip";

#[derive(Debug, Deserialize)]
struct DriveFile {
    id: String,
}

/// Uploads archives into a Drive folder identified by its folder id
pub struct DriveSink {
    client: Client,
    credentials: Box<dyn CredentialProvider>,
    upload_url: String,
    show_progress: bool,
}

impl DriveSink {
    pub fn new(credentials: Box<dyn CredentialProvider>) -> Result<Self, TransportError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .timeout(None::<Duration>)
            .build()?;
        Ok(Self {
            client,
            credentials,
            upload_url: DRIVE_UPLOAD_URL.to_string(),
            show_progress: false,
        })
    }

    /// Point at another upload endpoint (tests, proxies)
    pub fn with_upload_url(mut self, url: impl Into<String>) -> Self {
        self.upload_url = url.into();
        self
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    /// Open a resumable session and return its URL
    fn start_session(
        &self,
        token: &str,
        file_name: &str,
        size: u64,
        folder_id: &str,
    ) -> Result<String, TransportError> {
        let metadata = json!({
            "name": file_name,
            "mimeType": ZIP_MIME,
            "parents": [folder_id],
        });

        let response = self
            .client
            .post(format!("{}?uploadType=resumable&fields=id", self.upload_url))
            .bearer_auth(token)
            .header("X-Upload-Content-Type", ZIP_MIME)
            .header("X-Upload-Content-Length", size.to_string())
            .json(&metadata)
            .send()?;
        let response = ensure_success(response)?;

        response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| {
                TransportError::InvalidResponse("upload session has no Location header".to_string())
            })
    }

    fn progress_bar(&self, size: u64, file_name: &str) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }
        let bar = ProgressBar::new(size);
        bar.set_style(
            ProgressStyle::with_template(
                "{msg} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=>-"),
        );
        bar.set_message(file_name.to_string());
        bar
    }
}

impl UploadSink for DriveSink {
    fn upload(
        &self,
        local_archive_path: &Path,
        destination_id: &str,
    ) -> Result<String, TransportError> {
        let io_err = |source| TransportError::Io {
            path: local_archive_path.to_path_buf(),
            source,
        };

        let file_name = local_archive_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                TransportError::InvalidResponse(format!(
                    "archive path has no file name: {}",
                    local_archive_path.display()
                ))
            })?;
        let file = File::open(local_archive_path).map_err(io_err)?;
        let size = file.metadata().map_err(io_err)?.len();

        let token = self.credentials.access_token()?;
        let session = self.start_session(&token, &file_name, size, destination_id)?;
        debug!("Drive session opened for {} ({} bytes)", file_name, size);

        let bar = self.progress_bar(size, &file_name);
        let body = Body::sized(bar.wrap_read(file), size);
        let result = self
            .client
            .put(&session)
            .header(CONTENT_TYPE, ZIP_MIME)
            .body(body)
            .send();
        bar.finish_and_clear();

        let response = ensure_success(result?)?;
        let created: DriveFile = response
            .json()
            .map_err(|e| TransportError::InvalidResponse(e.to_string()))?;
        Ok(created.id)
    }

    fn name(&self) -> &str {
        "drive"
    }
}

fn ensure_success(response: Response) -> Result<Response, TransportError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().unwrap_or_default();
    Err(TransportError::from_status(status.as_u16(), body))
}
