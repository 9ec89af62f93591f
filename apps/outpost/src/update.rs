//! Self-update: download a replacement binary, swap it over the running
//! executable, and exit so the supervisor restarts into it.
//!
//! Download, staging and chmod failures never touch the installed binary.
//! Only the final rename can leave things half done, and that step restores
//! the `.bak` copy before reporting.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{error, info, warn};

/// Delay between a successful swap and process exit, so the last frames
/// can still be flushed.
pub const RESTART_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("download failed: {0}")]
    Download(String),
    #[error("bad status: {0}")]
    BadStatus(String),
    #[error("could not find executable path: {0}")]
    ExecutablePath(#[source] std::io::Error),
    #[error("could not stage {path}: {source}")]
    Stage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("chmod failed: {0}")]
    Permissions(#[source] std::io::Error),
    #[error("replace failed: {0}")]
    Replace(#[source] std::io::Error),
}

/// Body of a release download, yielded chunk by chunk.
pub type ByteStream = BoxStream<'static, Result<Bytes, UpdateError>>;

#[async_trait]
pub trait BinaryFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<ByteStream, UpdateError>;
}

/// Plain HTTPS GET through `reqwest`.
#[derive(Debug, Clone, Default)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl BinaryFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<ByteStream, UpdateError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| UpdateError::Download(err.to_string()))?;
        if response.status() != reqwest::StatusCode::OK {
            return Err(UpdateError::BadStatus(response.status().to_string()));
        }
        let body = stream::unfold(response, |mut response| async move {
            match response.chunk().await {
                Ok(Some(chunk)) => Some((Ok(chunk), response)),
                Ok(None) => None,
                Err(err) => Some((Err(UpdateError::Download(err.to_string())), response)),
            }
        });
        Ok(body.boxed())
    }
}

/// What to do once the new binary is in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartPolicy {
    /// Exit with status 0 after the delay and let the supervisor restart us.
    ExitAfter(Duration),
    /// Leave the process running. Used by tests.
    Stay,
}

/// Replaces the running agent with a fresh build.
#[async_trait]
pub trait SelfUpdate: Send + Sync {
    async fn update(&self, current_version: &str) -> Result<(), UpdateError>;
}

pub struct Updater {
    release_url: String,
    fetcher: Box<dyn BinaryFetcher>,
    executable: Option<PathBuf>,
    restart: RestartPolicy,
}

impl Updater {
    pub fn new(release_url: impl Into<String>, restart: RestartPolicy) -> Self {
        Self::with_fetcher(release_url, HttpFetcher::default(), restart)
    }

    pub fn with_fetcher(
        release_url: impl Into<String>,
        fetcher: impl BinaryFetcher + 'static,
        restart: RestartPolicy,
    ) -> Self {
        Self {
            release_url: release_url.into(),
            fetcher: Box::new(fetcher),
            executable: None,
            restart,
        }
    }

    /// Targets `path` instead of the running executable.
    pub fn with_executable(mut self, path: impl Into<PathBuf>) -> Self {
        self.executable = Some(path.into());
        self
    }

    fn executable_path(&self) -> Result<PathBuf, UpdateError> {
        match &self.executable {
            Some(path) => Ok(path.clone()),
            None => std::env::current_exe().map_err(UpdateError::ExecutablePath),
        }
    }
}

#[async_trait]
impl SelfUpdate for Updater {
    async fn update(&self, current_version: &str) -> Result<(), UpdateError> {
        info!(
            current_version,
            url = %self.release_url,
            "downloading latest agent release"
        );
        let body = self.fetcher.fetch(&self.release_url).await?;

        let exe = self.executable_path()?;
        let staged = sibling(&exe, "new");
        let written = stage(body, &staged).await?;
        info!(path = %staged.display(), bytes = written, "staged new agent binary");

        mark_executable(&staged).await?;
        swap_in(&exe, &staged).await?;
        info!(path = %exe.display(), "update applied");

        if let RestartPolicy::ExitAfter(grace) = self.restart {
            info!(grace_ms = grace.as_millis() as u64, "exiting for supervisor restart");
            tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                std::process::exit(0);
            });
        }
        Ok(())
    }
}

/// `<path>.<suffix>` in the same directory, so renames stay on one
/// filesystem.
pub fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

async fn stage(mut body: ByteStream, staged: &Path) -> Result<u64, UpdateError> {
    let stage_err = |source| UpdateError::Stage {
        path: staged.to_path_buf(),
        source,
    };
    let mut file = tokio::fs::File::create(staged).await.map_err(stage_err)?;
    let mut written = 0u64;
    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await.map_err(stage_err)?;
        written += chunk.len() as u64;
    }
    file.flush().await.map_err(stage_err)?;
    file.sync_all().await.map_err(stage_err)?;
    Ok(written)
}

#[cfg(unix)]
async fn mark_executable(path: &Path) -> Result<(), UpdateError> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
        .await
        .map_err(UpdateError::Permissions)
}

#[cfg(not(unix))]
async fn mark_executable(_path: &Path) -> Result<(), UpdateError> {
    Ok(())
}

/// Moves `staged` over `exe`, keeping the previous binary at `<exe>.bak`.
/// If the final rename fails the backup is moved back first.
pub async fn swap_in(exe: &Path, staged: &Path) -> Result<(), UpdateError> {
    let backup = sibling(exe, "bak");
    if let Err(err) = tokio::fs::rename(exe, &backup).await {
        warn!(error = %err, path = %backup.display(), "could not back up current binary");
    }

    if let Err(err) = tokio::fs::rename(staged, exe).await {
        if let Err(restore_err) = tokio::fs::rename(&backup, exe).await {
            error!(
                error = %restore_err,
                backup = %backup.display(),
                "rollback failed; previous binary left at backup path"
            );
        }
        return Err(UpdateError::Replace(err));
    }
    Ok(())
}
