use async_trait::async_trait;
use serde::Serialize;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{JsonFileSource, ListingSource, SellerScope, SourceBatch, SourceError};

/// Marker the storefront client prints when it needs a fresh login.
const LOGIN_PROMPT: &str = "QR code";

/// Captured result of one scraper process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScrapeOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ScrapeOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    pub fn requires_login(&self) -> bool {
        self.stdout.contains(LOGIN_PROMPT) || self.stderr.contains(LOGIN_PROMPT)
    }

    /// Non-empty output lines, stderr lines prefixed with `[stderr]`.
    pub fn lines(&self) -> impl Iterator<Item = String> + '_ {
        let out = self.stdout.lines().map(str::to_string);
        let err = self.stderr.lines().map(|line| format!("[stderr] {line}"));
        out.chain(err).filter(|line| !line.trim().is_empty())
    }
}

/// Runs the scraper as a child process, then reads the export it writes.
#[derive(Debug, Clone)]
pub struct CommandSource {
    command: String,
    workdir: Option<PathBuf>,
    export: JsonFileSource,
}

impl CommandSource {
    /// `command` is run through `sh -c`; `output` is resolved against `workdir` when relative.
    pub fn new(command: impl Into<String>, workdir: Option<PathBuf>, output: impl Into<PathBuf>) -> Self {
        let output = output.into();
        let output = match (&workdir, output.is_relative()) {
            (Some(dir), true) => dir.join(output),
            _ => output,
        };
        Self {
            command: command.into(),
            workdir,
            export: JsonFileSource::new(output),
        }
    }

    async fn scrape(&self, cancel: &CancellationToken) -> Result<ScrapeOutput, SourceError> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&self.command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // own process group, so cancellation reaches everything the shell started
            .process_group(0)
            .kill_on_drop(true);
        if let Some(dir) = &self.workdir {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .map_err(|err| SourceError::Unavailable(format!("failed to spawn scraper: {err}")))?;
        info!(target = "catalog.source", command = %self.command, pid = child.id(), "scraper_started");

        let stdout = tokio::spawn(drain(child.stdout.take()));
        let stderr = tokio::spawn(drain(child.stderr.take()));

        let finished = tokio::select! {
            status = child.wait() => Some(status?),
            _ = cancel.cancelled() => None,
        };
        let Some(status) = finished else {
            warn!(target = "catalog.source", "scraper_cancelled");
            if let Some(pgid) = child.id() {
                kill_process_group(pgid).await;
            }
            child.kill().await?;
            return Err(SourceError::Cancelled);
        };

        Ok(ScrapeOutput {
            exit_code: status.code(),
            stdout: stdout.await.unwrap_or_default(),
            stderr: stderr.await.unwrap_or_default(),
        })
    }
}

/// SIGKILLs every process in the group led by `pgid`.
async fn kill_process_group(pgid: u32) {
    let result = Command::new("kill")
        .args(["-s", "KILL", "--", &format!("-{pgid}")])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    match result {
        Ok(status) if status.success() => {}
        Ok(status) => warn!(target = "catalog.source", pgid, code = ?status.code(), "scraper_group_kill_failed"),
        Err(err) => warn!(target = "catalog.source", pgid, error = %err, "scraper_group_kill_failed"),
    }
}

async fn drain<R: AsyncRead + Unpin>(pipe: Option<R>) -> String {
    let mut buf = String::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_string(&mut buf).await;
    }
    buf
}

#[async_trait]
impl ListingSource for CommandSource {
    async fn fetch(
        &self,
        scope: &SellerScope,
        cancel: &CancellationToken,
    ) -> Result<SourceBatch, SourceError> {
        let output = self.scrape(cancel).await?;

        if output.requires_login() {
            return Err(SourceError::AuthRequired);
        }
        if !output.success() {
            let code = output
                .exit_code
                .map_or_else(|| "signal".to_string(), |code| code.to_string());
            return Err(SourceError::Unavailable(format!("scraper exited with {code}")));
        }

        let mut batch = self.export.read(scope).await?;
        batch.output = Some(output);
        Ok(batch)
    }
}
