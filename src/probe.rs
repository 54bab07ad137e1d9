//! External JPEG quality probe.
//!
//! Wraps ImageMagick's `identify -format %Q`, which prints the stored
//! quality of a JPEG as a decimal integer on stdout.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{Error, Result};

const PROBE_CMD: &str = "identify";
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const PATH_ENV_VARIABLE: &str = "PATH";

/// Reports the stored JPEG quality level of an image file.
#[derive(Debug, Clone)]
pub struct QualityProbe {
    command: String,
}

impl QualityProbe {
    /// Create a probe using the `identify` binary from the search path.
    pub fn new() -> Self {
        Self {
            command: std::env::var("GUETZLI_IDENTIFY_PATH").unwrap_or_else(|_| PROBE_CMD.to_string()),
        }
    }

    /// Create with a custom probe binary.
    pub fn with_command(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    /// Fetch the quality level (1..=100) of the image at `path`.
    ///
    /// The probe process is given 5 seconds; a child still alive after that
    /// is killed and the call fails with [`Error::ProbeTimeout`].
    pub async fn probe(&self, path: &Path) -> Result<u8> {
        debug!(path = %path.display(), "fetching quality level");

        let mut cmd = Command::new(&self.command);
        cmd.arg("-format")
            .arg("%Q")
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if let Ok(search_path) = std::env::var(PATH_ENV_VARIABLE) {
            cmd.env(PATH_ENV_VARIABLE, search_path);
        }

        let mut child = cmd.spawn()?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::ProbeFailed("stdout not captured".to_string()))?;

        let status = match tokio::time::timeout(PROBE_TIMEOUT, child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                warn!(path = %path.display(), "quality probe did not finish, killing it");
                let _ = child.kill().await;
                return Err(Error::ProbeTimeout);
            }
        };
        if !status.success() {
            return Err(Error::ProbeFailed(format!(
                "exit status {}",
                status.code().unwrap_or(-1)
            )));
        }

        let mut output = String::new();
        stdout.read_to_string(&mut output).await?;
        let line = output.lines().next().unwrap_or("").trim();
        line.parse()
            .map_err(|_| Error::ProbeFailed(format!("unexpected output {line:?}")))
    }
}

impl Default for QualityProbe {
    fn default() -> Self {
        Self::new()
    }
}
