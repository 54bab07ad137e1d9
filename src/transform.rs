//! External guetzli recompressor invocation.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

const GUETZLI_CMD: &str = "guetzli";
const GUETZLI_MAX_MEMORY_MB: &str = "6000";
const PROCESSOR_LOG: &str = ".guetzli-processor.log";
const PATH_ENV_VARIABLE: &str = "PATH";

const WAIT_INCREMENT: Duration = Duration::from_secs(5);
const WAIT_ATTEMPTS: u32 = 180;

/// Recompresses images with the `guetzli` command line tool.
#[derive(Debug, Clone)]
pub struct GuetzliTransformer {
    command: String,
}

impl GuetzliTransformer {
    /// Create a transformer using the `guetzli` binary from the search path.
    pub fn new() -> Self {
        Self {
            command: std::env::var("GUETZLI_PATH").unwrap_or_else(|_| GUETZLI_CMD.to_string()),
        }
    }

    /// Create with a custom recompressor binary.
    pub fn with_command(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    /// Recompress `source` into the JPEG at `target`.
    ///
    /// The child is polled in 5 second increments for up to 180 attempts; a
    /// child still alive after the last attempt is killed and the call fails
    /// with [`Error::TransformTimeout`]. Child output is appended to
    /// `.guetzli-processor.log` next to the source, best-effort.
    pub async fn transform(&self, source: &Path, target: &Path) -> Result<()> {
        info!(source = %source.display(), target = %target.display(), "starting external recompressor");

        let mut cmd = Command::new(&self.command);
        cmd.arg("--memlimit")
            .arg(GUETZLI_MAX_MEMORY_MB)
            .arg(source)
            .arg(target)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Ok(search_path) = std::env::var(PATH_ENV_VARIABLE) {
            cmd.env(PATH_ENV_VARIABLE, search_path);
        }
        match open_processor_log(source) {
            Some((out, err)) => {
                cmd.stdout(out);
                cmd.stderr(err);
            }
            None => {
                cmd.stdout(Stdio::null());
                cmd.stderr(Stdio::null());
            }
        }

        let mut child = cmd.spawn()?;
        let mut finished = None;
        for attempt in 1..=WAIT_ATTEMPTS {
            match tokio::time::timeout(WAIT_INCREMENT, child.wait()).await {
                Ok(status) => {
                    finished = Some(status?);
                    break;
                }
                Err(_) => debug!(attempt, source = %source.display(), "recompressor still running"),
            }
        }
        let Some(status) = finished else {
            warn!(source = %source.display(), "transformation timeout, killing recompressor");
            let _ = child.kill().await;
            return Err(Error::TransformTimeout);
        };
        if !status.success() {
            return Err(Error::TransformFailed(status.code().unwrap_or(-1)));
        }

        info!(target = %target.display(), "external recompressor finished");
        Ok(())
    }
}

impl Default for GuetzliTransformer {
    fn default() -> Self {
        Self::new()
    }
}

/// Open the append-mode log next to the source, once for stdout and once
/// for stderr. `None` means child output is discarded; the transform itself
/// still runs.
fn open_processor_log(source: &Path) -> Option<(Stdio, Stdio)> {
    let dir = source.parent()?;
    match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(PROCESSOR_LOG))
    {
        Ok(file) => {
            let clone = file.try_clone().ok()?;
            Some((Stdio::from(clone), Stdio::from(file)))
        }
        Err(e) => {
            warn!(error = %e, "unable to open processor log, discarding child output");
            None
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn write_stub(dir: &TempDir, name: &str, script: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn test_transform_copies_source_to_target() {
        let dir = TempDir::new().unwrap();
        // args are: --memlimit 6000 <source> <target>
        let stub = write_stub(&dir, "guetzli-ok", "#!/bin/sh\ncp \"$3\" \"$4\"\n");
        let source = dir.path().join("source.jpg");
        let target = dir.path().join("target.jpg");
        std::fs::write(&source, b"jpeg bytes").unwrap();

        let transformer = GuetzliTransformer::with_command(stub.to_string_lossy());
        transformer.transform(&source, &target).await.unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"jpeg bytes");
    }

    #[tokio::test]
    async fn test_transform_nonzero_exit_fails_with_code() {
        let dir = TempDir::new().unwrap();
        let stub = write_stub(&dir, "guetzli-fail", "#!/bin/sh\nexit 3\n");
        let source = dir.path().join("source.jpg");
        std::fs::write(&source, b"jpeg").unwrap();

        let transformer = GuetzliTransformer::with_command(stub.to_string_lossy());
        let err = transformer
            .transform(&source, &dir.path().join("target.jpg"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TransformFailed(3)));
    }

    #[tokio::test]
    async fn test_transform_appends_child_output_to_log() {
        let dir = TempDir::new().unwrap();
        let stub = write_stub(
            &dir,
            "guetzli-noisy",
            "#!/bin/sh\necho out-line\necho err-line >&2\ncp \"$3\" \"$4\"\n",
        );
        let source = dir.path().join("source.jpg");
        std::fs::write(&source, b"jpeg").unwrap();

        let transformer = GuetzliTransformer::with_command(stub.to_string_lossy());
        transformer
            .transform(&source, &dir.path().join("target.jpg"))
            .await
            .unwrap();
        transformer
            .transform(&source, &dir.path().join("target2.jpg"))
            .await
            .unwrap();

        let log = std::fs::read_to_string(dir.path().join(PROCESSOR_LOG)).unwrap();
        assert_eq!(log.matches("out-line").count(), 2);
        assert_eq!(log.matches("err-line").count(), 2);
    }

    #[tokio::test]
    async fn test_transform_missing_binary_is_io_error() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("source.jpg");
        std::fs::write(&source, b"jpeg").unwrap();

        let transformer = GuetzliTransformer::with_command("/nonexistent/guetzli");
        let err = transformer
            .transform(&source, &dir.path().join("target.jpg"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}
