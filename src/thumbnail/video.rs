use crate::error::{Error, Result};
use std::{
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};
use tokio::process::Command;
use tracing::{debug, info};

/// Looks for `ffmpeg` on `PATH`.
pub fn discover() -> Option<PathBuf> {
    match which::which("ffmpeg") {
        Ok(path) => Some(path),
        Err(_) => {
            info!("ffmpeg not found in PATH; video previews are disabled");
            None
        }
    }
}

/// Extracts the first decodable frame of `source` as PNG bytes.
///
/// The child process is killed if this future is dropped or the timeout
/// elapses, so an abandoned request leaves nothing running.
pub(crate) async fn extract_frame(
    ffmpeg: &Path,
    source: &Path,
    relative: &str,
    timeout: Duration,
) -> Result<Vec<u8>> {
    let mut command = Command::new(ffmpeg);
    command
        .args(["-v", "error", "-nostdin", "-i"])
        .arg(source)
        .args(["-frames:v", "1", "-f", "image2pipe", "-vcodec", "png", "pipe:1"])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = match tokio::time::timeout(timeout, command.output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            debug!("Failed to run {}: {}", ffmpeg.display(), e);
            return Err(Error::UnsupportedType(relative.to_string()));
        }
        Err(_) => {
            debug!("Frame extraction for {} timed out", source.display());
            return Err(Error::UnsupportedType(relative.to_string()));
        }
    };

    if !output.status.success() || output.stdout.is_empty() {
        debug!(
            "ffmpeg could not extract a frame from {}: {}",
            source.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        );
        return Err(Error::UnsupportedType(relative.to_string()));
    }
    Ok(output.stdout)
}
