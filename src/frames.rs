//! Thin async wrapper over the `ffprobe` and `ffmpeg` binaries.
//!
//! Only two questions are ever asked of a video: how long is it, and what do a
//! handful of frames from it look like.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tokio::process::Command;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("{program} could not be started: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: std::process::ExitStatus,
        stderr: String,
    },

    #[error("could not read duration from ffprobe output: {0}")]
    Duration(String),

    #[error("I/O error while collecting frames: {0}")]
    Io(#[from] std::io::Error),
}

/// Parameters for one frame-extraction run.
#[derive(Debug, Clone)]
pub struct FrameRequest {
    /// Sampling rate in frames per second of source video.
    pub rate_hz: f64,
    /// Upper bound on the number of frames written.
    pub count: u32,
    pub output_dir: PathBuf,
    /// Frames are written as `<stem>_<n>.jpg`, `n` starting at 1.
    pub stem: String,
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    format: Option<ProbeFormat>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FrameExtractor {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
}

impl FrameExtractor {
    pub fn new(ffmpeg: impl Into<PathBuf>, ffprobe: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
        }
    }

    /// Returns the container duration in seconds.
    pub async fn probe_duration(&self, video: &Path) -> Result<f64, FrameError> {
        let mut command = Command::new(&self.ffprobe);
        command
            .args(["-v", "error", "-print_format", "json", "-show_format"])
            .arg(video);
        let stdout = run(command, &self.ffprobe).await?;

        let parsed: ProbeOutput = serde_json::from_slice(&stdout)
            .map_err(|err| FrameError::Duration(err.to_string()))?;
        let raw = parsed
            .format
            .and_then(|format| format.duration)
            .ok_or_else(|| FrameError::Duration("no format.duration field".into()))?;
        let seconds: f64 = raw
            .trim()
            .parse()
            .map_err(|_| FrameError::Duration(format!("{raw:?} is not a number")))?;
        if !seconds.is_finite() || seconds < 0.0 {
            return Err(FrameError::Duration(format!("{raw:?} is out of range")));
        }
        Ok(seconds)
    }

    /// Writes up to `request.count` JPEG stills and returns their paths in
    /// frame order. Short videos may legitimately yield fewer, or none.
    pub async fn extract_frames(
        &self,
        video: &Path,
        request: &FrameRequest,
    ) -> Result<Vec<PathBuf>, FrameError> {
        tokio::fs::create_dir_all(&request.output_dir).await?;

        let pattern = request
            .output_dir
            .join(format!("{}_%d.jpg", request.stem));
        let mut command = Command::new(&self.ffmpeg);
        command
            .args(["-hide_banner", "-loglevel", "error", "-y", "-i"])
            .arg(video)
            .arg("-vf")
            .arg(format!("fps={}", request.rate_hz))
            .arg("-frames:v")
            .arg(request.count.to_string())
            .args(["-q:v", "2"])
            .arg(&pattern);
        run(command, &self.ffmpeg).await?;

        collect_frames(&request.output_dir, &request.stem, request.count).await
    }
}

async fn run(mut command: Command, program: &Path) -> Result<Vec<u8>, FrameError> {
    let output = command
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| FrameError::Spawn {
            program: program.display().to_string(),
            source,
        })?;

    if !output.status.success() {
        return Err(FrameError::Failed {
            program: program.display().to_string(),
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(output.stdout)
}

/// Lists `<stem>_<n>.jpg` files in `dir`, sorted by `n`.
async fn collect_frames(dir: &Path, stem: &str, limit: u32) -> Result<Vec<PathBuf>, FrameError> {
    let prefix = format!("{stem}_");
    let mut frames = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        let index = name
            .strip_prefix(&prefix)
            .and_then(|rest| rest.strip_suffix(".jpg"))
            .and_then(|digits| digits.parse::<u32>().ok());
        if let Some(index) = index {
            frames.push((index, entry.path()));
        }
    }

    frames.sort_by_key(|(index, _)| *index);
    Ok(frames
        .into_iter()
        .take(limit as usize)
        .map(|(_, path)| path)
        .collect())
}

#[cfg(all(test, unix))]
pub(crate) mod test_support {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};

    fn install_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, format!("#!/usr/bin/env bash\nset -euo pipefail\n{body}")).unwrap();
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).unwrap();
        path
    }

    /// Fake `ffprobe` that reports `duration` for any input.
    pub fn install_ffprobe_stub(dir: &Path, duration: &str) -> PathBuf {
        install_script(
            dir,
            "ffprobe",
            &format!("cat <<'JSON'\n{{\"format\": {{\"duration\": \"{duration}\"}}}}\nJSON\n"),
        )
    }

    /// Fake `ffprobe` that fails the way it does on a corrupt file.
    pub fn install_failing_ffprobe(dir: &Path) -> PathBuf {
        install_script(
            dir,
            "ffprobe",
            "echo 'Invalid data found when processing input' >&2\nexit 1\n",
        )
    }

    /// Fake `ffmpeg` that rejects its input without writing any frame.
    pub fn install_failing_ffmpeg(dir: &Path) -> PathBuf {
        install_script(
            dir,
            "ffmpeg",
            "echo 'Error opening input: Invalid data found when processing input' >&2\nexit 1\n",
        )
    }

    /// Fake `ffmpeg` that writes `frames` files using the output pattern (the
    /// last argument), replacing `%d` with 1..=frames.
    pub fn install_ffmpeg_stub(dir: &Path, frames: u32) -> PathBuf {
        install_script(
            dir,
            "ffmpeg",
            &format!(
                "pattern=\"${{@: -1}}\"\nfor ((i = 1; i <= {frames}; i++)); do\n    printf 'jpeg' > \"${{pattern/\\%d/$i}}\"\ndone\n"
            ),
        )
    }
}
