use anyhow::{Context, Result};
use std::{
    fs,
    path::{Path, PathBuf},
};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/tutortube-env";
pub const DEFAULT_STATIC_ROOT: &str = "./static";
pub const DEFAULT_DATABASE_PATH: &str = "./tutortube.db";
pub const DEFAULT_TUTORTUBE_PORT: u16 = 8080;
pub const DEFAULT_TUTORTUBE_HOST: &str = "127.0.0.1";
pub const DEFAULT_FFMPEG_BIN: &str = "ffmpeg";
pub const DEFAULT_FFPROBE_BIN: &str = "ffprobe";
pub const DEFAULT_MAX_UPLOAD_MB: usize = 512;

/// Values read from the env-style config file. Every key is optional.
#[derive(Debug, Clone, Default)]
pub struct EnvConfig {
    pub static_root: Option<PathBuf>,
    pub database_path: Option<PathBuf>,
    pub tutortube_host: Option<String>,
    pub tutortube_port: Option<u16>,
    pub ffmpeg_bin: Option<PathBuf>,
    pub ffprobe_bin: Option<PathBuf>,
    pub max_upload_mb: Option<usize>,
}

/// Fully resolved settings the server runs with.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub static_root: PathBuf,
    pub database_path: PathBuf,
    pub host: String,
    pub port: u16,
    pub ffmpeg_bin: PathBuf,
    pub ffprobe_bin: PathBuf,
    pub max_upload_bytes: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::from_env_config(EnvConfig::default())
    }
}

impl RuntimeConfig {
    fn from_env_config(cfg: EnvConfig) -> Self {
        Self {
            static_root: cfg
                .static_root
                .unwrap_or_else(|| PathBuf::from(DEFAULT_STATIC_ROOT)),
            database_path: cfg
                .database_path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DATABASE_PATH)),
            host: cfg
                .tutortube_host
                .unwrap_or_else(|| DEFAULT_TUTORTUBE_HOST.to_string()),
            port: cfg.tutortube_port.unwrap_or(DEFAULT_TUTORTUBE_PORT),
            ffmpeg_bin: cfg
                .ffmpeg_bin
                .unwrap_or_else(|| PathBuf::from(DEFAULT_FFMPEG_BIN)),
            ffprobe_bin: cfg
                .ffprobe_bin
                .unwrap_or_else(|| PathBuf::from(DEFAULT_FFPROBE_BIN)),
            max_upload_bytes: cfg.max_upload_mb.unwrap_or(DEFAULT_MAX_UPLOAD_MB) * 1024 * 1024,
        }
    }
}

pub fn read_env_config(path: &Path) -> Result<Option<EnvConfig>> {
    if !path.exists() {
        return Ok(None);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    let mut cfg = EnvConfig::default();
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let Some((key, value_raw)) = trimmed.split_once('=') else {
            continue;
        };
        let value = value_raw.trim().trim_matches('"');
        if value.is_empty() {
            continue;
        }
        match key.trim() {
            "STATIC_ROOT" => cfg.static_root = Some(PathBuf::from(value)),
            "DATABASE_PATH" => cfg.database_path = Some(PathBuf::from(value)),
            "TUTORTUBE_HOST" => cfg.tutortube_host = Some(value.to_string()),
            "TUTORTUBE_PORT" => {
                let port: u16 = value
                    .parse()
                    .with_context(|| format!("Parsing TUTORTUBE_PORT from {}", path.display()))?;
                cfg.tutortube_port = Some(port);
            }
            "FFMPEG_BIN" => cfg.ffmpeg_bin = Some(PathBuf::from(value)),
            "FFPROBE_BIN" => cfg.ffprobe_bin = Some(PathBuf::from(value)),
            "MAX_UPLOAD_MB" => {
                let limit: usize = value
                    .parse()
                    .with_context(|| format!("Parsing MAX_UPLOAD_MB from {}", path.display()))?;
                cfg.max_upload_mb = Some(limit);
            }
            _ => {}
        }
    }
    Ok(Some(cfg))
}

/// Loads the runtime configuration. A missing file is not an error: the
/// server then runs entirely on defaults.
pub fn load_runtime_config_from(path: impl AsRef<Path>) -> Result<RuntimeConfig> {
    let path = path.as_ref();
    let cfg = read_env_config(path)?.unwrap_or_default();
    Ok(RuntimeConfig::from_env_config(cfg))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn make_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", contents).unwrap();
        file
    }

    #[test]
    fn read_env_config_extracts_port_and_binaries() {
        let cfg = make_config(
            "TUTORTUBE_PORT=\"4242\"\nFFMPEG_BIN=\"/opt/ff/ffmpeg\"\n# comment\nUNKNOWN=1\n",
        );
        let parsed = read_env_config(cfg.path()).unwrap().unwrap();
        assert_eq!(parsed.tutortube_port, Some(4242));
        assert_eq!(parsed.ffmpeg_bin, Some(PathBuf::from("/opt/ff/ffmpeg")));
        assert_eq!(parsed.ffprobe_bin, None);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = load_runtime_config_from(dir.path().join("absent-env")).unwrap();
        assert_eq!(runtime.port, DEFAULT_TUTORTUBE_PORT);
        assert_eq!(runtime.host, DEFAULT_TUTORTUBE_HOST);
        assert_eq!(runtime.static_root, PathBuf::from(DEFAULT_STATIC_ROOT));
        assert_eq!(runtime.max_upload_bytes, DEFAULT_MAX_UPLOAD_MB * 1024 * 1024);
    }

    #[test]
    fn load_runtime_config_reads_paths_and_limit() {
        let cfg = make_config(
            "STATIC_ROOT=\"/srv/static\"\nDATABASE_PATH=\"/srv/videos.db\"\nTUTORTUBE_HOST=\"0.0.0.0\"\nMAX_UPLOAD_MB=\"8\"\n",
        );
        let runtime = load_runtime_config_from(cfg.path()).unwrap();
        assert_eq!(runtime.static_root, PathBuf::from("/srv/static"));
        assert_eq!(runtime.database_path, PathBuf::from("/srv/videos.db"));
        assert_eq!(runtime.host, "0.0.0.0");
        assert_eq!(runtime.max_upload_bytes, 8 * 1024 * 1024);
    }

    #[test]
    fn invalid_port_is_reported() {
        let cfg = make_config("TUTORTUBE_PORT=\"not-a-port\"\n");
        let err = read_env_config(cfg.path()).unwrap_err();
        assert!(err.to_string().contains("TUTORTUBE_PORT"));
    }
}
