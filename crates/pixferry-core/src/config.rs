//! Configuration module
//!
//! All configuration comes from a single `KEY=value` text file whose path is
//! given by the `CONFIG_PATH` environment variable. Settings are grouped into
//! typed sections and validated once at load; components receive the sections
//! they need and never consult the environment themselves.

use std::collections::HashMap;
use std::env;
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{PipelineError, PipelineResult};

/// Default config file location when `CONFIG_PATH` is unset.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/pixferry/pixferry.conf";

const JPEG_QUALITY: u8 = 85;
const VIDEO_CRF: u8 = 28;
const COMPRESSION_INTERVAL_YEARS: u32 = 2;
const INITIAL_RESIZE_PERCENTAGE: u32 = 90;
const SUBSEQUENT_RESIZE_PERCENTAGE: u32 = 70;
const INITIAL_VIDEO_RESOLUTION: u32 = 1080;
const SUBSEQUENT_VIDEO_RESOLUTION: u32 = 720;
const MAX_BATCH_SIZE_GB: f64 = 5.0;
const MAX_BATCH_FILES: u64 = 500;
const UPLOAD_RETRY_ATTEMPTS: u32 = 3;
const UPLOAD_RETRY_DELAY_SECS: u64 = 30;
const ICLOUD_UPLOAD_TIMEOUT_SECS: u64 = 300;
const PIXEL_SYNC_TIMEOUT_SECS: u64 = 1800;
const PIXEL_SYNC_POLL_INTERVAL_SECS: u64 = 5;
const MIRROR_QUEUE_CAP: usize = 10_000;
const WORKERS_PER_PHASE: usize = 4;
const TWO_FACTOR_WAIT_SECS: u64 = 300;

/// Content hash algorithm used by deduplication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Md5,
    Sha256,
}

impl Display for HashAlgorithm {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            HashAlgorithm::Md5 => write!(f, "md5"),
            HashAlgorithm::Sha256 => write!(f, "sha256"),
        }
    }
}

impl FromStr for HashAlgorithm {
    type Err = PipelineError;

    fn from_str(s: &str) -> PipelineResult<Self> {
        match s.to_lowercase().as_str() {
            "md5" => Ok(HashAlgorithm::Md5),
            "sha256" => Ok(HashAlgorithm::Sha256),
            _ => Err(PipelineError::Config(format!(
                "DEDUPLICATION_HASH_ALGORITHM must be md5 or sha256, got '{}'",
                s
            ))),
        }
    }
}

/// ffmpeg x264 preset used for video recompression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VideoPreset {
    Ultrafast,
    Fast,
    #[default]
    Medium,
    Slow,
    Veryslow,
}

impl VideoPreset {
    pub fn as_str(self) -> &'static str {
        match self {
            VideoPreset::Ultrafast => "ultrafast",
            VideoPreset::Fast => "fast",
            VideoPreset::Medium => "medium",
            VideoPreset::Slow => "slow",
            VideoPreset::Veryslow => "veryslow",
        }
    }
}

impl FromStr for VideoPreset {
    type Err = PipelineError;

    fn from_str(s: &str) -> PipelineResult<Self> {
        match s.to_lowercase().as_str() {
            "ultrafast" => Ok(VideoPreset::Ultrafast),
            "fast" => Ok(VideoPreset::Fast),
            "medium" => Ok(VideoPreset::Medium),
            "slow" => Ok(VideoPreset::Slow),
            "veryslow" => Ok(VideoPreset::Veryslow),
            _ => Err(PipelineError::Config(format!(
                "VIDEO_PRESET must be one of ultrafast/fast/medium/slow/veryslow, got '{}'",
                s
            ))),
        }
    }
}

/// Directory layout rooted at the NAS mount.
#[derive(Debug, Clone)]
pub struct PathLayout {
    pub nas_mount: PathBuf,
    pub originals_dir: PathBuf,
    pub compressed_dir: PathBuf,
    pub bridge_icloud_dir: PathBuf,
    pub bridge_pixel_dir: PathBuf,
    pub uploaded_icloud_dir: PathBuf,
    pub uploaded_pixel_dir: PathBuf,
    pub sorted_dir: PathBuf,
    pub cleanup_dir: PathBuf,
    pub logs_dir: PathBuf,
    /// Folder watched by the sync daemon; normally equals `bridge_pixel_dir`.
    pub pixel_sync_folder: PathBuf,
}

impl PathLayout {
    pub fn bridge_dir(&self, dest: crate::models::UploadKind) -> &Path {
        match dest {
            crate::models::UploadKind::ICloud => &self.bridge_icloud_dir,
            crate::models::UploadKind::Pixel => &self.bridge_pixel_dir,
        }
    }

    pub fn uploaded_dir(&self, dest: crate::models::UploadKind) -> &Path {
        match dest {
            crate::models::UploadKind::ICloud => &self.uploaded_icloud_dir,
            crate::models::UploadKind::Pixel => &self.uploaded_pixel_dir,
        }
    }
}

/// Per-phase feature gates.
#[derive(Debug, Clone, Default)]
pub struct FeatureToggles {
    pub icloud_download: bool,
    pub folder_download: bool,
    pub deduplication: bool,
    pub compression: bool,
    pub file_preparation: bool,
    pub icloud_upload: bool,
    pub pixel_upload: bool,
    pub verification: bool,
    pub sorting: bool,
}

/// Age-tiered compression parameters.
#[derive(Debug, Clone)]
pub struct CompressionPolicy {
    pub jpeg_quality: u8,
    pub video_crf: u8,
    pub video_preset: VideoPreset,
    /// Files captured within this many years get the initial (gentler) tier.
    pub interval_years: u32,
    pub initial_resize_percentage: u32,
    pub subsequent_resize_percentage: u32,
    pub initial_video_resolution: u32,
    pub subsequent_video_resolution: u32,
    pub ffmpeg_path: String,
    pub ffprobe_path: String,
}

#[derive(Debug, Clone)]
pub struct DedupePolicy {
    pub hash_algorithm: HashAlgorithm,
    /// Extra roots swept by the folder ingest adapter.
    pub extra_directories: Vec<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct StagingPolicy {
    pub max_batch_size_gb: f64,
    pub max_batch_files: u64,
    pub clear_bridge_before_processing: bool,
}

impl StagingPolicy {
    pub fn max_batch_size_bytes(&self) -> u64 {
        (self.max_batch_size_gb * 1024.0 * 1024.0 * 1024.0) as u64
    }
}

/// Browser-automation uploader settings.
#[derive(Debug, Clone)]
pub struct ICloudPolicy {
    pub retry_attempts: u32,
    pub retry_delay_secs: u64,
    pub upload_timeout_secs: u64,
    /// Tried first when set; the bundled candidate list is skipped if it matches.
    pub selector_override: Option<String>,
    pub session_file: PathBuf,
    pub headless: bool,
    pub webdriver_url: String,
}

/// File-sync daemon settings for the paired device.
#[derive(Debug, Clone)]
pub struct PixelPolicy {
    pub api_url: String,
    pub api_key: String,
    pub folder_id: String,
    pub sync_timeout_secs: u64,
    pub poll_interval_secs: u64,
}

/// Metadata store settings.
#[derive(Debug, Clone)]
pub struct StorePolicy {
    pub local_db_path: PathBuf,
    pub remote_db_url: Option<String>,
    pub remote_db_key: Option<String>,
    pub mirror_queue_cap: usize,
}

#[derive(Debug, Clone)]
pub struct LoggingPolicy {
    pub level: String,
    pub verbose: bool,
}

#[derive(Debug, Clone)]
pub struct RuntimePolicy {
    pub workers_per_phase: usize,
    pub two_factor_wait_secs: u64,
}

/// Validated application configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub paths: PathLayout,
    pub features: FeatureToggles,
    pub compression: CompressionPolicy,
    pub dedupe: DedupePolicy,
    pub staging: StagingPolicy,
    pub icloud: ICloudPolicy,
    pub pixel: PixelPolicy,
    pub store: StorePolicy,
    pub logging: LoggingPolicy,
    pub runtime: RuntimePolicy,
}

impl PipelineConfig {
    /// Load from the path named by `CONFIG_PATH`, falling back to the
    /// platform default.
    pub fn from_env() -> PipelineResult<Self> {
        let path = env::var("CONFIG_PATH").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load(Path::new(&path))
    }

    /// Load and validate a `KEY=value` config file.
    pub fn load(path: &Path) -> PipelineResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::Config(format!("cannot read config file {}: {}", path.display(), e))
        })?;
        Self::parse(&raw)
    }

    /// Parse config file contents. Lines are `KEY=value`; `#` starts a
    /// comment; values may be wrapped in single or double quotes.
    pub fn parse(raw: &str) -> PipelineResult<Self> {
        let mut map = HashMap::new();
        for (lineno, line) in raw.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| {
                PipelineError::Config(format!("line {}: expected KEY=value", lineno + 1))
            })?;
            let value = value.trim();
            let value = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
                .unwrap_or(value);
            map.insert(key.trim().to_uppercase(), value.to_string());
        }
        Self::from_map(&map)
    }

    fn from_map(map: &HashMap<String, String>) -> PipelineResult<Self> {
        let nas_mount = require_path(map, "NAS_MOUNT")?;

        let paths = PathLayout {
            originals_dir: path_or(map, "ORIGINALS_DIR", nas_mount.join("originals")),
            compressed_dir: path_or(map, "COMPRESSED_DIR", nas_mount.join("compressed")),
            bridge_icloud_dir: path_or(map, "BRIDGE_ICLOUD_DIR", nas_mount.join("bridge/icloud")),
            bridge_pixel_dir: path_or(map, "BRIDGE_PIXEL_DIR", nas_mount.join("bridge/pixel")),
            uploaded_icloud_dir: path_or(
                map,
                "UPLOADED_ICLOUD_DIR",
                nas_mount.join("uploaded/icloud"),
            ),
            uploaded_pixel_dir: path_or(
                map,
                "UPLOADED_PIXEL_DIR",
                nas_mount.join("uploaded/pixel"),
            ),
            sorted_dir: path_or(map, "SORTED_DIR", nas_mount.join("sorted")),
            cleanup_dir: path_or(map, "CLEANUP_DIR", nas_mount.join("cleanup")),
            logs_dir: path_or(map, "LOGS_DIR", nas_mount.join("logs")),
            pixel_sync_folder: path_or(
                map,
                "PIXEL_SYNC_FOLDER",
                nas_mount.join("bridge/pixel"),
            ),
            nas_mount,
        };

        let features = FeatureToggles {
            icloud_download: bool_or(map, "ENABLE_ICLOUD_DOWNLOAD", false)?,
            folder_download: bool_or(map, "ENABLE_FOLDER_DOWNLOAD", false)?,
            deduplication: bool_or(map, "ENABLE_DEDUPLICATION", true)?,
            compression: bool_or(map, "ENABLE_COMPRESSION", true)?,
            file_preparation: bool_or(map, "ENABLE_FILE_PREPARATION", true)?,
            icloud_upload: bool_or(map, "ENABLE_ICLOUD_UPLOAD", false)?,
            pixel_upload: bool_or(map, "ENABLE_PIXEL_UPLOAD", false)?,
            verification: bool_or(map, "ENABLE_VERIFICATION", true)?,
            sorting: bool_or(map, "ENABLE_SORTING", true)?,
        };

        let compression = CompressionPolicy {
            jpeg_quality: int_or(map, "JPEG_QUALITY", JPEG_QUALITY as i64)? as u8,
            video_crf: int_or(map, "VIDEO_CRF", VIDEO_CRF as i64)? as u8,
            video_preset: match map.get("VIDEO_PRESET") {
                Some(v) => v.parse()?,
                None => VideoPreset::default(),
            },
            interval_years: int_or(
                map,
                "COMPRESSION_INTERVAL_YEARS",
                COMPRESSION_INTERVAL_YEARS as i64,
            )? as u32,
            initial_resize_percentage: int_or(
                map,
                "INITIAL_RESIZE_PERCENTAGE",
                INITIAL_RESIZE_PERCENTAGE as i64,
            )? as u32,
            subsequent_resize_percentage: int_or(
                map,
                "SUBSEQUENT_RESIZE_PERCENTAGE",
                SUBSEQUENT_RESIZE_PERCENTAGE as i64,
            )? as u32,
            initial_video_resolution: int_or(
                map,
                "INITIAL_VIDEO_RESOLUTION",
                INITIAL_VIDEO_RESOLUTION as i64,
            )? as u32,
            subsequent_video_resolution: int_or(
                map,
                "SUBSEQUENT_VIDEO_RESOLUTION",
                SUBSEQUENT_VIDEO_RESOLUTION as i64,
            )? as u32,
            ffmpeg_path: string_or(map, "FFMPEG_PATH", "ffmpeg"),
            ffprobe_path: string_or(map, "FFPROBE_PATH", "ffprobe"),
        };

        let dedupe = DedupePolicy {
            hash_algorithm: match map.get("DEDUPLICATION_HASH_ALGORITHM") {
                Some(v) => v.parse()?,
                None => HashAlgorithm::Sha256,
            },
            extra_directories: map
                .get("DEDUPLICATION_DIRECTORIES")
                .map(|s| {
                    s.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(PathBuf::from)
                        .collect()
                })
                .unwrap_or_default(),
        };

        let staging = StagingPolicy {
            max_batch_size_gb: float_or(map, "MAX_BATCH_SIZE_GB", MAX_BATCH_SIZE_GB)?,
            max_batch_files: int_or(map, "MAX_BATCH_FILES", MAX_BATCH_FILES as i64)? as u64,
            clear_bridge_before_processing: bool_or(map, "CLEAR_BRIDGE_BEFORE_PROCESSING", false)?,
        };

        let icloud = ICloudPolicy {
            retry_attempts: int_or(map, "UPLOAD_RETRY_ATTEMPTS", UPLOAD_RETRY_ATTEMPTS as i64)?
                as u32,
            retry_delay_secs: int_or(map, "UPLOAD_RETRY_DELAY", UPLOAD_RETRY_DELAY_SECS as i64)?
                as u64,
            upload_timeout_secs: int_or(
                map,
                "ICLOUD_UPLOAD_TIMEOUT",
                ICLOUD_UPLOAD_TIMEOUT_SECS as i64,
            )? as u64,
            selector_override: map
                .get("ICLOUD_UPLOAD_SELECTOR")
                .filter(|s| !s.is_empty())
                .cloned(),
            session_file: path_or(
                map,
                "ICLOUD_SESSION_FILE",
                paths.nas_mount.join(".icloud_session.json"),
            ),
            headless: bool_or(map, "PUPPETEER_HEADLESS", true)?,
            webdriver_url: string_or(map, "WEBDRIVER_URL", "http://localhost:9515"),
        };

        let pixel = PixelPolicy {
            api_url: string_or(map, "SYNCTHING_API_URL", "http://localhost:8384"),
            api_key: map.get("SYNCTHING_API_KEY").cloned().unwrap_or_default(),
            folder_id: string_or(map, "SYNCTHING_FOLDER_ID", "pixel"),
            sync_timeout_secs: int_or(map, "PIXEL_SYNC_TIMEOUT", PIXEL_SYNC_TIMEOUT_SECS as i64)?
                as u64,
            poll_interval_secs: int_or(
                map,
                "PIXEL_SYNC_POLL_INTERVAL",
                PIXEL_SYNC_POLL_INTERVAL_SECS as i64,
            )? as u64,
        };

        let store = StorePolicy {
            local_db_path: require_path(map, "LOCAL_DB_PATH")?,
            remote_db_url: map.get("REMOTE_DB_URL").filter(|s| !s.is_empty()).cloned(),
            remote_db_key: map.get("REMOTE_DB_KEY").filter(|s| !s.is_empty()).cloned(),
            mirror_queue_cap: int_or(map, "MIRROR_QUEUE_CAP", MIRROR_QUEUE_CAP as i64)? as usize,
        };

        let logging = LoggingPolicy {
            level: string_or(map, "LOG_LEVEL", "info"),
            verbose: bool_or(map, "VERBOSE_LOGGING", false)?,
        };

        let runtime = RuntimePolicy {
            workers_per_phase: int_or(map, "WORKERS_PER_PHASE", WORKERS_PER_PHASE as i64)? as usize,
            two_factor_wait_secs: int_or(
                map,
                "TWO_FACTOR_WAIT_SECONDS",
                TWO_FACTOR_WAIT_SECS as i64,
            )? as u64,
        };

        let config = Self {
            paths,
            features,
            compression,
            dedupe,
            staging,
            icloud,
            pixel,
            store,
            logging,
            runtime,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> PipelineResult<()> {
        if !(1..=100).contains(&self.compression.jpeg_quality) {
            return Err(PipelineError::Config(format!(
                "JPEG_QUALITY must be 1-100, got {}",
                self.compression.jpeg_quality
            )));
        }
        if self.compression.initial_resize_percentage == 0
            || self.compression.initial_resize_percentage > 100
            || self.compression.subsequent_resize_percentage == 0
            || self.compression.subsequent_resize_percentage > 100
        {
            return Err(PipelineError::Config(
                "resize percentages must be 1-100".to_string(),
            ));
        }
        if self.staging.max_batch_size_gb <= 0.0 {
            return Err(PipelineError::Config(
                "MAX_BATCH_SIZE_GB must be positive".to_string(),
            ));
        }
        if self.staging.max_batch_files == 0 {
            return Err(PipelineError::Config(
                "MAX_BATCH_FILES must be positive".to_string(),
            ));
        }
        if self.features.pixel_upload && self.pixel.api_key.is_empty() {
            return Err(PipelineError::Config(
                "ENABLE_PIXEL_UPLOAD requires SYNCTHING_API_KEY".to_string(),
            ));
        }
        if self.store.remote_db_url.is_some() && self.store.remote_db_key.is_none() {
            return Err(PipelineError::Config(
                "REMOTE_DB_URL requires REMOTE_DB_KEY".to_string(),
            ));
        }
        if self.runtime.workers_per_phase == 0 {
            return Err(PipelineError::Config(
                "WORKERS_PER_PHASE must be positive".to_string(),
            ));
        }
        match self.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => {
                return Err(PipelineError::Config(format!(
                    "LOG_LEVEL must be trace/debug/info/warn/error, got '{}'",
                    other
                )));
            }
        }
        Ok(())
    }
}

fn require_path(map: &HashMap<String, String>, key: &str) -> PipelineResult<PathBuf> {
    map.get(key)
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .ok_or_else(|| PipelineError::Config(format!("{} is required", key)))
}

fn path_or(map: &HashMap<String, String>, key: &str, default: PathBuf) -> PathBuf {
    map.get(key)
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .unwrap_or(default)
}

fn string_or(map: &HashMap<String, String>, key: &str, default: &str) -> String {
    map.get(key)
        .filter(|s| !s.is_empty())
        .cloned()
        .unwrap_or_else(|| default.to_string())
}

fn bool_or(map: &HashMap<String, String>, key: &str, default: bool) -> PipelineResult<bool> {
    match map.get(key) {
        None => Ok(default),
        Some(raw) => match raw.to_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            _ => Err(PipelineError::Config(format!(
                "{} must be a boolean (true/false/1/0/yes/no), got '{}'",
                key, raw
            ))),
        },
    }
}

fn int_or(map: &HashMap<String, String>, key: &str, default: i64) -> PipelineResult<i64> {
    match map.get(key) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|_| {
            PipelineError::Config(format!("{} must be an integer, got '{}'", key, raw))
        }),
    }
}

fn float_or(map: &HashMap<String, String>, key: &str, default: f64) -> PipelineResult<f64> {
    match map.get(key) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|_| {
            PipelineError::Config(format!("{} must be a number, got '{}'", key, raw))
        }),
    }
}
