// 配置管理模块

use crate::uploader::{
    DEFAULT_MAX_FILE_SIZE_MB, DEFAULT_PARALLEL_UPLOADS, DEFAULT_PROGRESS_INTERVAL_MS, MAX_RETRIES,
    RETRY_BASE_DELAY_MS,
};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;

/// 应用配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// 服务器配置
    pub server: ServerConfig,
    /// 任务仓库配置
    #[serde(default)]
    pub repository: RepositoryConfig,
    /// 上传配置
    #[serde(default)]
    pub upload: UploadConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
        }
    }
}

/// 服务器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// 监听地址
    pub host: String,
    /// 监听端口
    pub port: u16,
    /// CORS允许的源
    pub cors_origins: Vec<String>,
}

/// 任务仓库配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryConfig {
    /// 服务根地址
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// CSRF 头名称（如 `X-CSRFToken`）
    #[serde(default)]
    pub csrf_header: Option<String>,
    /// CSRF 令牌
    #[serde(default)]
    pub csrf_token: Option<String>,
    /// 请求超时（秒），0 表示不限制
    #[serde(default)]
    pub request_timeout_secs: u64,
}

fn default_base_url() -> String {
    "http://localhost:8000".to_string()
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            csrf_header: None,
            csrf_token: None,
            request_timeout_secs: 0,
        }
    }
}

/// 上传配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// 最大同时上传文件数
    #[serde(default = "default_parallel_uploads")]
    pub parallel_uploads: usize,
    /// 单个文件最大重试次数
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// 退避基准延迟（毫秒），第 n 次重试前等待 n 倍
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// 单文件大小上限 (MB)
    #[serde(default = "default_max_file_size_mb")]
    pub max_file_size_mb: u64,
    /// 进度采样节流间隔（毫秒）
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
    /// 某个文件重试耗尽时是否让整个会话失败，关闭后只移除该文件并继续
    #[serde(default = "default_abort_on_exhausted_retries")]
    pub abort_on_exhausted_retries: bool,
    /// 允许上传的扩展名，为空表示不限制
    #[serde(default = "default_accepted_extensions")]
    pub accepted_extensions: Vec<String>,
}

fn default_parallel_uploads() -> usize {
    DEFAULT_PARALLEL_UPLOADS
}

fn default_max_retries() -> u32 {
    MAX_RETRIES
}

fn default_retry_base_delay_ms() -> u64 {
    RETRY_BASE_DELAY_MS
}

fn default_max_file_size_mb() -> u64 {
    DEFAULT_MAX_FILE_SIZE_MB
}

fn default_progress_interval_ms() -> u64 {
    DEFAULT_PROGRESS_INTERVAL_MS
}

fn default_abort_on_exhausted_retries() -> bool {
    true
}

/// 图片、GCP 文本、点云、视频及字幕
fn default_accepted_extensions() -> Vec<String> {
    [
        // 图片
        "jpg", "jpeg", "png", "tif", "tiff", "dng", "gif", "bmp", "webp", "heic", "heif",
        // GCP、点云
        "txt", "las", "laz",
        // 视频及字幕
        "mp4", "mov", "avi", "mkv", "m4v", "webm", "wmv", "mpg", "mpeg", "srt",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            parallel_uploads: default_parallel_uploads(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            max_file_size_mb: default_max_file_size_mb(),
            progress_interval_ms: default_progress_interval_ms(),
            abort_on_exhausted_retries: default_abort_on_exhausted_retries(),
            accepted_extensions: default_accepted_extensions(),
        }
    }
}

impl UploadConfig {
    /// 校验上传配置
    pub fn validate(&self) -> Result<(), String> {
        if self.parallel_uploads == 0 {
            return Err("parallel_uploads 必须大于 0".to_string());
        }
        if self.retry_base_delay_ms == 0 {
            return Err("retry_base_delay_ms 必须大于 0".to_string());
        }
        if self.progress_interval_ms == 0 {
            return Err("progress_interval_ms 必须大于 0".to_string());
        }
        if self.max_file_size_mb == 0 {
            return Err("max_file_size_mb 必须大于 0".to_string());
        }
        if self
            .accepted_extensions
            .iter()
            .any(|e| e.trim_start_matches('.').is_empty())
        {
            return Err("accepted_extensions 不能包含空扩展名".to_string());
        }
        Ok(())
    }
}

/// 是否运行在 Docker 容器中
fn is_docker() -> bool {
    if Path::new("/.dockerenv").exists() {
        return true;
    }
    std::fs::read_to_string("/proc/1/cgroup")
        .map(|content| content.contains("docker") || content.contains("containerd"))
        .unwrap_or(false)
}

impl Default for AppConfig {
    fn default() -> Self {
        // Docker 环境使用 0.0.0.0 以便从宿主机访问，本地环境使用 127.0.0.1
        let host = if is_docker() {
            "0.0.0.0".to_string()
        } else {
            "127.0.0.1".to_string()
        };

        Self {
            server: ServerConfig {
                host,
                port: 18080,
                cors_origins: vec!["*".to_string()],
            },
            repository: RepositoryConfig::default(),
            upload: UploadConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl AppConfig {
    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;

        config
            .upload
            .validate()
            .map_err(|e| anyhow::anyhow!("配置文件中的上传参数无效: {}", e))?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        self.upload
            .validate()
            .map_err(|e| anyhow::anyhow!("保存配置失败：{}", e))?;

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        // 确保父目录存在
        if let Some(parent) = Path::new(path).parent() {
            fs::create_dir_all(parent)
                .await
                .context("Failed to create config directory")?;
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        tracing::info!("配置已保存: {}", path);
        Ok(())
    }

    /// 加载或创建默认配置
    pub async fn load_or_default(path: &str) -> Self {
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {:#}", e);
                let default_config = Self::default();

                // 文件不存在时写出默认配置；格式错误的文件保留给用户修正
                if !Path::new(path).exists() {
                    if let Err(e) = default_config.save_to_file(path).await {
                        tracing::error!("保存默认配置失败: {}", e);
                    }
                }

                default_config
            }
        }
    }
}
