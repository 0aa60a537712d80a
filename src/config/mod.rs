// 配置管理模块

use crate::error::UploadError;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;

/// 默认配置文件路径
pub const DEFAULT_CONFIG_PATH: &str = "config/app.toml";

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 上传配置
    #[serde(default)]
    pub upload: UploadConfig,
    /// 🔥 日志配置
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
    /// 单个日志文件最大大小（字节，默认 20MB）
    #[serde(default = "default_log_max_file_size")]
    pub max_file_size: u64,
}

fn default_log_enabled() -> bool {
    false
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

fn default_log_max_file_size() -> u64 {
    20 * 1024 * 1024 // 20MB
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
            max_file_size: default_log_max_file_size(),
        }
    }
}

/// 请求体格式
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BodyMethod {
    /// multipart/form-data，分片放在 `file_parameter_name` 字段
    #[default]
    Multipart,
    /// 原始字节流，元数据放在 query 中
    Octet,
}

/// 上传配置
///
/// 构造会话时解析一次，之后只读。
/// 未出现在配置文件中的字段使用默认值。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// 分片接收地址
    pub target: String,
    /// 分片大小（字节）
    pub chunk_size: u64,
    /// 是否严格按分片大小切分（最后一个分片可以更小）
    pub force_chunk_size: bool,
    /// 同时上传的分片数
    pub simultaneous_uploads: usize,
    /// 单文件模式：新文件替换已有文件
    pub single_file: bool,
    /// multipart 中分片字段名
    pub file_parameter_name: String,
    /// 进度回调最小间隔（毫秒）
    pub progress_callbacks_interval_ms: u64,
    /// 速度平滑系数 (0, 1]
    pub speed_smoothing_factor: f64,
    /// 附加 query 参数
    pub query: BTreeMap<String, String>,
    /// 附加请求头
    pub headers: BTreeMap<String, String>,
    /// 是否携带 Cookie
    pub with_credentials: bool,
    /// 请求体格式
    pub method: BodyMethod,
    /// 分片探测请求方法
    pub test_method: String,
    /// 分片上传请求方法
    pub upload_method: String,
    /// 优先上传首尾分片（方便服务端尽早读取文件头尾元数据）
    pub prioritize_first_and_last_chunk: bool,
    /// 上传前先探测分片是否已存在
    pub test_chunks: bool,
    /// 单个分片最大重试次数
    pub max_chunk_retries: u32,
    /// 重试间隔（毫秒），None 表示立即重试
    pub chunk_retry_interval_ms: Option<u64>,
    /// 不可重试的状态码
    pub permanent_errors: Vec<u16>,
    /// 视为成功的状态码
    pub success_statuses: Vec<u16>,
    /// 允许重复添加同一文件
    pub allow_duplicate_uploads: bool,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            target: "/".to_string(),
            chunk_size: 1024 * 1024,
            force_chunk_size: false,
            simultaneous_uploads: 3,
            single_file: false,
            file_parameter_name: "file".to_string(),
            progress_callbacks_interval_ms: 500,
            speed_smoothing_factor: 0.1,
            query: BTreeMap::new(),
            headers: BTreeMap::new(),
            with_credentials: false,
            method: BodyMethod::Multipart,
            test_method: "GET".to_string(),
            upload_method: "POST".to_string(),
            prioritize_first_and_last_chunk: false,
            test_chunks: true,
            max_chunk_retries: 0,
            chunk_retry_interval_ms: None,
            permanent_errors: vec![404, 415, 500, 501],
            success_statuses: vec![200, 201, 202],
            allow_duplicate_uploads: false,
        }
    }
}

impl UploadConfig {
    /// 校验配置
    pub fn validate(&self) -> Result<(), UploadError> {
        if self.chunk_size == 0 {
            return Err(UploadError::Config("chunk_size 必须大于 0".to_string()));
        }
        if self.simultaneous_uploads == 0 {
            return Err(UploadError::Config(
                "simultaneous_uploads 必须大于 0".to_string(),
            ));
        }
        if !(self.speed_smoothing_factor > 0.0 && self.speed_smoothing_factor <= 1.0) {
            return Err(UploadError::Config(format!(
                "speed_smoothing_factor 必须在 (0, 1] 范围内: {}",
                self.speed_smoothing_factor
            )));
        }
        if self.file_parameter_name.is_empty() {
            return Err(UploadError::Config(
                "file_parameter_name 不能为空".to_string(),
            ));
        }
        Ok(())
    }

    /// 重试间隔
    pub fn retry_interval(&self) -> Option<Duration> {
        self.chunk_retry_interval_ms.map(Duration::from_millis)
    }

    /// 进度回调间隔
    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_callbacks_interval_ms)
    }

    pub fn is_success(&self, status: u16) -> bool {
        self.success_statuses.contains(&status)
    }

    pub fn is_permanent_error(&self, status: u16) -> bool {
        self.permanent_errors.contains(&status)
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
            .context("配置文件中的上传配置验证失败")?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        self.upload
            .validate()
            .context("保存配置失败：上传配置不合法")?;

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        // 确保父目录存在
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .context("Failed to create config directory")?;
            }
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        tracing::info!("✓ 配置已保存: {}", path);

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

                // 仅在文件不存在时写出默认配置，避免覆盖用户写错的配置
                if !std::path::Path::new(path).exists() {
                    if let Err(e) = default_config.save_to_file(path).await {
                        tracing::error!("保存默认配置失败: {}", e);
                    }
                }

                default_config
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_upload_config() {
        let config = UploadConfig::default();
        assert_eq!(config.chunk_size, 1024 * 1024);
        assert_eq!(config.simultaneous_uploads, 3);
        assert_eq!(config.method, BodyMethod::Multipart);
        assert!(config.test_chunks);
        assert_eq!(config.max_chunk_retries, 0);
        assert!(config.retry_interval().is_none());
        assert!(config.is_permanent_error(404));
        assert!(!config.is_permanent_error(503));
        assert!(config.is_success(201));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_merges_over_defaults() {
        let content = r#"
            [upload]
            target = "http://localhost:8080/upload"
            chunk_size = 2048
            chunk_retry_interval_ms = 100
            method = "octet"
        "#;
        let config: AppConfig = toml::from_str(content).unwrap();
        assert_eq!(config.upload.target, "http://localhost:8080/upload");
        assert_eq!(config.upload.chunk_size, 2048);
        assert_eq!(config.upload.method, BodyMethod::Octet);
        assert_eq!(
            config.upload.retry_interval(),
            Some(Duration::from_millis(100))
        );
        // 未配置字段保持默认值
        assert_eq!(config.upload.simultaneous_uploads, 3);
        assert_eq!(config.upload.file_parameter_name, "file");
        assert!(!config.log.enabled);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = UploadConfig {
            chunk_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        config.chunk_size = 1024;
        config.simultaneous_uploads = 0;
        assert!(config.validate().is_err());

        config.simultaneous_uploads = 1;
        config.speed_smoothing_factor = 0.0;
        assert!(config.validate().is_err());

        config.speed_smoothing_factor = 1.0;
        assert!(config.validate().is_ok());
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config/app.toml");
        let path = path.to_str().unwrap();

        let mut config = AppConfig::default();
        config.upload.chunk_size = 4096;
        config.upload.permanent_errors = vec![404];
        config.save_to_file(path).await.unwrap();

        let loaded = AppConfig::load_from_file(path).await.unwrap();
        assert_eq!(loaded.upload.chunk_size, 4096);
        assert_eq!(loaded.upload.permanent_errors, vec![404]);
    }

    #[tokio::test]
    async fn test_load_or_default_writes_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("app.toml");
        let path_str = path.to_str().unwrap();

        let config = AppConfig::load_or_default(path_str).await;
        assert_eq!(config.upload.chunk_size, 1024 * 1024);
        assert!(path.exists());
    }
}
