// 上传错误类型

use thiserror::Error;

/// 上传库错误
#[derive(Debug, Error)]
pub enum UploadError {
    /// 读取分片数据失败
    #[error("读取分片数据失败: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP 请求失败（未拿到响应状态码）
    #[error("HTTP 请求失败: {0}")]
    Http(#[from] reqwest::Error),

    /// 配置不合法
    #[error("配置错误: {0}")]
    Config(String),

    /// 分片范围越界
    #[error("分片范围越界: {start}..{end} (文件大小 {size})")]
    InvalidRange { start: u64, end: u64, size: u64 },

    /// 请求已被取消
    #[error("请求已取消")]
    Aborted,
}

pub type Result<T> = std::result::Result<T, UploadError>;
