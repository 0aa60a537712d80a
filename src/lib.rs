// Flow Upload Rust Library
// 可断点续传的分片上传客户端核心库

// 配置管理模块
pub mod config;

// 错误类型
pub mod error;

// 会话事件模块
pub mod events;

// 日志模块
pub mod logging;

// 分片上传模块
pub mod uploader;

// 导出常用类型
pub use config::{AppConfig, BodyMethod, LogConfig, UploadConfig};
pub use error::{Result, UploadError};
pub use events::{EventBus, EventFlow, ListenerId, SessionEvent, CATCH_ALL};
pub use uploader::{
    format_bytes, ByteSource, ChunkInfo, ChunkPreprocessor, ChunkStatus, ChunkTransport, FileId,
    FileInfo, FolderScanner, LocalFileSource, MemorySource, ReqwestTransport, RequestContext,
    ScanOptions, UploadSession, UploadSessionBuilder,
};
