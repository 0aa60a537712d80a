//! 会话事件类型定义
//!
//! 事件名与分片协议前端约定保持一致（fileAdded / fileProgress / complete ...），
//! 序列化后可直接推给界面层

use crate::uploader::{ChunkInfo, FileId, FileInfo};
use serde::{Deserialize, Serialize};

/// 上传会话事件
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "camelCase")]
pub enum SessionEvent {
    /// 单个文件加入（可否决）
    FileAdded { file: FileInfo },
    /// 一批文件加入（可否决，否决后整批丢弃）
    FilesAdded { files: Vec<FileInfo> },
    /// 一批文件已加入会话
    FilesSubmitted { files: Vec<FileInfo> },
    /// 文件从会话移除
    FileRemoved { file: FileInfo },
    /// 文件进度更新
    FileProgress { file: FileInfo, chunk: ChunkInfo },
    /// 文件全部分片上传成功
    FileSuccess {
        file: FileInfo,
        message: String,
        chunk: ChunkInfo,
    },
    /// 文件出现永久错误
    FileError {
        file: FileInfo,
        message: String,
        chunk: ChunkInfo,
    },
    /// 分片出现临时错误，已安排重试
    FileRetry { file: FileInfo, chunk: ChunkInfo },
    /// 开始上传
    UploadStart,
    /// 会话整体进度
    Progress { progress: f64 },
    /// 本批次全部文件已结束（成功或失败）
    Complete,
    /// 错误（与 FileError 同时触发，参数顺序面向全局监听者）
    Error {
        message: String,
        file: FileInfo,
        chunk: ChunkInfo,
    },
}

impl SessionEvent {
    /// 获取事件名称
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::FileAdded { .. } => "fileAdded",
            SessionEvent::FilesAdded { .. } => "filesAdded",
            SessionEvent::FilesSubmitted { .. } => "filesSubmitted",
            SessionEvent::FileRemoved { .. } => "fileRemoved",
            SessionEvent::FileProgress { .. } => "fileProgress",
            SessionEvent::FileSuccess { .. } => "fileSuccess",
            SessionEvent::FileError { .. } => "fileError",
            SessionEvent::FileRetry { .. } => "fileRetry",
            SessionEvent::UploadStart => "uploadStart",
            SessionEvent::Progress { .. } => "progress",
            SessionEvent::Complete => "complete",
            SessionEvent::Error { .. } => "error",
        }
    }

    /// 获取关联文件编号
    pub fn file_id(&self) -> Option<FileId> {
        match self {
            SessionEvent::FileAdded { file }
            | SessionEvent::FileRemoved { file }
            | SessionEvent::FileProgress { file, .. }
            | SessionEvent::FileSuccess { file, .. }
            | SessionEvent::FileError { file, .. }
            | SessionEvent::FileRetry { file, .. }
            | SessionEvent::Error { file, .. } => Some(file.id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization_uses_event_name() {
        let json = serde_json::to_value(&SessionEvent::Progress { progress: 0.5 }).unwrap();
        assert_eq!(json["event_type"], "progress");
        assert_eq!(json["progress"], 0.5);

        let json = serde_json::to_value(&SessionEvent::UploadStart).unwrap();
        assert_eq!(json["event_type"], SessionEvent::UploadStart.name());
    }
}
