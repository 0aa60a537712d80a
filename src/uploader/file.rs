// 上传文件
//
// 一个文件 = 数据源 + 分片列表 + 进度/速度统计。
// 调度与网络请求由会话负责，这里只维护文件自身的状态。

use crate::config::UploadConfig;
use crate::uploader::chunk::{partition_chunks, ChunkStatus, RequestKind, UploadChunk};
use crate::uploader::source::ByteSource;
use crate::uploader::transport::RequestContext;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::time::Instant;

/// 自定义唯一标识生成器
pub type IdentifierGenerator = Arc<dyn Fn(&dyn ByteSource) -> String + Send + Sync>;

/// 会话内的文件编号（不随重试变化）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileId(pub u64);

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// 默认唯一标识：`<size>-<去掉非 [0-9a-zA-Z_-] 字符的相对路径>`
pub fn generate_unique_identifier(source: &dyn ByteSource) -> String {
    let cleaned: String = source
        .relative_path()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect();
    format!("{}-{}", source.size(), cleaned)
}

/// 文件快照（用于事件和查询）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileInfo {
    pub id: FileId,
    pub unique_identifier: String,
    pub name: String,
    pub relative_path: String,
    pub size: u64,
    pub size_uploaded: u64,
    pub progress: f64,
    pub total_chunks: usize,
    pub paused: bool,
    pub has_error: bool,
    pub is_complete: bool,
    pub is_uploading: bool,
    /// 平均速度 (bytes/s)
    pub average_speed: f64,
    /// 当前速度 (bytes/s)
    pub current_speed: f64,
    /// 预计剩余秒数，None 表示无法估计（有剩余数据但速度为 0）
    pub time_remaining: Option<u64>,
}

/// 上传文件
#[derive(Debug)]
pub struct FileUpload {
    id: FileId,
    /// 分片列表每重建一次 +1，旧分片的回调据此丢弃
    generation: u64,
    source: Arc<dyn ByteSource>,
    unique_identifier: String,
    pub(crate) chunks: Vec<UploadChunk>,
    paused: bool,
    has_error: bool,
    average_speed: f64,
    current_speed: f64,
    pub(crate) last_progress_callback: Instant,
    prev_uploaded_size: u64,
    prev_progress: f64,
}

impl FileUpload {
    pub fn new(
        id: FileId,
        source: Arc<dyn ByteSource>,
        unique_identifier: String,
        config: &UploadConfig,
    ) -> Self {
        let mut file = Self {
            id,
            generation: 0,
            source,
            unique_identifier,
            chunks: Vec::new(),
            paused: false,
            has_error: false,
            average_speed: 0.0,
            current_speed: 0.0,
            last_progress_callback: Instant::now(),
            prev_uploaded_size: 0,
            prev_progress: 0.0,
        };
        file.bootstrap(config);
        file
    }

    /// 重建分片列表并清除错误、暂停与进度记录
    pub fn bootstrap(&mut self, config: &UploadConfig) {
        self.abort_chunks();
        self.chunks = partition_chunks(self.size(), config.chunk_size, config.force_chunk_size);
        self.generation += 1;
        self.paused = false;
        self.has_error = false;
        self.prev_progress = 0.0;
        self.prev_uploaded_size = 0;
        self.reset_speed();
        self.last_progress_callback = Instant::now();
    }

    pub fn id(&self) -> FileId {
        self.id
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub fn source(&self) -> &Arc<dyn ByteSource> {
        &self.source
    }

    pub fn unique_identifier(&self) -> &str {
        &self.unique_identifier
    }

    pub fn name(&self) -> &str {
        self.source.name()
    }

    pub fn relative_path(&self) -> &str {
        self.source.relative_path()
    }

    pub fn size(&self) -> u64 {
        self.source.size()
    }

    pub fn chunks(&self) -> &[UploadChunk] {
        &self.chunks
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn has_error(&self) -> bool {
        self.has_error
    }

    pub fn average_speed(&self) -> f64 {
        self.average_speed
    }

    pub fn current_speed(&self) -> f64 {
        self.current_speed
    }

    /// 文件进度 [0, 1]，只增不减
    ///
    /// 出错的文件视为已结束，返回 1.0
    pub fn progress(&mut self, config: &UploadConfig) -> f64 {
        if self.has_error {
            return 1.0;
        }
        let current = if self.chunks.len() == 1 {
            self.chunks[0].progress(config)
        } else {
            let size = self.size();
            if size == 0 {
                0.0
            } else {
                let loaded: f64 = self
                    .chunks
                    .iter()
                    .map(|c| c.progress(config) * c.size() as f64)
                    .sum();
                let fraction = loaded / size as f64;
                // 浮点累加误差
                if fraction > 0.9999 {
                    1.0
                } else {
                    fraction
                }
            }
        };
        self.prev_progress = self.prev_progress.max(current);
        self.prev_progress
    }

    /// 已上传字节数
    pub fn size_uploaded(&self, config: &UploadConfig) -> u64 {
        if self.has_error {
            return self.size();
        }
        let uploaded: u64 = self.chunks.iter().map(|c| c.size_uploaded(config)).sum();
        uploaded.min(self.size())
    }

    /// 所有分片都已成功或失败
    pub fn is_complete(&self, config: &UploadConfig) -> bool {
        self.chunks.iter().all(|c| {
            matches!(
                c.status(config),
                ChunkStatus::Success | ChunkStatus::Error
            )
        })
    }

    /// 是否有分片在上传中
    pub fn is_uploading(&self, config: &UploadConfig) -> bool {
        self.chunks
            .iter()
            .any(|c| c.status(config) == ChunkStatus::Uploading)
    }

    /// 上传中的分片数（占用的并发槽位）
    pub fn uploading_chunks(&self, config: &UploadConfig) -> usize {
        self.chunks
            .iter()
            .filter(|c| c.status(config) == ChunkStatus::Uploading)
            .count()
    }

    /// 更新速度统计（指数平滑）
    pub fn measure_speed(&mut self, config: &UploadConfig, now: Instant) {
        let elapsed = now
            .saturating_duration_since(self.last_progress_callback)
            .as_secs_f64();
        if elapsed <= 0.0 {
            return;
        }
        let uploaded = self.size_uploaded(config);
        let delta = uploaded as f64 - self.prev_uploaded_size as f64;

        self.current_speed = (delta / elapsed).max(0.0);
        let k = config.speed_smoothing_factor;
        self.average_speed = k * self.current_speed + (1.0 - k) * self.average_speed;
        self.prev_uploaded_size = uploaded;
        self.last_progress_callback = now;
    }

    /// 预计剩余时间（秒）
    ///
    /// 暂停或出错时为 0；有剩余数据但平均速度为 0 时为无穷大
    pub fn time_remaining(&self, config: &UploadConfig) -> f64 {
        if self.paused || self.has_error {
            return 0.0;
        }
        let delta = self.size().saturating_sub(self.size_uploaded(config));
        estimate_remaining(delta, self.average_speed)
    }

    /// 暂停：中断上传中的分片，返回中断数量
    pub fn pause(&mut self) -> usize {
        self.paused = true;
        self.abort_chunks()
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    /// 中断所有分片的在途操作并清零速度，返回中断数量
    pub fn abort_chunks(&mut self) -> usize {
        let mut aborted = 0;
        for chunk in self.chunks.iter_mut() {
            if chunk.abort() {
                aborted += 1;
            }
        }
        self.reset_speed();
        aborted
    }

    /// 永久失败：中断并清空分片，文件视为已结束
    pub(crate) fn mark_error(&mut self) {
        self.abort_chunks();
        self.chunks.clear();
        self.has_error = true;
    }

    pub(crate) fn reset_speed(&mut self) {
        self.average_speed = 0.0;
        self.current_speed = 0.0;
    }

    pub(crate) fn chunk_mut(&mut self, offset: usize) -> Option<&mut UploadChunk> {
        self.chunks.get_mut(offset)
    }

    /// 构造分片请求上下文
    pub fn request_context(
        &self,
        offset: usize,
        kind: RequestKind,
        config: &UploadConfig,
    ) -> Option<RequestContext> {
        let chunk = self.chunks.get(offset)?;
        Some(RequestContext {
            kind,
            chunk_offset: chunk.offset,
            start_byte: chunk.range.start,
            end_byte: chunk.range.end,
            chunk_size: config.chunk_size,
            total_size: self.size(),
            total_chunks: self.chunks.len(),
            identifier: self.unique_identifier.clone(),
            file_name: self.name().to_string(),
            relative_path: self.relative_path().to_string(),
        })
    }

    /// 生成快照
    pub fn info(&mut self, config: &UploadConfig) -> FileInfo {
        let time_remaining = self.time_remaining(config);
        FileInfo {
            id: self.id,
            unique_identifier: self.unique_identifier.clone(),
            name: self.name().to_string(),
            relative_path: self.relative_path().to_string(),
            size: self.size(),
            size_uploaded: self.size_uploaded(config),
            progress: self.progress(config),
            total_chunks: self.chunks.len(),
            paused: self.paused,
            has_error: self.has_error,
            is_complete: self.is_complete(config),
            is_uploading: self.is_uploading(config),
            average_speed: self.average_speed,
            current_speed: self.current_speed,
            time_remaining: time_remaining
                .is_finite()
                .then_some(time_remaining as u64),
        }
    }
}

/// 根据剩余字节和平均速度估算剩余秒数
pub(crate) fn estimate_remaining(remaining_bytes: u64, average_speed: f64) -> f64 {
    if average_speed <= 0.0 {
        if remaining_bytes > 0 {
            f64::INFINITY
        } else {
            0.0
        }
    } else {
        (remaining_bytes as f64 / average_speed).floor()
    }
}
