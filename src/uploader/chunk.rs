// 上传分片
//
// 一个分片对应文件中的一段字节范围，以及这段范围的请求生命周期：
// 预处理 -> 探测（可选） -> 上传 -> 成功 / 永久失败 / 临时失败重试
//
// 分片状态不直接存储，而是由请求状态 + 重试计数 + 配置通过 status() 推导，
// 避免多个布尔量组合出非法状态。

use crate::config::UploadConfig;
use serde::{Deserialize, Serialize};
use std::ops::Range;
use tokio_util::sync::CancellationToken;

/// 分片状态（推导值）
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStatus {
    /// 等待调度
    Pending,
    /// 请求进行中（包括等待重试、预处理中）
    Uploading,
    /// 上传成功
    Success,
    /// 永久失败
    Error,
}

/// 预处理状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PreprocessState {
    #[default]
    Unprocessed,
    Processing,
    Finished,
}

/// 请求类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RequestKind {
    /// 探测分片是否已存在
    Test,
    /// 上传分片数据
    Upload,
}

/// 请求状态
#[derive(Debug, Clone)]
enum RequestState {
    /// 尚未发出请求
    Idle,
    /// 请求进行中
    InFlight {
        kind: RequestKind,
        loaded: u64,
        total: u64,
    },
    /// 请求已结束（status 为 0 表示没有拿到 HTTP 响应）
    Settled {
        kind: RequestKind,
        status: u16,
        message: String,
    },
}

/// 分片快照（用于事件和查询）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkInfo {
    /// 分片序号（从 0 开始）
    pub offset: usize,
    pub start_byte: u64,
    pub end_byte: u64,
    pub status: ChunkStatus,
    pub retries: u32,
    pub tested: bool,
    pub progress: f64,
}

/// 上传分片
#[derive(Debug)]
pub struct UploadChunk {
    /// 分片序号（从 0 开始，发送给服务端时 +1）
    pub offset: usize,
    /// 字节范围
    pub range: Range<u64>,
    /// 是否已完成探测请求
    pub tested: bool,
    /// 首次发送之外的重试次数
    pub retries: u32,
    /// 已安排重试但尚未发出
    pub pending_retry: bool,
    /// 预处理状态
    pub preprocess: PreprocessState,
    request: RequestState,
    /// 当前请求/预处理/重试定时器的取消令牌
    cancel: Option<CancellationToken>,
    /// 尝试序号，过期的回调据此丢弃
    attempt: u64,
}

impl UploadChunk {
    pub fn new(offset: usize, range: Range<u64>) -> Self {
        Self {
            offset,
            range,
            tested: false,
            retries: 0,
            pending_retry: false,
            preprocess: PreprocessState::Unprocessed,
            request: RequestState::Idle,
            cancel: None,
            attempt: 0,
        }
    }

    /// 分片大小
    pub fn size(&self) -> u64 {
        self.range.end - self.range.start
    }

    /// 当前尝试序号
    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    /// 是否有请求正在进行
    pub fn is_in_flight(&self) -> bool {
        matches!(self.request, RequestState::InFlight { .. })
    }

    /// 推导分片状态
    pub fn status(&self, config: &UploadConfig) -> ChunkStatus {
        if self.pending_retry || self.preprocess == PreprocessState::Processing {
            return ChunkStatus::Uploading;
        }
        match &self.request {
            RequestState::Idle => ChunkStatus::Pending,
            RequestState::InFlight { .. } => ChunkStatus::Uploading,
            RequestState::Settled { kind, status, .. } => {
                classify_response(*status, *kind, self.retries, config)
            }
        }
    }

    /// 分片进度 [0, 1]
    pub fn progress(&self, config: &UploadConfig) -> f64 {
        if self.pending_retry {
            return 0.0;
        }
        match self.status(config) {
            ChunkStatus::Success | ChunkStatus::Error => 1.0,
            ChunkStatus::Pending => 0.0,
            ChunkStatus::Uploading => match self.request {
                RequestState::InFlight { loaded, total, .. } if total > 0 => {
                    (loaded as f64 / total as f64).min(1.0)
                }
                _ => 0.0,
            },
        }
    }

    /// 已上传字节数
    pub fn size_uploaded(&self, config: &UploadConfig) -> u64 {
        let size = self.size();
        if self.status(config) == ChunkStatus::Success {
            size
        } else {
            (self.progress(config) * size as f64) as u64
        }
    }

    /// 最近一次响应内容
    pub fn message(&self) -> &str {
        match &self.request {
            RequestState::Settled { message, .. } => message,
            _ => "",
        }
    }

    /// 最近一次响应状态码
    pub fn last_status_code(&self) -> Option<u16> {
        match &self.request {
            RequestState::Settled { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// 开始预处理，返回本次尝试序号和取消令牌
    pub(crate) fn begin_preprocess(&mut self) -> (u64, CancellationToken) {
        self.preprocess = PreprocessState::Processing;
        self.next_attempt()
    }

    /// 预处理完成；过期的回调返回 false
    pub(crate) fn finish_preprocess(&mut self, attempt: u64) -> bool {
        if attempt != self.attempt || self.preprocess != PreprocessState::Processing {
            return false;
        }
        self.preprocess = PreprocessState::Finished;
        self.cancel = None;
        true
    }

    /// 发出请求，返回本次尝试序号和取消令牌
    ///
    /// 调用前已有的请求会先被取消，保证同一分片最多一个在途请求
    pub(crate) fn begin_request(&mut self, kind: RequestKind) -> (u64, CancellationToken) {
        if let Some(token) = self.cancel.take() {
            token.cancel();
        }
        self.pending_retry = false;
        self.request = RequestState::InFlight {
            kind,
            loaded: 0,
            total: 0,
        };
        self.next_attempt()
    }

    /// 更新上传进度；过期回调返回 false
    pub(crate) fn update_progress(&mut self, attempt: u64, loaded: u64, total: u64) -> bool {
        if attempt != self.attempt {
            return false;
        }
        match &mut self.request {
            RequestState::InFlight {
                loaded: l,
                total: t,
                ..
            } => {
                *l = loaded;
                *t = total;
                true
            }
            _ => false,
        }
    }

    /// 请求结束；过期回调返回 None，否则返回请求类型
    pub(crate) fn settle(
        &mut self,
        attempt: u64,
        status: u16,
        message: String,
    ) -> Option<RequestKind> {
        if attempt != self.attempt {
            return None;
        }
        let kind = match self.request {
            RequestState::InFlight { kind, .. } => kind,
            _ => return None,
        };
        self.cancel = None;
        self.request = RequestState::Settled {
            kind,
            status,
            message,
        };
        Some(kind)
    }

    /// 安排重试：丢弃本次请求，计数 +1，返回定时器的尝试序号和取消令牌
    pub(crate) fn schedule_retry(&mut self) -> (u64, CancellationToken) {
        self.request = RequestState::Idle;
        self.retries += 1;
        self.pending_retry = true;
        self.next_attempt()
    }

    /// 重试定时器到期；过期回调返回 false
    pub(crate) fn retry_due(&self, attempt: u64) -> bool {
        attempt == self.attempt && self.pending_retry
    }

    /// 取消在途请求（幂等）
    ///
    /// 不清除 tested / retries。预处理中断后回到 Unprocessed，下次调度重新预处理。
    /// 返回是否真的取消了某个在途操作
    pub fn abort(&mut self) -> bool {
        let was_active = self.is_in_flight()
            || self.pending_retry
            || self.preprocess == PreprocessState::Processing;

        if let Some(token) = self.cancel.take() {
            token.cancel();
        }
        if self.is_in_flight() {
            self.request = RequestState::Idle;
        }
        self.pending_retry = false;
        if self.preprocess != PreprocessState::Unprocessed
            && self.request_is_unresolved()
        {
            self.preprocess = PreprocessState::Unprocessed;
        }
        if was_active {
            // 让过期回调全部失效
            self.attempt += 1;
        }
        was_active
    }

    /// 生成快照
    pub fn info(&self, config: &UploadConfig) -> ChunkInfo {
        ChunkInfo {
            offset: self.offset,
            start_byte: self.range.start,
            end_byte: self.range.end,
            status: self.status(config),
            retries: self.retries,
            tested: self.tested,
            progress: self.progress(config),
        }
    }

    fn request_is_unresolved(&self) -> bool {
        !matches!(self.request, RequestState::Settled { .. })
    }

    fn next_attempt(&mut self) -> (u64, CancellationToken) {
        self.attempt += 1;
        let token = CancellationToken::new();
        self.cancel = Some(token.clone());
        (self.attempt, token)
    }
}

/// 响应分类
///
/// - 成功状态码 -> Success
/// - 探测请求的其他任何响应 -> Pending（随后发送真实数据）
/// - 永久错误状态码，或上传请求已用完重试次数 -> Error
/// - 其余 -> Pending（临时错误，由调用方安排重试）
pub fn classify_response(
    status: u16,
    kind: RequestKind,
    retries: u32,
    config: &UploadConfig,
) -> ChunkStatus {
    if config.is_success(status) {
        ChunkStatus::Success
    } else if kind == RequestKind::Test {
        ChunkStatus::Pending
    } else if config.is_permanent_error(status)
        || (kind == RequestKind::Upload && retries >= config.max_chunk_retries)
    {
        ChunkStatus::Error
    } else {
        ChunkStatus::Pending
    }
}

/// 计算分片
///
/// 分片数 = max(1, size / chunk_size)，强制分片大小时向上取整，否则向下取整。
/// 不强制时最后一个分片吸收不足一个分片大小的尾部，避免出现很小的尾分片。
pub fn partition_chunks(size: u64, chunk_size: u64, force_chunk_size: bool) -> Vec<UploadChunk> {
    let chunk_size = chunk_size.max(1);
    let count = if force_chunk_size {
        size.div_ceil(chunk_size)
    } else {
        size / chunk_size
    }
    .max(1);

    (0..count)
        .map(|i| {
            let start = i * chunk_size;
            let end = if !force_chunk_size && i == count - 1 {
                size
            } else {
                size.min((i + 1) * chunk_size)
            };
            UploadChunk::new(i as usize, start..end)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn config_with_retries(max_chunk_retries: u32) -> UploadConfig {
        UploadConfig {
            max_chunk_retries,
            permanent_errors: vec![404, 415, 500, 501],
            ..Default::default()
        }
    }

    #[test]
    fn test_partition_exact_multiple() {
        let chunks = partition_chunks(10_000_000, 1_000_000, false);
        assert_eq!(chunks.len(), 10);
        assert!(chunks.iter().all(|c| c.size() == 1_000_000));
    }

    #[test]
    fn test_partition_last_chunk_absorbs_remainder() {
        let chunks = partition_chunks(10_500_000, 1_000_000, false);
        assert_eq!(chunks.len(), 10);
        assert_eq!(chunks[9].range, 9_000_000..10_500_000);
        assert_eq!(chunks[9].size(), 1_500_000);
    }

    #[test]
    fn test_partition_forced_size() {
        let chunks = partition_chunks(10_500_000, 1_000_000, true);
        assert_eq!(chunks.len(), 11);
        assert_eq!(chunks[10].range, 10_000_000..10_500_000);
    }

    #[test]
    fn test_partition_small_and_empty_files() {
        let chunks = partition_chunks(100, 1_000_000, false);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].range, 0..100);

        let chunks = partition_chunks(0, 1_000_000, true);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].range, 0..0);
    }

    proptest! {
        #[test]
        fn prop_partition_covers_file(size in 0u64..50_000_000, chunk_size in 1u64..5_000_000, force in any::<bool>()) {
            let chunks = partition_chunks(size, chunk_size, force);

            let expected = if force { size.div_ceil(chunk_size) } else { size / chunk_size }.max(1);
            prop_assert_eq!(chunks.len() as u64, expected);

            // 无空隙、无重叠、覆盖 [0, size)
            let mut cursor = 0;
            for (i, chunk) in chunks.iter().enumerate() {
                prop_assert_eq!(chunk.offset, i);
                prop_assert_eq!(chunk.range.start, cursor);
                prop_assert!(chunk.range.end >= chunk.range.start);
                cursor = chunk.range.end;
            }
            prop_assert_eq!(cursor, size);

            if force {
                prop_assert!(chunks.iter().all(|c| c.size() <= chunk_size));
            }
        }
    }

    #[test]
    fn test_status_lifecycle() {
        let config = config_with_retries(0);
        let mut chunk = UploadChunk::new(0, 0..100);
        assert_eq!(chunk.status(&config), ChunkStatus::Pending);
        assert_eq!(chunk.progress(&config), 0.0);

        let (attempt, _token) = chunk.begin_request(RequestKind::Upload);
        assert_eq!(chunk.status(&config), ChunkStatus::Uploading);
        assert_eq!(chunk.progress(&config), 0.0);

        assert!(chunk.update_progress(attempt, 25, 100));
        assert_eq!(chunk.progress(&config), 0.25);
        assert_eq!(chunk.size_uploaded(&config), 25);

        assert_eq!(
            chunk.settle(attempt, 200, "ok".to_string()),
            Some(RequestKind::Upload)
        );
        assert_eq!(chunk.status(&config), ChunkStatus::Success);
        assert_eq!(chunk.progress(&config), 1.0);
        assert_eq!(chunk.message(), "ok");
    }

    #[test]
    fn test_permanent_error_with_zero_retries() {
        let config = config_with_retries(0);
        for code in [404u16, 415, 500, 501, 503, 400] {
            let mut chunk = UploadChunk::new(0, 0..10);
            let (attempt, _) = chunk.begin_request(RequestKind::Upload);
            chunk.settle(attempt, code, String::new());
            assert_eq!(chunk.status(&config), ChunkStatus::Error, "code {}", code);
            assert_eq!(chunk.retries, 0);
        }
    }

    #[test]
    fn test_transient_error_until_budget_exhausted() {
        let config = config_with_retries(3);
        let mut chunk = UploadChunk::new(0, 0..10);

        for expected_retries in 0..3 {
            let (attempt, _) = chunk.begin_request(RequestKind::Upload);
            chunk.settle(attempt, 503, "busy".to_string());
            assert_eq!(chunk.status(&config), ChunkStatus::Pending);
            assert_eq!(chunk.retries, expected_retries);

            chunk.schedule_retry();
            assert_eq!(chunk.status(&config), ChunkStatus::Uploading);
            assert_eq!(chunk.progress(&config), 0.0);
        }

        let (attempt, _) = chunk.begin_request(RequestKind::Upload);
        chunk.settle(attempt, 503, "busy".to_string());
        assert_eq!(chunk.retries, 3);
        assert_eq!(chunk.status(&config), ChunkStatus::Error);
    }

    #[test]
    fn test_test_request_does_not_consume_retry_budget() {
        let config = config_with_retries(0);
        let mut chunk = UploadChunk::new(0, 0..10);
        let (attempt, _) = chunk.begin_request(RequestKind::Test);
        chunk.settle(attempt, 204, String::new());
        assert_eq!(chunk.status(&config), ChunkStatus::Pending);

        // 探测返回 404 表示分片不存在，不算永久错误
        let (attempt, _) = chunk.begin_request(RequestKind::Test);
        chunk.settle(attempt, 404, String::new());
        assert_eq!(chunk.status(&config), ChunkStatus::Pending);

        let (attempt, _) = chunk.begin_request(RequestKind::Test);
        chunk.settle(attempt, 200, String::new());
        assert_eq!(chunk.status(&config), ChunkStatus::Success);
    }

    #[test]
    fn test_stale_callbacks_are_ignored() {
        let config = UploadConfig::default();
        let mut chunk = UploadChunk::new(0, 0..10);
        let (first, first_token) = chunk.begin_request(RequestKind::Upload);
        let (second, _) = chunk.begin_request(RequestKind::Upload);

        // 重新发起请求会取消上一次请求
        assert!(first_token.is_cancelled());
        assert!(!chunk.update_progress(first, 5, 10));
        assert!(chunk.settle(first, 200, String::new()).is_none());
        assert_eq!(chunk.status(&config), ChunkStatus::Uploading);

        assert!(chunk.settle(second, 200, String::new()).is_some());
        assert_eq!(chunk.status(&config), ChunkStatus::Success);
    }

    #[test]
    fn test_abort_is_idempotent() {
        let config = UploadConfig::default();
        let mut chunk = UploadChunk::new(0, 0..10);
        chunk.tested = true;
        chunk.retries = 1;

        let (attempt, token) = chunk.begin_request(RequestKind::Upload);
        assert!(chunk.abort());
        assert!(token.is_cancelled());
        assert_eq!(chunk.status(&config), ChunkStatus::Pending);
        assert!(chunk.settle(attempt, 200, String::new()).is_none());

        assert!(!chunk.abort());
        assert_eq!(chunk.status(&config), ChunkStatus::Pending);
        assert!(chunk.tested);
        assert_eq!(chunk.retries, 1);
    }

    #[test]
    fn test_abort_clears_pending_retry() {
        let config = UploadConfig::default();
        let mut chunk = UploadChunk::new(0, 0..10);
        let (attempt, token) = chunk.schedule_retry();
        assert_eq!(chunk.status(&config), ChunkStatus::Uploading);

        assert!(chunk.abort());
        assert!(token.is_cancelled());
        assert!(!chunk.retry_due(attempt));
        assert_eq!(chunk.status(&config), ChunkStatus::Pending);
    }

    #[test]
    fn test_abort_mid_preprocess_reverts_to_unprocessed() {
        let config = UploadConfig::default();
        let mut chunk = UploadChunk::new(0, 0..10);
        let (attempt, _) = chunk.begin_preprocess();
        assert_eq!(chunk.status(&config), ChunkStatus::Uploading);

        assert!(chunk.abort());
        assert_eq!(chunk.preprocess, PreprocessState::Unprocessed);
        assert!(!chunk.finish_preprocess(attempt));
        assert_eq!(chunk.status(&config), ChunkStatus::Pending);
    }

    #[test]
    fn test_abort_keeps_finished_chunk() {
        let config = UploadConfig::default();
        let mut chunk = UploadChunk::new(0, 0..10);
        let (attempt, _) = chunk.begin_request(RequestKind::Upload);
        chunk.settle(attempt, 201, String::new());

        assert!(!chunk.abort());
        assert_eq!(chunk.status(&config), ChunkStatus::Success);
    }
}
