// 上传会话
//
// 会话持有文件列表、配置、事件总线和传输层，是整个上传流程的入口。
//
// 并发模型：
// - 所有状态放在一把锁里，调度决策都在持锁期间同步完成（一"轮"）
// - 预处理、探测/上传请求、重试定时器作为 tokio 任务运行，结束后重新进入锁
// - 一轮中产生的事件先排队，释放锁后按产生顺序分发，监听者可以回调会话
// - 每个异步任务都带有 (文件编号, 分片列表代数, 分片序号, 尝试序号)，过期回调直接丢弃

use crate::config::UploadConfig;
use crate::error::Result;
use crate::events::{EventBus, EventFlow, ListenerId, SessionEvent};
use crate::uploader::chunk::{ChunkStatus, PreprocessState, RequestKind};
use crate::uploader::file::{
    estimate_remaining, generate_unique_identifier, FileId, FileInfo, FileUpload,
    IdentifierGenerator,
};
use crate::uploader::scheduler::{schedule_next, uploading_count, ScheduleOutcome};
use crate::uploader::source::ByteSource;
use crate::uploader::transport::{
    ChunkRequest, ChunkResponse, ChunkTransport, ParamSource, ProgressFn, ReqwestTransport,
    RequestContext,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 分片预处理钩子
///
/// 在分片第一次发送前调用（例如计算校验和、加密），返回后分片才会真正发送。
/// 暂停或取消会中断预处理，恢复后重新调用
#[async_trait]
pub trait ChunkPreprocessor: Send + Sync {
    async fn preprocess(&self, ctx: &RequestContext);
}

/// 无法放进配置文件的扩展点
#[derive(Default)]
struct SessionHooks {
    preprocessor: Option<Arc<dyn ChunkPreprocessor>>,
    identifier: Option<IdentifierGenerator>,
    query: ParamSource,
    headers: ParamSource,
}

/// 异步任务回调时用来定位分片
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ChunkRef {
    file: FileId,
    generation: u64,
    offset: usize,
    attempt: u64,
}

#[derive(Default)]
struct SessionState {
    files: Vec<FileUpload>,
    next_file_id: u64,
    /// 本批次是否已触发 complete
    completion_fired: bool,
}

impl SessionState {
    fn index_of(&self, id: FileId) -> Option<usize> {
        self.files.iter().position(|f| f.id() == id)
    }

    fn locate(&self, chunk: &ChunkRef) -> Option<usize> {
        self.files
            .iter()
            .position(|f| f.id() == chunk.file && f.generation() == chunk.generation)
    }
}

struct SessionInner {
    config: Arc<UploadConfig>,
    bus: EventBus,
    transport: Arc<dyn ChunkTransport>,
    hooks: SessionHooks,
    state: Mutex<SessionState>,
}

/// 上传会话构建器
pub struct UploadSessionBuilder {
    config: UploadConfig,
    transport: Option<Arc<dyn ChunkTransport>>,
    hooks: SessionHooks,
}

impl UploadSessionBuilder {
    pub fn new(config: UploadConfig) -> Self {
        Self {
            config,
            transport: None,
            hooks: SessionHooks::default(),
        }
    }

    /// 替换传输层（默认使用 reqwest）
    pub fn transport(mut self, transport: Arc<dyn ChunkTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn preprocessor(mut self, preprocessor: Arc<dyn ChunkPreprocessor>) -> Self {
        self.hooks.preprocessor = Some(preprocessor);
        self
    }

    /// 自定义唯一标识生成
    pub fn identifier_generator<F>(mut self, generator: F) -> Self
    where
        F: Fn(&dyn ByteSource) -> String + Send + Sync + 'static,
    {
        self.hooks.identifier = Some(Arc::new(generator));
        self
    }

    /// 按请求计算额外 query 参数（与配置中的静态参数合并）
    pub fn query_provider<F>(mut self, provider: F) -> Self
    where
        F: Fn(&RequestContext) -> BTreeMap<String, String> + Send + Sync + 'static,
    {
        self.hooks.query = ParamSource::Dynamic(Arc::new(provider));
        self
    }

    /// 按请求计算额外请求头（与配置中的静态请求头合并）
    pub fn header_provider<F>(mut self, provider: F) -> Self
    where
        F: Fn(&RequestContext) -> BTreeMap<String, String> + Send + Sync + 'static,
    {
        self.hooks.headers = ParamSource::Dynamic(Arc::new(provider));
        self
    }

    /// 校验配置并创建会话，此后配置不可变
    pub fn build(self) -> Result<UploadSession> {
        self.config.validate()?;
        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::new(self.config.with_credentials)?),
        };

        info!(
            "创建上传会话: target={}, chunk_size={}, simultaneous_uploads={}",
            self.config.target, self.config.chunk_size, self.config.simultaneous_uploads
        );

        Ok(UploadSession {
            inner: Arc::new(SessionInner {
                config: Arc::new(self.config),
                bus: EventBus::new(),
                transport,
                hooks: self.hooks,
                state: Mutex::new(SessionState::default()),
            }),
        })
    }
}

/// 上传会话
///
/// 克隆开销很小，所有克隆共享同一份状态
#[derive(Clone)]
pub struct UploadSession {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for UploadSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadSession")
            .field("target", &self.inner.config.target)
            .field("files", &self.inner.state.lock().files.len())
            .finish()
    }
}

impl UploadSession {
    /// 使用默认传输层创建会话
    pub fn new(config: UploadConfig) -> Result<Self> {
        UploadSessionBuilder::new(config).build()
    }

    pub fn builder(config: UploadConfig) -> UploadSessionBuilder {
        UploadSessionBuilder::new(config)
    }

    pub fn config(&self) -> &UploadConfig {
        &self.inner.config
    }

    // ========== 事件 ==========

    /// 注册监听者；事件名大小写不敏感，`*` / `catchAll` 接收所有事件
    pub fn on<F>(&self, name: &str, callback: F) -> ListenerId
    where
        F: Fn(&SessionEvent) -> EventFlow + Send + Sync + 'static,
    {
        self.inner.bus.on(name, callback)
    }

    pub fn off(&self, name: &str, id: ListenerId) -> bool {
        self.inner.bus.off(name, id)
    }

    pub fn off_all(&self, name: Option<&str>) {
        self.inner.bus.off_all(name)
    }

    fn emit(&self, events: Vec<SessionEvent>) {
        for event in &events {
            self.inner.bus.fire(event);
        }
    }

    // ========== 添加文件 ==========

    /// 添加单个数据源，被跳过或否决时返回 None
    pub fn add_byte_source(&self, source: Arc<dyn ByteSource>) -> Option<FileInfo> {
        self.add_byte_sources(vec![source]).into_iter().next()
    }

    /// 添加一批数据源，返回实际加入会话的文件
    ///
    /// - 目录占位项、重复文件（按唯一标识）被静默跳过
    /// - 每个文件触发可否决的 fileAdded，整批触发可否决的 filesAdded
    /// - 单文件模式下新文件替换已有文件
    pub fn add_byte_sources<I>(&self, sources: I) -> Vec<FileInfo>
    where
        I: IntoIterator<Item = Arc<dyn ByteSource>>,
    {
        let config = self.inner.config.as_ref();

        let mut candidates: Vec<FileUpload> = Vec::new();
        {
            let mut state = self.inner.state.lock();
            for source in sources {
                if source.is_directory_placeholder() {
                    debug!("跳过目录占位项: {}", source.relative_path());
                    continue;
                }
                let uid = match &self.inner.hooks.identifier {
                    Some(generator) => generator(source.as_ref()),
                    None => generate_unique_identifier(source.as_ref()),
                };
                if !config.allow_duplicate_uploads {
                    let known = state.files.iter().any(|f| f.unique_identifier() == uid)
                        || candidates.iter().any(|f| f.unique_identifier() == uid);
                    if known {
                        debug!("跳过重复文件: {}", uid);
                        continue;
                    }
                }
                state.next_file_id += 1;
                let id = FileId(state.next_file_id);
                candidates.push(FileUpload::new(id, source, uid, config));
            }
        }

        let mut accepted = Vec::with_capacity(candidates.len());
        for mut file in candidates {
            let event = SessionEvent::FileAdded {
                file: file.info(config),
            };
            if self.inner.bus.fire(&event) {
                accepted.push(file);
            } else {
                debug!("文件被监听者否决: {}", file.relative_path());
            }
        }

        let batch: Vec<FileInfo> = accepted.iter_mut().map(|f| f.info(config)).collect();
        if !self.inner.bus.fire(&SessionEvent::FilesAdded { files: batch }) {
            debug!("整批文件被监听者否决: {} 个", accepted.len());
            return Vec::new();
        }

        let mut events = Vec::new();
        let submitted: Vec<FileInfo> = {
            let mut state = self.inner.state.lock();
            if !config.allow_duplicate_uploads {
                // 否决回调期间可能有其他调用加入了相同文件
                accepted.retain(|f| {
                    !state
                        .files
                        .iter()
                        .any(|e| e.unique_identifier() == f.unique_identifier())
                });
            }
            if config.single_file && !accepted.is_empty() {
                let keep = accepted.split_off(accepted.len() - 1);
                accepted = keep;
                for mut old in state.files.drain(..) {
                    old.abort_chunks();
                    events.push(SessionEvent::FileRemoved {
                        file: old.info(config),
                    });
                }
            }
            let infos: Vec<FileInfo> = accepted.iter_mut().map(|f| f.info(config)).collect();
            state.files.extend(accepted);
            infos
        };

        if !submitted.is_empty() {
            info!("加入 {} 个文件", submitted.len());
        }
        events.push(SessionEvent::FilesSubmitted {
            files: submitted.clone(),
        });
        self.emit(events);
        submitted
    }

    // ========== 上传控制 ==========

    /// 开始上传：填满空闲的并发槽位
    ///
    /// 槽位已满时什么都不做；没有派发任何分片时异步触发 complete
    pub fn start(&self) {
        let config = self.inner.config.as_ref();
        {
            let state = self.inner.state.lock();
            if uploading_count(&state.files, config) >= config.simultaneous_uploads {
                return;
            }
        }

        self.inner.bus.fire(&SessionEvent::UploadStart);

        let mut events = Vec::new();
        let fire_complete = {
            let mut state = self.inner.state.lock();
            state.completion_fired = false;
            let started = self.fill_slots(&mut state, &mut events, false);
            // 仍有在途分片时由最后一个分片结算触发 complete
            let resolved = state.files.iter().all(|f| f.is_complete(config));
            if !started && resolved && !state.completion_fired {
                state.completion_fired = true;
                true
            } else {
                false
            }
        };
        self.emit(events);

        if fire_complete {
            let session = self.clone();
            tokio::spawn(async move {
                info!("没有待上传的分片");
                session.inner.bus.fire(&SessionEvent::Complete);
            });
        }
    }

    /// 暂停所有文件
    pub fn pause(&self) {
        let mut events = Vec::new();
        {
            let mut state = self.inner.state.lock();
            let aborted: usize = state.files.iter_mut().map(|f| f.pause()).sum();
            info!("暂停全部文件，中断 {} 个分片", aborted);
            if aborted > 0 {
                self.fill_slots(&mut state, &mut events, true);
            }
        }
        self.emit(events);
    }

    /// 恢复所有文件并继续上传
    pub fn resume(&self) {
        {
            let mut state = self.inner.state.lock();
            for file in state.files.iter_mut() {
                file.resume();
            }
        }
        info!("恢复全部文件");
        self.start();
    }

    /// 取消所有文件（从会话中移除）
    pub fn cancel(&self) {
        let config = self.inner.config.as_ref();
        let events: Vec<SessionEvent> = {
            let mut state = self.inner.state.lock();
            state
                .files
                .drain(..)
                .map(|mut file| {
                    file.abort_chunks();
                    SessionEvent::FileRemoved {
                        file: file.info(config),
                    }
                })
                .collect()
        };
        info!("取消全部文件: {} 个", events.len());
        self.emit(events);
    }

    /// 重试所有出错的文件
    pub fn retry(&self) {
        let config = self.inner.config.as_ref();
        {
            let mut state = self.inner.state.lock();
            for file in state.files.iter_mut().filter(|f| f.has_error()) {
                info!("重试文件: {}", file.relative_path());
                file.bootstrap(config);
            }
        }
        self.start();
    }

    /// 暂停单个文件
    pub fn pause_file(&self, id: FileId) -> bool {
        let mut events = Vec::new();
        {
            let mut state = self.inner.state.lock();
            let Some(index) = state.index_of(id) else {
                return false;
            };
            let aborted = state.files[index].pause();
            debug!("暂停文件 {}，中断 {} 个分片", id, aborted);
            if aborted > 0 {
                self.fill_slots(&mut state, &mut events, true);
            }
        }
        self.emit(events);
        true
    }

    /// 恢复单个文件
    pub fn resume_file(&self, id: FileId) -> bool {
        {
            let mut state = self.inner.state.lock();
            let Some(index) = state.index_of(id) else {
                return false;
            };
            state.files[index].resume();
        }
        self.start();
        true
    }

    /// 重新分片并重新上传单个文件
    pub fn retry_file(&self, id: FileId) -> bool {
        {
            let mut state = self.inner.state.lock();
            let Some(index) = state.index_of(id) else {
                return false;
            };
            state.files[index].bootstrap(&self.inner.config);
        }
        self.start();
        true
    }

    /// 移除单个文件（中断其在途请求）
    pub fn remove_file(&self, id: FileId) -> Option<FileInfo> {
        let config = self.inner.config.as_ref();
        let mut events = Vec::new();
        let info = {
            let mut state = self.inner.state.lock();
            let index = state.index_of(id)?;
            let mut file = state.files.remove(index);
            let aborted = file.abort_chunks();
            let info = file.info(config);
            events.push(SessionEvent::FileRemoved { file: info.clone() });
            if aborted > 0 {
                self.fill_slots(&mut state, &mut events, true);
            }
            info
        };
        debug!("移除文件: {}", info.relative_path);
        self.emit(events);
        Some(info)
    }

    /// 取消单个文件，等同于移除
    pub fn cancel_file(&self, id: FileId) -> Option<FileInfo> {
        self.remove_file(id)
    }

    // ========== 查询 ==========

    /// 会话整体进度（按文件大小加权）
    pub fn progress(&self) -> f64 {
        let mut state = self.inner.state.lock();
        total_progress(&mut state.files, &self.inner.config)
    }

    pub fn is_uploading(&self) -> bool {
        let state = self.inner.state.lock();
        state
            .files
            .iter()
            .any(|f| f.is_uploading(&self.inner.config))
    }

    /// 当前占用并发槽位的分片数
    pub fn uploading_count(&self) -> usize {
        let state = self.inner.state.lock();
        uploading_count(&state.files, &self.inner.config)
    }

    /// 所有文件总大小
    pub fn size(&self) -> u64 {
        let state = self.inner.state.lock();
        state.files.iter().map(|f| f.size()).sum()
    }

    pub fn size_uploaded(&self) -> u64 {
        let state = self.inner.state.lock();
        state
            .files
            .iter()
            .map(|f| f.size_uploaded(&self.inner.config))
            .sum()
    }

    /// 预计剩余秒数（暂停和出错的文件不计入）
    pub fn time_remaining(&self) -> f64 {
        let config = self.inner.config.as_ref();
        let state = self.inner.state.lock();
        let mut remaining = 0u64;
        let mut speed = 0.0;
        for file in state
            .files
            .iter()
            .filter(|f| !f.is_paused() && !f.has_error())
        {
            remaining += file.size().saturating_sub(file.size_uploaded(config));
            speed += file.average_speed();
        }
        estimate_remaining(remaining, speed)
    }

    pub fn files(&self) -> Vec<FileInfo> {
        let mut state = self.inner.state.lock();
        state
            .files
            .iter_mut()
            .map(|f| f.info(&self.inner.config))
            .collect()
    }

    pub fn file(&self, id: FileId) -> Option<FileInfo> {
        let mut state = self.inner.state.lock();
        let index = state.index_of(id)?;
        Some(state.files[index].info(&self.inner.config))
    }

    /// 按唯一标识查找（允许重复上传时返回第一个）
    pub fn file_by_identifier(&self, unique_identifier: &str) -> Option<FileInfo> {
        let mut state = self.inner.state.lock();
        state
            .files
            .iter_mut()
            .find(|f| f.unique_identifier() == unique_identifier)
            .map(|f| f.info(&self.inner.config))
    }

    // ========== 调度 ==========

    /// 填满空闲槽位，返回是否派发了分片
    ///
    /// `announce_completion` 为 true 时，所有文件都已结束会触发一次 complete
    fn fill_slots(
        &self,
        state: &mut SessionState,
        events: &mut Vec<SessionEvent>,
        announce_completion: bool,
    ) -> bool {
        let config = self.inner.config.as_ref();
        let mut dispatched = false;

        while uploading_count(&state.files, config) < config.simultaneous_uploads {
            match schedule_next(&state.files, config) {
                ScheduleOutcome::Dispatch {
                    file_index,
                    chunk_offset,
                } => {
                    self.dispatch_chunk(state, file_index, chunk_offset);
                    dispatched = true;
                }
                ScheduleOutcome::Idle => break,
                ScheduleOutcome::Finished => {
                    if announce_completion && !state.completion_fired {
                        state.completion_fired = true;
                        info!("全部文件上传结束");
                        events.push(SessionEvent::Complete);
                    }
                    break;
                }
            }
        }
        dispatched
    }

    /// 派发分片：预处理 -> 探测 -> 上传，取第一个尚未完成的阶段
    fn dispatch_chunk(&self, state: &mut SessionState, file_index: usize, offset: usize) {
        let config = self.inner.config.as_ref();
        let has_preprocessor = self.inner.hooks.preprocessor.is_some();

        let file = &mut state.files[file_index];
        let (id, generation) = (file.id(), file.generation());
        let source = file.source().clone();

        let Some(chunk) = file.chunk_mut(offset) else {
            return;
        };
        chunk.pending_retry = false;

        let stage = if has_preprocessor && chunk.preprocess != PreprocessState::Finished {
            None
        } else if config.test_chunks && !chunk.tested {
            Some(RequestKind::Test)
        } else {
            Some(RequestKind::Upload)
        };
        let (attempt, token) = match stage {
            None => chunk.begin_preprocess(),
            Some(kind) => chunk.begin_request(kind),
        };

        let chunk_ref = ChunkRef {
            file: id,
            generation,
            offset,
            attempt,
        };
        let Some(ctx) = file.request_context(offset, stage.unwrap_or(RequestKind::Upload), config)
        else {
            return;
        };

        match stage {
            None => {
                debug!("预处理分片: {} chunk#{}", ctx.identifier, offset + 1);
                self.spawn_preprocess(chunk_ref, ctx, token);
            }
            Some(kind) => {
                debug!(
                    "发送分片请求: {:?} {} chunk#{}/{}",
                    kind,
                    ctx.identifier,
                    offset + 1,
                    ctx.total_chunks
                );
                self.spawn_request(chunk_ref, ctx, source, token);
            }
        }
    }

    fn spawn_preprocess(&self, chunk_ref: ChunkRef, ctx: RequestContext, token: CancellationToken) {
        let Some(preprocessor) = self.inner.hooks.preprocessor.clone() else {
            return;
        };
        let session = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => {}
                _ = preprocessor.preprocess(&ctx) => session.on_preprocessed(chunk_ref),
            }
        });
    }

    fn spawn_request(
        &self,
        chunk_ref: ChunkRef,
        ctx: RequestContext,
        source: Arc<dyn ByteSource>,
        token: CancellationToken,
    ) {
        let session = self.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                biased;
                _ = token.cancelled() => return,
                result = session.perform_request(chunk_ref, ctx, source) => result,
            };
            let (status, message) = match result {
                Ok(response) => (response.status, response.body),
                Err(e) => {
                    // 没有拿到 HTTP 响应，按临时错误处理
                    warn!("分片请求失败: {}", e);
                    (0, e.to_string())
                }
            };
            session.on_settled(chunk_ref, status, message);
        });
    }

    async fn perform_request(
        &self,
        chunk_ref: ChunkRef,
        ctx: RequestContext,
        source: Arc<dyn ByteSource>,
    ) -> Result<ChunkResponse> {
        let data = match ctx.kind {
            RequestKind::Upload => Some(source.slice(ctx.start_byte, ctx.end_byte).await?),
            RequestKind::Test => None,
        };
        let request = ChunkRequest::build(
            &ctx,
            &self.inner.config,
            &self.inner.hooks.query,
            &self.inner.hooks.headers,
            data,
        );

        let session = self.clone();
        let on_progress: ProgressFn =
            Arc::new(move |loaded, total| session.on_progress(chunk_ref, loaded, total));
        self.inner.transport.send(request, on_progress).await
    }

    // ========== 异步回调 ==========

    fn on_preprocessed(&self, chunk_ref: ChunkRef) {
        let mut state = self.inner.state.lock();
        let Some(index) = state.locate(&chunk_ref) else {
            return;
        };
        let file = &mut state.files[index];
        if file.is_paused() {
            return;
        }
        let finished = file
            .chunk_mut(chunk_ref.offset)
            .is_some_and(|c| c.finish_preprocess(chunk_ref.attempt));
        if finished {
            self.dispatch_chunk(&mut state, index, chunk_ref.offset);
        }
    }

    fn on_progress(&self, chunk_ref: ChunkRef, loaded: u64, total: u64) {
        let config = self.inner.config.as_ref();
        let mut events = Vec::new();
        {
            let mut state = self.inner.state.lock();
            let Some(index) = state.locate(&chunk_ref) else {
                return;
            };
            let file = &mut state.files[index];
            let Some(chunk) = file.chunk_mut(chunk_ref.offset) else {
                return;
            };
            if !chunk.update_progress(chunk_ref.attempt, loaded, total) {
                return;
            }
            let chunk_info = chunk.info(config);

            let now = Instant::now();
            if now.saturating_duration_since(file.last_progress_callback)
                < config.progress_interval()
            {
                return;
            }
            file.measure_speed(config, now);
            file.last_progress_callback = now;
            events.push(SessionEvent::FileProgress {
                file: file.info(config),
                chunk: chunk_info,
            });
            events.push(SessionEvent::Progress {
                progress: total_progress(&mut state.files, config),
            });
        }
        self.emit(events);
    }

    fn on_settled(&self, chunk_ref: ChunkRef, status: u16, message: String) {
        let config = self.inner.config.as_ref();
        let mut events = Vec::new();
        {
            let mut state = self.inner.state.lock();
            let Some(index) = state.locate(&chunk_ref) else {
                return;
            };
            let file = &mut state.files[index];
            let paused = file.is_paused();
            let Some(chunk) = file.chunk_mut(chunk_ref.offset) else {
                return;
            };
            let Some(kind) = chunk.settle(chunk_ref.attempt, status, message) else {
                return;
            };
            let chunk_status = chunk.status(config);
            if kind == RequestKind::Test {
                chunk.tested = true;
            }
            debug!(
                "分片请求结束: {:?} chunk#{} status={} -> {:?}",
                kind,
                chunk_ref.offset + 1,
                status,
                chunk_status
            );

            match (kind, chunk_status) {
                (_, ChunkStatus::Success) => {
                    self.chunk_succeeded(&mut state, index, chunk_ref.offset, &mut events)
                }
                (RequestKind::Test, _) => {
                    // 分片不存在，发送真实数据
                    if !paused {
                        self.dispatch_chunk(&mut state, index, chunk_ref.offset);
                    }
                }
                (RequestKind::Upload, ChunkStatus::Error) => {
                    self.chunk_failed(&mut state, index, chunk_ref.offset, &mut events)
                }
                (RequestKind::Upload, _) => {
                    self.chunk_retry(&mut state, index, chunk_ref, &mut events)
                }
            }
        }
        self.emit(events);
    }

    fn on_retry_due(&self, chunk_ref: ChunkRef) {
        let mut state = self.inner.state.lock();
        let Some(index) = state.locate(&chunk_ref) else {
            return;
        };
        let file = &state.files[index];
        let due = !file.is_paused()
            && file
                .chunks()
                .get(chunk_ref.offset)
                .is_some_and(|c| c.retry_due(chunk_ref.attempt));
        if due {
            self.dispatch_chunk(&mut state, index, chunk_ref.offset);
        }
    }

    fn chunk_succeeded(
        &self,
        state: &mut SessionState,
        index: usize,
        offset: usize,
        events: &mut Vec<SessionEvent>,
    ) {
        let config = self.inner.config.as_ref();
        let now = Instant::now();
        let file = &mut state.files[index];
        let Some(chunk) = file.chunks().get(offset) else {
            return;
        };
        let chunk_info = chunk.info(config);
        let message = chunk.message().to_string();

        file.measure_speed(config, now);
        file.last_progress_callback = now;
        events.push(SessionEvent::FileProgress {
            file: file.info(config),
            chunk: chunk_info.clone(),
        });
        events.push(SessionEvent::Progress {
            progress: total_progress(&mut state.files, config),
        });

        let file = &mut state.files[index];
        if file.is_complete(config) {
            file.reset_speed();
            info!(
                "文件上传成功: {} ({} bytes, {} 个分片)",
                file.relative_path(),
                file.size(),
                file.chunks().len()
            );
            events.push(SessionEvent::FileSuccess {
                file: file.info(config),
                message,
                chunk: chunk_info,
            });
        }

        self.fill_slots(state, events, true);
    }

    fn chunk_failed(
        &self,
        state: &mut SessionState,
        index: usize,
        offset: usize,
        events: &mut Vec<SessionEvent>,
    ) {
        let config = self.inner.config.as_ref();
        let file = &mut state.files[index];
        let Some(chunk) = file.chunks().get(offset) else {
            return;
        };
        let chunk_info = chunk.info(config);
        let message = chunk.message().to_string();
        let status = chunk.last_status_code().unwrap_or_default();

        file.mark_error();
        error!(
            "文件上传失败: {} chunk#{} status={} retries={}",
            file.relative_path(),
            offset + 1,
            status,
            chunk_info.retries
        );

        let info = file.info(config);
        events.push(SessionEvent::FileError {
            file: info.clone(),
            message: message.clone(),
            chunk: chunk_info.clone(),
        });
        events.push(SessionEvent::Error {
            message,
            file: info,
            chunk: chunk_info,
        });

        self.fill_slots(state, events, true);
    }

    fn chunk_retry(
        &self,
        state: &mut SessionState,
        index: usize,
        chunk_ref: ChunkRef,
        events: &mut Vec<SessionEvent>,
    ) {
        let config = self.inner.config.as_ref();
        let retry_after = config.retry_interval();
        let file = &mut state.files[index];
        let Some(chunk) = file.chunk_mut(chunk_ref.offset) else {
            return;
        };

        let status = chunk.last_status_code().unwrap_or_default();
        let (attempt, token) = chunk.schedule_retry();
        let chunk_info = chunk.info(config);
        warn!(
            "分片上传失败，安排第 {} 次重试: {} chunk#{} status={}",
            chunk_info.retries,
            file.relative_path(),
            chunk_ref.offset + 1,
            status
        );
        events.push(SessionEvent::FileRetry {
            file: file.info(config),
            chunk: chunk_info,
        });

        let retry_ref = ChunkRef {
            attempt,
            ..chunk_ref
        };
        match retry_after {
            Some(delay) => {
                let session = self.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => {}
                        _ = tokio::time::sleep(delay) => session.on_retry_due(retry_ref),
                    }
                });
            }
            None => self.dispatch_chunk(state, index, chunk_ref.offset),
        }
    }
}

/// 按文件大小加权的整体进度
fn total_progress(files: &mut [FileUpload], config: &UploadConfig) -> f64 {
    let total: u64 = files.iter().map(|f| f.size()).sum();
    if total == 0 {
        return 0.0;
    }
    let loaded: f64 = files
        .iter_mut()
        .map(|f| f.progress(config) * f.size() as f64)
        .sum();
    (loaded / total as f64).min(1.0)
}
