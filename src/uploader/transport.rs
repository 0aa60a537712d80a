// 分片请求传输层
//
// 会话只负责决定"发什么"（ChunkRequest），真正的 HTTP 交互由 ChunkTransport 完成。
// 默认实现基于 reqwest；测试中可替换为脚本化实现。

use crate::config::{BodyMethod, UploadConfig};
use crate::error::{Result, UploadError};
use crate::uploader::chunk::RequestKind;
use async_trait::async_trait;
use futures::stream;
use reqwest::{multipart, Body, Client, Method};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// 流式上传时每次写出的字节数（同时决定进度回调粒度）
const BODY_PIECE_SIZE: usize = 64 * 1024;

/// 进度回调 (loaded, total)
pub type ProgressFn = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// 动态参数提供者（query / header）
pub type ParamsFn = Arc<dyn Fn(&RequestContext) -> BTreeMap<String, String> + Send + Sync>;

/// 参数来源：静态配置或按请求计算
#[derive(Clone, Default)]
pub enum ParamSource {
    /// 使用配置文件中的静态值
    #[default]
    Static,
    /// 每个请求调用一次
    Dynamic(ParamsFn),
}

impl ParamSource {
    fn resolve(
        &self,
        fixed: &BTreeMap<String, String>,
        ctx: &RequestContext,
    ) -> BTreeMap<String, String> {
        match self {
            ParamSource::Static => fixed.clone(),
            ParamSource::Dynamic(f) => {
                let mut merged = fixed.clone();
                merged.extend(f(ctx));
                merged
            }
        }
    }
}

impl std::fmt::Debug for ParamSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParamSource::Static => write!(f, "Static"),
            ParamSource::Dynamic(_) => write!(f, "Dynamic(..)"),
        }
    }
}

/// 单个分片请求的上下文（协议元数据的来源）
#[derive(Debug, Clone, PartialEq)]
pub struct RequestContext {
    pub kind: RequestKind,
    /// 分片序号（从 0 开始）
    pub chunk_offset: usize,
    pub start_byte: u64,
    pub end_byte: u64,
    pub chunk_size: u64,
    pub total_size: u64,
    pub total_chunks: usize,
    pub identifier: String,
    pub file_name: String,
    pub relative_path: String,
}

impl RequestContext {
    /// 分片协议标准参数
    ///
    /// 分片序号从 1 开始
    pub fn protocol_params(&self) -> Vec<(String, String)> {
        vec![
            (
                "flowChunkNumber".to_string(),
                (self.chunk_offset + 1).to_string(),
            ),
            ("flowChunkSize".to_string(), self.chunk_size.to_string()),
            (
                "flowCurrentChunkSize".to_string(),
                (self.end_byte - self.start_byte).to_string(),
            ),
            ("flowTotalSize".to_string(), self.total_size.to_string()),
            ("flowIdentifier".to_string(), self.identifier.clone()),
            ("flowFilename".to_string(), self.file_name.clone()),
            ("flowRelativePath".to_string(), self.relative_path.clone()),
            ("flowTotalChunks".to_string(), self.total_chunks.to_string()),
        ]
    }
}

/// 请求体
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkBody {
    /// 无请求体（探测请求）
    Empty,
    /// 原始字节
    Raw(Vec<u8>),
    /// multipart 表单：参数字段 + 分片文件字段
    Multipart {
        fields: Vec<(String, String)>,
        file_field: String,
        file_name: String,
        data: Vec<u8>,
    },
}

impl ChunkBody {
    /// 请求体中分片数据的长度
    pub fn data_len(&self) -> u64 {
        match self {
            ChunkBody::Empty => 0,
            ChunkBody::Raw(data) => data.len() as u64,
            ChunkBody::Multipart { data, .. } => data.len() as u64,
        }
    }
}

/// 分片请求
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkRequest {
    pub kind: RequestKind,
    pub method: String,
    pub target: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: ChunkBody,
}

impl ChunkRequest {
    /// 根据配置构造请求
    ///
    /// - 探测请求和 octet 模式：所有参数放在 query 中
    /// - multipart 模式：参数作为表单字段，分片数据放在 `file_parameter_name` 字段
    pub fn build(
        ctx: &RequestContext,
        config: &UploadConfig,
        query_source: &ParamSource,
        header_source: &ParamSource,
        data: Option<Vec<u8>>,
    ) -> Self {
        // 协议参数优先，调用方参数不能覆盖
        let protocol = ctx.protocol_params();
        let mut params: Vec<(String, String)> = query_source
            .resolve(&config.query, ctx)
            .into_iter()
            .filter(|(k, _)| !protocol.iter().any(|(name, _)| name == k))
            .collect();
        params.extend(protocol);

        let headers: Vec<(String, String)> = header_source
            .resolve(&config.headers, ctx)
            .into_iter()
            .collect();

        let method = match ctx.kind {
            RequestKind::Test => config.test_method.clone(),
            RequestKind::Upload => config.upload_method.clone(),
        };

        let (query, body) = match (ctx.kind, config.method, data) {
            (RequestKind::Test, _, _) | (_, _, None) => (params, ChunkBody::Empty),
            (RequestKind::Upload, BodyMethod::Octet, Some(data)) => (params, ChunkBody::Raw(data)),
            (RequestKind::Upload, BodyMethod::Multipart, Some(data)) => (
                Vec::new(),
                ChunkBody::Multipart {
                    fields: params,
                    file_field: config.file_parameter_name.clone(),
                    file_name: ctx.file_name.clone(),
                    data,
                },
            ),
        };

        Self {
            kind: ctx.kind,
            method,
            target: config.target.clone(),
            query,
            headers,
            body,
        }
    }
}

/// 分片响应
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkResponse {
    pub status: u16,
    pub body: String,
}

/// 分片传输
#[async_trait]
pub trait ChunkTransport: Send + Sync {
    /// 发送请求，返回 HTTP 状态码和响应内容
    ///
    /// 未拿到 HTTP 响应（连接失败等）时返回 Err，由会话按临时错误处理
    async fn send(&self, request: ChunkRequest, on_progress: ProgressFn) -> Result<ChunkResponse>;
}

/// 基于 reqwest 的传输实现
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    /// 创建传输实例
    ///
    /// `with_credentials` 为 true 时启用 Cookie 存储，跨请求携带服务端下发的 Cookie
    pub fn new(with_credentials: bool) -> Result<Self> {
        let client = Client::builder()
            .cookie_store(with_credentials)
            .build()?;
        Ok(Self { client })
    }

    /// 使用调用方提供的 reqwest 客户端
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    /// 把分片数据包装成流式请求体，按写出进度回调
    fn progress_body(data: Vec<u8>, on_progress: ProgressFn) -> Body {
        let total = data.len() as u64;
        let pieces: Vec<Vec<u8>> = data
            .chunks(BODY_PIECE_SIZE)
            .map(|piece| piece.to_vec())
            .collect();

        let mut loaded = 0u64;
        let body_stream = stream::iter(pieces.into_iter().map(move |piece| {
            loaded += piece.len() as u64;
            on_progress(loaded, total);
            Ok::<_, std::io::Error>(piece)
        }));

        Body::wrap_stream(body_stream)
    }
}

#[async_trait]
impl ChunkTransport for ReqwestTransport {
    async fn send(&self, request: ChunkRequest, on_progress: ProgressFn) -> Result<ChunkResponse> {
        let method = Method::from_bytes(request.method.to_uppercase().as_bytes())
            .map_err(|e| UploadError::Config(format!("非法请求方法 {}: {}", request.method, e)))?;

        let mut builder = self.client.request(method, &request.target);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        builder = match request.body {
            ChunkBody::Empty => builder,
            ChunkBody::Raw(data) => {
                let len = data.len() as u64;
                builder
                    .header(reqwest::header::CONTENT_LENGTH, len)
                    .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
                    .body(Self::progress_body(data, on_progress))
            }
            ChunkBody::Multipart {
                fields,
                file_field,
                file_name,
                data,
            } => {
                let len = data.len() as u64;
                let part = multipart::Part::stream_with_length(
                    Self::progress_body(data, on_progress),
                    len,
                )
                .file_name(file_name)
                .mime_str("application/octet-stream")?;

                let mut form = multipart::Form::new();
                for (name, value) in fields {
                    form = form.text(name, value);
                }
                builder.multipart(form.part(file_field, part))
            }
        };

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;

        debug!(
            "分片请求完成: {:?} {} -> status={}",
            request.kind, request.target, status
        );

        Ok(ChunkResponse { status, body })
    }
}
