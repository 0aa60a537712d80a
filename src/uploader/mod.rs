// 分片上传模块
//
// - chunk: 分片状态机与分片计算
// - file: 单个文件的分片列表、进度与速度
// - scheduler: 选择下一个待发送分片
// - session: 上传会话（文件集合、并发控制、事件）
// - source / folder: 数据源与文件夹展开
// - transport: 分片请求的 HTTP 传输

pub mod chunk;
pub mod file;
pub mod folder;
pub mod scheduler;
pub mod session;
pub mod source;
pub mod transport;

pub use chunk::{
    classify_response, partition_chunks, ChunkInfo, ChunkStatus, PreprocessState, RequestKind,
    UploadChunk,
};
pub use file::{generate_unique_identifier, FileId, FileInfo, FileUpload, IdentifierGenerator};
pub use folder::{format_bytes, FolderScanner, ScanOptions};
pub use scheduler::{schedule_next, ScheduleOutcome};
pub use session::{ChunkPreprocessor, UploadSession, UploadSessionBuilder};
pub use source::{ByteSource, LocalFileSource, MemorySource};
pub use transport::{
    ChunkBody, ChunkRequest, ChunkResponse, ChunkTransport, ParamSource, ParamsFn, ProgressFn,
    ReqwestTransport, RequestContext,
};
