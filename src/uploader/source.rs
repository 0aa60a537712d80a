// 上传数据源
//
// 会话只关心两件事：数据大小、按字节范围切片。
// 内存数据和本地文件各有一个实现，调用方也可以自行实现 ByteSource。

use crate::error::{Result, UploadError};
use async_trait::async_trait;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::debug;

/// 可切片的数据源
#[async_trait]
pub trait ByteSource: Send + Sync + fmt::Debug {
    /// 文件名
    fn name(&self) -> &str;

    /// 相对路径（选择文件夹上传时保留目录结构），默认为文件名
    fn relative_path(&self) -> &str {
        self.name()
    }

    /// 数据总大小（字节）
    fn size(&self) -> u64;

    /// 读取 [start, end) 范围的数据
    async fn slice(&self, start: u64, end: u64) -> Result<Vec<u8>>;

    /// 是否为目录占位项（大小为 0 且名称为 "."）
    fn is_directory_placeholder(&self) -> bool {
        self.size() == 0 && self.name() == "."
    }
}

fn check_range(start: u64, end: u64, size: u64) -> Result<()> {
    if start > end || end > size {
        return Err(UploadError::InvalidRange { start, end, size });
    }
    Ok(())
}

/// 内存数据源
#[derive(Clone)]
pub struct MemorySource {
    name: String,
    relative_path: Option<String>,
    data: Arc<Vec<u8>>,
}

impl MemorySource {
    pub fn new(name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            relative_path: None,
            data: Arc::new(data.into()),
        }
    }

    pub fn with_relative_path(mut self, relative_path: impl Into<String>) -> Self {
        self.relative_path = Some(relative_path.into());
        self
    }
}

impl fmt::Debug for MemorySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemorySource")
            .field("name", &self.name)
            .field("relative_path", &self.relative_path)
            .field("size", &self.data.len())
            .finish()
    }
}

#[async_trait]
impl ByteSource for MemorySource {
    fn name(&self) -> &str {
        &self.name
    }

    fn relative_path(&self) -> &str {
        self.relative_path.as_deref().unwrap_or(&self.name)
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    async fn slice(&self, start: u64, end: u64) -> Result<Vec<u8>> {
        check_range(start, end, self.size())?;
        Ok(self.data[start as usize..end as usize].to_vec())
    }
}

/// 本地文件数据源
///
/// 每次切片重新打开文件并定位，不长期持有文件句柄
#[derive(Debug, Clone)]
pub struct LocalFileSource {
    path: PathBuf,
    name: String,
    relative_path: String,
    size: u64,
}

impl LocalFileSource {
    /// 打开本地文件（只读取元数据）
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let metadata = tokio::fs::metadata(&path).await?;
        if !metadata.is_file() {
            return Err(UploadError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("不是普通文件: {}", path.display()),
            )));
        }

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        Ok(Self {
            relative_path: name.clone(),
            name,
            size: metadata.len(),
            path,
        })
    }

    /// 用已知的元数据构造（文件夹扫描时使用，避免重复 stat）
    pub fn from_parts(path: PathBuf, relative_path: String, size: u64) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            path,
            name,
            relative_path,
            size,
        }
    }

    pub fn with_relative_path(mut self, relative_path: impl Into<String>) -> Self {
        self.relative_path = relative_path.into();
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ByteSource for LocalFileSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn relative_path(&self) -> &str {
        &self.relative_path
    }

    fn size(&self) -> u64 {
        self.size
    }

    async fn slice(&self, start: u64, end: u64) -> Result<Vec<u8>> {
        check_range(start, end, self.size)?;

        let mut file = File::open(&self.path).await?;
        file.seek(std::io::SeekFrom::Start(start)).await?;

        let mut buffer = vec![0u8; (end - start) as usize];
        file.read_exact(&mut buffer).await?;

        debug!(
            "读取分片数据: {:?}, bytes={}-{}, 大小={} bytes",
            self.path,
            start,
            end,
            buffer.len()
        );

        Ok(buffer)
    }
}
