//! 文件夹扫描
//!
//! 把本地文件夹展开成一组扁平的数据源，保留相对路径（目录结构由服务端按
//! flowRelativePath 还原）

use crate::uploader::source::{ByteSource, LocalFileSource};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// 文件夹扫描配置
#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    /// 是否跟随符号链接
    pub follow_symlinks: bool,
    /// 最大文件大小（字节），超过此大小的文件将被跳过
    pub max_file_size: Option<u64>,
    /// 最大文件数量，超过此数量将停止扫描
    pub max_files: Option<usize>,
    /// 跳过隐藏文件（以.开头的文件和文件夹）
    pub skip_hidden: bool,
}

/// 文件夹扫描器
#[derive(Debug, Clone, Default)]
pub struct FolderScanner {
    options: ScanOptions,
}

impl FolderScanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: ScanOptions) -> Self {
        Self { options }
    }

    /// 递归扫描文件夹，按相对路径排序
    ///
    /// 相对路径以扫描根目录的名称开头（`photos/2024/a.jpg`），分隔符统一为 `/`
    pub fn scan<P: AsRef<Path>>(&self, root_path: P) -> Result<Vec<LocalFileSource>> {
        let root_path = root_path.as_ref();

        if !root_path.exists() {
            anyhow::bail!("扫描路径不存在: {}", root_path.display());
        }
        if !root_path.is_dir() {
            anyhow::bail!("扫描路径不是文件夹: {}", root_path.display());
        }

        info!("开始扫描文件夹: {}", root_path.display());

        let root_name = root_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let skip_hidden = self.options.skip_hidden;

        let walker = WalkDir::new(root_path)
            .follow_links(self.options.follow_symlinks)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(move |entry| {
                // 根目录本身不参与隐藏判断
                !(skip_hidden
                    && entry.depth() > 0
                    && entry.file_name().to_string_lossy().starts_with('.'))
            });

        let mut files = Vec::new();
        for entry in walker {
            let entry = entry.with_context(|| format!("读取目录失败: {}", root_path.display()))?;
            if !entry.file_type().is_file() {
                continue;
            }

            let metadata = entry
                .metadata()
                .with_context(|| format!("读取文件元数据失败: {}", entry.path().display()))?;
            let size = metadata.len();

            if let Some(max_size) = self.options.max_file_size {
                if size > max_size {
                    warn!(
                        "跳过超大文件: {} ({})",
                        entry.path().display(),
                        format_bytes(size)
                    );
                    continue;
                }
            }

            let relative = entry
                .path()
                .strip_prefix(root_path)
                .with_context(|| {
                    format!(
                        "计算相对路径失败: {} (root: {})",
                        entry.path().display(),
                        root_path.display()
                    )
                })?;
            let relative_path = to_relative_path(&root_name, relative);

            debug!("扫描到文件: {} ({})", relative_path, format_bytes(size));
            files.push(LocalFileSource::from_parts(
                entry.into_path(),
                relative_path,
                size,
            ));

            if let Some(max_files) = self.options.max_files {
                if files.len() >= max_files {
                    warn!("已达到最大文件数量限制 ({}), 停止扫描", max_files);
                    break;
                }
            }
        }

        files.sort_by(|a, b| a.relative_path().cmp(b.relative_path()));

        info!(
            "文件夹扫描完成: {} 个文件，总大小 {}",
            files.len(),
            format_bytes(files.iter().map(|f| f.size()).sum())
        );

        Ok(files)
    }

    /// 在阻塞线程池中扫描
    pub async fn scan_async(&self, root_path: PathBuf) -> Result<Vec<LocalFileSource>> {
        let scanner = self.clone();
        tokio::task::spawn_blocking(move || scanner.scan(root_path))
            .await
            .context("扫描任务异常退出")?
    }
}

/// `<root_name>/<a>/<b>`，分隔符统一为 `/`
fn to_relative_path(root_name: &str, relative: &Path) -> String {
    let mut parts: Vec<String> = Vec::new();
    if !root_name.is_empty() {
        parts.push(root_name.to_string());
    }
    parts.extend(
        relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned()),
    );
    parts.join("/")
}

/// 格式化字节大小
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
