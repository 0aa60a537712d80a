use anyhow::{Context, Result};
use clap::Parser;
use flow_upload_rust::{
    config::{AppConfig, DEFAULT_CONFIG_PATH},
    logging, ByteSource, EventFlow, FolderScanner, LocalFileSource, SessionEvent, UploadSession,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{error, info, warn};

/// 分片上传命令行
#[derive(Parser, Debug)]
#[command(name = "flow-upload")]
#[command(about = "Resumable chunked upload client")]
#[command(version)]
struct Cli {
    /// 分片接收地址
    target: String,

    /// 要上传的文件或文件夹
    #[arg(required = true)]
    paths: Vec<PathBuf>,

    /// 配置文件路径
    #[arg(short = 'c', long = "config", default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// 覆盖配置中的分片大小（字节）
    #[arg(long = "chunk-size")]
    chunk_size: Option<u64>,

    /// 覆盖配置中的并发分片数
    #[arg(short = 'j', long = "simultaneous")]
    simultaneous: Option<usize>,
}

/// 把命令行路径展开成数据源（文件夹递归展开）
async fn collect_sources(paths: &[PathBuf]) -> Result<Vec<Arc<dyn ByteSource>>> {
    let scanner = FolderScanner::new();
    let mut sources: Vec<Arc<dyn ByteSource>> = Vec::new();

    for path in paths {
        if path.is_dir() {
            let files = scanner.scan_async(path.clone()).await?;
            sources.extend(
                files
                    .into_iter()
                    .map(|f| Arc::new(f) as Arc<dyn ByteSource>),
            );
        } else {
            let file = LocalFileSource::open(path)
                .await
                .with_context(|| format!("无法读取文件: {}", path.display()))?;
            sources.push(Arc::new(file));
        }
    }
    Ok(sources)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut app_config = AppConfig::load_or_default(&cli.config).await;

    // 必须保持 _log_guard 存活
    let _log_guard = logging::init_logging(&app_config.log);

    info!("flow-upload v{} 启动中...", env!("CARGO_PKG_VERSION"));

    app_config.upload.target = cli.target.clone();
    if let Some(chunk_size) = cli.chunk_size {
        app_config.upload.chunk_size = chunk_size;
    }
    if let Some(simultaneous) = cli.simultaneous {
        app_config.upload.simultaneous_uploads = simultaneous;
    }

    let session = UploadSession::new(app_config.upload).context("创建上传会话失败")?;

    let done = Arc::new(Notify::new());
    let notify = done.clone();
    session.on("complete", move |_| {
        notify.notify_one();
        EventFlow::Continue
    });
    session.on("fileSuccess", |event| {
        if let SessionEvent::FileSuccess { file, .. } = event {
            info!("✓ {} ({})", file.relative_path, flow_upload_rust::format_bytes(file.size));
        }
        EventFlow::Continue
    });
    session.on("fileError", |event| {
        if let SessionEvent::FileError { file, message, .. } = event {
            error!("✗ {}: {}", file.relative_path, message);
        }
        EventFlow::Continue
    });
    session.on("progress", |event| {
        if let SessionEvent::Progress { progress } = event {
            info!("上传进度: {:.1}%", progress * 100.0);
        }
        EventFlow::Continue
    });

    let sources = collect_sources(&cli.paths).await?;
    let added = session.add_byte_sources(sources);
    if added.is_empty() {
        warn!("没有需要上传的文件");
        return Ok(());
    }
    info!(
        "共 {} 个文件，{}",
        added.len(),
        flow_upload_rust::format_bytes(session.size())
    );

    session.start();

    tokio::select! {
        _ = done.notified() => {}
        _ = tokio::signal::ctrl_c() => {
            warn!("收到中断信号，暂停上传");
            session.pause();
            anyhow::bail!("上传被中断");
        }
    }

    let failed: Vec<_> = session.files().into_iter().filter(|f| f.has_error).collect();
    if !failed.is_empty() {
        anyhow::bail!("{} 个文件上传失败", failed.len());
    }

    info!("全部 {} 个文件上传成功", added.len());
    Ok(())
}
