// 分片调度
//
// 只做选择，不做派发：给定当前文件列表，决定下一个应该发送的分片。
// 会话在持有状态锁期间调用，选择结果立即派发，因此同一分片不会被选中两次。

use crate::config::UploadConfig;
use crate::uploader::chunk::ChunkStatus;
use crate::uploader::file::FileUpload;

/// 调度结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleOutcome {
    /// 派发 files[file_index].chunks[chunk_offset]
    Dispatch {
        file_index: usize,
        chunk_offset: usize,
    },
    /// 没有可发送的分片，但仍有文件未结束（暂停、上传中、等待重试）
    Idle,
    /// 所有文件都已结束
    Finished,
}

fn is_sendable(file: &FileUpload, offset: usize, config: &UploadConfig) -> bool {
    file.chunks()
        .get(offset)
        .is_some_and(|c| c.status(config) == ChunkStatus::Pending)
}

/// 选择下一个分片
///
/// 1. 开启首尾优先时，按文件顺序找第一个首分片或尾分片待发送的未暂停文件
/// 2. 否则按文件顺序、分片顺序找第一个待发送分片
/// 3. 都没有时，根据文件是否全部结束返回 Idle / Finished
pub fn schedule_next(files: &[FileUpload], config: &UploadConfig) -> ScheduleOutcome {
    if config.prioritize_first_and_last_chunk {
        for (file_index, file) in files.iter().enumerate() {
            if file.is_paused() {
                continue;
            }
            if is_sendable(file, 0, config) {
                return ScheduleOutcome::Dispatch {
                    file_index,
                    chunk_offset: 0,
                };
            }
            let last = file.chunks().len().saturating_sub(1);
            if last > 0 && is_sendable(file, last, config) {
                return ScheduleOutcome::Dispatch {
                    file_index,
                    chunk_offset: last,
                };
            }
        }
    }

    for (file_index, file) in files.iter().enumerate() {
        if file.is_paused() {
            continue;
        }
        let found = file
            .chunks()
            .iter()
            .position(|c| c.status(config) == ChunkStatus::Pending);
        if let Some(chunk_offset) = found {
            return ScheduleOutcome::Dispatch {
                file_index,
                chunk_offset,
            };
        }
    }

    if files.iter().any(|f| !f.is_complete(config)) {
        ScheduleOutcome::Idle
    } else {
        ScheduleOutcome::Finished
    }
}

/// 所有文件中占用并发槽位的分片数
pub fn uploading_count(files: &[FileUpload], config: &UploadConfig) -> usize {
    files.iter().map(|f| f.uploading_chunks(config)).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uploader::chunk::RequestKind;
    use crate::uploader::file::{generate_unique_identifier, FileId};
    use crate::uploader::source::{ByteSource, MemorySource};
    use std::sync::Arc;

    fn files(sizes: &[usize], config: &UploadConfig) -> Vec<FileUpload> {
        sizes
            .iter()
            .enumerate()
            .map(|(i, size)| {
                let source: Arc<dyn ByteSource> =
                    Arc::new(MemorySource::new(format!("f{}.bin", i), vec![0u8; *size]));
                let uid = generate_unique_identifier(source.as_ref());
                FileUpload::new(FileId(i as u64), source, uid, config)
            })
            .collect()
    }

    fn dispatch(files: &mut [FileUpload], config: &UploadConfig) -> Option<(usize, usize)> {
        match schedule_next(files, config) {
            ScheduleOutcome::Dispatch {
                file_index,
                chunk_offset,
            } => {
                files[file_index]
                    .chunk_mut(chunk_offset)
                    .unwrap()
                    .begin_request(RequestKind::Upload);
                Some((file_index, chunk_offset))
            }
            _ => None,
        }
    }

    #[test]
    fn test_in_order_scan() {
        let config = UploadConfig {
            chunk_size: 10,
            ..Default::default()
        };
        let mut list = files(&[30, 20], &config);
        let order: Vec<_> = std::iter::from_fn(|| dispatch(&mut list, &config)).collect();
        assert_eq!(order, vec![(0, 0), (0, 1), (0, 2), (1, 0), (1, 1)]);
        assert_eq!(uploading_count(&list, &config), 5);
        assert_eq!(schedule_next(&list, &config), ScheduleOutcome::Idle);
    }

    #[test]
    fn test_first_and_last_priority() {
        let config = UploadConfig {
            chunk_size: 10,
            prioritize_first_and_last_chunk: true,
            ..Default::default()
        };
        let mut list = files(&[40, 30], &config);
        let order: Vec<_> = std::iter::from_fn(|| dispatch(&mut list, &config))
            .take(6)
            .collect();
        assert_eq!(
            order,
            vec![(0, 0), (0, 3), (1, 0), (1, 2), (0, 1), (0, 2)]
        );
    }

    #[test]
    fn test_paused_files_are_skipped() {
        let config = UploadConfig {
            chunk_size: 10,
            ..Default::default()
        };
        let mut list = files(&[10, 10], &config);
        list[0].pause();
        assert_eq!(dispatch(&mut list, &config), Some((1, 0)));
        // 暂停的文件未结束
        assert_eq!(schedule_next(&list, &config), ScheduleOutcome::Idle);
    }

    #[test]
    fn test_finished_when_all_resolved() {
        let config = UploadConfig {
            chunk_size: 10,
            ..Default::default()
        };
        let mut list = files(&[10, 10], &config);
        for file in list.iter_mut() {
            let chunk = file.chunk_mut(0).unwrap();
            let (attempt, _) = chunk.begin_request(RequestKind::Upload);
            chunk.settle(attempt, 200, String::new());
        }
        list[1].mark_error();
        assert_eq!(schedule_next(&list, &config), ScheduleOutcome::Finished);
        assert_eq!(schedule_next(&[], &config), ScheduleOutcome::Finished);
    }
}
