// ==========================================
// 数据迁移导入引擎 - 上传文件存储
// ==========================================
// 职责: 读取原始上传文件（本引擎只读，不负责持久性）
// ==========================================

use crate::repository::error::{RepositoryError, RepositoryResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, RwLock};

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// 读取完整文件内容（共享缓冲区，解析阶段直接在其上迭代，不再复制）
    async fn get(&self, key: &str) -> RepositoryResult<Arc<[u8]>>;
}

// ==========================================
// FsBlobStore - 基于目录的存储
// ==========================================
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// key 只允许相对路径，拒绝 `..` 越界
    fn resolve(&self, key: &str) -> RepositoryResult<PathBuf> {
        let rel = Path::new(key);
        let escapes = rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes {
            return Err(RepositoryError::NotFound {
                entity: "Blob".to_string(),
                id: key.to_string(),
            });
        }
        Ok(self.root.join(rel))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn get(&self, key: &str) -> RepositoryResult<Arc<[u8]>> {
        let path = self.resolve(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Arc::from(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(RepositoryError::NotFound {
                entity: "Blob".to_string(),
                id: key.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }
}

// ==========================================
// MemoryBlobStore - 内存存储（测试 / 嵌入调用）
// ==========================================
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<String, Arc<[u8]>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, key: &str, bytes: Vec<u8>) -> RepositoryResult<()> {
        let mut blobs = self
            .blobs
            .write()
            .map_err(|e| RepositoryError::LockError(e.to_string()))?;
        blobs.insert(key.to_string(), Arc::from(bytes));
        Ok(())
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn get(&self, key: &str) -> RepositoryResult<Arc<[u8]>> {
        let blobs = self
            .blobs
            .read()
            .map_err(|e| RepositoryError::LockError(e.to_string()))?;
        blobs.get(key).cloned().ok_or_else(|| RepositoryError::NotFound {
            entity: "Blob".to_string(),
            id: key.to_string(),
        })
    }
}
