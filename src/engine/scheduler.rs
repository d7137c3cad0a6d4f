// ==========================================
// 数据迁移导入引擎 - 作业调度与运行时注册表
// ==========================================
// 职责: 每租户并发上限（超出排队）/ 作业独占锁 / 运行期控制句柄
// ==========================================

use crate::importer::error::{ImportError, ImportResult};
use crate::importer::executor::ExecutionControl;
use crate::repository::error::RepositoryError;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// 单个作业的运行期状态
#[derive(Debug, Default)]
pub struct JobRuntime {
    pub control: ExecutionControl,
    running: AtomicBool,
    lock: Arc<AsyncMutex<()>>,
}

impl JobRuntime {
    /// 是否有执行任务正在进行
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }
}

pub struct JobScheduler {
    tenant_limit: usize,
    tenants: Mutex<HashMap<String, Arc<Semaphore>>>,
    runtimes: Mutex<HashMap<String, Arc<JobRuntime>>>,
}

impl JobScheduler {
    pub fn new(tenant_limit: usize) -> Self {
        Self {
            tenant_limit: tenant_limit.max(1),
            tenants: Mutex::new(HashMap::new()),
            runtimes: Mutex::new(HashMap::new()),
        }
    }

    /// 获取（不存在则创建）作业运行时
    pub fn runtime(&self, job_id: &str) -> ImportResult<Arc<JobRuntime>> {
        let mut runtimes = self
            .runtimes
            .lock()
            .map_err(|e| RepositoryError::LockError(e.to_string()))?;
        Ok(runtimes
            .entry(job_id.to_string())
            .or_insert_with(|| Arc::new(JobRuntime::default()))
            .clone())
    }

    /// 已存在的作业运行时（未执行过的作业返回 None）
    pub fn existing_runtime(&self, job_id: &str) -> ImportResult<Option<Arc<JobRuntime>>> {
        let runtimes = self
            .runtimes
            .lock()
            .map_err(|e| RepositoryError::LockError(e.to_string()))?;
        Ok(runtimes.get(job_id).cloned())
    }

    /// 作业独占锁（执行 / 回滚互斥）
    ///
    /// # 返回
    /// - Err(JobBusy): 已有其他操作持有该作业
    pub fn try_lock_job(&self, job_id: &str) -> ImportResult<OwnedMutexGuard<()>> {
        let runtime = self.runtime(job_id)?;
        runtime
            .lock
            .clone()
            .try_lock_owned()
            .map_err(|_| ImportError::JobBusy(job_id.to_string()))
    }

    /// 等待租户执行名额（超出上限时排队）
    pub async fn acquire_tenant_slot(&self, tenant_id: &str) -> ImportResult<OwnedSemaphorePermit> {
        let semaphore = {
            let mut tenants = self
                .tenants
                .lock()
                .map_err(|e| RepositoryError::LockError(e.to_string()))?;
            tenants
                .entry(tenant_id.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(self.tenant_limit)))
                .clone()
        };
        if semaphore.available_permits() == 0 {
            debug!(tenant_id, limit = self.tenant_limit, "租户并发已满，排队等待");
        }
        semaphore
            .acquire_owned()
            .await
            .map_err(|e| ImportError::Other(anyhow::anyhow!("租户名额信号量已关闭: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_job_lock_is_exclusive() {
        let scheduler = JobScheduler::new(2);
        let guard = scheduler.try_lock_job("J1").unwrap();
        assert!(matches!(scheduler.try_lock_job("J1"), Err(ImportError::JobBusy(_))));
        assert!(scheduler.try_lock_job("J2").is_ok());
        drop(guard);
        assert!(scheduler.try_lock_job("J1").is_ok());
    }

    #[tokio::test]
    async fn test_tenant_slots_queue_beyond_limit() {
        let scheduler = Arc::new(JobScheduler::new(2));
        let first = scheduler.acquire_tenant_slot("T1").await.unwrap();
        let _second = scheduler.acquire_tenant_slot("T1").await.unwrap();

        // 第三个请求排队，其他租户不受影响
        let queued = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.acquire_tenant_slot("T1").await.map(|_| ()) })
        };
        let other = scheduler.acquire_tenant_slot("T2").await;
        assert!(other.is_ok());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!queued.is_finished());

        drop(first);
        let joined = tokio::time::timeout(Duration::from_secs(1), queued).await;
        assert!(joined.unwrap().unwrap().is_ok());
    }

    #[test]
    fn test_runtime_is_shared() {
        let scheduler = JobScheduler::new(1);
        let a = scheduler.runtime("J1").unwrap();
        a.control.request_pause();
        let b = scheduler.existing_runtime("J1").unwrap().unwrap();
        assert!(b.control.is_pause_requested());
        assert!(scheduler.existing_runtime("J2").unwrap().is_none());
    }
}
