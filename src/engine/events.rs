// ==========================================
// 数据迁移导入引擎 - 作业事件发布
// ==========================================
// 职责: 定义作业事件发布 trait，实现依赖倒置
// 说明: 引擎层定义 trait，通知/审计等外部协作方实现适配器
// ==========================================

use crate::domain::types::JobState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::sync::{Arc, Mutex};

// ==========================================
// 作业事件类型
// ==========================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobEventType {
    /// 状态转换
    StateChanged,
    /// 校验完成
    ValidationCompleted,
    /// 执行结束（含试运行）
    ExecutionFinished,
    /// 回滚完成（完整或部分）
    RollbackCompleted,
}

impl JobEventType {
    pub fn as_str(&self) -> &str {
        match self {
            JobEventType::StateChanged => "StateChanged",
            JobEventType::ValidationCompleted => "ValidationCompleted",
            JobEventType::ExecutionFinished => "ExecutionFinished",
            JobEventType::RollbackCompleted => "RollbackCompleted",
        }
    }
}

/// 作业事件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEvent {
    pub job_id: String,
    pub tenant_id: String,
    pub event_type: JobEventType,
    /// 状态转换事件的起止状态
    pub from: Option<JobState>,
    pub to: Option<JobState>,
    /// 附加说明（失败原因 / 计数摘要）
    pub detail: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

impl JobEvent {
    pub fn transition(
        job_id: &str,
        tenant_id: &str,
        from: JobState,
        to: JobState,
        detail: Option<String>,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id: job_id.to_string(),
            tenant_id: tenant_id.to_string(),
            event_type: JobEventType::StateChanged,
            from: Some(from),
            to: Some(to),
            detail,
            occurred_at,
        }
    }

    pub fn notice(
        job_id: &str,
        tenant_id: &str,
        event_type: JobEventType,
        detail: Option<String>,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id: job_id.to_string(),
            tenant_id: tenant_id.to_string(),
            event_type,
            from: None,
            to: None,
            detail,
            occurred_at,
        }
    }
}

// ==========================================
// 事件发布 Trait
// ==========================================

/// 作业事件发布者
///
/// # 实现说明
/// - 发布失败只记录日志，不影响作业状态
pub trait JobEventPublisher: Send + Sync {
    /// 发布事件
    ///
    /// # 返回
    /// - `Ok(id)`: 外部系统返回的事件 ID（不支持时为空字符串）
    /// - `Err`: 发布失败
    fn publish(&self, event: JobEvent) -> Result<String, Box<dyn Error + Send + Sync>>;
}

/// 空操作事件发布者
#[derive(Debug, Clone, Default)]
pub struct NoOpEventPublisher;

impl JobEventPublisher for NoOpEventPublisher {
    fn publish(&self, event: JobEvent) -> Result<String, Box<dyn Error + Send + Sync>> {
        tracing::debug!(
            "NoOpEventPublisher: 跳过事件发布 - job_id={}, event_type={}",
            event.job_id,
            event.event_type.as_str()
        );
        Ok(String::new())
    }
}

/// 内存记录发布者（测试与 CLI 查看事件流）
#[derive(Debug, Default)]
pub struct RecordingEventPublisher {
    events: Mutex<Vec<JobEvent>>,
}

impl RecordingEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<JobEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl JobEventPublisher for RecordingEventPublisher {
    fn publish(&self, event: JobEvent) -> Result<String, Box<dyn Error + Send + Sync>> {
        let mut events = self
            .events
            .lock()
            .map_err(|e| format!("事件缓冲锁获取失败: {}", e))?;
        events.push(event);
        Ok(events.len().to_string())
    }
}

/// 可选的事件发布者包装
pub struct OptionalEventPublisher {
    inner: Option<Arc<dyn JobEventPublisher>>,
}

impl OptionalEventPublisher {
    pub fn with_publisher(publisher: Arc<dyn JobEventPublisher>) -> Self {
        Self {
            inner: Some(publisher),
        }
    }

    pub fn none() -> Self {
        Self { inner: None }
    }

    /// 发布事件（失败只记录警告）
    pub fn publish(&self, event: JobEvent) {
        match &self.inner {
            Some(publisher) => {
                let job_id = event.job_id.clone();
                let event_type = event.event_type;
                if let Err(e) = publisher.publish(event) {
                    tracing::warn!(
                        job_id = %job_id,
                        event_type = event_type.as_str(),
                        "事件发布失败: {}",
                        e
                    );
                }
            }
            None => {
                tracing::debug!(
                    "OptionalEventPublisher: 未配置发布者，跳过事件 - job_id={}, event_type={}",
                    event.job_id,
                    event.event_type.as_str()
                );
            }
        }
    }

    pub fn is_configured(&self) -> bool {
        self.inner.is_some()
    }
}

impl Default for OptionalEventPublisher {
    fn default() -> Self {
        Self::none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_event() {
        let event = JobEvent::transition("J1", "T1", JobState::Ready, JobState::Importing, None, Utc::now());
        assert_eq!(event.event_type, JobEventType::StateChanged);
        assert_eq!(event.from, Some(JobState::Ready));
        assert_eq!(event.to, Some(JobState::Importing));
    }

    #[test]
    fn test_noop_publisher() {
        let publisher = NoOpEventPublisher;
        let result = publisher.publish(JobEvent::notice(
            "J1",
            "T1",
            JobEventType::ValidationCompleted,
            None,
            Utc::now(),
        ));
        assert!(result.unwrap().is_empty());
    }

    #[test]
    fn test_optional_publisher_records_events() {
        let none = OptionalEventPublisher::none();
        assert!(!none.is_configured());
        none.publish(JobEvent::notice("J1", "T1", JobEventType::ExecutionFinished, None, Utc::now()));

        let recorder = Arc::new(RecordingEventPublisher::new());
        let publisher = OptionalEventPublisher::with_publisher(recorder.clone());
        assert!(publisher.is_configured());
        publisher.publish(JobEvent::notice("J1", "T1", JobEventType::RollbackCompleted, None, Utc::now()));

        let events = recorder.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, JobEventType::RollbackCompleted);
    }
}
