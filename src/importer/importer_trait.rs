// ==========================================
// 数据迁移导入引擎 - 流水线 Trait
// ==========================================
// 职责: 定义流水线各阶段的可替换接口（不包含实现）
// ==========================================

use crate::domain::mapping::ColumnProfile;
use crate::domain::record::SourceRow;
use crate::domain::schema::TargetField;
use crate::importer::error::ImportResult;
use chrono::{DateTime, Utc};
use std::sync::{Arc, RwLock};

// ==========================================
// FileParser Trait
// ==========================================
// 用途: 把上传文件解析为逐行流（阶段 0）
// 实现者: CsvParser, ExcelParser
pub trait FileParser: Send + Sync {
    /// 格式标签（csv / xlsx）
    fn format(&self) -> &'static str;

    /// 打开文件，返回表头与行迭代器
    ///
    /// # 参数
    /// - bytes: 原始文件内容（共享缓冲区，行流可持有）
    /// - encoding_hint: 调用方声明的字符编码（可选）
    ///
    /// # 返回
    /// - Ok(ParsedFile): 表头 + 惰性行流
    /// - Err(UnsupportedFormat): 容器格式完全无法解析
    /// - Err(EmptyInput): 连表头都没有
    fn open(&self, bytes: Arc<[u8]>, encoding_hint: Option<&str>) -> ImportResult<ParsedFile>;
}

/// 单行解析失败（跳过并计数，不中断整个文件）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowParseError {
    pub row_number: usize,
    pub message: String,
}

pub type RowResult = Result<SourceRow, RowParseError>;

/// 已打开的文件
pub struct ParsedFile {
    pub format: &'static str,
    pub encoding: String,
    pub headers: Vec<String>,
    pub rows: Box<dyn Iterator<Item = RowResult> + Send>,
}

// ==========================================
// MappingScorer Trait
// ==========================================
// 用途: 映射置信度评分（基线启发式实现可独立工作，
//       更强的评分器可在同一接口后替换）
// 实现者: HeuristicScorer
pub trait MappingScorer: Send + Sync {
    /// 评分器名称（写入日志）
    fn name(&self) -> &'static str;

    /// 源列 → 目标字段 的置信度（0-1）
    fn score_field(&self, profile: &ColumnProfile, field: &TargetField) -> f64;

    /// 源值 → 目标枚举值 的置信度（0-1）
    fn score_value(&self, source_value: &str, target_value: &str) -> f64;
}

// ==========================================
// Clock Trait
// ==========================================
// 用途: NOW() 规则与还原点过期判断的可注入时钟
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// 系统时钟
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// 固定时钟（测试用，可手动推进）
#[derive(Debug)]
pub struct FixedClock {
    now: RwLock<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: RwLock::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        if let Ok(mut guard) = self.now.write() {
            *guard = now;
        }
    }

    pub fn advance(&self, delta: chrono::Duration) {
        if let Ok(mut guard) = self.now.write() {
            *guard += delta;
        }
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        match self.now.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}
