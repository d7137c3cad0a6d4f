// ==========================================
// 数据迁移导入引擎 - 导入层
// ==========================================
// 职责: 流水线各阶段实现
// 阶段: 文件分析 → 字段/值映射 → 转换 → 校验 → 执行 → [回滚]
// 支持: CSV / TSV / XLSX
// ==========================================

// 模块声明
pub mod conflict_handler;
pub mod data_cleaner;
pub mod dq_validator;
pub mod error;
pub mod executor;
pub mod field_mapper;
pub mod file_analyzer;
pub mod file_parser;
pub mod importer_trait;
pub mod rollback;
pub mod transformer;
pub mod value_mapper;

// 重导出核心类型
pub use conflict_handler::ConflictHandler;
pub use data_cleaner::DataCleaner;
pub use dq_validator::{issue_codes, DqValidator, ReferenceCache};
pub use error::{ImportError, ImportResult};
pub use executor::{
    ExecutionControl, ExecutionRequest, ExecutionStop, ExecutionSummary, ExecutorSettings,
    ImportExecutor,
};
pub use field_mapper::{FieldMapper, HeuristicScorer};
pub use file_analyzer::{FileAnalyzer, SourceSystemRegistry};
pub use file_parser::{CsvParser, ExcelParser, UniversalFileParser};
pub use rollback::RollbackManager;
pub use transformer::RecordTransformer;
pub use value_mapper::ValueMapper;

// 重导出 Trait 接口
pub use importer_trait::{
    Clock, FileParser, FixedClock, MappingScorer, ParsedFile, RowParseError, RowResult,
    SystemClock,
};
