// ==========================================
// 数据迁移导入引擎 - 文件分析器
// ==========================================
// 职责: 流式解析 → 列画像（类型/空值/去重/样本）→ 源系统识别
// 内存: 除每列有界样本与去重集合外不保留数据行
// ==========================================

use crate::domain::mapping::{AnalysisResult, ColumnProfile, ColumnType, SourceSystemGuess};
use crate::importer::data_cleaner::DataCleaner;
use crate::importer::error::{ImportError, ImportResult};
use crate::importer::file_parser::UniversalFileParser;
use crate::repository::error::{RepositoryError, RepositoryResult};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

/// 去重计数上限
pub const DISTINCT_CAP: usize = 10_000;

/// 类型推断的一致性阈值（非空值中的占比）
const TYPE_AGREEMENT: f64 = 0.9;

/// 未识别源系统时的标签
pub const CUSTOM_SOURCE_SYSTEM: &str = "custom";

// ==========================================
// SourceSystemRegistry - 已知源系统列签名
// ==========================================
#[derive(Debug, Clone)]
pub struct SourceSignature {
    pub system: String,
    pub columns: BTreeSet<String>, // 规范化列名
}

pub struct SourceSystemRegistry {
    signatures: RwLock<Vec<SourceSignature>>,
}

/// 列名规范化: 小写 + 仅保留字母数字
pub fn normalize_column_name(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(|c| c.to_lowercase())
        .collect()
}

impl SourceSystemRegistry {
    pub fn empty() -> Self {
        Self {
            signatures: RwLock::new(Vec::new()),
        }
    }

    /// 内置签名（常见合规/案件管理系统导出格式）
    pub fn with_builtin() -> Self {
        let registry = Self::empty();
        let builtin: [(&str, &[&str]); 4] = [
            (
                "ethicspoint",
                &[
                    "Report_Key", "Report_Date", "Incident_Type", "Location",
                    "Reporter_Type", "Status", "Assigned_To", "Summary",
                ],
            ),
            (
                "convercent",
                &[
                    "Case Number", "Date Opened", "Issue Type", "Business Unit",
                    "Intake Method", "Case Status", "Case Owner", "Description",
                ],
            ),
            (
                "servicenow_hr",
                &[
                    "number", "opened_at", "hr_service", "subject_person",
                    "state", "assigned_to", "short_description", "priority",
                ],
            ),
            (
                "workday_employee",
                &[
                    "Employee_ID", "Legal_Name", "Work_Email", "Hire_Date",
                    "Manager_ID", "Cost_Center", "Job_Title", "Location",
                ],
            ),
        ];
        for (system, columns) in builtin {
            // 内置签名写入失败只可能是锁中毒，此时注册表为空
            if let Err(e) = registry.register(system, columns.iter().copied()) {
                warn!(system = system, error = %e, "内置源系统签名注册失败");
            }
        }
        registry
    }

    /// 运行时注册（同名覆盖）
    pub fn register<I, S>(&self, system: &str, columns: I) -> RepositoryResult<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let signature = SourceSignature {
            system: system.to_string(),
            columns: columns
                .into_iter()
                .map(|c| normalize_column_name(c.as_ref()))
                .filter(|c| !c.is_empty())
                .collect(),
        };
        let mut signatures = self
            .signatures
            .write()
            .map_err(|e| RepositoryError::LockError(e.to_string()))?;
        signatures.retain(|s| s.system != signature.system);
        signatures.push(signature);
        Ok(())
    }

    /// 按列名集合 Jaccard 相似度识别源系统
    ///
    /// # 返回
    /// - 最佳匹配 ≥ threshold: 该系统
    /// - 否则: "custom"，置信度为最佳得分
    pub fn detect(&self, headers: &[String], threshold: f64) -> SourceSystemGuess {
        let observed: BTreeSet<String> = headers
            .iter()
            .map(|h| normalize_column_name(h))
            .filter(|h| !h.is_empty())
            .collect();

        let signatures = match self.signatures.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let best = signatures
            .iter()
            .map(|sig| (sig.system.as_str(), jaccard(&observed, &sig.columns)))
            .fold(None, |best: Option<(&str, f64)>, (system, score)| match best {
                Some((_, best_score)) if best_score >= score => best,
                _ => Some((system, score)),
            });

        match best {
            Some((system, score)) if score >= threshold => SourceSystemGuess {
                system: system.to_string(),
                confidence: score,
            },
            Some((_, score)) => SourceSystemGuess {
                system: CUSTOM_SOURCE_SYSTEM.to_string(),
                confidence: score,
            },
            None => SourceSystemGuess {
                system: CUSTOM_SOURCE_SYSTEM.to_string(),
                confidence: 0.0,
            },
        }
    }
}

fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

// ==========================================
// ColumnAccumulator - 单列流式统计
// ==========================================
struct ColumnAccumulator {
    name: String,
    null_count: usize,
    non_null: usize,
    type_counts: HashMap<ColumnType, usize>,
    distinct: HashSet<String>,
    distinct_capped: bool,
    samples: Vec<String>,
}

impl ColumnAccumulator {
    fn new(name: String) -> Self {
        Self {
            name,
            null_count: 0,
            non_null: 0,
            type_counts: HashMap::new(),
            distinct: HashSet::new(),
            distinct_capped: false,
            samples: Vec::new(),
        }
    }

    fn observe(&mut self, value: &str, sample_size: usize) {
        let Some(value) = DataCleaner::normalize_null(value) else {
            self.null_count += 1;
            return;
        };
        self.non_null += 1;
        *self.type_counts.entry(DataCleaner::classify(value)).or_insert(0) += 1;

        if !self.distinct.contains(value) {
            if self.samples.len() < sample_size {
                self.samples.push(value.to_string());
            }
            if self.distinct.len() < DISTINCT_CAP {
                self.distinct.insert(value.to_string());
            } else {
                self.distinct_capped = true;
            }
        }
    }

    /// 类型推断: 非空值中 ≥90% 一致的最具体类型
    fn infer_type(&self) -> ColumnType {
        if self.non_null == 0 {
            return ColumnType::Empty;
        }
        let count = |t: ColumnType| self.type_counts.get(&t).copied().unwrap_or(0);
        let agrees = |n: usize| n as f64 >= self.non_null as f64 * TYPE_AGREEMENT;

        let integers = count(ColumnType::Integer);
        let dates = count(ColumnType::Date);
        if agrees(integers) {
            ColumnType::Integer
        } else if agrees(integers + count(ColumnType::Decimal)) {
            ColumnType::Decimal
        } else if agrees(count(ColumnType::Boolean)) {
            ColumnType::Boolean
        } else if agrees(dates) {
            ColumnType::Date
        } else if agrees(dates + count(ColumnType::DateTime)) {
            ColumnType::DateTime
        } else if agrees(count(ColumnType::Email)) {
            ColumnType::Email
        } else {
            ColumnType::Text
        }
    }

    fn into_profile(self, position: usize) -> ColumnProfile {
        let inferred_type = self.infer_type();
        ColumnProfile {
            position,
            name: self.name,
            inferred_type,
            null_count: self.null_count,
            distinct_count: self.distinct.len(),
            distinct_capped: self.distinct_capped,
            sample_values: self.samples,
        }
    }
}

// ==========================================
// FileAnalyzer
// ==========================================
pub struct FileAnalyzer {
    parser: UniversalFileParser,
    sample_size: usize,
    detect_threshold: f64,
}

impl FileAnalyzer {
    pub fn new(sample_size: usize, detect_threshold: f64) -> Self {
        Self {
            parser: UniversalFileParser,
            sample_size,
            detect_threshold,
        }
    }

    /// 分析文件
    ///
    /// # 参数
    /// - file_name: 文件名或 blob key（用于格式判断）
    /// - bytes: 文件内容
    /// - encoding_hint: 调用方声明的编码
    /// - registry: 源系统签名注册表
    ///
    /// # 返回
    /// - Ok(AnalysisResult): 列画像 + 记录数 + 畸形行数 + 源系统识别
    /// - Err(UnsupportedFormat / EmptyInput)
    pub fn analyze(
        &self,
        file_name: &str,
        bytes: Arc<[u8]>,
        encoding_hint: Option<&str>,
        registry: &SourceSystemRegistry,
    ) -> ImportResult<AnalysisResult> {
        let parsed = self.parser.open(file_name, bytes, encoding_hint)?;
        let format = parsed.format.to_string();
        let encoding = parsed.encoding.clone();
        let headers = parsed.headers.clone();

        let mut columns: Vec<ColumnAccumulator> = headers
            .iter()
            .map(|h| ColumnAccumulator::new(h.clone()))
            .collect();
        let mut record_count = 0usize;
        let mut parse_error_count = 0usize;

        for row in parsed.rows {
            match row {
                Ok(row) => {
                    record_count += 1;
                    for (acc, (_, value)) in columns.iter_mut().zip(row.fields.iter()) {
                        acc.observe(value, self.sample_size);
                    }
                }
                Err(e) => {
                    parse_error_count += 1;
                    debug!(row = e.row_number, reason = %e.message, "跳过畸形行");
                }
            }
        }

        if record_count == 0 {
            return Err(ImportError::EmptyInput(format!(
                "表头之后没有有效数据行（畸形行 {} 条）",
                parse_error_count
            )));
        }
        if parse_error_count > 0 {
            warn!(
                file = file_name,
                parse_errors = parse_error_count,
                "部分行解析失败，已跳过并计数"
            );
        }

        let source_system = registry.detect(&headers, self.detect_threshold);
        let profiles: Vec<ColumnProfile> = columns
            .into_iter()
            .enumerate()
            .map(|(idx, acc)| acc.into_profile(idx))
            .collect();

        info!(
            file = file_name,
            format = %format,
            encoding = %encoding,
            columns = profiles.len(),
            records = record_count,
            source_system = %source_system.system,
            confidence = source_system.confidence,
            "文件分析完成"
        );

        Ok(AnalysisResult {
            profiles,
            record_count,
            parse_error_count,
            source_system,
            format,
            encoding,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analyze(csv: &str) -> ImportResult<AnalysisResult> {
        FileAnalyzer::new(5, 0.5).analyze(
            "upload.csv",
            Arc::from(csv.as_bytes()),
            None,
            &SourceSystemRegistry::with_builtin(),
        )
    }

    #[test]
    fn test_profiles_types_nulls_and_samples() {
        let mut csv = String::from("Report_Key,Report_Date,Incident_Type,Amount,Email\n");
        for i in 0..20 {
            let amount = if i == 3 { "N/A".to_string() } else { format!("{}.5", i) };
            csv.push_str(&format!(
                "R{},01/{:02}/2024,{},{},user{}@example.com\n",
                i,
                (i % 28) + 1,
                if i % 2 == 0 { "Harassment" } else { "Theft" },
                amount,
                i
            ));
        }
        let result = analyze(&csv).unwrap();
        assert_eq!(result.record_count, 20);
        assert_eq!(result.parse_error_count, 0);

        let by_name = |n: &str| result.profiles.iter().find(|p| p.name == n).unwrap();
        assert_eq!(by_name("Report_Date").inferred_type, ColumnType::Date);
        assert_eq!(by_name("Incident_Type").inferred_type, ColumnType::Text);
        assert_eq!(by_name("Incident_Type").distinct_count, 2);
        assert_eq!(by_name("Amount").inferred_type, ColumnType::Decimal);
        assert_eq!(by_name("Amount").null_count, 1);
        assert_eq!(by_name("Email").inferred_type, ColumnType::Email);
        assert_eq!(by_name("Report_Key").sample_values.len(), 5);
    }

    #[test]
    fn test_ninety_percent_rule_falls_back_to_text() {
        let mut csv = String::from("code\n");
        for i in 0..8 {
            csv.push_str(&format!("{}\n", i));
        }
        csv.push_str("abc\nxyz\n");
        let result = analyze(&csv).unwrap();
        // 8/10 为整数，未达 90%
        assert_eq!(result.profiles[0].inferred_type, ColumnType::Text);
    }

    #[test]
    fn test_malformed_rows_counted_not_fatal() {
        let result = analyze("a,b\n1,2\n3\n4,5\n").unwrap();
        assert_eq!(result.record_count, 2);
        assert_eq!(result.parse_error_count, 1);
    }

    #[test]
    fn test_header_only_is_empty_input() {
        assert!(matches!(analyze("a,b\n"), Err(ImportError::EmptyInput(_))));
    }

    #[test]
    fn test_source_system_detection() {
        let registry = SourceSystemRegistry::with_builtin();
        let headers: Vec<String> = [
            "Report_Key", "Report_Date", "Incident_Type", "Location", "Status", "Summary",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        let guess = registry.detect(&headers, 0.5);
        assert_eq!(guess.system, "ethicspoint");
        assert!(guess.confidence >= 0.5);

        let guess = registry.detect(&["foo".to_string(), "bar".to_string()], 0.5);
        assert_eq!(guess.system, CUSTOM_SOURCE_SYSTEM);

        registry.register("legacy_crm", ["foo", "bar"]).unwrap();
        let guess = registry.detect(&["foo".to_string(), "bar".to_string()], 0.5);
        assert_eq!(guess.system, "legacy_crm");
        assert!((guess.confidence - 1.0).abs() < 1e-9);
    }
}
