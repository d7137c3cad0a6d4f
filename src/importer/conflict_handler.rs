// ==========================================
// 数据迁移导入引擎 - 冲突处理器实现
// ==========================================
// 职责: 推导源记录 ID / 检测文件内重复源记录 ID
// 跨作业重复由目标存储的自然键唯一约束处理（跳过或增量更新）
// ==========================================

use crate::domain::record::TransformedRecord;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// 无键字段时的源记录 ID 前缀
const HASH_ID_PREFIX: &str = "sha256:";

#[derive(Debug, Default)]
pub struct ConflictHandler {
    first_occurrence: HashMap<String, usize>, // 源记录 ID → 首次出现行号
}

impl ConflictHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// 推导源记录 ID
    ///
    /// # 规则
    /// - 键字段有值: 取转换后的键字段值
    /// - 否则: 规范化源行的 SHA-256
    pub fn source_record_id(record: &TransformedRecord, key_field: Option<&str>) -> String {
        if let Some(value) = key_field.and_then(|k| record.target.get(k)) {
            match value {
                Value::Null => {}
                Value::String(s) if s.trim().is_empty() => {}
                Value::String(s) => return s.trim().to_string(),
                other => return other.to_string(),
            }
        }
        // BTreeMap 序列化按键排序，结果与列顺序无关
        let canonical = serde_json::to_string(&record.source).unwrap_or_default();
        let digest = Sha256::digest(canonical.as_bytes());
        let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
        format!("{}{}", HASH_ID_PREFIX, hex)
    }

    /// 流式登记
    ///
    /// # 返回
    /// - None: 首次出现
    /// - Some(首次行号): 重复
    pub fn observe(&mut self, source_record_id: &str, row_number: usize) -> Option<usize> {
        match self.first_occurrence.get(source_record_id) {
            Some(first) => Some(*first),
            None => {
                self.first_occurrence
                    .insert(source_record_id.to_string(), row_number);
                None
            }
        }
    }

    /// 检测同批次内重复
    ///
    /// # 返回
    /// - Vec<(行号, 源记录 ID)>: 重复记录列表（不包括第一次出现）
    pub fn detect_duplicates<'a, I>(&mut self, records: I) -> Vec<(usize, String)>
    where
        I: IntoIterator<Item = (usize, &'a str)>,
    {
        records
            .into_iter()
            .filter_map(|(row, id)| self.observe(id, row).map(|_| (row, id.to_string())))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};
    use std::collections::BTreeMap;

    fn record(target: Value, source: &[(&str, &str)]) -> TransformedRecord {
        TransformedRecord {
            row_number: 1,
            source: source
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
            target: target.as_object().cloned().unwrap_or_else(Map::new),
            applied: vec![],
            failures: vec![],
        }
    }

    #[test]
    fn test_source_record_id_from_key_field() {
        let rec = record(json!({"case_number": " C-1 "}), &[("Report_Key", "C-1")]);
        assert_eq!(ConflictHandler::source_record_id(&rec, Some("case_number")), "C-1");

        let numeric = record(json!({"case_number": 42}), &[]);
        assert_eq!(ConflictHandler::source_record_id(&numeric, Some("case_number")), "42");
    }

    #[test]
    fn test_source_record_id_hash_fallback_is_order_independent() {
        let a = record(json!({"case_number": null}), &[("A", "1"), ("B", "2")]);
        let b = record(json!({}), &[("B", "2"), ("A", "1")]);
        let id_a = ConflictHandler::source_record_id(&a, Some("case_number"));
        let id_b = ConflictHandler::source_record_id(&b, None);
        assert!(id_a.starts_with(HASH_ID_PREFIX));
        assert_eq!(id_a, id_b);
    }

    #[test]
    fn test_detect_duplicates() {
        let mut handler = ConflictHandler::new();
        let dups = handler.detect_duplicates(vec![(1, "R1"), (2, "R2"), (3, "R1"), (4, "R1")]);
        assert_eq!(dups, vec![(3, "R1".to_string()), (4, "R1".to_string())]);
        assert_eq!(handler.observe("R2", 9), Some(2));
    }
}
