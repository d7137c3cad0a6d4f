// ==========================================
// 数据迁移导入引擎 - 映射模板仓储
// ==========================================
// 职责: mapping_template 表（租户级、按版本不可变）
// 约束: 只插入新版本，不更新已有版本
// ==========================================

use crate::domain::mapping::MappingTemplate;
use crate::repository::error::{RepositoryError, RepositoryResult};
use crate::repository::{format_timestamp, parse_timestamp};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::sync::{Arc, Mutex};

type TemplateRow = (String, i64, String, String, String, String, String, String, String);

const TEMPLATE_COLUMNS: &str = r#"
    template_id, version, tenant_id, name, source_system, target_entity_type,
    entries_json, value_maps_json, created_at
"#;

fn read_template_row(row: &Row) -> rusqlite::Result<TemplateRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
    ))
}

fn into_template(raw: TemplateRow) -> RepositoryResult<MappingTemplate> {
    let (template_id, version, tenant_id, name, source_system, target_entity_type, entries, maps, created_at) =
        raw;
    Ok(MappingTemplate {
        template_id,
        version,
        tenant_id,
        name,
        source_system,
        target_entity_type,
        entries: serde_json::from_str(&entries)?,
        value_maps: serde_json::from_str(&maps)?,
        created_at: parse_timestamp(&created_at)?,
    })
}

// ==========================================
// MappingTemplateRepository
// ==========================================
pub struct MappingTemplateRepository {
    conn: Arc<Mutex<Connection>>,
}

impl MappingTemplateRepository {
    pub fn new(conn: Arc<Mutex<Connection>>) -> RepositoryResult<Self> {
        let repo = Self { conn };
        repo.ensure_table()?;
        Ok(repo)
    }

    fn get_conn(&self) -> RepositoryResult<std::sync::MutexGuard<Connection>> {
        self.conn
            .lock()
            .map_err(|e| RepositoryError::LockError(e.to_string()))
    }

    fn ensure_table(&self) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS mapping_template (
              template_id TEXT NOT NULL,
              version INTEGER NOT NULL,
              tenant_id TEXT NOT NULL,
              name TEXT NOT NULL,
              source_system TEXT NOT NULL,
              target_entity_type TEXT NOT NULL,
              entries_json TEXT NOT NULL,
              value_maps_json TEXT NOT NULL,
              created_at TEXT NOT NULL,
              PRIMARY KEY (template_id, version)
            );
            CREATE INDEX IF NOT EXISTS idx_mapping_template_key
              ON mapping_template(tenant_id, source_system, target_entity_type);
            "#,
        )?;
        Ok(())
    }

    /// 当前最大版本号（模板不存在时为 0）
    pub fn latest_version(&self, template_id: &str) -> RepositoryResult<i64> {
        let conn = self.get_conn()?;
        let version: Option<i64> = conn.query_row(
            "SELECT MAX(version) FROM mapping_template WHERE template_id = ?1",
            params![template_id],
            |row| row.get(0),
        )?;
        Ok(version.unwrap_or(0))
    }

    /// 插入新版本（版本号冲突返回 UniqueConstraintViolation）
    pub fn insert(&self, template: &MappingTemplate) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            &format!(
                "INSERT INTO mapping_template ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                TEMPLATE_COLUMNS
            ),
            params![
                template.template_id,
                template.version,
                template.tenant_id,
                template.name,
                template.source_system,
                template.target_entity_type,
                serde_json::to_string(&template.entries)?,
                serde_json::to_string(&template.value_maps)?,
                format_timestamp(template.created_at),
            ],
        )?;
        Ok(())
    }

    /// 按 (id, 版本) 查询
    pub fn find(&self, template_id: &str, version: i64) -> RepositoryResult<Option<MappingTemplate>> {
        let raw = {
            let conn = self.get_conn()?;
            conn.query_row(
                &format!(
                    "SELECT {} FROM mapping_template WHERE template_id = ?1 AND version = ?2",
                    TEMPLATE_COLUMNS
                ),
                params![template_id, version],
                read_template_row,
            )
            .optional()?
        };
        raw.map(into_template).transpose()
    }

    /// 租户 + 源系统 + 目标实体 的最新模板
    pub fn find_latest_for(
        &self,
        tenant_id: &str,
        source_system: &str,
        target_entity_type: &str,
    ) -> RepositoryResult<Option<MappingTemplate>> {
        let raw = {
            let conn = self.get_conn()?;
            conn.query_row(
                &format!(
                    r#"
                    SELECT {} FROM mapping_template
                    WHERE tenant_id = ?1 AND source_system = ?2 AND target_entity_type = ?3
                    ORDER BY created_at DESC, version DESC
                    LIMIT 1
                    "#,
                    TEMPLATE_COLUMNS
                ),
                params![tenant_id, source_system, target_entity_type],
                read_template_row,
            )
            .optional()?
        };
        raw.map(into_template).transpose()
    }

    /// 租户模板列表（每个版本一行）
    pub fn list_by_tenant(&self, tenant_id: &str) -> RepositoryResult<Vec<MappingTemplate>> {
        let rows = {
            let conn = self.get_conn()?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM mapping_template WHERE tenant_id = ?1 ORDER BY template_id, version",
                TEMPLATE_COLUMNS
            ))?;
            let rows = stmt
                .query_map(params![tenant_id], read_template_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };
        rows.into_iter().map(into_template).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_shared_connection;
    use crate::domain::mapping::TemplateEntry;
    use chrono::Utc;
    use tempfile::NamedTempFile;

    fn template(version: i64) -> MappingTemplate {
        MappingTemplate {
            template_id: "TPL".to_string(),
            version,
            tenant_id: "T1".to_string(),
            name: "legacy cases".to_string(),
            source_system: "legacy_hr".to_string(),
            target_entity_type: "case".to_string(),
            entries: vec![TemplateEntry {
                source_column: "Incident_Type".to_string(),
                target_field: "category".to_string(),
                rule_id: None,
            }],
            value_maps: vec![],
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_versions_are_immutable() {
        let temp = NamedTempFile::new().unwrap();
        let conn = open_shared_connection(temp.path().to_str().unwrap()).unwrap();
        let repo = MappingTemplateRepository::new(conn).unwrap();

        assert_eq!(repo.latest_version("TPL").unwrap(), 0);
        repo.insert(&template(1)).unwrap();
        repo.insert(&template(2)).unwrap();
        assert_eq!(repo.latest_version("TPL").unwrap(), 2);

        // 同版本再次插入失败
        assert!(matches!(
            repo.insert(&template(2)),
            Err(RepositoryError::UniqueConstraintViolation(_))
        ));

        assert!(repo.find("TPL", 1).unwrap().is_some());
        let latest = repo.find_latest_for("T1", "legacy_hr", "case").unwrap().unwrap();
        assert_eq!(latest.version, 2);
        assert_eq!(repo.list_by_tenant("T1").unwrap().len(), 2);
    }
}
