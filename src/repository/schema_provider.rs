// ==========================================
// 数据迁移导入引擎 - 目标模式提供者
// ==========================================
// 职责: 由目标领域提供字段描述与引用存在性查询
// ==========================================

use crate::domain::schema::TargetSchema;
use crate::repository::error::{RepositoryError, RepositoryResult};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::RwLock;

#[async_trait]
pub trait TargetSchemaProvider: Send + Sync {
    /// 目标实体类型的模式（未知类型返回 None）
    async fn schema(&self, entity_type: &str) -> RepositoryResult<Option<TargetSchema>>;

    /// 引用存在性查询（exists-by-id）
    async fn exists_by_id(&self, entity_type: &str, id: &str) -> RepositoryResult<bool>;
}

// ==========================================
// StaticSchemaProvider - 注册式实现
// ==========================================
#[derive(Default)]
pub struct StaticSchemaProvider {
    schemas: RwLock<HashMap<String, TargetSchema>>,
    references: RwLock<HashMap<String, HashSet<String>>>,
}

impl StaticSchemaProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// 从 JSON 文件加载模式列表（数组）
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> RepositoryResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        let schemas: Vec<TargetSchema> = serde_json::from_str(&raw)?;
        let provider = Self::new();
        for schema in schemas {
            provider.register_schema(schema)?;
        }
        Ok(provider)
    }

    pub fn register_schema(&self, schema: TargetSchema) -> RepositoryResult<()> {
        let mut schemas = self
            .schemas
            .write()
            .map_err(|e| RepositoryError::LockError(e.to_string()))?;
        schemas.insert(schema.entity_type.clone(), schema);
        Ok(())
    }

    /// 登记某实体类型的已存在 ID
    pub fn register_reference_ids<I, S>(&self, entity_type: &str, ids: I) -> RepositoryResult<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut references = self
            .references
            .write()
            .map_err(|e| RepositoryError::LockError(e.to_string()))?;
        references
            .entry(entity_type.to_string())
            .or_default()
            .extend(ids.into_iter().map(Into::into));
        Ok(())
    }
}

#[async_trait]
impl TargetSchemaProvider for StaticSchemaProvider {
    async fn schema(&self, entity_type: &str) -> RepositoryResult<Option<TargetSchema>> {
        let schemas = self
            .schemas
            .read()
            .map_err(|e| RepositoryError::LockError(e.to_string()))?;
        Ok(schemas.get(entity_type).cloned())
    }

    async fn exists_by_id(&self, entity_type: &str, id: &str) -> RepositoryResult<bool> {
        let references = self
            .references
            .read()
            .map_err(|e| RepositoryError::LockError(e.to_string()))?;
        Ok(references
            .get(entity_type)
            .map(|ids| ids.contains(id))
            .unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::schema::{FieldType, TargetField};

    #[tokio::test]
    async fn test_register_and_lookup() {
        let provider = StaticSchemaProvider::new();
        provider
            .register_schema(TargetSchema {
                entity_type: "case".to_string(),
                fields: vec![TargetField::new("title", FieldType::Text).required()],
                key_field: None,
                business_rules: vec![],
                depends_on: vec![],
            })
            .unwrap();
        provider
            .register_reference_ids("employee", ["E1", "E2"])
            .unwrap();

        assert!(provider.schema("case").await.unwrap().is_some());
        assert!(provider.schema("policy").await.unwrap().is_none());
        assert!(provider.exists_by_id("employee", "E1").await.unwrap());
        assert!(!provider.exists_by_id("employee", "E9").await.unwrap());
    }
}
