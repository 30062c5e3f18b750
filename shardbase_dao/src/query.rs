//! Query shapes that can run on any single shard.
use crate::{DaoError, ShardDao};

/// One shard-local query. The fan-out executor runs the same value on every
/// shard it targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShardQuery {
    Get { id: String },
    ByUniqueField { field: String, value: String },
    ByField { field: String, value: String },
    /// Rows whose `field` equals any of `values`.
    ByFieldIn { field: String, values: Vec<String> },
    All,
}

impl ShardQuery {
    pub fn get(id: impl Into<String>) -> Self {
        Self::Get { id: id.into() }
    }

    pub fn by_unique_field(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self::ByUniqueField { field: field.into(), value: value.into() }
    }

    pub fn by_field(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self::ByField { field: field.into(), value: value.into() }
    }

    pub fn by_field_in(field: impl Into<String>, values: Vec<String>) -> Self {
        Self::ByFieldIn { field: field.into(), values }
    }

    /// Cache key for single-result shapes.
    ///
    /// The field name is length-prefixed so `:` inside a field or value
    /// cannot make two lookups share a key.
    pub fn cache_key(&self) -> Option<String> {
        match self {
            Self::Get { id } => Some(format!("id:{id}")),
            Self::ByUniqueField { field, value } => Some(format!("unique:{}:{field}:{value}", field.len())),
            _ => None,
        }
    }

    /// First matching row on `dao`.
    pub async fn unique<E: Send + Sync>(&self, dao: &dyn ShardDao<E>) -> Result<Option<E>, DaoError> {
        match self {
            Self::Get { id } => dao.get(id).await,
            Self::ByUniqueField { field, value } => dao.find_by_unique_field(field, value).await,
            _ => Ok(self.list(dao, 1).await?.into_iter().next()),
        }
    }

    /// Up to `limit` matching rows on `dao`.
    pub async fn list<E: Send + Sync>(&self, dao: &dyn ShardDao<E>, limit: usize) -> Result<Vec<E>, DaoError> {
        match self {
            Self::Get { id } => Ok(dao.get(id).await?.into_iter().collect()),
            Self::ByUniqueField { field, value } => Ok(dao.find_by_unique_field(field, value).await?.into_iter().collect()),
            Self::ByField { field, value } => dao.find_by_field(field, value, limit).await,
            Self::ByFieldIn { field, values } => {
                let mut rows = Vec::new();
                for value in values {
                    if rows.len() >= limit {
                        break;
                    }
                    rows.extend(dao.find_by_field(field, value, limit - rows.len()).await?);
                }
                Ok(rows)
            }
            Self::All => dao.find_all(limit).await,
        }
    }
}
