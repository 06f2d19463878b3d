mod keys;
mod logs;
mod metrics;

pub use keys::{decode_endpoints, ApiKeyPatch, AuditEntry, AuditPage, NewApiKey};
pub use logs::{
    ApiKeySnapshot, KeyUsageRow, LogFilter, LogPage, ModelStatRow, NewRequestLog,
    RequestLogDetail, RequestLogFinal, StatsOverview,
};
pub use metrics::DailyDelta;

use sea_orm::{Database, DatabaseConnection, DbErr, Schema};
use time::OffsetDateTime;
use tracing::info;

use crate::entities;

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("db error: {0}")]
    Db(#[from] DbErr),
    #[error("payload codec error: {0}")]
    Codec(#[from] std::io::Error),
    #[error("serde json error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Façade over the embedded database. All SQL lives behind this type; the
/// rest of the gateway passes plain DTOs in and out.
#[derive(Clone)]
pub struct GatewayStorage {
    db: DatabaseConnection,
}

impl GatewayStorage {
    pub async fn connect(dsn: &str) -> StorageResult<Self> {
        let db = Database::connect(dsn).await?;
        Ok(Self { db })
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    /// Entity-first schema sync; doubles as migration bookkeeping.
    pub async fn sync(&self) -> StorageResult<()> {
        Schema::new(self.db.get_database_backend())
            .builder()
            .register(entities::ApiKeys)
            .register(entities::ApiKeyAuditLogs)
            .register(entities::RequestLogs)
            .register(entities::RequestPayloads)
            .register(entities::DailyMetrics)
            .register(entities::Events)
            .sync(&self.db)
            .await
            .map_err(StorageError::from)
    }

    /// Append a gateway lifecycle event.
    pub async fn append_event(
        &self,
        level: &str,
        kind: &str,
        message: &str,
        details: Option<serde_json::Value>,
    ) -> StorageResult<()> {
        use sea_orm::{ActiveValue, EntityTrait};
        let active = entities::events::ActiveModel {
            created_at: ActiveValue::Set(OffsetDateTime::now_utc()),
            level: ActiveValue::Set(level.to_string()),
            kind: ActiveValue::Set(kind.to_string()),
            message: ActiveValue::Set(message.to_string()),
            details: ActiveValue::Set(details.map(|value| value.to_string())),
            ..Default::default()
        };
        entities::Events::insert(active).exec(&self.db).await?;
        Ok(())
    }

    /// Drop request logs (payloads cascade) older than the cutoff.
    pub async fn delete_logs_before(&self, cutoff: OffsetDateTime) -> StorageResult<u64> {
        use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};
        let deleted = entities::RequestLogs::delete_many()
            .filter(entities::request_logs::Column::CreatedAt.lt(cutoff))
            .exec(&self.db)
            .await?
            .rows_affected;
        if deleted > 0 {
            info!(event = "log_retention_sweep", deleted);
        }
        Ok(deleted)
    }

    pub async fn clear_logs(&self) -> StorageResult<u64> {
        use sea_orm::EntityTrait;
        let deleted = entities::RequestLogs::delete_many()
            .exec(&self.db)
            .await?
            .rows_affected;
        entities::RequestPayloads::delete_many().exec(&self.db).await?;
        entities::DailyMetrics::delete_many().exec(&self.db).await?;
        Ok(deleted)
    }
}

#[cfg(test)]
pub(crate) async fn memory_storage() -> GatewayStorage {
    let storage = GatewayStorage::connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite");
    storage.sync().await.expect("schema sync");
    storage
}
