use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{ActiveValue, ColumnTrait, EntityTrait, ExprTrait, QueryFilter, QueryOrder};
use time::Date;

use super::{GatewayStorage, StorageResult};
use crate::entities;
use crate::entities::daily_metrics::Column;

#[derive(Debug, Clone, Copy, Default)]
pub struct DailyDelta {
    pub requests: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub latency_ms: i64,
}

impl GatewayStorage {
    /// Accumulate one request into the `(date, endpoint)` bucket. Concurrent
    /// writers race through `ON CONFLICT`, so the addition happens in SQL.
    pub async fn bump_daily_metric(
        &self,
        date: Date,
        endpoint: &str,
        delta: DailyDelta,
    ) -> StorageResult<()> {
        let active = entities::daily_metrics::ActiveModel {
            date: ActiveValue::Set(date),
            endpoint: ActiveValue::Set(endpoint.to_string()),
            request_count: ActiveValue::Set(delta.requests),
            total_input_tokens: ActiveValue::Set(delta.input_tokens),
            total_output_tokens: ActiveValue::Set(delta.output_tokens),
            total_latency_ms: ActiveValue::Set(delta.latency_ms),
        };

        let conflict = OnConflict::columns([Column::Date, Column::Endpoint])
            .value(
                Column::RequestCount,
                Expr::col((entities::DailyMetrics, Column::RequestCount)).add(delta.requests),
            )
            .value(
                Column::TotalInputTokens,
                Expr::col((entities::DailyMetrics, Column::TotalInputTokens))
                    .add(delta.input_tokens),
            )
            .value(
                Column::TotalOutputTokens,
                Expr::col((entities::DailyMetrics, Column::TotalOutputTokens))
                    .add(delta.output_tokens),
            )
            .value(
                Column::TotalLatencyMs,
                Expr::col((entities::DailyMetrics, Column::TotalLatencyMs)).add(delta.latency_ms),
            )
            .to_owned();

        entities::DailyMetrics::insert(active)
            .on_conflict(conflict)
            .exec(&self.db)
            .await?;
        Ok(())
    }

    pub async fn daily_metrics(
        &self,
        from: Option<Date>,
        to: Option<Date>,
        endpoint: Option<&str>,
    ) -> StorageResult<Vec<entities::daily_metrics::Model>> {
        let mut query = entities::DailyMetrics::find()
            .order_by_asc(Column::Date)
            .order_by_asc(Column::Endpoint);
        if let Some(from) = from {
            query = query.filter(Column::Date.gte(from));
        }
        if let Some(to) = to {
            query = query.filter(Column::Date.lte(to));
        }
        if let Some(endpoint) = endpoint {
            query = query.filter(Column::Endpoint.eq(endpoint));
        }
        Ok(query.all(&self.db).await?)
    }
}
