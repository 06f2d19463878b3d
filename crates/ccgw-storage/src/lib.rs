pub mod codec;
pub mod entities;
mod store;

pub use store::{
    decode_endpoints, ApiKeyPatch, ApiKeySnapshot, AuditEntry, AuditPage, DailyDelta,
    GatewayStorage, KeyUsageRow, LogFilter, LogPage, ModelStatRow, NewApiKey, NewRequestLog,
    RequestLogDetail, RequestLogFinal, StatsOverview, StorageError, StorageResult,
};
