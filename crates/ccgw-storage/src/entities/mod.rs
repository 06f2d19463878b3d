pub mod api_key_audit_logs;
pub mod api_keys;
pub mod daily_metrics;
pub mod events;
pub mod request_logs;
pub mod request_payloads;

pub use api_key_audit_logs::Entity as ApiKeyAuditLogs;
pub use api_keys::Entity as ApiKeys;
pub use daily_metrics::Entity as DailyMetrics;
pub use events::Entity as Events;
pub use request_logs::Entity as RequestLogs;
pub use request_payloads::Entity as RequestPayloads;
