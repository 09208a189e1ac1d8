use crate::models::audit::ForwardRecord;
use crate::store::postgres::PgStore;

/// Audit trail for forwarded calls. Every record is emitted as a tracing
/// event; with a database attached it is also persisted by a detached task
/// so the response path never waits on the insert.
#[derive(Clone, Default)]
pub struct AuditLog {
    db: Option<PgStore>,
}

impl AuditLog {
    pub fn new(db: Option<PgStore>) -> Self {
        Self { db }
    }

    pub fn is_persistent(&self) -> bool {
        self.db.is_some()
    }

    pub fn db(&self) -> Option<&PgStore> {
        self.db.as_ref()
    }

    pub fn record(&self, record: ForwardRecord) {
        tracing::info!(
            request_id = %record.request_id,
            backend = %record.target,
            method = %record.method,
            path = %record.path,
            status = ?record.status,
            outcome = record.outcome.label(),
            caller_id = record.caller_id.as_deref().unwrap_or("-"),
            processing_ms = record.processing_ms,
            cache_hit = record.cache_hit,
            "forward"
        );

        if let Some(db) = self.db.clone() {
            tokio::spawn(async move {
                if let Err(e) = db.insert_forward_log(&record).await {
                    tracing::error!(request_id = %record.request_id, "failed to write forward log: {}", e);
                } else {
                    tracing::debug!(request_id = %record.request_id, "forward log recorded");
                }
            });
        }
    }
}
