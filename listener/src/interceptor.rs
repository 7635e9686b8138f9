use crate::listener::ListenerInfo;
use crate::types::ConsumerRecord;

/// Hooks around per-record dispatch. `early` runs outside any transaction,
/// `intercept` inside it; returning `None` from either acknowledges and
/// skips the record.
pub trait RecordInterceptor: Send + Sync {
    fn early(&self, record: ConsumerRecord, _info: &ListenerInfo) -> Option<ConsumerRecord> {
        Some(record)
    }

    fn intercept(&self, record: ConsumerRecord, _info: &ListenerInfo) -> Option<ConsumerRecord> {
        Some(record)
    }

    fn success(&self, _record: &ConsumerRecord, _info: &ListenerInfo) {}

    fn failure(&self, _record: &ConsumerRecord, _error: &anyhow::Error, _info: &ListenerInfo) {}

    /// Runs after each record regardless of outcome, outside the
    /// transaction.
    fn after_record(&self, _record: &ConsumerRecord, _info: &ListenerInfo) {}
}

/// Batch-shaped variant of [`RecordInterceptor`]. Returning `None` from
/// `intercept` skips (and acknowledges) the whole batch.
pub trait BatchInterceptor: Send + Sync {
    fn intercept(
        &self,
        records: Vec<ConsumerRecord>,
        _info: &ListenerInfo,
    ) -> Option<Vec<ConsumerRecord>> {
        Some(records)
    }

    fn success(&self, _records: &[ConsumerRecord], _info: &ListenerInfo) {}

    fn failure(&self, _records: &[ConsumerRecord], _error: &anyhow::Error, _info: &ListenerInfo) {}
}
