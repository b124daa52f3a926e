//! Bounded hand-off between the hub and a blocking audit sink.

use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

use super::{AuditRecord, EventRecorder, StoreError};

/// Default number of records buffered before new ones are dropped.
pub const DEFAULT_AUDIT_QUEUE: usize = 1024;

/// Durable destination for audit records.
pub trait AuditSink: Send + Sync + 'static {
    fn write(&self, record: &AuditRecord) -> Result<(), StoreError>;
}

/// Recorder that queues records for a background writer task.
pub struct QueuedRecorder {
    sender: mpsc::Sender<AuditRecord>,
}

impl QueuedRecorder {
    /// Spawn the writer task on the current tokio runtime.
    ///
    /// The task ends once every `QueuedRecorder` handle is dropped and the
    /// queue has been flushed.
    pub fn spawn(sink: Arc<dyn AuditSink>, capacity: usize) -> (Self, JoinHandle<u64>) {
        let (sender, mut receiver) = mpsc::channel::<AuditRecord>(capacity.max(1));
        let handle = tokio::spawn(async move {
            let mut written = 0u64;
            while let Some(record) = receiver.recv().await {
                match sink.write(&record) {
                    Ok(()) => written += 1,
                    Err(e) => log::error!(
                        "Failed to persist {} for session {}: {e}",
                        record.event_type.as_str(),
                        record.session_id
                    ),
                }
            }
            log::debug!("Audit writer stopped after {written} records");
            written
        });
        (Self { sender }, handle)
    }
}

impl EventRecorder for QueuedRecorder {
    fn record_event(&self, record: AuditRecord) {
        match self.sender.try_send(record) {
            Ok(()) => {}
            Err(TrySendError::Full(record)) => log::warn!(
                "Audit queue full: dropped {} for session {}",
                record.event_type.as_str(),
                record.session_id
            ),
            Err(TrySendError::Closed(record)) => log::warn!(
                "Audit writer gone: dropped {} for session {}",
                record.event_type.as_str(),
                record.session_id
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditEvent;
    use serde_json::Value;
    use std::sync::Mutex;

    #[derive(Default)]
    struct VecSink {
        records: Mutex<Vec<AuditRecord>>,
        fail_on: Option<AuditEvent>,
    }

    impl AuditSink for VecSink {
        fn write(&self, record: &AuditRecord) -> Result<(), StoreError> {
            if self.fail_on == Some(record.event_type) {
                return Err(StoreError::Database("disk on fire".into()));
            }
            self.records.lock().unwrap().push(record.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_records_reach_sink_in_order() {
        let sink = Arc::new(VecSink::default());
        let (recorder, handle) = QueuedRecorder::spawn(sink.clone(), 16);
        recorder.record_event(AuditRecord::new(1, AuditEvent::SessionCreated, None, Value::Null));
        recorder.record_event(AuditRecord::new(1, AuditEvent::AudioPlay, Some(2), Value::Null));
        drop(recorder);

        assert_eq!(handle.await.unwrap(), 2);
        let types: Vec<_> = sink.records.lock().unwrap().iter().map(|r| r.event_type).collect();
        assert_eq!(types, vec![AuditEvent::SessionCreated, AuditEvent::AudioPlay]);
    }

    #[tokio::test]
    async fn test_sink_failure_is_not_fatal() {
        let sink = Arc::new(VecSink {
            fail_on: Some(AuditEvent::HandRaised),
            ..VecSink::default()
        });
        let (recorder, handle) = QueuedRecorder::spawn(sink.clone(), 16);
        recorder.record_event(AuditRecord::new(1, AuditEvent::HandRaised, None, Value::Null));
        recorder.record_event(AuditRecord::new(1, AuditEvent::HandLowered, None, Value::Null));
        drop(recorder);

        assert_eq!(handle.await.unwrap(), 1);
        assert_eq!(sink.records.lock().unwrap().len(), 1);
    }
}
