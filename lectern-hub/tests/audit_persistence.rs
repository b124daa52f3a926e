//! Hub activity flowing through the queued recorder into RocksDB.

use std::sync::Arc;

use lectern_hub::audit::{AuditEvent, AuditStore, QueuedRecorder, StoreConfig};
use lectern_hub::hub::{Actor, Hub, HubConfig};
use lectern_hub::playback::PlayRequest;

#[tokio::test]
async fn test_session_activity_is_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("audit");
    let store = Arc::new(AuditStore::open(StoreConfig::for_testing(&path)).unwrap());

    let (recorder, writer) = QueuedRecorder::spawn(store.clone(), 64);
    let hub = Hub::with_recorder(HubConfig::default(), Arc::new(recorder));
    let teacher = Actor::teacher(1);

    hub.open_session(5).await;
    hub.join(5, 1, 10, "Teacher", true).await.unwrap();
    hub.join(5, 2, 20, "Student", false).await.unwrap();
    hub.chat(5, 2, "hi").await.unwrap();
    hub.select_audio(&teacher, 5, 3, Some("Track".into())).await.unwrap();
    hub.play_audio(&teacher, 5, PlayRequest::default()).await.unwrap();
    hub.seek_audio(&teacher, 5, 12.0).await.unwrap();
    hub.close_session(5).await;

    // Dropping the hub drops the last recorder handle; the writer drains.
    drop(hub);
    assert_eq!(writer.await.unwrap(), 8);

    let types: Vec<_> = store
        .events(5, None)
        .unwrap()
        .into_iter()
        .map(|r| r.event_type)
        .collect();
    assert_eq!(
        types,
        vec![
            AuditEvent::SessionCreated,
            AuditEvent::ParticipantJoined,
            AuditEvent::ParticipantJoined,
            AuditEvent::ChatMessage,
            AuditEvent::AudioSelected,
            AuditEvent::AudioPlay,
            AuditEvent::AudioSeek,
            AuditEvent::SessionEnded,
        ]
    );

    // Seeking while playing is audited as a seek even though clients saw a play.
    let seeks = store.events(5, Some(AuditEvent::AudioSeek)).unwrap();
    assert_eq!(seeks[0].details["type"], "audio_play");
    assert_eq!(seeks[0].details["position"], 12.0);

    let summary = store.summary(5).unwrap();
    assert_eq!(summary.total_events, 8);
    assert!(summary.metadata.unwrap().ended);
}

#[tokio::test]
async fn test_sequence_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("audit");

    {
        let store = Arc::new(AuditStore::open(StoreConfig::for_testing(&path)).unwrap());
        let (recorder, writer) = QueuedRecorder::spawn(store.clone(), 16);
        let hub = Hub::with_recorder(HubConfig::default(), Arc::new(recorder));
        hub.open_session(1).await;
        hub.join(1, 1, 10, "A", false).await.unwrap();
        drop(hub);
        writer.await.unwrap();
        store.sync().unwrap();
    }

    let store = Arc::new(AuditStore::open(StoreConfig::for_testing(&path)).unwrap());
    let (recorder, writer) = QueuedRecorder::spawn(store.clone(), 16);
    let hub = Hub::with_recorder(HubConfig::default(), Arc::new(recorder));
    hub.open_session(1).await;
    drop(hub);
    writer.await.unwrap();

    let types: Vec<_> = store
        .events(1, None)
        .unwrap()
        .into_iter()
        .map(|r| r.event_type)
        .collect();
    assert_eq!(
        types,
        vec![
            AuditEvent::SessionCreated,
            AuditEvent::ParticipantJoined,
            AuditEvent::SessionCreated,
        ]
    );
    assert_eq!(store.sessions().unwrap().len(), 1);
}
