use std::collections::HashSet;
use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};
use lectern_hub::hub::{Actor, Hub, HubConfig};
use lectern_hub::playback::PlayRequest;
use lectern_hub::protocol::{Frame, HubEvent};
use lectern_hub::ChannelReceiver;

fn play_event() -> HubEvent {
    HubEvent::AudioPlay {
        audio_id: 7,
        speed: 1.25,
        position: 42.5,
        title: Some("Listening exercise 3".to_string()),
        duration: Some(180.0),
    }
}

async fn classroom(hub: &Hub, students: u64) -> Vec<ChannelReceiver> {
    hub.open_session(1).await;
    let mut receivers = Vec::new();
    receivers.push(hub.connect(1, 0, 1000, "Teacher", true).await.unwrap());
    for i in 1..=students {
        receivers.push(
            hub.connect(1, i, 1000 + i, format!("Student{i}"), false)
                .await
                .unwrap(),
        );
    }
    receivers
}

fn bench_event_encode(c: &mut Criterion) {
    c.bench_function("event_encode_audio_play", |b| {
        b.iter(|| {
            black_box(Frame::encode(black_box(play_event())).unwrap());
        })
    });
}

fn bench_broadcast_100_channels(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("broadcast_100_channels", |b| {
        b.iter(|| {
            rt.block_on(async {
                let hub = Hub::default();
                let mut receivers = classroom(&hub, 99).await;
                let report = hub.broadcast(1, play_event(), &HashSet::new()).await;
                black_box(report);
                for rx in &mut receivers {
                    black_box(rx.drain());
                }
            })
        })
    });
}

fn bench_playback_1000_transitions(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("playback_1000_transitions_30_channels", |b| {
        b.iter(|| {
            rt.block_on(async {
                let hub = Hub::new(HubConfig {
                    channel_capacity: 2048,
                    ..HubConfig::default()
                });
                let mut receivers = classroom(&hub, 29).await;
                let teacher = Actor::teacher(0);
                hub.select_audio(&teacher, 1, 7, None).await.unwrap();
                for i in 0..1000u32 {
                    let position = f64::from(i);
                    if i % 2 == 0 {
                        hub.play_audio(&teacher, 1, PlayRequest::from_position(position))
                            .await
                            .unwrap();
                    } else {
                        hub.pause_audio(&teacher, 1, position).await.unwrap();
                    }
                }
                for rx in &mut receivers {
                    black_box(rx.drain());
                }
            })
        })
    });
}

fn bench_saturated_channel(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    // One consumer never drains: every broadcast after the first 8 drops
    // for it without slowing the others.
    c.bench_function("broadcast_with_saturated_consumer", |b| {
        b.iter(|| {
            rt.block_on(async {
                let hub = Hub::new(HubConfig {
                    channel_capacity: 8,
                    ..HubConfig::default()
                });
                let mut receivers = classroom(&hub, 9).await;
                let stalled = receivers.remove(1);
                for _ in 0..100 {
                    hub.broadcast(1, play_event(), &HashSet::new()).await;
                    for rx in &mut receivers {
                        rx.drain();
                    }
                }
                black_box(stalled);
            })
        })
    });
}

criterion_group!(
    benches,
    bench_event_encode,
    bench_broadcast_100_channels,
    bench_playback_1000_transitions,
    bench_saturated_channel,
);
criterion_main!(benches);
