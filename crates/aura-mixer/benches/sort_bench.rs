//! Priority sort benchmarks

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use glam::Vec3;

use aura_avatars::TraitMap;
use aura_core::{Clock, NodeId, Timestamp};
use aura_mixer::{
    priority_score, sort_and_throttle, CandidateSnapshot, ClientData, Registry, ViewFrustum,
};
use aura_registry::{NodeFlags, NodeKind};

fn build_candidates(count: usize) -> Vec<CandidateSnapshot> {
    let registry = Registry::new(Clock::new());
    (0..count)
        .map(|i| {
            let node = registry
                .add_or_update(NodeId::random(), NodeKind::Agent, None, NodeFlags::default())
                .unwrap();
            node.client_or_init(|| ClientData::new(node.id(), node.local_id()));
            let angle = i as f32 * 0.37;
            CandidateSnapshot {
                node_id: node.id(),
                local_id: node.local_id(),
                node,
                position: Vec3::new(angle.cos() * 20.0, 0.0, angle.sin() * 20.0),
                bounding_radius: 0.5 + (i % 7) as f32 * 0.1,
                last_updated: Timestamp::from_micros(1_000 + (i as u64 * 900) % 50_000),
                identity_sequence: 1,
                identity_bytes: Arc::new(vec![0u8; 64]),
                data: Arc::new(vec![0u8; 350]),
                traits: Arc::new(TraitMap::new()),
            }
        })
        .collect()
}

fn bench_priority_sort(c: &mut Criterion) {
    let candidates = build_candidates(200);
    let now = Timestamp::from_micros(100_000);
    let view = ViewFrustum {
        origin: Vec3::ZERO,
        direction: Vec3::new(1.0, 0.0, 0.0),
    };
    let weights = (1.0, 0.25, 1.0);

    c.bench_function("score_200_candidates", |b| {
        b.iter(|| {
            let scored: Vec<f32> = candidates
                .iter()
                .map(|snap| priority_score(Vec3::ZERO, Some(&view), snap, now, weights))
                .collect();
            black_box(scored)
        })
    });

    c.bench_function("sort_and_throttle_200", |b| {
        b.iter(|| {
            let scored: Vec<_> = candidates
                .iter()
                .map(|snap| {
                    (
                        priority_score(Vec3::ZERO, Some(&view), snap, now, weights),
                        snap.clone(),
                    )
                })
                .collect();
            black_box(sort_and_throttle(scored, 0.2))
        })
    });
}

criterion_group!(benches, bench_priority_sort);
criterion_main!(benches);
