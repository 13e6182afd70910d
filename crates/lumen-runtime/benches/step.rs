use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use lumen_core::fixture::{build, FixtureConfig};
use lumen_core::{load_from_bytes, BackendKind, QuantKind};
use lumen_runtime::{InferenceSession, SessionConfig, WeightStorage};
use std::sync::Arc;

fn bench_step(c: &mut Criterion) {
    let mut group = c.benchmark_group("session_step");
    let mut cfg = FixtureConfig::small_gqa(QuantKind::Q8_0);
    cfg.context_length = 4096;
    let model = Arc::new(load_from_bytes(build(&cfg).unwrap()).unwrap());

    for kind in BackendKind::ALL {
        for storage in [WeightStorage::Native, WeightStorage::F32] {
            let config = SessionConfig::new(kind).with_weight_storage(storage);
            let mut session = match InferenceSession::from_config(Arc::clone(&model), &config) {
                Ok(s) => s,
                Err(e) => {
                    eprintln!("Skipping {}: {}", kind, e);
                    continue;
                }
            };
            let id = BenchmarkId::new(kind.name(), format!("{:?}", storage));
            group.bench_function(id, |b| {
                b.iter(|| {
                    if session.position() == session.context_length() {
                        session.reset();
                    }
                    session.step(black_box(3)).unwrap().len()
                })
            });
        }
    }
    group.finish();
}

criterion_group!(benches, bench_step);
criterion_main!(benches);
