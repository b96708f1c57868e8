use std::sync::Arc;

use cellsim_core::{Calendar, ObjectId, Phase};
use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};

/// Keeps `events` timers rearming with delays spread over twice the horizon.
fn bench_rearming_timers(c: &mut Criterion) {
    let mut group = c.benchmark_group("calendar_rearm");
    for events in [64u32, 1024, 16_384] {
        group.bench_with_input(BenchmarkId::from_parameter(events), &events, |b, &events| {
            let horizon = 1024;
            let mut calendar = Calendar::new(horizon).unwrap();
            let owner = ObjectId::new(0);
            let name: Arc<str> = Arc::from("bench");
            for key in 0..events {
                let event = calendar.allocate(owner, name.clone(), key);
                calendar
                    .schedule(event, u64::from(key) % (2 * horizon as u64), Phase::Early)
                    .unwrap();
            }

            b.iter(|| {
                calendar
                    .advance(|calendar, activation| {
                        if let cellsim_core::Trigger::Event(event) = activation.trigger {
                            let delay = 1 + u64::from(activation.key) % (2 * horizon as u64);
                            calendar.schedule(event, delay, Phase::Early)?;
                        }
                        Ok(())
                    })
                    .unwrap();
            });
        });
    }
    group.finish();
}

fn bench_cancel_and_reschedule(c: &mut Criterion) {
    c.bench_function("calendar_cancel_reschedule", |b| {
        let mut calendar = Calendar::new(256).unwrap();
        let event = calendar.allocate(ObjectId::new(0), Arc::from("bench"), 0);
        b.iter(|| {
            calendar.schedule(event, 100, Phase::Late).unwrap();
            calendar.cancel(event).unwrap();
        });
    });
}

criterion_group!(benches, bench_rearming_timers, bench_cancel_and_reschedule);
criterion_main!(benches);
