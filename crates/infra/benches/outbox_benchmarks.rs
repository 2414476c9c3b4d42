use criterion::{BatchSize, BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use async_trait::async_trait;
use chrono::Utc;
use courier_core::{AggregateId, AggregateRoot, EventId};
use courier_events::{
    ConsumerError, Event, EventConsumer, EventEnvelope, EventRegistry, EventSource, PendingEvents,
};
use courier_infra::outbox::{
    EventCapture, IdempotencyGuard, InMemoryOutboxStore, OutboxDispatcher, OutboxRecord,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ShipmentDispatched {
    id: EventId,
    shipment_id: AggregateId,
    carrier: String,
    parcels: u32,
}

impl Event for ShipmentDispatched {
    const EVENT_TYPE: &'static str = "logistics.shipment.dispatched";

    fn event_id(&self) -> EventId {
        self.id
    }
}

struct Shipment {
    id: AggregateId,
    pending: PendingEvents,
}

impl AggregateRoot for Shipment {
    type Id = AggregateId;

    fn id(&self) -> &AggregateId {
        &self.id
    }

    fn version(&self) -> u64 {
        0
    }
}

impl EventSource for Shipment {
    fn pending_events_mut(&mut self) -> &mut PendingEvents {
        &mut self.pending
    }
}

fn shipment_with_events(count: usize) -> Shipment {
    let mut shipment = Shipment {
        id: AggregateId::new(),
        pending: PendingEvents::new(),
    };
    for parcels in 0..count {
        let id = EventId::new();
        let shipment_id = shipment.id;
        shipment.pending.raise(ShipmentDispatched {
            id,
            shipment_id,
            carrier: "DHL".to_string(),
            parcels: parcels as u32,
        });
    }
    shipment
}

#[derive(Clone, Default)]
struct Tally {
    count: Arc<AtomicU64>,
}

#[async_trait]
impl EventConsumer<ShipmentDispatched> for Tally {
    fn name(&self) -> &str {
        "Tally"
    }

    async fn handle(&self, event: &EventEnvelope<ShipmentDispatched>) -> Result<(), ConsumerError> {
        self.count
            .fetch_add(u64::from(event.payload().parcels), Ordering::Relaxed);
        Ok(())
    }
}

fn seeded_store(count: usize) -> Arc<InMemoryOutboxStore> {
    let store = Arc::new(InMemoryOutboxStore::new());
    let shipment_id = AggregateId::new();
    for parcels in 0..count {
        let id = EventId::new();
        let payload = serde_json::to_string(&ShipmentDispatched {
            id,
            shipment_id,
            carrier: "DHL".to_string(),
            parcels: parcels as u32,
        })
        .unwrap();
        store
            .insert(OutboxRecord::pending(id, ShipmentDispatched::EVENT_TYPE, payload, Utc::now()))
            .unwrap();
    }
    store
}

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn bench_capture_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("capture_throughput");
    let rt = runtime();

    for event_count in [1usize, 10, 100].iter() {
        group.throughput(Throughput::Elements(*event_count as u64));
        group.bench_with_input(
            BenchmarkId::new("collect_write_commit", event_count),
            event_count,
            |b, &count| {
                b.iter_batched(
                    || (InMemoryOutboxStore::new(), shipment_with_events(count)),
                    |(store, mut shipment)| {
                        rt.block_on(async {
                            let mut tx = store.begin();
                            let mut capture = EventCapture::new();
                            capture.collect(&mut shipment).unwrap();
                            black_box(capture.write(&mut tx).await.unwrap());
                            tx.commit().unwrap();
                        })
                    },
                    BatchSize::SmallInput,
                );
            },
        );
    }

    group.finish();
}

fn bench_dispatch_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch_cycle");
    let rt = runtime();

    let mut registry = EventRegistry::new();
    registry
        .subscribe::<ShipmentDispatched, _>(Tally::default())
        .unwrap();
    let registry = Arc::new(registry);

    for batch_size in [1usize, 20, 100].iter() {
        group.throughput(Throughput::Elements(*batch_size as u64));
        group.bench_with_input(
            BenchmarkId::new("claim_deliver_complete", batch_size),
            batch_size,
            |b, &batch| {
                b.iter_batched(
                    || {
                        OutboxDispatcher::new(seeded_store(batch), registry.clone())
                            .with_batch_size(batch)
                    },
                    |dispatcher| {
                        rt.block_on(async {
                            let report = dispatcher
                                .run_dispatch_cycle(&CancellationToken::new())
                                .await
                                .unwrap();
                            black_box(report);
                        })
                    },
                    BatchSize::SmallInput,
                );
            },
        );
    }

    group.finish();
}

fn bench_guard_overhead(c: &mut Criterion) {
    let mut group = c.benchmark_group("idempotency_guard");
    let rt = runtime();
    let tally = Tally::default();
    let envelope = EventEnvelope::new(
        EventId::new(),
        ShipmentDispatched::EVENT_TYPE,
        Utc::now(),
        ShipmentDispatched {
            id: EventId::new(),
            shipment_id: AggregateId::new(),
            carrier: "DHL".to_string(),
            parcels: 1,
        },
    );

    group.bench_function("direct_handle", |b| {
        b.iter(|| rt.block_on(async { tally.handle(black_box(&envelope)).await.unwrap() }));
    });

    group.bench_function("guarded_first_application", |b| {
        let guard = IdempotencyGuard::new(Arc::new(InMemoryOutboxStore::new()));
        b.iter(|| {
            rt.block_on(async {
                guard
                    .apply_once(EventId::new(), "Tally", || tally.handle(&envelope))
                    .await
                    .unwrap()
            })
        });
    });

    group.bench_function("guarded_redelivery", |b| {
        let guard = IdempotencyGuard::new(Arc::new(InMemoryOutboxStore::new()));
        let id = EventId::new();
        rt.block_on(guard.apply_once(id, "Tally", || tally.handle(&envelope)))
            .unwrap();
        b.iter(|| {
            rt.block_on(async {
                guard
                    .apply_once(black_box(id), "Tally", || tally.handle(&envelope))
                    .await
                    .unwrap()
            })
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_capture_throughput,
    bench_dispatch_cycle,
    bench_guard_overhead
);
criterion_main!(benches);
