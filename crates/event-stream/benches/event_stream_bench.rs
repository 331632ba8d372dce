use criterion::{Criterion, criterion_group, criterion_main};
use event_stream::{ConsumerGroup, EventStream, InMemoryEventStream, Partition, StartPosition};

fn bench_publish(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("event_stream/publish_single", |b| {
        b.iter(|| {
            rt.block_on(async {
                let stream = InMemoryEventStream::new(4);
                stream
                    .publish("order-1", br#"{"step":"order"}"#.to_vec())
                    .await
                    .unwrap();
            });
        });
    });
}

fn bench_fetch_commit_100(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("event_stream/fetch_commit_100", |b| {
        b.iter(|| {
            rt.block_on(async {
                let stream = InMemoryEventStream::new(1);
                let group = ConsumerGroup::new("bench").with_start(StartPosition::Earliest);
                for i in 0..100 {
                    stream
                        .publish(&format!("order-{i}"), vec![0u8; 64])
                        .await
                        .unwrap();
                }
                for _ in 0..100 {
                    let message = stream.fetch(&group, Partition::new(0)).await.unwrap();
                    stream.commit(&group, &message).await.unwrap();
                }
            });
        });
    });
}

criterion_group!(benches, bench_publish, bench_fetch_commit_100);
criterion_main!(benches);
