//! Basic benchmarks for the hot paths of the `ncp_core` package.

#![allow(
    missing_docs,
    reason = "No need for API documentation in benchmark code"
)]

use std::hint::black_box;
use std::sync::Arc;

use criterion::{Criterion, criterion_group, criterion_main};
use ncp_core::{
    BlockPool, Delivery, DestinationId, FlagGroup, NodePool, Queue, Router, Signal, StatusHandler,
};

criterion_group!(benches, entrypoint);
criterion_main!(benches);

const DESTINATION: DestinationId = DestinationId(1);

fn entrypoint(c: &mut Criterion) {
    let mut group = c.benchmark_group("ncp_pool");

    let pool = BlockPool::builder()
        .block_size(1536)
        .block_count(64)
        .build()
        .unwrap();

    group.bench_function("alloc_free", |b| {
        b.iter(|| {
            let block = black_box(pool.alloc().unwrap());
            pool.free(block);
        });
    });

    group.finish();

    let mut group = c.benchmark_group("ncp_queue");

    let nodes = NodePool::new(64).unwrap();
    let queue = Queue::new(&nodes).unwrap();

    group.bench_function("enqueue_dequeue", |b| {
        b.iter(|| {
            queue.enqueue(black_box(42_u64)).unwrap();
            black_box(queue.dequeue());
        });
    });

    group.bench_function("enqueue_dequeue_node", |b| {
        let mut node = Some(nodes.node(0_u64).unwrap());

        b.iter(|| {
            queue.enqueue_node(node.take().unwrap());
            node = queue.dequeue_node();
        });
    });

    group.finish();

    let mut group = c.benchmark_group("ncp_router");

    let packet_nodes = NodePool::new(64).unwrap();
    let router = Router::builder()
        .register_destination(
            DESTINATION,
            Delivery::complete,
            Signal::new(Arc::new(FlagGroup::new()), 0b1),
            Queue::new(&packet_nodes).unwrap(),
        )
        .unwrap()
        .build();

    group.bench_function("submit_dispatch", |b| {
        b.iter(|| {
            let block = pool.alloc().unwrap();
            router
                .submit(DESTINATION, block, 64, StatusHandler::none())
                .unwrap();
            router.dispatch_one(DESTINATION).unwrap();
        });
    });

    group.bench_function("submit_dispatch_completion", |b| {
        b.iter(|| {
            let block = pool.alloc().unwrap();
            let (status, completion) = StatusHandler::completion();
            router.submit(DESTINATION, block, 64, status).unwrap();
            router.dispatch_one(DESTINATION).unwrap();
            black_box(completion.wait());
        });
    });

    group.finish();
}
