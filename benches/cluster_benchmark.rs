//! Benchmarks for slot routing.
//!
//! The `routing` groups run without a server. The `cluster_*` groups need a
//! real cluster; point `SLOTMUX_BENCH_NODES` at it:
//! ```bash
//! docker run -d --name redis-cluster \
//!   -p 7000-7005:7000-7005 \
//!   grokzen/redis-cluster:latest
//! SLOTMUX_BENCH_NODES=127.0.0.1:7000,127.0.0.1:7001 cargo bench --bench cluster_benchmark
//! ```

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use slotmux::{classify, command, key_slot, ClusterBuilder, ClusterContext};

fn create_context() -> Option<ClusterContext> {
    let nodes = std::env::var("SLOTMUX_BENCH_NODES").ok()?;
    Some(
        ClusterBuilder::new()
            .add_nodes(&nodes)
            .connect()
            .expect("failed to connect to cluster"),
    )
}

fn bench_key_slot(c: &mut Criterion) {
    let mut group = c.benchmark_group("routing_key_slot");

    for len in [8, 64, 512].iter() {
        let key = vec![b'k'; *len];
        group.throughput(Throughput::Bytes(*len as u64));
        group.bench_with_input(BenchmarkId::new("plain", len), &key, |b, key| {
            b.iter(|| key_slot(black_box(key)));
        });
    }

    let tagged = b"{user:1000}.following".to_vec();
    group.bench_function("hash_tag", |b| b.iter(|| key_slot(black_box(&tagged))));
    group.finish();
}

fn bench_classify(c: &mut Criterion) {
    let mut group = c.benchmark_group("routing_classify");

    let get = command::get("foo").into_args();
    group.bench_function("get", |b| b.iter(|| classify(black_box(&get))));

    for keys in [4, 32, 256].iter() {
        let mget = command::mget((0..*keys).map(|i| format!("key:{i}"))).into_args();
        group.bench_with_input(BenchmarkId::new("mget", keys), &mget, |b, argv| {
            b.iter(|| classify(black_box(argv)));
        });
    }

    let eval: Vec<Bytes> = ["EVAL", "return 1", "2", "{t}a", "{t}b", "arg"]
        .into_iter()
        .map(Bytes::from_static)
        .collect();
    group.bench_function("eval", |b| b.iter(|| classify(black_box(&eval))));
    group.finish();
}

fn bench_cluster_set_get(c: &mut Criterion) {
    let Some(mut ctx) = create_context() else {
        return;
    };
    let mut group = c.benchmark_group("cluster_set_get");

    for size in [64, 1024, 16384].iter() {
        let value = Bytes::from(vec![b'x'; *size]);
        let key = format!("bench:value:{size}");
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::new("set", size), &value, |b, value| {
            b.iter(|| {
                ctx.command(&command::set(key.clone(), value.clone()))
                    .expect("SET failed")
            });
        });
        group.bench_with_input(BenchmarkId::new("get", size), &key, |b, key| {
            b.iter(|| ctx.command(&command::get(key.clone())).expect("GET failed"));
        });
    }

    group.finish();
}

fn bench_cluster_pipeline(c: &mut Criterion) {
    let Some(mut ctx) = create_context() else {
        return;
    };
    let mut group = c.benchmark_group("cluster_pipeline");

    for depth in [10, 100].iter() {
        group.throughput(Throughput::Elements(*depth as u64));
        group.bench_with_input(BenchmarkId::from_parameter(depth), depth, |b, &depth| {
            b.iter(|| {
                for i in 0..depth {
                    ctx.append_command(&command::get(format!("bench:pipe:{i}")))
                        .expect("append failed");
                }
                while ctx.get_reply().expect("reply failed").is_some() {}
                ctx.reset().expect("reset failed");
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_key_slot,
    bench_classify,
    bench_cluster_set_get,
    bench_cluster_pipeline
);
criterion_main!(benches);
