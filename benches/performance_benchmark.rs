use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use mhub::client::HubClient;
use mhub::config::Config;
use mhub::protocol::{codec, Envelope};
use mhub::registry::{Client, Registry};
use std::time::{Duration, Instant};
use tokio::runtime::Runtime;

// Memory measurement utilities
#[cfg(target_os = "linux")]
fn get_memory_usage() -> u64 {
    let status = std::fs::read_to_string("/proc/self/status").unwrap_or_default();
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            let kb = rest.split_whitespace().next().unwrap_or("0");
            return kb.parse::<u64>().unwrap_or(0) * 1024; // Convert KB to bytes
        }
    }
    0
}

#[cfg(not(target_os = "linux"))]
fn get_memory_usage() -> u64 {
    0 // Placeholder for other platforms
}

async fn start_test_server() -> (mhub::server::Server, String) {
    let config = Config {
        address: "127.0.0.1".to_string(),
        port: 0,
        secure: false,
        idle_timeout_secs: 0,
        ..Config::default()
    };
    let server = mhub::server::start(config).await.unwrap();
    let address = server.address().await.unwrap();
    (server, address)
}

fn benchmark_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec");

    for payload_size in [64usize, 1024, 16 * 1024] {
        let envelope = Envelope::publish("bench-client", "bench/topic", "X".repeat(payload_size));
        let encoded = codec::encode(&envelope).unwrap();

        group.bench_with_input(BenchmarkId::new("encode", payload_size), &envelope, |b, e| {
            b.iter(|| codec::encode(black_box(e)).unwrap())
        });
        group.bench_with_input(BenchmarkId::new("decode", payload_size), &encoded, |b, bytes| {
            b.iter(|| codec::decode(black_box(bytes)).unwrap())
        });
    }

    group.finish();
}

fn benchmark_registry(c: &mut Criterion) {
    let mut group = c.benchmark_group("registry");

    for num_clients in [100usize, 1_000, 10_000] {
        let registry = Registry::new();
        for i in 0..num_clients {
            registry.add_or_update(Client::new(
                format!("client{}", i),
                [format!("topic{}", i % 10), "shared".to_string()],
            ));
        }

        group.bench_with_input(
            BenchmarkId::new("all_interested_in", num_clients),
            &registry,
            |b, registry| b.iter(|| registry.all_interested_in(black_box("topic3"))),
        );
    }

    group.finish();
}

fn benchmark_memory_footprint(c: &mut Criterion) {
    let runtime = Runtime::new().unwrap();

    let mut group = c.benchmark_group("memory_footprint");
    group.sample_size(10);
    group.measurement_time(Duration::from_secs(30));

    for num_connections in [100, 500, 1000].iter() {
        group.bench_with_input(
            BenchmarkId::from_parameter(num_connections),
            num_connections,
            |b, &num_connections| {
                b.to_async(&runtime).iter(|| async move {
                    let (server, address) = start_test_server().await;
                    let base_memory = get_memory_usage();

                    let mut connections = Vec::new();
                    for i in 0..num_connections {
                        let mut client = HubClient::connect_plain(&address, format!("client{}", i))
                            .await
                            .unwrap();
                        client.subscribe("bench/topic").await.unwrap();
                        connections.push(client);
                    }

                    // Let connections stabilize
                    tokio::time::sleep(Duration::from_millis(500)).await;

                    let final_memory = get_memory_usage();
                    let memory_per_connection =
                        final_memory.saturating_sub(base_memory) / num_connections as u64;

                    println!(
                        "\n{} connections: base={:.2}MB, final={:.2}MB, per_conn={:.2}KB",
                        num_connections,
                        base_memory as f64 / 1_048_576.0,
                        final_memory as f64 / 1_048_576.0,
                        memory_per_connection as f64 / 1024.0
                    );

                    drop(connections);
                    server.stop().await.unwrap();

                    memory_per_connection
                });
            },
        );
    }

    group.finish();
}

fn benchmark_fan_out(c: &mut Criterion) {
    let runtime = Runtime::new().unwrap();

    let mut group = c.benchmark_group("fan_out");
    group.sample_size(10);

    for (num_subscribers, payload_size, messages) in [(1, 64, 1000), (10, 64, 1000), (10, 1024, 1000)] {
        let scenario = format!("{}sub_{}bytes", num_subscribers, payload_size);

        group.bench_function(&scenario, |b| {
            b.to_async(&runtime).iter(|| {
                let scenario = scenario.clone();
                async move {
                let (server, address) = start_test_server().await;

                let mut subscribers = Vec::new();
                for i in 0..num_subscribers {
                    let mut client = HubClient::connect_plain(&address, format!("sub{}", i))
                        .await
                        .unwrap();
                    client.subscribe("bench/topic").await.unwrap();
                    subscribers.push(client);
                }
                while server.registry().len() < num_subscribers {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }

                let mut publisher = HubClient::connect_plain(&address, "pub").await.unwrap();
                let payload = "X".repeat(payload_size);
                let start = Instant::now();

                let readers: Vec<_> = subscribers
                    .into_iter()
                    .map(|mut client| {
                        tokio::spawn(async move {
                            for _ in 0..messages {
                                client.recv().await.unwrap();
                            }
                        })
                    })
                    .collect();

                for _ in 0..messages {
                    publisher.publish("bench/topic", payload.as_str()).await.unwrap();
                }
                for reader in readers {
                    reader.await.unwrap();
                }

                let elapsed = start.elapsed();
                let deliveries = (messages * num_subscribers) as f64;
                println!(
                    "\n{}: {} deliveries in {:?} = {:.0} msg/sec",
                    scenario,
                    deliveries,
                    elapsed,
                    deliveries / elapsed.as_secs_f64()
                );

                server.stop().await.unwrap();
                elapsed
                }
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    benchmark_codec,
    benchmark_registry,
    benchmark_memory_footprint,
    benchmark_fan_out
);
criterion_main!(benches);
