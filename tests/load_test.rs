//! Load test: many clients hammering a small set of cacheable targets.

use std::time::{Duration, Instant};

mod common;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cached_targets_under_load() {
    let upstream = common::start_mock_upstream().await;
    let relay = common::start_relay(|c| {
        c.rate_limit.enabled = false;
        c.abuse.enabled = false;
    })
    .await;

    let concurrency = 20;
    let requests_per_task = 25;
    let total_requests = concurrency * requests_per_task;
    let targets: Vec<String> = (0..4)
        .map(|i| relay.proxy(&upstream.url(&format!("/slow?ms=50&variant={i}"))))
        .collect();

    let client = common::client();
    let start = Instant::now();

    let mut tasks = Vec::new();
    for task in 0..concurrency {
        let client = client.clone();
        let targets = targets.clone();
        tasks.push(tokio::spawn(async move {
            let mut latencies = Vec::new();
            for i in 0..requests_per_task {
                let url = &targets[(task + i) % targets.len()];
                let req_start = Instant::now();
                if let Ok(res) = client.get(url).send().await {
                    if res.status().is_success() && res.bytes().await.is_ok() {
                        latencies.push(req_start.elapsed());
                    }
                }
            }
            latencies
        }));
    }

    let mut all_latencies: Vec<Duration> = Vec::new();
    for task in tasks {
        all_latencies.extend(task.await.unwrap());
    }
    let duration = start.elapsed();

    assert_eq!(all_latencies.len(), total_requests, "every request should succeed");
    // One upstream fetch per distinct target.
    assert_eq!(upstream.hits.get("/slow"), targets.len());

    all_latencies.sort();
    let p50 = all_latencies[all_latencies.len() / 2];
    let p99 = all_latencies[(all_latencies.len() as f64 * 0.99) as usize];

    println!("\n--- Load Test Results ---");
    println!("Total Requests: {}", total_requests);
    println!("Concurrency:    {}", concurrency);
    println!("Total Duration: {:?}", duration);
    println!("Requests/sec:   {:.2}", total_requests as f64 / duration.as_secs_f64());
    println!("P50 Latency:    {:?}", p50);
    println!("P99 Latency:    {:?}", p99);
    println!("-------------------------\n");

    let stats = relay.state.dispatcher.stats().snapshot();
    assert_eq!(stats.total_requests, total_requests as u64);
    assert_eq!(stats.cache.miss, targets.len() as u64);

    relay.stop().await;
}
