//! Stress Tests - Multi-threading at Large Scale
//!
//! These tests exercise race conditions in the object runtime by:
//! - Running many concurrent callers against one exported object
//! - Churning marshal/unmarshal/release of short-lived objects
//! - Flooding an STA with calls from many tasks
//! - Checking every table is empty once the load is gone

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use comrt::{ApartmentKind, ComConfig, InterfacePtr, Value};
use futures::future::join_all;
use tokio::sync::Barrier;

use common::*;

/// Test: many tasks calling one MTA object through one proxy
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_high_concurrency_many_callers() {
    init_logging();

    const NUM_CALLERS: usize = 32;
    const CALLS_PER_CALLER: usize = 50;

    let server = com_runtime(ComConfig::default()).await;
    let client = com_runtime(ComConfig::default()).await;

    let calc = Arc::new(Calculator::new());
    let local = InterfacePtr::from_object(calc.clone());
    let proxy = marshal_across(&server.mta(), &client.mta(), &local, ICALC.iid).await;

    let stats = Arc::new(ConcurrentStats::new());
    let barrier = Arc::new(Barrier::new(NUM_CALLERS));

    let handles = (0..NUM_CALLERS).map(|caller_id| {
        let proxy = proxy.clone();
        let stats = stats.clone();
        let barrier = barrier.clone();
        tokio::spawn(async move {
            barrier.wait().await;
            for call_id in 0..CALLS_PER_CALLER {
                let (a, b) = (caller_id as i32, call_id as i32);
                let start = Instant::now();
                match proxy.invoke(ADD, vec![Value::I32(a), Value::I32(b)]).await {
                    Ok(out) if out[0].as_i32().ok() == Some(a + b) => stats.record_success(start.elapsed()),
                    Ok(_) => {
                        eprintln!("Wrong sum for caller {} call {}", caller_id, call_id);
                        stats.record_failure();
                    }
                    Err(e) => {
                        eprintln!("Caller {} call {} failed: {}", caller_id, call_id, e);
                        stats.record_failure();
                    }
                }
            }
            proxy.release().await.unwrap();
        })
    });
    for result in join_all(handles).await {
        result.unwrap();
    }

    let total_expected = (NUM_CALLERS * CALLS_PER_CALLER) as u64;
    println!("\n=== High Concurrency Test Results ===");
    println!("Total expected: {}", total_expected);
    println!("Successful: {}", stats.success_count());
    println!("Failed: {}", stats.failure_count());
    println!("Avg latency: {:?}", stats.avg_latency());
    println!("Min latency: {:?}", stats.min_latency());
    println!("Max latency: {:?}", stats.max_latency());

    assert_eq!(stats.success_count(), total_expected);
    assert_eq!(calc.calls() as u64, total_expected);

    proxy.release().await.unwrap();
    assert_eq!(server.mta().exported_objects(), 0);
    client.shutdown().await;
    server.shutdown().await;
}

/// Test: short-lived objects marshaled, called and released in a loop
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_marshal_churn() {
    init_logging();

    const ITERATIONS: usize = 200;

    let server = com_runtime(ComConfig::default()).await;
    let client = com_runtime(ComConfig::default()).await;
    let exporter = server.mta();
    let importer = client.mta();

    let dropped = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let start = Instant::now();
    for i in 0..ITERATIONS {
        let local = InterfacePtr::from_object(Arc::new(Calculator::tracked(dropped.clone())));
        let proxy = marshal_across(&exporter, &importer, &local, ICALC.iid).await;
        drop(local);
        let out = proxy
            .invoke(ADD, vec![Value::I32(i as i32), Value::I32(1)])
            .await
            .unwrap();
        assert_eq!(out[0].as_i32().unwrap(), i as i32 + 1);
        proxy.release().await.unwrap();
    }
    let elapsed = start.elapsed();

    println!("\n=== Marshal Churn Results ===");
    println!("Objects: {} in {:?}", ITERATIONS, elapsed);
    println!("Per object: {:?}", elapsed / ITERATIONS as u32);

    assert_eq!(dropped.load(std::sync::atomic::Ordering::SeqCst), ITERATIONS);
    assert_eq!(exporter.exported_objects(), 0);
    assert_eq!(importer.imported_objects(), 0);

    client.shutdown().await;
    server.shutdown().await;
}

/// Test: concurrent importers of the same object share one proxy manager
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_unmarshal_same_object() {
    init_logging();

    const IMPORTS: usize = 24;

    let server = com_runtime(ComConfig::default()).await;
    let client = com_runtime(ComConfig::default()).await;
    let exporter = server.mta();
    let importer = client.mta();

    let local = InterfacePtr::from_object(Arc::new(Calculator::new()));
    let mut records = Vec::new();
    for _ in 0..IMPORTS {
        records.push(
            comrt::marshal_interface(&exporter, &local, ICALC.iid, comrt::MarshalMode::Normal)
                .await
                .unwrap(),
        );
    }
    let oid = exporter.exported_oid(&local).unwrap();
    assert_eq!(exporter.object_refs(oid), Some((IMPORTS * 5) as u32));

    let imports = records.into_iter().map(|record| {
        let importer = importer.clone();
        tokio::spawn(async move { comrt::unmarshal_interface(&importer, &record, ICALC.iid).await.unwrap() })
    });
    let proxies: Vec<_> = join_all(imports).await.into_iter().map(|r| r.unwrap()).collect();

    assert_eq!(importer.imported_objects(), 1);
    assert!(proxies.windows(2).all(|w| w[0].same_object(&w[1])));
    assert_eq!(proxies[0].proxy().unwrap().refs(), IMPORTS as u32);

    for proxy in proxies {
        proxy.release().await.unwrap();
    }
    assert_eq!(exporter.object_refs(oid), None);
    assert_eq!(importer.imported_objects(), 0);

    client.shutdown().await;
    server.shutdown().await;
}

/// Test: a burst of calls from many tasks into one STA
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_sta_call_burst() {
    init_logging();

    const TASKS: usize = 10;
    const CALLS_PER_TASK: usize = 20;

    let runtime = com_runtime(ComConfig::default()).await;
    let sta = runtime.init_apartment(ApartmentKind::Sta).unwrap();
    let pump = spawn_message_loop(&sta);

    let calc = Arc::new(Calculator::new());
    let local = InterfacePtr::from_object(calc.clone());
    let proxy = marshal_across(&sta, &runtime.mta(), &local, ICALC.iid).await;

    let start = Instant::now();
    let handles = (0..TASKS).map(|_| {
        let proxy = proxy.clone();
        tokio::spawn(async move {
            for _ in 0..CALLS_PER_TASK {
                proxy.invoke(DELAY, vec![Value::U32(1)]).await.unwrap();
            }
            proxy.release().await.unwrap();
        })
    });
    for result in join_all(handles).await {
        result.unwrap();
    }
    let elapsed = start.elapsed();

    println!("\n=== STA Burst Results ===");
    println!("Calls: {} in {:?}", TASKS * CALLS_PER_TASK, elapsed);
    println!("Max concurrent: {}", calc.max_active());

    assert_eq!(calc.calls() as usize, TASKS * CALLS_PER_TASK);
    assert_eq!(calc.max_active(), 1);
    assert!(elapsed >= Duration::from_millis((TASKS * CALLS_PER_TASK) as u64));

    proxy.release().await.unwrap();
    runtime.uninitialize(&sta).await;
    assert_eq!(pump.await.unwrap(), TASKS * CALLS_PER_TASK);
    runtime.shutdown().await;
}
