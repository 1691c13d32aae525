//! Circular Call Tests - Callback Scenarios (A->B->A)
//!
//! A caller hands the callee an interface pointer to one of its own
//! objects and the callee calls back through it before replying. When the
//! caller is an STA the callback can only be served because the waiting
//! caller keeps pumping its apartment.

mod common;

use std::sync::Arc;
use std::time::Instant;

use comrt::{ApartmentKind, ComConfig, InterfacePtr, Value};
use futures::future::join_all;

use common::*;

/// Test: a callback into a waiting STA in another runtime
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_callback_into_waiting_sta() {
    init_logging();

    let caller = com_runtime(ComConfig::default()).await;
    let callee = com_runtime(ComConfig::default()).await;
    let sta = caller.init_apartment(ApartmentKind::Sta).unwrap();

    let driver_obj = InterfacePtr::from_object(Arc::new(Driver));
    let driver = marshal_across(&callee.mta(), &sta, &driver_obj, IDRIVER.iid).await;

    let doubler = Arc::new(Doubler::default());
    let sink = InterfacePtr::from_object(doubler.clone())
        .query_interface(ICALLBACK.iid)
        .await
        .unwrap();

    // no message loop runs on the STA; the waiting call pumps it
    let out = driver
        .invoke(DRIVE, vec![Value::Interface(Some(sink)), Value::U32(20)])
        .await
        .unwrap();
    assert_eq!(out[0].as_u32().unwrap(), 41);
    assert_eq!(doubler.notified(), 1);

    // the callee released the sink it was handed
    wait_for(|| sta.exported_objects() == 0).await;

    driver.release().await.unwrap();
    caller.shutdown().await;
    callee.shutdown().await;
}

/// Test: repeated round trips reuse the same objects without leaking
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_repeated_callbacks() {
    init_logging();

    const ROUNDS: u32 = 10;

    let caller = com_runtime(ComConfig::default()).await;
    let callee = com_runtime(ComConfig::default()).await;
    let sta = caller.init_apartment(ApartmentKind::Sta).unwrap();

    let driver_obj = InterfacePtr::from_object(Arc::new(Driver));
    let driver = marshal_across(&callee.mta(), &sta, &driver_obj, IDRIVER.iid).await;
    let doubler = Arc::new(Doubler::default());
    let sink = InterfacePtr::from_object(doubler.clone());

    let start = Instant::now();
    for n in 0..ROUNDS {
        let out = driver
            .invoke(DRIVE, vec![Value::Interface(Some(sink.clone())), Value::U32(n)])
            .await
            .unwrap();
        assert_eq!(out[0].as_u32().unwrap(), n * 2 + 1);
    }
    println!("\n=== Repeated Callback Results ===");
    println!("Round trips: {} in {:?}", ROUNDS, start.elapsed());

    assert_eq!(doubler.notified(), ROUNDS);
    wait_for(|| sta.exported_objects() == 0).await;
    // the driver was imported once and stays imported
    assert_eq!(sta.imported_objects(), 1);

    driver.release().await.unwrap();
    assert_eq!(sta.imported_objects(), 0);
    caller.shutdown().await;
    callee.shutdown().await;
}

/// Test: many MTA callers drive an STA callee that calls each of them back
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_callbacks_through_sta_callee() {
    init_logging();

    const CALLERS: u32 = 8;

    let caller = com_runtime(ComConfig::default()).await;
    let callee = com_runtime(ComConfig::default()).await;
    let callee_sta = callee.init_apartment(ApartmentKind::Sta).unwrap();
    let pump = spawn_message_loop(&callee_sta);

    let driver_obj = InterfacePtr::from_object(Arc::new(Driver));
    let driver = marshal_across(&callee_sta, &caller.mta(), &driver_obj, IDRIVER.iid).await;

    let doublers: Vec<_> = (0..CALLERS).map(|_| Arc::new(Doubler::default())).collect();
    let calls = doublers.iter().enumerate().map(|(i, doubler)| {
        let driver = driver.clone();
        let sink = InterfacePtr::from_object(doubler.clone());
        async move {
            let out = driver
                .invoke(DRIVE, vec![Value::Interface(Some(sink)), Value::U32(i as u32)])
                .await
                .unwrap();
            driver.release().await.unwrap();
            out[0].as_u32().unwrap()
        }
    });
    let results = join_all(calls).await;

    for (i, result) in results.iter().enumerate() {
        assert_eq!(*result, i as u32 * 2 + 1);
    }
    assert!(doublers.iter().all(|d| d.notified() == 1));

    driver.release().await.unwrap();
    callee.uninitialize(&callee_sta).await;
    // calls picked up by a nested pump are not counted by the loop
    let pumped = pump.await.unwrap();
    println!("Drive calls run by the message loop itself: {}", pumped);
    assert!(pumped <= CALLERS as usize);
    caller.shutdown().await;
    callee.shutdown().await;
}

/// Test: two STAs of one runtime calling each other
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sta_to_sta_callback() {
    init_logging();

    let runtime = com_runtime(ComConfig::default()).await;
    let server_sta = runtime.init_apartment(ApartmentKind::Sta).unwrap();
    let client_sta = runtime.init_apartment(ApartmentKind::Sta).unwrap();
    let pump = spawn_message_loop(&server_sta);

    let driver_obj = InterfacePtr::from_object(Arc::new(Driver));
    let driver = marshal_across(&server_sta, &client_sta, &driver_obj, IDRIVER.iid).await;
    let doubler = Arc::new(Doubler::default());

    let out = driver
        .invoke(
            DRIVE,
            vec![Value::Interface(Some(InterfacePtr::from_object(doubler.clone()))), Value::U32(7)],
        )
        .await
        .unwrap();
    assert_eq!(out[0].as_u32().unwrap(), 15);
    assert_eq!(doubler.notified(), 1);

    driver.release().await.unwrap();
    runtime.uninitialize(&server_sta).await;
    pump.await.unwrap();
    runtime.shutdown().await;
}
