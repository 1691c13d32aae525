//! Shared fixtures for the scenario tests
//!
//! Interfaces, test objects and runtime helpers used across test binaries.
//! Not every binary uses every fixture.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use comrt::{
    marshal_interface, unmarshal_interface, Apartment, ArgType, ComConfig, ComError, ComObject, ComRuntime, Iid,
    InterfaceDescriptor, InterfacePtr, MarshalMode, MethodDescriptor, Result, Value,
};
use parking_lot::Mutex;
use tokio::task::JoinHandle;

pub const IID_CALC: Iid = Iid::from_u128(0x5ca1_c000_0000_0000_0000_0000_0000_0001);
pub const IID_CALLBACK: Iid = Iid::from_u128(0x5ca1_c000_0000_0000_0000_0000_0000_0002);
pub const IID_DRIVER: Iid = Iid::from_u128(0x5ca1_c000_0000_0000_0000_0000_0000_0003);
pub const IID_FACTORY: Iid = Iid::from_u128(0x5ca1_c000_0000_0000_0000_0000_0000_0004);

/// Calculator interface
///
/// | slot | method  | in         | out   |
/// |------|---------|------------|-------|
/// | 3    | Add     | i32, i32   | i32   |
/// | 4    | Delay   | u32 (ms)   | u32   |
/// | 5    | Calls   |            | u32   |
pub static ICALC: InterfaceDescriptor = InterfaceDescriptor {
    iid: IID_CALC,
    name: "ICalc",
    methods: &[
        MethodDescriptor {
            name: "Add",
            ins: &[ArgType::I32, ArgType::I32],
            outs: &[ArgType::I32],
        },
        MethodDescriptor {
            name: "Delay",
            ins: &[ArgType::U32],
            outs: &[ArgType::U32],
        },
        MethodDescriptor {
            name: "Calls",
            ins: &[],
            outs: &[ArgType::U32],
        },
    ],
};

/// Callback sink: `Notify(n) -> 2n`
pub static ICALLBACK: InterfaceDescriptor = InterfaceDescriptor {
    iid: IID_CALLBACK,
    name: "ICallback",
    methods: &[MethodDescriptor {
        name: "Notify",
        ins: &[ArgType::U32],
        outs: &[ArgType::U32],
    }],
};

/// Calls back through the sink it is handed: `Drive(sink, n) -> sink(n) + 1`
pub static IDRIVER: InterfaceDescriptor = InterfaceDescriptor {
    iid: IID_DRIVER,
    name: "IDriver",
    methods: &[MethodDescriptor {
        name: "Drive",
        ins: &[ArgType::Interface(IID_CALLBACK), ArgType::U32],
        outs: &[ArgType::U32],
    }],
};

/// Hands out a fresh calculator on every call
pub static IFACTORY: InterfaceDescriptor = InterfaceDescriptor {
    iid: IID_FACTORY,
    name: "IFactory",
    methods: &[MethodDescriptor {
        name: "Create",
        ins: &[],
        outs: &[ArgType::Interface(IID_CALC)],
    }],
};

pub const ADD: u32 = 3;
pub const DELAY: u32 = 4;
pub const CALLS: u32 = 5;
pub const NOTIFY: u32 = 3;
pub const DRIVE: u32 = 3;
pub const CREATE: u32 = 3;

/// Initialize tracing for tests
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("comrt=info".parse().unwrap())
                .add_directive("rpcrt=info".parse().unwrap()),
        )
        .with_test_writer()
        .try_init();
}

/// Calculator with call and concurrency counters
#[derive(Default)]
pub struct Calculator {
    calls: AtomicU32,
    active: AtomicU32,
    max_active: AtomicU32,
    dropped: Option<Arc<AtomicUsize>>,
}

impl Calculator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Calculator that bumps `dropped` when destroyed
    pub fn tracked(dropped: Arc<AtomicUsize>) -> Self {
        Self {
            calls: AtomicU32::new(0),
            active: AtomicU32::new(0),
            max_active: AtomicU32::new(0),
            dropped: Some(dropped),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Most calls seen running at once
    pub fn max_active(&self) -> u32 {
        self.max_active.load(Ordering::SeqCst)
    }
}

impl Drop for Calculator {
    fn drop(&mut self) {
        if let Some(dropped) = &self.dropped {
            dropped.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl ComObject for Calculator {
    fn implements(&self, iid: &Iid) -> bool {
        *iid == ICALC.iid
    }

    async fn invoke(&self, _iid: &Iid, method: u32, args: Vec<Value>) -> Result<Vec<Value>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match method {
            ADD => {
                let a = args[0].as_i32()?;
                let b = args[1].as_i32()?;
                Ok(vec![Value::I32(a.wrapping_add(b))])
            }
            DELAY => {
                let ms = args[0].as_u32()?;
                let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
                self.max_active.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(ms as u64)).await;
                self.active.fetch_sub(1, Ordering::SeqCst);
                Ok(vec![Value::U32(ms)])
            }
            CALLS => Ok(vec![Value::U32(self.calls())]),
            _ => Err(ComError::InvalidMethod(method)),
        }
    }
}

/// Callback sink that doubles its argument
#[derive(Default)]
pub struct Doubler {
    notified: AtomicU32,
}

impl Doubler {
    pub fn notified(&self) -> u32 {
        self.notified.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ComObject for Doubler {
    fn implements(&self, iid: &Iid) -> bool {
        *iid == ICALLBACK.iid
    }

    async fn invoke(&self, _iid: &Iid, method: u32, args: Vec<Value>) -> Result<Vec<Value>> {
        match method {
            NOTIFY => {
                self.notified.fetch_add(1, Ordering::SeqCst);
                Ok(vec![Value::U32(args[0].as_u32()? * 2)])
            }
            _ => Err(ComError::InvalidMethod(method)),
        }
    }
}

/// Calls back into whatever sink it is given
pub struct Driver;

#[async_trait]
impl ComObject for Driver {
    fn implements(&self, iid: &Iid) -> bool {
        *iid == IDRIVER.iid
    }

    async fn invoke(&self, _iid: &Iid, method: u32, mut args: Vec<Value>) -> Result<Vec<Value>> {
        if method != DRIVE {
            return Err(ComError::InvalidMethod(method));
        }
        let n = args[1].as_u32()?;
        let sink = args
            .swap_remove(0)
            .into_interface()?
            .ok_or_else(|| ComError::InvalidArgument("null sink".into()))?;
        let out = sink.invoke(NOTIFY, vec![Value::U32(n)]).await?;
        sink.release().await?;
        Ok(vec![Value::U32(out[0].as_u32()? + 1)])
    }
}

/// Creates calculators, keeping a handle on each
#[derive(Default)]
pub struct Factory {
    created: Mutex<Vec<Arc<Calculator>>>,
}

impl Factory {
    pub fn created(&self) -> usize {
        self.created.lock().len()
    }
}

#[async_trait]
impl ComObject for Factory {
    fn implements(&self, iid: &Iid) -> bool {
        *iid == IFACTORY.iid
    }

    async fn invoke(&self, _iid: &Iid, method: u32, _args: Vec<Value>) -> Result<Vec<Value>> {
        if method != CREATE {
            return Err(ComError::InvalidMethod(method));
        }
        let calc = Arc::new(Calculator::new());
        self.created.lock().push(calc.clone());
        let ptr = InterfacePtr::from_object(calc).query_interface(ICALC.iid).await?;
        Ok(vec![Value::Interface(Some(ptr))])
    }
}

/// Runtime with every test interface registered
pub async fn com_runtime(config: ComConfig) -> ComRuntime {
    let runtime = ComRuntime::new(config).await.expect("runtime");
    for descriptor in [&ICALC, &ICALLBACK, &IDRIVER, &IFACTORY] {
        runtime.register_interface(descriptor);
    }
    runtime
}

/// Marshal `object` out of `from` and unmarshal it into `to`
pub async fn marshal_across(from: &Arc<Apartment>, to: &Arc<Apartment>, object: &InterfacePtr, iid: Iid) -> InterfacePtr {
    let record = marshal_interface(from, object, iid, MarshalMode::Normal)
        .await
        .expect("marshal");
    unmarshal_interface(to, &record, iid).await.expect("unmarshal")
}

/// Run an STA's message loop on a task of its own
pub fn spawn_message_loop(sta: &Arc<Apartment>) -> JoinHandle<usize> {
    let sta = sta.clone();
    tokio::spawn(async move { sta.run_message_loop().await })
}

/// Poll `done` until it holds, failing after two seconds
pub async fn wait_for(mut done: impl FnMut() -> bool) {
    for _ in 0..200 {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

/// Thread-safe statistics collector
pub struct ConcurrentStats {
    success: AtomicU64,
    failure: AtomicU64,
    latencies: Mutex<Vec<Duration>>,
}

impl ConcurrentStats {
    pub fn new() -> Self {
        Self {
            success: AtomicU64::new(0),
            failure: AtomicU64::new(0),
            latencies: Mutex::new(Vec::new()),
        }
    }

    pub fn record_success(&self, latency: Duration) {
        self.success.fetch_add(1, Ordering::Relaxed);
        self.latencies.lock().push(latency);
    }

    pub fn record_failure(&self) {
        self.failure.fetch_add(1, Ordering::Relaxed);
    }

    pub fn success_count(&self) -> u64 {
        self.success.load(Ordering::Relaxed)
    }

    pub fn failure_count(&self) -> u64 {
        self.failure.load(Ordering::Relaxed)
    }

    pub fn avg_latency(&self) -> Duration {
        let latencies = self.latencies.lock();
        if latencies.is_empty() {
            return Duration::ZERO;
        }
        latencies.iter().sum::<Duration>() / latencies.len() as u32
    }

    pub fn min_latency(&self) -> Duration {
        self.latencies.lock().iter().min().copied().unwrap_or_default()
    }

    pub fn max_latency(&self) -> Duration {
        self.latencies.lock().iter().max().copied().unwrap_or_default()
    }
}

impl Default for ConcurrentStats {
    fn default() -> Self {
        Self::new()
    }
}
