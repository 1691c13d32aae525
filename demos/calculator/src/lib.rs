//! ICalculator: the interface shared by the demo's exporter and importer

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use comrt::{ArgType, ComError, ComObject, Iid, InterfaceDescriptor, MethodDescriptor, Result, Value};
use tracing::info;

pub const IID_ICALCULATOR: Iid = Iid::from_u128(0x4a3f_2b10_7c1e_4d2a_9b6e_0c5d_8e7f_1a20);

/// DISP_E_DIVBYZERO
pub const E_DIVBYZERO: u32 = 0x8002_0012;

pub mod method {
    pub const ADD: u32 = 3;
    pub const SUBTRACT: u32 = 4;
    pub const MULTIPLY: u32 = 5;
    pub const DIVIDE: u32 = 6;
    pub const TOTAL: u32 = 7;
}

const BINARY: &[ArgType] = &[ArgType::I32, ArgType::I32];

pub static ICALCULATOR: InterfaceDescriptor = InterfaceDescriptor {
    iid: IID_ICALCULATOR,
    name: "ICalculator",
    methods: &[
        MethodDescriptor {
            name: "Add",
            ins: BINARY,
            outs: &[ArgType::I32],
        },
        MethodDescriptor {
            name: "Subtract",
            ins: BINARY,
            outs: &[ArgType::I32],
        },
        MethodDescriptor {
            name: "Multiply",
            ins: BINARY,
            outs: &[ArgType::I32],
        },
        MethodDescriptor {
            name: "Divide",
            ins: BINARY,
            outs: &[ArgType::I32],
        },
        MethodDescriptor {
            name: "Total",
            ins: &[],
            outs: &[ArgType::U64],
        },
    ],
};

/// Calculator object; keeps a count of operations served
#[derive(Default)]
pub struct Calculator {
    operations: AtomicU64,
}

impl Calculator {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ComObject for Calculator {
    fn implements(&self, iid: &Iid) -> bool {
        *iid == IID_ICALCULATOR
    }

    async fn invoke(&self, _iid: &Iid, method: u32, args: Vec<Value>) -> Result<Vec<Value>> {
        if method == method::TOTAL {
            return Ok(vec![Value::U64(self.operations.load(Ordering::Relaxed))]);
        }

        let a = args[0].as_i32()?;
        let b = args[1].as_i32()?;
        let result = match method {
            method::ADD => a.wrapping_add(b),
            method::SUBTRACT => a.wrapping_sub(b),
            method::MULTIPLY => a.wrapping_mul(b),
            method::DIVIDE => a.checked_div(b).ok_or(ComError::Fault(E_DIVBYZERO))?,
            _ => return Err(ComError::InvalidMethod(method)),
        };
        self.operations.fetch_add(1, Ordering::Relaxed);
        info!(method, a, b, result, "calculated");
        Ok(vec![Value::I32(result)])
    }
}
