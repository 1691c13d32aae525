//! Objects, interface pointers and call values
//!
//! Any type implementing [`ComObject`] can be exported. Callers hold
//! [`InterfacePtr`]s: an object plus the interface it is being used through.
//! Local objects are plain `Arc`s; for imported objects the pointer also owns
//! one local reference on the proxy manager, taken on clone and given back on
//! [`InterfacePtr::release`] or drop.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::proxy::ProxyManager;
use crate::types::{iid, ComError, Iid, Result};

/// An exportable object
#[async_trait]
pub trait ComObject: Send + Sync + 'static {
    /// True if QueryInterface for `iid` succeeds. IUnknown is implied.
    fn implements(&self, iid: &Iid) -> bool;

    /// Call method `method` (numbered from 3) of interface `iid`
    async fn invoke(&self, iid: &Iid, method: u32, args: Vec<Value>) -> Result<Vec<Value>>;

    /// Set only by proxy managers
    fn as_proxy(&self) -> Option<&ProxyManager> {
        None
    }
}

/// A typed reference to an object
pub struct InterfacePtr {
    iid: Iid,
    object: Arc<dyn ComObject>,
    released: bool,
}

impl InterfacePtr {
    /// Pointer to a local object through `iid`. The interface is not checked;
    /// use [`query_interface`](Self::query_interface) for that.
    pub fn new(iid: Iid, object: Arc<dyn ComObject>) -> Self {
        Self {
            iid,
            object,
            released: false,
        }
    }

    /// IUnknown pointer to a local object
    pub fn from_object<T: ComObject>(object: Arc<T>) -> Self {
        Self::new(iid::IUNKNOWN, object)
    }

    /// Wrap a proxy manager whose local reference the caller already took
    pub(crate) fn from_proxy(iid: Iid, proxy: Arc<ProxyManager>) -> Self {
        Self::new(iid, proxy)
    }

    pub fn iid(&self) -> Iid {
        self.iid
    }

    pub fn object(&self) -> &Arc<dyn ComObject> {
        &self.object
    }

    /// Address of the object; equal for every pointer to the same object
    /// within an apartment
    pub fn identity(&self) -> usize {
        Arc::as_ptr(&self.object) as *const () as usize
    }

    pub fn same_object(&self, other: &InterfacePtr) -> bool {
        self.identity() == other.identity()
    }

    pub fn is_proxy(&self) -> bool {
        self.object.as_proxy().is_some()
    }

    pub fn proxy(&self) -> Option<&ProxyManager> {
        self.object.as_proxy()
    }

    /// Pointer to the same object through another interface
    pub async fn query_interface(&self, iid: Iid) -> Result<InterfacePtr> {
        if let Some(proxy) = self.object.as_proxy() {
            proxy.query_interface(iid).await?;
            proxy.add_ref();
            return Ok(Self::new(iid, self.object.clone()));
        }
        if iid == iid::IUNKNOWN || self.object.implements(&iid) {
            Ok(Self::new(iid, self.object.clone()))
        } else {
            Err(ComError::NoInterface(iid))
        }
    }

    pub async fn invoke(&self, method: u32, args: Vec<Value>) -> Result<Vec<Value>> {
        self.object.invoke(&self.iid, method, args).await
    }

    /// Give the reference back. For an imported object this is where the
    /// last release tells the exporter to drop its references.
    pub async fn release(mut self) -> Result<u32> {
        self.released = true;
        match self.object.as_proxy() {
            Some(proxy) => proxy.release().await,
            None => Ok(0),
        }
    }
}

impl Clone for InterfacePtr {
    fn clone(&self) -> Self {
        if let Some(proxy) = self.object.as_proxy() {
            proxy.add_ref();
        }
        Self::new(self.iid, self.object.clone())
    }
}

impl Drop for InterfacePtr {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Some(proxy) = self.object.as_proxy() {
            proxy.release_detached();
        }
    }
}

impl fmt::Debug for InterfacePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterfacePtr")
            .field("iid", &self.iid)
            .field("identity", &format_args!("{:#x}", self.identity()))
            .field("proxy", &self.is_proxy())
            .finish()
    }
}

/// A call argument or result
#[derive(Clone, Debug)]
pub enum Value {
    U32(u32),
    I32(i32),
    U64(u64),
    Bytes(Bytes),
    Str(String),
    Interface(Option<InterfacePtr>),
}

impl Value {
    pub fn as_u32(&self) -> Result<u32> {
        match self {
            Value::U32(v) => Ok(*v),
            other => Err(mismatch("u32", other)),
        }
    }

    pub fn as_i32(&self) -> Result<i32> {
        match self {
            Value::I32(v) => Ok(*v),
            other => Err(mismatch("i32", other)),
        }
    }

    pub fn as_u64(&self) -> Result<u64> {
        match self {
            Value::U64(v) => Ok(*v),
            other => Err(mismatch("u64", other)),
        }
    }

    pub fn as_bytes(&self) -> Result<&Bytes> {
        match self {
            Value::Bytes(v) => Ok(v),
            other => Err(mismatch("bytes", other)),
        }
    }

    pub fn as_str(&self) -> Result<&str> {
        match self {
            Value::Str(v) => Ok(v),
            other => Err(mismatch("string", other)),
        }
    }

    pub fn into_interface(self) -> Result<Option<InterfacePtr>> {
        match self {
            Value::Interface(v) => Ok(v),
            other => Err(mismatch("interface", &other)),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Value::U32(_) => "u32",
            Value::I32(_) => "i32",
            Value::U64(_) => "u64",
            Value::Bytes(_) => "bytes",
            Value::Str(_) => "string",
            Value::Interface(_) => "interface",
        }
    }
}

fn mismatch(expected: &str, got: &Value) -> ComError {
    ComError::InvalidArgument(format!("expected {}, got {}", expected, got.kind()))
}
