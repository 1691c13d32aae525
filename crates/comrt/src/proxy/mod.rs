//! Import side: proxy managers for objects living in other apartments

mod proxy_manager;

pub use proxy_manager::ProxyManager;
