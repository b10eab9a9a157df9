pub mod bundle;
pub mod cache;
pub mod connect;
pub mod controller;
pub mod framing;
pub mod handler;
pub mod port_pool;
pub mod protocol;
pub mod session;
