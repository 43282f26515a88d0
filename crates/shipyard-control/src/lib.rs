pub mod broker;
pub mod config;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod pipeline;
pub mod port_alloc;
pub mod proxy;
pub mod queue;
pub mod runner;
pub mod security;
pub mod source;
pub mod state;
pub mod store;
pub mod supervisor;
pub mod workspace;
