//! appgate - an application server front-end
//!
//! This library provides a supervisor that:
//! - Routes HTTP traffic based on the Host header to configured applications
//! - Spawns worker processes on demand, directly or through a preloader
//! - Pools workers per application and queues requests while they are busy
//! - Reports spawn failures with a step-by-step journey and error pages
//! - Caches small public GET responses per event loop
//! - Detaches idle workers and retires idle applications

pub mod admin;
pub mod config;
pub mod config_store;
pub mod conn_pool;
pub mod context;
pub mod controller;
pub mod error;
pub mod event_loop;
pub mod guards;
pub mod journey;
pub mod os;
pub mod pool;
pub mod response_cache;
pub mod server;
pub mod spawning;
