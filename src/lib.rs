//! Hellogate - a minimal reverse proxy in front of a hello-world upstream
//!
//! This library provides the two halves of a two-hop request path:
//! - An upstream server that answers `GET /` with a fixed JSON greeting,
//!   bound to a loopback address only
//! - A reverse proxy that terminates public connections and forwards every
//!   request to the upstream's fixed local port, streaming bodies in both
//!   directions through a pooled HTTP client
//!
//! Each half ships as its own binary (`hellogate` and `hello-upstream`) so
//! the pair can be deployed and supervised independently.

pub mod config;
pub mod error;
pub mod forward;
pub mod proxy;
pub mod upstream;
