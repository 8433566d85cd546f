//! Portgate - A local development proxy for Kubernetes services
//!
//! This library provides a hostname-routing reverse proxy that:
//! - Starts one `kubectl port-forward` channel per service in a manifest
//! - Maps each service hostname to the loopback address in the hosts file
//! - Routes HTTP(S) traffic by Host header to the matching forwarded port
//! - Tears every forwarding channel down exactly once on exit or signal

pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod forward;
pub mod hosts;
pub mod proxy;
pub mod routes;
pub mod shutdown;
pub mod tls;
