//! Command-line flags

use crate::config::Config;
use clap::Parser;
use std::path::PathBuf;

/// Route local hostnames to Kubernetes services through port-forwards
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Manifest path (default: proxy.yaml / proxy.yml here, then in the home directory)
    #[arg(value_name = "MANIFEST")]
    pub manifest: Option<PathBuf>,

    /// Disable hosts file changes
    #[arg(long)]
    pub no_hosts: bool,

    /// Listen address, overrides the manifest
    #[arg(long, value_name = "ADDR")]
    pub listen: Option<String>,

    /// Disable certificate verification for https upstreams
    #[arg(long)]
    pub insecure: bool,

    /// Print detailed logs
    #[arg(long, short)]
    pub verbose: bool,
}

impl Args {
    /// Apply flag overrides on top of the manifest
    pub fn apply(&self, config: &mut Config) {
        if let Some(listen) = &self.listen {
            config.listen = listen.clone();
        }
        config.insecure |= self.insecure;
    }

    /// Default tracing directive when `RUST_LOG` doesn't say otherwise
    pub fn log_directive(&self) -> &'static str {
        if self.verbose {
            "portgate=debug"
        } else {
            "portgate=info"
        }
    }
}
