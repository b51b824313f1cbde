//! Node configuration.
//!
//! Parsed from `--flag value` command-line pairs. Every flag has a default
//! except that a joining node should name at least one `--seed`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{ClusterError, Result};
use crate::storage::memory::StoreConfig;

pub const USAGE: &str = "Usage: dkv-node --bind <addr:port> [--seed <addr:port>]... [--name <cloud>] \
[--workers <n>] [--rpc-attempts <n>] [--rpc-timeout-ms <ms>] [--invalidate-timeout-ms <ms>] \
[--memory-budget-mb <mb>] [--spill-dir <path>] [--verbose]";

#[derive(Debug, Clone, PartialEq)]
pub struct NodeConfig {
    /// Gossip (UDP) address. The RPC server listens on the same IP, port + 1000.
    pub bind: SocketAddr,
    pub seeds: Vec<SocketAddr>,
    /// Nodes only form a cloud with nodes that use the same name.
    pub cloud_name: String,
    pub workers: usize,
    pub rpc_attempts: usize,
    pub rpc_timeout: Duration,
    pub invalidate_timeout: Duration,
    pub memory_budget: usize,
    /// Spill to disk here; spilled values stay in memory-backed storage when unset.
    pub spill_dir: Option<PathBuf>,
    pub verbose: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 5000)),
            seeds: Vec::new(),
            cloud_name: "dkv".to_string(),
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            rpc_attempts: 3,
            rpc_timeout: Duration::from_secs(2),
            invalidate_timeout: Duration::from_secs(5),
            memory_budget: 512 * 1024 * 1024,
            spill_dir: None,
            verbose: false,
        }
    }
}

fn parse<T: FromStr>(flag: &str, value: Option<&String>) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    let value = value.ok_or_else(|| ClusterError::Config(format!("{} needs a value", flag)))?;
    value
        .parse()
        .map_err(|e| ClusterError::Config(format!("invalid value {:?} for {}: {}", value, flag, e)))
}

fn positive(flag: &str, n: u64) -> Result<u64> {
    if n == 0 {
        return Err(ClusterError::Config(format!("{} must be positive", flag)));
    }
    Ok(n)
}

impl NodeConfig {
    /// Parses flags, skipping the program name in `args[0]`.
    pub fn from_args(args: &[String]) -> Result<Self> {
        let mut config = Self::default();
        let mut args = args.iter().skip(1);

        while let Some(flag) = args.next() {
            match flag.as_str() {
                "--bind" => config.bind = parse(flag, args.next())?,
                "--seed" => config.seeds.push(parse(flag, args.next())?),
                "--name" => config.cloud_name = parse(flag, args.next())?,
                "--workers" => {
                    config.workers = positive(flag, parse(flag, args.next())?)? as usize
                }
                "--rpc-attempts" => {
                    config.rpc_attempts = positive(flag, parse(flag, args.next())?)? as usize
                }
                "--rpc-timeout-ms" => {
                    config.rpc_timeout =
                        Duration::from_millis(positive(flag, parse(flag, args.next())?)?)
                }
                "--invalidate-timeout-ms" => {
                    config.invalidate_timeout =
                        Duration::from_millis(positive(flag, parse(flag, args.next())?)?)
                }
                "--memory-budget-mb" => {
                    let mb: usize = parse(flag, args.next())?;
                    config.memory_budget = mb * 1024 * 1024;
                }
                "--spill-dir" => config.spill_dir = Some(parse(flag, args.next())?),
                "--verbose" => config.verbose = true,
                other => {
                    return Err(ClusterError::Config(format!("unknown flag {}", other)));
                }
            }
        }

        if config.cloud_name.is_empty() {
            return Err(ClusterError::Config("--name must not be empty".into()));
        }
        Ok(config)
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            invalidate_timeout: self.invalidate_timeout,
            memory_budget: self.memory_budget,
            ordering_horizon: (self.rpc_timeout * (self.rpc_attempts as u32 + 1) * 4)
                .max(Duration::from_secs(60)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("dkv-node")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_defaults_without_flags() {
        let config = NodeConfig::from_args(&args(&[])).unwrap();
        assert_eq!(config, NodeConfig::default());
        assert!(config.workers >= 1);
    }

    #[test]
    fn test_all_flags() {
        let config = NodeConfig::from_args(&args(&[
            "--bind", "10.0.0.5:6000",
            "--seed", "10.0.0.1:6000",
            "--seed", "10.0.0.2:6000",
            "--name", "analytics",
            "--workers", "12",
            "--rpc-attempts", "5",
            "--rpc-timeout-ms", "750",
            "--invalidate-timeout-ms", "9000",
            "--memory-budget-mb", "64",
            "--spill-dir", "/tmp/dkv",
            "--verbose",
        ]))
        .unwrap();

        assert_eq!(config.bind, "10.0.0.5:6000".parse().unwrap());
        assert_eq!(config.seeds.len(), 2);
        assert_eq!(config.cloud_name, "analytics");
        assert_eq!(config.workers, 12);
        assert_eq!(config.rpc_attempts, 5);
        assert_eq!(config.rpc_timeout, Duration::from_millis(750));
        assert_eq!(config.store_config().invalidate_timeout, Duration::from_secs(9));
        assert_eq!(config.store_config().memory_budget, 64 * 1024 * 1024);
        assert_eq!(config.store_config().ordering_horizon, Duration::from_secs(60));
        assert_eq!(config.spill_dir, Some(PathBuf::from("/tmp/dkv")));
        assert!(config.verbose);
    }

    #[test]
    fn test_invalid_values_are_config_errors() {
        for bad in [
            args(&["--bind", "not-an-address"]),
            args(&["--workers", "0"]),
            args(&["--workers", "-3"]),
            args(&["--seed"]),
            args(&["--colour", "blue"]),
            args(&["--name", ""]),
        ] {
            assert!(matches!(
                NodeConfig::from_args(&bad),
                Err(ClusterError::Config(_))
            ));
        }
    }
}
