use serde::Deserialize;
use std::fs;
use std::path::PathBuf;

const DEFAULT_CONFIG_PATH: &str = "/etc/socktrace/socktrace.toml";
const ENV_CONFIG_PATH: &str = "SOCKTRACE_CONFIG";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub tracer: TracerConfig,
}

impl Config {
    /// Load configuration from file. The path can be overridden with the
    /// `SOCKTRACE_CONFIG` environment variable. If the file is missing or
    /// fails to parse, defaults are returned.
    pub fn load() -> Self {
        let path =
            std::env::var(ENV_CONFIG_PATH).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let path = PathBuf::from(path);
        match fs::read_to_string(&path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_default(),
            Err(_) => Config::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TracerConfig {
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
    #[serde(default = "default_perf_pages")]
    pub perf_pages: usize,
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    #[serde(default = "default_max_socket_entries")]
    pub max_socket_entries: u32,
    #[serde(default = "default_max_trace_entries")]
    pub max_trace_entries: u32,
    #[serde(default = "default_socket_map_max_reclaim")]
    pub socket_map_max_reclaim: u32,
    #[serde(default = "default_relay_comms")]
    pub relay_comms: Vec<String>,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            worker_threads: default_worker_threads(),
            perf_pages: default_perf_pages(),
            queue_size: default_queue_size(),
            max_socket_entries: default_max_socket_entries(),
            max_trace_entries: default_max_trace_entries(),
            socket_map_max_reclaim: default_socket_map_max_reclaim(),
            relay_comms: default_relay_comms(),
        }
    }
}

fn default_worker_threads() -> usize {
    4
}
fn default_perf_pages() -> usize {
    128
}
fn default_queue_size() -> usize {
    65_536
}
fn default_max_socket_entries() -> u32 {
    524_288
}
fn default_max_trace_entries() -> u32 {
    65_536
}
fn default_socket_map_max_reclaim() -> u32 {
    393_216
}
fn default_relay_comms() -> Vec<String> {
    vec!["nginx".to_string()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = TracerConfig::default();
        assert!(cfg.worker_threads > 0);
        assert!(cfg.socket_map_max_reclaim < cfg.max_socket_entries);
        assert_eq!(cfg.relay_comms, vec!["nginx".to_string()]);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let cfg: Config = toml::from_str("[tracer]\nworker_threads = 8\n").unwrap();
        assert_eq!(cfg.tracer.worker_threads, 8);
        assert_eq!(cfg.tracer.queue_size, default_queue_size());
    }
}
