//! Configuration for the evalstream server.
//!
//! Every tunable has a compile-time default and can be overridden at runtime
//! through a dedicated `EVALSTREAM_*` environment variable. Command-line
//! flags take precedence over both (see `main.rs`).

use std::net::SocketAddr;
use std::path::PathBuf;

use engine::AcquirePolicy;

/// Engine executable, looked up through `PATH`.
const DEFAULT_ENGINE_PATH: &str = "stockfish";

/// Default listen address for the HTTP server.
const DEFAULT_LISTEN_ADDR: ([u8; 4], u16) = ([127, 0, 0, 1], 8080);

/// Number of engine processes kept alive at once.
const DEFAULT_POOL_SIZE: usize = 1;

/// Resolved runtime settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub engine_path: PathBuf,
    pub engine_args: Vec<String>,
    pub listen_addr: SocketAddr,
    pub default_depth: u32,
    pub time_limit_ms: u64,
    pub pool_size: usize,
    pub acquire_policy: AcquirePolicy,
    pub log_dir: Option<PathBuf>,
}

impl Settings {
    pub fn from_env() -> Self {
        Self {
            engine_path: get_engine_path(),
            engine_args: get_engine_args(),
            listen_addr: get_listen_addr(),
            default_depth: get_default_depth(),
            time_limit_ms: get_time_limit_ms(),
            pool_size: get_pool_size(),
            acquire_policy: get_acquire_policy(),
            log_dir: get_log_dir(),
        }
    }
}

/// Get the engine executable.
///
/// Priority:
/// 1. `EVALSTREAM_ENGINE_PATH` env variable if set
/// 2. `stockfish` as fallback
pub fn get_engine_path() -> PathBuf {
    if let Ok(path) = std::env::var("EVALSTREAM_ENGINE_PATH") {
        return PathBuf::from(path);
    }

    PathBuf::from(DEFAULT_ENGINE_PATH)
}

/// Extra arguments for the engine, whitespace separated in
/// `EVALSTREAM_ENGINE_ARGS`. Empty when unset.
pub fn get_engine_args() -> Vec<String> {
    std::env::var("EVALSTREAM_ENGINE_ARGS")
        .map(|args| args.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default()
}

/// Get the HTTP listen address.
///
/// Priority:
/// 1. `EVALSTREAM_ADDR` env variable if set (falls back to the default if it
///    does not parse as a socket address)
/// 2. `127.0.0.1:8080` as fallback
pub fn get_listen_addr() -> SocketAddr {
    if let Ok(addr) = std::env::var("EVALSTREAM_ADDR") {
        if let Ok(addr) = addr.parse() {
            return addr;
        }
        tracing::warn!("Ignoring unparsable EVALSTREAM_ADDR: {}", addr);
    }

    SocketAddr::from(DEFAULT_LISTEN_ADDR)
}

/// Search depth for requests that do not name one (`EVALSTREAM_DEFAULT_DEPTH`).
pub fn get_default_depth() -> u32 {
    if let Ok(depth) = std::env::var("EVALSTREAM_DEFAULT_DEPTH") {
        return depth.parse().unwrap_or(engine::DEFAULT_DEPTH);
    }

    engine::DEFAULT_DEPTH
}

/// Time limit in milliseconds for requests that do not name one
/// (`EVALSTREAM_TIME_LIMIT_MS`).
pub fn get_time_limit_ms() -> u64 {
    if let Ok(limit) = std::env::var("EVALSTREAM_TIME_LIMIT_MS") {
        return limit.parse().unwrap_or(engine::DEFAULT_TIME_LIMIT_MS);
    }

    engine::DEFAULT_TIME_LIMIT_MS
}

/// Engine pool size (`EVALSTREAM_POOL_SIZE`). Values below 1 fall back to 1.
pub fn get_pool_size() -> usize {
    std::env::var("EVALSTREAM_POOL_SIZE")
        .ok()
        .and_then(|size| size.parse().ok())
        .filter(|size| *size > 0)
        .unwrap_or(DEFAULT_POOL_SIZE)
}

/// What happens to a request while every engine is busy
/// (`EVALSTREAM_ACQUIRE_POLICY`, `reject` or `wait`). Defaults to `reject`.
pub fn get_acquire_policy() -> AcquirePolicy {
    std::env::var("EVALSTREAM_ACQUIRE_POLICY")
        .ok()
        .and_then(|policy| policy.parse().ok())
        .unwrap_or_default()
}

/// Directory for daily-rotated log files (`EVALSTREAM_LOG_DIR`). When unset,
/// logs go to stderr.
pub fn get_log_dir() -> Option<PathBuf> {
    std::env::var("EVALSTREAM_LOG_DIR").ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_engine_path() {
        let path = get_engine_path();
        match std::env::var("EVALSTREAM_ENGINE_PATH") {
            Ok(val) => assert_eq!(path, PathBuf::from(val)),
            Err(_) => assert_eq!(path, PathBuf::from(DEFAULT_ENGINE_PATH)),
        }
    }

    #[test]
    fn test_get_listen_addr_default() {
        if std::env::var("EVALSTREAM_ADDR").is_err() {
            assert_eq!(get_listen_addr().to_string(), "127.0.0.1:8080");
        }
    }

    #[test]
    fn test_get_default_depth() {
        if std::env::var("EVALSTREAM_DEFAULT_DEPTH").is_err() {
            assert_eq!(get_default_depth(), 18);
        }
    }

    #[test]
    fn test_get_time_limit_ms() {
        if std::env::var("EVALSTREAM_TIME_LIMIT_MS").is_err() {
            assert_eq!(get_time_limit_ms(), 10_000);
        }
    }

    #[test]
    fn test_get_pool_size_is_positive() {
        assert!(get_pool_size() >= 1);
    }

    #[test]
    fn test_settings_from_env() {
        let settings = Settings::from_env();
        assert!(!settings.engine_path.as_os_str().is_empty());
        assert!(settings.pool_size >= 1);
    }

    // Note: overriding variables is not tested here to avoid polluting the
    // environment of tests running in parallel.
}
