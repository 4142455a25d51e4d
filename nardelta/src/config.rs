use std::time::Duration;

use anyhow::{Context, Result};

/// Runtime configuration, read from `nardelta_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Upstream cache hostname.
    pub upstream: String,
    /// Differ URL, or bare host (gets the default port appended).
    pub differ: String,
    pub differ_bind: String,
    pub substituter_bind: String,
    pub catalog_update_freq: Duration,
    /// Comma-separated `name-level` acceptance list.
    pub diff_algo: String,
    pub min_file_size: u64,
    pub max_file_size: u64,
    pub max_nar_size: u64,
    pub run_substituter: bool,
    pub run_differ: bool,
    /// Empty disables; `default` auto-names under the logs directory.
    pub analytics_file: String,
    pub nar_exp_buffer_entries: usize,
    pub nar_exp_buffer_bytes: u64,
    pub cache_read_url: Option<String>,
    pub cache_write_url: Option<String>,
    pub subst_idle_time: Duration,
    pub simulate_reqs: Option<String>,
    pub simulate_bases: Option<String>,

    pub nix_bin: String,
    pub nix_store_bin: String,
}

const DEFAULT_DIFFER_PORT: &str = "7420";

impl Config {
    pub fn expander_options(&self) -> nardelta_expander::ExpandOptions {
        nardelta_expander::ExpandOptions {
            buffer_entries: self.nar_exp_buffer_entries,
            buffer_bytes: self.nar_exp_buffer_bytes,
        }
    }
}

pub fn load() -> Result<Config> {
    let mut config = Config {
        upstream: var_or("nardelta_upstream", "cache.nixos.org"),
        differ: var_or("nardelta_differ", "http://localhost:7420"),
        differ_bind: var_or("nardelta_differ_bind", ":7420"),
        substituter_bind: var_or("nardelta_substituter_bind", "localhost:7419"),
        catalog_update_freq: duration_var("nardelta_catalog_update_freq", "1h")?,
        diff_algo: var_or("nardelta_diff_algo", "zstd-3,xdelta-1"),
        min_file_size: num_var("nardelta_min_file_size", 16384)?,
        max_file_size: num_var("nardelta_max_file_size", 1 << 30)?,
        max_nar_size: num_var("nardelta_max_nar_size", 4 << 30)?,
        run_substituter: bool_var("nardelta_run_substituter", true)?,
        run_differ: bool_var("nardelta_run_differ", false)?,
        // unlike the other vars, an explicitly empty value is meaningful
        // here (it disables the log)
        analytics_file: std::env::var("nardelta_analytics_file")
            .unwrap_or_else(|_| "default".to_string()),
        nar_exp_buffer_entries: num_var("nardelta_nar_expander_buffer_entries", 0)? as usize,
        nar_exp_buffer_bytes: num_var("nardelta_nar_expander_buffer_bytes", 0)?,
        cache_read_url: var_opt("nardelta_cache_read_url"),
        cache_write_url: var_opt("nardelta_cache_write_url"),
        subst_idle_time: duration_var("nardelta_subst_idle_time", "15m")?,
        simulate_reqs: var_opt("nardelta_simulate_reqs"),
        simulate_bases: var_opt("nardelta_simulate_bases"),
        nix_bin: var_or("nardelta_nix_bin", "nix"),
        nix_store_bin: var_or("nardelta_nix_store_bin", "nix-store"),
    };

    // a bare differ host gets the default port
    if !config.differ.contains('/') && !config.differ.contains(':') {
        config.differ = format!("{}:{DEFAULT_DIFFER_PORT}", config.differ);
    }

    Ok(config)
}

fn var_or(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn var_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn num_var(name: &str, default: u64) -> Result<u64> {
    match std::env::var(name) {
        Ok(v) if !v.is_empty() => v
            .parse()
            .with_context(|| format!("Couldn't parse {name}={v:?} as a number")),
        _ => Ok(default),
    }
}

fn bool_var(name: &str, default: bool) -> Result<bool> {
    match std::env::var(name) {
        Ok(v) if !v.is_empty() => match v.as_str() {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" => Ok(false),
            other => anyhow::bail!("Couldn't parse {name}={other:?} as a bool"),
        },
        _ => Ok(default),
    }
}

fn duration_var(name: &str, default: &str) -> Result<Duration> {
    let value = match std::env::var(name) {
        Ok(v) if !v.is_empty() => v,
        _ => default.to_string(),
    };
    humantime::parse_duration(&value)
        .with_context(|| format!("Couldn't parse {name}={value:?} as a duration"))
}

#[cfg(test)]
mod tests {
    use super::*;

    // env-free checks only; the loader reads the process environment
    #[test]
    fn test_defaults_parse() {
        let cfg = load().unwrap();
        assert_eq!(cfg.min_file_size, 16384);
        assert_eq!(cfg.catalog_update_freq, Duration::from_secs(3600));
        assert!(cfg.run_substituter);
    }
}
