//! Worker-pool initialization. All parallelism in this crate goes through
//! the global rayon pool; this helper lets hosts size it from the
//! environment once at startup.

use crate::{Result, SgmError};
use std::env;
use std::sync::OnceLock;

static THREAD_POOL_INIT: OnceLock<std::result::Result<(), String>> = OnceLock::new();

/// Initializes the global rayon pool from `CVSGM_CPU_THREADS` if the
/// variable is set. Repeated calls are idempotent and return the first
/// initialization result.
pub fn init_global_thread_pool() -> Result<()> {
    THREAD_POOL_INIT
        .get_or_init(|| {
            let Some(num_threads) = read_cpu_threads_from_env().map_err(|e| e.to_string())? else {
                return Ok(());
            };

            rayon::ThreadPoolBuilder::new()
                .num_threads(num_threads)
                .build_global()
                .map_err(|e| {
                    format!(
                        "Failed to initialize global thread pool with \
                         CVSGM_CPU_THREADS={num_threads}: {e}"
                    )
                })
        })
        .as_ref()
        .map_err(|e| SgmError::InvalidConfiguration(e.clone()))?;
    Ok(())
}

fn read_cpu_threads_from_env() -> Result<Option<usize>> {
    let raw = match env::var("CVSGM_CPU_THREADS") {
        Ok(v) => v,
        Err(env::VarError::NotPresent) => return Ok(None),
        Err(e) => {
            return Err(SgmError::InvalidConfiguration(format!(
                "Failed to read CVSGM_CPU_THREADS: {e}"
            )))
        }
    };
    parse_cpu_threads(&raw).map(Some)
}

fn parse_cpu_threads(raw: &str) -> Result<usize> {
    let parsed: usize = raw.parse().map_err(|_| {
        SgmError::InvalidConfiguration(format!(
            "CVSGM_CPU_THREADS must be a positive integer, got '{raw}'"
        ))
    })?;
    if parsed == 0 {
        return Err(SgmError::InvalidConfiguration(
            "CVSGM_CPU_THREADS must be >= 1".to_string(),
        ));
    }
    Ok(parsed)
}
