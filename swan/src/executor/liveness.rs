// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{Context, Result};
use log::debug;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::thread::sleep;
use std::time::{Duration, Instant};

use super::{log_output, stop_clean_erase, TaskHandle};
use crate::error::SwanError;

const RETRY_INTERVAL: Duration = Duration::from_millis(100);
const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);

fn resolve(address: &str) -> Result<Vec<SocketAddr>> {
    Ok(address
        .to_socket_addrs()
        .with_context(|| format!("invalid address {:?}", address))?
        .collect())
}

/// Retries TCP connections to `address` until one succeeds or `timeout`
/// expires.
pub fn is_listening(address: &str, timeout: Duration) -> Result<bool> {
    let addrs = resolve(address)?;
    let deadline = Instant::now() + timeout;
    loop {
        for addr in addrs.iter() {
            let budget = CONNECT_TIMEOUT.min(deadline.saturating_duration_since(Instant::now()));
            if budget.as_nanos() == 0 {
                break;
            }
            if TcpStream::connect_timeout(addr, budget).is_ok() {
                debug!("liveness: {} is listening", addr);
                return Ok(true);
            }
        }
        if Instant::now() >= deadline {
            return Ok(false);
        }
        sleep(RETRY_INTERVAL);
    }
}

/// Probes `address` for a freshly launched service. On expiry the task is
/// stopped, cleaned and erased and a liveness error is returned.
pub fn ensure_listening(
    handle: &mut Box<dyn TaskHandle>,
    address: &str,
    timeout: Duration,
) -> Result<()> {
    let alive = match is_listening(address, timeout) {
        Ok(v) => v,
        Err(e) => {
            let _ = stop_clean_erase(handle.as_mut());
            return Err(e);
        }
    };
    if alive {
        return Ok(());
    }
    log_output(handle.as_ref());
    if let Err(e) = stop_clean_erase(handle.as_mut()) {
        log::error!("liveness: Failed to tear down {:?} ({:#})", handle.name(), &e);
    }
    Err(SwanError::Liveness(format!("{} at {}", handle.name(), address), timeout).into())
}
