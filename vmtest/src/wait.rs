// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Waiting for guests to become reachable or unreachable.
//!
//! Every waiter charges a fixed per-attempt cost against an overall budget
//! instead of measuring wall-clock time. The number of attempts is therefore
//! bounded by `overall / attempt_cost`, and a slow attempt can make the real
//! elapsed time exceed `overall`.

use crate::locate::GuestLocator;
use crate::probe::probe_port;
use crate::shell::GuestEndpoint;
use crate::shell::RemoteShell;
use std::time::Duration;

const ECHO_TOKEN: &str = "vmtest-ready";

/// Budget and pacing for a readiness wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitSettings {
    /// Overall budget.
    pub overall: Duration,
    /// Charged against the budget for every attempt. For port probes this
    /// is also the probe's own timeout. Zero is treated as one second.
    pub attempt_cost: Duration,
    /// Pause between attempts.
    pub interval: Duration,
}

impl WaitSettings {
    fn cost(&self) -> Duration {
        if self.attempt_cost.is_zero() {
            Duration::from_secs(1)
        } else {
            self.attempt_cost
        }
    }
}

fn poll_budgeted(settings: &WaitSettings, mut attempt: impl FnMut() -> bool) -> bool {
    let cost = settings.cost();
    let mut remaining = settings.overall;
    while !remaining.is_zero() {
        if attempt() {
            return true;
        }
        remaining = remaining.saturating_sub(cost);
        if !remaining.is_zero() && !settings.interval.is_zero() {
            std::thread::sleep(settings.interval);
        }
    }
    false
}

/// Waits until `address:port` accepts connections.
pub fn wait_for_port(address: &str, port: u16, settings: &WaitSettings) -> bool {
    tracing::info!(address, port, "waiting for port to open");
    let ok = poll_budgeted(settings, || probe_port(address, port, settings.cost()));
    if ok {
        tracing::info!(address, port, "port is open");
    } else {
        tracing::warn!(address, port, "timed out waiting for port to open");
    }
    ok
}

/// Waits until `address:port` stops accepting connections, e.g. while a
/// guest shuts down.
pub fn wait_for_shutdown(address: &str, port: u16, settings: &WaitSettings) -> bool {
    tracing::info!(address, port, "waiting for port to close");
    let ok = poll_budgeted(settings, || !probe_port(address, port, settings.cost()));
    if ok {
        tracing::info!(address, port, "port is closed");
    } else {
        tracing::warn!(address, port, "timed out waiting for port to close");
    }
    ok
}

/// Waits until the guest answers a trivial echo over the remote shell.
pub fn wait_for_shell(
    shell: &impl RemoteShell,
    endpoint: &GuestEndpoint,
    settings: &WaitSettings,
) -> bool {
    tracing::info!(address = %endpoint.address, "waiting for remote shell");
    let ok = poll_budgeted(settings, || {
        match shell.exec(endpoint, &format!("echo {ECHO_TOKEN}")) {
            Ok(output) => output.contains(ECHO_TOKEN),
            Err(err) => {
                tracing::debug!(error = &err as &dyn std::error::Error, "echo attempt failed");
                false
            }
        }
    });
    if ok {
        tracing::info!(address = %endpoint.address, "remote shell is responsive");
    } else {
        tracing::warn!(address = %endpoint.address, "timed out waiting for remote shell");
    }
    ok
}

/// Waits until the VM named `vm` has an address and accepts connections on
/// `port`, and returns that address.
pub fn wait_for_boot(
    locator: &impl GuestLocator,
    vm: &str,
    port: u16,
    settings: &WaitSettings,
) -> Option<String> {
    tracing::info!(vm, port, "waiting for vm to boot");
    let mut found = None;
    poll_budgeted(settings, || {
        let address = match locator.locate(vm) {
            Ok(Some(address)) => address,
            Ok(None) => {
                tracing::debug!(vm, "vm has no address yet");
                return false;
            }
            Err(err) => {
                tracing::debug!(vm, error = &err as &dyn std::error::Error, "address lookup failed");
                return false;
            }
        };
        if probe_port(&address, port, settings.cost()) {
            found = Some(address);
            true
        } else {
            false
        }
    });
    match &found {
        Some(address) => tracing::info!(vm, %address, "vm is up"),
        None => tracing::warn!(vm, "timed out waiting for vm to boot"),
    }
    found
}
