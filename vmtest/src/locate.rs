// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Resolving a VM name to a guest IPv4 address through the hypervisor's
//! management CLI.

use crate::CommandError;
use crate::run_host_cmd;
use std::net::Ipv4Addr;
use std::process::Command;

/// Looks up the address of a VM.
pub trait GuestLocator {
    /// Returns the first IPv4 address reported for `vm`, or `None` if the
    /// VM has none yet.
    fn locate(&self, vm: &str) -> Result<Option<String>, CommandError>;
}

impl<T: GuestLocator + ?Sized> GuestLocator for Box<T> {
    fn locate(&self, vm: &str) -> Result<Option<String>, CommandError> {
        (**self).locate(vm)
    }
}

/// Locates libvirt guests with `virsh domifaddr`.
#[derive(Debug, Clone)]
pub struct VirshLocator {
    /// Optional libvirt connection URI, e.g. `qemu:///system`.
    pub uri: Option<String>,
}

impl GuestLocator for VirshLocator {
    fn locate(&self, vm: &str) -> Result<Option<String>, CommandError> {
        let mut cmd = Command::new("virsh");
        if let Some(uri) = &self.uri {
            cmd.arg("--connect").arg(uri);
        }
        cmd.arg("domifaddr").arg(vm);
        Ok(parse_domifaddr(&run_host_cmd(cmd)?))
    }
}

/// Locates Hyper-V guests with `Get-VMNetworkAdapter`.
#[derive(Debug, Clone)]
pub struct HyperVLocator;

impl GuestLocator for HyperVLocator {
    fn locate(&self, vm: &str) -> Result<Option<String>, CommandError> {
        let mut cmd = Command::new("powershell.exe");
        cmd.arg("-NoProfile").arg("-NonInteractive").arg("-Command").arg(format!(
            "Get-VMNetworkAdapter -VMName '{}' | Select-Object -ExpandProperty IPAddresses",
            vm.replace('\'', "''")
        ));
        Ok(first_ipv4(run_host_cmd(cmd)?.lines()))
    }
}

/// Parses `virsh domifaddr` output:
///
/// ```text
///  Name       MAC address          Protocol     Address
/// -------------------------------------------------------------------------------
///  vnet0      52:54:00:6b:3c:58    ipv4         192.168.122.217/24
/// ```
fn parse_domifaddr(output: &str) -> Option<String> {
    first_ipv4(output.lines().filter_map(|line| {
        let mut columns = line.split_whitespace();
        let protocol = columns.nth(2)?;
        if protocol != "ipv4" {
            return None;
        }
        let address = columns.next()?;
        Some(address.split('/').next().unwrap_or(address))
    }))
}

fn first_ipv4<'a>(candidates: impl IntoIterator<Item = &'a str>) -> Option<String> {
    candidates
        .into_iter()
        .map(str::trim)
        .find(|s| s.parse::<Ipv4Addr>().is_ok())
        .map(str::to_owned)
}
