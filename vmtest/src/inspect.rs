// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Guest inspection: distribution and kernel module queries.
//!
//! These never fail. An unreachable guest or unrecognized output yields
//! [`Distro::Unknown`] or `false`.

use crate::shell::GuestEndpoint;
use crate::shell::RemoteShell;
use std::fmt;

/// Linux distribution families the harness knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[expect(missing_docs)] // Self-describing names.
pub enum Distro {
    Ubuntu,
    CentOs,
    Fedora,
    Oracle,
    RedHat,
    Suse,
    Debian,
    Unknown,
}

impl fmt::Display for Distro {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Distro::Ubuntu => "Ubuntu",
            Distro::CentOs => "CentOS",
            Distro::Fedora => "Fedora",
            Distro::Oracle => "Oracle",
            Distro::RedHat => "RedHat",
            Distro::Suse => "SUSE",
            Distro::Debian => "Debian",
            Distro::Unknown => "Unknown",
        })
    }
}

// First match wins. Derived distributions name their parent in ID_LIKE, so
// children must come before parents.
const DISTRO_RULES: &[(&str, Distro)] = &[
    ("ubuntu", Distro::Ubuntu),
    ("centos", Distro::CentOs),
    ("oracle", Distro::Oracle),
    ("red hat", Distro::RedHat),
    ("fedora", Distro::Fedora),
    ("suse", Distro::Suse),
    ("debian", Distro::Debian),
];

/// Classifies free-form release information.
pub fn classify_distro(release_info: &str) -> Distro {
    let text = release_info.to_ascii_lowercase();
    DISTRO_RULES
        .iter()
        .find(|(pattern, _)| text.contains(*pattern))
        .map_or(Distro::Unknown, |&(_, distro)| distro)
}

/// Detects the guest's distribution from its release files.
pub fn detect_distro(shell: &impl RemoteShell, endpoint: &GuestEndpoint) -> Distro {
    match shell.exec(endpoint, "cat /etc/*release*") {
        Ok(output) => {
            let distro = classify_distro(&output);
            tracing::info!(address = %endpoint.address, %distro, "detected distribution");
            distro
        }
        Err(err) => {
            tracing::warn!(
                address = %endpoint.address,
                error = &err as &dyn std::error::Error,
                "failed to read release information"
            );
            Distro::Unknown
        }
    }
}

fn loaded_modules(lsmod: &str) -> impl Iterator<Item = &str> {
    // Skip the "Module Size Used by" header.
    lsmod
        .lines()
        .skip(1)
        .filter_map(|line| line.split_whitespace().next())
}

/// Checks whether `module` is loaded on the guest.
pub fn has_kernel_module(shell: &impl RemoteShell, endpoint: &GuestEndpoint, module: &str) -> bool {
    check_kernel_modules(shell, endpoint, &[module])
        .first()
        .is_some_and(|(_, loaded)| *loaded)
}

/// Checks several modules with a single `lsmod` call.
pub fn check_kernel_modules(
    shell: &impl RemoteShell,
    endpoint: &GuestEndpoint,
    modules: &[&str],
) -> Vec<(String, bool)> {
    let lsmod = match shell.exec(endpoint, "lsmod") {
        Ok(output) => output,
        Err(err) => {
            tracing::warn!(
                address = %endpoint.address,
                error = &err as &dyn std::error::Error,
                "failed to list kernel modules"
            );
            String::new()
        }
    };
    modules
        .iter()
        .map(|&module| {
            // lsmod reports dashes as underscores.
            let wanted = module.replace('-', "_");
            let loaded = loaded_modules(&lsmod).any(|m| m == wanted);
            if !loaded {
                tracing::info!(address = %endpoint.address, module, "module is not loaded");
            }
            (module.to_owned(), loaded)
        })
        .collect()
}
