// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Command-line front end for the `vmtest` guest helpers.

use anyhow::Context;
use clap::Args;
use clap::Parser;
use clap::Subcommand;
use clap::ValueEnum;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use vmtest::CopyDirection;
use vmtest::GuestEndpoint;
use vmtest::HarnessConfig;
use vmtest::RemoteShell;
use vmtest::ScriptRunner;
use vmtest::inspect;
use vmtest::locate::GuestLocator;
use vmtest::locate::HyperVLocator;
use vmtest::locate::VirshLocator;
use vmtest::probe::probe_port;
use vmtest::wait;

#[derive(Parser)]
#[command(name = "vmtest-tool", about = "Drive VM integration test guests over ssh", version)]
struct Cli {
    /// JSON harness configuration. Defaults are used when omitted.
    #[clap(long, env = "VMTEST_CONFIG")]
    config: Option<PathBuf>,

    /// Log at debug level (overridden by RUST_LOG).
    #[clap(short, long)]
    verbose: bool,

    #[command(flatten)]
    overrides: Overrides,

    #[command(subcommand)]
    command: Command,
}

/// Per-invocation overrides of the configuration file.
#[derive(Args)]
struct Overrides {
    /// Guest login user.
    #[clap(long, global = true)]
    user: Option<String>,
    /// Guest SSH port.
    #[clap(long, global = true)]
    port: Option<u16>,
    /// Directory retrieved logs are moved into.
    #[clap(long, global = true)]
    log_dir: Option<PathBuf>,
    /// Directory for transient staging files.
    #[clap(long, global = true)]
    work_dir: Option<PathBuf>,
}

impl Overrides {
    fn apply(self, config: &mut HarnessConfig) {
        if let Some(user) = self.user {
            config.user = user;
        }
        if let Some(port) = self.port {
            config.ssh_port = port;
        }
        if self.log_dir.is_some() {
            config.log_dir = self.log_dir;
        }
        if let Some(work_dir) = self.work_dir {
            config.work_dir = work_dir;
        }
    }
}

/// A guest reached over ssh.
#[derive(Args)]
struct GuestArgs {
    /// Guest address.
    address: String,
    /// Private key file name inside the key directory.
    #[clap(long, default_value = "id_rsa")]
    key: String,
}

#[derive(Clone, Copy, ValueEnum)]
enum Hypervisor {
    Libvirt,
    HyperV,
}

#[derive(Subcommand)]
enum Command {
    /// Run a command on the guest and print its output
    Exec {
        #[command(flatten)]
        guest: GuestArgs,
        /// Command line to run.
        command: String,
    },
    /// Copy a file or directory to the guest
    CopyTo {
        #[command(flatten)]
        guest: GuestArgs,
        /// Local source.
        local: PathBuf,
        /// Remote destination, relative to the guest's home directory.
        remote: String,
    },
    /// Copy a file or directory from the guest
    CopyFrom {
        #[command(flatten)]
        guest: GuestArgs,
        /// Remote source, relative to the guest's home directory.
        remote: String,
        /// Local destination.
        local: PathBuf,
    },
    /// Check once whether a TCP port accepts connections
    Probe {
        /// Host address.
        address: String,
        /// Port; defaults to the configured SSH port.
        #[clap(long)]
        probe_port: Option<u16>,
    },
    /// Wait for the guest's SSH port to open
    WaitPort {
        /// Guest address.
        address: String,
    },
    /// Wait for the guest to answer over ssh
    WaitSsh {
        #[command(flatten)]
        guest: GuestArgs,
    },
    /// Look up a VM's address and wait for its SSH port to open
    WaitBoot {
        /// VM name.
        vm: String,
        #[clap(long, value_enum, default_value = "libvirt")]
        hypervisor: Hypervisor,
    },
    /// Wait for the guest's SSH port to close
    WaitShutdown {
        /// Guest address.
        address: String,
    },
    /// Print a VM's IPv4 address
    Locate {
        /// VM name.
        vm: String,
        #[clap(long, value_enum, default_value = "libvirt")]
        hypervisor: Hypervisor,
    },
    /// Run a test script on the guest and report its verdict
    RunScript {
        #[command(flatten)]
        guest: GuestArgs,
        /// Script file name inside the script directory.
        script: String,
        /// Override the polling budget.
        #[clap(long)]
        budget: Option<u32>,
    },
    /// Print the guest's distribution
    Distro {
        #[command(flatten)]
        guest: GuestArgs,
    },
    /// Check that kernel modules are loaded on the guest
    Module {
        #[command(flatten)]
        guest: GuestArgs,
        /// Module names.
        #[clap(required = true)]
        modules: Vec<String>,
    },
}

fn locator(hypervisor: Hypervisor) -> Box<dyn GuestLocator> {
    match hypervisor {
        Hypervisor::Libvirt => Box::new(VirshLocator { uri: None }),
        Hypervisor::HyperV => Box::new(HyperVLocator),
    }
}

impl GuestArgs {
    fn endpoint(&self, config: &HarnessConfig) -> GuestEndpoint {
        config.endpoint(&self.address, &self.key)
    }
}

fn verdict(ok: bool) -> ExitCode {
    if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default.into()),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut config = match &cli.config {
        Some(path) => HarnessConfig::load(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => HarnessConfig::default(),
    };
    cli.overrides.apply(&mut config);

    let code = match cli.command {
        Command::Exec { guest, command } => {
            let ssh = config.ssh_client()?;
            let output = ssh
                .exec(&guest.endpoint(&config), &command)
                .with_context(|| format!("failed to run `{command}`"))?;
            println!("{output}");
            ExitCode::SUCCESS
        }
        Command::CopyTo {
            guest,
            local,
            remote,
        } => {
            let ssh = config.ssh_client()?;
            ssh.copy(&guest.endpoint(&config), &local, &remote, CopyDirection::ToGuest)
                .with_context(|| format!("failed to copy {} to the guest", local.display()))?;
            ExitCode::SUCCESS
        }
        Command::CopyFrom {
            guest,
            remote,
            local,
        } => {
            let ssh = config.ssh_client()?;
            ssh.copy(&guest.endpoint(&config), &local, &remote, CopyDirection::FromGuest)
                .with_context(|| format!("failed to copy {remote} from the guest"))?;
            ExitCode::SUCCESS
        }
        Command::Probe {
            address,
            probe_port: port,
        } => {
            let port = port.unwrap_or(config.ssh_port);
            let open = probe_port(
                &address,
                port,
                Duration::from_secs(config.probe_timeout_secs),
            );
            println!("{}", if open { "open" } else { "closed" });
            verdict(open)
        }
        Command::WaitPort { address } => verdict(wait::wait_for_port(
            &address,
            config.ssh_port,
            &config.wait_settings(),
        )),
        Command::WaitSsh { guest } => {
            let ssh = config.ssh_client()?;
            verdict(wait::wait_for_shell(
                &ssh,
                &guest.endpoint(&config),
                &config.wait_settings(),
            ))
        }
        Command::WaitBoot { vm, hypervisor } => {
            match wait::wait_for_boot(
                &locator(hypervisor),
                &vm,
                config.ssh_port,
                &config.wait_settings(),
            ) {
                Some(address) => {
                    println!("{address}");
                    ExitCode::SUCCESS
                }
                None => ExitCode::FAILURE,
            }
        }
        Command::WaitShutdown { address } => verdict(wait::wait_for_shutdown(
            &address,
            config.ssh_port,
            &config.wait_settings(),
        )),
        Command::Locate { vm, hypervisor } => {
            match locator(hypervisor)
                .locate(&vm)
                .with_context(|| format!("failed to look up {vm}"))?
            {
                Some(address) => {
                    println!("{address}");
                    ExitCode::SUCCESS
                }
                None => {
                    tracing::warn!(%vm, "vm has no IPv4 address");
                    ExitCode::FAILURE
                }
            }
        }
        Command::RunScript {
            guest,
            script,
            budget,
        } => {
            if let Some(budget) = budget {
                config.poll_budget = budget;
            }
            let runner = ScriptRunner::new(config.ssh_client()?, config.runner_settings());
            let outcome = runner.run(&guest.endpoint(&config), &script);
            println!("{script}: {outcome}");
            verdict(outcome.succeeded())
        }
        Command::Distro { guest } => {
            let ssh = config.ssh_client()?;
            println!("{}", inspect::detect_distro(&ssh, &guest.endpoint(&config)));
            ExitCode::SUCCESS
        }
        Command::Module { guest, modules } => {
            let ssh = config.ssh_client()?;
            let modules: Vec<&str> = modules.iter().map(String::as_str).collect();
            let results = inspect::check_kernel_modules(&ssh, &guest.endpoint(&config), &modules);
            for (module, loaded) in &results {
                println!("{module}: {}", if *loaded { "loaded" } else { "missing" });
            }
            verdict(results.iter().all(|(_, loaded)| *loaded))
        }
    };
    Ok(code)
}
