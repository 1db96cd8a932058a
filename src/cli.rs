use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

const VERSION: &str = env!("VMSTOP_VERSION");

/// Top-level CLI definition for the `vmstop` tool.
#[derive(Debug, Parser)]
#[command(
    name = "vmstop",
    version = VERSION,
    about = "Delayed, guest-cooperative shutdown for QEMU virtual machines.",
    long_about = "vmstop counts down, warns logged-in guest users, detaches host mounts,\n\
                  asks the guest to power off over SSH and falls back to signalling the\n\
                  hypervisor process when the guest does not cooperate."
)]
pub struct Cli {
    /// Path to an explicit configuration file. Defaults to `$VMSTOP_CONFIG` when set.
    #[arg(
        global = true,
        short,
        long = "config",
        value_name = "PATH",
        help = "Load configuration from PATH instead of $VMSTOP_CONFIG or built-in defaults."
    )]
    pub config: Option<PathBuf>,

    /// Render events as JSON lines instead of human-readable text.
    #[arg(global = true, long, help = "Emit one JSON object per event on stdout")]
    pub json: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Stop a running VM after a delay. Tries an in-guest shutdown over SSH before signalling the hypervisor.
    Stop(StopArgs),
}

#[derive(Debug, Args)]
pub struct StopArgs {
    /// Name used for the VM in events and guest notices.
    #[arg(value_name = "VM")]
    pub vm: String,

    /// Hypervisor process to signal when the guest does not power itself off.
    #[arg(long, value_name = "PID", help = "PID of the hypervisor (e.g. QEMU) process")]
    pub pid: u32,

    /// Seconds to wait before the shutdown sequence starts.
    #[arg(
        long,
        value_name = "SECS",
        default_value_t = 0,
        help = "Count down SECS seconds before shutting down; 0 stops immediately"
    )]
    pub delay_secs: u64,

    #[command(flatten)]
    pub ssh: SshArgs,

    /// Command that detaches host mounts before the VM stops.
    #[arg(
        long,
        value_name = "CMD",
        help = "Run CMD through `sh -c` to unmount host shares; the VM name is passed as $1"
    )]
    pub unmount_command: Option<String>,
}

#[derive(Debug, Args, Default)]
pub struct SshArgs {
    /// Guest address; omit to skip the in-guest shutdown attempt.
    #[arg(long, value_name = "HOST", requires = "ssh_user")]
    pub ssh_host: Option<String>,

    #[arg(long, value_name = "USER", requires = "ssh_host")]
    pub ssh_user: Option<String>,

    #[arg(long, value_name = "PORT", default_value_t = 22)]
    pub ssh_port: u16,

    #[arg(long, value_name = "FILE", help = "Private key passed to ssh -i")]
    pub ssh_identity: Option<PathBuf>,

    /// Extra `-o` options forwarded to ssh.
    #[arg(long = "ssh-option", value_name = "OPTION")]
    pub ssh_options: Vec<String>,
}
