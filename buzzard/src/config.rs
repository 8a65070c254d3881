use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use buzzard_ebpf_common::{TC_INGRESS_PROGRAM, VETH_PREFIX};
use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Clone, Subcommand, Debug)]
pub enum Commands {
    /// Keep the firewall and cgroup policy table in sync with running containers
    Agent(AgentArgs),
}

#[derive(Parser, Debug, Clone)]
pub struct AgentArgs {
    /// Path of the coordination database
    #[arg(long, env = "BUZZARD_DATABASE", default_value = "/var/lib/buzzard/buzzard.db")]
    pub database: PathBuf,

    /// Milliseconds a writer waits on a locked database
    #[arg(long, env = "BUZZARD_BUSY_TIMEOUT_MS", default_value_t = 5000)]
    pub busy_timeout: u64,

    /// Docker engine API socket
    #[arg(long, env = "DOCKER_SOCKET", default_value = "/var/run/docker.sock")]
    pub docker_socket: PathBuf,

    /// Mount point of procfs, used to reach a container's cgroup root
    #[arg(long, default_value = "/proc")]
    pub proc_root: PathBuf,

    /// Sysfs directory listing host network interfaces
    #[arg(long, default_value = "/sys/class/net")]
    pub sys_class_net: PathBuf,

    /// Name prefix of container veth interfaces
    #[arg(long, default_value = VETH_PREFIX)]
    pub interface_prefix: String,

    /// Compiled object holding the TC ingress classifier
    #[arg(
        long,
        env = "BUZZARD_TC_OBJECT",
        default_value = "/usr/lib/buzzard/firewall_container.o"
    )]
    pub tc_object: PathBuf,

    /// Name of the classifier program inside the object
    #[arg(long, default_value = TC_INGRESS_PROGRAM)]
    pub tc_program: String,

    /// Pinned location of the cgroup policy table
    #[arg(
        long,
        env = "BUZZARD_POLICY_MAP",
        default_value = "/sys/fs/bpf/map_container_cgroup_ids"
    )]
    pub policy_map_pin: PathBuf,

    /// Seconds between compaction passes
    #[arg(long, default_value_t = 5)]
    pub compact_interval: u64,

    /// Seconds between cgroup resolution and policy table sync passes
    #[arg(long, default_value_t = 3)]
    pub map_sync_interval: u64,

    /// Seconds between attachment reconciliation passes
    #[arg(long, default_value_t = 5)]
    pub attach_interval: u64,

    /// Metrics listener for agent
    #[arg(long, default_value = "0.0.0.0:9090")]
    pub metrics_address: SocketAddr,
}

impl AgentArgs {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout)
    }

    pub fn compact_interval(&self) -> Duration {
        Duration::from_secs(self.compact_interval.max(1))
    }

    pub fn map_sync_interval(&self) -> Duration {
        Duration::from_secs(self.map_sync_interval.max(1))
    }

    pub fn attach_interval(&self) -> Duration {
        Duration::from_secs(self.attach_interval.max(1))
    }
}
