//! Command line and environment configuration

use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;
use runsync_console::RunKind;
use runsync_engine::ControllerConfig;
use runsync_job::compiler::{DEFAULT_IMAGE, DEFAULT_IMAGE_TAG};
use runsync_job::ImageDefaults;

/// runsync - runs console gates, stack runs and sentinel runs as Kubernetes Jobs
#[derive(Parser, Debug, Clone)]
#[command(name = "runsync", version, about, long_about = None)]
pub struct Cli {
    /// Print the RunJob CRD and exit
    #[arg(long)]
    pub crd: bool,

    /// Console base URL
    #[arg(long, env = "CONSOLE_URL", required_unless_present = "crd")]
    pub console_url: Option<String>,

    /// Console deploy token, also handed to every run
    #[arg(long, env = "CONSOLE_TOKEN", hide_env_values = true, required_unless_present = "crd")]
    pub console_token: Option<String>,

    /// Namespace for RunJobs, Jobs and Secrets
    #[arg(long, env = "RUNSYNC_NAMESPACE", default_value = "runsync")]
    pub namespace: String,

    /// Seconds between polls of the console
    #[arg(long, env = "POLL_INTERVAL_SECS", default_value_t = 120)]
    pub poll_interval_secs: u64,

    /// Upper bound in seconds of the random delay before a polled run is
    /// queued; defaults to the poll interval
    #[arg(long, env = "POLL_JITTER_SECS")]
    pub poll_jitter_secs: Option<u64>,

    /// Seconds a fetched run stays cached
    #[arg(long, env = "CACHE_TTL_SECS", default_value_t = 60)]
    pub cache_ttl_secs: u64,

    /// Workers per run kind
    #[arg(long, env = "MAX_CONCURRENT_RECONCILES", default_value_t = 20)]
    pub workers: usize,

    /// Seconds a stack or sentinel run may stay unfinished
    #[arg(long, env = "RUN_TIMEOUT_SECS", default_value_t = 600)]
    pub run_timeout_secs: u64,

    /// Runs fetched per page
    #[arg(long, env = "PAGE_SIZE", default_value_t = 100)]
    pub page_size: usize,

    /// Execution image
    #[arg(long, env = "DEFAULT_IMAGE", default_value = DEFAULT_IMAGE)]
    pub default_image: String,

    /// Execution image tag
    #[arg(long, env = "IMAGE_TAG", default_value = DEFAULT_IMAGE_TAG)]
    pub image_tag: String,

    /// Seconds between checks for stalled controllers
    #[arg(long, env = "SUPERVISOR_INTERVAL_SECS", default_value_t = 30)]
    pub supervisor_interval_secs: u64,

    /// Address for the event and health endpoints
    #[arg(long, env = "RUNSYNC_LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,
}

impl Cli {
    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }

    pub fn images(&self) -> ImageDefaults {
        ImageDefaults {
            image: self.default_image.clone(),
            tag: self.image_tag.clone(),
            ..Default::default()
        }
    }

    pub fn supervisor_interval(&self) -> Duration {
        Duration::from_secs(self.supervisor_interval_secs.max(1))
    }

    pub fn controller_config(&self, kind: RunKind) -> ControllerConfig {
        let poll_interval = Duration::from_secs(self.poll_interval_secs.max(1));
        ControllerConfig {
            kind,
            poll_interval,
            poll_jitter: self
                .poll_jitter_secs
                .map_or(poll_interval, Duration::from_secs),
            cache_ttl: Duration::from_secs(self.cache_ttl_secs),
            workers: self.workers.max(1),
            page_size: self.page_size.max(1),
        }
    }
}
