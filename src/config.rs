use clap::Args;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::clean::CleanConfig;
use crate::ingest::{CrawlConfig, RetryPolicy};
use crate::lease::{LeaseConfig, UserLocks};

#[derive(Args, Debug, Clone)]
pub struct Settings {
    /// Directory holding the database and stored descriptions
    #[arg(long, global = true, env = "JOBSWEEP_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// User whose jobs, rules and queries are used
    #[arg(short, long, global = true, env = "JOBSWEEP_USER")]
    pub user: Option<String>,

    /// Title and company similarity above which the clean sweep merges jobs
    #[arg(long, global = true, env = "JOBSWEEP_SIMILARITY_THRESHOLD", default_value = "0.9")]
    pub similarity_threshold: f64,

    /// Attempts per page or listing fetch
    #[arg(long, global = true, env = "JOBSWEEP_MAX_ATTEMPTS", default_value = "3")]
    pub max_attempts: u32,

    /// Base delay for exponential backoff between attempts
    #[arg(long, global = true, env = "JOBSWEEP_RETRY_DELAY_MS", default_value = "500")]
    pub retry_delay_ms: u64,

    /// Timeout for a single HTTP request
    #[arg(long, global = true, env = "JOBSWEEP_REQUEST_TIMEOUT_SECS", default_value = "30")]
    pub request_timeout_secs: u64,

    /// Consecutive failed pages that end a crawl early
    #[arg(long, global = true, env = "JOBSWEEP_MAX_FAILED_PAGES", default_value = "3")]
    pub max_failed_pages: u32,

    /// How long crawls and maintenance wait for a conflicting sweep of the same user
    #[arg(long, global = true, env = "JOBSWEEP_LOCK_WAIT_SECS", default_value = "60")]
    pub lock_wait_secs: u64,

    /// Sweep leases not renewed for this long are considered abandoned
    #[arg(long, global = true, env = "JOBSWEEP_LOCK_STALE_SECS", default_value = "600")]
    pub lock_stale_secs: u64,

    /// Summary model (claude-haiku, claude-sonnet, api-haiku, api-sonnet, gpt-4o-mini, gpt-4o)
    #[arg(long, global = true, env = "JOBSWEEP_SUMMARY_MODEL", default_value = "claude-haiku")]
    pub model: String,
}

impl Settings {
    pub fn data_dir(&self) -> PathBuf {
        if let Some(dir) = &self.data_dir {
            return dir.clone();
        }
        match directories::ProjectDirs::from("", "", "jobsweep") {
            Some(dirs) => dirs.data_dir().to_path_buf(),
            // Fallback to current directory
            None => PathBuf::from("."),
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir().join("jobsweep.db")
    }

    pub fn username(&self) -> String {
        self.user
            .clone()
            .or_else(|| std::env::var("USER").ok())
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| "default".to_string())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, Duration::from_millis(self.retry_delay_ms))
    }

    pub fn crawl_config(&self) -> CrawlConfig {
        CrawlConfig {
            retry: self.retry_policy(),
            max_failed_pages: self.max_failed_pages.max(1),
        }
    }

    pub fn user_locks(&self) -> UserLocks {
        UserLocks::new(LeaseConfig {
            wait: Duration::from_secs(self.lock_wait_secs),
            stale_after: Duration::from_secs(self.lock_stale_secs.max(1)),
            ..LeaseConfig::default()
        })
    }

    pub fn clean_config(&self) -> CleanConfig {
        CleanConfig {
            similarity_threshold: self.similarity_threshold,
            retry: self.retry_policy(),
        }
    }
}

/// Log to stderr; `RUST_LOG` overrides the default filter.
pub fn init_logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn,jobsweep=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
