mod blacklist;
mod clean;
mod config;
mod db;
mod estimator;
mod identity;
mod ingest;
mod lease;
mod models;
mod sources;
mod status;
mod storage;
mod summarize;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use config::Settings;
use db::Database;
use ingest::{Coordinator, CrawlOutcome};
use models::{Job, Location, RuleKind, User};
use sources::{Site, SourceAdapter, WebSource};
use status::{Action, JobStatus};
use storage::{DescriptionStore, FileStore};
use summarize::ModelSummarizer;

#[derive(Parser)]
#[command(name = "jobsweep")]
#[command(about = "Crawl job boards, merge duplicate postings, and track each opening through review")]
struct Cli {
    #[command(flatten)]
    settings: Settings,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database
    Init,

    /// Crawl every saved query against its job boards
    Crawl {
        /// Only crawl this board (seek, jora, linkedin, indeed)
        #[arg(short, long)]
        site: Option<String>,
    },

    /// Merge duplicate jobs, re-apply blacklist rules, backfill descriptions
    Clean,

    /// Generate one-line summaries for listings that lack one
    Summarize,

    /// Show job counts per review stage
    Status,

    /// List jobs
    List {
        /// Filter by status (new, blacklist, easy_filter, interested, not_interested, liked, applied, complete)
        #[arg(short, long)]
        status: Option<String>,

        /// Include archived (complete) jobs
        #[arg(short, long)]
        all: bool,
    },

    /// Show job details with its listings
    Show {
        /// Job ID
        id: i64,
    },

    /// Accept a job at triage or reading
    Accept {
        /// Job ID
        id: i64,
    },

    /// Reject a job at triage, reading or applying
    Reject {
        /// Job ID
        id: i64,
    },

    /// Mark a liked job as applied
    Applied {
        /// Job ID
        id: i64,
    },

    /// Archive an applied job
    Archive {
        /// Job ID
        id: i64,
    },

    /// Manage blacklist rules
    Rule {
        #[command(subcommand)]
        command: RuleCommands,
    },

    /// Manage saved search queries
    Query {
        #[command(subcommand)]
        command: QueryCommands,
    },

    /// List triage and reading jobs with listings still lacking a summary
    MissingSummaries,
}

#[derive(Subcommand)]
enum RuleCommands {
    /// Add a rule (title: case-insensitive substring, company: exact name)
    Add {
        /// Rule type (title, company)
        kind: String,

        /// Term to match
        term: String,
    },

    /// List rules
    List,

    /// Remove a rule
    Rm {
        /// Rule ID
        id: i64,
    },
}

#[derive(Subcommand)]
enum QueryCommands {
    /// Save a search query
    Add {
        /// Search term, e.g. software-engineer
        term: String,

        /// Only remote roles
        #[arg(short, long)]
        remote: bool,

        /// Location (Australia, Brisbane, Melbourne, Sydney, Adelaide, Perth, Darwin, Hobart)
        #[arg(short, long)]
        location: Option<String>,

        /// Boards to search; all boards when omitted
        #[arg(short, long = "site")]
        sites: Vec<String>,
    },

    /// List saved queries
    List,

    /// Remove a saved query
    Rm {
        /// Query ID
        id: i64,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    config::init_logging();

    let settings = cli.settings;
    let db = Database::open(&settings.db_path())?;

    if matches!(cli.command, Commands::Init) {
        db.init()?;
        FileStore::new(&settings.data_dir())?;
    } else {
        db.ensure_initialized()?;
    }
    let user = db.get_or_create_user(&settings.username())?;

    match cli.command {
        Commands::Init => {
            if let Some(path) = db.path() {
                println!("Database initialized at {}", path.display());
            }
            println!("Using profile '{}'", user.username);
        }

        Commands::Crawl { site } => {
            let store = FileStore::new(&settings.data_dir())?;
            let web = match site {
                Some(site) => vec![WebSource::new(site.parse()?, settings.request_timeout())?],
                None => WebSource::all(settings.request_timeout())?,
            };
            let sources: Vec<&dyn SourceAdapter> = web.iter().map(|s| s as &dyn SourceAdapter).collect();
            let queries = db.list_queries(Some(user.id))?;
            if queries.is_empty() {
                println!("No saved queries. Add one with 'jobsweep query add <term>'.");
                return Ok(());
            }

            let locks = settings.user_locks();
            let coordinator = Coordinator::new(&db, &store, &locks, settings.crawl_config());
            let reports = coordinator.sweep(&sources, &queries)?;

            println!(
                "{:<10} {:<30} {:<12} {:>6} {:>6} {:>6} {:>6} {:>6}",
                "SITE", "QUERY", "OUTCOME", "PAGES", "SKIP", "JOBS", "LIST", "DESC"
            );
            println!("{}", "-".repeat(90));
            for report in &reports {
                let outcome = match report.outcome {
                    CrawlOutcome::Completed => "done",
                    CrawlOutcome::Unsupported => "unsupported",
                    CrawlOutcome::Invalid => "invalid",
                    CrawlOutcome::Aborted => "aborted",
                };
                println!(
                    "{:<10} {:<30} {:<12} {:>6} {:>6} {:>6} {:>6} {:>6}",
                    report.site,
                    truncate(&report.signature, 28),
                    outcome,
                    report.pages_walked,
                    report.pages_skipped,
                    report.jobs_created,
                    report.listings_created,
                    report.descriptions.fetched
                );
            }
            let blacklisted: usize = reports.iter().map(|r| r.blacklisted).sum();
            if blacklisted > 0 {
                println!("\n{} new job(s) blacklisted by your rules.", blacklisted);
            }
        }

        Commands::Clean => {
            let store = FileStore::new(&settings.data_dir())?;
            let web = WebSource::all(settings.request_timeout())?;
            let sources: Vec<&dyn SourceAdapter> = web.iter().map(|s| s as &dyn SourceAdapter).collect();
            let locks = settings.user_locks();

            let report = clean::clean_user(&db, &store, &sources, &locks, &settings.clean_config(), user.id)?;
            println!("Merged jobs:          {}", report.merged.jobs_absorbed);
            println!("Listings re-pointed:  {}", report.merged.listings_moved);
            println!("Blacklisted:          {}", report.reapplied.blacklisted);
            println!("Restored:             {}", report.reapplied.restored);
            println!(
                "Descriptions fetched: {} ({} already stored, {} empty, {} failed)",
                report.descriptions.fetched,
                report.descriptions.already_stored,
                report.descriptions.empty,
                report.descriptions.failed
            );
            if report.still_missing > 0 {
                println!("\nWarning: {} listings still missing descriptions", report.still_missing);
            }
        }

        Commands::Summarize => {
            let store = FileStore::new(&settings.data_dir())?;
            let summarizer = ModelSummarizer::from_model_name(&settings.model)?;
            println!("Summarizing with {}...", summarizer.model_name());
            let report = summarize::summarize_pending(&db, &store, &summarizer, user.id)?;
            println!("Summarized:       {}", report.summarized);
            println!("No description:   {}", report.not_available);
            println!("Blacklist marked: {}", report.marked_blacklist);
            if report.failed > 0 {
                println!("Failed:           {}", report.failed);
            }
        }

        Commands::Status => {
            let counts = db.stage_counts(user.id)?;
            let count_of = |status: JobStatus| {
                counts
                    .iter()
                    .find(|(s, _)| *s == status)
                    .map(|(_, n)| *n)
                    .unwrap_or(0)
            };
            println!("{:<10} {:<16} {:>6}", "STAGE", "STATUS", "JOBS");
            println!("{}", "-".repeat(34));
            for status in JobStatus::ALL {
                let stage = status.stage().unwrap_or("-");
                println!("{:<10} {:<16} {:>6}", stage, status, count_of(status));
            }

            let depths = db.list_page_counts()?;
            if !depths.is_empty() {
                println!("\n{:<10} {:<40} {:>6}", "SITE", "QUERY", "DEPTH");
                println!("{}", "-".repeat(58));
                for depth in depths {
                    println!("{:<10} {:<40} {:>6}", depth.site, truncate(&depth.query, 38), depth.pages);
                }
            }
        }

        Commands::List { status, all } => {
            let status = status.map(|s| s.parse::<JobStatus>()).transpose()?;
            let jobs = db.list_jobs(user.id, status, all)?;
            if jobs.is_empty() {
                println!("No jobs found.");
            } else {
                println!("{:<6} {:<15} {:<32} {:<22} {:>9}", "ID", "STATUS", "TITLE", "COMPANY", "AGE");
                println!("{}", "-".repeat(88));
                for job in jobs {
                    println!(
                        "{:<6} {:<15} {:<32} {:<22} {:>9}",
                        job.id,
                        job.status(),
                        truncate(&job.title, 30),
                        truncate(&job.company, 20),
                        age(&job.created_at)
                    );
                }
            }
        }

        Commands::Show { id } => {
            let job = user_job(&db, &user, id)?;
            let store = FileStore::new(&settings.data_dir())?;
            println!("Job #{}", job.id);
            println!("Title: {}", job.title);
            println!("Company: {}", job.company);
            match job.status().stage() {
                Some(stage) => println!("Status: {} ({})", job.status(), stage),
                None => println!("Status: {}", job.status()),
            }
            println!("First seen: {}", job.created_at);
            println!("Updated: {}", job.updated_at);

            for listing in db.listings_for_job(job.id)? {
                let key = listing.key();
                println!("\n--- {} (seen {}) ---", key, listing.first_seen);
                if let Ok(url) = listing.site.listing_url(&listing.id) {
                    println!("URL: {}", url);
                }
                if !listing.summary.is_empty() {
                    for line in textwrap::wrap(&listing.summary, 80) {
                        println!("{}", line);
                    }
                }
                match store.read(&key) {
                    Ok(Some(text)) => {
                        println!();
                        for line in textwrap::wrap(text.trim(), 80) {
                            println!("  {}", line);
                        }
                    }
                    Ok(None) => println!("(no description stored)"),
                    Err(e) => println!("(description unavailable: {})", e),
                }
            }
        }

        Commands::Accept { id } => apply_action(&db, &user, id, Action::Accept)?,
        Commands::Reject { id } => apply_action(&db, &user, id, Action::Reject)?,
        Commands::Applied { id } => apply_action(&db, &user, id, Action::MarkApplied)?,
        Commands::Archive { id } => apply_action(&db, &user, id, Action::Archive)?,

        Commands::Rule { command } => match command {
            RuleCommands::Add { kind, term } => {
                let kind: RuleKind = kind.parse()?;
                let (id, report) = blacklist::add_rule(&db, &settings.user_locks(), user.id, kind, &term)?;
                println!("Added {} rule #{} '{}'", kind, id, term.trim());
                println!("  {} job(s) blacklisted", report.blacklisted);
            }

            RuleCommands::List => {
                let rules = db.list_rules(user.id)?;
                if rules.is_empty() {
                    println!("No blacklist rules.");
                } else {
                    println!("{:<6} {:<8} {:<40}", "ID", "TYPE", "TERM");
                    println!("{}", "-".repeat(56));
                    for rule in rules {
                        println!("{:<6} {:<8} {:<40}", rule.id, rule.kind, truncate(&rule.term, 38));
                    }
                }
            }

            RuleCommands::Rm { id } => match blacklist::delete_rule(&db, &settings.user_locks(), user.id, id)? {
                Some(report) => {
                    println!("Removed rule #{}", id);
                    println!("  {} job(s) restored to triage", report.restored);
                }
                None => println!("Rule #{} not found.", id),
            },
        },

        Commands::Query { command } => match command {
            QueryCommands::Add {
                term,
                remote,
                location,
                sites,
            } => {
                let term = term.trim();
                if term.is_empty() {
                    return Err(anyhow!("Search term cannot be empty"));
                }
                let location = location.map(|l| l.parse::<Location>()).transpose()?;
                let sites = if sites.is_empty() {
                    Site::ALL.to_vec()
                } else {
                    sites
                        .iter()
                        .map(|s| s.parse::<Site>())
                        .collect::<Result<Vec<_>>>()?
                };
                let id = db.add_query(user.id, term, remote, location, &sites)?;
                println!("Saved query #{}", id);
            }

            QueryCommands::List => {
                let queries = db.list_queries(Some(user.id))?;
                if queries.is_empty() {
                    println!("No saved queries.");
                } else {
                    println!("{:<6} {:<36} {:<30}", "ID", "QUERY", "SITES");
                    println!("{}", "-".repeat(72));
                    for query in queries {
                        let sites = query
                            .sites
                            .iter()
                            .map(|s| s.as_str())
                            .collect::<Vec<_>>()
                            .join(",");
                        println!("{:<6} {:<36} {:<30}", query.id, truncate(&query.signature(), 34), sites);
                    }
                }
            }

            QueryCommands::Rm { id } => {
                if db.delete_query(user.id, id)? {
                    println!("Removed query #{}", id);
                } else {
                    println!("Query #{} not found.", id);
                }
            }
        },

        Commands::MissingSummaries => {
            let jobs = db.jobs_missing_summary(user.id, &[JobStatus::New, JobStatus::Interested])?;
            if jobs.is_empty() {
                println!("Every triage and reading listing has a summary.");
            } else {
                println!("{:<6} {:<12} {:<34} {:<24}", "ID", "STATUS", "TITLE", "COMPANY");
                println!("{}", "-".repeat(78));
                for job in &jobs {
                    println!(
                        "{:<6} {:<12} {:<34} {:<24}",
                        job.id,
                        job.status(),
                        truncate(&job.title, 32),
                        truncate(&job.company, 22)
                    );
                }
                println!("\n{} job(s) missing summaries. Run 'jobsweep summarize'.", jobs.len());
            }
        }
    }

    Ok(())
}

fn user_job(db: &Database, user: &User, id: i64) -> Result<Job> {
    db.get_job(id)?
        .filter(|job| job.user_id == user.id)
        .ok_or_else(|| anyhow!("Job #{} not found", id))
}

fn apply_action(db: &Database, user: &User, id: i64, action: Action) -> Result<()> {
    let job = user_job(db, user, id)?;
    let status = db
        .transition(job.id, action)
        .with_context(|| format!("Cannot {} job #{}", action, job.id))?;
    println!("Job #{} '{}' is now {}", job.id, job.title, status);
    Ok(())
}

/// Whole days since a SQLite `datetime('now')` timestamp.
fn age(timestamp: &str) -> String {
    match chrono::NaiveDateTime::parse_from_str(timestamp, "%Y-%m-%d %H:%M:%S") {
        Ok(then) => match (chrono::Utc::now().naive_utc() - then).num_days() {
            0 => "today".to_string(),
            1 => "1 day".to_string(),
            days => format!("{} days", days),
        },
        Err(_) => "-".to_string(),
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
