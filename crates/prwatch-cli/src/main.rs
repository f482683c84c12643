mod logging;
mod render;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use prwatch_agent::ClaudeRemediator;
use prwatch_core::config::Config;
use prwatch_core::db::Db;
use prwatch_core::git::{repo_from_remote_url, Git};
use prwatch_core::github::{DataSource, GitHubClient};
use prwatch_core::notify::Pushover;
use prwatch_core::poller::Poller;
use prwatch_core::state::{FileStateRepository, StateRepository};
use prwatch_core::supervisor::{PsProcessRegistry, Supervisor};
use prwatch_core::ChangeRequestId;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "prwatch", version, about = "Watch a pull request's CI and react to failures")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the poller in the foreground (what `start` launches).
    Poll { repo: String, number: u64 },
    /// Launch a background poller. Defaults to the current branch's PR.
    Start { target: Option<ChangeRequestId> },
    /// Stop every poller for a pull request.
    Stop { target: Option<ChangeRequestId> },
    /// List running pollers.
    List {
        #[arg(long)]
        json: bool,
    },
    /// Terminate duplicate pollers, keeping the earliest for each PR.
    Cleanup,
    /// Print the pull request for the current checkout.
    Detect,
    /// Show failed jobs on the PR's current revision.
    Errors {
        target: Option<ChangeRequestId>,
        #[arg(long)]
        json: bool,
    },
    /// Show the event log for a pull request, newest first.
    Activity {
        target: Option<ChangeRequestId>,
        #[arg(long, default_value_t = 20)]
        limit: i64,
        #[arg(long)]
        json: bool,
    },
    /// Print the persisted poller state.
    State { target: Option<ChangeRequestId> },
    /// Mark a review comment as addressed.
    Addressed {
        target: ChangeRequestId,
        comment_id: i64,
        #[arg(long)]
        notes: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init();
    let config = Config::from_env()?;

    match cli.command {
        Command::Poll { repo, number } => poll(&config, ChangeRequestId::new(repo, number)).await,
        Command::Start { target } => {
            let id = resolve(&config, target).await?;
            let pid = supervisor(&config)?.start(&id)?;
            println!("started poller for {id} (pid {pid})");
            Ok(())
        }
        Command::Stop { target } => {
            let id = resolve(&config, target).await?;
            let n = supervisor(&config)?.stop(&id).await?;
            if n == 0 {
                println!("no poller running for {id}");
            } else {
                println!("stopped {n} poller(s) for {id}");
            }
            Ok(())
        }
        Command::List { json } => {
            let procs = supervisor(&config)?.list()?;
            if json {
                println!("{}", render::list_json(&procs)?);
            } else {
                print!("{}", render::list_human(&procs));
            }
            Ok(())
        }
        Command::Cleanup => {
            let killed = supervisor(&config)?.cleanup().await?;
            if killed.is_empty() {
                println!("no duplicate pollers");
            } else {
                println!("terminated {} duplicate poller(s): {killed:?}", killed.len());
            }
            Ok(())
        }
        Command::Detect => {
            let id = detect(&config).await?;
            println!("{id}");
            Ok(())
        }
        Command::Errors { target, json } => {
            let id = resolve(&config, target).await?;
            let db = open_db(&config)?;
            let rows = db.failed_jobs(&id)?;
            if json {
                println!("{}", render::errors_json(&id, &rows)?);
            } else {
                print!("{}", render::errors_human(&id, &rows));
            }
            Ok(())
        }
        Command::Activity {
            target,
            limit,
            json,
        } => {
            let id = resolve(&config, target).await?;
            let db = open_db(&config)?;
            let row = db
                .change_request_row_id(&id)?
                .with_context(|| format!("{id} has never been polled"))?;
            let summary = render::ActivitySummary {
                checks: db.check_count(row)?,
                unaddressed_comments: db.unaddressed_comment_count(row)?,
                entries: db.recent_activity(&id, limit)?,
            };
            if json {
                println!("{}", render::activity_json(&id, &summary)?);
            } else {
                print!("{}", render::activity_human(&id, &summary));
            }
            Ok(())
        }
        Command::State { target } => {
            let id = resolve(&config, target).await?;
            let state = FileStateRepository::new(config.state_dir()).load(&id)?;
            println!("{}", serde_json::to_string_pretty(&state)?);
            Ok(())
        }
        Command::Addressed {
            target,
            comment_id,
            notes,
        } => {
            let db = open_db(&config)?;
            let row = db
                .change_request_row_id(&target)?
                .with_context(|| format!("{target} has never been polled"))?;
            if !db.set_comment_addressed(row, comment_id, notes.as_deref())? {
                anyhow::bail!("no comment {comment_id} recorded for {target}");
            }
            println!("marked comment {comment_id} on {target} as addressed");
            Ok(())
        }
    }
}

async fn poll(config: &Config, id: ChangeRequestId) -> Result<()> {
    if config.github_token.is_empty() {
        warn!("GITHUB_TOKEN is not set; private repositories will fail and rate limits are low");
    }
    let db = Arc::new(open_db(config)?);
    let source = Arc::new(GitHubClient::new(&config.github_api_url, &config.github_token));
    let store = Arc::new(FileStateRepository::new(config.state_dir()));
    let notifier = Arc::new(Pushover::new(&config.pushover_token, &config.pushover_user));
    if !notifier.is_enabled() {
        info!("pushover credentials not set, notifications disabled");
    }

    let mut poller = Poller::new(id, source, store, notifier, db, config.poll_interval());
    if config.agent_enabled {
        let agent = ClaudeRemediator::new(&config.agent_bin, &config.agent_workdir)
            .with_timeout(config.agent_timeout());
        poller = poller.with_remediator(Arc::new(agent));
    }
    poller.run().await;
    Ok(())
}

fn open_db(config: &Config) -> Result<Db> {
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("create {}", config.data_dir.display()))?;
    let path = config.db_path();
    let mut db = Db::open(&path.to_string_lossy())?;
    db.migrate()?;
    Ok(db)
}

fn supervisor(config: &Config) -> Result<Supervisor<PsProcessRegistry>> {
    let exe = std::env::current_exe().context("cannot locate own executable")?;
    Ok(Supervisor::new(
        PsProcessRegistry::new(exe, config.log_dir()),
        config.stop_grace(),
    ))
}

async fn resolve(config: &Config, target: Option<ChangeRequestId>) -> Result<ChangeRequestId> {
    match target {
        Some(id) => Ok(id),
        None => detect(config).await,
    }
}

/// Map the current checkout (origin remote + branch) to its open PR.
async fn detect(config: &Config) -> Result<ChangeRequestId> {
    let cwd = std::env::current_dir()?;
    let git = Git::new(cwd.to_string_lossy());
    let remote = git.remote_url("origin")?;
    let repo = repo_from_remote_url(&remote)
        .with_context(|| format!("origin remote {remote:?} is not a GitHub repository"))?;
    let branch = git.current_branch()?;
    if branch == "HEAD" {
        anyhow::bail!("detached HEAD; pass owner/name#number explicitly");
    }
    let client = GitHubClient::new(&config.github_api_url, &config.github_token);
    let number = client
        .find_change_request(&repo, &branch)
        .await?
        .with_context(|| format!("no open pull request for {repo} branch {branch}"))?;
    Ok(ChangeRequestId::new(repo, number))
}
