//! DevTeam CLI - submit and follow runs on a DevTeam server.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use devteam_core::{
    ProcessOptions, ReplayReport, ReplayRequest, RunAccepted, RunId, RunRequest, RunStatusView,
    ToolSelection,
};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

mod client;
mod error;
mod watch;

use client::DevTeamClient;

/// DevTeam CLI - drive an LLM dev team through sprints
#[derive(Parser)]
#[command(name = "devteam")]
#[command(about = "CLI for the DevTeam orchestration server", long_about = None)]
struct Cli {
    /// Server address
    #[arg(
        short,
        long,
        env = "DEVTEAM_SERVER",
        default_value = "http://127.0.0.1:8000"
    )]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a run and follow its progress
    Run {
        /// What the team should build
        goal: String,

        /// Project directory the agents work in
        #[arg(short, long, default_value = ".")]
        dir: PathBuf,

        /// Do not pass dependency outputs to agents
        #[arg(long)]
        no_memory: bool,

        /// Allow agents to delegate work
        #[arg(long)]
        delegation: bool,

        /// "all" or a comma-separated tool allow-list
        #[arg(long, default_value = "all")]
        tools: String,

        /// Resume this run from its checkpoint
        #[arg(long, conflicts_with = "seed_from")]
        resume: Option<String>,

        /// Start a new run preloaded with another run's checkpoint
        #[arg(long)]
        seed_from: Option<String>,

        /// Return right after the run is accepted
        #[arg(long)]
        detach: bool,

        /// Polling interval in seconds when live updates are unavailable
        #[arg(long, default_value_t = 2)]
        interval: u64,
    },

    /// Show run status
    Status {
        run_id: String,

        /// Print the raw JSON status
        #[arg(long)]
        json: bool,
    },

    /// Follow a run until it finishes
    Watch {
        run_id: String,

        /// Polling interval in seconds when live updates are unavailable
        #[arg(long, default_value_t = 2)]
        interval: u64,
    },

    /// Show the outputs of a run's tasks
    Outputs { run_id: String },

    /// Cancel a run before its next task
    Cancel { run_id: String },

    /// Start the next sprint of a completed run
    Feedback {
        run_id: String,

        /// Free-text feedback for the next sprint
        feedback: String,

        /// Return right after the sprint is accepted
        #[arg(long)]
        detach: bool,

        #[arg(long, default_value_t = 2)]
        interval: u64,
    },

    /// Re-run a single task of a finished run, without dependency context
    Replay {
        run_id: String,

        /// Task id, or its position in the execution order
        task: String,

        /// Print the raw JSON report
        #[arg(long)]
        json: bool,
    },

    /// List runs
    List,

    /// Show roles and task order
    Team,

    /// Check server health
    Health,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let client = DevTeamClient::new(&cli.server);

    match cli.command {
        Commands::Run {
            goal,
            dir,
            no_memory,
            delegation,
            tools,
            resume,
            seed_from,
            detach,
            interval,
        } => {
            let target_directory = if dir.is_absolute() {
                dir
            } else {
                std::env::current_dir()?.join(dir)
            };
            let mut request = RunRequest::new(goal, target_directory);
            request.process_options = ProcessOptions {
                memory: !no_memory,
                delegation,
                tool_selection: ToolSelection::from(tools),
            };
            if let Some(run_id) = resume {
                request.resume = true;
                request.run_id = Some(RunId::new(run_id));
            }
            request.seed_from = seed_from.map(RunId::new);

            let accepted = client.create_run(&request).await?;
            follow(&client, accepted, detach, interval).await?;
        }
        Commands::Status { run_id, json } => {
            let view = client.status(&run_id).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&view)?);
            } else {
                print_status(&view);
            }
        }
        Commands::Watch { run_id, interval } => {
            let view = watch::watch(&client, &run_id, Duration::from_secs(interval)).await?;
            print_status(&view);
        }
        Commands::Outputs { run_id } => {
            let outputs = client.outputs(&run_id).await?;
            for (task_id, output) in outputs {
                let marker = if output.is_skipped() { " (skipped)" } else { "" };
                println!("== {task_id}{marker}");
                println!("{}\n", output.text().trim_end());
            }
        }
        Commands::Cancel { run_id } => {
            let view = client.cancel(&run_id).await?;
            println!(
                "Cancellation requested for {}; it stops before the next task.",
                view.run_id
            );
        }
        Commands::Feedback {
            run_id,
            feedback,
            detach,
            interval,
        } => {
            let accepted = client.feedback(&run_id, &feedback).await?;
            follow(&client, accepted, detach, interval).await?;
        }
        Commands::Replay { run_id, task, json } => {
            let report = client.replay(&run_id, &ReplayRequest::parse(&task)).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_replay(&report);
            }
        }
        Commands::List => {
            let runs = client.list_runs().await?;
            println!("Runs ({}):", runs.len());
            println!(
                "{:<36}  {:<12}  {:>6}  {:>4}  {}",
                "ID", "STATUS", "SPRINT", "PCT", "CREATED"
            );
            println!("{}", "-".repeat(84));
            for run in runs {
                println!(
                    "{:<36}  {:<12}  {:>6}  {:>3}%  {}",
                    run.run_id.as_str(),
                    run.status.as_str(),
                    run.sprint_number,
                    run.progress_percent,
                    run.created_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
        Commands::Team => {
            let team = client.team().await?;
            print_team(&team);
        }
        Commands::Health => {
            let health = client.health().await?;
            println!("{}", serde_json::to_string_pretty(&health)?);
        }
    }

    Ok(())
}

async fn follow(
    client: &DevTeamClient,
    accepted: RunAccepted,
    detach: bool,
    interval: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    println!("Run {} accepted ({})", accepted.run_id, accepted.status);
    if detach {
        return Ok(());
    }
    let view = watch::watch(
        client,
        accepted.run_id.as_str(),
        Duration::from_secs(interval),
    )
    .await?;
    print_status(&view);
    Ok(())
}

fn print_status(view: &RunStatusView) {
    println!("  ID:         {}", view.run_id);
    println!("  Goal:       {}", view.goal);
    println!("  Sprint:     {}", view.sprint_number);
    println!("  Status:     {}", view.status);
    println!(
        "  Progress:   {} ({}/{} tasks)",
        watch::progress_bar(view.progress_percent, 20),
        view.completed_task_ids.len(),
        view.total_tasks
    );
    if let Some(task) = &view.current_task_id {
        println!("  Current:    {task}");
    }
    if !view.skipped_task_ids.is_empty() {
        let skipped: Vec<&str> = view.skipped_task_ids.iter().map(|t| t.as_str()).collect();
        println!("  Skipped:    {}", skipped.join(", "));
    }
    if let Some(error) = &view.error {
        let task = error
            .task_name
            .as_deref()
            .or(error.task_id.as_ref().map(|t| t.as_str()));
        match task {
            Some(task) => println!("  Error:      {task}: {}", error.message),
            None => println!("  Error:      {}", error.message),
        }
    }
    println!(
        "  Updated:    {}",
        view.updated_at.format("%Y-%m-%d %H:%M:%S")
    );
}

fn print_replay(report: &ReplayReport) {
    let outcome = if report.succeeded { "succeeded" } else { "failed" };
    println!(
        "Replay of {} ({}) {outcome} after {} attempt(s)",
        report.task_name, report.task_id, report.attempts
    );
    if let Some(path) = &report.saved_to {
        println!("Saved to {}", path.display());
    }
    if let Some(result) = &report.result {
        println!("\n{}", result.trim_end());
    }
    if let Some(error) = &report.error {
        println!("Error: {error}");
    }
}

fn print_team(team: &Value) {
    if let Some(roles) = team["roles"].as_array() {
        println!("Roles ({}):", roles.len());
        for role in roles {
            println!(
                "  {:<22} {}",
                role["id"].as_str().unwrap_or_default(),
                role["title"].as_str().unwrap_or_default()
            );
        }
    }
    if let Some(tasks) = team["tasks"].as_array() {
        println!("\nTasks ({}):", tasks.len());
        for task in tasks {
            let deps: Vec<&str> = task["depends_on"]
                .as_array()
                .map(|d| d.iter().filter_map(Value::as_str).collect())
                .unwrap_or_default();
            println!(
                "  {:<24} {:<20} {:<11} <- {}",
                task["id"].as_str().unwrap_or_default(),
                task["role"].as_str().unwrap_or_default(),
                task["criticality"].as_str().unwrap_or_default(),
                if deps.is_empty() { "-".to_string() } else { deps.join(", ") }
            );
        }
    }
    if let Some(order) = team["task_order"].as_array() {
        let order: Vec<&str> = order.iter().filter_map(Value::as_str).collect();
        println!("\nOrder: {}", order.join(" -> "));
    }
}
