//! Command-line interface for earlysign.
//!
//! Provides commands for inspecting a ledger (counting, listing and reading
//! events, showing orchestration runs) and a demo of the two-proportion
//! pipeline.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use crate::config;
use crate::core::Ledger;
use crate::domain::{Event, EventFilter, RunState, TimeIndex, TimeRange};
use crate::reference::two_proportions::{self, Action, Decision, TwoPropDesign, TwoPropObsBatch};

/// earlysign - Append-only event ledger for sequential decision pipelines
#[derive(Parser, Debug)]
#[command(name = "earlysign")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// Event filter flags shared by the query commands
#[derive(Args, Debug, Clone, Default)]
pub struct FilterArgs {
    /// Restrict to one entity
    #[arg(short, long)]
    pub entity: Option<String>,

    /// Restrict to one namespace (design, obs, stats, criteria, signals, lifecycle, error, ...)
    #[arg(short, long)]
    pub namespace: Option<String>,

    /// Restrict to one tag
    #[arg(short, long)]
    pub tag: Option<String>,
}

impl FilterArgs {
    pub fn to_filter(&self) -> EventFilter {
        let mut filter = EventFilter::any();
        filter.entity_id = self.entity.clone();
        filter.namespace = self.namespace.as_deref().map(Into::into);
        filter.tag = self.tag.clone();
        filter
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Count matching events
    Count {
        #[command(flatten)]
        filter: FilterArgs,
    },

    /// Print the latest matching event as JSON
    Latest {
        #[command(flatten)]
        filter: FilterArgs,
    },

    /// List matching events in ledger order
    List {
        #[command(flatten)]
        filter: FilterArgs,

        /// Maximum number of events to show (most recent)
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Show orchestration runs recorded for an entity
    Runs {
        /// Entity ID
        entity: String,
    },

    /// Run the two-proportion pipeline on synthetic data
    Demo {
        /// Entity ID to record the demo under
        #[arg(short, long, default_value = "demo")]
        entity: String,

        /// Maximum number of looks
        #[arg(short, long, default_value = "5")]
        looks: u32,

        /// Two-sided alpha
        #[arg(long, default_value = "0.05")]
        alpha: f64,
    },

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Count { filter } => count_events(&filter).await,
            Commands::Latest { filter } => show_latest(&filter).await,
            Commands::List { filter, limit } => list_events(&filter, limit).await,
            Commands::Runs { entity } => list_runs(&entity).await,
            Commands::Demo {
                entity,
                looks,
                alpha,
            } => run_demo(&entity, looks, alpha).await,
            Commands::Config => show_config(),
        }
    }
}

async fn open_ledger() -> Result<Ledger> {
    config::config()?.open_ledger().await
}

/// Count matching events
async fn count_events(filter: &FilterArgs) -> Result<()> {
    let ledger = open_ledger().await?;
    let count = ledger.reader().count(&filter.to_filter()).await?;
    println!("{}", count);
    Ok(())
}

/// Print the latest matching event
async fn show_latest(filter: &FilterArgs) -> Result<()> {
    let ledger = open_ledger().await?;
    match ledger.reader().latest(&filter.to_filter()).await? {
        Some(event) => {
            let json = serde_json::to_string_pretty(&event).context("Failed to serialize event")?;
            println!("{}", json);
        }
        None => println!("No matching events"),
    }
    Ok(())
}

/// List matching events
async fn list_events(filter: &FilterArgs, limit: usize) -> Result<()> {
    let ledger = open_ledger().await?;
    let stream = ledger.reader().iterate(&filter.to_filter()).await?;

    if stream.is_empty() {
        println!("No matching events");
        return Ok(());
    }

    let skip = stream.len().saturating_sub(limit);
    println!(
        "{:<10} {:<16} {:<10} {:<14} {:<18} {:<16}",
        "TIME", "ENTITY", "NAMESPACE", "KIND", "TAG", "PAYLOAD TYPE"
    );
    println!("{}", "-".repeat(88));
    for event in stream.skip(skip) {
        print_event_row(&event);
    }
    Ok(())
}

fn print_event_row(event: &Event) {
    println!(
        "{:<10} {:<16} {:<10} {:<14} {:<18} {:<16}",
        event.time_index(),
        event.entity_id(),
        event.namespace(),
        event.kind(),
        event.tag().unwrap_or("-"),
        event.payload_type()
    );
}

/// List orchestration runs for an entity
async fn list_runs(entity: &str) -> Result<()> {
    let cfg = config::config()?;
    let ledger = cfg.open_ledger().await?;
    let runs = cfg.orchestrator(ledger).run_history(entity).await?;

    if runs.is_empty() {
        println!("No runs found");
        return Ok(());
    }

    println!("{:<10} {:<20} {:<12} {:<40}", "TIME", "PLAN", "STATE", "DETAIL");
    println!("{}", "-".repeat(84));

    for run in runs {
        let (state, detail) = match &run.state {
            RunState::Idle => ("idle", String::new()),
            RunState::Running => ("running", String::new()),
            RunState::Completed => match &run.halted_at {
                Some(stage) => ("halted", format!("at {}", stage)),
                None => ("completed", run.stages_run.join(" -> ")),
            },
            RunState::Failed { error_kind, message } => ("failed", format!("{}: {}", error_kind, message)),
        };
        println!("{:<10} {:<20} {:<12} {:<40}", run.time_index, run.plan, state, detail);
    }

    Ok(())
}

/// Run the reference pipeline over a fixed synthetic stream of batches
async fn run_demo(entity: &str, looks: u32, alpha: f64) -> Result<()> {
    let cfg = config::config()?;
    let ledger = cfg.open_ledger().await?;
    let orchestrator = cfg.orchestrator(ledger.clone());
    let plan = two_proportions::gst_plan();

    let design = TwoPropDesign {
        alpha,
        min_observations: 2,
    };
    two_proportions::record_design(&ledger, entity, TimeIndex::look(0), &design).await?;

    // Baseline converts at 44%, variant at 56%.
    let batch = TwoPropObsBatch {
        n_a: 50,
        n_b: 50,
        m_a: 22,
        m_b: 28,
    };

    for look in 1..=looks {
        let time_index = TimeIndex::look(look);
        two_proportions::record_observation(&ledger, entity, time_index.clone(), &batch).await?;

        let report = orchestrator.run_step(&plan, entity, time_index.clone()).await?;
        println!("Look {}: {:?} ({} events written)", look, report.state, report.events_written());

        let decision: Option<Decision> = ledger
            .reader()
            .latest_decoded(
                &EventFilter::entity(entity)
                    .tag(two_proportions::DECISION_TAG)
                    .time_range(TimeRange::inclusive(time_index.clone(), time_index)),
            )
            .await?;
        if let Some(decision) = decision {
            println!(
                "  {:?}: {} (z = {:.3}, threshold = {:.3}, n = {})",
                decision.action, decision.reason, decision.z, decision.threshold, decision.total_n
            );
            if decision.action == Action::Stop {
                break;
            }
        }
    }

    Ok(())
}

/// Show the resolved configuration (for debugging)
fn show_config() -> Result<()> {
    let cfg = config::config()?;

    println!("earlysign configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!("Home:        {}", cfg.home.display());
    println!("Ledger:      {}", cfg.ledger_path().display());
    println!("Backend:     {:?}", cfg.backend);
    println!("Timeout:     {}ms", cfg.store_timeout.as_millis());
    println!();
    println!("Runtime:");
    println!("  Record continue: {}", cfg.signal_policy.record_continue);
    println!("  Max attempts:    {}", cfg.retry.max_attempts);
    println!("  Initial delay:   {}ms", cfg.retry.initial_delay_ms);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Namespace;

    #[test]
    fn test_cli_parses_filters() {
        let cli = Cli::parse_from(["earlysign", "count", "--entity", "exp#1", "--namespace", "stats"]);
        match cli.command {
            Commands::Count { filter } => {
                let filter = filter.to_filter();
                assert_eq!(filter.entity_id.as_deref(), Some("exp#1"));
                assert_eq!(filter.namespace, Some(Namespace::Statistic));
                assert!(filter.tag.is_none());
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_cli_demo_defaults() {
        let cli = Cli::parse_from(["earlysign", "demo"]);
        match cli.command {
            Commands::Demo { entity, looks, alpha } => {
                assert_eq!(entity, "demo");
                assert_eq!(looks, 5);
                assert_eq!(alpha, 0.05);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
