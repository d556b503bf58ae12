use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::{DateTime, TimeDelta, Utc};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use tokio::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use timer_meta::config::AppConfig;
use timer_meta::entry::{IntervalTimerConfig, ScheduleTimerConfig, TimerMetaDataEntry};
use timer_meta::identity::{TimeoutDescriptor, TimerIndex, DEFAULT_TIMEOUT_METHOD_NAME};
use timer_meta::registry::{AutoTimer, TimerId, TimerRegistry};
use timer_meta::schedule::cron::CronScheduleProvider;
use timer_meta::schedule::{register_schedule_provider, ScheduleExpression, ScheduleTimeoutFactory};
use timer_meta::scheduler::TimerScheduler;
use timer_meta::store;
use timer_meta::wire::{JsonContextMarshaller, Marshaller};

#[derive(Parser)]
#[command(name = "timer-meta", version, about = "Clustered timer metadata CLI")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Fire due timers until interrupted
    Run,
    /// Manage stored timers
    Timer {
        #[command(subcommand)]
        command: TimerCommands,
    },
}

#[derive(Subcommand)]
enum TimerCommands {
    /// Create an interval or single-action timer
    CreateInterval {
        /// RFC 3339 instant; defaults to now
        #[arg(long)]
        start: Option<DateTime<Utc>>,
        /// Omit for a single-action timer
        #[arg(long)]
        interval_ms: Option<i64>,
        #[command(flatten)]
        context: ContextArgs,
    },
    /// Create a calendar timer
    CreateSchedule {
        #[command(flatten)]
        schedule: ScheduleArgs,
        #[command(flatten)]
        method: MethodArgs,
        #[command(flatten)]
        context: ContextArgs,
    },
    /// Create an automatic calendar timer once per class, method and ordinal
    Auto {
        #[arg(long)]
        class: String,
        #[arg(long, default_value_t = 0)]
        ordinal: u32,
        #[command(flatten)]
        schedule: ScheduleArgs,
        #[command(flatten)]
        method: MethodArgs,
        #[command(flatten)]
        context: ContextArgs,
    },
    /// List stored timers with their next timeout
    List,
    /// Show the details of one timer
    Show {
        #[arg(long)]
        id: TimerId,
    },
    /// Record a timeout without invoking any callback
    Fire {
        #[arg(long)]
        id: TimerId,
        /// Defaults to the timer's next timeout
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },
    /// Remove a timer
    Cancel {
        #[arg(long)]
        id: TimerId,
    },
    /// Print the stored encoding as hex
    Encode {
        #[arg(long)]
        id: TimerId,
    },
}

#[derive(Args)]
struct ContextArgs {
    /// JSON payload handed back on timeout
    #[arg(long)]
    context: Option<String>,
}

impl ContextArgs {
    fn value(&self) -> Result<Value> {
        match &self.context {
            Some(json) => Ok(serde_json::from_str(json)?),
            None => Ok(Value::Null),
        }
    }
}

#[derive(Args)]
struct MethodArgs {
    #[arg(long, default_value = DEFAULT_TIMEOUT_METHOD_NAME)]
    method: String,
    #[arg(long, default_value_t = 1)]
    params: u32,
}

impl MethodArgs {
    fn descriptor(&self) -> TimeoutDescriptor {
        TimeoutDescriptor::new(self.method.clone(), self.params)
    }
}

#[derive(Args)]
struct ScheduleArgs {
    #[arg(long)]
    second: Option<String>,
    #[arg(long)]
    minute: Option<String>,
    #[arg(long)]
    hour: Option<String>,
    #[arg(long)]
    day_of_month: Option<String>,
    #[arg(long)]
    month: Option<String>,
    #[arg(long)]
    day_of_week: Option<String>,
    #[arg(long)]
    year: Option<String>,
    #[arg(long)]
    zone: Option<String>,
    #[arg(long)]
    not_before: Option<DateTime<Utc>>,
    #[arg(long)]
    not_after: Option<DateTime<Utc>>,
}

impl ScheduleArgs {
    fn expression(&self, cfg: &AppConfig) -> ScheduleExpression {
        let defaults = ScheduleExpression::default();
        ScheduleExpression {
            second: self.second.clone().unwrap_or(defaults.second),
            minute: self.minute.clone().unwrap_or(defaults.minute),
            hour: self.hour.clone().unwrap_or(defaults.hour),
            day_of_month: self.day_of_month.clone().unwrap_or(defaults.day_of_month),
            month: self.month.clone().unwrap_or(defaults.month),
            day_of_week: self.day_of_week.clone().unwrap_or(defaults.day_of_week),
            year: self.year.clone().unwrap_or(defaults.year),
            zone: self.zone.clone().or_else(|| cfg.default_zone.clone()),
            start: self.not_before,
            end: self.not_after,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run().await,
        Commands::Timer { command } => handle_timer(command),
    }
}

fn open_registry(cfg: &AppConfig) -> Result<TimerRegistry<Value>> {
    register_schedule_provider(Arc::new(CronScheduleProvider));
    let store = store::open_store(cfg)?;
    Ok(TimerRegistry::new(
        store,
        JsonContextMarshaller,
        ScheduleTimeoutFactory::discover(),
    ))
}

async fn run() -> Result<()> {
    let cfg = AppConfig::load()?;
    let registry = open_registry(&cfg)?;

    let handler = |id: TimerId,
                   method: &TimeoutDescriptor,
                   entry: &TimerMetaDataEntry<Value>|
     -> std::result::Result<(), timer_meta::error::BoxError> {
        info!("Timeout {} -> {} context={}", id, method, entry.context());
        Ok(())
    };
    let scheduler = TimerScheduler::new(
        registry,
        handler,
        Duration::from_millis(cfg.poll_interval_ms),
    );
    let handle = scheduler.start();

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    handle.abort();
    Ok(())
}

fn handle_timer(cmd: TimerCommands) -> Result<()> {
    let cfg = AppConfig::load()?;
    let registry = open_registry(&cfg)?;
    let factory = ScheduleTimeoutFactory::discover();

    match cmd {
        TimerCommands::CreateInterval {
            start,
            interval_ms,
            context,
        } => {
            let entry = TimerMetaDataEntry::interval(
                context.value()?,
                IntervalTimerConfig {
                    start: start.unwrap_or_else(Utc::now),
                    interval: interval_ms.map(TimeDelta::milliseconds),
                },
            );
            let id = registry.create(&entry)?;
            println!("{id}");
        }
        TimerCommands::CreateSchedule {
            schedule,
            method,
            context,
        } => {
            let config = ScheduleTimerConfig {
                expression: schedule.expression(&cfg),
                timeout_method: method.descriptor(),
            };
            let entry = TimerMetaDataEntry::schedule(context.value()?, config, &factory)?;
            let id = registry.create(&entry)?;
            println!("{id} first timeout {}", entry.start().to_rfc3339());
        }
        TimerCommands::Auto {
            class,
            ordinal,
            schedule,
            method,
            context,
        } => {
            let descriptor = method.descriptor();
            let index = TimerIndex::new(class, descriptor.clone(), ordinal);
            let config = ScheduleTimerConfig {
                expression: schedule.expression(&cfg),
                timeout_method: descriptor,
            };
            let entry = TimerMetaDataEntry::schedule(context.value()?, config, &factory)?;
            match registry.create_auto(&index, &entry)? {
                AutoTimer::Created(id) => println!("{id} created"),
                AutoTimer::Existing(id) => println!("{id} already exists"),
            }
        }
        TimerCommands::List => {
            let timers = registry.timers()?;
            if timers.is_empty() {
                println!("No timers found.");
            } else {
                println!(
                    "{:<38} {:<10} {:<27} {:<27}",
                    "ID", "Type", "Last Timeout", "Next Timeout"
                );
                println!("{:-<104}", "");
                for (id, entry) in timers {
                    println!(
                        "{:<38} {:<10} {:<27} {:<27}",
                        id,
                        entry.timer_type(),
                        format_instant(entry.last_timeout_instant()),
                        format_instant(entry.next_timeout()?),
                    );
                }
            }
        }
        TimerCommands::Show { id } => {
            let entry = registry
                .read(id)?
                .ok_or_else(|| anyhow!("timer {id} not found"))?;
            println!("Type: {}", entry.timer_type());
            println!("Start: {}", entry.start().to_rfc3339());
            if let Some(interval) = entry.interval_period() {
                println!("Interval: {}ms", interval.num_milliseconds());
            }
            if let Some(expression) = entry.expression() {
                println!("Schedule: {expression}");
                println!("Timeout method: {}", entry.timeout_method());
            }
            println!("Last timeout: {}", format_instant(entry.last_timeout_instant()));
            println!("Next timeout: {}", format_instant(entry.next_timeout()?));
            println!("Context: {}", entry.context());
        }
        TimerCommands::Fire { id, at } => {
            let entry = registry
                .read(id)?
                .ok_or_else(|| anyhow!("timer {id} not found"))?;
            let at = match at {
                Some(at) => at,
                None => entry
                    .next_timeout()?
                    .ok_or_else(|| anyhow!("timer {id} has no further timeouts"))?,
            };
            match registry.record_timeout(id, at)? {
                Some(merged) => println!(
                    "Recorded {}; next timeout {}",
                    at.to_rfc3339(),
                    format_instant(merged.next_timeout()?)
                ),
                None => println!("Timer not found."),
            }
        }
        TimerCommands::Cancel { id } => {
            if registry.cancel(id)? {
                println!("Timer cancelled.");
            } else {
                println!("Timer not found.");
            }
        }
        TimerCommands::Encode { id } => {
            let entry = registry
                .read(id)?
                .ok_or_else(|| anyhow!("timer {id} not found"))?;
            println!("{}", hex::encode(registry.marshaller().encode(&entry)?));
        }
    }
    Ok(())
}

fn format_instant(instant: Option<DateTime<Utc>>) -> String {
    instant
        .map(|instant| instant.to_rfc3339())
        .unwrap_or_else(|| "N/A".to_string())
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
