use std::process;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{Local, NaiveTime};
use clap::{Parser, Subcommand, ValueEnum};
use log::LevelFilter;

use minfin_rates::config::Config;
use minfin_rates::notifier::{LogTransport, Scheduler};
use minfin_rates::pipeline::Orchestrator;
use minfin_rates::subscriptions::{Frequency, Subscriber, SubscriptionRegistry};
use minfin_rates::types::Currency;

#[derive(Parser)]
#[command(name = "minfin-rates")]
#[command(about = "A minfin.com.ua bank exchange rate scraper and notification bot", long_about = None)]
struct Cli {
    #[arg(
        short = 'l',
        long = "log-level",
        value_enum,
        default_value = "info",
        global = true,
        help = "Set the logging level"
    )]
    log_level: LogLevel,

    #[arg(
        long,
        global = true,
        help = "Write fetched pages and table diagnostics to the debug directory"
    )]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, ValueEnum)]
enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Off => LevelFilter::Off,
            LogLevel::Error => LevelFilter::Error,
            LogLevel::Warn => LevelFilter::Warn,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Trace => LevelFilter::Trace,
        }
    }
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one scrape cycle and print the merged snapshot
    Rates {
        #[arg(
            long,
            value_parser = parse_currency,
            value_delimiter = ',',
            help = "Currencies to fetch (default: usd,eur)"
        )]
        currencies: Vec<Currency>,

        #[arg(
            short = 'o',
            long = "output",
            value_enum,
            default_value = "text",
            help = "Output format"
        )]
        format: OutputFormat,
    },
    /// Run the scrape and notification loop until interrupted
    Watch,
    /// Add or replace a subscriber
    Subscribe {
        #[arg(long, help = "Subscriber id")]
        id: i64,

        #[arg(
            long,
            value_parser = parse_currency,
            value_delimiter = ',',
            required = true,
            help = "Currencies to be notified about"
        )]
        currencies: Vec<Currency>,

        #[arg(long, value_parser = parse_frequency, default_value = "daily")]
        frequency: Frequency,

        #[arg(
            long,
            value_name = "HH:MM",
            value_parser = parse_time,
            default_value = "09:30",
            help = "Preferred notification time"
        )]
        time: NaiveTime,
    },
    /// Remove a subscriber
    Unsubscribe {
        #[arg(long, help = "Subscriber id")]
        id: i64,
    },
}

fn parse_currency(s: &str) -> Result<Currency, String> {
    Currency::from_str(s).map_err(|e| e.to_string())
}

fn parse_frequency(s: &str) -> Result<Frequency, String> {
    Frequency::from_str(s).map_err(|e| e.to_string())
}

fn parse_time(s: &str) -> Result<NaiveTime, String> {
    NaiveTime::parse_from_str(s, "%H:%M")
        .map_err(|_| format!("Invalid time '{}'. Expected HH:MM", s))
}

fn serialize_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => {
            log::error!("Error serializing to JSON: {}", e);
            process::exit(1);
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    env_logger::Builder::new()
        .filter_level(cli.log_level.clone().into())
        .init();

    let config = Config {
        debug_mode: cli.debug,
        ..Config::default()
    };

    match cli.command {
        Commands::Rates { currencies, format } => {
            let config = Config {
                currencies: if currencies.is_empty() {
                    config.currencies.clone()
                } else {
                    currencies
                },
                ..config
            };
            let mut orchestrator = Orchestrator::new(config).unwrap_or_else(|e| {
                log::error!("Error creating pipeline: {}", e);
                process::exit(1);
            });

            if let Err(e) = orchestrator.run_cycle(Local::now().naive_local()).await {
                log::error!("Scrape cycle failed: {}", e);
                process::exit(1);
            }
            if let Some(snapshot) = orchestrator.current() {
                match format {
                    OutputFormat::Json => serialize_json(snapshot),
                    OutputFormat::Text => print!("{}", snapshot),
                }
            }
        }

        Commands::Watch => {
            let mut orchestrator = Orchestrator::new(config.clone()).unwrap_or_else(|e| {
                log::error!("Error creating pipeline: {}", e);
                process::exit(1);
            });
            let registry = Arc::new(SubscriptionRegistry::open(&config.subscriptions_file));
            let scheduler = Scheduler::new(Arc::clone(&registry), Box::new(LogTransport), &config);

            log::info!(
                "Watching {} currency target(s), scrape every {:?}, notify tick every {:?}",
                config.currencies.len(),
                config.scrape_interval,
                config.tick_interval
            );

            let mut scrape = tokio::time::interval(config.scrape_interval);
            let mut tick = tokio::time::interval(config.tick_interval);
            loop {
                // A cycle or tick in progress always finishes before the
                // shutdown signal is observed.
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        log::info!("Shutting down");
                        break;
                    }
                    _ = scrape.tick() => {
                        match orchestrator.run_cycle(Local::now().naive_local()).await {
                            Ok(report) => log::info!("{}", report),
                            Err(e) => log::error!("Scrape cycle failed: {}", e),
                        }
                    }
                    _ = tick.tick() => {
                        if let Some(snapshot) = orchestrator.current() {
                            let report = scheduler
                                .run_tick(snapshot, Local::now().naive_local())
                                .await;
                            if report.due > 0 {
                                log::info!("Notification tick: {}", report);
                            }
                        } else {
                            log::debug!("No snapshot yet; skipping notification tick");
                        }
                    }
                }
            }
        }

        Commands::Subscribe {
            id,
            currencies,
            frequency,
            time,
        } => {
            let registry = SubscriptionRegistry::open(&config.subscriptions_file);
            let subscriber = Subscriber {
                id,
                currencies,
                frequency,
                preferred_time: time,
                last_notified_at: None,
            };
            if let Err(e) = registry.add(subscriber.clone()) {
                log::error!("Error saving subscription: {}", e);
                process::exit(1);
            }
            println!("Subscribed: {}", subscriber);
        }

        Commands::Unsubscribe { id } => {
            let registry = SubscriptionRegistry::open(&config.subscriptions_file);
            match registry.remove(id) {
                Ok(true) => println!("Unsubscribed {}", id),
                Ok(false) => println!("Subscriber {} was not registered", id),
                Err(e) => {
                    log::error!("Error saving subscription: {}", e);
                    process::exit(1);
                }
            }
        }
    }
}
