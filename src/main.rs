use clap::{ArgAction, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use owo_colors::OwoColorize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::TryRecvError};

use provider_failover::analyzer::{Analysis, FnAnalyzer, WorkItem};
use provider_failover::bulk::{BulkOrchestrator, BulkProgress};
use provider_failover::config::{ConfigError, FailoverConfig};
use provider_failover::error::{classify, ClassifiedError, ProviderFailure};
use provider_failover::health::{HealthEvent, HealthRegistry, HealthSweeper};
use provider_failover::logging::{init_logging, LoggingConfig};
use provider_failover::network::{NetworkMonitor, NetworkState, TcpProbe};
use provider_failover::notification::{Notification, NotificationRenderer, NotificationTracker};
use provider_failover::provider::Provider;

/// How often `--probe` checks connectivity.
const PROBE_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "failover")]
#[command(version)]
#[command(about = "Provider failover: error classification, circuit breaking and bulk runs")]
struct Cli {
    /// Suppress all output except errors and results
    #[arg(long, short, global = true)]
    quiet: bool,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(long, short, action = ArgAction::Count, conflicts_with = "quiet", global = true)]
    verbose: u8,

    /// Disable colors (also respects NO_COLOR environment variable)
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Classify a provider error message
    Classify {
        /// The raw error message
        message: String,

        /// Provider that produced the error
        #[arg(long, short, default_value = "gemini")]
        provider: Provider,

        /// Treat the failure as a cancelled request
        #[arg(long)]
        aborted: bool,

        /// Print the classification as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the effective configuration as TOML
    Config {
        /// Configuration file (defaults plus FAILOVER__ overrides if omitted)
        #[arg(long, short)]
        config: Option<PathBuf>,
    },

    /// List known providers
    Providers,

    /// Run a bulk job against a scripted analyzer
    DryRun {
        /// Text file with one item per non-empty line
        #[arg(long, short)]
        input: PathBuf,

        /// Make a provider always fail with a message (repeatable)
        #[arg(long = "fail", value_name = "PROVIDER=MESSAGE", value_parser = parse_failure_rule)]
        fail: Vec<(Provider, String)>,

        /// Configuration file
        #[arg(long, short)]
        config: Option<PathBuf>,

        /// Probe connectivity by connecting to HOST:PORT
        #[arg(long, value_name = "HOST:PORT")]
        probe: Option<String>,
    },
}

/// Process exit codes.
mod exit_codes {
    use std::process::ExitCode;

    /// Run completed.
    pub fn success() -> ExitCode {
        ExitCode::SUCCESS
    }

    /// Run could not start or failed.
    pub fn failed() -> ExitCode {
        ExitCode::from(1)
    }

    /// Run was aborted (Ctrl-C).
    pub fn aborted() -> ExitCode {
        ExitCode::from(130)
    }
}

fn parse_failure_rule(raw: &str) -> Result<(Provider, String), String> {
    let (provider, message) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected PROVIDER=MESSAGE, got '{}'", raw))?;
    let provider = provider.parse::<Provider>().map_err(|e| e.to_string())?;
    if message.trim().is_empty() {
        return Err("failure message must not be empty".to_string());
    }
    Ok((provider, message.to_string()))
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(&cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {}", e);
            exit_codes::failed()
        }
    }
}

async fn run(cli: &Cli) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let logging = if cli.quiet {
        LoggingConfig::quiet()
    } else {
        LoggingConfig::from_verbosity(cli.verbose)
    };
    if let Err(e) = init_logging(logging) {
        eprintln!("{}", e);
    }

    let use_color = !cli.no_color && std::env::var_os("NO_COLOR").is_none();

    match &cli.command {
        Commands::Classify {
            message,
            provider,
            aborted,
            json,
        } => {
            let failure = if *aborted {
                ProviderFailure::aborted(message.as_str())
            } else {
                ProviderFailure::new(message.as_str())
            };
            let classified = classify(&failure, *provider);
            if *json {
                println!("{}", serde_json::to_string_pretty(&classified)?);
            } else {
                print_classification(&classified, use_color);
            }
            Ok(exit_codes::success())
        }
        Commands::Config { config } => {
            let config = load_config(config.as_deref())?;
            print!("{}", config.to_toml_string()?);
            Ok(exit_codes::success())
        }
        Commands::Providers => {
            for provider in Provider::ALL {
                let reach = if provider.is_network_dependent() {
                    "network"
                } else {
                    "offline"
                };
                println!(
                    "{:<14} {:<15} {:<8} {}",
                    provider.id(),
                    provider.display_name(),
                    reach,
                    provider.description()
                );
            }
            Ok(exit_codes::success())
        }
        Commands::DryRun {
            input,
            fail,
            config,
            probe,
        } => {
            run_dry_run(
                cli,
                input,
                fail,
                config.as_deref(),
                probe.clone(),
                use_color,
            )
            .await
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<FailoverConfig, ConfigError> {
    match path {
        Some(path) => FailoverConfig::load(path),
        None => FailoverConfig::from_env(),
    }
}

fn print_classification(error: &ClassifiedError, use_color: bool) {
    let kind = if use_color {
        let color = if error.retryable {
            owo_colors::Rgb(234, 179, 8)
        } else {
            owo_colors::Rgb(239, 68, 68)
        };
        error.kind.color(color).bold().to_string()
    } else {
        error.kind.to_string()
    };

    println!("kind:       {}", kind);
    println!("provider:   {}", error.provider);
    println!("retryable:  {}", if error.retryable { "yes" } else { "no" });
    println!("strategy:   {}", error.recovery_strategy);
    if let Some(delay) = error.retry_delay() {
        println!("retry in:   {}s", delay.as_secs());
    }
    println!("message:    {}", error.user_message);
    if !error.suggested_actions.is_empty() {
        println!("actions:");
        for action in &error.suggested_actions {
            println!("  - {}", action);
        }
    }
}

/// Sentiment stand-in used by the scripted analyzer.
fn score(text: &str) -> Analysis {
    const POSITIVE: [&str; 5] = ["good", "great", "love", "excellent", "happy"];
    const NEGATIVE: [&str; 5] = ["bad", "terrible", "hate", "awful", "angry"];

    let lower = text.to_lowercase();
    let positive = POSITIVE.iter().filter(|w| lower.contains(*w)).count();
    let negative = NEGATIVE.iter().filter(|w| lower.contains(*w)).count();

    match positive.cmp(&negative) {
        std::cmp::Ordering::Greater => Analysis::new("positive", 0.6 + 0.1 * positive.min(3) as f64),
        std::cmp::Ordering::Less => Analysis::new("negative", 0.6 + 0.1 * negative.min(3) as f64),
        std::cmp::Ordering::Equal => Analysis::new("neutral", 0.5),
    }
}

/// Drains health and network events into rendered notifications.
struct NotificationPump {
    health_rx: broadcast::Receiver<HealthEvent>,
    network_rx: broadcast::Receiver<NetworkState>,
    tracker: NotificationTracker,
    renderer: NotificationRenderer,
}

impl NotificationPump {
    fn drain(&mut self) -> Vec<String> {
        let mut notifications: Vec<Notification> = Vec::new();

        loop {
            match self.health_rx.try_recv() {
                Ok(event) => notifications.extend(self.tracker.observe_health(&event)),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
        loop {
            match self.network_rx.try_recv() {
                Ok(state) => notifications.extend(self.tracker.observe_network(&state)),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }

        notifications
            .iter()
            .map(|n| self.renderer.render(n))
            .collect()
    }
}

fn print_above(bar: &ProgressBar, line: String) {
    if bar.is_hidden() {
        eprintln!("{}", line);
    } else {
        bar.println(line);
    }
}

fn progress_bar(total: usize) -> ProgressBar {
    let bar = ProgressBar::new(total as u64);
    bar.set_style(
        ProgressStyle::with_template(
            "{bar:30.color(59,130,246)/color(107,114,128)} {pos}/{len} {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▓░"),
    );
    bar
}

fn progress_message(progress: &BulkProgress) -> String {
    let mut message = format!("{:>3.0}%", progress.percent());
    if let Some(provider) = progress.current_provider {
        message.push_str(&format!(" {}", provider.display_name()));
    }
    if let Some(eta) = progress.eta() {
        message.push_str(&format!(" eta {}s", eta.as_secs()));
    }
    message
}

async fn run_dry_run(
    cli: &Cli,
    input: &Path,
    fail: &[(Provider, String)],
    config_path: Option<&Path>,
    probe: Option<String>,
    use_color: bool,
) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let config = load_config(config_path)?;
    let text = std::fs::read_to_string(input)
        .map_err(|e| format!("failed to read {}: {}", input.display(), e))?;
    let items: Vec<WorkItem> = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(WorkItem::from)
        .collect();

    let registry = Arc::new(HealthRegistry::new(config.circuit_breaker_config()));
    let monitor = Arc::new(NetworkMonitor::new(Arc::clone(&registry)));
    let sweeper = HealthSweeper::new(Arc::clone(&registry));
    sweeper.start().await;
    let probe_task = probe.map(|address| {
        let probe = TcpProbe::new(address);
        tracing::info!(address = probe.address(), "probing connectivity");
        monitor.spawn_probe(probe, PROBE_INTERVAL)
    });

    let mut pump = (!cli.quiet).then(|| NotificationPump {
        health_rx: registry.subscribe(),
        network_rx: monitor.subscribe(),
        tracker: NotificationTracker::new(config.notifications.clone())
            .with_online(monitor.is_online()),
        renderer: NotificationRenderer::new().with_colors(use_color),
    });

    let bar = if cli.quiet {
        ProgressBar::hidden()
    } else {
        progress_bar(items.len())
    };

    let failures: Arc<HashMap<Provider, String>> = Arc::new(fail.iter().cloned().collect());
    let analyzer = FnAnalyzer::new(move |provider: Provider, item: WorkItem| {
        let failures = Arc::clone(&failures);
        async move {
            match failures.get(&provider) {
                Some(message) => Err(ProviderFailure::new(message.clone())),
                None => Ok(score(&item.text)),
            }
        }
    });

    let orchestrator = BulkOrchestrator::new(Arc::clone(&registry));
    let control = orchestrator.control();
    ctrlc::set_handler(move || {
        control.abort();
    })
    .map_err(|e| format!("failed to install Ctrl-C handler: {}", e))?;

    let options = config.bulk_options();
    let result = orchestrator
        .run(&items, &analyzer, &options, |progress: &BulkProgress| {
            bar.set_position(progress.processed as u64);
            bar.set_message(progress_message(progress));
            if let Some(pump) = pump.as_mut() {
                for line in pump.drain() {
                    print_above(&bar, line);
                }
            }
        })
        .await;

    if let Some(pump) = pump.as_mut() {
        for line in pump.drain() {
            print_above(&bar, line);
        }
    }
    bar.finish_and_clear();
    sweeper.stop().await;
    if let Some(task) = probe_task {
        task.abort();
    }

    let outcome = match result {
        Ok(outcome) => outcome,
        Err(e) => {
            eprintln!("error: {}", e);
            return Ok(exit_codes::failed());
        }
    };

    println!("{}", serde_json::to_string_pretty(&outcome.stats)?);

    if outcome.stats.aborted {
        Ok(exit_codes::aborted())
    } else {
        Ok(exit_codes::success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_failure_rule() {
        assert_eq!(
            parse_failure_rule("gemini=503 Service Unavailable"),
            Ok((Provider::Gemini, "503 Service Unavailable".to_string()))
        );
        assert!(parse_failure_rule("gemini").is_err());
        assert!(parse_failure_rule("nope=boom").is_err());
        assert!(parse_failure_rule("ollama= ").is_err());
    }

    #[test]
    fn test_progress_message() {
        let progress = BulkProgress {
            processed: 5,
            total: 10,
            current_provider: Some(Provider::Ollama),
            eta_ms: Some(3_200),
            ..BulkProgress::default()
        };
        assert_eq!(
            progress_message(&progress),
            format!(" 50% {} eta 3s", Provider::Ollama.display_name())
        );
        assert_eq!(progress_message(&BulkProgress::default()), "100%");
    }

    #[test]
    fn test_score() {
        assert_eq!(score("I love this, great job").label, "positive");
        assert_eq!(score("terrible service").label, "negative");
        assert_eq!(score("the parcel arrived").label, "neutral");
    }
}
