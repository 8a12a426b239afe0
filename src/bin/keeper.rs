use clap::{Parser, Subcommand};
use std::error::Error;
use std::sync::Arc;
use tracing::{error, info};
use tracing_appender::rolling;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use portal_keeper::agent_modules::config::{ConfigError, LogSettings, MonitorConfig};
use portal_keeper::agent_modules::connectivity::{assess_network_status, StrategyProber};
use portal_keeper::agent_modules::events::LogSink;
use portal_keeper::agent_modules::monitor::Monitor;
use portal_keeper::agent_modules::portal::HttpPortalBackend;
use portal_keeper::version::VERSION;

const EVENT_FEED_CAPACITY: usize = 256;

#[derive(Parser, Debug)]
#[command(author, version = VERSION, about = "Keeps a captive-portal network logged in", long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Monitor the network until Ctrl-C (default)
    Run,
    /// Validate the configuration and print it
    Check,
    /// Report the network status once
    Probe,
    /// Log in to the portal once
    Login {
        /// Retry with backoff instead of a single attempt
        #[arg(long)]
        retry: bool,
    },
    /// Check that the portal page answers
    TestPortal,
}

/// Reads the configuration while a console-only subscriber is in scope, so
/// warnings about coerced values reach the user before file logging exists.
fn load_config<W>(path: Option<&str>, console: W) -> Result<MonitorConfig, ConfigError>
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let bootstrap = tracing_subscriber::registry().with(
        fmt::layer()
            .with_writer(console)
            .with_ansi(false)
            .with_filter(LevelFilter::WARN),
    );
    tracing::subscriber::with_default(bootstrap, || MonitorConfig::load(path))
}

fn init_logging(settings: &LogSettings) {
    // Log to a file: JSON format, daily rotation
    let file_appender = rolling::daily(&settings.dir, "keeper.log");
    let file_layer = fmt::layer()
        .with_writer(file_appender)
        .with_ansi(false)
        .json();

    // The event feed already goes to stdout; only problems are echoed there.
    let stdout_layer = fmt::layer()
        .with_writer(std::io::stdout)
        .with_filter(LevelFilter::WARN);

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.level.as_str()));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stdout_layer)
        .init();
}

fn build_monitor(config: MonitorConfig, sink: LogSink) -> Monitor<HttpPortalBackend> {
    let prober = Arc::new(StrategyProber::from_settings(&config.probe));
    let backend = Arc::new(HttpPortalBackend::new(config.portal_url.clone()));
    Monitor::new(config, prober, backend, sink)
}

async fn run(config: MonitorConfig) -> Result<(), Box<dyn Error>> {
    let (sink, mut events) = LogSink::channel(EVENT_FEED_CAPACITY);
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            println!("[{}] {}", event.timestamp.format("%H:%M:%S"), event.text);
        }
    });

    let monitor = build_monitor(config, sink);
    let started = monitor.start();
    if started.is_ok() {
        tokio::signal::ctrl_c().await?;
        info!("Interrupt received.");
        monitor.stop();
        monitor.wait_stopped().await;
    }

    // Dropping the monitor closes the feed so the printer drains and ends.
    drop(monitor);
    let _ = printer.await;
    started?;
    Ok(())
}

async fn probe(config: &MonitorConfig) {
    let prober = StrategyProber::from_settings(&config.probe);
    println!("Probing with: {}", prober.strategy_names().join(", "));
    let status = assess_network_status(&prober, &config.probe.targets, config.probe.timeout).await;
    println!("Network status: {status}");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    let config = load_config(args.config.as_deref(), std::io::stderr)?;
    init_logging(&config.log);
    info!(version = VERSION, "Starting keeper...");
    info!(config = ?config, "Configuration in effect.");

    match args.command.unwrap_or(Command::Run) {
        Command::Run => run(config).await?,
        Command::Check => {
            if let Err(e) = config.validate() {
                error!(error = %e, "Configuration is invalid.");
                return Err(e.into());
            }
            println!("Configuration OK.\n{config:#?}");
        }
        Command::Probe => probe(&config).await,
        Command::Login { retry } => {
            config.validate()?;
            let monitor = build_monitor(config, LogSink::disabled());
            let outcome = if retry {
                monitor.authenticate().await
            } else {
                monitor.attempt_login().await
            };
            if !outcome.success {
                return Err(outcome.message.into());
            }
            println!("Login succeeded: {}", outcome.message);
        }
        Command::TestPortal => {
            let monitor = build_monitor(config, LogSink::disabled());
            let outcome = monitor.test_connection().await;
            if !outcome.success {
                return Err(outcome.message.into());
            }
            println!("{}", outcome.message);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Captured {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    #[test]
    fn test_coercion_warnings_reach_the_console() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "monitor_interval = 0").unwrap();
        writeln!(file, "pause_login_start_hour = 30").unwrap();

        let console = Captured::default();
        let writer = console.clone();
        let config = load_config(file.path().to_str(), move || writer.clone()).unwrap();

        assert_eq!(config.check_interval.as_secs(), 240);
        let output = console.text();
        assert!(output.contains("Invalid numeric setting"), "{output}");
        assert!(output.contains("Hour must be within 0-23"), "{output}");
    }

    #[test]
    fn test_missing_config_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.toml");

        let console = Captured::default();
        let writer = console.clone();
        load_config(missing.to_str(), move || writer.clone()).unwrap();

        assert!(console.text().contains("Config file not found"), "{}", console.text());
    }
}
