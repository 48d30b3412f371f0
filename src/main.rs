mod error;
mod logging;

use crate::error::{ErrorKind, Result};
use clap::Parser;
use exn::ResultExt;
use picsmap_config::Config;
use picsmap_index::PersistenceMerger;
use picsmap_protocol::transport::LineTransport;
use picsmap_protocol::{Session, Timeouts};
use picsmap_sync::{Collector, EnumerationSettings, FetchSettings, RunMode, RunSummary, SyncSettings, WebApiListing};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "picsmap")]
#[command(version, about = "Build and maintain a depot to app index from the catalog's change feed")]
struct Cli {
    /// Only process changes since the cursor stored in the existing index.
    #[arg(long, visible_alias = "incremental", conflicts_with = "full_update")]
    incremental_only: bool,

    /// Rebuild from the full catalog, ignoring the stored cursor's history.
    #[arg(long, visible_alias = "full")]
    full_update: bool,

    /// Config file (TOML, YAML or JSON).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Index file to read and write; overrides the configured `output`.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Increase logging verbosity (use together with RUST_LOG for fine control).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    fn mode(&self) -> RunMode {
        match (self.incremental_only, self.full_update) {
            (true, _) => RunMode::Incremental,
            (_, true) => RunMode::Full,
            _ => RunMode::Auto,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    match run(cli).await {
        Ok(summary) => {
            println!(
                "{} depot mappings across {} depots ({} apps), change number {}",
                summary.mappings, summary.depots, summary.apps, summary.cursor
            );
            ExitCode::SUCCESS
        },
        Err(e) => {
            eprintln!("Error: {e:?}");
            ExitCode::FAILURE
        },
    }
}

async fn run(cli: Cli) -> Result<RunSummary> {
    let mut config = picsmap_config::load(cli.config.as_deref()).or_raise(|| ErrorKind::Config)?;
    if let Some(output) = cli.output.clone() {
        config.output = output;
    }
    let listing =
        WebApiListing::new(config.listing.url.as_str(), config.listing.timeout()).or_raise(|| ErrorKind::Config)?;
    let merger = PersistenceMerger::new(&config.output)
        .with_source(config.persistence.source_tag.as_str())
        .with_update_interval(time::Duration::hours(i64::from(config.persistence.update_interval_hours)));

    tracing::info!(gateway = %config.gateway.address, "connecting");
    let transport = LineTransport::connect(config.gateway.address, config.gateway.connect_timeout())
        .await
        .or_raise(|| ErrorKind::Session)?;
    let timeouts = Timeouts {
        login: config.gateway.login_timeout(),
        call: config.fetch.call_timeout(),
        product_info: config.fetch.product_info_timeout(),
    };
    let session = Session::establish(Arc::new(transport), timeouts).await.or_raise(|| ErrorKind::Session)?;

    let collector = Collector::new(session.client().clone(), Arc::new(listing), merger, sync_settings(&config));
    let result = tokio::select! {
        result = collector.run(cli.mode()) => result.or_raise(|| ErrorKind::Collect),
        _ = tokio::signal::ctrl_c() => Err(exn::Exn::from(ErrorKind::Interrupted)),
    };
    session.close().await;
    result
}

fn sync_settings(config: &Config) -> SyncSettings {
    let enumeration = &config.enumeration;
    SyncSettings {
        enumeration: EnumerationSettings {
            window: enumeration.window,
            max_apps: enumeration.max_apps,
            max_full_update_signals: enumeration.max_full_update_signals,
            poll_delay: Duration::from_millis(enumeration.poll_delay_ms),
            stall_step: enumeration.stall_step,
            stall_delay: Duration::from_millis(enumeration.stall_delay_ms),
            full_update_delay: Duration::from_millis(enumeration.full_update_delay_ms),
        },
        fetch: FetchSettings {
            batch_size: config.fetch.batch_size,
            batch_delay: config.fetch.batch_delay(),
            progress_every: config.fetch.progress_every,
            discover_sub_products: config.fetch.discover_sub_products,
        },
        bootstrap_from_full_listing: enumeration.bootstrap_from_full_listing,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(&["picsmap"], RunMode::Auto)]
    #[case(&["picsmap", "--incremental-only"], RunMode::Incremental)]
    #[case(&["picsmap", "--incremental"], RunMode::Incremental)]
    #[case(&["picsmap", "--full-update"], RunMode::Full)]
    #[case(&["picsmap", "--full", "-vv"], RunMode::Full)]
    fn test_mode_flags(#[case] args: &[&str], #[case] expected: RunMode) {
        let cli = Cli::try_parse_from(args).unwrap();
        assert_eq!(cli.mode(), expected);
    }

    #[test]
    fn test_mode_flags_conflict() {
        let err = Cli::try_parse_from(["picsmap", "--incremental-only", "--full-update"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ArgumentConflict);
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_settings_follow_config() {
        let mut config = Config::default();
        config.fetch.batch_size = 10;
        config.enumeration.poll_delay_ms = 0;
        config.enumeration.bootstrap_from_full_listing = false;
        let settings = sync_settings(&config);
        assert_eq!(settings.fetch.batch_size, 10);
        assert_eq!(settings.enumeration.poll_delay, Duration::ZERO);
        assert_eq!(settings.enumeration.stall_step, 500);
        assert!(!settings.bootstrap_from_full_listing);
    }

    #[test]
    fn test_cli_definition() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
