// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{anyhow, Context};
use clap::Parser;
use dropshot::{ConfigDropshot, HandlerTaskMode};
use slog::{info, o, Logger};
use vmfleet::{Registry, TransitionDelays};
use vmfleet_server::{persist, server, ui};

fn parse_log_level(s: &str) -> anyhow::Result<slog::Level> {
    s.parse().map_err(|_| anyhow::anyhow!("Invalid log level"))
}

#[derive(Debug, Parser)]
#[clap(about, version)]
/// An HTTP server managing a simulated fleet of virtual machines
enum Args {
    /// Generates the OpenAPI specification.
    OpenApi,
    /// Runs the vmfleet server.
    Run {
        /// TOML configuration file
        #[clap(long, action)]
        config: Option<PathBuf>,

        /// Listen address for the HTTP API
        #[clap(long, default_value = "0.0.0.0:8080", action)]
        address: SocketAddr,

        /// JSON file holding the initial fleet (overrides the config file)
        #[clap(long, action)]
        state_file: Option<PathBuf>,

        /// Directory to serve UI files from (overrides the config file)
        #[clap(long, action)]
        ui_folder: Option<PathBuf>,

        /// Logging level for the server
        #[clap(long, default_value_t = slog::Level::Info, value_parser = parse_log_level)]
        log_level: slog::Level,
    },
}

fn print_openapi() -> anyhow::Result<()> {
    let version = semver::Version::parse(env!("CARGO_PKG_VERSION"))?;
    let mut out = std::io::stdout().lock();
    server::api()
        .openapi("vmfleet API", version)
        .description("API for managing a simulated fleet of virtual machines.")
        .write(&mut out)
        .context("failed to write OpenAPI document")
}

/// Reads the transition delays out of `config`, refusing any the registry
/// would have to cut short.
fn transition_delays(
    config: &vmfleet_config::Transitions,
) -> anyhow::Result<TransitionDelays> {
    let delays = TransitionDelays {
        start: config.start_delay(),
        stop: config.stop_delay(),
    };
    delays.validate().context("invalid [transitions] configuration")?;
    Ok(delays)
}

/// Merges command line overrides into the configuration file, if any.
fn load_config(
    path: Option<PathBuf>,
    state_file: Option<PathBuf>,
    ui_folder: Option<PathBuf>,
) -> anyhow::Result<vmfleet_config::Config> {
    let mut config = match path {
        Some(path) => vmfleet_config::parse(&path)
            .with_context(|| format!("error reading config {}", path.display()))?,
        None => vmfleet_config::Config::default(),
    };
    if let Some(state_file) = state_file {
        config.state_file = state_file;
    }
    config.ui_folder = ui_folder.or(config.ui_folder);
    Ok(config)
}

async fn run_server(
    config: vmfleet_config::Config,
    address: SocketAddr,
    log: Logger,
) -> anyhow::Result<()> {
    let delays = transition_delays(&config.transitions)?;

    match &config.ui_folder {
        Some(folder) => {
            ui::check_folder(folder).with_context(|| {
                format!("error setting up UI folder {}", folder.display())
            })?;
            info!(log, "Serving static files for the UI";
                  "folder" => %folder.display());
        }
        None => {
            info!(log, "No UI folder given, not serving any static files")
        }
    }

    let vms = persist::load_or_init(&config.state_file, &log)
        .context("error loading initial fleet state")?;

    let registry =
        Registry::new(vms, delays, log.new(o!("component" => "registry")));
    let context = server::Context::new(
        registry,
        config.ui_folder,
        log.new(o!("component" => "server")),
    );

    // Requests run to completion even if the client disconnects.
    let config_dropshot = ConfigDropshot {
        bind_address: address,
        default_handler_task_mode: HandlerTaskMode::Detached,
        ..Default::default()
    };
    let server = server::start(&config_dropshot, context, &log)
        .map_err(|e| anyhow!("cannot listen on {address}: {e}"))
        .context("a different address can be chosen with --address")?;

    server.await.map_err(|e| anyhow!("server exited with an error: {e}"))
}

/// Terminal output for interactive use, bunyan JSON otherwise.
fn build_logger(level: slog::Level) -> Logger {
    use slog::Drain;

    fn async_drain<D>(drain: D) -> slog_async::Async
    where
        D: Drain<Ok = (), Err = slog::Never> + Send + 'static,
    {
        slog_async::Async::new(drain)
            .overflow_strategy(slog_async::OverflowStrategy::Block)
            .build_no_guard()
    }

    let drain = if atty::is(atty::Stream::Stdout) {
        let decorator = slog_term::TermDecorator::new().build();
        async_drain(slog_term::FullFormat::new(decorator).build().fuse())
    } else {
        let bunyan = slog_bunyan::with_name("vmfleet-server", std::io::stdout());
        async_drain(bunyan.build().fuse())
    };

    Logger::root(slog::LevelFilter::new(drain, level).fuse(), o!())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    match Args::parse() {
        Args::OpenApi => print_openapi(),
        Args::Run { config, address, state_file, ui_folder, log_level } => {
            let config = load_config(config, state_file, ui_folder)?;
            let log = build_logger(log_level);
            info!(log, "vmfleet-server starting";
                  "version" => env!("CARGO_PKG_VERSION"),
                  "state_file" => %config.state_file.display());
            run_server(config, address, log).await
        }
    }
}
