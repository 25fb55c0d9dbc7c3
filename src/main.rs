use clap::Parser;
use tracing::{error, info};

use gpg_bridge::cli::Cli;
use gpg_bridge::config::{Config, Mode};
use gpg_bridge::error::Result;
use gpg_bridge::lifecycle::{self, Cleanup};
use gpg_bridge::logging;
use gpg_bridge::outer::OuterBridge;

fn main() {
    let cli = Cli::parse();
    let config = match cli.into_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(e.exit_code());
        }
    };

    // Idempotent start: a live bridge on this pidfile means there is
    // nothing to do.
    if let Some(pidfile) = &config.pidfile_path {
        if lifecycle::already_running(pidfile) {
            std::process::exit(0);
        }
    }

    // Forking must precede the runtime: daemonize before anything async.
    if config.daemonize {
        if let Err(e) = lifecycle::daemonize(config.logfile_path.as_deref()) {
            eprintln!("{e}");
            std::process::exit(e.exit_code());
        }
    }

    let log_guard = logging::init(config.log_level, config.logfile_path.as_deref());

    // The pid changed across the daemonize forks; record the final one.
    if let Some(pidfile) = &config.pidfile_path {
        if let Err(e) = lifecycle::write_pidfile(pidfile) {
            error!("{e}");
            std::process::exit(e.exit_code());
        }
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("failed to start runtime: {e}");
            std::process::exit(1);
        }
    };

    let code = runtime.block_on(run(config));
    // `exit` skips destructors; flush the log writer first.
    drop(runtime);
    drop(log_guard);
    std::process::exit(code);
}

async fn run(config: Config) -> i32 {
    info!(
        "gpg-bridge v{} starting as {} bridge",
        env!("CARGO_PKG_VERSION"),
        config.mode
    );

    let mut cleanup = Cleanup::new(config.pidfile_path.clone());
    let result = match config.mode {
        Mode::Inner => run_inner(&config).await,
        Mode::Outer => run_outer(&config, &mut cleanup).await,
    };
    cleanup.run();

    match result {
        Ok(()) => 0,
        Err(e) => {
            error!("{e}");
            e.exit_code()
        }
    }
}

#[cfg(unix)]
async fn run_inner(config: &Config) -> Result<()> {
    use gpg_bridge::inner::InnerBridge;
    use gpg_bridge::launcher::WslLauncher;

    let bridge = InnerBridge::start(config, &WslLauncher).await?;
    bridge.run().await
}

#[cfg(not(unix))]
async fn run_inner(_config: &Config) -> Result<()> {
    Err(gpg_bridge::error::BridgeError::Config(
        "the inner bridge runs on the subsystem side only".to_string(),
    ))
}

async fn run_outer(config: &Config, cleanup: &mut Cleanup) -> Result<()> {
    let bridge = OuterBridge::start(config).await?;
    cleanup.register_noncefile(bridge.noncefile().clone());
    bridge.run().await
}
