// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Executable program to run the machine state reconciliation loop

use anyhow::Context;
use camino::Utf8PathBuf;
use clap::Parser;
use futures::StreamExt;
use libc::{SIGINT, SIGTERM};
use signal_hook_tokio::Signals;
use slog::{info, o};
use state_setter::{Config, Controller};
use tokio::time::Instant;

#[derive(Debug, Parser)]
#[clap(
    name = "state-setter",
    about = "Decides the lifecycle state of machines and retires them"
)]
struct Args {
    /// Run a single reconciliation cycle and exit
    #[clap(long)]
    once: bool,

    /// Log decisions without changing any machine
    #[clap(long)]
    dry_run: bool,

    #[clap(name = "CONFIG_FILE_PATH", action)]
    config_file_path: Utf8PathBuf,
}

#[tokio::main]
async fn main() {
    if let Err(error) = do_run().await {
        eprintln!("state-setter: {:#}", error);
        std::process::exit(1);
    }
}

async fn do_run() -> Result<(), anyhow::Error> {
    let args = Args::parse();

    let mut config = Config::from_file(&args.config_file_path)
        .context("failed to load configuration")?;
    config.dry_run |= args.dry_run;

    let log = config
        .log
        .to_logger("state-setter")
        .context("failed to create logger")?;
    info!(
        log,
        "starting";
        "config" => %args.config_file_path,
        "dry_run" => config.dry_run,
    );

    let mut controller = Controller::from_config(&log, &config)
        .context("failed to create HTTP clients")?;

    if args.once {
        controller
            .run_cycle(Instant::now())
            .await
            .context("reconciliation cycle failed")?;
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let signals =
        Signals::new([SIGINT, SIGTERM]).context("failed to set up signals")?;
    let signals_handle = signals.handle();
    let signal_log = log.new(o!("component" => "signals"));
    let signal_task = tokio::spawn(async move {
        let mut signal_stream = signals.fuse();
        if let Some(signal) = signal_stream.next().await {
            info!(
                signal_log,
                "caught signal; stopping after the current cycle";
                "signal" => signal,
            );
            // The controller may already have stopped.
            let _ = shutdown_tx.send(true);
        }
    });

    let result = controller.run(shutdown_rx).await;
    signals_handle.close();
    let _ = signal_task.await;
    result.context("reconciliation loop failed")
}
