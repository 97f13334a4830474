use clap::Parser;
use color_eyre::Result;
use serial_mux::{
    cli,
    config::Config,
    logging,
    scheduler::Scheduler,
    serial::SerialOpener,
};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = cli::Cli::parse();

    if let Some(command) = cli.command {
        cli::handle_command(command);

        return Ok(());
    }

    logging::init(cli.verbose, cli.log_dir.clone());

    let config = if let Some(config_path) = &cli.config {
        debug!(?config_path, "Config from path");
        Config::new_from_path(config_path)?
    } else {
        debug!("Default config");
        Config::default()
    };

    let config = cli.apply(config);
    config.validate()?;

    let cancel = CancellationToken::new();

    // The whole engine runs on this one thread.
    // The runtime only waits for signals.
    let mut engine = tokio::task::spawn_blocking({
        let cancel = cancel.clone();

        move || {
            let opener = SerialOpener::new(&config.device);
            Scheduler::start(&config, opener, cancel)?.run()
        }
    });

    let mut hangup = signal(SignalKind::hangup())?;
    let mut terminate = signal(SignalKind::terminate())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl-C, quitting")
        }
        _ = hangup.recv() => {
            info!("Told to hang up, quitting")
        }
        _ = terminate.recv() => {
            info!("Told to terminate, quitting")
        }
        result = &mut engine => {
            error!("Multiplexer stopped on its own");
            result??;

            return Err(color_eyre::eyre::eyre!("Multiplexer stopped unexpectedly"));
        }
    }

    cancel.cancel();

    match engine.await? {
        Ok(()) => {}
        Err(e) if e.is_cancelled() => {}
        Err(e) => return Err(e.into()),
    }

    logging::shutdown();

    Ok(())
}
