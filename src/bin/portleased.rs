use std::path::PathBuf;

use portlease::{
    logging::init_logging,
    server::{bind, serve},
    service::RegistryService,
    settings::RegistrySettings,
    sweeper::spawn_sweeper,
};
use tokio::sync::oneshot;
use tracing::{error, info, warn};

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(1);
    let subcommand = args.next().unwrap_or_else(|| "serve".to_string());

    if subcommand != "serve" {
        eprintln!("unsupported subcommand: {subcommand}");
        usage();
        std::process::exit(2);
    }

    let mut config: Option<PathBuf> = None;
    let mut bind_override: Option<String> = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "--bind" => {
                let Some(value) = args.next() else {
                    eprintln!("{arg} requires a value");
                    std::process::exit(2);
                };
                if arg == "--config" {
                    config = Some(PathBuf::from(value));
                } else {
                    bind_override = Some(value);
                }
            }
            _ => {
                eprintln!("unknown arg: {arg}");
                usage();
                std::process::exit(2);
            }
        }
    }

    init_logging("info");

    let mut settings = match &config {
        Some(path) => RegistrySettings::load_or_default(path)?,
        None => RegistrySettings::default(),
    };
    if let Some(bind) = bind_override {
        settings.bind = bind;
    }

    let store = settings.build_store();
    if let Err(failure) = store.initialize() {
        error!(error = %failure, "cannot build port configuration catalog");
        return Err(failure.into());
    }

    let sweeper = spawn_sweeper(store.clone(), settings.sweep_interval());
    let listener = bind(&settings.bind).await?;

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("interrupt received, shutting down");
                let _ = shutdown_tx.send(());
            }
            Err(failure) => {
                warn!(error = %failure, "cannot listen for interrupts; serving until killed");
                std::future::pending::<()>().await;
                drop(shutdown_tx);
            }
        }
    });

    let served = serve(listener, RegistryService::new(store.clone()), shutdown_rx).await;
    store.destroy();
    let _ = sweeper.await;
    served?;
    Ok(())
}

fn usage() {
    eprintln!("portleased serve [--config <path>] [--bind <host:port>]");
}
