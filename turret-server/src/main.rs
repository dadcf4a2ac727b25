use clap::Parser;
use miette::{IntoDiagnostic, Result};
use std::net::SocketAddr;
use std::time::Duration;
use tokio_graceful_shutdown::{SubsystemBuilder, SubsystemHandle, Toplevel};

use turret_server::{config::TurretConfig, hardware, web::Web, Cli, Turret};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    // RUST_LOG overrides the -v/-q level
    env_logger::Builder::new()
        .filter_level(args.verbose.log_level_filter())
        .parse_default_env()
        .init();

    let mut config = TurretConfig::load(args.config.as_deref()).into_diagnostic()?;
    config.apply_cli(&args);

    let actuator = hardware::open_actuator(
        args.driver,
        args.i2c_bus,
        &config.pantilt_hat,
        &config.stepper_hat,
    )
    .into_diagnostic()?;
    let turret = Turret::new(config, actuator, !args.no_camera);
    log::debug!("{:?}", turret);

    let addr = SocketAddr::new(args.bind, args.port);
    let subsystems = turret.clone();
    Toplevel::new(move |s: SubsystemHandle| async move {
        let camera = subsystems.camera.clone();
        s.start(SubsystemBuilder::new("Camera", |a| camera.run(a)));
        s.start(SubsystemBuilder::new("Webserver", move |a| {
            Web::new(subsystems, addr).run(a)
        }));
    })
    .catch_signals()
    .handle_shutdown_requests(Duration::from_secs(5))
    .await
    .into_diagnostic()?;

    turret.arbiter.shutdown().await;
    log::info!("Turret stopped");
    Ok(())
}
