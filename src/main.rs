use anyhow::{Context, Result};
use powershare::Config;
use powershare::station::{Station, spawn_heartbeat_sweep};
use powershare::telemetry::{TelemetryDecoder, TopicScheme, run_line_egress, run_line_ingress};
use tokio::io::BufReader;
use tracing::{error, info, warn};

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    tokio::select! {
        _ = sigint.recv()  => {},
        _ = sigterm.recv() => {},
        _ = sigquit.recv() => {},
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load().context("Failed to load configuration")?;
    powershare::logging::init_logging(&config.logging).context("Failed to initialize logging")?;

    info!(
        "Powershare {} starting for station {}",
        env!("APP_VERSION"),
        config.station.station_id
    );

    let (station, handle) = Station::new(&config, None).context("Failed to create station")?;

    // Egress: JSON lines on stdout
    let egress_task = tokio::spawn(run_line_egress(handle.subscribe_egress(), tokio::io::stdout()));

    let station_task = tokio::spawn(station.run());
    let sweep_task = spawn_heartbeat_sweep(&handle, &config.dispatcher);

    // Ingress: JSON lines on stdin
    let decoder = TelemetryDecoder::new(TopicScheme::new(
        &config.transport.topic_prefix,
        &config.station.station_id,
    ));
    let mut ingress_task = tokio::spawn(run_line_ingress(
        BufReader::new(tokio::io::stdin()),
        decoder,
        handle.sender(),
    ));

    tokio::select! {
        res = wait_for_shutdown_signal() => {
            if let Err(e) = res {
                warn!("Signal handling unavailable: {}", e);
            }
            info!("Shutdown signal received");
        }
        res = &mut ingress_task => {
            match res {
                Ok(Ok(n)) => info!("Ingress closed after {} events", n),
                Ok(Err(e)) => error!("Ingress failed: {}", e),
                Err(e) => error!("Ingress task panicked: {}", e),
            }
        }
    }

    handle.request_shutdown();
    let outcome = station_task.await.context("Station task panicked")?;
    sweep_task.abort();
    ingress_task.abort();

    // Closing the last sender lets the egress writer flush and exit
    drop(handle);
    if let Err(e) = egress_task.await {
        error!("Egress writer panicked: {}", e);
    }

    outcome.map_err(|e| anyhow::anyhow!("Station error: {}", e))?;
    info!("Powershare shutdown complete");
    Ok(())
}
