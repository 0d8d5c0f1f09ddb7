/**
 * MILLWATCH KERNEL - Point d'entrée du serveur
 *
 * RÔLE : Bootstrap : config, contrôleurs machines, inspecteur, diffusion
 * (WebSocket + MQTT optionnel), API HTTP, arrêt propre sur Ctrl-C.
 */

use anyhow::Context;
use millwatch_kernel::config::load_config;
use millwatch_kernel::events::EventBroadcaster;
use millwatch_kernel::health::HealthTracker;
use millwatch_kernel::http::{self, AppState};
use millwatch_kernel::manager::MachineManager;
use millwatch_kernel::mqtt::MqttSink;
use millwatch_kernel::vision::QualityInspector;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env optionnel
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("millwatch_kernel=info")),
        )
        .init();

    let cfg = load_config().await.context("loading kernel configuration")?;
    let health_tracker = HealthTracker::new();
    let broadcaster = Arc::new(EventBroadcaster::new());

    if let Some(mqtt_conf) = &cfg.mqtt {
        let sink = MqttSink::spawn(mqtt_conf, health_tracker.clone());
        broadcaster.subscribe(Arc::new(sink), mqtt_conf.filter.clone());
        info!(host = %mqtt_conf.host, topic = %mqtt_conf.topic, "mqtt event relay enabled");
    }

    let manager = Arc::new(
        MachineManager::new(cfg.manager.history_size, cfg.manager.shutdown_timeout())
            .with_broadcaster(broadcaster.clone()),
    );

    // toutes les définitions sont construites avant la première connexion
    let controllers = cfg
        .machines
        .iter()
        .map(|m| m.build(cfg.manager.poll_interval()))
        .collect::<Result<Vec<_>, _>>()
        .context("building machine controllers")?;

    for controller in controllers {
        let machine_id = controller.machine_id().to_string();
        let outcome = manager.add_controller(controller).await;
        if !outcome.is_success() {
            warn!(
                machine_id = %machine_id,
                code = ?outcome.error_code(),
                error = outcome.error().unwrap_or_default(),
                "machine not registered"
            );
        }
    }
    info!(machines = manager.machine_count(), "machine manager ready");

    let inspector = Arc::new(QualityInspector::new(cfg.inspection.clone()));

    let app_state = AppState {
        manager: manager.clone(),
        broadcaster,
        inspector,
        health_tracker,
    };
    let app = http::build_router(app_state);

    let listener = TcpListener::bind(&cfg.api.bind)
        .await
        .with_context(|| format!("binding {}", cfg.api.bind))?;
    info!(addr = %cfg.api.bind, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "cannot listen for ctrl-c");
                std::future::pending::<()>().await;
            }
        })
        .await
        .context("http server")?;

    info!("shutting down");
    manager.shutdown().await;
    Ok(())
}
