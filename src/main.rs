use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use guetzli_service::api::server::{ApiServer, ApiServerConfig, AppState};
use guetzli_service::config::ServiceConfig;
use guetzli_service::janitor::Janitor;
use guetzli_service::job::JobCoordinator;
use guetzli_service::probe::QualityProbe;
use guetzli_service::store::ImageStore;
use guetzli_service::transform::GuetzliTransformer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "guetzli_service=info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load environment variables
    dotenvy::dotenv().ok();

    let config = ServiceConfig::from_env();
    let store = Arc::new(ImageStore::open(config.storage_base.clone())?);
    let coordinator = JobCoordinator::new(
        Arc::clone(&store),
        QualityProbe::new(),
        GuetzliTransformer::new(),
    );

    // pick up whatever a previous process left behind
    coordinator.recover().await;

    let server = ApiServer::new(
        ApiServerConfig {
            bind_address: config.bind_address.clone(),
            port: config.port,
            ..Default::default()
        },
        AppState::new(Arc::clone(&store), Arc::clone(&coordinator)),
    );

    let janitor = Janitor::new(Arc::clone(&store));
    janitor.start_background_task(server.cancel_token());

    let shutdown = server.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received");
            shutdown.cancel();
        }
    });

    server.run().await?;
    Ok(())
}
