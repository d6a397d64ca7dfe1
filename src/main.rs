use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use validator_image::{
    config::ValidatorImageConfig, edge_router, edge_service, fallback_router, fallback_service,
    store::ObjectStore, EDGE_CACHE_TREE,
};

/// Validator image server entry point.
///
/// Always serves the authenticated fallback on `PORT` (default 8080). When
/// `EDGE_PORT` is set, the edge layer (edge cache, primary store, fallback
/// routing) is served there as well, sharing the same sled database.
///
/// Configuration comes from `VALIDATOR_IMAGE_*` environment variables and is
/// read once here; `RUST_LOG` controls verbosity (default
/// "validator_image=debug,tower_http=debug").
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "validator_image=debug,tower_http=debug".into()),
        )
        .init();

    let cfg = ValidatorImageConfig::from_env()?;
    cfg.validate()?;

    tracing::info!(
        "Starting validator-image: bucket={}, directory={}, secret fingerprint={}",
        cfg.images_bucket,
        cfg.directory_url,
        cfg.secret_fingerprint()
    );

    let db = sled::open(&cfg.store_dir)?;
    let primary = Arc::new(ObjectStore::from_db(&db, &cfg.images_bucket)?);

    // Expired objects are also dropped lazily on read; this keeps the tree small.
    let sweeper = primary.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60 * 60));
        loop {
            interval.tick().await;
            if let Err(e) = sweeper.purge_expired() {
                tracing::warn!("Primary store purge failed: {}", e);
            }
        }
    });

    let fallback_app = fallback_router(fallback_service(&cfg, Some(primary.clone()))?);

    let port = std::env::var("PORT")
        .unwrap_or_else(|_| "8080".to_string())
        .parse::<u16>()
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let fallback_listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Fallback listening on {}", addr);

    let edge_port = std::env::var("EDGE_PORT").ok().and_then(|p| p.parse::<u16>().ok());

    match edge_port {
        Some(edge_port) => {
            let cache = Arc::new(ObjectStore::from_db(&db, EDGE_CACHE_TREE)?);
            let edge_app = edge_router(edge_service(&cfg, primary, cache)?, cfg.edge.cors_enabled);
            let edge_addr = SocketAddr::from(([0, 0, 0, 0], edge_port));
            let edge_listener = tokio::net::TcpListener::bind(edge_addr).await?;
            tracing::info!("Edge listening on {}, fallback at {}", edge_addr, cfg.edge.fallback_url);

            tokio::try_join!(
                std::future::IntoFuture::into_future(axum::serve(fallback_listener, fallback_app)),
                std::future::IntoFuture::into_future(axum::serve(edge_listener, edge_app)),
            )?;
        }
        None => axum::serve(fallback_listener, fallback_app).await?,
    }
    Ok(())
}
