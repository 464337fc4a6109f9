use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use directories::ProjectDirs;
use tower_http::cors::CorsLayer;

use federation_core::api::v1::{self, ApiState};
use federation_core::dispatcher::Dispatcher;
use federation_core::providers::HttpBackends;
use federation_core::store::{init_db, SqliteRecords};

fn workspace_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("FEDERATION_DATA_DIR") {
        return PathBuf::from(dir);
    }
    if let Some(proj) = ProjectDirs::from("dev", "Federation", "Federation") {
        proj.data_dir().to_path_buf()
    } else {
        std::env::temp_dir().join("federation")
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let pool = init_db(workspace_dir()).context("failed to init database")?;
    let records = SqliteRecords::new(pool.clone());
    let backend = Arc::new(HttpBackends::new()?);
    let dispatcher = Dispatcher::new(pool.clone(), records, backend)?;

    let state = ApiState { dispatcher, pool };
    let app = v1::router(state).layer(CorsLayer::permissive());

    let addr = std::env::var("FEDERATION_ADDR").unwrap_or_else(|_| "127.0.0.1:8765".to_string());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(%addr, "federation server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("server terminated")?;
    Ok(())
}
