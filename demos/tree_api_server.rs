use std::collections::HashSet;
use std::env;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use axum::http::HeaderMap;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::EnvFilter;

use subseq_tree::actions::{ActionFlags, ActionSet};
use subseq_tree::api::TreeApp;
use subseq_tree::config::TreeConfig;
use subseq_tree::db::PgTreeStore;
use subseq_tree::operations::TreeOperations;
use subseq_tree::permissions::{AllowAll, AuthSubject, Authorizer};

/// Grants exactly the abilities listed in `x-dev-abilities`.
struct HeaderAbilities(HashSet<String>);

impl Authorizer for HeaderAbilities {
    fn authorize(&self, ability: &str, _subject: AuthSubject<'_>) -> bool {
        self.0.contains(ability)
    }
}

#[derive(Clone)]
struct ExampleApp {
    operations: TreeOperations<PgTreeStore>,
}

impl TreeApp for ExampleApp {
    type Store = PgTreeStore;

    fn operations(&self) -> &TreeOperations<PgTreeStore> {
        &self.operations
    }

    fn authorizer_for(&self, headers: &HeaderMap) -> Arc<dyn Authorizer> {
        match headers
            .get("x-dev-abilities")
            .and_then(|value| value.to_str().ok())
        {
            Some(raw) => Arc::new(HeaderAbilities(
                raw.split(',')
                    .map(|ability| ability.trim().to_string())
                    .filter(|ability| !ability.is_empty())
                    .collect(),
            )),
            None => Arc::new(AllowAll),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let database_url = env::var("DATABASE_URL")
        .context("DATABASE_URL is required to run demos/tree_api_server.rs")?;
    let bind = env::var("TREE_EXAMPLE_BIND").unwrap_or_else(|_| "127.0.0.1:4020".to_string());
    let bind_addr: SocketAddr = bind
        .parse()
        .with_context(|| format!("invalid TREE_EXAMPLE_BIND '{}'", bind))?;

    let config = match env::var("TREE_CONFIG") {
        Ok(path) => TreeConfig::load(Path::new(&path))
            .map_err(|err| anyhow::anyhow!("failed to load {}: {}", path, err))?,
        Err(_) => TreeConfig::default(),
    }
    .with_env_overrides()
    .map_err(|err| anyhow::anyhow!("invalid tree configuration: {}", err))?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .context("failed to connect to postgres")?;
    subseq_tree::db::create_tree_tables(&pool)
        .await
        .context("failed to run tree migrations")?;

    let store = PgTreeStore::new(pool, config.clone())
        .map_err(|err| anyhow::anyhow!("invalid tree store configuration: {}", err))?;
    let actions = ActionSet::standard(ActionFlags {
        has_create_child: true,
        has_view: true,
        has_delete: true,
        ..ActionFlags::default()
    })
    .for_model("Category");
    let app_state = ExampleApp {
        operations: TreeOperations::new(Arc::new(store), Arc::new(config), actions),
    };

    let api_v1 = Router::new()
        .route("/healthz", get(health_handler))
        .merge(subseq_tree::api::routes::<ExampleApp>());
    let app = Router::new().nest("/api/v1", api_v1).with_state(app_state);

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind listener on {}", bind_addr))?;

    tracing::info!(%bind_addr, "subseq_tree example server listening");
    tracing::info!("api base path: /api/v1");
    tracing::info!("set x-dev-abilities: create,edit,... to restrict the caller");

    axum::serve(listener, app)
        .await
        .context("example server failed")
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({
        "ok": true
    }))
}
