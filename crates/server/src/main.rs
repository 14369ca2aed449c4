use sotto_server::app::AppState;
use sotto_server::config::{self, PushMode};
use sotto_server::connection;
use sotto_server::push::{LogPush, NullPush, PushGateway};
use std::env;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::runtime::Builder;
use tracing::info;

fn main() {
    let log_filter = env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(log_filter)
        .json()
        .init();

    let config_path = env::var("SOTTO_CONFIG").unwrap_or_else(|_| "sotto.toml".to_string());
    let config = config::load_configuration(Path::new(&config_path)).expect("configuration");

    let runtime = Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("runtime");
    runtime.block_on(async move {
        let store = sotto_storage::connect(&config.postgres_dsn)
            .await
            .expect("storage");
        store.migrate().await.expect("migrations");
        let push: Arc<dyn PushGateway> = match config.push {
            PushMode::Off => Arc::new(NullPush),
            PushMode::Log => Arc::new(LogPush),
        };
        let bind = config.bind.clone();
        let state = AppState::new(config, Arc::new(store), push).expect("state");
        let listener = TcpListener::bind(&bind).await.expect("bind");
        info!(address = %bind, "sotto listening");
        connection::serve(state, listener).await;
    });
}
