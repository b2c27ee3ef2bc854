use cmdb_reconcile::config::AppConfig;
use cmdb_reconcile::run_server;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if it exists
    dotenvy::dotenv().ok();

    // Info by default, sqlx kept quiet; RUST_LOG still overrides both
    use env_logger::Builder;
    use log::LevelFilter;

    Builder::new()
        .filter_level(LevelFilter::Info)
        .filter_module("sqlx", LevelFilter::Warn)
        .parse_default_env()
        .init();

    println!("CMDB reconcile: service template and topology server");

    let config = AppConfig::load()?;
    println!(
        "Configuration loaded: server={}:{} store={:?}",
        config.server.host, config.server.port, config.store.backend
    );

    run_server(&config).await
}
