#[tokio::main]
async fn main() -> meshmap_server::Result<()> {
    meshmap_server::init_tracing();
    let config_path = meshmap_server::parse_args()?;
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = config_path.as_deref().unwrap_or("config"),
        "meshmap server starting"
    );
    meshmap_server::run(config_path.as_deref()).await
}
