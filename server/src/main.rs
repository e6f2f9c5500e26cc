use server::bus::Bus;
use server::config::Config;
use server::gateway::Gateway;
use server::gateway::subscriptions;
use server::services::memory::MemoryPlatform;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();

    // The dev harness wires the in-memory platform; a real deployment
    // injects the production services here instead.
    let platform = MemoryPlatform::demo();
    let bus = Bus::new();
    let gateway = Gateway::new(config.clone(), platform.services(), bus);

    let _dispatcher = subscriptions::spawn_dispatcher(&gateway);
    let _heartbeat = gateway.spawn_heartbeat();
    let _lifecycle = gateway.spawn_lifecycle_logger();

    let app = gateway.router();
    let listener = tokio::net::TcpListener::bind(&config.bind)
        .await
        .expect("failed to bind");

    tracing::info!(bind = %config.bind, path = %config.path, mode = ?config.auth_mode, "gateway listening");
    axum::serve(listener, app).await.expect("server failed");
}
