/// PoB gateway - build data acquisition service for Path of Exile characters
use pob_gateway::{
    config::ServerConfig, context::AppContext, error::GatewayResult, jobs::JobScheduler, server,
};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> GatewayResult<()> {
    // Initialize logging, LOG_FORMAT=json switches to structured output
    let json_logs = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pob_gateway=debug,tower_http=info".into()),
        )
        .with(json_logs.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json_logs).then(|| tracing_subscriber::fmt::layer()))
        .init();

    print_banner();

    let config = ServerConfig::from_env()?;
    let ctx = Arc::new(AppContext::new(config).await?);

    let scheduler = Arc::new(JobScheduler::new(Arc::clone(&ctx)));
    scheduler.start();

    let result = server::serve((*ctx).clone()).await;
    scheduler.shutdown();

    result
}

fn print_banner() {
    println!(
        r#"
    ____        ____     ______      __
   / __ \____  / __ )   / ____/___ _/ /____ _      ______ ___  __
  / /_/ / __ \/ __  |  / / __/ __ `/ __/ _ \ | /| / / __ `/ / / /
 / ____/ /_/ / /_/ /  / /_/ / /_/ / /_/  __/ |/ |/ / /_/ / /_/ /
/_/    \____/_____/   \____/\__,_/\__/\___/|__/|__/\__,_/\__, /
                                                        /____/
        Path of Building gateway v{}
        "#,
        env!("CARGO_PKG_VERSION")
    );
}
