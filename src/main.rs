use anyhow::{Context, Result};
use clap::Parser;
use security_core_rs::services::pipeline::ReaperService;
use security_core_rs::{cli, clock, config, db, openapi, routes, services, state};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_governor::{governor::GovernorConfigBuilder, GovernorLayer};

async fn bind_listener(addr: &str) -> Result<TcpListener> {
    TcpListener::bind(addr).await.with_context(|| {
        format!("failed to bind alert-pipeline listener on {addr} (--port selects another port)")
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Args::parse();
    if args.print_openapi {
        println!("{}", serde_json::to_string_pretty(&openapi::openapi_json())?);
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = config::CoreConfig::from_env()?;
    let pool = db::connect_lazy(&config)?;
    db::run_migrations(&pool).await?;

    let http = reqwest::Client::new();
    let notifier = Arc::new(services::notification::Notifier::new(
        config.notification.clone(),
        http.clone(),
    ));

    let state = state::AppState {
        config: config.clone(),
        db: pool,
        notifier,
        http,
        clock: Arc::new(clock::SystemClock),
    };

    let cancel = CancellationToken::new();
    ReaperService::new(state.clone(), config.reaper_interval_seconds).start(cancel.clone());

    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(20)
            .burst_size(60)
            .methods(vec![
                axum::http::Method::POST,
                axum::http::Method::PUT,
                axum::http::Method::PATCH,
                axum::http::Method::DELETE,
            ])
            .use_headers()
            .finish()
            .context("failed to build rate limiter config")?,
    );

    let governor_limiter = governor_conf.limiter().clone();
    std::thread::spawn(move || loop {
        std::thread::sleep(std::time::Duration::from_secs(60));
        governor_limiter.retain_recent();
    });

    let app = routes::router(state).layer(GovernorLayer::new(governor_conf));
    let addr = format!("{}:{}", args.host, args.port);
    let listener = bind_listener(&addr).await?;
    tracing::info!(addr = %addr, "security-core-rs listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    cancel.cancel();
    Ok(())
}
