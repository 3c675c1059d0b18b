//! Skinovation: appointment booking and lifecycle server for a small
//! beauty clinic. The library exposes every domain operation directly;
//! [`run`] wires them to SQLite and the HTTP API.

pub mod api;
pub mod appointment;
pub mod calendar;
pub mod catalog;
pub mod config;
pub mod db;
pub mod feedback;
pub mod history;
pub mod leave;
pub mod models;
pub mod notifications;
pub mod packages;
pub mod requests;
pub mod slot_policy;
pub mod sms;
pub mod users;

use tracing_subscriber::EnvFilter;

use crate::api::types::ApiContext;
use crate::calendar::Clock;
use crate::sms::provider::SmsTransport;

/// Open the database, apply migrations and seeds, and serve the API
/// until the process is stopped.
pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config::default_log_filter())),
        )
        .init();

    tracing::info!("{} starting v{}", config::APP_NAME, config::APP_VERSION);

    let data_dir = config::app_data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let conn = db::open_database(&config::database_path())?;

    let clock = Clock::system();
    let now = clock.now();
    calendar::seed_store_hours(&conn)?;
    sms::templates::seed_default_templates(&conn, now)?;
    users::seed_product_counter(&conn, now)?;

    let settings = config::SmsSettings::from_env();
    if settings.is_none() {
        tracing::warn!("SMS provider not configured; outbound SMS disabled");
    }
    let transport = SmsTransport::from_settings(settings);

    let ctx = ApiContext::new(conn, clock, transport);
    let app = api::router::api_router(ctx);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config::api_port()));
    tracing::info!("listening on {addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
