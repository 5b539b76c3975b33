use actix_web::{middleware, web, App, HttpServer};
use std::io;

use crate::handlers::{analyze_column_lineage, health_check, AppState};

/// Routes shared by the server and its tests
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health_check))
        .route("/column-lineage", web::post().to(analyze_column_lineage));
}

/// Start the HTTP server
pub async fn start_server(host: &str, port: u16, workers: usize, state: AppState) -> io::Result<()> {
    let bind_addr = format!("{}:{}", host, port);

    tracing::info!(
        "Starting server on {} with {} workers, {} catalog entries",
        bind_addr,
        workers,
        state.catalog.len()
    );

    let state = web::Data::new(state);
    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .wrap(middleware::Logger::default())
            .configure(configure)
    })
    .workers(workers)
    .bind(&bind_addr)?
    .run()
    .await
}
