use actix_web::{web, HttpResponse, Responder};
use serde::{Deserialize, Serialize};

use crate::catalog::{CatalogIndex, CatalogRow};
use crate::config::AnalysisConfig;
use crate::resolver::ReferenceMode;
use crate::LineageAnalyzer;

/// Shared, read-only state of every worker.
#[derive(Debug)]
pub struct AppState {
    pub catalog: CatalogIndex,
    pub analysis: AnalysisConfig,
}

/// Request model for column lineage analysis
#[derive(Debug, Deserialize)]
pub struct LineageRequest {
    pub sql: String,
    /// Rows replacing the server catalog for this request only.
    #[serde(default)]
    pub catalog: Option<Vec<CatalogRow>>,
    #[serde(default)]
    pub mode: Option<ReferenceMode>,
}

/// Error response model
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Handler for column lineage analysis
pub async fn analyze_column_lineage(
    state: web::Data<AppState>,
    req: web::Json<LineageRequest>,
) -> impl Responder {
    let req = req.into_inner();
    tracing::info!(
        "Analyzing column lineage: sql_len={}, request_catalog={}",
        req.sql.len(),
        req.catalog.as_ref().map_or(0, Vec::len)
    );

    let request_catalog = req.catalog.map(CatalogIndex::from_rows);
    let catalog = request_catalog.as_ref().unwrap_or(&state.catalog);

    let mut options = state.analysis.resolve_options();
    if let Some(mode) = req.mode {
        options.mode = mode;
    }

    let analyzer = match LineageAnalyzer::new(catalog).with_dialect(&state.analysis.dialect) {
        Ok(analyzer) => analyzer.with_options(options),
        Err(e) => {
            tracing::error!("Invalid analysis configuration: {}", e);
            return HttpResponse::InternalServerError().json(ErrorResponse {
                error: e.to_string(),
            });
        }
    };

    match analyzer.analyze_sql(&req.sql) {
        Ok(report) => {
            for warning in &report.warnings {
                tracing::warn!("{}", warning);
            }
            HttpResponse::Ok().json(report)
        }
        Err(e) => {
            tracing::error!("SQL analysis failed: {}", e);
            HttpResponse::BadRequest().json(ErrorResponse {
                error: format!("SQL analysis failed: {}", e),
            })
        }
    }
}

/// Health check handler
pub async fn health_check() -> impl Responder {
    HttpResponse::Ok().body("OK")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::CyclePolicy;
    use actix_web::{http::StatusCode, test, App};
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};

    fn state(on_cte_cycle: CyclePolicy) -> web::Data<AppState> {
        web::Data::new(AppState {
            catalog: CatalogIndex::from_rows(vec![
                CatalogRow::new("ip", "mg", "loan", "loan_number"),
                CatalogRow::new("ip", "mg", "loan", "fpb"),
            ]),
            analysis: AnalysisConfig {
                on_cte_cycle,
                ..AnalysisConfig::default()
            },
        })
    }

    #[actix_web::test]
    async fn test_health() {
        let app = test::init_service(App::new().configure(crate::server::configure)).await;
        let req = test::TestRequest::get().uri("/health").to_request();
        let body = test::call_and_read_body(&app, req).await;
        assert_eq!(body, web::Bytes::from_static(b"OK"));
    }

    #[actix_web::test]
    async fn test_lineage_uses_server_catalog() {
        let app = test::init_service(
            App::new()
                .app_data(state(CyclePolicy::Warn))
                .configure(crate::server::configure),
        )
        .await;
        let req = test::TestRequest::post()
            .uri("/column-lineage")
            .set_json(json!({"sql": "SELECT l.fpb FROM loan l"}))
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(
            body,
            json!({
                "records": [
                    {"database": "ip", "schema": "mg", "table": "loan", "column": "fpb"}
                ],
                "warnings": []
            })
        );
    }

    #[actix_web::test]
    async fn test_request_catalog_and_mode_override() {
        let app = test::init_service(
            App::new()
                .app_data(state(CyclePolicy::Warn))
                .configure(crate::server::configure),
        )
        .await;
        let req = test::TestRequest::post()
            .uri("/column-lineage")
            .set_json(json!({
                "sql": "SELECT a FROM t WHERE b > 0",
                "catalog": [
                    {"Database Name": "dw", "Schema Name": "s", "Table Name": "t", "Column Name": "a"},
                    {"database": "dw", "schema": "s", "table": "t", "column": "b"}
                ],
                "mode": "all_references"
            }))
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        let columns: Vec<&str> = body["records"]
            .as_array()
            .map(|records| {
                records
                    .iter()
                    .filter_map(|r| r["column"].as_str())
                    .collect()
            })
            .unwrap_or_default();
        assert_eq!(columns, vec!["a", "b"]);
    }

    #[actix_web::test]
    async fn test_errors_are_bad_requests() {
        let app = test::init_service(
            App::new()
                .app_data(state(CyclePolicy::Fail))
                .configure(crate::server::configure),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/column-lineage")
            .set_json(json!({"sql": "SELEC"}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let req = test::TestRequest::post()
            .uri("/column-lineage")
            .set_json(json!({
                "sql": "WITH a AS (SELECT x FROM b), b AS (SELECT x FROM a) SELECT x FROM a"
            }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: Value = test::read_body_json(resp).await;
        assert!(body["error"]
            .as_str()
            .is_some_and(|e| e.contains("CTE dependency cycle")));
    }
}
