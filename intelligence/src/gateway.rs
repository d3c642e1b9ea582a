//! HTTP prediction gateway

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info, warn};
use warp::http::{HeaderValue, StatusCode};
use warp::hyper::body::Bytes;
use warp::reply::Response;
use warp::{Filter, Rejection, Reply};

use crate::error::{IntelligenceError, Result};
use crate::model::Predictor;

/// Verdict returned to gateway clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolScore {
    pub pool_id: String,
    pub anomaly_score: f64,
    pub is_anomaly: bool,
}

/// Scores a list of pools; results follow the input order
#[async_trait]
pub trait AnomalyScorer: Send + Sync {
    async fn score_pools(&self, pool_ids: &[String]) -> Result<Vec<PoolScore>>;
}

/// Scorer backed by the online predictor
pub struct ScoringService {
    predictor: Arc<Predictor>,
    threshold: f64,
    default_feature_value: f64,
}

impl ScoringService {
    pub fn new(predictor: Arc<Predictor>, threshold: f64, default_feature_value: f64) -> Self {
        Self {
            predictor,
            threshold,
            default_feature_value,
        }
    }
}

#[async_trait]
impl AnomalyScorer for ScoringService {
    async fn score_pools(&self, pool_ids: &[String]) -> Result<Vec<PoolScore>> {
        // an unloadable model fails the whole request
        self.predictor.model()?;

        let results = self
            .predictor
            .predict_batch(pool_ids, self.threshold, self.default_feature_value)
            .await;
        if let Some(failed) = results.iter().find(|r| r.error.is_some()) {
            return Err(IntelligenceError::internal(format!(
                "scoring failed for pool {}: {}",
                failed.pool_id,
                failed.error.as_deref().unwrap_or_default()
            )));
        }
        Ok(results
            .into_iter()
            .map(|r| PoolScore {
                pool_id: r.pool_id,
                anomaly_score: r.score,
                is_anomaly: r.is_anomaly,
            })
            .collect())
    }
}

#[derive(Debug, Deserialize)]
struct PredictRequest {
    #[serde(default)]
    pool_ids: Vec<String>,
}

#[derive(Debug, Serialize)]
struct PredictResponse {
    predictions: Vec<PoolScore>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

/// CORS headers for `origin`. Only origins starting with an allowed prefix
/// are echoed back.
pub fn cors_headers(origin: &str, allowed_origins: &[String]) -> Vec<(&'static str, String)> {
    let allowed = allowed_origins
        .iter()
        .filter(|o| !o.is_empty())
        .any(|o| origin.starts_with(o.as_str()));

    if allowed {
        vec![
            ("access-control-allow-origin", origin.to_string()),
            ("access-control-allow-methods", "POST, OPTIONS".to_string()),
            ("access-control-allow-headers", "Content-Type".to_string()),
        ]
    } else {
        vec![("access-control-allow-origin", "null".to_string())]
    }
}

fn with_cors(mut response: Response, origin: &str, allowed_origins: &[String]) -> Response {
    for (name, value) in cors_headers(origin, allowed_origins) {
        let value = HeaderValue::from_str(&value).unwrap_or_else(|_| HeaderValue::from_static("null"));
        response.headers_mut().insert(name, value);
    }
    response
}

fn json_response<T: Serialize>(body: &T, status: StatusCode) -> Response {
    warp::reply::with_status(warp::reply::json(body), status).into_response()
}

fn error_response(message: &str, status: StatusCode) -> Response {
    json_response(
        &ErrorBody {
            error: message.to_string(),
        },
        status,
    )
}

/// Empty objects, arrays, strings, `null`, `false` and zero count as no body
fn is_empty_payload(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => true,
        serde_json::Value::Bool(b) => !b,
        serde_json::Value::Number(n) => n.as_f64() == Some(0.0),
        serde_json::Value::String(s) => s.is_empty(),
        serde_json::Value::Array(a) => a.is_empty(),
        serde_json::Value::Object(o) => o.is_empty(),
    }
}

async fn predict(body: Bytes, scorer: Arc<dyn AnomalyScorer>) -> Response {
    if body.iter().all(u8::is_ascii_whitespace) {
        return error_response("Request body is required", StatusCode::BAD_REQUEST);
    }

    let payload: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(error = %e, "Rejected malformed request body");
            return error_response(&format!("Invalid JSON body: {}", e), StatusCode::BAD_REQUEST);
        }
    };
    if is_empty_payload(&payload) {
        return error_response("Request body is required", StatusCode::BAD_REQUEST);
    }

    let request: PredictRequest = match serde_json::from_value(payload) {
        Ok(request) => request,
        Err(e) => {
            let err = IntelligenceError::InvalidRequest(e.to_string());
            return error_response(&err.to_string(), StatusCode::BAD_REQUEST);
        }
    };

    match scorer.score_pools(&request.pool_ids).await {
        Ok(predictions) => {
            info!(pools = predictions.len(), "Predictions served");
            json_response(&PredictResponse { predictions }, StatusCode::OK)
        }
        Err(e) => {
            error!(error = %e, category = e.category(), "Prediction request failed");
            error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// `POST /predict`, `OPTIONS /predict` and `GET /healthz`
pub fn routes(
    scorer: Arc<dyn AnomalyScorer>,
    allowed_origins: Vec<String>,
) -> impl Filter<Extract = (Response,), Error = Rejection> + Clone {
    let allowed_origins = Arc::new(allowed_origins);
    let origin = warp::header::optional::<String>("origin").map(|o: Option<String>| o.unwrap_or_default());
    let with_origins = {
        let allowed = allowed_origins.clone();
        warp::any().map(move || allowed.clone())
    };
    let with_scorer = warp::any().map(move || scorer.clone());

    let predict_route = warp::path("predict")
        .and(warp::path::end())
        .and(warp::post())
        .and(origin.clone())
        .and(with_origins.clone())
        .and(warp::body::bytes())
        .and(with_scorer)
        .and_then(
            |origin: String, allowed: Arc<Vec<String>>, body: Bytes, scorer: Arc<dyn AnomalyScorer>| async move {
                let response = predict(body, scorer).await;
                Ok::<_, Infallible>(with_cors(response, &origin, &allowed))
            },
        );

    let preflight = warp::path("predict")
        .and(warp::path::end())
        .and(warp::options())
        .and(origin)
        .and(with_origins)
        .map(|origin: String, allowed: Arc<Vec<String>>| {
            let response = warp::reply::with_status(warp::reply(), StatusCode::NO_CONTENT).into_response();
            with_cors(response, &origin, &allowed)
        });

    let health = warp::path("healthz")
        .and(warp::path::end())
        .and(warp::get())
        .map(|| warp::reply::with_status("ok", StatusCode::OK).into_response());

    predict_route.or(preflight).unify().or(health).unify()
}

/// Serve the gateway until `shutdown` resolves
pub async fn serve<F>(
    addr: SocketAddr,
    scorer: Arc<dyn AnomalyScorer>,
    allowed_origins: Vec<String>,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let filter = routes(scorer, allowed_origins).with(warp::trace::request());
    let (bound, server) = warp::serve(filter)
        .try_bind_with_graceful_shutdown(addr, shutdown)
        .map_err(|e| IntelligenceError::internal(format!("failed to bind {}: {}", addr, e)))?;

    info!(address = %bound, "Prediction gateway listening");
    server.await;
    info!("Prediction gateway stopped");
    Ok(())
}
