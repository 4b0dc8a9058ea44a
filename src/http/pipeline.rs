//! REST middleware pipeline.
//!
//! Stages run outermost first:
//!
//! ```text
//! CORS (optional) → identity → metrics → logging → authz (optional) → readiness → handler
//! ```
//!
//! The pipeline is an ordered list folded in reverse with `Router::layer`,
//! so the first stage wraps everything after it.

use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderName, HeaderValue, Method, Uri};
use axum::middleware;
use axum::Router;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer, ExposeHeaders};

use crate::config::CorsConfig;
use crate::host::service::ServiceRegistry;
use crate::http::middleware::{
    authz_layer, cors_pass_through_layer, identity_layer, logging_layer, metrics_layer, readiness_layer, AccessLog,
};
use crate::http::response::ApiError;
use crate::security::authz::Authz;
use crate::security::identity::IdentityResolver;

/// Error type for pipeline construction.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("invalid CORS {field} entry {value:?}")]
    InvalidCorsValue { field: &'static str, value: String },

    #[error("CORS credentials cannot be combined with wildcard {0}")]
    CredentialsWithWildcard(&'static str),
}

/// One pipeline stage.
#[derive(Clone)]
pub enum Stage {
    Cors { layer: CorsLayer, pass_through: bool },
    Identity(IdentityResolver),
    Metrics,
    Logging(Arc<AccessLog>),
    Authz(Arc<Authz>),
    Readiness(Arc<ServiceRegistry>),
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Cors { .. } => "cors",
            Stage::Identity(_) => "identity",
            Stage::Metrics => "metrics",
            Stage::Logging(_) => "logging",
            Stage::Authz(_) => "authz",
            Stage::Readiness(_) => "readiness",
        }
    }

    fn apply(self, router: Router) -> Router {
        match self {
            Stage::Cors { layer, pass_through: false } => router.layer(layer),
            Stage::Cors { layer, pass_through: true } => {
                router.layer(middleware::from_fn_with_state(layer, cors_pass_through_layer))
            }
            Stage::Identity(resolver) => router.layer(middleware::from_fn_with_state(resolver, identity_layer)),
            Stage::Metrics => router.layer(middleware::from_fn(metrics_layer)),
            Stage::Logging(log) => router.layer(middleware::from_fn_with_state(log, logging_layer)),
            Stage::Authz(authz) => router.layer(middleware::from_fn_with_state(authz, authz_layer)),
            Stage::Readiness(services) => {
                router.layer(middleware::from_fn_with_state(services, readiness_layer))
            }
        }
    }
}

/// The fixed REST pipeline.
#[derive(Clone)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

impl Pipeline {
    pub fn new(
        cors: &CorsConfig,
        resolver: IdentityResolver,
        access_log: AccessLog,
        authz: Option<Arc<Authz>>,
        services: Arc<ServiceRegistry>,
    ) -> Result<Self, PipelineError> {
        let mut stages = Vec::with_capacity(6);
        if let Some(layer) = cors_layer(cors)? {
            stages.push(Stage::Cors {
                layer,
                pass_through: cors.options_pass_through,
            });
        }
        stages.push(Stage::Identity(resolver));
        stages.push(Stage::Metrics);
        stages.push(Stage::Logging(Arc::new(access_log)));
        if let Some(authz) = authz {
            stages.push(Stage::Authz(authz));
        }
        stages.push(Stage::Readiness(services));
        Ok(Self { stages })
    }

    /// Stage names, outermost first.
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(Stage::name).collect()
    }

    /// Wrap `router` with every stage.
    pub fn wrap(self, router: Router) -> Router {
        self.stages.into_iter().rev().fold(router, |router, stage| stage.apply(router))
    }
}

/// Fallback for unknown REST routes.
pub async fn not_found(uri: Uri) -> ApiError {
    ApiError::not_found(format!("the requested path is not found: {}", uri.path()))
}

const DEFAULT_CORS_METHODS: [Method; 3] = [Method::GET, Method::POST, Method::HEAD];
const DEFAULT_CORS_HEADERS: [&str; 4] = ["origin", "accept", "content-type", "x-requested-with"];

/// Build the CORS layer, or `None` when CORS is disabled.
pub fn cors_layer(cfg: &CorsConfig) -> Result<Option<CorsLayer>, PipelineError> {
    if !cfg.enabled {
        return Ok(None);
    }

    let wildcard = |list: &[String]| list.iter().any(|v| v == "*");

    let origins_any = cfg.allowed_origins.is_empty() || wildcard(&cfg.allowed_origins);
    let methods_any = wildcard(&cfg.allowed_methods);
    let headers_any = wildcard(&cfg.allowed_headers);
    if cfg.allow_credentials {
        if origins_any {
            return Err(PipelineError::CredentialsWithWildcard("origins"));
        }
        if methods_any {
            return Err(PipelineError::CredentialsWithWildcard("methods"));
        }
        if headers_any {
            return Err(PipelineError::CredentialsWithWildcard("headers"));
        }
    }

    let origin = if origins_any {
        AllowOrigin::any()
    } else {
        AllowOrigin::list(parse_all(&cfg.allowed_origins, "origin", |v| {
            HeaderValue::from_str(v).ok()
        })?)
    };

    let methods = if methods_any {
        AllowMethods::any()
    } else if cfg.allowed_methods.is_empty() {
        AllowMethods::list(DEFAULT_CORS_METHODS)
    } else {
        AllowMethods::list(parse_all(&cfg.allowed_methods, "method", |v| {
            Method::from_bytes(v.to_ascii_uppercase().as_bytes()).ok()
        })?)
    };

    let headers = if headers_any {
        AllowHeaders::any()
    } else if cfg.allowed_headers.is_empty() {
        AllowHeaders::list(DEFAULT_CORS_HEADERS.map(HeaderName::from_static))
    } else {
        AllowHeaders::list(parse_all(&cfg.allowed_headers, "header", |v| {
            HeaderName::from_bytes(v.as_bytes()).ok()
        })?)
    };

    let exposed = parse_all(&cfg.exposed_headers, "exposed header", |v| {
        HeaderName::from_bytes(v.as_bytes()).ok()
    })?;

    let mut layer = CorsLayer::new()
        .allow_origin(origin)
        .allow_methods(methods)
        .allow_headers(headers)
        .expose_headers(ExposeHeaders::list(exposed))
        .allow_credentials(cfg.allow_credentials);
    if cfg.max_age > 0 {
        layer = layer.max_age(Duration::from_secs(cfg.max_age));
    }

    if cfg.debug {
        tracing::info!(cors = ?cfg, "CORS policy");
    }
    Ok(Some(layer))
}

fn parse_all<T>(
    values: &[String],
    field: &'static str,
    parse: impl Fn(&str) -> Option<T>,
) -> Result<Vec<T>, PipelineError> {
    values
        .iter()
        .map(|v| {
            parse(v.trim()).ok_or_else(|| PipelineError::InvalidCorsValue {
                field,
                value: v.clone(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuthzConfig;
    use axum::body::Body;
    use axum::routing::{get, options};
    use http::Request;
    use tower::ServiceExt;

    fn cors() -> CorsConfig {
        CorsConfig {
            enabled: true,
            allowed_origins: vec!["https://console.example.com".to_string()],
            ..Default::default()
        }
    }

    fn pipeline(cors: &CorsConfig, authz: Option<Arc<Authz>>) -> Pipeline {
        Pipeline::new(
            cors,
            IdentityResolver::default(),
            AccessLog::default(),
            authz,
            Arc::new(ServiceRegistry::new()),
        )
        .unwrap()
    }

    #[test]
    fn stage_order_with_and_without_optional_stages() {
        let all = pipeline(&cors(), Some(Arc::new(Authz::new(&AuthzConfig::default()).unwrap())));
        assert_eq!(
            all.stage_names(),
            ["cors", "identity", "metrics", "logging", "authz", "readiness"]
        );

        let bare = pipeline(&CorsConfig::default(), None);
        assert_eq!(bare.stage_names(), ["identity", "metrics", "logging", "readiness"]);
    }

    #[test]
    fn credentials_with_wildcard_origin_rejected() {
        let cfg = CorsConfig {
            enabled: true,
            allow_credentials: true,
            allowed_origins: vec!["*".to_string()],
            ..Default::default()
        };
        assert!(matches!(
            cors_layer(&cfg),
            Err(PipelineError::CredentialsWithWildcard("origins"))
        ));
    }

    #[test]
    fn invalid_method_rejected() {
        let cfg = CorsConfig {
            enabled: true,
            allowed_methods: vec!["GE T".to_string()],
            ..Default::default()
        };
        assert!(matches!(cors_layer(&cfg), Err(PipelineError::InvalidCorsValue { .. })));
    }

    #[tokio::test]
    async fn cors_headers_survive_authz_rejection() {
        let authz = Authz::new(&AuthzConfig {
            allow: vec!["/v1/admin:admin".to_string()],
            ..Default::default()
        })
        .unwrap();
        let app = pipeline(&cors(), Some(Arc::new(authz)))
            .wrap(Router::new().route("/v1/admin", get(|| async { "secret" })));

        let res = app
            .oneshot(
                Request::builder()
                    .uri("/v1/admin")
                    .header("origin", "https://console.example.com")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(res.status(), 401);
        assert_eq!(
            res.headers()["access-control-allow-origin"],
            "https://console.example.com"
        );
    }

    fn preflight() -> Request<Body> {
        Request::builder()
            .method("OPTIONS")
            .uri("/v1/items")
            .header("origin", "https://console.example.com")
            .header("access-control-request-method", "POST")
            .body(Body::empty())
            .unwrap()
    }

    fn items() -> Router {
        Router::new().route("/v1/items", options(|| async { "from handler" }))
    }

    #[tokio::test]
    async fn preflight_answered_by_cors_stage() {
        let app = pipeline(&cors(), None).wrap(items());
        let res = app.oneshot(preflight()).await.unwrap();

        assert_eq!(res.status(), 200);
        assert!(res.headers().contains_key("access-control-allow-methods"));
        let body = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn preflight_passes_through_to_handler() {
        let cfg = CorsConfig {
            options_pass_through: true,
            ..cors()
        };
        let app = pipeline(&cfg, None).wrap(items());
        let res = app.oneshot(preflight()).await.unwrap();

        assert_eq!(
            res.headers()["access-control-allow-origin"],
            "https://console.example.com"
        );
        assert!(res.headers().contains_key("access-control-allow-methods"));
        let body = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"from handler");
    }

    #[tokio::test]
    async fn unknown_route_is_json_not_found() {
        let app = pipeline(&CorsConfig::default(), None).wrap(Router::new().fallback(not_found));
        let res = app
            .oneshot(Request::builder().uri("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), 404);
        let body = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["code"], "not_found");
        assert!(json["message"].as_str().unwrap().contains("/nope"));
    }
}
