//! Thin HTTP trigger layer. Routes map 1:1 onto session/login/harvest
//! operations; everything interesting happens in the modules they call.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::info;

use crate::browser::BrowserHandle;
use crate::config::Config;
use crate::error::AutomationError;
use crate::extract::{self, ExclusionList};
use crate::harvest::{Folder, ListHarvester};
use crate::login;
use crate::provider;
use crate::session::{self, SessionLease, SessionRegistry};

const DEFAULT_MAX_MESSAGES: usize = 200;

pub struct AppContext {
    pub registry: Arc<SessionRegistry>,
    pub exclude: ExclusionList,
}

pub async fn serve(config: Config) -> anyhow::Result<()> {
    let bind = format!("127.0.0.1:{}", config.port());
    let addr: SocketAddr = bind.parse()?;

    let registry = SessionRegistry::new(config.clone());
    registry.spawn_reapers();
    let ctx = Arc::new(AppContext {
        exclude: ExclusionList::from_config(&config),
        registry,
    });

    let router = build_router(ctx);
    info!("owa-harvest listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;
    Ok(())
}

pub fn build_router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route(
            "/api/session",
            get(session_status)
                .post(create_session)
                .delete(close_session),
        )
        .route("/api/login", post(do_login))
        .route("/api/harvest", post(harvest))
        .route("/api/suggestions", post(suggestions))
        .route("/api/screenshot", post(screenshot))
        .with_state(ctx)
}

type JsonResult = Result<Json<Value>, (StatusCode, Json<Value>)>;

fn fail(status: StatusCode, detail: impl std::fmt::Display) -> (StatusCode, Json<Value>) {
    (
        status,
        Json(json!({ "success": false, "detail": detail.to_string() })),
    )
}

fn status_for(err: &AutomationError) -> StatusCode {
    match err {
        AutomationError::NoSession => StatusCode::NOT_FOUND,
        AutomationError::Busy => StatusCode::CONFLICT,
        AutomationError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// First automation request creates the session implicitly.
async fn lease_or_create(ctx: &AppContext) -> Result<SessionLease, AutomationError> {
    if ctx.registry.current().await.is_none() {
        ctx.registry.create().await?;
    }
    ctx.registry.checkout().await
}

async fn health(State(ctx): State<Arc<AppContext>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "session": ctx.registry.current().await.is_some(),
    }))
}

async fn session_status(State(ctx): State<Arc<AppContext>>) -> Json<Value> {
    match ctx.registry.current().await {
        Some(s) => Json(json!({
            "success": true,
            "session": {
                "id": s.id,
                "age_secs": s.age().as_secs(),
                "idle_secs": s.idle_for().as_secs(),
                "busy": s.is_busy(),
                "alive": s.browser.is_alive(),
                "email": s.email(),
            },
        })),
        None => Json(json!({ "success": true, "session": null })),
    }
}

#[derive(Debug, Deserialize)]
struct CreateSessionRequest {
    email: Option<String>,
}

async fn create_session(
    State(ctx): State<Arc<AppContext>>,
    body: Option<Json<CreateSessionRequest>>,
) -> JsonResult {
    let email = body.and_then(|b| b.0.email);
    let session = ctx
        .registry
        .create()
        .await
        .map_err(|e| fail(status_for(&e), &e))?;
    if let Some(email) = &email {
        session.set_email(email);
    }
    let lease = ctx
        .registry
        .checkout()
        .await
        .map_err(|e| fail(status_for(&e), &e))?;
    let portal = ctx.registry.config().portal_url().to_string();
    if !lease.browser().navigate(&portal).await {
        // navigation failure during setup mandates a full teardown
        drop(lease);
        ctx.registry.close_current("portal unreachable").await;
        let err = AutomationError::Navigation {
            url: portal,
            detail: "portal did not reach a ready DOM".to_string(),
        };
        return Err(fail(StatusCode::BAD_GATEWAY, &err));
    }
    let provider = provider::detect_on_page(lease.browser()).await;
    Ok(Json(json!({
        "success": true,
        "detail": "session created",
        "session_id": lease.session().id,
        "provider": provider,
    })))
}

async fn close_session(State(ctx): State<Arc<AppContext>>) -> Json<Value> {
    let closed = ctx.registry.close_current("explicit close").await;
    Json(json!({
        "success": true,
        "detail": if closed { "session closed" } else { "no session to close" },
    }))
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    email: String,
    password: String,
}

async fn do_login(State(ctx): State<Arc<AppContext>>, Json(body): Json<LoginRequest>) -> JsonResult {
    let lease = lease_or_create(&ctx)
        .await
        .map_err(|e| fail(status_for(&e), &e))?;
    let portal = ctx.registry.config().portal_url().to_string();
    let outcome = login::run_login(lease.browser(), &portal, &body.email, &body.password).await;
    if outcome.success {
        lease.session().set_email(&body.email);
    } else {
        shot(&ctx, lease.browser(), "login-failed").await;
    }
    Ok(Json(json!({
        "success": outcome.success,
        "provider": outcome.provider,
        "detail": outcome.detail,
    })))
}

#[derive(Debug, Deserialize)]
struct HarvestRequest {
    folders: Option<Vec<Folder>>,
    max_messages: Option<usize>,
    #[serde(default)]
    include_messages: bool,
}

async fn harvest(
    State(ctx): State<Arc<AppContext>>,
    body: Option<Json<HarvestRequest>>,
) -> JsonResult {
    let body = body.map(|b| b.0).unwrap_or(HarvestRequest {
        folders: None,
        max_messages: None,
        include_messages: false,
    });
    let lease = ctx
        .registry
        .checkout()
        .await
        .map_err(|e| fail(status_for(&e), &e))?;

    let folders = body
        .folders
        .unwrap_or_else(|| vec![Folder::Inbox, Folder::Sent]);
    let max_messages = body.max_messages.unwrap_or(DEFAULT_MAX_MESSAGES);
    let limit = ctx.registry.config().harvest_timeout();

    let operation = async {
        let harvester = ListHarvester::new(lease.browser(), &ctx.exclude, max_messages);
        let mut addresses = BTreeSet::new();
        let mut messages = Vec::new();
        let mut warnings = Vec::new();
        for folder in &folders {
            let outcome = harvester.harvest_folder(*folder).await;
            addresses.extend(outcome.addresses);
            messages.extend(outcome.messages);
            if let Some(warning) = outcome.warning {
                warnings.push(warning);
            }
        }
        (addresses, messages, warnings)
    };
    let (addresses, messages, warnings) =
        session::run_with_deadline(&ctx.registry, "harvest", limit, operation)
            .await
            .map_err(|e| fail(status_for(&e), &e))?;

    let mut response = json!({
        "success": true,
        "detail": format!(
            "harvested {} addresses across {} folders",
            addresses.len(),
            folders.len()
        ),
        "addresses": addresses,
        "messages_scanned": messages.len(),
        "warnings": warnings,
    });
    if body.include_messages {
        response["messages"] = json!(messages);
    }
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
struct SuggestionsRequest {
    seeds: Option<Vec<String>>,
}

async fn suggestions(
    State(ctx): State<Arc<AppContext>>,
    body: Option<Json<SuggestionsRequest>>,
) -> JsonResult {
    let seeds = body.and_then(|b| b.0.seeds).unwrap_or_else(|| {
        extract::DEFAULT_SUGGESTION_SEEDS
            .iter()
            .map(|s| s.to_string())
            .collect()
    });
    let lease = ctx
        .registry
        .checkout()
        .await
        .map_err(|e| fail(status_for(&e), &e))?;
    let limit = ctx.registry.config().harvest_timeout();

    let operation =
        async { extract::harvest_suggestions(lease.browser(), &ctx.exclude, &seeds).await };
    let addresses = session::run_with_deadline(&ctx.registry, "suggestion harvest", limit, operation)
        .await
        .map_err(|e| fail(status_for(&e), &e))?;

    Ok(Json(json!({
        "success": true,
        "detail": format!("{} addresses from {} seed prefixes", addresses.len(), seeds.len()),
        "addresses": addresses,
    })))
}

#[derive(Debug, Deserialize)]
struct ScreenshotRequest {
    path: Option<String>,
}

async fn screenshot(
    State(ctx): State<Arc<AppContext>>,
    body: Option<Json<ScreenshotRequest>>,
) -> JsonResult {
    let lease = ctx
        .registry
        .checkout()
        .await
        .map_err(|e| fail(status_for(&e), &e))?;
    let path = body
        .and_then(|b| b.0.path)
        .map(PathBuf::from)
        .unwrap_or_else(|| timestamped_path(ctx.registry.config().screenshot_dir(), "capture"));
    lease.browser().screenshot(&path).await;
    Ok(Json(json!({
        "success": true,
        "detail": "capture attempted; disabled or failed captures are logged only",
        "path": path.display().to_string(),
    })))
}

async fn shot(ctx: &AppContext, browser: &BrowserHandle, tag: &str) {
    let path = timestamped_path(ctx.registry.config().screenshot_dir(), tag);
    browser.screenshot(&path).await;
}

fn timestamped_path(dir: &str, tag: &str) -> PathBuf {
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    Path::new(dir).join(format!("{tag}-{stamp}.jpg"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn router_builds() {
        let ctx = Arc::new(AppContext {
            registry: SessionRegistry::new(Config::default()),
            exclude: ExclusionList::default(),
        });
        // axum panics on malformed route patterns at build time
        let _router = build_router(ctx);
    }

    #[test]
    fn error_statuses() {
        assert_eq!(
            status_for(&AutomationError::NoSession),
            StatusCode::NOT_FOUND
        );
        assert_eq!(status_for(&AutomationError::Busy), StatusCode::CONFLICT);
        assert_eq!(
            status_for(&AutomationError::Timeout {
                what: "harvest",
                secs: 1
            }),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            status_for(&AutomationError::Launch {
                detail: "x".into()
            }),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn timestamped_paths_carry_tag_and_extension() {
        let path = timestamped_path("shots", "login-failed");
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        assert!(name.starts_with("login-failed-"));
        assert!(name.ends_with(".jpg"));
    }
}
