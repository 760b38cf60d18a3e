use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::board::filter::FilterConfig;
use crate::board::persist::valid_session_id;
use crate::board::BoardHandle;
use crate::db::models::FixtureId;
use crate::error::{BoardError, FeedError};

/// Request header naming the client's board session. Each session has its
/// own filters and load-more window.
pub const SESSION_HEADER: &str = "x-session-id";

#[derive(Clone)]
pub struct AppState {
    pub board: BoardHandle,
    /// Used when a request carries no session header
    pub default_session: String,
}

type ApiResult<T> = Result<T, (StatusCode, String)>;

/// Build the Axum router for the board API.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/props", get(props_handler))
        .route("/api/props/more", post(load_more_handler))
        .route(
            "/api/props/:fixture_id/:player/:prop_type",
            get(prop_detail_handler),
        )
        .route(
            "/api/filters",
            get(get_filters_handler)
                .put(put_filters_handler)
                .delete(reset_filters_handler),
        )
        .route("/api/teams", get(teams_handler))
        .route("/api/prop-types", get(prop_types_handler))
        .route("/api/fixtures", get(fixtures_handler))
        .route("/api/odds/latest/:fixture_id", get(latest_handler))
        .route("/api/odds/history/:fixture_id", get(history_handler))
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

fn error_response(e: BoardError) -> (StatusCode, String) {
    let status = match &e {
        BoardError::Stopped => StatusCode::SERVICE_UNAVAILABLE,
        BoardError::Feed(FeedError::StoreRead(_)) => StatusCode::BAD_GATEWAY,
        BoardError::Feed(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, e.to_string())
}

fn not_found(what: String) -> (StatusCode, String) {
    (StatusCode::NOT_FOUND, what)
}

fn session_of(state: &AppState, headers: &HeaderMap) -> ApiResult<String> {
    let Some(value) = headers.get(SESSION_HEADER) else {
        return Ok(state.default_session.clone());
    };
    match value.to_str() {
        Ok(id) if valid_session_id(id) => Ok(id.to_string()),
        _ => Err((
            StatusCode::BAD_REQUEST,
            format!("{} must match [A-Za-z0-9_-]{{1,64}}", SESSION_HEADER),
        )),
    }
}

/// GET /api/props
async fn props_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let session = session_of(&state, &headers)?;
    state.board.page(&session).await.map(Json).map_err(error_response)
}

/// POST /api/props/more
async fn load_more_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let session = session_of(&state, &headers)?;
    state
        .board
        .load_more(&session)
        .await
        .map(Json)
        .map_err(error_response)
}

/// GET /api/props/:fixture_id/:player/:prop_type
async fn prop_detail_handler(
    State(state): State<Arc<AppState>>,
    Path((fixture_id, player, prop_type)): Path<(FixtureId, String, String)>,
) -> ApiResult<impl IntoResponse> {
    let missing = format!("No {} prop for {} in fixture {}", prop_type, player, fixture_id);
    match state
        .board
        .prop_detail(fixture_id, player, prop_type)
        .await
        .map_err(error_response)?
    {
        Some(detail) => Ok(Json(detail)),
        None => Err(not_found(missing)),
    }
}

/// GET /api/filters
async fn get_filters_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let session = session_of(&state, &headers)?;
    state.board.filter(&session).await.map(Json).map_err(error_response)
}

/// PUT /api/filters
async fn put_filters_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(config): Json<FilterConfig>,
) -> ApiResult<impl IntoResponse> {
    let session = session_of(&state, &headers)?;
    state
        .board
        .update_filter(&session, config)
        .await
        .map(Json)
        .map_err(error_response)
}

/// DELETE /api/filters
async fn reset_filters_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let session = session_of(&state, &headers)?;
    state
        .board
        .reset_filter(&session)
        .await
        .map(Json)
        .map_err(error_response)
}

/// GET /api/teams
async fn teams_handler(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    state.board.teams().await.map(Json).map_err(error_response)
}

/// GET /api/prop-types
async fn prop_types_handler(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    state.board.prop_types().await.map(Json).map_err(error_response)
}

/// GET /api/fixtures
async fn fixtures_handler(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    state.board.fixtures().await.map(Json).map_err(error_response)
}

/// GET /api/odds/latest/:fixture_id
async fn latest_handler(
    State(state): State<Arc<AppState>>,
    Path(fixture_id): Path<FixtureId>,
) -> ApiResult<impl IntoResponse> {
    match state.board.latest(fixture_id).await.map_err(error_response)? {
        Some(snapshot) => Ok(Json(snapshot)),
        None => Err(not_found(format!("No snapshots for fixture {}", fixture_id))),
    }
}

/// GET /api/odds/history/:fixture_id
async fn history_handler(
    State(state): State<Arc<AppState>>,
    Path(fixture_id): Path<FixtureId>,
) -> ApiResult<impl IntoResponse> {
    state
        .board
        .history(fixture_id)
        .await
        .map(Json)
        .map_err(error_response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::persist::MemorySessions;
    use crate::board::{BoardRuntime, RuntimeConfig};
    use crate::feed::subscriber::mock::ScriptedSource;
    use crate::odds::store::mock::CountingStore;
    use std::time::Duration;

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(
            error_response(BoardError::Stopped).0,
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            error_response(FeedError::StoreRead("locked".into()).into()).0,
            StatusCode::BAD_GATEWAY
        );
        let (status, body) = error_response(FeedError::MalformedSnapshot("bad".into()).into());
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body, "malformed snapshot: bad");
    }

    #[test]
    fn test_session_comes_from_header() {
        let (_runtime, board) = BoardRuntime::new(
            Arc::new(CountingStore::default()),
            Arc::new(ScriptedSource::new(vec![], true)),
            Box::new(MemorySessions::default()),
            RuntimeConfig {
                page_size: 12,
                fixture_refresh: Duration::from_secs(300),
                poll_interval: None,
                store_timeout: Duration::from_secs(5),
            },
        );
        let state = AppState {
            board,
            default_session: "default".into(),
        };

        let mut headers = HeaderMap::new();
        assert_eq!(session_of(&state, &headers).unwrap(), "default");

        headers.insert(SESSION_HEADER, "tab-2".parse().unwrap());
        assert_eq!(session_of(&state, &headers).unwrap(), "tab-2");

        headers.insert(SESSION_HEADER, "../etc".parse().unwrap());
        assert_eq!(
            session_of(&state, &headers).unwrap_err().0,
            StatusCode::BAD_REQUEST
        );
    }
}
