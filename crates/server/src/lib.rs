//! The HTTP surface: a read endpoint for top-k recommendations and a write
//! endpoint that folds a new `(repository, user)` observation into the
//! index. Kept deliberately thin — all the interesting logic lives in
//! `index-engine` and `query`, this just adapts it to query-string params
//! and status codes.

use axum::extract::{Query as QueryParams, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use index_engine::{IndexEngine, ItemId};
use query::{Query, QueryError};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub query: Arc<Query>,
    pub engine: Arc<IndexEngine>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/repository",
            get(get_recommendations).put(record_observation).post(record_observation),
        )
        .with_state(state)
}

#[derive(Deserialize)]
struct RecommendParams {
    repo_id: ItemId,
    num_recommend: Option<usize>,
}

const DEFAULT_NUM_RECOMMEND: usize = 10;

async fn get_recommendations(
    State(state): State<AppState>,
    QueryParams(params): QueryParams<RecommendParams>,
) -> impl IntoResponse {
    let k = params.num_recommend.unwrap_or(DEFAULT_NUM_RECOMMEND);
    match state.query.recommend(params.repo_id, k).await {
        Ok(repository) => (StatusCode::OK, Json(json!({ "repository": repository }))).into_response(),
        Err(QueryError::NotFound(id)) => {
            tracing::debug!(repo_id = id, "recommend requested for unknown repository");
            StatusCode::NOT_FOUND.into_response()
        }
        Err(error) => {
            tracing::error!(%error, "recommend failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[derive(Deserialize)]
struct UpdateParams {
    repo_id: Option<ItemId>,
    user_id: Option<i64>,
}

async fn record_observation(
    State(state): State<AppState>,
    QueryParams(params): QueryParams<UpdateParams>,
) -> impl IntoResponse {
    let (Some(repo_id), Some(user_id)) = (params.repo_id, params.user_id) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    match state.engine.update_item(repo_id, &[user_id]).await {
        Ok(()) => (StatusCode::CREATED, "Success").into_response(),
        Err(error) => {
            tracing::error!(%error, repo_id, user_id, "updateItem failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use store::{IndexStore, MemoryStore};
    use tower::ServiceExt;

    fn state() -> AppState {
        let backing: Arc<dyn IndexStore> = MemoryStore::new();
        AppState {
            query: Arc::new(Query::new(backing.clone(), 4)),
            engine: Arc::new(IndexEngine::new(backing, 4)),
        }
    }

    #[tokio::test]
    async fn unknown_repository_returns_404() {
        let app = router(state());
        let response = app
            .oneshot(Request::get("/repository?repo_id=1&num_recommend=5").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn missing_params_on_update_returns_404() {
        let app = router(state());
        let response = app
            .oneshot(Request::put("/repository?repo_id=1").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn update_then_recommend_round_trips() {
        let app_state = state();
        let app = router(app_state.clone());

        for user in [10, 11, 12] {
            let response = app
                .clone()
                .oneshot(
                    Request::put(format!("/repository?repo_id=1&user_id={user}"))
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::CREATED);
        }

        let response = app
            .oneshot(Request::get("/repository?repo_id=1&num_recommend=5").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
