use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    middleware,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use url::Url;

use crate::{
    application::{
        error::HttpError,
        feeds::FeedService,
        posts::PostService,
        repos::RepoError,
        tweets::TweetService,
    },
    domain::posts::Post,
    prerender::{Prerenderer, RenderOptions},
};

use super::middleware::log_responses;

/// Query parameters of the inbound request that change what the public page
/// shows, and therefore belong in the prerendered URL and its cache key.
/// Everything else (render toggles, cache busters) is stripped.
const PAGE_AFFECTING_PARAMS: &[&str] = &["year", "tweets"];

#[derive(Clone)]
pub struct RouterState {
    pub posts: Arc<PostService>,
    pub feeds: Arc<FeedService>,
    pub tweets: Arc<TweetService>,
    pub prerender: Arc<Prerenderer>,
    pub public_url: Url,
}

pub fn build_router(state: RouterState) -> Router {
    Router::new()
        .route("/ssr", get(ssr))
        .route("/posts", post(submit_post))
        .route("/posts/{year}", get(posts_for_year))
        .route("/posts/{year}/{month}", get(posts_for_month).delete(delete_post))
        .route("/posts/{year}/{month}/{day}", get(posts_for_day))
        .route("/tweets/{username}", get(tweets))
        .route("/admin/_updaterss", get(update_rss))
        .route("/admin/_updatetweets/{username}", get(update_tweets))
        .route("/admin/_rebuildcache", post(rebuild_cache))
        .with_state(state)
        .layer(middleware::from_fn(log_responses))
}

async fn ssr(
    State(state): State<RouterState>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let options = RenderOptions::from_query_toggles(&query);

    let mut target = state.public_url.clone();
    let preserved: Vec<(&str, &String)> = PAGE_AFFECTING_PARAMS
        .iter()
        .filter_map(|name| query.get(*name).map(|value| (*name, value)))
        .collect();
    if !preserved.is_empty() {
        let mut pairs = target.query_pairs_mut();
        for (name, value) in preserved {
            pairs.append_pair(name, value);
        }
    }

    match state.prerender.render(target.as_str(), &options).await {
        Ok(html) => Html(html).into_response(),
        Err(err) => HttpError::from_error(
            "infra::http::ssr",
            StatusCode::INTERNAL_SERVER_ERROR,
            "Prerender failed",
            &err,
        )
        .into_response(),
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PostsQuery {
    maxresults: Option<usize>,
}

async fn posts_for_year(
    State(state): State<RouterState>,
    Path(year): Path<String>,
    Query(query): Query<PostsQuery>,
) -> Response {
    serve_posts(&state, year, None, None, query.maxresults).await
}

async fn posts_for_month(
    State(state): State<RouterState>,
    Path((year, month)): Path<(String, String)>,
    Query(query): Query<PostsQuery>,
) -> Response {
    serve_posts(&state, year, Some(pad_two(&month)), None, query.maxresults).await
}

async fn posts_for_day(
    State(state): State<RouterState>,
    Path((year, month, day)): Path<(String, String, String)>,
    Query(query): Query<PostsQuery>,
) -> Response {
    serve_posts(
        &state,
        year,
        Some(pad_two(&month)),
        Some(pad_two(&day)),
        query.maxresults,
    )
    .await
}

async fn serve_posts(
    state: &RouterState,
    year: String,
    month: Option<String>,
    day: Option<String>,
    max_results: Option<usize>,
) -> Response {
    let extra = state.feeds.collect().await;
    match state
        .posts
        .get_posts(&year, month.as_deref(), day.as_deref(), extra, max_results)
        .await
    {
        Ok(posts) => Json(posts).into_response(),
        Err(err) => repo_error_response("infra::http::posts", err),
    }
}

async fn submit_post(State(state): State<RouterState>, Json(body): Json<Post>) -> Response {
    // The browser extension posts from arbitrary origins.
    let cors = [
        (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
        (header::ACCESS_CONTROL_ALLOW_HEADERS, "Content-Type"),
    ];
    match state.posts.submit(body).await {
        Ok(()) => (cors, "Success!").into_response(),
        Err(err) => {
            let mut response = repo_error_response("infra::http::submit_post", err);
            response.headers_mut().insert(
                header::ACCESS_CONTROL_ALLOW_ORIGIN,
                header::HeaderValue::from_static("*"),
            );
            response
        }
    }
}

#[derive(Debug, Deserialize)]
struct DeleteQuery {
    url: String,
}

async fn delete_post(
    State(state): State<RouterState>,
    Path((year, month)): Path<(String, String)>,
    Query(query): Query<DeleteQuery>,
) -> Response {
    match state
        .posts
        .delete(&year, &pad_two(&month), &query.url)
        .await
    {
        Ok(()) => "Success!".into_response(),
        Err(err) => repo_error_response("infra::http::delete_post", err),
    }
}

async fn tweets(State(state): State<RouterState>, Path(username): Path<String>) -> Response {
    Json(state.tweets.tweets(&username).await).into_response()
}

async fn update_rss(State(state): State<RouterState>) -> Response {
    Json(state.feeds.refresh().await).into_response()
}

async fn update_tweets(
    State(state): State<RouterState>,
    Path(username): Path<String>,
) -> Response {
    Json(state.tweets.refresh(&username).await).into_response()
}

async fn rebuild_cache(State(state): State<RouterState>) -> Response {
    state.prerender.invalidate_all();
    match state
        .prerender
        .render(state.public_url.as_str(), &RenderOptions::default())
        .await
    {
        Ok(_) => "Cache rebuilt.".into_response(),
        Err(err) => HttpError::from_error(
            "infra::http::rebuild_cache",
            StatusCode::INTERNAL_SERVER_ERROR,
            "Cache rebuild failed",
            &err,
        )
        .into_response(),
    }
}

fn repo_error_response(source: &'static str, err: RepoError) -> Response {
    let http_error = match &err {
        RepoError::NotFound { .. } => HttpError::from_error(
            source,
            StatusCode::NOT_FOUND,
            "Resource not found",
            &err,
        ),
        RepoError::InvalidInput(_) => HttpError::from_error(
            source,
            StatusCode::BAD_REQUEST,
            "Invalid request",
            &err,
        ),
        RepoError::Unavailable(_) => HttpError::from_error(
            source,
            StatusCode::SERVICE_UNAVAILABLE,
            "Store unavailable",
            &err,
        ),
    };
    http_error.into_response()
}

/// Zero-pad a month or day path segment, `5` → `05`.
fn pad_two(value: &str) -> String {
    format!("{value:0>2}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pads_single_digit_segments() {
        assert_eq!(pad_two("5"), "05");
        assert_eq!(pad_two("11"), "11");
    }
}
