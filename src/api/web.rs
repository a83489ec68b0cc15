use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use rust_embed::Embed;

use super::error::ApiError;

/// The browser client: the terminal page and its script.
#[derive(Embed)]
#[folder = "web/"]
struct WebAssets;

pub async fn web_asset(uri: axum::http::Uri) -> impl IntoResponse {
    let path = uri.path().trim_start_matches('/');
    let path = if path.is_empty() { "index.html" } else { path };

    match WebAssets::get(path) {
        Some(content) => {
            let mime = mime_guess::from_path(path).first_or_text_plain().to_string();
            (
                StatusCode::OK,
                [(header::CONTENT_TYPE, mime)],
                content.data.to_vec(),
            )
                .into_response()
        }
        None => ApiError::NotFound.into_response(),
    }
}
