//! Suggested follows debug page.
//!
//! Renders the recommendation set for any account as a bare HTML table.

use std::fmt::Write as _;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
    Router,
};
use peruse_core::{Did, IdentityDirectory};
use peruse_storage::QueryStore;
use serde::Deserialize;
use tracing::error;

use crate::state::AppState;
use crate::users::{SuggestedFollow, UserManager};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuggestedFollowsParams {
    pub handle: Option<String>,
    /// Accepted for link compatibility; the table has no handle column.
    #[serde(default)]
    pub show_handles: Option<String>,
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

pub fn render_table(suggestions: &[SuggestedFollow]) -> String {
    let mut html = String::from("<html><table><tr><th>suggested did</th><th>bsky profile</th></tr>");
    for s in suggestions {
        let url = escape(&s.bsky_url);
        let _ = write!(
            html,
            "<tr><td>{}</td><td><a href=\"{url}\">{url}</a></td></tr>",
            escape(&s.did)
        );
    }
    html.push_str("</table></html>");
    html
}

fn plain(status: StatusCode, message: String) -> Response {
    (status, message).into_response()
}

/// GET /api/getSuggestedFollows
pub async fn get_suggested_follows(
    State(directory): State<Arc<dyn IdentityDirectory>>,
    State(users): State<Arc<UserManager>>,
    State(store): State<Arc<dyn QueryStore>>,
    Query(params): Query<SuggestedFollowsParams>,
) -> Response {
    let handle = match params.handle.as_deref().map(str::trim) {
        Some(handle) if !handle.is_empty() => handle,
        _ => return plain(StatusCode::BAD_REQUEST, "no input handle provided".to_string()),
    };

    let did = if handle.starts_with("did:") {
        match Did::parse(handle) {
            Ok(did) => did,
            Err(e) => return plain(StatusCode::BAD_REQUEST, format!("invalid did: {e}")),
        }
    } else {
        match directory.resolve_handle(handle).await {
            Ok(did) => did,
            Err(e) => {
                return plain(
                    StatusCode::BAD_REQUEST,
                    format!("error looking up handle: {e}"),
                )
            }
        }
    };

    match users.session(&did).suggested_follows(store.as_ref()).await {
        Ok(suggestions) => Html(render_table(&suggestions)).into_response(),
        Err(e) => {
            error!(did = %did, error = %e, "Failed to load suggested follows");
            plain(
                StatusCode::INTERNAL_SERVER_ERROR,
                "error getting suggested follows".to_string(),
            )
        }
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/getSuggestedFollows", get(get_suggested_follows))
        .route("/recommend/suggestedFollows", get(get_suggested_follows))
        .with_state(state)
}
