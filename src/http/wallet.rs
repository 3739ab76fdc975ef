use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::get;
use axum::{Json, Router};
use tokio_stream::wrappers::WatchStream;
use tokio_stream::{Stream, StreamExt};

use crate::models::wallet::{HistoryQuery, HistoryResponse, LedgerEntryView, WalletView};
use crate::state::AppState;

use super::HttpError;
use super::auth::AuthenticatedUser;

pub const DEFAULT_HISTORY_LIMIT: u64 = 20;
pub const MAX_HISTORY_LIMIT: u64 = 100;
const MAX_HISTORY_OFFSET: u64 = 1_000_000;
const BALANCE_EVENT: &str = "balance";

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(get_wallet))
        .route("/history", get(get_history))
        .route("/events", get(stream_balance))
}

async fn get_wallet(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
) -> Result<Json<WalletView>, HttpError> {
    let wallet = state.ledger.wallet(user_id).await?;
    Ok(Json(
        wallet
            .map(WalletView::from)
            .unwrap_or_else(|| WalletView::empty(user_id)),
    ))
}

async fn get_history(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<HistoryResponse>, HttpError> {
    let limit = query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    if limit == 0 || limit > MAX_HISTORY_LIMIT {
        return Err(HttpError::new(
            StatusCode::BAD_REQUEST,
            format!("limit must be between 1 and {MAX_HISTORY_LIMIT}"),
        ));
    }
    let offset = query.offset.unwrap_or(0);
    if offset > MAX_HISTORY_OFFSET {
        return Err(HttpError::new(
            StatusCode::BAD_REQUEST,
            format!("offset cannot exceed {MAX_HISTORY_OFFSET}"),
        ));
    }

    let entries = state.ledger.history(user_id, limit, offset).await?;
    assert!(
        entries.len() as u64 <= limit,
        "History page exceeded requested limit"
    );
    Ok(Json(HistoryResponse {
        entries: entries.into_iter().map(LedgerEntryView::from).collect(),
        limit,
        offset,
    }))
}

/// Current snapshot first, then every change until the client leaves or the
/// server shuts down.
async fn stream_balance(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, HttpError> {
    // Subscribe before reading so no change between the two is missed.
    let subscription = state.ledger.subscribe(user_id);
    let current = state
        .ledger
        .wallet(user_id)
        .await?
        .map(WalletView::from)
        .unwrap_or_else(|| WalletView::empty(user_id));

    // Never step back behind a snapshot already sent.
    let mut newest = current.updated_at;
    let updates = subscription
        .into_stream()
        .filter(move |wallet| {
            if newest.is_some_and(|seen| wallet.updated_at < seen) {
                return false;
            }
            newest = Some(wallet.updated_at);
            true
        })
        .map(WalletView::from);
    let closing = WatchStream::new(state.streams_closing.subscribe())
        .filter(|closing| *closing)
        .map(|_| None);
    let stream = tokio_stream::once(current)
        .chain(updates)
        .map(Some)
        .merge(closing)
        .take_while(Option::is_some)
        .filter_map(|view| view)
        .map(|view| Event::default().event(BALANCE_EVENT).json_data(view));

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
