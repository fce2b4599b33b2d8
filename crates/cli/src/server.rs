use crate::cache::{CacheError, MembershipCache, TeamPayload};
use crate::http_api::{
    error_response, json_response, method_not_allowed, not_found, raw_json_response,
};
use crate::shutdown::wait_for_shutdown;
use axum::{
    extract::{rejection::QueryRejection, Query},
    http::StatusCode,
    response::Response,
    routing::get,
    Router,
};
use sshkey_protocol::{
    AuthorizedKeysBody, ErrorBody, StatusBody, ERROR_INVALID_INIT, ERROR_INVALID_TEAM,
    ERROR_INVALID_TIMEOUT, ERROR_LONGPOLL_TIMEOUT, ERROR_TEAM_NOT_FOUND, ERROR_UNEXPECTED,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

pub const DEFAULT_LONGPOLL_TIMEOUT: Duration = Duration::from_secs(120);

type Params = Result<Query<HashMap<String, String>>, QueryRejection>;

/// Long-poll clients parked per team, each with a one-shot wake signal.
#[derive(Default)]
pub struct Waiters {
    next_id: AtomicU64,
    by_team: Mutex<HashMap<String, HashMap<u64, oneshot::Sender<()>>>>,
}

/// Deregisters its waiter on drop, including when the client went away
/// mid-request.
pub struct WaiterGuard {
    waiters: Arc<Waiters>,
    team: String,
    id: u64,
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        self.waiters.remove(&self.team, self.id);
    }
}

impl Waiters {
    pub fn register(self: &Arc<Self>, team: &str) -> (WaiterGuard, oneshot::Receiver<()>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.by_team
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(team.to_string())
            .or_default()
            .insert(id, tx);
        let guard = WaiterGuard {
            waiters: self.clone(),
            team: team.to_string(),
            id,
        };
        (guard, rx)
    }

    /// Wakes and deregisters every waiter of `team`. Returns how many were
    /// still listening.
    pub fn wake(&self, team: &str) -> usize {
        let drained = self
            .by_team
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(team);
        drained
            .into_iter()
            .flatten()
            .filter_map(|(_, tx)| tx.send(()).ok())
            .count()
    }

    pub fn count(&self, team: &str) -> usize {
        self.by_team
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(team)
            .map_or(0, HashMap::len)
    }

    fn remove(&self, team: &str, id: u64) {
        let mut by_team = self.by_team.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(waiting) = by_team.get_mut(team) {
            waiting.remove(&id);
            if waiting.is_empty() {
                by_team.remove(team);
            }
        }
    }
}

/// Forwards cache refresh notifications to the team's parked clients.
pub fn spawn_dispatcher(mut updates: mpsc::Receiver<String>, waiters: Arc<Waiters>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(team) = updates.recv().await {
            let woken = waiters.wake(&team);
            if woken > 0 {
                log::debug!("Woke {woken} long-poll client(s) for team '{team}'");
            }
        }
        log::debug!("Update stream closed, long-poll dispatcher exiting");
    })
}

pub struct ServerState {
    pub cache: Arc<MembershipCache>,
    pub waiters: Arc<Waiters>,
    pub status: StatusBody,
    pub default_timeout: Duration,
    pub shutdown: watch::Receiver<bool>,
}

#[derive(Debug, PartialEq, Eq)]
struct KeysQuery {
    team: String,
    init: bool,
    timeout: Duration,
}

fn parse_team(params: &HashMap<String, String>) -> Result<String, &'static str> {
    match params.get("team").map(|team| team.trim()) {
        Some(team) if !team.is_empty() => Ok(team.to_string()),
        _ => Err(ERROR_INVALID_TEAM),
    }
}

fn parse_keys_query(
    params: &HashMap<String, String>,
    default_timeout: Duration,
) -> Result<KeysQuery, &'static str> {
    let team = parse_team(params)?;
    let init = match params.get("init").map(String::as_str) {
        None | Some("") | Some("false") => false,
        Some("true") => true,
        Some(_) => return Err(ERROR_INVALID_INIT),
    };
    let timeout = match params.get("timeout").map(|t| t.trim()) {
        None | Some("") => default_timeout,
        Some(raw) => raw
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|_| ERROR_INVALID_TIMEOUT)?,
    };
    Ok(KeysQuery {
        team,
        init,
        timeout,
    })
}

pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route(
            "/status",
            get({
                let state = state.clone();
                move || status_handler(state.clone())
            })
            .fallback(method_not_allowed),
        )
        .route(
            "/keys",
            get({
                let state = state.clone();
                move |params| keys_handler(params, state.clone())
            })
            .fallback(method_not_allowed),
        )
        .route(
            "/authorized_keys",
            get({
                let state = state.clone();
                move |params| authorized_keys_handler(params, state.clone())
            })
            .fallback(method_not_allowed),
        )
        .fallback(not_found)
}

/// Serves until `shutdown` flips. Parked long-poll clients are released
/// with the timeout body so draining does not wait for their deadlines.
pub async fn serve(
    listener: tokio::net::TcpListener,
    state: Arc<ServerState>,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { wait_for_shutdown(&mut shutdown).await })
        .await
}

async fn status_handler(state: Arc<ServerState>) -> Response {
    json_response(StatusCode::OK, &state.status)
}

async fn keys_handler(params: Params, state: Arc<ServerState>) -> Response {
    let query = match params {
        Ok(Query(params)) => parse_keys_query(&params, state.default_timeout),
        Err(_) => Err(ERROR_INVALID_TEAM),
    };
    let query = match query {
        Ok(query) => query,
        Err(message) => return error_response(StatusCode::BAD_REQUEST, message),
    };

    if query.init {
        return keys_payload(&state, &query.team).await;
    }

    let (_guard, woken) = state.waiters.register(&query.team);
    let mut shutdown = state.shutdown.clone();
    tokio::select! {
        _ = woken => keys_payload(&state, &query.team).await,
        _ = tokio::time::sleep(query.timeout) => {
            log::debug!("Long poll for team '{}' timed out after {:?}", query.team, query.timeout);
            longpoll_timeout()
        }
        _ = wait_for_shutdown(&mut shutdown) => longpoll_timeout(),
    }
}

async fn authorized_keys_handler(params: Params, state: Arc<ServerState>) -> Response {
    let team = match params {
        Ok(Query(params)) => parse_team(&params),
        Err(_) => Err(ERROR_INVALID_TEAM),
    };
    let team = match team {
        Ok(team) => team,
        Err(message) => return error_response(StatusCode::BAD_REQUEST, message),
    };
    match state.cache.get(&team).await {
        Ok(payload) => json_response(
            StatusCode::OK,
            &AuthorizedKeysBody {
                authorized_keys: payload.snippet.clone(),
            },
        ),
        Err(err) => cache_error_response(&team, &err),
    }
}

async fn keys_payload(state: &ServerState, team: &str) -> Response {
    match state.cache.get(team).await {
        Ok(payload) => keys_response(&payload),
        Err(err) => cache_error_response(team, &err),
    }
}

fn keys_response(payload: &TeamPayload) -> Response {
    raw_json_response(StatusCode::OK, payload.keys_json.clone())
}

fn longpoll_timeout() -> Response {
    json_response(StatusCode::OK, &ErrorBody::new(ERROR_LONGPOLL_TIMEOUT))
}

fn cache_error_response(team: &str, err: &CacheError) -> Response {
    if err.is_team_not_found() {
        log::warn!("Request for unknown team '{team}': {err}");
        error_response(StatusCode::NOT_FOUND, ERROR_TEAM_NOT_FOUND)
    } else {
        log::error!("Cannot load keys for team '{team}': {err}");
        error_response(StatusCode::INTERNAL_SERVER_ERROR, ERROR_UNEXPECTED)
    }
}
