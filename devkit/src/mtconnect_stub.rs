/*!
Agent MTConnect en mémoire

Petit serveur axum sur 127.0.0.1 (port éphémère) qui répond à /probe et
/current comme un agent réel. Le document courant et les pannes HTTP sont
pilotés par le test.
*/

use crate::fixtures::{CurrentDocument, PROBE_DOCUMENT};
use anyhow::Result;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

#[derive(Default)]
struct AgentState {
    current: Mutex<String>,
    failing: AtomicBool,
    current_requests: AtomicUsize,
}

pub struct MtConnectAgentStub {
    addr: SocketAddr,
    state: Arc<AgentState>,
    server: JoinHandle<()>,
}

impl MtConnectAgentStub {
    /// Démarre l'agent avec un document /current initial
    pub async fn start(initial: &CurrentDocument) -> Result<Self> {
        let state = Arc::new(AgentState {
            current: Mutex::new(initial.to_xml()),
            ..Default::default()
        });

        let app = Router::new()
            .route("/probe", get(probe))
            .route("/current", get(current))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let server = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                log::error!("[STUB] mtconnect agent stopped: {e}");
            }
        });
        log::info!("[STUB] mtconnect agent on http://{addr}");

        Ok(Self { addr, state, server })
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn set_current(&self, document: &CurrentDocument) {
        self.set_current_xml(document.to_xml());
    }

    pub fn set_current_xml(&self, xml: impl Into<String>) {
        *self.state.current.lock().unwrap() = xml.into();
    }

    /// Toutes les requêtes répondent 503 tant que `failing` est vrai
    pub fn set_failing(&self, failing: bool) {
        self.state.failing.store(failing, Ordering::SeqCst);
    }

    pub fn current_requests(&self) -> usize {
        self.state.current_requests.load(Ordering::SeqCst)
    }
}

impl Drop for MtConnectAgentStub {
    fn drop(&mut self) {
        self.server.abort();
    }
}

fn xml(body: String) -> Response {
    ([(header::CONTENT_TYPE, "application/xml")], body).into_response()
}

async fn probe(State(state): State<Arc<AgentState>>) -> Response {
    if state.failing.load(Ordering::SeqCst) {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    xml(PROBE_DOCUMENT.to_string())
}

async fn current(State(state): State<Arc<AgentState>>) -> Response {
    state.current_requests.fetch_add(1, Ordering::SeqCst);
    if state.failing.load(Ordering::SeqCst) {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    let body = state.current.lock().unwrap().clone();
    xml(body)
}
