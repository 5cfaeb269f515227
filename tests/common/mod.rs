// tests/common/mod.rs
//
// In-process fake for the feed and store APIs: an Axum app on 127.0.0.1:0
// that records every request and answers through a test-supplied responder.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use axum::{
    extract::State,
    http::{Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    Router,
};
use tokio::net::TcpListener;

#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: String,
    pub path: String,
    pub query: String,
    pub body: String,
}

impl Recorded {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_str(&self.body).expect("request body is JSON")
    }
}

type Responder = dyn Fn(&Recorded, usize) -> (u16, String) + Send + Sync;

#[derive(Clone)]
struct FakeState {
    log: Arc<Mutex<Vec<Recorded>>>,
    respond: Arc<Responder>,
}

pub struct FakeServer {
    pub base_url: String,
    log: Arc<Mutex<Vec<Recorded>>>,
}

impl FakeServer {
    /// `respond(request, n)` gets the request and how many earlier requests
    /// hit the same method + path.
    pub async fn start<F>(respond: F) -> Self
    where
        F: Fn(&Recorded, usize) -> (u16, String) + Send + Sync + 'static,
    {
        let log = Arc::new(Mutex::new(Vec::new()));
        let state = FakeState {
            log: log.clone(),
            respond: Arc::new(respond),
        };
        let app = Router::new().fallback(handle).with_state(state);

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind fake");
        let addr = listener.local_addr().expect("fake addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("fake server");
        });

        Self {
            base_url: format!("http://{addr}"),
            log,
        }
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.log.lock().unwrap().clone()
    }

    pub fn requests_to(&self, method: &str, path_prefix: &str) -> Vec<Recorded> {
        self.requests()
            .into_iter()
            .filter(|r| r.method == method && r.path.starts_with(path_prefix))
            .collect()
    }
}

async fn handle(State(state): State<FakeState>, method: Method, uri: Uri, body: String) -> Response {
    let rec = Recorded {
        method: method.to_string(),
        path: uri.path().to_string(),
        query: uri.query().unwrap_or_default().to_string(),
        body,
    };
    let seen = {
        let mut log = state.log.lock().unwrap();
        let seen = log
            .iter()
            .filter(|r| r.method == rec.method && r.path == rec.path)
            .count();
        log.push(rec.clone());
        seen
    };
    let (status, body) = (state.respond)(&rec, seen);
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body,
    )
        .into_response()
}

pub fn ok(body: serde_json::Value) -> (u16, String) {
    (200, body.to_string())
}
