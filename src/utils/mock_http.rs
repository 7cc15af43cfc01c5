//! Scripted HTTP endpoint on a local port for transport tests.

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderMap, Method, Uri};
use axum::response::Response;
use axum::Router;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One request as the server received it.
#[derive(Debug, Clone)]
pub(crate) struct Recorded {
    pub(crate) method: Method,
    pub(crate) uri: Uri,
    pub(crate) headers: HeaderMap,
    pub(crate) body_len: usize,
}

impl Recorded {
    pub(crate) fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub(crate) fn query(&self) -> &str {
        self.uri.query().unwrap_or("")
    }

    pub(crate) fn has_query_param(&self, name: &str) -> bool {
        self.query()
            .split('&')
            .any(|pair| pair == name || pair.split_once('=').is_some_and(|(key, _)| key == name))
    }
}

pub(crate) enum Reply {
    Respond {
        status: u16,
        headers: Vec<(&'static str, String)>,
        body: String,
    },
    /// Never answers.
    Stall,
}

impl Reply {
    pub(crate) fn status(status: u16) -> Self {
        Reply::Respond {
            status,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    pub(crate) fn header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        if let Reply::Respond { headers, .. } = &mut self {
            headers.push((name, value.into()));
        }
        self
    }

    pub(crate) fn body(mut self, text: impl Into<String>) -> Self {
        if let Reply::Respond { body, .. } = &mut self {
            *body = text.into();
        }
        self
    }
}

type Responder = dyn Fn(&Recorded, usize) -> Reply + Send + Sync;

struct Shared {
    requests: Mutex<Vec<Recorded>>,
    respond: Box<Responder>,
}

#[derive(Clone)]
pub(crate) struct MockServer {
    pub(crate) url: String,
    shared: Arc<Shared>,
}

impl MockServer {
    /// Serves every request with `respond(request, index)`, where `index` counts from zero.
    pub(crate) async fn start<F>(respond: F) -> Self
    where
        F: Fn(&Recorded, usize) -> Reply + Send + Sync + 'static,
    {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let shared = Arc::new(Shared {
            requests: Mutex::new(Vec::new()),
            respond: Box::new(respond),
        });
        let app = Router::new().fallback(handle).with_state(shared.clone());
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Self {
            url: format!("http://{addr}"),
            shared,
        }
    }

    pub(crate) fn requests(&self) -> Vec<Recorded> {
        self.shared.requests.lock().unwrap().clone()
    }

    /// Resolves once at least `count` requests have arrived.
    pub(crate) async fn wait_for_requests(&self, count: usize) {
        while self.shared.requests.lock().unwrap().len() < count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

async fn handle(State(shared): State<Arc<Shared>>, method: Method, uri: Uri, headers: HeaderMap, body: Bytes) -> Response {
    let request = Recorded {
        method,
        uri,
        headers,
        body_len: body.len(),
    };
    let reply = {
        let mut requests = shared.requests.lock().unwrap();
        let index = requests.len();
        requests.push(request.clone());
        (shared.respond)(&request, index)
    };

    match reply {
        Reply::Stall => std::future::pending::<Response>().await,
        Reply::Respond { status, headers, body } => {
            let mut builder = axum::http::Response::builder().status(status);
            for (name, value) in headers {
                builder = builder.header(name, value);
            }
            builder.body(Body::from(body)).unwrap()
        }
    }
}
