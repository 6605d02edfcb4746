//! The application context: shared state, listeners and the front handler
//! every accepted request goes through.

use futures::future::BoxFuture;
use hyper::body::Incoming;
use hyper::{Method, Request, Response, StatusCode};
use serde_json::Value;
use std::sync::{Arc, Weak};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::api::{self, Call, Dispatcher};
use crate::config::{ConfigStore, Configuration};
use crate::error::{text_response, Result};
use crate::proxy::ReverseProxy;
use crate::routing::{request_host, Route, RouteTable};
use crate::server::{Connection, Handler, ResponseBody, Server};
use crate::session::SessionManager;
use crate::supervisor::ServiceSupervisor;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Everything guarded by the configuration lock: the declarative
/// configuration and the live service map change together.
pub struct State {
    pub store: ConfigStore,
    pub supervisor: ServiceSupervisor,
}

/// Constructed once at startup and shared by every listener and procedure
pub struct Goule {
    pub(crate) state: RwLock<State>,
    pub(crate) sessions: SessionManager,
    pub(crate) http: Server,
    pub(crate) https: Server,
    proxy: ReverseProxy,
    routes: parking_lot::RwLock<Arc<RouteTable>>,
    pub(crate) dispatcher: Dispatcher,
}

impl Goule {
    /// Build the context. Nothing listens and nothing is launched until
    /// [`start`](Goule::start).
    pub fn new(store: ConfigStore) -> Arc<Self> {
        let config = store.config();
        let sessions = SessionManager::new(config.admin.session_timeout);
        let routes = RouteTable::from_config(config);
        let supervisor = ServiceSupervisor::from_config(config);

        Arc::new_cyclic(|weak: &Weak<Goule>| Self {
            state: RwLock::new(State { store, supervisor }),
            sessions,
            http: Server::new("http", front_handler(weak.clone())),
            https: Server::new("https", front_handler(weak.clone())),
            proxy: ReverseProxy::new(),
            routes: parking_lot::RwLock::new(Arc::new(routes)),
            dispatcher: Dispatcher::new(),
        })
    }

    /// Start the enabled listeners, then autolaunch services
    pub async fn start(&self) -> Result<()> {
        let mut state = self.state.write().await;
        let config = state.store.config().clone();

        if config.http.enabled {
            self.http.start(config.http.port, None).await?;
        }
        if config.https.enabled {
            self.https.start(config.https.port, Some(&config.tls)).await?;
        }

        state.supervisor.launch_autolaunch().await;
        info!(services = config.services.len(), "Goule started");
        Ok(())
    }

    /// Stop both listeners and every service
    pub async fn shutdown(&self) {
        let mut state = self.state.write().await;
        self.http.stop().await;
        self.https.stop().await;
        state.supervisor.stop_all().await;
        info!("Goule stopped");
    }

    pub fn http(&self) -> &Server {
        &self.http
    }

    pub fn https(&self) -> &Server {
        &self.https
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Snapshot of the configuration
    pub async fn config(&self) -> Configuration {
        self.state.read().await.store.config().clone()
    }

    /// Run a procedure as if it arrived over the admin endpoint
    pub async fn call(&self, name: &str, args: Vec<String>, call: &mut Call) -> Result<Value> {
        self.dispatcher.call(self, name, args, call).await
    }

    pub fn routes(&self) -> Arc<RouteTable> {
        Arc::clone(&self.routes.read())
    }

    pub(crate) fn refresh_routes(&self, config: &Configuration) {
        let table = RouteTable::from_config(config);
        debug!(rules = table.len(), "Routing table rebuilt");
        *self.routes.write() = Arc::new(table);
    }

    /// Route one request to the admin endpoint or a backend
    pub async fn handle(&self, req: Request<Incoming>, conn: Connection) -> Response<ResponseBody> {
        let host = request_host(&req);
        let route = self.routes().resolve(
            conn.secure,
            host.as_deref(),
            req.uri().path(),
            req.uri().query(),
        );

        match route {
            Some(Route::Admin { path }) => self.admin(req, &path).await,
            Some(Route::Forward {
                service,
                destination,
            }) => {
                debug!(service = %service, destination = %destination, addr = %conn.remote, "Forwarding request");
                self.proxy.forward(req, &destination).await
            }
            None => {
                debug!(host = ?host, path = req.uri().path(), "No route");
                text_response(StatusCode::NOT_FOUND, "No route for this request.")
            }
        }
    }

    async fn admin(&self, req: Request<Incoming>, path: &str) -> Response<ResponseBody> {
        let method = req.method().clone();
        match (&method, path) {
            // Version endpoint: GET /version (no auth required)
            (&Method::GET, "/version") => {
                let body = serde_json::json!({
                    "name": PKG_NAME,
                    "version": VERSION,
                });
                api::json_response(StatusCode::OK, body.to_string())
            }

            (&Method::POST, p) if p.starts_with("/api/") => {
                let name = &p["/api/".len()..];
                if name.is_empty() || name.contains('/') {
                    return text_response(StatusCode::NOT_FOUND, "Not found.");
                }
                let (parts, body) = req.into_parts();
                api::serve(self, name, &parts.headers, body).await
            }

            _ => text_response(StatusCode::NOT_FOUND, "Not found."),
        }
    }
}

fn front_handler(app: Weak<Goule>) -> Handler {
    Arc::new(move |req: Request<Incoming>, conn: Connection| -> BoxFuture<'static, Response<ResponseBody>> {
        let app = app.clone();
        Box::pin(async move {
            match app.upgrade() {
                Some(app) => app.handle(req, conn).await,
                None => text_response(StatusCode::SERVICE_UNAVAILABLE, "Shutting down."),
            }
        })
    })
}
