//! Remote procedure dispatch for the admin endpoint
//!
//! Procedures live in a registry built once at startup. Each entry carries
//! its argument count and a handler whose type fixes its lock class: read
//! handlers run under the shared configuration lock, write handlers under the
//! exclusive one. Only `Auth` may be called without a valid session.
//!
//! Wire format: the request body is a JSON array of strings, each string the
//! JSON encoding of one argument. The response is `{"ok": value}` or
//! `{"error": {"kind", "message"}}`.

use futures::future::BoxFuture;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::{Body, Bytes};
use hyper::header::{HeaderValue, COOKIE, SET_COOKIE};
use hyper::{Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, error, info, warn};

use crate::app::{Goule, State};
use crate::config::{ForwardRule, ServerSettings, Service, SourceUrl, TlsInfo};
use crate::error::{Error, Outcome, Result};
use crate::server::{ResponseBody, Server};
use crate::session::{self, hash_password, verify_password};
use crate::tls;

/// Largest accepted request body
pub const MAX_BODY_BYTES: usize = 64 * 1024;

/// The one procedure callable without a session
pub const AUTH_PROCEDURE: &str = "Auth";

type ReadFn = fn(&State, &[String]) -> Result<Value>;
type WriteFn =
    for<'a> fn(&'a Goule, &'a mut State, &'a mut Call, Vec<String>) -> BoxFuture<'a, Result<Value>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

#[derive(Clone, Copy)]
enum Handler {
    Read(ReadFn),
    Write(WriteFn),
}

/// Registry entry
#[derive(Clone, Copy)]
pub struct Procedure {
    arity: usize,
    handler: Handler,
}

impl Procedure {
    fn read<A: FromArgs>(handler: ReadFn) -> Self {
        Self {
            arity: A::ARITY,
            handler: Handler::Read(handler),
        }
    }

    fn write<A: FromArgs>(handler: WriteFn) -> Self {
        Self {
            arity: A::ARITY,
            handler: Handler::Write(handler),
        }
    }

    pub fn access(&self) -> Access {
        match self.handler {
            Handler::Read(_) => Access::Read,
            Handler::Write(_) => Access::Write,
        }
    }

    pub fn arity(&self) -> usize {
        self.arity
    }
}

/// Per-call request facts and response side channel
#[derive(Debug, Default)]
pub struct Call {
    token: Option<String>,
    set_cookie: Option<String>,
}

impl Call {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token,
            set_cookie: None,
        }
    }

    /// `Set-Cookie` value the procedure asked to send back
    pub fn set_cookie(&self) -> Option<&str> {
        self.set_cookie.as_deref()
    }
}

/// Decodes a positional argument list into a typed tuple
pub trait FromArgs: Sized {
    const ARITY: usize;

    fn from_args(args: &[String]) -> Result<Self>;
}

fn decode<T: DeserializeOwned>(args: &[String], index: usize) -> Result<T> {
    serde_json::from_str(&args[index])
        .map_err(|e| Error::Validation(format!("argument {}: {}", index, e)))
}

fn check_arity(args: &[String], arity: usize) -> Result<()> {
    if args.len() != arity {
        return Err(Error::Validation(format!(
            "expected {} arguments, got {}",
            arity,
            args.len()
        )));
    }
    Ok(())
}

macro_rules! impl_from_args {
    ($arity:expr; $($ty:ident $index:tt),*) => {
        impl<$($ty: DeserializeOwned),*> FromArgs for ($($ty,)*) {
            const ARITY: usize = $arity;

            fn from_args(args: &[String]) -> Result<Self> {
                check_arity(args, $arity)?;
                Ok(($(decode::<$ty>(args, $index)?,)*))
            }
        }
    };
}

impl_from_args!(0;);
impl_from_args!(1; A 0);
impl_from_args!(2; A 0, B 1);
impl_from_args!(3; A 0, B 1, C 2);

/// Name to procedure lookup, built once
pub struct Dispatcher {
    procedures: HashMap<&'static str, Procedure>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        let procedures = HashMap::from([
            ("Config", Procedure::read::<()>(config)),
            ("Services", Procedure::read::<()>(services)),
            (AUTH_PROCEDURE, Procedure::write::<(String,)>(auth)),
            ("Deauth", Procedure::write::<()>(deauth)),
            ("AddService", Procedure::write::<(String, Service)>(add_service)),
            ("DeleteService", Procedure::write::<(String,)>(delete_service)),
            ("UpdateService", Procedure::write::<(String, Service)>(update_service)),
            ("StartService", Procedure::write::<(String,)>(start_service)),
            ("StopService", Procedure::write::<(String,)>(stop_service)),
            ("AddForwardRule", Procedure::write::<(String, ForwardRule)>(add_forward_rule)),
            ("DeleteForwardRule", Procedure::write::<(String, ForwardRule)>(delete_forward_rule)),
            (
                "SetForwardRule",
                Procedure::write::<(String, ForwardRule, ForwardRule)>(set_forward_rule),
            ),
            ("AddAdminRule", Procedure::write::<(SourceUrl,)>(add_admin_rule)),
            ("DeleteAdminRule", Procedure::write::<(SourceUrl,)>(delete_admin_rule)),
            ("SetAdminRule", Procedure::write::<(SourceUrl, SourceUrl)>(set_admin_rule)),
            ("SetPassword", Procedure::write::<(String,)>(set_password)),
            ("SetSessionTimeout", Procedure::write::<(u64,)>(set_session_timeout)),
            ("SetTLS", Procedure::write::<(TlsInfo,)>(set_tls)),
            ("SetHTTP", Procedure::write::<(ServerSettings,)>(set_http)),
            ("SetHTTPS", Procedure::write::<(ServerSettings,)>(set_https)),
        ]);
        debug!(procedures = procedures.len(), "Procedure registry built");
        Self { procedures }
    }

    pub fn get(&self, name: &str) -> Option<&Procedure> {
        self.procedures.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.procedures.keys().copied()
    }

    /// Session gate: every procedure but `Auth` needs a valid session,
    /// whatever the name or arguments.
    pub fn authorize(&self, app: &Goule, name: &str, call: &Call) -> Result<()> {
        if name == AUTH_PROCEDURE {
            return Ok(());
        }
        let authenticated = call
            .token
            .as_deref()
            .is_some_and(|token| app.sessions.validate(token));
        if !authenticated {
            return Err(Error::Permission("Permission denied.".to_string()));
        }
        Ok(())
    }

    /// Authenticate, resolve, check arity, lock and run one procedure
    pub async fn call(&self, app: &Goule, name: &str, args: Vec<String>, call: &mut Call) -> Result<Value> {
        self.authorize(app, name, call)?;

        let procedure = self
            .procedures
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("Unknown procedure {}.", name)))?;
        check_arity(&args, procedure.arity)?;

        match procedure.handler {
            Handler::Read(handler) => {
                let state = app.state.read().await;
                handler(&*state, &args)
            }
            Handler::Write(handler) => {
                let mut state = app.state.write().await;
                let result = handler(app, &mut *state, call, args).await;
                if result.is_ok() {
                    app.refresh_routes(state.store.config());
                }
                result
            }
        }
    }
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| Error::Serialization(e.to_string()))
}

fn config(state: &State, args: &[String]) -> Result<Value> {
    <()>::from_args(args)?;
    to_value(state.store.config())
}

fn services(state: &State, args: &[String]) -> Result<Value> {
    <()>::from_args(args)?;
    to_value(&state.supervisor.statuses(state.store.config()))
}

fn auth<'a>(app: &'a Goule, state: &'a mut State, call: &'a mut Call, args: Vec<String>) -> BoxFuture<'a, Result<Value>> {
    Box::pin(async move {
        let (password,) = <(String,)>::from_args(&args)?;
        if !verify_password(&password, &state.store.config().admin.password_hash) {
            warn!("Rejected admin login");
            return Ok(Value::Bool(false));
        }
        let token = app.sessions.login();
        call.set_cookie = Some(session::session_cookie(&token));
        info!("Admin logged in");
        Ok(Value::Bool(true))
    })
}

fn deauth<'a>(app: &'a Goule, _state: &'a mut State, call: &'a mut Call, args: Vec<String>) -> BoxFuture<'a, Result<Value>> {
    Box::pin(async move {
        <()>::from_args(&args)?;
        if let Some(token) = call.token.as_deref() {
            app.sessions.logout(token);
        }
        call.set_cookie = Some(session::logout_cookie());
        Ok(Value::Null)
    })
}

fn add_service<'a>(_app: &'a Goule, state: &'a mut State, _call: &'a mut Call, args: Vec<String>) -> BoxFuture<'a, Result<Value>> {
    Box::pin(async move {
        let (name, service) = <(String, Service)>::from_args(&args)?;
        state.supervisor.add_service(&mut state.store, &name, service).await?;
        Ok(Value::Null)
    })
}

fn delete_service<'a>(_app: &'a Goule, state: &'a mut State, _call: &'a mut Call, args: Vec<String>) -> BoxFuture<'a, Result<Value>> {
    Box::pin(async move {
        let (name,) = <(String,)>::from_args(&args)?;
        state.supervisor.delete_service(&mut state.store, &name).await?;
        Ok(Value::Null)
    })
}

fn update_service<'a>(_app: &'a Goule, state: &'a mut State, _call: &'a mut Call, args: Vec<String>) -> BoxFuture<'a, Result<Value>> {
    Box::pin(async move {
        let (name, service) = <(String, Service)>::from_args(&args)?;
        state.supervisor.update_service(&mut state.store, &name, service).await?;
        Ok(Value::Null)
    })
}

fn start_service<'a>(_app: &'a Goule, state: &'a mut State, _call: &'a mut Call, args: Vec<String>) -> BoxFuture<'a, Result<Value>> {
    Box::pin(async move {
        let (name,) = <(String,)>::from_args(&args)?;
        state.supervisor.start_service(&name).await?;
        Ok(Value::Null)
    })
}

fn stop_service<'a>(_app: &'a Goule, state: &'a mut State, _call: &'a mut Call, args: Vec<String>) -> BoxFuture<'a, Result<Value>> {
    Box::pin(async move {
        let (name,) = <(String,)>::from_args(&args)?;
        state.supervisor.stop_service(&name).await?;
        Ok(Value::Null)
    })
}

fn rule_not_found() -> Error {
    Error::NotFound("Rule not found.".to_string())
}

fn service_not_found(name: &str) -> Error {
    Error::NotFound(format!("Service {} not found.", name))
}

fn forward_rules<'c>(
    config: &'c mut crate::config::Configuration,
    service: &str,
) -> Result<&'c mut Vec<ForwardRule>> {
    config
        .service_mut(service)
        .map(|s| &mut s.forward_rules)
        .ok_or_else(|| service_not_found(service))
}

fn add_forward_rule<'a>(_app: &'a Goule, state: &'a mut State, _call: &'a mut Call, args: Vec<String>) -> BoxFuture<'a, Result<Value>> {
    Box::pin(async move {
        let (service, rule) = <(String, ForwardRule)>::from_args(&args)?;
        state.store.update(|config| {
            forward_rules(config, &service)?.push(rule);
            Ok(())
        })?;
        Ok(Value::Null)
    })
}

fn delete_forward_rule<'a>(_app: &'a Goule, state: &'a mut State, _call: &'a mut Call, args: Vec<String>) -> BoxFuture<'a, Result<Value>> {
    Box::pin(async move {
        let (service, rule) = <(String, ForwardRule)>::from_args(&args)?;
        state.store.update(|config| {
            let rules = forward_rules(config, &service)?;
            let index = rules.iter().position(|r| *r == rule).ok_or_else(rule_not_found)?;
            rules.remove(index);
            Ok(())
        })?;
        Ok(Value::Null)
    })
}

fn set_forward_rule<'a>(_app: &'a Goule, state: &'a mut State, _call: &'a mut Call, args: Vec<String>) -> BoxFuture<'a, Result<Value>> {
    Box::pin(async move {
        let (service, old, new) = <(String, ForwardRule, ForwardRule)>::from_args(&args)?;
        state.store.update(|config| {
            let rules = forward_rules(config, &service)?;
            let slot = rules.iter_mut().find(|r| **r == old).ok_or_else(rule_not_found)?;
            *slot = new;
            Ok(())
        })?;
        Ok(Value::Null)
    })
}

fn add_admin_rule<'a>(_app: &'a Goule, state: &'a mut State, _call: &'a mut Call, args: Vec<String>) -> BoxFuture<'a, Result<Value>> {
    Box::pin(async move {
        let (rule,) = <(SourceUrl,)>::from_args(&args)?;
        state.store.update(|config| {
            config.admin.rules.push(rule);
            Ok(())
        })?;
        Ok(Value::Null)
    })
}

fn delete_admin_rule<'a>(_app: &'a Goule, state: &'a mut State, _call: &'a mut Call, args: Vec<String>) -> BoxFuture<'a, Result<Value>> {
    Box::pin(async move {
        let (rule,) = <(SourceUrl,)>::from_args(&args)?;
        state.store.update(|config| {
            let rules = &mut config.admin.rules;
            let index = rules.iter().position(|r| *r == rule).ok_or_else(rule_not_found)?;
            rules.remove(index);
            Ok(())
        })?;
        Ok(Value::Null)
    })
}

fn set_admin_rule<'a>(_app: &'a Goule, state: &'a mut State, _call: &'a mut Call, args: Vec<String>) -> BoxFuture<'a, Result<Value>> {
    Box::pin(async move {
        let (old, new) = <(SourceUrl, SourceUrl)>::from_args(&args)?;
        state.store.update(|config| {
            let slot = config
                .admin
                .rules
                .iter_mut()
                .find(|r| **r == old)
                .ok_or_else(rule_not_found)?;
            *slot = new;
            Ok(())
        })?;
        Ok(Value::Null)
    })
}

fn set_password<'a>(_app: &'a Goule, state: &'a mut State, _call: &'a mut Call, args: Vec<String>) -> BoxFuture<'a, Result<Value>> {
    Box::pin(async move {
        let (password,) = <(String,)>::from_args(&args)?;
        if password.is_empty() {
            return Err(Error::Validation("Password must not be empty.".to_string()));
        }
        state.store.update(|config| {
            config.admin.password_hash = hash_password(&password);
            Ok(())
        })?;
        info!("Admin password changed");
        Ok(Value::Null)
    })
}

fn set_session_timeout<'a>(app: &'a Goule, state: &'a mut State, _call: &'a mut Call, args: Vec<String>) -> BoxFuture<'a, Result<Value>> {
    Box::pin(async move {
        let (timeout,) = <(u64,)>::from_args(&args)?;
        state.store.update(|config| {
            config.admin.session_timeout = timeout;
            Ok(())
        })?;
        app.sessions.set_timeout(timeout);
        Ok(Value::Null)
    })
}

fn set_tls<'a>(app: &'a Goule, state: &'a mut State, _call: &'a mut Call, args: Vec<String>) -> BoxFuture<'a, Result<Value>> {
    Box::pin(async move {
        let (info,) = <(TlsInfo,)>::from_args(&args)?;
        tls::build_acceptor(&info)?;

        let previous = state.store.config().tls.clone();
        let (running, port) = app.https.status().await;
        if running {
            app.https.restart(port, Some(&info)).await?;
        }

        let result = state.store.update(|config| {
            config.tls = info;
            Ok(())
        });
        if let Err(e) = result {
            if running {
                if let Err(restore) = app.https.restart(port, Some(&previous)).await {
                    error!(error = %restore, "Failed to restore previous TLS configuration");
                }
            }
            return Err(e);
        }
        info!(restarted = running, "TLS configuration replaced");
        Ok(Value::Null)
    })
}

#[derive(Debug, Clone, Copy)]
enum Listener {
    Http,
    Https,
}

fn set_http<'a>(app: &'a Goule, state: &'a mut State, _call: &'a mut Call, args: Vec<String>) -> BoxFuture<'a, Result<Value>> {
    Box::pin(async move {
        let (settings,) = <(ServerSettings,)>::from_args(&args)?;
        set_listener(app, state, Listener::Http, settings).await?;
        Ok(Value::Null)
    })
}

fn set_https<'a>(app: &'a Goule, state: &'a mut State, _call: &'a mut Call, args: Vec<String>) -> BoxFuture<'a, Result<Value>> {
    Box::pin(async move {
        let (settings,) = <(ServerSettings,)>::from_args(&args)?;
        set_listener(app, state, Listener::Https, settings).await?;
        Ok(Value::Null)
    })
}

/// Move a listener to `next`, then persist. A failed write puts the
/// listener back where it was.
async fn set_listener(app: &Goule, state: &mut State, which: Listener, next: ServerSettings) -> Result<()> {
    let config = state.store.config();
    let (server, current) = match which {
        Listener::Http => (&app.http, config.http),
        Listener::Https => (&app.https, config.https),
    };
    let tls_info = config.tls.clone();
    let tls = matches!(which, Listener::Https).then_some(&tls_info);

    let (was_running, was_port) = server.status().await;
    transition(server, current, next, tls).await?;

    let result = state.store.update(|config| {
        match which {
            Listener::Http => config.http = next,
            Listener::Https => config.https = next,
        }
        Ok(())
    });
    if let Err(e) = result {
        restore(server, was_running, was_port, tls).await;
        return Err(e);
    }

    info!(listener = ?which, enabled = next.enabled, port = next.port, "Listener settings changed");
    Ok(())
}

async fn transition(
    server: &Server,
    current: ServerSettings,
    next: ServerSettings,
    tls: Option<&TlsInfo>,
) -> Result<()> {
    let running = server.is_running().await;
    if !next.enabled {
        if running {
            server.stop().await;
        }
        return Ok(());
    }
    if !running {
        return server.start(next.port, tls).await;
    }
    if next.port != current.port {
        return server.restart(next.port, tls).await;
    }
    Ok(())
}

async fn restore(server: &Server, was_running: bool, was_port: u16, tls: Option<&TlsInfo>) {
    let result = match (was_running, server.status().await) {
        (false, (true, _)) => {
            server.stop().await;
            Ok(())
        }
        (true, (false, _)) => server.start(was_port, tls).await,
        (true, (true, port)) if port != was_port => server.restart(was_port, tls).await,
        _ => Ok(()),
    };
    if let Err(e) = result {
        error!(port = was_port, error = %e, "Failed to restore listener");
    }
}

/// Serve `POST .../api/{name}`
pub async fn serve<B>(app: &Goule, name: &str, headers: &hyper::HeaderMap, body: B) -> Response<ResponseBody>
where
    B: Body<Data = Bytes>,
    B::Error: std::error::Error + Send + Sync + 'static,
{
    let token = headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .find_map(session::token_from_cookie_header);
    let mut call = Call::new(token);

    // The body is not read until the caller has a session.
    let result = match app.dispatcher.authorize(app, name, &call) {
        Ok(()) => match read_args(body).await {
            Ok(args) => app.call(name, args, &mut call).await,
            Err(e) => Err(e),
        },
        Err(e) => Err(e),
    };

    let (status, outcome) = match result {
        Ok(value) => (StatusCode::OK, Outcome::Ok(value)),
        Err(e) => {
            debug!(procedure = name, error = %e, "Procedure failed");
            (e.status_code(), Outcome::Error(e.failure()))
        }
    };

    let mut response = json_response(status, outcome.to_json());
    if let Some(cookie) = call.set_cookie() {
        if let Ok(value) = HeaderValue::from_str(cookie) {
            response.headers_mut().insert(SET_COOKIE, value);
        }
    }
    response
}

async fn read_args<B>(body: B) -> Result<Vec<String>>
where
    B: Body<Data = Bytes>,
    B::Error: std::error::Error + Send + Sync + 'static,
{
    let bytes = Limited::new(body, MAX_BODY_BYTES)
        .collect()
        .await
        .map_err(|e| {
            if e.downcast_ref::<LengthLimitError>().is_some() {
                Error::Validation(format!("request body exceeds {} bytes", MAX_BODY_BYTES))
            } else {
                Error::Validation(format!("failed to read request body: {}", e))
            }
        })?
        .to_bytes();

    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }
    serde_json::from_slice(&bytes)
        .map_err(|e| Error::Validation(format!("arguments must be a JSON array of strings: {}", e)))
}

pub(crate) fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<ResponseBody> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()).map_err(|never| match never {}).boxed())
        .expect("valid response with StatusCode enum and static header")
}
