//! Listener lifecycle: start, stop, status and port/TLS changes with recovery.
//!
//! The same state machine drives the plain HTTP and the TLS listener. Its
//! lock is independent of the configuration lock so that traffic through an
//! active listener never waits on configuration changes. Callers that hold
//! both take the configuration lock first.

use futures::future::BoxFuture;
use http_body_util::combinators::BoxBody;
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::io::ErrorKind as IoErrorKind;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::config::TlsInfo;
use crate::error::{Error, Result};
use crate::tls;

pub type ResponseBody = BoxBody<Bytes, hyper::Error>;

/// Per-connection facts handed to the request handler
#[derive(Debug, Clone, Copy)]
pub struct Connection {
    pub remote: SocketAddr,
    pub secure: bool,
}

/// Serves every request accepted by a listener
pub type Handler =
    Arc<dyn Fn(Request<Incoming>, Connection) -> BoxFuture<'static, Response<ResponseBody>> + Send + Sync>;

/// Pause before accepting again after a transient accept failure
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

struct Active {
    id: u64,
    port: u16,
    acceptor: Option<TlsAcceptor>,
    task: JoinHandle<()>,
}

type Slot = Arc<Mutex<Option<Active>>>;

/// One listener, either plain or TLS-terminating
pub struct Server {
    name: &'static str,
    handler: Handler,
    active: Slot,
    next_id: AtomicU64,
}

impl Server {
    pub fn new(name: &'static str, handler: Handler) -> Self {
        Self {
            name,
            handler,
            active: Arc::new(Mutex::new(None)),
            next_id: AtomicU64::new(1),
        }
    }

    /// Start listening on `port`, terminating TLS when `tls` is given.
    ///
    /// Fails without side effects if the listener is already running, the
    /// TLS material does not load, or the port cannot be bound.
    pub async fn start(&self, port: u16, tls: Option<&TlsInfo>) -> Result<()> {
        let mut active = self.active.lock().await;
        if let Some(current) = active.as_ref() {
            return Err(Error::Conflict(format!(
                "{} listener already running on port {}",
                self.name, current.port
            )));
        }

        let acceptor = tls.map(tls::build_acceptor).transpose()?;
        *active = Some(self.launch(port, acceptor).await?);
        Ok(())
    }

    /// Close the listener if one is running
    pub async fn stop(&self) {
        let mut active = self.active.lock().await;
        if let Some(current) = active.take() {
            shutdown(self.name, current).await;
        }
    }

    /// `(is_running, port)`; the port is the last one bound
    pub async fn status(&self) -> (bool, u16) {
        let active = self.active.lock().await;
        match active.as_ref() {
            Some(current) => (true, current.port),
            None => (false, 0),
        }
    }

    pub async fn is_running(&self) -> bool {
        self.status().await.0
    }

    /// Move the listener to `port`, optionally with new TLS material.
    ///
    /// New TLS material is loaded before anything is stopped. If the new
    /// port cannot be bound, the previous port and TLS material are brought
    /// back; should that also fail the listener ends stopped. Either way the
    /// original failure is returned.
    pub async fn restart(&self, port: u16, tls: Option<&TlsInfo>) -> Result<()> {
        let mut active = self.active.lock().await;

        let new_acceptor = tls.map(tls::build_acceptor).transpose()?;

        let previous = match active.take() {
            Some(current) => {
                let previous = (current.port, current.acceptor.clone());
                shutdown(self.name, current).await;
                Some(previous)
            }
            None => None,
        };

        match self.launch(port, new_acceptor).await {
            Ok(next) => {
                *active = Some(next);
                Ok(())
            }
            Err(e) => {
                if let Some((old_port, old_acceptor)) = previous {
                    warn!(listener = self.name, port, old_port, error = %e, "Restart failed, restoring previous listener");
                    match self.launch(old_port, old_acceptor).await {
                        Ok(restored) => *active = Some(restored),
                        Err(recovery) => {
                            error!(listener = self.name, old_port, error = %recovery, "Failed to restore previous listener");
                        }
                    }
                }
                Err(e)
            }
        }
    }

    async fn launch(&self, port: u16, acceptor: Option<TlsAcceptor>) -> Result<Active> {
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| Error::Bind { port, source })?;
        let bound = listener
            .local_addr()
            .map_err(|source| Error::Bind { port, source })?
            .port();

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let protocol = if acceptor.is_some() { "HTTPS" } else { "HTTP" };
        info!(listener = self.name, port = bound, protocol, "Listening (HTTP/1.1 and HTTP/2)");

        let task = tokio::spawn(accept_loop(
            self.name,
            id,
            listener,
            acceptor.clone(),
            Arc::clone(&self.handler),
            Arc::clone(&self.active),
        ));

        Ok(Active {
            id,
            port: bound,
            acceptor,
            task,
        })
    }
}

async fn shutdown(name: &'static str, active: Active) {
    active.task.abort();
    let _ = active.task.await;
    info!(listener = name, port = active.port, "Listener stopped");
}

async fn accept_loop(
    name: &'static str,
    id: u64,
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    handler: Handler,
    slot: Slot,
) {
    let failure = loop {
        match listener.accept().await {
            Ok((stream, remote)) => {
                let handler = Arc::clone(&handler);
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    if let Some(acceptor) = acceptor {
                        match acceptor.accept(stream).await {
                            Ok(tls_stream) => {
                                let conn = Connection { remote, secure: true };
                                if let Err(e) = serve_connection(tls_stream, conn, handler).await {
                                    debug!(addr = %remote, error = %e, "TLS connection error");
                                }
                            }
                            Err(e) => {
                                debug!(addr = %remote, error = %e, "TLS handshake failed");
                            }
                        }
                    } else {
                        let conn = Connection { remote, secure: false };
                        if let Err(e) = serve_connection(stream, conn, handler).await {
                            debug!(addr = %remote, error = %e, "Connection error");
                        }
                    }
                });
            }
            Err(e) if is_transient(&e) => {
                warn!(listener = name, error = %e, "Failed to accept connection, retrying");
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
            }
            Err(e) => break e,
        }
    };

    error!(listener = name, error = %failure, "Listener failed");
    drop(listener);
    release(&slot, id).await;
}

/// Clear the slot only if it still holds listener `id`; a newer listener
/// that replaced it is left alone.
async fn release(slot: &Mutex<Option<Active>>, id: u64) -> bool {
    let mut active = slot.lock().await;
    if active.as_ref().map(|a| a.id) == Some(id) {
        *active = None;
        true
    } else {
        false
    }
}

fn is_transient(e: &std::io::Error) -> bool {
    if matches!(
        e.kind(),
        IoErrorKind::ConnectionAborted
            | IoErrorKind::ConnectionReset
            | IoErrorKind::Interrupted
            | IoErrorKind::WouldBlock
    ) {
        return true;
    }
    #[cfg(unix)]
    if matches!(e.raw_os_error(), Some(libc::EMFILE) | Some(libc::ENFILE)) {
        return true;
    }
    false
}

async fn serve_connection<S>(stream: S, conn: Connection, handler: Handler) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let service = service_fn(move |req: Request<Incoming>| {
        let fut = handler(req, conn);
        async move { Ok::<_, hyper::Error>(fut.await) }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::text_response;
    use hyper::StatusCode;

    fn ok_handler() -> Handler {
        Arc::new(
            |_req: Request<Incoming>, _conn: Connection| -> BoxFuture<'static, Response<ResponseBody>> {
                Box::pin(async { text_response(StatusCode::OK, "ok") })
            },
        )
    }

    #[tokio::test]
    async fn test_start_stop_status() {
        let server = Server::new("test", ok_handler());
        assert_eq!(server.status().await, (false, 0));

        server.start(0, None).await.unwrap();
        let (running, port) = server.status().await;
        assert!(running);
        assert_ne!(port, 0);

        server.stop().await;
        assert!(!server.is_running().await);

        // Stopping again is a no-op.
        server.stop().await;
        assert!(!server.is_running().await);
    }

    #[tokio::test]
    async fn test_start_while_running_fails() {
        let server = Server::new("test", ok_handler());
        server.start(0, None).await.unwrap();
        let before = server.status().await;

        let err = server.start(0, None).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        assert_eq!(server.status().await, before);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_bind_failure_leaves_state_unchanged() {
        let occupied = std::net::TcpListener::bind("0.0.0.0:0").unwrap();
        let port = occupied.local_addr().unwrap().port();

        let server = Server::new("test", ok_handler());
        let err = server.start(port, None).await.unwrap_err();
        assert!(matches!(err, Error::Bind { .. }));
        assert!(!server.is_running().await);
    }

    #[tokio::test]
    async fn test_stop_frees_port_for_restart() {
        let server = Server::new("test", ok_handler());
        server.start(0, None).await.unwrap();
        let (_, port) = server.status().await;

        server.stop().await;
        server.start(port, None).await.unwrap();
        assert_eq!(server.status().await, (true, port));
        server.stop().await;
    }

    #[tokio::test]
    async fn test_restart_recovers_previous_port() {
        let server = Server::new("test", ok_handler());
        server.start(0, None).await.unwrap();
        let (_, original) = server.status().await;

        let occupied = std::net::TcpListener::bind("0.0.0.0:0").unwrap();
        let taken = occupied.local_addr().unwrap().port();

        let err = server.restart(taken, None).await.unwrap_err();
        match err {
            Error::Bind { port, .. } => assert_eq!(port, taken),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(server.status().await, (true, original));
        server.stop().await;
    }

    #[tokio::test]
    async fn test_stale_release_does_not_clobber_newer_listener() {
        let server = Server::new("test", ok_handler());
        server.start(0, None).await.unwrap();
        let stale_id = server.active.lock().await.as_ref().unwrap().id;

        server.stop().await;
        server.start(0, None).await.unwrap();
        let current = server.status().await;

        assert!(!release(&server.active, stale_id).await);
        assert_eq!(server.status().await, current);

        let current_id = server.active.lock().await.as_ref().unwrap().id;
        assert!(release(&server.active, current_id).await);
        assert!(!server.is_running().await);
    }

    #[test]
    fn test_transient_accept_errors() {
        assert!(is_transient(&std::io::Error::from(IoErrorKind::ConnectionAborted)));
        assert!(!is_transient(&std::io::Error::from(IoErrorKind::PermissionDenied)));
    }
}
