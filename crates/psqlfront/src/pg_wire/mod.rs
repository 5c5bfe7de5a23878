//! PostgreSQL wire-protocol proxy connection
//!
//! One [`ProxyConn`] per accepted client. The connection negotiates the
//! startup phase (SSLRequest upgrades to TLS when certificates are
//! configured, GSSEncRequest is declined), forwards the startup message to
//! the upstream verbatim, then runs two passthrough loops. Query and Parse
//! messages are handed to the query handler before being forwarded; every
//! other message crosses the proxy byte-identical.

pub mod codec;
pub mod messages;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{sqlstate, Error, Result};
use crate::pg_wire::codec::{Message, StartupPacket};

/// Invoked for every intercepted Query/Parse before the message is
/// forwarded upstream. Errors other than analyzer failures are reported to
/// the client as an ErrorResponse; the original message is forwarded to the
/// upstream regardless.
#[async_trait]
pub trait QueryHandler: Send + Sync {
    async fn on_query(
        &self,
        remote_addr: &str,
        query: &str,
        is_prepared_stmt: bool,
        notifier: Arc<dyn Notifier>,
    ) -> Result<()>;
}

/// Injects informational messages into the server-to-client stream.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notice(&self, severity: &str, message: &str) -> std::io::Result<()>;
}

struct ClientNotifier<W> {
    writer: Arc<Mutex<W>>,
}

#[async_trait]
impl<W> Notifier for ClientNotifier<W>
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    async fn notice(&self, severity: &str, message: &str) -> std::io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer
            .write_all(&messages::notice_response(severity, message))
            .await?;
        writer.flush().await
    }
}

pub struct ProxyConn {
    client: TcpStream,
    upstream: TcpStream,
    remote_addr: String,
    tls: Option<TlsAcceptor>,
    handler: Option<Arc<dyn QueryHandler>>,
    idle_timeout: Option<Duration>,
}

impl ProxyConn {
    pub fn new(client: TcpStream, upstream: TcpStream) -> Self {
        let remote_addr = client
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "-".to_string());
        Self {
            client,
            upstream,
            remote_addr,
            tls: None,
            handler: None,
            idle_timeout: None,
        }
    }

    pub fn with_tls(mut self, acceptor: Option<TlsAcceptor>) -> Self {
        self.tls = acceptor;
        self
    }

    pub fn with_query_handler(mut self, handler: Arc<dyn QueryHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Zero disables the idle deadline.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    pub async fn run(self, token: CancellationToken) -> Result<()> {
        let ProxyConn {
            mut client,
            upstream,
            remote_addr,
            tls,
            handler,
            idle_timeout,
        } = self;
        debug!(remote = %remote_addr, "start proxy connection");

        let mut startup = codec::read_startup(&mut client).await?;
        loop {
            if startup.is_ssl_request() {
                debug!(remote = %remote_addr, "SSLRequest");
                if let Some(acceptor) = &tls {
                    client.write_all(b"S").await?;
                    client.flush().await?;
                    let mut tls_stream = acceptor.accept(client).await?;
                    debug!(remote = %remote_addr, "tls established");
                    let startup = negotiate(&mut tls_stream).await?;
                    return forward(
                        tls_stream,
                        upstream,
                        startup,
                        remote_addr,
                        handler,
                        idle_timeout,
                        token,
                    )
                    .await;
                }
                debug!(remote = %remote_addr, "can not use ssl");
                client.write_all(b"N").await?;
                client.flush().await?;
                startup = codec::read_startup(&mut client).await?;
                continue;
            }
            if startup.is_gssenc_request() {
                debug!(remote = %remote_addr, "can not use gss enc");
                client.write_all(b"N").await?;
                client.flush().await?;
                startup = codec::read_startup(&mut client).await?;
                continue;
            }
            break;
        }
        forward(
            client,
            upstream,
            startup,
            remote_addr,
            handler,
            idle_timeout,
            token,
        )
        .await
    }
}

/// Startup negotiation after a TLS upgrade: any further SSL/GSS requests
/// are declined.
async fn negotiate<S>(stream: &mut S) -> Result<StartupPacket>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let startup = codec::read_startup(stream).await?;
        if startup.is_ssl_request() || startup.is_gssenc_request() {
            stream.write_all(b"N").await?;
            stream.flush().await?;
            continue;
        }
        return Ok(startup);
    }
}

async fn forward<C>(
    client: C,
    mut upstream: TcpStream,
    startup: StartupPacket,
    remote_addr: String,
    handler: Option<Arc<dyn QueryHandler>>,
    idle_timeout: Option<Duration>,
    token: CancellationToken,
) -> Result<()>
where
    C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    if startup.code().map(|code| code >> 16) == Some(3) {
        let params: Vec<String> = startup
            .parameters()
            .into_iter()
            .map(|(k, v)| format!("{k}:{v}"))
            .collect();
        info!(remote = %remote_addr, "startup {}", params.join(" "));
    }
    debug!(remote = %remote_addr, "send startup message to upstream");
    upstream.write_all(&startup.to_wire()).await?;
    upstream.flush().await?;

    let (mut upstream_rd, mut upstream_wr) = upstream.into_split();
    let (mut client_rd, client_wr) = tokio::io::split(client);
    let client_wr = Arc::new(Mutex::new(client_wr));
    let notifier: Arc<dyn Notifier> = Arc::new(ClientNotifier {
        writer: client_wr.clone(),
    });

    let conn_token = token.child_token();
    let client_side = {
        let conn_token = conn_token.clone();
        let client_wr = client_wr.clone();
        let remote_addr = remote_addr.clone();
        async move {
            let result = client_to_upstream(
                &mut client_rd,
                &mut upstream_wr,
                &client_wr,
                handler,
                notifier,
                idle_timeout,
                &conn_token,
                &remote_addr,
            )
            .await;
            // goodbye to upstream, best effort
            if !matches!(result, Ok(true)) {
                let _ = upstream_wr.write_all(&messages::terminate()).await;
            }
            conn_token.cancel();
            result.map(|_| ())
        }
    };
    let upstream_side = {
        let conn_token = conn_token.clone();
        let remote_addr = remote_addr.clone();
        async move {
            let result =
                upstream_to_client(&mut upstream_rd, &client_wr, &conn_token, &remote_addr).await;
            conn_token.cancel();
            result
        }
    };

    let (client_result, upstream_result) = tokio::join!(client_side, upstream_side);
    debug!(remote = %remote_addr, "end proxy connection");
    client_result.and(upstream_result)
}

async fn read_client_message<R>(reader: &mut R, idle_timeout: Option<Duration>) -> Result<Message>
where
    R: AsyncRead + Unpin,
{
    match idle_timeout {
        Some(timeout) => match tokio::time::timeout(timeout, codec::read_message(reader)).await {
            Ok(result) => result,
            Err(_) => Err(Error::IdleTimeout),
        },
        None => codec::read_message(reader).await,
    }
}

/// Client-to-upstream loop. Returns `Ok(true)` when the client terminated
/// cleanly (the Terminate message has already been forwarded).
#[allow(clippy::too_many_arguments)]
async fn client_to_upstream<R, W>(
    reader: &mut R,
    upstream: &mut OwnedWriteHalf,
    client_wr: &Arc<Mutex<W>>,
    handler: Option<Arc<dyn QueryHandler>>,
    notifier: Arc<dyn Notifier>,
    idle_timeout: Option<Duration>,
    token: &CancellationToken,
    remote_addr: &str,
) -> Result<bool>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Send + Unpin,
{
    loop {
        let message = tokio::select! {
            _ = token.cancelled() => return Ok(false),
            message = read_client_message(reader, idle_timeout) => message,
        };
        let message = match message {
            Ok(message) => message,
            Err(e) if e.is_disconnect() => {
                debug!(remote = %remote_addr, "client disconnected");
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        match message.tag {
            codec::QUERY => {
                if let Some(sql) = message.query_text() {
                    info!(remote = %remote_addr, "receive message from client: incoming SQL: {sql}");
                    dispatch_query(&handler, client_wr, &notifier, remote_addr, &sql, false)
                        .await?;
                }
            }
            codec::PARSE => {
                if let Some((name, sql)) = message.parse_statement() {
                    info!(remote = %remote_addr, "receive message from client: parse SQL: {sql} name={name}");
                    dispatch_query(&handler, client_wr, &notifier, remote_addr, &sql, true).await?;
                }
            }
            codec::TERMINATE => {
                debug!(remote = %remote_addr, "receive message from client: connection terminate");
                upstream.write_all(&message.to_wire()).await?;
                upstream.flush().await?;
                let mut writer = client_wr.lock().await;
                writer.write_all(&messages::close_complete()).await?;
                writer.flush().await?;
                return Ok(true);
            }
            tag => {
                debug!(remote = %remote_addr, "receive message from client: '{}'", tag as char);
            }
        }

        upstream.write_all(&message.to_wire()).await?;
        upstream.flush().await?;
    }
}

async fn dispatch_query<W>(
    handler: &Option<Arc<dyn QueryHandler>>,
    client_wr: &Arc<Mutex<W>>,
    notifier: &Arc<dyn Notifier>,
    remote_addr: &str,
    sql: &str,
    is_prepared_stmt: bool,
) -> Result<()>
where
    W: AsyncWrite + Send + Unpin,
{
    let Some(handler) = handler else {
        return Ok(());
    };
    if let Err(err) = handler
        .on_query(remote_addr, sql, is_prepared_stmt, notifier.clone())
        .await
    {
        if err.is_analyze() {
            // the upstream parses it authoritatively, nothing goes on the wire
            debug!(remote = %remote_addr, error = %err, "analyze SQL failed");
        } else {
            warn!(remote = %remote_addr, error = %err, "on query received");
            let mut writer = client_wr.lock().await;
            writer
                .write_all(&messages::error_response(sqlstate::IO_ERROR, &err.to_string()))
                .await?;
            writer.flush().await?;
        }
    }
    Ok(())
}

async fn upstream_to_client<W>(
    upstream: &mut OwnedReadHalf,
    client_wr: &Arc<Mutex<W>>,
    token: &CancellationToken,
    remote_addr: &str,
) -> Result<()>
where
    W: AsyncWrite + Send + Unpin,
{
    loop {
        let message = tokio::select! {
            _ = token.cancelled() => return Ok(()),
            message = codec::read_message(upstream) => message,
        };
        let message = match message {
            Ok(message) => message,
            Err(e) if e.is_disconnect() => {
                debug!(remote = %remote_addr, "upstream disconnected");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let close_complete = message.tag == codec::CLOSE_COMPLETE;
        {
            let mut writer = client_wr.lock().await;
            writer.write_all(&message.to_wire()).await?;
            writer.flush().await?;
        }
        if close_complete {
            debug!(remote = %remote_addr, "receive close complete from upstream");
            return Ok(());
        }
    }
}
