//! Remote log forwarding over a WebSocket.
//!
//! The source convention describes a socket whose `readyState === 1` means
//! "ready to receive log frames" — that is exactly the WebSocket `OPEN`
//! ready-state, so `tokio-tungstenite` is used verbatim rather than rolling
//! a bespoke framed-socket protocol.

use chrono::Utc;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::entry::{LogEntry, WireMessage};
use crate::error::LoggerError;
use crate::logger::{LoggerGroup, RemoteEnv};

/// Default timeout for [`connect`]'s socket-open race (spec.md §4.3/§5:
/// "the remote logger connect has a 1000 ms default").
const DEFAULT_CONNECT_TIMEOUT: std::time::Duration = std::time::Duration::from_millis(1000);

/// Connect to a remote log sink at `url` and forward every entry the group
/// produces (plus a one-time backlog replay) until the connection drops or
/// the returned task is aborted.
///
/// Races the socket open against a 1000 ms timeout (spec.md §4.3's
/// `remote(createSocket, timeoutMs=1000)`); on either a connect error or a
/// timeout it logs two debug lines and falls back silently rather than
/// failing the caller — remote logging is best-effort.
///
/// Mirrors the teacher's pattern of a detached `tokio::spawn`ed forwarder
/// fed by a channel (`client-engine::worker::run_worker_task`'s submission
/// loop), here fed by [`LoggerGroup::subscribe`] instead of a work queue.
pub async fn connect(group: LoggerGroup, url: &str) -> Option<tokio::task::JoinHandle<()>> {
    let logger = group.logger("percy:logger");
    match tokio::time::timeout(DEFAULT_CONNECT_TIMEOUT, tokio_tungstenite::connect_async(url)).await {
        Ok(Ok((stream, _response))) => Some(spawn_forwarder(group, stream, true)),
        Ok(Err(err)) => {
            logger.debug(format!("remote logger connect to {url} failed"));
            logger.debug(format!("{err}"));
            None
        }
        Err(_elapsed) => {
            logger.debug(format!("remote logger connect to {url} timed out"));
            logger.debug(format!("timed out after {}ms", DEFAULT_CONNECT_TIMEOUT.as_millis()));
            None
        }
    }
}

/// Drive one forwarding connection: env handshake, one-time backlog replay,
/// every new entry as it's produced, *and* a concurrent read loop over
/// whatever the peer sends back (spec.md §4.3/§6). `is_remote_client` is set
/// only for [`connect`] (spec.md's `remote()`, the client side) — while it
/// holds, the group's local stdio goes silent and every entry forwards
/// regardless of `shouldLog` (spec.md L3), and incoming messages are treated
/// as `{env}` updates. [`serve`]'s accepted connections don't set it: a
/// process exposing its log to a collector keeps logging locally too, and
/// treats incoming messages as `{log}`/`{logAll}` frames to merge into its
/// own store.
fn spawn_forwarder<S>(
    group: LoggerGroup,
    stream: WebSocketStream<S>,
    is_remote_client: bool,
) -> tokio::task::JoinHandle<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        if is_remote_client {
            group.set_remote(true);
        }

        let (mut write, mut read) = stream.split();
        let result = drive(&group, &mut write, &mut read, is_remote_client).await;
        let _ = result;

        if is_remote_client {
            group.set_remote(false);
        }
    })
}

async fn drive<S>(
    group: &LoggerGroup,
    write: &mut SplitSink<WebSocketStream<S>, Message>,
    read: &mut SplitStream<WebSocketStream<S>>,
    is_remote_client: bool,
) -> Result<(), LoggerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Asymmetric handshake per spec.md §6: the server side (`serve`'s
    // accepted connections) sends only `{env}`; the client side (`connect`)
    // sends only `{logAll}` — its entire backlog, once, as the very first
    // message (spec.md §8 Scenario 6).
    if is_remote_client {
        let backlog = WireMessage::LogAll {
            entries: group.history().iter().map(LogEntry::marked_remote).collect(),
        };
        send(write, &backlog).await?;
    } else {
        let env = WireMessage::Env {
            percy_debug: std::env::var("PERCY_DEBUG").ok(),
            percy_loglevel: std::env::var("PERCY_LOGLEVEL").ok(),
        };
        send(write, &env).await?;
    }

    let mut entries = group.subscribe();
    loop {
        tokio::select! {
            biased;
            incoming = read.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if let Ok(message) = serde_json::from_str::<WireMessage>(&text) {
                            merge_incoming(group, is_remote_client, message);
                        }
                    }
                    Some(Ok(_non_text)) => {}
                    Some(Err(_)) => break,
                    None => break,
                }
            }
            entry = entries.recv() => {
                match entry {
                    Ok(entry) => send(write, &WireMessage::log(&entry)).await?,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
    Ok(())
}

/// Apply one decoded incoming message to `group`, per spec.md §4.3/§6:
/// - the merging/server side (`is_remote_client = false`) folds `{log}` and
///   `{logAll}` frames into its own in-memory store;
/// - either side folds an `{env}` update into the tracked remote env view.
fn merge_incoming(group: &LoggerGroup, is_remote_client: bool, message: WireMessage) {
    match message {
        WireMessage::Log { debug, level, message, meta } if !is_remote_client => {
            group.merge_remote_entry(LogEntry {
                timestamp: Utc::now(),
                namespace: debug,
                level,
                message,
                meta,
            });
        }
        WireMessage::LogAll { entries } if !is_remote_client => {
            group.merge_remote_entries(entries);
        }
        WireMessage::Env { percy_debug, percy_loglevel } => {
            group.merge_env(RemoteEnv { percy_debug, percy_loglevel });
        }
        // A `{log}`/`{logAll}` arriving on the client side isn't part of the
        // protocol (spec.md: the client side only receives `{env}` updates
        // after its initial flush); ignore rather than panic on a
        // misbehaving peer.
        _ => {}
    }
}

async fn send<S>(
    write: &mut SplitSink<WebSocketStream<S>, Message>,
    message: &WireMessage,
) -> Result<(), LoggerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let text = serde_json::to_string(message)?;
    write.send(Message::Text(text.into())).await?;
    Ok(())
}

/// Accept remote log sinks on `addr`, forwarding this group's log stream to
/// every connection that dials in. Returns the address actually bound (so
/// callers can pass `:0` and discover the chosen port) and a handle to the
/// accept loop; each accepted connection is handled on its own spawned task.
pub async fn serve(
    group: LoggerGroup,
    addr: &str,
) -> Result<(std::net::SocketAddr, tokio::task::JoinHandle<()>), LoggerError> {
    let listener = TcpListener::bind(addr).await?;
    let bound = listener.local_addr()?;
    let handle = tokio::spawn(async move {
        loop {
            let Ok((socket, _peer)) = listener.accept().await else {
                break;
            };
            let Ok(stream) = tokio_tungstenite::accept_async(socket).await else {
                continue;
            };
            spawn_forwarder(group.clone(), stream, false);
        }
    });
    Ok((bound, handle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{LogLevel, NamespaceFilter};

    #[tokio::test]
    async fn serve_binds_and_accepts_a_connection() {
        let group = LoggerGroup::with_filter(NamespaceFilter::all(), LogLevel::Debug);

        let (addr, server) = serve(group.clone(), "127.0.0.1:0").await.unwrap();
        let client = connect(group, &format!("ws://{addr}")).await;
        assert!(client.is_some());
        server.abort();
    }

    #[tokio::test]
    async fn connect_falls_back_silently_when_nothing_is_listening() {
        // spec.md §4.3: on failure, remote() logs two debug lines and falls
        // back silently rather than erroring the caller.
        let group = LoggerGroup::with_filter(NamespaceFilter::all(), LogLevel::Debug);
        let client = connect(group, "ws://127.0.0.1:1").await;
        assert!(client.is_none());
    }

    #[tokio::test]
    async fn connecting_as_a_client_forwards_even_filtered_out_namespaces() {
        // spec.md L3: once remote() succeeds, every subsequent log() call
        // forwards over the socket, bypassing shouldLog entirely.
        let group = LoggerGroup::with_filter(NamespaceFilter::none(), LogLevel::Info);
        let logger = group.logger("percy:core");
        assert!(!logger.should_log(LogLevel::Debug));

        let (addr, server) = serve(LoggerGroup::with_filter(NamespaceFilter::all(), LogLevel::Debug), &"127.0.0.1:0".to_string()).await.unwrap();
        let client = connect(group.clone(), &format!("ws://{addr}")).await.unwrap();

        // Give the forwarder a moment to complete its handshake.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let mut rx = group.subscribe();
        logger.debug("would normally be silenced");
        let forwarded = rx.recv().await.unwrap();
        assert_eq!(forwarded.message, "would normally be silenced");

        client.abort();
        server.abort();
    }

    #[tokio::test]
    async fn server_side_merges_forwarded_entries_into_its_own_store() {
        // spec.md §4.3: the merging/server side treats incoming {log}
        // frames as entries to fold into its local store.
        let server_group = LoggerGroup::with_filter(NamespaceFilter::all(), LogLevel::Debug);
        let (addr, server) = serve(server_group.clone(), "127.0.0.1:0").await.unwrap();

        let client_group = LoggerGroup::with_filter(NamespaceFilter::all(), LogLevel::Debug);
        let client_logger = client_group.logger("percy:worker");
        let client = connect(client_group.clone(), &format!("ws://{addr}")).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        client_logger.info("discovered 3 resources");
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let merged = server_group
            .history()
            .into_iter()
            .find(|entry| entry.message == "discovered 3 resources")
            .expect("forwarded entry should have been merged into the server's store");
        assert_eq!(merged.meta.get("remote").and_then(|v| v.as_bool()), Some(true));

        client.abort();
        server.abort();
    }

    #[tokio::test]
    async fn client_side_tracks_env_updates_from_the_peer() {
        let server_group = LoggerGroup::with_filter(NamespaceFilter::all(), LogLevel::Debug);
        let (addr, server) = serve(server_group, "127.0.0.1:0").await.unwrap();

        let client_group = LoggerGroup::with_filter(NamespaceFilter::all(), LogLevel::Debug);
        let client = connect(client_group.clone(), &format!("ws://{addr}")).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let env = client_group.remote_env().expect("client should have received the server's env handshake");
        assert_eq!(env.percy_debug, std::env::var("PERCY_DEBUG").ok());

        client.abort();
        server.abort();
    }
}
