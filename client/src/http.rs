//! Backend speaking to `quarry-server`: REST for reads and writes, a
//! WebSocket for the change stream.

use crate::backend::{Backend, ChangeStream};
use crate::config::ServerConfig;
use crate::reconnect::Heartbeat;
use async_trait::async_trait;
use futures::{Sink, SinkExt, Stream, StreamExt};
use quarry_engine::error::Result;
use quarry_engine::{
    Change, ClientMessage, Committed, Error, ErrorKind, Fields, QueryDescriptor, Row, RowId,
    ServerMessage, Snapshot,
};
use reqwest::{RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, trace, warn};

/// Error body returned by the server.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
    #[serde(default)]
    kind: Option<ErrorKind>,
    #[serde(default)]
    detail: Option<Error>,
}

/// [`Backend`] over HTTP and WebSocket.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    base: Url,
    token: Option<String>,
    heartbeat: Heartbeat,
}

impl HttpBackend {
    /// Connect to the server at `url`, e.g. `http://localhost:3000`.
    pub fn new(url: &str) -> Result<Self> {
        let base = Url::parse(url).map_err(|e| Error::Network(format!("invalid url {url}: {e}")))?;
        if base.cannot_be_a_base() {
            return Err(Error::Network(format!("invalid url {url}")));
        }
        Ok(Self {
            client: reqwest::Client::new(),
            base,
            token: None,
            heartbeat: Heartbeat::default(),
        })
    }

    pub fn from_config(config: &ServerConfig) -> Result<Self> {
        let backend = Self::new(&config.url)?;
        Ok(match &config.token {
            Some(token) => backend.with_token(token.clone()),
            None => backend,
        })
    }

    /// Send `Authorization: Bearer <token>` with every request.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Ping an idle change stream and drop it when the server stops answering.
    pub fn with_heartbeat(mut self, heartbeat: Heartbeat) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| Error::Network(format!("invalid base url {}", self.base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn rows_url(&self, table: &str) -> Result<Url> {
        self.url(&["tables", table, "rows"])
    }

    fn row_url(&self, table: &str, id: &str) -> Result<Url> {
        self.url(&["tables", table, "rows", id])
    }

    fn ws_url(&self) -> Result<Url> {
        let mut url = self.url(&["ws"])?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| Error::Network(format!("cannot derive websocket url from {}", self.base)))?;
        Ok(url)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;

        if response.status().is_success() {
            return response
                .json::<T>()
                .await
                .map_err(|e| Error::Network(format!("invalid response body: {e}")));
        }
        Err(error_from_response(response).await)
    }
}

/// Rebuild the typed error from a failed response.
async fn error_from_response(response: Response) -> Error {
    let status = response.status();
    let body = match response.json::<ErrorBody>().await {
        Ok(body) => body,
        Err(_) => return Error::from_kind(kind_for_status(status), format!("HTTP {status}")),
    };
    if let Some(detail) = body.detail {
        return detail;
    }
    let kind = body.kind.unwrap_or_else(|| kind_for_status(status));
    Error::from_kind(kind, body.error)
}

fn kind_for_status(status: StatusCode) -> ErrorKind {
    match status {
        StatusCode::NOT_FOUND => ErrorKind::NotFound,
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY | StatusCode::CONFLICT => {
            ErrorKind::Validation
        }
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ErrorKind::Auth,
        _ => ErrorKind::Network,
    }
}

/// Classify a failed WebSocket handshake; a rejected upgrade keeps its HTTP
/// status so auth failures are not retried.
fn upgrade_error(err: tokio_tungstenite::tungstenite::Error) -> Error {
    match err {
        tokio_tungstenite::tungstenite::Error::Http(response) => {
            let status = StatusCode::from_u16(response.status().as_u16())
                .unwrap_or(StatusCode::BAD_GATEWAY);
            Error::from_kind(
                kind_for_status(status),
                format!("websocket upgrade rejected: HTTP {status}"),
            )
        }
        other => Error::Network(other.to_string()),
    }
}

/// Turn one server message into a stream item, if it is one.
fn stream_item(message: ServerMessage) -> Option<Result<Change>> {
    match message {
        ServerMessage::Change { seq, event, .. } => Some(Ok(Change::new(seq, event))),
        ServerMessage::Error { message, kind, .. } => Some(Err(Error::from_kind(
            kind.unwrap_or(ErrorKind::SubscriptionLost),
            message,
        ))),
        ServerMessage::Subscribed { .. } | ServerMessage::Pong => None,
    }
}

/// Follow an acknowledged socket as a [`ChangeStream`].
///
/// A ping goes out after `heartbeat.interval` of silence. Any frame counts as
/// an answer; none within `heartbeat.timeout` ends the stream with
/// [`Error::SubscriptionLost`].
fn change_stream<S>(socket: S, heartbeat: Heartbeat) -> ChangeStream
where
    S: Stream<Item = std::result::Result<Message, WsError>>
        + Sink<Message, Error = WsError>
        + Unpin
        + Send
        + 'static,
{
    let lost = |reason: String| Some((Err(Error::SubscriptionLost(reason)), None));

    futures::stream::unfold(Some(socket), move |socket| async move {
        let mut socket = socket?;
        let mut awaiting_pong = false;
        loop {
            let wait = if awaiting_pong { heartbeat.timeout } else { heartbeat.interval };
            let next = match tokio::time::timeout(wait, socket.next()).await {
                Ok(next) => next,
                Err(_) if awaiting_pong => {
                    warn!(timeout = ?heartbeat.timeout, "change stream missed its heartbeat");
                    return lost("no reply to heartbeat ping".into());
                }
                Err(_) => {
                    let ping = match serde_json::to_string(&ClientMessage::Ping) {
                        Ok(ping) => ping,
                        Err(e) => return lost(e.to_string()),
                    };
                    let sent = socket.send(Message::Text(ping.into()));
                    match tokio::time::timeout(heartbeat.timeout, sent).await {
                        Ok(Ok(())) => {
                            trace!("sent heartbeat ping");
                            awaiting_pong = true;
                            continue;
                        }
                        Ok(Err(e)) => return lost(e.to_string()),
                        Err(_) => return lost("heartbeat ping could not be sent".into()),
                    }
                }
            };
            awaiting_pong = false;
            match next {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<ServerMessage>(&text) {
                    Ok(message) => match stream_item(message) {
                        Some(Ok(change)) => return Some((Ok(change), Some(socket))),
                        Some(Err(err)) => return Some((Err(err), None)),
                        None => continue,
                    },
                    Err(e) => warn!(error = %e, "unparseable server message"),
                },
                Some(Ok(Message::Close(_))) | None => {
                    return lost("server closed the change stream".into())
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return lost(e.to_string()),
            }
        }
    })
    .boxed()
}

#[async_trait]
impl Backend for HttpBackend {
    async fn query(&self, table: &str, query: &QueryDescriptor) -> Result<Snapshot> {
        let request = self.client.get(self.rows_url(table)?).query(&query.to_params());
        self.send(request).await
    }

    async fn subscribe(&self, table: &str, query: &QueryDescriptor) -> Result<ChangeStream> {
        let mut request = self
            .ws_url()?
            .as_str()
            .into_client_request()
            .map_err(|e| Error::Network(e.to_string()))?;
        if let Some(token) = &self.token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| Error::Auth(e.to_string()))?;
            request.headers_mut().insert("Authorization", value);
        }

        let (mut socket, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(upgrade_error)?;

        let request_id = uuid::Uuid::new_v4().to_string();
        let subscribe = ClientMessage::Subscribe {
            table: table.to_string(),
            query: query.clone(),
            request_id: Some(request_id.clone()),
        };
        let text = serde_json::to_string(&subscribe).map_err(|e| Error::InvalidPayload(e.to_string()))?;
        socket
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| Error::Network(e.to_string()))?;

        // Changes are only guaranteed once the server acknowledges.
        loop {
            let next = tokio::time::timeout(self.heartbeat.timeout, socket.next())
                .await
                .map_err(|_| Error::Network("no subscribe acknowledgement from server".into()))?;
            let message = match next {
                Some(Ok(Message::Text(text))) => text,
                Some(Ok(Message::Close(_))) | None => {
                    return Err(Error::Network("connection closed before subscribe".into()))
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(Error::Network(e.to_string())),
            };
            match serde_json::from_str::<ServerMessage>(&message) {
                Ok(ServerMessage::Subscribed {
                    subscription_id, ..
                }) => {
                    debug!(table, %subscription_id, "subscribed to change stream");
                    break;
                }
                Ok(ServerMessage::Error {
                    message,
                    kind,
                    request_id: Some(id),
                }) if id == request_id => {
                    return Err(Error::from_kind(kind.unwrap_or(ErrorKind::Network), message));
                }
                Ok(other) => trace!(?other, "ignoring message before subscribe ack"),
                Err(e) => warn!(error = %e, "unparseable server message"),
            }
        }

        Ok(change_stream(socket, self.heartbeat))
    }

    async fn insert(&self, table: &str, fields: Fields) -> Result<Committed<Row>> {
        let request = self.client.post(self.rows_url(table)?).json(&fields);
        self.send(request).await
    }

    async fn update(&self, table: &str, id: &str, fields: Fields) -> Result<Committed<Row>> {
        let request = self.client.patch(self.row_url(table, id)?).json(&fields);
        self.send(request).await
    }

    async fn delete(&self, table: &str, id: &str) -> Result<Committed<RowId>> {
        let request = self.client.delete(self.row_url(table, id)?);
        self.send(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_engine::ChangeEvent;
    use std::time::Duration;

    #[test]
    fn urls() {
        let backend = HttpBackend::new("http://localhost:3000").unwrap();
        assert_eq!(
            backend.rows_url("fuel_logs").unwrap().as_str(),
            "http://localhost:3000/tables/fuel_logs/rows"
        );
        assert_eq!(
            backend.row_url("sales", "a b").unwrap().as_str(),
            "http://localhost:3000/tables/sales/rows/a%20b"
        );
        assert_eq!(backend.ws_url().unwrap().as_str(), "ws://localhost:3000/ws");

        let backend = HttpBackend::new("https://quarry.example.com/api/").unwrap();
        assert_eq!(
            backend.ws_url().unwrap().as_str(),
            "wss://quarry.example.com/api/ws"
        );
    }

    #[test]
    fn invalid_url_is_rejected() {
        assert!(HttpBackend::new("not a url").is_err());
    }

    #[test]
    fn status_kinds() {
        assert_eq!(kind_for_status(StatusCode::NOT_FOUND), ErrorKind::NotFound);
        assert_eq!(kind_for_status(StatusCode::UNPROCESSABLE_ENTITY), ErrorKind::Validation);
        assert_eq!(kind_for_status(StatusCode::UNAUTHORIZED), ErrorKind::Auth);
        assert_eq!(kind_for_status(StatusCode::BAD_GATEWAY), ErrorKind::Network);
    }

    #[test]
    fn rejected_upgrade_keeps_status() {
        use tokio_tungstenite::tungstenite::http::Response;

        let response = Response::builder().status(401).body(None).unwrap();
        let err = upgrade_error(tokio_tungstenite::tungstenite::Error::Http(response));
        assert_eq!(err.kind(), ErrorKind::Auth);

        let err = upgrade_error(tokio_tungstenite::tungstenite::Error::ConnectionClosed);
        assert_eq!(err.kind(), ErrorKind::Network);
    }

    #[test]
    fn error_body_detail_wins() {
        let body: ErrorBody = serde_json::from_str(
            r#"{"error": "NotFoundError: row r1 does not exist", "kind": "not_found",
                "detail": {"code": "row_not_found", "detail": "r1"}}"#,
        )
        .unwrap();
        assert_eq!(body.detail, Some(Error::RowNotFound("r1".into())));
        assert_eq!(body.kind, Some(ErrorKind::NotFound));
        assert!(body.error.starts_with("NotFoundError"));
    }

    #[test]
    fn server_messages_to_stream_items() {
        let change = stream_item(ServerMessage::change("s", 3, ChangeEvent::Deleted("r1".into())));
        assert_eq!(
            change.unwrap().unwrap(),
            Change::new(3, ChangeEvent::Deleted("r1".into()))
        );

        let err = stream_item(ServerMessage::error("gone", None)).unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SubscriptionLost);

        assert!(stream_item(ServerMessage::Pong).is_none());
    }

    /// Accept one WebSocket on a local port, acknowledge its subscribe, then
    /// hand every later client frame to `reply`. Frames `reply` returns are
    /// sent back; received text is forwarded to the returned channel.
    async fn serve_once(
        mut reply: impl FnMut(ClientMessage) -> Vec<ServerMessage> + Send + 'static,
    ) -> (HttpBackend, tokio::sync::mpsc::UnboundedReceiver<ClientMessage>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let (seen, received) = tokio::sync::mpsc::unbounded_channel();

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut socket = tokio_tungstenite::accept_async(tcp).await.unwrap();
            while let Some(Ok(frame)) = socket.next().await {
                let Message::Text(text) = frame else { continue };
                let message: ClientMessage = serde_json::from_str(&text).unwrap();
                let answers = match &message {
                    ClientMessage::Subscribe { request_id, .. } => vec![ServerMessage::Subscribed {
                        subscription_id: "sub-1".into(),
                        request_id: request_id.clone(),
                    }],
                    other => reply(other.clone()),
                };
                let _ = seen.send(message);
                for answer in answers {
                    let text = serde_json::to_string(&answer).unwrap();
                    socket.send(Message::Text(text.into())).await.unwrap();
                }
            }
        });

        (HttpBackend::new(&url).unwrap(), received)
    }

    fn quick_heartbeat() -> Heartbeat {
        Heartbeat {
            interval: Duration::from_millis(20),
            timeout: Duration::from_millis(40),
        }
    }

    #[tokio::test]
    async fn silent_server_is_reported_lost() {
        let (backend, mut received) = serve_once(|_| Vec::new()).await;
        let backend = backend.with_heartbeat(quick_heartbeat());

        let mut stream = backend
            .subscribe("shipments", &QueryDescriptor::all())
            .await
            .unwrap();
        let item = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .expect("silent stream was never reported")
            .unwrap();
        assert_eq!(item.unwrap_err().kind(), ErrorKind::SubscriptionLost);
        assert!(stream.next().await.is_none());

        assert!(matches!(received.recv().await, Some(ClientMessage::Subscribe { .. })));
        assert_eq!(received.recv().await, Some(ClientMessage::Ping));
    }

    #[tokio::test]
    async fn answered_pings_keep_the_stream_open() {
        let mut pings = 0;
        let (backend, _received) = serve_once(move |message| {
            assert_eq!(message, ClientMessage::Ping);
            pings += 1;
            let mut answers = vec![ServerMessage::Pong];
            if pings == 3 {
                answers.push(ServerMessage::change("sub-1", 7, ChangeEvent::Deleted("r1".into())));
            }
            answers
        })
        .await;
        let backend = backend.with_heartbeat(quick_heartbeat());

        let mut stream = backend
            .subscribe("shipments", &QueryDescriptor::all())
            .await
            .unwrap();
        let item = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .expect("no change after answered pings")
            .unwrap();
        assert_eq!(item.unwrap(), Change::new(7, ChangeEvent::Deleted("r1".into())));
    }
}
