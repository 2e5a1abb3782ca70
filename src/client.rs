use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::channel::mpsc;
use futures::channel::oneshot;
use futures::future::FutureExt;
use futures::ready;
use futures::select;
use futures::sink::SinkExt;
use futures::stream::{Fuse, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::{Error, Result};

macro_rules! recv {
    ($len:expr, $content:expr) => {
        log::trace!(target: "cdp_harness::protocol", "<< [{} bytes] {}", $len, $content);
    }
}

macro_rules! send {
    ($len:expr, $content:expr) => {
        log::trace!(target: "cdp_harness::protocol", ">> [{} bytes] {}", $len, $content);
    }
}

/// Opaque identifier of an attached session (tab).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub(crate) fn new<S: Into<String>>(v: S) -> Self {
        Self(v.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug)]
struct Channel(Fuse<WebSocketStream<MaybeTlsStream<TcpStream>>>);

impl Stream for Channel {
    type Item = Result<Value>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            match ready!(self.0.poll_next_unpin(cx)?) {
                Some(Message::Text(m)) => {
                    recv!(m.len(), m);
                    return Poll::Ready(Some(Ok(serde_json::from_str(&m)?)));
                }
                Some(Message::Binary(m)) => {
                    recv!(m.len(), String::from_utf8_lossy(&m));
                    return Poll::Ready(Some(Ok(serde_json::from_slice(&m)?)));
                }
                Some(..) => {}
                None => return Poll::Ready(None),
            }
        }
    }
}

impl Channel {
    async fn send(&mut self, item: Value) -> Result<()> {
        let item = serde_json::to_string(&item)?;
        send!(item.len(), &item);
        self.0.send(Message::Text(item)).await?;
        Ok(())
    }
}

/// Chrome DevTools Protocol event notification.
#[derive(Debug, Clone)]
pub struct Event {
    /// Event name, e.g. `Page.loadEventFired`.
    pub method: String,
    /// Event payload.
    pub params: Value,
}

/// Stream for Chrome DevTools Protocol Event.
#[derive(Debug)]
pub struct CdpEvents {
    rx: mpsc::UnboundedReceiver<Event>,
}

impl Stream for CdpEvents {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_next_unpin(cx)
    }
}

#[derive(Debug)]
pub(crate) enum Control {
    Subscribe(Option<SessionId>, mpsc::UnboundedSender<Event>),
    Request(
        u32,
        Value,
        oneshot::Sender<std::result::Result<Value, Value>>,
    ),
}

async fn r#loop(mut control_rx: mpsc::UnboundedReceiver<Control>, mut channel: Channel) -> Result<()> {
    let mut waiters = HashMap::<u32, oneshot::Sender<std::result::Result<Value, Value>>>::new();
    let mut events = HashMap::<Option<SessionId>, Vec<mpsc::UnboundedSender<Event>>>::new();

    loop {
        select! {
            ctrl = control_rx.next() => {
                match ctrl {
                    Some(Control::Subscribe(session_id, tx)) => {
                        events.entry(session_id).or_insert_with(Default::default).push(tx);
                    }
                    Some(Control::Request(id, request, result)) => {
                        channel.send(request).await?;
                        waiters.insert(id, result);
                    }
                    None => break,
                }
            },

            msg = channel.next().fuse() => {
                match msg {
                    Some(Ok(msg)) => dispatch(msg, &mut waiters, &mut events),
                    Some(Err(err)) => {
                        log::warn!("control channel error: {}", err);
                        return Err(err);
                    }
                    None => break,
                }
            }
        }
    }

    Ok(())
}

fn dispatch(
    msg: Value,
    waiters: &mut HashMap<u32, oneshot::Sender<std::result::Result<Value, Value>>>,
    events: &mut HashMap<Option<SessionId>, Vec<mpsc::UnboundedSender<Event>>>,
) {
    if let Some(id) = msg.get("id").and_then(Value::as_u64) {
        if let Some(tx) = waiters.remove(&(id as u32)) {
            let result = match msg.get("error") {
                Some(err) => Err(err.clone()),
                None => Ok(msg.get("result").cloned().unwrap_or(Value::Null)),
            };
            tx.send(result).ok();
        }
        return;
    }

    if let Some(method) = msg.get("method").and_then(Value::as_str) {
        let session_id = msg
            .get("sessionId")
            .and_then(Value::as_str)
            .map(SessionId::new);
        let event = Event {
            method: method.to_string(),
            params: msg.get("params").cloned().unwrap_or(Value::Null),
        };
        for tx in &mut *events.entry(session_id).or_default() {
            tx.unbounded_send(event.clone()).ok();
        }
    }
}

/// Message loop.
pub struct Loop {
    future: Pin<Box<dyn Future<Output = Result<()>> + Send + 'static>>,
}

impl Future for Loop {
    type Output = Result<()>;
    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.future.poll_unpin(cx)
    }
}

/// Chrome DevTools Protocol Client.
///
/// Cloneable handle; every clone issues commands over the same control
/// channel. Commands target the browser endpoint unless a session id is
/// given.
#[derive(Debug, Clone)]
pub struct CdpClient {
    idgen: Arc<AtomicU32>,
    control_tx: mpsc::UnboundedSender<Control>,
}

impl CdpClient {
    fn new(control_tx: mpsc::UnboundedSender<Control>) -> Self {
        Self {
            idgen: Arc::new(AtomicU32::default()),
            control_tx,
        }
    }

    /// Connect with CDP Websocket.
    pub async fn connect(url: &Url) -> Result<(Self, Loop)> {
        let (ws, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
        let channel = Channel(ws.fuse());
        let (control_tx, control_rx) = mpsc::unbounded();
        let task = Loop {
            future: Box::pin(r#loop(control_rx, channel)),
        };
        Ok((Self::new(control_tx), task))
    }

    /// Request for Chrome DevTools Protocol Command.
    ///
    /// Resolves with the `result` member of the response, or
    /// [`Error::Response`] when the browser reports a command error.
    pub async fn request(
        &self,
        session_id: Option<&SessionId>,
        method: &str,
        params: Value,
    ) -> Result<Value> {
        let id = self.idgen.fetch_add(1, Ordering::SeqCst);
        let mut request = json!({
            "id": id,
            "method": method,
            "params": params,
        });
        if let Some(session_id) = session_id {
            request["sessionId"] = json!(session_id);
        }

        let (tx, rx) = oneshot::channel();
        self.control_tx
            .unbounded_send(Control::Request(id, request, tx))?;
        match rx.await? {
            Ok(v) => Ok(v),
            Err(err) => Err(Error::Response(err)),
        }
    }

    /// Subscribe Chrome DevTools Protocol Event.
    pub fn events(&self, session_id: Option<&SessionId>) -> Result<CdpEvents> {
        let (tx, rx) = mpsc::unbounded();
        self.control_tx
            .unbounded_send(Control::Subscribe(session_id.cloned(), tx))?;
        Ok(CdpEvents { rx })
    }

    /// Client whose control channel is already gone. Every command fails
    /// with [`Error::LoopAborted`].
    #[cfg(test)]
    pub(crate) fn dangling() -> Self {
        let (control_tx, _) = mpsc::unbounded();
        Self::new(control_tx)
    }

    /// Client plus the loop end of its control channel, so a test can
    /// answer commands in place of a browser.
    #[cfg(test)]
    pub(crate) fn pair() -> (Self, mpsc::UnboundedReceiver<Control>) {
        let (control_tx, control_rx) = mpsc::unbounded();
        (Self::new(control_tx), control_rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_routes_response_to_waiter() {
        let mut waiters = HashMap::new();
        let mut events = HashMap::new();
        let (tx, mut rx) = oneshot::channel();
        waiters.insert(7u32, tx);

        dispatch(
            json!({"id": 7, "result": {"ok": true}}),
            &mut waiters,
            &mut events,
        );
        assert_eq!(rx.try_recv().unwrap(), Some(Ok(json!({"ok": true}))));
        assert!(waiters.is_empty());
    }

    #[test]
    fn dispatch_routes_error_response() {
        let mut waiters = HashMap::new();
        let mut events = HashMap::new();
        let (tx, mut rx) = oneshot::channel();
        waiters.insert(1u32, tx);

        dispatch(
            json!({"id": 1, "error": {"code": -32000, "message": "nope"}}),
            &mut waiters,
            &mut events,
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            Some(Err(json!({"code": -32000, "message": "nope"})))
        );
    }

    #[test]
    fn dispatch_routes_event_by_session() {
        let mut waiters = HashMap::new();
        let mut events = HashMap::new();
        let (tx, mut rx) = mpsc::unbounded();
        events.insert(Some(SessionId::new("S1")), vec![tx]);

        dispatch(
            json!({"method": "Page.loadEventFired", "params": {"timestamp": 1.0}, "sessionId": "S1"}),
            &mut waiters,
            &mut events,
        );
        let evt = rx.try_next().unwrap().unwrap();
        assert_eq!(evt.method, "Page.loadEventFired");
    }

    #[tokio::test]
    async fn request_on_dangling_client_is_loop_aborted() {
        let client = CdpClient::dangling();
        let err = client
            .request(None, "Browser.getVersion", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LoopAborted(..)));
    }
}
