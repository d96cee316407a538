//! Registry of open WebSocket channels and their listeners.
//!
//! One coarse lock guards both the sockets (keyed by URI) and the listener
//! list. Listener callbacks and frame writes always run on a snapshot taken
//! under the lock, after it has been released, so a listener may publish from
//! inside `received` without deadlocking.

use crate::ids::ConnectionId;
use crate::websocket::Frame;
use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// Observer of WebSocket activity on every URI.
pub trait WebSocketListener: Send + Sync {
    fn opened(&self, uri: &str, client: ConnectionId);
    fn closed(&self, uri: &str, client: ConnectionId);
    /// A complete text or binary message arrived from `client`.
    fn received(&self, uri: &str, client: ConnectionId, content: &[u8]);
}

/// Write half of an upgraded connection.
pub trait FrameSink: Send + Sync {
    fn send_frame(&self, frame: &Frame) -> io::Result<()>;
}

#[derive(Clone)]
struct Channel {
    client: ConnectionId,
    sink: Arc<dyn FrameSink>,
}

#[derive(Default)]
struct Registry {
    sockets: HashMap<String, Vec<Channel>>,
    listeners: Vec<Arc<dyn WebSocketListener>>,
}

#[derive(Default)]
pub struct Channels {
    inner: Mutex<Registry>,
}

impl Channels {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `client` under `uri` and fire `opened`.
    ///
    /// A client already registered under `uri` is replaced, never duplicated.
    pub fn add_web_socket(&self, uri: &str, client: ConnectionId, sink: Arc<dyn FrameSink>) {
        let listeners = {
            let mut reg = self.lock();
            let entry = reg.sockets.entry(uri.to_string()).or_default();
            entry.retain(|c| c.client != client);
            entry.push(Channel { client, sink });
            reg.listeners.clone()
        };
        info!(uri = %uri, client = %client, "WebSocket opened");
        for l in listeners {
            l.opened(uri, client);
        }
    }

    /// Drop `client` from `uri`. `closed` fires only when it was registered,
    /// so an explicit close followed by teardown notifies once.
    pub fn remove_web_socket(&self, uri: &str, client: ConnectionId) -> bool {
        let listeners = {
            let mut reg = self.lock();
            let Some(entry) = reg.sockets.get_mut(uri) else {
                return false;
            };
            let before = entry.len();
            entry.retain(|c| c.client != client);
            if entry.len() == before {
                return false;
            }
            if entry.is_empty() {
                reg.sockets.remove(uri);
            }
            reg.listeners.clone()
        };
        info!(uri = %uri, client = %client, "WebSocket closed");
        for l in listeners {
            l.closed(uri, client);
        }
        true
    }

    /// Forward a message from `client` to every listener.
    pub fn received(&self, uri: &str, client: ConnectionId, content: &[u8]) {
        let listeners = self.lock().listeners.clone();
        debug!(uri = %uri, client = %client, size = content.len(), "WebSocket message");
        for l in listeners {
            l.received(uri, client, content);
        }
    }

    /// Add a listener. It is told about every socket that is already open.
    pub fn register(&self, listener: Arc<dyn WebSocketListener>) {
        let open: Vec<(String, ConnectionId)> = {
            let mut reg = self.lock();
            reg.listeners.push(Arc::clone(&listener));
            reg.sockets
                .iter()
                .flat_map(|(uri, chans)| chans.iter().map(move |c| (uri.clone(), c.client)))
                .collect()
        };
        for (uri, client) in open {
            listener.opened(&uri, client);
        }
    }

    pub fn unregister(&self, listener: &Arc<dyn WebSocketListener>) -> bool {
        let mut reg = self.lock();
        let before = reg.listeners.len();
        reg.listeners.retain(|l| !Arc::ptr_eq(l, listener));
        reg.listeners.len() != before
    }

    /// Clients currently open on `uri`.
    pub fn clients(&self, uri: &str) -> Vec<ConnectionId> {
        self.lock()
            .sockets
            .get(uri)
            .map(|chans| chans.iter().map(|c| c.client).collect())
            .unwrap_or_default()
    }

    fn snapshot(&self, uri: &str) -> Vec<Channel> {
        self.lock().sockets.get(uri).cloned().unwrap_or_default()
    }

    /// Send `frame` to every client on `uri`; returns how many writes succeeded.
    pub fn publish(&self, uri: &str, frame: &Frame) -> usize {
        let targets = self.snapshot(uri);
        let mut delivered = 0;
        for chan in targets {
            match chan.sink.send_frame(frame) {
                Ok(()) => delivered += 1,
                Err(e) => warn!(uri = %uri, client = %chan.client, error = %e, "WebSocket publish failed"),
            }
        }
        delivered
    }

    pub fn publish_text(&self, uri: &str, text: &str) -> usize {
        self.publish(uri, &Frame::text(text))
    }

    pub fn publish_binary(&self, uri: &str, data: &[u8]) -> usize {
        self.publish(uri, &Frame::binary(data.to_vec()))
    }

    /// Send `frame` to `client` on `uri`; false when it is not open there or
    /// the write failed.
    pub fn send(&self, uri: &str, client: ConnectionId, frame: &Frame) -> bool {
        let Some(chan) = self.snapshot(uri).into_iter().find(|c| c.client == client) else {
            debug!(uri = %uri, client = %client, "No such WebSocket client");
            return false;
        };
        match chan.sink.send_frame(frame) {
            Ok(()) => true,
            Err(e) => {
                warn!(uri = %uri, client = %client, error = %e, "WebSocket send failed");
                false
            }
        }
    }

    pub fn send_text(&self, uri: &str, client: ConnectionId, text: &str) -> bool {
        self.send(uri, client, &Frame::text(text))
    }

    pub fn send_binary(&self, uri: &str, client: ConnectionId, data: &[u8]) -> bool {
        self.send(uri, client, &Frame::binary(data.to_vec()))
    }

    /// Forget every socket and listener.
    pub fn stop(&self) {
        let mut reg = self.lock();
        reg.sockets.clear();
        reg.listeners.clear();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::websocket::OpCode;

    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub frames: Mutex<Vec<Frame>>,
    }

    impl FrameSink for RecordingSink {
        fn send_frame(&self, frame: &Frame) -> io::Result<()> {
            self.frames.lock().unwrap().push(frame.clone());
            Ok(())
        }
    }

    struct BrokenSink;

    impl FrameSink for BrokenSink {
        fn send_frame(&self, _frame: &Frame) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone"))
        }
    }

    #[derive(Default)]
    pub(crate) struct RecordingListener {
        pub events: Mutex<Vec<String>>,
    }

    impl WebSocketListener for RecordingListener {
        fn opened(&self, uri: &str, _client: ConnectionId) {
            self.events.lock().unwrap().push(format!("opened {uri}"));
        }
        fn closed(&self, uri: &str, _client: ConnectionId) {
            self.events.lock().unwrap().push(format!("closed {uri}"));
        }
        fn received(&self, uri: &str, _client: ConnectionId, content: &[u8]) {
            let text = String::from_utf8_lossy(content);
            self.events.lock().unwrap().push(format!("received {uri} {text}"));
        }
    }

    #[test]
    fn test_open_receive_close_fire_once() {
        let channels = Channels::new();
        let listener = Arc::new(RecordingListener::default());
        channels.register(listener.clone());

        let client = ConnectionId::new();
        let sink = Arc::new(RecordingSink::default());
        channels.add_web_socket("/ws", client, sink);
        channels.received("/ws", client, b"hello");
        assert!(channels.remove_web_socket("/ws", client));
        assert!(!channels.remove_web_socket("/ws", client));

        assert_eq!(
            *listener.events.lock().unwrap(),
            vec!["opened /ws", "received /ws hello", "closed /ws"]
        );
        assert!(channels.clients("/ws").is_empty());
    }

    #[test]
    fn test_register_replays_open_sockets() {
        let channels = Channels::new();
        channels.add_web_socket("/a", ConnectionId::new(), Arc::new(RecordingSink::default()));
        let listener = Arc::new(RecordingListener::default());
        channels.register(listener.clone());
        assert_eq!(*listener.events.lock().unwrap(), vec!["opened /a"]);

        let as_dyn: Arc<dyn WebSocketListener> = listener;
        assert!(channels.unregister(&as_dyn));
        assert!(!channels.unregister(&as_dyn));
    }

    #[test]
    fn test_publish_and_send() {
        let channels = Channels::new();
        let (a, b) = (ConnectionId::new(), ConnectionId::new());
        let sink_a = Arc::new(RecordingSink::default());
        let sink_b = Arc::new(RecordingSink::default());
        channels.add_web_socket("/ws", a, sink_a.clone());
        channels.add_web_socket("/ws", b, sink_b.clone());
        channels.add_web_socket("/other", ConnectionId::new(), Arc::new(BrokenSink));

        assert_eq!(channels.publish_text("/ws", "all"), 2);
        assert!(channels.send_binary("/ws", b, &[1, 2]));
        assert!(!channels.send_text("/ws", ConnectionId::new(), "nobody"));
        assert_eq!(channels.publish_text("/other", "x"), 0);

        assert_eq!(sink_a.frames.lock().unwrap().len(), 1);
        let b_frames = sink_b.frames.lock().unwrap();
        assert_eq!(b_frames.len(), 2);
        assert_eq!(b_frames[1].opcode, OpCode::Binary);
    }

    #[test]
    fn test_same_client_is_not_duplicated() {
        let channels = Channels::new();
        let client = ConnectionId::new();
        channels.add_web_socket("/ws", client, Arc::new(RecordingSink::default()));
        channels.add_web_socket("/ws", client, Arc::new(RecordingSink::default()));
        assert_eq!(channels.clients("/ws"), vec![client]);
        channels.stop();
        assert!(channels.clients("/ws").is_empty());
    }
}
