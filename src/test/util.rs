use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
        Mutex,
    },
    time::Duration,
};

use tokio::net::{TcpListener, TcpStream};

use crate::{
    bson::{doc, Document},
    cmap::conn::wire::{Message, MessageFlags},
    options::ServerAddress,
    runtime::{self, AsyncJoinHandle},
};

/// A canned reply for the next command of a given name.
#[derive(Clone, Debug)]
pub(crate) enum MockReply {
    /// Reply with the given document.
    Document(Document),

    /// Close the socket instead of replying.
    CloseConnection,

    /// Wait before replying with the given document.
    Delayed(Duration, Document),

    /// Reply with the given document, but to a request ID other than the one that was sent.
    WrongResponseTo(Document),
}

/// The hello reply of a standalone server that supports every wire version the driver does.
pub(crate) fn standalone_hello() -> Document {
    doc! {
        "isWritablePrimary": true,
        "helloOk": true,
        "maxWireVersion": 21,
        "minWireVersion": 0,
        "maxBsonObjectSize": 16 * 1024 * 1024,
        "maxMessageSizeBytes": 48_000_000,
        "logicalSessionTimeoutMinutes": 30,
        "ok": 1,
    }
}

#[derive(Debug, Default)]
struct MockState {
    hello: Mutex<Document>,
    replies: Mutex<HashMap<String, VecDeque<MockReply>>>,
    received: Mutex<Vec<Document>>,
    connections_opened: AtomicUsize,
    refuse_hellos: AtomicBool,
}

/// A server that speaks just enough of the wire protocol to drive the connection, pool,
/// monitoring, and execution layers in tests.
///
/// Hello commands are answered with the configured hello reply. Any other command is answered
/// with the next reply queued for its name, or `{ ok: 1 }` if none is queued.
#[derive(Debug)]
pub(crate) struct MockServer {
    address: ServerAddress,
    state: Arc<MockState>,
    listener_task: AsyncJoinHandle<()>,
}

impl MockServer {
    /// Start a server that presents itself as a standalone.
    pub(crate) async fn start() -> Self {
        Self::with_hello(standalone_hello()).await
    }

    pub(crate) async fn with_hello(hello: Document) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let address = ServerAddress::Tcp {
            host: "127.0.0.1".to_string(),
            port: Some(port),
        };

        let state = Arc::new(MockState {
            hello: Mutex::new(hello),
            ..Default::default()
        });

        let listener_state = state.clone();
        let listener_task = runtime::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                listener_state
                    .connections_opened
                    .fetch_add(1, Ordering::SeqCst);
                runtime::execute(serve(stream, listener_state.clone()));
            }
        });

        Self {
            address,
            state,
            listener_task,
        }
    }

    pub(crate) fn address(&self) -> &ServerAddress {
        &self.address
    }

    /// When set, hello commands are answered by closing the socket.
    pub(crate) fn refuse_hellos(&self, refuse: bool) {
        self.state.refuse_hellos.store(refuse, Ordering::SeqCst);
    }

    /// Queue a reply for the next command named `command_name`.
    pub(crate) fn push_reply(&self, command_name: &str, reply: MockReply) {
        self.state
            .replies
            .lock()
            .unwrap()
            .entry(command_name.to_string())
            .or_default()
            .push_back(reply);
    }

    /// The number of TCP connections the server has accepted.
    pub(crate) fn connections_opened(&self) -> usize {
        self.state.connections_opened.load(Ordering::SeqCst)
    }

    /// Every command received with the given name, in arrival order.
    pub(crate) fn received(&self, command_name: &str) -> Vec<Document> {
        self.state
            .received
            .lock()
            .unwrap()
            .iter()
            .filter(|command| command.keys().next().map(String::as_str) == Some(command_name))
            .cloned()
            .collect()
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.listener_task.abort();
    }
}

fn is_hello(command_name: &str) -> bool {
    matches!(command_name, "hello" | "isMaster" | "ismaster")
}

async fn serve(mut stream: TcpStream, state: Arc<MockState>) {
    loop {
        let request = match Message::read_from(&mut stream, None).await {
            Ok(request) => request,
            Err(_) => return,
        };
        let request_id = request.request_id.unwrap_or_default();
        let command = request.get_command_document();
        let name = command.keys().next().cloned().unwrap_or_default();

        state.received.lock().unwrap().push(command);

        let reply = if is_hello(&name) {
            if state.refuse_hellos.load(Ordering::SeqCst) {
                return;
            }
            MockReply::Document(state.hello.lock().unwrap().clone())
        } else {
            state
                .replies
                .lock()
                .unwrap()
                .get_mut(&name)
                .and_then(VecDeque::pop_front)
                .unwrap_or_else(|| MockReply::Document(doc! { "ok": 1 }))
        };

        let (document, response_to) = match reply {
            MockReply::Document(document) => (document, request_id),
            MockReply::CloseConnection => return,
            MockReply::Delayed(delay, document) => {
                runtime::delay_for(delay).await;
                (document, request_id)
            }
            MockReply::WrongResponseTo(document) => (document, request_id.wrapping_add(1000)),
        };

        let message = Message {
            document_payload: crate::bson::to_raw_document_buf(&document).unwrap(),
            response_to,
            flags: MessageFlags::empty(),
            checksum: None,
            request_id: None,
        };
        if message.write_to(&mut stream).await.is_err() {
            return;
        }
    }
}
