//! Server thread hosting the single remote instance of a shared object.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use serde_json::Value;
use shardcast_api::{SharedError, SharedObject};

type Reply = Result<Value, SharedError>;

pub(crate) enum Request {
    Call {
        method: String,
        args: Vec<Value>,
        reply: flume::Sender<Reply>,
    },
    Shutdown,
}

/// Cloneable sending side of a server's request channel.
#[derive(Clone)]
pub(crate) struct ServerClient {
    requests: flume::Sender<Request>,
}

impl ServerClient {
    /// Perform one call. The outer error is a transport failure, the inner
    /// result is whatever the object returned.
    pub fn call(&self, method: &str, args: Vec<Value>, timeout: Option<Duration>) -> Result<Reply, SharedError> {
        let (reply_tx, reply_rx) = flume::bounded(1);
        self.requests
            .send(Request::Call {
                method: method.to_string(),
                args,
                reply: reply_tx,
            })
            .map_err(|_| SharedError::Transport("state server is not running".into()))?;

        match timeout {
            Some(timeout) => reply_rx.recv_timeout(timeout).map_err(|err| match err {
                flume::RecvTimeoutError::Timeout => {
                    SharedError::Transport(format!("no reply within {:?}", timeout))
                }
                flume::RecvTimeoutError::Disconnected => {
                    SharedError::Transport("state server exited before replying".into())
                }
            }),
            None => reply_rx
                .recv()
                .map_err(|_| SharedError::Transport("state server exited before replying".into())),
        }
    }
}

pub(crate) struct StateServer {
    client: ServerClient,
    thread: Option<JoinHandle<()>>,
    alive: Arc<AtomicBool>,
}

struct ClearOnDrop(Arc<AtomicBool>);

impl Drop for ClearOnDrop {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl StateServer {
    pub fn start<T: SharedObject>(
        thread_name: String,
        mut object: T,
        dispatch: tracing::Dispatch,
    ) -> Result<Self, SharedError> {
        let (requests_tx, requests_rx) = flume::unbounded::<Request>();
        let alive = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&alive);

        let thread = std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                tracing::dispatcher::with_default(&dispatch, || {
                    let _alive = ClearOnDrop(flag);
                    tracing::debug!(server = %thread_name, "state server started");
                    while let Ok(request) = requests_rx.recv() {
                        match request {
                            Request::Call { method, args, reply } => {
                                let result = object.call(&method, &args);
                                // caller may have given up on a timeout
                                let _ = reply.send(result);
                            }
                            Request::Shutdown => break,
                        }
                    }
                    tracing::debug!(server = %thread_name, "state server stopped");
                })
            })
            .map_err(|e| SharedError::ServerStart(e.to_string()))?;

        Ok(Self {
            client: ServerClient { requests: requests_tx },
            thread: Some(thread),
            alive,
        })
    }

    pub fn client(&self) -> ServerClient {
        self.client.clone()
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Stop the thread and wait for it. A thread that died from a panic in
    /// the hosted object is reported but not propagated.
    pub fn shutdown(mut self) {
        let _ = self.client.requests.send(Request::Shutdown);
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                tracing::warn!("state server thread panicked");
            }
        }
    }
}
