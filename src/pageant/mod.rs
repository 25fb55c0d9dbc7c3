//! Request/response adapter to the native agent's SSH window.
//!
//! The agent's SSH endpoint is not a socket: requests travel as a copy-data
//! message naming a shared memory mapping, and the window resource is not
//! safely concurrent. The adapter is therefore a single-owner actor: client
//! workers submit requests over a queue and await a reply; the actor owns
//! the window transport and the retry policy.

#[cfg(windows)]
pub mod windows;

#[cfg(test)]
use std::collections::VecDeque;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Platform maximum message length for one exchange (request and reply
/// each fit in one mapping of this size).
pub const MAX_MESSAGE_LEN: usize = 8192;

/// Send timeout for one copy-data message, in milliseconds. The platform
/// default of roughly five seconds fails spuriously while the user is at
/// the smartcard PIN dialog.
pub const SEND_TIMEOUT_MS: u32 = 30_000;

/// Additional attempts after a retryable failure.
pub const MAX_RETRIES: u32 = 3;

/// Agent RPC failures, classified for the retry policy.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    #[error("agent window send timed out")]
    Timeout,
    #[error("agent window handle is stale")]
    StaleWindow,
    #[error("agent window not found")]
    WindowNotFound,
    #[error("{0}")]
    Other(String),
}

/// One exchange with the agent's window. Implemented by the Win32 transport
/// in production and by scripted fakes in tests.
pub trait AgentWindow: Send {
    fn exchange(&mut self, request: &[u8]) -> Result<Vec<u8>, RpcError>;

    /// Re-resolve the window after a stale-handle failure.
    fn reopen(&mut self) -> Result<(), RpcError>;
}

struct Request {
    payload: Vec<u8>,
    reply: oneshot::Sender<Result<Vec<u8>, RpcError>>,
}

/// Cloneable submission handle to the actor.
#[derive(Clone)]
pub struct AgentHandle {
    tx: mpsc::Sender<Request>,
}

impl AgentHandle {
    /// Submit one request and await the agent's reply.
    pub async fn request(&self, payload: Vec<u8>) -> Result<Vec<u8>, RpcError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Request {
                payload,
                reply: reply_tx,
            })
            .await
            .map_err(|_| RpcError::Other("agent adapter is gone".to_string()))?;
        reply_rx
            .await
            .map_err(|_| RpcError::Other("agent adapter dropped the request".to_string()))?
    }
}

/// Start the adapter actor on a blocking worker (the window send blocks for
/// up to [`SEND_TIMEOUT_MS`]). Requests are serviced strictly one at a time.
pub fn spawn(mut window: Box<dyn AgentWindow>) -> AgentHandle {
    let (tx, mut rx) = mpsc::channel::<Request>(16);

    tokio::task::spawn_blocking(move || {
        while let Some(request) = rx.blocking_recv() {
            let outcome = exchange_with_retry(window.as_mut(), &request.payload);
            if let Err(e) = &outcome {
                warn!("agent exchange failed: {e}");
            }
            let _ = request.reply.send(outcome);
        }
        debug!("agent adapter stopped");
    });

    AgentHandle { tx }
}

/// Apply the retry policy around one exchange: timeouts retry in place,
/// stale handles re-resolve the window first, anything else is final.
fn exchange_with_retry(
    window: &mut dyn AgentWindow,
    payload: &[u8],
) -> Result<Vec<u8>, RpcError> {
    let mut timeouts = 0u32;
    let mut stales = 0u32;

    loop {
        match window.exchange(payload) {
            Ok(reply) => return Ok(reply),
            Err(RpcError::Timeout) => {
                timeouts += 1;
                if timeouts > MAX_RETRIES {
                    return Err(RpcError::Timeout);
                }
                warn!("agent send timed out, retry {timeouts}/{MAX_RETRIES}");
            }
            Err(RpcError::StaleWindow) => {
                stales += 1;
                if stales > MAX_RETRIES {
                    return Err(RpcError::StaleWindow);
                }
                warn!("agent window went stale, reopening (retry {stales}/{MAX_RETRIES})");
                window.reopen()?;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Scripted transport for tests: pops one canned outcome per exchange.
#[cfg(test)]
pub struct ScriptedWindow {
    pub script: VecDeque<Result<Vec<u8>, RpcError>>,
    pub exchanges: usize,
    pub reopens: usize,
    pub reopen_fails: bool,
}

#[cfg(test)]
impl ScriptedWindow {
    pub fn new(script: Vec<Result<Vec<u8>, RpcError>>) -> Self {
        Self {
            script: script.into(),
            exchanges: 0,
            reopens: 0,
            reopen_fails: false,
        }
    }
}

#[cfg(test)]
impl AgentWindow for ScriptedWindow {
    fn exchange(&mut self, _request: &[u8]) -> Result<Vec<u8>, RpcError> {
        self.exchanges += 1;
        self.script
            .pop_front()
            .unwrap_or(Err(RpcError::Other("script exhausted".to_string())))
    }

    fn reopen(&mut self) -> Result<(), RpcError> {
        self.reopens += 1;
        if self.reopen_fails {
            Err(RpcError::WindowNotFound)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_passes_the_reply_through() {
        let mut window = ScriptedWindow::new(vec![Ok(b"\x00\x00\x00\x01\x06".to_vec())]);
        let reply = exchange_with_retry(&mut window, b"request").unwrap();
        assert_eq!(reply, b"\x00\x00\x00\x01\x06");
        assert_eq!(window.exchanges, 1);
    }

    #[test]
    fn two_timeouts_then_success() {
        let mut window = ScriptedWindow::new(vec![
            Err(RpcError::Timeout),
            Err(RpcError::Timeout),
            Ok(b"ok".to_vec()),
        ]);
        let reply = exchange_with_retry(&mut window, b"request").unwrap();
        assert_eq!(reply, b"ok");
        assert_eq!(window.exchanges, 3);
        assert_eq!(window.reopens, 0);
    }

    #[test]
    fn timeouts_stop_after_three_retries() {
        let mut window = ScriptedWindow::new(vec![
            Err(RpcError::Timeout),
            Err(RpcError::Timeout),
            Err(RpcError::Timeout),
            Err(RpcError::Timeout),
            Ok(b"never reached".to_vec()),
        ]);
        let err = exchange_with_retry(&mut window, b"request").unwrap_err();
        assert_eq!(err, RpcError::Timeout);
        // Initial attempt plus MAX_RETRIES.
        assert_eq!(window.exchanges, 4);
    }

    #[test]
    fn stale_window_reopens_then_retries() {
        let mut window = ScriptedWindow::new(vec![
            Err(RpcError::StaleWindow),
            Ok(b"ok".to_vec()),
        ]);
        let reply = exchange_with_retry(&mut window, b"request").unwrap();
        assert_eq!(reply, b"ok");
        assert_eq!(window.reopens, 1);
    }

    #[test]
    fn stale_retries_are_counted_separately_from_timeouts() {
        let mut window = ScriptedWindow::new(vec![
            Err(RpcError::Timeout),
            Err(RpcError::StaleWindow),
            Err(RpcError::Timeout),
            Err(RpcError::StaleWindow),
            Ok(b"ok".to_vec()),
        ]);
        let reply = exchange_with_retry(&mut window, b"request").unwrap();
        assert_eq!(reply, b"ok");
        assert_eq!(window.exchanges, 5);
        assert_eq!(window.reopens, 2);
    }

    #[test]
    fn failed_reopen_is_final() {
        let mut window = ScriptedWindow::new(vec![Err(RpcError::StaleWindow)]);
        window.reopen_fails = true;
        let err = exchange_with_retry(&mut window, b"request").unwrap_err();
        assert_eq!(err, RpcError::WindowNotFound);
    }

    #[test]
    fn other_errors_do_not_retry() {
        let mut window = ScriptedWindow::new(vec![Err(RpcError::Other("boom".to_string()))]);
        let err = exchange_with_retry(&mut window, b"request").unwrap_err();
        assert!(matches!(err, RpcError::Other(_)));
        assert_eq!(window.exchanges, 1);
    }

    #[tokio::test]
    async fn actor_serializes_and_replies() {
        let window = ScriptedWindow::new(vec![Ok(b"first".to_vec()), Ok(b"second".to_vec())]);
        let handle = spawn(Box::new(window));

        let first = handle.request(b"a".to_vec()).await.unwrap();
        let second = handle.request(b"b".to_vec()).await.unwrap();
        assert_eq!(first, b"first");
        assert_eq!(second, b"second");
    }

    #[tokio::test]
    async fn failure_reaches_the_caller() {
        let window = ScriptedWindow::new(vec![Err(RpcError::Other("boom".to_string()))]);
        let handle = spawn(Box::new(window));
        let err = handle.request(b"a".to_vec()).await.unwrap_err();
        assert!(matches!(err, RpcError::Other(_)));
    }
}
