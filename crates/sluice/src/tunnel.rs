//! Accept loop and reconnect state machine shared by HTTP and TCP tunnels.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use sluice_common::{dial_control, ControlEndpoint, MuxSession, MuxStream, TunnelError};

use crate::control::{dial_control_with_retry, next_backoff, sleep_or_cancel, INITIAL_BACKOFF};

/// What differs between tunnel kinds: how to ask for one, and what to do
/// with each stream the server opens
#[async_trait]
pub(crate) trait TunnelDriver: Send + Sync + 'static {
    /// What the server assigned: a host or a port
    type Identity: Clone + PartialEq + fmt::Display + Send + Sync + 'static;

    /// Run the control exchange on a fresh session, asking to resume
    /// `previous` when set
    async fn establish(
        &self,
        session: &MuxSession,
        previous: Option<&Self::Identity>,
    ) -> Result<Self::Identity, TunnelError>;

    /// Bridge one server-opened stream to the local service
    async fn handle_stream(&self, stream: MuxStream, cancel: CancellationToken);
}

/// The connection a tunnel currently runs on
struct Current<I> {
    session: MuxSession,
    identity: I,
}

pub(crate) struct TunnelCore<D: TunnelDriver> {
    endpoint: ControlEndpoint,
    driver: D,
    current: Mutex<Current<D::Identity>>,
    /// Set once the caller closes the tunnel; never reset
    closing: CancellationToken,
    reconnect: bool,
}

impl<D: TunnelDriver> TunnelCore<D> {
    pub(crate) fn identity(&self) -> D::Identity {
        self.current.lock().identity.clone()
    }

    fn session(&self) -> MuxSession {
        self.current.lock().session.clone()
    }

    /// Install a new session, then close the one it replaces
    fn swap(&self, session: MuxSession, identity: D::Identity) {
        let previous = {
            let mut current = self.current.lock();
            std::mem::replace(
                &mut *current,
                Current {
                    session,
                    identity,
                },
            )
        };
        previous.session.close();
    }

    pub(crate) fn close(&self) {
        self.closing.cancel();
        self.session().close();
    }

    async fn run(self: Arc<Self>) -> Result<(), TunnelError> {
        let result = self.accept_loop().await;
        self.session().close();

        match result {
            Err(TunnelError::Cancelled) => Ok(()),
            Err(_) if self.closing.is_cancelled() => Ok(()),
            other => other,
        }
    }

    async fn accept_loop(self: &Arc<Self>) -> Result<(), TunnelError> {
        loop {
            let session = self.session();
            let accepted = tokio::select! {
                biased;
                _ = self.closing.cancelled() => return Ok(()),
                accepted = session.accept_stream() => accepted,
            };

            match accepted {
                Ok(stream) => {
                    let core = self.clone();
                    let cancel = self.closing.child_token();
                    tokio::spawn(async move {
                        core.driver.handle_stream(stream, cancel).await;
                    });
                }
                Err(e) => {
                    if self.closing.is_cancelled() {
                        return Ok(());
                    }
                    if !self.reconnect {
                        return Err(e);
                    }
                    tracing::warn!("Tunnel {} lost its connection: {}", self.identity(), e);
                    self.resume().await?;
                }
            }
        }
    }

    /// Re-establish the tunnel with the identity it already holds
    async fn resume(&self) -> Result<(), TunnelError> {
        let previous = self.identity();
        let mut backoff = INITIAL_BACKOFF;

        loop {
            // Leaves the server time to tear down the tunnel we are replacing
            sleep_or_cancel(backoff, &self.closing).await?;
            let session = dial_control_with_retry(&self.endpoint, &self.closing).await?;

            let established = tokio::select! {
                _ = self.closing.cancelled() => Err(TunnelError::Cancelled),
                result = self.driver.establish(&session, Some(&previous)) => result,
            };

            match established {
                Ok(identity) if identity == previous => {
                    self.swap(session, identity);
                    tracing::info!("Tunnel {} resumed", previous);
                    return Ok(());
                }
                Ok(identity) => {
                    session.close();
                    return Err(TunnelError::ResumeMismatch(format!(
                        "expected {}, got {}",
                        previous, identity
                    )));
                }
                Err(e) if e.is_retryable() => {
                    session.close();
                    backoff = next_backoff(backoff);
                    tracing::warn!(
                        "Resuming tunnel {} failed: {} (retrying in {:?})",
                        previous,
                        e,
                        backoff
                    );
                }
                Err(e) => {
                    session.close();
                    return Err(e);
                }
            }
        }
    }
}

/// A running tunnel and the task driving it
pub(crate) struct TunnelHandle<D: TunnelDriver> {
    core: Arc<TunnelCore<D>>,
    task: Option<JoinHandle<Result<(), TunnelError>>>,
}

impl<D: TunnelDriver> TunnelHandle<D> {
    /// Dial the server, establish the tunnel and start accepting streams
    ///
    /// Cancelling `cancel` closes the tunnel.
    pub(crate) async fn start(
        endpoint: ControlEndpoint,
        driver: D,
        reconnect: bool,
        cancel: &CancellationToken,
    ) -> Result<Self, TunnelError> {
        let closing = cancel.child_token();

        let session = tokio::select! {
            _ = closing.cancelled() => return Err(TunnelError::Cancelled),
            session = dial_control(&endpoint) => session?,
        };

        let established = tokio::select! {
            _ = closing.cancelled() => Err(TunnelError::Cancelled),
            result = driver.establish(&session, None) => result,
        };
        let identity = match established {
            Ok(identity) => identity,
            Err(e) => {
                session.close();
                return Err(e);
            }
        };

        let core = Arc::new(TunnelCore {
            endpoint,
            driver,
            current: Mutex::new(Current { session, identity }),
            closing,
            reconnect,
        });
        let task = tokio::spawn(core.clone().run());

        Ok(Self {
            core,
            task: Some(task),
        })
    }

    pub(crate) fn core(&self) -> &TunnelCore<D> {
        &self.core
    }

    pub(crate) fn close(&self) {
        self.core.close();
    }

    /// Wait for the tunnel to end
    ///
    /// Closing or cancelling is a clean end. Later calls return `Ok`.
    pub(crate) async fn wait(&mut self) -> Result<(), TunnelError> {
        match self.task.take() {
            Some(task) => match task.await {
                Ok(result) => result,
                Err(e) => Err(TunnelError::Io(std::io::Error::other(e))),
            },
            None => Ok(()),
        }
    }
}

impl<D: TunnelDriver> Drop for TunnelHandle<D> {
    fn drop(&mut self) {
        self.core.close();
    }
}
