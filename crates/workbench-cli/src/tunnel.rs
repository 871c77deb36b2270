//! Self-healing port-forward tunnel to a resource's backing pod
//!
//! A [`TunnelSession`] keeps a local TCP port connected to the matching port
//! of the pod currently backing a resource. Each iteration resolves the pod
//! again, runs one forward until it ends, and restarts immediately on
//! transient failures. Only a local bind failure or cancellation ends the
//! session.
//!
//! Readiness is observable exactly once per session: the first iteration that
//! binds locally fires the external signal, later iterations only fire their
//! own internal signal.

use std::future::Future;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::{Api, Client};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::resource::ResourceRef;
use crate::{Error, Result};

/// Port served by notebook pods
pub const NOTEBOOK_PORT: u16 = 8888;

/// How long a finished connection may take to close its remote stream
const STREAM_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Local and remote halves of a forward
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PortPair {
    pub local: u16,
    pub remote: u16,
}

impl PortPair {
    pub fn new(local: u16, remote: u16) -> Self {
        Self { local, remote }
    }
}

/// Where one tunnel iteration forwards to. Recomputed on every restart.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TunnelEndpoint {
    pub local_port: u16,
    pub remote_port: u16,
    pub pod: String,
    pub namespace: String,
}

impl TunnelEndpoint {
    pub fn resolve(resource: &ResourceRef, ports: PortPair) -> Self {
        Self {
            local_port: ports.local,
            remote_port: ports.remote,
            pod: resource.pod_name(),
            namespace: resource.namespace.clone(),
        }
    }
}

/// Why a single forward ended
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("{0}")]
    Transient(String),

    #[error("cannot bind local port {port}: {source}")]
    LocalBind {
        port: u16,
        #[source]
        source: std::io::Error,
    },
}

/// Runs one forward from a local port to a pod port
///
/// Implementations fire `ready` once the local port is bound, block until the
/// forward ends, and release the local port before returning.
#[async_trait]
pub trait PortForwarder: Send + Sync {
    async fn forward(
        &self,
        endpoint: &TunnelEndpoint,
        ready: oneshot::Sender<()>,
        cancel: CancellationToken,
    ) -> std::result::Result<(), ForwardError>;
}

/// Handle to a running session
pub struct SessionHandle {
    pod: String,
    cancel: CancellationToken,
    serving: Option<oneshot::Receiver<()>>,
    restarts: Arc<AtomicU64>,
    task: Option<JoinHandle<Result<()>>>,
}

impl SessionHandle {
    /// Wait until the tunnel first serves traffic.
    ///
    /// Fails with the session's error if it ends before binding, or with
    /// `Cancelled` if the session scope is cancelled first.
    pub async fn serving(&mut self) -> Result<()> {
        let Some(serving) = self.serving.take() else {
            return Ok(());
        };
        let cancel = self.cancel.clone();

        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            fired = serving => match fired {
                Ok(()) => Ok(()),
                Err(_) => match self.task.take() {
                    Some(task) => match join_session(task, &self.pod).await {
                        Ok(()) => Err(Error::Cancelled),
                        Err(e) => Err(e),
                    },
                    None => Err(Error::Cancelled),
                },
            },
        }
    }

    /// Number of restarts so far
    pub fn restarts(&self) -> u64 {
        self.restarts.load(Ordering::Relaxed)
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the session to end. `Ok` means it was cancelled.
    pub async fn join(mut self) -> Result<()> {
        match self.task.take() {
            Some(task) => join_session(task, &self.pod).await,
            None => Ok(()),
        }
    }
}

async fn join_session(task: JoinHandle<Result<()>>, pod: &str) -> Result<()> {
    task.await.map_err(|e| Error::Tunnel {
        pod: pod.to_string(),
        message: e.to_string(),
    })?
}

/// Restart loop around a [`PortForwarder`]
pub struct TunnelSession {
    forwarder: Arc<dyn PortForwarder>,
    resource: ResourceRef,
    ports: PortPair,
    restarts: Arc<AtomicU64>,
}

impl TunnelSession {
    /// Spawn the session loop under `cancel`.
    pub fn start(
        forwarder: Arc<dyn PortForwarder>,
        resource: ResourceRef,
        ports: PortPair,
        cancel: CancellationToken,
    ) -> SessionHandle {
        let (serving_tx, serving_rx) = oneshot::channel();
        let restarts = Arc::new(AtomicU64::new(0));
        let pod = resource.pod_name();

        let session = TunnelSession {
            forwarder,
            resource,
            ports,
            restarts: restarts.clone(),
        };
        let task = tokio::spawn(session.run(serving_tx, cancel.clone()));

        SessionHandle {
            pod,
            cancel,
            serving: Some(serving_rx),
            restarts,
            task: Some(task),
        }
    }

    async fn run(self, serving: oneshot::Sender<()>, cancel: CancellationToken) -> Result<()> {
        let mut external_ready = Some(serving);

        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            let endpoint = TunnelEndpoint::resolve(&self.resource, self.ports);
            debug!(
                pod = %endpoint.pod,
                namespace = %endpoint.namespace,
                local_port = endpoint.local_port,
                remote_port = endpoint.remote_port,
                "starting forward"
            );

            let (ready_tx, ready_rx) = oneshot::channel::<()>();
            let forward = self
                .forwarder
                .forward(&endpoint, ready_tx, cancel.child_token());
            let relay = async {
                if ready_rx.await.is_err() {
                    return;
                }
                match external_ready.take() {
                    Some(tx) => {
                        let _ = tx.send(());
                        info!(
                            resource = %self.resource,
                            local_port = endpoint.local_port,
                            "tunnel serving"
                        );
                    }
                    None => info!(pod = %endpoint.pod, "tunnel re-established"),
                }
            };
            let (outcome, ()) = tokio::join!(forward, relay);

            if cancel.is_cancelled() {
                info!(resource = %self.resource, "tunnel closed");
                return Ok(());
            }

            let reason = match outcome {
                Ok(()) => "forward ended".to_string(),
                Err(ForwardError::Transient(reason)) => reason,
                Err(ForwardError::LocalBind { port, source }) => {
                    return Err(Error::LocalBind { port, source });
                }
            };

            let restarts = self.restarts.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(
                pod = %endpoint.pod,
                reason = %reason,
                restarts,
                "tunnel dropped, restarting"
            );
        }
    }
}

/// Forwards through the Kubernetes pod portforward subresource
#[derive(Clone)]
pub struct KubePortForwarder {
    client: Client,
}

impl KubePortForwarder {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PortForwarder for KubePortForwarder {
    async fn forward(
        &self,
        endpoint: &TunnelEndpoint,
        ready: oneshot::Sender<()>,
        cancel: CancellationToken,
    ) -> std::result::Result<(), ForwardError> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, endpoint.local_port))
            .await
            .map_err(|source| ForwardError::LocalBind {
                port: endpoint.local_port,
                source,
            })?;

        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &endpoint.namespace);
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            running = ensure_running(&pods, &endpoint.pod) => running?,
        }
        let _ = ready.send(());

        let pod = endpoint.pod.clone();
        let port = endpoint.remote_port;
        let relay_cancel = cancel.clone();
        accept_loop(listener, cancel, move |socket, failures| {
            relay_connection(
                pods.clone(),
                pod.clone(),
                port,
                socket,
                failures,
                relay_cancel.clone(),
            )
        })
        .await
    }
}

/// Serve `listener` until cancelled or a connection reports a failure.
///
/// Every relay task is aborted and the listener closed before returning, so
/// the local port is free for the next iteration.
async fn accept_loop<R, Fut>(
    listener: TcpListener,
    cancel: CancellationToken,
    relay: R,
) -> std::result::Result<(), ForwardError>
where
    R: Fn(TcpStream, mpsc::Sender<String>) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (failure_tx, mut failure_rx) = mpsc::channel::<String>(1);
    let mut connections = JoinSet::new();

    let outcome = loop {
        tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            Some(reason) = failure_rx.recv() => break Err(ForwardError::Transient(reason)),
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    debug!(peer = %peer, "accepted connection");
                    connections.spawn(relay(socket, failure_tx.clone()));
                }
                Err(e) => break Err(ForwardError::Transient(format!("accept failed: {}", e))),
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    };

    connections.shutdown().await;
    drop(listener);
    outcome
}

async fn ensure_running(pods: &Api<Pod>, name: &str) -> std::result::Result<(), ForwardError> {
    let pod = pods
        .get(name)
        .await
        .map_err(|e| ForwardError::Transient(format!("pod {} unavailable: {}", name, e)))?;

    let phase = pod
        .status
        .and_then(|s| s.phase)
        .unwrap_or_else(|| "Unknown".to_string());
    if phase != "Running" {
        return Err(ForwardError::Transient(format!(
            "pod {} is {}, not Running",
            name, phase
        )));
    }
    Ok(())
}

/// Relay one accepted connection over its own portforward stream.
///
/// Remote-side failures are reported on `failures` so the owning forward can
/// end and the session can re-resolve the pod.
async fn relay_connection(
    pods: Api<Pod>,
    pod: String,
    port: u16,
    mut socket: TcpStream,
    failures: mpsc::Sender<String>,
    cancel: CancellationToken,
) {
    let mut forwarder = match pods.portforward(&pod, &[port]).await {
        Ok(pf) => pf,
        Err(e) => {
            let _ = failures.try_send(format!("portforward to {} failed: {}", pod, e));
            return;
        }
    };
    let Some(mut upstream) = forwarder.take_stream(port) else {
        let _ = failures.try_send(format!("no stream for port {} on {}", port, pod));
        return;
    };
    let remote_error = forwarder.take_error(port);

    tokio::select! {
        _ = cancel.cancelled() => {
            forwarder.abort();
            return;
        }
        copied = tokio::io::copy_bidirectional(&mut socket, &mut upstream) => match copied {
            Ok((sent, received)) => debug!(sent, received, "connection closed"),
            Err(e) => debug!(error = %e, "connection relay ended"),
        },
        Some(Some(message)) = async {
            match remote_error {
                Some(err) => Some(err.await),
                None => None,
            }
        } => {
            let _ = failures.try_send(format!("remote port {} on {}: {}", port, pod, message));
            forwarder.abort();
            return;
        }
    }

    drop(upstream);
    match tokio::time::timeout(STREAM_CLOSE_TIMEOUT, forwarder.join()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            let _ = failures.try_send(format!("portforward to {} broke: {}", pod, e));
        }
        Err(_) => debug!(pod = %pod, "portforward did not close in time"),
    }
}
