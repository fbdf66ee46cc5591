//! Worker-side service adapter
//!
//! A worker entry point builds one [`ServiceAgent`] from its context, then
//! hands its listener to [`ServiceAgent::serve`]. The agent reports the
//! listening address to the controller, answers terminate requests and
//! forwards the worker's log events.

pub mod log_forward;

use std::future::Future;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::balancer::WorkerContext;
use crate::bridge::{ProxySocketAddressInfo, ServiceListener, SocketStream};
use crate::constants;
use crate::error::RpcError;
use crate::rpc::{Agent, methods};

/// Lifecycle of a worker's service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ServiceState {
    Starting,
    Listening,
    Terminating,
    Exited,
}

#[derive(Clone)]
pub struct ServiceAgent {
    id: u64,
    args: Arc<[String]>,
    agent: Agent,
    state: Arc<watch::Sender<ServiceState>>,
}

impl ServiceAgent {
    /// Take over the worker context and start answering terminate requests.
    pub fn new(ctx: WorkerContext) -> Self {
        let WorkerContext { id, args, agent } = ctx;
        let state = Arc::new(watch::Sender::new(ServiceState::Starting));

        let terminate = Arc::clone(&state);
        agent.register(methods::TRY_TERMINATE, move |_| {
            let requested = terminate.send_if_modified(|state| {
                if *state < ServiceState::Terminating {
                    *state = ServiceState::Terminating;
                    true
                } else {
                    false
                }
            });
            if requested {
                info!(worker = id, "terminate requested");
            }
            Ok(Value::Null)
        });

        Self {
            id,
            args: args.into(),
            agent,
            state,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn agent(&self) -> &Agent {
        &self.agent
    }

    pub fn state(&self) -> ServiceState {
        *self.state.borrow()
    }

    /// Accept connections on `listener` until termination is requested.
    ///
    /// Each connection runs `handler` as a local task. On return the
    /// listener is closed and the state is `Exited`.
    pub async fn serve<L, H, Fut>(&self, listener: L, handler: H) -> anyhow::Result<()>
    where
        L: Into<ServiceListener>,
        H: Fn(SocketStream) -> Fut,
        Fut: Future<Output = ()> + 'static,
    {
        let listener = listener.into();
        let address = listener.backend_address()?;

        let reported = address.clone();
        self.agent.register(methods::SOCKET_CONNECT_OPTS, move |_| {
            serde_json::to_value(&reported).map_err(|err| err.to_string())
        });
        self.state.send_if_modified(|state| {
            if *state == ServiceState::Starting {
                *state = ServiceState::Listening;
                true
            } else {
                false
            }
        });
        match &address {
            Some(address) => info!(worker = self.id, %address, "service listening"),
            None => warn!(worker = self.id, "service has no reachable address"),
        }

        let mut state = self.state.subscribe();
        loop {
            tokio::select! {
                biased;
                _ = state.wait_for(|state| *state >= ServiceState::Terminating) => break,
                accepted = listener.accept() => match accepted {
                    Ok(stream) => {
                        tokio::task::spawn_local(handler(stream));
                    }
                    Err(err) => {
                        warn!(worker = self.id, error = %err, "accept failed");
                        tokio::time::sleep(constants::ACCEPT_ERROR_BACKOFF).await;
                    }
                },
            }
        }

        drop(listener);
        self.state.send_replace(ServiceState::Exited);
        info!(worker = self.id, "service stopped");
        Ok(())
    }

    /// Resolves once the controller has asked this worker to terminate.
    pub async fn terminated(&self) {
        let mut state = self.state.subscribe();
        let _ = state
            .wait_for(|state| *state >= ServiceState::Terminating)
            .await;
    }

    /// Client addresses of a connection forwarded by the proxy.
    ///
    /// `None` when the connection did not come through the proxy or has
    /// already closed on the controller side.
    pub async fn proxy_address_info(
        &self,
        stream: &SocketStream,
    ) -> Result<Option<ProxySocketAddressInfo>, RpcError> {
        let Some(peer) = stream.peer_addr() else {
            return Ok(None);
        };
        let info: Option<ProxySocketAddressInfo> = self
            .agent
            .call_as(methods::REQUEST_PROXY_ADDRESS_INFO, &peer)
            .await?;
        debug!(worker = self.id, %peer, found = info.is_some(), "proxy address info");
        Ok(info)
    }
}

impl std::fmt::Debug for ServiceAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceAgent")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::BackendAddress;
    use crate::rpc::Port;
    use pretty_assertions::assert_eq;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::task::LocalSet;

    fn service() -> (ServiceAgent, Agent) {
        let (controller, worker) = Port::pair();
        let ctx = WorkerContext {
            id: 5,
            args: vec!["a".to_string()],
            agent: Agent::new(worker),
        };
        (ServiceAgent::new(ctx), Agent::new(controller))
    }

    #[tokio::test]
    async fn test_serve_reports_address_and_stops_on_terminate() {
        LocalSet::new()
            .run_until(async {
                let (service, controller) = service();
                assert_eq!(service.state(), ServiceState::Starting);
                assert_eq!(service.args(), ["a".to_string()].as_slice());

                let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
                let local = listener.local_addr().unwrap();

                let serving = {
                    let service = service.clone();
                    tokio::task::spawn_local(async move {
                        service
                            .serve(listener, |mut stream| async move {
                                let _ = stream.write_all(b"hi").await;
                            })
                            .await
                    })
                };

                // asked before serve registered it: the call waits
                let address: Option<BackendAddress> = controller
                    .call_as(methods::SOCKET_CONNECT_OPTS, &())
                    .await
                    .unwrap();
                assert_eq!(address, Some(BackendAddress::Tcp(local)));
                assert_eq!(service.state(), ServiceState::Listening);

                let mut client = TcpStream::connect(local).await.unwrap();
                let mut greeting = [0u8; 2];
                client.read_exact(&mut greeting).await.unwrap();
                assert_eq!(&greeting, b"hi");

                controller
                    .call(methods::TRY_TERMINATE, Value::Null)
                    .await
                    .unwrap();
                serving.await.unwrap().unwrap();
                assert_eq!(service.state(), ServiceState::Exited);
                assert!(TcpStream::connect(local).await.is_err());
            })
            .await;
    }

    #[tokio::test]
    async fn test_terminate_before_serve_is_sticky() {
        LocalSet::new()
            .run_until(async {
                let (service, controller) = service();
                controller
                    .call(methods::TRY_TERMINATE, Value::Null)
                    .await
                    .unwrap();
                assert_eq!(service.state(), ServiceState::Terminating);
                service.terminated().await;

                let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
                service.serve(listener, |_stream| async {}).await.unwrap();
                assert_eq!(service.state(), ServiceState::Exited);
            })
            .await;
    }

    #[tokio::test]
    async fn test_proxy_address_info_without_mapping() {
        let (service, controller) = service();
        controller.register(methods::REQUEST_PROXY_ADDRESS_INFO, |_| Ok(Value::Null));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let _client = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (accepted, _) = listener.accept().await.unwrap();

        let info = service
            .proxy_address_info(&SocketStream::Tcp(accepted))
            .await
            .unwrap();
        assert_eq!(info, None);
    }
}
