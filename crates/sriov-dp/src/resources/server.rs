//! One device plugin gRPC server per resource pool.
//!
//! The server binds `<prefix>_<name>.sock` and announces itself to the kubelet in one of two
//! ways. When the kubelet plugin watcher directory exists the socket is created there, and the
//! kubelet discovers it and calls the `pluginregistration` service we serve next to the device
//! plugin service. Otherwise the socket is created in the device plugin directory and we call
//! `Register` on `kubelet.sock`. In that mode the kubelet removes our socket when it restarts,
//! [`ResourceServer::watch`] notices and restarts the server, which registers again.
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::Stream;
use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::Server;
use tonic::{Request, Response, Status};
use tracing::{debug, error, info, info_span, warn};
use tracing_futures::Instrument;

use super::pool::{PoolError, ResourcePool};
use crate::cdi::{self, CdiError};
use crate::config::Config;
use crate::device_info;
use crate::device_plugin_api::v1beta1::{
    device_plugin_server::{DevicePlugin, DevicePluginServer},
    registration_client::RegistrationClient,
    AllocateRequest, AllocateResponse, ContainerAllocateResponse,
    ContainerPreferredAllocationResponse, DevicePluginOptions, Empty, ListAndWatchResponse,
    PreStartContainerRequest, PreStartContainerResponse, PreferredAllocationRequest,
    PreferredAllocationResponse, RegisterRequest, API_VERSION,
};
use crate::grpc_sock;
use crate::plugin_registration_api::v1::{
    registration_server::{Registration, RegistrationServer},
    InfoRequest, PluginInfo, RegistrationStatus, RegistrationStatusResponse,
};

/// Name of the kubelet registration socket in the device plugin directory
pub const KUBELET_SOCKET: &str = "kubelet.sock";
const PLUGIN_TYPE: &str = "DevicePlugin";
const DIAL_ATTEMPTS: usize = 10;
const DIAL_RETRY_INTERVAL: Duration = Duration::from_millis(100);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors starting a resource server. They only affect the resource the server belongs to.
#[derive(Error, Debug)]
pub enum ServerError {
    /// The socket could not be bound
    #[error("unable to listen on {path:?}: {source}")]
    Listen {
        /// The socket path
        path: PathBuf,
        /// The underlying error
        source: io::Error,
    },
    /// The freshly started server did not answer
    #[error("device plugin server on {path:?} is not reachable: {source}")]
    Unreachable {
        /// The socket path
        path: PathBuf,
        /// The underlying error
        source: tonic::transport::Error,
    },
    /// The kubelet refused or could not be reached for registration
    #[error("unable to register {resource} with the kubelet: {message}")]
    Registration {
        /// The resource being registered
        resource: String,
        /// What went wrong
        message: String,
    },
    /// The CDI spec of the pool could not be written
    #[error(transparent)]
    Cdi(#[from] CdiError),
    /// The operation is not valid in the current state
    #[error("cannot {op} a server in state {state:?}")]
    State {
        /// The attempted operation
        op: &'static str,
        /// The state of the server
        state: ServerState,
    },
}

/// Lifecycle of a resource server.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerState {
    /// Built, never started
    Created,
    /// The socket is bound and the server answers
    Started,
    /// Registered and probing device health
    Serving,
    /// The socket vanished, the server is being rebuilt
    Restarting,
    /// Stopped, the socket is removed
    Stopped,
}

struct Running {
    shutdown: oneshot::Sender<()>,
    serve: JoinHandle<Result<(), tonic::transport::Error>>,
    probe: Option<JoinHandle<()>>,
}

/// Serves one resource pool through the device plugin API.
pub struct ResourceServer {
    pool: Arc<ResourcePool>,
    config: Config,
    plugin_watch: bool,
    socket_name: String,
    socket_path: PathBuf,
    terminate: broadcast::Sender<()>,
    update: broadcast::Sender<()>,
    stop_watcher: broadcast::Sender<()>,
    state: RwLock<ServerState>,
    running: Mutex<Option<Running>>,
    // Held for the whole of start, restart and stop
    lifecycle: Mutex<()>,
}

impl ResourceServer {
    /// Returns a server for `pool`. The registration mode is fixed here from the presence of the
    /// plugin watcher directory.
    pub fn new(pool: Arc<ResourcePool>, config: &Config) -> Self {
        let plugin_watch = config.plugin_watch_mode();
        let socket_name = format!("{}_{}.sock", pool.resource_prefix(), pool.resource_name());
        let socket_dir = if plugin_watch {
            &config.plugin_registry_dir
        } else {
            &config.device_plugin_dir
        };
        let socket_path = socket_dir.join(&socket_name);
        let (terminate, _) = broadcast::channel(1);
        let (update, _) = broadcast::channel(1);
        let (stop_watcher, _) = broadcast::channel(1);
        ResourceServer {
            pool,
            config: config.clone(),
            plugin_watch,
            socket_name,
            socket_path,
            terminate,
            update,
            stop_watcher,
            state: RwLock::new(ServerState::Created),
            running: Mutex::new(None),
            lifecycle: Mutex::new(()),
        }
    }

    /// The pool served.
    pub fn pool(&self) -> &Arc<ResourcePool> {
        &self.pool
    }

    /// The socket the server listens on.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// True when the kubelet plugin watcher discovers the server.
    pub fn plugin_watch_mode(&self) -> bool {
        self.plugin_watch
    }

    /// The current lifecycle state.
    pub async fn state(&self) -> ServerState {
        *self.state.read().await
    }

    async fn set_state(&self, state: ServerState) {
        let mut current = self.state.write().await;
        debug!(resource = %self.pool.full_name(), from = ?*current, to = ?state, "Server state change");
        *current = state;
    }

    /// Binds the socket, serves the device plugin API, registers with the kubelet when not in
    /// plugin watcher mode and starts probing device health.
    ///
    /// On failure the server is torn down again and left `Stopped`.
    pub async fn start(self: &Arc<Self>) -> Result<(), ServerError> {
        let _lifecycle = self.lifecycle.lock().await;
        self.start_locked().await
    }

    async fn start_locked(self: &Arc<Self>) -> Result<(), ServerError> {
        let resource = self.pool.full_name();
        let state = self.state().await;
        if matches!(state, ServerState::Started | ServerState::Serving) {
            return Err(ServerError::State { op: "start", state });
        }
        info!(%resource, socket = ?self.socket_path, "Starting device plugin server");

        let running = self.serve().await?;
        *self.running.lock().await = Some(running);
        self.set_state(ServerState::Started).await;

        if let Err(e) = self.finish_start().await {
            error!(%resource, error = %e, "Unable to start device plugin server");
            self.stop_grpc().await;
            self.remove_socket().await;
            self.set_state(ServerState::Stopped).await;
            return Err(e);
        }

        device_info::clean(&self.config.device_info_dir, &self.pool).await;
        let probe = self.spawn_probe();
        match self.running.lock().await.as_mut() {
            Some(running) => running.probe = Some(probe),
            None => {
                probe.abort();
                return Err(ServerError::State {
                    op: "start",
                    state: self.state().await,
                });
            }
        }
        self.set_state(ServerState::Serving).await;
        info!(%resource, "Device plugin server is serving");
        Ok(())
    }

    async fn finish_start(&self) -> Result<(), ServerError> {
        self.wait_for_server().await?;
        if !self.plugin_watch {
            self.register().await?;
        }
        if self.config.use_cdi {
            cdi::write_spec(&self.config.cdi_spec_dir, &self.pool).await?;
        }
        Ok(())
    }

    async fn serve(self: &Arc<Self>) -> Result<Running, ServerError> {
        self.remove_socket().await;
        let socket =
            grpc_sock::server::Socket::new(&self.socket_path).map_err(|source| ServerError::Listen {
                path: self.socket_path.clone(),
                source,
            })?;

        let plugin = DevicePluginServer::new(DevicePluginService {
            pool: self.pool.clone(),
            terminate: self.terminate.clone(),
            update: self.update.clone(),
            use_cdi: self.config.use_cdi,
            device_info_dir: self.config.device_info_dir.clone(),
        });
        let (shutdown, shutdown_rx) = oneshot::channel::<()>();
        let signal = async move {
            shutdown_rx.await.ok();
        };
        let span = info_span!("grpc", resource = %self.pool.full_name());

        let serve = if self.plugin_watch {
            let registration = RegistrationServer::new(RegistrationService {
                name: self.pool.full_name(),
                endpoint: self.socket_path.to_string_lossy().into_owned(),
                server: Arc::downgrade(self),
            });
            tokio::spawn(
                Server::builder()
                    .add_service(plugin)
                    .add_service(registration)
                    .serve_with_incoming_shutdown(socket, signal)
                    .instrument(span),
            )
        } else {
            tokio::spawn(
                Server::builder()
                    .add_service(plugin)
                    .serve_with_incoming_shutdown(socket, signal)
                    .instrument(span),
            )
        };

        Ok(Running {
            shutdown,
            serve,
            probe: None,
        })
    }

    async fn wait_for_server(&self) -> Result<(), ServerError> {
        grpc_sock::client::dial_with_retries(&self.socket_path, DIAL_ATTEMPTS, DIAL_RETRY_INTERVAL)
            .await
            .map(|_| ())
            .map_err(|source| ServerError::Unreachable {
                path: self.socket_path.clone(),
                source,
            })
    }

    async fn register(&self) -> Result<(), ServerError> {
        let resource = self.pool.full_name();
        let registration_error = |message: String| ServerError::Registration {
            resource: resource.clone(),
            message,
        };
        let kubelet_socket = self.config.device_plugin_dir.join(KUBELET_SOCKET);
        let channel = grpc_sock::client::socket_channel(&kubelet_socket)
            .await
            .map_err(|e| registration_error(format!("unable to dial {:?}: {}", kubelet_socket, e)))?;
        let mut client = RegistrationClient::new(channel);
        let request = Request::new(RegisterRequest {
            version: API_VERSION.to_owned(),
            endpoint: self.socket_name.clone(),
            resource_name: resource.clone(),
            options: Some(plugin_options(&self.pool)),
        });
        client
            .register(request)
            .await
            .map_err(|status| registration_error(status.message().to_owned()))?;
        info!(%resource, "Registered device plugin with the kubelet");
        Ok(())
    }

    fn spawn_probe(&self) -> JoinHandle<()> {
        let pool = self.pool.clone();
        let update = self.update.clone();
        let interval = self.config.health_check_interval;
        tokio::spawn(
            async move {
                loop {
                    tokio::time::sleep(interval).await;
                    let pool = pool.clone();
                    match tokio::task::spawn_blocking(move || pool.probe()).await {
                        Ok(true) => {
                            // no receiver just means nobody is watching yet
                            let _ = update.send(());
                        }
                        Ok(false) => (),
                        Err(e) => warn!(error = %e, "Health probe failed"),
                    }
                }
            }
            .instrument(info_span!("probe", resource = %self.pool.full_name())),
        )
    }

    /// Stops the gRPC server and the health probe, leaving the socket and the watcher alone.
    async fn stop_grpc(&self) {
        let running = match self.running.lock().await.take() {
            Some(running) => running,
            None => return,
        };
        if let Some(probe) = running.probe {
            probe.abort();
        }
        running.shutdown.send(()).ok();
        let mut serve = running.serve;
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut serve).await {
            Ok(Ok(Ok(()))) => (),
            Ok(Ok(Err(e))) => warn!(error = %e, "Device plugin server exited with an error"),
            Ok(Err(e)) => warn!(error = %e, "Device plugin server task failed"),
            Err(_) => {
                warn!("Device plugin server did not shut down in time, aborting it");
                serve.abort();
            }
        }
    }

    async fn remove_socket(&self) {
        match tokio::fs::remove_file(&self.socket_path).await {
            Ok(_) => (),
            Err(e) if e.kind() == io::ErrorKind::NotFound => (),
            Err(e) => warn!(socket = ?self.socket_path, error = %e, "Unable to remove socket"),
        }
    }

    /// Ends every `ListAndWatch` stream, stops the watcher and the server, and removes the socket
    /// and device-info files.
    pub async fn stop(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        info!(resource = %self.pool.full_name(), "Stopping device plugin server");
        // ListAndWatch streams must end before a graceful shutdown can complete
        let _ = self.terminate.send(());
        let _ = self.stop_watcher.send(());
        self.stop_grpc().await;
        self.remove_socket().await;
        device_info::clean(&self.config.device_info_dir, &self.pool).await;
        self.set_state(ServerState::Stopped).await;
    }

    /// Rebuilds the gRPC server and registers again. A failed restart leaves the server
    /// `Restarting` so it can be retried.
    pub async fn restart(self: &Arc<Self>) -> Result<(), ServerError> {
        let _lifecycle = self.lifecycle.lock().await;
        let state = self.state().await;
        if matches!(state, ServerState::Stopped | ServerState::Created) {
            return Err(ServerError::State {
                op: "restart",
                state,
            });
        }
        self.set_state(ServerState::Restarting).await;
        let _ = self.terminate.send(());
        self.stop_grpc().await;
        let res = self.start_locked().await;
        if res.is_err() {
            self.set_state(ServerState::Restarting).await;
        }
        res
    }

    /// Polls the socket every `socket_watch_interval` and restarts the server when it is gone.
    /// Returns when the server is stopped. Failed restarts are retried on the next tick.
    pub async fn watch(self: Arc<Self>) {
        let mut stop = self.stop_watcher.subscribe();
        let resource = self.pool.full_name();
        let interval = self.config.socket_watch_interval;
        async move {
            loop {
                tokio::select! {
                    _ = stop.recv() => {
                        debug!("Socket watcher stopped");
                        return;
                    }
                    _ = tokio::time::sleep(interval) => {
                        if tokio::fs::symlink_metadata(&self.socket_path).await.is_ok() {
                            continue;
                        }
                        if self.state().await == ServerState::Stopped {
                            return;
                        }
                        info!(socket = ?self.socket_path, "Socket removed, restarting device plugin server");
                        match self.restart().await {
                            Ok(()) => (),
                            Err(ServerError::State { state: ServerState::Stopped, .. }) => return,
                            Err(e) => error!(error = %e, "Unable to restart device plugin server, retrying"),
                        }
                    }
                }
            }
        }
        .instrument(info_span!("watch", %resource))
        .await
    }
}

fn plugin_options(pool: &ResourcePool) -> DevicePluginOptions {
    DevicePluginOptions {
        pre_start_required: false,
        get_preferred_allocation_available: pool.allocator().is_some(),
    }
}

fn pool_status(e: PoolError) -> Status {
    match &e {
        PoolError::UnknownDevice(_) => Status::not_found(e.to_string()),
        PoolError::Encode(_) => Status::internal(e.to_string()),
    }
}

#[derive(Clone)]
struct DevicePluginService {
    pool: Arc<ResourcePool>,
    terminate: broadcast::Sender<()>,
    update: broadcast::Sender<()>,
    use_cdi: bool,
    device_info_dir: PathBuf,
}

#[async_trait::async_trait]
impl DevicePlugin for DevicePluginService {
    async fn get_device_plugin_options(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<DevicePluginOptions>, Status> {
        Ok(Response::new(plugin_options(&self.pool)))
    }

    type ListAndWatchStream =
        Pin<Box<dyn Stream<Item = Result<ListAndWatchResponse, Status>> + Send + Sync + 'static>>;

    async fn list_and_watch(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<Self::ListAndWatchStream>, Status> {
        let resource = self.pool.full_name();
        debug!(%resource, "ListAndWatch called");
        // Subscribe before the first send so no health change is missed
        let mut terminate = self.terminate.subscribe();
        let mut update = self.update.subscribe();
        let (sender, receiver) = mpsc::channel(1);
        let devices = self.pool.get_devices();
        sender
            .send(Ok(ListAndWatchResponse { devices }))
            .await
            .map_err(|_| Status::internal("unable to send the device list"))?;

        let pool = self.pool.clone();
        tokio::spawn(
            async move {
                loop {
                    tokio::select! {
                        _ = terminate.recv() => {
                            debug!("ListAndWatch terminated");
                            return;
                        }
                        res = update.recv() => {
                            match res {
                                Ok(()) | Err(RecvError::Lagged(_)) => (),
                                Err(RecvError::Closed) => return,
                            }
                            let devices = pool.get_devices();
                            if sender.send(Ok(ListAndWatchResponse { devices })).await.is_err() {
                                debug!("ListAndWatch stream closed by the kubelet");
                                return;
                            }
                        }
                    }
                }
            }
            .instrument(info_span!("list_and_watch", %resource)),
        );

        Ok(Response::new(Box::pin(ReceiverStream::new(receiver))))
    }

    async fn get_preferred_allocation(
        &self,
        request: Request<PreferredAllocationRequest>,
    ) -> Result<Response<PreferredAllocationResponse>, Status> {
        let allocator = self
            .pool
            .allocator()
            .ok_or_else(|| Status::unimplemented("no allocation policy configured"))?;
        let container_responses = request
            .into_inner()
            .container_requests
            .iter()
            .map(|req| ContainerPreferredAllocationResponse {
                device_i_ds: allocator.allocate(req, self.pool.device_pool()),
            })
            .collect();
        Ok(Response::new(PreferredAllocationResponse {
            container_responses,
        }))
    }

    async fn allocate(
        &self,
        request: Request<AllocateRequest>,
    ) -> Result<Response<AllocateResponse>, Status> {
        let mut container_responses = Vec::new();
        for container in request.into_inner().container_requests {
            let ids = container.devices_i_ds;
            debug!(resource = %self.pool.full_name(), devices = ?ids, "Allocate called");
            let envs = self
                .pool
                .envs(&ids)
                .map_err(pool_status)?;
            let mut response = ContainerAllocateResponse {
                envs,
                ..Default::default()
            };
            if self.use_cdi {
                response.annotations = cdi::annotations(&self.pool, &ids);
            } else {
                response.devices = self.pool.device_specs(&ids);
                response.mounts = self.pool.mounts(&ids);
            }
            device_info::save(&self.device_info_dir, &self.pool, &ids)
                .await
                .map_err(|e| Status::internal(format!("unable to save device info: {}", e)))?;
            container_responses.push(response);
        }
        Ok(Response::new(AllocateResponse {
            container_responses,
        }))
    }

    async fn pre_start_container(
        &self,
        _request: Request<PreStartContainerRequest>,
    ) -> Result<Response<PreStartContainerResponse>, Status> {
        Ok(Response::new(PreStartContainerResponse {}))
    }
}

/// Answers the kubelet plugin watcher.
struct RegistrationService {
    name: String,
    endpoint: String,
    server: Weak<ResourceServer>,
}

#[async_trait::async_trait]
impl Registration for RegistrationService {
    async fn get_info(&self, _request: Request<InfoRequest>) -> Result<Response<PluginInfo>, Status> {
        Ok(Response::new(PluginInfo {
            r#type: PLUGIN_TYPE.to_owned(),
            name: self.name.clone(),
            endpoint: self.endpoint.clone(),
            supported_versions: vec![API_VERSION.to_owned()],
        }))
    }

    async fn notify_registration_status(
        &self,
        request: Request<RegistrationStatus>,
    ) -> Result<Response<RegistrationStatusResponse>, Status> {
        let status = request.into_inner();
        if status.plugin_registered {
            info!(resource = %self.name, "Plugin watcher registered the device plugin");
        } else {
            error!(resource = %self.name, error = %status.error, "Plugin watcher registration failed, stopping");
            if let Some(server) = self.server.upgrade() {
                // Stopping waits for in-flight calls, this one included
                tokio::spawn(async move { server.stop().await });
            }
        }
        Ok(Response::new(RegistrationStatusResponse {}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device_plugin_api::v1beta1::{
        device_plugin_client::DevicePluginClient,
        registration_server::{Registration as KubeletRegistration, RegistrationServer as KubeletServer},
        ContainerAllocateRequest, ContainerPreferredAllocationRequest,
    };
    use crate::plugin_registration_api::v1::registration_client::RegistrationClient as WatcherClient;
    use crate::resources::pool::tests::{host, pool};
    use tonic::transport::Channel;

    const NET: &str = r#"{"resourceName": "net", "selectors": {}}"#;
    const PACKED: &str = r#"{"resourceName": "net", "allocatePolicy": "packed", "selectors": {}}"#;

    struct MockKubelet {
        requests: mpsc::Sender<RegisterRequest>,
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl KubeletRegistration for MockKubelet {
        async fn register(&self, request: Request<RegisterRequest>) -> Result<Response<Empty>, Status> {
            self.requests.send(request.into_inner()).await.unwrap();
            tokio::time::sleep(self.delay).await;
            Ok(Response::new(Empty {}))
        }
    }

    /// Serves a kubelet registration endpoint in `dir` and returns the requests it receives.
    fn run_mock_kubelet(dir: &Path) -> mpsc::Receiver<RegisterRequest> {
        run_slow_mock_kubelet(dir, Duration::from_millis(0))
    }

    /// Like `run_mock_kubelet`, but every registration is answered after `delay`.
    fn run_slow_mock_kubelet(dir: &Path, delay: Duration) -> mpsc::Receiver<RegisterRequest> {
        let (requests, rx) = mpsc::channel(8);
        let socket = grpc_sock::server::Socket::new(&dir.join(KUBELET_SOCKET))
            .expect("should be able to create kubelet socket");
        tokio::spawn(
            Server::builder()
                .add_service(KubeletServer::new(MockKubelet { requests, delay }))
                .serve_with_incoming(socket),
        );
        rx
    }

    fn config(dir: &Path) -> Config {
        Config {
            device_plugin_dir: dir.to_owned(),
            plugin_registry_dir: dir.join("plugins_registry"),
            cdi_spec_dir: dir.join("cdi"),
            device_info_dir: dir.join("devinfo"),
            health_check_interval: Duration::from_millis(50),
            socket_watch_interval: Duration::from_millis(50),
            ..Config::default()
        }
    }

    async fn client(server: &ResourceServer) -> DevicePluginClient<Channel> {
        let channel = grpc_sock::client::socket_channel(server.socket_path())
            .await
            .expect("should be able to dial the device plugin");
        DevicePluginClient::new(channel)
    }

    async fn next_request(requests: &mut mpsc::Receiver<RegisterRequest>) -> RegisterRequest {
        tokio::time::timeout(Duration::from_secs(5), requests.recv())
            .await
            .expect("registration timed out")
            .expect("kubelet went away")
    }

    async fn wait_for_state(server: &ResourceServer, state: ServerState) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while server.state().await != state {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("server did not reach the expected state");
    }

    fn ids(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|id| id.to_string()).collect()
    }

    #[tokio::test]
    async fn test_register_with_kubelet() {
        let dir = tempfile::tempdir().expect("should be able to create tempdir");
        let mut requests = run_mock_kubelet(dir.path());
        let pool = Arc::new(pool(Arc::new(host()), NET));
        let server = Arc::new(ResourceServer::new(pool, &config(dir.path())));
        assert!(!server.plugin_watch_mode());
        assert_eq!(server.socket_path(), dir.path().join("intel.com_net.sock"));

        server.start().await.expect("server should start");
        assert_eq!(server.state().await, ServerState::Serving);

        let request = next_request(&mut requests).await;
        assert_eq!(request.version, "v1beta1");
        assert_eq!(request.endpoint, "intel.com_net.sock");
        assert_eq!(request.resource_name, "intel.com/net");
        let options = request.options.expect("options should be sent");
        assert!(!options.pre_start_required);
        assert!(!options.get_preferred_allocation_available);

        server.stop().await;
        assert_eq!(server.state().await, ServerState::Stopped);
        assert!(!server.socket_path().exists());
    }

    #[tokio::test]
    async fn test_start_fails_without_kubelet() {
        let dir = tempfile::tempdir().expect("should be able to create tempdir");
        let pool = Arc::new(pool(Arc::new(host()), NET));
        let server = Arc::new(ResourceServer::new(pool, &config(dir.path())));

        let err = server.start().await.expect_err("registration should fail");
        assert!(matches!(err, ServerError::Registration { .. }));
        assert_eq!(server.state().await, ServerState::Stopped);
        assert!(!server.socket_path().exists());
    }

    #[tokio::test]
    async fn test_list_and_watch_reports_health_changes() {
        let dir = tempfile::tempdir().expect("should be able to create tempdir");
        let _requests = run_mock_kubelet(dir.path());
        let host = Arc::new(host());
        let pool = Arc::new(pool(host.clone(), NET));
        let server = Arc::new(ResourceServer::new(pool, &config(dir.path())));
        server.start().await.expect("server should start");

        let mut client = client(&server).await;
        let mut stream = client
            .list_and_watch(Request::new(Empty {}))
            .await
            .expect("ListAndWatch should succeed")
            .into_inner();
        let first = stream.message().await.unwrap().expect("initial device list");
        let listed = first.devices.iter().map(|d| d.id.as_str()).collect::<Vec<_>>();
        assert_eq!(listed, vec!["0000:3b:02.0", "0000:3b:02.1", "0000:3b:02.2"]);
        assert!(first.devices.iter().all(|d| d.health == "Healthy"));

        host.set_oper_state("ens1f0", "down");
        let update = tokio::time::timeout(Duration::from_secs(5), stream.message())
            .await
            .expect("health update timed out")
            .unwrap()
            .expect("stream should stay open");
        assert_eq!(update.devices.len(), 3);
        assert!(update.devices.iter().all(|d| d.health == "Unhealthy"));

        server.stop().await;
        let end = tokio::time::timeout(Duration::from_secs(5), stream.message())
            .await
            .expect("stream should end on stop");
        assert!(!matches!(end, Ok(Some(_))));
    }

    #[tokio::test]
    async fn test_allocate() {
        let dir = tempfile::tempdir().expect("should be able to create tempdir");
        let _requests = run_mock_kubelet(dir.path());
        let config = config(dir.path());
        let pool = Arc::new(pool(Arc::new(host()), NET));
        let server = Arc::new(ResourceServer::new(pool, &config));
        server.start().await.expect("server should start");
        let mut client = client(&server).await;

        let response = client
            .allocate(Request::new(AllocateRequest {
                container_requests: vec![ContainerAllocateRequest {
                    devices_i_ds: ids(&["0000:3b:02.0", "0000:3b:02.1"]),
                }],
            }))
            .await
            .expect("Allocate should succeed")
            .into_inner();
        assert_eq!(response.container_responses.len(), 1);
        let container = &response.container_responses[0];
        assert_eq!(
            container.envs["PCIDEVICE_INTEL_COM_NET"],
            "0000:3b:02.0,0000:3b:02.1"
        );
        assert!(container.envs.contains_key("PCIDEVICE_INTEL_COM_NET_INFO"));
        let paths = container
            .devices
            .iter()
            .map(|d| d.host_path.as_str())
            .collect::<Vec<_>>();
        assert_eq!(paths, vec!["/dev/vfio/vfio", "/dev/vfio/70"]);
        assert!(container.annotations.is_empty());

        let info = device_info::file_path(&config.device_info_dir, "intel.com/net", "0000:3b:02.0");
        assert!(info.exists());

        let err = client
            .allocate(Request::new(AllocateRequest {
                container_requests: vec![ContainerAllocateRequest {
                    devices_i_ds: ids(&["0000:ff:00.0"]),
                }],
            }))
            .await
            .expect_err("unknown devices should be rejected");
        assert_eq!(err.code(), tonic::Code::NotFound);

        let response = client
            .pre_start_container(Request::new(PreStartContainerRequest {
                devices_i_ds: ids(&["0000:3b:02.0"]),
            }))
            .await;
        assert!(response.is_ok());

        server.stop().await;
        assert!(!info.exists());
    }

    #[tokio::test]
    async fn test_allocate_with_cdi() {
        let dir = tempfile::tempdir().expect("should be able to create tempdir");
        let _requests = run_mock_kubelet(dir.path());
        let config = Config {
            use_cdi: true,
            ..config(dir.path())
        };
        let pool = Arc::new(pool(Arc::new(host()), NET));
        let server = Arc::new(ResourceServer::new(pool.clone(), &config));
        server.start().await.expect("server should start");
        assert!(cdi::spec_path(&config.cdi_spec_dir, &pool).exists());

        let mut client = client(&server).await;
        let response = client
            .allocate(Request::new(AllocateRequest {
                container_requests: vec![ContainerAllocateRequest {
                    devices_i_ds: ids(&["0000:3b:02.2"]),
                }],
            }))
            .await
            .expect("Allocate should succeed")
            .into_inner();
        let container = &response.container_responses[0];
        assert!(container.devices.is_empty());
        assert!(container.mounts.is_empty());
        assert_eq!(
            container.annotations["cdi.k8s.io/sriov-dp_net"],
            "intel.com/net=0000:3b:02.2"
        );
        assert_eq!(container.envs["PCIDEVICE_INTEL_COM_NET"], "0000:3b:02.2");

        server.stop().await;
    }

    #[tokio::test]
    async fn test_preferred_allocation() {
        let dir = tempfile::tempdir().expect("should be able to create tempdir");
        let mut requests = run_mock_kubelet(dir.path());
        let pool = Arc::new(pool(Arc::new(host()), PACKED));
        let server = Arc::new(ResourceServer::new(pool, &config(dir.path())));
        server.start().await.expect("server should start");

        let registered = next_request(&mut requests).await.options.unwrap();
        assert!(registered.get_preferred_allocation_available);

        let mut client = client(&server).await;
        let options = client
            .get_device_plugin_options(Request::new(Empty {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(options, registered);

        let response = client
            .get_preferred_allocation(Request::new(PreferredAllocationRequest {
                container_requests: vec![ContainerPreferredAllocationRequest {
                    available_device_i_ds: ids(&["0000:3b:02.2", "0000:3b:02.1", "0000:3b:02.0"]),
                    must_include_device_i_ds: ids(&["0000:3b:02.2"]),
                    allocation_size: 2,
                }],
            }))
            .await
            .expect("GetPreferredAllocation should succeed")
            .into_inner();
        assert_eq!(
            response.container_responses[0].device_i_ds,
            ids(&["0000:3b:02.2", "0000:3b:02.0"])
        );

        server.stop().await;
    }

    #[tokio::test]
    async fn test_preferred_allocation_without_policy() {
        let dir = tempfile::tempdir().expect("should be able to create tempdir");
        let _requests = run_mock_kubelet(dir.path());
        let pool = Arc::new(pool(Arc::new(host()), NET));
        let server = Arc::new(ResourceServer::new(pool, &config(dir.path())));
        server.start().await.expect("server should start");

        let err = client(&server)
            .await
            .get_preferred_allocation(Request::new(PreferredAllocationRequest {
                container_requests: vec![],
            }))
            .await
            .expect_err("no policy is configured");
        assert_eq!(err.code(), tonic::Code::Unimplemented);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_restart_when_socket_is_removed() {
        let dir = tempfile::tempdir().expect("should be able to create tempdir");
        let mut requests = run_mock_kubelet(dir.path());
        let pool = Arc::new(pool(Arc::new(host()), NET));
        let server = Arc::new(ResourceServer::new(pool, &config(dir.path())));
        server.start().await.expect("server should start");
        next_request(&mut requests).await;
        let watcher = tokio::spawn(server.clone().watch());

        std::fs::remove_file(server.socket_path()).expect("socket should exist");
        let request = next_request(&mut requests).await;
        assert_eq!(request.resource_name, "intel.com/net");
        wait_for_state(&server, ServerState::Serving).await;
        assert!(server.socket_path().exists());

        server.stop().await;
        tokio::time::timeout(Duration::from_secs(5), watcher)
            .await
            .expect("watcher should end on stop")
            .unwrap();
        assert!(!server.socket_path().exists());
    }

    #[tokio::test]
    async fn test_stop_during_restart() {
        let dir = tempfile::tempdir().expect("should be able to create tempdir");
        let mut requests = run_slow_mock_kubelet(dir.path(), Duration::from_millis(400));
        let pool = Arc::new(pool(Arc::new(host()), NET));
        let server = Arc::new(ResourceServer::new(pool, &config(dir.path())));
        server.start().await.expect("server should start");
        next_request(&mut requests).await;
        let watcher = tokio::spawn(server.clone().watch());

        std::fs::remove_file(server.socket_path()).expect("socket should exist");
        // The kubelet holds the restart's registration while we stop
        next_request(&mut requests).await;
        server.stop().await;
        assert_eq!(server.state().await, ServerState::Stopped);

        tokio::time::sleep(Duration::from_millis(800)).await;
        assert_eq!(server.state().await, ServerState::Stopped);
        assert!(!server.socket_path().exists());
        tokio::time::timeout(Duration::from_secs(5), watcher)
            .await
            .expect("watcher should end on stop")
            .unwrap();
        assert!(server.running.lock().await.is_none());
    }

    #[test]
    fn test_pool_error_status() {
        let unknown = pool_status(PoolError::UnknownDevice("0000:3b:09.0".to_owned()));
        assert_eq!(unknown.code(), tonic::Code::NotFound);
        let encode = serde_json::from_str::<u32>("nope").unwrap_err();
        assert_eq!(pool_status(PoolError::Encode(encode)).code(), tonic::Code::Internal);
    }

    #[tokio::test]
    async fn test_plugin_watcher_registration() {
        let dir = tempfile::tempdir().expect("should be able to create tempdir");
        let config = config(dir.path());
        std::fs::create_dir(&config.plugin_registry_dir).unwrap();
        let pool = Arc::new(pool(Arc::new(host()), NET));
        let server = Arc::new(ResourceServer::new(pool, &config));
        assert!(server.plugin_watch_mode());
        assert_eq!(
            server.socket_path(),
            config.plugin_registry_dir.join("intel.com_net.sock")
        );

        // No kubelet socket is needed, the plugin watcher comes to us
        server.start().await.expect("server should start");
        let channel = grpc_sock::client::socket_channel(server.socket_path())
            .await
            .unwrap();
        let mut watcher = WatcherClient::new(channel);
        let info = watcher
            .get_info(Request::new(InfoRequest {}))
            .await
            .expect("GetInfo should succeed")
            .into_inner();
        assert_eq!(info.r#type, "DevicePlugin");
        assert_eq!(info.name, "intel.com/net");
        assert_eq!(info.endpoint, server.socket_path().to_string_lossy());
        assert_eq!(info.supported_versions, vec!["v1beta1".to_owned()]);

        watcher
            .notify_registration_status(Request::new(RegistrationStatus {
                plugin_registered: true,
                error: String::new(),
            }))
            .await
            .unwrap();
        assert_eq!(server.state().await, ServerState::Serving);

        watcher
            .notify_registration_status(Request::new(RegistrationStatus {
                plugin_registered: false,
                error: "incompatible version".to_owned(),
            }))
            .await
            .unwrap();
        drop(watcher);
        wait_for_state(&server, ServerState::Stopped).await;
        assert!(!server.socket_path().exists());
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let dir = tempfile::tempdir().expect("should be able to create tempdir");
        let _requests = run_mock_kubelet(dir.path());
        let pool = Arc::new(pool(Arc::new(host()), NET));
        let server = Arc::new(ResourceServer::new(pool, &config(dir.path())));
        server.start().await.expect("server should start");
        assert!(matches!(
            server.start().await,
            Err(ServerError::State { op: "start", state: ServerState::Serving })
        ));
        server.stop().await;
        assert!(matches!(
            server.restart().await,
            Err(ServerError::State { op: "restart", .. })
        ));
    }
}
