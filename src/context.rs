use std::sync::Arc;

use skein_balance::{register_builtin_balancers, ActiveRequestRecorder, LoadBalancer};
use skein_client::{RpcClient, ServiceProxy};
use skein_common::extension::ExtensionLoader;
use skein_common::transport::{
    register_builtin_compressors, register_builtin_serializers, register_builtin_transports, Compressor,
    Formats, Serializer, Transport,
};
use skein_common::{Result, ServiceKey};
use skein_registry::{register_builtin_coordinators, Coordinator, MemoryEnsemble, ServiceRegistry};
use skein_server::{RpcServer, ServiceDefinition};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::config::RpcConfig;

/// Extension loaders for every pluggable capability.
pub struct Extensions {
    pub coordinators: ExtensionLoader<dyn Coordinator>,
    pub balancers: ExtensionLoader<dyn LoadBalancer>,
    pub serializers: ExtensionLoader<dyn Serializer>,
    pub compressors: ExtensionLoader<dyn Compressor>,
    pub transports: ExtensionLoader<dyn Transport>,
}

impl Extensions {
    /// Loaders reading `config.extension_dir`, with every built-in factory
    /// registered.
    fn builtin(config: &RpcConfig, ensemble: MemoryEnsemble, recorder: Arc<ActiveRequestRecorder>) -> Self {
        let dir = config.extension_dir.clone();
        let extensions = Extensions {
            coordinators: ExtensionLoader::new(dir.clone()),
            balancers: ExtensionLoader::new(dir.clone()),
            serializers: ExtensionLoader::new(dir.clone()),
            compressors: ExtensionLoader::new(dir.clone()),
            transports: ExtensionLoader::new(dir),
        };
        register_builtin_coordinators(&extensions.coordinators, ensemble, &config.registry.address);
        register_builtin_balancers(&extensions.balancers, recorder);
        register_builtin_serializers(&extensions.serializers);
        register_builtin_compressors(&extensions.compressors);
        register_builtin_transports(&extensions.transports);
        extensions
    }
}

/// Builds an [`RpcContext`].
pub struct RpcContextBuilder {
    config: RpcConfig,
    ensemble: Option<MemoryEnsemble>,
    coordinator: Option<Arc<dyn Coordinator>>,
    extensions: Vec<Box<dyn FnOnce(&Extensions) + Send>>,
}

impl RpcContextBuilder {
    pub fn new(config: RpcConfig) -> Self {
        Self {
            config,
            ensemble: None,
            coordinator: None,
            extensions: Vec::new(),
        }
    }

    /// Ensemble behind the `memory` coordinator.
    ///
    /// Contexts built with the same ensemble see each other's services.
    pub fn ensemble(mut self, ensemble: MemoryEnsemble) -> Self {
        self.ensemble = Some(ensemble);
        self
    }

    /// Uses `coordinator` directly instead of looking up
    /// `rpc.registry.coordinator`.
    pub fn coordinator(mut self, coordinator: Arc<dyn Coordinator>) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    /// Registers additional factories before any extension is loaded.
    pub fn register_extensions<F>(mut self, register: F) -> Self
    where
        F: FnOnce(&Extensions) + Send + 'static,
    {
        self.extensions.push(Box::new(register));
        self
    }

    /// Connects to the registry and prepares the wire formats.
    ///
    /// The server and client start lazily, on the first
    /// [`publish`](RpcContext::publish) and
    /// [`create_proxy`](RpcContext::create_proxy).
    ///
    /// # Errors
    ///
    /// - `ExtensionNotFound` if a configured coordinator, transport,
    ///   serializer or compressor name is unknown
    /// - `CoordinatorUnavailable` if the registry cannot connect in time
    pub async fn build(self) -> Result<RpcContext> {
        let config = self.config;
        let recorder = Arc::new(ActiveRequestRecorder::new());
        let extensions = Extensions::builtin(
            &config,
            self.ensemble.unwrap_or_default(),
            recorder.clone(),
        );
        for register in self.extensions {
            register(&extensions);
        }

        let formats = Arc::new(Formats::from_extensions(
            &extensions.serializers,
            &extensions.compressors,
        )?);
        let transport = extensions.transports.get(&config.transport)?;
        let coordinator = match self.coordinator {
            Some(coordinator) => coordinator,
            None => extensions.coordinators.get(&config.registry.coordinator)?,
        };
        let registry = ServiceRegistry::connect(coordinator, config.registry.clone()).await?;

        info!(
            registry = %config.registry.address,
            coordinator = %config.registry.coordinator,
            transport = %config.transport,
            load_balance = %config.client.load_balance,
            serializer = %config.client.serializer,
            compressor = %config.client.compressor,
            "RPC context started"
        );

        Ok(RpcContext {
            inner: Arc::new(ContextInner {
                config,
                extensions,
                formats,
                transport,
                registry,
                recorder,
                server: OnceCell::new(),
                client: OnceCell::new(),
            }),
        })
    }
}

struct ContextInner {
    config: RpcConfig,
    extensions: Extensions,
    formats: Arc<Formats>,
    transport: Arc<dyn Transport>,
    registry: ServiceRegistry,
    recorder: Arc<ActiveRequestRecorder>,
    server: OnceCell<RpcServer>,
    client: OnceCell<RpcClient>,
}

/// One process's view of the RPC system.
///
/// Owns the registry session, the lazily started server and the shared
/// client. Cloning is cheap and shares everything.
///
/// # Example
///
/// ```no_run
/// use skein::{RpcConfig, RpcContext, ServiceDefinition, ServiceError, ServiceKey};
///
/// # async fn demo() -> skein::Result<()> {
/// let context = RpcContext::start(RpcConfig::default()).await?;
///
/// let echo = ServiceKey::new("demo.Echo");
/// context
///     .publish(
///         echo.clone(),
///         ServiceDefinition::new()
///             .method("ping", |(): ()| async { Ok::<_, ServiceError>("pong".to_string()) }),
///     )
///     .await?;
///
/// let proxy = context.create_proxy(echo).await?;
/// let pong: String = proxy.call("ping", ()).await?;
/// assert_eq!(pong, "pong");
///
/// context.shutdown().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RpcContext {
    inner: Arc<ContextInner>,
}

impl RpcContext {
    pub fn builder(config: RpcConfig) -> RpcContextBuilder {
        RpcContextBuilder::new(config)
    }

    /// Builds a context with the built-in extensions.
    pub async fn start(config: RpcConfig) -> Result<Self> {
        RpcContextBuilder::new(config).build().await
    }

    pub fn config(&self) -> &RpcConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.inner.registry
    }

    pub fn recorder(&self) -> &Arc<ActiveRequestRecorder> {
        &self.inner.recorder
    }

    pub fn extensions(&self) -> &Extensions {
        &self.inner.extensions
    }

    /// The server, once something has been published.
    pub fn server(&self) -> Option<&RpcServer> {
        self.inner.server.get()
    }

    /// The client, once a proxy has been created.
    pub fn client(&self) -> Option<&RpcClient> {
        self.inner.client.get()
    }

    /// Serves `definition` under `service` and registers this process as a
    /// provider.
    ///
    /// The first call binds `rpc.server.bind` and starts accepting.
    ///
    /// # Errors
    ///
    /// - `Connection` if the server cannot bind
    /// - `Config` if the service key is invalid
    pub async fn publish(&self, service: ServiceKey, definition: ServiceDefinition) -> Result<()> {
        let server = self
            .inner
            .server
            .get_or_try_init(|| async {
                let server = RpcServer::bind(
                    self.inner.config.server.clone(),
                    self.inner.transport.clone(),
                    self.inner.formats.clone(),
                    Some(self.inner.registry.clone()),
                )
                .await?;
                server.spawn()?;
                Ok::<_, skein_common::RpcError>(server)
            })
            .await?;
        server.publish(service, definition).await
    }

    /// Returns a proxy calling the providers of `service`.
    ///
    /// The first call selects the load balancer and wire formats named in
    /// the client configuration.
    ///
    /// # Errors
    ///
    /// - `Config` if the service key is invalid
    /// - `ExtensionNotFound` if a configured extension name is unknown
    pub async fn create_proxy(&self, service: ServiceKey) -> Result<ServiceProxy> {
        service.validate()?;
        let client = self
            .inner
            .client
            .get_or_try_init(|| async { self.build_client() })
            .await?;
        debug!(service = %service, "Created proxy");
        Ok(client.proxy(service))
    }

    fn build_client(&self) -> Result<RpcClient> {
        let inner = &self.inner;
        let config = &inner.config.client;
        let balancer = inner.extensions.balancers.get(&config.load_balance)?;
        let serializer = inner.extensions.serializers.get(&config.serializer)?;
        let compressor = inner.extensions.compressors.get(&config.compressor)?;

        RpcClient::new(
            config.clone(),
            Arc::new(inner.registry.clone()),
            inner.transport.clone(),
            balancer,
            inner.recorder.clone(),
            inner.formats.clone(),
            serializer.id(),
            compressor.id(),
        )
    }

    /// Stops the server (draining handlers and unpublishing), closes client
    /// connections and ends the registry session.
    pub async fn shutdown(&self) {
        if let Some(server) = self.inner.server.get() {
            server.shutdown().await;
        }
        if let Some(client) = self.inner.client.get() {
            client.close();
        }
        self.inner.registry.close();
        info!("RPC context stopped");
    }
}
