//! Execution domains and the cluster that hosts them
//!
//! An [`ExecutionDomain`] is one node of the distributed address space: it
//! owns a [`DomainMemory`], a [`WorkerPool`] and a [`CommEndpoint`]. Domains
//! never migrate tasks implicitly; cross-domain work goes through the
//! endpoint. A [`Cluster`] launches every domain of a program in-process
//! over one transport.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info};

use crate::runtime::comm::{CommEndpoint, HandlerRegistry, LocalFabric, Transport};
use crate::runtime::errors::{RuntimeError, RuntimeResult, TaskResult};
use crate::runtime::group::TaskGroup;
use crate::runtime::memory::DomainMemory;
use crate::runtime::report::ClusterReport;
use crate::runtime::scheduler::{PoolHandle, TaskBuilder, TaskContext, TaskHandle, WorkerPool};
use crate::util::config::RuntimeConfig;

/// How long the dispatcher waits for a frame before re-checking shutdown.
const DISPATCH_POLL: Duration = Duration::from_millis(10);

/// Stable identifier of an execution domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct DomainId(pub u32);

impl DomainId {
    /// Position of the domain in its cluster.
    #[inline]
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for DomainId {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "Domain({})", self.0)
    }
}

/// One node: memory, worker pool and communication endpoint.
pub struct ExecutionDomain {
    id: DomainId,
    pool: WorkerPool,
    memory: DomainMemory,
    endpoint: CommEndpoint,
}

impl fmt::Debug for ExecutionDomain {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("ExecutionDomain")
            .field("id", &self.id)
            .field("pool", &*self.pool)
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

impl ExecutionDomain {
    /// Create a domain and start its workers and dispatcher.
    pub fn start(
        id: DomainId,
        config: &RuntimeConfig,
        transport: Arc<dyn Transport>,
        handlers: Arc<HandlerRegistry>,
    ) -> RuntimeResult<Arc<Self>> {
        let limit = match config.memory_limit {
            0 => None,
            limit => Some(limit),
        };
        let domain = Arc::new_cyclic(|weak| Self {
            id,
            pool: WorkerPool::with_config(id, config.scheduler_config()),
            memory: DomainMemory::with_limit(limit),
            endpoint: CommEndpoint::new(id, transport, handlers, weak.clone(), DISPATCH_POLL),
        });
        domain.endpoint.start().map_err(|err| {
            RuntimeError::ResourceExhausted(format!("{}: cannot start dispatcher: {}", id, err))
        })?;
        debug!("{} started", id);
        Ok(domain)
    }

    #[inline]
    pub fn id(&self) -> DomainId {
        self.id
    }

    /// The domain's worker pool.
    #[inline]
    pub fn pool(&self) -> &PoolHandle {
        &self.pool
    }

    #[inline]
    pub fn memory(&self) -> &DomainMemory {
        &self.memory
    }

    #[inline]
    pub fn endpoint(&self) -> &CommEndpoint {
        &self.endpoint
    }

    /// Spawn a detached task on this domain.
    pub fn spawn<F>(
        &self,
        body: F,
    ) -> RuntimeResult<TaskHandle>
    where
        F: FnOnce(&TaskContext) -> TaskResult + Send + 'static,
    {
        self.pool.spawn_fn(body)
    }

    /// Stop the pool (draining queued work) and then the endpoint.
    pub fn shutdown(&self) {
        self.pool.shutdown();
        self.endpoint.shutdown();
    }
}

/// Every domain of a program, connected through one transport.
pub struct Cluster {
    domains: Vec<Arc<ExecutionDomain>>,
    transport: Arc<dyn Transport>,
    config: RuntimeConfig,
}

impl fmt::Debug for Cluster {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("Cluster")
            .field("domains", &self.domains.len())
            .field("config", &self.config)
            .finish()
    }
}

impl Cluster {
    /// Launch `config.num_domains` domains over an in-process fabric.
    pub fn launch(
        config: RuntimeConfig,
        handlers: HandlerRegistry,
    ) -> RuntimeResult<Self> {
        let transport = Arc::new(LocalFabric::new(config.num_domains));
        Self::launch_with_transport(config, handlers, transport)
    }

    /// Launch over a caller-supplied transport.
    pub fn launch_with_transport(
        config: RuntimeConfig,
        handlers: HandlerRegistry,
        transport: Arc<dyn Transport>,
    ) -> RuntimeResult<Self> {
        let n = config.num_domains;
        if transport.num_domains() < n {
            return Err(RuntimeError::UnknownDomain(DomainId(transport.num_domains() as u32)));
        }

        let handlers = Arc::new(handlers);
        let mut domains = Vec::with_capacity(n);
        for index in 0..n {
            let id = DomainId(index as u32);
            domains.push(ExecutionDomain::start(id, &config, transport.clone(), handlers.clone())?);
        }
        info!(
            "launched {} domain(s), {} slot(s) each, {} handler(s)",
            n,
            config.scheduler_config().num_workers,
            handlers.len()
        );

        Ok(Self {
            domains,
            transport,
            config,
        })
    }

    pub fn num_domains(&self) -> usize {
        self.domains.len()
    }

    pub fn domain(
        &self,
        id: DomainId,
    ) -> RuntimeResult<&Arc<ExecutionDomain>> {
        self.domains.get(id.index()).ok_or(RuntimeError::UnknownDomain(id))
    }

    pub fn domains(&self) -> impl Iterator<Item = &Arc<ExecutionDomain>> {
        self.domains.iter()
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Run the program's top-level task on domain 0 and wait for it.
    ///
    /// A failure that reaches the top of the task tree is returned as
    /// [`RuntimeError::Uncaught`].
    pub fn run_main<F>(
        &self,
        main: F,
    ) -> RuntimeResult<()>
    where
        F: FnOnce(&ExecutionDomain, &TaskContext) -> TaskResult + Send + 'static,
    {
        let domain = self.domain(DomainId(0))?.clone();
        let top = TaskGroup::unbounded(domain.pool());
        let main_domain = domain.clone();
        top.spawn_with(domain.pool(), TaskBuilder::new().name("main"), move |ctx| {
            main(&main_domain, ctx)
        })?;
        top.join().map_err(RuntimeError::Uncaught)
    }

    /// Diagnostics snapshot honoring the configured report flags.
    pub fn snapshot(&self) -> ClusterReport {
        self.snapshot_with(self.config.block_report, self.config.task_report)
    }

    /// Diagnostics snapshot with explicit flags.
    pub fn snapshot_with(
        &self,
        block_report: bool,
        task_report: bool,
    ) -> ClusterReport {
        ClusterReport::collect(self.domains.iter().map(|d| &**d), block_report, task_report)
    }

    /// Wait until every domain has passed the transport barrier. Each
    /// domain enters from its own thread.
    pub fn barrier(&self) -> RuntimeResult<()> {
        std::thread::scope(|scope| {
            let entered: Vec<_> = self
                .domains
                .iter()
                .map(|domain| scope.spawn(move || domain.endpoint().barrier()))
                .collect();
            entered.into_iter().try_for_each(|handle| {
                handle
                    .join()
                    .map_err(|_| RuntimeError::Remote("barrier thread panicked".to_string()))?
            })
        })
    }

    /// Stop every domain. Pools drain first so that in-flight remote work
    /// can still reach its dispatcher.
    pub fn shutdown(&self) {
        for domain in &self.domains {
            domain.pool().shutdown();
        }
        for domain in &self.domains {
            domain.endpoint().shutdown();
        }
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        self.shutdown();
    }
}
