use std::{
    collections::HashSet,
    convert::Infallible,
    sync::{Arc, Mutex},
    time::Duration,
};

use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_stream::{StreamExt, wrappers::BroadcastStream};

use engage_core::{Aggregate, AggregateId, DomainError, DomainResult, TenantId};
use engage_events::{Command, EventBus, EventEnvelope, InMemoryEventBus};
use engage_infra::{
    command_dispatcher::{CommandDispatcher, DispatchError},
    event_store::{EventStore, EventStoreError, InMemoryEventStore, StoredEvent},
    invoicing::{
        GenerationJobConfig, InvoiceGenerationService, InvoiceNumberAllocator, MonthlyInvoiceRun, MonthlyRunError,
        MonthlyRunSummary, PaymentPosting, record_payment_or_defer, register_generation_handlers, system_clock,
    },
    jobs::{
        InMemoryJobStore, Job, JobExecutor, JobExecutorHandle, JobId, JobKind, JobResult, JobStore,
        JobStoreError, PROJECTION_REBUILD,
    },
    projections::{
        BalanceReadModel, BatchReadModel, CreditBalancesProjection, DivisionBalancesProjection,
        DivisionReadModel, FinancerReadModel, InvoiceFilter, InvoiceGenerationProjection, InvoiceReadModel,
        InvoicesProjection, OrganizationDirectoryProjection, Projection, ProjectionError, ProjectionSet,
    },
    read_model::InMemoryTenantStore,
    workers::{ProjectionWorker, WorkerHandle},
};
use engage_invoicing::{BatchId, Invoice, InvoiceId, InvoiceNumber, InvoiceType};
use engage_organizations::{DivisionId, FinancerId};

#[cfg(feature = "persistent")]
use engage_infra::{
    event_bus::{RedisBusError, RedisPubSubEventBus, redis_pubsub::DEFAULT_CHANNEL},
    event_store::PostgresEventStore,
};

use crate::config::ApiConfig;

/// Realtime message broadcasted via SSE.
#[derive(Debug, Clone, Serialize)]
pub struct RealtimeMessage {
    pub tenant_id: TenantId,
    pub topic: String,
    pub payload: JsonValue,
}

type MemStore = Arc<InMemoryEventStore>;
type MemBus = Arc<InMemoryEventBus<EventEnvelope<JsonValue>>>;

#[cfg(feature = "persistent")]
type PgStore = Arc<PostgresEventStore>;
#[cfg(feature = "persistent")]
type RedisBus = Arc<RedisPubSubEventBus>;

type Directory = OrganizationDirectoryProjection<
    Arc<InMemoryTenantStore<DivisionId, DivisionReadModel>>,
    Arc<InMemoryTenantStore<FinancerId, FinancerReadModel>>,
>;
type Batches = InvoiceGenerationProjection<Arc<InMemoryTenantStore<BatchId, BatchReadModel>>>;
type Invoices = InvoicesProjection<Arc<InMemoryTenantStore<InvoiceId, InvoiceReadModel>>>;
type DivisionBalances = DivisionBalancesProjection<Arc<InMemoryTenantStore<DivisionId, BalanceReadModel>>>;
type CreditBalances = CreditBalancesProjection<Arc<InMemoryTenantStore<FinancerId, BalanceReadModel>>>;

#[derive(Debug, Error)]
pub enum ServicesError {
    #[error(transparent)]
    Store(#[from] EventStoreError),

    #[cfg(feature = "persistent")]
    #[error(transparent)]
    Bus(#[from] RedisBusError),

    #[error("DATABASE_URL must be set when USE_PERSISTENT_STORES=true")]
    MissingDatabaseUrl,

    #[error("initial projection rebuild failed: {0}")]
    Projection(#[from] ProjectionError),

    #[error("failed to start background worker: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Generation pipeline over whichever store and bus the process runs with.
enum Backend {
    InMemory(Arc<InvoiceGenerationService<MemStore, MemBus>>),
    #[cfg(feature = "persistent")]
    Persistent(Arc<InvoiceGenerationService<PgStore, RedisBus>>),
}

/// Run `$body` with `$svc` bound to the backend's generation service.
macro_rules! with_service {
    ($backend:expr, |$svc:ident| $body:expr) => {
        match $backend {
            Backend::InMemory($svc) => $body,
            #[cfg(feature = "persistent")]
            Backend::Persistent($svc) => $body,
        }
    };
}

/// In-process read models, all fed through one `ProjectionSet`.
#[derive(Clone)]
struct ReadModels {
    directory: Arc<Directory>,
    batches: Arc<Batches>,
    invoices: Arc<Invoices>,
    division_balances: Arc<DivisionBalances>,
    credit_balances: Arc<CreditBalances>,
    set: Arc<ProjectionSet>,
}

impl ReadModels {
    fn new() -> Self {
        let directory = Arc::new(OrganizationDirectoryProjection::new(
            Arc::new(InMemoryTenantStore::new()),
            Arc::new(InMemoryTenantStore::new()),
        ));
        let batches = Arc::new(InvoiceGenerationProjection::new(Arc::new(InMemoryTenantStore::new())));
        let invoices = Arc::new(InvoicesProjection::new(Arc::new(InMemoryTenantStore::new())));
        let division_balances = Arc::new(DivisionBalancesProjection::new(Arc::new(InMemoryTenantStore::new())));
        let credit_balances = Arc::new(CreditBalancesProjection::new(Arc::new(InMemoryTenantStore::new())));
        let set = Arc::new(ProjectionSet::new(vec![
            directory.clone() as Arc<dyn Projection>,
            batches.clone(),
            invoices.clone(),
            division_balances.clone(),
            credit_balances.clone(),
        ]));
        Self { directory, batches, invoices, division_balances, credit_balances, set }
    }

    /// Rebuild one tenant from the store and let the number allocator catch
    /// up with the invoices it already issued.
    fn reseed<S: EventStore + ?Sized>(
        &self,
        store: &S,
        numbers: &InvoiceNumberAllocator,
        tenant_id: TenantId,
    ) -> Result<usize, ProjectionError> {
        let replayed = self.set.rebuild(store, tenant_id)?;
        for invoice in self.invoices.list(tenant_id, &InvoiceFilter::default()) {
            numbers.observe(tenant_id, invoice.invoice_type, &invoice.invoice_number);
        }
        Ok(replayed)
    }

    fn seed<S: EventStore + ?Sized>(&self, store: &S, numbers: &InvoiceNumberAllocator) -> Result<(), ProjectionError> {
        let tenants: HashSet<TenantId> = store
            .load_all(None)
            .map_err(|e| ProjectionError::Load(e.to_string()))?
            .iter()
            .map(|e| e.tenant_id)
            .collect();
        for tenant_id in tenants {
            self.reseed(store, numbers, tenant_id)?;
        }
        Ok(())
    }
}

pub struct AppServices {
    backend: Backend,
    read_models: ReadModels,
    numbers: Arc<InvoiceNumberAllocator>,
    jobs: Arc<InMemoryJobStore>,
    generation: GenerationJobConfig,
    realtime_tx: broadcast::Sender<RealtimeMessage>,
    projection_worker: Mutex<Option<WorkerHandle>>,
    executor: Mutex<Option<JobExecutorHandle>>,
}

pub async fn build_services(config: &ApiConfig) -> Result<AppServices, ServicesError> {
    if config.persistent {
        #[cfg(feature = "persistent")]
        {
            return build_persistent_services(config).await;
        }
        #[cfg(not(feature = "persistent"))]
        {
            tracing::warn!(
                "USE_PERSISTENT_STORES=true but persistent feature not enabled, falling back to in-memory"
            );
        }
    }

    build_in_memory_services(config)
}

fn build_in_memory_services(config: &ApiConfig) -> Result<AppServices, ServicesError> {
    let store: MemStore = Arc::new(InMemoryEventStore::new());
    let bus: MemBus = Arc::new(InMemoryEventBus::new());
    assemble(store, bus, config, Backend::InMemory)
}

#[cfg(feature = "persistent")]
async fn build_persistent_services(config: &ApiConfig) -> Result<AppServices, ServicesError> {
    let database_url = config.database_url.as_deref().ok_or(ServicesError::MissingDatabaseUrl)?;
    let store: PgStore = Arc::new(PostgresEventStore::connect(database_url).await?);
    let bus: RedisBus = Arc::new(RedisPubSubEventBus::new(&config.redis_url, DEFAULT_CHANNEL)?);
    tracing::info!(redis = %config.redis_url, "using postgres event store and redis bus");
    assemble(store, bus, config, Backend::Persistent)
}

/// Wire the generation service, read models, bus subscriber and job executor
/// around one store and bus.
fn assemble<S, B>(
    store: S,
    bus: B,
    config: &ApiConfig,
    wrap: impl FnOnce(Arc<InvoiceGenerationService<S, B>>) -> Backend,
) -> Result<AppServices, ServicesError>
where
    S: EventStore + 'static,
    B: EventBus<EventEnvelope<JsonValue>> + 'static,
{
    let numbers = Arc::new(InvoiceNumberAllocator::new());
    let dispatcher = Arc::new(CommandDispatcher::new(store, bus));
    let service = Arc::new(InvoiceGenerationService::new(dispatcher, numbers.clone(), system_clock()));

    let read_models = ReadModels::new();
    read_models.seed(service.dispatcher().store(), &numbers)?;

    // Realtime channel (SSE): lossy broadcast, tenant-filtered in handlers.
    let (realtime_tx, _realtime_rx) = broadcast::channel::<RealtimeMessage>(256);

    // Background subscriber: bus -> projections -> realtime.
    let projection_worker = {
        let set = read_models.set.clone();
        let realtime_tx = realtime_tx.clone();
        ProjectionWorker::spawn("projections", service.dispatcher().bus(), None, move |env: EventEnvelope<JsonValue>| {
            set.apply(&env)?;
            let _ = realtime_tx.send(RealtimeMessage {
                tenant_id: env.tenant_id(),
                topic: format!("{}.projection_updated", env.aggregate_type()),
                payload: serde_json::json!({
                    "kind": "projection_update",
                    "aggregate_type": env.aggregate_type(),
                    "aggregate_id": env.aggregate_id().to_string(),
                    "sequence_number": env.sequence_number(),
                }),
            });
            Ok::<(), ProjectionError>(())
        })?
    };

    let jobs = InMemoryJobStore::arc();
    let mut executor = JobExecutor::new(jobs.clone());
    register_generation_handlers(&mut executor, service.clone());
    {
        let (service, read_models, numbers) = (service.clone(), read_models.clone(), numbers.clone());
        executor.register_handler(PROJECTION_REBUILD, move |job| {
            match read_models.reseed(service.dispatcher().store(), &numbers, job.tenant_id) {
                Ok(replayed) => {
                    tracing::info!(tenant_id = %job.tenant_id, replayed, "projection rebuild job finished");
                    JobResult::Success
                }
                Err(e) => JobResult::Failure(e.to_string()),
            }
        });
    }
    let executor = executor.spawn(config.executor.clone())?;

    Ok(AppServices {
        backend: wrap(service),
        read_models,
        numbers,
        jobs,
        generation: config.generation,
        realtime_tx,
        projection_worker: Mutex::new(Some(projection_worker)),
        executor: Mutex::new(Some(executor)),
    })
}

impl AppServices {
    pub fn realtime_tx(&self) -> &broadcast::Sender<RealtimeMessage> {
        &self.realtime_tx
    }

    /// Dispatch a command and apply what it committed before returning, so
    /// the caller reads its own writes.
    pub fn dispatch<A>(
        &self,
        tenant_id: TenantId,
        aggregate_type: &str,
        command: A::Command,
        make_aggregate: impl FnOnce(TenantId, AggregateId) -> A,
    ) -> Result<Vec<StoredEvent>, DispatchError>
    where
        A: Aggregate<Error = DomainError>,
        A::Command: Command,
        A::Event: engage_events::Event + Serialize + DeserializeOwned,
    {
        let committed = with_service!(&self.backend, |svc| svc
            .dispatcher()
            .dispatch_targeted::<A>(tenant_id, aggregate_type, command, make_aggregate))?;

        // A gap here means another request is mid-flight on the same stream;
        // the bus subscriber applies both in order.
        for stored in &committed {
            let _ = self.read_models.set.apply(&stored.to_envelope());
        }
        Ok(committed)
    }

    pub fn load<A>(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
        make_aggregate: impl FnOnce(TenantId, AggregateId) -> A,
    ) -> Result<Option<A>, DispatchError>
    where
        A: Aggregate,
        A::Event: DeserializeOwned,
    {
        with_service!(&self.backend, |svc| svc.dispatcher().load::<A>(tenant_id, aggregate_id, make_aggregate))
    }

    pub fn allocate_number(&self, tenant_id: TenantId, invoice_type: InvoiceType, year: i32) -> DomainResult<InvoiceNumber> {
        self.numbers.next(tenant_id, invoice_type, year)
    }

    /// Book a payment on the ledgers; queued as a job when they reject it.
    pub fn record_payment(
        &self,
        tenant_id: TenantId,
        invoice: &Invoice,
        amount: i64,
    ) -> Result<PaymentPosting, JobStoreError> {
        with_service!(&self.backend, |svc| record_payment_or_defer(self.jobs.as_ref(), svc.as_ref(), tenant_id, invoice, amount))
    }

    pub fn start_monthly_run(
        &self,
        tenant_id: TenantId,
        month_year: &str,
        division_id: Option<DivisionId>,
    ) -> Result<MonthlyRunSummary, MonthlyRunError> {
        let jobs: Arc<dyn JobStore> = self.jobs.clone();
        let directory = self.read_models.directory.clone();
        with_service!(&self.backend, |svc| {
            MonthlyInvoiceRun::new(svc.clone(), jobs, directory, self.generation).start(tenant_id, month_year, division_id)
        })
    }

    /// Queue a rebuild of the tenant's read models from the event store.
    pub fn enqueue_rebuild(&self, tenant_id: TenantId) -> Result<JobId, JobStoreError> {
        let job = Job::new(tenant_id, JobKind::ProjectionRebuild, serde_json::json!({}))
            .with_unique_key(format!("{PROJECTION_REBUILD}:{tenant_id}"));
        self.jobs.enqueue(job)
    }

    pub fn jobs(&self) -> &Arc<InMemoryJobStore> {
        &self.jobs
    }

    pub fn projection_names(&self) -> Vec<&'static str> {
        self.read_models.set.names()
    }

    pub fn division_get(&self, tenant_id: TenantId, division_id: &DivisionId) -> Option<DivisionReadModel> {
        self.read_models.directory.division(tenant_id, division_id)
    }

    pub fn divisions_list(&self, tenant_id: TenantId) -> Vec<DivisionReadModel> {
        self.read_models.directory.divisions(tenant_id)
    }

    pub fn financer_get(&self, tenant_id: TenantId, financer_id: &FinancerId) -> Option<FinancerReadModel> {
        self.read_models.directory.financer(tenant_id, financer_id)
    }

    pub fn financers_list(&self, tenant_id: TenantId) -> Vec<FinancerReadModel> {
        self.read_models.directory.financers(tenant_id)
    }

    pub fn invoices_get(&self, tenant_id: TenantId, invoice_id: &InvoiceId) -> Option<InvoiceReadModel> {
        self.read_models.invoices.get(tenant_id, invoice_id)
    }

    pub fn invoices_list(&self, tenant_id: TenantId, filter: &InvoiceFilter) -> Vec<InvoiceReadModel> {
        self.read_models.invoices.list(tenant_id, filter)
    }

    pub fn batch_get(&self, tenant_id: TenantId, batch_id: &BatchId) -> Option<BatchReadModel> {
        self.read_models.batches.get(tenant_id, batch_id)
    }

    pub fn batches_list(&self, tenant_id: TenantId) -> Vec<BatchReadModel> {
        self.read_models.batches.list(tenant_id)
    }

    pub fn division_balance(&self, tenant_id: TenantId, division_id: &DivisionId) -> Option<BalanceReadModel> {
        self.read_models.division_balances.get(tenant_id, division_id)
    }

    pub fn credit_balance(&self, tenant_id: TenantId, financer_id: &FinancerId) -> Option<BalanceReadModel> {
        self.read_models.credit_balances.get(tenant_id, financer_id)
    }

    /// Stop the bus subscriber and the job executor, waiting for in-flight
    /// work. Idempotent.
    pub fn shutdown(&self) {
        if let Some(worker) = self.projection_worker.lock().ok().and_then(|mut w| w.take()) {
            worker.stop();
        }
        if let Some(executor) = self.executor.lock().ok().and_then(|mut e| e.take()) {
            executor.shutdown();
        }
        tracing::info!("background workers stopped");
    }
}

/// Build an SSE stream for a tenant (used by `/stream`).
pub fn tenant_sse_stream(
    services: Arc<AppServices>,
    tenant_id: TenantId,
) -> Sse<impl tokio_stream::Stream<Item = Result<SseEvent, Infallible>>> {
    let rx = services.realtime_tx().subscribe();
    let stream = BroadcastStream::new(rx).filter_map(move |msg| match msg {
        Ok(m) if m.tenant_id == tenant_id => {
            let data = serde_json::to_string(&m.payload).unwrap_or_else(|_| "{}".to_string());
            Some(Ok(SseEvent::default().event(m.topic).data(data)))
        }
        _ => None,
    });

    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}
