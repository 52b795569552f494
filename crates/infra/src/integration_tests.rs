//! End-to-end tests: organization commands → monthly run → generation jobs →
//! batch, invoice and balance read models.

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use chrono::{NaiveDate, Utc};
    use serde_json::Value as JsonValue;

    use engage_core::{TenantId, UserId, VatRate};
    use engage_events::{EventEnvelope, InMemoryEventBus};
    use engage_invoicing::{BatchId, BatchStatus, Invoice, InvoiceGeneration, InvoiceId, InvoiceStatus, InvoiceType};
    use engage_organizations::{
        CreateDivision, Division, DivisionCommand, DivisionId, EnrollBeneficiary, Financer, FinancerCommand,
        FinancerId, RegisterFinancer,
    };

    use crate::command_dispatcher::CommandDispatcher;
    use crate::event_store::{EventStore, InMemoryEventStore};
    use crate::invoicing::{
        GenerationError, GenerationJobConfig, InvoiceGenerationService, InvoiceNumberAllocator, MonthlyInvoiceRun,
        batch_invoice_id, register_generation_handlers, system_clock,
    };
    use crate::jobs::{InMemoryJobStore, JobExecutor, JobExecutorConfig, JobStore};
    use crate::projections::organizations::{DIVISION_AGGREGATE_TYPE, FINANCER_AGGREGATE_TYPE};
    use crate::projections::{
        BalanceReadModel, BatchReadModel, CreditBalancesProjection, DivisionBalancesProjection, DivisionReadModel,
        FinancerReadModel, InvoiceFilter, InvoiceGenerationProjection, InvoiceReadModel, InvoicesProjection,
        OrganizationDirectoryProjection, Projection, ProjectionSet,
    };
    use crate::read_model::InMemoryTenantStore;
    use crate::workers::ProjectionWorker;

    type Store = Arc<InMemoryEventStore>;
    type Bus = Arc<InMemoryEventBus<EventEnvelope<JsonValue>>>;
    type Directory = OrganizationDirectoryProjection<
        Arc<InMemoryTenantStore<DivisionId, DivisionReadModel>>,
        Arc<InMemoryTenantStore<FinancerId, FinancerReadModel>>,
    >;
    type Batches = InvoiceGenerationProjection<Arc<InMemoryTenantStore<BatchId, BatchReadModel>>>;
    type Invoices = InvoicesProjection<Arc<InMemoryTenantStore<InvoiceId, InvoiceReadModel>>>;
    type DivisionBalances = DivisionBalancesProjection<Arc<InMemoryTenantStore<DivisionId, BalanceReadModel>>>;
    type CreditBalances = CreditBalancesProjection<Arc<InMemoryTenantStore<FinancerId, BalanceReadModel>>>;

    const MONTH: &str = "2025-03";

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    struct Engine {
        tenant_id: TenantId,
        store: Store,
        bus: Bus,
        service: Arc<InvoiceGenerationService<Store, Bus>>,
        jobs: Arc<InMemoryJobStore>,
        executor: JobExecutor<Arc<InMemoryJobStore>>,
        directory: Arc<Directory>,
        batches: Arc<Batches>,
        invoices: Arc<Invoices>,
        division_balances: Arc<DivisionBalances>,
        credit_balances: Arc<CreditBalances>,
        projections: Arc<ProjectionSet>,
    }

    impl Engine {
        fn new() -> Self {
            let store: Store = Arc::new(InMemoryEventStore::new());
            let bus: Bus = Arc::new(InMemoryEventBus::new());
            let dispatcher = Arc::new(CommandDispatcher::new(store.clone(), bus.clone()));
            let service = Arc::new(InvoiceGenerationService::new(
                dispatcher,
                Arc::new(InvoiceNumberAllocator::new()),
                system_clock(),
            ));

            let jobs = InMemoryJobStore::arc();
            let mut executor = JobExecutor::new(jobs.clone());
            register_generation_handlers(&mut executor, service.clone());

            let directory = Arc::new(OrganizationDirectoryProjection::new(
                Arc::new(InMemoryTenantStore::new()),
                Arc::new(InMemoryTenantStore::new()),
            ));
            let batches = Arc::new(InvoiceGenerationProjection::new(Arc::new(InMemoryTenantStore::new())));
            let invoices = Arc::new(InvoicesProjection::new(Arc::new(InMemoryTenantStore::new())));
            let division_balances = Arc::new(DivisionBalancesProjection::new(Arc::new(InMemoryTenantStore::new())));
            let credit_balances = Arc::new(CreditBalancesProjection::new(Arc::new(InMemoryTenantStore::new())));
            let projections = Arc::new(ProjectionSet::new(vec![
                directory.clone() as Arc<dyn Projection>,
                batches.clone(),
                invoices.clone(),
                division_balances.clone(),
                credit_balances.clone(),
            ]));

            Self {
                tenant_id: TenantId::new(),
                store,
                bus,
                service,
                jobs,
                executor,
                directory,
                batches,
                invoices,
                division_balances,
                credit_balances,
                projections,
            }
        }

        fn refresh(&self) {
            self.projections.rebuild(&self.store, self.tenant_id).unwrap();
        }

        fn division(&self, core_package_price: i64) -> DivisionId {
            let division_id = DivisionId::generate();
            self.service
                .dispatcher()
                .dispatch_targeted(
                    self.tenant_id,
                    DIVISION_AGGREGATE_TYPE,
                    DivisionCommand::CreateDivision(CreateDivision {
                        tenant_id: self.tenant_id,
                        division_id,
                        name: "Benelux".into(),
                        country: Some("BE".into()),
                        currency: Some("EUR".into()),
                        vat_rate: Some(VatRate::percent(20)),
                        core_package_price: Some(core_package_price),
                        contract_start_date: Some(date(2024, 1, 1)),
                        occurred_at: Utc::now(),
                    }),
                    |_, id| Division::empty(DivisionId(id)),
                )
                .unwrap();
            division_id
        }

        fn financer(&self, division_id: DivisionId, beneficiaries: usize) -> FinancerId {
            let financer_id = FinancerId::generate();
            self.financer_command(FinancerCommand::RegisterFinancer(RegisterFinancer {
                tenant_id: self.tenant_id,
                financer_id,
                name: "Acme".into(),
                division_id: Some(division_id),
                contract_start_date: Some(date(2024, 6, 1)),
                core_package_price: None,
                occurred_at: Utc::now(),
            }));
            for _ in 0..beneficiaries {
                self.financer_command(FinancerCommand::EnrollBeneficiary(EnrollBeneficiary {
                    tenant_id: self.tenant_id,
                    financer_id,
                    user_id: UserId::new(),
                    from: date(2025, 1, 1),
                    occurred_at: Utc::now(),
                }));
            }
            financer_id
        }

        fn financer_command(&self, command: FinancerCommand) {
            self.service
                .dispatcher()
                .dispatch_targeted(self.tenant_id, FINANCER_AGGREGATE_TYPE, command, |_, id| {
                    Financer::empty(FinancerId(id))
                })
                .unwrap();
        }

        fn run(&self) -> crate::invoicing::MonthlyRunSummary {
            let run = MonthlyInvoiceRun::new(
                self.service.clone(),
                self.jobs.clone(),
                self.directory.clone(),
                GenerationJobConfig { max_attempts: 3, backoff: Duration::ZERO },
            );
            run.start(self.tenant_id, MONTH, None).unwrap()
        }

        fn invoice(&self, id: InvoiceId) -> Invoice {
            self.service
                .dispatcher()
                .load(self.tenant_id, id.0, |_, id| Invoice::empty(InvoiceId(id)))
                .unwrap()
                .unwrap()
        }
    }

    #[test]
    fn monthly_run_issues_one_invoice_per_recipient_and_completes_the_batch() {
        let engine = Engine::new();
        let division_id = engine.division(1_000);
        let financer_id = engine.financer(division_id, 2);
        engine.refresh();

        let summary = engine.run();
        assert_eq!((summary.divisions, summary.jobs_enqueued, summary.duplicates), (1, 2, 0));

        let ran = engine.executor.run_until_idle(Some(engine.tenant_id)).unwrap();
        assert_eq!(ran, 2);
        engine.refresh();

        let batch = engine.batches.get(engine.tenant_id, &summary.batch_id).unwrap();
        assert_eq!((batch.total, batch.completed, batch.failed, batch.skipped), (2, 2, 0, 0));
        assert_eq!(batch.status, BatchStatus::Completed);

        // 2 beneficiaries × 10.00, full month, 20% VAT.
        let financer_invoice = engine.invoices.get(engine.tenant_id, &batch_invoice_id(summary.batch_id, financer_id.0)).unwrap();
        assert_eq!(financer_invoice.invoice_type, InvoiceType::DivisionToFinancer);
        assert_eq!(financer_invoice.status, InvoiceStatus::Confirmed);
        assert_eq!((financer_invoice.subtotal_htva, financer_invoice.vat_amount, financer_invoice.total_ttc), (2_000, 400, 2_400));
        assert!(financer_invoice.invoice_number.as_str().starts_with("DIVISION_TO_FINANCER-2025-"));

        let division_invoice = engine.invoices.get(engine.tenant_id, &batch_invoice_id(summary.batch_id, division_id.0)).unwrap();
        assert_eq!(division_invoice.invoice_type, InvoiceType::HexekoToDivision);
        assert_eq!(division_invoice.status, InvoiceStatus::Draft);
        assert_eq!(division_invoice.total_ttc, 2_400);

        let division_balance = engine.division_balances.get(engine.tenant_id, &division_id).unwrap();
        assert_eq!((division_balance.invoice_count, division_balance.invoiced_total), (2, 4_800));
        let credit = engine.credit_balances.get(engine.tenant_id, &financer_id).unwrap();
        assert_eq!((credit.invoice_count, credit.balance), (1, 2_400));

        let stats = engine.jobs.stats(engine.tenant_id).unwrap();
        assert_eq!((stats.completed, stats.dead_lettered), (2, 0));
    }

    #[test]
    fn concurrent_workers_complete_every_recipient_without_failures() {
        let engine = Engine::new();
        let tenant_id = engine.tenant_id;
        let division_id = engine.division(1_000);
        for _ in 0..120 {
            engine.financer(division_id, 1);
        }
        engine.refresh();

        // One attempt per job: any lost write would dead-letter its recipient.
        let run = MonthlyInvoiceRun::new(
            engine.service.clone(),
            engine.jobs.clone(),
            engine.directory.clone(),
            GenerationJobConfig { max_attempts: 1, backoff: Duration::ZERO },
        );
        let summary = run.start(tenant_id, MONTH, None).unwrap();
        assert_eq!(summary.jobs_enqueued, 121);

        let handle = engine
            .executor
            .spawn(JobExecutorConfig::default().with_max_concurrent(4).with_poll_interval(Duration::from_millis(1)))
            .unwrap();

        let load_batch = || {
            engine
                .service
                .dispatcher()
                .load(tenant_id, summary.batch_id.0, |_, id| InvoiceGeneration::empty(BatchId(id)))
                .unwrap()
                .unwrap()
        };
        let deadline = Instant::now() + Duration::from_secs(30);
        while load_batch().status() != BatchStatus::Completed && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        handle.shutdown();

        let batch = load_batch();
        assert_eq!(batch.status(), BatchStatus::Completed);
        assert_eq!((batch.total(), batch.completed(), batch.failed(), batch.skipped()), (121, 121, 0, 0));
        let stats = engine.jobs.stats(tenant_id).unwrap();
        assert_eq!((stats.completed, stats.dead_lettered), (121, 0));

        engine.projections.rebuild(&engine.store, tenant_id).unwrap();
        assert_eq!(engine.invoices.list(tenant_id, &InvoiceFilter::default()).len(), 121);
        let division_balance = engine.division_balances.get(tenant_id, &division_id).unwrap();
        assert_eq!(division_balance.invoice_count, 121);
        let read_batch = engine.batches.get(tenant_id, &summary.batch_id).unwrap();
        assert_eq!((read_batch.completed, read_batch.status), (121, BatchStatus::Completed));
    }

    #[test]
    fn financer_outside_any_division_is_not_billed() {
        let engine = Engine::new();
        let financer_id = FinancerId::generate();
        engine.financer_command(FinancerCommand::RegisterFinancer(RegisterFinancer {
            tenant_id: engine.tenant_id,
            financer_id,
            name: "Loose Ends".into(),
            division_id: None,
            contract_start_date: Some(date(2024, 6, 1)),
            core_package_price: Some(1_000),
            occurred_at: Utc::now(),
        }));
        let batch_id = BatchId::generate();
        engine.service.start_batch(engine.tenant_id, batch_id, MONTH, 1, None).unwrap();

        let err = engine.service.generate_financer_invoice(engine.tenant_id, financer_id, MONTH, batch_id).unwrap_err();
        assert!(matches!(err, GenerationError::NotFound(_)));
        assert_eq!(err.to_string(), format!("division of financer {financer_id} not found"));
        assert!(err.is_permanent());
    }

    #[test]
    fn financer_without_beneficiaries_is_skipped_and_division_job_dead_letters() {
        let engine = Engine::new();
        let division_id = engine.division(1_000);
        engine.financer(division_id, 0);
        engine.refresh();

        let summary = engine.run();
        engine.executor.run_until_idle(Some(engine.tenant_id)).unwrap();
        engine.refresh();

        let batch = engine.batches.get(engine.tenant_id, &summary.batch_id).unwrap();
        assert_eq!((batch.completed, batch.failed, batch.skipped), (0, 1, 1));
        assert!(batch.is_completed());
        assert_eq!(batch.errors.len(), 1);
        assert_eq!(batch.errors[0].entity_id, division_id.0);
        assert_eq!(batch.errors[0].error, "Cannot generate division invoice without active beneficiaries.");

        let dead = engine.jobs.list_dead_letters(engine.tenant_id, 10).unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].job.attempt, 3);
        assert!(engine.invoices.list(engine.tenant_id, &InvoiceFilter::default()).is_empty());
    }

    #[test]
    fn second_run_for_the_same_month_skips_queued_recipients() {
        let engine = Engine::new();
        let division_id = engine.division(1_000);
        engine.financer(division_id, 1);
        engine.refresh();

        let first = engine.run();
        let second = engine.run();
        assert_eq!((second.jobs_enqueued, second.duplicates), (0, 2));

        engine.executor.run_until_idle(Some(engine.tenant_id)).unwrap();
        engine.refresh();

        let duplicate_batch = engine.batches.get(engine.tenant_id, &second.batch_id).unwrap();
        assert_eq!((duplicate_batch.skipped, duplicate_batch.status), (2, BatchStatus::Completed));
        let first_batch = engine.batches.get(engine.tenant_id, &first.batch_id).unwrap();
        assert_eq!(first_batch.completed, 2);
        assert_eq!(engine.invoices.list(engine.tenant_id, &InvoiceFilter::default()).len(), 2);
    }

    #[test]
    fn repeated_generation_for_a_batch_issues_a_single_invoice() {
        let engine = Engine::new();
        let division_id = engine.division(500);
        let financer_id = engine.financer(division_id, 3);
        let batch_id = BatchId::generate();
        engine.service.start_batch(engine.tenant_id, batch_id, MONTH, 1, None).unwrap();

        let first = engine.service.generate_financer_invoice(engine.tenant_id, financer_id, MONTH, batch_id).unwrap();
        let again = engine.service.generate_financer_invoice(engine.tenant_id, financer_id, MONTH, batch_id).unwrap();
        assert_eq!(first, again);

        engine.refresh();
        assert_eq!(engine.invoices.list(engine.tenant_id, &InvoiceFilter::default()).len(), 1);
        let credit = engine.credit_balances.get(engine.tenant_id, &financer_id).unwrap();
        assert_eq!((credit.invoice_count, credit.invoiced_total), (1, 1_800));
        let batch = engine.batches.get(engine.tenant_id, &batch_id).unwrap();
        assert_eq!((batch.completed, batch.status), (1, BatchStatus::Completed));
    }

    #[test]
    fn payment_reduces_both_ledgers() {
        let engine = Engine::new();
        let division_id = engine.division(1_000);
        let financer_id = engine.financer(division_id, 1);
        let batch_id = BatchId::generate();
        engine.service.start_batch(engine.tenant_id, batch_id, MONTH, 1, None).unwrap();
        let invoice_id = engine
            .service
            .generate_financer_invoice(engine.tenant_id, financer_id, MONTH, batch_id)
            .unwrap()
            .unwrap();

        let invoice = engine.invoice(invoice_id);
        engine.service.record_payment(engine.tenant_id, &invoice, 1_000).unwrap();
        engine.refresh();

        let credit = engine.credit_balances.get(engine.tenant_id, &financer_id).unwrap();
        assert_eq!((credit.invoiced_total, credit.paid_total, credit.balance), (1_200, 1_000, 200));
        let division = engine.division_balances.get(engine.tenant_id, &division_id).unwrap();
        assert_eq!(division.paid_total, 1_000);
    }

    #[test]
    fn read_models_are_tenant_isolated() {
        let engine = Engine::new();
        let division_id = engine.division(1_000);
        engine.financer(division_id, 1);
        engine.refresh();
        engine.run();
        engine.executor.run_until_idle(None).unwrap();
        engine.refresh();

        let other = TenantId::new();
        engine.projections.rebuild(&engine.store, other).unwrap();
        assert!(engine.invoices.list(other, &InvoiceFilter::default()).is_empty());
        assert!(engine.batches.list(other).is_empty());
        assert!(engine.directory.divisions(other).is_empty());
        assert_eq!(engine.invoices.list(engine.tenant_id, &InvoiceFilter::default()).len(), 2);
        assert_eq!(engine.store.load_all(Some(other)).unwrap().len(), 0);
    }

    #[test]
    fn bus_worker_keeps_read_models_current() {
        let engine = Engine::new();
        let projections = engine.projections.clone();
        let worker = ProjectionWorker::spawn("projections", &engine.bus, Some(engine.tenant_id), move |env: EventEnvelope<JsonValue>| {
            projections.apply(&env)
        })
        .unwrap();

        let division_id = engine.division(1_000);
        let deadline = Instant::now() + Duration::from_secs(2);
        while engine.directory.division(engine.tenant_id, &division_id).is_none() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        worker.stop();

        let division = engine.directory.division(engine.tenant_id, &division_id).unwrap();
        assert_eq!(division.core_package_price, Some(1_000));

        // A rebuild after live delivery converges on the same rows.
        engine.refresh();
        assert_eq!(engine.directory.division(engine.tenant_id, &division_id), Some(division));
    }
}
