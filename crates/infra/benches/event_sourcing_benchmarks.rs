use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use chrono::{NaiveDate, Utc};
use engage_core::{AggregateId, ExpectedVersion, TenantId, UserId, VatRate};
use engage_events::{EventEnvelope, InMemoryEventBus};
use engage_infra::command_dispatcher::CommandDispatcher;
use engage_infra::event_store::{EventStore, InMemoryEventStore, UncommittedEvent};
use engage_infra::invoicing::{InvoiceGenerationService, InvoiceNumberAllocator, system_clock};
use engage_infra::projections::organizations::{DIVISION_AGGREGATE_TYPE, FINANCER_AGGREGATE_TYPE};
use engage_infra::projections::{
    DivisionReadModel, FinancerReadModel, OrganizationDirectoryProjection, Projection,
};
use engage_infra::read_model::InMemoryTenantStore;
use engage_invoicing::BatchId;
use engage_organizations::{
    BeneficiaryEnrolled, CreateDivision, Division, DivisionCommand, DivisionId, EnrollBeneficiary, Financer,
    FinancerCommand, FinancerEvent, FinancerId, FinancerRegistered, RegisterFinancer,
};
use std::sync::Arc;

type Store = Arc<InMemoryEventStore>;
type Bus = Arc<InMemoryEventBus<EventEnvelope<serde_json::Value>>>;

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn setup() -> (Arc<CommandDispatcher<Store, Bus>>, TenantId) {
    let dispatcher = CommandDispatcher::new(Arc::new(InMemoryEventStore::new()), Arc::new(InMemoryEventBus::new()));
    (Arc::new(dispatcher), TenantId::new())
}

fn create_division(dispatcher: &CommandDispatcher<Store, Bus>, tenant_id: TenantId) -> DivisionId {
    let division_id = DivisionId::generate();
    dispatcher
        .dispatch_targeted(
            tenant_id,
            DIVISION_AGGREGATE_TYPE,
            DivisionCommand::CreateDivision(CreateDivision {
                tenant_id,
                division_id,
                name: "Benelux".into(),
                country: Some("BE".into()),
                currency: None,
                vat_rate: Some(VatRate::percent(21)),
                core_package_price: Some(1_500),
                contract_start_date: Some(date(2024, 1, 1)),
                occurred_at: Utc::now(),
            }),
            |_, id| Division::empty(DivisionId(id)),
        )
        .unwrap();
    division_id
}

fn financer_with_beneficiaries(
    dispatcher: &CommandDispatcher<Store, Bus>,
    tenant_id: TenantId,
    division_id: DivisionId,
    beneficiaries: usize,
) -> FinancerId {
    let financer_id = FinancerId::generate();
    let dispatch = |command: FinancerCommand| {
        dispatcher
            .dispatch_targeted(tenant_id, FINANCER_AGGREGATE_TYPE, command, |_, id| Financer::empty(FinancerId(id)))
            .unwrap();
    };
    dispatch(FinancerCommand::RegisterFinancer(RegisterFinancer {
        tenant_id,
        financer_id,
        name: "Acme".into(),
        division_id: Some(division_id),
        contract_start_date: Some(date(2024, 9, 15)),
        core_package_price: None,
        occurred_at: Utc::now(),
    }));
    for _ in 0..beneficiaries {
        dispatch(FinancerCommand::EnrollBeneficiary(EnrollBeneficiary {
            tenant_id,
            financer_id,
            user_id: UserId::new(),
            from: date(2025, 1, 1),
            occurred_at: Utc::now(),
        }));
    }
    financer_id
}

fn bench_command_execution_latency(c: &mut Criterion) {
    let mut group = c.benchmark_group("command_execution_latency");

    group.bench_function("register_financer_fresh", |b| {
        let (dispatcher, tenant_id) = setup();
        let division_id = create_division(&dispatcher, tenant_id);
        b.iter(|| black_box(financer_with_beneficiaries(&dispatcher, tenant_id, division_id, 0)));
    });

    // Each enrollment replays the stream, so latency grows with history.
    group.bench_function("enroll_beneficiary_with_history", |b| {
        let (dispatcher, tenant_id) = setup();
        let division_id = create_division(&dispatcher, tenant_id);
        let financer_id = financer_with_beneficiaries(&dispatcher, tenant_id, division_id, 50);

        b.iter(|| {
            dispatcher
                .dispatch_targeted(
                    tenant_id,
                    FINANCER_AGGREGATE_TYPE,
                    FinancerCommand::EnrollBeneficiary(EnrollBeneficiary {
                        tenant_id,
                        financer_id,
                        user_id: UserId::new(),
                        from: black_box(date(2025, 2, 1)),
                        occurred_at: Utc::now(),
                    }),
                    |_, id| Financer::empty(FinancerId(id)),
                )
                .unwrap();
        });
    });

    group.finish();
}

fn bench_financer_invoice_generation(c: &mut Criterion) {
    let mut group = c.benchmark_group("financer_invoice_generation");

    for beneficiaries in [1usize, 50, 500] {
        group.bench_with_input(BenchmarkId::new("generate", beneficiaries), &beneficiaries, |b, &count| {
            let (dispatcher, tenant_id) = setup();
            let division_id = create_division(&dispatcher, tenant_id);
            let financer_id = financer_with_beneficiaries(&dispatcher, tenant_id, division_id, count);
            let service =
                InvoiceGenerationService::new(dispatcher, Arc::new(InvoiceNumberAllocator::new()), system_clock());

            b.iter(|| {
                let batch_id = BatchId::generate();
                service.start_batch(tenant_id, batch_id, "2025-03", 1, None).unwrap();
                black_box(service.generate_financer_invoice(tenant_id, financer_id, "2025-03", batch_id).unwrap());
            });
        });
    }

    group.finish();
}

fn bench_event_append_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("event_append_throughput");

    for batch_size in [1usize, 10, 100, 1000] {
        group.throughput(Throughput::Elements(batch_size as u64));
        group.bench_with_input(BenchmarkId::new("batch_append", batch_size), &batch_size, |b, &size| {
            let store = InMemoryEventStore::new();
            let tenant_id = TenantId::new();
            let financer_id = FinancerId::generate();

            b.iter(|| {
                let events: Vec<UncommittedEvent> = (0..size)
                    .map(|_| {
                        let event = FinancerEvent::BeneficiaryEnrolled(BeneficiaryEnrolled {
                            tenant_id,
                            financer_id,
                            user_id: UserId::new(),
                            from: date(2025, 1, 1),
                            occurred_at: Utc::now(),
                        });
                        UncommittedEvent::from_typed(
                            tenant_id,
                            financer_id.0,
                            FINANCER_AGGREGATE_TYPE,
                            uuid::Uuid::now_v7(),
                            &event,
                        )
                        .unwrap()
                    })
                    .collect();

                black_box(store.append(events, ExpectedVersion::Any).unwrap());
            });
        });
    }

    group.finish();
}

fn bench_projection_rebuild_speed(c: &mut Criterion) {
    let mut group = c.benchmark_group("projection_rebuild_speed");

    for event_count in [10u64, 100, 1000, 10000] {
        group.bench_with_input(BenchmarkId::new("rebuild_directory", event_count), &event_count, |b, &count| {
            let store = InMemoryEventStore::new();
            let tenant_id = TenantId::new();
            let financer_id = FinancerId::generate();
            let aggregate_id: AggregateId = financer_id.0;

            let mut envelopes = Vec::new();
            for seq in 0..count {
                let event = if seq == 0 {
                    FinancerEvent::FinancerRegistered(FinancerRegistered {
                        tenant_id,
                        financer_id,
                        name: "Acme".into(),
                        division_id: None,
                        contract_start_date: None,
                        core_package_price: Some(900),
                        occurred_at: Utc::now(),
                    })
                } else {
                    FinancerEvent::BeneficiaryEnrolled(BeneficiaryEnrolled {
                        tenant_id,
                        financer_id,
                        user_id: UserId::new(),
                        from: date(2025, 1, 1),
                        occurred_at: Utc::now(),
                    })
                };
                let uncommitted = UncommittedEvent::from_typed(
                    tenant_id,
                    aggregate_id,
                    FINANCER_AGGREGATE_TYPE,
                    uuid::Uuid::now_v7(),
                    &event,
                )
                .unwrap();
                let stored = store.append(vec![uncommitted], ExpectedVersion::Exact(seq)).unwrap();
                envelopes.push(stored[0].to_envelope());
            }

            let divisions: Arc<InMemoryTenantStore<DivisionId, DivisionReadModel>> = Arc::new(InMemoryTenantStore::new());
            let financers: Arc<InMemoryTenantStore<FinancerId, FinancerReadModel>> = Arc::new(InMemoryTenantStore::new());
            let projection = OrganizationDirectoryProjection::new(divisions, financers);

            b.iter(|| {
                projection.rebuild_from_scratch(tenant_id, black_box(&envelopes)).unwrap();
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_command_execution_latency,
    bench_financer_invoice_generation,
    bench_event_append_throughput,
    bench_projection_rebuild_speed
);
criterion_main!(benches);
