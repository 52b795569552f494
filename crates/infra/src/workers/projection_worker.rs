use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use engage_core::TenantId;
use engage_events::{EventBus, Subscription, TenantScoped};

const TICK: Duration = Duration::from_millis(250);

/// Stop flag and join handle of a running worker.
#[derive(Debug)]
pub struct WorkerHandle {
    stop: Arc<AtomicBool>,
    join: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    /// Ask the worker to stop and wait for it. Takes at most one tick.
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.join.as_ref().is_some_and(|j| !j.is_finished())
    }
}

/// Drains a bus subscription on its own thread.
///
/// The handler must be idempotent: the bus delivers at least once.
#[derive(Debug)]
pub struct ProjectionWorker;

impl ProjectionWorker {
    /// `tenant_id` restricts the worker to one tenant's messages.
    pub fn spawn<M, B, H, E>(
        name: &'static str,
        bus: &B,
        tenant_id: Option<TenantId>,
        mut handler: H,
    ) -> io::Result<WorkerHandle>
    where
        M: TenantScoped + Send + 'static,
        B: EventBus<M>,
        H: FnMut(M) -> Result<(), E> + Send + 'static,
        E: core::fmt::Debug + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let subscription: Subscription<M> = bus.subscribe();

        let flag = stop.clone();
        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || drain(name, &subscription, &flag, tenant_id, &mut handler))?;

        Ok(WorkerHandle { stop, join: Some(join) })
    }
}

fn drain<M, H, E>(
    name: &'static str,
    subscription: &Subscription<M>,
    stop: &AtomicBool,
    tenant_id: Option<TenantId>,
    handler: &mut H,
) where
    M: TenantScoped,
    H: FnMut(M) -> Result<(), E>,
    E: core::fmt::Debug,
{
    while !stop.load(Ordering::SeqCst) {
        match subscription.recv_timeout(TICK) {
            Ok(msg) => {
                if tenant_id.is_some_and(|t| msg.tenant_id() != t) {
                    continue;
                }
                if let Err(err) = handler(msg) {
                    warn!(worker = name, error = ?err, "projection worker handler failed");
                }
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!(worker = name, "projection worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Instant;

    use engage_core::AggregateId;
    use engage_events::{EventEnvelope, InMemoryEventBus};
    use uuid::Uuid;

    fn envelope(tenant_id: TenantId) -> EventEnvelope<u32> {
        EventEnvelope::new(Uuid::now_v7(), tenant_id, AggregateId::new(), "test", 1, 7)
    }

    #[test]
    fn applies_only_the_filtered_tenant_and_stops() {
        let bus = InMemoryEventBus::new();
        let tenant = TenantId::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        let handle = ProjectionWorker::spawn("test-worker", &bus, Some(tenant), move |env: EventEnvelope<u32>| {
            sink.lock().unwrap().push(env.tenant_id());
            Ok::<_, ()>(())
        })
        .unwrap();

        bus.publish(envelope(TenantId::new())).unwrap();
        bus.publish(envelope(tenant)).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while seen.lock().unwrap().is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(handle.is_running());
        handle.stop();

        assert_eq!(*seen.lock().unwrap(), vec![tenant]);
    }
}
