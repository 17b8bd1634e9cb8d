//! Pool lifecycle across worker teams and kernel shutdown.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::Ordering;
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::Duration;

use ferrule_kernel::resource::{BoundedPool, Consumer, FnSource, PoolConfig, ResourcePool};
use ferrule_kernel::{telemetry, FunctionSpec, Kernel, ResourceError, ResourceSpec, Scope};

const WAIT: Duration = Duration::from_secs(5);

#[test]
fn test_worker_threads_notified_once_each_at_shutdown() {
    telemetry::init_for_tests();

    let notified: Arc<Mutex<HashMap<ThreadId, usize>>> = Arc::default();
    let touched: Arc<Mutex<HashSet<ThreadId>>> = Arc::default();

    let listener = {
        let notified = notified.clone();
        Arc::new(move |thread: ThreadId| {
            *notified.lock().unwrap().entry(thread).or_default() += 1;
        })
    };
    let source = FnSource::new("sessions", || Ok(String::from("session"))).with_listener(listener);
    let pool = BoundedPool::new(
        Arc::new(source),
        PoolConfig {
            thread_affinity: true,
            ..PoolConfig::default()
        },
    );

    let mut builder = Kernel::builder();
    builder.worker_team_sized("workers", 4);
    let session = builder.resource(ResourceSpec::pooled("session", Scope::Invocation, Arc::new(pool.clone())));
    {
        let touched = touched.clone();
        builder.function(
            FunctionSpec::stateless("sessions", "touch", move |_| {
                touched.lock().unwrap().insert(thread::current().id());
                thread::sleep(Duration::from_millis(2));
                Ok(())
            })
            .team("workers")
            .depend(session),
        );
    }
    let kernel = builder.link().unwrap();

    let handles: Vec<_> = (0..32).map(|_| kernel.invoke("touch", None).unwrap()).collect();
    for handle in handles {
        assert!(handle.wait(WAIT).unwrap().is_success());
    }
    assert_eq!(pool.on_loan(), 0);
    assert!(notified.lock().unwrap().is_empty(), "no notification before threads exit");

    kernel.shutdown();

    let touched = touched.lock().unwrap().clone();
    let notified = notified.lock().unwrap().clone();
    assert!(!touched.is_empty());
    assert_eq!(notified.keys().copied().collect::<HashSet<_>>(), touched);
    assert!(notified.values().all(|&count| count == 1), "{notified:?}");
    assert_eq!(pool.stats().thread_exits.load(Ordering::SeqCst), touched.len() as u64);
}

#[test]
fn test_shutdown_drains_pools() {
    let pool = BoundedPool::new(
        Arc::new(FnSource::new("sessions", || Ok(0u32))),
        PoolConfig::default(),
    );
    let mut builder = Kernel::builder();
    let session = builder.resource(ResourceSpec::pooled("session", Scope::Request, Arc::new(pool.clone())));
    builder.function(FunctionSpec::stateless("sessions", "use", |_| Ok(())).depend(session));
    let kernel = builder.link().unwrap();

    assert!(kernel.invoke("use", None).unwrap().wait(WAIT).unwrap().is_success());
    assert_eq!(pool.on_loan(), 0, "request scope released at request end");

    kernel.shutdown();
    assert!(kernel.is_shut_down());

    let (tx, rx) = mpsc::channel();
    pool.borrow(Consumer::new(move |result| {
        let _ = tx.send(result.map(|_| ()));
    }));
    assert_eq!(
        rx.recv_timeout(WAIT).unwrap(),
        Err(ResourceError::Drained("sessions".to_string()))
    );
}

#[test]
fn test_failed_resolution_escalates() {
    let pool = BoundedPool::new(
        Arc::new(FnSource::new("flaky", || -> anyhow::Result<u32> {
            anyhow::bail!("connection refused")
        })),
        PoolConfig::default(),
    );
    let mut builder = Kernel::builder();
    let conn = builder.resource(ResourceSpec::pooled("conn", Scope::Invocation, Arc::new(pool.clone())));
    builder.function(FunctionSpec::stateless("sessions", "use", |_| Ok(())).depend(conn));
    let kernel = builder.link().unwrap();

    let outcome = kernel.invoke("use", None).unwrap().wait(WAIT).unwrap();
    let failure = outcome.failure.expect("resolution failure");
    assert_eq!(failure.class(), ferrule_kernel::FailureClass::RESOLUTION);
    assert_eq!(pool.size(), 0);
    kernel.shutdown();
}
