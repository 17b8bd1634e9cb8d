//! Flow tests: sequential chains, parallel instigation, joins and callbacks.

use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use ferrule_kernel::resource::{Consumer, Resource, ResourceSource};
use ferrule_kernel::{
    duty, telemetry, AsyncCompletion, Failure, FailureClass, FlowHandle, FlowOutcome, FunctionSpec, Kernel,
    KernelBuilder, KernelFailure, ResourceSpec, Scope, Strategy, Value,
};

const WAIT: Duration = Duration::from_secs(5);

fn value<T: Any + Send + Sync>(v: T) -> Value {
    Arc::new(v)
}

#[derive(Default, Clone)]
struct Log(Arc<Mutex<Vec<String>>>);

impl Log {
    fn push(&self, entry: &str) {
        self.0.lock().unwrap().push(entry.to_string());
    }

    fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

/// Delivers from another thread after a short delay.
struct SlowSource;

impl ResourceSource for SlowSource {
    fn name(&self) -> &str {
        "slow"
    }

    fn produce(&self, consumer: Consumer<Resource>) {
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            consumer.deliver(Resource::new(7u8));
        });
    }
}

fn logging(log: &Log, module: &str, name: &'static str) -> FunctionSpec {
    let log = log.clone();
    FunctionSpec::stateless(module, name, move |_| {
        log.push(name);
        Ok(())
    })
}

fn builder_with_workers() -> KernelBuilder {
    let mut builder = Kernel::builder();
    builder.worker_team_sized("workers", 2);
    builder
}

#[test]
fn test_sequential_chain_order_survives_suspension() {
    telemetry::init_for_tests();
    let log = Log::default();

    let mut builder = builder_with_workers();
    let slow = builder.resource(ResourceSpec::source("slow", Scope::Invocation, Arc::new(SlowSource)));
    builder
        .function(logging(&log, "chain", "first").team("workers").next("second"))
        .function(
            logging(&log, "chain", "second")
                .team("workers")
                .depend(slow)
                .next("third"),
        )
        .function(logging(&log, "chain", "third").team("workers"));
    let kernel = builder.link().unwrap();

    let outcome = kernel.invoke("first", None).unwrap().wait(WAIT).unwrap();
    assert!(outcome.is_success());
    assert_eq!(log.entries(), vec!["first", "second", "third"]);
    kernel.shutdown();
}

#[test]
fn test_sequential_instigation_runs_before_post_duty() {
    let log = Log::default();
    let post_log = log.clone();

    let mut builder = builder_with_workers();
    builder
        .function(
            FunctionSpec::stateless("chain", "parent", {
                let log = log.clone();
                move |ctx| {
                    log.push("parent");
                    ctx.instigate(0, None, None)?;
                    Ok(())
                }
            })
            .team("workers")
            .flow("child", Strategy::Sequential)
            .post_duty(
                "after",
                duty(move |_| {
                    post_log.push("parent-post");
                    Ok(())
                }),
                &[],
            ),
        )
        .function(logging(&log, "chain", "child").team("workers"));
    let kernel = builder.link().unwrap();

    assert!(kernel.invoke("parent", None).unwrap().wait(WAIT).unwrap().is_success());
    assert_eq!(log.entries(), vec!["parent", "child", "parent-post"]);
    kernel.shutdown();
}

#[test]
fn test_asynchronous_body_completion() {
    let log = Log::default();
    let mut builder = builder_with_workers();
    builder
        .function(
            FunctionSpec::stateless("chain", "fetch", |ctx| {
                if let Some(completion) = ctx.set_incomplete() {
                    thread::spawn(move || {
                        thread::sleep(Duration::from_millis(10));
                        completion.complete_with(Arc::new(5u32));
                    });
                }
                Ok(())
            })
            .team("workers")
            .next("use"),
        )
        .function({
            let log = log.clone();
            FunctionSpec::stateless("chain", "use", move |ctx| {
                log.push(&format!("got:{}", ctx.parameter_as::<u32>().copied().unwrap_or(0)));
                Ok(())
            })
        });
    let kernel = builder.link().unwrap();

    assert!(kernel.invoke("fetch", None).unwrap().wait(WAIT).unwrap().is_success());
    assert_eq!(log.entries(), vec!["got:5"]);
    kernel.shutdown();
}

#[test]
fn test_join_waits_for_parallel_flow() {
    let log = Log::default();
    let post_log = log.clone();

    let mut builder = builder_with_workers();
    builder
        .function(
            FunctionSpec::stateless("fan", "parent", |ctx| {
                let handle = ctx
                    .instigate(0, None, None)?
                    .into_handle()
                    .ok_or_else(|| Failure::msg(FailureClass::USAGE, "expected a parallel flow"))?;
                ctx.join(&handle, WAIT, None)
            })
            .team("workers")
            .flow("child", Strategy::Parallel)
            .post_duty(
                "after",
                duty(move |_| {
                    post_log.push("parent-post");
                    Ok(())
                }),
                &[],
            ),
        )
        .function({
            let log = log.clone();
            FunctionSpec::stateless("fan", "child", move |_| {
                thread::sleep(Duration::from_millis(30));
                log.push("child");
                Ok(())
            })
            .team("workers")
        });
    let kernel = builder.link().unwrap();

    assert!(kernel.invoke("parent", None).unwrap().wait(WAIT).unwrap().is_success());
    assert_eq!(log.entries(), vec!["child", "parent-post"]);
    kernel.shutdown();
}

#[test]
fn test_join_timeout_fires_once_with_token() {
    telemetry::init_for_tests();
    let stalled: Arc<Mutex<Option<AsyncCompletion>>> = Arc::default();
    let handled = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = mpsc::channel::<Option<String>>();
    let tx = Mutex::new(tx);

    let mut builder = builder_with_workers();
    builder
        .function(
            FunctionSpec::stateless("fan", "parent", |ctx| {
                let handle = ctx
                    .instigate(0, None, None)?
                    .into_handle()
                    .ok_or_else(|| Failure::msg(FailureClass::USAGE, "expected a parallel flow"))?;
                ctx.join(&handle, Duration::from_millis(100), Some(value("tok")))
            })
            .team("workers")
            .flow("stuck", Strategy::Parallel)
            .escalate(FailureClass::JOIN_TIMEOUT, "on_timeout"),
        )
        .function({
            let stalled = stalled.clone();
            FunctionSpec::stateless("fan", "stuck", move |ctx| {
                *stalled.lock().unwrap() = ctx.set_incomplete();
                Ok(())
            })
            .team("workers")
        })
        .function({
            let handled = handled.clone();
            FunctionSpec::stateless("fan", "on_timeout", move |ctx| {
                handled.fetch_add(1, Ordering::SeqCst);
                let token = ctx
                    .parameter_as::<Failure>()
                    .and_then(|f| f.kernel_failure())
                    .and_then(|k| k.join_token())
                    .and_then(|t| t.downcast_ref::<&str>())
                    .map(|t| t.to_string());
                let _ = tx.lock().unwrap().send(token);
                Ok(())
            })
            .parameter::<Failure>()
        });
    let kernel = builder.link().unwrap();

    let started = Instant::now();
    let handle = kernel.invoke("parent", None).unwrap();
    let token = rx.recv_timeout(WAIT).unwrap();
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert_eq!(token.as_deref(), Some("tok"));

    // Let the stalled flow finish so the request can end.
    let completion = stalled.lock().unwrap().take().unwrap();
    completion.complete();
    let outcome = handle.wait(WAIT).unwrap();
    assert!(outcome.is_success(), "timeout was handled: {:?}", outcome.failure);
    assert_eq!(handled.load(Ordering::SeqCst), 1);
    kernel.shutdown();
}

#[test]
fn test_parallel_failure_goes_to_callback() {
    let (tx, rx) = mpsc::channel::<FlowOutcome>();
    let tx = Mutex::new(tx);

    let mut builder = builder_with_workers();
    builder
        .function(
            FunctionSpec::stateless("fan", "parent", move |ctx| {
                let tx = tx.lock().unwrap().clone();
                ctx.instigate(
                    0,
                    None,
                    Some(Box::new(move |outcome: FlowOutcome| {
                        let _ = tx.send(outcome);
                    })),
                )?;
                Ok(())
            })
            .flow("boom", Strategy::Parallel),
        )
        .function(
            FunctionSpec::stateless("fan", "boom", |_| Err(Failure::application(anyhow::anyhow!("boom"))))
                .team("workers"),
        );
    let kernel = builder.link().unwrap();

    let outcome = kernel.invoke("parent", None).unwrap().wait(WAIT).unwrap();
    assert!(outcome.is_success(), "callback handles the failure");
    let flow = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(flow.failure().map(|f| f.class()), Some(FailureClass::APPLICATION));
    kernel.shutdown();
}

#[test]
fn test_parallel_failure_without_callback_reaches_process() {
    let mut builder = builder_with_workers();
    builder
        .function(
            FunctionSpec::stateless("fan", "parent", |ctx| {
                ctx.instigate(0, None, None)?;
                Ok(())
            })
            .flow("boom", Strategy::Parallel),
        )
        .function(
            FunctionSpec::stateless("fan", "boom", |_| Err(Failure::application(anyhow::anyhow!("boom"))))
                .team("workers"),
        );
    let kernel = builder.link().unwrap();

    let outcome = kernel.invoke("parent", None).unwrap().wait(WAIT).unwrap();
    let failure = outcome.failure.expect("unhandled parallel failure");
    assert_eq!(failure.class(), FailureClass::APPLICATION);
    kernel.shutdown();
}

#[test]
fn test_second_join_of_same_flow_escalates_as_usage() {
    let log = Log::default();
    let mut builder = builder_with_workers();
    builder
        .function(
            FunctionSpec::stateless("fan", "parent", |ctx| {
                let handle = ctx
                    .instigate(0, None, None)?
                    .into_handle()
                    .ok_or_else(|| Failure::msg(FailureClass::USAGE, "expected a parallel flow"))?;
                ctx.join(&handle, WAIT, None)?;
                ctx.join(&handle, WAIT, None)
            })
            .team("workers")
            .flow("child", Strategy::Parallel)
            .escalate(FailureClass::USAGE, "on_usage"),
        )
        .function({
            let log = log.clone();
            FunctionSpec::stateless("fan", "child", move |_| {
                thread::sleep(Duration::from_millis(20));
                log.push("child");
                Ok(())
            })
            .team("workers")
        })
        .function({
            let log = log.clone();
            FunctionSpec::stateless("fan", "on_usage", move |ctx| {
                let duplicate = ctx
                    .parameter_as::<Failure>()
                    .and_then(|f| f.kernel_failure())
                    .is_some_and(|k| matches!(k, KernelFailure::DuplicateJoin { .. }));
                log.push(if duplicate { "duplicate-join" } else { "other" });
                Ok(())
            })
            .parameter::<Failure>()
        });
    let kernel = builder.link().unwrap();

    let outcome = kernel.invoke("parent", None).unwrap().wait(WAIT).unwrap();
    assert!(outcome.is_success(), "usage failure was handled: {:?}", outcome.failure);
    let mut entries = log.entries();
    entries.sort();
    assert_eq!(entries, vec!["child", "duplicate-join"]);
    kernel.shutdown();
}

#[test]
fn test_joining_own_flow_is_rejected() {
    // Passive jobs queue behind the running one, so the child starts only
    // after the parent has published its handle.
    let shared: Arc<Mutex<Option<FlowHandle>>> = Arc::default();
    let mut builder = Kernel::builder();
    builder
        .function({
            let shared = shared.clone();
            FunctionSpec::stateless("fan", "parent", move |ctx| {
                *shared.lock().unwrap() = ctx.instigate(0, None, None)?.into_handle();
                Ok(())
            })
            .flow("child", Strategy::Parallel)
        })
        .function({
            let shared = shared.clone();
            FunctionSpec::stateless("fan", "child", move |ctx| {
                let own = shared
                    .lock()
                    .unwrap()
                    .clone()
                    .ok_or_else(|| Failure::msg(FailureClass::APPLICATION, "handle not published"))?;
                ctx.join(&own, WAIT, None)
            })
        });
    let kernel = builder.link().unwrap();

    let outcome = kernel.invoke("parent", None).unwrap().wait(WAIT).unwrap();
    let failure = outcome.failure.expect("self join is unhandled");
    assert_eq!(failure.class(), FailureClass::USAGE);
    assert!(matches!(failure.kernel_failure(), Some(KernelFailure::SelfJoin { .. })));
    kernel.shutdown();
}

#[test]
fn test_instigate_by_target_name() {
    let received = Arc::new(Mutex::new(Vec::new()));
    let mut builder = Kernel::builder();
    builder
        .function(FunctionSpec::stateless("chain", "dispatch", |ctx| {
            let missing = ctx
                .instigate_named("nowhere", Strategy::Sequential, None, None)
                .unwrap_err();
            if missing.class() != FailureClass::USAGE {
                return Err(missing);
            }
            ctx.instigate_named("record", Strategy::Sequential, Some(value(3u32)), None)?;
            Ok(())
        }))
        .function({
            let received = received.clone();
            FunctionSpec::stateless("chain", "record", move |ctx| {
                received.lock().unwrap().extend(ctx.parameter_as::<u32>().copied());
                Ok(())
            })
            .parameter::<u32>()
        });
    let kernel = builder.link().unwrap();

    assert!(kernel.invoke("dispatch", None).unwrap().wait(WAIT).unwrap().is_success());
    assert_eq!(*received.lock().unwrap(), vec![3]);
    kernel.shutdown();
}

