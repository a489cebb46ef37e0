//! Task lifecycle conformance: launch, wait, join, and completion gating.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use weft::test_utils::{init_test_logging, run_test, test_runtime};
use weft::time::sleep;
use weft::{Error, ErrorKind, Outcome, SpawnOptions, Time};

fn explode() -> Result<(), Error> {
    panic!("blew up")
}

#[test]
fn wait_returns_the_value_exactly_once() {
    let value = run_test(|cx| async move {
        let child = cx.launch(|_cx| async { Ok(40 + 2) });
        child.wait(&cx).await
    });
    assert_eq!(value, 42);
}

#[test]
fn wait_reraises_a_failure() {
    run_test(|cx| async move {
        let supervisor = cx.launch_with(SpawnOptions::new().supervisor(), |cx| async move {
            let child = cx.launch(|_cx| async { Err::<u32, _>(Error::user("boom")) });
            match child.wait(&cx).await {
                Err(err) => {
                    assert_eq!(err.kind(), ErrorKind::User);
                    Ok(())
                }
                Ok(_) => Err(Error::user("expected the child's failure to re-raise")),
            }
        });
        supervisor.wait(&cx).await
    });
}

#[test]
fn wait_reraises_a_panic() {
    run_test(|cx| async move {
        let supervisor = cx.launch_with(SpawnOptions::new().supervisor(), |cx| async move {
            let child = cx.launch(|_cx| async { explode() });
            match child.wait(&cx).await {
                Err(err) => {
                    assert_eq!(err.kind(), ErrorKind::Panicked);
                    assert!(err.message().unwrap_or_default().contains("blew up"));
                    Ok(())
                }
                Ok(()) => Err(Error::user("expected the child's panic to re-raise")),
            }
        });
        supervisor.wait(&cx).await
    });
}

#[test]
fn join_never_raises_but_exposes_the_cause() {
    run_test(|cx| async move {
        let supervisor = cx.launch_with(SpawnOptions::new().supervisor(), |cx| async move {
            let child = cx.launch(|_cx| async { Err::<u32, _>(Error::user("boom")) });
            let outcome = child.join(&cx).await?;
            assert!(outcome.is_err());
            // Joining again is fine; the summary is stable.
            let again = child.join(&cx).await?;
            assert_eq!(again.severity(), outcome.severity());
            Ok(())
        });
        supervisor.wait(&cx).await
    });
}

#[test]
fn parent_completes_only_after_all_children() {
    init_test_logging();
    let rt = test_runtime();
    let delays = [30u64, 5, 80, 45, 10];
    let started = Arc::new(AtomicU32::new(0));
    let observer = Arc::clone(&started);

    rt.block_on(move |cx| async move {
        for delay in delays {
            let started = Arc::clone(&observer);
            cx.launch(move |cx| async move {
                started.fetch_add(1, Ordering::SeqCst);
                sleep(&cx, Duration::from_millis(delay)).await?;
                Ok(())
            });
        }
        // The body returns immediately; completion still waits for every
        // child.
        Ok(())
    })
    .unwrap();

    assert_eq!(started.load(Ordering::SeqCst), delays.len() as u32);
    // Completion time is the slowest child's delay, not the body's (zero).
    assert_eq!(rt.now(), Time::from_millis(80));
}

#[test]
fn children_run_concurrently_not_sequentially() {
    init_test_logging();
    let rt = test_runtime();
    rt.block_on(|cx| async move {
        for _ in 0..4 {
            cx.launch(|cx| async move {
                sleep(&cx, Duration::from_millis(100)).await?;
                Ok(())
            });
        }
        Ok(())
    })
    .unwrap();
    // Four concurrent 100ms sleeps take 100ms, not 400ms.
    assert_eq!(rt.now(), Time::from_millis(100));
}

#[test]
fn grandchildren_gate_the_grandparent() {
    init_test_logging();
    let rt = test_runtime();
    rt.block_on(|cx| async move {
        cx.launch(|cx| async move {
            cx.launch(|cx| async move {
                sleep(&cx, Duration::from_millis(60)).await?;
                Ok(())
            });
            // Middle task finishes its body immediately.
            Ok(())
        });
        Ok(())
    })
    .unwrap();
    assert_eq!(rt.now(), Time::from_millis(60));
}

#[test]
fn program_order_holds_within_each_task() {
    let order = run_test(|cx| async move {
        let log: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
        let first = {
            let log = Arc::clone(&log);
            cx.launch(move |cx| async move {
                log.lock().unwrap().push("a1");
                weft::time::yield_now(&cx).await?;
                log.lock().unwrap().push("a2");
                Ok(())
            })
        };
        let second = {
            let log = Arc::clone(&log);
            cx.launch(move |cx| async move {
                log.lock().unwrap().push("b1");
                weft::time::yield_now(&cx).await?;
                log.lock().unwrap().push("b2");
                Ok(())
            })
        };
        first.wait(&cx).await?;
        second.wait(&cx).await?;
        let snapshot = log.lock().unwrap().clone();
        Ok(snapshot)
    });
    let pos = |tag: &str| order.iter().position(|x| *x == tag).unwrap();
    assert!(pos("a1") < pos("a2"));
    assert!(pos("b1") < pos("b2"));
}

#[test]
fn handle_summary_matches_result() {
    run_test(|cx| async move {
        let child = cx.launch(|_cx| async { Ok(5u32) });
        child.join(&cx).await?;
        assert!(child.is_finished());
        assert!(matches!(child.outcome_summary(), Some(Outcome::Ok(()))));
        Ok(())
    });
}

#[test]
fn offloaded_blocking_work_resumes_the_task() {
    let value = run_test(|cx| async move {
        let doubled = cx
            .run_blocking(|| {
                std::thread::sleep(Duration::from_millis(20));
                21 * 2
            })
            .await?;
        Ok(doubled)
    });
    assert_eq!(value, 42);
}

#[test]
fn offloaded_compute_panic_surfaces_as_error() {
    run_test(|cx| async move {
        let result: Result<u32, Error> = cx.run_compute(|| panic!("bad math")).await;
        match result {
            Err(err) => {
                assert_eq!(err.kind(), ErrorKind::Panicked);
                Ok(())
            }
            Ok(_) => Err(Error::user("expected the offload panic to surface")),
        }
    });
}

#[test]
fn scope_outcome_reflects_clean_close() {
    init_test_logging();
    let rt = test_runtime();
    let outcome = rt.block_on(|_cx| async { Ok(()) });
    assert!(outcome.is_ok());
    assert_eq!(rt.metrics().tasks_live, 0);
}
