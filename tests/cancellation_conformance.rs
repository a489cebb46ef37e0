//! Cancellation conformance: idempotence, propagation rules, supervision,
//! masked cleanup, and timeouts.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use weft::test_utils::{init_test_logging, run_test, test_runtime};
use weft::time::{sleep, timeout};
use weft::{CancelKind, CancelReason, Error, ErrorKind, SpawnOptions, Time};

#[test]
fn cancel_is_idempotent() {
    run_test(|cx| async move {
        let child = cx.launch(|cx| async move {
            sleep(&cx, Duration::from_secs(3600)).await?;
            Ok(())
        });
        child.cancel(CancelReason::user("stop"));
        child.cancel(CancelReason::user("stop"));
        let outcome = child.join(&cx).await?;
        assert!(outcome.is_cancelled());
        // A cancel after the terminal state is a no-op.
        child.cancel(CancelReason::user("late"));
        assert!(child.join(&cx).await?.is_cancelled());
        Ok(())
    });
}

#[test]
fn cancelled_child_does_not_disturb_siblings_or_parent() {
    init_test_logging();
    let rt = test_runtime();
    let sibling_done = Arc::new(AtomicBool::new(false));
    let observer = Arc::clone(&sibling_done);

    rt.block_on(move |cx| async move {
        let doomed = cx.launch(|cx| async move {
            sleep(&cx, Duration::from_secs(3600)).await?;
            Ok(())
        });
        let flag = Arc::clone(&observer);
        let sibling = cx.launch(move |cx| async move {
            sleep(&cx, Duration::from_millis(50)).await?;
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });

        doomed.cancel(CancelReason::user("not needed"));
        let outcome = doomed.join(&cx).await?;
        assert!(outcome.is_cancelled());

        sibling.wait(&cx).await?;
        Ok(())
    })
    .unwrap();

    assert!(sibling_done.load(Ordering::SeqCst));
    // The hour-long sleep was abandoned, not served.
    assert_eq!(rt.now(), Time::from_millis(50));
}

#[test]
fn failure_cancels_siblings_under_a_linked_parent() {
    init_test_logging();
    let rt = test_runtime();
    rt.block_on(|cx| async move {
        let supervisor = cx.launch_with(SpawnOptions::new().supervisor(), |cx| async move {
            let linked = cx.launch(|cx| async move {
                cx.launch(|_cx| async { Err::<(), _>(Error::user("boom")) });
                cx.launch(|cx| async move {
                    sleep(&cx, Duration::from_secs(3600)).await?;
                    Ok(())
                });
                sleep(&cx, Duration::from_secs(3600)).await?;
                Ok(())
            });
            let outcome = linked.join(&cx).await?;
            // The child's failure surfaced at the linked parent.
            assert!(outcome.is_err());
            Ok(())
        });
        supervisor.wait(&cx).await
    })
    .unwrap();
    // The sibling's hour-long sleep was cancelled, not awaited.
    assert!(rt.now() < Time::from_secs(1));
}

#[test]
fn supervisor_isolates_a_failing_child() {
    init_test_logging();
    let rt = test_runtime();
    let sibling_done = Arc::new(AtomicBool::new(false));
    let observer = Arc::clone(&sibling_done);

    rt.block_on(move |cx| async move {
        let supervisor = cx.launch_with(SpawnOptions::new().supervisor(), move |cx| async move {
            let failing = cx.launch(|_cx| async { Err::<(), _>(Error::user("boom")) });
            let flag = Arc::clone(&observer);
            let sibling = cx.launch(move |cx| async move {
                sleep(&cx, Duration::from_millis(40)).await?;
                flag.store(true, Ordering::SeqCst);
                Ok(())
            });

            assert!(failing.join(&cx).await?.is_err());
            sibling.wait(&cx).await?;
            Ok(())
        });
        supervisor.wait(&cx).await
    })
    .unwrap();

    assert!(sibling_done.load(Ordering::SeqCst));
}

#[test]
fn cancelling_a_parent_cancels_the_whole_subtree() {
    run_test(|cx| async move {
        let parent = cx.launch(|cx| async move {
            for _ in 0..3 {
                cx.launch(|cx| async move {
                    sleep(&cx, Duration::from_secs(3600)).await?;
                    Ok(())
                });
            }
            sleep(&cx, Duration::from_secs(3600)).await?;
            Ok(())
        });

        // Let the subtree spawn before cancelling it.
        weft::time::yield_now(&cx).await?;
        parent.cancel(CancelReason::user("shutdown"));
        let outcome = parent.join(&cx).await?;
        assert!(outcome.is_cancelled());
        Ok(())
    });
}

#[test]
fn cancel_before_first_poll_never_runs_the_body() {
    let ran = run_test(|cx| async move {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let child = cx.launch(move |_cx| async move {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });
        child.cancel(CancelReason::user("too late"));
        let outcome = child.join(&cx).await?;
        assert!(outcome.is_cancelled());
        Ok(ran.load(Ordering::SeqCst))
    });
    assert!(!ran);
}

#[test]
fn masked_cleanup_may_still_suspend() {
    init_test_logging();
    let rt = test_runtime();
    let cleaned = Arc::new(AtomicBool::new(false));
    let observer = Arc::clone(&cleaned);

    rt.block_on(move |cx| async move {
        let flag = Arc::clone(&observer);
        let child = cx.launch(move |cx| async move {
            match sleep(&cx, Duration::from_secs(3600)).await {
                Ok(()) => Ok(()),
                Err(err) => {
                    // Finalization that itself suspends runs under the mask
                    // as if the task were still live.
                    cx.shielded(sleep(&cx, Duration::from_millis(25))).await?;
                    flag.store(true, Ordering::SeqCst);
                    Err(err)
                }
            }
        });

        sleep(&cx, Duration::from_millis(10)).await?;
        child.cancel(CancelReason::user("stop"));
        let outcome = child.join(&cx).await?;
        assert!(outcome.is_cancelled());
        Ok(())
    })
    .unwrap();

    assert!(cleaned.load(Ordering::SeqCst));
    // 10ms until cancel, then the shielded 25ms finalizer ran in full.
    assert_eq!(rt.now(), Time::from_millis(35));
}

#[test]
fn checkpoint_is_the_cooperative_cancellation_point() {
    run_test(|cx| async move {
        let spins = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&spins);
        let child: weft::TaskHandle<()> = cx.launch(move |cx| async move {
            loop {
                cx.checkpoint()?;
                counter.fetch_add(1, Ordering::SeqCst);
                weft::time::yield_now(&cx).await?;
            }
        });

        // Share the driver with the spinning child for a few rounds; a
        // sleep would never fire here because the spinner keeps the
        // virtual clock from advancing.
        for _ in 0..10 {
            weft::time::yield_now(&cx).await?;
        }
        child.cancel(CancelReason::user("enough"));
        let outcome = child.join(&cx).await?;
        assert!(outcome.is_cancelled());
        assert!(spins.load(Ordering::SeqCst) > 0);
        Ok(())
    });
}

#[test]
fn timeout_is_cancellation_racing_completion() {
    init_test_logging();
    let rt = test_runtime();
    rt.block_on(|cx| async move {
        // Deadline loses: the fast branch completes first.
        let fast = timeout(&cx, Duration::from_millis(500), async { 1u32 }).await;
        assert_eq!(fast.unwrap(), 1);

        // Deadline wins: the slow branch is dropped at the decision point.
        let slow = timeout(&cx, Duration::from_millis(20), sleep(&cx, Duration::from_secs(3600)))
            .await;
        match slow {
            Err(err) => assert_eq!(err.kind(), ErrorKind::DeadlineExceeded),
            Ok(_) => return Err(Error::user("slow branch beat its deadline")),
        }
        Ok(())
    })
    .unwrap();
    assert_eq!(rt.now(), Time::from_millis(20));
}

#[test]
fn cancellation_reason_strengthens_monotonically() {
    run_test(|cx| async move {
        let child = cx.launch(|cx| async move {
            sleep(&cx, Duration::from_secs(3600)).await?;
            Ok(())
        });
        // Let the child reach its suspension point; cancelling it while
        // still unstarted would finish it with the first reason alone.
        weft::time::yield_now(&cx).await?;
        child.cancel(CancelReason::user("first"));
        child.cancel(CancelReason::shutdown());
        child.cancel(CancelReason::timeout());
        let outcome = child.join(&cx).await?;
        match outcome.cancel_reason() {
            Some(reason) => assert_eq!(reason.kind(), CancelKind::Shutdown),
            None => return Err(Error::user("expected a cancelled outcome")),
        }
        Ok(())
    });
}
