//! Channel conformance: FIFO delivery, backpressure boundaries, capacity
//! policies, close semantics, and receiver fairness.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use weft::channel::{channel, Capacity, ChannelBuilder, RecvError, SendError};
use weft::test_utils::{init_test_logging, run_test, test_runtime};
use weft::time::{sleep, yield_now};
use weft::{Error, Time};

#[test]
fn bounded_fifo_with_suspending_producer() {
    run_test(|cx| async move {
        let (tx, rx) = channel::<u32>(Capacity::Bounded(2));

        let producer = {
            let tx = tx.clone();
            cx.launch(move |cx| async move {
                for i in 0..5 {
                    tx.send(&cx, i).await.map_err(Error::from)?;
                }
                Ok(())
            })
        };

        // Give the producer the driver until it blocks.
        for _ in 0..8 {
            yield_now(&cx).await?;
        }
        // Exactly at capacity: two buffered, the third send suspended.
        assert_eq!(tx.len(), 2);
        assert!(!producer.is_finished());

        let mut received = Vec::new();
        for _ in 0..5 {
            received.push(rx.recv(&cx).await.map_err(Error::from)?);
        }
        assert_eq!(received, vec![0, 1, 2, 3, 4]);
        producer.wait(&cx).await?;
        Ok(())
    });
}

#[test]
fn rendezvous_couples_sender_and_receiver() {
    run_test(|cx| async move {
        let (tx, rx) = channel::<&'static str>(Capacity::Rendezvous);

        let producer = {
            let tx = tx.clone();
            cx.launch(move |cx| async move {
                tx.send(&cx, "hello").await.map_err(Error::from)?;
                Ok(())
            })
        };

        // The producer cannot complete before a receiver shows up.
        for _ in 0..4 {
            yield_now(&cx).await?;
        }
        assert!(!producer.is_finished());
        assert!(tx.is_empty());

        assert_eq!(rx.recv(&cx).await.map_err(Error::from)?, "hello");
        producer.wait(&cx).await?;
        Ok(())
    });
}

#[test]
fn conflated_receiver_sees_only_the_latest() {
    run_test(|cx| async move {
        let (tx, rx) = channel::<u32>(Capacity::Conflated);
        for value in [1, 2, 3] {
            tx.send(&cx, value).await.map_err(Error::from)?;
        }
        assert_eq!(rx.recv(&cx).await.map_err(Error::from)?, 3);
        Ok(())
    });
}

#[test]
fn waiting_receivers_are_served_fifo() {
    run_test(|cx| async move {
        let (tx, rx) = channel::<u32>(Capacity::Rendezvous);

        let first = {
            let rx = rx.clone();
            cx.launch(move |cx| async move { rx.recv(&cx).await.map_err(Error::from) })
        };
        // Let the first receiver queue before the second.
        yield_now(&cx).await?;
        let second = {
            let rx = rx.clone();
            cx.launch(move |cx| async move { rx.recv(&cx).await.map_err(Error::from) })
        };
        yield_now(&cx).await?;

        tx.send(&cx, 10).await.map_err(Error::from)?;
        tx.send(&cx, 20).await.map_err(Error::from)?;

        // Arrival order decides delivery order: round-robin fairness.
        assert_eq!(first.wait(&cx).await?, 10);
        assert_eq!(second.wait(&cx).await?, 20);
        Ok(())
    });
}

#[test]
fn close_fails_waiting_senders_and_hands_back_the_value() {
    run_test(|cx| async move {
        let (tx, rx) = channel::<u32>(Capacity::Rendezvous);

        let producer = {
            let tx = tx.clone();
            cx.launch(move |cx| async move {
                match tx.send(&cx, 9).await {
                    Err(SendError::Closed(Some(9))) => Ok(()),
                    other => Err(Error::user(format!("unexpected send result: {other:?}"))),
                }
            })
        };

        // Let the sender queue, then close underneath it.
        for _ in 0..4 {
            yield_now(&cx).await?;
        }
        rx.close();
        producer.wait(&cx).await?;
        Ok(())
    });
}

#[test]
fn close_wakes_waiting_receivers_with_end_of_stream() {
    run_test(|cx| async move {
        let (tx, rx) = channel::<u32>(Capacity::Bounded(1));

        let consumer = {
            let rx = rx.clone();
            cx.launch(move |cx| async move {
                match rx.recv(&cx).await {
                    Err(RecvError::Closed) => Ok(()),
                    other => Err(Error::user(format!("unexpected recv result: {other:?}"))),
                }
            })
        };

        for _ in 0..4 {
            yield_now(&cx).await?;
        }
        tx.close();
        consumer.wait(&cx).await?;
        Ok(())
    });
}

#[test]
fn buffered_values_survive_close_until_drained() {
    run_test(|cx| async move {
        let (tx, rx) = channel::<u32>(Capacity::Bounded(4));
        tx.send(&cx, 1).await.map_err(Error::from)?;
        tx.send(&cx, 2).await.map_err(Error::from)?;
        tx.close();

        assert_eq!(rx.recv(&cx).await.map_err(Error::from)?, 1);
        assert_eq!(rx.recv(&cx).await.map_err(Error::from)?, 2);
        assert!(matches!(rx.recv(&cx).await, Err(RecvError::Closed)));
        Ok(())
    });
}

#[test]
fn discard_hook_covers_in_flight_values_at_close() {
    let discarded = Arc::new(AtomicU32::new(0));
    let observer = Arc::clone(&discarded);

    run_test(move |cx| async move {
        let sink = Arc::clone(&observer);
        let (tx, rx) = ChannelBuilder::<u32>::new(Capacity::Rendezvous)
            .on_undelivered(move |value| {
                sink.fetch_add(value, Ordering::SeqCst);
            })
            .build();

        let producer = {
            let tx = tx.clone();
            cx.launch(move |cx| async move {
                match tx.send(&cx, 11).await {
                    // The hook consumed the value; nothing comes back.
                    Err(SendError::Closed(None)) => Ok(()),
                    other => Err(Error::user(format!("unexpected send result: {other:?}"))),
                }
            })
        };

        for _ in 0..4 {
            yield_now(&cx).await?;
        }
        rx.close();
        producer.wait(&cx).await?;
        Ok(())
    });

    assert_eq!(discarded.load(Ordering::SeqCst), 11);
}

#[test]
fn cancelled_receive_withdraws_from_the_wait_queue() {
    init_test_logging();
    let rt = test_runtime();
    rt.block_on(|cx| async move {
        let (tx, rx) = channel::<u32>(Capacity::Rendezvous);

        let consumer = {
            let rx = rx.clone();
            cx.launch(move |cx| async move {
                match rx.recv(&cx).await {
                    Err(RecvError::Cancelled(_)) => Ok(()),
                    other => Err(Error::user(format!("unexpected recv result: {other:?}"))),
                }
            })
        };

        for _ in 0..4 {
            yield_now(&cx).await?;
        }
        consumer.cancel(weft::CancelReason::user("abort the read"));
        // The body saw `RecvError::Cancelled` and returned cleanly, but the
        // task itself still terminates as cancelled.
        let outcome = consumer.join(&cx).await?;
        assert!(outcome.is_cancelled());

        // The queue is clean: a later send meets a later receive normally.
        let late = {
            let rx = rx.clone();
            cx.launch(move |cx| async move { rx.recv(&cx).await.map_err(Error::from) })
        };
        yield_now(&cx).await?;
        tx.send(&cx, 5).await.map_err(Error::from)?;
        assert_eq!(late.wait(&cx).await?, 5);
        Ok(())
    })
    .unwrap();
}

#[test]
fn producer_paces_a_slow_consumer_through_backpressure() {
    init_test_logging();
    let rt = test_runtime();
    rt.block_on(|cx| async move {
        let (tx, rx) = channel::<u32>(Capacity::Bounded(1));

        let producer = {
            let tx = tx.clone();
            cx.launch(move |cx| async move {
                for i in 0..4 {
                    tx.send(&cx, i).await.map_err(Error::from)?;
                }
                Ok(())
            })
        };

        let consumer = cx.launch(move |cx| async move {
            let mut seen = Vec::new();
            for _ in 0..4 {
                sleep(&cx, Duration::from_millis(100)).await?;
                seen.push(rx.recv(&cx).await.map_err(Error::from)?);
            }
            Ok(seen)
        });

        producer.wait(&cx).await?;
        assert_eq!(consumer.wait(&cx).await?, vec![0, 1, 2, 3]);
        Ok(())
    })
    .unwrap();
    // Four consumer cycles of 100ms dominate; the producer only ever waits.
    assert_eq!(rt.now(), Time::from_millis(400));
}
