//! Queue and Hub Test Suite
//!
//! Conformance tests for asynchronous queues and broadcast hubs.
//!
//! Test Coverage:
//! - back-pressured offers park until space opens
//! - dropping and sliding overflow policies
//! - hubs deliver every publish to every subscriber, in order
//! - sliding hubs evict the oldest item for lagging subscribers
//! - shutdown wakes parked waiters with interruption

use filament::{Effect, Exit, Hub, Queue, Runtime, RuntimeConfig};

fn runtime() -> Runtime {
    RuntimeConfig::new().worker_threads(2).build()
}

/// An offer to a full back-pressured queue parks, then completes once a
/// take opens space; FIFO order is preserved across the handoff.
#[test]
fn backpressured_offer_completes_after_take() {
    let rt = runtime();
    let program = Queue::<u32>::bounded(1).flat_map(|queue| {
        let q = queue.clone();
        queue.offer(1).flat_map(move |_| {
            let taker = q.clone();
            q.offer(2).fork().flat_map(move |offerer| {
                let second_take = taker.clone();
                taker.take().flat_map(move |first| {
                    offerer.join().flat_map(move |accepted| {
                        second_take
                            .take()
                            .map(move |second| (first, accepted, second))
                    })
                })
            })
        })
    });
    assert_eq!(rt.run(program), Exit::Success((1, true, 2)));
}

/// A full dropping queue rejects new items and keeps the old ones.
#[test]
fn dropping_queue_rejects_overflow() {
    let rt = runtime();
    let program = Queue::<u32>::dropping(2).flat_map(|queue| {
        let q = queue.clone();
        queue
            .offer_all(vec![1, 2])
            .flat_map(move |_| {
                let drain = q.clone();
                q.offer(3)
                    .flat_map(move |accepted| drain.take_all().map(move |items| (accepted, items)))
            })
    });
    assert_eq!(rt.run(program), Exit::Success((false, vec![1, 2])));
}

/// A full sliding queue accepts new items by evicting the oldest.
#[test]
fn sliding_queue_evicts_oldest() {
    let rt = runtime();
    let program = Queue::<u32>::sliding(2).flat_map(|queue| {
        let q = queue.clone();
        queue.offer_all(vec![1, 2, 3]).flat_map(move |accepted| {
            q.take_all().map(move |items| (accepted, items))
        })
    });
    assert_eq!(rt.run(program), Exit::Success((true, vec![2, 3])));
}

/// Every subscriber sees every publish made after it subscribed, in
/// publish order; earlier publishes are not replayed.
#[test]
fn hub_delivers_to_every_subscriber_in_order() {
    let rt = runtime();
    let program = Hub::<u32>::unbounded().flat_map(|hub| {
        let h = hub.clone();
        hub.publish(0).flat_map(move |_| {
            let publisher = h.clone();
            h.subscribe().flat_map(move |first_sub| {
                let second = publisher.clone();
                publisher.subscribe().flat_map(move |second_sub| {
                    second
                        .publish_all(vec![1, 2, 3])
                        .flat_map(move |_| {
                            let b = second_sub.clone();
                            first_sub
                                .take_all()
                                .flat_map(move |seen_a| b.take_all().map(move |seen_b| (seen_a, seen_b)))
                        })
                })
            })
        })
    });
    assert_eq!(
        rt.run(program),
        Exit::Success((vec![1, 2, 3], vec![1, 2, 3]))
    );
}

/// A sliding hub past its bound evicts the oldest item; a lagging
/// subscriber skips what was evicted and resumes at the new head, so
/// the buffer is empty once it catches up.
#[test]
fn sliding_hub_drops_oldest_for_laggards() {
    let rt = runtime();
    let program = Hub::<u32>::sliding(2).flat_map(|hub| {
        let publisher = hub.clone();
        let sizer = hub.clone();
        hub.subscribe().flat_map(move |laggard| {
            publisher
                .publish_all(vec![1, 2, 3])
                .flat_map(move |accepted| {
                    laggard.take_all().flat_map(move |seen| {
                        sizer.size().map(move |left| (accepted, seen.clone(), left))
                    })
                })
        })
    });
    assert_eq!(rt.run(program), Exit::Success((true, vec![2, 3], 0)));
}

/// Shutting a queue down wakes a parked taker with interruption.
#[test]
fn shutdown_wakes_parked_taker() {
    let rt = runtime();
    let program = Queue::<u32>::bounded(1).flat_map(|queue| {
        let q = queue.clone();
        queue.take().fork().flat_map(move |taker| {
            q.shutdown()
                .flat_map(move |()| taker.await_exit())
                .map(|exit| exit.is_interrupted())
        })
    });
    assert_eq!(rt.run(program), Exit::Success(true));
}
