//! Asynchronous queues and the broadcast [`Hub`].
//!
//! A [`Queue`] hands each offered item to exactly one taker. Waiting fibers
//! (takers on an empty queue, offerers blocked by back-pressure) park in
//! FIFO lists and are woken in order. Shutting the queue down wakes every
//! waiter with an interruption, and every later operation resolves the same
//! way immediately.

mod hub;

pub use hub::{Hub, Subscription};

use crate::cause::Cause;
use crate::effect::value::{Data, Never};
use crate::effect::{AsyncCallback, Effect};
use crate::exit::Exit;
use crate::fiber::FiberId;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// What a full bounded queue does with one more offer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Strategy {
    /// Park the offerer until space frees up.
    BackPressure,
    /// Drop the oldest buffered item; the offer always succeeds.
    Sliding,
    /// Reject the offered item; the offer reports `false`.
    Dropping,
    /// No capacity bound at all.
    Unbounded,
}

struct Putter<A> {
    key: u64,
    value: A,
    callback: AsyncCallback<bool, Never>,
}

struct Taker<A> {
    key: u64,
    callback: AsyncCallback<A, Never>,
}

struct Inner<A> {
    items: VecDeque<A>,
    capacity: usize,
    strategy: Strategy,
    takers: VecDeque<Taker<A>>,
    putters: VecDeque<Putter<A>>,
    next_key: u64,
    is_shut_down: bool,
}

impl<A> Inner<A> {
    fn next_key(&mut self) -> u64 {
        self.next_key += 1;
        self.next_key
    }

    fn has_space(&self) -> bool {
        self.strategy == Strategy::Unbounded || self.items.len() < self.capacity
    }

    /// Moves blocked offers into freed space, oldest first.
    fn admit_putters(&mut self) -> Vec<AsyncCallback<bool, Never>> {
        let mut admitted = Vec::new();
        while self.has_space() {
            let Some(putter) = self.putters.pop_front() else {
                break;
            };
            self.items.push_back(putter.value);
            admitted.push(putter.callback);
        }
        admitted
    }
}

fn terminal<T: Data>() -> Exit<T, Never> {
    Exit::Failure(Cause::interrupt(FiberId::None))
}

/// An asynchronous queue delivering each item to exactly one taker.
pub struct Queue<A> {
    inner: Arc<Mutex<Inner<A>>>,
}

impl<A> Clone for Queue<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A> std::fmt::Debug for Queue<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Queue")
            .field("size", &inner.items.len())
            .field("strategy", &inner.strategy)
            .field("shut_down", &inner.is_shut_down)
            .finish()
    }
}

impl<A: Data> Queue<A> {
    fn with_strategy(capacity: usize, strategy: Strategy) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                items: VecDeque::new(),
                capacity,
                strategy,
                takers: VecDeque::new(),
                putters: VecDeque::new(),
                next_key: 0,
                is_shut_down: false,
            })),
        }
    }

    /// A bounded queue that parks offerers while full.
    #[must_use]
    pub fn bounded(capacity: usize) -> Effect<Queue<A>, Never> {
        let capacity = capacity.max(1);
        Effect::sync(move || Self::with_strategy(capacity, Strategy::BackPressure))
    }

    /// A bounded queue that drops its oldest item to admit a new one.
    #[must_use]
    pub fn sliding(capacity: usize) -> Effect<Queue<A>, Never> {
        let capacity = capacity.max(1);
        Effect::sync(move || Self::with_strategy(capacity, Strategy::Sliding))
    }

    /// A bounded queue that rejects offers while full.
    #[must_use]
    pub fn dropping(capacity: usize) -> Effect<Queue<A>, Never> {
        let capacity = capacity.max(1);
        Effect::sync(move || Self::with_strategy(capacity, Strategy::Dropping))
    }

    /// A queue with no capacity bound; offers never park or fail.
    #[must_use]
    pub fn unbounded() -> Effect<Queue<A>, Never> {
        Effect::sync(|| Self::with_strategy(usize::MAX, Strategy::Unbounded))
    }

    /// Offers one item. Resolves `true` once the item is accepted, `false`
    /// if a dropping queue rejected it; parks on a full back-pressure
    /// queue until space frees up.
    #[must_use]
    pub fn offer(&self, value: A) -> Effect<bool, Never> {
        let inner = Arc::clone(&self.inner);
        Effect::async_(move |callback| {
            let mut guard = inner.lock();
            if guard.is_shut_down {
                drop(guard);
                callback.complete(terminal());
                return None;
            }
            // A parked taker gets the item directly.
            if let Some(taker) = guard.takers.pop_front() {
                drop(guard);
                taker.callback.succeed(value);
                callback.succeed(true);
                return None;
            }
            if guard.has_space() {
                guard.items.push_back(value);
                drop(guard);
                callback.succeed(true);
                return None;
            }
            match guard.strategy {
                Strategy::Sliding => {
                    guard.items.pop_front();
                    guard.items.push_back(value);
                    drop(guard);
                    callback.succeed(true);
                    None
                }
                Strategy::Dropping => {
                    drop(guard);
                    callback.succeed(false);
                    None
                }
                Strategy::BackPressure | Strategy::Unbounded => {
                    let key = guard.next_key();
                    guard.putters.push_back(Putter {
                        key,
                        value,
                        callback,
                    });
                    drop(guard);
                    let cleanup = Arc::clone(&inner);
                    Some(Effect::sync(move || {
                        cleanup.lock().putters.retain(|p| p.key != key);
                    }))
                }
            }
        })
    }

    /// Offers every item in order, resolving `true` only if all were
    /// accepted.
    #[must_use]
    pub fn offer_all(&self, values: Vec<A>) -> Effect<bool, Never> {
        let queue = self.clone();
        values
            .into_iter()
            .fold(Effect::succeed(true), move |acc, value| {
                let queue = queue.clone();
                acc.flat_map(move |so_far| queue.offer(value).map(move |ok| so_far && ok))
            })
    }

    /// Takes the next item, parking until one is offered.
    #[must_use]
    pub fn take(&self) -> Effect<A, Never> {
        let inner = Arc::clone(&self.inner);
        Effect::async_(move |callback| {
            let mut guard = inner.lock();
            if guard.is_shut_down {
                drop(guard);
                callback.complete(terminal());
                return None;
            }
            if let Some(value) = guard.items.pop_front() {
                let admitted = guard.admit_putters();
                drop(guard);
                callback.succeed(value);
                for putter in admitted {
                    putter.succeed(true);
                }
                return None;
            }
            let key = guard.next_key();
            guard.takers.push_back(Taker { key, callback });
            drop(guard);
            let cleanup = Arc::clone(&inner);
            Some(Effect::sync(move || {
                cleanup.lock().takers.retain(|t| t.key != key);
            }))
        })
    }

    /// Takes everything currently buffered, without parking. Admits any
    /// blocked offerers into the freed space.
    #[must_use]
    pub fn take_all(&self) -> Effect<Vec<A>, Never> {
        self.take_up_to(usize::MAX)
    }

    /// Takes up to `n` buffered items without parking; may return fewer,
    /// or none.
    #[must_use]
    pub fn take_up_to(&self, n: usize) -> Effect<Vec<A>, Never> {
        let inner = Arc::clone(&self.inner);
        Effect::async_(move |callback| {
            let mut guard = inner.lock();
            if guard.is_shut_down {
                drop(guard);
                callback.complete(terminal());
                return None;
            }
            let count = n.min(guard.items.len());
            let taken: Vec<A> = guard.items.drain(..count).collect();
            let admitted = guard.admit_putters();
            drop(guard);
            callback.succeed(taken);
            for putter in admitted {
                putter.succeed(true);
            }
            None
        })
    }

    /// The next item if one is buffered; never parks.
    #[must_use]
    pub fn poll(&self) -> Effect<Option<A>, Never> {
        self.take_up_to(1).map(|mut items| items.pop())
    }

    /// The number of buffered items.
    #[must_use]
    pub fn size(&self) -> Effect<usize, Never> {
        let inner = Arc::clone(&self.inner);
        Effect::sync(move || inner.lock().items.len())
    }

    /// The capacity bound, if any.
    #[must_use]
    pub fn capacity(&self) -> Option<usize> {
        let inner = self.inner.lock();
        match inner.strategy {
            Strategy::Unbounded => None,
            _ => Some(inner.capacity),
        }
    }

    /// Shuts the queue down: discards buffered items, wakes every parked
    /// taker and offerer with an interruption, and makes every later
    /// operation resolve the same way. Idempotent.
    #[must_use]
    pub fn shutdown(&self) -> Effect<(), Never> {
        let inner = Arc::clone(&self.inner);
        Effect::sync(move || {
            let (takers, putters) = {
                let mut guard = inner.lock();
                if guard.is_shut_down {
                    return;
                }
                guard.is_shut_down = true;
                guard.items.clear();
                (
                    std::mem::take(&mut guard.takers),
                    std::mem::take(&mut guard.putters),
                )
            };
            for taker in takers {
                taker.callback.complete(terminal());
            }
            for putter in putters {
                putter.callback.complete(terminal());
            }
        })
    }

    /// Whether the queue has been shut down.
    #[must_use]
    pub fn is_shutdown(&self) -> Effect<bool, Never> {
        let inner = Arc::clone(&self.inner);
        Effect::sync(move || inner.lock().is_shut_down)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::RuntimeConfig;

    fn runtime() -> crate::runtime::Runtime {
        RuntimeConfig::new().worker_threads(2).build()
    }

    #[test]
    fn delivers_in_fifo_order() {
        let rt = runtime();
        let exit = rt.run(Queue::<u32>::unbounded().flat_map(|queue| {
            let taker = queue.clone();
            queue
                .offer_all(vec![1, 2, 3])
                .flat_map(move |_| taker.take_all())
        }));
        assert_eq!(exit, Exit::Success(vec![1, 2, 3]));
    }

    #[test]
    fn dropping_rejects_excess_without_parking() {
        let rt = runtime();
        let exit = rt.run(Queue::<u32>::dropping(2).flat_map(|queue| {
            let drain = queue.clone();
            queue
                .offer_all(vec![1, 2, 3])
                .flat_map(move |accepted| drain.take_all().map(move |items| (accepted, items)))
        }));
        assert_eq!(exit, Exit::Success((false, vec![1, 2])));
    }

    #[test]
    fn sliding_drops_oldest() {
        let rt = runtime();
        let exit = rt.run(Queue::<u32>::sliding(2).flat_map(|queue| {
            let drain = queue.clone();
            queue
                .offer_all(vec![1, 2, 3])
                .flat_map(move |accepted| drain.take_all().map(move |items| (accepted, items)))
        }));
        assert_eq!(exit, Exit::Success((true, vec![2, 3])));
    }

    #[test]
    fn blocked_offer_completes_after_take() {
        let rt = runtime();
        let exit = rt.run(Queue::<u32>::bounded(1).flat_map(|queue| {
            let blocked = queue.clone();
            let drain = queue.clone();
            queue.offer(1).flat_map(move |_| {
                blocked.offer(2).fork().flat_map(move |offerer| {
                    drain.take().flat_map(move |first| {
                        offerer.join().flat_map(move |accepted| {
                            drain.take().map(move |second| (first, accepted, second))
                        })
                    })
                })
            })
        }));
        assert_eq!(exit, Exit::Success((1, true, 2)));
    }

    #[test]
    fn shutdown_interrupts_waiters_and_later_ops() {
        let rt = runtime();
        let exit = rt.run(Queue::<u32>::bounded(1).flat_map(|queue| {
            let waiter = queue.clone();
            let closer = queue.clone();
            let late = queue.clone();
            waiter.take().fork().flat_map(move |taker| {
                closer.shutdown().flat_map(move |()| {
                    taker.await_exit().flat_map(move |taker_exit| {
                        late.offer(9)
                            .fold_cause(
                                |_| Effect::succeed(false),
                                |cause| Effect::succeed(cause.is_interrupted()),
                            )
                            .map(move |offer_interrupted| {
                                (taker_exit.is_interrupted(), offer_interrupted)
                            })
                    })
                })
            })
        }));
        assert_eq!(exit, Exit::Success((true, true)));
    }
}
