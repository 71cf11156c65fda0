//! A broadcast hub: every subscriber sees every item published while it is
//! subscribed, in publish order.

use crate::cause::Cause;
use crate::effect::value::{Data, Never};
use crate::effect::{AsyncCallback, Effect};
use crate::exit::Exit;
use crate::fiber::FiberId;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

struct Node<A> {
    value: A,
    /// Subscribers that have not consumed this item yet. The node is
    /// reclaimed once this reaches zero.
    remaining: usize,
}

struct Waiting<A> {
    key: u64,
    callback: AsyncCallback<A, Never>,
}

struct HubInner<A> {
    nodes: VecDeque<Node<A>>,
    /// Publish index of `nodes.front()`.
    head_index: u64,
    /// Index the next publish receives.
    next_index: u64,
    /// Subscriber id to the index it reads next.
    cursors: HashMap<u64, u64>,
    waiting: HashMap<u64, VecDeque<Waiting<A>>>,
    next_sub: u64,
    next_key: u64,
    /// Sliding bound; `None` buffers without limit.
    capacity: Option<usize>,
    is_shut_down: bool,
}

impl<A: Data> HubInner<A> {
    fn reclaim(&mut self) {
        while let Some(front) = self.nodes.front() {
            if front.remaining > 0 {
                break;
            }
            self.nodes.pop_front();
            self.head_index += 1;
        }
    }

    /// Reads and advances one subscriber's cursor, if an item is ready.
    fn consume(&mut self, sub: u64) -> Option<A> {
        let cursor = self.cursors.get_mut(&sub)?;
        if *cursor >= self.next_index {
            return None;
        }
        let slot = (*cursor - self.head_index) as usize;
        *cursor += 1;
        let node = &mut self.nodes[slot];
        node.remaining -= 1;
        let value = node.value.clone();
        self.reclaim();
        Some(value)
    }

}

fn terminal<T: Data>() -> Exit<T, Never> {
    Exit::Failure(Cause::interrupt(FiberId::None))
}

/// A many-to-many broadcast channel.
///
/// Each [`Subscription`] has an independent cursor over the shared buffer;
/// an item is reclaimed once every subscriber alive at publish time has
/// moved past it. A subscriber only sees items published after it
/// subscribed.
pub struct Hub<A> {
    inner: Arc<Mutex<HubInner<A>>>,
}

impl<A> Clone for Hub<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A> std::fmt::Debug for Hub<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Hub")
            .field("buffered", &inner.nodes.len())
            .field("subscribers", &inner.cursors.len())
            .finish()
    }
}

impl<A: Data> Hub<A> {
    fn with_capacity(capacity: Option<usize>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HubInner {
                nodes: VecDeque::new(),
                head_index: 0,
                next_index: 0,
                cursors: HashMap::new(),
                waiting: HashMap::new(),
                next_sub: 0,
                next_key: 0,
                capacity,
                is_shut_down: false,
            })),
        }
    }

    /// A hub buffering without limit.
    #[must_use]
    pub fn unbounded() -> Effect<Hub<A>, Never> {
        Effect::sync(|| Self::with_capacity(None))
    }

    /// A hub keeping at most `capacity` items; a publish past the bound
    /// evicts the oldest item, and laggards skip what they missed.
    #[must_use]
    pub fn sliding(capacity: usize) -> Effect<Hub<A>, Never> {
        let capacity = capacity.max(1);
        Effect::sync(move || Self::with_capacity(Some(capacity)))
    }

    /// Publishes one item to every current subscriber. Resolves `true`
    /// unless the hub is shut down. With no subscribers the item is
    /// discarded.
    #[must_use]
    pub fn publish(&self, value: A) -> Effect<bool, Never> {
        let inner = Arc::clone(&self.inner);
        Effect::async_(move |callback| {
            let delivered = {
                let mut guard = inner.lock();
                if guard.is_shut_down {
                    drop(guard);
                    callback.succeed(false);
                    return None;
                }
                let subscribers = guard.cursors.len();
                let index = guard.next_index;
                guard.next_index += 1;
                if subscribers == 0 {
                    guard.head_index = guard.next_index;
                    drop(guard);
                    callback.succeed(true);
                    return None;
                }
                guard.nodes.push_back(Node {
                    value,
                    remaining: subscribers,
                });
                if let Some(capacity) = guard.capacity {
                    while guard.nodes.len() > capacity {
                        guard.nodes.pop_front();
                        guard.head_index += 1;
                    }
                    let head = guard.head_index;
                    for cursor in guard.cursors.values_mut() {
                        if *cursor < head {
                            *cursor = head;
                        }
                    }
                }
                // Hand the item straight to parked takers whose cursor
                // reached it.
                let mut delivered = Vec::new();
                let parked: Vec<u64> = guard
                    .waiting
                    .iter()
                    .filter(|(_, q)| !q.is_empty())
                    .map(|(sub, _)| *sub)
                    .collect();
                for sub in parked {
                    if guard.cursors.get(&sub).is_some_and(|c| *c <= index) {
                        if let Some(item) = guard.consume(sub) {
                            if let Some(waiter) = guard
                                .waiting
                                .get_mut(&sub)
                                .and_then(VecDeque::pop_front)
                            {
                                delivered.push((waiter.callback, item));
                            }
                        }
                    }
                }
                delivered
            };
            for (waiter, item) in delivered {
                waiter.succeed(item);
            }
            callback.succeed(true);
            None
        })
    }

    /// Publishes every item in order.
    #[must_use]
    pub fn publish_all(&self, values: Vec<A>) -> Effect<bool, Never> {
        let hub = self.clone();
        values
            .into_iter()
            .fold(Effect::succeed(true), move |acc, value| {
                let hub = hub.clone();
                acc.flat_map(move |so_far| hub.publish(value).map(move |ok| so_far && ok))
            })
    }

    /// Registers a new subscriber, which sees items published from now on.
    #[must_use]
    pub fn subscribe(&self) -> Effect<Subscription<A>, Never> {
        let inner = Arc::clone(&self.inner);
        Effect::sync(move || {
            let id = {
                let mut guard = inner.lock();
                let id = guard.next_sub;
                guard.next_sub += 1;
                let next_index = guard.next_index;
                guard.cursors.insert(id, next_index);
                id
            };
            Subscription {
                core: Arc::new(SubCore {
                    id,
                    hub: Arc::clone(&inner),
                }),
            }
        })
    }

    /// The number of items currently buffered.
    #[must_use]
    pub fn size(&self) -> Effect<usize, Never> {
        let inner = Arc::clone(&self.inner);
        Effect::sync(move || inner.lock().nodes.len())
    }

    /// Shuts the hub down: wakes every parked subscriber with an
    /// interruption and makes later publishes report `false`.
    #[must_use]
    pub fn shutdown(&self) -> Effect<(), Never> {
        let inner = Arc::clone(&self.inner);
        Effect::sync(move || {
            let waiting = {
                let mut guard = inner.lock();
                if guard.is_shut_down {
                    return;
                }
                guard.is_shut_down = true;
                guard.nodes.clear();
                std::mem::take(&mut guard.waiting)
            };
            for (_, waiters) in waiting {
                for waiter in waiters {
                    waiter.callback.complete(terminal());
                }
            }
        })
    }
}

struct SubCore<A> {
    id: u64,
    hub: Arc<Mutex<HubInner<A>>>,
}

impl<A> Drop for SubCore<A> {
    fn drop(&mut self) {
        let mut guard = self.hub.lock();
        let id = self.id;
        let Some(cursor) = guard.cursors.remove(&id) else {
            return;
        };
        guard.waiting.remove(&id);
        let start = (cursor.saturating_sub(guard.head_index)) as usize;
        for node in guard.nodes.iter_mut().skip(start) {
            node.remaining -= 1;
        }
        while let Some(front) = guard.nodes.front() {
            if front.remaining > 0 {
                break;
            }
            guard.nodes.pop_front();
            guard.head_index += 1;
        }
    }
}

/// One subscriber's view of a hub. Cheap to clone; the subscription ends
/// when the last clone is dropped.
pub struct Subscription<A> {
    core: Arc<SubCore<A>>,
}

impl<A> Clone for Subscription<A> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<A> std::fmt::Debug for Subscription<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.core.id)
            .finish()
    }
}

impl<A: Data> Subscription<A> {
    /// Takes the next published item, parking until one arrives.
    #[must_use]
    pub fn take(&self) -> Effect<A, Never> {
        let inner = Arc::clone(&self.core.hub);
        let sub = self.core.id;
        Effect::async_(move |callback| {
            let mut guard = inner.lock();
            if guard.is_shut_down {
                drop(guard);
                callback.complete(terminal());
                return None;
            }
            if let Some(value) = guard.consume(sub) {
                drop(guard);
                callback.succeed(value);
                return None;
            }
            guard.next_key += 1;
            let key = guard.next_key;
            guard
                .waiting
                .entry(sub)
                .or_default()
                .push_back(Waiting { key, callback });
            drop(guard);
            let cleanup = Arc::clone(&inner);
            Some(Effect::sync(move || {
                if let Some(waiters) = cleanup.lock().waiting.get_mut(&sub) {
                    waiters.retain(|w| w.key != key);
                }
            }))
        })
    }

    /// Takes everything ready for this subscriber, without parking.
    #[must_use]
    pub fn take_all(&self) -> Effect<Vec<A>, Never> {
        let inner = Arc::clone(&self.core.hub);
        let sub = self.core.id;
        Effect::async_(move |callback| {
            let mut guard = inner.lock();
            if guard.is_shut_down {
                drop(guard);
                callback.complete(terminal());
                return None;
            }
            let mut items = Vec::new();
            while let Some(value) = guard.consume(sub) {
                items.push(value);
            }
            drop(guard);
            callback.succeed(items);
            None
        })
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
    fn every_subscriber_sees_publish_order() {
        let rt = runtime();
        let exit = rt.run(Hub::<u32>::unbounded().flat_map(|hub| {
            let publisher = hub.clone();
            hub.subscribe().flat_map(move |first| {
                let hub = publisher.clone();
                hub.subscribe().flat_map(move |second| {
                    publisher.publish_all(vec![1, 2, 3]).flat_map(move |_| {
                        first.take_all().flat_map(move |a| {
                            second.take_all().map(move |b| (a.clone(), b))
                        })
                    })
                })
            })
        }));
        assert_eq!(exit, Exit::Success((vec![1, 2, 3], vec![1, 2, 3])));
    }

    #[test]
    fn buffer_reclaimed_once_all_consumed() {
        let rt = runtime();
        let exit = rt.run(Hub::<u32>::unbounded().flat_map(|hub| {
            let publisher = hub.clone();
            let sizer = hub.clone();
            hub.subscribe().flat_map(move |only| {
                publisher.publish_all(vec![7, 8]).flat_map(move |_| {
                    only.take_all()
                        .flat_map(move |items| sizer.size().map(move |n| (items.clone(), n)))
                })
            })
        }));
        assert_eq!(exit, Exit::Success((vec![7, 8], 0)));
    }

    #[test]
    fn late_subscriber_misses_earlier_items() {
        let rt = runtime();
        let exit = rt.run(Hub::<u32>::unbounded().flat_map(|hub| {
            let subscriber = hub.clone();
            hub.publish(1).flat_map(move |_| {
                let publisher = subscriber.clone();
                subscriber.subscribe().flat_map(move |sub| {
                    publisher
                        .publish(2)
                        .flat_map(move |_| sub.take_all())
                })
            })
        }));
        assert_eq!(exit, Exit::Success(vec![2]));
    }

    #[test]
    fn parked_take_wakes_on_publish() {
        let rt = runtime();
        let exit = rt.run(Hub::<u32>::unbounded().flat_map(|hub| {
            let publisher = hub.clone();
            hub.subscribe().flat_map(move |sub| {
                sub.take().fork().flat_map(move |taker| {
                    publisher.publish(5).flat_map(move |_| taker.join())
                })
            })
        }));
        assert_eq!(exit, Exit::Success(5));
    }
}
