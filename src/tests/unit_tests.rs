use std::pin::pin;
use std::ptr;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::{Arc, Mutex as StdMutex};
use std::thread;
use std::time::{Duration, Instant};

use static_assertions::{assert_impl_all, const_assert};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::util::SubscriberInitExt;

use crate::state::{self, EMPTY, Flag, HAS_WAITERS, HEAD_MASK, LOCKED, WAITER_QUEUE_LOCKED};
use crate::sync_primitive::{SyncPrimitive, WaitQueueGuard};
use crate::wait_queue::{WaitQueue, WaitQueueNode};
use crate::{Condvar, Config, Mutex, ThreadId};

assert_impl_all!(Mutex: Send, Sync);
assert_impl_all!(Condvar: Send, Sync);
assert_impl_all!(ThreadId: Send, Sync, Copy, Eq, Ord);
const_assert!(align_of::<WaitQueueNode>() > !HEAD_MASK);

/// Spins until `f` returns `true`.
fn wait_until<F: Fn() -> bool>(f: F) {
    while !f() {
        thread::sleep(Duration::from_micros(100));
    }
}

#[derive(Debug, Default)]
struct NoSpin;

impl Config for NoSpin {
    fn spin_count() -> usize {
        1
    }
}

#[test]
fn flags() {
    let state = LOCKED | HAS_WAITERS;
    assert!(Flag::Locked.decode(state));
    assert!(!Flag::WaiterQueueLocked.decode(state));
    assert!(Flag::HasWaiters.decode(state));

    assert_eq!(Flag::Locked.update(state, false), HAS_WAITERS);
    assert_eq!(
        Flag::WaiterQueueLocked.update(state, true),
        LOCKED | WAITER_QUEUE_LOCKED | HAS_WAITERS
    );
    assert_eq!(Flag::HasWaiters.update(state, true), state);
}

#[test]
fn try_lock_bit() {
    let word = AtomicUsize::new(LOCKED);

    let mut current = 0;
    assert!(!state::try_lock_bit(&word, Flag::Locked, &mut current));
    assert_eq!(current, LOCKED);

    assert!(state::try_lock_bit(&word, Flag::WaiterQueueLocked, &mut current));
    assert_eq!(current, LOCKED);
    assert_eq!(word.load(Relaxed), LOCKED | WAITER_QUEUE_LOCKED);

    let mut current = word.load(Relaxed);
    assert!(!state::try_lock_bit(
        &word,
        Flag::WaiterQueueLocked,
        &mut current
    ));
}

#[test]
fn head_encoding() {
    let node = WaitQueueNode::new(ThreadId::current());
    let state = state::with_head(LOCKED, &node);
    assert!(Flag::Locked.decode(state));
    assert!(Flag::HasWaiters.decode(state));
    assert!(ptr::eq(state::head(state), &node));

    let state = state::with_head(state, ptr::null());
    assert_eq!(state, LOCKED);
    assert!(state::head(state).is_null());
}

#[test]
fn wait_queue_fifo() {
    let me = ThreadId::current();
    let nodes = [
        WaitQueueNode::new(me),
        WaitQueueNode::new(me),
        WaitQueueNode::new(me),
        WaitQueueNode::new(me),
    ];

    let mut queue = WaitQueue::default();
    assert!(queue.is_empty());
    for node in &nodes {
        unsafe {
            queue.enqueue(node);
        }
    }
    assert_eq!(queue.len(), 4);

    for node in &nodes {
        let waiter = queue.dequeue().unwrap();
        assert!(waiter.is(node));
    }
    assert!(queue.is_empty());
    assert!(queue.dequeue().is_none());
}

#[test]
fn wait_queue_dequeue_matching() {
    let me = ThreadId::current();
    let nodes = [
        WaitQueueNode::new(me),
        WaitQueueNode::new(me),
        WaitQueueNode::new(me),
    ];

    let mut queue = WaitQueue::default();
    for node in &nodes {
        unsafe {
            queue.enqueue(node);
        }
    }

    let middle = queue
        .dequeue_matching(|node| ptr::eq(node, &nodes[1]))
        .unwrap();
    assert!(middle.is(&nodes[1]));
    assert_eq!(queue.len(), 2);
    assert!(
        queue
            .dequeue_matching(|node| ptr::eq(node, &nodes[1]))
            .is_none()
    );

    let head = queue
        .dequeue_matching(|node| ptr::eq(node, &nodes[0]))
        .unwrap();
    assert!(head.is(&nodes[0]));
    assert!(queue.dequeue().unwrap().is(&nodes[2]));
    assert!(queue.is_empty());
}

#[test]
fn wait_queue_split() {
    let me = ThreadId::current();
    let nodes = [
        WaitQueueNode::new(me),
        WaitQueueNode::new(me),
        WaitQueueNode::new(me),
        WaitQueueNode::new(me),
        WaitQueueNode::new(me),
    ];

    let mut queue = WaitQueue::default();
    for node in &nodes {
        node.prepare_wait();
        unsafe {
            queue.enqueue(node);
        }
    }

    assert!(queue.split(0).is_none());

    // Nodes are notified on the current thread, which only leaves an unpark token behind.
    let front = queue.split(2).unwrap();
    assert_eq!(front.len(), 2);
    assert_eq!(queue.len(), 3);
    let mut front = front.into_queue();
    for node in &nodes[..2] {
        let waiter = front.dequeue().unwrap();
        assert!(waiter.is(node));
        waiter.notify();
        node.wait();
    }
    assert!(front.is_empty());

    assert!(queue.dequeue().unwrap().is(&nodes[2]));

    let rest = queue.split(16).unwrap();
    assert!(queue.is_empty());
    assert_eq!(rest.len(), 2);
    assert_eq!(rest.notify_all(), 2);
    nodes[3].wait();
    nodes[4].wait();
}

#[test]
fn node_wait_for_timeout() {
    let node = pin!(WaitQueueNode::new(ThreadId::current()));
    node.prepare_wait();

    let started = Instant::now();
    assert!(!node.wait_for(Duration::from_millis(10)));
    assert!(started.elapsed() >= Duration::from_millis(10));

    let mut queue = WaitQueue::default();
    unsafe {
        queue.enqueue(&node);
    }
    queue.dequeue().unwrap().notify();
    assert!(node.wait_for(Duration::from_millis(10)));
}

#[test]
fn thread_id() {
    let me = ThreadId::current();
    assert_eq!(me, ThreadId::current());
    assert_eq!(ThreadId::from_u64(me.as_u64()), Some(me));
    assert_eq!(ThreadId::from_u64(0), None);

    let other = thread::spawn(ThreadId::current).join().unwrap();
    assert_ne!(me, other);
}

#[test]
fn mutex_try_lock() {
    let mutex = Mutex::new();
    let me = ThreadId::current();

    assert!(mutex.try_lock());
    assert!(mutex.is_locked());
    assert_eq!(mutex.owner(), Some(me));
    assert!(!mutex.try_lock());

    mutex.unlock(me);
    assert!(!mutex.is_locked());
    assert_eq!(mutex.owner(), None);
    assert_eq!(mutex.state().load(Relaxed), EMPTY);
}

#[test]
fn mutex_lock_sync() {
    let num_threads = if cfg!(miri) { 4 } else { 16 };
    let num_iters = if cfg!(miri) { 16 } else { 1024 };

    let mutex = Arc::new(Mutex::new());
    let check = Arc::new(AtomicUsize::new(0));

    let mut threads = Vec::new();
    for _ in 0..num_threads {
        let mutex = mutex.clone();
        let check = check.clone();
        threads.push(thread::spawn(move || {
            let me = ThreadId::current();
            for j in 0..num_iters {
                mutex.lock(me);
                assert_eq!(check.fetch_add(1, Relaxed), 0);
                if j % 13 == 0 {
                    thread::sleep(Duration::from_micros(1));
                }
                check.fetch_sub(1, Relaxed);
                mutex.unlock(me);
            }
        }));
    }

    for thread in threads {
        thread.join().unwrap();
    }
    assert_eq!(check.load(Relaxed), 0);
    assert!(!mutex.is_locked());
    assert_eq!(mutex.num_waiters(), 0);
}

#[test]
fn mutex_no_lost_wakeup() {
    let _trace = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_thread_ids(true)
        .with_test_writer()
        .set_default();

    let num_threads = if cfg!(miri) { 4 } else { 32 };

    let mutex: Arc<Mutex<NoSpin>> = Arc::new(Mutex::with_config());
    let acquired = Arc::new(AtomicUsize::new(0));
    let me = ThreadId::current();
    mutex.lock(me);

    let mut threads = Vec::new();
    for _ in 0..num_threads {
        let mutex = mutex.clone();
        let acquired = acquired.clone();
        threads.push(thread::spawn(move || {
            let me = ThreadId::current();
            mutex.lock(me);
            acquired.fetch_add(1, Relaxed);
            mutex.unlock(me);
        }));
    }

    wait_until(|| mutex.num_waiters() == num_threads);
    assert_eq!(acquired.load(Relaxed), 0);
    mutex.unlock(me);

    for thread in threads {
        thread.join().unwrap();
    }
    assert_eq!(acquired.load(Relaxed), num_threads);
    assert_eq!(mutex.num_waiters(), 0);
    assert_eq!(mutex.state().load(Relaxed), EMPTY);
}

#[test]
fn mutex_lock_for_timeout() {
    let mutex = Arc::new(Mutex::new());
    let me = ThreadId::current();
    mutex.lock(me);

    let mutex_clone = mutex.clone();
    let timed_out = thread::spawn(move || {
        let started = Instant::now();
        let acquired = mutex_clone.lock_for(ThreadId::current(), Duration::from_millis(50));
        (acquired, started.elapsed())
    });
    let (acquired, elapsed) = timed_out.join().unwrap();
    assert!(!acquired);
    assert!(elapsed >= Duration::from_millis(50));
    assert_eq!(mutex.num_waiters(), 0);
    assert!(mutex.is_held_by_current_thread(me));

    mutex.unlock(me);
    let mutex_clone = mutex.clone();
    assert!(
        thread::spawn(move || mutex_clone.try_lock())
            .join()
            .unwrap()
    );
}

#[test]
fn mutex_lock_for_acquired() {
    let mutex = Arc::new(Mutex::new());
    let me = ThreadId::current();
    mutex.lock(me);

    let mutex_clone = mutex.clone();
    let thread = thread::spawn(move || {
        let me = ThreadId::current();
        let acquired = mutex_clone.lock_for(me, Duration::from_secs(60));
        if acquired {
            assert!(mutex_clone.is_held_by_current_thread(me));
            mutex_clone.unlock(me);
        }
        acquired
    });

    thread::sleep(Duration::from_millis(10));
    mutex.unlock(me);
    assert!(thread.join().unwrap());
}

/// Queues `nodes` on a mutex held by the current thread.
fn enqueue_locked(mutex: &Mutex, nodes: &[&WaitQueueNode]) {
    let state = mutex.state();
    let mut current = state.load(Relaxed);
    let mut guard = WaitQueueGuard::lock(state, &mut current);
    let mut queue = guard.queue();
    for node in nodes {
        node.prepare_wait();
        unsafe {
            queue.enqueue(node);
        }
    }
    guard.set_new_state(Flag::Locked.update(queue.install(current), true));
}

/// Dequeues and notifies the head the way an unlocking thread does.
fn dequeue_unlocked(mutex: &Mutex) {
    let state = mutex.state();
    let mut current = state.load(Relaxed);
    let mut guard = WaitQueueGuard::lock(state, &mut current);
    let mut queue = guard.queue();
    let waiter = queue.dequeue().unwrap();
    guard.set_new_state(Flag::Locked.update(queue.install(current), false));
    drop(guard);
    waiter.notify();
}

#[test]
fn mutex_timed_out_takeover() {
    let mutex = Mutex::new();
    let me = ThreadId::current();
    mutex.lock(me);

    let timed_out = pin!(WaitQueueNode::new(me));
    let next = pin!(WaitQueueNode::new(me));
    enqueue_locked(&mutex, &[&*timed_out, &*next]);

    // The lock is released to the timed-out waiter, which is no longer in the queue.
    dequeue_unlocked(&mutex);
    assert!(!mutex.is_locked());

    assert!(mutex.lock_or_dequeue_timed_out(me, &timed_out));
    assert_eq!(
        mutex.state().load(Relaxed),
        state::with_head(LOCKED, ptr::from_ref(&*next))
    );
    assert_eq!(mutex.num_waiters(), 1);

    // The new owner wakes up the next waiter.
    mutex.unlock(me);
    next.wait();
    assert_eq!(mutex.state().load(Relaxed), EMPTY);
}

#[test]
fn mutex_timed_out_takeover_barged() {
    let mutex = Mutex::new();
    let me = ThreadId::current();
    mutex.lock(me);

    let timed_out = pin!(WaitQueueNode::new(me));
    let next = pin!(WaitQueueNode::new(me));
    enqueue_locked(&mutex, &[&*timed_out, &*next]);

    dequeue_unlocked(&mutex);
    assert!(mutex.try_lock());

    // The lock is taken by another thread, which wakes up the next waiter instead.
    assert!(!mutex.lock_or_dequeue_timed_out(me, &timed_out));
    assert_eq!(
        mutex.state().load(Relaxed),
        state::with_head(LOCKED, ptr::from_ref(&*next))
    );
    assert!(Flag::HasWaiters.decode(mutex.state().load(Relaxed)));

    mutex.unlock(me);
    next.wait();
    assert_eq!(mutex.state().load(Relaxed), EMPTY);
}

#[test]
fn mutex_timed_out_dequeued_self() {
    let mutex = Mutex::new();
    let me = ThreadId::current();
    mutex.lock(me);

    let timed_out = pin!(WaitQueueNode::new(me));
    let next = pin!(WaitQueueNode::new(me));
    enqueue_locked(&mutex, &[&*timed_out, &*next]);

    // Still queued: the waiter removes itself and the lock stays with its owner.
    assert!(!mutex.lock_or_dequeue_timed_out(me, &timed_out));
    assert_eq!(
        mutex.state().load(Relaxed),
        state::with_head(LOCKED, ptr::from_ref(&*next))
    );

    mutex.unlock(me);
    next.wait();
    assert_eq!(mutex.state().load(Relaxed), EMPTY);
}

#[test]
fn mutex_timeout_chaos() {
    let num_threads = if cfg!(miri) { 4 } else { 16 };
    let num_iters = if cfg!(miri) { 16 } else { 256 };

    let mutex: Arc<Mutex<NoSpin>> = Arc::new(Mutex::with_config());
    let check = Arc::new(AtomicUsize::new(0));

    let mut threads = Vec::new();
    for i in 0..num_threads {
        let mutex = mutex.clone();
        let check = check.clone();
        threads.push(thread::spawn(move || {
            let me = ThreadId::current();
            for j in 0..num_iters {
                let acquired = if (i + j) % 3 == 0 {
                    mutex.lock_for(me, Duration::from_micros(50))
                } else {
                    mutex.lock(me);
                    true
                };
                if acquired {
                    assert_eq!(check.fetch_add(1, Relaxed), 0);
                    thread::sleep(Duration::from_micros(20));
                    check.fetch_sub(1, Relaxed);
                    mutex.unlock(me);
                }
            }
        }));
    }

    for thread in threads {
        thread.join().unwrap();
    }
    assert_eq!(check.load(Relaxed), 0);
    assert_eq!(mutex.num_waiters(), 0);
    assert_eq!(mutex.state().load(Relaxed), EMPTY);
}

#[test]
fn condvar_notify_empty() {
    let condvar = Condvar::new();
    assert_eq!(condvar.notify(1), 0);
    assert_eq!(condvar.notify(2), 0);
    assert_eq!(condvar.notify(Condvar::ALL_WAITERS), 0);
    assert_eq!(condvar.state().load(Relaxed), EMPTY);
}

/// Spawns `num_waiters` threads that wait on the condvar one after another.
fn spawn_waiters(
    mutex: &Arc<Mutex>,
    condvar: &Arc<Condvar>,
    woken: &Arc<StdMutex<Vec<usize>>>,
    num_waiters: usize,
) -> Vec<thread::JoinHandle<()>> {
    let mut threads = Vec::new();
    for i in 0..num_waiters {
        let mutex = mutex.clone();
        let condvar_clone = condvar.clone();
        let woken = woken.clone();
        threads.push(thread::spawn(move || {
            let me = ThreadId::current();
            mutex.lock(me);
            condvar_clone.wait(&*mutex, me);
            assert!(mutex.is_held_by_current_thread(me));
            woken.lock().unwrap().push(i);
            mutex.unlock(me);
        }));
        wait_until(|| condvar.num_waiters() == i + 1);
    }
    threads
}

#[test]
fn condvar_notify_fifo() {
    let mutex = Arc::new(Mutex::new());
    let condvar = Arc::new(Condvar::new());
    let woken = Arc::new(StdMutex::new(Vec::new()));

    let threads = spawn_waiters(&mutex, &condvar, &woken, 3);
    for i in 0..3 {
        assert_eq!(condvar.notify(1), 1);
        wait_until(|| woken.lock().unwrap().len() == i + 1);
    }
    assert_eq!(*woken.lock().unwrap(), vec![0, 1, 2]);

    for thread in threads {
        thread.join().unwrap();
    }
    assert_eq!(condvar.notify(1), 0);
}

#[test]
fn condvar_notify_partial() {
    let mutex = Arc::new(Mutex::new());
    let condvar = Arc::new(Condvar::new());
    let woken = Arc::new(StdMutex::new(Vec::new()));

    let threads = spawn_waiters(&mutex, &condvar, &woken, 3);

    assert_eq!(condvar.notify(2), 2);
    wait_until(|| woken.lock().unwrap().len() == 2);

    // Woken waiters race for the mutex, so only the set is fixed here.
    let mut first = woken.lock().unwrap().clone();
    first.sort_unstable();
    assert_eq!(first, vec![0, 1]);

    thread::sleep(Duration::from_millis(10));
    assert_eq!(condvar.num_waiters(), 1);
    assert_eq!(woken.lock().unwrap().len(), 2);

    assert_eq!(condvar.notify(Condvar::ALL_WAITERS), 1);
    for thread in threads {
        thread.join().unwrap();
    }
    assert_eq!(woken.lock().unwrap().len(), 3);
    assert_eq!(condvar.num_waiters(), 0);
}

#[test]
fn condvar_notify_dequeue_order() {
    let condvar = Condvar::new();
    let me = ThreadId::current();
    let nodes = [
        WaitQueueNode::new(me),
        WaitQueueNode::new(me),
        WaitQueueNode::new(me),
    ];
    {
        let state = condvar.state();
        let mut current = state.load(Relaxed);
        let mut guard = WaitQueueGuard::lock(state, &mut current);
        let mut queue = guard.queue();
        for node in &nodes {
            node.prepare_wait();
            unsafe {
                queue.enqueue(node);
            }
        }
        guard.set_new_state(queue.install(current));
    }

    // The first two waiters in arrival order are notified, the third stays at the head.
    assert_eq!(condvar.notify(2), 2);
    assert!(nodes[0].wait_for(Duration::ZERO));
    assert!(nodes[1].wait_for(Duration::ZERO));
    assert!(!nodes[2].wait_for(Duration::ZERO));
    assert_eq!(
        condvar.state().load(Relaxed),
        state::with_head(EMPTY, ptr::from_ref(&nodes[2]))
    );

    assert_eq!(condvar.notify(1), 1);
    assert!(nodes[2].wait_for(Duration::ZERO));
    assert_eq!(condvar.state().load(Relaxed), EMPTY);
}

#[test]
fn condvar_wait_for_timeout() {
    let mutex = Mutex::new();
    let condvar = Condvar::new();
    let me = ThreadId::current();

    mutex.lock(me);
    let started = Instant::now();
    assert!(!condvar.wait_for(&mutex, me, Duration::from_millis(20)));
    assert!(started.elapsed() >= Duration::from_millis(20));
    assert!(mutex.is_held_by_current_thread(me));
    assert_eq!(condvar.num_waiters(), 0);
    mutex.unlock(me);
}

#[test]
fn condvar_wait_for_notified() {
    let mutex = Arc::new(Mutex::new());
    let condvar = Arc::new(Condvar::new());

    let mutex_clone = mutex.clone();
    let condvar_clone = condvar.clone();
    let thread = thread::spawn(move || {
        let me = ThreadId::current();
        mutex_clone.lock(me);
        let notified = condvar_clone.wait_for(&*mutex_clone, me, Duration::from_secs(60));
        assert!(mutex_clone.is_held_by_current_thread(me));
        mutex_clone.unlock(me);
        notified
    });

    wait_until(|| condvar.num_waiters() == 1);
    assert_eq!(condvar.notify(Condvar::ALL_WAITERS), 1);
    assert!(thread.join().unwrap());
}

#[test]
fn condvar_chaos() {
    let num_threads = if cfg!(miri) { 4 } else { 16 };
    let num_iters = if cfg!(miri) { 16 } else { 256 };

    let mutex = Arc::new(Mutex::new());
    let condvar = Arc::new(Condvar::new());
    let pending = Arc::new(AtomicUsize::new(num_threads));

    let mut threads = Vec::new();
    for i in 0..num_threads {
        let mutex = mutex.clone();
        let condvar = condvar.clone();
        let pending = pending.clone();
        threads.push(thread::spawn(move || {
            let me = ThreadId::current();
            for j in 0..num_iters {
                mutex.lock(me);
                if (i + j) % 2 == 0 {
                    condvar.wait_for(&*mutex, me, Duration::from_micros(100));
                } else {
                    condvar.notify(if j % 5 == 0 { Condvar::ALL_WAITERS } else { 1 });
                }
                assert!(mutex.is_held_by_current_thread(me));
                mutex.unlock(me);
            }
            pending.fetch_sub(1, Relaxed);
        }));
    }

    for thread in threads {
        thread.join().unwrap();
    }
    assert_eq!(pending.load(Relaxed), 0);
    assert_eq!(condvar.num_waiters(), 0);
    assert_eq!(condvar.state().load(Relaxed), EMPTY);
    assert_eq!(mutex.state().load(Relaxed), EMPTY);
}

#[cfg(feature = "lock_api")]
#[test]
fn data_mutex() {
    use crate::DataMutex;

    let num_threads = if cfg!(miri) { 4 } else { 8 };
    let num_iters = if cfg!(miri) { 16 } else { 512 };

    let mutex: Arc<DataMutex<usize>> = Arc::new(DataMutex::new(0));
    let mut threads = Vec::new();
    for _ in 0..num_threads {
        let mutex = mutex.clone();
        threads.push(thread::spawn(move || {
            for j in 0..num_iters {
                if j % 2 == 0 {
                    *mutex.lock() += 1;
                } else if let Some(mut guard) = mutex.try_lock_for(Duration::from_secs(60)) {
                    *guard += 1;
                }
            }
        }));
    }

    for thread in threads {
        thread.join().unwrap();
    }
    assert_eq!(*mutex.lock(), num_threads * num_iters);
}
