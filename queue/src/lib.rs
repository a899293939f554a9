//! 基于互斥锁与条件变量的无界阻塞队列。

use std::{
    collections::VecDeque,
    fmt,
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak},
};

pub use common::{BlockingQueue, CancellationToken, Closed, Notify, TakeError};

#[macro_use]
extern crate log;

/// 多生产者多消费者 FIFO 队列。克隆得到的句柄共享同一个队列。
pub struct Queue<T>(Arc<Shared<T>>);

struct Shared<T> {
    state: Mutex<State<T>>,
    condvar: Condvar,
}

struct State<T> {
    items: VecDeque<T>,
    closed: bool,
}

impl<T> Shared<T> {
    #[inline]
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        // 状态在任何持锁路径上都保持一致，中毒可以忽略
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Send> Notify for Shared<T> {
    fn notify(&self) {
        // 先取得锁：等待者要么尚未检查条件，要么已经休眠
        drop(self.lock());
        self.condvar.notify_all();
    }
}

impl<T> Queue<T> {
    #[inline]
    pub fn new() -> Self {
        Self::from(VecDeque::new())
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.lock().items.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.lock().items.is_empty()
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.0.lock().closed
    }

    /// 已关闭且已取空。
    #[inline]
    pub fn is_completed(&self) -> bool {
        let state = self.0.lock();
        state.closed && state.items.is_empty()
    }
}

impl<T> Clone for Queue<T> {
    #[inline]
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T> Default for Queue<T> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl<T> From<VecDeque<T>> for Queue<T> {
    fn from(items: VecDeque<T>) -> Self {
        Self(Arc::new(Shared {
            state: Mutex::new(State {
                items,
                closed: false,
            }),
            condvar: Condvar::new(),
        }))
    }
}

impl<T> From<Vec<T>> for Queue<T> {
    #[inline]
    fn from(items: Vec<T>) -> Self {
        VecDeque::from(items).into()
    }
}

impl<T> FromIterator<T> for Queue<T> {
    #[inline]
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        iter.into_iter().collect::<VecDeque<_>>().into()
    }
}

impl<T> fmt::Debug for Queue<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let state = self.0.lock();
        f.debug_struct("Queue")
            .field("len", &state.items.len())
            .field("closed", &state.closed)
            .finish()
    }
}

impl<T: Send + 'static> BlockingQueue for Queue<T> {
    type Item = T;

    fn take(&self, cancel: &CancellationToken) -> Result<T, TakeError> {
        if cancel.is_cancelled() {
            return Err(TakeError::Cancelled);
        }
        let target = Arc::downgrade(&self.0) as Weak<dyn Notify>;
        cancel.register(target);

        let mut state = self
            .0
            .condvar
            .wait_while(self.0.lock(), |s| {
                s.items.is_empty() && !s.closed && !cancel.is_cancelled()
            })
            .unwrap_or_else(PoisonError::into_inner);

        if cancel.is_cancelled() {
            // 可能消耗了一次 insert 的唤醒，转交给其他等待者
            if !state.items.is_empty() {
                self.0.condvar.notify_one();
            }
            trace!("take cancelled");
            return Err(TakeError::Cancelled);
        }
        state.items.pop_front().ok_or(TakeError::Exhausted)
    }

    #[inline]
    fn try_take(&self) -> Option<T> {
        self.0.lock().items.pop_front()
    }

    fn insert(&self, item: T) -> Result<(), Closed<T>> {
        let mut state = self.0.lock();
        if state.closed {
            return Err(Closed(item));
        }
        state.items.push_back(item);
        drop(state);
        self.0.condvar.notify_one();
        Ok(())
    }

    fn close(&self) {
        let mut state = self.0.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        debug!("queue closed with {} item(s) left", state.items.len());
        drop(state);
        self.0.condvar.notify_all();
    }
}

#[cfg(test)]
const PATIENCE: std::time::Duration = std::time::Duration::from_secs(2);

#[test]
fn test_fifo() {
    let queue = Queue::new();
    for i in 0..5 {
        queue.insert(i).unwrap();
    }
    assert_eq!(queue.len(), 5);
    let cancel = CancellationToken::new();
    assert_eq!(queue.take(&cancel), Ok(0));
    assert_eq!(queue.try_take(), Some(1));
    assert_eq!(queue.take(&cancel), Ok(2));
    assert_eq!(queue.try_take(), Some(3));
    assert_eq!(queue.try_take(), Some(4));
    assert_eq!(queue.try_take(), None);
    assert!(queue.is_empty());
}

#[test]
fn test_close() {
    let queue = Queue::from(vec![1, 2]);
    assert!(!queue.is_closed());
    queue.close();
    queue.close();
    assert!(queue.is_closed());
    assert!(!queue.is_completed());
    assert_eq!(queue.insert(3), Err(Closed(3)));

    let cancel = CancellationToken::new();
    assert_eq!(queue.take(&cancel), Ok(1));
    assert_eq!(queue.try_take(), Some(2));
    assert!(queue.is_completed());
    assert_eq!(queue.try_take(), None);
    assert_eq!(queue.take(&cancel), Err(TakeError::Exhausted));
}

#[test]
fn test_cancelled_before_take() {
    let queue = [1, 2, 3].into_iter().collect::<Queue<_>>();
    let cancel = CancellationToken::new();
    cancel.cancel();
    assert_eq!(queue.take(&cancel), Err(TakeError::Cancelled));
    assert_eq!(queue.len(), 3);
}

#[test]
fn test_take_blocks_until_insert() {
    use std::{sync::mpsc::channel, thread, time::Duration};

    let queue = Queue::<i32>::new();
    let (sender, receiver) = channel();
    let consumer = {
        let queue = queue.clone();
        thread::spawn(move || sender.send(queue.take(&CancellationToken::new())).unwrap())
    };
    assert!(receiver.recv_timeout(Duration::from_millis(200)).is_err());

    queue.insert(78).unwrap();
    assert_eq!(receiver.recv_timeout(PATIENCE), Ok(Ok(78)));
    consumer.join().unwrap();
}

#[test]
fn test_cancel_wakes_waiter() {
    use std::{sync::mpsc::channel, thread, time::Duration};

    let queue = Queue::<i32>::new();
    let cancel = CancellationToken::new();
    let (sender, receiver) = channel();
    let consumer = {
        let queue = queue.clone();
        let cancel = cancel.clone();
        thread::spawn(move || sender.send(queue.take(&cancel)).unwrap())
    };
    assert!(receiver.recv_timeout(Duration::from_millis(200)).is_err());

    cancel.cancel();
    assert_eq!(receiver.recv_timeout(PATIENCE), Ok(Err(TakeError::Cancelled)));
    consumer.join().unwrap();

    // 取消不影响队列本身
    queue.insert(1).unwrap();
    assert_eq!(queue.take(&CancellationToken::new()), Ok(1));
}

#[test]
fn test_close_wakes_waiter() {
    use std::{sync::mpsc::channel, thread, time::Duration};

    let queue = Queue::<i32>::new();
    let (sender, receiver) = channel();
    let consumer = {
        let queue = queue.clone();
        thread::spawn(move || sender.send(queue.take(&CancellationToken::new())).unwrap())
    };
    assert!(receiver.recv_timeout(Duration::from_millis(200)).is_err());

    queue.close();
    assert_eq!(receiver.recv_timeout(PATIENCE), Ok(Err(TakeError::Exhausted)));
    consumer.join().unwrap();
}

#[test]
fn test_many_producers_many_consumers() {
    use std::thread;

    const PRODUCERS: usize = 4;
    const ITEMS: usize = 1000;

    let queue = Queue::<(usize, usize)>::new();
    let producers = (0..PRODUCERS)
        .map(|p| {
            let queue = queue.clone();
            thread::spawn(move || {
                for i in 0..ITEMS {
                    queue.insert((p, i)).unwrap();
                }
            })
        })
        .collect::<Vec<_>>();
    let consumers = (0..3)
        .map(|_| {
            let queue = queue.clone();
            thread::spawn(move || {
                let cancel = CancellationToken::new();
                let mut received = Vec::new();
                while let Ok(item) = queue.take(&cancel) {
                    received.push(item);
                }
                received
            })
        })
        .collect::<Vec<_>>();

    for producer in producers {
        producer.join().unwrap();
    }
    queue.close();

    let mut all = Vec::new();
    for consumer in consumers {
        let received = consumer.join().unwrap();
        // 每个消费者看到的同一生产者的元素保持插入顺序
        for p in 0..PRODUCERS {
            let seq = received
                .iter()
                .filter(|(q, _)| *q == p)
                .map(|(_, i)| *i)
                .collect::<Vec<_>>();
            assert!(seq.windows(2).all(|w| w[0] < w[1]));
        }
        all.extend(received);
    }
    all.sort_unstable();
    let expected = (0..PRODUCERS)
        .flat_map(|p| (0..ITEMS).map(move |i| (p, i)))
        .collect::<Vec<_>>();
    assert_eq!(all, expected);
}
