//! 阻塞队列上的微批处理。
//!
//! 消费者每次唤醒时取走一批元素而不是一个，
//! 以摊薄加锁、分发和 I/O 往返等逐元素开销。

mod batches;

use std::{error, fmt, iter};

pub use batches::Batches;
pub use common::{BlockingQueue, CancellationToken, TakeError};

#[macro_use]
extern crate log;

/// 为任意 [`BlockingQueue`] 提供批量取出操作。
///
/// 两个操作都不持有额外的锁，也不保存状态；一批之内的顺序即元素离开队列的顺序。
pub trait TakeBatch: BlockingQueue {
    /// 不等待，取出此刻可用的至多 `max_count` 个元素。
    ///
    /// 队列为空（包括已关闭且为空）时返回空批，而不是错误。
    fn take_available(&self, max_count: usize) -> Result<Vec<Self::Item>, BatchError> {
        check(max_count)?;
        let batch = iter::from_fn(|| self.try_take())
            .take(max_count)
            .collect::<Vec<_>>();
        trace!("took {} available item(s)", batch.len());
        Ok(batch)
    }

    /// 阻塞直到取得第一个元素，然后不再等待，顺带取出此刻可用的元素，总数不超过 `max_count`。
    ///
    /// 只有等待第一个元素时会挂起线程。取消只中止这次等待；
    /// 队列已关闭但仍有元素时照常返回，取空之后才返回 [`BatchError::Exhausted`]。
    fn take_at_least_one(
        &self,
        max_count: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<Self::Item>, BatchError> {
        check(max_count)?;
        let mut batch = vec![self.take(cancel)?];
        if max_count > 1 {
            batch.extend(self.take_available(max_count - 1)?);
        }
        trace!("took batch of {} item(s)", batch.len());
        Ok(batch)
    }

    /// 以 `max_count` 为上限连续取批，见 [`Batches`]。
    #[inline]
    fn batches(&self, max_count: usize, cancel: CancellationToken) -> Batches<'_, Self> {
        Batches::new(self, max_count, cancel)
    }
}

impl<Q: BlockingQueue + ?Sized> TakeBatch for Q {}

#[inline]
fn check(max_count: usize) -> Result<(), BatchError> {
    if max_count < 1 {
        Err(BatchError::InvalidArgument(max_count))
    } else {
        Ok(())
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum BatchError {
    /// `max_count` 小于 1。
    InvalidArgument(usize),
    /// 等待第一个元素时被取消。
    Cancelled,
    /// 队列已关闭且为空。
    Exhausted,
}

impl From<TakeError> for BatchError {
    #[inline]
    fn from(e: TakeError) -> Self {
        match e {
            TakeError::Cancelled => Self::Cancelled,
            TakeError::Exhausted => Self::Exhausted,
        }
    }
}

impl error::Error for BatchError {}
impl fmt::Display for BatchError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::InvalidArgument(n) => write!(f, "max_count {n} is invalid, must be 1 or higher"),
            Self::Cancelled => fmt::Display::fmt(&TakeError::Cancelled, f),
            Self::Exhausted => fmt::Display::fmt(&TakeError::Exhausted, f),
        }
    }
}

#[cfg(test)]
const PATIENCE: std::time::Duration = std::time::Duration::from_secs(2);

/// 记录各原语调用次数的测试队列。
#[cfg(test)]
#[derive(Default)]
struct Recording {
    items: std::sync::Mutex<std::collections::VecDeque<i32>>,
    takes: std::sync::atomic::AtomicUsize,
    try_takes: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
impl Recording {
    fn with(items: impl IntoIterator<Item = i32>) -> Self {
        Self {
            items: std::sync::Mutex::new(items.into_iter().collect()),
            ..Default::default()
        }
    }

    fn calls(&self) -> (usize, usize) {
        use std::sync::atomic::Ordering::SeqCst;
        (self.takes.load(SeqCst), self.try_takes.load(SeqCst))
    }
}

#[cfg(test)]
impl BlockingQueue for Recording {
    type Item = i32;

    fn take(&self, _: &CancellationToken) -> Result<i32, TakeError> {
        self.takes.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.items
            .lock()
            .unwrap()
            .pop_front()
            .ok_or(TakeError::Exhausted)
    }

    fn try_take(&self) -> Option<i32> {
        self.try_takes
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.items.lock().unwrap().pop_front()
    }

    fn insert(&self, item: i32) -> Result<(), common::Closed<i32>> {
        self.items.lock().unwrap().push_back(item);
        Ok(())
    }

    fn close(&self) {}
}

#[test]
fn test_take_available_empty() {
    use blocking_queue::Queue;

    let queue = Queue::<i32>::new();
    assert_eq!(queue.take_available(10), Ok(vec![]));
}

#[test]
fn test_take_available_all() {
    use blocking_queue::Queue;

    let queue = (0..117).collect::<Queue<_>>();
    let batch = queue.take_available(usize::MAX).unwrap();
    assert_eq!(batch, (0..117).collect::<Vec<_>>());
    assert!(queue.is_empty());
}

#[test]
fn test_take_available_capped() {
    use blocking_queue::Queue;

    let queue = (0..117).collect::<Queue<_>>();
    let batch = queue.take_available(10).unwrap();
    assert_eq!(batch, (0..10).collect::<Vec<_>>());
    assert_eq!(queue.len(), 107);
}

#[test]
fn test_take_available_counts() {
    use blocking_queue::Queue;

    for n in 0..6 {
        for max_count in 1..8 {
            let queue = (0..n).collect::<Queue<_>>();
            let batch = queue.take_available(max_count).unwrap();
            assert_eq!(batch, (0..n.min(max_count)).collect::<Vec<_>>());
            assert_eq!(queue.len(), n.saturating_sub(max_count));
        }
    }
}

#[test]
fn test_take_available_after_close() {
    use blocking_queue::Queue;

    let queue = Queue::from(vec![0, 1, 2]);
    queue.close();
    assert_eq!(queue.take_available(usize::MAX), Ok(vec![0, 1, 2]));
    assert_eq!(queue.take_available(usize::MAX), Ok(vec![]));
}

#[test]
fn test_take_available_after_close_in_batches() {
    use blocking_queue::Queue;

    let queue = Queue::from(vec![0, 1, 2, 3, 4]);
    queue.close();
    assert_eq!(queue.take_available(2), Ok(vec![0, 1]));
    assert_eq!(queue.take_available(2), Ok(vec![2, 3]));
    assert_eq!(queue.take_available(2), Ok(vec![4]));
    assert_eq!(queue.take_available(2), Ok(vec![]));
    assert!(queue.is_completed());

    // 已取消的令牌不取走任何元素
    let queue = Queue::from(vec![7, 8]);
    let cancel = CancellationToken::new();
    cancel.cancel();
    assert_eq!(
        queue.take_at_least_one(2, &cancel),
        Err(BatchError::Cancelled)
    );
    assert_eq!(queue.len(), 2);
}

#[test]
fn test_take_available_stops_at_max_count() {
    let queue = Recording::with(0..10);
    assert_eq!(queue.take_available(3), Ok(vec![0, 1, 2]));
    assert_eq!(queue.calls(), (0, 3));

    let queue = Recording::with(0..2);
    assert_eq!(queue.take_available(5), Ok(vec![0, 1]));
    assert_eq!(queue.calls(), (0, 3));
}

#[test]
fn test_invalid_max_count() {
    let queue = Recording::with(0..3);
    assert_eq!(queue.take_available(0), Err(BatchError::InvalidArgument(0)));
    assert_eq!(
        queue.take_at_least_one(0, &CancellationToken::new()),
        Err(BatchError::InvalidArgument(0))
    );
    assert_eq!(queue.calls(), (0, 0));
    assert_eq!(
        BatchError::InvalidArgument(0).to_string(),
        "max_count 0 is invalid, must be 1 or higher"
    );
}

#[test]
fn test_max_count_one_skips_extension() {
    let queue = Recording::with(0..3);
    assert_eq!(
        queue.take_at_least_one(1, &CancellationToken::new()),
        Ok(vec![0])
    );
    assert_eq!(queue.calls(), (1, 0));
}

#[test]
fn test_take_at_least_one_present() {
    use blocking_queue::Queue;

    let cancel = CancellationToken::new();

    let queue = Queue::from(vec![78]);
    assert_eq!(queue.take_at_least_one(3, &cancel), Ok(vec![78]));

    let queue = Queue::from(vec![78, 79]);
    assert_eq!(queue.take_at_least_one(3, &cancel), Ok(vec![78, 79]));

    let queue = Queue::from(vec![78, 79, 80, 81]);
    assert_eq!(queue.take_at_least_one(3, &cancel), Ok(vec![78, 79, 80]));
    assert_eq!(queue.take_at_least_one(3, &cancel), Ok(vec![81]));
}

#[test]
fn test_take_at_least_one_blocks() {
    use blocking_queue::Queue;
    use std::{sync::mpsc::channel, thread, time::Duration};

    let queue = Queue::<i32>::new();
    let (sender, receiver) = channel();
    let consumer = {
        let queue = queue.clone();
        thread::spawn(move || {
            sender
                .send(queue.take_at_least_one(3, &CancellationToken::new()))
                .unwrap()
        })
    };
    // 没有元素时不会返回
    assert!(receiver.recv_timeout(Duration::from_millis(500)).is_err());

    queue.insert(78).unwrap();
    assert_eq!(receiver.recv_timeout(PATIENCE), Ok(Ok(vec![78])));
    consumer.join().unwrap();
}

#[test]
fn test_take_at_least_one_cancelled() {
    use blocking_queue::Queue;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let queue = Queue::<i32>::new();
    assert_eq!(
        queue.take_at_least_one(10, &cancel),
        Err(BatchError::Cancelled)
    );
}

#[test]
fn test_take_at_least_one_cancelled_while_waiting() {
    use blocking_queue::Queue;
    use std::{sync::mpsc::channel, thread, time::Duration};

    let queue = Queue::<i32>::new();
    let cancel = CancellationToken::new();
    let (sender, receiver) = channel();
    let consumer = {
        let queue = queue.clone();
        let cancel = cancel.clone();
        thread::spawn(move || sender.send(queue.take_at_least_one(10, &cancel)).unwrap())
    };
    assert!(receiver.recv_timeout(Duration::from_millis(200)).is_err());

    cancel.cancel();
    assert_eq!(
        receiver.recv_timeout(PATIENCE),
        Ok(Err(BatchError::Cancelled))
    );
    consumer.join().unwrap();

    // 之后插入的元素由下一次调用取得
    queue.insert(5).unwrap();
    assert_eq!(
        queue.take_at_least_one(10, &CancellationToken::new()),
        Ok(vec![5])
    );
}

#[test]
fn test_take_at_least_one_timeout() {
    use blocking_queue::Queue;
    use std::time::{Duration, Instant};

    let queue = Queue::<i32>::new();
    let cancel = CancellationToken::new();
    let start = Instant::now();
    let timer = cancel.cancel_after(Duration::from_millis(100));

    assert_eq!(
        queue.take_at_least_one(10, &cancel),
        Err(BatchError::Cancelled)
    );
    assert!(start.elapsed() >= Duration::from_millis(100));
    timer.join().unwrap();
}

#[test]
fn test_take_at_least_one_after_close() {
    use blocking_queue::Queue;

    let queue = Queue::from(vec![0, 1, 2, 3, 4]);
    queue.close();

    let cancel = CancellationToken::new();
    assert_eq!(queue.take_at_least_one(2, &cancel), Ok(vec![0, 1]));
    assert_eq!(queue.take_at_least_one(2, &cancel), Ok(vec![2, 3]));
    assert_eq!(queue.take_at_least_one(2, &cancel), Ok(vec![4]));
    assert_eq!(
        queue.take_at_least_one(2, &cancel),
        Err(BatchError::Exhausted)
    );
    assert_eq!(queue.take_available(2), Ok(vec![]));
}

#[test]
fn test_take_at_least_one_closed_while_waiting() {
    use blocking_queue::Queue;
    use std::{sync::mpsc::channel, thread, time::Duration};

    let queue = Queue::<i32>::new();
    let (sender, receiver) = channel();
    let consumer = {
        let queue = queue.clone();
        thread::spawn(move || {
            sender
                .send(queue.take_at_least_one(3, &CancellationToken::new()))
                .unwrap()
        })
    };
    assert!(receiver.recv_timeout(Duration::from_millis(200)).is_err());

    queue.close();
    assert_eq!(
        receiver.recv_timeout(PATIENCE),
        Ok(Err(BatchError::Exhausted))
    );
    consumer.join().unwrap();
}

#[test]
fn test_concurrent_batches() {
    use blocking_queue::Queue;
    use std::thread;

    const PRODUCERS: u32 = 4;
    const ITEMS: u32 = 500;

    let queue = Queue::<(u32, u32)>::new();
    let consumers = (0..2)
        .map(|_| {
            let queue = queue.clone();
            thread::spawn(move || {
                let mut batches = queue.batches(16, CancellationToken::new());
                let received = batches.by_ref().collect::<Vec<_>>();
                assert_eq!(batches.stopped(), Some(BatchError::Exhausted));
                received
            })
        })
        .collect::<Vec<_>>();
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
    for producer in producers {
        producer.join().unwrap();
    }
    queue.close();

    let mut all = Vec::new();
    for consumer in consumers {
        let batches = consumer.join().unwrap();
        assert!(batches.iter().all(|b| (1..=16).contains(&b.len())));
        let received = batches.into_iter().flatten().collect::<Vec<_>>();
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
