use crate::{BatchError, TakeBatch};
use common::{BlockingQueue, CancellationToken};
use std::iter::FusedIterator;

/// 消费循环：反复执行 [`TakeBatch::take_at_least_one`]，直到队列耗尽或被取消。
pub struct Batches<'a, Q: ?Sized> {
    queue: &'a Q,
    max_count: usize,
    cancel: CancellationToken,
    stopped: Option<BatchError>,
}

impl<'a, Q: ?Sized> Batches<'a, Q> {
    #[inline]
    pub(crate) fn new(queue: &'a Q, max_count: usize, cancel: CancellationToken) -> Self {
        Self {
            queue,
            max_count,
            cancel,
            stopped: None,
        }
    }

    /// 迭代结束的原因，迭代尚未结束时为 `None`。
    #[inline]
    pub fn stopped(&self) -> Option<BatchError> {
        self.stopped
    }

    #[inline]
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

impl<Q: BlockingQueue + ?Sized> Iterator for Batches<'_, Q> {
    type Item = Vec<Q::Item>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.stopped.is_some() {
            return None;
        }
        match self.queue.take_at_least_one(self.max_count, &self.cancel) {
            Ok(batch) => Some(batch),
            Err(e) => {
                debug!("batches stopped: {e}");
                self.stopped = Some(e);
                None
            }
        }
    }
}

impl<Q: BlockingQueue + ?Sized> FusedIterator for Batches<'_, Q> {}

#[test]
fn test_batches_until_exhausted() {
    use blocking_queue::Queue;

    let queue = Queue::from(vec![0, 1, 2, 3, 4]);
    queue.close();

    let mut batches = queue.batches(2, CancellationToken::new());
    assert_eq!(batches.stopped(), None);
    assert_eq!(batches.next(), Some(vec![0, 1]));
    assert_eq!(batches.next(), Some(vec![2, 3]));
    assert_eq!(batches.next(), Some(vec![4]));
    assert_eq!(batches.next(), None);
    assert_eq!(batches.stopped(), Some(BatchError::Exhausted));
    assert_eq!(batches.next(), None);
}

#[test]
fn test_batches_cancelled() {
    use blocking_queue::Queue;
    use std::{thread, time::Duration};

    let queue = Queue::<u32>::new();
    let producer = {
        let queue = queue.clone();
        thread::spawn(move || {
            for i in 0..3 {
                queue.insert(i).unwrap();
            }
        })
    };
    producer.join().unwrap();

    let cancel = CancellationToken::new();
    let timer = cancel.cancel_after(Duration::from_millis(100));
    let mut batches = queue.batches(10, cancel);
    assert_eq!(batches.next(), Some(vec![0, 1, 2]));
    assert_eq!(batches.next(), None);
    assert_eq!(batches.stopped(), Some(BatchError::Cancelled));
    assert!(batches.cancellation_token().is_cancelled());
    timer.join().unwrap();
}

#[test]
fn test_batches_invalid_max_count() {
    use blocking_queue::Queue;

    let queue = Queue::from(vec![1]);
    let mut batches = queue.batches(0, CancellationToken::new());
    assert_eq!(batches.next(), None);
    assert_eq!(batches.stopped(), Some(BatchError::InvalidArgument(0)));
    assert_eq!(queue.len(), 1);
}
