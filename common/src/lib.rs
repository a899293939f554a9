mod cancel;

use std::{error, fmt};

pub use cancel::{CancellationToken, Notify};

#[macro_use]
extern crate log;

/// 线程安全的生产者/消费者队列所需具备的能力。
///
/// 同一队列中的元素按插入顺序取出。
pub trait BlockingQueue {
    type Item;

    /// 阻塞直到取得一个元素、`cancel` 被触发或队列已关闭且为空。
    fn take(&self, cancel: &CancellationToken) -> Result<Self::Item, TakeError>;

    /// 立即返回，队列此刻为空时返回 `None`。
    fn try_take(&self) -> Option<Self::Item>;

    /// 插入一个元素并唤醒等待者；队列已关闭时原样退回元素。
    fn insert(&self, item: Self::Item) -> Result<(), Closed<Self::Item>>;

    /// 关闭生产端。已有元素仍可取出，取空之后 `take` 失败。
    fn close(&self);
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum TakeError {
    /// 等待期间取消令牌被触发。
    Cancelled,
    /// 队列已关闭且为空，不会再有元素到达。
    Exhausted,
}

impl error::Error for TakeError {}
impl fmt::Display for TakeError {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Cancelled => write!(f, "operation cancelled"),
            Self::Exhausted => write!(f, "collection closed for production and empty"),
        }
    }
}

/// 向已关闭的队列插入元素，原样退回该元素。
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Closed<T>(pub T);

impl<T> Closed<T> {
    #[inline]
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T: fmt::Debug> error::Error for Closed<T> {}
impl<T> fmt::Display for Closed<T> {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "collection closed for production")
    }
}

#[test]
fn test_error_display() {
    assert_eq!(TakeError::Cancelled.to_string(), "operation cancelled");
    assert_eq!(
        TakeError::Exhausted.to_string(),
        "collection closed for production and empty"
    );
    assert_eq!(Closed(7).into_inner(), 7);
}
