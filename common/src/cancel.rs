//! 协作式取消。

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError, Weak,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

/// 阻塞原语的唤醒钩子。
///
/// 实现者必须保证 `notify` 之后，所有正在等待的线程都会重新检查取消状态。
pub trait Notify: Send + Sync {
    fn notify(&self);
}

/// 取消令牌，克隆的令牌共享同一个取消状态。
#[derive(Clone, Default)]
pub struct CancellationToken(Arc<Internal>);

#[derive(Default)]
struct Internal {
    cancelled: AtomicBool,
    targets: Mutex<Vec<Weak<dyn Notify>>>,
}

impl CancellationToken {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.0.cancelled.load(Ordering::Acquire)
    }

    /// 请求取消，并唤醒所有登记过的阻塞原语。重复调用无效果。
    pub fn cancel(&self) {
        if self.0.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        let targets = std::mem::take(
            &mut *self
                .0
                .targets
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        debug!("cancellation requested, waking {} target(s)", targets.len());
        for target in targets.iter().filter_map(Weak::upgrade) {
            target.notify();
        }
    }

    /// 在 `delay` 之后取消，供需要超时的调用者组合使用。
    pub fn cancel_after(&self, delay: Duration) -> JoinHandle<()> {
        let token = self.clone();
        thread::spawn(move || {
            thread::sleep(delay);
            token.cancel();
        })
    }

    /// 登记唤醒目标。同一个目标只登记一次；已取消的令牌不再登记。
    pub fn register(&self, target: Weak<dyn Notify>) {
        let mut targets = self
            .0
            .targets
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if self.is_cancelled() {
            return;
        }
        targets.retain(|t| t.strong_count() > 0);
        if !targets.iter().any(|t| Weak::ptr_eq(t, &target)) {
            targets.push(target);
        }
    }
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
struct Counter(std::sync::atomic::AtomicUsize);

#[cfg(test)]
impl Notify for Counter {
    fn notify(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_cancel_notifies_once() {
    let counter = Arc::new(Counter(Default::default()));
    let weak = Arc::downgrade(&counter) as Weak<dyn Notify>;

    let token = CancellationToken::new();
    token.register(weak.clone());
    token.register(weak.clone());
    assert!(!token.is_cancelled());

    token.cancel();
    token.cancel();
    assert!(token.is_cancelled());
    assert_eq!(counter.0.load(Ordering::SeqCst), 1);

    // 取消之后的登记被忽略
    token.register(weak);
    token.cancel();
    assert_eq!(counter.0.load(Ordering::SeqCst), 1);
}

#[test]
fn test_clones_share_state() {
    let token = CancellationToken::new();
    let clone = token.clone();
    clone.cancel();
    assert!(token.is_cancelled());
}

#[test]
fn test_dropped_target_is_skipped() {
    let token = CancellationToken::new();
    {
        let counter = Arc::new(Counter(Default::default()));
        token.register(Arc::downgrade(&counter) as Weak<dyn Notify>);
    }
    token.cancel();
    assert!(token.is_cancelled());
}

#[test]
fn test_cancel_after() {
    let token = CancellationToken::new();
    let timer = token.cancel_after(Duration::from_millis(50));
    assert!(!token.is_cancelled());
    timer.join().unwrap();
    assert!(token.is_cancelled());
}
