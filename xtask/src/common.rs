use log::LevelFilter;
use simple_logger::SimpleLogger;
use std::thread::JoinHandle;

pub(crate) fn logger_init(log_level: Option<&str>) {
    let log = log_level
        .and_then(|log| match log.to_lowercase().as_str() {
            "off" | "none" => Some(LevelFilter::Off),
            "trace" => Some(LevelFilter::Trace),
            "debug" => Some(LevelFilter::Debug),
            "info" => Some(LevelFilter::Info),
            "warn" => Some(LevelFilter::Warn),
            "error" => Some(LevelFilter::Error),
            _ => None,
        })
        .unwrap_or(LevelFilter::Warn);
    if let Err(e) = SimpleLogger::new().with_level(log).init() {
        eprintln!("Failed to init logger: {e}");
    }
}

/// 等待线程结束，线程 panic 时记录警告并返回 `false`。
pub(crate) fn join_logged(name: &str, handle: JoinHandle<()>) -> bool {
    match handle.join() {
        Ok(()) => true,
        Err(e) => {
            let msg = e
                .downcast_ref::<&str>()
                .copied()
                .or_else(|| e.downcast_ref::<String>().map(String::as_str))
                .unwrap_or("unknown payload");
            warn!("{name} panicked: {msg}");
            false
        }
    }
}

#[derive(Default)]
pub(crate) struct Stats {
    pub batches: usize,
    pub items: usize,
    pub largest: usize,
}

impl Stats {
    #[inline]
    pub fn push(&mut self, len: usize) {
        self.batches += 1;
        self.items += len;
        self.largest = self.largest.max(len);
    }

    #[inline]
    pub fn mean(&self) -> f64 {
        if self.batches == 0 {
            0.
        } else {
            self.items as f64 / self.batches as f64
        }
    }
}

#[test]
fn test_stats() {
    let mut stats = Stats::default();
    assert_eq!(stats.mean(), 0.);
    for len in [3, 1, 2] {
        stats.push(len);
    }
    assert_eq!(stats.batches, 3);
    assert_eq!(stats.items, 6);
    assert_eq!(stats.largest, 3);
    assert_eq!(stats.mean(), 2.);
}

#[test]
fn test_join_logged() {
    use std::thread;

    assert!(join_logged("worker", thread::spawn(|| {})));
    assert!(!join_logged(
        "worker",
        thread::spawn(|| panic!("producer failed"))
    ));
}
