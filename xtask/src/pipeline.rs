use crate::{
    common::{join_logged, logger_init, Stats},
    BatchArgs, Result,
};
use batching::{BatchError, CancellationToken, TakeBatch};
use blocking_queue::{BlockingQueue, Queue};
use clap::Args;
use colored::Colorize;
use std::{
    thread,
    time::{Duration, Instant},
};

#[derive(Args)]
pub(crate) struct PipelineArgs {
    /// Number of producer threads.
    #[clap(short, long, default_value_t = 4)]
    producers: usize,
    /// Items inserted by each producer.
    #[clap(short, long, default_value_t = 1000)]
    items: usize,
    /// Pause between two insertions of one producer, in milliseconds.
    #[clap(long, default_value_t = 0)]
    interval_ms: u64,
    /// Cancel the consumer after this many seconds.
    #[clap(long)]
    timeout_secs: Option<u64>,
    #[clap(flatten)]
    batch: BatchArgs,
}

impl PipelineArgs {
    pub fn invoke(self) -> Result {
        logger_init(self.batch.log.as_deref());

        let queue = Queue::<(usize, usize)>::new();
        let cancel = CancellationToken::new();
        if let Some(secs) = self.timeout_secs {
            // 计时线程随进程退出
            let _ = cancel.cancel_after(Duration::from_secs(secs));
        }

        let interval = Duration::from_millis(self.interval_ms);
        let producers = (0..self.producers)
            .map(|p| {
                let queue = queue.clone();
                let items = self.items;
                thread::spawn(move || {
                    for i in 0..items {
                        if queue.insert((p, i)).is_err() {
                            warn!("producer {p} stopped early at item {i}");
                            break;
                        }
                        if !interval.is_zero() {
                            thread::sleep(interval);
                        }
                    }
                })
            })
            .collect::<Vec<_>>();
        let closer = {
            let queue = queue.clone();
            thread::spawn(move || {
                for (p, producer) in producers.into_iter().enumerate() {
                    join_logged(&format!("producer {p}"), producer);
                }
                info!("all producers finished");
                queue.close();
            })
        };

        let time = Instant::now();
        let mut stats = Stats::default();
        let mut batches = queue.batches(self.batch.max_count, cancel);
        for batch in batches.by_ref() {
            debug!("consumed batch of {}", batch.len());
            stats.push(batch.len());
        }
        let time = time.elapsed();

        // 取消时生产者可能仍在运行，关闭队列让它们退出
        queue.close();
        join_logged("closer", closer);

        match batches.stopped() {
            Some(BatchError::Exhausted) | None => {}
            Some(BatchError::Cancelled) => {
                warn!("consumer cancelled, {} item(s) left in queue", queue.len())
            }
            Some(e) => return Err(e),
        }

        println!(
            "{}",
            format!(
                "{} item(s) in {} batch(es), mean {:.2}, largest {}, {time:?}",
                stats.items,
                stats.batches,
                stats.mean(),
                stats.largest,
            )
            .green()
        );
        Ok(())
    }
}
