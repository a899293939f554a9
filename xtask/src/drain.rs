use crate::{
    common::{logger_init, Stats},
    BatchArgs, Result,
};
use batching::{BatchError, CancellationToken, TakeBatch};
use blocking_queue::{BlockingQueue, Queue};
use clap::Args;
use colored::Colorize;
use itertools::Itertools;

#[derive(Args)]
pub(crate) struct DrainArgs {
    /// Number of items put into the queue before it is closed.
    #[clap(short, long, default_value_t = 10)]
    items: usize,
    #[clap(flatten)]
    batch: BatchArgs,
}

impl DrainArgs {
    pub fn invoke(self) -> Result {
        logger_init(self.batch.log.as_deref());

        let queue = (0..self.items).collect::<Queue<_>>();
        queue.close();
        info!("draining {} item(s), max {} per batch", self.items, self.batch.max_count);

        let cancel = CancellationToken::new();
        let mut stats = Stats::default();
        loop {
            match queue.take_at_least_one(self.batch.max_count, &cancel) {
                Ok(batch) => {
                    println!("{:>4}: [{}]", stats.batches, batch.iter().join(", "));
                    stats.push(batch.len());
                }
                Err(BatchError::Exhausted) => break,
                Err(e) => return Err(e),
            }
        }
        println!(
            "{}",
            format!("{} item(s) in {} batch(es), queue exhausted", stats.items, stats.batches)
                .green()
        );
        Ok(())
    }
}
