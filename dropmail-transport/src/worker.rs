use async_trait::async_trait;
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::oneshot,
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tracing::Instrument as _;

/// one iteration of a periodic background task
///
/// errors are the job's business: an iteration that fails on one entity
/// logs it and carries on with the others. Nothing is returned.
#[async_trait]
pub trait Job: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn run_once(&self);
}

/// handle of a running periodic [`Job`]
///
/// the job runs once as soon as the worker is spawned and then every
/// `period`. Dropping the handle without calling [`Worker::stop`] leaves
/// the task running until the runtime shuts down.
pub struct Worker {
    name: &'static str,
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl Worker {
    pub fn spawn<J>(job: Arc<J>, period: Duration) -> Self
    where
        J: Job,
    {
        let name = job.name();
        let (stop, mut stop_receiver) = oneshot::channel::<()>();

        let span = tracing::info_span!("worker", name, period = ?period);
        let handle = tokio::spawn(
            async move {
                let mut ticker = time::interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

                loop {
                    tokio::select! {
                        _ = &mut stop_receiver => break,
                        _ = ticker.tick() => {}
                    }

                    // the stop signal is only checked in between 2
                    // iterations, an in flight iteration always completes
                    job.run_once().await;
                }

                tracing::debug!("worker stopped");
            }
            .instrument(span),
        );

        Self { name, stop, handle }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// signal the worker to stop and wait for the current iteration to
    /// complete
    pub async fn stop(self) {
        // the receiver is gone only if the task already terminated
        let _ = self.stop.send(());

        if let Err(error) = self.handle.await {
            tracing::error!(worker = self.name, reason = %error, "worker terminated abnormally");
        }
    }
}

/// the set of background workers started together
#[derive(Default)]
pub struct Workers {
    workers: Vec<Worker>,
}

impl Workers {
    pub fn push(&mut self, worker: Worker) {
        self.workers.push(worker)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// stop all the workers, one after the other
    pub async fn stop(self) {
        for worker in self.workers {
            let name = worker.name();
            worker.stop().await;
            tracing::info!(worker = name, "worker stopped");
        }
    }
}
