use facewatch_core::{ModelStore, SnapshotCell, Trainer, TrainingError, TrainingReport};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Messages sent to the training thread.
enum TrainingRequest {
    Retrain {
        reply: oneshot::Sender<Result<TrainingReport, TrainingError>>,
    },
}

/// Clone-safe handle to the training thread.
#[derive(Clone)]
pub struct TrainingHandle {
    tx: mpsc::Sender<TrainingRequest>,
    busy: Arc<AtomicBool>,
}

impl TrainingHandle {
    /// Retrain from the dataset and install the new snapshot.
    ///
    /// Rejected with `AlreadyRunning` while another retrain is in flight.
    pub async fn retrain(&self) -> Result<TrainingReport, TrainingError> {
        if self.busy.swap(true, Ordering::SeqCst) {
            return Err(TrainingError::AlreadyRunning);
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .tx
            .send(TrainingRequest::Retrain { reply: reply_tx })
            .await
            .is_err()
        {
            self.busy.store(false, Ordering::SeqCst);
            return Err(TrainingError::ChannelClosed);
        }
        reply_rx.await.map_err(|_| {
            // The thread died with the request queued or in flight.
            self.busy.store(false, Ordering::SeqCst);
            TrainingError::ChannelClosed
        })?
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }
}

/// Clears the busy flag when dropped, including while unwinding.
struct BusyGuard(Arc<AtomicBool>);

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Spawn the trainer on a dedicated OS thread.
///
/// Each successful retrain is persisted by `store` and then swapped into
/// `snapshot`, so recognizers pick it up on their next call.
pub fn spawn_trainer(
    mut trainer: Trainer,
    store: ModelStore,
    snapshot: Arc<SnapshotCell>,
) -> std::io::Result<TrainingHandle> {
    let (tx, mut rx) = mpsc::channel::<TrainingRequest>(4);
    let busy = Arc::new(AtomicBool::new(false));
    let thread_busy = Arc::clone(&busy);

    std::thread::Builder::new()
        .name("facewatch-trainer".into())
        .spawn(move || {
            tracing::info!(models = %store.root().display(), "training thread ready");
            while let Some(request) = rx.blocking_recv() {
                match request {
                    TrainingRequest::Retrain { reply } => {
                        let busy = BusyGuard(Arc::clone(&thread_busy));
                        tracing::info!(
                            dataset = %trainer.config().dataset_dir.display(),
                            "retraining"
                        );
                        let result = trainer.train_full(&store).map(|outcome| {
                            let generation = outcome.snapshot.generation().to_string();
                            snapshot.store(Some(outcome.snapshot));
                            tracing::info!(%generation, "installed new model snapshot");
                            outcome.report
                        });
                        if let Err(e) = &result {
                            tracing::error!(error = %e, "retrain failed, keeping current model");
                        }
                        drop(busy);
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("training thread exiting");
        })?;

    Ok(TrainingHandle { tx, busy })
}
