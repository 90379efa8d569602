//! Thread owning one llama.cpp context.
//!
//! `LlamaContext` borrows its model, so the context lives on a dedicated
//! thread next to an `Arc` of that model. Generations are queued to it and
//! run one at a time.

use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::Shared;
use crate::engine::{Generation, GenerationOptions, InferenceError, TextStreamSender};

struct Job {
    prompt: String,
    options: GenerationOptions,
    cancel: CancellationToken,
    sink: TextStreamSender,
    reply: oneshot::Sender<Result<Generation, InferenceError>>,
}

pub(super) struct ContextWorker {
    jobs: Mutex<Option<mpsc::UnboundedSender<Job>>>,
}

impl ContextWorker {
    /// Create the context on a new thread. Resolves once it exists or failed.
    pub(super) async fn spawn(shared: Arc<Shared>) -> Result<Self, InferenceError> {
        let (jobs, mut queue) = mpsc::unbounded_channel::<Job>();
        let (ready_tx, ready_rx) = oneshot::channel();

        thread::Builder::new()
            .name("gguf-context".into())
            .spawn(move || {
                let mut ctx = match shared.model.create_context(&shared.config, false) {
                    Ok(ctx) => {
                        let _ = ready_tx.send(Ok(()));
                        ctx
                    }
                    Err(error) => {
                        let _ = ready_tx.send(Err(error));
                        return;
                    }
                };
                while let Some(job) = queue.blocking_recv() {
                    let result = shared.model.generate(
                        &mut ctx,
                        &job.prompt,
                        &job.options,
                        &shared.config,
                        &job.cancel,
                        &job.sink,
                    );
                    let _ = job.reply.send(result);
                }
                tracing::debug!("gguf context released");
            })
            .map_err(|e| InferenceError::ContextCreation(format!("context thread: {e}")))?;

        ready_rx
            .await
            .map_err(|_| InferenceError::ContextCreation("context thread exited".into()))??;
        Ok(Self {
            jobs: Mutex::new(Some(jobs)),
        })
    }

    pub(super) async fn generate(
        &self,
        prompt: String,
        options: &GenerationOptions,
        cancel: &CancellationToken,
        sink: TextStreamSender,
    ) -> Result<Generation, InferenceError> {
        let (reply, result) = oneshot::channel();
        let job = Job {
            prompt,
            options: options.clone(),
            cancel: cancel.clone(),
            sink,
            reply,
        };
        let queued = match self.jobs.lock().as_ref() {
            Some(jobs) => jobs.send(job).is_ok(),
            None => false,
        };
        if !queued {
            return Err(InferenceError::ModelNotLoaded("context was disposed".into()));
        }
        result
            .await
            .map_err(|_| InferenceError::Generation("context thread exited".into()))?
    }

    /// Stop taking jobs. The thread frees the context after the job in flight.
    pub(super) fn close(&self) {
        self.jobs.lock().take();
    }
}
