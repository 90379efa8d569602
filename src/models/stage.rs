//! Memo slot for one lazily created resource.
//!
//! A slot moves NotStarted -> InProgress -> Ready | Failed. The move out of
//! NotStarted (or Failed, for a retry) happens under the owner's lock, so
//! concurrent first callers share one creation future instead of racing.

use futures::future::{BoxFuture, Shared};
use serde::Serialize;

use crate::engine::InferenceError;

pub(crate) type PendingInit<T> = Shared<BoxFuture<'static, Result<T, InferenceError>>>;

pub(crate) enum Stage<T: Clone> {
    NotStarted,
    InProgress(PendingInit<T>),
    Ready(T),
    Failed(InferenceError),
}

/// Observable state of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    NotStarted,
    InProgress,
    Ready,
    Failed,
}

impl<T: Clone> Default for Stage<T> {
    fn default() -> Self {
        Self::NotStarted
    }
}

impl<T: Clone> Stage<T> {
    pub(crate) fn status(&self) -> StageStatus {
        match self {
            Self::NotStarted => StageStatus::NotStarted,
            Self::InProgress(_) => StageStatus::InProgress,
            Self::Ready(_) => StageStatus::Ready,
            Self::Failed(_) => StageStatus::Failed,
        }
    }

    pub(crate) fn ready(&self) -> Option<&T> {
        match self {
            Self::Ready(value) => Some(value),
            _ => None,
        }
    }

    /// Reset to NotStarted, returning a ready value for disposal.
    pub(crate) fn take(&mut self) -> Option<T> {
        match std::mem::take(self) {
            Self::Ready(value) => Some(value),
            _ => None,
        }
    }

    /// Record the outcome of an in-flight creation. Ignored unless the slot
    /// is still waiting on it.
    pub(crate) fn settle(&mut self, result: &Result<T, InferenceError>) {
        if let Self::InProgress(_) = self {
            *self = match result {
                Ok(value) => Self::Ready(value.clone()),
                Err(error) => Self::Failed(error.clone()),
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    #[test]
    fn settle_only_applies_to_in_progress() {
        let mut stage: Stage<u32> = Stage::default();
        stage.settle(&Ok(1));
        assert_eq!(stage.status(), StageStatus::NotStarted);

        stage = Stage::InProgress(async { Ok::<u32, InferenceError>(7) }.boxed().shared());
        stage.settle(&Ok(7));
        assert_eq!(stage.ready(), Some(&7));

        stage = Stage::InProgress(async { Ok::<u32, InferenceError>(7) }.boxed().shared());
        stage.settle(&Err(InferenceError::WeightLoad("disk".into())));
        assert_eq!(stage.status(), StageStatus::Failed);
    }

    #[test]
    fn take_resets_and_yields_ready_value() {
        let mut stage = Stage::Ready(String::from("weights"));
        assert_eq!(stage.take().as_deref(), Some("weights"));
        assert_eq!(stage.status(), StageStatus::NotStarted);
        assert_eq!(stage.take(), None);
    }
}
