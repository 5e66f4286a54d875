use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use tokio::task_local;

use super::TraceStep;

task_local! {
    static CURRENT_TRACE: Arc<Mutex<Vec<TraceStep>>>;
}

/// Runs `fut` with an active trace scope and returns what it recorded.
///
/// The scope is task-local: steps recorded by tasks spawned from inside `fut`
/// are not captured.
pub async fn scope<F, R>(fut: F) -> (R, Vec<TraceStep>)
where
    F: Future<Output = R>,
{
    let steps = Arc::new(Mutex::new(Vec::new()));
    let result = CURRENT_TRACE.scope(steps.clone(), fut).await;

    let steps = match Arc::try_unwrap(steps) {
        Ok(mutex) => mutex.into_inner(),
        Err(shared) => shared.lock().clone(), // still referenced by an orphaned task
    };
    (result, steps)
}

pub fn is_tracing() -> bool {
    CURRENT_TRACE.try_with(|_| ()).is_ok()
}

/// Appends a step to the active trace; a no-op outside [`scope`].
pub fn record_step(step: TraceStep) {
    let _ = CURRENT_TRACE.try_with(|trace| trace.lock().push(step));
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexMap;

    #[tokio::test]
    async fn test_scope_collects_steps() {
        let (value, steps) = scope(async {
            assert!(is_tracing());
            record_step(TraceStep::new(0, IndexMap::new(), IndexMap::new()));
            record_step(TraceStep::new(1, IndexMap::new(), IndexMap::new()));
            7
        })
        .await;

        assert_eq!(value, 7);
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[1].predictor_position, 1);
    }

    #[tokio::test]
    async fn test_record_outside_scope_is_noop() {
        assert!(!is_tracing());
        record_step(TraceStep::new(0, IndexMap::new(), IndexMap::new()));
        let (_, steps) = scope(async {}).await;
        assert!(steps.is_empty());
    }
}
