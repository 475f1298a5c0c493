use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error};

use crate::error::SkipReason;

/// Result of one unit of work (a grid configuration or a model/case pair)
#[derive(Debug, Clone)]
pub enum WorkOutcome<T> {
    Done(T),
    Skipped(SkipReason),
    Failed(String),
}

impl<T> WorkOutcome<T> {
    pub fn done(&self) -> Option<&T> {
        match self {
            WorkOutcome::Done(value) => Some(value),
            _ => None,
        }
    }

    pub fn into_done(self) -> Option<T> {
        match self {
            WorkOutcome::Done(value) => Some(value),
            _ => None,
        }
    }

    /// Short status for log lines
    pub fn status(&self) -> String {
        match self {
            WorkOutcome::Done(_) => "done".to_string(),
            WorkOutcome::Skipped(reason) => format!("skipped: {}", reason),
            WorkOutcome::Failed(msg) => format!("failed: {}", msg),
        }
    }
}

/// Counts of each outcome kind across a batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutcomeTally {
    pub done: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl OutcomeTally {
    pub fn of<'a, T: 'a>(outcomes: impl IntoIterator<Item = &'a WorkOutcome<T>>) -> Self {
        let mut tally = Self::default();
        for outcome in outcomes {
            match outcome {
                WorkOutcome::Done(_) => tally.done += 1,
                WorkOutcome::Skipped(_) => tally.skipped += 1,
                WorkOutcome::Failed(_) => tally.failed += 1,
            }
        }
        tally
    }
}

/// Run `job` over every item on the blocking pool, at most `max_parallel` at a time
///
/// Results come back in item order regardless of completion order. A panicking
/// job is reported as `Failed` for its item only.
pub async fn dispatch<I, T, F>(items: Vec<I>, max_parallel: usize, job: F) -> Vec<(I, WorkOutcome<T>)>
where
    I: Clone + Send + 'static,
    T: Send + 'static,
    F: Fn(I) -> WorkOutcome<T> + Send + Sync + 'static,
{
    let job = Arc::new(job);
    let semaphore = Arc::new(Semaphore::new(max_parallel.max(1)));
    let mut tasks = JoinSet::new();

    debug!("Dispatching {} work items ({} in parallel)", items.len(), max_parallel.max(1));

    for (index, item) in items.iter().cloned().enumerate() {
        let job = Arc::clone(&job);
        let semaphore = Arc::clone(&semaphore);
        tasks.spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => return (index, WorkOutcome::Failed(e.to_string())),
            };
            let outcome = match tokio::task::spawn_blocking(move || job(item)).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!("Work item {} panicked: {}", index, e);
                    WorkOutcome::Failed(format!("worker panicked: {}", e))
                }
            };
            (index, outcome)
        });
    }

    let mut slots: Vec<Option<WorkOutcome<T>>> = (0..items.len()).map(|_| None).collect();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((index, outcome)) => slots[index] = Some(outcome),
            Err(e) => error!("Work task aborted: {}", e),
        }
    }

    items
        .into_iter()
        .zip(slots)
        .map(|(item, slot)| {
            let outcome = slot.unwrap_or_else(|| WorkOutcome::Failed("task aborted".to_string()));
            (item, outcome)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_results_keep_item_order() {
        let items: Vec<u64> = vec![30, 5, 20, 1];
        let results = dispatch(items, 4, |ms| {
            std::thread::sleep(Duration::from_millis(ms));
            WorkOutcome::Done(ms * 2)
        })
        .await;

        let values: Vec<u64> = results.iter().filter_map(|(_, o)| o.done().copied()).collect();
        assert_eq!(values, vec![60, 10, 40, 2]);
    }

    #[tokio::test]
    async fn test_parallelism_is_bounded() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (r, p) = (Arc::clone(&running), Arc::clone(&peak));

        dispatch((0..8).collect::<Vec<u32>>(), 2, move |_| {
            let now = r.fetch_add(1, Ordering::SeqCst) + 1;
            p.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(10));
            r.fetch_sub(1, Ordering::SeqCst);
            WorkOutcome::<()>::Done(())
        })
        .await;

        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_skips_and_panics_do_not_stop_the_batch() {
        let results = dispatch(vec![0u32, 1, 2], 1, |i| match i {
            0 => WorkOutcome::Skipped(SkipReason::MissingBaseCheckpoint(PathBuf::from("m.json"))),
            1 => panic!("boom"),
            _ => WorkOutcome::Done(i),
        })
        .await;

        let tally = OutcomeTally::of(results.iter().map(|(_, o)| o));
        assert_eq!(tally, OutcomeTally { done: 1, skipped: 1, failed: 1 });
        assert!(results[0].1.status().starts_with("skipped"));
        assert_eq!(results[2].1.done(), Some(&2));
    }
}
