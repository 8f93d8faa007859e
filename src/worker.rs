//! Background execution of generation runs.
//!
//! At most one run is active per [`PipelineRunner`]. The worker thread talks
//! to the caller only through a channel of [`PipelineEvent`]s, ending with
//! exactly one `Finished`.

use crossbeam_channel::{Receiver, Sender, unbounded};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

use crate::cancel::CancelFlag;
use crate::error::{NetworkError, Result};
use crate::identity::FriendRecord;
use crate::pipeline::{Pipeline, Progress, RunOutcome};

#[derive(Debug)]
pub enum PipelineEvent {
    Progress(Progress),
    Finished(Result<RunOutcome>),
}

/// Clears the running flag when the worker is done, even if it panicked
struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct PipelineRunner {
    pipeline: Arc<Pipeline>,
    running: Arc<AtomicBool>,
}

impl PipelineRunner {
    pub fn new(pipeline: Pipeline) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start a run on a worker thread, or `AlreadyRunning` if one is active
    pub fn spawn(&self, friends: Vec<FriendRecord>) -> Result<RunHandle> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("Ignoring generate request while a run is active");
            return Err(NetworkError::AlreadyRunning);
        }
        let guard = RunningGuard(Arc::clone(&self.running));

        let (tx, rx) = unbounded();
        let cancel = CancelFlag::new();
        let pipeline = Arc::clone(&self.pipeline);
        let worker_cancel = cancel.clone();

        let join = thread::Builder::new()
            .name("friend-network-run".into())
            .spawn(move || run_worker(pipeline, friends, worker_cancel, tx, guard))?;

        debug!("Started generation worker");
        Ok(RunHandle {
            events: rx,
            cancel,
            join: Some(join),
        })
    }
}

fn run_worker(
    pipeline: Arc<Pipeline>,
    friends: Vec<FriendRecord>,
    cancel: CancelFlag,
    events: Sender<PipelineEvent>,
    guard: RunningGuard,
) {
    let result = pipeline.run(friends, &cancel, &mut |progress| {
        // A caller that dropped its handle no longer wants updates
        let _ = events.send(PipelineEvent::Progress(progress));
    });
    // Released before reporting so a caller reacting to `Finished` can start again
    drop(guard);
    let _ = events.send(PipelineEvent::Finished(result));
}

pub struct RunHandle {
    events: Receiver<PipelineEvent>,
    cancel: CancelFlag,
    join: Option<JoinHandle<()>>,
}

impl RunHandle {
    /// Ask the worker to stop at its next checkpoint
    pub fn request_cancel(&self) {
        self.cancel.request_cancel();
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub fn events(&self) -> &Receiver<PipelineEvent> {
        &self.events
    }

    pub fn wait(self) -> Result<RunOutcome> {
        self.wait_with(|_| {})
    }

    /// Block until the run finishes, handing every progress event to `on_progress`
    pub fn wait_with(mut self, mut on_progress: impl FnMut(&Progress)) -> Result<RunOutcome> {
        let mut finished = None;
        for event in self.events.iter() {
            match event {
                PipelineEvent::Progress(progress) => on_progress(&progress),
                PipelineEvent::Finished(result) => {
                    finished = Some(result);
                    break;
                }
            }
        }

        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                return Err(NetworkError::Internal("generation worker panicked".into()));
            }
        }
        finished.unwrap_or_else(|| {
            Err(NetworkError::Internal(
                "generation worker stopped without a result".into(),
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ApiOutcome, MutualsApi};
    use crate::config::{Config, DataLayout};
    use crate::session::{CookieSession, Session};
    use parking_lot::Mutex;

    /// Blocks every fetch until the test releases the gate
    struct GatedApi {
        gate: Receiver<()>,
        calls: Mutex<usize>,
    }

    impl MutualsApi for GatedApi {
        fn fetch_mutuals(&self, _session: &dyn Session, _user_id: &str) -> ApiOutcome {
            *self.calls.lock() += 1;
            let _ = self.gate.recv();
            ApiOutcome::Found(Vec::new())
        }
    }

    fn runner(dir: &tempfile::TempDir) -> (PipelineRunner, Sender<()>) {
        let (open, gate) = unbounded();
        let mut config = Config::default();
        config.fetch.min_interval_ms = 1;
        config.layout.iterations = 10;
        let pipeline = Pipeline::new(
            config,
            DataLayout::new(dir.path()),
            Arc::new(GatedApi {
                gate,
                calls: Mutex::new(0),
            }),
            Arc::new(CookieSession::new("cookie")),
        );
        (PipelineRunner::new(pipeline), open)
    }

    fn friends() -> Vec<FriendRecord> {
        vec![FriendRecord::new("a", "A"), FriendRecord::new("b", "B")]
    }

    #[test]
    fn test_second_run_rejected_while_active() {
        let dir = tempfile::tempdir().unwrap();
        let (runner, open) = runner(&dir);

        let handle = runner.spawn(friends()).unwrap();
        assert!(runner.is_running());
        assert!(matches!(
            runner.spawn(friends()),
            Err(NetworkError::AlreadyRunning)
        ));

        drop(open);
        let outcome = handle.wait().unwrap();
        assert!(!outcome.is_cancelled());
        assert!(!runner.is_running());

        // Everything is cached now, so no gate is needed
        let again = runner.spawn(friends()).unwrap().wait().unwrap();
        assert_eq!(again.report().fetch.cached, 2);
    }

    #[test]
    fn test_cancel_reports_partial_run() {
        let dir = tempfile::tempdir().unwrap();
        let (runner, open) = runner(&dir);

        let handle = runner.spawn(friends()).unwrap();
        handle.request_cancel();
        open.send(()).unwrap();

        let mut stages = Vec::new();
        let outcome = handle
            .wait_with(|progress| stages.push(progress.clone()))
            .unwrap();

        assert!(outcome.is_cancelled());
        assert_eq!(outcome.report().modularity, None);
        assert!(outcome.report().fetch.completed() < 2);
        assert!(!stages.contains(&Progress::Stage(crate::pipeline::Stage::Exporting)));
        drop(open);
    }
}
