//! Collecting stage exits.
//!
//! Every stage, thread or process, reports exactly once on a shared channel
//! when it ends. Threads report after their closure returns (so the pipe
//! ends it owned are already closed); child processes are waited on by a
//! dedicated detached thread each, so no child is left unreaped even if
//! the pipeline owner stops listening.

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::process::{Child, ExitStatus};
use std::thread;

use crossbeam_channel::{Receiver, Sender, unbounded};

use crate::stage::StageId;
use crate::{Error, Result};

/// How a stage ended.
#[derive(Debug)]
pub(crate) enum ExitReport {
    Thread(Result<()>),
    Panicked,
    Process {
        program: String,
        status: io::Result<ExitStatus>,
    },
}

#[derive(Debug)]
pub(crate) struct StageExit {
    pub stage: StageId,
    pub report: ExitReport,
}

/// Spawns stages and gathers their exit reports.
#[derive(Debug)]
pub(crate) struct Reaper {
    tx: Sender<StageExit>,
    rx: Receiver<StageExit>,
    stages: Vec<StageId>,
    outstanding: usize,
}

impl Reaper {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self {
            tx,
            rx,
            stages: Vec::new(),
            outstanding: 0,
        }
    }

    /// Stages spawned so far, in spawn order.
    pub fn stages(&self) -> &[StageId] {
        &self.stages
    }

    /// Runs `work` on a named thread that reports its result when done.
    pub fn spawn_thread<F>(&mut self, stage: StageId, work: F) -> Result<()>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let tx = self.tx.clone();
        thread::Builder::new()
            .name(format!("imgbundle-{stage}"))
            .spawn(move || {
                let report = match panic::catch_unwind(AssertUnwindSafe(work)) {
                    Ok(result) => ExitReport::Thread(result),
                    Err(_) => ExitReport::Panicked,
                };
                let _ = tx.send(StageExit { stage, report });
            })?;
        self.track(stage);
        Ok(())
    }

    /// Hands `child` to a detached thread that waits for it exactly once.
    pub fn watch_process(
        &mut self,
        stage: StageId,
        program: String,
        mut child: Child,
    ) -> Result<()> {
        let tx = self.tx.clone();
        let pid = child.id();
        let spawned = thread::Builder::new()
            .name(format!("imgbundle-reap-{pid}"))
            .spawn(move || {
                let status = child.wait();
                match &status {
                    Ok(status) => {
                        log::debug!("{stage} stage '{program}' (pid {pid}) exited: {status}")
                    }
                    Err(e) => log::debug!("could not reap '{program}' (pid {pid}): {e}"),
                }
                let _ = tx.send(StageExit {
                    stage,
                    report: ExitReport::Process { program, status },
                });
            });
        if let Err(e) = spawned {
            // Without a reaper thread the child would be left as a zombie.
            log::error!("could not start reaper for pid {pid}: {e}");
            return Err(Error::Io(e));
        }
        self.track(stage);
        Ok(())
    }

    fn track(&mut self, stage: StageId) {
        self.stages.push(stage);
        self.outstanding += 1;
        log::debug!("{stage} stage started");
    }

    /// Blocks until every spawned stage has reported, returning the reports
    /// in the order they arrived.
    pub fn drain(&mut self) -> Vec<StageExit> {
        let mut exits = Vec::with_capacity(self.outstanding);
        while self.outstanding > 0 {
            match self.rx.recv() {
                Ok(exit) => exits.push(exit),
                Err(_) => break,
            }
            self.outstanding -= 1;
        }
        exits
    }
}
