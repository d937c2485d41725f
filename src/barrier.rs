use crate::record::StepLayout;
use crate::utils::errors::{RecordError, Result};
use log::{debug, info};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierState {
    Waiting { reported: usize },
    Satisfied,
    TimedOut { reported: usize },
}

/// Rank 0's wait for every peer's record to appear in the step directory.
pub struct CompletionBarrier<'a> {
    layout: &'a StepLayout,
    num_procs: u32,
    timeout: Duration,
    poll_interval: Duration,
}

impl<'a> CompletionBarrier<'a> {
    pub fn new(layout: &'a StepLayout, num_procs: u32, timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            layout,
            num_procs,
            timeout,
            poll_interval,
        }
    }

    /// Records present for ranks of this step. Stale files for ranks outside
    /// the step are not counted.
    pub fn reported(&self) -> Result<usize> {
        Ok(self
            .layout
            .reported_ranks()?
            .into_iter()
            .filter(|rank| *rank < self.num_procs)
            .count())
    }

    pub fn poll(&self, elapsed: Duration) -> Result<BarrierState> {
        let reported = self.reported()?;
        if reported == self.num_procs as usize {
            Ok(BarrierState::Satisfied)
        } else if elapsed > self.timeout {
            Ok(BarrierState::TimedOut { reported })
        } else {
            Ok(BarrierState::Waiting { reported })
        }
    }

    /// Returns how long the wait took.
    pub async fn wait(&self) -> Result<Duration> {
        let started = Instant::now();
        loop {
            let elapsed = started.elapsed();
            match self.poll(elapsed)? {
                BarrierState::Satisfied => {
                    info!("All {} processes reported after {:?}", self.num_procs, elapsed);
                    return Ok(elapsed);
                }
                BarrierState::TimedOut { reported } => {
                    return Err(RecordError::BarrierTimeout {
                        reported,
                        expected: self.num_procs as usize,
                        waited: elapsed,
                    });
                }
                BarrierState::Waiting { reported } => {
                    debug!("{} of {} processes reported", reported, self.num_procs);
                }
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
