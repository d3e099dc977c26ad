/*
Copyright 2025 The Hyperlight Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

use std::thread;
use std::time::{Duration, Instant};

use tracing::{Span, instrument};

use super::{Stream, StreamState};
use crate::error::{QueueError, Result};
use crate::metrics::{CounterMetric, EmittableMetric, ReclaimPath};
use crate::queue::{Deferred, SlotState, TaskFailure};

/// How far a reclaim may walk past `head`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReclaimLimit {
    /// At most `max_reclaim_per_call` cells
    Limited,
    /// As far as the hardware has retired
    Unlimited,
    /// Up to a position, clamped like `Limited`
    To(u16),
}

impl Stream {
    /// Reclaim finished tasks from the head of the ring.
    ///
    /// A limited reclaim walks at most `max_reclaim_per_call` cells.
    /// Decoupled streams never reclaim on the caller's thread: this only
    /// wakes the recycle worker and returns 0.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    pub fn reclaim(&self, limited: bool) -> Result<u32> {
        let limit = if limited {
            ReclaimLimit::Limited
        } else {
            ReclaimLimit::Unlimited
        };
        self.reclaim_inline(limit)
    }

    /// Reclaim toward `target`, bounded by hardware progress and by
    /// `max_reclaim_per_call`. Returns 0 when `target` is the head or lies
    /// outside the in-flight window.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    pub fn reclaim_to(&self, target: u16) -> Result<u32> {
        let target = self.lock_state()?.queue.ring().check(target)?;
        self.reclaim_inline(ReclaimLimit::To(target))
    }

    fn reclaim_inline(&self, limit: ReclaimLimit) -> Result<u32> {
        if self.is_decoupled() {
            self.ctx.wake_recycle();
            return Ok(0);
        }
        let mut deferred = Deferred::default();
        let result = {
            let mut state = self.lock_state()?;
            self.reclaim_locked(&mut state, limit, ReclaimPath::Inline, &mut deferred)
        };
        deferred.run();
        result
    }

    /// Reclaim everything in flight regardless of hardware progress.
    ///
    /// Tasks that had not finished get their callback with
    /// [`TaskFailure::Aborted`]. Device abort ends the clear early.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    pub fn force_clear(&self, timeout: Duration) -> Result<u32> {
        let deadline = Instant::now().checked_add(timeout);
        self.lock_state()?.force_recycle = true;
        let mut total = 0;
        let result = loop {
            let mut deferred = Deferred::default();
            let pass = {
                let mut state = self.lock_state()?;
                self.reclaim_locked(
                    &mut state,
                    ReclaimLimit::Unlimited,
                    ReclaimPath::Forced,
                    &mut deferred,
                )
            };
            deferred.run();
            match pass {
                Ok(n) => total += n,
                Err(e) => break Err(e),
            }
            if self.is_empty() {
                break Ok(total);
            }
            if self.ctx.abort.is_aborted() {
                break Err(QueueError::DeviceAbort);
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                break Err(QueueError::ReportTimeout(timeout));
            }
            thread::sleep(Duration::from_millis(1));
        };
        self.lock_state()?.force_recycle = false;
        result
    }

    /// One recycle worker pass over this stream: fetch pending reports
    /// without blocking, then reclaim without a per-call bound.
    pub(crate) fn recycle_pass(&self, deferred: &mut Deferred) -> Result<u32> {
        if self.is_destroyed() {
            return Ok(0);
        }
        let drained = self.poll_reports_into(deferred);
        let reclaimed = {
            let mut state = self.lock_state()?;
            self.reclaim_locked(
                &mut state,
                ReclaimLimit::Unlimited,
                ReclaimPath::Worker,
                deferred,
            )
        };
        drained?;
        reclaimed
    }

    /// Reclaim under the stream lock. Released resources and callbacks go
    /// to `deferred`.
    pub(crate) fn reclaim_locked(
        &self,
        state: &mut StreamState,
        limit: ReclaimLimit,
        path: ReclaimPath,
        deferred: &mut Deferred,
    ) -> Result<u32> {
        if state.queue.is_empty() {
            return Ok(0);
        }
        let forced = path == ReclaimPath::Forced || self.forced_mode(state);
        let path = if forced { ReclaimPath::Forced } else { path };
        let budget = if forced {
            state.queue.in_flight()
        } else {
            let hw_head = self.ctx.driver.get_consumer_pos(self.queue_id)?;
            let retired = state.queue.retired_cells(hw_head);
            let max = self.config.get_max_reclaim_per_call();
            match limit {
                ReclaimLimit::Limited => retired.min(max),
                ReclaimLimit::Unlimited => retired,
                // only targets in [head, tail] lie ahead of the head
                ReclaimLimit::To(target)
                    if !state.queue.in_window(target) && target != state.queue.tail() =>
                {
                    0
                }
                ReclaimLimit::To(target) => {
                    let ring = state.queue.ring();
                    let head = state.queue.head();
                    ring.distance(head, ring.limit(head, target, max)).min(retired)
                }
            }
        };
        if budget == 0 {
            return Ok(0);
        }

        let freed = self.walk(state, budget, forced, deferred)?;
        if freed > 0 {
            self.counters.reclaimed(path, freed);
            CounterMetric::reclaimed(path, freed as u64).emit();
        }
        Ok(freed)
    }

    /// Release tasks from `head` until `budget` cells are freed or a task
    /// that is still running is reached.
    fn walk(
        &self,
        state: &mut StreamState,
        budget: u32,
        forced: bool,
        deferred: &mut Deferred,
    ) -> Result<u32> {
        let mut freed = 0u32;
        while !state.queue.is_empty() {
            let head = state.queue.head();
            let slot = state.queue.slot(head);
            let (slot_state, span, need_recv_cqe) =
                (slot.state, slot.span as u32, slot.need_recv_cqe);
            if !forced && span > budget - freed {
                // only part of the span is retired
                break;
            }
            let result = match slot_state {
                SlotState::Complete | SlotState::Failed => None,
                SlotState::Submitted if !forced && !need_recv_cqe => Some(Ok(())),
                SlotState::Submitted | SlotState::PartiallyComplete | SlotState::Pending
                    if forced =>
                {
                    Some(Err(TaskFailure::Aborted))
                }
                _ => {
                    log::debug!(
                        "stream {} reclaim stops at pos {} waiting for its reports",
                        self.id,
                        head
                    );
                    break;
                }
            };
            let mut slot = state.queue.release_head()?;
            if let Some(result) = result {
                deferred.push_completion(slot.take_completion(head, result));
            }
            deferred.push_resources(slot.resources.drain(..));
            freed += span;
        }
        Ok(freed)
    }
}
