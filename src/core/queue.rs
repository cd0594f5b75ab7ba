//! Job queue
//!
//! At-least-once delivery of job ids to per-lane worker pools. A popped
//! ticket is invisible until acked, nacked, or its visibility timeout
//! lapses, after which it is delivered again. Tickets delivered more than
//! `max_deliveries` times go to the dead-letter list instead, where the
//! orchestrator collects them and fails their jobs.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::{watch, Mutex, Notify};
use tokio::time::Instant;
use tracing::warn;
use uuid::Uuid;

use crate::models::errors::AppResult;
use crate::models::types::JobStatus;

/// Worker pool a job state is handled by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lane {
    Scan,
    Quote,
    Submit,
}

impl Lane {
    pub const ALL: [Lane; 3] = [Lane::Scan, Lane::Quote, Lane::Submit];

    /// Lane of a non-terminal state
    pub fn for_status(status: JobStatus) -> Option<Lane> {
        match status {
            JobStatus::Pending | JobStatus::Scanning => Some(Lane::Scan),
            JobStatus::Quoting | JobStatus::Building => Some(Lane::Quote),
            JobStatus::Authorizing | JobStatus::Submitted => Some(Lane::Submit),
            JobStatus::Confirmed | JobStatus::Failed | JobStatus::Expired => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Lane::Scan => "scan",
            Lane::Quote => "quote",
            Lane::Submit => "submit",
        }
    }
}

/// One delivery of a job id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ticket {
    pub id: Uuid,
    pub job_id: Uuid,
    pub lane: Lane,
    /// Times this ticket has been handed out, including this one
    pub deliveries: u32,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn push(&self, lane: Lane, job_id: Uuid, delay: Duration) -> AppResult<()>;

    /// Next visible ticket, without waiting
    async fn pop(&self, lane: Lane) -> AppResult<Option<Ticket>>;

    async fn ack(&self, ticket: &Ticket) -> AppResult<()>;

    /// Make the ticket visible again after `delay`
    async fn nack(&self, ticket: &Ticket, delay: Duration) -> AppResult<()>;

    /// Take every dead-lettered ticket, leaving the list empty
    async fn drain_dead_letters(&self) -> Vec<Ticket>;

    /// Wait for a ticket on `lane` until `shutdown` flips to true
    async fn recv(&self, lane: Lane, shutdown: &mut watch::Receiver<bool>) -> Option<Ticket>;
}

#[derive(Debug)]
struct Pending {
    ticket: Ticket,
    visible_at: Instant,
}

#[derive(Default)]
struct LaneState {
    ready: VecDeque<Pending>,
    /// ticket id -> (ticket, redelivery time)
    in_flight: HashMap<Uuid, (Ticket, Instant)>,
}

/// In-process queue
pub struct InMemoryQueue {
    lanes: Mutex<HashMap<Lane, LaneState>>,
    dead: Mutex<Vec<Ticket>>,
    visibility_timeout: Duration,
    max_deliveries: u32,
    notify: Notify,
}

/// Poll interval while waiting for delayed tickets
const IDLE_POLL: Duration = Duration::from_millis(50);

impl InMemoryQueue {
    pub fn new(visibility_timeout: Duration, max_deliveries: u32) -> Self {
        let lanes = Lane::ALL.iter().map(|l| (*l, LaneState::default())).collect();
        Self {
            lanes: Mutex::new(lanes),
            dead: Mutex::new(Vec::new()),
            visibility_timeout,
            max_deliveries: max_deliveries.max(1),
            notify: Notify::new(),
        }
    }

    /// Tickets waiting or in flight on a lane
    pub async fn depth(&self, lane: Lane) -> usize {
        let lanes = self.lanes.lock().await;
        lanes
            .get(&lane)
            .map(|s| s.ready.len() + s.in_flight.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl JobQueue for InMemoryQueue {
    async fn push(&self, lane: Lane, job_id: Uuid, delay: Duration) -> AppResult<()> {
        let mut lanes = self.lanes.lock().await;
        let state = lanes.entry(lane).or_default();
        state.ready.push_back(Pending {
            ticket: Ticket {
                id: Uuid::new_v4(),
                job_id,
                lane,
                deliveries: 0,
            },
            visible_at: Instant::now() + delay,
        });
        drop(lanes);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn pop(&self, lane: Lane) -> AppResult<Option<Ticket>> {
        let now = Instant::now();
        let mut lanes = self.lanes.lock().await;
        let state = lanes.entry(lane).or_default();

        // Reclaim tickets whose visibility timeout lapsed
        let lapsed: Vec<Uuid> = state
            .in_flight
            .iter()
            .filter(|(_, (_, deadline))| *deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in lapsed {
            if let Some((ticket, _)) = state.in_flight.remove(&id) {
                state.ready.push_back(Pending { ticket, visible_at: now });
            }
        }

        loop {
            let position = match state.ready.iter().position(|p| p.visible_at <= now) {
                Some(position) => position,
                None => return Ok(None),
            };
            let Some(pending) = state.ready.remove(position) else {
                return Ok(None);
            };

            let mut ticket = pending.ticket;
            ticket.deliveries += 1;
            if ticket.deliveries > self.max_deliveries {
                warn!(
                    "☠️ Dead-lettering job {} on {} lane after {} deliveries",
                    ticket.job_id,
                    lane.as_str(),
                    ticket.deliveries - 1
                );
                self.dead.lock().await.push(ticket);
                continue;
            }

            state
                .in_flight
                .insert(ticket.id, (ticket.clone(), now + self.visibility_timeout));
            return Ok(Some(ticket));
        }
    }

    async fn ack(&self, ticket: &Ticket) -> AppResult<()> {
        let mut lanes = self.lanes.lock().await;
        if let Some(state) = lanes.get_mut(&ticket.lane) {
            state.in_flight.remove(&ticket.id);
        }
        Ok(())
    }

    async fn nack(&self, ticket: &Ticket, delay: Duration) -> AppResult<()> {
        let mut lanes = self.lanes.lock().await;
        let state = lanes.entry(ticket.lane).or_default();
        if let Some((ticket, _)) = state.in_flight.remove(&ticket.id) {
            state.ready.push_back(Pending {
                ticket,
                visible_at: Instant::now() + delay,
            });
        }
        drop(lanes);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn drain_dead_letters(&self) -> Vec<Ticket> {
        std::mem::take(&mut *self.dead.lock().await)
    }

    async fn recv(&self, lane: Lane, shutdown: &mut watch::Receiver<bool>) -> Option<Ticket> {
        loop {
            if *shutdown.borrow() {
                return None;
            }
            let notified = self.notify.notified();
            if let Ok(Some(ticket)) = self.pop(lane).await {
                return Some(ticket);
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(IDLE_POLL) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
            }
        }
    }
}
