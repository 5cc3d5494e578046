mod error;
mod negotiation;
mod requests;
mod slots;
mod waitlist;

pub use error::EngineError;
pub use slots::SlotBook;
pub use waitlist::Waitlist;

use std::collections::VecDeque;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use tracing::info;
use ulid::Ulid;

use crate::config::EngineConfig;
use crate::journal::Journal;
use crate::model::*;
use crate::notify::{Notification, Notifier};
use crate::time::Clock;

pub type SharedRequest = Arc<Mutex<BookingRequest>>;

// ── Group-commit journal channel ─────────────────────────

pub(super) enum JournalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Owns the journal. Appends that arrive together share one fsync.
async fn journal_writer_loop(mut journal: Journal, mut rx: mpsc::Receiver<JournalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let mut batch = match cmd {
            JournalCommand::Append { event, response } => vec![(event, response)],
            other => {
                handle_control(&mut journal, other);
                continue;
            }
        };

        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                JournalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    deferred = Some(other);
                    break;
                }
            }
        }

        metrics::histogram!(crate::observability::JOURNAL_FLUSH_BATCH_SIZE)
            .record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut journal, &batch);
        metrics::histogram!(crate::observability::JOURNAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        if let Err(e) = &result {
            tracing::warn!("journal flush failed for {} records: {e}", batch.len());
        }
        for (_, tx) in batch {
            let r = match &result {
                Ok(()) => Ok(()),
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            };
            let _ = tx.send(r);
        }

        if let Some(cmd) = deferred {
            handle_control(&mut journal, cmd);
        }
    }
}

fn flush_batch(
    journal: &mut Journal,
    batch: &[(Event, oneshot::Sender<io::Result<()>>)],
) -> io::Result<()> {
    let appended = batch
        .iter()
        .try_for_each(|(event, _)| journal.append_buffered(event));
    // Flush even after a failed append so half-written bytes don't leak into the next batch.
    let flushed = journal.flush_sync();
    appended.and(flushed)
}

fn handle_control(journal: &mut Journal, cmd: JournalCommand) {
    match cmd {
        JournalCommand::Compact { events, response } => {
            let _ = response.send(journal.compact(&events));
        }
        JournalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(journal.appends_since_compact());
        }
        JournalCommand::Append { .. } => unreachable!("appends are batched by the caller"),
    }
}

/// Work to do once a transition has committed and every lock is released.
#[derive(Debug, Default)]
pub(super) struct Effects {
    pub notifications: Vec<Notification>,
    /// Slots that ended the transition `Open` and may serve the waitlist.
    pub opened: Vec<Ulid>,
}

/// The booking negotiation engine for one provider.
///
/// Lock order: request → slot book → waitlist. Every journaled mutation holds
/// the slot book write lock across its journal append, so the journal order
/// is the commit order.
pub struct Engine {
    pub(super) config: EngineConfig,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) notifier: Arc<dyn Notifier>,
    pub(super) slots: RwLock<SlotBook>,
    pub(super) requests: DashMap<Ulid, SharedRequest>,
    pub(super) waitlist: Mutex<Waitlist>,
    pub(super) accepting: AtomicBool,
    journal_tx: Option<mpsc::Sender<JournalCommand>>,
}

impl Engine {
    /// In-memory engine when `config.data_dir` is unset, journaled otherwise.
    /// Must be called inside a tokio runtime when journaling.
    pub fn open(
        config: EngineConfig,
        clock: Arc<dyn Clock>,
        notifier: Arc<dyn Notifier>,
    ) -> io::Result<Self> {
        let (journal_tx, events) = match config.journal_path() {
            Some(path) => {
                if let Some(dir) = path.parent() {
                    std::fs::create_dir_all(dir)?;
                }
                let (tx, events) = Self::start_journal(&path)?;
                (Some(tx), events)
            }
            None => (None, Vec::new()),
        };

        let engine = Self {
            config,
            clock,
            notifier,
            slots: RwLock::new(SlotBook::new()),
            requests: DashMap::new(),
            waitlist: Mutex::new(Waitlist::new()),
            accepting: AtomicBool::new(true),
            journal_tx,
        };
        engine.replay(&events);
        Ok(engine)
    }

    fn start_journal(path: &Path) -> io::Result<(mpsc::Sender<JournalCommand>, Vec<Event>)> {
        let (journal, events) = Journal::open(path)?;
        let (tx, rx) = mpsc::channel(4096);
        tokio::spawn(journal_writer_loop(journal, rx));
        info!("journal {}: replaying {} records", path.display(), events.len());
        Ok((tx, events))
    }

    /// Rebuild state from journal records. We are the sole owner here, so
    /// `try_*` always succeeds; never block, this may run inside a runtime.
    fn replay(&self, events: &[Event]) {
        let Ok(mut slots) = self.slots.try_write() else {
            return;
        };
        for event in events {
            match event {
                Event::SlotDeclared { slot } => slots.insert(slot.clone()),
                Event::SlotRemoved { id } => {
                    slots.remove(id);
                }
                Event::Committed {
                    request,
                    slot_changes,
                } => {
                    slots.apply(slot_changes);
                    self.requests
                        .insert(request.id, Arc::new(Mutex::new(request.clone())));
                }
                Event::AcceptingChanged { accepting } => {
                    self.accepting.store(*accepting, Ordering::SeqCst);
                }
            }
        }
        drop(slots);

        let mut waiting: Vec<WaitlistEntry> = self
            .requests
            .iter()
            .filter_map(|entry| {
                let req = entry.value().try_lock().ok()?;
                (req.status == RequestStatus::Waitlisted).then(|| WaitlistEntry {
                    request_id: req.id,
                    desired: req.desired,
                    modality: req.modality,
                    enqueued_at: req.waitlisted_at.unwrap_or(req.created_at),
                })
            })
            .collect();
        waiting.sort_by_key(|e| (e.enqueued_at, e.request_id));
        if let Ok(mut waitlist) = self.waitlist.try_lock() {
            for entry in waiting {
                waitlist.enqueue(entry);
            }
        }
    }

    /// Append via the background group-commit writer. No-op in memory mode.
    pub(super) async fn journal_append(&self, event: &Event) -> Result<(), EngineError> {
        let Some(journal_tx) = &self.journal_tx else {
            return Ok(());
        };
        let (tx, rx) = oneshot::channel();
        journal_tx
            .send(JournalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Journal("journal writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Journal("journal writer dropped response".into()))?
            .map_err(|e| EngineError::Journal(e.to_string()))
    }

    /// Journal a transition, then apply it to both stores. Caller holds the
    /// request lock (`current`) and the slot book write lock (`slots`).
    pub(super) async fn commit(
        &self,
        current: &mut BookingRequest,
        mut next: BookingRequest,
        slots: &mut SlotBook,
        slot_changes: Vec<SlotChange>,
    ) -> Result<(), EngineError> {
        debug_assert!(next.is_consistent(), "corrupt negotiation history on {}", next.id);
        next.version = current.version + 1;
        next.updated_at = self.clock.now();
        self.journal_append(&Event::Committed {
            request: next.clone(),
            slot_changes: slot_changes.clone(),
        })
        .await?;
        slots.apply(&slot_changes);
        *current = next;
        Ok(())
    }

    /// Deliver notifications and feed reopened slots to the waitlist. Runs
    /// with no locks held.
    pub(super) async fn dispatch(&self, effects: Effects) {
        let mut pending = VecDeque::from([effects]);
        while let Some(effects) = pending.pop_front() {
            for n in effects.notifications {
                self.notifier.notify(n);
            }
            for slot_id in effects.opened {
                let matched = self.match_waitlist(slot_id).await;
                pending.push_back(matched);
            }
        }
    }

    pub(super) fn get_shared(&self, id: &Ulid) -> Result<SharedRequest, EngineError> {
        self.requests
            .get(id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound(*id))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn now(&self) -> Ms {
        self.clock.now()
    }

    // ── Availability toggle ──────────────────────────────

    pub fn is_accepting_requests(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Provider-wide on/off switch. Gates new submissions only.
    pub async fn set_accepting_requests(&self, accepting: bool) -> Result<(), EngineError> {
        let _slots = self.slots.write().await;
        self.journal_append(&Event::AcceptingChanged { accepting })
            .await?;
        self.accepting.store(accepting, Ordering::SeqCst);
        info!("provider accepting requests: {accepting}");
        Ok(())
    }

    // ── Journal maintenance ──────────────────────────────

    /// Rewrite the journal as the minimal record set for the current state.
    ///
    /// Quiesces the engine: every request lock is taken (in id order), then
    /// the slot book, so no commit can land between snapshot and swap.
    pub async fn compact_journal(&self) -> Result<(), EngineError> {
        let Some(journal_tx) = &self.journal_tx else {
            return Ok(());
        };

        let mut shared: Vec<(Ulid, SharedRequest)> = self
            .requests
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        shared.sort_by_key(|(id, _)| *id);
        let mut guards = Vec::with_capacity(shared.len());
        for (_, req) in &shared {
            guards.push(req.clone().lock_owned().await);
        }
        let slots = self.slots.write().await;

        let mut events = Vec::with_capacity(1 + slots.len() + guards.len());
        events.push(Event::AcceptingChanged {
            accepting: self.is_accepting_requests(),
        });
        events.extend(slots.iter().map(|slot| Event::SlotDeclared { slot: slot.clone() }));
        events.extend(guards.iter().map(|g| Event::Committed {
            request: (**g).clone(),
            slot_changes: Vec::new(),
        }));

        let (tx, rx) = oneshot::channel();
        journal_tx
            .send(JournalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::Journal("journal writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Journal("journal writer dropped response".into()))?
            .map_err(|e| EngineError::Journal(e.to_string()))
    }

    pub async fn journal_appends_since_compact(&self) -> u64 {
        let Some(journal_tx) = &self.journal_tx else {
            return 0;
        };
        let (tx, rx) = oneshot::channel();
        if journal_tx
            .send(JournalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
