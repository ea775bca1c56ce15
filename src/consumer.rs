//! Consumer handle: claims one command at a time and retires it.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, error, warn};

use crate::error::{QueueError, QueueResult};
use crate::queue::{Command, CommandQueue};
use crate::types::{Claim, ConsumerId};

struct Held {
    claim: Claim,
    command: Arc<Command>,
}

/// A consumer identity with a single claim slot.
///
/// The handle may be shared between threads; the slot lock serializes every
/// `take` and `finish` issued through it.
pub struct Consumer {
    id: ConsumerId,
    queue: Arc<CommandQueue>,
    slot: Mutex<Option<Held>>,
}

impl Consumer {
    pub(crate) fn new(id: ConsumerId, queue: Arc<CommandQueue>) -> Self {
        Self {
            id,
            queue,
            slot: Mutex::new(None),
        }
    }

    pub fn id(&self) -> ConsumerId {
        self.id
    }

    /// Queue this consumer was opened on.
    pub fn queue(&self) -> &Arc<CommandQueue> {
        &self.queue
    }

    fn lock_slot(&self) -> QueueResult<MutexGuard<'_, Option<Held>>> {
        self.slot
            .lock()
            .map_err(|_| QueueError::LockPoisoned("claim slot"))
    }

    /// Claim the oldest queued command.
    ///
    /// Never blocks: an empty backlog returns `Empty`, and a consumer that
    /// still holds a claim gets `ClaimHeld` without touching the backlog.
    pub fn take(&self) -> QueueResult<Claim> {
        // Lock order: claim slot, then backlog.
        let mut slot = self.lock_slot()?;
        if let Some(held) = slot.as_ref() {
            warn!(
                "consumer {} tried to take while holding claim {}",
                self.id,
                held.claim.id()
            );
            return Err(QueueError::ClaimHeld {
                consumer: self.id,
                claim: held.claim.id(),
            });
        }
        let command = self.queue.pop_oldest()?.ok_or(QueueError::Empty)?;
        let claim = Claim::new(
            self.queue.next_claim_id(),
            self.id,
            command.id,
            command.kind,
        );
        *slot = Some(Held { claim, command });
        self.queue.monitor().claimed(self.id, claim);
        debug!(
            "consumer {} claimed command {} ({}) as claim {}",
            self.id,
            claim.command(),
            claim.kind(),
            claim.id()
        );
        Ok(claim)
    }

    /// Retire the command behind `claim` and wake its producer.
    ///
    /// The claim must be the one this consumer currently holds. Anything else
    /// (no claim, a claim already finished, another consumer's claim) returns
    /// `NoActiveClaim` and changes nothing.
    pub fn finish(&self, claim: &Claim) -> QueueResult<()> {
        let mut slot = self.lock_slot()?;
        let held = match slot.take() {
            Some(held) if held.claim == *claim => held,
            other => {
                *slot = other;
                warn!(
                    "consumer {} rejected finish for claim {} (command {})",
                    self.id,
                    claim.id(),
                    claim.command()
                );
                return Err(QueueError::NoActiveClaim { consumer: self.id });
            }
        };
        // Slot is cleared and the signal given under the same lock, so no
        // second finish can observe this claim as active.
        let first_signal = match held.command.completion.complete() {
            Ok(first) => first,
            Err(err) => {
                *slot = Some(held);
                return Err(err);
            }
        };
        debug_assert!(first_signal, "command {} signaled twice", held.command.id);
        self.queue.note_retired(self.id);
        debug!(
            "consumer {} retired command {} ({})",
            self.id,
            claim.command(),
            claim.kind()
        );
        drop(held);
        Ok(())
    }

    /// The claim currently held, if any.
    pub fn current_claim(&self) -> QueueResult<Option<Claim>> {
        Ok(self.lock_slot()?.as_ref().map(|held| held.claim))
    }

    /// Tell the liveness monitor this consumer is still making progress.
    pub fn heartbeat(&self) {
        self.queue.monitor().heartbeat(self.id);
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        let slot = self.slot.get_mut().unwrap_or_else(PoisonError::into_inner);
        match slot.as_ref().map(|held| held.claim) {
            Some(claim) => {
                // The producer of this command stays blocked forever.
                error!(
                    "consumer {} dropped while holding claim {} on command {} ({})",
                    self.id,
                    claim.id(),
                    claim.command(),
                    claim.kind()
                );
                self.queue.monitor().abandoned(self.id);
            }
            None => self.queue.monitor().deregister(self.id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CommandKind;
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn take_on_empty_backlog_has_no_side_effect() {
        let queue = Arc::new(CommandQueue::new());
        let consumer = queue.open_consumer();
        assert_eq!(consumer.take(), Err(QueueError::Empty));
        assert_eq!(consumer.current_claim(), Ok(None));
        assert_eq!(queue.len(), Ok(0));
    }

    #[test]
    fn finish_without_take_is_rejected() {
        let queue = Arc::new(CommandQueue::new());
        let pending = queue.enqueue(CommandKind::Ping).expect("enqueue");
        let owner = queue.open_consumer();
        let claim = owner.take().expect("take");
        owner.finish(&claim).expect("finish");

        let idle = queue.open_consumer();
        let other = queue.enqueue(CommandKind::Reboot).expect("enqueue");
        assert_eq!(
            idle.finish(&claim),
            Err(QueueError::NoActiveClaim {
                consumer: idle.id()
            })
        );
        assert_eq!(queue.len(), Ok(1));
        assert_eq!(other.is_retired(), Ok(false));
        assert_eq!(queue.retired_total(), 1);
        pending.wait().expect("first retired");
    }

    #[test]
    fn second_finish_is_rejected() {
        let queue = Arc::new(CommandQueue::new());
        let pending = queue.enqueue(CommandKind::BoostEnable).expect("enqueue");
        let consumer = queue.open_consumer();
        let claim = consumer.take().expect("take");

        assert_eq!(consumer.finish(&claim), Ok(()));
        assert_eq!(
            consumer.finish(&claim),
            Err(QueueError::NoActiveClaim {
                consumer: consumer.id()
            })
        );
        assert_eq!(queue.retired_total(), 1);
        assert_eq!(pending.is_retired(), Ok(true));
    }

    #[test]
    fn stale_claim_cannot_retire_the_next_command() {
        let queue = Arc::new(CommandQueue::new());
        let _first = queue.enqueue(CommandKind::Ping).expect("enqueue");
        let second = queue.enqueue(CommandKind::BoostDisable).expect("enqueue");
        let consumer = queue.open_consumer();

        let stale = consumer.take().expect("take first");
        consumer.finish(&stale).expect("finish first");
        let fresh = consumer.take().expect("take second");
        assert_ne!(stale.id(), fresh.id());

        // Reusing the old token must not retire the newly claimed command.
        assert!(matches!(
            consumer.finish(&stale),
            Err(QueueError::NoActiveClaim { .. })
        ));
        assert_eq!(second.is_retired(), Ok(false));
        assert_eq!(consumer.current_claim(), Ok(Some(fresh)));
        consumer.finish(&fresh).expect("finish second");
        assert_eq!(second.is_retired(), Ok(true));
    }

    #[test]
    fn cross_consumer_finish_is_rejected() {
        let queue = Arc::new(CommandQueue::new());
        let pending = queue.enqueue(CommandKind::Reboot).expect("enqueue");
        let owner = queue.open_consumer();
        let intruder = queue.open_consumer();
        let claim = owner.take().expect("take");

        assert_eq!(
            intruder.finish(&claim),
            Err(QueueError::NoActiveClaim {
                consumer: intruder.id()
            })
        );
        assert_eq!(pending.is_retired(), Ok(false));
        assert_eq!(owner.current_claim(), Ok(Some(claim)));
        owner.finish(&claim).expect("owner finish");
        assert_eq!(pending.is_retired(), Ok(true));
    }

    #[test]
    fn second_take_while_holding_is_rejected() {
        let queue = Arc::new(CommandQueue::new());
        let _a = queue.enqueue(CommandKind::Ping).expect("enqueue");
        let _b = queue.enqueue(CommandKind::Ping).expect("enqueue");
        let consumer = queue.open_consumer();
        let claim = consumer.take().expect("take");

        assert_eq!(
            consumer.take(),
            Err(QueueError::ClaimHeld {
                consumer: consumer.id(),
                claim: claim.id(),
            })
        );
        // The second command stays queued for someone else.
        assert_eq!(queue.len(), Ok(1));
        consumer.finish(&claim).expect("finish");
        assert!(consumer.take().is_ok());
    }

    #[test]
    fn racing_finishes_on_shared_handle_retire_once() {
        for _ in 0..50 {
            let queue = Arc::new(CommandQueue::new());
            let pending = queue.enqueue(CommandKind::Ping).expect("enqueue");
            let _next = queue.enqueue(CommandKind::BoostEnable).expect("enqueue");
            let consumer = Arc::new(queue.open_consumer());
            let claim = consumer.take().expect("take");

            let racers = 4;
            let barrier = Arc::new(Barrier::new(racers));
            let mut handles = Vec::new();
            for _ in 0..racers {
                let consumer = Arc::clone(&consumer);
                let barrier = Arc::clone(&barrier);
                handles.push(thread::spawn(move || {
                    barrier.wait();
                    consumer.finish(&claim).is_ok()
                }));
            }
            let wins = handles
                .into_iter()
                .map(|handle| handle.join().expect("racer panicked"))
                .filter(|won| *won)
                .count();
            assert_eq!(wins, 1);
            assert_eq!(queue.retired_total(), 1);
            assert_eq!(queue.len(), Ok(1));
            assert_eq!(pending.wait_timeout(Duration::from_secs(1)), Ok(true));
        }
    }

    #[test]
    fn dropping_a_holder_reports_abandoned_claim() {
        let queue = Arc::new(CommandQueue::new());
        let pending = queue.enqueue(CommandKind::Reboot).expect("enqueue");
        let consumer = queue.open_consumer();
        let consumer_id = consumer.id();
        let claim = consumer.take().expect("take");
        drop(consumer);

        let stalled = queue.stalled_claims();
        assert_eq!(stalled.len(), 1);
        assert_eq!(stalled[0].consumer, consumer_id);
        assert_eq!(stalled[0].claim, claim);
        assert!(stalled[0].abandoned);
        assert_eq!(pending.is_retired(), Ok(false));
    }
}
