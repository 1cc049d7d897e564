//! Recorder registry.
//!
//! Maps each room to at most one running recorder. Operations on the same
//! room are serialized through a per-room slot that is held across the
//! blocking lifecycle calls; the registry map itself is only touched for
//! the instant of a lookup or swap, so rooms never wait on each other.
//!
//! A slot only exists while some call holds or waits for it.

use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use super::error::RecorderError;
use super::recorder::{Recorder, RecorderFactory};
use crate::live::{LiveRoom, RoomId};

#[derive(Clone)]
struct Entry {
    room: Arc<dyn LiveRoom>,
    recorder: Arc<dyn Recorder>,
}

pub struct Manager {
    root: CancellationToken,
    factory: Arc<dyn RecorderFactory>,
    recorders: DashMap<RoomId, Entry>,
    slots: DashMap<RoomId, Arc<Mutex<()>>>,
}

impl Manager {
    /// `root` bounds the lifetime of every recorder the manager starts.
    pub fn new(root: CancellationToken, factory: Arc<dyn RecorderFactory>) -> Self {
        Self {
            root,
            factory,
            recorders: DashMap::new(),
            slots: DashMap::new(),
        }
    }

    /// Build, start, and register a recorder for `room`.
    ///
    /// The factory is not consulted when the room is already registered.
    pub async fn add_recorder(
        &self,
        cx: &CancellationToken,
        room: Arc<dyn LiveRoom>,
    ) -> Result<(), RecorderError> {
        let id = room.id();
        let _slot = self.reserve(cx, &id).await?;

        if self.recorders.contains_key(&id) {
            return Err(RecorderError::RecorderExist);
        }
        if self.root.is_cancelled() {
            return Err(RecorderError::Closed);
        }

        let span = room.span();
        async {
            let recorder = match self.start_new(&room).await {
                Ok(recorder) => recorder,
                Err(err) => return Err(err),
            };
            if self.root.is_cancelled() {
                // Shutdown began while the recorder was starting
                close_unregistered(recorder.as_ref()).await;
                return Err(RecorderError::Closed);
            }

            self.recorders.insert(id, Entry { room, recorder });
            info!("Recorder registered");
            Ok(())
        }
        .instrument(span)
        .await
    }

    pub async fn get_recorder(
        &self,
        _cx: &CancellationToken,
        id: &RoomId,
    ) -> Result<Arc<dyn Recorder>, RecorderError> {
        self.recorders
            .get(id)
            .map(|entry| Arc::clone(&entry.recorder))
            .ok_or(RecorderError::RecorderNotExist)
    }

    pub async fn has_recorder(&self, _cx: &CancellationToken, id: &RoomId) -> bool {
        self.recorders.contains_key(id)
    }

    /// Hand the room over to a fresh recorder.
    ///
    /// A failed `close_for_restart` leaves the current registration intact.
    /// A replacement that cannot be built or started leaves the room
    /// unregistered; the caller has to add it again.
    pub async fn restart_recorder(
        &self,
        cx: &CancellationToken,
        room: Arc<dyn LiveRoom>,
    ) -> Result<(), RecorderError> {
        let id = room.id();
        let _slot = self.reserve(cx, &id).await?;

        let current = self
            .recorders
            .get(&id)
            .map(|entry| Arc::clone(&entry.recorder))
            .ok_or(RecorderError::RecorderNotExist)?;

        let span = room.span();
        async {
            if let Err(err) = current.close_for_restart().await {
                warn!("Hand-off failed, keeping current recorder: {}", err);
                return Err(err);
            }
            debug!("Previous recorder handed off, starting successor");

            if self.root.is_cancelled() {
                self.recorders.remove(&id);
                return Err(RecorderError::Closed);
            }

            match self.start_new(&room).await {
                Ok(recorder) if self.root.is_cancelled() => {
                    close_unregistered(recorder.as_ref()).await;
                    self.recorders.remove(&id);
                    Err(RecorderError::Closed)
                }
                Ok(recorder) => {
                    self.recorders.insert(id.clone(), Entry { room, recorder });
                    info!("Recorder restarted");
                    Ok(())
                }
                Err(err) => {
                    self.recorders.remove(&id);
                    warn!("Replacement recorder failed to start, room unregistered: {}", err);
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Close the room's recorder and drop it from the registry.
    ///
    /// A failing `close` is logged; the entry is removed regardless.
    pub async fn remove_recorder(
        &self,
        cx: &CancellationToken,
        id: &RoomId,
    ) -> Result<(), RecorderError> {
        let _slot = self.reserve(cx, id).await?;

        let entry = self
            .recorders
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or(RecorderError::RecorderNotExist)?;

        let span = entry.room.span();
        async {
            if let Err(err) = entry.recorder.close().await {
                warn!("Recorder close failed, resources may have leaked: {}", err);
            }
            self.recorders.remove(id);
            info!("Recorder removed");
        }
        .instrument(span)
        .await;

        Ok(())
    }

    /// Room the current registration for `id` was made with.
    pub fn get_room(&self, id: &RoomId) -> Result<Arc<dyn LiveRoom>, RecorderError> {
        self.recorders
            .get(id)
            .map(|entry| Arc::clone(&entry.room))
            .ok_or(RecorderError::RecorderNotExist)
    }

    /// Sorted snapshot of registered room ids.
    pub fn room_ids(&self) -> Vec<RoomId> {
        let mut ids: Vec<RoomId> = self.recorders.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.recorders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recorders.is_empty()
    }

    /// Cancel the root scope and close every registered recorder.
    ///
    /// Adds and restarts issued after this point fail with `Closed`. Calls
    /// already in flight are waited out through their room's slot, so
    /// nothing they start survives.
    pub async fn shutdown(&self) {
        let cx = CancellationToken::new();
        self.root.cancel();

        let mut ids: BTreeSet<RoomId> =
            self.slots.iter().map(|slot| slot.key().clone()).collect();
        ids.extend(self.recorders.iter().map(|entry| entry.key().clone()));
        info!("Closing {} recorder(s)", self.recorders.len());
        for id in ids {
            match self.remove_recorder(&cx, &id).await {
                Ok(()) | Err(RecorderError::RecorderNotExist) => {}
                Err(err) => warn!("Failed to remove recorder {}: {}", id, err),
            }
        }
    }

    async fn reserve(
        &self,
        cx: &CancellationToken,
        id: &RoomId,
    ) -> Result<Reservation<'_>, RecorderError> {
        let slot = self.slots.entry(id.clone()).or_default().value().clone();

        let guard = tokio::select! {
            biased;
            _ = cx.cancelled() => None,
            guard = slot.lock_owned() => Some(guard),
        };

        match guard {
            Some(guard) => Ok(Reservation {
                manager: self,
                id: id.clone(),
                _guard: guard,
            }),
            None => {
                // Only the table is left holding it if nobody else queued
                self.slots.remove_if(id, |_, slot| Arc::strong_count(slot) == 1);
                Err(RecorderError::Cancelled)
            }
        }
    }

    async fn start_new(&self, room: &Arc<dyn LiveRoom>) -> Result<Arc<dyn Recorder>, RecorderError> {
        let ctx = self.root.child_token();
        let recorder = match self.factory.create(ctx.clone(), Arc::clone(room)) {
            Ok(recorder) => recorder,
            Err(err) => {
                ctx.cancel();
                return Err(err);
            }
        };

        if let Err(err) = recorder.start(ctx.clone()).await {
            ctx.cancel();
            return Err(err);
        }

        Ok(recorder)
    }
}

/// Exclusive hold on one room's slot.
struct Reservation<'a> {
    manager: &'a Manager,
    id: RoomId,
    _guard: OwnedMutexGuard<()>,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        // The table and this guard; anything more is a queued caller
        self.manager
            .slots
            .remove_if(&self.id, |_, slot| Arc::strong_count(slot) == 2);
    }
}

async fn close_unregistered(recorder: &dyn Recorder) {
    if let Err(err) = recorder.close().await {
        warn!("Recorder close failed, resources may have leaked: {}", err);
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        if !self.recorders.is_empty() {
            warn!(
                "Recorder manager dropped with {} recorder(s) still registered",
                self.recorders.len()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::live::StaticRoom;
    use crate::recorders::recorder::RecorderState;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Debug, Clone, Copy, Default)]
    struct Behaviour {
        fail_create: bool,
        fail_start: bool,
        fail_close: bool,
        fail_close_for_restart: bool,
        start_delay: Duration,
    }

    struct FakeRecorder {
        behaviour: Behaviour,
        start_calls: AtomicUsize,
        close_calls: AtomicUsize,
        close_for_restart_calls: AtomicUsize,
        state: Mutex<RecorderState>,
    }

    impl FakeRecorder {
        fn new(behaviour: Behaviour) -> Self {
            Self {
                behaviour,
                start_calls: AtomicUsize::new(0),
                close_calls: AtomicUsize::new(0),
                close_for_restart_calls: AtomicUsize::new(0),
                state: Mutex::new(RecorderState::Created),
            }
        }

        fn counts(&self) -> (usize, usize, usize) {
            (
                self.start_calls.load(Ordering::SeqCst),
                self.close_calls.load(Ordering::SeqCst),
                self.close_for_restart_calls.load(Ordering::SeqCst),
            )
        }
    }

    #[async_trait]
    impl Recorder for FakeRecorder {
        async fn start(&self, _ctx: CancellationToken) -> Result<(), RecorderError> {
            self.start_calls.fetch_add(1, Ordering::SeqCst);
            if !self.behaviour.start_delay.is_zero() {
                tokio::time::sleep(self.behaviour.start_delay).await;
            }
            if self.behaviour.fail_start {
                return Err(anyhow::anyhow!("upstream unreachable").into());
            }
            *self.state.lock().await = RecorderState::Running;
            Ok(())
        }

        async fn close(&self) -> Result<(), RecorderError> {
            self.close_calls.fetch_add(1, Ordering::SeqCst);
            *self.state.lock().await = RecorderState::Closed;
            if self.behaviour.fail_close {
                return Err(anyhow::anyhow!("flush failed").into());
            }
            Ok(())
        }

        async fn close_for_restart(&self) -> Result<(), RecorderError> {
            self.close_for_restart_calls.fetch_add(1, Ordering::SeqCst);
            if self.behaviour.fail_close_for_restart {
                return Err(anyhow::anyhow!("segment finalize failed").into());
            }
            *self.state.lock().await = RecorderState::Closed;
            Ok(())
        }

        async fn state(&self) -> RecorderState {
            *self.state.lock().await
        }
    }

    type Created = Arc<std::sync::Mutex<Vec<Arc<FakeRecorder>>>>;

    /// Manager whose factory hands out fake recorders following `plan`,
    /// one behaviour per construction, defaulting to success.
    fn harness(plan: Vec<Behaviour>) -> (Manager, Created, Arc<AtomicUsize>) {
        let created: Created = Arc::default();
        let factory_calls = Arc::new(AtomicUsize::new(0));
        let plan = std::sync::Mutex::new(VecDeque::from(plan));

        let created_for_factory = Arc::clone(&created);
        let calls_for_factory = Arc::clone(&factory_calls);
        let factory = move |_ctx: CancellationToken,
                            _room: Arc<dyn LiveRoom>|
              -> Result<Arc<dyn Recorder>, RecorderError> {
            calls_for_factory.fetch_add(1, Ordering::SeqCst);
            let behaviour = plan.lock().unwrap().pop_front().unwrap_or_default();
            if behaviour.fail_create {
                return Err(anyhow::anyhow!("room resolution failed").into());
            }
            let recorder = Arc::new(FakeRecorder::new(behaviour));
            created_for_factory.lock().unwrap().push(Arc::clone(&recorder));
            Ok(recorder)
        };

        let manager = Manager::new(CancellationToken::new(), Arc::new(factory));
        (manager, created, factory_calls)
    }

    fn room(id: &str) -> Arc<dyn LiveRoom> {
        Arc::new(StaticRoom::new(id, format!("https://example.com/{id}")))
    }

    fn recorder_at(created: &Created, index: usize) -> Arc<FakeRecorder> {
        Arc::clone(&created.lock().unwrap()[index])
    }

    fn same(a: &Arc<dyn Recorder>, b: &Arc<FakeRecorder>) -> bool {
        let b: Arc<dyn Recorder> = b.clone();
        Arc::ptr_eq(a, &b)
    }

    #[tokio::test]
    async fn test_add_restart_remove_lifecycle() {
        let (m, created, factory_calls) = harness(vec![]);
        let cx = CancellationToken::new();
        let id = RoomId::from("test");

        assert!(m.add_recorder(&cx, room("test")).await.is_ok());
        assert_eq!(factory_calls.load(Ordering::SeqCst), 1);

        let again = m.add_recorder(&cx, room("test")).await;
        assert!(matches!(again, Err(RecorderError::RecorderExist)));
        assert_eq!(factory_calls.load(Ordering::SeqCst), 1);

        let first = recorder_at(&created, 0);
        let got = m.get_recorder(&cx, &id).await.unwrap();
        assert!(same(&got, &first));
        assert!(m.has_recorder(&cx, &id).await);

        assert!(m.restart_recorder(&cx, room("test")).await.is_ok());
        assert_eq!(factory_calls.load(Ordering::SeqCst), 2);
        assert_eq!(first.counts(), (1, 0, 1));

        let second = recorder_at(&created, 1);
        let got = m.get_recorder(&cx, &id).await.unwrap();
        assert!(same(&got, &second));
        assert!(!same(&got, &first));

        assert!(m.remove_recorder(&cx, &id).await.is_ok());
        assert_eq!(second.counts(), (1, 1, 0));

        let again = m.remove_recorder(&cx, &id).await;
        assert!(matches!(again, Err(RecorderError::RecorderNotExist)));
        let got = m.get_recorder(&cx, &id).await;
        assert!(matches!(got, Err(RecorderError::RecorderNotExist)));
        assert!(!m.has_recorder(&cx, &id).await);
        assert_eq!(second.counts(), (1, 1, 0));
    }

    #[tokio::test]
    async fn test_start_failure_registers_nothing() {
        let (m, created, _) = harness(vec![Behaviour {
            fail_start: true,
            ..Default::default()
        }]);
        let cx = CancellationToken::new();

        let result = m.add_recorder(&cx, room("r")).await;
        assert!(matches!(result, Err(RecorderError::Other(_))));
        assert!(!m.has_recorder(&cx, &RoomId::from("r")).await);
        assert_eq!(recorder_at(&created, 0).counts(), (1, 0, 0));

        // Retrying after a start failure is allowed.
        assert!(m.add_recorder(&cx, room("r")).await.is_ok());
        assert!(m.has_recorder(&cx, &RoomId::from("r")).await);
    }

    #[tokio::test]
    async fn test_factory_failure_registers_nothing() {
        let (m, created, factory_calls) = harness(vec![Behaviour {
            fail_create: true,
            ..Default::default()
        }]);
        let cx = CancellationToken::new();

        assert!(m.add_recorder(&cx, room("r")).await.is_err());
        assert_eq!(factory_calls.load(Ordering::SeqCst), 1);
        assert!(created.lock().unwrap().is_empty());
        assert!(m.is_empty());
    }

    #[tokio::test]
    async fn test_restart_missing_room() {
        let (m, _, factory_calls) = harness(vec![]);
        let cx = CancellationToken::new();

        let result = m.restart_recorder(&cx, room("ghost")).await;
        assert!(matches!(result, Err(RecorderError::RecorderNotExist)));
        assert_eq!(factory_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_handoff_keeps_current_recorder() {
        let (m, created, factory_calls) = harness(vec![Behaviour {
            fail_close_for_restart: true,
            ..Default::default()
        }]);
        let cx = CancellationToken::new();
        let id = RoomId::from("r");

        m.add_recorder(&cx, room("r")).await.unwrap();
        assert!(m.restart_recorder(&cx, room("r")).await.is_err());

        assert_eq!(factory_calls.load(Ordering::SeqCst), 1);
        let first = recorder_at(&created, 0);
        assert_eq!(first.counts(), (1, 0, 1));
        let got = m.get_recorder(&cx, &id).await.unwrap();
        assert!(same(&got, &first));
    }

    #[tokio::test]
    async fn test_replacement_start_failure_unregisters_room() {
        let (m, created, _) = harness(vec![
            Behaviour::default(),
            Behaviour {
                fail_start: true,
                ..Default::default()
            },
        ]);
        let cx = CancellationToken::new();
        let id = RoomId::from("r");

        m.add_recorder(&cx, room("r")).await.unwrap();
        assert!(m.restart_recorder(&cx, room("r")).await.is_err());

        assert!(!m.has_recorder(&cx, &id).await);
        assert_eq!(recorder_at(&created, 0).counts(), (1, 0, 1));
        assert_eq!(recorder_at(&created, 1).counts(), (1, 0, 0));

        assert!(m.add_recorder(&cx, room("r")).await.is_ok());
    }

    #[tokio::test]
    async fn test_close_failure_still_removes() {
        let (m, created, _) = harness(vec![Behaviour {
            fail_close: true,
            ..Default::default()
        }]);
        let cx = CancellationToken::new();
        let id = RoomId::from("r");

        m.add_recorder(&cx, room("r")).await.unwrap();
        assert!(m.remove_recorder(&cx, &id).await.is_ok());

        assert!(!m.has_recorder(&cx, &id).await);
        assert_eq!(recorder_at(&created, 0).counts(), (1, 1, 0));
    }

    #[tokio::test]
    async fn test_cancelled_call_has_no_effect() {
        let (m, _, factory_calls) = harness(vec![]);
        let cx = CancellationToken::new();
        cx.cancel();

        let result = m.add_recorder(&cx, room("r")).await;
        assert!(matches!(result, Err(RecorderError::Cancelled)));
        assert_eq!(factory_calls.load(Ordering::SeqCst), 0);
        assert!(m.is_empty());
    }

    #[tokio::test]
    async fn test_cancelling_caller_scope_keeps_recorder_running() {
        let (m, created, _) = harness(vec![]);
        let cx = CancellationToken::new();

        m.add_recorder(&cx, room("r")).await.unwrap();
        cx.cancel();

        let fresh = CancellationToken::new();
        assert!(m.has_recorder(&fresh, &RoomId::from("r")).await);
        assert_eq!(recorder_at(&created, 0).counts(), (1, 0, 0));
        assert_eq!(recorder_at(&created, 0).state().await, RecorderState::Running);
    }

    #[tokio::test]
    async fn test_room_ids_and_get_room() {
        let (m, _, _) = harness(vec![]);
        let cx = CancellationToken::new();

        m.add_recorder(&cx, room("b")).await.unwrap();
        m.add_recorder(&cx, room("a")).await.unwrap();

        assert_eq!(m.room_ids(), vec![RoomId::from("a"), RoomId::from("b")]);
        assert_eq!(m.len(), 2);
        assert_eq!(m.get_room(&RoomId::from("a")).unwrap().id(), RoomId::from("a"));
        assert!(matches!(
            m.get_room(&RoomId::from("c")),
            Err(RecorderError::RecorderNotExist)
        ));
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything() {
        let (m, created, _) = harness(vec![]);
        let cx = CancellationToken::new();

        m.add_recorder(&cx, room("a")).await.unwrap();
        m.add_recorder(&cx, room("b")).await.unwrap();
        m.shutdown().await;

        assert!(m.is_empty());
        for recorder in created.lock().unwrap().iter() {
            assert_eq!(recorder.counts(), (1, 1, 0));
        }

        let late = m.add_recorder(&cx, room("c")).await;
        assert!(matches!(late, Err(RecorderError::Closed)));
    }

    #[tokio::test]
    async fn test_shutdown_closes_add_in_flight() {
        let (m, created, _) = harness(vec![Behaviour {
            start_delay: Duration::from_millis(200),
            ..Default::default()
        }]);
        let m = Arc::new(m);

        let adding = {
            let m = Arc::clone(&m);
            tokio::spawn(async move { m.add_recorder(&CancellationToken::new(), room("late")).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        m.shutdown().await;

        let result = adding.await.unwrap();
        assert!(matches!(result, Err(RecorderError::Closed)));
        assert!(m.is_empty());
        assert_eq!(recorder_at(&created, 0).counts(), (1, 1, 0));
        assert_eq!(m.slots.len(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_closes_restart_in_flight() {
        let (m, created, _) = harness(vec![
            Behaviour::default(),
            Behaviour {
                start_delay: Duration::from_millis(200),
                ..Default::default()
            },
        ]);
        let m = Arc::new(m);
        m.add_recorder(&CancellationToken::new(), room("r")).await.unwrap();

        let restarting = {
            let m = Arc::clone(&m);
            tokio::spawn(async move { m.restart_recorder(&CancellationToken::new(), room("r")).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        m.shutdown().await;

        let result = restarting.await.unwrap();
        assert!(matches!(result, Err(RecorderError::Closed)));
        assert!(m.is_empty());
        assert_eq!(recorder_at(&created, 0).counts(), (1, 0, 1));
        assert_eq!(recorder_at(&created, 1).counts(), (1, 1, 0));
    }

    #[tokio::test]
    async fn test_slots_are_released_after_each_call() {
        let (m, _, _) = harness(vec![
            Behaviour {
                fail_start: true,
                ..Default::default()
            },
            Behaviour {
                fail_create: true,
                ..Default::default()
            },
        ]);
        let cx = CancellationToken::new();

        for i in 0..100 {
            let id = RoomId::new(format!("ghost-{i}"));
            let removed = m.remove_recorder(&cx, &id).await;
            assert!(matches!(removed, Err(RecorderError::RecorderNotExist)));
            let restarted = m.restart_recorder(&cx, room(id.as_str())).await;
            assert!(matches!(restarted, Err(RecorderError::RecorderNotExist)));
        }
        assert!(m.add_recorder(&cx, room("bad-start")).await.is_err());
        assert!(m.add_recorder(&cx, room("bad-create")).await.is_err());

        m.add_recorder(&cx, room("kept")).await.unwrap();
        let again = m.add_recorder(&cx, room("kept")).await;
        assert!(matches!(again, Err(RecorderError::RecorderExist)));
        m.restart_recorder(&cx, room("kept")).await.unwrap();
        m.remove_recorder(&cx, &RoomId::from("kept")).await.unwrap();

        assert_eq!(m.slots.len(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_waiter_releases_slot() {
        let (m, _, _) = harness(vec![]);
        let id = RoomId::from("r");

        let held = m.reserve(&CancellationToken::new(), &id).await.unwrap();
        let cancelled = CancellationToken::new();
        cancelled.cancel();
        let result = m.remove_recorder(&cancelled, &id).await;
        assert!(matches!(result, Err(RecorderError::Cancelled)));
        assert_eq!(m.slots.len(), 1);

        drop(held);
        assert_eq!(m.slots.len(), 0);
    }
}
