// SPDX-License-Identifier: MPL-2.0

//! Unit tests for the prefetch orchestrator.

#[cfg(test)]
mod tests {
    use std::{
        path::PathBuf,
        rc::Rc,
        sync::Arc,
        time::{Duration, Instant},
    };

    use super::super::{FetchError, OrchestratorError, PrefetchOrchestrator, RemoteStorage};
    use crate::{
        decoder::DecoderFactory,
        memory::{MemoryPressureEstimator, MemorySource},
        player::PlayerError,
        testing::{
            BrokenMemory, FakeFactory, FixedMemory, GatedStorage, Reply, SegmentRequest,
            collections,
        },
    };

    struct Harness {
        _dir: tempfile::TempDir,
        storage: Arc<GatedStorage>,
        factory: Rc<FakeFactory>,
        orch: PrefetchOrchestrator,
    }

    fn harness_with(memory: impl MemorySource + 'static) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let storage = GatedStorage::new(dir.path());
        let factory = FakeFactory::new(10, 10.0);

        let remote: Arc<dyn RemoteStorage> = storage.clone();
        let decoders: Rc<dyn DecoderFactory> = factory.clone();
        let orch = PrefetchOrchestrator::new(
            collections(&["a", "b"]),
            remote,
            decoders,
            MemoryPressureEstimator::new(Box::new(memory)),
        )
        .unwrap();

        Harness {
            _dir: dir,
            storage,
            factory,
            orch,
        }
    }

    /// 800MB available: no pressure, two items buffered.
    fn harness() -> Harness {
        harness_with(FixedMemory::new(800))
    }

    impl Harness {
        fn poll_until(&mut self, what: &str, done: impl Fn(&PrefetchOrchestrator) -> bool) {
            let deadline = Instant::now() + Duration::from_secs(5);
            loop {
                self.orch.poll(Instant::now());
                if done(&self.orch) {
                    return;
                }
                assert!(Instant::now() < deadline, "timed out waiting for {what}");
                std::thread::sleep(Duration::from_millis(1));
            }
        }

        /// Start and complete the initial two-item fetch.
        fn filled(mut self) -> Self {
            self.orch.start(Instant::now());
            assert_eq!(self.storage.expect_request(), SegmentRequest::new("a", 0, 2));
            self.storage.release("a", Reply::Items(2, false));
            self.poll_until("initial fill", |o| o.buffer().len() == 2 && o.player().is_some());
            self
        }

        fn item(&self, collection: &str, index: usize) -> PathBuf {
            self.storage.item_path(collection, index)
        }

        fn playing(&self) -> PathBuf {
            self.orch.player().unwrap().path().to_path_buf()
        }

        fn buffered(&self) -> Vec<PathBuf> {
            self.orch.buffer().iter().map(|i| i.path.clone()).collect()
        }
    }

    #[test]
    fn initial_fill_starts_playback() {
        let h = harness().filled();
        assert_eq!(h.playing(), h.item("a", 0));
        assert_eq!(h.buffered(), [h.item("a", 0), h.item("a", 1)]);
        assert_eq!(h.orch.buffer().next_fetch_index(), 2);
        assert!(!h.orch.fetch_in_flight());
        assert_eq!(h.orch.generation(), 1);
    }

    #[test]
    fn next_video_fetches_only_the_shortfall() {
        let mut h = harness().filled();

        h.orch.next_video(Instant::now());

        assert!(!h.item("a", 0).exists());
        assert_eq!(h.playing(), h.item("a", 1));
        assert_eq!(h.orch.buffer().len(), 1);
        assert!(h.orch.fetch_in_flight());
        assert_eq!(h.storage.expect_request(), SegmentRequest::new("a", 2, 1));
        assert_eq!(h.storage.requests().len(), 2);
    }

    #[test]
    fn advances_during_a_fetch_collapse_into_one() {
        let mut h = harness().filled();
        h.orch.next_video(Instant::now());
        h.storage.expect_request();

        for _ in 0..3 {
            h.orch.next_video(Instant::now());
        }
        assert!(h.orch.advance_queued());
        assert_eq!(h.playing(), h.item("a", 1));
        assert_eq!(h.storage.requests().len(), 2);

        h.storage.release("a", Reply::Items(1, false));
        h.poll_until("queued advance", |o| !o.advance_queued());

        // Exactly one advance was performed.
        assert_eq!(h.playing(), h.item("a", 2));
        assert!(!h.item("a", 1).exists());
        assert_eq!(h.buffered(), [h.item("a", 2)]);
        assert_eq!(h.storage.expect_request(), SegmentRequest::new("a", 3, 1));
    }

    #[test]
    fn stale_fetch_is_discarded() {
        let mut h = harness().filled();
        h.orch.next_video(Instant::now());
        assert_eq!(h.storage.expect_request(), SegmentRequest::new("a", 2, 1));

        h.orch.request_collection(1).unwrap();
        h.orch.poll(Instant::now());
        assert!(h.orch.switch_in_flight());
        assert_eq!(h.storage.expect_request(), SegmentRequest::new("b", 0, 2));

        h.storage.release("a", Reply::Items(1, false));
        h.poll_until("stale fetch", |o| !o.fetch_in_flight());

        assert_eq!(h.orch.active_collection(), 0);
        assert_eq!(h.buffered(), [h.item("a", 1)]);
        assert_eq!(h.orch.buffer().next_fetch_index(), 2);
        assert_eq!(h.playing(), h.item("a", 1));
        // Neither the playing item nor the discarded download was touched.
        assert!(h.item("a", 1).exists());
        assert!(h.item("a", 2).exists());

        h.storage.release("b", Reply::Items(2, false));
        h.poll_until("switch", |o| o.active_collection() == 1);

        assert_eq!(h.orch.requested_collection(), 1);
        assert_eq!(h.buffered(), [h.item("b", 0), h.item("b", 1)]);
        assert_eq!(h.playing(), h.item("b", 0));
        assert_eq!(h.orch.buffer().next_fetch_index(), 2);
        assert!(!h.item("a", 1).exists());
    }

    #[test]
    fn superseded_switch_is_discarded() {
        let mut h = harness().filled();

        h.orch.request_collection(1).unwrap();
        h.orch.poll(Instant::now());
        assert_eq!(h.storage.expect_request(), SegmentRequest::new("b", 0, 2));

        h.orch.request_collection(0).unwrap();
        h.storage.release("b", Reply::Items(2, false));
        h.poll_until("switch result", |o| !o.switch_in_flight());

        assert_eq!(h.orch.active_collection(), 0);
        assert_eq!(h.buffered(), [h.item("a", 0), h.item("a", 1)]);
        assert_eq!(h.playing(), h.item("a", 0));
        assert!(h.item("b", 0).exists());
        assert_eq!(h.storage.requests().len(), 2);
    }

    #[test]
    fn switch_abandons_fetch_for_replaced_buffer() {
        let mut h = harness().filled();
        h.orch.next_video(Instant::now());
        assert_eq!(h.storage.expect_request(), SegmentRequest::new("a", 2, 1));

        h.orch.request_collection(1).unwrap();
        h.orch.poll(Instant::now());
        assert_eq!(h.storage.expect_request(), SegmentRequest::new("b", 0, 2));
        h.storage.release("b", Reply::Items(2, false));
        h.poll_until("switch to b", |o| o.active_collection() == 1);
        assert!(!h.orch.fetch_in_flight());

        h.orch.request_collection(0).unwrap();
        h.orch.poll(Instant::now());
        assert_eq!(h.storage.expect_request(), SegmentRequest::new("a", 0, 2));
        // One reply for the abandoned download, one for the switch.
        h.storage.release("a", Reply::Items(2, false));
        h.storage.release("a", Reply::Items(2, false));
        h.poll_until("switch back to a", |o| {
            o.active_collection() == 0 && !o.switch_in_flight()
        });

        std::thread::sleep(Duration::from_millis(20));
        h.orch.poll(Instant::now());

        assert_eq!(h.buffered(), [h.item("a", 0), h.item("a", 1)]);
        assert_eq!(h.orch.buffer().next_fetch_index(), 2);
        assert_eq!(h.playing(), h.item("a", 0));
        assert!(!h.orch.fetch_in_flight());
        assert_eq!(h.storage.requests().len(), 4);
    }

    #[test]
    fn high_pressure_defers_switch() {
        let memory = FixedMemory::new(800);
        let mut h = harness_with(memory.clone()).filled();
        let t0 = Instant::now();

        memory.set(150);
        h.orch.request_collection(1).unwrap();
        h.orch.poll(t0);
        assert!(!h.orch.switch_in_flight());
        h.orch.poll(t0 + Duration::from_secs(5));
        assert!(!h.orch.switch_in_flight());
        assert_eq!(h.storage.requests().len(), 1);
        assert_eq!(h.orch.active_collection(), 0);
        assert_eq!(h.orch.requested_collection(), 1);

        memory.set(800);
        h.orch.poll(t0 + Duration::from_secs(11));
        assert!(h.orch.switch_in_flight());
        assert_eq!(h.storage.expect_request(), SegmentRequest::new("b", 0, 2));

        h.storage.release("b", Reply::Items(2, false));
        h.poll_until("switch", |o| o.active_collection() == 1);
        assert_eq!(h.playing(), h.item("b", 0));
    }

    #[test]
    fn empty_collection_abandons_switch() {
        let mut h = harness().filled();

        h.orch.request_collection(1).unwrap();
        h.orch.poll(Instant::now());
        h.storage.expect_request();
        h.storage.release("b", Reply::Items(0, true));
        h.poll_until("switch result", |o| !o.switch_in_flight());

        assert_eq!(h.orch.active_collection(), 0);
        assert_eq!(h.orch.requested_collection(), 0);
        assert_eq!(h.playing(), h.item("a", 0));
        assert!(matches!(
            h.orch.last_error(),
            Some(OrchestratorError::Fetch(FetchError::EmptyCollection(name))) if name == "b"
        ));

        // Not retried on its own.
        h.orch.poll(Instant::now());
        assert!(!h.orch.switch_in_flight());
    }

    #[test]
    fn failed_switch_keeps_current_collection() {
        let mut h = harness().filled();

        h.orch.request_collection(1).unwrap();
        h.orch.poll(Instant::now());
        h.storage.expect_request();
        h.storage.release("b", Reply::Fail("bucket offline".into()));
        h.poll_until("switch result", |o| !o.switch_in_flight());

        assert_eq!(h.orch.requested_collection(), 0);
        assert_eq!(h.buffered(), [h.item("a", 0), h.item("a", 1)]);
        assert!(matches!(
            h.orch.take_last_error(),
            Some(OrchestratorError::Fetch(FetchError::Unavailable(_)))
        ));
    }

    #[test]
    fn unknown_collection_is_rejected() {
        let mut h = harness();
        assert!(matches!(
            h.orch.request_collection(7),
            Err(OrchestratorError::UnknownCollection(7))
        ));
        assert_eq!(h.orch.requested_collection(), 0);
    }

    #[test]
    fn high_pressure_skips_prefetch() {
        let memory = FixedMemory::new(150);
        let mut h = harness_with(memory.clone());
        let t0 = Instant::now();

        h.orch.start(t0);
        assert!(!h.orch.fetch_in_flight());
        h.orch.poll(t0 + Duration::from_secs(1));
        assert!(!h.orch.fetch_in_flight());
        assert!(h.storage.requests().is_empty());

        memory.set(1000);
        h.orch.poll(t0 + Duration::from_secs(11));
        assert!(h.orch.fetch_in_flight());
        assert_eq!(h.storage.expect_request(), SegmentRequest::new("a", 0, 3));
        h.storage.release("a", Reply::Items(0, true));
    }

    #[test]
    fn empty_buffer_fetches_one_under_medium_pressure() {
        let mut h = harness_with(FixedMemory::new(300));
        h.orch.start(Instant::now());
        assert_eq!(h.storage.expect_request(), SegmentRequest::new("a", 0, 1));
        h.storage.release("a", Reply::Items(1, false));
        h.poll_until("fill", |o| o.player().is_some());
    }

    #[test]
    fn failed_memory_sample_assumes_low_pressure() {
        let mut h = harness_with(BrokenMemory);
        h.orch.start(Instant::now());
        assert_eq!(h.storage.expect_request(), SegmentRequest::new("a", 0, 1));
        h.storage.release("a", Reply::Items(0, true));
    }

    #[test]
    fn stalled_fetch_times_out() {
        let mut h = harness();
        let t0 = Instant::now();
        h.orch.start(t0);
        h.storage.expect_request();

        h.orch.poll(t0 + Duration::from_secs(60));
        assert!(h.orch.fetch_in_flight());

        h.orch.poll(t0 + Duration::from_secs(181));
        assert!(!h.orch.fetch_in_flight());
        assert!(matches!(
            h.orch.last_error(),
            Some(OrchestratorError::Fetch(FetchError::TimedOut(_)))
        ));

        // The abandoned download finishing later changes nothing.
        h.storage.release("a", Reply::Items(2, false));
        h.orch.poll(t0 + Duration::from_secs(182));
        assert!(h.orch.buffer().is_empty());
        assert!(h.orch.player().is_none());

        // The retry waits out the back-off.
        h.orch.poll(t0 + Duration::from_secs(192));
        assert!(h.orch.fetch_in_flight());
        assert_eq!(h.storage.expect_request(), SegmentRequest::new("a", 0, 2));
        h.storage.release("a", Reply::Items(0, true));
    }

    #[test]
    fn failed_fetch_is_recorded_and_not_retried_immediately() {
        let mut h = harness();
        h.orch.start(Instant::now());
        h.storage.expect_request();
        h.storage.release("a", Reply::Fail("network down".into()));
        h.poll_until("fetch result", |o| !o.fetch_in_flight() && o.last_error().is_some());

        h.orch.poll(Instant::now());
        assert!(!h.orch.fetch_in_flight());
        assert_eq!(h.storage.requests().len(), 1);
    }

    #[test]
    fn unplayable_head_is_skipped() {
        let mut h = harness();
        h.factory.mark_broken(h.item("a", 0));

        h.orch.start(Instant::now());
        h.storage.expect_request();
        h.storage.release("a", Reply::Items(2, false));
        h.poll_until("playback", |o| o.player().is_some());

        assert_eq!(h.playing(), h.item("a", 1));
        assert!(!h.item("a", 0).exists());
        assert!(matches!(
            h.orch.last_error(),
            Some(OrchestratorError::Playback(PlayerError::Decode(_)))
        ));
    }

    #[test]
    fn item_duration_moves_to_next_item() {
        let mut h = harness();
        h.orch = h.orch.with_item_duration(Some(Duration::from_secs(10)));
        let mut h = h.filled();

        h.orch.poll(Instant::now() + Duration::from_secs(11));
        assert_eq!(h.playing(), h.item("a", 1));
        assert_eq!(h.orch.generation(), 2);
        h.storage.expect_request();
    }

    #[test]
    fn ended_player_moves_to_next_item() {
        let mut h = harness().filled();
        h.orch.player_mut().unwrap().stop();

        h.orch.poll(Instant::now());
        assert_eq!(h.playing(), h.item("a", 1));
        assert_eq!(h.factory.opened(), [h.item("a", 0), h.item("a", 1)]);
    }

    #[test]
    fn playback_failure_drops_item_even_while_fetching() {
        let mut h = harness().filled();
        h.orch.next_video(Instant::now());
        h.storage.expect_request();
        assert!(h.orch.fetch_in_flight());

        let failure = PlayerError::EmptySource {
            path: h.item("a", 1),
        };
        h.orch.playback_failed(failure, Instant::now());

        assert!(h.orch.player().is_none());
        assert!(h.orch.buffer().is_empty());
        assert!(!h.item("a", 1).exists());
        assert!(!h.orch.advance_queued());
    }

    #[test]
    fn playback_failure_cancels_queued_advance() {
        let mut h = harness_with(FixedMemory::new(1000));
        h.orch.start(Instant::now());
        assert_eq!(h.storage.expect_request(), SegmentRequest::new("a", 0, 3));
        h.storage.release("a", Reply::Items(3, false));
        h.poll_until("initial fill", |o| o.buffer().len() == 3 && o.player().is_some());

        h.orch.next_video(Instant::now());
        assert_eq!(h.storage.expect_request(), SegmentRequest::new("a", 3, 1));
        h.orch.next_video(Instant::now());
        assert!(h.orch.advance_queued());

        let failure = PlayerError::EmptySource {
            path: h.item("a", 1),
        };
        h.orch.playback_failed(failure, Instant::now());
        assert_eq!(h.playing(), h.item("a", 2));
        assert!(!h.orch.advance_queued());

        h.storage.release("a", Reply::Items(1, false));
        h.poll_until("fetch result", |o| o.buffer().next_fetch_index() == 4);

        assert_eq!(h.playing(), h.item("a", 2));
        assert!(h.item("a", 2).exists());
        assert_eq!(h.buffered()[..2], [h.item("a", 2), h.item("a", 3)]);
        h.storage.release("a", Reply::Items(0, true));
    }
}
