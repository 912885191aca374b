//! End-to-end worker flow against the in-process store and queue.

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use dispatch_core::config::AppConfig;
    use dispatch_core::{Clock, FailureClass, ManualClock, MessageStatus, OutboundMessage};
    use dispatch_limiter::TokenBucketLimiter;
    use dispatch_queue::{DeliveryQueue, MemoryQueue};
    use dispatch_store::{AtomicStore, IdempotencyStore, LocalStore, SenderLease};
    use dispatch_worker::{
        BackoffPolicy, DeliveryClient, DeliveryFailure, DeliveryStats, DispatchWorker, ProcessOutcome,
        WorkerContext, WorkerPool, WorkerSettings,
    };
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::Arc;
    use std::time::Duration;

    /// Delivery client that replays a script of results, then succeeds.
    /// Each call can move a manual clock forward to stand in for a slow
    /// provider.
    #[derive(Default)]
    struct ScriptedClient {
        script: Mutex<VecDeque<Result<(), DeliveryFailure>>>,
        calls: Mutex<Vec<String>>,
        latency: Mutex<Option<(Arc<ManualClock>, Duration)>>,
    }

    impl ScriptedClient {
        fn with_script(script: Vec<Result<(), DeliveryFailure>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                ..Self::default()
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }

        fn calls_for(&self, message_id: &str) -> usize {
            self.calls.lock().iter().filter(|id| id.as_str() == message_id).count()
        }
    }

    #[async_trait]
    impl DeliveryClient for ScriptedClient {
        async fn deliver(&self, message: &OutboundMessage) -> Result<(), DeliveryFailure> {
            self.calls.lock().push(message.message_id.clone());
            let latency = self.latency.lock().clone();
            if let Some((clock, took)) = latency {
                clock.advance(took);
            }
            self.script.lock().pop_front().unwrap_or(Ok(()))
        }
    }

    struct Harness {
        clock: Arc<ManualClock>,
        queue: Arc<MemoryQueue>,
        store: Arc<dyn AtomicStore>,
        client: Arc<ScriptedClient>,
        ctx: Arc<WorkerContext>,
    }

    impl Harness {
        fn new(script: Vec<Result<(), DeliveryFailure>>) -> Self {
            let config = AppConfig::default();
            let clock = Arc::new(ManualClock::default());
            let store: Arc<dyn AtomicStore> = Arc::new(LocalStore::new(clock.clone()));
            let queue = Arc::new(MemoryQueue::new(
                clock.clone(),
                config.queue.visibility_timeout(),
                config.queue.max_receive_count,
            ));
            let client = Arc::new(ScriptedClient::with_script(script));

            let mut settings = WorkerSettings::from_config(&config);
            settings.poll_wait = Duration::ZERO;
            settings.backoff = BackoffPolicy {
                jitter: false,
                ..BackoffPolicy::from_config(&config.worker)
            };

            let ctx = Arc::new(WorkerContext {
                queue: queue.clone(),
                limiter: Arc::new(TokenBucketLimiter::new(
                    store.clone(),
                    clock.clone(),
                    &config.limiter,
                    "test",
                )),
                idempotency: IdempotencyStore::from_config(store.clone(), &config),
                lease: SenderLease::from_config(store.clone(), &config),
                client: client.clone(),
                stats: Arc::new(DeliveryStats::default()),
                clock: clock.clone(),
                settings,
            });

            Self {
                clock,
                queue,
                store,
                client,
                ctx,
            }
        }

        /// Every external call from now on takes `took` of manual time.
        fn slow_calls(&self, took: Duration) {
            *self.client.latency.lock() = Some((self.clock.clone(), took));
        }

        fn worker(&self, id: &str) -> DispatchWorker {
            DispatchWorker::new(id, self.ctx.clone())
        }

        /// Same queue, store and client with a different limiter or settings.
        fn context_with(&self, limiter: Arc<TokenBucketLimiter>, settings: WorkerSettings) -> Arc<WorkerContext> {
            let config = AppConfig::default();
            Arc::new(WorkerContext {
                queue: self.queue.clone(),
                limiter,
                idempotency: IdempotencyStore::from_config(self.store.clone(), &config),
                lease: SenderLease::from_config(self.store.clone(), &config),
                client: self.client.clone(),
                stats: self.ctx.stats.clone(),
                clock: self.clock.clone(),
                settings,
            })
        }

        async fn enqueue(&self, id: &str, sender: &str) {
            let message = OutboundMessage::new(
                id.to_string(),
                sender.to_string(),
                format!("recipient-{id}"),
                serde_json::json!({"text": "hello"}),
                5,
                self.clock.now(),
            );
            self.queue.enqueue(&message).await.unwrap();
        }
    }

    fn transient() -> Result<(), DeliveryFailure> {
        Err(DeliveryFailure::transient("http_503", "unavailable"))
    }

    #[tokio::test]
    async fn test_successful_delivery_is_acked_and_recorded() {
        let h = Harness::new(vec![]);
        h.enqueue("m1", "alice").await;
        h.clock.advance(Duration::from_millis(250));

        let outcomes = h.worker("w1").run_once().await.unwrap();
        assert_eq!(outcomes, vec![ProcessOutcome::Delivered]);
        assert_eq!(h.client.calls(), vec!["m1".to_string()]);

        let stats = h.queue.stats().await.unwrap();
        assert_eq!((stats.depth, stats.in_flight, stats.dead_letter), (0, 0, 0));
        assert_eq!(h.ctx.stats.p50(), Some(250));
    }

    #[tokio::test]
    async fn test_redelivery_after_done_does_not_call_again() {
        let h = Harness::new(vec![]);
        h.enqueue("m1", "alice").await;
        assert_eq!(h.worker("w1").run_once().await.unwrap(), vec![ProcessOutcome::Delivered]);

        // Producer retry arrives after the original was acked.
        h.enqueue("m1", "alice").await;
        h.clock.advance(Duration::from_secs(6));
        assert_eq!(h.worker("w2").run_once().await.unwrap(), vec![ProcessOutcome::Duplicate]);

        assert_eq!(h.client.calls_for("m1"), 1);
        assert_eq!(h.queue.stats().await.unwrap().depth, 0);
    }

    #[tokio::test]
    async fn test_crash_before_ack_is_absorbed() {
        let h = Harness::new(vec![]);
        h.enqueue("m1", "alice").await;

        // A worker delivers and records Done, then dies before acking.
        let received = h.queue.poll(Duration::ZERO, 1).await.unwrap();
        assert_eq!(received.len(), 1);
        let crashed = h.ctx.idempotency.with_owner("crashed-worker");
        assert!(crashed.begin_processing("m1").await.unwrap().acquired());
        crashed.mark_done("m1").await.unwrap();

        h.clock.advance(Duration::from_secs(31));
        let outcomes = h.worker("w2").run_once().await.unwrap();

        assert_eq!(outcomes, vec![ProcessOutcome::Duplicate]);
        assert!(h.client.calls().is_empty());
        let stats = h.queue.stats().await.unwrap();
        assert_eq!((stats.depth, stats.in_flight), (0, 0));
    }

    #[tokio::test]
    async fn test_live_claim_defers_instead_of_acking() {
        let h = Harness::new(vec![]);
        h.enqueue("m1", "alice").await;

        let other = h.ctx.idempotency.with_owner("stalled-worker");
        assert!(other.begin_processing("m1").await.unwrap().acquired());

        let outcomes = h.worker("w1").run_once().await.unwrap();
        assert!(matches!(outcomes[0], ProcessOutcome::ClaimHeld { retry_after } if retry_after > Duration::ZERO));
        assert!(h.client.calls().is_empty());

        // The stalled claim expires and the message still gets delivered.
        h.clock.advance(h.ctx.idempotency.processing_ttl());
        assert_eq!(h.worker("w1").run_once().await.unwrap(), vec![ProcessOutcome::Delivered]);
    }

    #[tokio::test]
    async fn test_rate_limited_sender_does_not_starve_others() {
        let h = Harness::new(vec![]);
        for i in 0..5 {
            h.enqueue(&format!("a{i}"), "alice").await;
        }
        h.enqueue("b0", "bob").await;

        let outcomes = h.worker("w1").run_once().await.unwrap();
        assert_eq!(outcomes.len(), 6);
        assert_eq!(outcomes[..3], [ProcessOutcome::Delivered, ProcessOutcome::Delivered, ProcessOutcome::Delivered]);
        assert!(matches!(outcomes[3], ProcessOutcome::RateLimited { .. }));
        assert!(matches!(outcomes[4], ProcessOutcome::RateLimited { .. }));
        assert_eq!(outcomes[5], ProcessOutcome::Delivered);
        assert_eq!(h.client.calls_for("b0"), 1);

        // Deferrals are not attempts: the deferred messages go out untouched
        // once the bucket refills.
        h.clock.advance(Duration::from_secs(13));
        let outcomes = h.worker("w1").run_once().await.unwrap();
        assert_eq!(outcomes, vec![ProcessOutcome::Delivered, ProcessOutcome::Delivered]);
        assert_eq!(h.client.calls().len(), 6);
    }

    #[tokio::test]
    async fn test_long_rate_limited_sender_is_never_dead_lettered() {
        let h = Harness::new(vec![]);
        h.enqueue("m1", "alice").await;
        let worker = h.worker("w1");

        // Other traffic keeps alice's bucket empty for longer than the
        // queue's receive limit.
        let limit = AppConfig::default().queue.max_receive_count;
        for _ in 0..limit + 20 {
            while h.ctx.limiter.try_acquire_one("alice").await.unwrap().allowed {}
            let outcomes = worker.run_once().await.unwrap();
            assert!(matches!(outcomes[..], [ProcessOutcome::RateLimited { .. }]));
            h.clock.advance(Duration::from_secs(7));
        }

        assert_eq!(h.queue.stats().await.unwrap().dead_letter, 0);
        assert!(h.client.calls().is_empty());

        h.clock.advance(Duration::from_secs(7));
        assert_eq!(worker.run_once().await.unwrap(), vec![ProcessOutcome::Delivered]);
        assert_eq!(h.client.calls_for("m1"), 1);
    }

    #[tokio::test]
    async fn test_batch_releases_items_whose_receipt_ran_short() {
        let h = Harness::new(vec![transient()]);
        h.enqueue("m0", "alice").await;
        h.enqueue("m1", "bob").await;
        h.slow_calls(Duration::from_secs(25));
        let worker = h.worker("w1");

        // m0's slow failure eats most of the 30 s receipt m1 was polled with.
        let outcomes = worker.run_once().await.unwrap();
        assert!(matches!(outcomes[0], ProcessOutcome::RetryScheduled { attempt: 1, .. }));
        assert_eq!(outcomes[1], ProcessOutcome::Released);
        assert_eq!(h.client.calls(), vec!["m0".to_string()]);

        let stats = h.queue.stats().await.unwrap();
        assert_eq!((stats.depth, stats.in_flight), (2, 0));

        // m1 goes out on a fresh receipt; m0 comes back as its second attempt.
        assert_eq!(worker.run_once().await.unwrap(), vec![ProcessOutcome::Delivered]);
        assert_eq!(h.client.calls(), vec!["m0".to_string(), "m1".to_string()]);

        let redelivered = h.queue.poll(Duration::ZERO, 1).await.unwrap();
        assert_eq!(redelivered[0].message.message_id, "m0");
        assert_eq!(redelivered[0].message.attempt_count, 1);
        assert_eq!(redelivered[0].message.failure_history.len(), 1);
    }

    #[tokio::test]
    async fn test_sender_lease_serializes_delivery() {
        let h = Harness::new(vec![]);
        h.enqueue("m1", "alice").await;

        let holder = h.ctx.lease.with_owner("w-other");
        assert_eq!(holder.acquire("alice").await.unwrap(), None);

        let outcomes = h.worker("w1").run_once().await.unwrap();
        assert!(matches!(outcomes[0], ProcessOutcome::SenderBusy { .. }));
        assert!(h.client.calls().is_empty());

        holder.release("alice").await.unwrap();
        h.clock.advance(Duration::from_secs(1));
        assert_eq!(h.worker("w1").run_once().await.unwrap(), vec![ProcessOutcome::Delivered]);
    }

    #[tokio::test]
    async fn test_five_transient_failures_dead_letter() {
        let h = Harness::new((0..6).map(|_| transient()).collect());
        h.enqueue("m1", "alice").await;
        let worker = h.worker("w1");

        let mut outcomes = Vec::new();
        for _ in 0..20 {
            outcomes.extend(worker.run_once().await.unwrap());
            h.clock.advance(Duration::from_secs(61));
        }

        let retries: Vec<_> = outcomes
            .iter()
            .filter_map(|o| match o {
                ProcessOutcome::RetryScheduled { attempt, delay } => Some((*attempt, delay.as_secs())),
                _ => None,
            })
            .collect();
        assert_eq!(retries, vec![(1, 1), (2, 2), (3, 4), (4, 8)]);
        assert_eq!(
            outcomes.last(),
            Some(&ProcessOutcome::DeadLettered {
                class: FailureClass::Transient
            })
        );
        assert_eq!(h.client.calls_for("m1"), 5, "no sixth attempt");

        let dead = h.queue.list_dead_lettered().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].failure_history.len(), 5);
        assert_eq!(dead[0].message.attempt_count, 5);
        assert_eq!(dead[0].message.status, MessageStatus::DeadLettered);
        assert!(dead[0].failure_history.iter().all(|f| f.class == FailureClass::Transient));
        assert_eq!(h.queue.stats().await.unwrap().depth, 0);
    }

    #[tokio::test]
    async fn test_permanent_failure_dead_letters_immediately() {
        let h = Harness::new(vec![Err(DeliveryFailure::permanent("http_400", "bad recipient"))]);
        h.enqueue("m1", "alice").await;

        let outcomes = h.worker("w1").run_once().await.unwrap();
        assert_eq!(
            outcomes,
            vec![ProcessOutcome::DeadLettered {
                class: FailureClass::Permanent
            }]
        );
        let dead = h.queue.list_dead_lettered().await.unwrap();
        assert_eq!(dead[0].failure_history.len(), 1);
        assert_eq!(dead[0].failure_history[0].code, "http_400");
    }

    #[tokio::test]
    async fn test_replayed_message_is_delivered() {
        let h = Harness::new(vec![Err(DeliveryFailure::permanent("http_422", "rejected"))]);
        h.enqueue("m1", "alice").await;
        h.worker("w1").run_once().await.unwrap();

        // The failed attempt released its claim, so a replay goes out.
        h.queue.replay("m1").await.unwrap();
        assert_eq!(h.worker("w1").run_once().await.unwrap(), vec![ProcessOutcome::Delivered]);
        assert_eq!(h.client.calls_for("m1"), 2);
    }

    #[tokio::test]
    async fn test_every_message_converges() {
        let script = vec![
            transient(),
            Ok(()),
            transient(),
            Err(DeliveryFailure::permanent("http_404", "unknown recipient")),
            transient(),
            transient(),
        ];
        let h = Harness::new(script);
        for (i, sender) in ["a", "b", "c", "d", "e", "f"].iter().enumerate() {
            h.enqueue(&format!("m{i}"), sender).await;
        }
        let worker = h.worker("w1");

        for _ in 0..30 {
            worker.run_once().await.unwrap();
            h.clock.advance(Duration::from_secs(61));
        }

        let stats = h.queue.stats().await.unwrap();
        assert_eq!((stats.depth, stats.in_flight), (0, 0));
        let dead = stats.dead_letter as usize;
        assert_eq!(dead, 1);
        assert!(h.client.calls().len() <= 6 * 5);
        for i in 0..6 {
            let calls = h.client.calls_for(&format!("m{i}"));
            assert!((1..=5).contains(&calls), "m{i} attempted {calls} times");
        }
    }

    #[tokio::test]
    async fn test_store_unavailable_leaves_message_untouched() {
        let h = Harness::new(vec![]);
        h.enqueue("m1", "alice").await;

        // A limiter over a store that rejects every call.
        let broken = Arc::new(TokenBucketLimiter::new(
            Arc::new(FailingStore),
            h.clock.clone(),
            &AppConfig::default().limiter,
            "test",
        ));
        let ctx = h.context_with(broken, h.ctx.settings.clone());

        assert!(DispatchWorker::new("w1", ctx).run_once().await.is_err());
        assert!(h.client.calls().is_empty());
        let stats = h.queue.stats().await.unwrap();
        assert_eq!(stats.in_flight, 1, "left for the visibility timeout");

        // The lease was released on the way out.
        h.clock.advance(Duration::from_secs(31));
        assert_eq!(h.worker("w2").run_once().await.unwrap(), vec![ProcessOutcome::Delivered]);
    }

    #[tokio::test]
    async fn test_pool_drains_queue_and_stops() {
        let h = Harness::new(vec![]);
        for (i, sender) in ["a", "b", "c", "d"].iter().enumerate() {
            h.enqueue(&format!("m{i}"), sender).await;
        }

        let mut settings = h.ctx.settings.clone();
        settings.poll_wait = Duration::from_millis(20);
        let ctx = h.context_with(h.ctx.limiter.clone(), settings);

        let mut pool = WorkerPool::new(ctx, "node-test", 2);
        pool.start();
        assert_eq!(pool.worker_count(), 2);

        let drained = tokio::time::timeout(Duration::from_secs(5), async {
            while h.client.calls().len() < 4 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(drained.is_ok());

        pool.stop().await;
        let stats = h.queue.stats().await.unwrap();
        assert_eq!((stats.depth, stats.in_flight), (0, 0));
    }

    struct FailingStore;

    #[async_trait]
    impl AtomicStore for FailingStore {
        async fn consume_tokens(
            &self,
            _key: &str,
            _params: &dispatch_store::BucketParams,
            _now_ms: i64,
            _cost: f64,
        ) -> dispatch_core::DispatchResult<dispatch_store::BucketOutcome> {
            Err(dispatch_core::DispatchError::infrastructure("store down"))
        }

        async fn peek_tokens(
            &self,
            _key: &str,
            _params: &dispatch_store::BucketParams,
            _now_ms: i64,
        ) -> dispatch_core::DispatchResult<f64> {
            Err(dispatch_core::DispatchError::infrastructure("store down"))
        }

        async fn try_claim(
            &self,
            _key: &str,
            _owner: &str,
            _ttl: Duration,
        ) -> dispatch_core::DispatchResult<dispatch_store::ClaimOutcome> {
            Err(dispatch_core::DispatchError::infrastructure("store down"))
        }

        async fn complete_claim(&self, _key: &str, _ttl: Duration) -> dispatch_core::DispatchResult<()> {
            Err(dispatch_core::DispatchError::infrastructure("store down"))
        }

        async fn release_claim(&self, _key: &str, _owner: &str) -> dispatch_core::DispatchResult<bool> {
            Err(dispatch_core::DispatchError::infrastructure("store down"))
        }

        async fn ping(&self) -> dispatch_core::DispatchResult<()> {
            Err(dispatch_core::DispatchError::infrastructure("store down"))
        }
    }
}
