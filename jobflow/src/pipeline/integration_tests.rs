//! Integration tests for pipeline execution.

#[cfg(test)]
mod tests {
    use crate::cancellation::{Scope, ScopeError};
    use crate::errors::{JobflowError, TransformError};
    use crate::events::{CollectingEventSink, PIPELINE_COMPLETED, PIPELINE_HALTED, STAGE_CLOSED, WORKER_PANICKED};
    use crate::pipeline::{
        from_fn, ErrorPolicy, JitterStrategy, PipelineBuilder, RetryConfig, StageContext, StageOptions,
        StageOutcome, Transform,
    };
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::Instant;

    fn square() -> impl Transform<u64> {
        from_fn(|x: u64, _| async move { StageOutcome::one(x * x) })
    }

    fn identity() -> impl Transform<u64> {
        from_fn(|x: u64, _| async move { StageOutcome::one(x) })
    }

    async fn feed(pipeline_input: crate::queue::Queue<u64>, items: impl IntoIterator<Item = u64>) {
        let scope = Scope::background();
        for item in items {
            if pipeline_input.send(item, &scope).await.is_err() {
                break;
            }
        }
        pipeline_input.close();
    }

    /// Sums each batch into a single item.
    struct BatchSum;

    #[async_trait]
    impl Transform<u64> for BatchSum {
        async fn apply(&self, item: u64, _ctx: &StageContext) -> StageOutcome<u64> {
            StageOutcome::one(item)
        }

        async fn apply_batch(&self, items: Vec<u64>, _ctx: &StageContext) -> StageOutcome<u64> {
            StageOutcome::one(items.iter().sum())
        }
    }

    #[tokio::test]
    async fn test_three_stage_pipeline_keeps_order() {
        let expand = from_fn(|n: u64, _| async move { StageOutcome::Produce((1..=n).collect()) });
        let add_ten = from_fn(|x: u64, _| async move { StageOutcome::one(x + 10) });
        let events = Arc::new(CollectingEventSink::new());

        let pipeline = PipelineBuilder::new("ordered")
            .add_stage("expand", 1, 1, expand, StageOptions::new())
            .unwrap()
            .add_stage("square", 1, 1, square(), StageOptions::new())
            .unwrap()
            .add_stage("add-ten", 1, 1, add_ten, StageOptions::new())
            .unwrap()
            .with_event_sink(events.clone())
            .build()
            .unwrap();

        pipeline.start(&Scope::background()).unwrap();
        feed(pipeline.input(), [5]).await;

        let output = pipeline.output().recv_all().await;
        assert_eq!(output, vec![11, 14, 19, 26, 35]);

        let report = pipeline.wait().await.unwrap();
        assert!(report.is_clean());
        assert!(pipeline.is_done());
        assert_eq!(report.stages.len(), 3);
        assert_eq!(report.stages[0].processed, 1);
        assert_eq!(report.stages[1].processed, 5);
        assert!(report.stages.iter().all(|s| s.is_consistent() && s.in_flight == 0));

        assert_eq!(events.count(STAGE_CLOSED), 3);
        assert_eq!(events.names().last().map(String::as_str), Some(PIPELINE_COMPLETED));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rendezvous_stage_applies_back_pressure() {
        let slow = from_fn(|x: u64, _| async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            StageOutcome::one(x)
        });
        let pipeline = PipelineBuilder::new("backpressure")
            .add_stage("fast", 1, 16, identity(), StageOptions::new())
            .unwrap()
            .add_stage("slow", 1, 0, slow, StageOptions::new())
            .unwrap()
            .build()
            .unwrap();

        let started = Instant::now();
        pipeline.start(&Scope::background()).unwrap();
        tokio::spawn(feed(pipeline.input(), 0..1000));

        let output = pipeline.output();
        let scope = Scope::background();
        let mut received = 0;
        while output.recv(&scope).await.is_ok() {
            received += 1;
            assert!(pipeline.metrics()[1].queue_depth <= 1);
        }

        assert_eq!(received, 1000);
        assert!(started.elapsed() >= Duration::from_secs(10));
        assert!(pipeline.wait().await.unwrap().is_clean());
    }

    #[tokio::test]
    async fn test_skip_policy_routes_errors_and_continues() {
        let every_fourth = from_fn(|x: u64, _| async move {
            if x % 4 == 0 {
                StageOutcome::Error(TransformError::new("divisible", format!("{x} is divisible by 4")))
            } else {
                StageOutcome::one(x)
            }
        });
        let pipeline = PipelineBuilder::new("skip")
            .add_stage("filter", 2, 4, every_fourth, StageOptions::new())
            .unwrap()
            .with_output_capacity(32)
            .with_error_queue(32)
            .build()
            .unwrap();

        pipeline.start(&Scope::background()).unwrap();
        feed(pipeline.input(), 1..=20).await;

        let mut output = pipeline.output().recv_all().await;
        output.sort_unstable();
        assert_eq!(output.len(), 15);
        assert!(output.iter().all(|x| x % 4 != 0));

        let errors = pipeline.errors().unwrap().recv_all().await;
        assert_eq!(errors.len(), 5);
        assert!(errors.iter().all(|e| e.stage == "filter" && e.kind == "divisible" && e.attempts == 1));

        let report = pipeline.wait().await.unwrap();
        assert!(report.is_clean());
        assert_eq!(report.stages[0].errored, 5);
        assert_eq!(report.stages[0].processed, 15);
    }

    #[tokio::test]
    async fn test_halt_policy_cancels_pipeline() {
        let fail_on_three = from_fn(|x: u64, _| async move {
            if x == 3 {
                StageOutcome::Error(TransformError::permanent("bad-input", "three"))
            } else {
                StageOutcome::one(x)
            }
        });
        let events = Arc::new(CollectingEventSink::new());
        let pipeline = PipelineBuilder::new("halt")
            .add_stage(
                "strict",
                1,
                0,
                fail_on_three,
                StageOptions::new().with_error_policy(ErrorPolicy::Halt),
            )
            .unwrap()
            .add_stage("tail", 1, 1, identity(), StageOptions::new())
            .unwrap()
            .with_error_queue(4)
            .with_event_sink(events.clone())
            .build()
            .unwrap();

        pipeline.start(&Scope::background()).unwrap();
        let producer = tokio::spawn(feed(pipeline.input(), 1..=10));

        let output = pipeline.output().recv_all().await;
        let report = pipeline.wait().await.unwrap();
        producer.await.unwrap();

        assert!(report.halted);
        assert_eq!(report.cancelled, None);
        assert!(output.len() < 10);
        assert!(!output.contains(&3));

        let errors = pipeline.errors().unwrap().recv_all().await;
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, "bad-input");
        assert_eq!(events.count(PIPELINE_HALTED), 1);
        assert!(pipeline.input().is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_policy_recovers_transient_failures() {
        let flaky = from_fn(|x: u64, ctx: StageContext| async move {
            if ctx.attempt() < 3 {
                StageOutcome::Error(TransformError::new("flaky", "try again"))
            } else {
                StageOutcome::one(x)
            }
        });
        let retry = RetryConfig::new()
            .with_max_attempts(3)
            .with_base_delay_ms(5)
            .with_jitter(JitterStrategy::None);
        let pipeline = PipelineBuilder::new("retry")
            .add_stage(
                "flaky",
                1,
                4,
                flaky,
                StageOptions::new().with_error_policy(ErrorPolicy::Retry(retry)),
            )
            .unwrap()
            .with_error_queue(4)
            .build()
            .unwrap();

        pipeline.start(&Scope::background()).unwrap();
        feed(pipeline.input(), 1..=4).await;

        assert_eq!(pipeline.output().recv_all().await, vec![1, 2, 3, 4]);
        assert!(pipeline.errors().unwrap().recv_all().await.is_empty());
        let report = pipeline.wait().await.unwrap();
        assert_eq!(report.stages[0].errored, 0);
        assert_eq!(report.stages[0].processed, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_policy_skips_permanent_errors() {
        let permanent = from_fn(|_: u64, _| async move {
            StageOutcome::Error(TransformError::permanent("schema", "missing field"))
        });
        let pipeline = PipelineBuilder::new("permanent")
            .add_stage(
                "parse",
                1,
                1,
                permanent,
                StageOptions::new().with_error_policy(ErrorPolicy::Retry(RetryConfig::new().with_max_attempts(5))),
            )
            .unwrap()
            .with_error_queue(2)
            .build()
            .unwrap();

        pipeline.start(&Scope::background()).unwrap();
        feed(pipeline.input(), [1]).await;

        let errors = pipeline.errors().unwrap().recv_all().await;
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].attempts, 1);
        assert!(pipeline.output().recv_all().await.is_empty());
    }

    #[tokio::test]
    async fn test_batches_flush_partial_on_close() {
        let pipeline = PipelineBuilder::new("batch")
            .add_stage("sum", 1, 8, BatchSum, StageOptions::new().with_batching(3, None))
            .unwrap()
            .build()
            .unwrap();

        pipeline.start(&Scope::background()).unwrap();
        feed(pipeline.input(), 1..=7).await;

        assert_eq!(pipeline.output().recv_all().await, vec![6, 15, 7]);
        let report = pipeline.wait().await.unwrap();
        assert_eq!(report.stages[0].processed, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_batch_flushes_after_interval() {
        let pipeline = PipelineBuilder::new("flush")
            .add_stage(
                "sum",
                1,
                8,
                BatchSum,
                StageOptions::new().with_batching(10, Some(Duration::from_millis(50))),
            )
            .unwrap()
            .build()
            .unwrap();

        pipeline.start(&Scope::background()).unwrap();
        let input = pipeline.input();
        let scope = Scope::background();
        input.send(2, &scope).await.unwrap();
        input.send(3, &scope).await.unwrap();

        let started = Instant::now();
        assert_eq!(pipeline.output().recv(&scope).await.unwrap(), 5);
        assert!(started.elapsed() >= Duration::from_millis(50));

        input.close();
        assert!(pipeline.wait().await.unwrap().is_clean());
    }

    #[tokio::test]
    async fn test_panicking_transform_becomes_error() {
        let fragile = from_fn(|x: u64, _| async move {
            assert_ne!(x, 2, "cannot handle two");
            StageOutcome::one(x)
        });
        let events = Arc::new(CollectingEventSink::new());
        let pipeline = PipelineBuilder::new("panic")
            .add_stage("fragile", 1, 4, fragile, StageOptions::new())
            .unwrap()
            .with_error_queue(4)
            .with_event_sink(events.clone())
            .build()
            .unwrap();

        pipeline.start(&Scope::background()).unwrap();
        feed(pipeline.input(), 1..=3).await;

        assert_eq!(pipeline.output().recv_all().await, vec![1, 3]);
        let errors = pipeline.errors().unwrap().recv_all().await;
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, "panic");
        assert!(errors[0].detail.contains("cannot handle two"));
        assert_eq!(events.count(WORKER_PANICKED), 1);
        assert_eq!(pipeline.wait().await.unwrap().stages[0].panics, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_item_timeout_is_an_error() {
        let sleepy = from_fn(|x: u64, _| async move {
            if x == 1 {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            StageOutcome::one(x)
        });
        let pipeline = PipelineBuilder::new("timeout")
            .add_stage(
                "sleepy",
                1,
                4,
                sleepy,
                StageOptions::new().with_per_item_timeout(Duration::from_millis(100)),
            )
            .unwrap()
            .with_error_queue(4)
            .build()
            .unwrap();

        pipeline.start(&Scope::background()).unwrap();
        feed(pipeline.input(), 1..=2).await;

        assert_eq!(pipeline.output().recv_all().await, vec![2]);
        let errors = pipeline.errors().unwrap().recv_all().await;
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, "deadline-exceeded");
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_stage_is_throttled() {
        let pipeline = PipelineBuilder::new("throttled")
            .add_stage("limited", 2, 4, identity(), StageOptions::new().with_rate_limit(10.0))
            .unwrap()
            .with_output_capacity(64)
            .build()
            .unwrap();

        let started = Instant::now();
        pipeline.start(&Scope::background()).unwrap();
        feed(pipeline.input(), 0..30).await;

        assert_eq!(pipeline.output().recv_all().await.len(), 30);
        // The bucket starts with ten tokens; the other twenty arrive every 100ms.
        assert!(started.elapsed() >= Duration::from_millis(1900));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_after_grace() {
        let stuck = from_fn(|x: u64, ctx: StageContext| async move {
            if x == 1 {
                ctx.scope().done().await;
            }
            StageOutcome::one(x)
        });
        let pipeline = PipelineBuilder::new("stuck")
            .add_stage("stuck", 1, 4, stuck, StageOptions::new())
            .unwrap()
            .build()
            .unwrap();

        pipeline.start(&Scope::background()).unwrap();
        pipeline.input().send(1, &Scope::background()).await.unwrap();

        let report = pipeline.shutdown(Duration::from_millis(100)).await.unwrap();
        assert_eq!(report.cancelled, Some(ScopeError::DeadlineExceeded));
        assert!(!report.halted);
        assert_eq!(report.stages[0].skipped_by_reason.cancelled, 1);
        assert!(report.stages[0].is_consistent());
    }

    #[tokio::test]
    async fn test_parent_cancellation_stops_pipeline() {
        let pipeline = PipelineBuilder::new("cancel")
            .add_stage("idle", 1, 1, identity(), StageOptions::new())
            .unwrap()
            .build()
            .unwrap();
        let (scope, cancel) = Scope::background().with_cancel();

        pipeline.start(&scope).unwrap();
        cancel.cancel();

        let report = pipeline.wait().await.unwrap();
        assert_eq!(report.cancelled, Some(ScopeError::Cancelled));
        assert!(pipeline.output().recv_all().await.is_empty());
    }

    #[tokio::test]
    async fn test_lifecycle_errors() {
        let pipeline = PipelineBuilder::new("lifecycle")
            .add_stage("idle", 1, 1, identity(), StageOptions::new())
            .unwrap()
            .build()
            .unwrap();

        assert!(matches!(pipeline.wait().await, Err(JobflowError::InvalidState { .. })));
        pipeline.start(&Scope::background()).unwrap();
        assert!(matches!(
            pipeline.start(&Scope::background()),
            Err(JobflowError::InvalidState { .. })
        ));
        pipeline.input().close();
        assert!(pipeline.wait().await.unwrap().is_clean());
    }
}
