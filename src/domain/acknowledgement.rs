//! Execution of actions under an acknowledgement contract
//!
//! Every strategy except [`AcknowledgementMode::None`] and [`AcknowledgementMode::Manual`] guarantees
//! that a delivery ends up in a terminal state once the engine returns:
//!
//! 1. It has been acknowledged (individually or as part of a later multiple-acknowledgement)
//! 2. It has been rejected because the acknowledgement failed
//! 3. Neither was possible, in which case the process is asked to terminate
//!
//! The last case leaves the consumer unable to tell the broker anything about its current work
//! while every other unacknowledged delivery on the channel is stuck as well. Terminating the
//! process closes the connection, which makes the broker release all of them.

use super::{DeliveryEnvironment, Route};
use crate::domain::AcknowledgementMode;
use crate::library::{BoxedError, EmptyResult};
use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, instrument, warn};

/// Diagnostic written to stderr before terminating the process
pub const UNRESOLVABLE_DELIVERY_DIAGNOSTIC: &str = "\
CANNOT ACKNOWLEDGE OR REJECT THE MESSAGE

The subscriber can neither receive new work from the broker nor acknowledge or reject
the work it currently holds. Instead of continuing to process messages, the current
process is sent a termination signal so that it shuts down and the broker releases
every outstanding delivery. When running under a process supervisor the subscriber
will be restarted and resume taking on work.";

/// Schedules a delayed redelivery of a message whose processing failed
#[async_trait]
pub trait MessageRetry: Send + Sync {
    /// Schedules a new copy of the environment's message. The original delivery is resolved by the caller.
    async fn redeliver_with_backoff(&self, environment: &DeliveryEnvironment) -> EmptyResult;
}

/// Ends the current process in response to an unrecoverable state
#[async_trait]
pub trait ProcessTerminator: Send + Sync {
    /// Requests termination. Called at most once per unresolvable delivery.
    async fn terminate(&self, reason: &str);
}

/// Failures raised by the engine itself
#[derive(Error, Debug)]
pub enum ActionError {
    /// Action or one of its filters panicked
    #[error("action panicked: {0}")]
    Panicked(String),
    /// Delivery could not be acknowledged before running the action, it has not been executed
    #[error("delivery {0} could not be acknowledged, action skipped")]
    NotAcknowledged(u64),
}

/// Runs routes' actions and resolves their deliveries according to the route's [`AcknowledgementMode`]
#[derive(Clone)]
pub struct AcknowledgementEngine {
    retry: Arc<dyn MessageRetry>,
    terminator: Arc<dyn ProcessTerminator>,
}

impl AcknowledgementEngine {
    /// Creates a new engine using the given collaborators
    pub fn new(retry: Arc<dyn MessageRetry>, terminator: Arc<dyn ProcessTerminator>) -> Self {
        Self { retry, terminator }
    }

    /// Executes the route's action for a delivery and resolves it.
    ///
    /// The returned error is the one which should be surfaced to the operator, the
    /// resolution of the delivery has already been decided at that point.
    #[instrument(skip_all, fields(action = route.action(), tag = environment.delivery_tag()))]
    pub async fn execute(&self, route: &Route, environment: &DeliveryEnvironment) -> EmptyResult {
        match route.acknowledgement_mode() {
            AcknowledgementMode::None | AcknowledgementMode::Manual => {
                self.run_action(route, environment).await
            }
            AcknowledgementMode::AtMostOnceSingle => {
                let result = self.at_most_once(route, environment).await;
                self.finalize(environment).await;
                result
            }
            AcknowledgementMode::AtMostOnceBatched(every) => {
                let result = self.at_most_once_batched(route, environment, every.get()).await;
                self.finalize(environment).await;
                result
            }
            AcknowledgementMode::AtLeastOnce => {
                let result = self.at_least_once(route, environment).await;
                self.finalize(environment).await;
                result
            }
        }
    }

    async fn at_most_once(&self, route: &Route, environment: &DeliveryEnvironment) -> EmptyResult {
        if !environment.acknowledge(false).await {
            return Err(ActionError::NotAcknowledged(environment.delivery_tag()).into());
        }

        self.run_action(route, environment).await
    }

    async fn at_most_once_batched(
        &self,
        route: &Route,
        environment: &DeliveryEnvironment,
        every: u64,
    ) -> EmptyResult {
        // Delivery tags increase monotonically per channel
        if environment.delivery_tag() % every == 0 {
            environment.acknowledge(true).await;
        } else {
            environment.mark_resolved();
        }

        self.run_action(route, environment).await
    }

    async fn at_least_once(&self, route: &Route, environment: &DeliveryEnvironment) -> EmptyResult {
        match self.run_action(route, environment).await {
            Ok(_) => {
                environment.acknowledge(false).await;
                Ok(())
            }
            Err(error) => {
                debug!(%error, "Action failed, scheduling redelivery");
                let retry = guarded(self.retry.redeliver_with_backoff(environment)).await;
                environment.acknowledge(false).await;

                match retry {
                    Ok(_) => Err(error),
                    Err(retry_error) => {
                        warn!(%error, "Action failed and no redelivery could be scheduled");
                        Err(retry_error)
                    }
                }
            }
        }
    }

    async fn run_action(&self, route: &Route, environment: &DeliveryEnvironment) -> EmptyResult {
        guarded(route.around_filters().run(environment, route.handler())).await
    }

    /// Rejects deliveries which have not been resolved and terminates the process if that fails too
    pub(crate) async fn finalize(&self, environment: &DeliveryEnvironment) {
        if environment.is_resolved() || environment.reject().await {
            return;
        }

        eprintln!("{}", UNRESOLVABLE_DELIVERY_DIAGNOSTIC);
        error!(
            queue = environment.queue(),
            "Unable to acknowledge or reject delivery, terminating process"
        );

        self.terminator
            .terminate("delivery could neither be acknowledged nor rejected")
            .await;
    }
}

/// Converts panics of the future into an [`ActionError::Panicked`]
async fn guarded<F>(future: F) -> EmptyResult
where
    F: Future<Output = EmptyResult>,
{
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(Box::new(ActionError::Panicked(panic_message(panic))) as BoxedError),
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Ok(message) = panic.downcast::<String>() {
        *message
    } else {
        "unknown cause".to_owned()
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use crate::domain::mock::{MockRetry, MockTerminator, RecordingFilter, RecordingHandler};
    use crate::domain::{Handler, RouteDefaults, SubscriberBuilder};
    use crate::library::broker::implementation::mock::{MockDelivery, MockEvent, MockRecorder};
    use crate::library::pool::WorkerPool;
    use pretty_assertions::assert_eq;

    struct Fixture {
        recorder: MockRecorder,
        engine: AcknowledgementEngine,
    }

    impl Fixture {
        fn new() -> Self {
            Self::with_retry(|recorder| MockRetry::new(recorder))
        }

        fn with_failing_retry() -> Self {
            Self::with_retry(|recorder| MockRetry::failing(recorder))
        }

        fn with_retry(retry: impl FnOnce(&MockRecorder) -> MockRetry) -> Self {
            let recorder = MockRecorder::default();
            let engine = AcknowledgementEngine::new(
                Arc::new(retry(&recorder)),
                Arc::new(MockTerminator::new(&recorder)),
            );

            Self { recorder, engine }
        }

        fn route(
            &self,
            mode: impl FnOnce(SubscriberBuilder) -> SubscriberBuilder,
            handler: Arc<dyn Handler>,
        ) -> Route {
            let defaults = RouteDefaults::new(WorkerPool::new("test", 1));
            let builder = SubscriberBuilder::new("users").action("created", handler);

            mode(builder).build(&defaults).unwrap().into_routes().remove(0)
        }

        fn succeeding(&self) -> Arc<dyn Handler> {
            Arc::new(RecordingHandler::new(&self.recorder))
        }

        fn failing(&self) -> Arc<dyn Handler> {
            Arc::new(RecordingHandler::failing(&self.recorder))
        }

        fn delivery(&self, tag: u64) -> MockDelivery {
            MockDelivery::new(tag, &self.recorder)
        }

        async fn execute(&self, route: &Route, delivery: MockDelivery) -> EmptyResult {
            let environment = DeliveryEnvironment::new(route.action(), route.queue(), Box::new(delivery));
            self.engine.execute(route, &environment).await
        }
    }

    fn at_least_once(builder: SubscriberBuilder) -> SubscriberBuilder {
        builder.at_least_once()
    }

    #[tokio::test]
    async fn acknowledge_successful_actions_at_least_once() {
        let fixture = Fixture::new();
        let route = fixture.route(at_least_once, fixture.succeeding());

        fixture.execute(&route, fixture.delivery(1)).await.unwrap();

        assert_eq!(
            fixture.recorder.events(),
            vec![
                MockEvent::Action { tag: 1 },
                MockEvent::Acknowledge {
                    tag: 1,
                    multiple: false
                },
            ]
        );
    }

    #[tokio::test]
    async fn retry_then_acknowledge_failed_actions_at_least_once() {
        let fixture = Fixture::new();
        let route = fixture.route(at_least_once, fixture.failing());

        let error = fixture.execute(&route, fixture.delivery(4)).await.unwrap_err();

        assert_eq!(error.to_string(), "mocked action failure");
        assert_eq!(
            fixture.recorder.events(),
            vec![
                MockEvent::Action { tag: 4 },
                MockEvent::Retry { tag: 4 },
                MockEvent::Acknowledge {
                    tag: 4,
                    multiple: false
                },
            ]
        );
    }

    #[tokio::test]
    async fn keep_going_with_always_failing_actions() {
        let fixture = Fixture::new();
        let route = fixture.route(at_least_once, fixture.failing());

        for tag in 1..=20 {
            assert!(fixture.execute(&route, fixture.delivery(tag)).await.is_err());
        }

        assert_eq!(fixture.recorder.retries(), 20);
        assert_eq!(fixture.recorder.acknowledgements(), 20);
        assert_eq!(fixture.recorder.rejections(), 0);
    }

    #[tokio::test]
    async fn acknowledge_before_surfacing_retry_failures() {
        let fixture = Fixture::with_failing_retry();
        let route = fixture.route(at_least_once, fixture.failing());

        let error = fixture.execute(&route, fixture.delivery(1)).await.unwrap_err();

        assert_eq!(error.to_string(), "mocked retry failure");
        assert_eq!(fixture.recorder.acknowledgements(), 1);
        assert_eq!(fixture.recorder.rejections(), 0);
    }

    #[tokio::test]
    async fn treat_panics_as_failures() {
        let fixture = Fixture::new();
        let handler = Arc::new(RecordingHandler::panicking(&fixture.recorder));
        let route = fixture.route(at_least_once, handler);

        let error = fixture.execute(&route, fixture.delivery(1)).await.unwrap_err();

        assert_eq!(error.to_string(), "action panicked: mocked action panic");
        assert_eq!(fixture.recorder.retries(), 1);
        assert_eq!(fixture.recorder.acknowledgements(), 1);
    }

    #[tokio::test]
    async fn reject_when_acknowledgement_fails_at_least_once() {
        let fixture = Fixture::new();
        let route = fixture.route(at_least_once, fixture.succeeding());

        fixture
            .execute(&route, fixture.delivery(1).failing_acknowledge())
            .await
            .unwrap();

        assert_eq!(fixture.recorder.rejections(), 1);
        assert_eq!(fixture.recorder.terminations(), 0);
    }

    #[tokio::test]
    async fn acknowledge_before_acting_at_most_once() {
        let fixture = Fixture::new();
        let route = fixture.route(|b| b.at_most_once(1), fixture.failing());

        let error = fixture.execute(&route, fixture.delivery(2)).await.unwrap_err();

        assert_eq!(error.to_string(), "mocked action failure");
        assert_eq!(
            fixture.recorder.events(),
            vec![
                MockEvent::Acknowledge {
                    tag: 2,
                    multiple: false
                },
                MockEvent::Action { tag: 2 },
            ]
        );
    }

    #[tokio::test]
    async fn skip_action_when_acknowledgement_fails_at_most_once() {
        let fixture = Fixture::new();
        let route = fixture.route(|b| b.at_most_once(1), fixture.succeeding());

        let result = fixture
            .execute(&route, fixture.delivery(2).failing_acknowledge())
            .await;

        assert!(result.is_err());
        assert_eq!(fixture.recorder.actions(), 0);
        assert_eq!(fixture.recorder.rejections(), 1);
        assert_eq!(fixture.recorder.terminations(), 0);
    }

    #[tokio::test]
    async fn acknowledge_multiples_of_batch_size() {
        let fixture = Fixture::new();
        let route = fixture.route(|b| b.at_most_once(5), fixture.succeeding());

        for tag in 1..=10 {
            fixture.execute(&route, fixture.delivery(tag)).await.unwrap();
        }

        let acknowledged: Vec<MockEvent> = fixture
            .recorder
            .events()
            .into_iter()
            .filter(|e| matches!(e, MockEvent::Acknowledge { .. }))
            .collect();

        assert_eq!(
            acknowledged,
            vec![
                MockEvent::Acknowledge {
                    tag: 5,
                    multiple: true
                },
                MockEvent::Acknowledge {
                    tag: 10,
                    multiple: true
                },
            ]
        );
        assert_eq!(fixture.recorder.actions(), 10);
        assert_eq!(fixture.recorder.rejections(), 0);
    }

    #[tokio::test]
    async fn run_every_action_in_batches_despite_failures() {
        for every in [2u64, 3, 7] {
            let fixture = Fixture::new();
            let route = fixture.route(|b| b.at_most_once(every), fixture.failing());

            for tag in 1..=3 * every {
                assert!(fixture.execute(&route, fixture.delivery(tag)).await.is_err());
            }

            assert_eq!(fixture.recorder.actions() as u64, 3 * every);
            assert_eq!(fixture.recorder.acknowledgements(), 3);
            assert_eq!(
                fixture.recorder.count(|e| matches!(
                    e,
                    MockEvent::Acknowledge { tag, multiple: true } if tag % every == 0
                )),
                3
            );
            assert_eq!(fixture.recorder.rejections(), 0);
        }
    }

    #[tokio::test]
    async fn reject_failed_batch_acknowledgements() {
        let fixture = Fixture::new();
        let route = fixture.route(|b| b.at_most_once(2), fixture.succeeding());

        fixture
            .execute(&route, fixture.delivery(2).failing_acknowledge())
            .await
            .unwrap();

        assert_eq!(fixture.recorder.actions(), 1);
        assert_eq!(fixture.recorder.rejections(), 1);
    }

    #[tokio::test]
    async fn leave_deliveries_alone_without_acknowledgements() {
        let fixture = Fixture::new();
        let route = fixture.route(|b| b.no_acknowledgement(), fixture.failing());

        assert!(fixture.execute(&route, fixture.delivery(1)).await.is_err());
        assert_eq!(fixture.recorder.events(), vec![MockEvent::Action { tag: 1 }]);
    }

    #[tokio::test]
    async fn leave_resolution_to_manual_handlers() {
        let fixture = Fixture::new();
        let handler = Arc::new(RecordingHandler::acknowledging(&fixture.recorder));
        let route = fixture.route(|b| b.manual_acknowledgement(), handler);

        fixture.execute(&route, fixture.delivery(3)).await.unwrap();

        assert_eq!(
            fixture.recorder.events(),
            vec![
                MockEvent::Action { tag: 3 },
                MockEvent::Acknowledge {
                    tag: 3,
                    multiple: false
                },
            ]
        );
    }

    #[tokio::test]
    async fn terminate_once_when_nothing_resolves() {
        type Mode = fn(SubscriberBuilder) -> SubscriberBuilder;
        let modes: [Mode; 3] = [at_least_once, |b| b.at_most_once(1), |b| b.at_most_once(4)];

        for mode in modes {
            for handler in [true, false] {
                let fixture = Fixture::new();
                let action = if handler {
                    fixture.succeeding()
                } else {
                    fixture.failing()
                };
                let route = fixture.route(mode, action);

                let _ = fixture
                    .execute(
                        &route,
                        fixture.delivery(4).failing_acknowledge().failing_reject(),
                    )
                    .await;

                assert_eq!(fixture.recorder.terminations(), 1);
                assert_eq!(fixture.recorder.rejections(), 1);
                assert_eq!(fixture.recorder.events().last(), Some(&MockEvent::Terminate));
            }
        }
    }

    #[tokio::test]
    async fn never_acknowledge_and_reject_one_delivery() {
        type Mode = fn(SubscriberBuilder) -> SubscriberBuilder;
        let modes: [Mode; 3] = [at_least_once, |b| b.at_most_once(1), |b| b.at_most_once(3)];

        for mode in modes {
            for failing_acknowledge in [true, false] {
                let fixture = Fixture::new();
                let route = fixture.route(mode, fixture.failing());

                for tag in 1..=6 {
                    let delivery = if failing_acknowledge {
                        fixture.delivery(tag).failing_acknowledge()
                    } else {
                        fixture.delivery(tag)
                    };
                    let _ = fixture.execute(&route, delivery).await;

                    let acknowledged = fixture.recorder.count(|e| {
                        matches!(e, MockEvent::Acknowledge { tag: t, .. } if *t == tag)
                    });
                    let rejected = fixture
                        .recorder
                        .count(|e| matches!(e, MockEvent::Reject { tag: t } if *t == tag));

                    if !failing_acknowledge {
                        assert!(acknowledged == 0 || rejected == 0);
                    }
                    assert!(rejected <= 1);
                }
            }
        }
    }

    #[tokio::test]
    async fn wrap_actions_in_around_filters() {
        let fixture = Fixture::new();
        let recorder = fixture.recorder.clone();
        let route = fixture.route(
            move |b| {
                b.at_most_once(1)
                    .around_filter(Arc::new(RecordingFilter::new("A", &recorder)))
                    .around_filter(Arc::new(RecordingFilter::new("B", &recorder)))
            },
            fixture.succeeding(),
        );

        fixture.execute(&route, fixture.delivery(1)).await.unwrap();

        assert_eq!(
            fixture.recorder.events(),
            vec![
                MockEvent::Acknowledge {
                    tag: 1,
                    multiple: false
                },
                MockEvent::Enter("A"),
                MockEvent::Enter("B"),
                MockEvent::Action { tag: 1 },
                MockEvent::Leave("B"),
                MockEvent::Leave("A"),
            ]
        );
    }
}
