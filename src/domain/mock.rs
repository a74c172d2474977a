#![allow(missing_docs)]

use super::{DeliveryEnvironment, Filter, Handler, MessageRetry, Next, ProcessTerminator};
use crate::library::broker::implementation::mock::{MockEvent, MockRecorder};
use crate::library::EmptyResult;
use async_trait::async_trait;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Behaviour {
    Succeed,
    Fail,
    Panic,
    Acknowledge,
    Delay(Duration),
}

/// Handler recording each invocation as [`MockEvent::Action`]
pub struct RecordingHandler {
    recorder: MockRecorder,
    behaviour: Behaviour,
}

impl RecordingHandler {
    pub fn new(recorder: &MockRecorder) -> Self {
        Self::with_behaviour(recorder, Behaviour::Succeed)
    }

    pub fn failing(recorder: &MockRecorder) -> Self {
        Self::with_behaviour(recorder, Behaviour::Fail)
    }

    pub fn panicking(recorder: &MockRecorder) -> Self {
        Self::with_behaviour(recorder, Behaviour::Panic)
    }

    /// Acknowledges the delivery on its own
    pub fn acknowledging(recorder: &MockRecorder) -> Self {
        Self::with_behaviour(recorder, Behaviour::Acknowledge)
    }

    /// Succeeds after the given delay
    pub fn slow(recorder: &MockRecorder, delay: Duration) -> Self {
        Self::with_behaviour(recorder, Behaviour::Delay(delay))
    }

    fn with_behaviour(recorder: &MockRecorder, behaviour: Behaviour) -> Self {
        Self {
            recorder: recorder.clone(),
            behaviour,
        }
    }
}

#[async_trait]
impl Handler for RecordingHandler {
    async fn handle(&self, environment: &DeliveryEnvironment) -> EmptyResult {
        self.recorder.record(MockEvent::Action {
            tag: environment.delivery_tag(),
        });

        match self.behaviour {
            Behaviour::Succeed => Ok(()),
            Behaviour::Fail => Err("mocked action failure".into()),
            Behaviour::Panic => panic!("mocked action panic"),
            Behaviour::Acknowledge => {
                environment.acknowledge(false).await;
                Ok(())
            }
            Behaviour::Delay(delay) => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
        }
    }
}

/// Filter recording when it is entered and left
pub struct RecordingFilter {
    name: &'static str,
    recorder: MockRecorder,
}

impl RecordingFilter {
    pub fn new(name: &'static str, recorder: &MockRecorder) -> Self {
        Self {
            name,
            recorder: recorder.clone(),
        }
    }
}

#[async_trait]
impl Filter for RecordingFilter {
    fn name(&self) -> &str {
        self.name
    }

    async fn call(&self, environment: &DeliveryEnvironment, next: Next<'_>) -> EmptyResult {
        self.recorder.record(MockEvent::Enter(self.name));
        let result = next.run(environment).await;
        self.recorder.record(MockEvent::Leave(self.name));
        result
    }
}

/// Retry collaborator recording each scheduled redelivery
pub struct MockRetry {
    recorder: MockRecorder,
    fail: bool,
}

impl MockRetry {
    pub fn new(recorder: &MockRecorder) -> Self {
        Self {
            recorder: recorder.clone(),
            fail: false,
        }
    }

    pub fn failing(recorder: &MockRecorder) -> Self {
        Self {
            recorder: recorder.clone(),
            fail: true,
        }
    }
}

#[async_trait]
impl MessageRetry for MockRetry {
    async fn redeliver_with_backoff(&self, environment: &DeliveryEnvironment) -> EmptyResult {
        self.recorder.record(MockEvent::Retry {
            tag: environment.delivery_tag(),
        });

        if self.fail {
            Err("mocked retry failure".into())
        } else {
            Ok(())
        }
    }
}

/// Terminator recording termination requests instead of signalling the process
pub struct MockTerminator {
    recorder: MockRecorder,
}

impl MockTerminator {
    pub fn new(recorder: &MockRecorder) -> Self {
        Self {
            recorder: recorder.clone(),
        }
    }
}

#[async_trait]
impl ProcessTerminator for MockTerminator {
    async fn terminate(&self, _reason: &str) {
        self.recorder.record(MockEvent::Terminate);
    }
}
