#![allow(missing_docs)]

use crate::library::broker::{DeliveryProperties, RawDelivery};
use crate::library::EmptyResult;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};

/// Observable interaction with a mocked collaborator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockEvent {
    Acknowledge { tag: u64, multiple: bool },
    Reject { tag: u64 },
    Action { tag: u64 },
    Retry { tag: u64 },
    Terminate,
    Enter(&'static str),
    Leave(&'static str),
}

/// Shared, ordered log of [`MockEvent`]s
#[derive(Debug, Clone, Default)]
pub struct MockRecorder {
    events: Arc<Mutex<Vec<MockEvent>>>,
}

impl MockRecorder {
    pub fn record(&self, event: MockEvent) {
        self.events.lock().unwrap().push(event);
    }

    pub fn events(&self) -> Vec<MockEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, predicate: impl Fn(&MockEvent) -> bool) -> usize {
        self.events.lock().unwrap().iter().filter(|e| predicate(e)).count()
    }

    pub fn acknowledgements(&self) -> usize {
        self.count(|e| matches!(e, MockEvent::Acknowledge { .. }))
    }

    pub fn rejections(&self) -> usize {
        self.count(|e| matches!(e, MockEvent::Reject { .. }))
    }

    pub fn actions(&self) -> usize {
        self.count(|e| matches!(e, MockEvent::Action { .. }))
    }

    pub fn retries(&self) -> usize {
        self.count(|e| matches!(e, MockEvent::Retry { .. }))
    }

    pub fn terminations(&self) -> usize {
        self.count(|e| matches!(e, MockEvent::Terminate))
    }
}

/// Delivery which records every resolution attempt and fails on demand
pub struct MockDelivery {
    tag: u64,
    payload: Vec<u8>,
    properties: DeliveryProperties,
    fail_acknowledge: bool,
    fail_reject: bool,
    recorder: MockRecorder,
}

impl MockDelivery {
    pub fn new(tag: u64, recorder: &MockRecorder) -> Self {
        Self {
            tag,
            payload: Vec::new(),
            properties: DeliveryProperties::default(),
            fail_acknowledge: false,
            fail_reject: false,
            recorder: recorder.clone(),
        }
    }

    pub fn with_payload(mut self, payload: &[u8]) -> Self {
        self.payload = payload.to_vec();
        self
    }

    pub fn failing_acknowledge(mut self) -> Self {
        self.fail_acknowledge = true;
        self
    }

    pub fn failing_reject(mut self) -> Self {
        self.fail_reject = true;
        self
    }
}

#[async_trait]
impl RawDelivery for MockDelivery {
    fn delivery_tag(&self) -> u64 {
        self.tag
    }

    fn payload(&self) -> &[u8] {
        &self.payload
    }

    fn properties(&self) -> &DeliveryProperties {
        &self.properties
    }

    async fn acknowledge(&self, multiple: bool) -> EmptyResult {
        self.recorder.record(MockEvent::Acknowledge {
            tag: self.tag,
            multiple,
        });

        if self.fail_acknowledge {
            Err("mocked acknowledgement failure".into())
        } else {
            Ok(())
        }
    }

    async fn reject(&self) -> EmptyResult {
        self.recorder.record(MockEvent::Reject { tag: self.tag });

        if self.fail_reject {
            Err("mocked rejection failure".into())
        } else {
            Ok(())
        }
    }
}
