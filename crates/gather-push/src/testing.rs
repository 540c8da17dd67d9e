//! Scriptable in-memory provider for tests.

use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::PushError;
use crate::message::{DeliveryReport, PushMessage};
use crate::provider::PushProvider;

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub tokens: Vec<String>,
    pub message: PushMessage,
    pub bulk: bool,
}

#[derive(Default)]
struct State {
    calls: Vec<RecordedCall>,
    rejected_tokens: HashSet<String>,
    reject_all: bool,
    /// When set, this many more deliveries succeed and every later one is rejected.
    deliveries_left: Option<usize>,
    transport_down: bool,
    /// Bulk answers carry one report fewer than there were tokens.
    short_reports: bool,
}

/// Records every request and answers according to the configured script.
/// Delivers everything by default.
#[derive(Default)]
pub struct RecordingProvider {
    state: Mutex<State>,
}

impl RecordingProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reject_all(&self, reject: bool) {
        self.lock().reject_all = reject;
    }

    pub fn reject_token(&self, token: &str) {
        self.lock().rejected_tokens.insert(token.to_string());
    }

    pub fn deliver_only(&self, count: usize) {
        self.lock().deliveries_left = Some(count);
    }

    pub fn fail_transport(&self, down: bool) {
        self.lock().transport_down = down;
    }

    pub fn short_reports(&self, short: bool) {
        self.lock().short_reports = short;
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.lock().calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.lock().calls.len()
    }

    /// Forget recorded calls, keep the script.
    pub fn clear(&self) {
        self.lock().calls.clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("recording provider lock poisoned")
    }
}

impl State {
    fn report(&mut self, token: &str) -> DeliveryReport {
        if self.reject_all || self.rejected_tokens.contains(token) {
            return DeliveryReport::Rejected("NotRegistered".into());
        }
        match self.deliveries_left.as_mut() {
            Some(0) => DeliveryReport::Rejected("Unavailable".into()),
            Some(left) => {
                *left -= 1;
                DeliveryReport::Delivered
            }
            None => DeliveryReport::Delivered,
        }
    }
}

#[async_trait]
impl PushProvider for RecordingProvider {
    async fn send(&self, token: &str, message: &PushMessage) -> Result<DeliveryReport, PushError> {
        let mut state = self.lock();
        state.calls.push(RecordedCall {
            tokens: vec![token.to_string()],
            message: message.clone(),
            bulk: false,
        });
        if state.transport_down {
            return Err(PushError::TokenExchange("provider unreachable".into()));
        }
        Ok(state.report(token))
    }

    async fn send_bulk(
        &self,
        tokens: &[String],
        message: &PushMessage,
    ) -> Result<Vec<DeliveryReport>, PushError> {
        let mut state = self.lock();
        state.calls.push(RecordedCall {
            tokens: tokens.to_vec(),
            message: message.clone(),
            bulk: true,
        });
        if state.transport_down {
            return Err(PushError::TokenExchange("provider unreachable".into()));
        }
        let mut reports: Vec<DeliveryReport> = tokens.iter().map(|t| state.report(t)).collect();
        if state.short_reports {
            reports.pop();
        }
        Ok(reports)
    }
}
