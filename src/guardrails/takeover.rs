use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

pub const MAX_TAKEOVER_HISTORY: usize = 100;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TakeoverSource {
    Hotkey,
    Programmatic,
    Timeout,
    ConsecutiveFailures,
    SensitiveAction,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TakeoverResponse {
    /// End the current run.
    Abort,
    /// Unpause and carry on.
    Resume,
    /// Unpause and forget the failure streak.
    Retry,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TakeoverEvent {
    pub id: String,
    pub source: TakeoverSource,
    pub reason: String,
    pub requested_at: DateTime<Utc>,
    pub response: Option<TakeoverResponse>,
    pub responded_at: Option<DateTime<Utc>>,
}

impl TakeoverEvent {
    pub fn new(source: TakeoverSource, reason: &str) -> Self {
        Self {
            id: nanoid::nanoid!(10),
            source,
            reason: reason.to_string(),
            requested_at: Utc::now(),
            response: None,
            responded_at: None,
        }
    }
}

/// Broadcast to `subscribe_takeovers` receivers.
#[derive(Clone, Debug, PartialEq)]
pub enum TakeoverNotice {
    Requested(TakeoverEvent),
    Resolved(TakeoverEvent),
}

/// Single pending slot plus bounded history of resolved requests.
#[derive(Debug, Default)]
pub(crate) struct TakeoverState {
    pub pending: Option<TakeoverEvent>,
    history: VecDeque<TakeoverEvent>,
}

impl TakeoverState {
    /// Fills the slot unless a request is already waiting.
    pub fn request(&mut self, event: TakeoverEvent) -> bool {
        if self.pending.is_some() {
            return false;
        }
        self.pending = Some(event);
        true
    }

    pub fn resolve(&mut self, response: TakeoverResponse) -> Option<TakeoverEvent> {
        let mut event = self.pending.take()?;
        event.response = Some(response);
        event.responded_at = Some(Utc::now());
        self.remember(event.clone());
        Some(event)
    }

    pub fn remember(&mut self, event: TakeoverEvent) {
        self.history.push_back(event);
        while self.history.len() > MAX_TAKEOVER_HISTORY {
            self.history.pop_front();
        }
    }

    pub fn history(&self) -> Vec<TakeoverEvent> {
        self.history.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_pending_slot() {
        let mut st = TakeoverState::default();
        assert!(st.request(TakeoverEvent::new(TakeoverSource::Programmatic, "first")));
        assert!(!st.request(TakeoverEvent::new(TakeoverSource::Hotkey, "second")));
        assert_eq!(st.pending.as_ref().map(|e| e.reason.as_str()), Some("first"));

        let resolved = st.resolve(TakeoverResponse::Resume).unwrap();
        assert_eq!(resolved.response, Some(TakeoverResponse::Resume));
        assert!(st.pending.is_none());
        assert!(st.resolve(TakeoverResponse::Abort).is_none());
    }

    #[test]
    fn history_is_bounded() {
        let mut st = TakeoverState::default();
        for i in 0..150 {
            st.request(TakeoverEvent::new(TakeoverSource::Timeout, &i.to_string()));
            st.resolve(TakeoverResponse::Retry);
        }
        let h = st.history();
        assert_eq!(h.len(), MAX_TAKEOVER_HISTORY);
        assert_eq!(h[0].reason, "50");
    }
}
