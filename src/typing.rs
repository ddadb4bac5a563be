use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

pub struct TypingTracker {
    last: Mutex<HashMap<(Uuid, Uuid), Instant>>,
    debounce: Duration,
}

impl TypingTracker {
    pub fn new(debounce: Duration) -> Self {
        Self {
            last: Mutex::new(HashMap::new()),
            debounce,
        }
    }

    /// Register a typing action. Returns true if the event should be
    /// relayed to the other participant.
    pub fn typing(&self, user_id: Uuid, conversation_id: Uuid) -> bool {
        let mut guard = self.last.lock();
        let key = (user_id, conversation_id);
        let now = Instant::now();
        let should = match guard.get(&key) {
            Some(&prev) => now.duration_since(prev) >= self.debounce,
            None => true,
        };
        if should {
            guard.insert(key, now);
        }
        should
    }

    /// Clear the debounce window, so the next typing action relays
    /// immediately.
    pub fn stopped(&self, user_id: Uuid, conversation_id: Uuid) {
        self.last.lock().remove(&(user_id, conversation_id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debounce_logic() {
        let tracker = TypingTracker::new(Duration::from_secs(2));
        let conv = Uuid::nil();
        let user = Uuid::new_v4();
        assert!(tracker.typing(user, conv));
        assert!(!tracker.typing(user, conv));
        // another conversation is tracked independently
        assert!(tracker.typing(user, Uuid::new_v4()));
    }

    #[test]
    fn stop_resets_window() {
        let tracker = TypingTracker::new(Duration::from_secs(2));
        let conv = Uuid::nil();
        let user = Uuid::new_v4();
        assert!(tracker.typing(user, conv));
        tracker.stopped(user, conv);
        assert!(tracker.typing(user, conv));
    }
}
