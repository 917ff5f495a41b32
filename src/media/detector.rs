//! §4.3 `ActiveSpeakerDetector` — picks the top-N dominant speakers over a
//! sliding window and suppresses updates that wouldn't change the set.

use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::media::engine::ProducerId;

struct Observation {
    producer_id: ProducerId,
    at: Instant,
}

/// Not `Send`-free-floating state: one instance per [`super::cluster::MediaCluster`],
/// fed by that cluster's source router's dominant-speaker observer.
pub struct ActiveSpeakerDetector {
    max_active: usize,
    window: Duration,
    state: Mutex<State>,
}

struct State {
    observations: VecDeque<Observation>,
    current: HashSet<ProducerId>,
}

impl ActiveSpeakerDetector {
    #[must_use]
    pub fn new(max_active: usize, window: Duration) -> Self {
        Self {
            max_active,
            window,
            state: Mutex::new(State {
                observations: VecDeque::new(),
                current: HashSet::new(),
            }),
        }
    }

    /// Records a dominant-speaker observation and recomputes the top-N set
    /// over the trailing window. Returns `Some(new_set)` only when the set
    /// actually changed, so a caller can skip a no-op
    /// pause/resume sweep across every consumer.
    pub async fn on_dominant_speaker(
        &self,
        producer_id: ProducerId,
    ) -> Option<HashSet<ProducerId>> {
        let mut state = self.state.lock().await;
        let now = Instant::now();

        state.observations.push_back(Observation { producer_id, at: now });
        let cutoff = now.checked_sub(self.window).unwrap_or(now);
        while let Some(front) = state.observations.front() {
            if front.at < cutoff {
                state.observations.pop_front();
            } else {
                break;
            }
        }

        // Most-recently-observed producers rank highest; count distinct
        // producers walking from the back of the window.
        let mut ranked: Vec<ProducerId> = Vec::new();
        for obs in state.observations.iter().rev() {
            if !ranked.contains(&obs.producer_id) {
                ranked.push(obs.producer_id.clone());
            }
            if ranked.len() >= self.max_active {
                break;
            }
        }
        let new_set: HashSet<ProducerId> = ranked.into_iter().collect();

        if new_set == state.current {
            return None;
        }
        state.current = new_set.clone();
        Some(new_set)
    }

    pub async fn current(&self) -> HashSet<ProducerId> {
        self.state.lock().await.current.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(s: &str) -> ProducerId {
        ProducerId(s.to_string())
    }

    #[tokio::test]
    async fn keeps_only_top_n_distinct_speakers() {
        let detector = ActiveSpeakerDetector::new(2, Duration::from_secs(10));
        detector.on_dominant_speaker(pid("a")).await;
        detector.on_dominant_speaker(pid("b")).await;
        let set = detector.on_dominant_speaker(pid("c")).await.unwrap();
        assert_eq!(set.len(), 2);
        assert!(set.contains(&pid("b")));
        assert!(set.contains(&pid("c")));
        assert!(!set.contains(&pid("a")));
    }

    #[tokio::test]
    async fn suppresses_update_when_set_is_unchanged() {
        let detector = ActiveSpeakerDetector::new(2, Duration::from_secs(10));
        detector.on_dominant_speaker(pid("a")).await;
        detector.on_dominant_speaker(pid("b")).await;
        // Re-observing the already-top speaker keeps the set identical.
        let result = detector.on_dominant_speaker(pid("b")).await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn old_observations_fall_out_of_the_window() {
        let detector = ActiveSpeakerDetector::new(1, Duration::from_millis(20));
        detector.on_dominant_speaker(pid("a")).await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        let set = detector.on_dominant_speaker(pid("b")).await.unwrap();
        assert_eq!(set.len(), 1);
        assert!(set.contains(&pid("b")));
    }
}
