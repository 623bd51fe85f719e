//! Candidate broker URIs.
//!
//! Sequential mode hands URIs out round-robin. Randomized mode picks uniformly
//! among the candidates, never the same one twice in a row while there is a
//! choice. A prioritized URI is handed out next regardless of mode.

use parking_lot::Mutex;
use rand::Rng;
use tracing::debug;
use url::Url;

#[derive(Debug)]
struct PoolState {
    uris: Vec<Url>,
    randomize: bool,
    cursor: usize,
    last: Option<Url>,
    priority: Option<Url>,
}

/// Thread-safe set of candidate broker URIs.
#[derive(Debug)]
pub struct UriPool {
    state: Mutex<PoolState>,
}

impl UriPool {
    /// Create a pool. Duplicate URIs are dropped.
    #[must_use]
    pub fn new(uris: impl IntoIterator<Item = Url>, randomize: bool) -> Self {
        let pool = Self {
            state: Mutex::new(PoolState { uris: Vec::new(), randomize, cursor: 0, last: None, priority: None }),
        };
        for uri in uris {
            pool.add(uri);
        }
        pool
    }

    /// Next candidate according to the ordering policy, or `None` if the pool is empty.
    #[must_use]
    pub fn get_next(&self) -> Option<Url> {
        self.get_next_excluding(None)
    }

    /// Next candidate, passing over `exclude` when another candidate exists.
    #[must_use]
    pub fn get_next_excluding(&self, exclude: Option<&Url>) -> Option<Url> {
        let mut state = self.state.lock();
        if state.uris.is_empty() {
            return None;
        }

        if let Some(priority) = state.priority.take() {
            if state.uris.contains(&priority) {
                state.last = Some(priority.clone());
                return Some(priority);
            }
        }

        let mut next = Self::pick(&mut state);
        if exclude == Some(&next) && state.uris.len() > 1 {
            next = Self::pick(&mut state);
        }
        state.last = Some(next.clone());
        Some(next)
    }

    fn pick(state: &mut PoolState) -> Url {
        let len = state.uris.len();
        if state.randomize && len > 1 {
            let mut rng = rand::thread_rng();
            loop {
                let candidate = &state.uris[rng.gen_range(0..len)];
                if state.last.as_ref() != Some(candidate) {
                    return candidate.clone();
                }
            }
        }

        let index = state.cursor % len;
        state.cursor = (index + 1) % len;
        state.uris[index].clone()
    }

    /// Add a candidate; returns false if it was already present.
    pub fn add(&self, uri: Url) -> bool {
        let mut state = self.state.lock();
        if state.uris.contains(&uri) {
            return false;
        }
        debug!("Adding broker URI {uri}");
        state.uris.push(uri);
        true
    }

    /// Remove a candidate; returns false if it was not present.
    ///
    /// A URI already handed out by [`Self::get_next`] stays valid for that attempt.
    pub fn remove(&self, uri: &Url) -> bool {
        let mut state = self.state.lock();
        let Some(index) = state.uris.iter().position(|candidate| candidate == uri) else {
            return false;
        };
        debug!("Removing broker URI {uri}");
        state.uris.remove(index);
        if index < state.cursor {
            state.cursor -= 1;
        }
        if state.cursor >= state.uris.len() {
            state.cursor = 0;
        }
        true
    }

    /// Make `uri` the next candidate handed out, adding it if needed.
    pub fn prioritize(&self, uri: Url) {
        self.add(uri.clone());
        self.state.lock().priority = Some(uri);
    }

    /// Switch between sequential and randomized ordering.
    pub fn set_randomize(&self, randomize: bool) {
        self.state.lock().randomize = randomize;
    }

    /// Whether `uri` is a candidate.
    #[must_use]
    pub fn contains(&self, uri: &Url) -> bool {
        self.state.lock().uris.contains(uri)
    }

    /// Number of candidates.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().uris.len()
    }

    /// Whether there are no candidates.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().uris.is_empty()
    }

    /// All candidates in insertion order.
    #[must_use]
    pub fn uris(&self) -> Vec<Url> {
        self.state.lock().uris.clone()
    }
}
