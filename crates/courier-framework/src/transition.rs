//! Conversation states and the transitions callbacks return.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// A named conversation state.
///
/// States are cheap to clone and compare by name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct State(Arc<str>);

impl State {
    /// Creates a state with the given name.
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    /// The state name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for State {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for State {
    fn from(name: String) -> Self {
        Self(Arc::from(name))
    }
}

/// What a handler's callback asks the surrounding conversation to do next.
///
/// Outside of a conversation the value is ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Transition {
    /// Keep the current state.
    #[default]
    Stay,
    /// Move to the given state.
    To(State),
    /// Terminate the conversation and drop its stored state.
    End,
}

impl Transition {
    /// Shorthand for `Transition::To(State::new(name))`.
    pub fn to(state: impl Into<State>) -> Self {
        Self::To(state.into())
    }
}

impl From<State> for Transition {
    fn from(state: State) -> Self {
        Self::To(state)
    }
}
