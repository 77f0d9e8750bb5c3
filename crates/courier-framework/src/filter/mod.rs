//! Composable update filters.
//!
//! A [`Filter`] is a pure predicate over an [`Update`]. Its outcome is a
//! [`MatchResult`]: no match, a plain match, or a match carrying extracted
//! data. Data filters let a predicate hand values to the callback; the
//! dispatcher merges them into the callback context.
//!
//! Filters compose with [`and_`], [`or_`], [`xor_`] and [`not_`], or the
//! equivalent builder methods on [`BoxedFilter`]:
//!
//! ```rust,ignore
//! use courier_framework::filter::{self, Filter};
//!
//! let greeting = filter::text_starts_with("hello")
//!     .and(filter::chat_type(ChatType::Private))
//!     .and(filter::command().not());
//! ```
//!
//! Combinators short-circuit: AND stops at the first non-match, OR stops at
//! the first match. An error from an evaluated operand propagates.

mod builtin;
mod combinator;

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use courier_core::Update;

use crate::error::FilterError;

pub use builtin::{
    all, caption, chat_ids, chat_type, command, group_chats, is_command, join_request, language,
    private_chats, reply, text, text_contains, text_equals, text_starts_with, update_type,
    update_types, user_ids, usernames,
};
pub use combinator::{AndFilter, NotFilter, OrFilter, XorFilter, and_, not_, or_, xor_};

/// Named values extracted by data filters.
pub type MatchData = serde_json::Map<String, Value>;

/// Outcome of evaluating a filter.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum MatchResult {
    /// The update was rejected.
    #[default]
    NoMatch,
    /// The update was accepted.
    Match,
    /// The update was accepted and values were extracted from it.
    Data(MatchData),
}

impl MatchResult {
    /// Whether this result accepts the update.
    pub fn is_match(&self) -> bool {
        !matches!(self, Self::NoMatch)
    }

    /// The extracted data, if any.
    pub fn data(&self) -> Option<&MatchData> {
        match self {
            Self::Data(data) => Some(data),
            _ => None,
        }
    }

    /// Consumes the result, returning its data or an empty map.
    pub fn into_data(self) -> MatchData {
        match self {
            Self::Data(data) => data,
            _ => MatchData::new(),
        }
    }

    /// Conjunction of two results.
    ///
    /// Data maps are merged with the right-hand side winning on key
    /// collisions.
    pub fn merge(self, other: MatchResult) -> MatchResult {
        match (self, other) {
            (Self::NoMatch, _) | (_, Self::NoMatch) => Self::NoMatch,
            (Self::Match, Self::Match) => Self::Match,
            (Self::Data(data), Self::Match) | (Self::Match, Self::Data(data)) => Self::Data(data),
            (Self::Data(mut left), Self::Data(right)) => {
                left.extend(right);
                Self::Data(left)
            }
        }
    }
}

impl From<bool> for MatchResult {
    fn from(matched: bool) -> Self {
        if matched { Self::Match } else { Self::NoMatch }
    }
}

/// Result type for filter evaluation.
pub type FilterResult = Result<MatchResult, FilterError>;

/// A predicate over updates.
pub trait Filter: Send + Sync + 'static {
    /// Evaluates the filter against an update.
    fn check(&self, update: &Update) -> FilterResult;

    /// Human-readable name used in logs and errors.
    fn name(&self) -> String {
        let full = std::any::type_name::<Self>();
        full.rsplit("::").next().unwrap_or(full).to_string()
    }

    /// Whether this filter can produce [`MatchResult::Data`].
    fn is_data_filter(&self) -> bool {
        false
    }

    /// Erases the filter's type. A [`BoxedFilter`] is passed through as-is.
    fn into_boxed(self) -> BoxedFilter
    where
        Self: Sized,
    {
        BoxedFilter(Arc::new(self))
    }
}

// ============================================================================
// BoxedFilter
// ============================================================================

/// A shareable, type-erased filter with combinator builder methods.
#[derive(Clone)]
pub struct BoxedFilter(Arc<dyn Filter>);

impl BoxedFilter {
    /// Erases a concrete filter.
    pub fn new(filter: impl Filter) -> Self {
        filter.into_boxed()
    }

    /// Both filters must match.
    pub fn and(self, other: impl Filter) -> BoxedFilter {
        and_(self, other)
    }

    /// Either filter must match; the left one is tried first.
    pub fn or(self, other: impl Filter) -> BoxedFilter {
        or_(self, other)
    }

    /// Exactly one of the filters must match.
    pub fn xor(self, other: impl Filter) -> BoxedFilter {
        xor_(self, other)
    }

    /// Inverts this filter.
    pub fn not(self) -> BoxedFilter {
        not_(self)
    }
}

impl Filter for BoxedFilter {
    fn check(&self, update: &Update) -> FilterResult {
        self.0.check(update)
    }

    fn name(&self) -> String {
        self.0.name()
    }

    fn is_data_filter(&self) -> bool {
        self.0.is_data_filter()
    }

    fn into_boxed(self) -> BoxedFilter {
        self
    }
}

impl fmt::Debug for BoxedFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("BoxedFilter").field(&self.0.name()).finish()
    }
}

// ============================================================================
// Closure filters
// ============================================================================

type CheckFn = Arc<dyn Fn(&Update) -> FilterResult + Send + Sync>;

/// A filter backed by a closure.
#[derive(Clone)]
pub struct FnFilter {
    name: String,
    data: bool,
    check: CheckFn,
}

impl Filter for FnFilter {
    fn check(&self, update: &Update) -> FilterResult {
        (self.check)(update)
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    fn is_data_filter(&self) -> bool {
        self.data
    }
}

/// Builds a boolean filter from a closure.
pub fn filter_fn<F>(name: impl Into<String>, f: F) -> BoxedFilter
where
    F: Fn(&Update) -> bool + Send + Sync + 'static,
{
    BoxedFilter::new(FnFilter {
        name: name.into(),
        data: false,
        check: Arc::new(move |update| Ok(f(update).into())),
    })
}

/// Builds a boolean filter from a fallible closure.
///
/// An `Err` is reported as a [`FilterError`] carrying the filter's name.
pub fn try_filter_fn<F, E>(name: impl Into<String>, f: F) -> BoxedFilter
where
    F: Fn(&Update) -> Result<bool, E> + Send + Sync + 'static,
    E: fmt::Display,
{
    let name = name.into();
    let label = name.clone();
    BoxedFilter::new(FnFilter {
        name,
        data: false,
        check: Arc::new(move |update| {
            f(update)
                .map(MatchResult::from)
                .map_err(|e| FilterError::new(label.clone(), e.to_string()))
        }),
    })
}

/// Builds a data filter from a closure returning extracted values.
pub fn data_filter_fn<F>(name: impl Into<String>, f: F) -> BoxedFilter
where
    F: Fn(&Update) -> Option<MatchData> + Send + Sync + 'static,
{
    BoxedFilter::new(FnFilter {
        name: name.into(),
        data: true,
        check: Arc::new(move |update| Ok(f(update).map_or(MatchResult::NoMatch, MatchResult::Data))),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn data(pairs: &[(&str, Value)]) -> MatchData {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_merge_truth_table() {
        assert_eq!(MatchResult::Match.merge(MatchResult::Match), MatchResult::Match);
        assert_eq!(
            MatchResult::Match.merge(MatchResult::NoMatch),
            MatchResult::NoMatch
        );
        assert_eq!(
            MatchResult::Data(data(&[("a", json!(1))])).merge(MatchResult::Match),
            MatchResult::Data(data(&[("a", json!(1))]))
        );
    }

    #[test]
    fn test_merge_last_writer_wins() {
        let left = MatchResult::Data(data(&[("a", json!(1)), ("b", json!(1))]));
        let right = MatchResult::Data(data(&[("b", json!(2))]));
        let merged = left.merge(right).into_data();
        assert_eq!(merged["a"], json!(1));
        assert_eq!(merged["b"], json!(2));
    }

    #[test]
    fn test_boxing_a_boxed_filter_keeps_it() {
        let text = filter_fn("text", |_| true);
        let again = BoxedFilter::new(text.clone());
        assert!(Arc::ptr_eq(&text.0, &again.0));

        let negated = text.clone().not();
        let nested = not_(negated.clone());
        assert_eq!(nested.name(), "<not <not text>>");
        assert!(!Arc::ptr_eq(&negated.0, &nested.0));
    }

    #[test]
    fn test_try_filter_fn_reports_name() {
        let update = Update::message_update(
            1,
            courier_core::Message::new(1, courier_core::Chat::private(1)),
        );
        let failing = try_filter_fn("explodes", |_| Err::<bool, _>("boom"));
        let err = failing.check(&update).unwrap_err();
        assert_eq!(err.filter, "explodes");
        assert_eq!(err.reason, "boom");
    }
}
