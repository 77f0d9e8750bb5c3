//! Boolean combinators over filters.

use courier_core::Update;

use super::{BoxedFilter, Filter, FilterResult, MatchResult};

/// Both operands must match. Data maps are merged, right side wins.
#[derive(Clone)]
pub struct AndFilter {
    left: BoxedFilter,
    right: BoxedFilter,
}

impl Filter for AndFilter {
    fn check(&self, update: &Update) -> FilterResult {
        let left = self.left.check(update)?;
        if !left.is_match() {
            return Ok(MatchResult::NoMatch);
        }
        let right = self.right.check(update)?;
        Ok(left.merge(right))
    }

    fn name(&self) -> String {
        format!("<{} and {}>", self.left.name(), self.right.name())
    }

    fn is_data_filter(&self) -> bool {
        self.left.is_data_filter() || self.right.is_data_filter()
    }
}

/// The first matching operand wins; the left one is tried first.
#[derive(Clone)]
pub struct OrFilter {
    left: BoxedFilter,
    right: BoxedFilter,
}

impl Filter for OrFilter {
    fn check(&self, update: &Update) -> FilterResult {
        let left = self.left.check(update)?;
        if left.is_match() {
            return Ok(left);
        }
        self.right.check(update)
    }

    fn name(&self) -> String {
        format!("<{} or {}>", self.left.name(), self.right.name())
    }

    fn is_data_filter(&self) -> bool {
        self.left.is_data_filter() || self.right.is_data_filter()
    }
}

/// Exactly one operand must match. The result is always boolean.
#[derive(Clone)]
pub struct XorFilter {
    left: BoxedFilter,
    right: BoxedFilter,
}

impl Filter for XorFilter {
    fn check(&self, update: &Update) -> FilterResult {
        let left = self.left.check(update)?.is_match();
        let right = self.right.check(update)?.is_match();
        Ok((left != right).into())
    }

    fn name(&self) -> String {
        format!("<{} xor {}>", self.left.name(), self.right.name())
    }
}

/// Inverts the operand. Extracted data is discarded.
#[derive(Clone)]
pub struct NotFilter {
    inner: BoxedFilter,
}

impl Filter for NotFilter {
    fn check(&self, update: &Update) -> FilterResult {
        Ok((!self.inner.check(update)?.is_match()).into())
    }

    fn name(&self) -> String {
        format!("<not {}>", self.inner.name())
    }
}

/// Conjunction of two filters.
pub fn and_(left: impl Filter, right: impl Filter) -> BoxedFilter {
    BoxedFilter::new(AndFilter {
        left: left.into_boxed(),
        right: right.into_boxed(),
    })
}

/// Left-biased disjunction of two filters.
pub fn or_(left: impl Filter, right: impl Filter) -> BoxedFilter {
    BoxedFilter::new(OrFilter {
        left: left.into_boxed(),
        right: right.into_boxed(),
    })
}

/// Exclusive disjunction of two filters.
pub fn xor_(left: impl Filter, right: impl Filter) -> BoxedFilter {
    BoxedFilter::new(XorFilter {
        left: left.into_boxed(),
        right: right.into_boxed(),
    })
}

/// Negation of a filter.
pub fn not_(inner: impl Filter) -> BoxedFilter {
    BoxedFilter::new(NotFilter {
        inner: inner.into_boxed(),
    })
}
