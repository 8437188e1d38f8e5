//! Specification pattern
//!
//! A specification is a predicate over a value that can be combined with
//! others. Search filters are expressed as specifications so every engine
//! applies the same rules.

use std::sync::Arc;

/// A rule a value either satisfies or not
pub trait Specification<T>: Send + Sync {
    fn is_satisfied_by(&self, candidate: &T) -> bool;

    /// Require both this rule and `other`
    fn and<S: Specification<T> + 'static>(self, other: S) -> AndSpecification<T>
    where
        Self: Sized + 'static,
    {
        AndSpecification {
            left: Arc::new(self),
            right: Arc::new(other),
        }
    }
}

/// Conjunction of two specifications
pub struct AndSpecification<T> {
    left: Arc<dyn Specification<T>>,
    right: Arc<dyn Specification<T>>,
}

impl<T> Specification<T> for AndSpecification<T>
where
    T: Send + Sync,
{
    fn is_satisfied_by(&self, candidate: &T) -> bool {
        self.left.is_satisfied_by(candidate) && self.right.is_satisfied_by(candidate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Row {
        archived: bool,
        views: u32,
    }

    struct Live;

    impl Specification<Row> for Live {
        fn is_satisfied_by(&self, row: &Row) -> bool {
            !row.archived
        }
    }

    struct Popular(u32);

    impl Specification<Row> for Popular {
        fn is_satisfied_by(&self, row: &Row) -> bool {
            row.views >= self.0
        }
    }

    #[test]
    fn test_and_requires_both() {
        let live_and_popular = Live.and(Popular(10));

        assert!(live_and_popular.is_satisfied_by(&Row { archived: false, views: 20 }));
        assert!(!live_and_popular.is_satisfied_by(&Row { archived: false, views: 1 }));
        assert!(!live_and_popular.is_satisfied_by(&Row { archived: true, views: 50 }));
    }

    #[test]
    fn test_and_chains() {
        let spec = Live.and(Popular(10)).and(Popular(100));

        assert!(spec.is_satisfied_by(&Row { archived: false, views: 150 }));
        assert!(!spec.is_satisfied_by(&Row { archived: false, views: 50 }));
    }
}
