//! Purpose: Define the visitor protocol used for every record read or write.
//! Exports: `Visitor`, `VisitorAction`, `NOP`, `FnVisitor`, `visit_fn`.
//! Role: The single read-modify-write primitive; convenience ops are trivial visitors.
//! Invariants: Callbacks never fail; they only select an action.
//! Invariants: `Remove` on a missing key is a no-op; `Replace` on a missing key inserts.
//! Invariants: Callbacks must not reopen or close the database that invokes them.
use crate::core::bytes::ByteString;

/// Outcome selected by a visitor for the record it was shown.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VisitorAction {
    NoOperation,
    Replace(ByteString),
    Remove,
    /// Ends an `iterate` scan successfully; behaves as `NoOperation` elsewhere.
    Stop,
}

/// Shared "no change" answer; returning it never allocates.
pub const NOP: VisitorAction = VisitorAction::NoOperation;

impl VisitorAction {
    pub fn replace(value: impl Into<ByteString>) -> Self {
        VisitorAction::Replace(value.into())
    }

    /// Whether applying this action would mutate the store.
    pub fn is_write(&self) -> bool {
        matches!(self, VisitorAction::Replace(_) | VisitorAction::Remove)
    }
}

pub trait Visitor {
    fn visit_existing(&mut self, key: &[u8], value: &[u8]) -> VisitorAction;

    fn visit_missing(&mut self, _key: &[u8]) -> VisitorAction {
        NOP
    }
}

impl<V: Visitor + ?Sized> Visitor for &mut V {
    fn visit_existing(&mut self, key: &[u8], value: &[u8]) -> VisitorAction {
        (**self).visit_existing(key, value)
    }

    fn visit_missing(&mut self, key: &[u8]) -> VisitorAction {
        (**self).visit_missing(key)
    }
}

impl<V: Visitor + ?Sized> Visitor for Box<V> {
    fn visit_existing(&mut self, key: &[u8], value: &[u8]) -> VisitorAction {
        (**self).visit_existing(key, value)
    }

    fn visit_missing(&mut self, key: &[u8]) -> VisitorAction {
        (**self).visit_missing(key)
    }
}

/// Closure-backed visitor. The closure sees `Some(value)` for an existing
/// record and `None` for a missing key.
pub struct FnVisitor<F>(F);

pub fn visit_fn<F>(f: F) -> FnVisitor<F>
where
    F: FnMut(&[u8], Option<&[u8]>) -> VisitorAction,
{
    FnVisitor(f)
}

impl<F> Visitor for FnVisitor<F>
where
    F: FnMut(&[u8], Option<&[u8]>) -> VisitorAction,
{
    fn visit_existing(&mut self, key: &[u8], value: &[u8]) -> VisitorAction {
        (self.0)(key, Some(value))
    }

    fn visit_missing(&mut self, key: &[u8]) -> VisitorAction {
        (self.0)(key, None)
    }
}

/// Copies out the visited value, if any.
#[derive(Debug, Default)]
pub(crate) struct Getter {
    pub(crate) value: Option<ByteString>,
}

impl Visitor for Getter {
    fn visit_existing(&mut self, _key: &[u8], value: &[u8]) -> VisitorAction {
        self.value = Some(ByteString::copy_from_slice(value));
        NOP
    }
}

/// Unconditional upsert.
#[derive(Debug)]
pub(crate) struct Setter {
    pub(crate) value: ByteString,
}

impl Visitor for Setter {
    fn visit_existing(&mut self, _key: &[u8], _value: &[u8]) -> VisitorAction {
        VisitorAction::Replace(self.value.clone())
    }

    fn visit_missing(&mut self, _key: &[u8]) -> VisitorAction {
        VisitorAction::Replace(self.value.clone())
    }
}

/// Unconditional delete; records whether a record was there.
#[derive(Debug, Default)]
pub(crate) struct Remover {
    pub(crate) existed: bool,
}

impl Visitor for Remover {
    fn visit_existing(&mut self, _key: &[u8], _value: &[u8]) -> VisitorAction {
        self.existed = true;
        VisitorAction::Remove
    }
}

#[cfg(test)]
mod tests {
    use super::{Getter, NOP, Remover, Setter, Visitor, VisitorAction, visit_fn};
    use crate::core::bytes::ByteString;

    #[test]
    fn default_missing_visit_is_nop() {
        struct OnlyExisting;
        impl Visitor for OnlyExisting {
            fn visit_existing(&mut self, _key: &[u8], _value: &[u8]) -> VisitorAction {
                VisitorAction::Remove
            }
        }
        assert_eq!(OnlyExisting.visit_missing(b"k"), NOP);
    }

    #[test]
    fn closure_visitor_sees_both_paths() {
        let mut seen = Vec::new();
        let mut visitor = visit_fn(|key, value| {
            seen.push((key.to_vec(), value.map(<[u8]>::to_vec)));
            VisitorAction::replace("x")
        });
        assert_eq!(visitor.visit_existing(b"a", b"1"), VisitorAction::replace("x"));
        assert_eq!(visitor.visit_missing(b"b"), VisitorAction::replace("x"));
        drop(visitor);
        assert_eq!(
            seen,
            vec![(b"a".to_vec(), Some(b"1".to_vec())), (b"b".to_vec(), None)]
        );
    }

    #[test]
    fn builtin_visitors_pick_expected_actions() {
        let mut getter = Getter::default();
        assert_eq!(getter.visit_existing(b"k", b"v"), NOP);
        assert_eq!(getter.value, Some(ByteString::from("v")));

        let mut setter = Setter {
            value: ByteString::from("v2"),
        };
        assert_eq!(setter.visit_missing(b"k"), VisitorAction::replace("v2"));

        let mut remover = Remover::default();
        assert_eq!(remover.visit_missing(b"k"), NOP);
        assert!(!remover.existed);
        assert_eq!(remover.visit_existing(b"k", b"v"), VisitorAction::Remove);
        assert!(remover.existed);
    }

    #[test]
    fn write_intent_classification() {
        assert!(VisitorAction::Remove.is_write());
        assert!(VisitorAction::replace("v").is_write());
        assert!(!NOP.is_write());
        assert!(!VisitorAction::Stop.is_write());
    }
}
