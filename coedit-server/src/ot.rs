//! Pure operational-transformation primitives over plain text.
//!
//! A [`Change`] is a normalized run of retain/insert/delete ops that rewrites
//! one string into another. All indices and lengths count Unicode scalar
//! values, never bytes. Nothing in this module touches shared state; the
//! document engine owns sequencing and persistence.

use std::fmt;

use thiserror::Error;

/// A single atomic edit run within a [`Change`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    /// Skip over the next `n` characters of the base text.
    Retain(usize),
    /// Insert the given text at the current position.
    Insert(String),
    /// Remove the next `n` characters of the base text.
    Delete(usize),
}

/// Error produced by structurally invalid changes or mismatched inputs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OtError {
    /// The change consumes more characters than the text provides.
    #[error("change consumes {consumed} characters but only {available} are available")]
    OverrunsText {
        /// Characters the change retains plus deletes.
        consumed: usize,
        /// Characters actually present.
        available: usize,
    },
    /// Two changes expected to share a base disagree on its length.
    #[error("changes disagree on base length ({left} vs {right})")]
    BaseMismatch {
        /// Base length of the left-hand change.
        left: usize,
        /// Base length of the right-hand change.
        right: usize,
    },
}

/// An ordered, normalized sequence of edit ops against a base string.
///
/// Adjacent runs of the same kind are merged as they are pushed, and an
/// insert is always ordered before an immediately preceding delete, so two
/// changes with the same effect have the same representation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Change {
    ops: Vec<Op>,
    base_len: usize,
    target_len: usize,
}

pub(crate) fn num_chars(s: &str) -> usize {
    s.chars().count()
}

impl Change {
    /// An empty change (identity on the empty string).
    pub fn new() -> Self {
        Self::default()
    }

    /// The ops making up this change.
    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    /// Characters of base text this change consumes.
    pub fn base_len(&self) -> usize {
        self.base_len
    }

    /// Characters of output this change produces.
    pub fn target_len(&self) -> usize {
        self.target_len
    }

    /// True if applying this change never alters any text.
    pub fn is_noop(&self) -> bool {
        self.ops.iter().all(|op| matches!(op, Op::Retain(_)))
    }

    /// Append a retain run.
    pub fn retain(&mut self, n: usize) -> &mut Self {
        if n == 0 {
            return self;
        }
        self.base_len += n;
        self.target_len += n;
        if let Some(Op::Retain(last)) = self.ops.last_mut() {
            *last += n;
        } else {
            self.ops.push(Op::Retain(n));
        }
        self
    }

    /// Append an insert run.
    pub fn insert(&mut self, s: &str) -> &mut Self {
        if s.is_empty() {
            return self;
        }
        self.target_len += num_chars(s);
        // Keep a trailing delete behind the insert so equivalent changes
        // normalize to the same op list.
        let pushed = match self.ops.as_mut_slice() {
            [.., Op::Insert(last)] => {
                last.push_str(s);
                return self;
            }
            [.., Op::Insert(last), Op::Delete(_)] => {
                last.push_str(s);
                return self;
            }
            [.., last @ Op::Delete(_)] => {
                std::mem::replace(last, Op::Insert(s.to_owned()))
            }
            _ => Op::Insert(s.to_owned()),
        };
        self.ops.push(pushed);
        self
    }

    /// Append a delete run.
    pub fn delete(&mut self, n: usize) -> &mut Self {
        if n == 0 {
            return self;
        }
        self.base_len += n;
        if let Some(Op::Delete(last)) = self.ops.last_mut() {
            *last += n;
        } else {
            self.ops.push(Op::Delete(n));
        }
        self
    }

    /// Build a normalized change from raw ops.
    pub fn from_ops<I: IntoIterator<Item = Op>>(ops: I) -> Self {
        let mut change = Self::new();
        for op in ops {
            match op {
                Op::Retain(n) => change.retain(n),
                Op::Insert(s) => change.insert(&s),
                Op::Delete(n) => change.delete(n),
            };
        }
        change
    }

    /// Check that this change fits a base of `base_len` characters.
    ///
    /// Shorter changes are fine (the unconsumed suffix is implicitly
    /// retained); longer ones would run past the end of the text.
    pub fn validate_against(&self, base_len: usize) -> bool {
        self.base_len <= base_len
    }

    /// Return this change extended with a trailing retain so that it
    /// consumes exactly `base_len` characters.
    pub fn padded_to(&self, base_len: usize) -> Result<Change, OtError> {
        if self.base_len > base_len {
            return Err(OtError::OverrunsText {
                consumed: self.base_len,
                available: base_len,
            });
        }
        let mut padded = self.clone();
        padded.retain(base_len - self.base_len);
        Ok(padded)
    }

    /// Apply this change to `text`, producing the rewritten string.
    ///
    /// A change that consumes fewer characters than `text` holds implicitly
    /// retains the remaining suffix.
    pub fn apply(&self, text: &str) -> Result<String, OtError> {
        let available = num_chars(text);
        if self.base_len > available {
            return Err(OtError::OverrunsText {
                consumed: self.base_len,
                available,
            });
        }
        let mut chars = text.chars();
        let mut out = String::with_capacity(text.len());
        for op in &self.ops {
            match op {
                Op::Retain(n) => out.extend(chars.by_ref().take(*n)),
                Op::Insert(s) => out.push_str(s),
                Op::Delete(n) => {
                    chars.by_ref().take(*n).for_each(drop);
                }
            }
        }
        out.extend(chars);
        Ok(out)
    }

    /// Transform two changes authored against the same base (TP1).
    ///
    /// Returns `(self', other')` such that applying `other'` after `self`
    /// yields the same text as applying `self'` after `other`. When both
    /// sides insert at the same position, `self` (the receiver) is placed
    /// first; the engine calls this with the already-applied history op as
    /// the receiver, so server history stays the canonical linearization.
    pub fn transform(&self, other: &Change) -> Result<(Change, Change), OtError> {
        if self.base_len != other.base_len {
            return Err(OtError::BaseMismatch {
                left: self.base_len,
                right: other.base_len,
            });
        }
        let mut a_prime = Change::new();
        let mut b_prime = Change::new();
        let mut a_ops = self.ops.iter().cloned();
        let mut b_ops = other.ops.iter().cloned();
        let mut a_cur = a_ops.next();
        let mut b_cur = b_ops.next();
        loop {
            match (a_cur.take(), b_cur.take()) {
                (None, None) => break,
                (Some(Op::Insert(s)), b) => {
                    a_prime.insert(&s);
                    b_prime.retain(num_chars(&s));
                    a_cur = a_ops.next();
                    b_cur = b;
                }
                (a, Some(Op::Insert(s))) => {
                    a_prime.retain(num_chars(&s));
                    b_prime.insert(&s);
                    a_cur = a;
                    b_cur = b_ops.next();
                }
                (None, Some(_)) | (Some(_), None) => {
                    return Err(OtError::BaseMismatch {
                        left: self.base_len,
                        right: other.base_len,
                    });
                }
                (Some(Op::Retain(i)), Some(Op::Retain(j))) => {
                    let n = i.min(j);
                    a_prime.retain(n);
                    b_prime.retain(n);
                    a_cur = leftover(Op::Retain(i - n)).or_else(|| a_ops.next());
                    b_cur = leftover(Op::Retain(j - n)).or_else(|| b_ops.next());
                }
                (Some(Op::Delete(i)), Some(Op::Delete(j))) => {
                    let n = i.min(j);
                    a_cur = leftover(Op::Delete(i - n)).or_else(|| a_ops.next());
                    b_cur = leftover(Op::Delete(j - n)).or_else(|| b_ops.next());
                }
                (Some(Op::Delete(i)), Some(Op::Retain(j))) => {
                    let n = i.min(j);
                    a_prime.delete(n);
                    a_cur = leftover(Op::Delete(i - n)).or_else(|| a_ops.next());
                    b_cur = leftover(Op::Retain(j - n)).or_else(|| b_ops.next());
                }
                (Some(Op::Retain(i)), Some(Op::Delete(j))) => {
                    let n = i.min(j);
                    b_prime.delete(n);
                    a_cur = leftover(Op::Retain(i - n)).or_else(|| a_ops.next());
                    b_cur = leftover(Op::Delete(j - n)).or_else(|| b_ops.next());
                }
            }
        }
        Ok((a_prime, b_prime))
    }

    /// Compose this change with one valid against its output.
    ///
    /// `apply(B, a.compose(b)?) == apply(apply(B, a)?, b)` for any base `B`
    /// this change fits.
    pub fn compose(&self, then: &Change) -> Result<Change, OtError> {
        if self.target_len != then.base_len {
            return Err(OtError::BaseMismatch {
                left: self.target_len,
                right: then.base_len,
            });
        }
        let mut composed = Change::new();
        let mut a_ops = self.ops.iter().cloned();
        let mut b_ops = then.ops.iter().cloned();
        let mut a_cur = a_ops.next();
        let mut b_cur = b_ops.next();
        loop {
            match (a_cur.take(), b_cur.take()) {
                (None, None) => break,
                (Some(Op::Delete(n)), b) => {
                    composed.delete(n);
                    a_cur = a_ops.next();
                    b_cur = b;
                }
                (a, Some(Op::Insert(s))) => {
                    composed.insert(&s);
                    a_cur = a;
                    b_cur = b_ops.next();
                }
                (None, Some(_)) | (Some(_), None) => {
                    return Err(OtError::BaseMismatch {
                        left: self.target_len,
                        right: then.base_len,
                    });
                }
                (Some(Op::Retain(i)), Some(Op::Retain(j))) => {
                    let n = i.min(j);
                    composed.retain(n);
                    a_cur = leftover(Op::Retain(i - n)).or_else(|| a_ops.next());
                    b_cur = leftover(Op::Retain(j - n)).or_else(|| b_ops.next());
                }
                (Some(Op::Retain(i)), Some(Op::Delete(j))) => {
                    let n = i.min(j);
                    composed.delete(n);
                    a_cur = leftover(Op::Retain(i - n)).or_else(|| a_ops.next());
                    b_cur = leftover(Op::Delete(j - n)).or_else(|| b_ops.next());
                }
                (Some(Op::Insert(s)), Some(Op::Delete(j))) => {
                    let len = num_chars(&s);
                    let n = len.min(j);
                    a_cur = leftover_insert(&s, n).or_else(|| a_ops.next());
                    b_cur = leftover(Op::Delete(j - n)).or_else(|| b_ops.next());
                }
                (Some(Op::Insert(s)), Some(Op::Retain(j))) => {
                    let len = num_chars(&s);
                    let n = len.min(j);
                    let kept: String = s.chars().take(n).collect();
                    composed.insert(&kept);
                    a_cur = leftover_insert(&s, n).or_else(|| a_ops.next());
                    b_cur = leftover(Op::Retain(j - n)).or_else(|| b_ops.next());
                }
            }
        }
        Ok(composed)
    }

    /// Map a character index through this change.
    ///
    /// Inserts at or before the index shift it right; deletes before it
    /// shift it left; a delete spanning the index clamps it to the start of
    /// the deleted range.
    pub fn transform_index(&self, position: u32) -> u32 {
        let target = position as usize;
        let mut base = 0usize;
        let mut mapped = target;
        for op in &self.ops {
            match op {
                Op::Retain(n) => base += n,
                Op::Insert(s) => {
                    if base <= target {
                        mapped += num_chars(s);
                    }
                }
                Op::Delete(n) => {
                    if base < target {
                        mapped -= n.min(&(target - base));
                    }
                    base += n;
                }
            }
            if base > target {
                break;
            }
        }
        mapped as u32
    }
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, op) in self.ops.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            match op {
                Op::Retain(n) => write!(f, "retain {n}")?,
                Op::Insert(s) => write!(f, "insert {s:?}")?,
                Op::Delete(n) => write!(f, "delete {n}")?,
            }
        }
        write!(f, "]")
    }
}

fn leftover(op: Op) -> Option<Op> {
    match op {
        Op::Retain(0) | Op::Delete(0) => None,
        op => Some(op),
    }
}

fn leftover_insert(s: &str, consumed: usize) -> Option<Op> {
    let rest: String = s.chars().skip(consumed).collect();
    if rest.is_empty() {
        None
    } else {
        Some(Op::Insert(rest))
    }
}

/// Produce a change turning `old` into `new`.
///
/// Uses the longest common prefix and suffix, so the result is a single
/// delete/insert pair around the edited region. Deterministic for given
/// inputs, and `diff(old, new).apply(old) == new` always holds.
pub fn diff(old: &str, new: &str) -> Change {
    let old_chars: Vec<char> = old.chars().collect();
    let new_chars: Vec<char> = new.chars().collect();
    let mut prefix = 0;
    while prefix < old_chars.len()
        && prefix < new_chars.len()
        && old_chars[prefix] == new_chars[prefix]
    {
        prefix += 1;
    }
    let mut suffix = 0;
    while suffix < old_chars.len() - prefix
        && suffix < new_chars.len() - prefix
        && old_chars[old_chars.len() - 1 - suffix] == new_chars[new_chars.len() - 1 - suffix]
    {
        suffix += 1;
    }
    let mut change = Change::new();
    change.retain(prefix);
    change.delete(old_chars.len() - prefix - suffix);
    let inserted: String = new_chars[prefix..new_chars.len() - suffix].iter().collect();
    change.insert(&inserted);
    change.retain(suffix);
    change
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn change(build: impl FnOnce(&mut Change)) -> Change {
        let mut c = Change::new();
        build(&mut c);
        c
    }

    #[test]
    fn apply_basics() {
        let c = change(|c| {
            c.retain(2).delete(1).insert("n").retain(2);
        });
        assert_eq!(c.apply("hello").unwrap(), "henlo");
    }

    #[test]
    fn apply_retains_unconsumed_suffix() {
        let c = change(|c| {
            c.insert("!");
        });
        assert_eq!(c.apply("hello").unwrap(), "!hello");

        let c = change(|c| {
            c.retain(1).delete(1);
        });
        assert_eq!(c.apply("hello").unwrap(), "hlo");
    }

    #[test]
    fn apply_rejects_overrun() {
        let c = change(|c| {
            c.retain(9);
        });
        assert_eq!(
            c.apply("hello"),
            Err(OtError::OverrunsText {
                consumed: 9,
                available: 5
            })
        );
    }

    #[test]
    fn apply_counts_chars_not_bytes() {
        let c = change(|c| {
            c.retain(2).insert("✓").delete(1);
        });
        assert_eq!(c.apply("héllo").unwrap(), "hé✓lo");
    }

    #[test]
    fn normalization_merges_adjacent_runs() {
        let c = Change::from_ops([
            Op::Retain(1),
            Op::Retain(2),
            Op::Insert("a".into()),
            Op::Insert("b".into()),
            Op::Delete(1),
            Op::Delete(1),
        ]);
        assert_eq!(
            c.ops(),
            &[Op::Retain(3), Op::Insert("ab".into()), Op::Delete(2)]
        );
    }

    #[test]
    fn insert_is_ordered_before_trailing_delete() {
        let a = change(|c| {
            c.delete(2).insert("xy");
        });
        let b = change(|c| {
            c.insert("xy").delete(2);
        });
        assert_eq!(a, b);
        assert_eq!(a.apply("hello").unwrap(), "xyllo");
    }

    #[test]
    fn transform_concurrent_inserts_receiver_wins() {
        let a = change(|c| {
            c.insert("Hello");
        });
        let b = change(|c| {
            c.insert("World");
        });
        let (a1, b1) = a.transform(&b).unwrap();
        // a applied first, then b transformed behind it.
        assert_eq!(b1.apply(&a.apply("").unwrap()).unwrap(), "HelloWorld");
        assert_eq!(a1.apply(&b.apply("").unwrap()).unwrap(), "HelloWorld");
        assert_eq!(b1.ops(), &[Op::Retain(5), Op::Insert("World".into())]);
    }

    #[test]
    fn transform_insert_inside_delete_splits_it() {
        // "abcdef": a deletes "bcde", b inserts "X" between c and d.
        let a = change(|c| {
            c.retain(1).delete(4).retain(1);
        });
        let b = change(|c| {
            c.retain(3).insert("X").retain(3);
        });
        let (a1, b1) = a.transform(&b).unwrap();
        let left = b1.apply(&a.apply("abcdef").unwrap()).unwrap();
        let right = a1.apply(&b.apply("abcdef").unwrap()).unwrap();
        assert_eq!(left, right);
        assert_eq!(left, "aXf");
    }

    #[test]
    fn transform_rejects_mismatched_bases() {
        let a = change(|c| {
            c.retain(3);
        });
        let b = change(|c| {
            c.retain(5);
        });
        assert!(a.transform(&b).is_err());
    }

    #[test]
    fn compose_chains_changes() {
        let a = change(|c| {
            c.insert("hello");
        });
        let b = change(|c| {
            c.retain(5).insert(" world");
        });
        let c = a.compose(&b).unwrap();
        assert_eq!(c.apply("").unwrap(), "hello world");
    }

    #[test]
    fn diff_round_trips() {
        for (old, new) in [
            ("", "hello"),
            ("hello", ""),
            ("hello", "henlo"),
            ("abc", "abc"),
            ("aaaa", "aa"),
            ("h🎉llo", "h🎉LLo"),
        ] {
            let d = diff(old, new);
            assert_eq!(d.apply(old).unwrap(), new, "diff({old:?}, {new:?}) = {d}");
        }
    }

    #[test]
    fn transform_index_maps_cursors() {
        // Insert before the cursor shifts it right.
        let c = change(|c| {
            c.insert("!").retain(5);
        });
        assert_eq!(c.transform_index(5), 6);
        // Insert exactly at the cursor shifts it too.
        let c = change(|c| {
            c.retain(5).insert("!");
        });
        assert_eq!(c.transform_index(5), 6);
        // Delete entirely before the cursor shrinks it.
        let c = change(|c| {
            c.retain(1).delete(2).retain(2);
        });
        assert_eq!(c.transform_index(5), 3);
        // Delete spanning the cursor clamps to the delete start.
        let c = change(|c| {
            c.retain(2).delete(3);
        });
        assert_eq!(c.transform_index(4), 2);
        // Edits after the cursor leave it alone.
        let c = change(|c| {
            c.retain(4).insert("zz");
        });
        assert_eq!(c.transform_index(2), 2);
    }

    fn arb_text() -> impl Strategy<Value = String> {
        "[a-c é✓🎉]{0,12}"
    }

    type ChangeParts = Vec<(u8, usize, String)>;

    fn arb_parts() -> impl Strategy<Value = ChangeParts> {
        prop::collection::vec((0u8..3, 1usize..4, "[x-z✓]{0,3}"), 0..10)
    }

    // Build a change consuming exactly `base_len` characters from a seed of
    // (kind, count, text) parts.
    fn build_change(base_len: usize, parts: ChangeParts) -> Change {
        let mut c = Change::new();
        let mut remaining = base_len;
        for (kind, count, text) in parts {
            match kind {
                0 => {
                    let n = count.min(remaining);
                    c.retain(n);
                    remaining -= n;
                }
                1 => {
                    let n = count.min(remaining);
                    c.delete(n);
                    remaining -= n;
                }
                _ => {
                    c.insert(&text);
                }
            }
        }
        c.retain(remaining);
        c
    }

    prop_compose! {
        fn arb_change(base_len: usize)(parts in arb_parts()) -> Change {
            build_change(base_len, parts)
        }
    }

    fn text_and_change() -> impl Strategy<Value = (String, Change)> {
        arb_text().prop_flat_map(|text| {
            let len = num_chars(&text);
            (Just(text), arb_change(len))
        })
    }

    fn text_and_two_changes() -> impl Strategy<Value = (String, Change, Change)> {
        arb_text().prop_flat_map(|text| {
            let len = num_chars(&text);
            (Just(text), arb_change(len), arb_change(len))
        })
    }

    proptest! {
        // TP1: both application orders converge.
        #[test]
        fn prop_transform_converges((base, a, b) in text_and_two_changes()) {
            let (a1, b1) = a.transform(&b).unwrap();
            let left = b1.apply(&a.apply(&base).unwrap()).unwrap();
            let right = a1.apply(&b.apply(&base).unwrap()).unwrap();
            prop_assert_eq!(left, right);
        }

        #[test]
        fn prop_diff_round_trips(old in arb_text(), new in arb_text()) {
            let d = diff(&old, &new);
            prop_assert_eq!(d.apply(&old).unwrap(), new);
        }

        #[test]
        fn prop_compose_matches_sequential_apply(
            (base, a) in text_and_change(),
            parts in arb_parts()
        ) {
            // Derive b against a's output from an independent seed.
            let mid = a.apply(&base).unwrap();
            let b = build_change(num_chars(&mid), parts);
            let composed = a.compose(&b).unwrap();
            prop_assert_eq!(
                composed.apply(&base).unwrap(),
                b.apply(&mid).unwrap()
            );
        }

        // Mapped cursors always land inside the rewritten text.
        #[test]
        fn prop_transform_index_stays_in_bounds((base, a) in text_and_change()) {
            let applied = a.apply(&base).unwrap();
            for pos in 0..=num_chars(&base) {
                let mapped = a.transform_index(pos as u32) as usize;
                prop_assert!(mapped <= num_chars(&applied));
            }
        }
    }
}
