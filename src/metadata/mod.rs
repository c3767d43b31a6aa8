//! Metadata inverted index and filter evaluation.
//!
//! Every row may carry an ordered list of `(key, value)` pairs with typed
//! values ([`MetaValue`]). This module maintains the reverse mapping
//! `(key, value) → set of row ordinals` plus a per-row forward map used to
//! un-register a row on delete, and evaluates compound [`Filter`] trees.
//!
//! ## Evaluation policy
//!
//! - **Equality and prefix** leaves over indexed keys are served straight
//!   from posting lists (a candidate set of ordinals).
//! - All other leaves (ordering comparisons, `Contains`, negation) are
//!   verified row by row against the forward map.
//! - Compound nodes intersect/union candidate sets where available; the
//!   final verification step re-checks the *whole* filter per candidate,
//!   so index-served sets only ever need to be supersets.
//!
//! Posting lists are [`RoaringTreemap`]s because ordinals are 64-bit and
//! survive tombstoning until compaction reassigns them.

#[cfg(test)]
mod tests;

use std::collections::{BTreeMap, HashMap};

use roaring::RoaringTreemap;

use crate::encoding::{Decode, Encode, EncodingError};
use crate::store::RowId;

// ------------------------------------------------------------------------------------------------
// Typed values
// ------------------------------------------------------------------------------------------------

/// A typed metadata value.
///
/// Integers and floats compare numerically with each other; all other
/// cross-type comparisons are false.
#[derive(Debug, Clone, PartialEq)]
pub enum MetaValue {
    /// UTF-8 string.
    Str(String),
    /// 64-bit signed integer.
    Int(i64),
    /// 64-bit float.
    Float(f64),
    /// Boolean.
    Bool(bool),
}

impl MetaValue {
    /// Canonical string form used as the posting-list key.
    ///
    /// Equal values must produce equal representations; this is what makes
    /// equality lookups index-servable.
    pub fn index_repr(&self) -> String {
        match self {
            MetaValue::Str(s) => s.clone(),
            MetaValue::Int(i) => i.to_string(),
            MetaValue::Float(f) => format!("{f:?}"),
            MetaValue::Bool(b) => b.to_string(),
        }
    }

    /// Numeric view for cross-type Int/Float comparison.
    fn as_f64(&self) -> Option<f64> {
        match self {
            MetaValue::Int(i) => Some(*i as f64),
            MetaValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Ordering against another value under the cross-type rules.
    ///
    /// Returns `None` when the two values are not comparable.
    fn partial_cmp_typed(&self, other: &MetaValue) -> Option<std::cmp::Ordering> {
        match (self, other) {
            (MetaValue::Str(a), MetaValue::Str(b)) => Some(a.cmp(b)),
            (MetaValue::Bool(a), MetaValue::Bool(b)) => Some(a.cmp(b)),
            _ => match (self.as_f64(), other.as_f64()) {
                (Some(a), Some(b)) => a.partial_cmp(&b),
                _ => None,
            },
        }
    }
}

impl std::fmt::Display for MetaValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.index_repr())
    }
}

impl Encode for MetaValue {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        match self {
            MetaValue::Str(s) => {
                0u32.encode_to(buf)?;
                s.encode_to(buf)
            }
            MetaValue::Int(i) => {
                1u32.encode_to(buf)?;
                i.encode_to(buf)
            }
            MetaValue::Float(x) => {
                2u32.encode_to(buf)?;
                x.encode_to(buf)
            }
            MetaValue::Bool(b) => {
                3u32.encode_to(buf)?;
                b.encode_to(buf)
            }
        }
    }
}

impl Decode for MetaValue {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (tag, mut offset) = u32::decode_from(buf)?;
        let value = match tag {
            0 => {
                let (s, n) = String::decode_from(&buf[offset..])?;
                offset += n;
                MetaValue::Str(s)
            }
            1 => {
                let (i, n) = i64::decode_from(&buf[offset..])?;
                offset += n;
                MetaValue::Int(i)
            }
            2 => {
                let (x, n) = f64::decode_from(&buf[offset..])?;
                offset += n;
                MetaValue::Float(x)
            }
            3 => {
                let (b, n) = bool::decode_from(&buf[offset..])?;
                offset += n;
                MetaValue::Bool(b)
            }
            other => {
                return Err(EncodingError::InvalidTag {
                    tag: other,
                    type_name: "MetaValue",
                });
            }
        };
        Ok((value, offset))
    }
}

/// One `(key, value)` metadata pair as stored on a row.
pub type MetaPair = (String, MetaValue);

/// Encodable wrapper so metadata chains can travel through WAL records
/// and index save files via `encode_vec`/`decode_vec`.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedPair(pub String, pub MetaValue);

impl Encode for EncodedPair {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.0.encode_to(buf)?;
        self.1.encode_to(buf)
    }
}

impl Decode for EncodedPair {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (key, mut offset) = String::decode_from(buf)?;
        let (value, n) = MetaValue::decode_from(&buf[offset..])?;
        offset += n;
        Ok((EncodedPair(key, value), offset))
    }
}

/// Convert a pair slice into its encodable form.
pub fn to_encoded_pairs(pairs: &[MetaPair]) -> Vec<EncodedPair> {
    pairs
        .iter()
        .map(|(k, v)| EncodedPair(k.clone(), v.clone()))
        .collect()
}

/// Convert decoded pairs back into the row representation.
pub fn from_encoded_pairs(pairs: Vec<EncodedPair>) -> Vec<MetaPair> {
    pairs.into_iter().map(|EncodedPair(k, v)| (k, v)).collect()
}

// ------------------------------------------------------------------------------------------------
// Filter tree
// ------------------------------------------------------------------------------------------------

/// Comparison operator for a filter leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    /// Equal.
    Eq,
    /// Not equal.
    Ne,
    /// Less than.
    Lt,
    /// Less than or equal.
    Le,
    /// Greater than.
    Gt,
    /// Greater than or equal.
    Ge,
}

/// A compound metadata filter.
///
/// Leaves predicate on a single key; a leaf matches a row when **any**
/// pair with that key satisfies the predicate. A leaf over a missing key
/// never matches (including `Ne`).
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Compare the value under `key` against `value`.
    Cmp {
        /// Metadata key.
        key: String,
        /// Comparison operator.
        op: CmpOp,
        /// Right-hand side.
        value: MetaValue,
    },
    /// String-prefix match on the canonical value representation.
    Prefix {
        /// Metadata key.
        key: String,
        /// Required prefix.
        prefix: String,
    },
    /// Substring match on the canonical value representation.
    Contains {
        /// Metadata key.
        key: String,
        /// Required substring.
        needle: String,
    },
    /// All children must match.
    And(Vec<Filter>),
    /// At least one child must match.
    Or(Vec<Filter>),
    /// The child must not match.
    Not(Box<Filter>),
}

impl Filter {
    /// Shorthand for the common equality filter.
    pub fn eq(key: impl Into<String>, value: MetaValue) -> Self {
        Filter::Cmp {
            key: key.into(),
            op: CmpOp::Eq,
            value,
        }
    }

    /// Verify this filter against one row's metadata chain.
    pub fn matches(&self, pairs: &[MetaPair]) -> bool {
        match self {
            Filter::Cmp { key, op, value } => pairs.iter().filter(|(k, _)| k == key).any(|(_, v)| {
                match v.partial_cmp_typed(value) {
                    Some(ord) => match op {
                        CmpOp::Eq => ord.is_eq(),
                        CmpOp::Ne => ord.is_ne(),
                        CmpOp::Lt => ord.is_lt(),
                        CmpOp::Le => ord.is_le(),
                        CmpOp::Gt => ord.is_gt(),
                        CmpOp::Ge => ord.is_ge(),
                    },
                    None => false,
                }
            }),
            Filter::Prefix { key, prefix } => pairs
                .iter()
                .filter(|(k, _)| k == key)
                .any(|(_, v)| v.index_repr().starts_with(prefix.as_str())),
            Filter::Contains { key, needle } => pairs
                .iter()
                .filter(|(k, _)| k == key)
                .any(|(_, v)| v.index_repr().contains(needle.as_str())),
            Filter::And(children) => children.iter().all(|c| c.matches(pairs)),
            Filter::Or(children) => children.iter().any(|c| c.matches(pairs)),
            Filter::Not(child) => !child.matches(pairs),
        }
    }

    /// Try to serve this filter from posting lists.
    ///
    /// Returns a **superset** of the matching ordinals, or `None` when the
    /// filter (or some disjunct of it) cannot be index-served and a scan
    /// is required. Callers must still verify each candidate with
    /// [`Filter::matches`].
    pub fn candidates(&self, index: &MetadataIndex) -> Option<RoaringTreemap> {
        match self {
            Filter::Cmp {
                key,
                op: CmpOp::Eq,
                value,
            } => Some(index.candidates_eq(key, value)),
            Filter::Prefix { key, prefix } => Some(index.candidates_prefix(key, prefix)),
            // Ordering comparisons, Contains, and Ne fall back to scanning.
            Filter::Cmp { .. } | Filter::Contains { .. } => None,
            Filter::And(children) => {
                // Any indexable child bounds the candidate set; verification
                // re-applies the non-indexable children.
                let mut acc: Option<RoaringTreemap> = None;
                for child in children {
                    if let Some(set) = child.candidates(index) {
                        acc = Some(match acc {
                            Some(prev) => prev & set,
                            None => set,
                        });
                    }
                }
                acc
            }
            Filter::Or(children) => {
                // A union is only a valid superset if every disjunct is
                // index-served.
                let mut acc = RoaringTreemap::new();
                for child in children {
                    acc |= child.candidates(index)?;
                }
                Some(acc)
            }
            Filter::Not(_) => None,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Inverted index
// ------------------------------------------------------------------------------------------------

/// Reverse map `(key, value) → ordinals`, with a per-row forward map for
/// un-registration on delete.
///
/// Values are keyed by their canonical representation, and per-key posting
/// lists live in a `BTreeMap` so prefix queries can walk a contiguous
/// range instead of the whole key space.
#[derive(Debug, Default)]
pub struct MetadataIndex {
    /// key → (canonical value → posting list).
    postings: HashMap<String, BTreeMap<String, RoaringTreemap>>,

    /// ordinal → (key, canonical value) pairs registered for it.
    forward: HashMap<RowId, Vec<(String, String)>>,
}

impl MetadataIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `ordinal` under `(key, value)`.
    pub fn add(&mut self, key: &str, value: &MetaValue, ordinal: RowId) {
        let repr = value.index_repr();
        self.postings
            .entry(key.to_string())
            .or_default()
            .entry(repr.clone())
            .or_default()
            .insert(ordinal);
        self.forward
            .entry(ordinal)
            .or_default()
            .push((key.to_string(), repr));
    }

    /// Register every pair of a row's metadata chain.
    pub fn add_row(&mut self, ordinal: RowId, pairs: &[MetaPair]) {
        for (key, value) in pairs {
            self.add(key, value, ordinal);
        }
    }

    /// Remove `ordinal` from the posting list of `(key, value)`.
    ///
    /// Empty posting lists and value buckets are dropped so the index does
    /// not accumulate garbage keys across metadata updates.
    pub fn remove(&mut self, key: &str, value: &MetaValue, ordinal: RowId) {
        let repr = value.index_repr();
        self.remove_repr(key, &repr, ordinal);
        if let Some(pairs) = self.forward.get_mut(&ordinal) {
            if let Some(pos) = pairs.iter().position(|(k, r)| k == key && *r == repr) {
                pairs.swap_remove(pos);
            }
            if pairs.is_empty() {
                self.forward.remove(&ordinal);
            }
        }
    }

    fn remove_repr(&mut self, key: &str, repr: &str, ordinal: RowId) {
        if let Some(values) = self.postings.get_mut(key) {
            if let Some(set) = values.get_mut(repr) {
                set.remove(ordinal);
                if set.is_empty() {
                    values.remove(repr);
                }
            }
            if values.is_empty() {
                self.postings.remove(key);
            }
        }
    }

    /// Un-register every pair recorded for `ordinal`.
    ///
    /// Called on row delete and before a metadata replacement.
    pub fn remove_all_for(&mut self, ordinal: RowId) {
        let Some(pairs) = self.forward.remove(&ordinal) else {
            return;
        };
        for (key, repr) in pairs {
            self.remove_repr(&key, &repr, ordinal);
        }
    }

    /// Iterate the ordinals registered under `(key, value)`.
    pub fn query<'a>(
        &'a self,
        key: &str,
        value: &MetaValue,
    ) -> Box<dyn Iterator<Item = RowId> + 'a> {
        match self
            .postings
            .get(key)
            .and_then(|values| values.get(&value.index_repr()))
        {
            Some(set) => Box::new(set.iter()),
            None => Box::new(std::iter::empty()),
        }
    }

    /// Number of ordinals registered under `(key, value)`.
    pub fn count(&self, key: &str, value: &MetaValue) -> u64 {
        self.postings
            .get(key)
            .and_then(|values| values.get(&value.index_repr()))
            .map_or(0, RoaringTreemap::len)
    }

    /// Posting list for exact equality; empty when nothing matches.
    pub fn candidates_eq(&self, key: &str, value: &MetaValue) -> RoaringTreemap {
        self.postings
            .get(key)
            .and_then(|values| values.get(&value.index_repr()))
            .cloned()
            .unwrap_or_default()
    }

    /// Union of posting lists whose canonical value starts with `prefix`.
    pub fn candidates_prefix(&self, key: &str, prefix: &str) -> RoaringTreemap {
        let mut acc = RoaringTreemap::new();
        if let Some(values) = self.postings.get(key) {
            for (_, set) in values
                .range(prefix.to_string()..)
                .take_while(|(repr, _)| repr.starts_with(prefix))
            {
                acc |= set;
            }
        }
        acc
    }

    /// Drop every posting list and forward entry.
    ///
    /// Compaction uses this before re-registering live rows under their
    /// fresh ordinals.
    pub fn clear(&mut self) {
        self.postings.clear();
        self.forward.clear();
    }

    /// Number of distinct indexed keys.
    pub fn key_count(&self) -> usize {
        self.postings.len()
    }
}
