//! Typed adapter parameters and the refcounted override overlay.

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Identifies one named adapter parameter.
///
/// Wire representation is a single octet; zero is reserved for "none".
#[derive(
    Clone,
    Copy,
    Debug,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    IntoPrimitive,
    TryFromPrimitive,
    strum::Display,
    strum::EnumIter,
)]
#[non_exhaustive]
#[repr(u8)]
pub enum ParamId {
    /// Whether type 4 tags get an NDEF application emulated for them.
    #[strum(serialize = "T4_NDEF")]
    T4Ndef = 1,
    /// NFCID1 used when listening on technology A.
    #[strum(serialize = "LA_NFCID1")]
    LaNfcid1 = 2,
}

impl ParamId {
    /// Returns the parameter id for a wire name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        use strum::IntoEnumIterator;
        Self::iter().find(|id| id.to_string() == name)
    }

    /// Returns whether `value`'s dynamic type matches the id's declared
    /// type.
    #[must_use]
    pub fn accepts(self, value: &ParamValue) -> bool {
        match self {
            Self::T4Ndef => matches!(*value, ParamValue::Bool(_)),
            Self::LaNfcid1 => matches!(*value, ParamValue::Bytes(_)),
        }
    }
}

/// Dynamically typed parameter value.
#[derive(Clone, Debug, Eq, PartialEq)]
#[allow(clippy::exhaustive_enums)]
pub enum ParamValue {
    Bool(bool),
    /// Byte-sequence value. Empty means "unset" (driver default).
    Bytes(Vec<u8>),
}

impl ParamValue {
    /// Boolean view. Any non-empty byte sequence is truthy.
    #[must_use]
    pub fn as_bool(&self) -> bool {
        match *self {
            Self::Bool(b) => b,
            Self::Bytes(ref v) => !v.is_empty(),
        }
    }

    /// Byte-sequence view, or [`None`] for booleans.
    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match *self {
            Self::Bool(_) => None,
            Self::Bytes(ref v) => Some(v),
        }
    }
}

/// One explicit parameter assignment.
#[derive(Clone, Debug, Eq, PartialEq)]
#[allow(clippy::exhaustive_structs)]
pub struct Param {
    pub id: ParamId,
    pub value: ParamValue,
}

impl Param {
    #[inline]
    #[must_use]
    pub fn new(id: ParamId, value: ParamValue) -> Self {
        Self { id, value }
    }
}

/// One outstanding override request.
#[derive(Debug)]
pub(super) struct ParamReq {
    pub params: Vec<Param>,
    pub reset: bool,
}

/// Folds outstanding requests, in registration order, into one effective
/// assignment. A reset drops everything seen so far; later values
/// overwrite earlier ones by id.
pub(super) fn compose<'a>(requests: impl Iterator<Item = &'a ParamReq>) -> Vec<Param> {
    let mut out: Vec<Param> = Vec::new();
    for req in requests {
        if req.reset {
            out.clear();
            out.extend(req.params.iter().cloned());
        } else {
            for p in &req.params {
                match out.iter_mut().find(|q| q.id == p.id) {
                    Some(q) => *q = p.clone(),
                    None => out.push(p.clone()),
                }
            }
        }
    }
    out
}

/// Merges parameter id lists, dropping duplicates and preserving the
/// first-seen order.
#[must_use]
pub fn merge_param_ids(lists: &[&[ParamId]]) -> Vec<ParamId> {
    let mut out = Vec::new();
    for list in lists {
        for &id in *list {
            if !out.contains(&id) {
                out.push(id);
            }
        }
    }
    out
}
