//! Field-level exclusions for marking

use crate::model::{NamedReference, ObjectId};
use crate::snapshot::HeapIndex;
use crate::HeapResult;
use rustc_hash::FxHashSet;

/// Referrers whose references through some fields are not followed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExcludedReferences {
    pub objects: FxHashSet<ObjectId>,
    /// Excluded field names; `None` excludes every field
    pub fields: Option<FxHashSet<String>>,
}

impl ExcludedReferences {
    pub fn new(
        objects: impl IntoIterator<Item = ObjectId>,
        fields: Option<impl IntoIterator<Item = impl Into<String>>>,
    ) -> Self {
        Self {
            objects: objects.into_iter().collect(),
            fields: fields.map(|names| names.into_iter().map(Into::into).collect()),
        }
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.objects.contains(&id)
    }
}

/// Resolves the named outbound references of an object
pub trait NamedReferences {
    fn address_of(&self, id: ObjectId) -> HeapResult<u64>;

    fn named_references(&self, id: ObjectId) -> HeapResult<Vec<NamedReference>>;
}

impl NamedReferences for HeapIndex {
    fn address_of(&self, id: ObjectId) -> HeapResult<u64> {
        HeapIndex::address_of(self, id)
    }

    fn named_references(&self, id: ObjectId) -> HeapResult<Vec<NamedReference>> {
        HeapIndex::named_references(self, id)
    }
}

pub(crate) struct ExclusionFilter<'a, N> {
    excluded: &'a [ExcludedReferences],
    names: &'a N,
}

impl<'a, N: NamedReferences> ExclusionFilter<'a, N> {
    pub(crate) fn new(excluded: &'a [ExcludedReferences], names: &'a N) -> Self {
        Self { excluded, names }
    }

    /// True when `referrer` reaches `referent` only through excluded fields.
    /// The first descriptor holding the referrer decides.
    pub(crate) fn skips(&self, referrer: ObjectId, referent: ObjectId) -> HeapResult<bool> {
        let Some(descriptor) = self.excluded.iter().find(|d| d.contains(referrer)) else {
            return Ok(false);
        };
        let Some(fields) = &descriptor.fields else {
            return Ok(true);
        };

        let address = self.names.address_of(referent)?;
        let through_other_field = self
            .names
            .named_references(referrer)?
            .iter()
            .any(|r| r.address == address && !fields.contains(&r.name));
        Ok(!through_other_field)
    }
}
