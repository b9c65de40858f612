//! `TopologyVersion` value type and its asymmetric freshness comparison (spec §3, §4.3).

use std::hash::{Hash, Hasher};

use bson::{doc, oid::ObjectId, Bson, Document};
use serde::{Deserialize, Serialize};

/// `(processId, counter)` pair reported by a server's `hello`/legacy-hello reply.
///
/// Freshness comparison is deliberately *asymmetric*: two instances with different `process_id`s
/// each consider themselves staler than the other, because a server restart invalidates every
/// prior counter without requiring a global ordering between the old and new process.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopologyVersion {
    pub process_id: ObjectId,
    pub counter: i64,
}

impl PartialEq for TopologyVersion {
    fn eq(&self, other: &Self) -> bool {
        self.process_id == other.process_id && self.counter == other.counter
    }
}

impl Eq for TopologyVersion {}

impl Hash for TopologyVersion {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.process_id.hash(state);
        self.counter.hash(state);
    }
}

impl TopologyVersion {
    /// Parses `{ processId: <ObjectId>, counter: <Int64> }`, returning `None` on any missing or
    /// mistyped field rather than erroring (spec §4.3).
    pub fn from_document(doc: &Document) -> Option<Self> {
        let process_id = doc.get_object_id("processId").ok()?;
        let counter = doc.get_i64("counter").ok()?;
        Some(TopologyVersion { process_id, counter })
    }

    /// Compares `self` (the locally held version) against `response` (a freshly observed one),
    /// returning `-1` if `self` is staler, `0` if equal, `+1` if `self` is fresher.
    ///
    /// A differing `process_id` always yields `-1` for *both* operands compared against each
    /// other; this is intentionally not antisymmetric (spec §3, §8).
    pub fn compare_freshness(&self, response: &TopologyVersion) -> i8 {
        if self.process_id != response.process_id {
            return -1;
        }

        match self.counter.cmp(&response.counter) {
            std::cmp::Ordering::Less => -1,
            std::cmp::Ordering::Equal => 0,
            std::cmp::Ordering::Greater => 1,
        }
    }

    pub fn is_staler_than(&self, response: &TopologyVersion) -> bool {
        self.compare_freshness(response) < 0
    }

    pub fn is_fresher_than(&self, response: &TopologyVersion) -> bool {
        self.compare_freshness(response) > 0
    }
}

impl From<TopologyVersion> for Bson {
    fn from(tv: TopologyVersion) -> Self {
        Bson::Document(doc! {
            "processId": tv.process_id,
            "counter": tv.counter,
        })
    }
}

/// The null-tolerant facade used when comparing an `Option<TopologyVersion>` held on a
/// description against one freshly parsed from a response: a missing operand is always the
/// staler side (spec §3, §4.3).
pub fn compare_freshness_opt(
    local: Option<&TopologyVersion>,
    response: Option<&TopologyVersion>,
) -> i8 {
    match (local, response) {
        (None, None) => 0,
        (None, Some(_)) => -1,
        (Some(_), None) => 1,
        (Some(l), Some(r)) => l.compare_freshness(r),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn oid(byte: u8) -> ObjectId {
        ObjectId::from_bytes([byte; 12])
    }

    #[test]
    fn asymmetric_across_process_ids() {
        let a = TopologyVersion { process_id: oid(1), counter: 5 };
        let b = TopologyVersion { process_id: oid(2), counter: 5 };

        assert_eq!(a.compare_freshness(&b), -1);
        assert_eq!(b.compare_freshness(&a), -1);
    }

    #[test]
    fn counter_ordering_within_same_process() {
        let c = TopologyVersion { process_id: oid(1), counter: 4 };
        let d = TopologyVersion { process_id: oid(1), counter: 5 };

        assert_eq!(c.compare_freshness(&d), -1);
        assert_eq!(d.compare_freshness(&c), 1);
        assert_eq!(d.compare_freshness(&d), 0);
    }

    #[test]
    fn document_round_trip() {
        let tv = TopologyVersion { process_id: oid(7), counter: 42 };
        let doc = doc! { "processId": tv.process_id, "counter": tv.counter };
        assert_eq!(TopologyVersion::from_document(&doc), Some(tv));
    }

    #[test]
    fn null_operand_is_staler() {
        let tv = TopologyVersion { process_id: oid(1), counter: 1 };
        assert_eq!(compare_freshness_opt(None, Some(&tv)), -1);
        assert_eq!(compare_freshness_opt(Some(&tv), None), 1);
        assert_eq!(compare_freshness_opt(None, None), 0);
    }
}
