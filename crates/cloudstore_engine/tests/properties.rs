//! Property tests for diffing and merging.

use cloudstore_cache::{EntityRow, RowId};
use cloudstore_codec::{IdentityTransform, ScalarKind, Value};
use cloudstore_engine::{
    merge_records, AttributeDescriptor, EntityDescriptor, MergePolicy, RecordIndex, RecordMapper,
    Schema,
};
use cloudstore_protocol::{Record, RecordId, ZoneId};
use proptest::prelude::*;
use std::sync::Arc;

struct NoReferences;

impl RecordIndex for NoReferences {
    fn record_id_for_row(&self, _row: RowId) -> Option<RecordId> {
        None
    }
}

fn mapper() -> RecordMapper {
    let schema = Schema::new(vec![EntityDescriptor::new("Item")
        .attribute(AttributeDescriptor::new("title", ScalarKind::String))
        .attribute(AttributeDescriptor::new("count", ScalarKind::Integer64))])
    .unwrap();
    RecordMapper::new(Arc::new(schema), Arc::new(IdentityTransform))
}

fn row(title: &Option<String>, count: &Option<i64>) -> EntityRow {
    let mut row = EntityRow::new(RowId(1), "Item", "I1");
    row.set_attribute("title", Value::from(title.clone()));
    row.set_attribute("count", Value::from(*count));
    row
}

fn record(title: &Option<String>, count: &Option<i64>) -> Record {
    let mut record = Record::new("Item", RecordId::new("I1", ZoneId::new("Z")));
    if let Some(title) = title {
        record.set("title", Value::from(title.as_str()));
    }
    if let Some(count) = count {
        record.set("count", Value::Integer(*count));
    }
    record
}

proptest! {
    #[test]
    fn diff_is_empty_iff_values_match(
        local_title in proptest::option::of("[a-c]{0,2}"),
        local_count in proptest::option::of(0i64..3),
        remote_title in proptest::option::of("[a-c]{0,2}"),
        remote_count in proptest::option::of(0i64..3),
    ) {
        let mapper = mapper();
        let row = row(&local_title, &local_count);
        let baseline = record(&remote_title, &remote_count);
        let diff = mapper.to_remote_diff(&NoReferences, &row, &baseline).unwrap();
        let equal = local_title == remote_title && local_count == remote_count;
        prop_assert_eq!(diff.is_empty(), equal);

        let applied = RecordMapper::apply_diff(&baseline, &diff);
        prop_assert_eq!(applied, record(&local_title, &local_count));
    }

    #[test]
    fn local_trump_merge_keeps_every_local_change(
        ancestor_title in proptest::option::of("[a-c]{1,2}"),
        local_title in proptest::option::of("[a-c]{1,2}"),
        remote_title in proptest::option::of("[a-c]{1,2}"),
        remote_count in proptest::option::of(0i64..3),
    ) {
        let mapper = mapper();
        let ancestor = record(&ancestor_title, &None);
        let local = mapper
            .to_remote_diff(&NoReferences, &row(&local_title, &None), &ancestor)
            .unwrap();
        let remote = record(&remote_title, &remote_count);

        let merged = merge_records(MergePolicy::PropertyLocalTrump, &ancestor, &local, &remote);
        let expected_title = if local_title != ancestor_title { &local_title } else { &remote_title };
        prop_assert_eq!(merged, record(expected_title, &remote_count));
    }
}
