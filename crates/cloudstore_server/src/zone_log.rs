//! Per-zone record state and change log.

use cloudstore_protocol::{
    ChangeToken, Record, RecordId, RemoteError, RemoteErrorCode, RemoteResult, ZoneChange,
    ZoneChangesPage, ZoneId,
};
use std::collections::BTreeMap;

/// Records of one zone and the position of every change.
///
/// Each save or delete takes the next zone sequence number. A record only
/// remembers its latest change, so the change feed collapses repeated
/// edits of a record into one entry. Deletions are kept as tombstones so a
/// reader behind the current position still learns about them.
#[derive(Debug)]
pub struct ZoneLog {
    zone_id: ZoneId,
    records: BTreeMap<String, (Record, u64)>,
    tombstones: BTreeMap<String, (RecordId, u64)>,
    sequence: u64,
}

impl ZoneLog {
    /// Creates an empty zone.
    pub fn new(zone_id: ZoneId) -> Self {
        Self {
            zone_id,
            records: BTreeMap::new(),
            tombstones: BTreeMap::new(),
            sequence: 0,
        }
    }

    /// Returns the zone id.
    pub fn zone_id(&self) -> &ZoneId {
        &self.zone_id
    }

    /// Returns the latest sequence number.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Returns the current copy of a record.
    pub fn record(&self, record_name: &str) -> Option<&Record> {
        self.records.get(record_name).map(|(record, _)| record)
    }

    /// Returns all live records ordered by name.
    pub fn records(&self) -> Vec<Record> {
        self.records.values().map(|(r, _)| r.clone()).collect()
    }

    /// Returns up to `limit` changes after the position in `since`.
    pub fn changes_since(
        &self,
        since: Option<&ChangeToken>,
        limit: usize,
    ) -> RemoteResult<ZoneChangesPage> {
        let since = match since {
            Some(token) => decode_token(token)?,
            None => 0,
        };
        if since > self.sequence {
            return Err(RemoteError::new(
                RemoteErrorCode::InvalidArguments,
                format!("change token {since} is ahead of zone {}", self.zone_id),
            ));
        }

        let mut pending: Vec<(u64, ZoneChange)> = self
            .records
            .values()
            .filter(|(_, seq)| *seq > since)
            .map(|(record, seq)| (*seq, ZoneChange::Changed(record.clone())))
            .chain(
                self.tombstones
                    .values()
                    .filter(|(_, seq)| *seq > since)
                    .map(|(id, seq)| (*seq, ZoneChange::Deleted(id.clone()))),
            )
            .collect();
        pending.sort_by_key(|(seq, _)| *seq);

        let limit = limit.max(1);
        let more_coming = pending.len() > limit;
        pending.truncate(limit);
        let position = if more_coming {
            pending.last().map_or(since, |(seq, _)| *seq)
        } else {
            self.sequence
        };

        Ok(ZoneChangesPage {
            changes: pending.into_iter().map(|(_, change)| change).collect(),
            new_token: encode_token(position),
            more_coming,
        })
    }

    /// Saves a record if its change tag matches the stored one.
    ///
    /// A record that does not exist is always accepted. A stale or missing
    /// tag on an existing record fails with `ServerRecordChanged` carrying
    /// the stored copy.
    pub fn save(&mut self, mut record: Record) -> RemoteResult<Record> {
        let name = record.record_name().to_string();
        if let Some((current, _)) = self.records.get(&name) {
            if current.change_tag != record.change_tag {
                return Err(RemoteError::server_record_changed(current.clone()));
            }
        }

        self.sequence += 1;
        record.change_tag = Some(format!("{:x}-{}", self.sequence, self.zone_id.zone_name));
        self.tombstones.remove(&name);
        self.records.insert(name, (record.clone(), self.sequence));
        Ok(record)
    }

    /// Deletes a record; fails with `UnknownItem` if it does not exist.
    pub fn delete(&mut self, record_id: &RecordId) -> RemoteResult<()> {
        let name = &record_id.record_name;
        if self.records.remove(name).is_none() {
            return Err(RemoteError::new(
                RemoteErrorCode::UnknownItem,
                format!("record {name} not found"),
            ));
        }
        self.sequence += 1;
        self.tombstones
            .insert(name.clone(), (record_id.clone(), self.sequence));
        Ok(())
    }
}

fn encode_token(sequence: u64) -> ChangeToken {
    ChangeToken::new(sequence.to_le_bytes().to_vec())
}

fn decode_token(token: &ChangeToken) -> RemoteResult<u64> {
    let bytes: [u8; 8] = token.as_bytes().try_into().map_err(|_| {
        RemoteError::new(RemoteErrorCode::InvalidArguments, "malformed change token")
    })?;
    Ok(u64::from_le_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloudstore_codec::Value;

    fn zone() -> ZoneId {
        ZoneId::new("Z")
    }

    fn record(name: &str, title: &str) -> Record {
        Record::new("Note", RecordId::new(name, zone())).with_field("title", Value::from(title))
    }

    #[test]
    fn save_assigns_tags() {
        let mut log = ZoneLog::new(zone());
        let saved = log.save(record("a", "one")).unwrap();
        assert!(saved.change_tag.is_some());
        assert_eq!(log.sequence(), 1);

        // Saving with the returned tag succeeds and changes the tag.
        let mut edit = saved.clone();
        edit.set("title", Value::from("two"));
        let resaved = log.save(edit).unwrap();
        assert_ne!(resaved.change_tag, saved.change_tag);
    }

    #[test]
    fn stale_tag_conflicts() {
        let mut log = ZoneLog::new(zone());
        let saved = log.save(record("a", "one")).unwrap();
        log.save(saved.clone()).unwrap();

        let err = log.save(saved).unwrap_err();
        assert!(err.is_conflict());
        let server = err.server_record.unwrap();
        assert_eq!(server.scalar("title"), Some(&Value::from("one")));
    }

    #[test]
    fn create_over_existing_conflicts() {
        let mut log = ZoneLog::new(zone());
        log.save(record("a", "one")).unwrap();
        assert!(log.save(record("a", "other")).unwrap_err().is_conflict());
    }

    #[test]
    fn delete_missing_is_unknown_item() {
        let mut log = ZoneLog::new(zone());
        let err = log.delete(&RecordId::new("nope", zone())).unwrap_err();
        assert_eq!(err.code, RemoteErrorCode::UnknownItem);
    }

    #[test]
    fn feed_collapses_and_pages() {
        let mut log = ZoneLog::new(zone());
        let a = log.save(record("a", "1")).unwrap();
        log.save(record("b", "1")).unwrap();
        log.save(record("c", "1")).unwrap();
        log.save(a).unwrap(); // a moves to the end
        log.delete(&RecordId::new("b", zone())).unwrap();

        let first = log.changes_since(None, 2).unwrap();
        assert!(first.more_coming);
        let ids: Vec<_> = first.changes.iter().map(|c| c.record_id().record_name.clone()).collect();
        assert_eq!(ids, vec!["c", "a"]);

        let second = log.changes_since(Some(&first.new_token), 2).unwrap();
        assert!(!second.more_coming);
        assert!(matches!(second.changes.as_slice(), [ZoneChange::Deleted(id)] if id.record_name == "b"));

        let empty = log.changes_since(Some(&second.new_token), 2).unwrap();
        assert!(empty.is_empty());
        assert_eq!(empty.new_token, second.new_token);
    }

    #[test]
    fn bad_tokens_are_rejected() {
        let log = ZoneLog::new(zone());
        assert!(log.changes_since(Some(&ChangeToken::new(vec![1])), 10).is_err());
        assert!(log.changes_since(Some(&encode_token(5)), 10).is_err());
    }
}
