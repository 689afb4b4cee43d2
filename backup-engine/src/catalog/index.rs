//! In-memory lineage index rebuilt from a catalog scan.
//!
//! Records live in an arena ordered by start time; lineage is resolved through
//! each record's forward-only `parent_id`.

use std::collections::{BTreeMap, HashMap};

use super::record::{BackupId, BackupMode, BackupRecord, BackupStatus, TimelineId};

/// Why a backup cannot be restored from its ancestry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainBreak {
    /// The backup whose chain was walked
    pub backup: BackupId,
    /// The ancestor that broke the chain
    pub ancestor: BackupId,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct CatalogIndex {
    records: Vec<BackupRecord>,
    by_id: HashMap<BackupId, usize>,
    by_timeline: BTreeMap<TimelineId, Vec<usize>>,
}

impl CatalogIndex {
    pub fn build(mut records: Vec<BackupRecord>) -> Self {
        records.sort_by_key(|r| (r.start_time, r.id));

        let mut by_id = HashMap::with_capacity(records.len());
        let mut by_timeline: BTreeMap<TimelineId, Vec<usize>> = BTreeMap::new();
        for (idx, record) in records.iter().enumerate() {
            by_id.insert(record.id, idx);
            by_timeline.entry(record.timeline_id).or_default().push(idx);
        }

        Self {
            records,
            by_id,
            by_timeline,
        }
    }

    pub fn records(&self) -> &[BackupRecord] {
        &self.records
    }

    pub fn get(&self, id: BackupId) -> Option<&BackupRecord> {
        self.by_id.get(&id).map(|&idx| &self.records[idx])
    }

    /// Most recent `OK` backup on the timeline.
    pub fn latest_ok(&self, timeline: TimelineId) -> Option<&BackupRecord> {
        self.by_timeline
            .get(&timeline)?
            .iter()
            .rev()
            .map(|&idx| &self.records[idx])
            .find(|r| r.status == BackupStatus::Ok)
    }

    pub fn children_of(&self, id: BackupId) -> Vec<&BackupRecord> {
        self.records
            .iter()
            .filter(|r| r.parent_id == Some(id))
            .collect()
    }

    /// All backups whose chain passes through `id`, oldest first.
    pub fn descendants_of(&self, id: BackupId) -> Vec<&BackupRecord> {
        let mut out = Vec::new();
        let mut frontier = vec![id];
        while let Some(current) = frontier.pop() {
            for child in self.children_of(current) {
                frontier.push(child.id);
                out.push(child);
            }
        }
        out.sort_by_key(|r| (r.start_time, r.id));
        out
    }

    /// Walk from `id` back to its base FULL backup.
    ///
    /// Returns the chain target-first. Every ancestor must exist and be `OK`;
    /// the target's own status is not checked here.
    pub fn chain(&self, id: BackupId) -> Result<Vec<&BackupRecord>, ChainBreak> {
        let Some(target) = self.get(id) else {
            return Err(ChainBreak {
                backup: id,
                ancestor: id,
                reason: "backup is missing from the catalog".to_string(),
            });
        };

        let mut chain = vec![target];
        let mut current = target;
        while current.mode != BackupMode::Full {
            let Some(parent_id) = current.parent_id else {
                return Err(ChainBreak {
                    backup: id,
                    ancestor: current.id,
                    reason: format!("{} backup has no parent", current.mode),
                });
            };
            let Some(parent) = self.get(parent_id) else {
                return Err(ChainBreak {
                    backup: id,
                    ancestor: parent_id,
                    reason: "parent backup is missing".to_string(),
                });
            };
            if parent.status != BackupStatus::Ok {
                return Err(ChainBreak {
                    backup: id,
                    ancestor: parent.id,
                    reason: format!("ancestor has status {}", parent.status),
                });
            }
            if parent.timeline_id != current.timeline_id {
                return Err(ChainBreak {
                    backup: id,
                    ancestor: parent.id,
                    reason: format!(
                        "ancestor is on timeline {}, descendant on {}",
                        parent.timeline_id, current.timeline_id
                    ),
                });
            }
            if chain.len() > self.records.len() {
                return Err(ChainBreak {
                    backup: id,
                    ancestor: parent.id,
                    reason: "lineage contains a cycle".to_string(),
                });
            }
            chain.push(parent);
            current = parent;
        }
        Ok(chain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::record::Lsn;

    fn record(ts: i64, mode: BackupMode, parent: Option<i64>, status: BackupStatus) -> BackupRecord {
        let mut r = BackupRecord::new(BackupId::from_timestamp(ts), "main", mode, TimelineId(1));
        r.parent_id = parent.map(BackupId::from_timestamp);
        r.status = status;
        r.start_lsn = Lsn(ts as u64);
        r
    }

    #[test]
    fn test_latest_ok_skips_bad_statuses() {
        let index = CatalogIndex::build(vec![
            record(100, BackupMode::Full, None, BackupStatus::Ok),
            record(200, BackupMode::Page, Some(100), BackupStatus::Ok),
            record(300, BackupMode::Page, Some(200), BackupStatus::Error),
            record(400, BackupMode::Full, None, BackupStatus::Corrupt),
            record(500, BackupMode::Delta, Some(200), BackupStatus::Running),
        ]);
        let parent = index.latest_ok(TimelineId(1)).unwrap();
        assert_eq!(parent.id, BackupId::from_timestamp(200));
        assert!(index.latest_ok(TimelineId(2)).is_none());
    }

    #[test]
    fn test_chain_reaches_full() {
        let index = CatalogIndex::build(vec![
            record(100, BackupMode::Full, None, BackupStatus::Ok),
            record(200, BackupMode::Delta, Some(100), BackupStatus::Ok),
            record(300, BackupMode::Page, Some(200), BackupStatus::Ok),
        ]);
        let chain = index.chain(BackupId::from_timestamp(300)).unwrap();
        let ids: Vec<i64> = chain.iter().map(|r| r.id.timestamp()).collect();
        assert_eq!(ids, vec![300, 200, 100]);
    }

    #[test]
    fn test_chain_names_corrupt_ancestor() {
        let index = CatalogIndex::build(vec![
            record(100, BackupMode::Full, None, BackupStatus::Corrupt),
            record(200, BackupMode::Delta, Some(100), BackupStatus::Ok),
            record(300, BackupMode::Page, Some(200), BackupStatus::Ok),
        ]);
        let err = index.chain(BackupId::from_timestamp(300)).unwrap_err();
        assert_eq!(err.ancestor, BackupId::from_timestamp(100));
        assert!(err.reason.contains("CORRUPT"));
    }

    #[test]
    fn test_chain_names_missing_ancestor() {
        let index = CatalogIndex::build(vec![record(
            200,
            BackupMode::Delta,
            Some(100),
            BackupStatus::Ok,
        )]);
        let err = index.chain(BackupId::from_timestamp(200)).unwrap_err();
        assert_eq!(err.ancestor, BackupId::from_timestamp(100));
        assert_eq!(err.reason, "parent backup is missing");
    }

    #[test]
    fn test_descendants() {
        let index = CatalogIndex::build(vec![
            record(100, BackupMode::Full, None, BackupStatus::Ok),
            record(200, BackupMode::Delta, Some(100), BackupStatus::Ok),
            record(300, BackupMode::Page, Some(200), BackupStatus::Ok),
            record(400, BackupMode::Full, None, BackupStatus::Ok),
        ]);
        let ids: Vec<i64> = index
            .descendants_of(BackupId::from_timestamp(100))
            .iter()
            .map(|r| r.id.timestamp())
            .collect();
        assert_eq!(ids, vec![200, 300]);
    }
}
