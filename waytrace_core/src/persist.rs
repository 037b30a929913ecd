//! Persistence: the schema records, the durable-store seam and a
//! sled-backed reference implementation.
//!
//! The in-memory graph is authoritative; persistence is a write-behind
//! collaborator fed whole dirty batches inside a single transaction.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sled::transaction::{ConflictableTransactionError, TransactionError, Transactional};
use uuid::Uuid;

use crate::item::{ItemKind, TimelineItem};
use crate::sample::{
    ActivityType, Location, MotionFeatures, MovingState, RecordingState, Sample, Timestamp,
};

/// Booleans are stored as 0/1.
mod int_bool {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &bool, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(u8::from(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
        Ok(u8::deserialize(deserializer)? != 0)
    }
}

// ============================================================================
// RECORDS
// ============================================================================

/// One row of the `item` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemRecord {
    pub id: Uuid,
    pub last_saved: Option<Timestamp>,
    #[serde(with = "int_bool")]
    pub deleted: bool,
    pub kind: ItemKind,
    pub start_date: Option<Timestamp>,
    pub end_date: Option<Timestamp>,
    pub previous_id: Option<Uuid>,
    pub next_id: Option<Uuid>,
    pub radius_mean: Option<f64>,
    #[serde(rename = "radiusSD")]
    pub radius_sd: Option<f64>,
    pub altitude: Option<f64>,
    pub step_count: Option<u32>,
    pub floors_up: Option<u32>,
    pub floors_down: Option<u32>,
    pub activity_type: Option<ActivityType>,
    pub centre_lat: Option<f64>,
    pub centre_lon: Option<f64>,
}

impl ItemRecord {
    pub fn from_item(item: &TimelineItem) -> Self {
        let range = item.date_range();
        let radius = item.radius();
        let centre = item.centre();
        Self {
            id: item.id,
            last_saved: item.last_saved(),
            deleted: item.deleted(),
            kind: item.kind(),
            start_date: range.map(|r| r.start),
            end_date: range.map(|r| r.end),
            previous_id: item.previous_id(),
            next_id: item.next_id(),
            radius_mean: Some(radius.mean),
            radius_sd: Some(radius.sd),
            altitude: item.altitude(),
            step_count: item.step_count(),
            floors_up: item.floors_up(),
            floors_down: item.floors_down(),
            activity_type: item.activity_type(),
            centre_lat: centre.map(|c| c.y()),
            centre_lon: centre.map(|c| c.x()),
        }
    }

    /// Rebuilds the live item skeleton; samples are re-attached by the
    /// store afterwards.
    pub(crate) fn rebuild(&self) -> Arc<TimelineItem> {
        let item = TimelineItem::with_id(self.id, self.kind);
        if self.deleted {
            item.delete();
        } else {
            item.set_previous_id(self.previous_id);
            item.set_next_id(self.next_id);
        }
        item.set_step_count(self.step_count);
        item.set_floors(self.floors_up, self.floors_down);
        if let Some(saved) = self.last_saved {
            item.set_last_saved(saved);
        }
        item
    }
}

/// One row of the `sample` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SampleRecord {
    pub id: Uuid,
    pub date: Timestamp,
    pub last_saved: Option<Timestamp>,
    pub moving_state: MovingState,
    pub recording_state: RecordingState,
    pub item_id: Option<Uuid>,
    pub step_hz: Option<f64>,
    pub course_variance: Option<f64>,
    pub xy_acceleration: Option<f64>,
    pub z_acceleration: Option<f64>,
    pub core_motion_type: Option<ActivityType>,
    pub confirmed_type: Option<ActivityType>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub altitude: Option<f64>,
    pub h_acc: Option<f64>,
    pub v_acc: Option<f64>,
    pub speed: Option<f64>,
    pub course: Option<f64>,
}

impl SampleRecord {
    pub fn from_sample(sample: &Sample) -> Self {
        let location = sample.location;
        Self {
            id: sample.id,
            date: sample.date,
            last_saved: sample.last_saved(),
            moving_state: sample.moving_state,
            recording_state: sample.recording_state,
            item_id: sample.item_id(),
            step_hz: sample.motion.step_hz,
            course_variance: sample.motion.course_variance,
            xy_acceleration: sample.motion.xy_acceleration,
            z_acceleration: sample.motion.z_acceleration,
            core_motion_type: sample.motion.core_motion_type,
            confirmed_type: sample.confirmed_activity_type(),
            lat: location.map(|l| l.latitude),
            lon: location.map(|l| l.longitude),
            altitude: location.and_then(|l| l.altitude),
            h_acc: location.map(|l| l.horizontal_accuracy),
            v_acc: location.map(|l| l.vertical_accuracy),
            speed: location.and_then(|l| l.speed),
            course: location.and_then(|l| l.course),
        }
    }

    pub(crate) fn rebuild(&self) -> Arc<Sample> {
        let location = match (self.lat, self.lon) {
            (Some(latitude), Some(longitude)) => Some(Location {
                latitude,
                longitude,
                altitude: self.altitude,
                horizontal_accuracy: self.h_acc.unwrap_or(-1.0),
                vertical_accuracy: self.v_acc.unwrap_or(-1.0),
                course: self.course,
                speed: self.speed,
            }),
            _ => None,
        };
        Arc::new(Sample::from_parts(
            self.id,
            self.date,
            location,
            self.moving_state,
            self.recording_state,
            MotionFeatures {
                step_hz: self.step_hz,
                course_variance: self.course_variance,
                xy_acceleration: self.xy_acceleration,
                z_acceleration: self.z_acceleration,
                core_motion_type: self.core_motion_type,
            },
            self.item_id,
            self.confirmed_type,
            self.last_saved,
        ))
    }
}

// ============================================================================
// THE SEAM
// ============================================================================

/// Errors from the persistence collaborator. All are transient from the
/// engine's point of view: the batch is retried on the next save tick.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("storage backend error: {0}")]
    Backend(#[from] sled::Error),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("transaction aborted: {0}")]
    Transaction(String),
}

/// The opaque durable store the engine saves through.
pub trait PersistenceStore: Send + Sync {
    /// Writes a whole dirty batch inside a single transaction. Either every
    /// record commits or none do.
    fn save_batch(
        &self,
        items: &[ItemRecord],
        samples: &[SampleRecord],
    ) -> Result<(), PersistenceError>;

    fn load_item(&self, id: Uuid) -> Result<Option<ItemRecord>, PersistenceError>;

    fn load_sample(&self, id: Uuid) -> Result<Option<SampleRecord>, PersistenceError>;

    /// All samples belonging to an item, date-ordered.
    fn load_samples_for_item(&self, item_id: Uuid)
        -> Result<Vec<SampleRecord>, PersistenceError>;

    fn delete_items(&self, ids: &[Uuid]) -> Result<(), PersistenceError>;

    fn delete_samples(&self, ids: &[Uuid]) -> Result<(), PersistenceError>;
}

// ============================================================================
// SLED BACKEND
// ============================================================================

/// Reference persistence backend on an embedded sled database.
///
/// Records are stored as JSON under their UUID bytes, with a
/// `(itemId, date, sampleId)` secondary index for the per-item sample scan.
/// Stale index entries left behind by sample moves are filtered on read.
pub struct SledStore {
    items: sled::Tree,
    samples: sled::Tree,
    samples_by_item: sled::Tree,
}

impl SledStore {
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self, PersistenceError> {
        Self::from_db(sled::open(path)?)
    }

    /// An ephemeral store for tests and simulations.
    pub fn temporary() -> Result<Self, PersistenceError> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: sled::Db) -> Result<Self, PersistenceError> {
        Ok(Self {
            items: db.open_tree("item")?,
            samples: db.open_tree("sample")?,
            samples_by_item: db.open_tree("sample_by_item")?,
        })
    }

    fn index_key(item_id: Uuid, date: Timestamp, sample_id: Uuid) -> Vec<u8> {
        let mut key = Vec::with_capacity(16 + 8 + 16);
        key.extend_from_slice(item_id.as_bytes());
        key.extend_from_slice(&date.to_be_bytes());
        key.extend_from_slice(sample_id.as_bytes());
        key
    }
}

impl PersistenceStore for SledStore {
    fn save_batch(
        &self,
        items: &[ItemRecord],
        samples: &[SampleRecord],
    ) -> Result<(), PersistenceError> {
        // Serialise outside the transaction so retries are byte copies.
        let mut item_rows = Vec::with_capacity(items.len());
        for record in items {
            item_rows.push((record.id.as_bytes().to_vec(), serde_json::to_vec(record)?));
        }
        let mut sample_rows = Vec::with_capacity(samples.len());
        for record in samples {
            let index_key = record
                .item_id
                .map(|item_id| Self::index_key(item_id, record.date, record.id));
            sample_rows.push((
                record.id.as_bytes().to_vec(),
                serde_json::to_vec(record)?,
                index_key,
            ));
        }

        (&self.items, &self.samples, &self.samples_by_item)
            .transaction(|(items_tree, samples_tree, index_tree)| {
                for (key, value) in &item_rows {
                    items_tree.insert(key.as_slice(), value.as_slice())?;
                }
                for (key, value, index_key) in &sample_rows {
                    samples_tree.insert(key.as_slice(), value.as_slice())?;
                    if let Some(index_key) = index_key {
                        index_tree.insert(index_key.as_slice(), key.as_slice())?;
                    }
                }
                Ok::<(), ConflictableTransactionError<()>>(())
            })
            .map_err(|error: TransactionError<()>| match error {
                TransactionError::Storage(e) => PersistenceError::Backend(e),
                TransactionError::Abort(()) => {
                    PersistenceError::Transaction("save batch aborted".into())
                }
            })?;
        Ok(())
    }

    fn load_item(&self, id: Uuid) -> Result<Option<ItemRecord>, PersistenceError> {
        match self.items.get(id.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn load_sample(&self, id: Uuid) -> Result<Option<SampleRecord>, PersistenceError> {
        match self.samples.get(id.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn load_samples_for_item(
        &self,
        item_id: Uuid,
    ) -> Result<Vec<SampleRecord>, PersistenceError> {
        let mut records = Vec::new();
        for entry in self.samples_by_item.scan_prefix(item_id.as_bytes()) {
            let (_, sample_key) = entry?;
            let Some(bytes) = self.samples.get(&sample_key)? else {
                continue;
            };
            let record: SampleRecord = serde_json::from_slice(&bytes)?;
            // Skip index entries from before the sample moved elsewhere.
            if record.item_id == Some(item_id) {
                records.push(record);
            }
        }
        Ok(records)
    }

    fn delete_items(&self, ids: &[Uuid]) -> Result<(), PersistenceError> {
        for id in ids {
            self.items.remove(id.as_bytes())?;
        }
        Ok(())
    }

    fn delete_samples(&self, ids: &[Uuid]) -> Result<(), PersistenceError> {
        for id in ids {
            self.samples.remove(id.as_bytes())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::ItemKind;
    use crate::sample::{MovingState, RawObservation, RecordingState};

    fn sample_record(date: Timestamp, item_id: Option<Uuid>) -> SampleRecord {
        let raw = RawObservation {
            date,
            location: Some(Location {
                latitude: -33.8688,
                longitude: 151.2093,
                altitude: Some(25.0),
                horizontal_accuracy: 8.0,
                vertical_accuracy: 10.0,
                course: Some(45.0),
                speed: Some(1.3),
            }),
            moving_state: MovingState::Moving,
            recording_state: RecordingState::Recording,
            motion: MotionFeatures::default(),
        };
        let sample = Sample::from_observation(&raw);
        sample.set_item_id(item_id);
        SampleRecord::from_sample(&sample)
    }

    #[test]
    fn test_item_record_json_field_names() {
        let item = TimelineItem::new(ItemKind::Visit);
        let record = ItemRecord::from_item(&item);
        let json = serde_json::to_value(&record).unwrap();
        assert!(json.get("previousId").is_some());
        assert!(json.get("nextId").is_some());
        assert!(json.get("radiusSD").is_some());
        assert_eq!(json["deleted"], 0);
        assert_eq!(json["kind"], "visit");
    }

    #[test]
    fn test_item_codec_round_trip_preserves_links() {
        let item = TimelineItem::new(ItemKind::Path);
        let previous = Uuid::new_v4();
        let next = Uuid::new_v4();
        item.set_previous_id(Some(previous));
        item.set_next_id(Some(next));

        let record = ItemRecord::from_item(&item);
        let json = serde_json::to_vec(&record).unwrap();
        let decoded: ItemRecord = serde_json::from_slice(&json).unwrap();
        assert_eq!(decoded, record);

        let rebuilt = decoded.rebuild();
        assert_eq!(rebuilt.id, item.id);
        assert_eq!(rebuilt.kind(), ItemKind::Path);
        assert_eq!(rebuilt.previous_id(), Some(previous));
        assert_eq!(rebuilt.next_id(), Some(next));
    }

    #[test]
    fn test_sample_codec_round_trip() {
        let record = sample_record(1_700_000_000.0, Some(Uuid::new_v4()));
        let json = serde_json::to_vec(&record).unwrap();
        let decoded: SampleRecord = serde_json::from_slice(&json).unwrap();
        assert_eq!(decoded, record);

        let rebuilt = decoded.rebuild();
        assert_eq!(rebuilt.id, record.id);
        assert_eq!(rebuilt.item_id(), record.item_id);
        assert!(rebuilt.has_usable_coordinate());
    }

    #[test]
    fn test_sled_store_save_and_load() {
        let store = SledStore::temporary().unwrap();
        let item_id = Uuid::new_v4();
        let item = TimelineItem::with_id(item_id, ItemKind::Visit);
        let item_record = ItemRecord::from_item(&item);

        let records = vec![
            sample_record(100.0, Some(item_id)),
            sample_record(300.0, Some(item_id)),
            sample_record(200.0, Some(item_id)),
        ];
        store.save_batch(&[item_record.clone()], &records).unwrap();

        let loaded = store.load_item(item_id).unwrap().unwrap();
        assert_eq!(loaded, item_record);

        let samples = store.load_samples_for_item(item_id).unwrap();
        assert_eq!(samples.len(), 3);
        // The index orders the scan by date.
        assert!(samples.windows(2).all(|w| w[0].date <= w[1].date));
    }

    #[test]
    fn test_stale_index_entries_filtered() {
        let store = SledStore::temporary().unwrap();
        let old_item = Uuid::new_v4();
        let new_item = Uuid::new_v4();

        let mut record = sample_record(100.0, Some(old_item));
        store.save_batch(&[], &[record.clone()]).unwrap();

        // The sample moves to another item and is re-saved.
        record.item_id = Some(new_item);
        store.save_batch(&[], &[record.clone()]).unwrap();

        assert!(store.load_samples_for_item(old_item).unwrap().is_empty());
        assert_eq!(store.load_samples_for_item(new_item).unwrap().len(), 1);
    }

    #[test]
    fn test_delete_removes_rows() {
        let store = SledStore::temporary().unwrap();
        let record = sample_record(100.0, None);
        store.save_batch(&[], &[record.clone()]).unwrap();
        assert!(store.load_sample(record.id).unwrap().is_some());

        store.delete_samples(&[record.id]).unwrap();
        assert!(store.load_sample(record.id).unwrap().is_none());
    }
}
