//! Storage collaborator.
//!
//! The persistent experiment database lives outside the capture core. The
//! core only needs four things from it, captured by [`ResultStore`]. The
//! in-memory [`MemoryResultStore`] backs the binary and the tests.
//!
//! Reports may arrive more than once and out of order. Status reports are
//! full snapshots carrying `reported_at`; the store keeps the newest one and
//! ignores anything older.

use crate::clock::Timestamp;
use crate::jobs::JobStatusReport;
use crate::messages::{CapturedImage, JobRecordId, JobRecordRequest, PowerReading};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info};

/// Storage operations used by the capture core.
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Creates a capture job record and returns its id.
    async fn create_job_record(&self, request: &JobRecordRequest) -> Result<JobRecordId>;

    /// Applies a status snapshot. Returns `false` when a newer snapshot for
    /// the same job was already stored.
    async fn record_job_status(&self, report: &JobStatusReport) -> Result<bool>;

    /// Stores one captured image.
    async fn store_image(&self, image: &CapturedImage) -> Result<()>;

    /// Stores sensed power-supply values.
    async fn record_power_reading(&self, reading: &PowerReading) -> Result<()>;
}

/// Bookkeeping kept for one stored image.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredImage {
    /// Owning experiment.
    pub xp_id: i64,
    /// Encoded size in bytes.
    pub bytes: usize,
    /// When the capture was requested for.
    pub requested_timestamp: Timestamp,
    /// When the camera actually captured.
    pub capture_timestamp: Timestamp,
    /// Clockwise rotation of the stored image, in degrees.
    pub rotation: u32,
}

/// A job record and everything attributed to it.
#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    /// Assigned id.
    pub id: JobRecordId,
    /// Request the record was created from.
    pub request: JobRecordRequest,
    /// Newest status snapshot.
    pub status: Option<JobStatusReport>,
    /// Images in arrival order.
    pub images: Vec<StoredImage>,
}

#[derive(Debug, Default)]
struct StoreState {
    next_id: JobRecordId,
    records: BTreeMap<JobRecordId, JobRecord>,
    unattributed: BTreeMap<i64, JobStatusReport>,
    calibration_images: Vec<StoredImage>,
    latest_power: Option<PowerReading>,
    status_reports_received: usize,
}

/// In-memory [`ResultStore`].
#[derive(Debug, Default)]
pub struct MemoryResultStore {
    state: Mutex<StoreState>,
    record_delay: Option<Duration>,
    refuse_records: std::sync::atomic::AtomicBool,
}

impl MemoryResultStore {
    /// Creates an empty store. Ids start at 1.
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every job-record creation by `delay` (simulates a slow
    /// database).
    pub fn with_record_delay(mut self, delay: Duration) -> Self {
        self.record_delay = Some(delay);
        self
    }

    /// Makes job-record creation fail until switched back.
    pub fn set_refuse_records(&self, refuse: bool) {
        self.refuse_records
            .store(refuse, std::sync::atomic::Ordering::SeqCst);
    }

    /// One record.
    pub fn job_record(&self, id: JobRecordId) -> Option<JobRecord> {
        self.state.lock().records.get(&id).cloned()
    }

    /// All records ordered by id.
    pub fn job_records(&self) -> Vec<JobRecord> {
        self.state.lock().records.values().cloned().collect()
    }

    /// Newest status of a record.
    pub fn latest_status(&self, id: JobRecordId) -> Option<JobStatusReport> {
        self.state
            .lock()
            .records
            .get(&id)
            .and_then(|record| record.status.clone())
    }

    /// Newest status of a job without a record (captureless jobs, or jobs
    /// that never got an id) of experiment `xp_id`.
    pub fn unattributed_status(&self, xp_id: i64) -> Option<JobStatusReport> {
        self.state.lock().unattributed.get(&xp_id).cloned()
    }

    /// Images stored for a record.
    pub fn images(&self, id: JobRecordId) -> Vec<StoredImage> {
        self.state
            .lock()
            .records
            .get(&id)
            .map(|record| record.images.clone())
            .unwrap_or_default()
    }

    /// Calibration images.
    pub fn calibration_images(&self) -> Vec<StoredImage> {
        self.state.lock().calibration_images.clone()
    }

    /// Newest power-supply reading.
    pub fn latest_power_reading(&self) -> Option<PowerReading> {
        self.state.lock().latest_power.clone()
    }

    /// Number of status reports received, duplicates included.
    pub fn status_reports_received(&self) -> usize {
        self.state.lock().status_reports_received
    }
}

fn is_newer(incoming: &JobStatusReport, stored: Option<&JobStatusReport>) -> bool {
    stored.map_or(true, |stored| incoming.reported_at >= stored.reported_at)
}

#[async_trait]
impl ResultStore for MemoryResultStore {
    async fn create_job_record(&self, request: &JobRecordRequest) -> Result<JobRecordId> {
        if let Some(delay) = self.record_delay {
            tokio::time::sleep(delay).await;
        }
        if self.refuse_records.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(anyhow!(
                "job record creation refused for experiment {}",
                request.xp_id
            ));
        }

        let mut state = self.state.lock();
        state.next_id += 1;
        let id = state.next_id;
        state.records.insert(
            id,
            JobRecord {
                id,
                request: request.clone(),
                status: None,
                images: Vec::new(),
            },
        );
        info!(xp_id = request.xp_id, cjr_id = id, "job record created");
        Ok(id)
    }

    async fn record_job_status(&self, report: &JobStatusReport) -> Result<bool> {
        let mut state = self.state.lock();
        state.status_reports_received += 1;

        let slot = match report.cjr_id {
            Some(id) => {
                let record = state
                    .records
                    .get_mut(&id)
                    .ok_or_else(|| anyhow!("status for unknown job record {id}"))?;
                &mut record.status
            }
            None => {
                let newer = is_newer(report, state.unattributed.get(&report.xp_id));
                if newer {
                    state.unattributed.insert(report.xp_id, report.clone());
                }
                return Ok(newer);
            }
        };

        if is_newer(report, slot.as_ref()) {
            *slot = Some(report.clone());
            Ok(true)
        } else {
            debug!(cjr_id = ?report.cjr_id, "ignoring stale status report");
            Ok(false)
        }
    }

    async fn store_image(&self, image: &CapturedImage) -> Result<()> {
        let stored = StoredImage {
            xp_id: image.meta.xp_id,
            bytes: image.data.len(),
            requested_timestamp: image.requested_timestamp,
            capture_timestamp: image.capture_timestamp,
            rotation: image.rotation,
        };

        let mut state = self.state.lock();
        if image.meta.is_cal_image {
            state.calibration_images.push(stored);
            return Ok(());
        }
        let id = image
            .meta
            .cjr_id
            .ok_or_else(|| anyhow!("image without job record for experiment {}", image.meta.xp_id))?;
        let record = state
            .records
            .get_mut(&id)
            .ok_or_else(|| anyhow!("image for unknown job record {id}"))?;
        record.images.push(stored);
        Ok(())
    }

    async fn record_power_reading(&self, reading: &PowerReading) -> Result<()> {
        let mut state = self.state.lock();
        let newer = state
            .latest_power
            .as_ref()
            .map_or(true, |latest| reading.timestamp >= latest.timestamp);
        if newer {
            state.latest_power = Some(reading.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobStatus;
    use crate::messages::CaptureMetadata;
    use bytes::Bytes;

    fn request(xp_id: i64) -> JobRecordRequest {
        JobRecordRequest {
            xp_id,
            voltage: 5.0,
            current: 1.0,
            start_timestamp: Timestamp::from_secs(100.0),
        }
    }

    fn report(cjr_id: Option<JobRecordId>, status: JobStatus, at: f64) -> JobStatusReport {
        JobStatusReport {
            status,
            xp_id: 1,
            cjr_id,
            species: "HP".to_string(),
            total: 5,
            remaining: 2,
            voltage: 5.0,
            current: 1.0,
            start_timestamp: Some(Timestamp::from_secs(100.0)),
            stop_timestamp: None,
            seconds_left: 4,
            reported_at: Timestamp::from_secs(at),
        }
    }

    #[tokio::test]
    async fn ids_are_sequential_from_one() {
        let store = MemoryResultStore::new();
        assert_eq!(store.create_job_record(&request(1)).await.unwrap(), 1);
        assert_eq!(store.create_job_record(&request(1)).await.unwrap(), 2);
        assert_eq!(store.job_records().len(), 2);
    }

    #[tokio::test]
    async fn refused_records_fail() {
        let store = MemoryResultStore::new();
        store.set_refuse_records(true);
        assert!(store.create_job_record(&request(1)).await.is_err());
        assert!(store.job_records().is_empty());
    }

    #[tokio::test]
    async fn status_is_last_write_wins_by_reported_at() {
        let store = MemoryResultStore::new();
        let id = store.create_job_record(&request(1)).await.unwrap();

        assert!(store
            .record_job_status(&report(Some(id), JobStatus::Completed, 20.0))
            .await
            .unwrap());
        // late duplicate of an earlier snapshot
        assert!(!store
            .record_job_status(&report(Some(id), JobStatus::Running, 10.0))
            .await
            .unwrap());

        assert_eq!(store.latest_status(id).unwrap().status, JobStatus::Completed);
        assert_eq!(store.status_reports_received(), 2);
    }

    #[tokio::test]
    async fn reports_without_record_are_kept_per_experiment() {
        let store = MemoryResultStore::new();
        store
            .record_job_status(&report(None, JobStatus::Running, 5.0))
            .await
            .unwrap();
        store
            .record_job_status(&report(None, JobStatus::Completed, 6.0))
            .await
            .unwrap();
        assert_eq!(
            store.unattributed_status(1).unwrap().status,
            JobStatus::Completed
        );
        assert!(store
            .record_job_status(&report(Some(42), JobStatus::Running, 7.0))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn images_are_filed_under_their_record() {
        let store = MemoryResultStore::new();
        let id = store.create_job_record(&request(1)).await.unwrap();
        let mut meta = CaptureMetadata {
            xp_id: 1,
            cjr_id: Some(id),
            species: "HP".to_string(),
            voltage: 5.0,
            current: 1.0,
            is_cal_image: false,
        };
        let image = |meta: CaptureMetadata| CapturedImage {
            data: Bytes::from_static(&[0xFF, 0xD8, 0xFF, 0xD9]),
            requested_timestamp: Timestamp::from_secs(105.0),
            capture_timestamp: Timestamp::from_secs(105.001),
            rotation: 0,
            meta,
        };

        store.store_image(&image(meta.clone())).await.unwrap();
        assert_eq!(store.images(id).len(), 1);
        assert_eq!(store.images(id)[0].bytes, 4);

        meta.cjr_id = None;
        meta.is_cal_image = true;
        store.store_image(&image(meta.clone())).await.unwrap();
        assert_eq!(store.calibration_images().len(), 1);

        meta.is_cal_image = false;
        assert!(store.store_image(&image(meta)).await.is_err());
    }
}
