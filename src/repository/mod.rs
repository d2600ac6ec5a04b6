use crate::callrecord::{CallRecord, RawRecord, RtcpRawPacket, RtcpReport, SipRecord};
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{collections::HashSet, sync::Arc};
use tokio::sync::Mutex;

pub mod local;
pub use local::LocalRepository;

/// Storage used by the correlation engine and the console.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Repository: Send + Sync {
    async fn create_record(&self, record: &SipRecord) -> Result<()>;
    async fn create_raw_record(&self, record: &RawRecord) -> Result<()>;
    async fn create_call_record(&self, record: &CallRecord) -> Result<()>;
    async fn get_call_records_by_call_ids(&self, call_ids: &[String]) -> Result<Vec<CallRecord>>;
    async fn get_call_ids_by_session_id(&self, session_id: &str) -> Result<Vec<String>>;
    async fn create_rtcp_report(&self, report: &RtcpReport) -> Result<()>;
    async fn create_rtcp_raw_packets(&self, packets: &[RtcpRawPacket]) -> Result<()>;
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum RepositoryConfig {
    Memory,
    Local { root: String },
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self::Memory
    }
}

pub async fn create_repository(config: &RepositoryConfig) -> Result<Arc<dyn Repository>> {
    match config {
        RepositoryConfig::Memory => Ok(Arc::new(MemoryRepository::new())),
        RepositoryConfig::Local { root } => Ok(Arc::new(LocalRepository::open(root).await?)),
    }
}

#[derive(Default)]
struct MemoryTables {
    records: Vec<SipRecord>,
    raw_records: Vec<RawRecord>,
    call_records: Vec<CallRecord>,
    rtcp_reports: Vec<RtcpReport>,
    rtcp_raw_packets: Vec<RtcpRawPacket>,
}

pub struct MemoryRepository {
    tables: Mutex<MemoryTables>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(MemoryTables::default()),
        }
    }

    pub async fn records(&self) -> Vec<SipRecord> {
        self.tables.lock().await.records.clone()
    }

    pub async fn raw_records(&self) -> Vec<RawRecord> {
        self.tables.lock().await.raw_records.clone()
    }

    pub async fn call_records(&self) -> Vec<CallRecord> {
        self.tables.lock().await.call_records.clone()
    }

    pub async fn rtcp_reports(&self) -> Vec<RtcpReport> {
        self.tables.lock().await.rtcp_reports.clone()
    }

    pub async fn rtcp_raw_packets(&self) -> Vec<RtcpRawPacket> {
        self.tables.lock().await.rtcp_raw_packets.clone()
    }
}

impl Default for MemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn create_record(&self, record: &SipRecord) -> Result<()> {
        self.tables.lock().await.records.push(record.clone());
        Ok(())
    }

    async fn create_raw_record(&self, record: &RawRecord) -> Result<()> {
        self.tables.lock().await.raw_records.push(record.clone());
        Ok(())
    }

    async fn create_call_record(&self, record: &CallRecord) -> Result<()> {
        self.tables.lock().await.call_records.push(record.clone());
        Ok(())
    }

    async fn get_call_records_by_call_ids(&self, call_ids: &[String]) -> Result<Vec<CallRecord>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .call_records
            .iter()
            .filter(|r| call_ids.contains(&r.call_id))
            .cloned()
            .collect())
    }

    async fn get_call_ids_by_session_id(&self, session_id: &str) -> Result<Vec<String>> {
        let tables = self.tables.lock().await;
        Ok(distinct_call_ids(
            tables
                .records
                .iter()
                .filter(|r| r.message.session_id.as_deref() == Some(session_id))
                .map(|r| r.message.call_id.as_str()),
        ))
    }

    async fn create_rtcp_report(&self, report: &RtcpReport) -> Result<()> {
        self.tables.lock().await.rtcp_reports.push(report.clone());
        Ok(())
    }

    async fn create_rtcp_raw_packets(&self, packets: &[RtcpRawPacket]) -> Result<()> {
        self.tables
            .lock()
            .await
            .rtcp_raw_packets
            .extend_from_slice(packets);
        Ok(())
    }
}

/// Call ids in first-seen order without duplicates.
pub(crate) fn distinct_call_ids<'a>(ids: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut seen = HashSet::new();
    ids.filter(|id| seen.insert(*id))
        .map(str::to_string)
        .collect()
}
