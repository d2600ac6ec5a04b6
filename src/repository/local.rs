use super::{distinct_call_ids, Repository};
use crate::callrecord::{CallRecord, RawRecord, RtcpRawPacket, RtcpReport, SipRecord};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::path::{Path, PathBuf};
use tokio::{fs::OpenOptions, io::AsyncWriteExt, sync::Mutex};
use tracing::{info, warn};

const SIP_RECORDS: &str = "sip_records.jsonl";
const RAW_RECORDS: &str = "raw_records.jsonl";
const CALL_RECORDS: &str = "call_records.jsonl";
const RTCP_REPORTS: &str = "rtcp_reports.jsonl";
const RTCP_RAW_PACKETS: &str = "rtcp_raw_packets.jsonl";

/// Appends one JSON document per line, one file per entity, under `root`.
pub struct LocalRepository {
    root: PathBuf,
    // serialises appends so lines from concurrent writers never interleave
    write_lock: Mutex<()>,
}

impl LocalRepository {
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root)
            .await
            .with_context(|| format!("failed to create repository root {}", root.display()))?;
        info!(root = %root.display(), "local repository opened");
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn append<T: Serialize>(&self, file: &str, items: &[T]) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        let mut buf = Vec::new();
        for item in items {
            serde_json::to_writer(&mut buf, item)?;
            buf.push(b'\n');
        }

        let path = self.root.join(file);
        let _guard = self.write_lock.lock().await;
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("failed to open {}", path.display()))?;
        f.write_all(&buf).await?;
        f.flush().await?;
        Ok(())
    }

    /// Read every line of `file`. Lines that fail to decode are skipped.
    async fn scan<T: DeserializeOwned>(&self, file: &str) -> Result<Vec<T>> {
        let path = self.root.join(file);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).with_context(|| format!("failed to read {}", path.display())),
        };
        let mut items = Vec::new();
        for (lineno, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(item) => items.push(item),
                Err(e) => {
                    warn!(file = %path.display(), line = lineno + 1, error = %e, "skipping corrupt line")
                }
            }
        }
        Ok(items)
    }
}

#[async_trait]
impl Repository for LocalRepository {
    async fn create_record(&self, record: &SipRecord) -> Result<()> {
        self.append(SIP_RECORDS, std::slice::from_ref(record)).await
    }

    async fn create_raw_record(&self, record: &RawRecord) -> Result<()> {
        self.append(RAW_RECORDS, std::slice::from_ref(record)).await
    }

    async fn create_call_record(&self, record: &CallRecord) -> Result<()> {
        self.append(CALL_RECORDS, std::slice::from_ref(record)).await
    }

    async fn get_call_records_by_call_ids(&self, call_ids: &[String]) -> Result<Vec<CallRecord>> {
        if call_ids.is_empty() {
            return Ok(Vec::new());
        }
        let records: Vec<CallRecord> = self.scan(CALL_RECORDS).await?;
        Ok(records
            .into_iter()
            .filter(|r| call_ids.contains(&r.call_id))
            .collect())
    }

    async fn get_call_ids_by_session_id(&self, session_id: &str) -> Result<Vec<String>> {
        let records: Vec<SipRecord> = self.scan(SIP_RECORDS).await?;
        Ok(distinct_call_ids(
            records
                .iter()
                .filter(|r| r.message.session_id.as_deref() == Some(session_id))
                .map(|r| r.message.call_id.as_str()),
        ))
    }

    async fn create_rtcp_report(&self, report: &RtcpReport) -> Result<()> {
        self.append(RTCP_REPORTS, std::slice::from_ref(report)).await
    }

    async fn create_rtcp_raw_packets(&self, packets: &[RtcpRawPacket]) -> Result<()> {
        self.append(RTCP_RAW_PACKETS, packets).await
    }
}
