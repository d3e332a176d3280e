//! CDC 수집 루틴
//!
//! CDC 소스에서 커밋된 레코드를 하나씩 받아 제한된 크기의 핸드오프 큐에 넣습니다.
//! 변환 없이 백프레셔만 전달합니다: 큐가 가득 차면 push 가 막히고,
//! 그동안 소스에서 다음 레코드를 가져오지 않습니다.
//!
//! 큐의 소비자는 외부 변환기(binlog 이벤트 생성/파일 기록)입니다.

use crate::config::IngestConfig;
use crate::error::{CdcError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// 행 변경 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RowOperation {
    Insert,
    Update,
    Delete,
    Ddl,
}

/// CDC 소스가 내보내는 커밋된 변경 레코드
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub database: String,
    pub table: String,
    pub op: RowOperation,
    /// 변경 전 행 (UPDATE, DELETE)
    pub before: Option<HashMap<String, serde_json::Value>>,
    /// 변경 후 행 (INSERT, UPDATE)
    pub after: Option<HashMap<String, serde_json::Value>>,
    /// DDL 문
    pub query: Option<String>,
    pub transaction_id: u64,
    pub commit_ts: DateTime<Utc>,
}

/// 커밋된 레코드를 순서대로 내보내는 소스
#[async_trait]
pub trait CdcSource: Send {
    /// 소스에 접속
    async fn open(&mut self, config: &IngestConfig) -> Result<()>;

    /// 다음 커밋 레코드. `Ok(None)` 은 스트림 끝.
    ///
    /// 일시 장애는 `CdcError::SourceUnavailable` 로 알립니다.
    async fn next_committed_record(&mut self) -> Result<Option<LogRecord>>;
}

pub type RecordSender = mpsc::Sender<LogRecord>;
pub type RecordReceiver = mpsc::Receiver<LogRecord>;

/// 단일 생산자/단일 소비자 핸드오프 큐
pub fn hand_off_queue(capacity: usize) -> (RecordSender, RecordReceiver) {
    mpsc::channel(capacity.max(1))
}

/// 수집 루틴 상태
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestStatus {
    Running,
    Stopped,
    /// 복구 불가능한 소스 에러. 하위 스트림에 수집 공백이 생깁니다.
    Failed(String),
}

/// 수집 루틴
pub struct IngestRoutine<S: CdcSource> {
    config: IngestConfig,
    source: S,
    queue: RecordSender,
    stop_tx: Arc<watch::Sender<bool>>,
    stop_rx: watch::Receiver<bool>,
    status: Arc<watch::Sender<IngestStatus>>,
    records_pushed: u64,
}

impl<S: CdcSource + 'static> IngestRoutine<S> {
    /// 소스에 접속해 루틴 준비. 접속 실패는 `ConfigError`.
    pub async fn init(config: IngestConfig, mut source: S, queue: RecordSender) -> Result<Self> {
        info!("Connecting to CDC source at {}", config.source_endpoint);
        source.open(&config).await.map_err(|e| {
            CdcError::ConfigError(format!(
                "Cannot reach CDC source {}: {}",
                config.source_endpoint, e
            ))
        })?;

        let (stop_tx, stop_rx) = watch::channel(false);
        let (status, _) = watch::channel(IngestStatus::Running);

        Ok(IngestRoutine {
            config,
            source,
            queue,
            stop_tx: Arc::new(stop_tx),
            stop_rx,
            status: Arc::new(status),
            records_pushed: 0,
        })
    }

    /// 중단 요청 (여러 번 호출해도 안전)
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    pub fn status(&self) -> watch::Receiver<IngestStatus> {
        self.status.subscribe()
    }

    pub fn records_pushed(&self) -> u64 {
        self.records_pushed
    }

    /// 중단될 때까지 fetch → push 반복
    pub async fn run(&mut self) -> Result<()> {
        let mut backoff = self.config.retry_initial_backoff;

        loop {
            if *self.stop_rx.borrow() {
                break;
            }

            let fetched = tokio::select! {
                biased;
                _ = self.stop_rx.changed() => break,
                fetched = self.source.next_committed_record() => fetched,
            };

            match fetched {
                Ok(Some(record)) => {
                    backoff = self.config.retry_initial_backoff;
                    match self.push(record).await {
                        Ok(true) => self.records_pushed += 1,
                        Ok(false) => break,
                        Err(e) => return Err(self.fail(e)),
                    }
                }
                Ok(None) => {
                    info!("CDC source reached end of stream");
                    break;
                }
                Err(e) if e.is_transient() => {
                    warn!("CDC source unavailable, retrying in {:?}: {}", backoff, e);
                    tokio::select! {
                        biased;
                        _ = self.stop_rx.changed() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = next_backoff(backoff, self.config.retry_max_backoff);
                }
                Err(e) => return Err(self.fail(e)),
            }
        }

        info!(
            "Ingest routine stopped after {} records",
            self.records_pushed
        );
        self.status.send_replace(IngestStatus::Stopped);
        Ok(())
    }

    /// 별도 태스크에서 실행
    pub fn spawn(mut self) -> IngestHandle {
        let stop = self.stop_tx.clone();
        let status = self.status.subscribe();
        let join = tokio::spawn(async move { self.run().await });
        IngestHandle { stop, status, join }
    }

    /// 큐가 빌 때까지 대기. 중단되면 Ok(false).
    async fn push(&mut self, record: LogRecord) -> Result<bool> {
        let push_timeout = self.config.push_timeout;
        let queue = &self.queue;
        let send = async move {
            match push_timeout {
                Some(limit) => match tokio::time::timeout(limit, queue.send(record)).await {
                    Ok(sent) => sent.map_err(|_| CdcError::ChannelClosed),
                    Err(_) => Err(CdcError::QueueBackpressureTimeout),
                },
                None => queue.send(record).await.map_err(|_| CdcError::ChannelClosed),
            }
        };

        tokio::select! {
            biased;
            _ = self.stop_rx.changed() => Ok(false),
            sent = send => sent.map(|_| true),
        }
    }

    fn fail(&self, err: CdcError) -> CdcError {
        error!("Ingest routine failed: {}", err);
        self.status.send_replace(IngestStatus::Failed(err.to_string()));
        err
    }
}

fn next_backoff(current: Duration, max: Duration) -> Duration {
    current.saturating_mul(2).min(max)
}

/// 실행 중인 수집 루틴 핸들
pub struct IngestHandle {
    stop: Arc<watch::Sender<bool>>,
    status: watch::Receiver<IngestStatus>,
    join: JoinHandle<Result<()>>,
}

impl IngestHandle {
    pub fn stop(&self) {
        debug!("Stop requested for ingest routine");
        self.stop.send_replace(true);
    }

    pub fn status(&self) -> IngestStatus {
        self.status.borrow().clone()
    }

    /// 상태 변화를 감시할 수신자 (세션 감독용)
    pub fn subscribe(&self) -> watch::Receiver<IngestStatus> {
        self.status.clone()
    }

    pub async fn join(self) -> Result<()> {
        self.join
            .await
            .map_err(|e| CdcError::Other(format!("Ingest task aborted: {}", e)))?
    }
}
