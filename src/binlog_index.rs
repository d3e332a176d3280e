//! Binlog 인덱스와 파일 저장소 (읽기 전용 측)
//!
//! 인덱스 파일은 JSON lines 형식이며 파일마다 한 줄의 레코드를 가집니다.
//! 인덱스와 binlog 파일은 외부 변환기가 쓰고, 이 모듈은 동시에 읽기만 합니다.
//! 현재 열린 파일의 끝부분은 쓰는 중일 수 있으므로 길이를 매번 다시 확인합니다.

use crate::binlog::{BinlogParser, RawEvent};
use crate::config::BinlogConfig;
use crate::error::{CdcError, Result};
use crate::events::{ChecksumAlg, EventHeader, BINLOG_MAGIC_SIZE, EVENT_HEADER_SIZE};
use crate::gtid::GtidSet;
use serde::{Deserialize, Serialize};
use std::io::{ErrorKind, SeekFrom};
use std::path::PathBuf;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, warn};

/// 인덱스 레코드 (binlog 파일 하나)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinlogIndexRecord {
    pub file_name: String,
    pub index: u64,
    /// 첫 이벤트 위치
    #[serde(default = "default_start_position")]
    pub start_position: u64,
    /// 변환기가 마지막으로 기록한 완전한 이벤트의 끝 (0 = 알 수 없음)
    #[serde(default)]
    pub end_position: u64,
    /// 첫 이벤트의 커밋 타임스탬프 (초)
    #[serde(default)]
    pub first_event_ts: u64,
    /// 이 파일 이전까지 실행된 GTID
    #[serde(default)]
    pub previous_gtids: GtidSet,
    /// 이 파일 끝까지 실행된 GTID (previous_gtids 포함)
    #[serde(default)]
    pub executed_gtids: GtidSet,
}

fn default_start_position() -> u64 {
    BINLOG_MAGIC_SIZE
}

impl BinlogIndexRecord {
    pub fn new(config: &BinlogConfig, index: u64) -> Self {
        BinlogIndexRecord {
            file_name: config.file_name(index),
            index,
            start_position: BINLOG_MAGIC_SIZE,
            end_position: 0,
            first_event_ts: 0,
            previous_gtids: GtidSet::new(),
            executed_gtids: GtidSet::new(),
        }
    }
}

/// 인덱스 스냅샷
#[derive(Debug, Clone, Default)]
pub struct BinlogIndex {
    records: Vec<BinlogIndexRecord>,
}

impl BinlogIndex {
    /// 디스크에서 인덱스 로드 (파일이 아직 없으면 빈 인덱스)
    pub async fn load(config: &BinlogConfig) -> Result<Self> {
        match tokio::fs::read_to_string(config.index_path()).await {
            Ok(text) => Self::parse(&text),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("Binlog index {:?} not found yet", config.index_path());
                Ok(BinlogIndex::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// 줄바꿈으로 끝나지 않은 마지막 줄은 쓰는 중인 레코드로 보고, 파싱되지 않으면 무시합니다.
    pub fn parse(text: &str) -> Result<Self> {
        let mut records: Vec<BinlogIndexRecord> = Vec::new();
        let complete = text.ends_with('\n');
        let lines: Vec<&str> = text.split('\n').collect();
        let last = lines.len().saturating_sub(1);

        for (i, line) in lines.iter().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<BinlogIndexRecord>(line) {
                Ok(record) => {
                    if let Some(prev) = records.last() {
                        if record.index <= prev.index {
                            return Err(CdcError::BinlogParseError(format!(
                                "Binlog index out of order: {} after {}",
                                record.file_name, prev.file_name
                            )));
                        }
                    }
                    records.push(record);
                }
                Err(e) if i == last && !complete => {
                    debug!("Ignoring in-flight binlog index line: {}", e);
                }
                Err(e) => {
                    return Err(CdcError::BinlogParseError(format!(
                        "Corrupted binlog index line {}: {}",
                        i + 1,
                        e
                    )));
                }
            }
        }

        Ok(BinlogIndex { records })
    }

    /// 변환기 측에서 레코드 추가
    pub async fn append(config: &BinlogConfig, record: &BinlogIndexRecord) -> Result<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(config.index_path())
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    pub fn records(&self) -> &[BinlogIndexRecord] {
        &self.records
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn first(&self) -> Option<&BinlogIndexRecord> {
        self.records.first()
    }

    pub fn last(&self) -> Option<&BinlogIndexRecord> {
        self.records.last()
    }

    pub fn find(&self, file_name: &str) -> Option<&BinlogIndexRecord> {
        self.records.iter().find(|r| r.file_name == file_name)
    }

    /// 주어진 파일 바로 다음 파일
    pub fn next_after(&self, file_name: &str) -> Option<&BinlogIndexRecord> {
        let pos = self.records.iter().position(|r| r.file_name == file_name)?;
        self.records.get(pos + 1)
    }

    /// 위치 기반 요청의 시작 파일. 빈 파일명은 첫 파일을 뜻합니다.
    pub fn locate_by_position(&self, file_name: &str) -> Result<&BinlogIndexRecord> {
        let record = if file_name.is_empty() {
            self.first()
        } else {
            self.find(file_name)
        };
        record.ok_or_else(|| {
            CdcError::FileNotFound(if file_name.is_empty() {
                "binlog index is empty".to_string()
            } else {
                file_name.to_string()
            })
        })
    }

    /// GTID 기반 요청의 시작 파일
    ///
    /// 요청 집합은 인덱스가 기록한 실행 집합의 부분집합이어야 하고,
    /// 시작 파일은 previous_gtids 가 요청 집합에 모두 포함되는 가장 최근 파일입니다.
    pub fn locate_by_gtid(&self, requested: &GtidSet) -> Result<&BinlogIndexRecord> {
        let last = self
            .last()
            .ok_or_else(|| CdcError::FileNotFound("binlog index is empty".to_string()))?;

        if !requested.is_subset_of(&last.executed_gtids) {
            let unknown = requested.subtract(&last.executed_gtids);
            return Err(CdcError::InvalidRequestedGtid(format!(
                "requested GTIDs not recorded by this server: {}",
                unknown
            )));
        }

        // 앞에서부터 훑으며 요청 집합이 previous_gtids 를 포함하는 마지막 파일 선택
        let mut candidate = None;
        for record in &self.records {
            if record.previous_gtids.is_subset_of(requested) {
                candidate = Some(record);
            }
        }

        candidate.ok_or_else(|| {
            let missing = self
                .first()
                .map(|first| first.previous_gtids.subtract(requested).to_string())
                .unwrap_or_default();
            CdcError::InvalidRequestedGtid(format!(
                "required GTIDs are no longer in the binlog index: {}",
                missing
            ))
        })
    }
}

/// 이벤트 읽기 결과
#[derive(Debug)]
pub enum EventRead {
    /// 길이와 체크섬이 모두 확인된 이벤트
    Complete(RawEvent),
    /// 파일 끝 또는 아직 쓰는 중인 꼬리
    Incomplete { available: u64 },
}

/// binlog 파일 읽기 (쓰기 중인 파일 포함)
pub struct BinlogFileReader {
    name: String,
    path: PathBuf,
    file: File,
}

impl BinlogFileReader {
    pub async fn open(config: &BinlogConfig, file_name: &str) -> Result<Self> {
        let path = config.file_path(file_name);
        let file = File::open(&path).await.map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                CdcError::FileNotFound(file_name.to_string())
            } else {
                CdcError::IoError(format!("Failed to open {:?}: {}", path, e))
            }
        })?;

        Ok(BinlogFileReader {
            name: file_name.to_string(),
            path,
            file,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 현재 디스크 길이. 쓰기 도중에는 실제 완료 지점보다 앞설 수도 뒤처질 수도 있습니다.
    pub async fn known_end_of_file(&self) -> Result<u64> {
        let metadata = self.file.metadata().await.map_err(|e| {
            CdcError::IoError(format!("Failed to stat {:?}: {}", self.path, e))
        })?;
        Ok(metadata.len())
    }

    pub async fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        self.file.seek(SeekFrom::Start(offset)).await?;

        let mut buffer = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            let n = self.file.read(&mut buffer[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }

        if filled < len {
            return Err(CdcError::ShortRead {
                file: self.name.clone(),
                offset,
                wanted: len,
                got: filled,
            });
        }
        Ok(buffer)
    }

    /// 매직 넘버 확인. 아직 4 바이트가 쓰이지 않았으면 false.
    pub async fn check_magic(&mut self) -> Result<bool> {
        match self.read_at(0, BINLOG_MAGIC_SIZE as usize).await {
            Ok(magic) => {
                BinlogParser::verify_magic(&magic)?;
                Ok(true)
            }
            Err(CdcError::ShortRead { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// offset 위치의 이벤트 읽기
    ///
    /// 헤더가 다 쓰이지 않았거나 선언된 길이가 현재 파일 끝을 넘으면 `Incomplete`.
    /// 길이가 완전한 이벤트의 체크섬 불일치는 손상으로 보고 에러를 반환합니다.
    pub async fn read_event(&mut self, offset: u64, alg: ChecksumAlg) -> Result<EventRead> {
        let available = self.known_end_of_file().await?;
        if offset + EVENT_HEADER_SIZE as u64 > available {
            return Ok(EventRead::Incomplete { available });
        }

        let header_bytes = match self.read_at(offset, EVENT_HEADER_SIZE).await {
            Ok(bytes) => bytes,
            Err(CdcError::ShortRead { got, .. }) => {
                return Ok(EventRead::Incomplete {
                    available: offset + got as u64,
                })
            }
            Err(e) => return Err(e),
        };
        let header = EventHeader::parse(&header_bytes).map_err(|e| {
            CdcError::BinlogParseError(format!("{}@{}: {}", self.name, offset, e))
        })?;

        let event_end = offset + header.event_length as u64;
        if event_end > available {
            // 한 번 읽은 길이를 믿지 않고 다시 확인
            let available = self.known_end_of_file().await?;
            if event_end > available {
                return Ok(EventRead::Incomplete { available });
            }
        }

        let bytes = match self.read_at(offset, header.event_length as usize).await {
            Ok(bytes) => bytes,
            Err(CdcError::ShortRead { got, .. }) => {
                return Ok(EventRead::Incomplete {
                    available: offset + got as u64,
                })
            }
            Err(e) => return Err(e),
        };

        let event = RawEvent::from_bytes(offset, bytes)?;
        event.verify_checksum(&self.name, alg)?;
        Ok(EventRead::Complete(event))
    }

    /// target 이 이벤트 경계인지 첫 이벤트부터 헤더 길이를 따라가며 확인
    pub async fn check_event_boundary(&mut self, target: u64) -> Result<()> {
        let name = self.name.clone();
        let misaligned = || CdcError::MisalignedPosition {
            file: name.clone(),
            position: target,
        };

        let mut offset = BINLOG_MAGIC_SIZE;
        while offset < target {
            let header_bytes = match self.read_at(offset, EVENT_HEADER_SIZE).await {
                Ok(bytes) => bytes,
                Err(CdcError::ShortRead { .. }) => {
                    warn!(
                        "Requested position {} lies beyond the complete events of {}",
                        target, name
                    );
                    return Err(misaligned());
                }
                Err(e) => return Err(e),
            };
            let header = EventHeader::parse(&header_bytes)?;
            offset += header.event_length as u64;
        }

        if offset != target {
            return Err(misaligned());
        }

        let available = self.known_end_of_file().await?;
        if target > available {
            return Err(misaligned());
        }
        Ok(())
    }
}
