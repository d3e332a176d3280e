//! 테스트용 binlog 파일/인덱스 생성기

use crate::binlog::EventBuilder;
use crate::binlog_index::BinlogIndexRecord;
use crate::config::BinlogConfig;
use crate::events::{ChecksumAlg, EventType, BINLOG_MAGIC, EVENT_HEADER_SIZE};
use crate::gtid::GtidSet;
use std::io::Write;
use tempfile::TempDir;
use uuid::Uuid;

pub const SERVER_VERSION: &str = "5.7.36-log";
pub const EVENT_TIMESTAMP: u32 = 1_700_000_000;

pub fn uuid_a() -> Uuid {
    Uuid::parse_str("3e11fa47-71ca-11e1-9e33-c80aa9429562").unwrap()
}

/// 임시 디렉터리의 binlog 저장소
pub struct BinlogFixture {
    pub config: BinlogConfig,
    _dir: TempDir,
}

impl BinlogFixture {
    pub fn new() -> Self {
        Self::with_prefix("mysql-bin")
    }

    pub fn with_prefix(prefix: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = BinlogConfig {
            file_prefix: prefix.to_string(),
            index_file: format!("{}.index", prefix),
            ..BinlogConfig::new(dir.path())
        };
        BinlogFixture { config, _dir: dir }
    }

    /// 매직 + FDE 로 시작하는 새 파일 (아직 디스크에 쓰지 않음)
    pub fn new_file(&self, index: u64, alg: ChecksumAlg) -> FixtureFile {
        let mut file = FixtureFile {
            name: self.config.file_name(index),
            index,
            builder: EventBuilder::new(self.config.server_id, alg),
            bytes: BINLOG_MAGIC.to_vec(),
            events: Vec::new(),
        };
        let fde_len = 119u32;
        let fde = file
            .builder
            .format_description(EVENT_TIMESTAMP, SERVER_VERSION, file.bytes.len() as u32 + fde_len)
            .unwrap();
        assert_eq!(fde.len() as u32, fde_len);
        file.push(fde);
        file
    }

    pub fn write_all(&self, file: &FixtureFile) {
        std::fs::write(self.config.file_path(&file.name), &file.bytes).unwrap();
    }

    /// 마지막 이벤트를 `keep` 바이트만 쓴 상태 (쓰기 도중의 꼬리)
    pub fn write_partial(&self, file: &FixtureFile, keep: usize) {
        let last = file.events.last().unwrap();
        let end = last.0 as usize + keep;
        std::fs::write(self.config.file_path(&file.name), &file.bytes[..end]).unwrap();
    }

    /// 기존 내용 뒤에 이어 쓰기 (변환기가 추가 기록하는 상황)
    pub fn append_tail(&self, file: &FixtureFile, from: usize) {
        let mut handle = std::fs::OpenOptions::new()
            .append(true)
            .open(self.config.file_path(&file.name))
            .unwrap();
        handle.write_all(&file.bytes[from..]).unwrap();
    }

    pub fn register(&self, file: &FixtureFile, previous: &GtidSet, executed: &GtidSet) {
        let record = BinlogIndexRecord {
            end_position: file.len(),
            first_event_ts: EVENT_TIMESTAMP as u64,
            previous_gtids: previous.clone(),
            executed_gtids: executed.clone(),
            ..BinlogIndexRecord::new(&self.config, file.index)
        };
        let mut line = serde_json::to_string(&record).unwrap();
        line.push('\n');
        let mut handle = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.config.index_path())
            .unwrap();
        handle.write_all(line.as_bytes()).unwrap();
    }
}

/// 메모리에서 구성 중인 binlog 파일
pub struct FixtureFile {
    pub name: String,
    pub index: u64,
    builder: EventBuilder,
    bytes: Vec<u8>,
    /// (시작 오프셋, 길이)
    events: Vec<(u64, usize)>,
}

impl FixtureFile {
    fn push(&mut self, event: Vec<u8>) -> Vec<u8> {
        self.events.push((self.bytes.len() as u64, event.len()));
        self.bytes.extend_from_slice(&event);
        event
    }

    fn next_log_pos(&self, payload_len: usize) -> u32 {
        (self.bytes.len() + EVENT_HEADER_SIZE + payload_len + self.builder.checksum().trailer_len())
            as u32
    }

    pub fn append(&mut self, event_type: EventType, payload: &[u8]) -> Vec<u8> {
        let log_pos = self.next_log_pos(payload.len());
        let event = self
            .builder
            .build(EVENT_TIMESTAMP, event_type, log_pos, 0, payload)
            .unwrap();
        self.push(event)
    }

    pub fn append_query(&mut self, sql: &str) -> Vec<u8> {
        self.append(EventType::QueryEvent, sql.as_bytes())
    }

    /// `size` 바이트 (헤더/체크섬 포함) 크기의 row 이벤트
    pub fn append_rows(&mut self, size: usize) -> Vec<u8> {
        let overhead = EVENT_HEADER_SIZE + self.builder.checksum().trailer_len();
        let payload = vec![0xAB; size.saturating_sub(overhead)];
        self.append(EventType::WriteRowsEvent, &payload)
    }

    pub fn append_gtid(&mut self, sid: &Uuid, gno: u64) -> Vec<u8> {
        let log_pos = self.next_log_pos(42);
        let event = self.builder.gtid(EVENT_TIMESTAMP, sid, gno, log_pos).unwrap();
        self.push(event)
    }

    /// GTID + BEGIN + row + XID
    pub fn append_transaction(&mut self, sid: &Uuid, gno: u64) -> Vec<Vec<u8>> {
        vec![
            self.append_gtid(sid, gno),
            self.append_query("BEGIN"),
            self.append_rows(64),
            self.append(EventType::XidEvent, &gno.to_le_bytes()),
        ]
    }

    /// 파일 끝의 실제 ROTATE 이벤트
    pub fn append_rotate(&mut self, next_file: &str) -> Vec<u8> {
        let mut payload = 4u64.to_le_bytes().to_vec();
        payload.extend_from_slice(next_file.as_bytes());
        self.append(EventType::RotateEvent, &payload)
    }

    /// 이벤트 본문 한 바이트 손상
    pub fn corrupt_event(&mut self, event_index: usize) {
        let (offset, len) = self.events[event_index];
        let target = offset as usize + EVENT_HEADER_SIZE + (len - EVENT_HEADER_SIZE) / 2;
        self.bytes[target] ^= 0xFF;
    }

    pub fn len(&self) -> u64 {
        self.bytes.len() as u64
    }

    /// 모든 이벤트 경계 (첫 이벤트 시작 ~ 마지막 이벤트 끝)
    pub fn boundaries(&self) -> Vec<u64> {
        let mut boundaries: Vec<u64> = self.events.iter().map(|(offset, _)| *offset).collect();
        boundaries.push(self.len());
        boundaries
    }

    /// 오프셋 순서의 이벤트 바이트
    pub fn events(&self) -> Vec<Vec<u8>> {
        self.events
            .iter()
            .map(|(offset, len)| self.bytes[*offset as usize..*offset as usize + len].to_vec())
            .collect()
    }
}
