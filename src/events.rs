//! MySQL Binlog 이벤트 타입 및 헤더 정의
//!
//! 헤더 (v4, 19 바이트):
//!   - Timestamp (4 bytes)
//!   - Type (1 byte)
//!   - Server ID (4 bytes)
//!   - Event Length (4 bytes)
//!   - Next Position (4 bytes)
//!   - Flags (2 bytes)

use crate::error::{CdcError, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use uuid::Uuid;

/// 모든 binlog 파일의 첫 4 바이트 (".bin")
pub const BINLOG_MAGIC: &[u8] = &[0xfe, 0x62, 0x69, 0x6e];
pub const BINLOG_MAGIC_SIZE: u64 = 4;
pub const EVENT_HEADER_SIZE: usize = 19;
pub const CHECKSUM_SIZE: usize = 4;
/// FDE 의 checksum_alg 1 바이트
pub const CHECKSUM_ALG_DESC_SIZE: usize = 1;

/// 실제 로그에 없는 합성 이벤트 표시
pub const LOG_EVENT_ARTIFICIAL_F: u16 = 0x20;

/// 헤더 내 필드 오프셋
pub const EVENT_LEN_OFFSET: usize = 9;
pub const LOG_POS_OFFSET: usize = 13;

/// MySQL Binlog 이벤트 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum EventType {
    /// 알 수 없는 이벤트
    Unknown = 0,
    /// 쿼리 이벤트 (DDL, BEGIN)
    QueryEvent = 2,
    StopEvent = 3,
    /// 로테이션 이벤트 (새 binlog 파일)
    RotateEvent = 4,
    /// 포맷 설명 이벤트 (파일 헤더)
    FormatDescriptionEvent = 15,
    /// 트랜잭션 커밋
    XidEvent = 16,
    /// 테이블 맵 이벤트 (스키마 정보)
    TableMapEvent = 19,
    /// 하트비트 (합성 이벤트)
    HeartbeatEvent = 27,
    /// WRITE_ROWS 이벤트 (INSERT)
    WriteRowsEvent = 30,
    /// UPDATE_ROWS 이벤트 (UPDATE)
    UpdateRowsEvent = 31,
    /// DELETE_ROWS 이벤트 (DELETE)
    DeleteRowsEvent = 32,
    /// GTID 이벤트 (Global Transaction ID)
    GtidEvent = 33,
    /// 익명 GTID 이벤트
    AnonymousGtidEvent = 34,
    /// 이전 파일까지 실행된 GTID 집합
    PreviousGtidsEvent = 35,
    /// Rows Query 이벤트 (원본 쿼리)
    RowsQueryEvent = 36,
}

impl EventType {
    pub fn from_u8(val: u8) -> Self {
        match val {
            2 => EventType::QueryEvent,
            3 => EventType::StopEvent,
            4 => EventType::RotateEvent,
            15 => EventType::FormatDescriptionEvent,
            16 => EventType::XidEvent,
            19 => EventType::TableMapEvent,
            27 => EventType::HeartbeatEvent,
            30 => EventType::WriteRowsEvent,
            31 => EventType::UpdateRowsEvent,
            32 => EventType::DeleteRowsEvent,
            33 => EventType::GtidEvent,
            34 => EventType::AnonymousGtidEvent,
            35 => EventType::PreviousGtidsEvent,
            36 => EventType::RowsQueryEvent,
            _ => EventType::Unknown,
        }
    }

    /// 트랜잭션에 속하지 않아 GTID 필터로 건너뛰면 안 되는 이벤트
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            EventType::FormatDescriptionEvent
                | EventType::RotateEvent
                | EventType::StopEvent
                | EventType::HeartbeatEvent
                | EventType::PreviousGtidsEvent
        )
    }
}

/// Binlog 체크섬 알고리즘
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ChecksumAlg {
    Off = 0,
    Crc32 = 1,
}

impl ChecksumAlg {
    pub fn from_u8(val: u8) -> Result<Self> {
        match val {
            0 => Ok(ChecksumAlg::Off),
            1 => Ok(ChecksumAlg::Crc32),
            other => Err(CdcError::BinlogParseError(format!(
                "Unknown checksum algorithm: {}",
                other
            ))),
        }
    }

    /// `@master_binlog_checksum` 값 해석 ("NONE", "CRC32")
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().trim_matches(|c: char| c == '\'' || c == '"').to_uppercase().as_str() {
            "NONE" | "OFF" | "0" => Some(ChecksumAlg::Off),
            "CRC32" | "1" => Some(ChecksumAlg::Crc32),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ChecksumAlg::Off => "NONE",
            ChecksumAlg::Crc32 => "CRC32",
        }
    }

    /// 일반 이벤트 끝에 붙는 체크섬 길이
    pub fn trailer_len(&self) -> usize {
        match self {
            ChecksumAlg::Off => 0,
            ChecksumAlg::Crc32 => CHECKSUM_SIZE,
        }
    }
}

/// Binlog 이벤트 헤더
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventHeader {
    /// 이벤트 타임스탬프 (초 단위)
    pub timestamp: u32,
    /// 원시 이벤트 타입 코드
    pub type_code: u8,
    /// MySQL 서버 ID
    pub server_id: u32,
    /// 이벤트 길이 (헤더 + 본문 + 체크섬)
    pub event_length: u32,
    /// 다음 이벤트 위치
    pub next_pos: u32,
    /// 이벤트 플래그
    pub flags: u16,
}

impl EventHeader {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < EVENT_HEADER_SIZE {
            return Err(CdcError::BinlogParseError(
                "Invalid event header: too short".to_string(),
            ));
        }

        let mut cursor = Cursor::new(data);

        let timestamp = cursor.read_u32::<LittleEndian>()?;
        let type_code = cursor.read_u8()?;
        let server_id = cursor.read_u32::<LittleEndian>()?;
        let event_length = cursor.read_u32::<LittleEndian>()?;
        let next_pos = cursor.read_u32::<LittleEndian>()?;
        let flags = cursor.read_u16::<LittleEndian>()?;

        if (event_length as usize) < EVENT_HEADER_SIZE {
            return Err(CdcError::BinlogParseError(format!(
                "Invalid event length: {}",
                event_length
            )));
        }

        Ok(EventHeader {
            timestamp,
            type_code,
            server_id,
            event_length,
            next_pos,
            flags,
        })
    }

    pub fn write(&self, buffer: &mut Vec<u8>) -> Result<()> {
        buffer.write_u32::<LittleEndian>(self.timestamp)?;
        buffer.write_u8(self.type_code)?;
        buffer.write_u32::<LittleEndian>(self.server_id)?;
        buffer.write_u32::<LittleEndian>(self.event_length)?;
        buffer.write_u32::<LittleEndian>(self.next_pos)?;
        buffer.write_u16::<LittleEndian>(self.flags)?;
        Ok(())
    }

    pub fn event_type(&self) -> EventType {
        EventType::from_u8(self.type_code)
    }

    pub fn is_artificial(&self) -> bool {
        self.flags & LOG_EVENT_ARTIFICIAL_F != 0
    }
}

/// GTID 이벤트 데이터
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GtidEventData {
    /// 커밋 플래그
    pub flags: u8,
    /// 트랜잭션 소스 UUID
    pub sid: Uuid,
    /// 트랜잭션 번호
    pub gno: u64,
}

impl GtidEventData {
    /// "uuid:gno" 형식
    pub fn gtid(&self) -> String {
        format!("{}:{}", self.sid, self.gno)
    }
}

/// 회전 이벤트 데이터
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotateEventData {
    /// 새 바이너리 로그 파일명
    pub next_binlog_name: String,
    /// 새 파일의 시작 위치
    pub position: u64,
}

/// 포맷 설명 이벤트 요약
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatDescriptionData {
    pub binlog_version: u16,
    pub server_version: String,
    pub create_timestamp: u32,
    pub header_length: u8,
    pub checksum_alg: ChecksumAlg,
}
