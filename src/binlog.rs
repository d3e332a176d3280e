//! MySQL Binlog 이벤트 코덱
//!
//! 파일에서 읽은 원시 이벤트의 검증, 세션 체크섬 모드에 맞춘 변환,
//! 합성 이벤트(fake rotate, heartbeat) 생성을 담당합니다.
//!
//! FDE 레이아웃 (WL#2540, 항상 체크섬 필드를 가짐):
//!   [header 19][binlog_version 2][server_version 50][create_timestamp 4]
//!   [header_length 1][post_header_lengths N][checksum_alg 1][crc32 4]

use crate::error::{CdcError, Result};
use crate::events::*;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Write};
use uuid::Uuid;

/// FDE 본문의 고정 부분: 2 + 50 + 4 + 1
const FDE_FIXED_PART: usize = 57;
const SERVER_VERSION_LEN: usize = 50;
const GTID_EVENT_PAYLOAD_LEN: usize = 42;

/// 5.7 형식 post-header 길이 표
const POST_HEADER_LENGTHS: [u8; 38] = [
    56, 13, 0, 8, 0, 18, 0, 4, 4, 4, 4, 18, 0, 0, 95, 0, 4, 26, 8, 0, 0, 0, 8, 8, 8, 2, 0, 0, 0,
    10, 10, 10, 42, 42, 0, 18, 52, 0,
];

/// Binlog 파서
pub struct BinlogParser;

impl BinlogParser {
    /// Binlog 파일 헤더 검증
    pub fn verify_magic(data: &[u8]) -> Result<()> {
        if data.len() < BINLOG_MAGIC.len() {
            return Err(CdcError::BinlogParseError(
                "Invalid binlog: too short".to_string(),
            ));
        }

        if data[0..4] == BINLOG_MAGIC[..] {
            Ok(())
        } else {
            Err(CdcError::BinlogParseError(
                "Invalid binlog magic number".to_string(),
            ))
        }
    }

    /// FDE 안에 기록된 체크섬 알고리즘
    pub fn fde_checksum_alg(event: &[u8]) -> Result<ChecksumAlg> {
        let min_len = EVENT_HEADER_SIZE + FDE_FIXED_PART + CHECKSUM_ALG_DESC_SIZE + CHECKSUM_SIZE;
        if event.len() < min_len {
            return Err(CdcError::BinlogParseError(
                "Invalid format description event: too short".to_string(),
            ));
        }
        ChecksumAlg::from_u8(event[event.len() - CHECKSUM_SIZE - CHECKSUM_ALG_DESC_SIZE])
    }

    /// FORMAT_DESCRIPTION 이벤트 파싱 (15), 헤더 포함 전체 바이트
    pub fn parse_format_description(event: &[u8]) -> Result<FormatDescriptionData> {
        let checksum_alg = Self::fde_checksum_alg(event)?;

        let mut cursor = Cursor::new(&event[EVENT_HEADER_SIZE..]);
        let binlog_version = cursor.read_u16::<LittleEndian>()?;

        let mut server_version_bytes = [0u8; SERVER_VERSION_LEN];
        cursor.read_exact(&mut server_version_bytes)?;
        let server_version = String::from_utf8_lossy(&server_version_bytes)
            .trim_end_matches('\0')
            .to_string();

        let create_timestamp = cursor.read_u32::<LittleEndian>()?;
        let header_length = cursor.read_u8()?;

        Ok(FormatDescriptionData {
            binlog_version,
            server_version,
            create_timestamp,
            header_length,
            checksum_alg,
        })
    }

    /// ROTATE 이벤트 파싱 (4), 헤더와 체크섬을 제외한 본문
    pub fn parse_rotate_event(data: &[u8]) -> Result<RotateEventData> {
        if data.len() < 8 {
            return Err(CdcError::BinlogParseError(
                "Invalid rotate event".to_string(),
            ));
        }

        let mut cursor = Cursor::new(data);

        let position = cursor.read_u64::<LittleEndian>()?;
        let filename_bytes = &data[cursor.position() as usize..];
        let filename = String::from_utf8_lossy(filename_bytes).to_string();

        Ok(RotateEventData {
            next_binlog_name: filename,
            position,
        })
    }

    /// GTID 이벤트 파싱 (33), 헤더와 체크섬을 제외한 본문
    pub fn parse_gtid_event(data: &[u8]) -> Result<GtidEventData> {
        if data.len() < GTID_EVENT_PAYLOAD_LEN {
            return Err(CdcError::BinlogParseError(
                "Invalid GTID event".to_string(),
            ));
        }

        let mut cursor = Cursor::new(data);

        let flags = cursor.read_u8()?;
        let mut uuid_bytes = [0u8; 16];
        cursor.read_exact(&mut uuid_bytes)?;
        let gno = cursor.read_u64::<LittleEndian>()?;

        Ok(GtidEventData {
            flags,
            sid: Uuid::from_bytes(uuid_bytes),
            gno,
        })
    }
}

/// CRC32 (IEEE) 체크섬
pub fn compute_checksum(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// 파일에서 읽은 완전한 이벤트 (헤더 + 본문 + 체크섬)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub header: EventHeader,
    /// 파일 내 시작 오프셋
    pub offset: u64,
    pub bytes: Vec<u8>,
}

impl RawEvent {
    pub fn from_bytes(offset: u64, bytes: Vec<u8>) -> Result<Self> {
        let header = EventHeader::parse(&bytes)?;
        if header.event_length as usize != bytes.len() {
            return Err(CdcError::BinlogParseError(format!(
                "Event length mismatch at {}: header says {}, got {}",
                offset,
                header.event_length,
                bytes.len()
            )));
        }
        Ok(RawEvent {
            header,
            offset,
            bytes,
        })
    }

    pub fn event_type(&self) -> EventType {
        self.header.event_type()
    }

    /// 바로 다음 이벤트의 시작 오프셋
    pub fn end_offset(&self) -> u64 {
        self.offset + self.bytes.len() as u64
    }

    /// 헤더와 체크섬을 제외한 본문
    pub fn payload(&self, alg: ChecksumAlg) -> &[u8] {
        let trailer = if self.event_type() == EventType::FormatDescriptionEvent {
            CHECKSUM_ALG_DESC_SIZE + CHECKSUM_SIZE
        } else {
            alg.trailer_len()
        };
        let end = self.bytes.len().saturating_sub(trailer).max(EVENT_HEADER_SIZE);
        &self.bytes[EVENT_HEADER_SIZE..end]
    }

    /// 체크섬 검증. FDE 는 자기 자신에 기록된 알고리즘을 따릅니다.
    pub fn verify_checksum(&self, file: &str, alg: ChecksumAlg) -> Result<()> {
        let alg = if self.event_type() == EventType::FormatDescriptionEvent {
            BinlogParser::fde_checksum_alg(&self.bytes)?
        } else {
            alg
        };
        if alg == ChecksumAlg::Off {
            return Ok(());
        }

        if self.bytes.len() < EVENT_HEADER_SIZE + CHECKSUM_SIZE {
            return Err(CdcError::BinlogParseError(format!(
                "Event at {}@{} too short for checksum",
                file, self.offset
            )));
        }
        let split = self.bytes.len() - CHECKSUM_SIZE;
        let expected = u32::from_le_bytes([
            self.bytes[split],
            self.bytes[split + 1],
            self.bytes[split + 2],
            self.bytes[split + 3],
        ]);
        let actual = compute_checksum(&self.bytes[..split]);
        if expected != actual {
            return Err(CdcError::ChecksumMismatch {
                file: file.to_string(),
                offset: self.offset,
                expected,
                actual,
            });
        }
        Ok(())
    }

    /// 세션 체크섬 모드에 맞춰 전송용 바이트로 변환
    ///
    /// `mask_log_pos` 는 FDE 의 log_pos 를 0 으로 바꿔 복제본이 위치 갱신으로 오해하지 않게 합니다.
    pub fn encode_for_session(
        &self,
        file_alg: ChecksumAlg,
        session_alg: ChecksumAlg,
        mask_log_pos: bool,
    ) -> Result<Vec<u8>> {
        let mut bytes = self.bytes.clone();

        if self.event_type() == EventType::FormatDescriptionEvent {
            BinlogParser::fde_checksum_alg(&bytes)?;
            let alg_pos = bytes.len() - CHECKSUM_SIZE - CHECKSUM_ALG_DESC_SIZE;
            bytes[alg_pos] = session_alg as u8;
            if mask_log_pos {
                bytes[LOG_POS_OFFSET..LOG_POS_OFFSET + 4].copy_from_slice(&0u32.to_le_bytes());
            }
            let split = bytes.len() - CHECKSUM_SIZE;
            let crc = compute_checksum(&bytes[..split]);
            bytes[split..].copy_from_slice(&crc.to_le_bytes());
            return Ok(bytes);
        }

        if file_alg == session_alg {
            return Ok(bytes);
        }

        let body_len = bytes.len().saturating_sub(file_alg.trailer_len());
        bytes.truncate(body_len.max(EVENT_HEADER_SIZE));
        let new_len = (bytes.len() + session_alg.trailer_len()) as u32;
        bytes[EVENT_LEN_OFFSET..EVENT_LEN_OFFSET + 4].copy_from_slice(&new_len.to_le_bytes());
        if session_alg == ChecksumAlg::Crc32 {
            let crc = compute_checksum(&bytes);
            bytes.write_u32::<LittleEndian>(crc)?;
        }
        Ok(bytes)
    }
}

/// 이벤트 생성기
///
/// 합성 이벤트를 만들거나 (테스트/변환기 측) binlog 파일 내용을 구성할 때 사용합니다.
#[derive(Debug, Clone)]
pub struct EventBuilder {
    server_id: u32,
    checksum: ChecksumAlg,
}

impl EventBuilder {
    pub fn new(server_id: u32, checksum: ChecksumAlg) -> Self {
        EventBuilder {
            server_id,
            checksum,
        }
    }

    pub fn checksum(&self) -> ChecksumAlg {
        self.checksum
    }

    /// 헤더 + 본문 (+ 체크섬) 조립
    pub fn build(
        &self,
        timestamp: u32,
        event_type: EventType,
        log_pos: u32,
        flags: u16,
        payload: &[u8],
    ) -> Result<Vec<u8>> {
        let event_length = EVENT_HEADER_SIZE + payload.len() + self.checksum.trailer_len();
        let header = EventHeader {
            timestamp,
            type_code: event_type as u8,
            server_id: self.server_id,
            event_length: event_length as u32,
            next_pos: log_pos,
            flags,
        };

        let mut buffer = Vec::with_capacity(event_length);
        header.write(&mut buffer)?;
        buffer.write_all(payload)?;
        if self.checksum == ChecksumAlg::Crc32 {
            let crc = compute_checksum(&buffer);
            buffer.write_u32::<LittleEndian>(crc)?;
        }
        Ok(buffer)
    }

    /// FORMAT_DESCRIPTION 이벤트
    pub fn format_description(
        &self,
        timestamp: u32,
        server_version: &str,
        log_pos: u32,
    ) -> Result<Vec<u8>> {
        let mut payload = Vec::new();
        payload.write_u16::<LittleEndian>(4)?;
        let mut version = [0u8; SERVER_VERSION_LEN];
        let len = server_version.len().min(SERVER_VERSION_LEN);
        version[..len].copy_from_slice(&server_version.as_bytes()[..len]);
        payload.write_all(&version)?;
        payload.write_u32::<LittleEndian>(timestamp)?;
        payload.write_u8(EVENT_HEADER_SIZE as u8)?;
        payload.write_all(&POST_HEADER_LENGTHS)?;
        payload.write_u8(self.checksum as u8)?;

        let event_length = EVENT_HEADER_SIZE + payload.len() + CHECKSUM_SIZE;
        let header = EventHeader {
            timestamp,
            type_code: EventType::FormatDescriptionEvent as u8,
            server_id: self.server_id,
            event_length: event_length as u32,
            next_pos: log_pos,
            flags: 0,
        };

        let mut buffer = Vec::with_capacity(event_length);
        header.write(&mut buffer)?;
        buffer.write_all(&payload)?;
        let crc = compute_checksum(&buffer);
        buffer.write_u32::<LittleEndian>(crc)?;
        Ok(buffer)
    }

    /// 다음 파일로 전환하라는 합성 ROTATE 이벤트
    pub fn fake_rotate(&self, next_file: &str, position: u64) -> Result<Vec<u8>> {
        let mut payload = Vec::with_capacity(8 + next_file.len());
        payload.write_u64::<LittleEndian>(position)?;
        payload.write_all(next_file.as_bytes())?;
        self.build(0, EventType::RotateEvent, 0, LOG_EVENT_ARTIFICIAL_F, &payload)
    }

    /// 현재 위치를 담은 HEARTBEAT 이벤트
    pub fn heartbeat(&self, file: &str, log_pos: u64) -> Result<Vec<u8>> {
        self.build(
            0,
            EventType::HeartbeatEvent,
            log_pos as u32,
            0,
            file.as_bytes(),
        )
    }

    /// GTID 이벤트 (5.7 형식)
    pub fn gtid(&self, timestamp: u32, sid: &Uuid, gno: u64, log_pos: u32) -> Result<Vec<u8>> {
        let mut payload = Vec::with_capacity(GTID_EVENT_PAYLOAD_LEN);
        payload.write_u8(1)?;
        payload.write_all(sid.as_bytes())?;
        payload.write_u64::<LittleEndian>(gno)?;
        // logical timestamp: type + last_committed + sequence_number
        payload.write_u8(2)?;
        payload.write_u64::<LittleEndian>(0)?;
        payload.write_u64::<LittleEndian>(0)?;
        self.build(timestamp, EventType::GtidEvent, log_pos, 0, &payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verify_magic() {
        let valid = vec![0xfe, 0x62, 0x69, 0x6e];
        assert!(BinlogParser::verify_magic(&valid).is_ok());

        let invalid = vec![0x00, 0x00, 0x00, 0x00];
        assert!(BinlogParser::verify_magic(&invalid).is_err());
    }

    #[test]
    fn test_format_description_layout() {
        let builder = EventBuilder::new(1, ChecksumAlg::Crc32);
        let fde = builder.format_description(1_700_000_000, "5.7.36-log", 123).unwrap();
        assert_eq!(fde.len(), 119);

        let data = BinlogParser::parse_format_description(&fde).unwrap();
        assert_eq!(data.binlog_version, 4);
        assert_eq!(data.server_version, "5.7.36-log");
        assert_eq!(data.header_length, 19);
        assert_eq!(data.checksum_alg, ChecksumAlg::Crc32);

        let event = RawEvent::from_bytes(4, fde).unwrap();
        assert!(event.verify_checksum("mysql-bin.000001", ChecksumAlg::Off).is_ok());
        assert_eq!(event.end_offset(), 123);
    }

    #[test]
    fn test_checksum_mismatch_detected() {
        let builder = EventBuilder::new(1, ChecksumAlg::Crc32);
        let mut bytes = builder
            .build(10, EventType::QueryEvent, 100, 0, b"BEGIN")
            .unwrap();
        bytes[EVENT_HEADER_SIZE + 1] ^= 0xff;

        let event = RawEvent::from_bytes(4, bytes).unwrap();
        let err = event
            .verify_checksum("mysql-bin.000001", ChecksumAlg::Crc32)
            .unwrap_err();
        assert!(matches!(err, CdcError::ChecksumMismatch { offset: 4, .. }));

        // 체크섬이 꺼진 파일이면 검증하지 않음
        assert!(event.verify_checksum("mysql-bin.000001", ChecksumAlg::Off).is_ok());
    }

    #[test]
    fn test_strip_checksum_for_session() {
        let builder = EventBuilder::new(1, ChecksumAlg::Crc32);
        let bytes = builder
            .build(10, EventType::XidEvent, 200, 0, &[1, 2, 3, 4, 5, 6, 7, 8])
            .unwrap();
        let event = RawEvent::from_bytes(100, bytes).unwrap();

        let stripped = event
            .encode_for_session(ChecksumAlg::Crc32, ChecksumAlg::Off, false)
            .unwrap();
        assert_eq!(stripped.len(), EVENT_HEADER_SIZE + 8);
        let header = EventHeader::parse(&stripped).unwrap();
        assert_eq!(header.event_length as usize, stripped.len());
        assert_eq!(header.next_pos, 200);

        // 다시 붙이면 원본과 동일
        let plain = RawEvent::from_bytes(100, stripped).unwrap();
        let restored = plain
            .encode_for_session(ChecksumAlg::Off, ChecksumAlg::Crc32, false)
            .unwrap();
        assert_eq!(restored, event.bytes);
    }

    #[test]
    fn test_fde_rewritten_for_session() {
        let builder = EventBuilder::new(1, ChecksumAlg::Crc32);
        let fde = builder.format_description(0, "5.7.36-log", 123).unwrap();
        let event = RawEvent::from_bytes(4, fde).unwrap();

        let sent = event
            .encode_for_session(ChecksumAlg::Crc32, ChecksumAlg::Off, true)
            .unwrap();
        assert_eq!(sent.len(), event.bytes.len());
        assert_eq!(BinlogParser::fde_checksum_alg(&sent).unwrap(), ChecksumAlg::Off);
        assert_eq!(EventHeader::parse(&sent).unwrap().next_pos, 0);
    }

    #[test]
    fn test_fake_rotate_and_heartbeat() {
        let builder = EventBuilder::new(9, ChecksumAlg::Off);

        let rotate = builder.fake_rotate("mysql-bin.000002", 4).unwrap();
        let event = RawEvent::from_bytes(0, rotate).unwrap();
        assert_eq!(event.event_type(), EventType::RotateEvent);
        assert!(event.header.is_artificial());
        assert_eq!(event.header.next_pos, 0);
        let data = BinlogParser::parse_rotate_event(event.payload(ChecksumAlg::Off)).unwrap();
        assert_eq!(data.next_binlog_name, "mysql-bin.000002");
        assert_eq!(data.position, 4);

        let heartbeat = builder.heartbeat("mysql-bin.000001", 4096).unwrap();
        let event = RawEvent::from_bytes(0, heartbeat).unwrap();
        assert_eq!(event.event_type(), EventType::HeartbeatEvent);
        assert_eq!(event.header.next_pos, 4096);
        assert_eq!(event.payload(ChecksumAlg::Off), b"mysql-bin.000001");
    }

    #[test]
    fn test_gtid_event_round_trip() {
        let builder = EventBuilder::new(1, ChecksumAlg::Crc32);
        let sid = Uuid::parse_str("3e11fa47-71ca-11e1-9e33-c80aa9429562").unwrap();
        let bytes = builder.gtid(5, &sid, 23, 300).unwrap();
        let event = RawEvent::from_bytes(0, bytes).unwrap();

        let data = BinlogParser::parse_gtid_event(event.payload(ChecksumAlg::Crc32)).unwrap();
        assert_eq!(data.sid, sid);
        assert_eq!(data.gno, 23);
        assert_eq!(data.gtid(), "3e11fa47-71ca-11e1-9e33-c80aa9429562:23");
    }
}
