//! 복제본의 binlog 덤프 요청
//!
//! COM_BINLOG_DUMP (0x12):
//!   [pos 4][flags 2][server_id 4][file name ...]
//! COM_BINLOG_DUMP_GTID (0x1e):
//!   [flags 2][server_id 4][name_len 4][name][pos 8][data_size 4][SID block]

use crate::error::{CdcError, Result};
use crate::events::{ChecksumAlg, BINLOG_MAGIC_SIZE};
use crate::gtid::GtidSet;
use crate::offset::BinlogPosition;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fmt;
use std::io::{Cursor, Read, Write};
use std::time::Duration;
use tracing::debug;

/// COM_BINLOG_DUMP 명령어 코드
pub const COM_BINLOG_DUMP: u8 = 0x12;

/// COM_BINLOG_DUMP_GTID 명령어 코드
pub const COM_BINLOG_DUMP_GTID: u8 = 0x1e;

/// 파일 끝에서 기다리지 않고 EOF 로 종료
pub const BINLOG_DUMP_NON_BLOCK: u16 = 0x01;

/// GTID 데이터 포함
pub const BINLOG_THROUGH_GTID: u16 = 0x04;

/// 스트리밍 시작점
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DumpStart {
    /// 파일명 + 위치. 빈 파일명은 첫 파일.
    Position(BinlogPosition),
    /// 이미 적용한 GTID 집합 (이 집합의 트랜잭션은 건너뜀)
    Gtid(GtidSet),
}

/// 덤프 요청
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpRequest {
    pub start: DumpStart,
    pub non_blocking: bool,
    /// 복제본의 server_id
    pub server_id: u32,
    /// 세션에서 합의한 체크섬 (`SET @master_binlog_checksum`)
    pub checksum: ChecksumAlg,
    /// `SET @master_heartbeat_period` 값 (None = 설정 기본값)
    pub heartbeat_period: Option<Duration>,
}

impl DumpRequest {
    pub fn from_position(file: impl Into<String>, position: u64) -> Self {
        DumpRequest {
            start: DumpStart::Position(BinlogPosition::new(file, position)),
            non_blocking: false,
            server_id: 0,
            checksum: ChecksumAlg::Off,
            heartbeat_period: None,
        }
    }

    pub fn from_gtid(gtid_set: GtidSet) -> Self {
        DumpRequest {
            start: DumpStart::Gtid(gtid_set),
            non_blocking: false,
            server_id: 0,
            checksum: ChecksumAlg::Off,
            heartbeat_period: None,
        }
    }

    pub fn with_checksum(mut self, checksum: ChecksumAlg) -> Self {
        self.checksum = checksum;
        self
    }

    pub fn with_non_blocking(mut self, non_blocking: bool) -> Self {
        self.non_blocking = non_blocking;
        self
    }

    pub fn with_heartbeat_period(mut self, period: Option<Duration>) -> Self {
        self.heartbeat_period = period;
        self
    }

    pub fn is_gtid_mode(&self) -> bool {
        matches!(self.start, DumpStart::Gtid(_))
    }

    /// 명령 패킷 디코딩. 세션 변수로 합의한 값은 호출 측에서 넘깁니다.
    pub fn decode(
        packet: &[u8],
        checksum: ChecksumAlg,
        heartbeat_period: Option<Duration>,
    ) -> Result<Self> {
        let mut cursor = Cursor::new(packet);
        let command = cursor.read_u8().map_err(truncated)?;

        let (start, flags, server_id) = match command {
            COM_BINLOG_DUMP => {
                let position = cursor.read_u32::<LittleEndian>().map_err(truncated)? as u64;
                let flags = cursor.read_u16::<LittleEndian>().map_err(truncated)?;
                let server_id = cursor.read_u32::<LittleEndian>().map_err(truncated)?;
                let file = read_file_name(&packet[cursor.position() as usize..])?;
                let file = file.trim_end_matches('\0').to_string();
                (
                    DumpStart::Position(BinlogPosition::new(file, position)),
                    flags,
                    server_id,
                )
            }
            COM_BINLOG_DUMP_GTID => {
                let flags = cursor.read_u16::<LittleEndian>().map_err(truncated)?;
                let server_id = cursor.read_u32::<LittleEndian>().map_err(truncated)?;
                let name_len = cursor.read_u32::<LittleEndian>().map_err(truncated)? as usize;
                read_sized(&mut cursor, name_len)?;
                let _position = cursor.read_u64::<LittleEndian>().map_err(truncated)?;

                let gtid_set = if flags & BINLOG_THROUGH_GTID != 0 {
                    let data_size = cursor.read_u32::<LittleEndian>().map_err(truncated)? as usize;
                    let data = read_sized(&mut cursor, data_size)?;
                    GtidSet::decode(&data)?
                } else {
                    GtidSet::new()
                };
                (DumpStart::Gtid(gtid_set), flags, server_id)
            }
            other => {
                return Err(CdcError::ProtocolError(format!(
                    "Not a binlog dump command: 0x{:02x}",
                    other
                )))
            }
        };

        let request = DumpRequest {
            start,
            non_blocking: flags & BINLOG_DUMP_NON_BLOCK != 0,
            server_id,
            checksum,
            heartbeat_period,
        };
        debug!("Decoded dump request: {}", request);
        Ok(request)
    }

    /// 명령 패킷 생성 (복제본 측)
    pub fn encode(&self) -> Result<Vec<u8>> {
        let non_block = if self.non_blocking {
            BINLOG_DUMP_NON_BLOCK
        } else {
            0
        };

        let mut buffer = Vec::new();
        match &self.start {
            DumpStart::Position(position) => {
                buffer.write_u8(COM_BINLOG_DUMP)?;
                buffer.write_u32::<LittleEndian>(position.position as u32)?;
                buffer.write_u16::<LittleEndian>(non_block)?;
                buffer.write_u32::<LittleEndian>(self.server_id)?;
                buffer.write_all(position.filename.as_bytes())?;
            }
            DumpStart::Gtid(gtid_set) => {
                let data = gtid_set.encode()?;
                buffer.write_u8(COM_BINLOG_DUMP_GTID)?;
                buffer.write_u16::<LittleEndian>(non_block | BINLOG_THROUGH_GTID)?;
                buffer.write_u32::<LittleEndian>(self.server_id)?;
                buffer.write_u32::<LittleEndian>(0)?;
                buffer.write_u64::<LittleEndian>(BINLOG_MAGIC_SIZE)?;
                buffer.write_u32::<LittleEndian>(data.len() as u32)?;
                buffer.write_all(&data)?;
            }
        }
        Ok(buffer)
    }
}

impl fmt::Display for DumpRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.start {
            DumpStart::Position(position) => write!(f, "position {}", position)?,
            DumpStart::Gtid(gtid_set) => write!(f, "gtid '{}'", gtid_set)?,
        }
        write!(
            f,
            " (server_id={}, checksum={}, {})",
            self.server_id,
            self.checksum.name(),
            if self.non_blocking { "non-blocking" } else { "blocking" }
        )
    }
}

fn read_file_name(bytes: &[u8]) -> Result<String> {
    String::from_utf8(bytes.to_vec())
        .map_err(|e| CdcError::ProtocolError(format!("Invalid binlog file name: {}", e)))
}

/// 패킷에 남은 길이를 넘는 필드는 할당 전에 거부
fn read_sized(cursor: &mut Cursor<&[u8]>, len: usize) -> Result<Vec<u8>> {
    let remaining = (cursor.get_ref().len() as u64).saturating_sub(cursor.position());
    if len as u64 > remaining {
        return Err(CdcError::ProtocolError(format!(
            "Truncated binlog dump command: field of {} bytes, {} remaining",
            len, remaining
        )));
    }
    let mut bytes = vec![0u8; len];
    cursor.read_exact(&mut bytes).map_err(truncated)?;
    Ok(bytes)
}

fn truncated(err: std::io::Error) -> CdcError {
    CdcError::ProtocolError(format!("Truncated binlog dump command: {}", err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_position_request() {
        let request = DumpRequest {
            server_id: 42,
            ..DumpRequest::from_position("mysql-bin.000003", 1024)
        };
        let packet = request.encode().unwrap();
        assert_eq!(packet[0], COM_BINLOG_DUMP);
        // COM_BINLOG_DUMP (1) + position (4) + flags (2) + server_id (4) + filename
        assert_eq!(packet.len(), 11 + "mysql-bin.000003".len());

        let decoded = DumpRequest::decode(&packet, ChecksumAlg::Crc32, None).unwrap();
        assert_eq!(
            decoded.start,
            DumpStart::Position(BinlogPosition::new("mysql-bin.000003", 1024))
        );
        assert_eq!(decoded.server_id, 42);
        assert_eq!(decoded.checksum, ChecksumAlg::Crc32);
        assert!(!decoded.non_blocking);
    }

    #[test]
    fn test_decode_gtid_request() {
        let gtid_set = GtidSet::parse("3e11fa47-71ca-11e1-9e33-c80aa9429562:1-5:11-18").unwrap();
        let request = DumpRequest::from_gtid(gtid_set.clone()).with_non_blocking(true);
        let packet = request.encode().unwrap();
        assert_eq!(packet[0], COM_BINLOG_DUMP_GTID);

        let decoded =
            DumpRequest::decode(&packet, ChecksumAlg::Off, Some(Duration::from_secs(1))).unwrap();
        assert_eq!(decoded.start, DumpStart::Gtid(gtid_set));
        assert!(decoded.non_blocking);
        assert!(decoded.is_gtid_mode());
        assert_eq!(decoded.heartbeat_period, Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(DumpRequest::decode(&[0x03, b'S'], ChecksumAlg::Off, None).is_err());
        assert!(DumpRequest::decode(&[COM_BINLOG_DUMP, 4, 0], ChecksumAlg::Off, None).is_err());
        assert!(DumpRequest::decode(&[], ChecksumAlg::Off, None).is_err());
    }

    #[test]
    fn test_decode_rejects_oversized_lengths() {
        let mut packet = vec![COM_BINLOG_DUMP_GTID];
        packet.extend_from_slice(&BINLOG_THROUGH_GTID.to_le_bytes());
        packet.extend_from_slice(&7u32.to_le_bytes());
        packet.extend_from_slice(&u32::MAX.to_le_bytes());
        let err = DumpRequest::decode(&packet, ChecksumAlg::Off, None).unwrap_err();
        assert!(matches!(err, CdcError::ProtocolError(msg) if msg.contains("4294967295 bytes")));

        let mut packet = vec![COM_BINLOG_DUMP_GTID];
        packet.extend_from_slice(&BINLOG_THROUGH_GTID.to_le_bytes());
        packet.extend_from_slice(&7u32.to_le_bytes());
        packet.extend_from_slice(&0u32.to_le_bytes());
        packet.extend_from_slice(&4u64.to_le_bytes());
        packet.extend_from_slice(&0x7fff_ffffu32.to_le_bytes());
        packet.extend_from_slice(&[0u8; 8]);
        let err = DumpRequest::decode(&packet, ChecksumAlg::Off, None).unwrap_err();
        assert!(matches!(err, CdcError::ProtocolError(msg) if msg.contains("8 remaining")));
    }

    #[test]
    fn test_empty_file_name_means_first_file() {
        let packet = DumpRequest::from_position("", 4).encode().unwrap();
        let decoded = DumpRequest::decode(&packet, ChecksumAlg::Off, None).unwrap();
        assert_eq!(
            decoded.start,
            DumpStart::Position(BinlogPosition::new("", 4))
        );
        assert_eq!(decoded.to_string(), "position :4 (server_id=0, checksum=NONE, blocking)");
    }
}
