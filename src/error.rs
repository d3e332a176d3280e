//! Binlog 생성/스트리밍 파이프라인 에러 타입

use std::io;
use thiserror::Error;

/// `ER_MASTER_FATAL_ERROR_READING_BINLOG`
pub const ER_MASTER_FATAL_ERROR_READING_BINLOG: u16 = 1236;

#[derive(Error, Debug)]
pub enum CdcError {
    #[error("설정 에러: {0}")]
    ConfigError(String),

    #[error("Binlog 파일을 찾을 수 없음: {0}")]
    FileNotFound(String),

    #[error("이벤트 경계가 아닌 위치: {file}:{position}")]
    MisalignedPosition { file: String, position: u64 },

    #[error("요청한 GTID 집합을 처리할 수 없음: {0}")]
    InvalidRequestedGtid(String),

    #[error("짧은 읽기: {file}@{offset} (요청 {wanted} 바이트, 읽음 {got} 바이트)")]
    ShortRead {
        file: String,
        offset: u64,
        wanted: usize,
        got: usize,
    },

    #[error("체크섬 불일치: {file}@{offset} (기대값 0x{expected:08x}, 실제값 0x{actual:08x})")]
    ChecksumMismatch {
        file: String,
        offset: u64,
        expected: u32,
        actual: u32,
    },

    #[error("피어 연결이 끊어짐")]
    PeerLivenessLost,

    #[error("핸드오프 큐 대기 시간 초과")]
    QueueBackpressureTimeout,

    #[error("CDC 소스 일시 장애: {0}")]
    SourceUnavailable(String),

    #[error("CDC 소스 치명적 에러: {0}")]
    SourceFatal(String),

    #[error("Binlog 파싱 에러: {0}")]
    BinlogParseError(String),

    #[error("GTID 처리 에러: {0}")]
    GtidError(String),

    #[error("I/O 에러: {0}")]
    IoError(String),

    #[error("프로토콜 에러: {0}")]
    ProtocolError(String),

    #[error("직렬화 에러: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("채널이 닫혔습니다")]
    ChannelClosed,

    #[error("예상치 못한 에러: {0}")]
    Other(String),
}

impl CdcError {
    /// 재시도하면 회복될 수 있는 소스 에러인지 여부
    pub fn is_transient(&self) -> bool {
        matches!(self, CdcError::SourceUnavailable(_))
    }

    /// 종료 전에 ERR 패킷으로 피어에게 알려야 하는 에러인지 여부
    pub fn reportable_to_peer(&self) -> bool {
        !matches!(
            self,
            CdcError::PeerLivenessLost | CdcError::ChannelClosed | CdcError::IoError(_)
        )
    }

    /// 피어에게 보낼 MySQL 에러 코드
    pub fn mysql_error_code(&self) -> u16 {
        ER_MASTER_FATAL_ERROR_READING_BINLOG
    }
}

impl From<io::Error> for CdcError {
    fn from(err: io::Error) -> Self {
        CdcError::IoError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CdcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(CdcError::SourceUnavailable("timeout".to_string()).is_transient());
        assert!(!CdcError::SourceFatal("gone".to_string()).is_transient());

        assert!(!CdcError::PeerLivenessLost.reportable_to_peer());
        assert!(CdcError::FileNotFound("mysql-bin.000009".to_string()).reportable_to_peer());
        assert_eq!(
            CdcError::InvalidRequestedGtid("x".to_string()).mysql_error_code(),
            1236
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let err: CdcError = io::Error::new(io::ErrorKind::Other, "disk").into();
        assert!(matches!(err, CdcError::IoError(msg) if msg.contains("disk")));
    }
}
