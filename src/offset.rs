//! Binlog 위치 (파일명 + 바이트 오프셋)
//!
//! 재시작 요청과 체크포인트 보고에 공통으로 쓰이는 주소 단위입니다.
//! 예: "mysql-bin.000003" 파일의 4097 바이트 위치

use crate::events::BINLOG_MAGIC_SIZE;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Binlog 파일 위치 정보
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct BinlogPosition {
    /// 바이너리 로그 파일명 (e.g., "mysql-bin.000001")
    pub filename: String,
    /// 바이트 위치 (항상 완전한 이벤트의 시작)
    pub position: u64,
}

impl BinlogPosition {
    pub fn new(filename: impl Into<String>, position: u64) -> Self {
        BinlogPosition {
            filename: filename.into(),
            position,
        }
    }

    /// 파일의 첫 이벤트 위치 (매직 넘버 다음)
    pub fn file_start(filename: impl Into<String>) -> Self {
        BinlogPosition::new(filename, BINLOG_MAGIC_SIZE)
    }

    /// 파일명에서 시퀀스 번호 추출
    pub fn file_sequence(&self) -> Option<u64> {
        self.filename
            .split('.')
            .last()
            .and_then(|s| s.parse().ok())
    }
}

impl PartialOrd for BinlogPosition {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        let by_file = match (self.file_sequence(), other.file_sequence()) {
            (Some(a), Some(b)) => a.cmp(&b),
            _ => self.filename.cmp(&other.filename),
        };
        Some(
            by_file
                .then_with(|| self.filename.cmp(&other.filename))
                .then(self.position.cmp(&other.position)),
        )
    }
}

impl fmt::Display for BinlogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.filename, self.position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binlog_position_parse() {
        let pos = BinlogPosition::new("mysql-bin.000123", 4096);
        assert_eq!(pos.file_sequence(), Some(123));
        assert_eq!(pos.to_string(), "mysql-bin.000123:4096");
    }

    #[test]
    fn test_position_ordering() {
        let a = BinlogPosition::new("mysql-bin.000001", 900);
        let b = BinlogPosition::file_start("mysql-bin.000002");
        let c = BinlogPosition::new("mysql-bin.000002", 200);
        assert!(a < b);
        assert!(b < c);
        assert_eq!(b.position, 4);
    }
}
