//! MySQL 복제 프로토콜 binlog 덤프 서버 핵심 구현
//!
//! 외부 변환기가 디스크에 쓰는 binlog 파일을 읽어 MySQL 복제본에 스트리밍합니다.
//! 주요 기능:
//! - CDC 소스 레코드를 핸드오프 큐로 옮기는 수집 루틴
//! - 위치/GTID 기반 시작점 탐색
//! - 파일 회전, heartbeat, 체크섬 변환, 속도 제한
//! - 쓰기 중인 파일 꼬리의 안전한 추적

pub mod binlog;
pub mod binlog_index;
pub mod config;
pub mod dump_request;
pub mod dumper;
pub mod error;
pub mod events;
pub mod gtid;
pub mod ingest;
pub mod metrics;
pub mod offset;
pub mod protocol;
pub mod rate_limiter;
pub mod session;

#[cfg(test)]
mod testing;

pub use binlog_index::{BinlogFileReader, BinlogIndex, BinlogIndexRecord};
pub use config::{BinlogConfig, DumperConfig, IngestConfig, ServerConfig};
pub use dump_request::{DumpRequest, DumpStart};
pub use dumper::{BinlogDumper, DumpExit, DumpInfo, DumpState, DumperHandle};
pub use error::{CdcError, Result};
pub use events::{ChecksumAlg, EventType};
pub use gtid::GtidSet;
pub use ingest::{CdcSource, IngestHandle, IngestRoutine, LogRecord};
pub use offset::BinlogPosition;
pub use session::{ReplicaSession, SessionEnd};
