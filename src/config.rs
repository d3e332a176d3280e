//! 설정 구조체
//!
//! 전역 상태 대신 생성 시점에 명시적으로 전달됩니다.

use crate::events::ChecksumAlg;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Binlog 파일/인덱스 위치 및 이름 규칙
#[derive(Debug, Clone)]
pub struct BinlogConfig {
    /// binlog 파일과 인덱스가 있는 디렉터리
    pub binlog_dir: PathBuf,
    /// 파일명 접두사 (e.g., "mysql-bin")
    pub file_prefix: String,
    /// 파일 번호 zero-padding 폭
    pub file_name_width: usize,
    /// 인덱스 파일명
    pub index_file: String,
    /// 합성 이벤트(fake rotate, heartbeat)에 쓰는 서버 ID
    pub server_id: u32,
    /// `@@global.binlog_checksum` 으로 노출되는 디스크 체크섬 알고리즘
    pub binlog_checksum: ChecksumAlg,
}

impl Default for BinlogConfig {
    fn default() -> Self {
        BinlogConfig {
            binlog_dir: PathBuf::from("./binlog"),
            file_prefix: "mysql-bin".to_string(),
            file_name_width: 6,
            index_file: "mysql-bin.index".to_string(),
            server_id: 1,
            binlog_checksum: ChecksumAlg::Crc32,
        }
    }
}

impl BinlogConfig {
    pub fn new(binlog_dir: impl Into<PathBuf>) -> Self {
        BinlogConfig {
            binlog_dir: binlog_dir.into(),
            ..Default::default()
        }
    }

    /// 파일 번호로 파일명 생성 (e.g., 1 -> "mysql-bin.000001")
    pub fn file_name(&self, index: u64) -> String {
        format!(
            "{}.{:0width$}",
            self.file_prefix,
            index,
            width = self.file_name_width
        )
    }

    /// 파일명에서 파일 번호 추출
    pub fn file_index(&self, file_name: &str) -> Option<u64> {
        let (prefix, suffix) = file_name.rsplit_once('.')?;
        if prefix != self.file_prefix || suffix.len() < self.file_name_width {
            return None;
        }
        suffix.parse().ok()
    }

    pub fn file_path(&self, file_name: &str) -> PathBuf {
        self.binlog_dir.join(file_name)
    }

    pub fn index_path(&self) -> PathBuf {
        self.binlog_dir.join(&self.index_file)
    }
}

/// 덤프 엔진 설정
#[derive(Debug, Clone)]
pub struct DumperConfig {
    /// 파일 끝에 도달했을 때 성장 여부를 다시 확인하는 주기
    pub poll_interval: Duration,
    /// 피어 생존 확인 주기
    pub liveness_check_interval: Duration,
    /// 초당 처리량 계산 윈도우
    pub metric_interval: Duration,
    /// 세션이 지정하지 않았을 때의 heartbeat 주기 (0 = 비활성)
    pub default_heartbeat_period: Duration,
    /// 초당 최대 이벤트 수 (0 = 무제한)
    pub max_events_per_sec: u64,
    /// 초당 최대 바이트 수 (0 = 무제한)
    pub max_bytes_per_sec: u64,
    /// 복제본이 읽지 않아 쓰기가 막혔을 때 연결을 끊기까지의 시간 (0 = 무한 대기)
    pub write_timeout: Duration,
}

impl Default for DumperConfig {
    fn default() -> Self {
        DumperConfig {
            poll_interval: Duration::from_millis(100),
            liveness_check_interval: Duration::from_secs(1),
            metric_interval: Duration::from_secs(10),
            default_heartbeat_period: Duration::ZERO,
            max_events_per_sec: 0,
            max_bytes_per_sec: 0,
            write_timeout: Duration::from_secs(60),
        }
    }
}

/// 수집 루틴 설정
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// CDC 소스 접속 주소
    pub source_endpoint: String,
    /// 핸드오프 큐 용량
    pub queue_capacity: usize,
    /// 일시 장애 재시도 초기 대기
    pub retry_initial_backoff: Duration,
    /// 일시 장애 재시도 최대 대기
    pub retry_max_backoff: Duration,
    /// 큐 push 대기 한도 (None = 무한 대기)
    pub push_timeout: Option<Duration>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        IngestConfig {
            source_endpoint: "127.0.0.1:2881".to_string(),
            queue_capacity: 1024,
            retry_initial_backoff: Duration::from_millis(100),
            retry_max_backoff: Duration::from_secs(5),
            push_timeout: None,
        }
    }
}

impl IngestConfig {
    pub fn new(source_endpoint: impl Into<String>) -> Self {
        IngestConfig {
            source_endpoint: source_endpoint.into(),
            ..Default::default()
        }
    }
}

/// 실행 파일 설정
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub binlog: BinlogConfig,
    pub dumper: DumperConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            listen_addr: "0.0.0.0:2983".to_string(),
            binlog: BinlogConfig::default(),
            dumper: DumperConfig::default(),
        }
    }
}

impl ServerConfig {
    /// `BINLOG_*` 환경 변수에서 설정 로드 (없거나 잘못된 값은 기본값 사용)
    pub fn from_env() -> Self {
        let defaults = ServerConfig::default();
        let binlog = BinlogConfig {
            binlog_dir: env::var("BINLOG_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.binlog.binlog_dir),
            file_prefix: env::var("BINLOG_FILE_PREFIX").unwrap_or(defaults.binlog.file_prefix),
            file_name_width: env_or("BINLOG_FILE_NAME_WIDTH", defaults.binlog.file_name_width),
            index_file: env::var("BINLOG_INDEX_FILE").unwrap_or(defaults.binlog.index_file),
            server_id: env_or("BINLOG_SERVER_ID", defaults.binlog.server_id),
            binlog_checksum: env::var("BINLOG_CHECKSUM")
                .ok()
                .and_then(|v| ChecksumAlg::from_name(&v))
                .unwrap_or(defaults.binlog.binlog_checksum),
        };

        let dumper = DumperConfig {
            poll_interval: Duration::from_millis(env_or(
                "BINLOG_POLL_INTERVAL_MS",
                defaults.dumper.poll_interval.as_millis() as u64,
            )),
            liveness_check_interval: Duration::from_millis(env_or(
                "BINLOG_LIVENESS_INTERVAL_MS",
                defaults.dumper.liveness_check_interval.as_millis() as u64,
            )),
            metric_interval: Duration::from_secs(env_or(
                "BINLOG_COUNTER_INTERVAL_S",
                defaults.dumper.metric_interval.as_secs(),
            )),
            default_heartbeat_period: Duration::from_millis(env_or(
                "BINLOG_HEARTBEAT_PERIOD_MS",
                defaults.dumper.default_heartbeat_period.as_millis() as u64,
            )),
            max_events_per_sec: env_or("BINLOG_MAX_EVENTS_PER_SEC", defaults.dumper.max_events_per_sec),
            max_bytes_per_sec: env_or("BINLOG_MAX_BYTES_PER_SEC", defaults.dumper.max_bytes_per_sec),
            write_timeout: Duration::from_millis(env_or(
                "BINLOG_WRITE_TIMEOUT_MS",
                defaults.dumper.write_timeout.as_millis() as u64,
            )),
        };

        ServerConfig {
            listen_addr: env::var("BINLOG_LISTEN_ADDR").unwrap_or(defaults.listen_addr),
            binlog,
            dumper,
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
