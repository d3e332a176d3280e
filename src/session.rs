//! 복제본 연결 하나의 명령 처리
//!
//! 인사 패킷 → 핸드셰이크 응답 (자격 증명은 확인하지 않음) → 명령 루프.
//! 복제본은 덤프 명령 전에 세션 변수로 체크섬 모드와 heartbeat 주기를 알려주고,
//! 덤프 명령을 받으면 연결을 덤프 엔진에 넘깁니다.

use crate::config::{BinlogConfig, DumperConfig, ServerConfig};
use crate::dump_request::{DumpRequest, COM_BINLOG_DUMP, COM_BINLOG_DUMP_GTID};
use crate::dumper::{BinlogDumper, DumpExit};
use crate::error::{CdcError, Result};
use crate::events::ChecksumAlg;
use crate::ingest::IngestStatus;
use crate::protocol::{GreetingPacket, PacketChannel, CLIENT_PROTOCOL_41};
use bytes::Buf;
use chrono::Utc;
use regex::Regex;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub const COM_QUIT: u8 = 0x01;
pub const COM_QUERY: u8 = 0x03;
pub const COM_PING: u8 = 0x0e;
pub const COM_REGISTER_SLAVE: u8 = 0x15;

/// 인사 패킷에 실리는 서버 버전
pub const SERVER_VERSION: &str = "5.7.36-binlog-dumper";

const ER_UNKNOWN_COM_ERROR: u16 = 1047;
const ER_UNKNOWN_SYSTEM_VARIABLE: u16 = 1193;
const ER_WRONG_VALUE_FOR_VAR: u16 = 1231;
const ER_NOT_SUPPORTED_YET: u16 = 1235;

/// 세션 종료 사유
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    Quit,
    Disconnected,
    Dump(DumpExit),
}

/// 복제본이 덤프 전에 보내는 질의 분류
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionQuery {
    /// `SET @master_binlog_checksum = ...` (값 또는 `@@global.binlog_checksum`)
    SetChecksum(String),
    /// `SET @master_heartbeat_period = N` (나노초)
    SetHeartbeatPeriod(u64),
    /// 그 밖의 SET 은 받아들이기만 함
    Set,
    /// 변수 하나 조회 (소문자)
    Select(String),
    Unsupported,
}

struct QueryPatterns {
    checksum: Regex,
    heartbeat: Regex,
    select: Regex,
    set: Regex,
}

impl QueryPatterns {
    fn new() -> Result<Self> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|e| CdcError::Other(format!("Invalid query pattern: {}", e)))
        };

        Ok(QueryPatterns {
            checksum: compile(
                r"(?i)^SET\s+@master_binlog_checksum\s*=\s*'?(@@global\.binlog_checksum|\w+)'?\s*;?$",
            )?,
            heartbeat: compile(r"(?i)^SET\s+@master_heartbeat_period\s*=\s*(\d+)\s*;?$")?,
            select: compile(r"(?i)^SELECT\s+(@@global\.\w+|@@\w+|@\w+|unix_timestamp\(\))\s*;?$")?,
            set: compile(r"(?i)^SET\s+")?,
        })
    }

    fn classify(&self, sql: &str) -> SessionQuery {
        let sql = sql.trim();

        if let Some(caps) = self.checksum.captures(sql) {
            return SessionQuery::SetChecksum(caps[1].to_string());
        }
        if let Some(caps) = self.heartbeat.captures(sql) {
            if let Ok(nanos) = caps[1].parse() {
                return SessionQuery::SetHeartbeatPeriod(nanos);
            }
        }
        if let Some(caps) = self.select.captures(sql) {
            return SessionQuery::Select(caps[1].to_lowercase());
        }
        if self.set.is_match(sql) {
            return SessionQuery::Set;
        }
        SessionQuery::Unsupported
    }
}

/// 복제본 연결 하나
pub struct ReplicaSession<S> {
    channel: PacketChannel<S>,
    binlog: BinlogConfig,
    dumper: DumperConfig,
    peer: String,
    thread_id: u32,
    patterns: QueryPatterns,
    checksum: ChecksumAlg,
    heartbeat_period: Option<Duration>,
    shutdown: Option<watch::Receiver<bool>>,
    ingest_status: Option<watch::Receiver<IngestStatus>>,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> ReplicaSession<S> {
    pub fn new(
        stream: S,
        config: &ServerConfig,
        peer: impl Into<String>,
        thread_id: u32,
    ) -> Result<Self> {
        Ok(ReplicaSession {
            channel: PacketChannel::new(stream),
            binlog: config.binlog.clone(),
            dumper: config.dumper.clone(),
            peer: peer.into(),
            thread_id,
            patterns: QueryPatterns::new()?,
            // 복제본이 알려주기 전까지는 체크섬 없음
            checksum: ChecksumAlg::Off,
            heartbeat_period: None,
            shutdown: None,
            ingest_status: None,
        })
    }

    /// 서버 종료 신호. 덤프 중이면 덤프를 멈춥니다.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// 수집 루틴 상태. 수집이 실패하면 진행 중인 덤프가 ERR 로 끝납니다.
    pub fn with_ingest_status(mut self, status: watch::Receiver<IngestStatus>) -> Self {
        self.ingest_status = Some(status);
        self
    }

    pub async fn run(self) -> Result<SessionEnd> {
        let peer = self.peer.clone();
        match self.serve().await {
            Err(CdcError::PeerLivenessLost) => {
                debug!("Replica {} closed the connection", peer);
                Ok(SessionEnd::Disconnected)
            }
            other => other,
        }
    }

    async fn serve(mut self) -> Result<SessionEnd> {
        self.handshake().await?;

        loop {
            self.channel.reset_sequence();
            let packet = self.channel.read_packet().await?;
            let command = match packet.first() {
                Some(&command) => command,
                None => {
                    self.channel
                        .write_error(ER_UNKNOWN_COM_ERROR, "08S01", "Empty command")
                        .await?;
                    continue;
                }
            };

            match command {
                COM_QUIT => {
                    info!("Replica {} quit", self.peer);
                    if let Err(e) = self.channel.shutdown().await {
                        debug!("Failed to close connection to {}: {}", self.peer, e);
                    }
                    return Ok(SessionEnd::Quit);
                }
                COM_PING => self.channel.write_ok().await?,
                COM_QUERY => self.handle_query(&packet[1..]).await?,
                COM_REGISTER_SLAVE => self.register_replica(&packet[1..]).await?,
                COM_BINLOG_DUMP | COM_BINLOG_DUMP_GTID => return self.dump(&packet).await,
                other => {
                    warn!("Unsupported command 0x{:02x} from {}", other, self.peer);
                    self.channel
                        .write_error(ER_UNKNOWN_COM_ERROR, "08S01", "Unknown command")
                        .await?;
                }
            }
        }
    }

    async fn handshake(&mut self) -> Result<()> {
        let greeting = GreetingPacket::new(SERVER_VERSION, self.thread_id);
        self.channel.write_packet(&greeting.encode()?).await?;

        let response = self.channel.read_packet().await?;
        let user = parse_handshake_user(&response)?;
        info!(
            "Replica {} connected as '{}' (thread {})",
            self.peer, user, self.thread_id
        );
        self.channel.write_ok().await
    }

    async fn handle_query(&mut self, payload: &[u8]) -> Result<()> {
        let sql = String::from_utf8_lossy(payload);
        debug!("Query from {}: {}", self.peer, sql);

        match self.patterns.classify(&sql) {
            SessionQuery::SetChecksum(value) => {
                let checksum = if value.eq_ignore_ascii_case("@@global.binlog_checksum") {
                    Some(self.binlog.binlog_checksum)
                } else {
                    ChecksumAlg::from_name(&value)
                };
                match checksum {
                    Some(checksum) => {
                        info!("Replica {} uses checksum {}", self.peer, checksum.name());
                        self.checksum = checksum;
                        self.channel.write_ok().await
                    }
                    None => {
                        let message = format!("Variable 'master_binlog_checksum' can't be set to '{}'", value);
                        self.channel
                            .write_error(ER_WRONG_VALUE_FOR_VAR, "42000", &message)
                            .await
                    }
                }
            }
            SessionQuery::SetHeartbeatPeriod(nanos) => {
                let period = Duration::from_nanos(nanos);
                info!("Replica {} heartbeat period {:?}", self.peer, period);
                self.heartbeat_period = Some(period);
                self.channel.write_ok().await
            }
            SessionQuery::Set => self.channel.write_ok().await,
            SessionQuery::Select(variable) => match self.variable_value(&variable) {
                Some(value) => {
                    self.channel
                        .write_single_value(&variable, Some(&value))
                        .await
                }
                None => {
                    let message = format!("Unknown system variable '{}'", variable);
                    self.channel
                        .write_error(ER_UNKNOWN_SYSTEM_VARIABLE, "HY000", &message)
                        .await
                }
            },
            SessionQuery::Unsupported => {
                warn!("Unsupported query from {}: {}", self.peer, sql);
                self.channel
                    .write_error(ER_NOT_SUPPORTED_YET, "42000", "Only replication commands are supported")
                    .await
            }
        }
    }

    fn variable_value(&self, variable: &str) -> Option<String> {
        let name = variable
            .trim_start_matches("@@global.")
            .trim_start_matches("@@");
        match name {
            "binlog_checksum" => Some(self.binlog.binlog_checksum.name().to_string()),
            "@master_binlog_checksum" => Some(self.checksum.name().to_string()),
            "server_id" => Some(self.binlog.server_id.to_string()),
            "gtid_mode" => Some("ON".to_string()),
            "version" => Some(SERVER_VERSION.to_string()),
            "unix_timestamp()" => Some(Utc::now().timestamp().to_string()),
            _ => None,
        }
    }

    async fn register_replica(&mut self, payload: &[u8]) -> Result<()> {
        match parse_register_replica(payload) {
            Ok((server_id, host, port)) => {
                info!(
                    "Replica {} registered: server_id={}, report address {}:{}",
                    self.peer, server_id, host, port
                );
            }
            Err(e) => warn!("Ignoring malformed COM_REGISTER_SLAVE from {}: {}", self.peer, e),
        }
        self.channel.write_ok().await
    }

    /// 연결을 덤프 엔진에 넘기고 끝날 때까지 대기
    async fn dump(self, packet: &[u8]) -> Result<SessionEnd> {
        let ReplicaSession {
            mut channel,
            binlog,
            dumper: dumper_config,
            peer,
            checksum,
            heartbeat_period,
            mut shutdown,
            ingest_status,
            ..
        } = self;

        let request = match DumpRequest::decode(packet, checksum, heartbeat_period) {
            Ok(request) => request,
            Err(e) => {
                channel
                    .write_error(e.mysql_error_code(), "HY000", &e.to_string())
                    .await?;
                return Err(e);
            }
        };

        let mut dumper = BinlogDumper::new(binlog, dumper_config, channel, request, peer.as_str());
        if let Some(status) = ingest_status {
            dumper = dumper.with_ingest_status(status);
        }
        let handle = dumper.handle();
        let run = dumper.run();
        tokio::pin!(run);

        let result = tokio::select! {
            result = &mut run => result,
            _ = wait_for_shutdown(&mut shutdown) => {
                handle.stop();
                run.await
            }
        };

        match serde_json::to_string(&handle.info()) {
            Ok(summary) => info!("Dump session summary for {}: {}", peer, summary),
            Err(e) => warn!("Failed to serialize dump summary for {}: {}", peer, e),
        }
        result.map(SessionEnd::Dump)
    }
}

async fn wait_for_shutdown(shutdown: &mut Option<watch::Receiver<bool>>) {
    if let Some(rx) = shutdown {
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
        if *rx.borrow() {
            return;
        }
    }
    std::future::pending::<()>().await
}

/// HandshakeResponse41 에서 사용자 이름만 꺼냄
fn parse_handshake_user(mut data: &[u8]) -> Result<String> {
    // capability 4 + max packet 4 + charset 1 + filler 23
    if data.remaining() < 32 {
        return Err(CdcError::ProtocolError(
            "Handshake response too short".to_string(),
        ));
    }
    let capabilities = data.get_u32_le();
    if capabilities & CLIENT_PROTOCOL_41 == 0 {
        return Err(CdcError::ProtocolError(
            "Clients without CLIENT_PROTOCOL_41 are not supported".to_string(),
        ));
    }
    data.advance(4 + 1 + 23);

    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    Ok(String::from_utf8_lossy(&data[..end]).to_string())
}

/// COM_REGISTER_SLAVE payload: (server_id, report host, report port)
fn parse_register_replica(mut data: &[u8]) -> Result<(u32, String, u16)> {
    if data.remaining() < 4 {
        return Err(CdcError::ProtocolError(
            "Truncated COM_REGISTER_SLAVE".to_string(),
        ));
    }
    let server_id = data.get_u32_le();
    let host = read_length_prefixed(&mut data)?;
    let _user = read_length_prefixed(&mut data)?;
    let _password = read_length_prefixed(&mut data)?;
    let port = if data.remaining() >= 2 {
        data.get_u16_le()
    } else {
        0
    };
    Ok((server_id, host, port))
}

fn read_length_prefixed(data: &mut &[u8]) -> Result<String> {
    if !data.has_remaining() {
        return Err(CdcError::ProtocolError(
            "Truncated COM_REGISTER_SLAVE".to_string(),
        ));
    }
    let len = data.get_u8() as usize;
    if data.remaining() < len {
        return Err(CdcError::ProtocolError(
            "Truncated COM_REGISTER_SLAVE".to_string(),
        ));
    }
    let value = String::from_utf8_lossy(&data[..len]).to_string();
    data.advance(len);
    Ok(value)
}
