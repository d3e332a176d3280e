//! Binlog 덤프 엔진
//!
//! 복제본 연결 하나당 태스크 하나로 실행됩니다. 상태 전이:
//!
//! ```text
//! ResolvingStart → SendingFormatDescription → Streaming ⇄ Rotating
//!                                                  ↓
//!                                              Terminated
//! ```
//!
//! - 시작점(파일+위치 또는 GTID 집합)을 인덱스에서 찾고 FDE 를 먼저 보냅니다.
//! - 이벤트는 디스크 순서 그대로, 세션 체크섬 모드에 맞춰 변환해 전송합니다.
//! - 현재 파일 끝에 정확히 도달했고 인덱스에 다음 파일이 있으면 fake rotate 를 한 번 보내고 넘어갑니다.
//! - 쓰기 중인 꼬리는 에러가 아니라 대기 조건입니다.
//! - 대기는 하나의 `select!` 에서 중단 신호, poll 주기, heartbeat 주기, 피어 생존 확인을 함께 기다립니다.

use crate::binlog::{BinlogParser, EventBuilder, RawEvent};
use crate::binlog_index::{BinlogFileReader, BinlogIndex, BinlogIndexRecord, EventRead};
use crate::config::{BinlogConfig, DumperConfig};
use crate::dump_request::{DumpRequest, DumpStart};
use crate::error::{CdcError, Result};
use crate::events::{ChecksumAlg, EventType, BINLOG_MAGIC_SIZE};
use crate::gtid::GtidSet;
use crate::ingest::IngestStatus;
use crate::metrics::DumperMetric;
use crate::offset::BinlogPosition;
use crate::protocol::PacketChannel;
use crate::rate_limiter::EventRateLimiter;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// 생존 확인 읽기의 최대 대기
const LIVENESS_PROBE_WAIT: Duration = Duration::from_millis(1);

/// 덤프 세션 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DumpState {
    ResolvingStart,
    SendingFormatDescription,
    Streaming,
    Rotating,
    Terminated,
}

/// 정상 종료 사유
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DumpExit {
    /// non-blocking 요청이 끝까지 전송되고 EOF 를 보냄
    Completed,
    /// 중단 요청
    Stopped,
    /// 복제본 연결 끊김
    PeerLost,
}

/// 세션 관측용 스냅샷
#[derive(Debug, Clone, Serialize)]
pub struct DumpInfo {
    pub peer: String,
    pub request: String,
    pub state: DumpState,
    /// 현재 읽기 위치
    pub position: BinlogPosition,
    /// 마지막으로 완전히 전송된 이벤트 다음 위치
    pub checkpoint: BinlogPosition,
    /// 초
    pub lag: u64,
    pub events_per_sec: f64,
    pub bytes_per_sec: f64,
    pub events_sent: u64,
    pub bytes_sent: u64,
    pub fake_rotates: u64,
    pub heartbeats: u64,
    /// 속도 제한으로 대기한 전송 수
    pub throttled_sends: u64,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug)]
struct Progress {
    state: DumpState,
    position: BinlogPosition,
    checkpoint: BinlogPosition,
}

#[derive(Debug)]
struct Shared {
    peer: String,
    request: String,
    started_at: DateTime<Utc>,
    progress: RwLock<Progress>,
    metric: DumperMetric,
    limiter: EventRateLimiter,
    stop: watch::Sender<bool>,
}

/// 실행 중인 덤프 세션 핸들 (복제 가능)
#[derive(Debug, Clone)]
pub struct DumperHandle {
    shared: Arc<Shared>,
}

impl DumperHandle {
    /// 중단 요청. 여러 번 호출해도 안전합니다.
    pub fn stop(&self) {
        if !self.shared.stop.send_replace(true) {
            info!("Stop requested for binlog dump of {}", self.shared.peer);
        }
    }

    pub fn is_stopped(&self) -> bool {
        *self.shared.stop.borrow()
    }

    pub fn state(&self) -> DumpState {
        self.shared.progress.read().state
    }

    pub fn checkpoint(&self) -> BinlogPosition {
        self.shared.progress.read().checkpoint.clone()
    }

    pub fn info(&self) -> DumpInfo {
        let (state, position, checkpoint) = {
            let progress = self.shared.progress.read();
            (
                progress.state,
                progress.position.clone(),
                progress.checkpoint.clone(),
            )
        };
        let metric = &self.shared.metric;

        DumpInfo {
            peer: self.shared.peer.clone(),
            request: self.shared.request.clone(),
            state,
            position,
            checkpoint,
            lag: metric.lag(),
            events_per_sec: metric.events_per_second(),
            bytes_per_sec: metric.bytes_per_second(),
            events_sent: metric.events_sent(),
            bytes_sent: metric.bytes_sent(),
            fake_rotates: metric.fake_rotates(),
            heartbeats: metric.heartbeats(),
            throttled_sends: self.shared.limiter.throttled_count(),
            started_at: self.shared.started_at,
        }
    }
}

/// 현재 읽고 있는 파일
struct ReadCursor {
    reader: BinlogFileReader,
    /// 파일 FDE 에 기록된 체크섬
    file_alg: ChecksumAlg,
    offset: u64,
    magic_checked: bool,
    /// GTID 필터로 현재 트랜잭션을 건너뛰는 중
    skipping: bool,
}

impl ReadCursor {
    fn new(reader: BinlogFileReader, file_alg: ChecksumAlg, offset: u64) -> Self {
        ReadCursor {
            reader,
            file_alg,
            offset,
            magic_checked: false,
            skipping: false,
        }
    }

    fn file(&self) -> &str {
        self.reader.name()
    }

    fn position(&self) -> BinlogPosition {
        BinlogPosition::new(self.reader.name(), self.offset)
    }

    /// 매직 넘버가 아직 없으면 `Incomplete`
    async fn read_next(&mut self) -> Result<EventRead> {
        if !self.magic_checked {
            if !self.reader.check_magic().await? {
                return Ok(EventRead::Incomplete { available: 0 });
            }
            self.magic_checked = true;
        }
        self.reader.read_event(self.offset, self.file_alg).await
    }
}

/// 복제본에 쓰는 패킷
enum Outgoing<'a> {
    Event(&'a [u8]),
    Eof,
    Error(u16, &'a str),
}

enum Flow<T> {
    Continue(T),
    Exit(DumpExit),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wake {
    Stop,
    Poll,
    Heartbeat,
    Probe,
}

/// 복제본 연결 하나를 담당하는 덤프 엔진
pub struct BinlogDumper<S> {
    binlog: BinlogConfig,
    config: DumperConfig,
    channel: PacketChannel<S>,
    request: DumpRequest,
    shared: Arc<Shared>,
    stop_rx: watch::Receiver<bool>,
    /// 세션 체크섬으로 합성 이벤트 생성
    builder: EventBuilder,
    gtid_filter: Option<GtidSet>,
    heartbeat_timer: Option<Interval>,
    liveness_timer: Option<Interval>,
    /// 수집 루틴 상태. `Failed` 가 되면 세션을 끝냅니다.
    ingest_status: Option<watch::Receiver<IngestStatus>>,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> BinlogDumper<S> {
    /// 인증이 끝난 연결과 덤프 요청으로 세션 생성
    pub fn new(
        binlog: BinlogConfig,
        config: DumperConfig,
        channel: PacketChannel<S>,
        request: DumpRequest,
        peer: impl Into<String>,
    ) -> Self {
        let (stop, stop_rx) = watch::channel(false);
        let initial = match &request.start {
            DumpStart::Position(position) => position.clone(),
            DumpStart::Gtid(_) => BinlogPosition::new("", 0),
        };

        let shared = Arc::new(Shared {
            peer: peer.into(),
            request: request.to_string(),
            started_at: Utc::now(),
            progress: RwLock::new(Progress {
                state: DumpState::ResolvingStart,
                position: initial.clone(),
                checkpoint: initial,
            }),
            metric: DumperMetric::new(config.metric_interval),
            limiter: EventRateLimiter::new(config.max_events_per_sec, config.max_bytes_per_sec),
            stop,
        });

        BinlogDumper {
            builder: EventBuilder::new(binlog.server_id, request.checksum),
            binlog,
            config,
            channel,
            request,
            shared,
            stop_rx,
            gtid_filter: None,
            heartbeat_timer: None,
            liveness_timer: None,
            ingest_status: None,
        }
    }

    /// 수집 루틴 상태 감시
    pub fn with_ingest_status(mut self, status: watch::Receiver<IngestStatus>) -> Self {
        self.ingest_status = Some(status);
        self
    }

    pub fn handle(&self) -> DumperHandle {
        DumperHandle {
            shared: self.shared.clone(),
        }
    }

    /// 별도 태스크에서 실행
    pub fn start(self) -> JoinHandle<Result<DumpExit>>
    where
        S: 'static,
    {
        tokio::spawn(self.run())
    }

    /// 종료될 때까지 스트리밍
    ///
    /// 세션을 끝내는 에러는 복제본에 ERR 패킷으로 알린 뒤 반환합니다.
    /// 피어 연결 끊김은 에러가 아니라 `DumpExit::PeerLost`.
    pub async fn run(mut self) -> Result<DumpExit> {
        info!(
            "Starting binlog dump for {}: {}",
            self.shared.peer, self.request
        );
        self.start_timers();

        let result = match self.dump().await {
            Ok(exit) => {
                info!(
                    "Binlog dump for {} finished ({:?}) at {}",
                    self.shared.peer,
                    exit,
                    self.handle().checkpoint()
                );
                Ok(exit)
            }
            Err(CdcError::PeerLivenessLost) => {
                info!("Replica {} disconnected", self.shared.peer);
                Ok(DumpExit::PeerLost)
            }
            Err(e) => {
                error!("Binlog dump for {} failed: {}", self.shared.peer, e);
                if e.reportable_to_peer() {
                    let code = e.mysql_error_code();
                    let message = e.to_string();
                    if let Err(send_err) =
                        self.write_or_stop(Outgoing::Error(code, &message)).await
                    {
                        warn!("Failed to report error to {}: {}", self.shared.peer, send_err);
                    }
                }
                Err(e)
            }
        };

        self.set_state(DumpState::Terminated);
        result
    }

    async fn dump(&mut self) -> Result<DumpExit> {
        self.set_state(DumpState::ResolvingStart);
        let (record, start_offset) = self.resolve_start().await?;

        let (mut cursor, fde) = match self.open_start_file(&record).await? {
            Flow::Continue(opened) => opened,
            Flow::Exit(exit) => return Ok(exit),
        };

        self.set_state(DumpState::SendingFormatDescription);
        if !self
            .send_format_description(&mut cursor, fde, start_offset)
            .await?
        {
            return Ok(DumpExit::Stopped);
        }

        self.set_state(DumpState::Streaming);
        self.stream(cursor).await
    }

    fn start_timers(&mut self) {
        let now = Instant::now();

        let liveness = self
            .config
            .liveness_check_interval
            .max(Duration::from_millis(1));
        let mut timer = interval_at(now + liveness, liveness);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.liveness_timer = Some(timer);

        let period = self
            .request
            .heartbeat_period
            .unwrap_or(self.config.default_heartbeat_period);
        if !period.is_zero() {
            debug!("Heartbeat period for {}: {:?}", self.shared.peer, period);
            let mut timer = interval_at(now + period, period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            self.heartbeat_timer = Some(timer);
        }
    }

    /// 시작 파일과 시작 오프셋
    async fn resolve_start(&mut self) -> Result<(BinlogIndexRecord, u64)> {
        let index = BinlogIndex::load(&self.binlog).await?;

        match &self.request.start {
            DumpStart::Position(position) => {
                let record = index.locate_by_position(&position.filename)?.clone();
                let offset = position.position.max(BINLOG_MAGIC_SIZE);
                info!("Dump start resolved to {}:{}", record.file_name, offset);
                Ok((record, offset))
            }
            DumpStart::Gtid(gtid_set) => {
                let record = index.locate_by_gtid(gtid_set)?.clone();
                info!(
                    "GTID set '{}' resolved to start file {}",
                    gtid_set, record.file_name
                );
                self.gtid_filter = Some(gtid_set.clone());
                let offset = record.start_position;
                Ok((record, offset))
            }
        }
    }

    /// 시작 파일을 열고 FDE 가 쓰일 때까지 대기
    async fn open_start_file(
        &mut self,
        record: &BinlogIndexRecord,
    ) -> Result<Flow<(ReadCursor, RawEvent)>> {
        let reader = BinlogFileReader::open(&self.binlog, &record.file_name).await?;
        let mut cursor = ReadCursor::new(reader, self.binlog.binlog_checksum, BINLOG_MAGIC_SIZE);
        self.update_position(cursor.position());

        loop {
            if self.is_stopped() {
                return Ok(Flow::Exit(DumpExit::Stopped));
            }

            match cursor.read_next().await? {
                EventRead::Complete(event)
                    if event.event_type() == EventType::FormatDescriptionEvent =>
                {
                    return Ok(Flow::Continue((cursor, event)));
                }
                EventRead::Complete(event) => {
                    return Err(CdcError::BinlogParseError(format!(
                        "{} does not start with a format description event (type {})",
                        cursor.file(),
                        event.header.type_code
                    )));
                }
                EventRead::Incomplete { .. } => {
                    debug!("{} has not started yet, waiting", cursor.file());
                    if let Some(exit) = self.wait_for_growth(None).await? {
                        return Ok(Flow::Exit(exit));
                    }
                }
            }
        }
    }

    /// 시작 파일의 FDE 전송. 중간 위치에서 시작하면 log_pos 를 0 으로 가립니다.
    async fn send_format_description(
        &mut self,
        cursor: &mut ReadCursor,
        fde: RawEvent,
        start_offset: u64,
    ) -> Result<bool> {
        let format = BinlogParser::parse_format_description(&fde.bytes)?;
        cursor.file_alg = format.checksum_alg;

        let mask_log_pos = start_offset > BINLOG_MAGIC_SIZE;
        if mask_log_pos {
            cursor.reader.check_event_boundary(start_offset).await?;
            cursor.offset = start_offset;
        } else {
            cursor.offset = fde.end_offset();
        }

        let bytes = fde.encode_for_session(cursor.file_alg, self.request.checksum, mask_log_pos)?;
        if !self.send_packet(&bytes).await? {
            return Ok(false);
        }
        self.shared
            .metric
            .record_send(1, bytes.len() as u64, fde.header.timestamp, false, false);
        self.update_checkpoint(cursor.position());

        debug!(
            "Sent format description of {} (server {}, file checksum {}, session checksum {})",
            cursor.file(),
            format.server_version,
            cursor.file_alg.name(),
            self.request.checksum.name()
        );
        Ok(true)
    }

    /// 메인 루프
    async fn stream(&mut self, mut cursor: ReadCursor) -> Result<DumpExit> {
        loop {
            if self.is_stopped() {
                return Ok(DumpExit::Stopped);
            }

            match cursor.read_next().await? {
                EventRead::Complete(event) => {
                    if !self.handle_event(&mut cursor, event).await? {
                        return Ok(DumpExit::Stopped);
                    }
                }
                EventRead::Incomplete { available } => {
                    if available == cursor.offset {
                        if let Some(next) = self.next_file(&cursor).await? {
                            if !self.rotate(&mut cursor, next).await? {
                                return Ok(DumpExit::Stopped);
                            }
                            continue;
                        }
                        self.shared.metric.mark_caught_up();
                    }

                    if let Some(exit) = self.wait_for_growth(Some(cursor.position())).await? {
                        return Ok(exit);
                    }
                }
            }
        }
    }

    /// 이벤트 하나 처리. 중단되면 false.
    async fn handle_event(&mut self, cursor: &mut ReadCursor, event: RawEvent) -> Result<bool> {
        let event_type = event.event_type();
        let next_offset = event.end_offset();

        match event_type {
            // 회전된 파일 머리의 FDE: 체크섬만 갱신하고 다시 보내지 않음
            EventType::FormatDescriptionEvent => {
                cursor.file_alg = BinlogParser::fde_checksum_alg(&event.bytes)?;
                debug!(
                    "Consumed format description of {} ({})",
                    cursor.file(),
                    cursor.file_alg.name()
                );
                self.skip(cursor, next_offset);
                return Ok(true);
            }
            // 파일 끝의 실제 ROTATE 는 fake rotate 로 대체
            EventType::RotateEvent if !event.header.is_artificial() => {
                debug!("Consumed rotate event at {}", cursor.position());
                self.skip(cursor, next_offset);
                return Ok(true);
            }
            EventType::GtidEvent => {
                if let Some(filter) = &self.gtid_filter {
                    let gtid = BinlogParser::parse_gtid_event(event.payload(cursor.file_alg))?;
                    cursor.skipping = filter.contains(&gtid.sid, gtid.gno);
                    if cursor.skipping {
                        debug!("Skipping already applied transaction {}", gtid.gtid());
                    }
                }
            }
            EventType::AnonymousGtidEvent => cursor.skipping = false,
            _ => {}
        }

        if cursor.skipping && !event_type.is_control() {
            self.skip(cursor, next_offset);
            return Ok(true);
        }

        let bytes = event.encode_for_session(cursor.file_alg, self.request.checksum, false)?;
        if !self.send_packet(&bytes).await? {
            return Ok(false);
        }
        self.shared
            .metric
            .record_send(1, bytes.len() as u64, event.header.timestamp, false, false);
        cursor.offset = next_offset;
        self.update_checkpoint(cursor.position());
        Ok(true)
    }

    /// 현재 파일 끝에 있을 때 넘어갈 다음 파일
    async fn next_file(&mut self, cursor: &ReadCursor) -> Result<Option<BinlogIndexRecord>> {
        let index = BinlogIndex::load(&self.binlog).await?;
        let next = match index.next_after(cursor.file()) {
            Some(next) => next.clone(),
            None => return Ok(None),
        };

        // 변환기가 기록한 끝보다 덜 읽었으면 아직 꼬리가 보이지 않는 것
        if let Some(current) = index.find(cursor.file()) {
            if current.end_position > cursor.offset {
                return Ok(None);
            }
        }
        // 인덱스를 읽은 뒤 길이를 다시 확인
        if cursor.reader.known_end_of_file().await? != cursor.offset {
            return Ok(None);
        }

        Ok(Some(next))
    }

    async fn rotate(&mut self, cursor: &mut ReadCursor, next: BinlogIndexRecord) -> Result<bool> {
        self.set_state(DumpState::Rotating);
        info!(
            "Rotating binlog dump for {}: {} -> {}",
            self.shared.peer,
            cursor.file(),
            next.file_name
        );

        let reader = BinlogFileReader::open(&self.binlog, &next.file_name).await?;
        let event = self
            .builder
            .fake_rotate(&next.file_name, next.start_position)?;
        if !self.send_packet(&event).await? {
            return Ok(false);
        }
        self.shared
            .metric
            .record_send(1, event.len() as u64, 0, true, false);

        *cursor = ReadCursor::new(reader, cursor.file_alg, next.start_position);
        self.update_checkpoint(cursor.position());
        self.set_state(DumpState::Streaming);
        Ok(true)
    }

    /// 파일 끝/쓰기 중 꼬리에서 대기. 종료해야 하면 Some.
    async fn wait_for_growth(
        &mut self,
        heartbeat_at: Option<BinlogPosition>,
    ) -> Result<Option<DumpExit>> {
        if self.request.non_blocking {
            debug!("Reached end of binlog for non-blocking dump of {}", self.shared.peer);
            if !self.write_or_stop(Outgoing::Eof).await? {
                return Ok(Some(DumpExit::Stopped));
            }
            return Ok(Some(DumpExit::Completed));
        }

        match self.suspend().await? {
            Wake::Stop => Ok(Some(DumpExit::Stopped)),
            Wake::Heartbeat => {
                if let Some(position) = heartbeat_at {
                    if !self.send_heartbeat(&position).await? {
                        return Ok(Some(DumpExit::Stopped));
                    }
                }
                Ok(None)
            }
            Wake::Poll | Wake::Probe => Ok(None),
        }
    }

    /// 대기 지점 (중단 / 수집 실패 / 생존 확인 / heartbeat / poll 중 먼저 오는 것)
    async fn suspend(&mut self) -> Result<Wake> {
        let poll_interval = self.config.poll_interval;
        let wake = tokio::select! {
            biased;
            _ = self.stop_rx.changed() => Wake::Stop,
            reason = ingest_failure(&mut self.ingest_status) => {
                error!(
                    "Ingestion failed, ending binlog dump for {}: {}",
                    self.shared.peer, reason
                );
                return Err(CdcError::SourceFatal(reason));
            }
            _ = tick(&mut self.liveness_timer) => Wake::Probe,
            _ = tick(&mut self.heartbeat_timer) => Wake::Heartbeat,
            _ = tokio::time::sleep(poll_interval) => Wake::Poll,
        };

        if wake == Wake::Probe {
            self.channel.probe_alive(LIVENESS_PROBE_WAIT).await?;
        }
        Ok(wake)
    }

    /// 중단되면 false
    async fn send_heartbeat(&mut self, position: &BinlogPosition) -> Result<bool> {
        let event = self.builder.heartbeat(&position.filename, position.position)?;
        debug!("Sending heartbeat to {} at {}", self.shared.peer, position);
        if !self.write_or_stop(Outgoing::Event(&event)).await? {
            return Ok(false);
        }
        self.shared
            .metric
            .record_send(1, event.len() as u64, 0, false, true);
        Ok(true)
    }

    /// 속도 제한 허가 후 전송. 중단되면 false.
    async fn send_packet(&mut self, event: &[u8]) -> Result<bool> {
        if self.is_stopped() {
            return Ok(false);
        }

        if self.shared.limiter.is_enabled() {
            let byte_count = event.len() as u64;
            let admitted = tokio::select! {
                biased;
                _ = self.stop_rx.changed() => false,
                _ = self.shared.limiter.acquire(byte_count) => true,
            };
            if !admitted {
                return Ok(false);
            }
        }

        if !self.write_or_stop(Outgoing::Event(event)).await? {
            return Ok(false);
        }
        if let Some(timer) = self.heartbeat_timer.as_mut() {
            timer.reset();
        }
        Ok(true)
    }

    /// 중단 신호와 경쟁하는 쓰기. 중단되면 false.
    ///
    /// 복제본이 읽기를 멈춰 `write_timeout` 안에 끝나지 않으면 `PeerLivenessLost`.
    async fn write_or_stop(&mut self, packet: Outgoing<'_>) -> Result<bool> {
        if self.is_stopped() {
            return Ok(false);
        }

        let write_timeout = self.config.write_timeout;
        let peer = self.shared.peer.as_str();
        let channel = &mut self.channel;
        let write = async move {
            let written = async {
                match packet {
                    Outgoing::Event(event) => channel.write_event(event).await,
                    Outgoing::Eof => channel.write_eof().await,
                    Outgoing::Error(code, message) => {
                        channel.write_error(code, "HY000", message).await
                    }
                }
            };
            if write_timeout.is_zero() {
                return written.await;
            }
            match tokio::time::timeout(write_timeout, written).await {
                Ok(written) => written,
                Err(_) => {
                    warn!(
                        "Replica {} has not read for {:?}, dropping it",
                        peer, write_timeout
                    );
                    Err(CdcError::PeerLivenessLost)
                }
            }
        };

        tokio::select! {
            biased;
            _ = self.stop_rx.changed() => Ok(false),
            written = write => written.map(|_| true),
        }
    }

    /// 보내지 않고 위치만 전진
    fn skip(&self, cursor: &mut ReadCursor, next_offset: u64) {
        cursor.offset = next_offset;
        self.update_position(cursor.position());
    }

    fn is_stopped(&self) -> bool {
        *self.stop_rx.borrow()
    }

    fn set_state(&self, state: DumpState) {
        self.shared.progress.write().state = state;
    }

    fn update_position(&self, position: BinlogPosition) {
        self.shared.progress.write().position = position;
    }

    fn update_checkpoint(&self, position: BinlogPosition) {
        let mut progress = self.shared.progress.write();
        progress.position = position.clone();
        progress.checkpoint = position;
    }
}

/// 수집 루틴이 `Failed` 가 될 때까지 대기. 감시 대상이 없으면 끝나지 않습니다.
async fn ingest_failure(status: &mut Option<watch::Receiver<IngestStatus>>) -> String {
    if let Some(rx) = status {
        loop {
            let failed = match &*rx.borrow_and_update() {
                IngestStatus::Failed(reason) => Some(reason.clone()),
                _ => None,
            };
            if let Some(reason) = failed {
                return reason;
            }
            if rx.changed().await.is_err() {
                break;
            }
        }
    }
    std::future::pending::<String>().await
}

async fn tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventHeader;
    use crate::protocol::{is_eof_packet, is_error_packet};
    use crate::testing::{uuid_a, BinlogFixture, FixtureFile};
    use tokio::io::DuplexStream;

    fn test_config() -> DumperConfig {
        DumperConfig {
            poll_interval: Duration::from_millis(10),
            liveness_check_interval: Duration::from_millis(50),
            metric_interval: Duration::from_secs(1),
            ..DumperConfig::default()
        }
    }

    struct Replica {
        channel: PacketChannel<DuplexStream>,
    }

    impl Replica {
        async fn next_packet(&mut self) -> Vec<u8> {
            tokio::time::timeout(Duration::from_secs(3), self.channel.read_packet())
                .await
                .expect("timed out waiting for packet")
                .unwrap()
        }

        async fn next_event(&mut self) -> Vec<u8> {
            let packet = self.next_packet().await;
            assert_eq!(packet[0], 0x00, "expected event packet, got {:?}", packet);
            packet[1..].to_vec()
        }

        async fn expect_silence(&mut self, wait: Duration) {
            let read = tokio::time::timeout(wait, self.channel.read_packet()).await;
            assert!(read.is_err(), "unexpected packet: {:?}", read);
        }

        /// EOF 까지의 이벤트
        async fn drain_until_eof(&mut self) -> Vec<Vec<u8>> {
            let mut events = Vec::new();
            loop {
                let packet = self.next_packet().await;
                if is_eof_packet(&packet) {
                    return events;
                }
                assert_eq!(packet[0], 0x00, "expected event packet, got {:?}", packet);
                events.push(packet[1..].to_vec());
            }
        }
    }

    fn start_dumper(
        fixture: &BinlogFixture,
        config: DumperConfig,
        request: DumpRequest,
    ) -> (Replica, DumperHandle, JoinHandle<Result<DumpExit>>) {
        start_dumper_with(fixture, config, request, 1 << 16, |dumper| dumper)
    }

    fn start_dumper_with(
        fixture: &BinlogFixture,
        config: DumperConfig,
        request: DumpRequest,
        buffer: usize,
        setup: impl FnOnce(BinlogDumper<DuplexStream>) -> BinlogDumper<DuplexStream>,
    ) -> (Replica, DumperHandle, JoinHandle<Result<DumpExit>>) {
        let (server, client) = tokio::io::duplex(buffer);
        let dumper = setup(BinlogDumper::new(
            fixture.config.clone(),
            config,
            PacketChannel::new(server),
            request,
            "10.0.0.7:51234",
        ));
        let handle = dumper.handle();
        let join = dumper.start();
        (
            Replica {
                channel: PacketChannel::new(client),
            },
            handle,
            join,
        )
    }

    async fn wait_for_checkpoint(handle: &DumperHandle, expected: &BinlogPosition) {
        for _ in 0..200 {
            if &handle.checkpoint() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("checkpoint {} never reached {}", handle.checkpoint(), expected);
    }

    fn assert_fake_rotate(event: &[u8], next_file: &str, alg: ChecksumAlg) {
        let event = RawEvent::from_bytes(0, event.to_vec()).unwrap();
        assert_eq!(event.event_type(), EventType::RotateEvent);
        assert!(event.header.is_artificial());
        assert_eq!(event.header.timestamp, 0);
        let data = BinlogParser::parse_rotate_event(event.payload(alg)).unwrap();
        assert_eq!(data.next_binlog_name, next_file);
        assert_eq!(data.position, 4);
    }

    fn write_and_register(fixture: &BinlogFixture, file: &FixtureFile) {
        fixture.write_all(file);
        fixture.register(file, &GtidSet::new(), &GtidSet::new());
    }

    #[tokio::test]
    async fn test_streams_across_rotation_in_disk_order() {
        let fixture = BinlogFixture::with_prefix("binlog");
        let mut first = fixture.new_file(1, ChecksumAlg::Off);
        let e1 = first.append_rows(100);
        let e2 = first.append_rows(100);
        let e3 = first.append_rows(100);
        let mut second = fixture.new_file(2, ChecksumAlg::Off);
        let e4 = second.append_rows(100);
        write_and_register(&fixture, &first);
        write_and_register(&fixture, &second);

        let request = DumpRequest::from_position("binlog.000001", 4);
        let (mut replica, handle, join) = start_dumper(&fixture, test_config(), request);
        let sampler = {
            let handle = handle.clone();
            tokio::spawn(async move {
                let mut seen: Vec<BinlogPosition> = Vec::new();
                while !handle.is_stopped() {
                    let checkpoint = handle.checkpoint();
                    if seen.last() != Some(&checkpoint) {
                        seen.push(checkpoint);
                    }
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
                seen
            })
        };

        assert_eq!(replica.next_event().await, first.events()[0]);
        assert_eq!(replica.next_event().await, e1);
        assert_eq!(replica.next_event().await, e2);
        assert_eq!(replica.next_event().await, e3);
        assert_fake_rotate(&replica.next_event().await, "binlog.000002", ChecksumAlg::Off);
        assert_eq!(replica.next_event().await, e4);

        let end = BinlogPosition::new("binlog.000002", second.len());
        wait_for_checkpoint(&handle, &end).await;

        let info = handle.info();
        assert_eq!(info.events_sent, 6);
        assert_eq!(info.fake_rotates, 1);
        assert_eq!(info.peer, "10.0.0.7:51234");
        assert_eq!(info.state, DumpState::Streaming);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.info().lag, 0);

        handle.stop();
        assert_eq!(join.await.unwrap().unwrap(), DumpExit::Stopped);
        assert_eq!(handle.state(), DumpState::Terminated);

        // 체크포인트는 항상 이벤트 경계에서 앞으로만 움직임
        let seen = sampler.await.unwrap();
        assert_eq!(seen.last(), Some(&end));
        for pair in seen.windows(2) {
            assert!(pair[0] < pair[1], "checkpoint went from {} to {}", pair[0], pair[1]);
        }
        for checkpoint in &seen {
            let boundaries = if checkpoint.filename == first.name {
                first.boundaries()
            } else {
                assert_eq!(checkpoint.filename, second.name);
                second.boundaries()
            };
            assert!(
                boundaries.contains(&checkpoint.position),
                "checkpoint {} is not an event boundary",
                checkpoint
            );
        }
    }

    #[tokio::test]
    async fn test_partial_tail_waits_and_resumes() {
        let fixture = BinlogFixture::new();
        let mut file = fixture.new_file(1, ChecksumAlg::Crc32);
        let e1 = file.append_query("BEGIN");
        let e2 = file.append_rows(200);
        let torn_at = file.len() as usize - e2.len() + 50;
        fixture.write_partial(&file, 50);
        fixture.register(&file, &GtidSet::new(), &GtidSet::new());

        let request = DumpRequest::from_position("", 4).with_checksum(ChecksumAlg::Crc32);
        let (mut replica, handle, join) = start_dumper(&fixture, test_config(), request);

        assert_eq!(replica.next_event().await, file.events()[0]);
        assert_eq!(replica.next_event().await, e1);
        replica.expect_silence(Duration::from_millis(150)).await;
        let after_e1 = BinlogPosition::new(file.name.as_str(), file.len() - e2.len() as u64);
        assert_eq!(handle.checkpoint(), after_e1);

        fixture.append_tail(&file, torn_at);
        assert_eq!(replica.next_event().await, e2);
        wait_for_checkpoint(&handle, &BinlogPosition::new(file.name.as_str(), file.len())).await;

        handle.stop();
        assert_eq!(join.await.unwrap().unwrap(), DumpExit::Stopped);
    }

    #[tokio::test]
    async fn test_checksum_mismatch_terminates_session() {
        let fixture = BinlogFixture::new();
        let mut file = fixture.new_file(1, ChecksumAlg::Crc32);
        let e1 = file.append_query("BEGIN");
        file.append_rows(120);
        file.corrupt_event(2);
        write_and_register(&fixture, &file);

        let request = DumpRequest::from_position("", 4).with_checksum(ChecksumAlg::Crc32);
        let (mut replica, _handle, join) = start_dumper(&fixture, test_config(), request);

        replica.next_event().await;
        assert_eq!(replica.next_event().await, e1);
        let packet = replica.next_packet().await;
        assert!(is_error_packet(&packet));
        assert_eq!(u16::from_le_bytes([packet[1], packet[2]]), 1236);

        let err = join.await.unwrap().unwrap_err();
        assert!(matches!(err, CdcError::ChecksumMismatch { .. }));
    }

    #[tokio::test]
    async fn test_non_blocking_ends_with_eof_and_transcodes_checksum() {
        let fixture = BinlogFixture::new();
        let mut file = fixture.new_file(1, ChecksumAlg::Off);
        let e1 = file.append_query("BEGIN");
        file.append_rows(80);
        write_and_register(&fixture, &file);

        let request = DumpRequest::from_position("", 4)
            .with_checksum(ChecksumAlg::Crc32)
            .with_non_blocking(true);
        let (mut replica, _handle, join) = start_dumper(&fixture, test_config(), request);

        let events = replica.drain_until_eof().await;
        assert_eq!(events.len(), 3);
        assert_eq!(
            BinlogParser::fde_checksum_alg(&events[0]).unwrap(),
            ChecksumAlg::Crc32
        );
        assert_eq!(events[1].len(), e1.len() + 4);
        for (i, bytes) in events.iter().enumerate() {
            let event = RawEvent::from_bytes(0, bytes.clone()).unwrap();
            event.verify_checksum("wire", ChecksumAlg::Crc32).unwrap();
            assert_eq!(event.header.next_pos as u64, file.boundaries()[i + 1]);
        }

        assert_eq!(join.await.unwrap().unwrap(), DumpExit::Completed);
    }

    #[tokio::test]
    async fn test_live_rotation_sends_single_marker() {
        let fixture = BinlogFixture::new();
        let mut first = fixture.new_file(1, ChecksumAlg::Crc32);
        let e1 = first.append_query("BEGIN");
        first.append_rotate("mysql-bin.000002");
        write_and_register(&fixture, &first);

        let request = DumpRequest::from_position("mysql-bin.000001", 4)
            .with_checksum(ChecksumAlg::Crc32);
        let (mut replica, handle, join) = start_dumper(&fixture, test_config(), request);

        replica.next_event().await;
        assert_eq!(replica.next_event().await, e1);
        // 실제 ROTATE 는 전달되지 않고 다음 파일이 생길 때까지 대기
        replica.expect_silence(Duration::from_millis(100)).await;

        let mut second = fixture.new_file(2, ChecksumAlg::Crc32);
        let e2 = second.append_query("COMMIT");
        write_and_register(&fixture, &second);

        assert_fake_rotate(
            &replica.next_event().await,
            "mysql-bin.000002",
            ChecksumAlg::Crc32,
        );
        assert_eq!(replica.next_event().await, e2);
        replica.expect_silence(Duration::from_millis(100)).await;
        assert_eq!(handle.info().fake_rotates, 1);

        handle.stop();
        assert_eq!(join.await.unwrap().unwrap(), DumpExit::Stopped);
    }

    async fn dump_by_gtid(fixture: &BinlogFixture, applied: &GtidSet) -> Vec<Vec<u8>> {
        let request = DumpRequest::from_gtid(applied.clone()).with_non_blocking(true);
        let (mut replica, _handle, join) = start_dumper(fixture, test_config(), request);
        let events = replica.drain_until_eof().await;
        assert_eq!(join.await.unwrap().unwrap(), DumpExit::Completed);
        events
    }

    #[tokio::test]
    async fn test_gtid_resume_skips_applied_transactions() {
        let a = uuid_a();
        let fixture = BinlogFixture::new();
        let mut file = fixture.new_file(1, ChecksumAlg::Crc32);
        for gno in 1..=3 {
            file.append_transaction(&a, gno);
        }
        fixture.write_all(&file);
        fixture.register(
            &file,
            &GtidSet::new(),
            &GtidSet::parse(&format!("{}:1-3", a)).unwrap(),
        );

        let applied = GtidSet::parse(&format!("{}:1-2", a)).unwrap();
        let first = dump_by_gtid(&fixture, &applied).await;
        let second = dump_by_gtid(&fixture, &applied).await;
        assert_eq!(first, second);

        // FDE + 트랜잭션 3 (GTID, BEGIN, row, XID)
        assert_eq!(first.len(), 5);
        assert_eq!(BinlogParser::fde_checksum_alg(&first[0]).unwrap(), ChecksumAlg::Off);
        let gtid_event = RawEvent::from_bytes(0, first[1].clone()).unwrap();
        let gtid = BinlogParser::parse_gtid_event(gtid_event.payload(ChecksumAlg::Off)).unwrap();
        assert_eq!(gtid.gno, 3);

        // 빈 집합이면 전부
        let everything = dump_by_gtid(&fixture, &GtidSet::new()).await;
        assert_eq!(everything.len(), 1 + 3 * 4);
    }

    #[tokio::test]
    async fn test_unknown_gtid_rejected() {
        let a = uuid_a();
        let fixture = BinlogFixture::new();
        let mut file = fixture.new_file(1, ChecksumAlg::Off);
        file.append_transaction(&a, 1);
        fixture.write_all(&file);
        fixture.register(
            &file,
            &GtidSet::new(),
            &GtidSet::parse(&format!("{}:1", a)).unwrap(),
        );

        let request = DumpRequest::from_gtid(GtidSet::parse(&format!("{}:1-10", a)).unwrap());
        let (mut replica, handle, join) = start_dumper(&fixture, test_config(), request);

        assert!(is_error_packet(&replica.next_packet().await));
        let err = join.await.unwrap().unwrap_err();
        assert!(matches!(err, CdcError::InvalidRequestedGtid(_)));
        assert_eq!(handle.state(), DumpState::Terminated);
    }

    #[tokio::test]
    async fn test_bad_start_positions_rejected() {
        let fixture = BinlogFixture::new();
        let mut file = fixture.new_file(1, ChecksumAlg::Off);
        file.append_query("BEGIN");
        write_and_register(&fixture, &file);

        let request = DumpRequest::from_position("mysql-bin.000009", 4);
        let (mut replica, _handle, join) = start_dumper(&fixture, test_config(), request);
        assert!(is_error_packet(&replica.next_packet().await));
        assert!(matches!(
            join.await.unwrap().unwrap_err(),
            CdcError::FileNotFound(_)
        ));

        let misaligned = file.boundaries()[1] + 1;
        let request = DumpRequest::from_position(file.name.as_str(), misaligned);
        let (mut replica, _handle, join) = start_dumper(&fixture, test_config(), request);
        assert!(is_error_packet(&replica.next_packet().await));
        assert!(matches!(
            join.await.unwrap().unwrap_err(),
            CdcError::MisalignedPosition { .. }
        ));
    }

    #[tokio::test]
    async fn test_mid_file_start_masks_fde_position() {
        let fixture = BinlogFixture::new();
        let mut file = fixture.new_file(1, ChecksumAlg::Off);
        file.append_query("BEGIN");
        let e2 = file.append_rows(64);
        write_and_register(&fixture, &file);

        let start = file.boundaries()[2];
        let request = DumpRequest::from_position(file.name.as_str(), start).with_non_blocking(true);
        let (mut replica, _handle, join) = start_dumper(&fixture, test_config(), request);

        let events = replica.drain_until_eof().await;
        assert_eq!(events.len(), 2);
        assert_eq!(EventHeader::parse(&events[0]).unwrap().next_pos, 0);
        assert_eq!(events[1], e2);
        assert_eq!(join.await.unwrap().unwrap(), DumpExit::Completed);
    }

    #[tokio::test]
    async fn test_waits_for_file_that_has_not_started() {
        let fixture = BinlogFixture::new();
        let file = fixture.new_file(1, ChecksumAlg::Off);
        // 매직만 쓰인 상태
        fixture.write_partial(&file, 0);
        fixture.register(&file, &GtidSet::new(), &GtidSet::new());

        let request = DumpRequest::from_position("", 4);
        let (mut replica, handle, join) = start_dumper(&fixture, test_config(), request);
        replica.expect_silence(Duration::from_millis(100)).await;
        assert_eq!(handle.state(), DumpState::ResolvingStart);

        fixture.write_all(&file);
        assert_eq!(replica.next_event().await, file.events()[0]);

        handle.stop();
        assert_eq!(join.await.unwrap().unwrap(), DumpExit::Stopped);
    }

    #[tokio::test]
    async fn test_heartbeat_while_idle() {
        let fixture = BinlogFixture::new();
        let file = fixture.new_file(1, ChecksumAlg::Off);
        write_and_register(&fixture, &file);

        let request = DumpRequest::from_position("", 4)
            .with_heartbeat_period(Some(Duration::from_millis(30)));
        let (mut replica, handle, join) = start_dumper(&fixture, test_config(), request);

        replica.next_event().await;
        let heartbeat = RawEvent::from_bytes(0, replica.next_event().await).unwrap();
        assert_eq!(heartbeat.event_type(), EventType::HeartbeatEvent);
        assert_eq!(heartbeat.header.next_pos as u64, file.len());
        assert_eq!(heartbeat.payload(ChecksumAlg::Off), file.name.as_bytes());

        let info = handle.info();
        assert!(info.heartbeats >= 1);
        // heartbeat 는 체크포인트를 움직이지 않음
        assert_eq!(info.checkpoint, BinlogPosition::new(file.name.as_str(), file.len()));

        handle.stop();
        assert_eq!(join.await.unwrap().unwrap(), DumpExit::Stopped);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_unblocks_wait() {
        let fixture = BinlogFixture::new();
        let file = fixture.new_file(1, ChecksumAlg::Off);
        write_and_register(&fixture, &file);

        let config = DumperConfig {
            poll_interval: Duration::from_secs(30),
            liveness_check_interval: Duration::from_secs(30),
            ..test_config()
        };
        let request = DumpRequest::from_position("", 4);
        let (mut replica, handle, join) = start_dumper(&fixture, config, request);
        replica.next_event().await;

        handle.stop();
        handle.stop();
        assert!(handle.is_stopped());
        let exit = tokio::time::timeout(Duration::from_secs(1), join).await;
        assert_eq!(exit.unwrap().unwrap().unwrap(), DumpExit::Stopped);
        handle.stop();
        assert_eq!(handle.state(), DumpState::Terminated);
    }

    #[tokio::test]
    async fn test_peer_loss_terminates_silently() {
        let fixture = BinlogFixture::new();
        let file = fixture.new_file(1, ChecksumAlg::Off);
        write_and_register(&fixture, &file);

        let (mut replica, handle, join) =
            start_dumper(&fixture, test_config(), DumpRequest::from_position("", 4));
        replica.next_event().await;
        drop(replica);

        let exit = tokio::time::timeout(Duration::from_secs(2), join).await;
        assert_eq!(exit.unwrap().unwrap().unwrap(), DumpExit::PeerLost);
        assert_eq!(handle.state(), DumpState::Terminated);
    }

    #[tokio::test]
    async fn test_rate_limit_delays_without_dropping() {
        let fixture = BinlogFixture::new();
        let mut file = fixture.new_file(1, ChecksumAlg::Off);
        for _ in 0..7 {
            file.append_rows(50);
        }
        write_and_register(&fixture, &file);

        let config = DumperConfig {
            max_events_per_sec: 5,
            ..test_config()
        };
        let request = DumpRequest::from_position("", 4).with_non_blocking(true);
        let started = std::time::Instant::now();
        let (mut replica, handle, join) = start_dumper(&fixture, config, request);

        let events = replica.drain_until_eof().await;
        assert_eq!(events, file.events());
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert!(handle.info().throttled_sends >= 3);
        assert_eq!(join.await.unwrap().unwrap(), DumpExit::Completed);
    }

    #[tokio::test]
    async fn test_dump_info_serializes() {
        let fixture = BinlogFixture::new();
        let file = fixture.new_file(1, ChecksumAlg::Off);
        write_and_register(&fixture, &file);

        let request = DumpRequest::from_position("", 4).with_non_blocking(true);
        let (mut replica, handle, join) = start_dumper(&fixture, test_config(), request);
        replica.drain_until_eof().await;
        join.await.unwrap().unwrap();

        let value = serde_json::to_value(handle.info()).unwrap();
        assert_eq!(value["state"], "terminated");
        assert_eq!(value["checkpoint"]["position"], file.len());
        assert_eq!(value["peer"], "10.0.0.7:51234");
    }

    fn stalled_file(fixture: &BinlogFixture) -> FixtureFile {
        let mut file = fixture.new_file(1, ChecksumAlg::Off);
        for _ in 0..20 {
            file.append_rows(200);
        }
        write_and_register(fixture, &file);
        file
    }

    #[tokio::test]
    async fn test_stop_unblocks_write_to_replica_that_stopped_reading() {
        let fixture = BinlogFixture::new();
        stalled_file(&fixture);

        let request = DumpRequest::from_position("", 4);
        let (_replica, handle, join) =
            start_dumper_with(&fixture, test_config(), request, 256, |dumper| dumper);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(handle.state(), DumpState::Streaming);
        assert!(handle.info().events_sent < 21);

        handle.stop();
        let exit = tokio::time::timeout(Duration::from_secs(3), join).await;
        assert_eq!(exit.unwrap().unwrap().unwrap(), DumpExit::Stopped);
        assert_eq!(handle.state(), DumpState::Terminated);
    }

    #[tokio::test]
    async fn test_write_timeout_drops_replica_that_stopped_reading() {
        let fixture = BinlogFixture::new();
        stalled_file(&fixture);

        let config = DumperConfig {
            write_timeout: Duration::from_millis(100),
            ..test_config()
        };
        let request = DumpRequest::from_position("", 4);
        let (_replica, handle, join) =
            start_dumper_with(&fixture, config, request, 256, |dumper| dumper);

        let exit = tokio::time::timeout(Duration::from_secs(3), join).await;
        assert_eq!(exit.unwrap().unwrap().unwrap(), DumpExit::PeerLost);
        assert!(!handle.is_stopped());
    }

    #[tokio::test]
    async fn test_ingest_failure_terminates_tailing_session() {
        let fixture = BinlogFixture::new();
        let file = fixture.new_file(1, ChecksumAlg::Off);
        write_and_register(&fixture, &file);

        let (status_tx, status_rx) = watch::channel(IngestStatus::Running);
        let request = DumpRequest::from_position("", 4);
        let (mut replica, handle, join) =
            start_dumper_with(&fixture, test_config(), request, 1 << 16, |dumper| {
                dumper.with_ingest_status(status_rx)
            });
        replica.next_event().await;

        // 정상 중단은 세션에 영향 없음
        status_tx.send_replace(IngestStatus::Stopped);
        replica.expect_silence(Duration::from_millis(100)).await;
        assert_eq!(handle.state(), DumpState::Streaming);

        status_tx.send_replace(IngestStatus::Failed("source gone".to_string()));
        let packet = replica.next_packet().await;
        assert!(is_error_packet(&packet));
        assert_eq!(u16::from_le_bytes([packet[1], packet[2]]), 1236);

        let err = join.await.unwrap().unwrap_err();
        assert!(matches!(err, CdcError::SourceFatal(reason) if reason == "source gone"));
        assert_eq!(handle.state(), DumpState::Terminated);
    }
}
