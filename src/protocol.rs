//! MySQL 프로토콜 패킷 처리 (서버 측)
//!
//! 패킷: [payload length 3][sequence 1][payload]
//! 16MB 이상의 payload 는 여러 패킷으로 나뉘어 전송됩니다.

use crate::error::{CdcError, Result};
use byteorder::{LittleEndian, WriteBytesExt};
use std::io::{ErrorKind, Write};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tracing::debug;

/// 한 패킷의 최대 payload 길이
pub const MAX_PACKET_LENGTH: usize = 0xFF_FFFF;

const OK_HEADER: u8 = 0x00;
const EOF_HEADER: u8 = 0xFE;
const ERR_HEADER: u8 = 0xFF;
const SERVER_STATUS_AUTOCOMMIT: u16 = 0x0002;
const NULL_COLUMN: u8 = 0xFB;
const MYSQL_TYPE_VAR_STRING: u8 = 0xFD;
const UTF8_GENERAL_CI: u16 = 33;

const CLIENT_LONG_PASSWORD: u32 = 0x0000_0001;
const CLIENT_LONG_FLAG: u32 = 0x0000_0004;
const CLIENT_CONNECT_WITH_DB: u32 = 0x0000_0008;
pub const CLIENT_PROTOCOL_41: u32 = 0x0000_0200;
const CLIENT_TRANSACTIONS: u32 = 0x0000_2000;
const CLIENT_SECURE_CONNECTION: u32 = 0x0000_8000;
const CLIENT_PLUGIN_AUTH: u32 = 0x0008_0000;

/// MySQL 패킷 채널
pub struct PacketChannel<S> {
    stream: S,
    sequence: u8,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> PacketChannel<S> {
    pub fn new(stream: S) -> Self {
        PacketChannel {
            stream,
            sequence: 0,
        }
    }

    /// 새 명령 시작 시 시퀀스 초기화
    pub fn reset_sequence(&mut self) {
        self.sequence = 0;
    }

    pub fn sequence(&self) -> u8 {
        self.sequence
    }

    /// 패킷 읽기. 응답은 받은 시퀀스 다음 번호로 이어집니다.
    pub async fn read_packet(&mut self) -> Result<Vec<u8>> {
        let mut payload = Vec::new();

        loop {
            // 패킷 헤더 읽기 (3 bytes length + 1 byte sequence)
            let mut header = [0u8; 4];
            self.stream.read_exact(&mut header).await.map_err(map_read_error)?;
            let length = u32::from_le_bytes([header[0], header[1], header[2], 0]) as usize;
            self.sequence = header[3].wrapping_add(1);

            let start = payload.len();
            payload.resize(start + length, 0);
            self.stream
                .read_exact(&mut payload[start..])
                .await
                .map_err(map_read_error)?;

            if length < MAX_PACKET_LENGTH {
                break;
            }
        }

        Ok(payload)
    }

    /// 패킷 쓰기 (시퀀스 자동 증가)
    pub async fn write_packet(&mut self, data: &[u8]) -> Result<()> {
        let mut buffer = Vec::with_capacity(data.len() + 4);
        let mut last_len = 0;

        for chunk in data.chunks(MAX_PACKET_LENGTH) {
            self.append_frame(&mut buffer, chunk)?;
            last_len = chunk.len();
        }
        // 빈 payload 이거나 길이가 최대 길이의 배수면 빈 패킷으로 끝을 알림
        if data.is_empty() || last_len == MAX_PACKET_LENGTH {
            self.append_frame(&mut buffer, &[])?;
        }

        use tokio::io::AsyncWriteExt;

        self.stream.write_all(&buffer).await.map_err(map_write_error)?;
        self.stream.flush().await.map_err(map_write_error)?;

        Ok(())
    }

    fn append_frame(&mut self, buffer: &mut Vec<u8>, chunk: &[u8]) -> Result<()> {
        buffer.write_u24::<LittleEndian>(chunk.len() as u32)?;
        buffer.write_u8(self.sequence)?;
        buffer.write_all(chunk)?;
        self.sequence = self.sequence.wrapping_add(1);
        Ok(())
    }

    pub async fn write_ok(&mut self) -> Result<()> {
        let mut packet = Vec::with_capacity(7);
        packet.write_u8(OK_HEADER)?;
        // affected rows, last insert id (length-encoded 0)
        packet.write_u8(0)?;
        packet.write_u8(0)?;
        packet.write_u16::<LittleEndian>(SERVER_STATUS_AUTOCOMMIT)?;
        packet.write_u16::<LittleEndian>(0)?;
        self.write_packet(&packet).await
    }

    pub async fn write_error(&mut self, code: u16, sql_state: &str, message: &str) -> Result<()> {
        let mut packet = Vec::with_capacity(9 + message.len());
        packet.write_u8(ERR_HEADER)?;
        packet.write_u16::<LittleEndian>(code)?;
        packet.write_u8(b'#')?;
        let mut state = [b'0'; 5];
        let len = sql_state.len().min(5);
        state[..len].copy_from_slice(&sql_state.as_bytes()[..len]);
        packet.write_all(&state)?;
        packet.write_all(message.as_bytes())?;

        debug!("Sending error packet: {} ({})", code, message);
        self.write_packet(&packet).await
    }

    pub async fn write_eof(&mut self) -> Result<()> {
        let mut packet = Vec::with_capacity(5);
        packet.write_u8(EOF_HEADER)?;
        packet.write_u16::<LittleEndian>(0)?;
        packet.write_u16::<LittleEndian>(SERVER_STATUS_AUTOCOMMIT)?;
        self.write_packet(&packet).await
    }

    /// 컬럼 하나, 행 하나짜리 텍스트 결과셋 (변수 조회 응답)
    pub async fn write_single_value(&mut self, column: &str, value: Option<&str>) -> Result<()> {
        self.write_packet(&[1]).await?;

        let mut definition = Vec::with_capacity(32 + 2 * column.len());
        write_lenenc_str(&mut definition, "def")?;
        // schema, table, org_table
        for _ in 0..3 {
            write_lenenc_str(&mut definition, "")?;
        }
        write_lenenc_str(&mut definition, column)?;
        write_lenenc_str(&mut definition, column)?;
        definition.write_u8(0x0c)?;
        definition.write_u16::<LittleEndian>(UTF8_GENERAL_CI)?;
        definition.write_u32::<LittleEndian>(255)?;
        definition.write_u8(MYSQL_TYPE_VAR_STRING)?;
        definition.write_u16::<LittleEndian>(0)?;
        definition.write_u8(0)?;
        definition.write_u16::<LittleEndian>(0)?;
        self.write_packet(&definition).await?;
        self.write_eof().await?;

        let mut row = Vec::new();
        match value {
            Some(value) => write_lenenc_str(&mut row, value)?,
            None => row.write_u8(NULL_COLUMN)?,
        }
        self.write_packet(&row).await?;
        self.write_eof().await
    }

    /// binlog 이벤트 전송 (OK 바이트 0x00 + 이벤트)
    pub async fn write_event(&mut self, event: &[u8]) -> Result<()> {
        let mut packet = Vec::with_capacity(event.len() + 1);
        packet.push(OK_HEADER);
        packet.extend_from_slice(event);
        self.write_packet(&packet).await
    }

    /// 피어 생존 확인
    ///
    /// 덤프 중 복제본은 아무것도 보내지 않으므로 `wait` 안에 읽기가 끝나지 않으면 살아있는 것으로 봅니다.
    /// 연결이 닫혔거나(EOF) I/O 에러면 `PeerLivenessLost`.
    pub async fn probe_alive(&mut self, wait: Duration) -> Result<()> {
        let mut byte = [0u8; 1];
        match tokio::time::timeout(wait, self.stream.read(&mut byte)).await {
            Err(_) => Ok(()),
            Ok(Ok(0)) => Err(CdcError::PeerLivenessLost),
            Ok(Ok(_)) => {
                debug!("Ignoring unexpected byte from peer during dump");
                Ok(())
            }
            Ok(Err(e)) => {
                debug!("Liveness probe failed: {}", e);
                Err(CdcError::PeerLivenessLost)
            }
        }
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        tokio::io::AsyncWriteExt::shutdown(&mut self.stream).await?;
        Ok(())
    }
}

fn is_disconnect(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::UnexpectedEof
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
    )
}

fn map_read_error(err: std::io::Error) -> CdcError {
    if is_disconnect(&err) {
        return CdcError::PeerLivenessLost;
    }
    CdcError::IoError(format!("Failed to read packet: {}", err))
}

fn map_write_error(err: std::io::Error) -> CdcError {
    if is_disconnect(&err) {
        return CdcError::PeerLivenessLost;
    }
    CdcError::IoError(format!("Failed to write packet: {}", err))
}

/// 서버 Greeting 패킷 (Protocol::HandshakeV10)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GreetingPacket {
    pub protocol_version: u8,
    pub server_version: String,
    pub thread_id: u32,
    pub scramble: Vec<u8>,
    pub server_capabilities: u32,
    pub server_collation: u8,
    pub server_status: u16,
}

impl GreetingPacket {
    pub fn new(server_version: &str, thread_id: u32) -> Self {
        // 20 바이트 출력 가능한 문자 scramble
        let mut scramble = Vec::with_capacity(20);
        scramble.extend_from_slice(uuid::Uuid::new_v4().as_bytes());
        scramble.extend_from_slice(&uuid::Uuid::new_v4().as_bytes()[..4]);
        for byte in scramble.iter_mut() {
            *byte = *byte % 94 + 33;
        }

        GreetingPacket {
            protocol_version: 10,
            server_version: server_version.to_string(),
            thread_id,
            scramble,
            server_capabilities: CLIENT_LONG_PASSWORD
                | CLIENT_LONG_FLAG
                | CLIENT_CONNECT_WITH_DB
                | CLIENT_PROTOCOL_41
                | CLIENT_TRANSACTIONS
                | CLIENT_SECURE_CONNECTION
                | CLIENT_PLUGIN_AUTH,
            server_collation: 33,
            server_status: SERVER_STATUS_AUTOCOMMIT,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        buffer.write_u8(self.protocol_version)?;
        buffer.write_all(self.server_version.as_bytes())?;
        buffer.write_u8(0)?;
        buffer.write_u32::<LittleEndian>(self.thread_id)?;

        let split = self.scramble.len().min(8);
        let mut part1 = [0u8; 8];
        part1[..split].copy_from_slice(&self.scramble[..split]);
        buffer.write_all(&part1)?;
        buffer.write_u8(0)?;

        buffer.write_u16::<LittleEndian>(self.server_capabilities as u16)?;
        buffer.write_u8(self.server_collation)?;
        buffer.write_u16::<LittleEndian>(self.server_status)?;
        buffer.write_u16::<LittleEndian>((self.server_capabilities >> 16) as u16)?;
        buffer.write_u8((self.scramble.len() + 1) as u8)?;
        buffer.write_all(&[0u8; 10])?;

        // part 2 는 최소 13 바이트 (null 포함)
        let mut part2 = self.scramble[split..].to_vec();
        part2.resize(part2.len().max(12), 0);
        buffer.write_all(&part2)?;
        buffer.write_u8(0)?;
        buffer.write_all(b"mysql_native_password\0")?;

        Ok(buffer)
    }
}

/// length-encoded integer
fn write_lenenc_int(buffer: &mut Vec<u8>, value: u64) -> Result<()> {
    match value {
        0..=250 => buffer.write_u8(value as u8)?,
        251..=0xFFFF => {
            buffer.write_u8(0xFC)?;
            buffer.write_u16::<LittleEndian>(value as u16)?;
        }
        0x1_0000..=0xFF_FFFF => {
            buffer.write_u8(0xFD)?;
            buffer.write_u24::<LittleEndian>(value as u32)?;
        }
        _ => {
            buffer.write_u8(0xFE)?;
            buffer.write_u64::<LittleEndian>(value)?;
        }
    }
    Ok(())
}

fn write_lenenc_str(buffer: &mut Vec<u8>, value: &str) -> Result<()> {
    write_lenenc_int(buffer, value.len() as u64)?;
    buffer.write_all(value.as_bytes())?;
    Ok(())
}

/// Error 패킷 확인
pub fn is_error_packet(data: &[u8]) -> bool {
    !data.is_empty() && data[0] == ERR_HEADER
}

/// OK 패킷 확인
pub fn is_ok_packet(data: &[u8]) -> bool {
    !data.is_empty() && data[0] == OK_HEADER
}

/// EOF 패킷 확인 (0xFE, 길이 < 9)
pub fn is_eof_packet(data: &[u8]) -> bool {
    !data.is_empty() && data[0] == EOF_HEADER && data.len() < 9
}

/// 복제본 쪽에서 본 인사 패킷 해석 (테스트 복제본 전용)
#[cfg(test)]
impl GreetingPacket {
    pub fn parse(data: &[u8]) -> Result<Self> {
        use byteorder::ReadBytesExt;
        use std::io::Read;

        let mut cursor = std::io::Cursor::new(data);

        let protocol_version = ReadBytesExt::read_u8(&mut cursor)
            .map_err(|e| CdcError::ProtocolError(format!("Failed to read protocol version: {}", e)))?;
        let server_version = read_null_terminated_string(&mut cursor)?;
        let thread_id = ReadBytesExt::read_u32::<LittleEndian>(&mut cursor)
            .map_err(|e| CdcError::ProtocolError(format!("Failed to read thread ID: {}", e)))?;

        let mut scramble_part1 = vec![0u8; 8];
        Read::read_exact(&mut cursor, &mut scramble_part1)
            .map_err(|e| CdcError::ProtocolError(format!("Failed to read scramble part 1: {}", e)))?;
        // filler
        ReadBytesExt::read_u8(&mut cursor)
            .map_err(|e| CdcError::ProtocolError(format!("Failed to read filler: {}", e)))?;

        let capabilities_lower = ReadBytesExt::read_u16::<LittleEndian>(&mut cursor)
            .map_err(|e| CdcError::ProtocolError(format!("Failed to read capabilities: {}", e)))?;
        let server_collation = ReadBytesExt::read_u8(&mut cursor)
            .map_err(|e| CdcError::ProtocolError(format!("Failed to read collation: {}", e)))?;
        let server_status = ReadBytesExt::read_u16::<LittleEndian>(&mut cursor)
            .map_err(|e| CdcError::ProtocolError(format!("Failed to read status: {}", e)))?;
        let capabilities_upper = ReadBytesExt::read_u16::<LittleEndian>(&mut cursor)
            .map_err(|e| CdcError::ProtocolError(format!("Failed to read capabilities upper: {}", e)))?;
        let server_capabilities = (capabilities_upper as u32) << 16 | capabilities_lower as u32;

        let auth_data_len = ReadBytesExt::read_u8(&mut cursor)
            .map_err(|e| CdcError::ProtocolError(format!("Failed to read auth data length: {}", e)))?;
        let mut reserved = [0u8; 10];
        Read::read_exact(&mut cursor, &mut reserved)
            .map_err(|e| CdcError::ProtocolError(format!("Failed to read reserved: {}", e)))?;

        let scramble_len = std::cmp::max(13, auth_data_len.saturating_sub(8)) as usize;
        let mut scramble_part2 = vec![0u8; scramble_len];
        Read::read_exact(&mut cursor, &mut scramble_part2)
            .map_err(|e| CdcError::ProtocolError(format!("Failed to read scramble part 2: {}", e)))?;

        let mut scramble = scramble_part1;
        scramble.extend_from_slice(&scramble_part2[..scramble_part2.len() - 1]);

        Ok(GreetingPacket {
            protocol_version,
            server_version,
            thread_id,
            scramble,
            server_capabilities,
            server_collation,
            server_status,
        })
    }
}

#[cfg(test)]
/// null로 끝나는 문자열 읽기
fn read_null_terminated_string<R: std::io::Read>(reader: &mut R) -> Result<String> {
    let mut bytes = Vec::new();
    loop {
        let byte = byteorder::ReadBytesExt::read_u8(reader)
            .map_err(|e| CdcError::ProtocolError(format!("Failed to read string byte: {}", e)))?;
        if byte == 0 {
            break;
        }
        bytes.push(byte);
    }
    String::from_utf8(bytes)
        .map_err(|e| CdcError::ProtocolError(format!("Invalid UTF-8 in string: {}", e)))
}
