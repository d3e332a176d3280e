//! Binlog 덤프 서버
//!
//! `BINLOG_DIR` 의 binlog 파일을 MySQL 복제 프로토콜로 복제본에 스트리밍합니다.
//! 설정은 `BINLOG_*` 환경 변수로 받습니다.

use binlog_dumper::config::ServerConfig;
use binlog_dumper::session::ReplicaSession;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// 종료 시 세션들이 덤프를 정리할 시간
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 초기화
    tracing_subscriber::fmt::init();

    let config = ServerConfig::from_env();
    info!(
        "Serving {}.* from {}",
        config.binlog.file_prefix,
        config.binlog.binlog_dir.display()
    );

    let listener = TcpListener::bind(&config.listen_addr).await?;
    info!("Listening for replicas on {}", config.listen_addr);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut sessions = JoinSet::new();
    let mut thread_id: u32 = 0;

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, addr) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        continue;
                    }
                };
                if let Err(e) = stream.set_nodelay(true) {
                    warn!("Failed to set TCP_NODELAY for {}: {}", addr, e);
                }

                thread_id = thread_id.wrapping_add(1);
                let session = match ReplicaSession::new(stream, &config, addr.to_string(), thread_id) {
                    Ok(session) => session.with_shutdown(shutdown_rx.clone()),
                    Err(e) => {
                        error!("Failed to create session for {}: {}", addr, e);
                        continue;
                    }
                };

                sessions.spawn(async move {
                    match session.run().await {
                        Ok(end) => info!("Session {} ended: {:?}", addr, end),
                        Err(e) => error!("Session {} failed: {}", addr, e),
                    }
                });
            }
            Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                if let Err(e) = joined {
                    error!("Session task panicked: {}", e);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down, stopping {} session(s)", sessions.len());
                shutdown_tx.send_replace(true);
                break;
            }
        }
    }

    let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
        while sessions.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!("Aborting {} session(s) still running", sessions.len());
        sessions.shutdown().await;
    }

    Ok(())
}
