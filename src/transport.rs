//! 세션 데이터 경로 조립
//!
//! 어댑터 → Duplicater → 터널들 → 링크들 (송신), 링크들 → 공용 수신 큐 → 어댑터 (수신)

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::bus::CommandBus;
use crate::command::{Command, CommandCodec};
use crate::config::Config;
use crate::datagram::ReliableStreamAdapter;
use crate::duplicater::Duplicater;
use crate::link::shared_receiver;
use crate::stats::PathStats;
use crate::tunnel::{Tunnel, TunnelRegistry, TunnelShared};
use crate::{ClientId, TunnelId, UNREACHABLE_RTT_MS};

/// 링크가 있는 터널 중 최소 실효 RTT
pub fn best_rtt(tunnels: &[Arc<Tunnel>]) -> u64 {
    tunnels
        .iter()
        .filter(|t| t.link_count() > 0)
        .map(|t| t.effective_rtt())
        .min()
        .unwrap_or(UNREACHABLE_RTT_MS)
}

/// 세션 하나의 전송 경로
pub struct Transport {
    shared: TunnelShared,
    registry: Arc<TunnelRegistry>,
    duplicater: Arc<Duplicater>,
    stats: Arc<PathStats>,
}

impl Transport {
    /// 큐와 Duplicater를 만들고 외부 엔진용 어댑터를 함께 반환
    pub fn new(
        client_id: ClientId,
        bus: Arc<CommandBus>,
        codec: Arc<CommandCodec>,
        config: &Config,
        parent: &CancellationToken,
    ) -> (Self, ReliableStreamAdapter) {
        let shutdown = parent.child_token();
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_queue_size);
        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_queue_size);
        let (fallback_tx, fallback_rx) = mpsc::channel(config.fallback_queue_size);

        let stats = Arc::new(PathStats::new());
        let registry = TunnelRegistry::new();
        let duplicater = Duplicater::spawn(
            registry.clone(),
            outbound_rx,
            fallback_tx,
            stats.clone(),
            config,
            shutdown.clone(),
        );

        let shared = TunnelShared {
            client_id,
            inbound: inbound_tx,
            fallback: shared_receiver(fallback_rx),
            bus,
            codec,
            config: config.clone(),
            shutdown,
        };
        let adapter = ReliableStreamAdapter::new(outbound_tx, inbound_rx, stats.clone());

        (
            Self {
                shared,
                registry,
                duplicater,
                stats,
            },
            adapter,
        )
    }

    /// 터널 조회 (없으면 생성)
    pub fn tunnel(&self, id: TunnelId) -> Arc<Tunnel> {
        self.registry
            .get_or_insert_with(id, || Tunnel::new(id, &self.shared))
    }

    pub fn client_id(&self) -> ClientId {
        self.shared.client_id
    }

    pub fn registry(&self) -> &Arc<TunnelRegistry> {
        &self.registry
    }

    pub fn duplicater(&self) -> &Arc<Duplicater> {
        &self.duplicater
    }

    pub fn stats(&self) -> &Arc<PathStats> {
        &self.stats
    }

    pub fn bus(&self) -> &Arc<CommandBus> {
        &self.shared.bus
    }

    pub fn codec(&self) -> &Arc<CommandCodec> {
        &self.shared.codec
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shared.shutdown
    }

    /// 생존 터널 중 최소 RTT (없으면 센티널)
    pub fn best_rtt(&self) -> u64 {
        best_rtt(&self.registry.snapshot().1)
    }

    /// 모든 터널로 커맨드 전송
    pub fn broadcast(&self, command: &Command) -> usize {
        self.registry.broadcast(command)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }

    pub async fn closed(&self) {
        self.shared.shutdown.cancelled().await
    }

    /// 전체 종료
    pub fn close(&self) {
        self.shared.shutdown.cancel();
        self.registry.close_all();
    }
}
