//! 커맨드 버스
//!
//! 링크가 디코딩한 인바운드 커맨드를 구독자(터널, 로그인 대기자 등)에게 분배한다.
//! 세션마다 하나를 만들어 `Arc`로 공유한다.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use crate::command::{Command, CommandType};

struct Subscriber {
    types: Vec<CommandType>,
    tx: mpsc::Sender<Command>,
}

/// 커맨드 발행/구독 레지스트리
#[derive(Default)]
pub struct CommandBus {
    subscribers: RwLock<HashMap<u64, Subscriber>>,
    next_id: AtomicU64,
}

impl CommandBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 타입 필터로 구독 (빈 목록이면 모든 타입)
    pub fn subscribe(self: &Arc<Self>, types: &[CommandType], capacity: usize) -> Subscription {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.write().insert(
            id,
            Subscriber {
                types: types.to_vec(),
                tx,
            },
        );

        Subscription {
            id,
            bus: self.clone(),
            rx,
        }
    }

    /// 커맨드 발행. 전달된 구독자 수를 반환한다.
    ///
    /// 큐가 가득 찬 구독자에게는 버린다 (다른 구독자에게는 영향 없음).
    pub fn publish(&self, command: Command) -> usize {
        let ty = command.command_type();
        let subscribers = self.subscribers.read();
        let mut delivered = 0;

        for (id, sub) in subscribers.iter() {
            if !sub.types.is_empty() && !sub.types.contains(&ty) {
                continue;
            }
            match sub.tx.try_send(command.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!("구독자 {} 큐 가득 참, {:?} 버림", id, ty);
                }
                Err(TrySendError::Closed(_)) => {}
            }
        }

        if delivered == 0 {
            debug!("{:?} 구독자 없음", ty);
        }
        delivered
    }

    /// 현재 구독자 수
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    fn unsubscribe(&self, id: u64) {
        self.subscribers.write().remove(&id);
    }
}

/// 구독 핸들 (drop 시 구독 해제)
pub struct Subscription {
    id: u64,
    bus: Arc<CommandBus>,
    rx: mpsc::Receiver<Command>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<Command> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Command> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.id);
    }
}
