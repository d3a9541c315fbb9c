//! 용량별 버퍼 풀
//!
//! - `Pool`: 같은 용량의 버퍼를 재사용하는 풀 (용량별 프로세스 단일 인스턴스)
//! - `BufItem`: 풀에서 빌린 고정 크기 버퍼. 읽기 커서(`start`)와 유효 길이(`size`)를 가진다.
//!
//! 버퍼는 단일 소유 값이다. 큐에 넣으면 소유권이 넘어가고, drop 되면 풀로 돌아간다.
//! 복제가 필요하면 [`BufItem::copy`]를 명시적으로 호출한다.

use std::any::Any;
use std::fmt;
use std::sync::{Arc, OnceLock};

use crossbeam_channel::{Receiver, Sender};
use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{Error, Result, DATA_BUF_SIZE};

/// 버퍼 메타데이터 (복제 시 얕은 참조 공유)
pub type MetaData = Arc<dyn Any + Send + Sync>;

static POOLS: OnceLock<DashMap<usize, Arc<Pool>>> = OnceLock::new();

/// 고정 용량 버퍼 풀
pub struct Pool {
    /// 버퍼 용량
    size: usize,

    /// 유휴 버퍼 목록
    free_tx: Sender<Box<[u8]>>,
    free_rx: Receiver<Box<[u8]>>,
}

impl Pool {
    /// 레지스트리에 등록되지 않은 독립 풀 생성
    pub fn new(size: usize) -> Arc<Self> {
        let (free_tx, free_rx) = crossbeam_channel::unbounded();
        Arc::new(Self {
            size,
            free_tx,
            free_rx,
        })
    }

    /// 용량별 공유 풀 (최초 호출 시 생성, 프로세스 종료까지 유지)
    pub fn shared(size: usize) -> Arc<Self> {
        POOLS
            .get_or_init(DashMap::new)
            .entry(size)
            .or_insert_with(|| Self::new(size))
            .clone()
    }

    /// 데이터 프레임용 공유 풀
    pub fn data() -> Arc<Self> {
        Self::shared(DATA_BUF_SIZE)
    }

    /// 버퍼 용량
    pub fn capacity(&self) -> usize {
        self.size
    }

    /// 유휴 버퍼 수
    pub fn idle(&self) -> usize {
        self.free_rx.len()
    }

    /// 버퍼 가져오기 (유휴 버퍼가 없으면 새로 할당)
    pub fn get(self: &Arc<Self>) -> BufItem {
        let data = self
            .free_rx
            .try_recv()
            .unwrap_or_else(|_| vec![0u8; self.size].into_boxed_slice());

        BufItem {
            pool: self.clone(),
            data,
            start: 0,
            size: 0,
            meta: None,
        }
    }

    /// 버퍼 반환
    ///
    /// 다른 풀에서 온 버퍼면 `PoolMismatch`. 이 경우에도 버퍼는 원래 풀로 돌아간다.
    pub fn put(&self, item: BufItem) -> Result<()> {
        if item.cap() != self.size || !std::ptr::eq(Arc::as_ptr(&item.pool), self) {
            return Err(Error::PoolMismatch {
                buf_cap: item.cap(),
                pool_cap: self.size,
            });
        }
        drop(item);
        Ok(())
    }

    fn recycle(&self, data: Box<[u8]>) {
        if data.len() == self.size {
            let _ = self.free_tx.send(data);
        }
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("size", &self.size)
            .field("idle", &self.idle())
            .finish()
    }
}

/// 풀에서 빌린 버퍼
///
/// 불변식: `start + size <= cap()`
pub struct BufItem {
    pool: Arc<Pool>,
    data: Box<[u8]>,
    start: usize,
    size: usize,
    meta: Option<MetaData>,
}

impl BufItem {
    /// 버퍼 용량
    pub fn cap(&self) -> usize {
        self.data.len()
    }

    /// 읽기 커서 위치
    pub fn start(&self) -> usize {
        self.start
    }

    /// 유효 데이터 길이
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// 뒤쪽 여유 공간
    pub fn free_space(&self) -> usize {
        self.cap() - self.start - self.size
    }

    /// 유효 데이터
    pub fn data(&self) -> &[u8] {
        &self.data[self.start..self.start + self.size]
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.start..self.start + self.size]
    }

    /// 소속 풀
    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    pub fn set_meta(&mut self, meta: MetaData) {
        self.meta = Some(meta);
    }

    pub fn meta(&self) -> Option<&MetaData> {
        self.meta.as_ref()
    }

    /// 데이터 뒤에 추가 (공간 부족 시 잘라내지 않고 실패)
    pub fn append(&mut self, data: &[u8]) -> Result<&mut Self> {
        if data.len() > self.free_space() {
            return Err(Error::BufferOverflow {
                need: data.len(),
                free: self.free_space(),
            });
        }
        let end = self.start + self.size;
        self.data[end..end + data.len()].copy_from_slice(data);
        self.size += data.len();
        Ok(self)
    }

    /// 빅엔디언 u32 추가
    pub fn append_u32(&mut self, n: u32) -> Result<&mut Self> {
        self.append(&n.to_be_bytes())
    }

    /// 앞에서부터 읽어 소비
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.size);
        buf[..n].copy_from_slice(&self.data[self.start..self.start + n]);
        self.start += n;
        self.size -= n;
        n
    }

    /// 앞의 빅엔디언 u32를 소비
    pub fn read_u32(&mut self) -> Option<u32> {
        let n = self.peek_u32()?;
        self.start += 4;
        self.size -= 4;
        Some(n)
    }

    /// 앞의 빅엔디언 u32 (소비하지 않음)
    pub fn peek_u32(&self) -> Option<u32> {
        let head: [u8; 4] = self.data().get(..4)?.try_into().ok()?;
        Some(u32::from_be_bytes(head))
    }

    /// 리더에서 정확히 `n` 바이트를 읽어 버퍼 내용을 교체
    pub async fn read_n_from<R>(&mut self, src: &mut R, n: usize) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        if n > self.cap() {
            return Err(Error::BufferOverflow {
                need: n,
                free: self.cap(),
            });
        }
        self.start = 0;
        self.size = 0;
        src.read_exact(&mut self.data[..n]).await?;
        self.size = n;
        Ok(())
    }

    /// 리더에서 정확히 `n` 바이트를 읽어 뒤에 추가
    pub async fn append_n_from<R>(&mut self, src: &mut R, n: usize) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        if n > self.free_space() {
            return Err(Error::BufferOverflow {
                need: n,
                free: self.free_space(),
            });
        }
        let end = self.start + self.size;
        src.read_exact(&mut self.data[end..end + n]).await?;
        self.size += n;
        Ok(())
    }

    /// 리더에서 한 번 읽어 버퍼 내용을 교체
    pub async fn read_from<R>(&mut self, src: &mut R) -> Result<usize>
    where
        R: AsyncRead + Unpin,
    {
        self.start = 0;
        self.size = 0;
        let n = src.read(&mut self.data).await?;
        self.size = n;
        Ok(n)
    }

    /// 같은 풀에서 새 버퍼를 받아 유효 데이터와 메타데이터를 복제
    pub fn copy(&self) -> BufItem {
        let mut item = self.pool.get();
        item.data[..self.size].copy_from_slice(self.data());
        item.size = self.size;
        item.meta = self.meta.clone();
        item
    }

    /// 커서/길이/메타데이터 초기화
    pub fn reset(&mut self) -> &mut Self {
        self.start = 0;
        self.size = 0;
        self.meta = None;
        self
    }

    /// 초기화 후 데이터 채우기
    pub fn reset_with_data(&mut self, data: &[u8]) -> Result<&mut Self> {
        self.reset();
        self.append(data)
    }

    /// 풀로 반환 (drop과 동일)
    pub fn release(self) {}
}

impl Drop for BufItem {
    fn drop(&mut self) {
        let data = std::mem::take(&mut self.data);
        self.pool.recycle(data);
    }
}

impl fmt::Debug for BufItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufItem")
            .field("cap", &self.cap())
            .field("start", &self.start)
            .field("size", &self.size)
            .field("meta", &self.meta.is_some())
            .finish()
    }
}
