//! 会话存储协作方。
//!
//! # 设计背景（Why）
//! - 停止后的 [`Session`] 是不可变值对象，可以交给任意存储；核心只要求取回的会话
//!   仍能被结构等价校验器比较，并不规定存储格式；
//! - [`InMemoryStorage`] 以 JSON 文档保存会话，取回时经历真实的序列化往返
//!   （`started_at` 丢失亚毫秒精度），适合作为测试与单进程部署的默认实现。

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::error::{ProfilerError, Result};
use crate::model::Session;

/// 会话持久化契约。
///
/// # 契约 (What)
/// - `save` 对同一 `id` 覆盖写入；
/// - `load` 对未知 `id` 返回 `Ok(None)`；
/// - `list` 按保存顺序由新到旧返回至多 `limit` 个 ID。
#[async_trait]
pub trait SessionStorage: Send + Sync + 'static {
    async fn save(&self, session: &Session) -> Result<()>;

    async fn load(&self, id: Uuid) -> Result<Option<Session>>;

    async fn list(&self, limit: usize) -> Result<Vec<Uuid>>;
}

/// 进程内 JSON 存储。
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    documents: DashMap<Uuid, String>,
    order: Mutex<Vec<Uuid>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// 便于装配的 `Arc` 形态。
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// 读取原始 JSON 文档。
    pub fn raw(&self, id: Uuid) -> Option<String> {
        self.documents.get(&id).map(|doc| doc.value().clone())
    }
}

#[async_trait]
impl SessionStorage for InMemoryStorage {
    async fn save(&self, session: &Session) -> Result<()> {
        let document = serde_json::to_string(session).map_err(ProfilerError::storage)?;
        if self.documents.insert(session.id, document).is_none() {
            self.order.lock().push(session.id);
        }
        tracing::debug!(session = %session.id, "session saved");
        Ok(())
    }

    async fn load(&self, id: Uuid) -> Result<Option<Session>> {
        let Some(document) = self.raw(id) else {
            return Ok(None);
        };
        serde_json::from_str(&document)
            .map(Some)
            .map_err(ProfilerError::storage)
    }

    async fn list(&self, limit: usize) -> Result<Vec<Uuid>> {
        let order = self.order.lock();
        Ok(order.iter().rev().take(limit).copied().collect())
    }
}
