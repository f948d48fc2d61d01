//! 缓存同步的本地数据模型

use crate::im::types::SyncResource;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// 参与版本同步的记录：`(id, version)` 相同即内容相同
pub trait SyncRecord: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    const RESOURCE: SyncResource;

    fn id(&self) -> u64;

    fn version(&self) -> &str;

    /// 软删除 / 归档的记录不进入本地缓存，也不参与哈希
    fn is_removed(&self) -> bool;
}

/// 本地缓存快照，按 id 有序
pub type CacheSnapshot<R> = BTreeMap<u64, R>;

/// 联系人
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub id: u64,
    pub version: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub mention_name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub is_deleted: bool,
}

impl SyncRecord for Contact {
    const RESOURCE: SyncResource = SyncResource::Contacts;

    fn id(&self) -> u64 {
        self.id
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn is_removed(&self) -> bool {
        self.is_deleted
    }
}

fn default_privacy() -> String {
    "public".to_string()
}

/// 房间
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    pub id: u64,
    pub version: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default = "default_privacy")]
    pub privacy: String,
    #[serde(default)]
    pub owner_id: Option<u64>,
    #[serde(default)]
    pub is_archived: bool,
    #[serde(default)]
    pub is_deleted: bool,
}

impl SyncRecord for Room {
    const RESOURCE: SyncResource = SyncResource::Rooms;

    fn id(&self) -> u64 {
        self.id
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn is_removed(&self) -> bool {
        self.is_deleted || self.is_archived
    }
}

/// 本次同步走的路径
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPath {
    /// 哈希一致，直接使用本地缓存
    Cached,
    Diff,
    FullDownload,
}

/// 同步结果
#[derive(Debug, Clone)]
pub struct SyncOutcome<R> {
    pub path: SyncPath,
    pub snapshot: CacheSnapshot<R>,
    /// 实际发出的差异同步请求数
    pub diff_attempts: u32,
}
