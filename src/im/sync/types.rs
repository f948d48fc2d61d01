//! 差异同步请求 / 响应结构

use crate::im::types::deserialize_vec_or_null;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffSyncReq {
    pub require_full_list: bool,
    /// id -> version
    pub known_versions: BTreeMap<u64, String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", bound(deserialize = "R: DeserializeOwned"))]
pub struct DiffSyncResp<R> {
    /// 变更记录，包含软删除的墓碑
    #[serde(default, deserialize_with = "deserialize_vec_or_null")]
    pub changed_records: Vec<R>,
}
