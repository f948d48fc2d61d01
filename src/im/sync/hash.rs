//! 聚合哈希
//!
//! SHA-256 覆盖所有未删除记录的 `"{id}:{version}\n"`，按 id 升序，输出小写十六进制。

use crate::im::sync::models::{CacheSnapshot, SyncRecord};
use sha2::{Digest, Sha256};

pub fn aggregate_hash<R: SyncRecord>(snapshot: &CacheSnapshot<R>) -> String {
    let mut hasher = Sha256::new();
    for record in snapshot.values().filter(|r| !r.is_removed()) {
        hasher.update(format!("{}:{}\n", record.id(), record.version()).as_bytes());
    }
    format!("{:x}", hasher.finalize())
}
