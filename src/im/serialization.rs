//! 压缩与缓存编解码
//!
//! 缓存快照以不透明字符串写入键值存储：`Json` 直接保存 JSON 文本，
//! `GzipJson` 先 gzip 再 base64。

use crate::im::error::StoreError;
use base64::Engine;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// 解压 gzip 数据
pub fn decompress_gzip(data: &[u8]) -> Result<Vec<u8>, std::io::Error> {
    let mut decoder = GzDecoder::new(data);
    let mut decompressed = Vec::new();
    decoder.read_to_end(&mut decompressed)?;
    Ok(decompressed)
}

/// 压缩数据为 gzip 格式
pub fn compress_gzip(data: &[u8]) -> Result<Vec<u8>, std::io::Error> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

/// 生成请求操作 ID
pub fn generate_operation_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// 缓存快照编解码方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheCodec {
    Json,
    GzipJson,
}

impl CacheCodec {
    /// 序列化为可写入存储的字符串
    pub fn dehydrate<T: Serialize>(&self, value: &T) -> Result<String, StoreError> {
        let json = serde_json::to_vec(value)?;
        match self {
            CacheCodec::Json => String::from_utf8(json)
                .map_err(|e| StoreError::Serialization(e.to_string())),
            CacheCodec::GzipJson => {
                let compressed =
                    compress_gzip(&json).map_err(|e| StoreError::Serialization(e.to_string()))?;
                Ok(base64::engine::general_purpose::STANDARD.encode(compressed))
            }
        }
    }

    /// 从存储字符串还原
    pub fn rehydrate<T: DeserializeOwned>(&self, blob: &str) -> Result<T, StoreError> {
        match self {
            CacheCodec::Json => Ok(serde_json::from_str(blob)?),
            CacheCodec::GzipJson => {
                let compressed = base64::engine::general_purpose::STANDARD
                    .decode(blob.trim())
                    .map_err(|e| StoreError::Serialization(e.to_string()))?;
                let json = decompress_gzip(&compressed)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?;
                Ok(serde_json::from_slice(&json)?)
            }
        }
    }
}
