//! 入群辅助
//!
//! 先以限制 presence 的方式加入房间并拉取成员列表；拉取失败时以不限制 presence
//! 的方式再加入一次并重新拉取。

use crate::im::error::SessionError;
use crate::im::transport::{Participant, Transport};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// 入群结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinedRoom {
    pub room_jid: String,
    pub participants: Vec<Participant>,
    /// 最终是否处于 presence 限制模式
    pub presence_limited: bool,
}

pub struct RoomJoiner {
    transport: Arc<dyn Transport>,
    timeout: Duration,
}

impl RoomJoiner {
    pub fn new(transport: Arc<dyn Transport>, timeout: Duration) -> Self {
        Self { transport, timeout }
    }

    pub async fn join(&self, room_jid: &str) -> Result<JoinedRoom, SessionError> {
        info!("[Rooms] 🚪 加入房间 {}", room_jid);
        self.transport.join_room(room_jid, true).await?;

        match self.transport.fetch_participants(room_jid, self.timeout).await {
            Ok(participants) => Ok(JoinedRoom {
                room_jid: room_jid.to_string(),
                participants,
                presence_limited: true,
            }),
            Err(e) => {
                warn!(
                    "[Rooms] 房间 {} 成员拉取失败({})，关闭 presence 限制后重新加入",
                    room_jid, e
                );
                // TODO: 服务器支持 presence 限制能力发现后，按能力直接选择加入模式，去掉第二次加入
                self.transport.join_room(room_jid, false).await?;
                let participants = self
                    .transport
                    .fetch_participants(room_jid, self.timeout)
                    .await?;
                Ok(JoinedRoom {
                    room_jid: room_jid.to_string(),
                    participants,
                    presence_limited: false,
                })
            }
        }
    }
}
