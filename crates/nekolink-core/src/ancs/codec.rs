//! ANCS 二进制编解码
//!
//! Control Point 命令 (GetNotificationAttributes):
//! `CommandID(0x00) | UID(LE u32) | AttrID [MaxLen(LE u16)] ...`
//!
//! Data Source 响应:
//! `CommandID(0x00) | UID(LE u32) | { AttrID | Len(LE u16) | bytes[Len] } ...`
//!
//! 响应没有属性个数字段，也不保证一次 notify 送达，
//! 因此解析器必须能在任意位置被截断后返回 "需要更多数据"。

use std::collections::BTreeMap;

pub const COMMAND_GET_NOTIFICATION_ATTRIBUTES: u8 = 0x00;

const RESPONSE_HEADER_LEN: usize = 5;
const ATTRIBUTE_HEADER_LEN: usize = 3;

/// Notification Source 事件固定长度
pub const NOTIFICATION_SOURCE_LEN: usize = 8;

/// 用到的属性 ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum AttributeId {
    AppIdentifier = 0,
    Title = 1,
    Subtitle = 2,
    Message = 3,
    Date = 5,
}

impl AttributeId {
    pub fn id(self) -> u8 {
        self as u8
    }
}

/// 一个通知的属性表 (attribute id -> 文本)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttributeSet {
    values: BTreeMap<u8, String>,
}

impl AttributeSet {
    pub fn insert(&mut self, id: u8, value: String) {
        self.values.insert(id, value);
    }

    pub fn get(&self, id: AttributeId) -> Option<&str> {
        self.values.get(&id.id()).map(String::as_str)
    }

    /// 缺失的属性按空串处理
    pub fn text(&self, id: AttributeId) -> String {
        self.get(id).unwrap_or_default().to_string()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// 请求哪些属性以及各自的最大长度
///
/// 默认是完整版 (含 Subtitle, Message 256)，[`reduced`](Self::reduced)
/// 是不含 Subtitle、Message 300 的精简版。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeRequestProfile {
    pub title_max_len: u16,
    /// `None` 表示不请求 Subtitle
    pub subtitle_max_len: Option<u16>,
    pub message_max_len: u16,
}

impl Default for AttributeRequestProfile {
    fn default() -> Self {
        Self {
            title_max_len: 64,
            subtitle_max_len: Some(64),
            message_max_len: 256,
        }
    }
}

impl AttributeRequestProfile {
    pub fn reduced() -> Self {
        Self {
            title_max_len: 64,
            subtitle_max_len: None,
            message_max_len: 300,
        }
    }

    pub fn requests_subtitle(&self) -> bool {
        self.subtitle_max_len.is_some()
    }

    /// 响应中最后一个属性，用来判定响应结束
    pub fn last_attribute(&self) -> AttributeId {
        AttributeId::Date
    }

    fn attributes(&self) -> Vec<(AttributeId, Option<u16>)> {
        let mut attrs = vec![
            (AttributeId::AppIdentifier, None),
            (AttributeId::Title, Some(self.title_max_len)),
        ];
        if let Some(len) = self.subtitle_max_len {
            attrs.push((AttributeId::Subtitle, Some(len)));
        }
        attrs.push((AttributeId::Message, Some(self.message_max_len)));
        attrs.push((AttributeId::Date, None));
        attrs
    }

    /// 构造写入 Control Point 的 GetNotificationAttributes 命令
    pub fn build_request(&self, uid: u32) -> Vec<u8> {
        let mut cmd = Vec::with_capacity(RESPONSE_HEADER_LEN + 11);
        cmd.push(COMMAND_GET_NOTIFICATION_ATTRIBUTES);
        cmd.extend_from_slice(&uid.to_le_bytes());
        for (id, max_len) in self.attributes() {
            cmd.push(id.id());
            if let Some(len) = max_len {
                cmd.extend_from_slice(&len.to_le_bytes());
            }
        }
        cmd
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("unexpected command id 0x{0:02x} in attribute response")]
    UnexpectedCommand(u8),
}

/// 一个完整解析出的响应
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedResponse {
    pub uid: u32,
    pub attributes: AttributeSet,
    /// 该响应占用的字节数，缓冲区后面可能紧跟下一个响应
    pub consumed: usize,
}

/// 尝试从缓冲区头部解析一个属性响应
///
/// - `Ok(None)`: 数据不完整，等待更多字节
/// - `Err(_)`: 头部非法，调用方应丢弃整个缓冲区
///
/// 给出 `last_attribute` 时，解析到该属性即视为响应结束，
/// 与分片方式无关；为 `None` 时退化为 "缓冲区恰好耗尽即结束"。
pub fn try_parse_attribute_response(
    buf: &[u8],
    last_attribute: Option<AttributeId>,
) -> Result<Option<ParsedResponse>, CodecError> {
    if buf.len() < RESPONSE_HEADER_LEN {
        return Ok(None);
    }
    if buf[0] != COMMAND_GET_NOTIFICATION_ATTRIBUTES {
        return Err(CodecError::UnexpectedCommand(buf[0]));
    }
    let uid = u32::from_le_bytes([buf[1], buf[2], buf[3], buf[4]]);

    let mut attributes = AttributeSet::default();
    let mut i = RESPONSE_HEADER_LEN;
    loop {
        if i == buf.len() && last_attribute.is_none() {
            return Ok(Some(ParsedResponse {
                uid,
                attributes,
                consumed: i,
            }));
        }
        if i + ATTRIBUTE_HEADER_LEN > buf.len() {
            return Ok(None);
        }

        let attr_id = buf[i];
        let attr_len = u16::from_le_bytes([buf[i + 1], buf[i + 2]]) as usize;
        i += ATTRIBUTE_HEADER_LEN;
        if i + attr_len > buf.len() {
            return Ok(None);
        }

        let raw = &buf[i..i + attr_len];
        i += attr_len;
        attributes.insert(attr_id, String::from_utf8_lossy(raw).into_owned());

        if last_attribute.is_some_and(|last| last.id() == attr_id) {
            return Ok(Some(ParsedResponse {
                uid,
                attributes,
                consumed: i,
            }));
        }
    }
}

/// Data Source 重组缓冲区
///
/// 只会追加、从头部移除已解析的完整响应，或整体清空。
#[derive(Debug, Default)]
pub struct ResponseBuffer {
    bytes: Vec<u8>,
}

impl ResponseBuffer {
    pub fn extend(&mut self, data: &[u8]) {
        self.bytes.extend_from_slice(data);
    }

    pub fn clear(&mut self) {
        self.bytes.clear();
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// 取出下一个完整响应；头部非法时清空缓冲区并返回错误
    pub fn next_response(
        &mut self,
        last_attribute: Option<AttributeId>,
    ) -> Result<Option<ParsedResponse>, CodecError> {
        match try_parse_attribute_response(&self.bytes, last_attribute) {
            Ok(Some(parsed)) => {
                self.bytes.drain(..parsed.consumed);
                Ok(Some(parsed))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                self.bytes.clear();
                Err(e)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventId {
    Added,
    Modified,
    Removed,
    Unknown(u8),
}

impl From<u8> for EventId {
    fn from(value: u8) -> Self {
        match value {
            0 => EventId::Added,
            1 => EventId::Modified,
            2 => EventId::Removed,
            other => EventId::Unknown(other),
        }
    }
}

/// Notification Source 事件 (8 字节)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotificationSourceEvent {
    pub event_id: EventId,
    pub event_flags: u8,
    pub category_id: u8,
    pub category_count: u8,
    pub uid: u32,
}

impl NotificationSourceEvent {
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < NOTIFICATION_SOURCE_LEN {
            return None;
        }
        Some(Self {
            event_id: EventId::from(data[0]),
            event_flags: data[1],
            category_id: data[2],
            category_count: data[3],
            uid: u32::from_le_bytes([data[4], data[5], data[6], data[7]]),
        })
    }
}
