//! 资源归属
//!
//! 请求消息的具体类型对本模块不可见，只能通过 [`RpcMessage`] 能力接口询问
//! “这条消息指向哪个资源”。据此推导统计 key 与限流 key。

use bytes::Bytes;

use crate::method::ApiMethod;

/// 请求/响应消息的能力接口
///
/// 生成的 protobuf 类型通过 [`named_message!`](crate::named_message) 或
/// [`unnamed_message!`](crate::unnamed_message) 实现。
pub trait RpcMessage: Send + Sync {
    /// 消息指向的资源名（对给定服务/方法而言）。空字符串视为没有。
    fn resource_name(&self, _service: &str, _method: &str) -> Option<&str> {
        None
    }

    /// 序列化后的字节数；非结构化消息返回 None
    fn encoded_size(&self) -> Option<usize> {
        None
    }
}

impl<T: RpcMessage + ?Sized> RpcMessage for Box<T> {
    fn resource_name(&self, service: &str, method: &str) -> Option<&str> {
        (**self).resource_name(service, method)
    }

    fn encoded_size(&self) -> Option<usize> {
        (**self).encoded_size()
    }
}

/// 为带 `name` 字段的 prost 消息实现 [`RpcMessage`]
#[macro_export]
macro_rules! named_message {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl $crate::resource::RpcMessage for $ty {
                fn resource_name(&self, _service: &str, _method: &str) -> Option<&str> {
                    Some(self.name.as_str()).filter(|name| !name.is_empty())
                }

                fn encoded_size(&self) -> Option<usize> {
                    Some(::prost::Message::encoded_len(self))
                }
            }
        )+
    };
}

/// 为不携带资源名的 prost 消息实现 [`RpcMessage`]
#[macro_export]
macro_rules! unnamed_message {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl $crate::resource::RpcMessage for $ty {
                fn encoded_size(&self) -> Option<usize> {
                    Some(::prost::Message::encoded_len(self))
                }
            }
        )+
    };
}

/// 仍是编码状态的 protobuf 消息
///
/// 只认 1 号字段（平台 API 中资源名固定为 `name = 1`），按线格式扫描，
/// 不做完整解码。格式错误时返回 None。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawMessage(pub Bytes);

/// 资源名所在的字段号
const NAME_FIELD_NUMBER: u64 = 1;

impl RawMessage {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    fn name_field(&self) -> Option<&str> {
        let mut buf: &[u8] = &self.0;
        while !buf.is_empty() {
            let key = prost::encoding::decode_varint(&mut buf).ok()?;
            let field = key >> 3;
            match key & 0x7 {
                // varint
                0 => {
                    prost::encoding::decode_varint(&mut buf).ok()?;
                }
                // 64-bit
                1 => buf = buf.get(8..)?,
                // length-delimited
                2 => {
                    let len = usize::try_from(prost::encoding::decode_varint(&mut buf).ok()?).ok()?;
                    let value = buf.get(..len)?;
                    if field == NAME_FIELD_NUMBER {
                        return std::str::from_utf8(value).ok().filter(|s| !s.is_empty());
                    }
                    buf = &buf[len..];
                }
                // 32-bit
                5 => buf = buf.get(4..)?,
                // group 等不支持
                _ => return None,
            }
        }
        None
    }
}

impl RpcMessage for RawMessage {
    fn resource_name(&self, _service: &str, _method: &str) -> Option<&str> {
        self.name_field()
    }

    fn encoded_size(&self) -> Option<usize> {
        Some(self.0.len())
    }
}

/// 资源归属结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attribution {
    pub resource: Option<String>,
    /// 统计 key，空表示不计数
    pub stats_key: String,
    /// 限流 key，空表示不限流
    pub limit_key: String,
}

impl Attribution {
    pub fn resolve(msg: Option<&dyn RpcMessage>, method: &ApiMethod) -> Self {
        if !method.is_platform_api() {
            return Self::default();
        }

        let resource = msg
            .and_then(|m| m.resource_name(&method.service, &method.name))
            .filter(|name| !name.is_empty())
            .map(str::to_string);

        Self {
            stats_key: build_stats_key(resource.as_deref(), method),
            limit_key: build_limit_key(resource.as_deref(), method),
            resource,
        }
    }
}

/// `<resource>.<short_path>`，没有资源名时为 `<short_path>`
pub fn build_stats_key(resource: Option<&str>, method: &ApiMethod) -> String {
    if !method.is_platform_api() {
        return String::new();
    }
    match resource {
        Some(name) if !name.is_empty() => format!("{}.{}", name, method.short_path),
        _ => method.short_path.clone(),
    }
}

/// `<resource>.<service>`；整机服务为 `<service>`；其它平台 API 不限流
pub fn build_limit_key(resource: Option<&str>, method: &ApiMethod) -> String {
    if !method.is_platform_api() {
        return String::new();
    }
    match resource {
        Some(name) if !name.is_empty() => format!("{}.{}", name, method.service),
        _ if method.is_robot_service() => method.service.clone(),
        _ => String::new(),
    }
}
