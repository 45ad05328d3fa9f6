use tonic::metadata::{Ascii, MetadataMap, MetadataValue};

use crate::peer::PeerHandle;

/// 客户端 SDK 在请求元数据中声明自身信息的 key
pub const CLIENT_INFO_METADATA_KEY: &str = "viam_client";

/// 模块回连时携带模块名的 key
pub const MODULE_NAME_METADATA_KEY: &str = "modname";

/// 没有声明客户端信息时的取值（TypeScript SDK 目前不带该元数据）
pub const UNKNOWN_CLIENT_METADATA: &str = "maybe-typescript;unknown;unknown";

/// 一次 RPC 调用的上下文
#[derive(Clone)]
pub struct CallContext {
    /// 调用方连接（模块间调用等场景可能没有）
    pub peer: Option<PeerHandle>,
    /// 请求元数据
    pub metadata: MetadataMap,
}

impl CallContext {
    /// 创建新的调用上下文
    pub fn new() -> Self {
        Self {
            peer: None,
            metadata: MetadataMap::new(),
        }
    }

    /// 设置调用方连接
    pub fn with_peer(mut self, peer: PeerHandle) -> Self {
        self.peer = Some(peer);
        self
    }

    /// 添加元数据；非 ASCII 取值忽略
    pub fn with_metadata(mut self, key: &'static str, value: &str) -> Self {
        if let Ok(value) = value.parse::<MetadataValue<Ascii>>() {
            self.metadata.insert(key, value);
        }
        self
    }

    /// 读取元数据
    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|value| value.to_str().ok())
    }

    /// 客户端元数据：`[sdk];[sdk 版本];[api 版本]`，模块连接加 `module-<name>-` 前缀
    pub fn client_metadata(&self) -> String {
        let client = self
            .metadata_value(CLIENT_INFO_METADATA_KEY)
            .filter(|value| !value.is_empty())
            .unwrap_or(UNKNOWN_CLIENT_METADATA);

        match self
            .metadata_value(MODULE_NAME_METADATA_KEY)
            .filter(|name| !name.is_empty())
        {
            Some(module) => format!("module-{}-{}", module, client),
            None => client.to_string(),
        }
    }
}

impl Default for CallContext {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CallContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallContext")
            .field("peer", &self.peer.as_ref().map(|peer| peer.id()))
            .field("metadata", &self.metadata)
            .finish()
    }
}
