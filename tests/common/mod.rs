#![allow(dead_code)]

use std::io;
use std::sync::Arc;

use parking_lot::Mutex;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use request_counter::peer::{ConnectionStats, PeerConnection, PeerHandle, PeerId};
use request_counter::{named_message, unnamed_message};

pub const ARM_MOVE: &str = "/viam.component.arm.v1.ArmService/MoveToPosition";
pub const ARM_STREAM: &str = "/viam.component.arm.v1.ArmService/StreamTicks";
pub const ARM_SERVICE: &str = "viam.component.arm.v1.ArmService";
pub const ROBOT_STATUS: &str = "/viam.robot.v1.RobotService/GetMachineStatus";
pub const VISION_LIST: &str = "/viam.service.vision.v1.VisionService/ListModels";
pub const FOREIGN_METHOD: &str = "/acme.widgets.v1.WidgetService/Spin";

#[derive(Clone, PartialEq, prost::Message)]
pub struct ResourceRequest {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(bytes = "vec", tag = "2")]
    pub payload: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct StatusResponse {
    #[prost(string, tag = "1")]
    pub state: String,
}

named_message!(ResourceRequest);
unnamed_message!(StatusResponse);

pub fn request(name: &str) -> ResourceRequest {
    ResourceRequest {
        name: name.to_string(),
        payload: vec![0u8; 8],
    }
}

pub fn response(state: &str) -> StatusResponse {
    StatusResponse {
        state: state.to_string(),
    }
}

pub fn limit_key(resource: &str) -> String {
    format!("{}.{}", resource, ARM_SERVICE)
}

/// 测试用连接
pub struct FakePeer {
    id: u64,
    stats: Option<ConnectionStats>,
}

impl PeerConnection for FakePeer {
    fn id(&self) -> PeerId {
        PeerId(self.id)
    }

    fn connection_stats(&self) -> Option<ConnectionStats> {
        self.stats.clone()
    }
}

/// 刚建立的连接
pub fn peer(id: u64) -> PeerHandle {
    Arc::new(FakePeer {
        id,
        stats: Some(ConnectionStats {
            connection_id: Some(format!("conn-{}", id)),
            connected: true,
            local_address: Some("10.0.0.1".parse().unwrap()),
            remote_address: Some("10.0.0.2".parse().unwrap()),
            connect_time: Some(Utc::now()),
        }),
    })
}

/// 很久以前建立、现已断开的连接
pub fn stale_peer(id: u64, connected_minutes_ago: i64) -> PeerHandle {
    let connect_time: DateTime<Utc> = Utc::now() - ChronoDuration::minutes(connected_minutes_ago);
    Arc::new(FakePeer {
        id,
        stats: Some(ConnectionStats {
            connection_id: Some(format!("conn-{}", id)),
            connected: false,
            local_address: None,
            remote_address: None,
            connect_time: Some(connect_time),
        }),
    })
}

/// 收集日志输出
#[derive(Clone, Default)]
pub struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl LogBuffer {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }

    pub fn clear(&self) {
        self.0.lock().clear();
    }
}

impl io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// 安装只作用于当前线程的日志收集器
pub fn capture_logs() -> (LogBuffer, tracing::subscriber::DefaultGuard) {
    let buffer = LogBuffer::default();
    let writer = buffer.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .finish();
    let guard = tracing::subscriber::set_default(subscriber);
    (buffer, guard)
}
