//! API 方法分类
//!
//! 将传输层给出的完整方法路径（如 `/viam.component.motor.v1.MotorService/IsMoving`）
//! 解析为结构化描述。只有平台自身的 API 族参与计数与限流，其它一律返回空描述。

/// 平台自身 API 的命名空间前缀
const PLATFORM_API_PREFIXES: &[&str] = &["/viam.component.", "/viam.service.", "/viam.robot."];

/// 整机服务：没有具体资源名时仍按服务整体限流
pub const ROBOT_SERVICE: &str = "viam.robot.v1.RobotService";

/// 方法描述（每个 RPC 解析一次，之后复用）
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApiMethod {
    /// 完整方法路径，原样保留
    pub full: String,
    /// 全限定服务名，如 `viam.component.motor.v1.MotorService`
    pub service: String,
    /// 方法名，如 `IsMoving`
    pub name: String,
    /// `<ServiceLeaf>/<Method>`，如 `MotorService/IsMoving`
    pub short_path: String,
}

impl ApiMethod {
    /// 解析完整方法路径
    ///
    /// ```
    /// use request_counter::method::ApiMethod;
    ///
    /// let m = ApiMethod::parse("/viam.component.motor.v1.MotorService/IsMoving");
    /// assert_eq!(m.service, "viam.component.motor.v1.MotorService");
    /// assert_eq!(m.short_path, "MotorService/IsMoving");
    ///
    /// assert!(!ApiMethod::parse("/grpc.health.v1.Health/Check").is_platform_api());
    /// ```
    pub fn parse(full_method: &str) -> Self {
        if !PLATFORM_API_PREFIXES
            .iter()
            .any(|prefix| full_method.starts_with(prefix))
        {
            return Self::default();
        }

        let Some((service, method)) = full_method[1..].split_once('/') else {
            return Self::default();
        };
        if service.is_empty() || method.is_empty() {
            return Self::default();
        }

        let leaf = service.rsplit('.').next().unwrap_or(service);
        Self {
            full: full_method.to_string(),
            service: service.to_string(),
            name: method.to_string(),
            short_path: format!("{}/{}", leaf, method),
        }
    }

    /// 是否为平台 API（空 short_path 表示外部 API，不计数也不限流）
    pub fn is_platform_api(&self) -> bool {
        !self.short_path.is_empty()
    }

    /// 是否为整机服务
    pub fn is_robot_service(&self) -> bool {
        self.service == ROBOT_SERVICE
    }
}
