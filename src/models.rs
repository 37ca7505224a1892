//! 核心数据模型
//!
//! 定义航海日志的领域实体（船只、航程、笔记、待办、保养记录）、
//! 同步引擎使用的统一实体记录（[`EntityRecord`]）以及全局错误类型 [`AppError`]。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// 错误类型
// ============================================================================

/// 错误分类，序列化后供前端分流展示
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppErrorType {
    Validation,
    Database,
    Network,
    Protocol,
    NotFound,
    Configuration,
    Unknown,
}

/// 全局错误类型
///
/// 所有面向调用方的错误都携带人类可读的 message，必要时附带结构化 details。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppError {
    pub error_type: AppErrorType,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl AppError {
    pub fn new(error_type: AppErrorType, message: impl Into<String>) -> Self {
        Self {
            error_type,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(
        error_type: AppErrorType,
        message: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        Self {
            error_type,
            message: message.into(),
            details: Some(details),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(AppErrorType::Validation, message)
    }

    pub fn database(message: impl Into<String>) -> Self {
        Self::new(AppErrorType::Database, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(AppErrorType::Network, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(AppErrorType::Protocol, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(AppErrorType::NotFound, message)
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(AppErrorType::Configuration, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(AppErrorType::Unknown, message)
    }
}

// 实现Display trait
impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

// 实现Error trait
impl std::error::Error for AppError {}

// 实现从其他错误类型的转换
impl From<String> for AppError {
    fn from(message: String) -> Self {
        AppError::validation(message)
    }
}

impl From<&str> for AppError {
    fn from(message: &str) -> Self {
        AppError::validation(message.to_string())
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(err: rusqlite::Error) -> Self {
        AppError::database(format!("数据库操作错误: {}", err))
    }
}

impl From<r2d2::Error> for AppError {
    fn from(err: r2d2::Error) -> Self {
        AppError::database(format!("连接池错误: {}", err))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::validation(format!("JSON序列化错误: {}", err))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::unknown(err.to_string())
    }
}

/// 统一 Result 别名
pub type Result<T> = std::result::Result<T, AppError>;

// ============================================================================
// 领域实体
// ============================================================================

/// 船只档案
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Boat {
    pub id: String,
    /// 船名
    pub name: String,
    /// 官方注册编号（可选，用于导入查重）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub official_number: Option<String>,
    /// 船型（帆船/机动艇等）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boat_type: Option<String>,
    /// 母港
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub home_port: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 航程记录
///
/// `origin_source`/`origin_id` 记录导入来源（如二维码传输），
/// 本机创建的航程两者均为 None。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trip {
    pub id: String,
    pub boat_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// 出发时间
    pub start_time: DateTime<Utc>,
    /// 抵达时间
    pub end_time: DateTime<Utc>,
    /// 航程距离（海里）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance_nm: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    /// 导入来源标识（如 "qr_transfer"）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_source: Option<String>,
    /// 来源设备上的原始实体 ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 航海笔记
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Note {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boat_id: Option<String>,
    pub title: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 待办清单
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TodoList {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 待办事项
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TodoItem {
    pub id: String,
    pub list_id: String,
    pub text: String,
    pub done: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 保养/维护记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaintenanceEvent {
    pub id: String,
    pub boat_id: String,
    pub description: String,
    /// 计划执行时间（提醒用）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_at: Option<DateTime<Utc>>,
    /// 实际完成时间
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub performed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// 同步引擎统一视图
// ============================================================================

/// 可同步的实体类型（封闭枚举）
///
/// 字符串码用作 sqlite 表内的类型判别符与远端协议里的类型名，保持稳定。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Boat,
    Trip,
    Note,
    TodoList,
    TodoItem,
    MaintenanceEvent,
}

impl EntityType {
    /// 全部实体类型，按同步拉取顺序排列（Boat 在前，外键依赖方在后）
    pub const ALL: [EntityType; 6] = [
        EntityType::Boat,
        EntityType::Trip,
        EntityType::Note,
        EntityType::TodoList,
        EntityType::TodoItem,
        EntityType::MaintenanceEvent,
    ];

    /// 稳定字符串码
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Boat => "boat",
            EntityType::Trip => "trip",
            EntityType::Note => "note",
            EntityType::TodoList => "todo_list",
            EntityType::TodoItem => "todo_item",
            EntityType::MaintenanceEvent => "maintenance_event",
        }
    }

    /// 从字符串码还原，未知码返回 None
    pub fn from_str_code(code: &str) -> Option<Self> {
        match code {
            "boat" => Some(EntityType::Boat),
            "trip" => Some(EntityType::Trip),
            "note" => Some(EntityType::Note),
            "todo_list" => Some(EntityType::TodoList),
            "todo_item" => Some(EntityType::TodoItem),
            "maintenance_event" => Some(EntityType::MaintenanceEvent),
            _ => None,
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 实体载荷的带标签联合
///
/// 同步引擎、冲突检测与二维码导入都通过它携带完整实体快照，
/// 消费端必须穷尽匹配，禁止默认分支。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "entity", rename_all = "snake_case")]
pub enum EntityPayload {
    Boat(Boat),
    Trip(Trip),
    Note(Note),
    TodoList(TodoList),
    TodoItem(TodoItem),
    MaintenanceEvent(MaintenanceEvent),
}

impl EntityPayload {
    pub fn entity_type(&self) -> EntityType {
        match self {
            EntityPayload::Boat(_) => EntityType::Boat,
            EntityPayload::Trip(_) => EntityType::Trip,
            EntityPayload::Note(_) => EntityType::Note,
            EntityPayload::TodoList(_) => EntityType::TodoList,
            EntityPayload::TodoItem(_) => EntityType::TodoItem,
            EntityPayload::MaintenanceEvent(_) => EntityType::MaintenanceEvent,
        }
    }

    pub fn entity_id(&self) -> &str {
        match self {
            EntityPayload::Boat(b) => &b.id,
            EntityPayload::Trip(t) => &t.id,
            EntityPayload::Note(n) => &n.id,
            EntityPayload::TodoList(l) => &l.id,
            EntityPayload::TodoItem(i) => &i.id,
            EntityPayload::MaintenanceEvent(m) => &m.id,
        }
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        match self {
            EntityPayload::Boat(b) => b.updated_at,
            EntityPayload::Trip(t) => t.updated_at,
            EntityPayload::Note(n) => n.updated_at,
            EntityPayload::TodoList(l) => l.updated_at,
            EntityPayload::TodoItem(i) => i.updated_at,
            EntityPayload::MaintenanceEvent(m) => m.updated_at,
        }
    }

    /// 以新 ID 克隆载荷（KeepBoth 冲突解决使用）
    ///
    /// 展示性名称追加"（本机副本）"标记，避免两份数据在界面上无法区分。
    pub fn clone_with_new_id(&self, new_id: &str) -> EntityPayload {
        const LOCAL_COPY_MARK: &str = "（本机副本）";
        match self {
            EntityPayload::Boat(b) => {
                let mut b = b.clone();
                b.id = new_id.to_string();
                b.name.push_str(LOCAL_COPY_MARK);
                EntityPayload::Boat(b)
            }
            EntityPayload::Trip(t) => {
                let mut t = t.clone();
                t.id = new_id.to_string();
                if let Some(title) = t.title.as_mut() {
                    title.push_str(LOCAL_COPY_MARK);
                }
                EntityPayload::Trip(t)
            }
            EntityPayload::Note(n) => {
                let mut n = n.clone();
                n.id = new_id.to_string();
                n.title.push_str(LOCAL_COPY_MARK);
                EntityPayload::Note(n)
            }
            EntityPayload::TodoList(l) => {
                let mut l = l.clone();
                l.id = new_id.to_string();
                l.name.push_str(LOCAL_COPY_MARK);
                EntityPayload::TodoList(l)
            }
            EntityPayload::TodoItem(i) => {
                let mut i = i.clone();
                i.id = new_id.to_string();
                EntityPayload::TodoItem(i)
            }
            EntityPayload::MaintenanceEvent(m) => {
                let mut m = m.clone();
                m.id = new_id.to_string();
                EntityPayload::MaintenanceEvent(m)
            }
        }
    }
}

/// 存储层与远端交换的统一实体记录
///
/// `synced = false` 表示本机有未推送的改动（与变更日志保持同步）。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityRecord {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub updated_at: DateTime<Utc>,
    pub synced: bool,
    pub payload: EntityPayload,
}

impl EntityRecord {
    /// 从载荷构造记录，类型/ID/时间戳取自载荷本身
    pub fn from_payload(payload: EntityPayload, synced: bool) -> Self {
        Self {
            entity_type: payload.entity_type(),
            entity_id: payload.entity_id().to_string(),
            updated_at: payload.updated_at(),
            synced,
            payload,
        }
    }
}
