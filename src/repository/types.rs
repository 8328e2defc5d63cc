// 任务仓库请求/响应类型

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// 处理选项（如 `{"name": "dsm", "value": true}`）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOption {
    pub name: String,
    pub value: Value,
}

/// 目标处理节点
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingNode {
    /// 节点 ID，自动选择时可以为空
    #[serde(default)]
    pub id: Option<i64>,
    /// 是否由服务器自动选择节点
    #[serde(default)]
    pub auto: bool,
}

impl ProcessingNode {
    /// 自动选择节点
    pub fn auto() -> Self {
        Self { id: None, auto: true }
    }

    /// 指定节点
    pub fn with_id(id: i64) -> Self {
        Self {
            id: Some(id),
            auto: false,
        }
    }
}

impl Default for ProcessingNode {
    fn default() -> Self {
        Self::auto()
    }
}

/// 用户在任务面板中确认的参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskParams {
    /// 任务名称
    pub name: String,
    /// 处理选项
    #[serde(default)]
    pub options: Vec<TaskOption>,
    /// 处理节点
    #[serde(default)]
    pub processing_node: ProcessingNode,
    /// 图片缩放目标（像素），None 表示不缩放
    #[serde(default)]
    pub resize_to: Option<u32>,
}

impl TaskParams {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            options: Vec::new(),
            processing_node: ProcessingNode::auto(),
            resize_to: None,
        }
    }
}

/// 创建任务请求体
///
/// `partial = true` 表示文件随后逐个上传，最后由 commit 接口完成
#[derive(Debug, Clone, Serialize)]
pub struct CreateTaskRequest<'a> {
    pub name: &'a str,
    pub options: &'a [TaskOption],
    pub processing_node: Option<i64>,
    pub auto_processing_node: bool,
    pub partial: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resize_to: Option<u32>,
}

impl<'a> From<&'a TaskParams> for CreateTaskRequest<'a> {
    fn from(params: &'a TaskParams) -> Self {
        Self {
            name: params.name.trim(),
            options: &params.options,
            processing_node: params.processing_node.id,
            auto_processing_node: params.processing_node.auto,
            partial: true,
            resize_to: params.resize_to,
        }
    }
}

/// 单文件上传确认
///
/// 服务器返回 `{"success": true, "uploaded": {"IMG_0001.JPG": 5242880}}`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UploadAck {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub uploaded: HashMap<String, u64>,
}

impl UploadAck {
    /// 构造一个确认指定文件完整接收的响应
    pub fn accepted(filename: impl Into<String>, size: u64) -> Self {
        let mut uploaded = HashMap::new();
        uploaded.insert(filename.into(), size);
        Self {
            success: true,
            uploaded,
        }
    }

    /// 服务器为该文件确认的字节数
    pub fn accepted_bytes(&self, filename: &str) -> Option<u64> {
        self.uploaded.get(filename).copied()
    }

    /// 服务器是否完整接收了该文件
    pub fn confirms(&self, filename: &str, size: u64) -> bool {
        self.success && self.accepted_bytes(filename) == Some(size)
    }
}
