// 任务仓库 HTTP 客户端实现

use crate::config::RepositoryConfig;
use crate::error::{ProjectId, RepositoryError};
use crate::repository::{
    commit_endpoint, create_task_endpoint, CreateTaskRequest, TaskParams, TaskRepository,
    UploadAck,
};
use crate::uploader::{ProgressReporter, UploadFile};
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::multipart;
use reqwest::{Body, Client, Response};
use serde_json::Value;
use tokio_util::io::ReaderStream;
use tracing::{debug, error, info};

/// 上传表单中文件字段名
const UPLOAD_FIELD_NAME: &str = "images";

/// 基于 reqwest 的任务仓库
#[derive(Debug, Clone)]
pub struct HttpTaskRepository {
    /// HTTP客户端
    client: Client,
    /// 服务根地址，如 `http://localhost:8000`
    base_url: String,
}

impl HttpTaskRepository {
    /// 创建新的仓库客户端
    pub fn new(config: &RepositoryConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        if let (Some(name), Some(token)) = (&config.csrf_header, &config.csrf_token) {
            let name = HeaderName::from_bytes(name.as_bytes())
                .with_context(|| format!("无效的 CSRF 头名称: {}", name))?;
            let value = HeaderValue::from_str(token).context("无效的 CSRF 令牌")?;
            headers.insert(name, value);
        }

        let mut builder = Client::builder().default_headers(headers);
        // 0 表示不设置客户端超时（大文件上传可能持续很久）
        if config.request_timeout_secs > 0 {
            builder = builder.timeout(std::time::Duration::from_secs(config.request_timeout_secs));
        }
        let client = builder.build().context("Failed to create HTTP client")?;

        let base_url = config.base_url.trim_end_matches('/').to_string();
        info!("初始化任务仓库客户端: base_url={}", base_url);

        Ok(Self { client, base_url })
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{}", self.base_url, endpoint)
    }

    /// 检查状态码并读取响应体
    async fn read_body(response: Response) -> Result<String, RepositoryError> {
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(RepositoryError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(body)
    }

    async fn read_json(response: Response) -> Result<Value, RepositoryError> {
        let body = Self::read_body(response).await?;
        serde_json::from_str(&body)
            .map_err(|e| RepositoryError::Decode(format!("{}: {}", e, body)))
    }
}

#[async_trait]
impl TaskRepository for HttpTaskRepository {
    async fn create_task(
        &self,
        project_id: ProjectId,
        params: &TaskParams,
    ) -> Result<Value, RepositoryError> {
        info!("创建任务: project={}, name={}", project_id, params.name);

        let response = self
            .client
            .post(self.url(&create_task_endpoint(project_id)))
            .json(&CreateTaskRequest::from(params))
            .send()
            .await?;

        let task = Self::read_json(response).await?;
        debug!("创建任务响应: {}", task);
        Ok(task)
    }

    async fn upload_file(
        &self,
        endpoint: &str,
        file: &UploadFile,
        progress: ProgressReporter,
    ) -> Result<UploadAck, RepositoryError> {
        debug!(
            "上传文件: endpoint={}, file={}, size={}",
            endpoint, file.name, file.size
        );

        let handle = tokio::fs::File::open(&file.path).await?;

        // 每读出一块数据就报告一次累计已发送字节数
        let mut sent = 0u64;
        let stream = ReaderStream::new(handle).map(move |chunk| {
            if let Ok(bytes) = &chunk {
                sent += bytes.len() as u64;
                progress.report(sent);
            }
            chunk
        });

        let part = multipart::Part::stream_with_length(Body::wrap_stream(stream), file.size)
            .file_name(file.name.clone())
            .mime_str("application/octet-stream")?;
        let form = multipart::Form::new().part(UPLOAD_FIELD_NAME, part);

        let response = self
            .client
            .post(self.url(endpoint))
            .multipart(form)
            .send()
            .await?;

        let body = Self::read_body(response).await?;
        let ack: UploadAck = serde_json::from_str(&body).map_err(|e| {
            error!("解析上传响应失败: file={}, body={}", file.name, body);
            RepositoryError::Decode(format!("{}: {}", e, body))
        })?;

        Ok(ack)
    }

    async fn commit_task(
        &self,
        project_id: ProjectId,
        task_id: &str,
    ) -> Result<Value, RepositoryError> {
        info!("提交任务: project={}, task={}", project_id, task_id);

        let response = self
            .client
            .post(self.url(&commit_endpoint(project_id, task_id)))
            .header("Content-Type", "application/json")
            .send()
            .await?;

        Self::read_json(response).await
    }
}
