//! HTTP 信令客户端
//!
//! 每次调用都是一次独立的 HTTP 往返，不依赖长连接。

use log::debug;

use crate::error::{Result, TransferError};
use crate::rendezvous::{
    CreateSessionRequest, CreateSessionResponse, PeerRole, PublishSignalRequest,
    RendezvousApi, Session, SessionInfo, SignalMessage, SignalQuery, normalize_session_code,
};
use crate::transfer::FileMetadata;
use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::Duration;

/// 单次请求超时
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

fn connectivity(e: reqwest::Error) -> TransferError {
    TransferError::Connectivity(format!("rendezvous request failed: {}", e))
}

/// 基于 reqwest 的信令服务客户端
#[derive(Debug, Clone)]
pub struct HttpRendezvous {
    base_url: String,
    client: reqwest::Client,
}

impl HttpRendezvous {
    pub fn new(base_url: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl RendezvousApi for HttpRendezvous {
    async fn create_session(&self, file: &FileMetadata) -> Result<Session> {
        let response = self
            .client
            .post(self.url("/session"))
            .json(&CreateSessionRequest::from(file))
            .send()
            .await
            .map_err(|e| TransferError::SessionCreate(e.to_string()))?;

        if !response.status().is_success() {
            return Err(TransferError::SessionCreate(format!(
                "rendezvous responded with {}",
                response.status()
            )));
        }

        let body: CreateSessionResponse = response
            .json()
            .await
            .map_err(|e| TransferError::SessionCreate(e.to_string()))?;

        debug!("Session {} created", body.session_code);

        Ok(Session {
            code: body.session_code,
            file: file.clone(),
            transport: body.transport_config,
            created_at: body.created_at,
        })
    }

    async fn join_session(&self, code: &str) -> Result<Session> {
        let code = normalize_session_code(code);
        let response = self
            .client
            .get(self.url(&format!("/session/{}", code)))
            .send()
            .await
            .map_err(connectivity)?;

        match response.status() {
            status if status.is_success() => {}
            StatusCode::NOT_FOUND | StatusCode::GONE => {
                return Err(TransferError::SessionNotFound(code));
            }
            status => {
                return Err(TransferError::Connectivity(format!(
                    "rendezvous responded with {}",
                    status
                )));
            }
        }

        let info: SessionInfo = response
            .json()
            .await
            .map_err(|e| TransferError::Protocol(e.to_string()))?;

        Ok(Session {
            code,
            file: info.file_metadata,
            transport: info.transport_config,
            created_at: info.created_at,
        })
    }

    async fn publish(&self, code: &str, role: PeerRole, message: SignalMessage) -> Result<()> {
        let body = PublishSignalRequest {
            session_code: code.to_string(),
            kind: message.kind,
            data: message.data,
            role,
            attempt: message.attempt,
        };
        let response = self
            .client
            .post(self.url("/signal"))
            .json(&body)
            .send()
            .await
            .map_err(connectivity)?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(TransferError::SessionNotFound(code.to_string())),
            status => Err(TransferError::Connectivity(format!(
                "signal publish rejected with {}",
                status
            ))),
        }
    }

    async fn fetch(&self, code: &str, role: PeerRole) -> Result<Vec<SignalMessage>> {
        let response = self
            .client
            .get(self.url(&format!("/signal/{}", code)))
            .query(&SignalQuery { role })
            .send()
            .await
            .map_err(connectivity)?;

        match response.status() {
            status if status.is_success() => response
                .json()
                .await
                .map_err(|e| TransferError::Protocol(e.to_string())),
            StatusCode::NOT_FOUND => Err(TransferError::SessionNotFound(code.to_string())),
            status => Err(TransferError::Connectivity(format!(
                "signal poll rejected with {}",
                status
            ))),
        }
    }

    async fn close_session(&self, code: &str) -> Result<()> {
        let response = self
            .client
            .delete(self.url(&format!("/session/{}", code)))
            .send()
            .await
            .map_err(connectivity)?;

        if response.status().is_success() || response.status() == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(TransferError::Connectivity(format!(
                "session close rejected with {}",
                response.status()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_trailing_slash() {
        let client = HttpRendezvous::new("http://localhost:8787/").unwrap();
        assert_eq!(client.url("/session"), "http://localhost:8787/session");
    }
}
