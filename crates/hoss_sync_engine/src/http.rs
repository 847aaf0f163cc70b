//! REST client for core services.

use crate::core_api::{
    CoreServiceApi, CreateDatasetRequest, DatasetSyncRequest, MetadataDocument, NamespaceInfo,
    NamespaceSyncRequest, NotificationQueueConfig, ObjectStoreInfo, StsCredentials,
    SYNC_USER_AGENT,
};
use crate::desired::SyncRelationship;
use crate::error::{SyncError, SyncResult};
use crate::token::TokenSource;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// `If-Modified-Since` uses the HTTP date format.
const HTTP_DATE: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// [`CoreServiceApi`] over HTTP.
pub struct HttpCoreApi {
    http: reqwest::Client,
    tokens: Arc<dyn TokenSource>,
}

impl HttpCoreApi {
    /// Creates a client authenticating with the given token source.
    pub fn new(tokens: Arc<dyn TokenSource>) -> SyncResult<Self> {
        let http = reqwest::Client::builder()
            .user_agent(SYNC_USER_AGENT)
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self { http, tokens })
    }

    fn request(&self, method: Method, url: &str) -> SyncResult<RequestBuilder> {
        let token = self.tokens.id_token()?;
        Ok(self.http.request(method, url).bearer_auth(token))
    }

    async fn send(&self, builder: RequestBuilder, url: &str, expected: &[u16]) -> SyncResult<Response> {
        let response = builder.send().await?;
        let status = response.status().as_u16();
        if expected.contains(&status) {
            return Ok(response);
        }

        if let Ok(body) = response.text().await {
            debug!(url, status, body = %body, "unexpected core service response");
        }
        Err(SyncError::Status {
            url: url.to_string(),
            status,
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, url: String) -> SyncResult<T> {
        let builder = self.request(Method::GET, &url)?;
        let response = self.send(builder, &url, &[200]).await?;
        Ok(response.json::<T>().await?)
    }

    async fn send_json<B: Serialize + ?Sized>(
        &self,
        method: Method,
        url: String,
        body: Option<&B>,
        expected: &[u16],
    ) -> SyncResult<()> {
        let mut builder = self.request(method, &url)?;
        if let Some(body) = body {
            builder = builder.json(body);
        }
        self.send(builder, &url, expected).await?;
        Ok(())
    }
}

#[async_trait]
impl CoreServiceApi for HttpCoreApi {
    async fn ping(&self, endpoint: &str) -> SyncResult<()> {
        let url = format!("{endpoint}/discover");
        let builder = self.http.get(&url);
        self.send(builder, &url, &[200]).await?;
        Ok(())
    }

    async fn queue_configurations(
        &self,
        endpoint: &str,
    ) -> SyncResult<Vec<NotificationQueueConfig>> {
        self.get_json(format!("{endpoint}/configuration/queue")).await
    }

    async fn sync_relationships(
        &self,
        endpoint: &str,
        if_modified_since: Option<DateTime<Utc>>,
    ) -> SyncResult<Option<Vec<SyncRelationship>>> {
        let url = format!("{endpoint}/configuration/sync");
        let mut builder = self.request(Method::GET, &url)?;
        if let Some(since) = if_modified_since {
            builder = builder.header(
                reqwest::header::IF_MODIFIED_SINCE,
                since.format(HTTP_DATE).to_string(),
            );
        }

        let response = self.send(builder, &url, &[200, 304]).await?;
        if response.status() == StatusCode::NOT_MODIFIED {
            return Ok(None);
        }
        Ok(Some(response.json().await?))
    }

    async fn namespace(&self, endpoint: &str, name: &str) -> SyncResult<NamespaceInfo> {
        self.get_json(format!("{endpoint}/namespace/{name}")).await
    }

    async fn object_stores(&self, endpoint: &str) -> SyncResult<Vec<ObjectStoreInfo>> {
        self.get_json(format!("{endpoint}/object_store/")).await
    }

    async fn sts_credentials(
        &self,
        endpoint: &str,
        object_store: &str,
    ) -> SyncResult<StsCredentials> {
        self.get_json(format!("{endpoint}/object_store/{object_store}/sts"))
            .await
    }

    async fn create_dataset(
        &self,
        endpoint: &str,
        namespace: &str,
        request: &CreateDatasetRequest,
    ) -> SyncResult<()> {
        // 403 means the dataset already exists
        self.send_json(
            Method::POST,
            format!("{endpoint}/namespace/{namespace}/dataset/"),
            Some(request),
            &[201, 403],
        )
        .await
    }

    async fn put_dataset_permission(
        &self,
        endpoint: &str,
        namespace: &str,
        dataset: &str,
        group: &str,
        permission: &str,
    ) -> SyncResult<()> {
        self.send_json::<()>(
            Method::PUT,
            format!("{endpoint}/namespace/{namespace}/dataset/{dataset}/group/{group}/access/{permission}"),
            None,
            &[204],
        )
        .await
    }

    async fn delete_dataset_permission(
        &self,
        endpoint: &str,
        namespace: &str,
        dataset: &str,
        group: &str,
    ) -> SyncResult<()> {
        self.send_json::<()>(
            Method::DELETE,
            format!("{endpoint}/namespace/{namespace}/dataset/{dataset}/group/{group}"),
            None,
            &[204],
        )
        .await
    }

    async fn put_dataset_sync(
        &self,
        endpoint: &str,
        namespace: &str,
        dataset: &str,
        request: &DatasetSyncRequest,
    ) -> SyncResult<()> {
        self.send_json(
            Method::PUT,
            format!("{endpoint}/namespace/{namespace}/dataset/{dataset}/sync"),
            Some(request),
            &[204],
        )
        .await
    }

    async fn put_namespace_sync(
        &self,
        endpoint: &str,
        namespace: &str,
        request: &NamespaceSyncRequest,
    ) -> SyncResult<()> {
        self.send_json(
            Method::PUT,
            format!("{endpoint}/namespace/{namespace}/sync"),
            Some(request),
            &[204],
        )
        .await
    }

    async fn put_metadata_document(
        &self,
        endpoint: &str,
        document: &MetadataDocument,
    ) -> SyncResult<()> {
        self.send_json(
            Method::PUT,
            format!("{endpoint}/search/document/metadata"),
            Some(document),
            &[204],
        )
        .await
    }

    async fn delete_metadata_document(
        &self,
        endpoint: &str,
        document: &MetadataDocument,
    ) -> SyncResult<()> {
        self.send_json(
            Method::DELETE,
            format!("{endpoint}/search/document/metadata"),
            Some(document),
            &[204],
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::StaticToken;
    use chrono::TimeZone;

    #[test]
    fn http_date_format() {
        let date = Utc.with_ymd_and_hms(2021, 3, 9, 17, 4, 5).unwrap();
        assert_eq!(date.format(HTTP_DATE).to_string(), "Tue, 09 Mar 2021 17:04:05 GMT");
    }

    #[tokio::test]
    async fn missing_token_fails_before_sending() {
        struct NoToken;

        #[async_trait]
        impl TokenSource for NoToken {
            fn id_token(&self) -> SyncResult<String> {
                Err(SyncError::Auth("no token".into()))
            }

            async fn refresh(&self) -> SyncResult<()> {
                Ok(())
            }
        }

        let api = HttpCoreApi::new(Arc::new(NoToken)).unwrap();
        let err = api.namespace("http://127.0.0.1:1/v1", "ns").await.unwrap_err();
        assert!(matches!(err, SyncError::Auth(_)));

        let api = HttpCoreApi::new(Arc::new(StaticToken::new("t"))).unwrap();
        let err = api.namespace("http://127.0.0.1:1/v1", "ns").await.unwrap_err();
        assert!(err.is_retryable());
    }
}
