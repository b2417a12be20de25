use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use pvecloud_common::{CloudError, Result};
use serde::Serialize;

/// Body registered with the metadata service for one instance. The guest
/// fetches both documents at boot through the nocloud datasource.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CloudInitPayload {
    /// YAML `{meta: ..., project_id: ...}`.
    pub metadata: String,
    /// `#cloud-config` document with the boot command and the fqdn.
    pub userdata: String,
}

#[derive(Serialize)]
struct MetaDocument<'a> {
    meta: &'a BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    project_id: Option<&'a str>,
}

#[derive(Serialize)]
struct UserDataDocument<'a> {
    runcmd: Vec<&'a str>,
    fqdn: String,
}

impl CloudInitPayload {
    pub fn build(
        id: &str,
        meta: &BTreeMap<String, String>,
        project_id: Option<&str>,
        boot_command: &str,
        instance_prefix: &str,
    ) -> Result<Self> {
        let metadata = to_yaml(&MetaDocument { meta, project_id })?;
        let userdata = to_yaml(&UserDataDocument {
            runcmd: vec![boot_command],
            fqdn: format!("{}-{}", instance_prefix.to_lowercase(), id),
        })?;
        Ok(Self {
            metadata,
            userdata: format!("#cloud-config\n{}", userdata),
        })
    }
}

/// Opaque metadata blob kept on the instance record.
pub fn record_metadata(meta: &BTreeMap<String, String>) -> Result<String> {
    to_yaml(&MetaDocument {
        meta,
        project_id: None,
    })
}

/// `<base>/<id>`, tolerating a base with or without its trailing slash.
pub fn instance_url(base: &str, id: &str) -> String {
    format!("{}/{}", base.trim().trim_end_matches('/'), id)
}

/// `smbios1` value pointing cloud-init at `<base>/<id>/`.
pub fn nocloud_smbios(metadata_server: &str, id: &str) -> String {
    let datasource = format!("ds=nocloud-net;s={}/", instance_url(metadata_server, id));
    format!(
        "base64=1,serial={}",
        base64::engine::general_purpose::STANDARD.encode(datasource)
    )
}

fn to_yaml<T: Serialize>(doc: &T) -> Result<String> {
    serde_yaml::to_string(doc).map_err(|e| CloudError::Invalid(format!("yaml encoding: {}", e)))
}

/// External service the guests pull their cloud-init documents from.
#[async_trait]
pub trait MetadataService: Send + Sync {
    async fn register(&self, id: &str, payload: &CloudInitPayload) -> Result<()>;

    async fn unregister(&self, id: &str) -> Result<()>;
}

pub struct HttpMetadataService {
    client: reqwest::Client,
    base_url: String,
}

impl HttpMetadataService {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CloudError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim().to_string(),
        })
    }

    fn url(&self, id: &str) -> String {
        instance_url(&self.base_url, id)
    }

    async fn check(resp: reqwest::Response) -> Result<()> {
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let message = resp.text().await.unwrap_or_default();
        Err(CloudError::RemoteStatus {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl MetadataService for HttpMetadataService {
    async fn register(&self, id: &str, payload: &CloudInitPayload) -> Result<()> {
        let resp = self
            .client
            .post(self.url(id))
            .json(payload)
            .send()
            .await
            .map_err(|e| CloudError::Transport(e.to_string()))?;
        Self::check(resp).await?;
        tracing::info!("✅ [Metadata] registered vm {}", id);
        Ok(())
    }

    async fn unregister(&self, id: &str) -> Result<()> {
        let resp = self
            .client
            .delete(self.url(id))
            .send()
            .await
            .map_err(|e| CloudError::Transport(e.to_string()))?;
        Self::check(resp).await?;
        tracing::info!("✅ [Metadata] unregistered vm {}", id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> BTreeMap<String, String> {
        BTreeMap::from([("owner".to_string(), "alice".to_string())])
    }

    #[test]
    fn payload_carries_meta_and_cloud_config() {
        let p = CloudInitPayload::build("101", &meta(), Some("visa"), "echo hi", "INSTANCE")
            .unwrap();
        let doc: serde_yaml::Value = serde_yaml::from_str(&p.metadata).unwrap();
        assert_eq!(doc["meta"]["owner"].as_str(), Some("alice"));
        assert_eq!(doc["project_id"].as_str(), Some("visa"));

        assert!(p.userdata.starts_with("#cloud-config\n"));
        let user: serde_yaml::Value = serde_yaml::from_str(&p.userdata).unwrap();
        assert_eq!(user["runcmd"][0].as_str(), Some("echo hi"));
        assert_eq!(user["fqdn"].as_str(), Some("instance-101"));
    }

    #[test]
    fn project_id_is_omitted_when_unset() {
        let p = CloudInitPayload::build("7", &meta(), None, "", "VM").unwrap();
        assert!(!p.metadata.contains("project_id"));
    }

    #[test]
    fn smbios_encodes_datasource() {
        let value = nocloud_smbios("http://meta.local/vm/", "101");
        let encoded = value.strip_prefix("base64=1,serial=").unwrap();
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .unwrap();
        assert_eq!(
            String::from_utf8(decoded).unwrap(),
            "ds=nocloud-net;s=http://meta.local/vm/101/"
        );
    }

    #[test]
    fn url_tolerates_trailing_slash() {
        let svc = HttpMetadataService::new("http://meta.local/vm/", Duration::from_secs(1)).unwrap();
        assert_eq!(svc.url("101"), "http://meta.local/vm/101");
        assert_eq!(instance_url("http://meta.local/vm", "101"), "http://meta.local/vm/101");
    }
}
