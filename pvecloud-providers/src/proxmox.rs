use crate::inventory::{
    FirewallRule, NetworkInterface, NewFirewallRule, NodeStatus, Resource, TaskEntry, VmConfig,
};
use crate::{Hypervisor, HypervisorError, Result, TaskId};
use async_trait::async_trait;
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

/// Every Proxmox API answer wraps its payload in `{"data": ...}`.
#[derive(Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Deserialize)]
struct AgentResult {
    #[serde(default)]
    result: Vec<NetworkInterface>,
}

#[derive(Deserialize)]
struct FirewallGroup {
    group: String,
}

pub struct ProxmoxProvider {
    client: Client,
    base_url: String,
    auth_header: String,
}

impl ProxmoxProvider {
    /// `token` is `<user>@<realm>!<tokenid>=<secret>`.
    pub fn new(endpoint: &str, token: &str, timeout: Duration) -> Result<Self> {
        // Default reqwest client has no overall timeout; a stalled node would hang the caller.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(timeout)
            .build()
            .map_err(|e| HypervisorError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: endpoint.trim().trim_end_matches('/').to_string(),
            auth_header: format!("PVEAPIToken={}", token.trim()),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<T> {
        let url = self.url(path);
        tracing::debug!("[Proxmox API] {} {}", method, url);

        let mut req = self
            .client
            .request(method.clone(), &url)
            .header(reqwest::header::AUTHORIZATION, &self.auth_header);
        if let Some(body) = body {
            req = req.json(&body);
        }

        let resp = req.send().await.map_err(|e| {
            tracing::error!("❌ [Proxmox API] {} {} unreachable: {}", method, url, e);
            HypervisorError::from(e)
        })?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let reason = status.canonical_reason().unwrap_or_default();
            tracing::warn!(
                "❌ [Proxmox API] {} {} failed: status={}, response={}",
                method,
                url,
                status.as_u16(),
                text
            );
            return Err(HypervisorError::Status {
                status: status.as_u16(),
                body: if text.trim().is_empty() {
                    reason.to_string()
                } else {
                    text
                },
            });
        }

        let envelope: Envelope<T> = resp.json().await?;
        Ok(envelope.data)
    }

    async fn vm_action(&self, node: &str, vmid: &str, action: &str) -> Result<TaskId> {
        let path = format!("nodes/{}/qemu/{}/status/{}", node, vmid, action);
        let upid: TaskId = self.call(Method::POST, &path, None).await?;
        tracing::info!(
            "✅ [Proxmox API] {} vm {} on {} accepted (task {})",
            action,
            vmid,
            node,
            upid
        );
        Ok(upid)
    }
}

#[async_trait]
impl Hypervisor for ProxmoxProvider {
    async fn list_vms(&self) -> Result<Vec<Resource>> {
        self.call(Method::GET, "cluster/resources?type=vm", None)
            .await
    }

    async fn list_nodes(&self) -> Result<Vec<NodeStatus>> {
        self.call(Method::GET, "nodes", None).await
    }

    async fn list_tasks(&self) -> Result<Vec<TaskEntry>> {
        self.call(Method::GET, "cluster/tasks", None).await
    }

    async fn next_id(&self) -> Result<String> {
        // Serialized as a string by most versions, as a number by some.
        let id: serde_json::Value = self.call(Method::GET, "cluster/nextid", None).await?;
        match id {
            serde_json::Value::String(s) => Ok(s),
            serde_json::Value::Number(n) => Ok(n.to_string()),
            other => Err(HypervisorError::Decode(format!(
                "cluster/nextid returned {}",
                other
            ))),
        }
    }

    async fn clone_vm(
        &self,
        template_node: &str,
        template_vmid: &str,
        new_id: &str,
        name: &str,
        target_node: &str,
    ) -> Result<TaskId> {
        let path = format!("nodes/{}/qemu/{}/clone", template_node, template_vmid);
        let body = json!({
            "newid": new_id,
            "name": name,
            "target": target_node,
        });
        tracing::info!(
            "🔵 [Proxmox API] cloning template {} ({}) into vm {} on {}",
            template_vmid,
            template_node,
            new_id,
            target_node
        );
        self.call(Method::POST, &path, Some(body)).await
    }

    async fn configure_vm(&self, node: &str, vmid: &str, config: &VmConfig) -> Result<()> {
        let path = format!("nodes/{}/qemu/{}/config", node, vmid);
        let body = serde_json::to_value(config)
            .map_err(|e| HypervisorError::Decode(e.to_string()))?;
        // Synchronous config updates answer with data=null, async ones with a UPID.
        let _: Option<String> = self.call(Method::POST, &path, Some(body)).await?;
        Ok(())
    }

    async fn start_vm(&self, node: &str, vmid: &str) -> Result<TaskId> {
        self.vm_action(node, vmid, "start").await
    }

    async fn stop_vm(&self, node: &str, vmid: &str) -> Result<TaskId> {
        self.vm_action(node, vmid, "stop").await
    }

    async fn shutdown_vm(&self, node: &str, vmid: &str) -> Result<TaskId> {
        self.vm_action(node, vmid, "shutdown").await
    }

    async fn reboot_vm(&self, node: &str, vmid: &str) -> Result<TaskId> {
        self.vm_action(node, vmid, "reboot").await
    }

    async fn delete_vm(&self, node: &str, vmid: &str) -> Result<TaskId> {
        let path = format!("nodes/{}/qemu/{}", node, vmid);
        self.call(Method::DELETE, &path, None).await
    }

    async fn firewall_rules(&self, node: &str, vmid: &str) -> Result<Vec<FirewallRule>> {
        let path = format!("nodes/{}/qemu/{}/firewall/rules", node, vmid);
        self.call(Method::GET, &path, None).await
    }

    async fn add_firewall_rule(
        &self,
        node: &str,
        vmid: &str,
        rule: &NewFirewallRule,
    ) -> Result<()> {
        let path = format!("nodes/{}/qemu/{}/firewall/rules", node, vmid);
        let body =
            serde_json::to_value(rule).map_err(|e| HypervisorError::Decode(e.to_string()))?;
        let _: Option<serde_json::Value> = self.call(Method::POST, &path, Some(body)).await?;
        Ok(())
    }

    async fn delete_firewall_rule(&self, node: &str, vmid: &str, pos: u32) -> Result<()> {
        let path = format!("nodes/{}/qemu/{}/firewall/rules/{}", node, vmid, pos);
        let _: Option<serde_json::Value> = self.call(Method::DELETE, &path, None).await?;
        Ok(())
    }

    async fn network_interfaces(&self, node: &str, vmid: &str) -> Result<Vec<NetworkInterface>> {
        let path = format!("nodes/{}/qemu/{}/agent/network-get-interfaces", node, vmid);
        let res: AgentResult = self.call(Method::GET, &path, None).await?;
        Ok(res.result)
    }

    async fn firewall_groups(&self) -> Result<Vec<String>> {
        let groups: Vec<FirewallGroup> = self
            .call(Method::GET, "cluster/firewall/groups", None)
            .await?;
        Ok(groups.into_iter().map(|g| g.group).collect())
    }
}
